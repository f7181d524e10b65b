/// Modbus TCP (MBAP) framing
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
///
/// Request and response share the 7-byte MBAP envelope: transaction id
/// (u16 BE), protocol id (u16 BE, always 0), length (u16 BE, counting the
/// unit id and the PDU), unit id (u8). Minimum frame 8 bytes, maximum 260.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{Pdu, SlaveId};

/// MBAP prefix read off the wire before the length-delimited payload:
/// transaction id + protocol id + length.
pub const MBAP_PREFIX_SIZE: usize = 6;

/// Minimum TCP frame: prefix + unit id + function code
pub const TCP_MIN_FRAME: usize = 8;

/// Maximum TCP frame: prefix + unit id + 253-byte PDU
pub const TCP_MAX_FRAME: usize = 260;

/// A Modbus TCP Application Data Unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpAdu {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: SlaveId,
    pub pdu: Pdu,
}

impl TcpAdu {
    /// Wrap a PDU for transmission.
    pub fn new(transaction_id: u16, unit_id: SlaveId, pdu: Pdu) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            unit_id,
            pdu,
        }
    }

    /// Length field value: unit id + function code + data.
    pub fn length(&self) -> u16 {
        (1 + self.pdu.len()) as u16
    }

    /// Encode the ADU into a wire frame.
    pub fn encode(&self) -> GatewayResult<Bytes> {
        let total = MBAP_PREFIX_SIZE + 2 + self.pdu.data.len();
        if total > TCP_MAX_FRAME {
            return Err(GatewayError::frame(format!(
                "frame length {} exceeds maximum {}",
                total, TCP_MAX_FRAME
            )));
        }

        let mut frame = BytesMut::with_capacity(total);
        frame.put_u16(self.transaction_id);
        frame.put_u16(self.protocol_id);
        frame.put_u16(self.length());
        frame.put_u8(self.unit_id);
        frame.put_u8(self.pdu.function_code);
        frame.put_slice(&self.pdu.data);

        Ok(frame.freeze())
    }

    /// Decode a complete wire frame into an ADU.
    pub fn decode(raw: &[u8]) -> GatewayResult<TcpAdu> {
        if raw.len() < TCP_MIN_FRAME {
            return Err(GatewayError::frame(format!(
                "frame length {} does not meet minimum {}",
                raw.len(),
                TCP_MIN_FRAME
            )));
        }
        if raw.len() > TCP_MAX_FRAME {
            return Err(GatewayError::frame(format!(
                "frame length {} exceeds maximum {}",
                raw.len(),
                TCP_MAX_FRAME
            )));
        }

        let transaction_id = u16::from_be_bytes([raw[0], raw[1]]);
        let protocol_id = u16::from_be_bytes([raw[2], raw[3]]);
        let length = u16::from_be_bytes([raw[4], raw[5]]) as usize;

        if protocol_id != 0 {
            return Err(GatewayError::frame(format!(
                "non-zero protocol id {}",
                protocol_id
            )));
        }
        if raw.len() != MBAP_PREFIX_SIZE + length {
            return Err(GatewayError::frame(format!(
                "declared length {} does not match payload {}",
                length,
                raw.len() - MBAP_PREFIX_SIZE
            )));
        }

        Ok(TcpAdu {
            transaction_id,
            protocol_id,
            unit_id: raw[6],
            pdu: Pdu::new(raw[7], raw[8..].to_vec()),
        })
    }

    /// Verify a response against this request: transaction ids must match.
    pub fn verify(&self, response: &TcpAdu) -> GatewayResult<()> {
        if response.transaction_id != self.transaction_id {
            return Err(GatewayError::transaction_mismatch(
                self.transaction_id,
                response.transaction_id,
            ));
        }
        Ok(())
    }
}

/// Read one complete MBAP frame from the stream.
///
/// Reads the 6-byte MBAP prefix first, then exactly `length` more bytes.
/// Returns the full frame including the prefix.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> GatewayResult<Vec<u8>> {
    let mut prefix = [0u8; MBAP_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;

    let length = u16::from_be_bytes([prefix[4], prefix[5]]) as usize;
    if length < 2 || MBAP_PREFIX_SIZE + length > TCP_MAX_FRAME {
        return Err(GatewayError::frame(format!(
            "invalid MBAP length field: {}",
            length
        )));
    }

    let mut frame = vec![0u8; MBAP_PREFIX_SIZE + length];
    frame[..MBAP_PREFIX_SIZE].copy_from_slice(&prefix);
    reader.read_exact(&mut frame[MBAP_PREFIX_SIZE..]).await?;

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let adu = TcpAdu::new(0x1234, 17, Pdu::new(0x03, vec![0x00, 0x0A, 0x00, 0x01]));
        let raw = adu.encode().unwrap();
        assert_eq!(
            raw.as_ref(),
            &[0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x0A, 0x00, 0x01]
        );

        let decoded = TcpAdu::decode(&raw).unwrap();
        assert_eq!(decoded, adu);
        assert_eq!(decoded.length() as usize, 1 + decoded.pdu.len());
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        assert!(TcpAdu::decode(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01]).is_err());
    }

    #[test]
    fn test_decode_rejects_protocol_id() {
        let raw = [0x00, 0x01, 0x00, 0x01, 0x00, 0x02, 0x01, 0x03];
        let err = TcpAdu::decode(&raw).unwrap_err();
        assert!(format!("{}", err).contains("protocol id"));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        // Declared length 6, but only unit id + function code present
        let raw = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03];
        assert!(TcpAdu::decode(&raw).is_err());
    }

    #[test]
    fn test_verify_transaction_id() {
        let req = TcpAdu::new(7, 1, Pdu::new(0x03, vec![0, 0, 0, 1]));
        let mut resp = TcpAdu::new(7, 1, Pdu::new(0x03, vec![0x02, 0x00, 0x2A]));
        assert!(req.verify(&resp).is_ok());

        resp.transaction_id = 8;
        assert!(req.verify(&resp).is_err());
    }

    #[tokio::test]
    async fn test_read_frame() {
        let adu = TcpAdu::new(42, 1, Pdu::new(0x06, vec![0x00, 0x05, 0xAB, 0xCD]));
        let raw = adu.encode().unwrap();

        let mut reader = std::io::Cursor::new(raw.to_vec());
        let frame = read_frame(&mut reader).await.unwrap();
        assert_eq!(frame, raw.to_vec());
        assert_eq!(TcpAdu::decode(&frame).unwrap(), adu);
    }

    #[tokio::test]
    async fn test_read_frame_rejects_bad_length() {
        // Length field of 0 is below the unit id + function code minimum
        let raw = [0x00u8, 0x01, 0x00, 0x00, 0x00, 0x00];
        let mut reader = std::io::Cursor::new(raw.to_vec());
        assert!(read_frame(&mut reader).await.is_err());
    }
}
