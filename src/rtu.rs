/// Modbus RTU framing, byte-stream scanners, and serial timing
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
///
/// Wire frame: `[slave id][function code][data...][crc lo][crc hi]`,
/// minimum 4 bytes, maximum 256. Two asymmetric scanning problems live
/// here:
///
/// - The **request scanner** (used by the RTU and RTU-over-TCP servers)
///   does not know the function code in advance. It reads the slave id,
///   completes a 7-byte header (enough to cover the byte-count field of
///   0x0F/0x10), derives the total frame length from the function code,
///   and reads the remainder. Unknown function codes abandon the frame.
///
/// - The **response scanner** (used by the RTU master and the
///   RTU-over-TCP client) knows the expected slave id and function code
///   and drops leading noise bytes that match neither. It runs a small
///   state machine and is bounded by a wall-clock deadline.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::crc::{checksum, Crc16};
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{
    Pdu, SlaveId, FUNC_MASK_WRITE_REGISTER, FUNC_READ_COILS, FUNC_READ_DISCRETE_INPUTS,
    FUNC_READ_FIFO_QUEUE, FUNC_READ_HOLDING_REGISTERS, FUNC_READ_INPUT_REGISTERS,
    FUNC_READ_WRITE_MULTIPLE_REGISTERS, FUNC_WRITE_MULTIPLE_COILS,
    FUNC_WRITE_MULTIPLE_REGISTERS, FUNC_WRITE_SINGLE_COIL, FUNC_WRITE_SINGLE_REGISTER,
};

/// Minimum RTU frame: slave id + function code + CRC
pub const RTU_MIN_FRAME: usize = 4;

/// Maximum RTU frame: slave id + 253-byte PDU + CRC
pub const RTU_MAX_FRAME: usize = 256;

/// Bytes of header the request scanner accumulates before it can derive
/// the total frame length (covers the byte-count field of 0x0F/0x10).
pub const REQUEST_HEADER_LEN: usize = 7;

/// A Modbus RTU Application Data Unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuAdu {
    pub slave_id: SlaveId,
    pub pdu: Pdu,
}

impl RtuAdu {
    /// Wrap a PDU for transmission.
    pub fn new(slave_id: SlaveId, pdu: Pdu) -> Self {
        Self { slave_id, pdu }
    }

    /// Encode the ADU into a wire frame, appending the CRC low byte first.
    pub fn encode(&self) -> GatewayResult<Bytes> {
        let total = 2 + self.pdu.data.len() + 2;
        if total > RTU_MAX_FRAME {
            return Err(GatewayError::frame(format!(
                "frame length {} exceeds maximum {}",
                total, RTU_MAX_FRAME
            )));
        }

        let mut frame = BytesMut::with_capacity(total);
        frame.put_u8(self.slave_id);
        frame.put_u8(self.pdu.function_code);
        frame.put_slice(&self.pdu.data);

        let crc = checksum(&frame);
        frame.put_u8(crc as u8);
        frame.put_u8((crc >> 8) as u8);

        Ok(frame.freeze())
    }

    /// Decode a complete wire frame, verifying the CRC.
    pub fn decode(raw: &[u8]) -> GatewayResult<RtuAdu> {
        let length = raw.len();
        if length < RTU_MIN_FRAME {
            return Err(GatewayError::frame(format!(
                "frame length {} does not meet minimum {}",
                length, RTU_MIN_FRAME
            )));
        }
        if length > RTU_MAX_FRAME {
            return Err(GatewayError::frame(format!(
                "frame length {} exceeds maximum {}",
                length, RTU_MAX_FRAME
            )));
        }

        let mut crc = Crc16::new();
        crc.push_bytes(&raw[..length - 2]);
        let received = u16::from_le_bytes([raw[length - 2], raw[length - 1]]);
        if received != crc.value() {
            return Err(GatewayError::crc_mismatch(crc.value(), received));
        }

        Ok(RtuAdu {
            slave_id: raw[0],
            pdu: Pdu::new(raw[1], raw[2..length - 2].to_vec()),
        })
    }

    /// Verify a response against this request: slave ids must match.
    pub fn verify(&self, response: &RtuAdu) -> GatewayResult<()> {
        if response.slave_id != self.slave_id {
            return Err(GatewayError::protocol(format!(
                "response slave id {} does not match request {}",
                response.slave_id, self.slave_id
            )));
        }
        Ok(())
    }
}

/// Expected total length of a request ADU, derived from the function code
/// and (for 0x0F/0x10) the byte-count field in the 7-byte header.
///
/// Unknown function codes produce a frame error; the caller abandons the
/// frame (RTU resyncs by silence, RTU-over-TCP closes the connection).
pub fn expected_request_len(function_code: u8, header: &[u8]) -> GatewayResult<usize> {
    match function_code {
        FUNC_READ_COILS
        | FUNC_READ_DISCRETE_INPUTS
        | FUNC_READ_HOLDING_REGISTERS
        | FUNC_READ_INPUT_REGISTERS
        | FUNC_WRITE_SINGLE_COIL
        | FUNC_WRITE_SINGLE_REGISTER => {
            // Fixed: [slave id][fc][addr(2)][value(2)][crc(2)]
            Ok(8)
        }
        FUNC_WRITE_MULTIPLE_COILS | FUNC_WRITE_MULTIPLE_REGISTERS => {
            // [slave id][fc][addr(2)][qty(2)][byte count][data...][crc(2)]
            if header.len() < REQUEST_HEADER_LEN {
                return Err(GatewayError::frame(format!(
                    "need {} header bytes to determine length for 0x{:02X}, got {}",
                    REQUEST_HEADER_LEN,
                    function_code,
                    header.len()
                )));
            }
            let byte_count = header[6] as usize;
            Ok(REQUEST_HEADER_LEN + byte_count + 2)
        }
        _ => Err(GatewayError::frame(format!(
            "unsupported function code: 0x{:02X}",
            function_code
        ))),
    }
}

/// Predict the length of the response to an encoded request ADU.
///
/// Only used to schedule the pre-read wait on the serial bus; the scanner
/// itself never trusts this number.
pub fn expected_response_len(request: &[u8]) -> usize {
    let mut length = RTU_MIN_FRAME;
    if request.len() < 6 {
        return length;
    }
    match request[1] {
        FUNC_READ_COILS | FUNC_READ_DISCRETE_INPUTS => {
            let count = u16::from_be_bytes([request[4], request[5]]) as usize;
            length += 1 + count / 8 + usize::from(count % 8 != 0);
        }
        FUNC_READ_HOLDING_REGISTERS
        | FUNC_READ_INPUT_REGISTERS
        | FUNC_READ_WRITE_MULTIPLE_REGISTERS => {
            let count = u16::from_be_bytes([request[4], request[5]]) as usize;
            length += 1 + count * 2;
        }
        FUNC_WRITE_SINGLE_COIL
        | FUNC_WRITE_SINGLE_REGISTER
        | FUNC_WRITE_MULTIPLE_COILS
        | FUNC_WRITE_MULTIPLE_REGISTERS => {
            length += 4;
        }
        FUNC_MASK_WRITE_REGISTER => {
            length += 6;
        }
        // 0x18 and other codes: undetermined
        _ => {}
    }
    length
}

/// Read one request frame from the stream (server side).
///
/// Implements the request scanner: one byte for the slave id, complete to
/// a 7-byte header, derive the total length from the function code, read
/// the remainder. The returned frame is complete but NOT CRC-verified;
/// callers decode it with [`RtuAdu::decode`] and apply their own error
/// policy (drop and resync on RTU, close the connection on RTU-over-TCP).
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> GatewayResult<Vec<u8>> {
    let mut frame = vec![0u8; RTU_MAX_FRAME];

    reader.read_exact(&mut frame[..1]).await?;
    reader.read_exact(&mut frame[1..REQUEST_HEADER_LEN]).await?;

    let function_code = frame[1];
    let expected = expected_request_len(function_code, &frame[..REQUEST_HEADER_LEN])?;
    if expected > RTU_MAX_FRAME {
        return Err(GatewayError::frame(format!(
            "request length {} exceeds maximum {}",
            expected, RTU_MAX_FRAME
        )));
    }

    if expected > REQUEST_HEADER_LEN {
        reader
            .read_exact(&mut frame[REQUEST_HEADER_LEN..expected])
            .await?;
    }

    frame.truncate(expected);
    Ok(frame)
}

/// Response scanner states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    SlaveId,
    FunctionCode,
    ReadLength,
    ReadPayload,
    ReadCrc,
}

/// Read one response frame from the stream (master side).
///
/// Knows the expected slave id and function code and discards any leading
/// bytes that do not match (noise tolerance on a shared bus). The frame
/// shape is selected by the function code: length-prefixed for the read
/// family, fixed four-byte payload for the write echoes, six bytes for
/// mask-write, one byte for an exception (`fc | 0x80`). The scan aborts
/// with a timeout error once `deadline` passes.
///
/// The returned frame includes the CRC bytes; callers verify it through
/// [`RtuAdu::decode`].
pub async fn read_response<R: AsyncRead + Unpin>(
    slave_id: SlaveId,
    function_code: u8,
    reader: &mut R,
    deadline: Instant,
) -> GatewayResult<Vec<u8>> {
    let mut byte = [0u8; 1];
    let mut data = [0u8; RTU_MAX_FRAME];

    let mut state = ScanState::SlaveId;
    let mut to_read: usize = 0;
    let mut crc_count: usize = 0;
    let mut n: usize = 0;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(GatewayError::timeout("read RTU response", 0));
        }

        match tokio::time::timeout(deadline - now, reader.read_exact(&mut byte)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(GatewayError::timeout("read RTU response", 0));
            }
        }

        match state {
            ScanState::SlaveId => {
                if byte[0] == slave_id {
                    state = ScanState::FunctionCode;
                    data[n] = byte[0];
                    n += 1;
                }
                // Any other byte is line noise; drop it.
            }
            ScanState::FunctionCode => {
                if byte[0] == function_code {
                    match function_code {
                        FUNC_READ_COILS
                        | FUNC_READ_DISCRETE_INPUTS
                        | FUNC_READ_HOLDING_REGISTERS
                        | FUNC_READ_INPUT_REGISTERS
                        | FUNC_READ_WRITE_MULTIPLE_REGISTERS
                        | FUNC_READ_FIFO_QUEUE => {
                            state = ScanState::ReadLength;
                        }
                        FUNC_WRITE_SINGLE_COIL
                        | FUNC_WRITE_SINGLE_REGISTER
                        | FUNC_WRITE_MULTIPLE_COILS
                        | FUNC_WRITE_MULTIPLE_REGISTERS => {
                            state = ScanState::ReadPayload;
                            to_read = 4;
                        }
                        FUNC_MASK_WRITE_REGISTER => {
                            state = ScanState::ReadPayload;
                            to_read = 6;
                        }
                        _ => {
                            return Err(GatewayError::frame(format!(
                                "function code not handled by scanner: 0x{:02X}",
                                function_code
                            )));
                        }
                    }
                    data[n] = byte[0];
                    n += 1;
                } else if byte[0] == function_code | 0x80 {
                    // Exception response: one payload byte
                    state = ScanState::ReadPayload;
                    data[n] = byte[0];
                    n += 1;
                    to_read = 1;
                }
                // Anything else: stay here; the slave id byte may have been
                // noise that matched by coincidence.
            }
            ScanState::ReadLength => {
                let length = byte[0] as usize;
                if length == 0 || length > RTU_MAX_FRAME - 5 {
                    return Err(GatewayError::frame(format!(
                        "invalid payload length received: {}",
                        length
                    )));
                }
                to_read = length;
                data[n] = byte[0];
                n += 1;
                state = ScanState::ReadPayload;
            }
            ScanState::ReadPayload => {
                data[n] = byte[0];
                n += 1;
                to_read -= 1;
                if to_read == 0 {
                    state = ScanState::ReadCrc;
                }
            }
            ScanState::ReadCrc => {
                data[n] = byte[0];
                n += 1;
                crc_count += 1;
                if crc_count == 2 {
                    return Ok(data[..n].to_vec());
                }
            }
        }
    }
}

/// Open a serial port with the configured line settings, applying the
/// RS485 discipline when requested.
pub fn open_serial(config: &crate::config::SerialConfig) -> GatewayResult<SerialStream> {
    let stream = tokio_serial::new(config.device.as_str(), config.baud_rate)
        .data_bits(config.data_bits()?)
        .stop_bits(config.stop_bits()?)
        .parity(config.parity()?)
        .timeout(config.timeout)
        .open_native_async()
        .map_err(|e| {
            GatewayError::connection(format!("could not open {}: {}", config.device, e))
        })?;

    if config.rs485 {
        apply_rs485(&stream, config)?;
    }

    log::debug!(
        "opened serial port {} ({} baud, {}{}{})",
        config.device,
        config.baud_rate,
        config.data_bits,
        config.parity,
        config.stop_bits
    );
    Ok(stream)
}

/// Apply the RS485 line discipline at open time (Linux TIOCSRS485).
#[cfg(target_os = "linux")]
fn apply_rs485(stream: &SerialStream, config: &crate::config::SerialConfig) -> GatewayResult<()> {
    use std::os::unix::io::AsRawFd;

    const TIOCSRS485: libc::c_ulong = 0x542F;
    const SER_RS485_ENABLED: u32 = 1 << 0;
    const SER_RS485_RTS_ON_SEND: u32 = 1 << 1;
    const SER_RS485_RTS_AFTER_SEND: u32 = 1 << 2;
    const SER_RS485_RX_DURING_TX: u32 = 1 << 4;

    // Mirrors the kernel's struct serial_rs485; delays are in milliseconds.
    #[repr(C)]
    #[derive(Default)]
    struct SerialRs485 {
        flags: u32,
        delay_rts_before_send: u32,
        delay_rts_after_send: u32,
        padding: [u32; 5],
    }

    let mut rs485 = SerialRs485 {
        flags: SER_RS485_ENABLED,
        delay_rts_before_send: config.delay_rts_before_send.as_millis() as u32,
        delay_rts_after_send: config.delay_rts_after_send.as_millis() as u32,
        ..Default::default()
    };
    if config.rts_high_during_send {
        rs485.flags |= SER_RS485_RTS_ON_SEND;
    }
    if config.rts_high_after_send {
        rs485.flags |= SER_RS485_RTS_AFTER_SEND;
    }
    if config.rx_during_tx {
        rs485.flags |= SER_RS485_RX_DURING_TX;
    }

    let fd = stream.as_raw_fd();
    // Safety: fd is a live serial descriptor and SerialRs485 matches the
    // kernel layout for this ioctl.
    let ret = unsafe { libc::ioctl(fd, TIOCSRS485, &rs485) };
    if ret != 0 {
        return Err(GatewayError::connection(format!(
            "TIOCSRS485 failed on {}: {}",
            config.device,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn apply_rs485(_stream: &SerialStream, config: &crate::config::SerialConfig) -> GatewayResult<()> {
    log::warn!(
        "RS485 options requested for {} are not supported on this platform",
        config.device
    );
    Ok(())
}

/// Transmission delay for `nbytes` characters at `baud_rate`, plus one
/// inter-frame gap: `character_delay * nbytes + frame_delay`.
///
/// For baud rates up to 19200 the 1.5/3.5 character-time rules apply
/// (15e6/baud and 35e6/baud microseconds); above that the fixed
/// 750/1750 microsecond floors are used.
pub fn transmission_delay(baud_rate: u32, nbytes: usize) -> Duration {
    let (character_delay, frame_delay) = if baud_rate == 0 || baud_rate > 19_200 {
        (750u64, 1_750u64)
    } else {
        (
            15_000_000u64 / baud_rate as u64,
            35_000_000u64 / baud_rate as u64,
        )
    };
    Duration::from_micros(character_delay * nbytes as u64 + frame_delay)
}

/// One 3.5 character-time inter-frame gap at `baud_rate`.
pub fn frame_gap(baud_rate: u32) -> Duration {
    transmission_delay(baud_rate, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_known_frame() {
        // Read holding registers: slave 1, addr 0, qty 2
        let adu = RtuAdu::new(0x01, Pdu::new(0x03, vec![0x00, 0x00, 0x00, 0x02]));
        let raw = adu.encode().unwrap();
        assert_eq!(raw.as_ref(), &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
    }

    #[test]
    fn test_decode_roundtrip() {
        let adu = RtuAdu::new(9, Pdu::new(0x10, vec![0x00, 0x01, 0x00, 0x02, 0x04, 1, 2, 3, 4]));
        let raw = adu.encode().unwrap();
        let decoded = RtuAdu::decode(&raw).unwrap();
        assert_eq!(decoded, adu);
    }

    #[test]
    fn test_decode_rejects_bad_crc() {
        let mut raw = RtuAdu::new(1, Pdu::new(0x03, vec![0x00, 0x00, 0x00, 0x02]))
            .encode()
            .unwrap()
            .to_vec();
        raw[6] ^= 0xFF;
        let err = RtuAdu::decode(&raw).unwrap_err();
        assert!(matches!(err, GatewayError::CrcMismatch { .. }));
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        assert!(RtuAdu::decode(&[0x01, 0x03, 0xC4]).is_err());
    }

    #[test]
    fn test_expected_request_len() {
        let header = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0x00];
        assert_eq!(expected_request_len(0x03, &header).unwrap(), 8);
        assert_eq!(expected_request_len(0x06, &header).unwrap(), 8);

        // Write multiple registers: byte count 4 at index 6
        let header = [0x01, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04];
        assert_eq!(expected_request_len(0x10, &header).unwrap(), 7 + 4 + 2);

        assert!(expected_request_len(0x2B, &header).is_err());
    }

    #[test]
    fn test_expected_response_len() {
        // Read 2 holding registers: 4 + 1 + 4 = 9
        let req = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02];
        assert_eq!(expected_response_len(&req), 9);

        // Read 10 coils: 4 + 1 + 2 = 7
        let req = [0x01, 0x01, 0x00, 0x00, 0x00, 0x0A];
        assert_eq!(expected_response_len(&req), 7);

        // Write echoes are fixed 8
        let req = [0x01, 0x06, 0x00, 0x01, 0x00, 0x03];
        assert_eq!(expected_response_len(&req), 8);
    }

    #[tokio::test]
    async fn test_read_request_fixed_length() {
        let frame = RtuAdu::new(1, Pdu::new(0x03, vec![0x00, 0x00, 0x00, 0x02]))
            .encode()
            .unwrap();
        let mut reader = Cursor::new(frame.to_vec());
        let scanned = read_request(&mut reader).await.unwrap();
        assert_eq!(scanned, frame.to_vec());
    }

    #[tokio::test]
    async fn test_read_request_variable_length() {
        let frame = RtuAdu::new(
            1,
            Pdu::new(0x10, vec![0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]),
        )
        .encode()
        .unwrap();
        let mut reader = Cursor::new(frame.to_vec());
        let scanned = read_request(&mut reader).await.unwrap();
        assert_eq!(scanned, frame.to_vec());
        assert!(RtuAdu::decode(&scanned).is_ok());
    }

    #[tokio::test]
    async fn test_read_request_abandons_unknown_function() {
        let mut raw = vec![0x01, 0x2B, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        raw.extend_from_slice(&[0u8; 8]);
        let mut reader = Cursor::new(raw);
        let err = read_request(&mut reader).await.unwrap_err();
        assert!(matches!(err, GatewayError::Frame { .. }));
    }

    #[tokio::test]
    async fn test_read_response_skips_noise() {
        let frame = RtuAdu::new(1, Pdu::new(0x03, vec![0x02, 0x30, 0x39]))
            .encode()
            .unwrap();
        let mut stream = vec![0xFF, 0x00, 0x37]; // leading line noise
        stream.extend_from_slice(&frame);

        let mut reader = Cursor::new(stream);
        let deadline = Instant::now() + Duration::from_secs(1);
        let scanned = read_response(1, 0x03, &mut reader, deadline).await.unwrap();
        assert_eq!(scanned, frame.to_vec());
    }

    #[tokio::test]
    async fn test_read_response_exception_shape() {
        let frame = RtuAdu::new(1, Pdu::new(0x83, vec![0x0B])).encode().unwrap();
        let mut reader = Cursor::new(frame.to_vec());
        let deadline = Instant::now() + Duration::from_secs(1);
        let scanned = read_response(1, 0x03, &mut reader, deadline).await.unwrap();
        let adu = RtuAdu::decode(&scanned).unwrap();
        assert!(adu.pdu.is_exception());
        assert_eq!(adu.pdu.data, vec![0x0B]);
    }

    #[tokio::test]
    async fn test_read_response_write_echo_shape() {
        let frame = RtuAdu::new(1, Pdu::new(0x06, vec![0x00, 0x01, 0x00, 0x03]))
            .encode()
            .unwrap();
        let mut reader = Cursor::new(frame.to_vec());
        let deadline = Instant::now() + Duration::from_secs(1);
        let scanned = read_response(1, 0x06, &mut reader, deadline).await.unwrap();
        assert_eq!(scanned, frame.to_vec());
    }

    #[tokio::test]
    async fn test_read_response_rejects_invalid_length() {
        // Read response with declared payload length 0
        let raw = vec![0x01, 0x03, 0x00];
        let mut reader = Cursor::new(raw);
        let deadline = Instant::now() + Duration::from_secs(1);
        let err = read_response(1, 0x03, &mut reader, deadline).await.unwrap_err();
        assert!(matches!(err, GatewayError::Frame { .. }));
    }

    #[tokio::test]
    async fn test_read_response_deadline() {
        // A stream that never produces the expected slave id
        let (mut client, _server) = tokio::io::duplex(16);
        let deadline = Instant::now() + Duration::from_millis(50);
        let err = read_response(1, 0x03, &mut client, deadline).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_transmission_delay() {
        // 9600 baud: 1562us per char, 3645us frame gap
        let d = transmission_delay(9600, 8);
        assert_eq!(d, Duration::from_micros(1562 * 8 + 3645));

        // Above 19200: fixed floors
        let d = transmission_delay(115_200, 10);
        assert_eq!(d, Duration::from_micros(750 * 10 + 1750));

        assert!(frame_gap(19_200) >= Duration::from_micros(1822));
    }
}
