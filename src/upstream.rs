/// Upstream listeners: the gateway acting as Slave toward external masters
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
///
/// Each listener reads framed requests in its own wire format, hands
/// `(slave id, PDU)` to the dispatcher, and writes the response back in
/// the same format. `start` blocks until the cancellation token fires.
///
/// Error policy per variant:
/// - **TCP**: an undecodable-but-delimited frame is dropped and the
///   connection continues; a read error or an unrecoverable length field
///   closes the connection.
/// - **RTU**: an abandoned frame (unknown function code, CRC mismatch)
///   just restarts the scan; bus silence resynchronizes the stream.
/// - **RTU-over-TCP**: any framing or CRC error closes the connection,
///   because a TCP byte stream cannot resynchronize by silence.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::{SerialConfig, UpstreamConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::mbap::{self, TcpAdu};
use crate::protocol::{Pdu, SlaveId};
use crate::rtu::{self, RtuAdu};

/// The gateway-side dispatcher an upstream hands each request to.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, slave_id: SlaveId, pdu: &Pdu) -> GatewayResult<Pdu>;
}

/// A source of requests: a Modbus master connected to the gateway.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Run the listener until the cancellation token fires. Call from its
    /// own task.
    async fn start(&self, handler: Arc<dyn RequestHandler>) -> GatewayResult<()>;

    /// Stop accepting and wind the listener down.
    fn close(&self);
}

/// Build the upstream selected by the configuration. The token is observed
/// by every accept/read point.
pub fn build_upstream(
    cfg: &UpstreamConfig,
    cancel: CancellationToken,
) -> GatewayResult<Arc<dyn Upstream>> {
    match cfg.kind.as_str() {
        "tcp" => {
            require_address(&cfg.tcp.address, "tcp upstream")?;
            Ok(Arc::new(TcpServer::new(&cfg.tcp.address, cancel)))
        }
        "rtu" => Ok(Arc::new(RtuServer::new(cfg.serial.clone(), cancel))),
        "rtu-over-tcp" => {
            require_address(&cfg.tcp.address, "rtu-over-tcp upstream")?;
            Ok(Arc::new(RtuOverTcpServer::new(&cfg.tcp.address, cancel)))
        }
        other => Err(GatewayError::configuration(format!(
            "unknown upstream type: {}",
            other
        ))),
    }
}

fn require_address(address: &str, what: &str) -> GatewayResult<()> {
    if address.is_empty() {
        return Err(GatewayError::configuration(format!(
            "{} requires tcp.address",
            what
        )));
    }
    Ok(())
}

/// Modbus TCP server.
pub struct TcpServer {
    address: String,
    cancel: CancellationToken,
}

impl TcpServer {
    pub fn new(address: &str, cancel: CancellationToken) -> Self {
        Self {
            address: address.to_string(),
            cancel,
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        peer: SocketAddr,
        handler: Arc<dyn RequestHandler>,
        cancel: CancellationToken,
    ) {
        info!("new tcp client connected: {}", peer);

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = mbap::read_frame(&mut stream) => result,
            };

            let frame = match result {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("tcp client {} read ended: {}", peer, e);
                    break;
                }
            };

            let adu = match TcpAdu::decode(&frame) {
                Ok(adu) => adu,
                Err(e) => {
                    warn!("dropping undecodable frame from {}: {}", peer, e);
                    continue;
                }
            };

            let response = tokio::select! {
                _ = cancel.cancelled() => break,
                response = handler.handle(adu.unit_id, &adu.pdu) => response,
            };
            let pdu = match response {
                Ok(pdu) => pdu,
                Err(e) => {
                    error!("handler failed for {}: {}", peer, e);
                    continue;
                }
            };

            let reply = TcpAdu::new(adu.transaction_id, adu.unit_id, pdu);
            let raw = match reply.encode() {
                Ok(raw) => raw,
                Err(e) => {
                    error!("failed to encode tcp response: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.write_all(&raw).await {
                error!("failed to write response to {}: {}", peer, e);
                break;
            }
        }

        info!("tcp client {} disconnected", peer);
    }
}

#[async_trait]
impl Upstream for TcpServer {
    async fn start(&self, handler: Arc<dyn RequestHandler>) -> GatewayResult<()> {
        let listener = TcpListener::bind(&self.address).await.map_err(|e| {
            GatewayError::connection(format!("failed to listen on {}: {}", self.address, e))
        })?;
        info!("modbus tcp server listening on {}", self.address);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("modbus tcp server on {} stopping", self.address);
                    return Ok(());
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let handler = handler.clone();
                            let cancel = self.cancel.clone();
                            tokio::spawn(Self::handle_connection(stream, peer, handler, cancel));
                        }
                        Err(e) => error!("failed to accept connection: {}", e),
                    }
                }
            }
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Modbus RTU server (the gateway as a slave on a serial bus).
///
/// Runs the request scanner in a loop. Dispatch is sequential: the server
/// never writes while a request is still arriving, and it observes one
/// inter-frame gap before replying on the shared bus.
pub struct RtuServer {
    config: SerialConfig,
    cancel: CancellationToken,
}

impl RtuServer {
    pub fn new(config: SerialConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }
}

#[async_trait]
impl Upstream for RtuServer {
    async fn start(&self, handler: Arc<dyn RequestHandler>) -> GatewayResult<()> {
        let mut port = rtu::open_serial(&self.config)?;
        info!("modbus rtu server listening on {}", self.config.device);

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("modbus rtu server on {} stopping", self.config.device);
                    return Ok(());
                }
                result = rtu::read_request(&mut port) => result,
            };

            let frame = match result {
                Ok(frame) => frame,
                Err(GatewayError::Frame { message }) => {
                    // Unknown function code or oversize frame: abandon and
                    // let bus silence resynchronize the scan.
                    debug!("abandoning rtu frame: {}", message);
                    continue;
                }
                Err(e) => {
                    error!("rtu server read failed on {}: {}", self.config.device, e);
                    return Err(e);
                }
            };

            let adu = match RtuAdu::decode(&frame) {
                Ok(adu) => adu,
                Err(e) => {
                    debug!("dropping rtu frame: {}", e);
                    continue;
                }
            };

            let response = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                response = handler.handle(adu.slave_id, &adu.pdu) => response,
            };
            let pdu = match response {
                Ok(pdu) => pdu,
                Err(e) => {
                    error!("handler failed: {}", e);
                    continue;
                }
            };

            // Inter-frame silence before transmitting on the shared bus
            tokio::time::sleep(rtu::frame_gap(self.config.baud_rate)).await;

            let reply = RtuAdu::new(adu.slave_id, pdu);
            let raw = match reply.encode() {
                Ok(raw) => raw,
                Err(e) => {
                    error!("failed to encode rtu response: {}", e);
                    continue;
                }
            };
            if let Err(e) = port.write_all(&raw).await {
                error!("failed to write rtu response: {}", e);
            }
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Modbus RTU-over-TCP server: RTU framing carried on a TCP byte stream.
pub struct RtuOverTcpServer {
    address: String,
    cancel: CancellationToken,
}

impl RtuOverTcpServer {
    pub fn new(address: &str, cancel: CancellationToken) -> Self {
        Self {
            address: address.to_string(),
            cancel,
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        peer: SocketAddr,
        handler: Arc<dyn RequestHandler>,
        cancel: CancellationToken,
    ) {
        info!("new rtu-over-tcp client connected: {}", peer);

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = rtu::read_request(&mut stream) => result,
            };

            let frame = match result {
                Ok(frame) => frame,
                Err(e) => {
                    // Framing errors leave the stream desynchronized;
                    // closing is the only safe reset.
                    debug!("rtu-over-tcp client {} read ended: {}", peer, e);
                    break;
                }
            };

            let adu = match RtuAdu::decode(&frame) {
                Ok(adu) => adu,
                Err(e) => {
                    warn!("closing rtu-over-tcp client {} on bad frame: {}", peer, e);
                    break;
                }
            };

            let response = tokio::select! {
                _ = cancel.cancelled() => break,
                response = handler.handle(adu.slave_id, &adu.pdu) => response,
            };
            let pdu = match response {
                Ok(pdu) => pdu,
                Err(e) => {
                    error!("handler failed for {}: {}", peer, e);
                    continue;
                }
            };

            let reply = RtuAdu::new(adu.slave_id, pdu);
            let raw = match reply.encode() {
                Ok(raw) => raw,
                Err(e) => {
                    error!("failed to encode rtu-over-tcp response: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.write_all(&raw).await {
                error!("failed to write response to {}: {}", peer, e);
                break;
            }
        }

        info!("rtu-over-tcp client {} disconnected", peer);
    }
}

#[async_trait]
impl Upstream for RtuOverTcpServer {
    async fn start(&self, handler: Arc<dyn RequestHandler>) -> GatewayResult<()> {
        let listener = TcpListener::bind(&self.address).await.map_err(|e| {
            GatewayError::connection(format!("failed to listen on {}: {}", self.address, e))
        })?;
        info!("rtu-over-tcp server listening on {}", self.address);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("rtu-over-tcp server on {} stopping", self.address);
                    return Ok(());
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let handler = handler.clone();
                            let cancel = self.cancel.clone();
                            tokio::spawn(Self::handle_connection(stream, peer, handler, cancel));
                        }
                        Err(e) => error!("failed to accept connection: {}", e),
                    }
                }
            }
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}
