/// Downstream clients: the gateway acting as Master toward real slaves
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
///
/// Every downstream exposes the same three-call contract: `connect` (eager,
/// failure tolerated), `send` (one PDU exchange), `close`. Each client owns
/// its transport resource behind an async mutex held for the whole
/// exchange, which is what serializes concurrent upstreams against a
/// shared bus. Connections are opened lazily on first use and torn down on
/// I/O errors so the next call reconnects.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_serial::SerialStream;

use crate::config::{DownstreamConfig, LocalConfig, SerialConfig};
use crate::data_model::DataModel;
use crate::error::{GatewayError, GatewayResult};
use crate::local_slave::LocalSlave;
use crate::mbap::{self, TcpAdu};
use crate::persistence::open_storage;
use crate::protocol::{Pdu, SlaveId};
use crate::rtu::{self, RtuAdu};

/// Default exchange deadline for TCP-based downstreams
pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle time after which the RTU master closes its serial port
pub const SERIAL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// A destination for requests: a Modbus slave the gateway connects to.
#[async_trait]
pub trait Downstream: Send + Sync {
    /// Eagerly open the transport resource. Failures here are tolerated by
    /// the gateway; `send` reconnects lazily.
    async fn connect(&self) -> GatewayResult<()>;

    /// Send a PDU to the given slave id and await the response PDU.
    async fn send(&self, slave_id: SlaveId, pdu: &Pdu) -> GatewayResult<Pdu>;

    /// Release the transport resource.
    async fn close(&self) -> GatewayResult<()>;
}

/// Build the downstream selected by the configuration.
pub fn build_downstream(cfg: &DownstreamConfig) -> GatewayResult<Arc<dyn Downstream>> {
    match cfg.kind.as_str() {
        "tcp" => {
            require_address(&cfg.tcp.address, "tcp downstream")?;
            Ok(Arc::new(TcpClient::new(&cfg.tcp.address)))
        }
        "rtu" => Ok(Arc::new(RtuMaster::new(cfg.serial.clone()))),
        "rtu-over-tcp" => {
            require_address(&cfg.tcp.address, "rtu-over-tcp downstream")?;
            Ok(Arc::new(RtuOverTcpClient::new(&cfg.tcp.address)))
        }
        "local" => Ok(Arc::new(LocalDownstream::from_config(&cfg.local)?)),
        other => Err(GatewayError::configuration(format!(
            "unknown downstream type: {}",
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

/// Modbus TCP client.
///
/// One persistent connection, one in-flight exchange at a time, and an
/// incrementing transaction-id counter per client. Responses are matched
/// to requests by transaction id.
pub struct TcpClient {
    address: String,
    timeout: Duration,
    transaction_id: AtomicU16,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpClient {
    pub fn new(address: &str) -> Self {
        Self::with_timeout(address, DEFAULT_TCP_TIMEOUT)
    }

    pub fn with_timeout(address: &str, timeout: Duration) -> Self {
        Self {
            address: address.to_string(),
            timeout,
            transaction_id: AtomicU16::new(0),
            stream: Mutex::new(None),
        }
    }

    async fn dial(&self) -> GatewayResult<TcpStream> {
        let connect = TcpStream::connect(&self.address);
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(GatewayError::connection(format!(
                "failed to connect to {}: {}",
                self.address, e
            ))),
            Err(_) => Err(GatewayError::timeout(
                format!("connect to {}", self.address),
                self.timeout.as_millis() as u64,
            )),
        }
    }

    async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(
        stream: &mut S,
        frame: &[u8],
    ) -> GatewayResult<Vec<u8>> {
        stream.write_all(frame).await?;
        mbap::read_frame(stream).await
    }
}

#[async_trait]
impl Downstream for TcpClient {
    async fn connect(&self) -> GatewayResult<()> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.dial().await?);
        }
        Ok(())
    }

    async fn send(&self, slave_id: SlaveId, pdu: &Pdu) -> GatewayResult<Pdu> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.dial().await?);
        }

        let tid = self.transaction_id.fetch_add(1, Ordering::Relaxed);
        let request = TcpAdu::new(tid, slave_id, pdu.clone());
        let frame = request.encode()?;
        debug!("send to modbus tcp slave {}: {}", self.address, hex::encode(&frame));

        let stream = guard.as_mut().unwrap();
        let raw = match tokio::time::timeout(self.timeout, Self::exchange(stream, &frame)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                // I/O failure: tear down so the next call reconnects
                *guard = None;
                return Err(e);
            }
            Err(_) => {
                *guard = None;
                return Err(GatewayError::timeout(
                    "modbus tcp exchange",
                    self.timeout.as_millis() as u64,
                ));
            }
        };
        debug!("recv from modbus tcp slave {}: {}", self.address, hex::encode(&raw));

        let response = TcpAdu::decode(&raw)?;
        request.verify(&response)?;
        Ok(response.pdu)
    }

    async fn close(&self) -> GatewayResult<()> {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }
}

/// Modbus RTU-over-TCP client.
///
/// Same connection model as [`TcpClient`], but the byte stream carries raw
/// RTU frames; responses are recovered with the RTU response scanner. A
/// framing or CRC error resets the connection, because a desynchronized
/// stream cannot recover by silence.
pub struct RtuOverTcpClient {
    address: String,
    timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
}

impl RtuOverTcpClient {
    pub fn new(address: &str) -> Self {
        Self::with_timeout(address, DEFAULT_TCP_TIMEOUT)
    }

    pub fn with_timeout(address: &str, timeout: Duration) -> Self {
        Self {
            address: address.to_string(),
            timeout,
            stream: Mutex::new(None),
        }
    }

    async fn dial(&self) -> GatewayResult<TcpStream> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(GatewayError::connection(format!(
                "failed to connect to {}: {}",
                self.address, e
            ))),
            Err(_) => Err(GatewayError::timeout(
                format!("connect to {}", self.address),
                self.timeout.as_millis() as u64,
            )),
        }
    }
}

#[async_trait]
impl Downstream for RtuOverTcpClient {
    async fn connect(&self) -> GatewayResult<()> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.dial().await?);
        }
        Ok(())
    }

    async fn send(&self, slave_id: SlaveId, pdu: &Pdu) -> GatewayResult<Pdu> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.dial().await?);
        }

        let request = RtuAdu::new(slave_id, pdu.clone());
        let frame = request.encode()?;
        debug!("send to rtu-over-tcp slave {}: {}", self.address, hex::encode(&frame));

        let stream = guard.as_mut().unwrap();
        let deadline = Instant::now() + self.timeout;

        let result: GatewayResult<Vec<u8>> = async {
            stream.write_all(&frame).await?;
            rtu::read_response(slave_id, pdu.function_code, stream, deadline).await
        }
        .await;

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                *guard = None;
                return Err(e);
            }
        };
        debug!("recv from rtu-over-tcp slave {}: {}", self.address, hex::encode(&raw));

        let response = match RtuAdu::decode(&raw) {
            Ok(adu) => adu,
            Err(e) => {
                // Stream state is unknown after a framing error; reset.
                *guard = None;
                return Err(e);
            }
        };
        request.verify(&response)?;
        Ok(response.pdu)
    }

    async fn close(&self) -> GatewayResult<()> {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }
}

struct PortState {
    port: Option<SerialStream>,
    last_activity: Option<Instant>,
    idle_timer: Option<JoinHandle<()>>,
}

/// Modbus RTU master over an asynchronous serial line.
///
/// Serial discipline per exchange:
///
/// 1. Honor the quiet gap since the previous bus activity (the configured
///    request pause, at least one 3.5 character-time frame gap).
/// 2. Write the request ADU.
/// 3. Sleep the predicted transmission time of request plus expected
///    response before touching the port again (avoids polling).
/// 4. Run the response scanner against the configured deadline.
///
/// After 60 seconds without activity the port is closed to keep RS485
/// lines clean; the next request reopens it.
pub struct RtuMaster {
    config: SerialConfig,
    idle_timeout: Duration,
    state: Arc<Mutex<PortState>>,
}

impl RtuMaster {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            idle_timeout: SERIAL_IDLE_TIMEOUT,
            state: Arc::new(Mutex::new(PortState {
                port: None,
                last_activity: None,
                idle_timer: None,
            })),
        }
    }

    async fn exchange(
        port: &mut SerialStream,
        frame: &[u8],
        slave_id: SlaveId,
        function_code: u8,
        baud_rate: u32,
        timeout: Duration,
    ) -> GatewayResult<Vec<u8>> {
        port.write_all(frame).await?;

        // Pre-read wait: the predicted time for the request and response to
        // cross the bus. The scanner never trusts this number.
        let predicted = rtu::expected_response_len(frame);
        tokio::time::sleep(rtu::transmission_delay(baud_rate, frame.len() + predicted)).await;

        let deadline = Instant::now() + timeout;
        rtu::read_response(slave_id, function_code, port, deadline).await
    }

    /// Re-arm the one-shot idle timer that closes the port.
    fn arm_idle_timer(&self, state: &mut PortState) {
        if let Some(handle) = state.idle_timer.take() {
            handle.abort();
        }

        let shared = self.state.clone();
        let idle = self.idle_timeout;
        let device = self.config.device.clone();
        state.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let mut state = shared.lock().await;
            let expired = state
                .last_activity
                .map(|t| t.elapsed() >= idle)
                .unwrap_or(false);
            if expired && state.port.take().is_some() {
                debug!("closing serial port {} after idle timeout", device);
            }
        }));
    }
}

#[async_trait]
impl Downstream for RtuMaster {
    async fn connect(&self) -> GatewayResult<()> {
        let mut state = self.state.lock().await;
        if state.port.is_none() {
            state.port = Some(rtu::open_serial(&self.config)?);
        }
        Ok(())
    }

    async fn send(&self, slave_id: SlaveId, pdu: &Pdu) -> GatewayResult<Pdu> {
        let mut state = self.state.lock().await;
        if state.port.is_none() {
            state.port = Some(rtu::open_serial(&self.config)?);
        }

        // Inter-frame silence before transmitting
        let min_gap = self
            .config
            .rqst_pause
            .max(rtu::frame_gap(self.config.baud_rate));
        if let Some(last) = state.last_activity {
            let elapsed = last.elapsed();
            if elapsed < min_gap {
                tokio::time::sleep(min_gap - elapsed).await;
            }
        }

        let request = RtuAdu::new(slave_id, pdu.clone());
        let frame = request.encode()?;
        debug!("send to modbus slave: {}", hex::encode(&frame));

        let port = state.port.as_mut().unwrap();
        let result = Self::exchange(
            port,
            &frame,
            slave_id,
            pdu.function_code,
            self.config.baud_rate,
            self.config.timeout,
        )
        .await;

        state.last_activity = Some(Instant::now());
        self.arm_idle_timer(&mut state);

        match result {
            Ok(raw) => {
                debug!("recv from modbus slave: {}", hex::encode(&raw));
                let response = RtuAdu::decode(&raw)?;
                request.verify(&response)?;
                Ok(response.pdu)
            }
            Err(e) => {
                // Port-level failures force a reopen; a quiet bus (timeout)
                // keeps the port for the next attempt.
                if matches!(e, GatewayError::Io { .. } | GatewayError::Connection { .. }) {
                    state.port = None;
                }
                Err(e)
            }
        }
    }

    async fn close(&self) -> GatewayResult<()> {
        let mut state = self.state.lock().await;
        if let Some(handle) = state.idle_timer.take() {
            handle.abort();
        }
        state.port = None;
        Ok(())
    }
}

/// Local in-process slave.
///
/// Direct call into the function-code engine over the shared data model.
/// The exclusive lease is kept for symmetry with the other downstream
/// kinds: one exchange at a time.
pub struct LocalDownstream {
    slave: LocalSlave,
    lease: Mutex<()>,
}

impl LocalDownstream {
    pub fn from_config(cfg: &LocalConfig) -> GatewayResult<Self> {
        if !cfg.device.is_empty() {
            debug!("initializing local slave device {}", cfg.device);
        }
        let storage = open_storage(&cfg.persistence)?;
        let slave = LocalSlave::from_storage(storage)?;
        Ok(Self {
            slave,
            lease: Mutex::new(()),
        })
    }

    pub fn from_slave(slave: LocalSlave) -> Self {
        Self {
            slave,
            lease: Mutex::new(()),
        }
    }

    /// Shared handle to the data model, for host-side population.
    pub fn model(&self) -> Arc<DataModel> {
        self.slave.model()
    }
}

#[async_trait]
impl Downstream for LocalDownstream {
    async fn connect(&self) -> GatewayResult<()> {
        Ok(())
    }

    async fn send(&self, _slave_id: SlaveId, pdu: &Pdu) -> GatewayResult<Pdu> {
        let _lease = self.lease.lock().await;
        Ok(self.slave.process(pdu))
    }

    async fn close(&self) -> GatewayResult<()> {
        self.slave.close()
    }
}
