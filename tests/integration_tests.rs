//! Integration tests for the Voltage Gateway
//!
//! End-to-end scenarios over loopback TCP: masters connect to a running
//! gateway instance, requests are routed to local or mock downstream
//! devices, and the replies are checked bit-exact.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use voltage_gateway::downstream::{Downstream, LocalDownstream, RtuOverTcpClient};
use voltage_gateway::gateway::Gateway;
use voltage_gateway::mbap::{self, TcpAdu};
use voltage_gateway::rtu::{self, RtuAdu};
use voltage_gateway::upstream::{TcpServer, Upstream};
use voltage_gateway::{Config, LocalSlave, MemoryStorage, Pdu, SlaveId, Supervisor};

/// Connect to a server that is still starting up.
async fn connect_with_retry(addr: &str) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("server at {} did not come up", addr);
}

/// One Modbus TCP master exchange.
async fn tcp_exchange(stream: &mut TcpStream, transaction_id: u16, unit_id: u8, pdu: Pdu) -> TcpAdu {
    let request = TcpAdu::new(transaction_id, unit_id, pdu);
    stream.write_all(&request.encode().unwrap()).await.unwrap();

    let frame = mbap::read_frame(stream).await.unwrap();
    TcpAdu::decode(&frame).unwrap()
}

/// Run a supervisor for the given config in the background.
fn spawn_supervisor(yaml: &str) -> (Arc<Supervisor>, tokio::task::JoinHandle<()>) {
    let config = Config::from_yaml(yaml).unwrap();
    let supervisor = Arc::new(Supervisor::from_config(&config).unwrap());
    let runner = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            supervisor.run().await.unwrap();
        })
    };
    (supervisor, runner)
}

/// Universal frame invariants: encode then decode is the identity.
#[test]
fn test_frame_roundtrip_invariants() {
    let pdu = Pdu::new(0x03, vec![0x00, 0x0A, 0x00, 0x02]);

    let rtu = RtuAdu::new(17, pdu.clone());
    let raw = rtu.encode().unwrap();
    assert_eq!(RtuAdu::decode(&raw).unwrap(), rtu);

    let tcp = TcpAdu::new(0xBEEF, 17, pdu);
    let raw = tcp.encode().unwrap();
    let decoded = TcpAdu::decode(&raw).unwrap();
    assert_eq!(decoded, tcp);
    assert_eq!(decoded.length() as usize, 1 + decoded.pdu.len());
}

/// S1: TCP master -> local slave, read holding register.
#[tokio::test]
async fn test_tcp_to_local_read_holding_register() {
    let yaml = r#"
gateways:
  - name: "s1"
    upstreams:
      - type: "tcp"
        tcp: { address: "127.0.0.1:45701" }
    downstreams:
      - name: "bench"
        type: "local"
        slave_ids: "1"
        local:
          device: "bench"
          persistence: { type: "memory" }
"#;
    let (supervisor, runner) = spawn_supervisor(yaml);
    let mut master = connect_with_retry("127.0.0.1:45701").await;

    // Pre-write register 10 with 12345 over the wire
    let reply = tcp_exchange(&mut master, 1, 1, Pdu::new(0x06, vec![0x00, 0x0A, 0x30, 0x39])).await;
    assert_eq!(reply.pdu.function_code, 0x06);

    // Read it back: function 0x03, addr 0x000A, qty 1
    let reply = tcp_exchange(&mut master, 2, 1, Pdu::new(0x03, vec![0x00, 0x0A, 0x00, 0x01])).await;
    assert_eq!(reply.transaction_id, 2);
    assert_eq!(reply.pdu.function_code, 0x03);
    assert_eq!(reply.pdu.data, vec![0x02, 0x30, 0x39]);

    supervisor.shutdown();
    runner.await.unwrap();
}

/// S2: TCP master -> RTU-framed pass-through to a simulated device.
#[tokio::test]
async fn test_tcp_to_rtu_passthrough() {
    // Simulated RTU device behind a TCP byte stream
    let device = TcpListener::bind("127.0.0.1:45712").await.unwrap();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match device.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                loop {
                    let frame = match rtu::read_request(&mut socket).await {
                        Ok(f) => f,
                        Err(_) => return,
                    };
                    let request = RtuAdu::decode(&frame).unwrap();
                    assert_eq!(request.slave_id, 1);
                    assert_eq!(request.pdu.function_code, 0x03);

                    // Registers 12345 and 54321
                    let reply = RtuAdu::new(
                        1,
                        Pdu::new(0x03, vec![0x04, 0x30, 0x39, 0xD4, 0x31]),
                    );
                    if socket.write_all(&reply.encode().unwrap()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    let yaml = r#"
gateways:
  - name: "s2"
    upstreams:
      - type: "tcp"
        tcp: { address: "127.0.0.1:45702" }
    downstreams:
      - name: "bus"
        type: "rtu-over-tcp"
        slave_ids: "1"
        tcp: { address: "127.0.0.1:45712" }
"#;
    let (supervisor, runner) = spawn_supervisor(yaml);
    let mut master = connect_with_retry("127.0.0.1:45702").await;

    let reply = tcp_exchange(&mut master, 9, 1, Pdu::new(0x03, vec![0x00, 0x00, 0x00, 0x02])).await;
    assert_eq!(reply.transaction_id, 9);
    assert_eq!(reply.pdu.function_code, 0x03);
    assert_eq!(reply.pdu.data, vec![0x04, 0x30, 0x39, 0xD4, 0x31]);

    supervisor.shutdown();
    runner.await.unwrap();
}

/// S3: no route for the requested unit id -> exception 0x0A.
#[tokio::test]
async fn test_gateway_path_unavailable() {
    let yaml = r#"
gateways:
  - name: "s3"
    upstreams:
      - type: "tcp"
        tcp: { address: "127.0.0.1:45703" }
    downstreams:
      - type: "local"
        slave_ids: "1"
"#;
    let (supervisor, runner) = spawn_supervisor(yaml);
    let mut master = connect_with_retry("127.0.0.1:45703").await;

    let reply = tcp_exchange(&mut master, 5, 2, Pdu::new(0x03, vec![0x00, 0x00, 0x00, 0x01])).await;
    assert_eq!(reply.transaction_id, 5);
    assert_eq!(reply.pdu.function_code, 0x03 | 0x80);
    assert_eq!(reply.pdu.data, vec![0x0A]);

    supervisor.shutdown();
    runner.await.unwrap();
}

/// S4: downstream never responds -> exception 0x0B within the safety
/// timeout.
#[tokio::test]
async fn test_downstream_timeout() {
    // A device that accepts and then stays silent forever
    let device = TcpListener::bind("127.0.0.1:45714").await.unwrap();
    tokio::spawn(async move {
        let mut sockets = Vec::new();
        loop {
            match device.accept().await {
                Ok((socket, _)) => sockets.push(socket),
                Err(_) => return,
            }
        }
    });

    let cancel = CancellationToken::new();
    let upstream: Arc<dyn Upstream> =
        Arc::new(TcpServer::new("127.0.0.1:45704", cancel.child_token()));
    let downstream: Arc<dyn Downstream> = Arc::new(RtuOverTcpClient::new("127.0.0.1:45714"));

    let mut routes: HashMap<SlaveId, Arc<dyn Downstream>> = HashMap::new();
    routes.insert(1, downstream.clone());
    let mut gateway = Gateway::new(
        "s4",
        vec![upstream],
        vec![downstream],
        routes,
        None,
        cancel.clone(),
    );
    gateway.set_exchange_timeout(Duration::from_millis(100));

    let gateway = Arc::new(gateway);
    let runner = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.run().await.unwrap() })
    };
    let mut master = connect_with_retry("127.0.0.1:45704").await;

    let started = std::time::Instant::now();
    let reply = tcp_exchange(&mut master, 3, 1, Pdu::new(0x03, vec![0x00, 0x00, 0x00, 0x01])).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(reply.pdu.function_code, 0x83);
    assert_eq!(reply.pdu.data, vec![0x0B]);

    cancel.cancel();
    runner.await.unwrap();
}

/// S5: RTU-over-TCP server rejects a corrupted CRC and closes the
/// connection without replying.
#[tokio::test]
async fn test_rtu_over_tcp_crc_reject() {
    let yaml = r#"
gateways:
  - name: "s5"
    upstreams:
      - type: "rtu-over-tcp"
        tcp: { address: "127.0.0.1:45705" }
    downstreams:
      - type: "local"
        slave_ids: "1"
"#;
    let (supervisor, runner) = spawn_supervisor(yaml);
    let mut master = connect_with_retry("127.0.0.1:45705").await;

    let mut raw = RtuAdu::new(1, Pdu::new(0x03, vec![0x00, 0x0A, 0x00, 0x01]))
        .encode()
        .unwrap()
        .to_vec();
    raw[6] ^= 0xFF;
    master.write_all(&raw).await.unwrap();

    let mut buf = [0u8; 16];
    let n = master.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "expected the connection to close without a reply");

    supervisor.shutdown();
    runner.await.unwrap();
}

/// S6: mmap persistence survives a full gateway restart.
#[tokio::test]
async fn test_mmap_persistence_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slave.dat");
    let yaml = format!(
        r#"
gateways:
  - name: "s6"
    upstreams:
      - type: "tcp"
        tcp: {{ address: "127.0.0.1:45706" }}
    downstreams:
      - type: "local"
        slave_ids: "1"
        local:
          device: "bench"
          persistence: {{ type: "mmap", path: "{}" }}
"#,
        path.display()
    );

    // First life: write 0xCAFE to holding register 10
    {
        let (supervisor, runner) = spawn_supervisor(&yaml);
        let mut master = connect_with_retry("127.0.0.1:45706").await;

        let reply =
            tcp_exchange(&mut master, 1, 1, Pdu::new(0x06, vec![0x00, 0x0A, 0xCA, 0xFE])).await;
        assert_eq!(reply.pdu.function_code, 0x06);

        supervisor.shutdown();
        runner.await.unwrap();
    }

    // Second life: same backing file, fresh gateway
    {
        let (supervisor, runner) = spawn_supervisor(&yaml);
        let mut master = connect_with_retry("127.0.0.1:45706").await;

        let reply =
            tcp_exchange(&mut master, 2, 1, Pdu::new(0x03, vec![0x00, 0x0A, 0x00, 0x01])).await;
        assert_eq!(reply.pdu.data, vec![0x02, 0xCA, 0xFE]);

        supervisor.shutdown();
        runner.await.unwrap();
    }
}

/// Requests from concurrent masters to the same downstream are strictly
/// serialized: the mock device reads whole frames only and never sees
/// interleaved bytes.
#[tokio::test]
async fn test_per_downstream_serialization() {
    let device = TcpListener::bind("127.0.0.1:45717").await.unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = device.accept().await.unwrap();
        loop {
            let frame = match rtu::read_request(&mut socket).await {
                Ok(f) => f,
                Err(_) => return,
            };
            let request = RtuAdu::decode(&frame).expect("interleaved frame on the wire");
            // Answer slowly so concurrent senders pile up
            sleep(Duration::from_millis(20)).await;
            let value = u16::from_be_bytes([request.pdu.data[0], request.pdu.data[1]]);
            let reply = RtuAdu::new(
                request.slave_id,
                Pdu::new(0x03, vec![0x02, (value >> 8) as u8, value as u8]),
            );
            if socket.write_all(&reply.encode().unwrap()).await.is_err() {
                return;
            }
        }
    });

    let yaml = r#"
gateways:
  - name: "serialize"
    upstreams:
      - type: "tcp"
        tcp: { address: "127.0.0.1:45707" }
    downstreams:
      - type: "rtu-over-tcp"
        slave_ids: "1"
        tcp: { address: "127.0.0.1:45717" }
"#;
    let (supervisor, runner) = spawn_supervisor(yaml);

    let mut tasks = Vec::new();
    for i in 0u16..4 {
        tasks.push(tokio::spawn(async move {
            let mut master = connect_with_retry("127.0.0.1:45707").await;
            let addr = 100 + i;
            let reply = tcp_exchange(
                &mut master,
                i,
                1,
                Pdu::new(0x03, vec![(addr >> 8) as u8, addr as u8, 0x00, 0x01]),
            )
            .await;
            assert_eq!(reply.transaction_id, i);
            assert_eq!(
                reply.pdu.data,
                vec![0x02, (addr >> 8) as u8, addr as u8]
            );
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    supervisor.shutdown();
    runner.await.unwrap();
}

/// A request for an unrouted unit id falls back to the default route.
#[tokio::test]
async fn test_default_route_fallback() {
    let yaml = r#"
gateways:
  - name: "fallback"
    upstreams:
      - type: "tcp"
        tcp: { address: "127.0.0.1:45709" }
    downstreams:
      - name: "routed"
        type: "local"
        slave_ids: "1"
      - name: "catch-all"
        type: "local"
"#;
    let (supervisor, runner) = spawn_supervisor(yaml);
    let mut master = connect_with_retry("127.0.0.1:45709").await;

    // Write through the default route (unit 99), then read it back there
    let reply = tcp_exchange(&mut master, 1, 99, Pdu::new(0x06, vec![0x00, 0x01, 0x11, 0x22])).await;
    assert_eq!(reply.pdu.function_code, 0x06);

    let reply = tcp_exchange(&mut master, 2, 99, Pdu::new(0x03, vec![0x00, 0x01, 0x00, 0x01])).await;
    assert_eq!(reply.pdu.data, vec![0x02, 0x11, 0x22]);

    // The routed downstream has its own model: same register still zero
    let reply = tcp_exchange(&mut master, 3, 1, Pdu::new(0x03, vec![0x00, 0x01, 0x00, 0x01])).await;
    assert_eq!(reply.pdu.data, vec![0x02, 0x00, 0x00]);

    supervisor.shutdown();
    runner.await.unwrap();
}

/// Write-multiple round trips through the whole stack: coils packed
/// little-endian per byte, registers big-endian per word.
#[tokio::test]
async fn test_write_multiple_roundtrip() {
    let yaml = r#"
gateways:
  - name: "multi"
    upstreams:
      - type: "tcp"
        tcp: { address: "127.0.0.1:45710" }
    downstreams:
      - type: "local"
        slave_ids: "1"
"#;
    let (supervisor, runner) = spawn_supervisor(yaml);
    let mut master = connect_with_retry("127.0.0.1:45710").await;

    // Write 10 coils at 20: pattern 0b01_0101_0101
    let reply = tcp_exchange(
        &mut master,
        1,
        1,
        Pdu::new(0x0F, vec![0x00, 0x14, 0x00, 0x0A, 0x02, 0x55, 0x01]),
    )
    .await;
    assert_eq!(reply.pdu.function_code, 0x0F);
    assert_eq!(reply.pdu.data, vec![0x00, 0x14, 0x00, 0x0A]);

    let reply = tcp_exchange(&mut master, 2, 1, Pdu::new(0x01, vec![0x00, 0x14, 0x00, 0x0A])).await;
    assert_eq!(reply.pdu.data, vec![0x02, 0x55, 0x01]);

    // Write 3 registers at 300
    let reply = tcp_exchange(
        &mut master,
        3,
        1,
        Pdu::new(
            0x10,
            vec![0x01, 0x2C, 0x00, 0x03, 0x06, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
        ),
    )
    .await;
    assert_eq!(reply.pdu.data, vec![0x01, 0x2C, 0x00, 0x03]);

    let reply = tcp_exchange(&mut master, 4, 1, Pdu::new(0x03, vec![0x01, 0x2C, 0x00, 0x03])).await;
    assert_eq!(
        reply.pdu.data,
        vec![0x06, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]
    );

    supervisor.shutdown();
    runner.await.unwrap();
}

/// File write-through persistence survives a restart, like the mmap
/// backing.
#[tokio::test]
async fn test_file_persistence_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slave-file.dat");
    let yaml = format!(
        r#"
gateways:
  - name: "file-persist"
    upstreams:
      - type: "tcp"
        tcp: {{ address: "127.0.0.1:45711" }}
    downstreams:
      - type: "local"
        slave_ids: "1"
        local:
          persistence: {{ type: "file", path: "{}" }}
"#,
        path.display()
    );

    {
        let (supervisor, runner) = spawn_supervisor(&yaml);
        let mut master = connect_with_retry("127.0.0.1:45711").await;
        tcp_exchange(&mut master, 1, 1, Pdu::new(0x05, vec![0x00, 0x07, 0xFF, 0x00])).await;
        supervisor.shutdown();
        runner.await.unwrap();
    }

    {
        let (supervisor, runner) = spawn_supervisor(&yaml);
        let mut master = connect_with_retry("127.0.0.1:45711").await;
        let reply =
            tcp_exchange(&mut master, 2, 1, Pdu::new(0x01, vec![0x00, 0x07, 0x00, 0x01])).await;
        assert_eq!(reply.pdu.data, vec![0x01, 0x01]);
        supervisor.shutdown();
        runner.await.unwrap();
    }
}

/// Two gateway instances in one process are isolated from each other.
#[tokio::test]
async fn test_two_gateway_instances() {
    let yaml = r#"
gateways:
  - name: "north"
    upstreams:
      - type: "tcp"
        tcp: { address: "127.0.0.1:45715" }
    downstreams:
      - type: "local"
        slave_ids: "1"
  - name: "south"
    upstreams:
      - type: "tcp"
        tcp: { address: "127.0.0.1:45716" }
    downstreams:
      - type: "local"
        slave_ids: "1"
"#;
    let (supervisor, runner) = spawn_supervisor(yaml);
    let mut north = connect_with_retry("127.0.0.1:45715").await;
    let mut south = connect_with_retry("127.0.0.1:45716").await;

    // Write into north only
    tcp_exchange(&mut north, 1, 1, Pdu::new(0x06, vec![0x00, 0x00, 0x12, 0x34])).await;

    let reply = tcp_exchange(&mut north, 2, 1, Pdu::new(0x03, vec![0x00, 0x00, 0x00, 0x01])).await;
    assert_eq!(reply.pdu.data, vec![0x02, 0x12, 0x34]);

    let reply = tcp_exchange(&mut south, 3, 1, Pdu::new(0x03, vec![0x00, 0x00, 0x00, 0x01])).await;
    assert_eq!(reply.pdu.data, vec![0x02, 0x00, 0x00]);

    supervisor.shutdown();
    runner.await.unwrap();
}

/// An undecodable unit request produces an exception, and the same
/// connection keeps serving afterwards.
#[tokio::test]
async fn test_illegal_function_and_connection_survives() {
    let yaml = r#"
gateways:
  - name: "illegal"
    upstreams:
      - type: "tcp"
        tcp: { address: "127.0.0.1:45718" }
    downstreams:
      - type: "local"
        slave_ids: "1"
"#;
    let (supervisor, runner) = spawn_supervisor(yaml);
    let mut master = connect_with_retry("127.0.0.1:45718").await;

    // 0x2B is not implemented by the local slave
    let reply = tcp_exchange(&mut master, 1, 1, Pdu::new(0x2B, vec![0x0E, 0x01, 0x00])).await;
    assert_eq!(reply.pdu.function_code, 0x2B | 0x80);
    assert_eq!(reply.pdu.data, vec![0x01]);

    // The connection is still usable
    let reply = tcp_exchange(&mut master, 2, 1, Pdu::new(0x03, vec![0x00, 0x00, 0x00, 0x01])).await;
    assert_eq!(reply.pdu.function_code, 0x03);

    supervisor.shutdown();
    runner.await.unwrap();
}

/// The same data model is visible through the gateway and through the
/// host-side handle of a manually assembled instance.
#[tokio::test]
async fn test_manual_gateway_with_shared_model() {
    let slave = LocalSlave::from_storage(Box::new(MemoryStorage)).unwrap();
    let local = Arc::new(LocalDownstream::from_slave(slave));
    local.model().set_input_register(4, 0x0102).unwrap();

    let cancel = CancellationToken::new();
    let upstream: Arc<dyn Upstream> =
        Arc::new(TcpServer::new("127.0.0.1:45708", cancel.child_token()));
    let mut routes: HashMap<SlaveId, Arc<dyn Downstream>> = HashMap::new();
    routes.insert(1, local.clone());

    let gateway = Arc::new(Gateway::new(
        "manual",
        vec![upstream],
        vec![local],
        routes,
        None,
        cancel.clone(),
    ));
    let runner = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.run().await.unwrap() })
    };
    let mut master = connect_with_retry("127.0.0.1:45708").await;

    // Read input registers (0x04)
    let reply = tcp_exchange(&mut master, 1, 1, Pdu::new(0x04, vec![0x00, 0x04, 0x00, 0x01])).await;
    assert_eq!(reply.pdu.data, vec![0x02, 0x01, 0x02]);

    cancel.cancel();
    runner.await.unwrap();
}
