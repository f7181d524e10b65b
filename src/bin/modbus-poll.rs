/// Modbus TCP poll utility
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
///
/// A small master for smoke-testing a running gateway: sends read
/// requests against a Modbus TCP endpoint and prints the decoded values.
///
/// ```sh
/// modbus-poll --address 127.0.0.1:502 --slave-id 1 --function 3 --register 10 --quantity 2
/// ```

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use voltage_gateway::downstream::{Downstream, TcpClient};
use voltage_gateway::protocol::data_utils;
use voltage_gateway::Pdu;

/// Poll a Modbus TCP device or gateway
#[derive(Parser, Debug)]
#[command(name = "modbus-poll", version, about)]
struct Cli {
    /// Target address
    #[arg(long, default_value = "127.0.0.1:502")]
    address: String,

    /// Slave / unit id
    #[arg(long, default_value_t = 1)]
    slave_id: u8,

    /// Read function code: 1, 2, 3, or 4
    #[arg(long, default_value_t = 3)]
    function: u8,

    /// Starting register or coil address (0-based)
    #[arg(long, default_value_t = 0)]
    register: u16,

    /// Number of registers or coils to read
    #[arg(long, default_value_t = 1)]
    quantity: u16,

    /// Number of polls to run
    #[arg(long, default_value_t = 1)]
    count: u32,

    /// Pause between polls in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::builder()
        .filter_level(log::LevelFilter::Warn)
        .init();

    let cli = Cli::parse();
    if !matches!(cli.function, 0x01..=0x04) {
        eprintln!("unsupported read function code: {}", cli.function);
        return ExitCode::FAILURE;
    }

    let client = TcpClient::new(&cli.address);
    let mut request_data = Vec::with_capacity(4);
    request_data.extend_from_slice(&cli.register.to_be_bytes());
    request_data.extend_from_slice(&cli.quantity.to_be_bytes());
    let request = Pdu::new(cli.function, request_data);

    for poll in 0..cli.count {
        if poll > 0 {
            tokio::time::sleep(Duration::from_millis(cli.interval_ms)).await;
        }

        let reply = match client.send(cli.slave_id, &request).await {
            Ok(reply) => reply,
            Err(e) => {
                eprintln!("poll failed: {}", e);
                return ExitCode::FAILURE;
            }
        };

        if let Some(code) = reply.exception_code() {
            eprintln!("device returned exception: {}", code);
            return ExitCode::FAILURE;
        }
        if reply.data.is_empty() {
            eprintln!("empty response payload");
            return ExitCode::FAILURE;
        }

        let payload = &reply.data[1..];
        match cli.function {
            0x01 | 0x02 => {
                let bits = data_utils::unpack_bits(payload, cli.quantity as usize);
                let rendered: Vec<u8> = bits.iter().map(|&b| b as u8).collect();
                println!("{} +{}: {:?}", cli.register, cli.quantity, rendered);
            }
            _ => {
                let registers = data_utils::bytes_to_registers(payload);
                println!("{} +{}: {:?}", cli.register, cli.quantity, registers);
            }
        }
    }

    let _ = client.close().await;
    ExitCode::SUCCESS
}
