//! # Voltage Gateway - High-Performance Modbus TCP/RTU Gateway and Router
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **Version:** 0.2.0
//! **License:** MIT
//!
//! A Modbus protocol gateway in pure Rust: external masters connect on one
//! side (upstream) over Modbus TCP, RTU, or RTU-over-TCP; each request is
//! routed by slave id to one of several downstream targets (real slaves
//! over TCP, RTU, RTU-over-TCP, or an internal in-memory slave with
//! optional persistence); the reply returns on the same upstream
//! connection in the upstream's wire format.
//!
//! ## Features
//!
//! - **🚀 Async Throughout**: Tokio tasks per connection, strict
//!   serialization per downstream bus
//! - **🔧 Every Wire Variant**: Modbus TCP, RTU (serial), and RTU framing
//!   carried over TCP, all bit-exact
//! - **🧭 Routing**: per-instance slave-id routing table with range
//!   grammar ("1,2,5-10") and an optional default route
//! - **💾 Built-in Slave**: flat 16-bit data model with volatile, file
//!   write-through, or memory-mapped persistence
//! - **🛡️ Wire-Correct Errors**: gateway failures surface as Modbus
//!   exception responses (0x0A/0x0B/0x04), never as broken streams
//! - **🏭 Serial Discipline**: 1.5/3.5 character-time spacing, response
//!   length prediction, idle port close, RS485 RTS control
//!
//! ## Architecture
//!
//! ```text
//!  Masters                GATEWAY                       Slaves
//! ┌────────┐   ┌──────────────────────────────┐   ┌──────────────┐
//! │ TCP    │──▶│ upstream ─┐                  │──▶│ TCP client   │
//! ├────────┤   │           ├─▶ dispatch ──▶   │   ├──────────────┤
//! │ RTU    │──▶│ upstream ─┘   routes[id]     │──▶│ RTU master   │
//! ├────────┤   │               │ default      │   ├──────────────┤
//! │ RTU/TCP│──▶│ upstream ─────┘              │──▶│ local slave  │
//! └────────┘   └──────────────────────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_gateway::{Config, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(Some("config.yaml".as_ref()))?;
//!     let supervisor = Supervisor::from_config(&config)?;
//!     supervisor.run().await?;
//!     Ok(())
//! }
//! ```

/// Core error types and result handling
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod error;

/// Modbus protocol definitions: PDU, function codes, exception codes
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod protocol;

/// Modbus CRC-16 (polynomial 0xA001, initial 0xFFFF)
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod crc;

/// Modbus TCP (MBAP) framing
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod mbap;

/// Modbus RTU framing, scanners, and serial timing
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod rtu;

/// In-memory Modbus data model
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod data_model;

/// Persistence backends for the data model
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod persistence;

/// Local slave function-code engine
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod local_slave;

/// Upstream listeners (the gateway as a slave)
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod upstream;

/// Downstream clients (the gateway as a master)
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod downstream;

/// Gateway instance: routing and dispatch
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod gateway;

/// Supervisor hosting all gateway instances
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod supervisor;

/// Configuration tree and loader
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod config;

/// Logging setup
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod logging;

// Re-export main types for convenience
pub use config::{Config, GatewayConfig, LogConfig, PersistenceConfig, SerialConfig};
pub use data_model::{DataModel, Table};
pub use downstream::{Downstream, LocalDownstream, RtuMaster, RtuOverTcpClient, TcpClient};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{parse_slave_ids, Gateway};
pub use local_slave::LocalSlave;
pub use mbap::TcpAdu;
pub use persistence::{FileStorage, MemoryStorage, MmapStorage, Storage};
pub use protocol::{ExceptionCode, FunctionCode, Pdu, SlaveId};
pub use rtu::RtuAdu;
pub use supervisor::Supervisor;
pub use upstream::{RequestHandler, RtuOverTcpServer, RtuServer, TcpServer, Upstream};

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Maximum Modbus RTU frame size
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Voltage Gateway v{} - Modbus TCP/RTU gateway and router by Evan Liu",
        VERSION
    )
}
