//! # Voltage Gateway Error Handling
//!
//! This module provides comprehensive error handling for the Voltage Gateway,
//! covering transport failures, protocol and framing violations, routing
//! misses, persistence problems, and configuration errors.
//!
//! ## Overview
//!
//! The error system follows the taxonomy of the gateway's error design:
//!
//! - **Framing**: short frames, overflow, bad CRC, non-zero MBAP protocol
//!   id, transaction-id mismatch. These are locally recovered: the offending
//!   frame is dropped or the offending connection is closed.
//! - **Routing**: no route for a slave id. Surfaced to the upstream master
//!   as Modbus exception 0x0A.
//! - **Downstream timeout**: the per-exchange safety timeout or the response
//!   scanner deadline elapsed. Surfaced as Modbus exception 0x0B.
//! - **Downstream I/O**: dial/read/write failures. The connection is torn
//!   down and lazily re-established; the caller sees exception 0x04.
//! - **Protocol**: illegal function / address / value. Expressed as Modbus
//!   exception responses 0x01 / 0x02 / 0x03.
//! - **Configuration**: duplicate routes, malformed id grammar, bad
//!   persistence paths. Fatal at startup only.
//! - **Persistence I/O**: logged, never failing the Modbus write that
//!   triggered it (the in-memory mutation has already succeeded).
//!
//! ## Error Recovery
//!
//! Many errors carry information about recoverability:
//!
//! ```rust
//! use voltage_gateway::{GatewayError, GatewayResult};
//!
//! fn handle_error(result: GatewayResult<Vec<u8>>) {
//!     match result {
//!         Ok(data) => println!("Success: {:?}", data),
//!         Err(error) => {
//!             if error.is_recoverable() {
//!                 println!("Retryable error: {}", error);
//!             } else {
//!                 println!("Fatal error: {}", error);
//!             }
//!         }
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for gateway operations
///
/// This is a convenience type alias that uses `GatewayError` as the error
/// type for all gateway operations, providing consistent error handling
/// throughout the codebase.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Comprehensive gateway error types
///
/// This enumeration covers all error conditions that can occur while
/// bridging Modbus traffic, from transport-level issues to protocol
/// violations, routing misses, and persistence failures.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// I/O related errors (network, serial)
    ///
    /// # Examples
    /// - TCP connection reset mid-exchange
    /// - Serial port access denied
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment errors
    ///
    /// # Examples
    /// - Connection refused by a downstream device
    /// - Serial device node missing
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout errors
    ///
    /// Occurs when operations exceed their configured deadlines. Includes
    /// the operation that timed out and the deadline duration.
    ///
    /// # Examples
    /// - Response scanner deadline elapsed
    /// - Per-exchange safety timeout elapsed
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Protocol-level errors
    ///
    /// General Modbus protocol violations that don't fit a more specific
    /// category.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Invalid function code
    ///
    /// An unsupported or malformed Modbus function code was encountered.
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Invalid address range
    ///
    /// Out-of-range addresses or address/quantity combinations that exceed
    /// the 16-bit address space.
    ///
    /// # Examples
    /// - Starting address + quantity > 65536
    /// - Zero quantity in a read request
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Invalid data value
    ///
    /// Data format and validation errors.
    ///
    /// # Examples
    /// - Byte-count field inconsistent with payload length
    /// - Quantity outside a function code's allowed range
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Frame parsing errors
    ///
    /// Message frame format violations: short frames, oversize frames,
    /// incomplete MBAP headers, non-zero protocol id.
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// CRC validation failure
    ///
    /// Checksum validation failures on RTU frames. Provides both expected
    /// and actual CRC values for debugging.
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// MBAP transaction-id mismatch between request and response
    #[error("Transaction id mismatch: expected={expected}, actual={actual}")]
    TransactionMismatch { expected: u16, actual: u16 },

    /// Modbus exception response received from a downstream device
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Server Device Failure
    /// - 0x0A: Gateway Path Unavailable
    /// - 0x0B: Gateway Target Device Failed to Respond
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// No route configured for a slave id and no default route exists
    #[error("No route for slave id {slave_id}")]
    NoRoute { slave_id: u8 },

    /// Configuration errors
    ///
    /// # Examples
    /// - Slave id routed to two downstreams
    /// - Malformed id-range grammar
    /// - Unknown upstream/downstream type
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Persistence backing errors
    ///
    /// # Examples
    /// - Backing file could not be created or resized
    /// - Memory map flush failure
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// The operation was cancelled by the shutdown signal
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a transaction-id mismatch error
    pub fn transaction_mismatch(expected: u16, actual: u16) -> Self {
        Self::TransactionMismatch { expected, actual }
    }

    /// Create a Modbus exception error
    ///
    /// Automatically maps standard exception codes to human-readable messages.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Server Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Server Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception { function, code, message }
    }

    /// Create a no-route error
    pub fn no_route(slave_id: u8) -> Self {
        Self::NoRoute { slave_id }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a persistence error
    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// Determines whether an operation that failed with this error might
    /// succeed if retried, helping implement intelligent retry strategies.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use voltage_gateway::GatewayError;
    ///
    /// let timeout_error = GatewayError::timeout("read response", 5000);
    /// assert!(timeout_error.is_recoverable());
    ///
    /// let invalid_function = GatewayError::invalid_function(0x99);
    /// assert!(!invalid_function.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Exception { code, .. } => {
                // Acknowledge, Busy
                matches!(code, 0x05 | 0x06)
            }
            _ => false,
        }
    }

    /// Check if the error is a network/transport issue
    ///
    /// Transport errors tear down the offending connection; the next
    /// exchange reconnects lazily.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::InvalidFunction { .. }
                | Self::Exception { .. }
                | Self::Frame { .. }
                | Self::CrcMismatch { .. }
                | Self::TransactionMismatch { .. }
        )
    }

    /// Check if the error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Convert from std::io::Error, preserving the original message.
impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from tokio timeout errors.
///
/// The specific deadline should be provided when creating timeout errors
/// manually; this conversion is for `?` on `tokio::time::timeout` results.
impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("operation timeout", 0)
    }
}

/// Convert from YAML parsing errors raised by the configuration loader.
impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

/// Convert from serial port errors.
impl From<tokio_serial::Error> for GatewayError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(format!("serial error: {}", err))
    }
}
