/// Modbus protocol definitions and data structures
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
///
/// This module contains the transport-independent core of the protocol:
/// the Protocol Data Unit (PDU), function codes, and exception codes.
/// The gateway forwards PDUs without interpreting them, so the PDU keeps
/// the raw function code byte; the typed [`FunctionCode`] enum is used
/// where a frame actually has to be understood (the local slave engine).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{GatewayError, GatewayResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus slave/unit identifier
pub type SlaveId = u8;

/// Maximum PDU data length (PDU = function code + up to 252 data bytes)
pub const MAX_PDU_DATA: usize = 252;

// Raw function code bytes. The response scanner needs to recognize more
// shapes than the eight codes the local slave implements.
pub const FUNC_READ_COILS: u8 = 0x01;
pub const FUNC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FUNC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FUNC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FUNC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FUNC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FUNC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FUNC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const FUNC_MASK_WRITE_REGISTER: u8 = 0x16;
pub const FUNC_READ_WRITE_MULTIPLE_REGISTERS: u8 = 0x17;
pub const FUNC_READ_FIFO_QUEUE: u8 = 0x18;

/// Modbus function codes handled by the local slave engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Convert from u8 to FunctionCode
    pub fn from_u8(value: u8) -> GatewayResult<Self> {
        match value {
            0x01 => Ok(FunctionCode::ReadCoils),
            0x02 => Ok(FunctionCode::ReadDiscreteInputs),
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            0x05 => Ok(FunctionCode::WriteSingleCoil),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            0x0F => Ok(FunctionCode::WriteMultipleCoils),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            _ => Err(GatewayError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
        )
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        matches!(
            self,
            FunctionCode::WriteSingleCoil
                | FunctionCode::WriteSingleRegister
                | FunctionCode::WriteMultipleCoils
                | FunctionCode::WriteMultipleRegisters
        )
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FunctionCode::ReadCoils => "Read Coils",
            FunctionCode::ReadDiscreteInputs => "Read Discrete Inputs",
            FunctionCode::ReadHoldingRegisters => "Read Holding Registers",
            FunctionCode::ReadInputRegisters => "Read Input Registers",
            FunctionCode::WriteSingleCoil => "Write Single Coil",
            FunctionCode::WriteSingleRegister => "Write Single Register",
            FunctionCode::WriteMultipleCoils => "Write Multiple Coils",
            FunctionCode::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ExceptionCode {
    /// Convert from u8 to ExceptionCode
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ExceptionCode::IllegalFunction),
            0x02 => Some(ExceptionCode::IllegalDataAddress),
            0x03 => Some(ExceptionCode::IllegalDataValue),
            0x04 => Some(ExceptionCode::ServerDeviceFailure),
            0x05 => Some(ExceptionCode::Acknowledge),
            0x06 => Some(ExceptionCode::ServerDeviceBusy),
            0x08 => Some(ExceptionCode::MemoryParityError),
            0x0A => Some(ExceptionCode::GatewayPathUnavailable),
            0x0B => Some(ExceptionCode::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ExceptionCode::IllegalFunction => "The function code received in the query is not an allowable action for the server",
            ExceptionCode::IllegalDataAddress => "The data address received in the query is not an allowable address for the server",
            ExceptionCode::IllegalDataValue => "A value contained in the query data field is not an allowable value for server",
            ExceptionCode::ServerDeviceFailure => "An unrecoverable error occurred while the server was attempting to perform the requested action",
            ExceptionCode::Acknowledge => "The server has accepted the request and is processing it, but a long duration of time will be required to do so",
            ExceptionCode::ServerDeviceBusy => "The server is engaged in processing a long-duration program command",
            ExceptionCode::MemoryParityError => "The server attempted to read record file, but detected a parity error in the memory",
            ExceptionCode::GatewayPathUnavailable => "Gateway was unable to allocate an internal communication path",
            ExceptionCode::GatewayTargetDeviceFailedToRespond => "No response was obtained from the target device",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Protocol Data Unit: function code plus function-specific data.
///
/// The transport-independent unit the gateway routes. An exception response
/// carries `request.function_code | 0x80` and a single exception-code byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub function_code: u8,
    pub data: Vec<u8>,
}

impl Pdu {
    /// Create a new PDU
    pub fn new(function_code: u8, data: Vec<u8>) -> Self {
        Self { function_code, data }
    }

    /// Synthesize an exception response for a request function code.
    pub fn exception(function_code: u8, code: ExceptionCode) -> Self {
        Self {
            function_code: function_code | 0x80,
            data: vec![code.to_u8()],
        }
    }

    /// Check if this PDU is an exception response
    pub fn is_exception(&self) -> bool {
        self.function_code & 0x80 != 0
    }

    /// Get the exception code carried by this PDU, if any
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        if self.is_exception() {
            self.data.first().and_then(|&c| ExceptionCode::from_u8(c))
        } else {
            None
        }
    }

    /// Wire length of the PDU (function code + data)
    pub fn len(&self) -> usize {
        1 + self.data.len()
    }

    /// A PDU always carries at least the function code byte
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for Pdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PDU(fc=0x{:02X}, {} data bytes)",
            self.function_code,
            self.data.len()
        )
    }
}

/// Data conversion utilities shared by the data model and tests
pub mod data_utils {
    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian)
    pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect()
    }

    /// Pack boolean values into bytes, little-endian bit order within each byte
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let byte_count = (bits.len() + 7) / 8;
        let mut bytes = vec![0u8; byte_count];

        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }

        bytes
    }

    /// Unpack bytes into boolean values
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        let mut bits = Vec::with_capacity(bit_count);

        for i in 0..bit_count {
            let byte_index = i / 8;
            if byte_index < bytes.len() {
                bits.push((bytes[byte_index] & (1 << (i % 8))) != 0);
            } else {
                bits.push(false);
            }
        }

        bits
    }
}
