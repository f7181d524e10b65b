/// In-memory Modbus data model
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
///
/// Four flat tables covering the full 16-bit address space: coils and
/// discrete inputs (one byte per bit), holding and input registers (u16 in
/// host byte order). The tables live in a single contiguous slab with a
/// fixed layout, which is also the persistent byte layout:
///
/// | offset  | size      | table             |
/// |---------|-----------|-------------------|
/// | 0       | 65536     | coils             |
/// | 65536   | 65536     | discrete inputs   |
/// | 131072  | 131072    | holding registers |
/// | 262144  | 131072    | input registers   |
///
/// Total 393216 bytes. The slab is either heap-owned (volatile and file
/// backings) or a shared read-write memory map (zero-copy persistence).
/// Registers are converted to/from big-endian only at the Modbus boundary,
/// so the on-disk register layout is host-endian.
///
/// A single read-write lock protects the whole model: readers proceed in
/// parallel, writers are exclusive.

use std::sync::RwLock;

use memmap2::MmapMut;

use crate::error::{GatewayError, GatewayResult};

/// Slots per table (the full 16-bit address space)
pub const TABLE_SLOTS: usize = 65536;

pub const COILS_SIZE: usize = TABLE_SLOTS;
pub const DISCRETE_INPUTS_SIZE: usize = TABLE_SLOTS;
pub const HOLDING_REGISTERS_SIZE: usize = TABLE_SLOTS * 2;
pub const INPUT_REGISTERS_SIZE: usize = TABLE_SLOTS * 2;

pub const COILS_OFFSET: usize = 0;
pub const DISCRETE_INPUTS_OFFSET: usize = COILS_OFFSET + COILS_SIZE;
pub const HOLDING_REGISTERS_OFFSET: usize = DISCRETE_INPUTS_OFFSET + DISCRETE_INPUTS_SIZE;
pub const INPUT_REGISTERS_OFFSET: usize = HOLDING_REGISTERS_OFFSET + HOLDING_REGISTERS_SIZE;

/// Total slab / backing file size in bytes
pub const TOTAL_SIZE: usize =
    COILS_SIZE + DISCRETE_INPUTS_SIZE + HOLDING_REGISTERS_SIZE + INPUT_REGISTERS_SIZE;

/// The four Modbus data tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

/// Slab storage: heap-owned or memory-mapped.
enum Slab {
    Heap(Box<[u8]>),
    Mapped(MmapMut),
}

impl Slab {
    fn bytes(&self) -> &[u8] {
        match self {
            Slab::Heap(b) => b,
            Slab::Mapped(m) => m,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Slab::Heap(b) => b,
            Slab::Mapped(m) => m,
        }
    }
}

/// Thread-safe Modbus data model.
pub struct DataModel {
    slab: RwLock<Slab>,
}

impl DataModel {
    /// Create a zeroed, heap-backed model.
    pub fn new() -> Self {
        Self {
            slab: RwLock::new(Slab::Heap(vec![0u8; TOTAL_SIZE].into_boxed_slice())),
        }
    }

    /// Create a model over a loaded byte buffer (file backing).
    pub fn from_bytes(buf: Vec<u8>) -> GatewayResult<Self> {
        if buf.len() != TOTAL_SIZE {
            return Err(GatewayError::persistence(format!(
                "backing buffer is {} bytes, expected {}",
                buf.len(),
                TOTAL_SIZE
            )));
        }
        Ok(Self {
            slab: RwLock::new(Slab::Heap(buf.into_boxed_slice())),
        })
    }

    /// Create a model over a shared read-write memory map (zero-copy).
    pub fn from_mmap(map: MmapMut) -> GatewayResult<Self> {
        if map.len() != TOTAL_SIZE {
            return Err(GatewayError::persistence(format!(
                "memory map is {} bytes, expected {}",
                map.len(),
                TOTAL_SIZE
            )));
        }
        Ok(Self {
            slab: RwLock::new(Slab::Mapped(map)),
        })
    }

    /// Read coils as packed bit-bytes (bit i of the result is
    /// coil\[address+i\], little-endian bit order within each byte).
    pub fn read_coils(&self, address: u16, quantity: u16) -> GatewayResult<Vec<u8>> {
        self.read_bits(COILS_OFFSET, address, quantity)
    }

    /// Read discrete inputs as packed bit-bytes.
    pub fn read_discrete_inputs(&self, address: u16, quantity: u16) -> GatewayResult<Vec<u8>> {
        self.read_bits(DISCRETE_INPUTS_OFFSET, address, quantity)
    }

    /// Read holding registers as big-endian bytes (quantity * 2 bytes).
    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> GatewayResult<Vec<u8>> {
        self.read_registers(HOLDING_REGISTERS_OFFSET, address, quantity)
    }

    /// Read input registers as big-endian bytes.
    pub fn read_input_registers(&self, address: u16, quantity: u16) -> GatewayResult<Vec<u8>> {
        self.read_registers(INPUT_REGISTERS_OFFSET, address, quantity)
    }

    /// Write a single coil from the raw request value: 0xFF00 switches the
    /// coil on, 0x0000 off; any other value is silently ignored.
    pub fn write_single_coil(&self, address: u16, value: u16) -> GatewayResult<()> {
        let mut slab = self.slab.write().unwrap();
        let bytes = slab.bytes_mut();
        match value {
            0xFF00 => bytes[COILS_OFFSET + address as usize] = 1,
            0x0000 => bytes[COILS_OFFSET + address as usize] = 0,
            _ => {}
        }
        Ok(())
    }

    /// Write multiple coils from packed bit-bytes.
    pub fn write_multiple_coils(
        &self,
        address: u16,
        quantity: u16,
        data: &[u8],
    ) -> GatewayResult<()> {
        validate_range(address, quantity)?;
        let expected = (quantity as usize + 7) / 8;
        if data.len() < expected {
            return Err(GatewayError::invalid_data(format!(
                "coil data is {} bytes, expected {}",
                data.len(),
                expected
            )));
        }

        let mut slab = self.slab.write().unwrap();
        let bytes = slab.bytes_mut();
        for i in 0..quantity as usize {
            let bit = (data[i / 8] >> (i % 8)) & 1;
            bytes[COILS_OFFSET + address as usize + i] = bit;
        }
        Ok(())
    }

    /// Write a single holding register.
    pub fn write_single_register(&self, address: u16, value: u16) -> GatewayResult<()> {
        let mut slab = self.slab.write().unwrap();
        let bytes = slab.bytes_mut();
        let offset = HOLDING_REGISTERS_OFFSET + address as usize * 2;
        bytes[offset..offset + 2].copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    /// Write multiple holding registers from big-endian bytes.
    pub fn write_multiple_registers(
        &self,
        address: u16,
        quantity: u16,
        data: &[u8],
    ) -> GatewayResult<()> {
        validate_range(address, quantity)?;
        if data.len() < quantity as usize * 2 {
            return Err(GatewayError::invalid_data(format!(
                "register data is {} bytes, expected {}",
                data.len(),
                quantity as usize * 2
            )));
        }

        let mut slab = self.slab.write().unwrap();
        let bytes = slab.bytes_mut();
        for i in 0..quantity as usize {
            let value = u16::from_be_bytes([data[i * 2], data[i * 2 + 1]]);
            let offset = HOLDING_REGISTERS_OFFSET + (address as usize + i) * 2;
            bytes[offset..offset + 2].copy_from_slice(&value.to_ne_bytes());
        }
        Ok(())
    }

    /// Set an input register value (host-side population, simulation, tests).
    pub fn set_input_register(&self, address: u16, value: u16) -> GatewayResult<()> {
        let mut slab = self.slab.write().unwrap();
        let bytes = slab.bytes_mut();
        let offset = INPUT_REGISTERS_OFFSET + address as usize * 2;
        bytes[offset..offset + 2].copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    /// Set a discrete input value (host-side population, simulation, tests).
    pub fn set_discrete_input(&self, address: u16, value: bool) -> GatewayResult<()> {
        let mut slab = self.slab.write().unwrap();
        let bytes = slab.bytes_mut();
        bytes[DISCRETE_INPUTS_OFFSET + address as usize] = value as u8;
        Ok(())
    }

    /// Run a closure over the raw slab bytes (persistence write-out).
    pub fn with_raw<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let slab = self.slab.read().unwrap();
        f(slab.bytes())
    }

    /// Flush a memory-mapped slab to its backing file synchronously.
    /// A no-op for heap-backed models.
    pub fn flush(&self) -> GatewayResult<()> {
        let slab = self.slab.read().unwrap();
        match &*slab {
            Slab::Heap(_) => Ok(()),
            Slab::Mapped(map) => map
                .flush()
                .map_err(|e| GatewayError::persistence(format!("mmap flush failed: {}", e))),
        }
    }

    fn read_bits(&self, table_offset: usize, address: u16, quantity: u16) -> GatewayResult<Vec<u8>> {
        validate_range(address, quantity)?;
        let slab = self.slab.read().unwrap();
        let bytes = slab.bytes();

        let mut result = vec![0u8; (quantity as usize + 7) / 8];
        for i in 0..quantity as usize {
            if bytes[table_offset + address as usize + i] != 0 {
                result[i / 8] |= 1 << (i % 8);
            }
        }
        Ok(result)
    }

    fn read_registers(
        &self,
        table_offset: usize,
        address: u16,
        quantity: u16,
    ) -> GatewayResult<Vec<u8>> {
        validate_range(address, quantity)?;
        let slab = self.slab.read().unwrap();
        let bytes = slab.bytes();

        let mut result = Vec::with_capacity(quantity as usize * 2);
        for i in 0..quantity as usize {
            let offset = table_offset + (address as usize + i) * 2;
            let value = u16::from_ne_bytes([bytes[offset], bytes[offset + 1]]);
            result.extend_from_slice(&value.to_be_bytes());
        }
        Ok(result)
    }
}

impl Default for DataModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Address range validation: quantity must be at least 1 and the range
/// must fit the 16-bit address space.
fn validate_range(address: u16, quantity: u16) -> GatewayResult<()> {
    if quantity == 0 {
        return Err(GatewayError::invalid_address(address, quantity));
    }
    if address as usize + quantity as usize > TABLE_SLOTS {
        return Err(GatewayError::invalid_address(address, quantity));
    }
    Ok(())
}
