/// Local slave: the Modbus function-code engine over the data model
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
///
/// A pure request-PDU to response-PDU mapping. Protocol violations are
/// expressed as exception responses, never as errors: validation order is
/// data length (0x03 illegal data value), quantity range (0x03), then
/// address range (0x02); the byte-count field of 0x0F/0x10 must match the
/// payload length (0x03). Unknown function codes produce 0x01.
///
/// After a successful mutation the persistence hook runs with the model's
/// write lock already released, so hook I/O never blocks readers.

use std::sync::Arc;

use crate::data_model::{DataModel, Table};
use crate::error::GatewayResult;
use crate::persistence::Storage;
use crate::protocol::{ExceptionCode, FunctionCode, Pdu};

/// Quantity limits per function code
const MAX_READ_BITS: u16 = 2000;
const MAX_READ_REGISTERS: u16 = 125;
const MAX_WRITE_BITS: u16 = 1968;
const MAX_WRITE_REGISTERS: u16 = 123;

/// Modbus slave implemented against the in-memory data model.
pub struct LocalSlave {
    model: Arc<DataModel>,
    storage: Box<dyn Storage>,
}

impl LocalSlave {
    /// Create a slave over a loaded model and its storage backend.
    pub fn new(model: Arc<DataModel>, storage: Box<dyn Storage>) -> Self {
        Self { model, storage }
    }

    /// Load the model from the given storage and build the slave.
    pub fn from_storage(mut storage: Box<dyn Storage>) -> GatewayResult<Self> {
        let model = Arc::new(storage.load()?);
        Ok(Self { model, storage })
    }

    /// Shared handle to the underlying data model.
    pub fn model(&self) -> Arc<DataModel> {
        self.model.clone()
    }

    /// Persist the full model and release the storage backing.
    pub fn close(&self) -> GatewayResult<()> {
        self.storage.save(&self.model)?;
        self.storage.close()
    }

    /// Execute a request PDU against the model.
    pub fn process(&self, request: &Pdu) -> Pdu {
        let function = match FunctionCode::from_u8(request.function_code) {
            Ok(f) => f,
            Err(_) => return self.exception(request, ExceptionCode::IllegalFunction),
        };

        match function {
            FunctionCode::ReadCoils => self.handle_read_coils(request),
            FunctionCode::ReadDiscreteInputs => self.handle_read_discrete_inputs(request),
            FunctionCode::ReadHoldingRegisters => self.handle_read_holding_registers(request),
            FunctionCode::ReadInputRegisters => self.handle_read_input_registers(request),
            FunctionCode::WriteSingleCoil => self.handle_write_single_coil(request),
            FunctionCode::WriteSingleRegister => self.handle_write_single_register(request),
            FunctionCode::WriteMultipleCoils => self.handle_write_multiple_coils(request),
            FunctionCode::WriteMultipleRegisters => self.handle_write_multiple_registers(request),
        }
    }

    fn handle_read_coils(&self, request: &Pdu) -> Pdu {
        let (address, quantity) = match parse_addr_qty(request) {
            Some(v) => v,
            None => return self.exception(request, ExceptionCode::IllegalDataValue),
        };
        if quantity < 1 || quantity > MAX_READ_BITS {
            return self.exception(request, ExceptionCode::IllegalDataValue);
        }

        match self.model.read_coils(address, quantity) {
            Ok(bits) => self.read_response(request, bits),
            Err(_) => self.exception(request, ExceptionCode::IllegalDataAddress),
        }
    }

    fn handle_read_discrete_inputs(&self, request: &Pdu) -> Pdu {
        let (address, quantity) = match parse_addr_qty(request) {
            Some(v) => v,
            None => return self.exception(request, ExceptionCode::IllegalDataValue),
        };
        if quantity < 1 || quantity > MAX_READ_BITS {
            return self.exception(request, ExceptionCode::IllegalDataValue);
        }

        match self.model.read_discrete_inputs(address, quantity) {
            Ok(bits) => self.read_response(request, bits),
            Err(_) => self.exception(request, ExceptionCode::IllegalDataAddress),
        }
    }

    fn handle_read_holding_registers(&self, request: &Pdu) -> Pdu {
        let (address, quantity) = match parse_addr_qty(request) {
            Some(v) => v,
            None => return self.exception(request, ExceptionCode::IllegalDataValue),
        };
        if quantity < 1 || quantity > MAX_READ_REGISTERS {
            return self.exception(request, ExceptionCode::IllegalDataValue);
        }

        match self.model.read_holding_registers(address, quantity) {
            Ok(bytes) => self.read_response(request, bytes),
            Err(_) => self.exception(request, ExceptionCode::IllegalDataAddress),
        }
    }

    fn handle_read_input_registers(&self, request: &Pdu) -> Pdu {
        let (address, quantity) = match parse_addr_qty(request) {
            Some(v) => v,
            None => return self.exception(request, ExceptionCode::IllegalDataValue),
        };
        if quantity < 1 || quantity > MAX_READ_REGISTERS {
            return self.exception(request, ExceptionCode::IllegalDataValue);
        }

        match self.model.read_input_registers(address, quantity) {
            Ok(bytes) => self.read_response(request, bytes),
            Err(_) => self.exception(request, ExceptionCode::IllegalDataAddress),
        }
    }

    fn handle_write_single_coil(&self, request: &Pdu) -> Pdu {
        let (address, value) = match parse_addr_qty(request) {
            Some(v) => v,
            None => return self.exception(request, ExceptionCode::IllegalDataValue),
        };

        if self.model.write_single_coil(address, value).is_err() {
            return self.exception(request, ExceptionCode::IllegalDataAddress);
        }
        self.storage.on_write(&self.model, Table::Coils, address, 1);

        // Echo the request
        request.clone()
    }

    fn handle_write_single_register(&self, request: &Pdu) -> Pdu {
        let (address, value) = match parse_addr_qty(request) {
            Some(v) => v,
            None => return self.exception(request, ExceptionCode::IllegalDataValue),
        };

        if self.model.write_single_register(address, value).is_err() {
            return self.exception(request, ExceptionCode::IllegalDataAddress);
        }
        self.storage
            .on_write(&self.model, Table::HoldingRegisters, address, 1);

        request.clone()
    }

    fn handle_write_multiple_coils(&self, request: &Pdu) -> Pdu {
        if request.data.len() < 6 {
            return self.exception(request, ExceptionCode::IllegalDataValue);
        }
        let address = u16::from_be_bytes([request.data[0], request.data[1]]);
        let quantity = u16::from_be_bytes([request.data[2], request.data[3]]);
        let byte_count = request.data[4];

        if quantity < 1 || quantity > MAX_WRITE_BITS {
            return self.exception(request, ExceptionCode::IllegalDataValue);
        }
        if request.data.len() - 5 != byte_count as usize {
            return self.exception(request, ExceptionCode::IllegalDataValue);
        }

        if self
            .model
            .write_multiple_coils(address, quantity, &request.data[5..])
            .is_err()
        {
            return self.exception(request, ExceptionCode::IllegalDataAddress);
        }
        self.storage
            .on_write(&self.model, Table::Coils, address, quantity);

        self.write_response(request, address, quantity)
    }

    fn handle_write_multiple_registers(&self, request: &Pdu) -> Pdu {
        if request.data.len() < 6 {
            return self.exception(request, ExceptionCode::IllegalDataValue);
        }
        let address = u16::from_be_bytes([request.data[0], request.data[1]]);
        let quantity = u16::from_be_bytes([request.data[2], request.data[3]]);
        let byte_count = request.data[4];

        if quantity < 1 || quantity > MAX_WRITE_REGISTERS {
            return self.exception(request, ExceptionCode::IllegalDataValue);
        }
        if request.data.len() - 5 != byte_count as usize {
            return self.exception(request, ExceptionCode::IllegalDataValue);
        }

        if self
            .model
            .write_multiple_registers(address, quantity, &request.data[5..])
            .is_err()
        {
            return self.exception(request, ExceptionCode::IllegalDataAddress);
        }
        self.storage
            .on_write(&self.model, Table::HoldingRegisters, address, quantity);

        self.write_response(request, address, quantity)
    }

    /// `[byte count][payload]` response for the read family.
    fn read_response(&self, request: &Pdu, payload: Vec<u8>) -> Pdu {
        let mut data = Vec::with_capacity(1 + payload.len());
        data.push(payload.len() as u8);
        data.extend_from_slice(&payload);
        Pdu::new(request.function_code, data)
    }

    /// `[address][quantity]` response for the write-multiple family.
    fn write_response(&self, request: &Pdu, address: u16, quantity: u16) -> Pdu {
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(&quantity.to_be_bytes());
        Pdu::new(request.function_code, data)
    }

    fn exception(&self, request: &Pdu, code: ExceptionCode) -> Pdu {
        Pdu::exception(request.function_code, code)
    }
}

/// Parse the fixed `[address:u16][value-or-quantity:u16]` request layout.
fn parse_addr_qty(request: &Pdu) -> Option<(u16, u16)> {
    if request.data.len() != 4 {
        return None;
    }
    Some((
        u16::from_be_bytes([request.data[0], request.data[1]]),
        u16::from_be_bytes([request.data[2], request.data[3]]),
    ))
}
