use std::io;

pub mod connection;
pub mod decode;
pub mod definition;
pub mod poll;

pub use decode::{DecodedValue, Magnitude};
pub use definition::{DefinitionTable, DoubleWord, ParameterDefinition};
pub use poll::read_parameters;

pub type UnitId = tokio_modbus::prelude::SlaveId;

/// Something that can read a block of holding registers from a Modbus slave.
///
/// An `Err` is a transport level failure (I/O, timeout or an exception response from the slave). A successful read
/// is expected to return exactly `count` words.
#[async_trait::async_trait]
pub trait RegisterReader: Send {
    async fn read_holding_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        count: u16,
    ) -> io::Result<Vec<u16>>;
}
