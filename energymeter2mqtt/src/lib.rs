pub mod homeassistant;
pub mod modbus;
pub mod mqtt;
pub mod server;
pub mod settings;
pub mod systemd;

mod error;
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
