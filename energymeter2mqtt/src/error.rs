use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    MQTTClientError(#[from] rumqttc::ClientError),

    #[error(transparent)]
    SerialError(#[from] tokio_serial::Error),

    #[error(transparent)]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error(transparent)]
    JSONError(#[from] serde_json::Error),

    #[error("Parameter {name:?} reads {count} registers, only 1 or 2 are supported")]
    UnsupportedRegisterCount { name: String, count: u16 },

    #[error("Unsupported definition schema version {0}, expected 1 or 2")]
    UnsupportedSchemaVersion(u8),

    #[error("Parameter {0:?} is defined more than once")]
    DuplicateParameter(String),

    #[error("Parameter {0:?} has no ASCII letters or digits to build a sensor id from")]
    EmptyObjectId(String),

    #[error("Parameters {first:?} and {second:?} both map to sensor id {object_id:?}")]
    ObjectIdCollision {
        first: String,
        second: String,
        object_id: String,
    },

    #[error("Definition table contains no parameters")]
    NoParameters,

    #[error("Invalid serial setting {setting}: {value}")]
    InvalidSerialSetting { setting: &'static str, value: String },

    #[error("No bundled definitions named {0:?}")]
    UnknownDefinitions(String),

    #[error("Parameter {name:?} expected {expected} registers but the reader returned {got}")]
    UnexpectedResponse {
        name: String,
        expected: u16,
        got: usize,
    },

    #[error("Scaling parameter {0:?} overflowed")]
    ScaleOverflow(String),

    #[error("Unable to determine the home directory")]
    NoHomeDir,

    #[error("systemctl {command} failed: {status}")]
    Systemctl {
        command: String,
        status: std::process::ExitStatus,
    },

    #[error("SendError")]
    SendError,
}
