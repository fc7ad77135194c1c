use rust_decimal::Decimal;
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    path::Path,
};
use tracing::{debug, info};

use crate::homeassistant::object_id;
use crate::Error;

/// Definition files shipped inside the binary, keyed by `energy_meter.name`.
pub const BUNDLED: &[(&str, &str)] = &[(
    "saia_pcd_ald1d5fd",
    include_str!("../../definitions/saia_pcd_ald1d5fd.toml"),
)];

/// How the two words of a `count = 2` parameter are combined into one integer. The second word is always the more
/// significant one; only its weight differs between definition schema versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoubleWord {
    /// `lo + hi * 100000`, schema version 1.
    Base100000,
    /// `lo + hi * 65536`, schema version 2.
    Base65536,
}

impl DoubleWord {
    pub fn for_version(version: u8) -> crate::Result<Self> {
        match version {
            1 => Ok(DoubleWord::Base100000),
            2 => Ok(DoubleWord::Base65536),
            other => Err(Error::UnsupportedSchemaVersion(other)),
        }
    }

    pub fn multiplier(self) -> u64 {
        match self {
            DoubleWord::Base100000 => 100_000,
            DoubleWord::Base65536 => 65_536,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,

    pub register: u16,

    #[serde(default = "default_register_count")]
    pub count: u16,

    /// Written as a TOML number or string; a float literal such as `0.01` becomes exactly that decimal.
    #[serde(default)]
    pub scale: Option<Decimal>,

    #[serde(default, alias = "class")]
    pub device_class: Option<String>,

    #[serde(default)]
    pub state_class: Option<String>,

    #[serde(default, alias = "uom")]
    pub unit: Option<String>,
}

fn default_register_count() -> u16 {
    1
}

/// Serial line parameters of the meter, spelled the way the meter manuals do (`parity = "E"`, `stopbits = 1`).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SerialSettings {
    pub baudrate: u32,

    #[serde(default = "default_bytesize")]
    pub bytesize: u8,

    #[serde(default = "default_parity")]
    pub parity: String,

    #[serde(default = "default_stopbits")]
    pub stopbits: u8,
}

fn default_bytesize() -> u8 {
    8
}

fn default_parity() -> String {
    "N".to_owned()
}

fn default_stopbits() -> u8 {
    1
}

impl SerialSettings {
    pub fn data_bits(&self) -> crate::Result<tokio_serial::DataBits> {
        use tokio_serial::DataBits::*;
        match self.bytesize {
            5 => Ok(Five),
            6 => Ok(Six),
            7 => Ok(Seven),
            8 => Ok(Eight),
            other => Err(Error::InvalidSerialSetting {
                setting: "bytesize",
                value: other.to_string(),
            }),
        }
    }

    pub fn parity(&self) -> crate::Result<tokio_serial::Parity> {
        use tokio_serial::Parity;
        match self.parity.to_ascii_lowercase().as_str() {
            "n" | "none" => Ok(Parity::None),
            "e" | "even" => Ok(Parity::Even),
            "o" | "odd" => Ok(Parity::Odd),
            _ => Err(Error::InvalidSerialSetting {
                setting: "parity",
                value: self.parity.clone(),
            }),
        }
    }

    pub fn stop_bits(&self) -> crate::Result<tokio_serial::StopBits> {
        match self.stopbits {
            1 => Ok(tokio_serial::StopBits::One),
            2 => Ok(tokio_serial::StopBits::Two),
            other => Err(Error::InvalidSerialSetting {
                setting: "stopbits",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Deserialize)]
struct DefinitionFile {
    #[serde(default = "default_schema_version")]
    version: u8,

    connection: SerialSettings,

    #[serde(default)]
    parameters: Vec<ParameterDefinition>,
}

fn default_schema_version() -> u8 {
    2
}

/// The validated, read-only contents of a definition file.
#[derive(Clone, Debug)]
pub struct DefinitionTable {
    pub connection: SerialSettings,
    pub double_word: DoubleWord,
    parameters: Vec<ParameterDefinition>,
}

impl DefinitionTable {
    pub fn new(
        connection: SerialSettings,
        double_word: DoubleWord,
        parameters: Vec<ParameterDefinition>,
    ) -> crate::Result<Self> {
        connection.data_bits()?;
        connection.parity()?;
        connection.stop_bits()?;

        if parameters.is_empty() {
            return Err(Error::NoParameters);
        }

        let mut names = HashSet::new();
        let mut object_ids = HashMap::new();
        for parameter in &parameters {
            if !matches!(parameter.count, 1 | 2) {
                return Err(Error::UnsupportedRegisterCount {
                    name: parameter.name.clone(),
                    count: parameter.count,
                });
            }
            if !names.insert(parameter.name.as_str()) {
                return Err(Error::DuplicateParameter(parameter.name.clone()));
            }

            // Topics and unique ids are keyed by the object id, not the raw name.
            let id = object_id(&parameter.name);
            if id.is_empty() {
                return Err(Error::EmptyObjectId(parameter.name.clone()));
            }
            if let Some(first) = object_ids.insert(id.clone(), parameter.name.as_str()) {
                return Err(Error::ObjectIdCollision {
                    first: first.to_owned(),
                    second: parameter.name.clone(),
                    object_id: id,
                });
            }
        }

        Ok(Self {
            connection,
            double_word,
            parameters,
        })
    }

    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let DefinitionFile {
            version,
            connection,
            parameters,
        } = toml::from_str(content)?;

        Self::new(connection, DoubleWord::for_version(version)?, parameters)
    }

    pub fn from_file(path: &Path) -> crate::Result<Self> {
        info!(path = %path.display(), "Loading definitions");
        let table = Self::from_toml(&std::fs::read_to_string(path)?)?;
        debug!(?table);
        Ok(table)
    }

    pub fn bundled(name: &str) -> crate::Result<Self> {
        let (_, content) = BUNDLED
            .iter()
            .find(|(bundled, _)| *bundled == name)
            .ok_or_else(|| Error::UnknownDefinitions(name.to_owned()))?;

        info!(name, "Loading bundled definitions");
        Self::from_toml(content)
    }

    pub fn parameters(&self) -> &[ParameterDefinition] {
        &self.parameters
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
use std::str::FromStr;

#[cfg(test)]
const MINIMAL: &str = r#"
    [connection]
    baudrate = 9600

    [[parameters]]
    name = "voltage"
    register = 0x23
    scale = 0.01
    uom = "V"
"#;

#[test]
fn parse_minimal_definitions() {
    let table = DefinitionTable::from_toml(MINIMAL).unwrap();

    assert_eq!(table.double_word, DoubleWord::Base65536);
    assert_eq!(
        table.connection,
        SerialSettings {
            baudrate: 9600,
            bytesize: 8,
            parity: "N".to_owned(),
            stopbits: 1,
        }
    );
    assert_eq!(
        table.parameters(),
        &[ParameterDefinition {
            name: "voltage".to_owned(),
            register: 35,
            count: 1,
            scale: Some(Decimal::new(1, 2)),
            device_class: None,
            state_class: None,
            unit: Some("V".to_owned()),
        }]
    );
}

#[test]
fn parse_scale_is_exact_decimal() {
    let table = DefinitionTable::from_toml(
        r#"
        [connection]
        baudrate = 9600

        [[parameters]]
        name = "a"
        register = 1
        scale = 0.1

        [[parameters]]
        name = "b"
        register = 2
        scale = 10

        [[parameters]]
        name = "c"
        register = 3
        scale = "0.001"

        [[parameters]]
        name = "d"
        register = 4
        "#,
    )
    .unwrap();

    let scales: Vec<_> = table.parameters().iter().map(|p| p.scale).collect();
    assert_eq!(
        scales,
        vec![
            Some(Decimal::from_str("0.1").unwrap()),
            Some(Decimal::from(10)),
            Some(Decimal::from_str("0.001").unwrap()),
            None,
        ]
    );
}

#[test]
fn schema_version_selects_double_word() {
    let v1 = format!("version = 1\n{MINIMAL}");
    let table = DefinitionTable::from_toml(&v1).unwrap();
    assert_eq!(table.double_word, DoubleWord::Base100000);
    assert_eq!(table.double_word.multiplier(), 100_000);

    let v3 = format!("version = 3\n{MINIMAL}");
    assert!(matches!(
        DefinitionTable::from_toml(&v3),
        Err(Error::UnsupportedSchemaVersion(3))
    ));
}

#[test]
fn reject_unsupported_register_count() {
    let result = DefinitionTable::from_toml(
        r#"
        [connection]
        baudrate = 9600

        [[parameters]]
        name = "wide"
        register = 0
        count = 4
        "#,
    );
    assert!(matches!(
        result,
        Err(Error::UnsupportedRegisterCount { ref name, count: 4 }) if name == "wide"
    ));
}

#[test]
fn reject_duplicate_parameter_names() {
    let result = DefinitionTable::from_toml(
        r#"
        [connection]
        baudrate = 9600

        [[parameters]]
        name = "power"
        register = 1

        [[parameters]]
        name = "power"
        register = 2
        "#,
    );
    assert!(matches!(result, Err(Error::DuplicateParameter(ref name)) if name == "power"));
}

#[test]
fn reject_colliding_sensor_ids() {
    let result = DefinitionTable::from_toml(
        r#"
        [connection]
        baudrate = 9600

        [[parameters]]
        name = "Power W"
        register = 1

        [[parameters]]
        name = "Power (W)"
        register = 2
        "#,
    );
    assert!(matches!(
        result,
        Err(Error::ObjectIdCollision { ref first, ref second, ref object_id })
            if first == "Power W" && second == "Power (W)" && object_id == "power_w"
    ));
}

#[test]
fn reject_names_without_sensor_id() {
    let result = DefinitionTable::from_toml(
        r#"
        [connection]
        baudrate = 9600

        [[parameters]]
        name = "Voltage"
        register = 1

        [[parameters]]
        name = "Ü"
        register = 2
        "#,
    );
    assert!(matches!(result, Err(Error::EmptyObjectId(ref name)) if name == "Ü"));
}

#[test]
fn reject_empty_and_incomplete_tables() {
    let empty = DefinitionTable::from_toml("[connection]\nbaudrate = 9600\n");
    assert!(matches!(empty, Err(Error::NoParameters)));

    let no_register = DefinitionTable::from_toml(
        r#"
        [connection]
        baudrate = 9600

        [[parameters]]
        name = "power"
        "#,
    );
    assert!(matches!(no_register, Err(Error::TomlError(_))));
}

#[test]
fn serial_settings_conversion() {
    use tokio_serial::{DataBits, Parity, StopBits};

    let serial = SerialSettings {
        baudrate: 19200,
        bytesize: 7,
        parity: "even".to_owned(),
        stopbits: 2,
    };
    assert_eq!(serial.data_bits().unwrap(), DataBits::Seven);
    assert_eq!(serial.parity().unwrap(), Parity::Even);
    assert_eq!(serial.stop_bits().unwrap(), StopBits::Two);

    let bad = SerialSettings {
        parity: "X".to_owned(),
        ..serial
    };
    assert!(matches!(
        bad.parity(),
        Err(Error::InvalidSerialSetting {
            setting: "parity",
            ..
        })
    ));
}

#[test]
fn bundled_definitions_load() {
    for (name, _) in BUNDLED {
        let table = DefinitionTable::bundled(name).unwrap();
        assert!(!table.is_empty());
    }

    let saia = DefinitionTable::bundled("saia_pcd_ald1d5fd").unwrap();
    assert_eq!(saia.connection.parity().unwrap(), tokio_serial::Parity::Even);
    let total = &saia.parameters()[0];
    assert_eq!(total.register, 0x1C);
    assert_eq!(total.count, 2);
    assert_eq!(total.device_class.as_deref(), Some("energy"));

    assert!(matches!(
        DefinitionTable::bundled("nope"),
        Err(Error::UnknownDefinitions(_))
    ));
}
