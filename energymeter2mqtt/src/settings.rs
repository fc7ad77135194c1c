//! User settings, stored as TOML in the home directory.

use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::info;

use crate::modbus::{connection::LinkOptions, DefinitionTable, UnitId};
use crate::systemd::SystemdSettings;
use crate::Error;

pub const SETTINGS_DIR_NAME: &str = ".energymeter2mqtt";
pub const SETTINGS_FILE_NAME: &str = "energymeter2mqtt.toml";

const ANONYMIZED: &str = "********";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    pub systemd: SystemdSettings,
    pub mqtt: MqttSettings,
    pub energy_meter: EnergyMeter,
}

/// The meter being polled. `name` selects one of the bundled definition files unless `definitions` points at a
/// custom one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyMeter {
    pub name: String,
    pub manufacturer: String,
    pub verbose_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub definitions: Option<PathBuf>,

    pub port: String,

    #[serde(alias = "unit")]
    pub slave_id: UnitId,

    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    pub retries: u8,

    #[serde(with = "humantime_serde", alias = "interval")]
    pub poll_interval: Duration,
}

impl Default for EnergyMeter {
    fn default() -> Self {
        Self {
            name: "saia_pcd_ald1d5fd".to_owned(),
            manufacturer: "Saia".to_owned(),
            verbose_name: "PCD ALD1D5FD".to_owned(),
            definitions: None,
            port: "/dev/ttyUSB0".to_owned(),
            slave_id: 1,
            timeout: Duration::from_millis(500),
            retries: 3,
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl EnergyMeter {
    pub fn get_definitions(&self) -> crate::Result<DefinitionTable> {
        match self.definitions {
            Some(ref path) => DefinitionTable::from_file(path),
            None => DefinitionTable::bundled(&self.name),
        }
    }

    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            timeout: self.timeout,
            retries: self.retries,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none", alias = "user")]
    pub user_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Identifies this device in Home Assistant, and prefixes every topic it publishes.
    pub main_uid: String,

    /// How often the discovery configs are sent again, so Home Assistant picks the sensors up after a restart.
    #[serde(with = "humantime_serde")]
    pub config_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 1883,
            user_name: None,
            password: None,
            main_uid: "energymeter".to_owned(),
            config_interval: Duration::from_secs(20),
            keep_alive: Duration::from_secs(5),
        }
    }
}

pub fn default_path() -> crate::Result<PathBuf> {
    let home = dirs::home_dir().ok_or(Error::NoHomeDir)?;
    Ok(home.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

impl UserSettings {
    /// Read the settings at `path`, falling back to the defaults if there is no such file yet.
    pub fn load(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading settings");
        Ok(toml::from_str(&std::fs::read_to_string(path)?)?)
    }

    pub fn save(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        info!(path = %path.display(), "Settings written");
        Ok(())
    }

    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// A copy that is safe to print.
    pub fn anonymized(&self) -> Self {
        let mut settings = self.clone();
        if settings.mqtt.password.is_some() {
            settings.mqtt.password = Some(ANONYMIZED.to_owned());
        }
        settings
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn defaults_round_trip_through_toml() {
    let settings = UserSettings::default();
    let toml = settings.to_toml().unwrap();

    assert!(toml.contains("[energy_meter]"));
    assert!(toml.contains("timeout = \"500ms\""));
    assert!(!toml.contains("password"));
    assert_eq!(toml::from_str::<UserSettings>(&toml).unwrap(), settings);
}

#[test]
fn partial_settings_fill_in_defaults() {
    let settings: UserSettings = toml::from_str(
        r#"
        [mqtt]
        host = "broker.lan"
        user_name = "meter"
        password = "secret"

        [energy_meter]
        port = "/dev/ttyUSB1"
        slave_id = 3
        timeout = "2s"
        poll_interval = "1m"
        "#,
    )
    .unwrap();

    assert_eq!(settings.mqtt.host, "broker.lan");
    assert_eq!(settings.mqtt.port, 1883);
    assert_eq!(settings.energy_meter.port, "/dev/ttyUSB1");
    assert_eq!(settings.energy_meter.slave_id, 3);
    assert_eq!(settings.energy_meter.timeout, Duration::from_secs(2));
    assert_eq!(settings.energy_meter.poll_interval, Duration::from_secs(60));
    assert_eq!(settings.energy_meter.name, "saia_pcd_ald1d5fd");
    assert_eq!(settings.systemd, SystemdSettings::default());
}

#[test]
fn anonymized_hides_the_password() {
    let mut settings = UserSettings::default();
    assert_eq!(settings.anonymized().mqtt.password, None);

    settings.mqtt.password = Some("hunter2".to_owned());
    let anonymized = settings.anonymized();
    assert_eq!(anonymized.mqtt.password.as_deref(), Some(ANONYMIZED));
    assert!(!anonymized.to_toml().unwrap().contains("hunter2"));
}

#[test]
fn load_missing_file_gives_defaults_and_save_round_trips() {
    let dir = std::env::temp_dir().join(format!("energymeter2mqtt-settings-{}", std::process::id()));
    let path = dir.join(SETTINGS_FILE_NAME);
    let _ = std::fs::remove_dir_all(&dir);

    assert_eq!(UserSettings::load(&path).unwrap(), UserSettings::default());

    let mut settings = UserSettings::default();
    settings.energy_meter.port = "/dev/ttyACM0".to_owned();
    settings.save(&path).unwrap();
    assert_eq!(UserSettings::load(&path).unwrap(), settings);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn default_meter_uses_bundled_definitions() {
    let table = EnergyMeter::default().get_definitions().unwrap();
    assert_eq!(table.parameters()[0].name, "Energy Counter Total");
}
