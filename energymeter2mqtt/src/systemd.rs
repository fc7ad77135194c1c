use serde::{Deserialize, Serialize};
use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};
use tracing::{info, warn};

use crate::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemdSettings {
    pub service_name: String,
    pub description: String,
    pub service_file_path: PathBuf,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,

    #[serde(with = "humantime_serde")]
    pub restart_sec: Duration,
}

impl Default for SystemdSettings {
    fn default() -> Self {
        Self {
            service_name: "energymeter2mqtt".to_owned(),
            description: "energymeter2mqtt".to_owned(),
            service_file_path: PathBuf::from("/etc/systemd/system/energymeter2mqtt.service"),
            user: None,
            group: None,
            work_dir: None,
            restart_sec: Duration::from_secs(10),
        }
    }
}

pub fn render_unit(settings: &SystemdSettings, exec_start: &str) -> String {
    let mut unit = String::new();

    // Writing into a String cannot fail.
    let _ = writeln!(unit, "[Unit]");
    let _ = writeln!(unit, "Description={}", settings.description);
    let _ = writeln!(unit, "After=network.target");
    let _ = writeln!(unit);
    let _ = writeln!(unit, "[Service]");
    if let Some(user) = &settings.user {
        let _ = writeln!(unit, "User={user}");
    }
    if let Some(group) = &settings.group {
        let _ = writeln!(unit, "Group={group}");
    }
    if let Some(work_dir) = &settings.work_dir {
        let _ = writeln!(unit, "WorkingDirectory={}", work_dir.display());
    }
    let _ = writeln!(unit, "ExecStart={exec_start}");
    let _ = writeln!(unit, "SyslogIdentifier={}", settings.service_name);
    let _ = writeln!(unit, "Restart=always");
    let _ = writeln!(unit, "RestartSec={}", settings.restart_sec.as_secs());
    let _ = writeln!(unit);
    let _ = writeln!(unit, "[Install]");
    let _ = writeln!(unit, "WantedBy=multi-user.target");

    unit
}

/// The command line systemd should start: this very binary in publish mode.
pub fn exec_start(settings_path: &Path) -> crate::Result<String> {
    let exe = std::env::current_exe()?;
    Ok(format!(
        "{} --settings {} publish-loop",
        exe.display(),
        settings_path.display()
    ))
}

/// Manages the service through `systemctl`. Most operations need root.
#[derive(Debug)]
pub struct ServiceControl<'a> {
    settings: &'a SystemdSettings,
    exec_start: String,
}

impl<'a> ServiceControl<'a> {
    pub fn new(settings: &'a SystemdSettings, exec_start: String) -> Self {
        Self {
            settings,
            exec_start,
        }
    }

    pub fn unit(&self) -> String {
        render_unit(self.settings, &self.exec_start)
    }

    pub fn debug(&self) {
        println!("Service file: {}", self.settings.service_file_path.display());
        println!();
        print!("{}", self.unit());
    }

    pub fn setup_and_restart(&self) -> crate::Result<()> {
        let path = &self.settings.service_file_path;
        std::fs::write(path, self.unit())?;
        info!(path = %path.display(), "Service file written");

        systemctl(&["daemon-reload"])?;
        systemctl(&["enable", &self.settings.service_name])?;
        systemctl(&["restart", &self.settings.service_name])
    }

    pub fn remove(&self) -> crate::Result<()> {
        if let Err(error) = self.stop() {
            warn!(%error, "Stopping the service failed");
        }
        systemctl(&["disable", &self.settings.service_name])?;

        let path = &self.settings.service_file_path;
        if path.exists() {
            std::fs::remove_file(path)?;
            info!(path = %path.display(), "Service file removed");
        }

        systemctl(&["daemon-reload"])
    }

    pub fn status(&self) -> crate::Result<()> {
        // `status` exits non-zero for stopped units, which is information rather than failure.
        if let Err(error) = systemctl(&["--no-pager", "status", &self.settings.service_name]) {
            info!(%error, "Service is not running");
        }
        Ok(())
    }

    pub fn stop(&self) -> crate::Result<()> {
        systemctl(&["stop", &self.settings.service_name])
    }
}

fn systemctl(args: &[&str]) -> crate::Result<()> {
    info!(?args, "systemctl");
    let status = Command::new("systemctl").args(args).status()?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::Systemctl {
            command: args.join(" "),
            status,
        })
    }
}
