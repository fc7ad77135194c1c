use clap::{ArgAction, Parser, Subcommand};
use energymeter2mqtt::{
    modbus::{self, connection, DefinitionTable},
    server,
    settings::{self, UserSettings},
    systemd::{self, ServiceControl},
    Result,
};
use itertools::Itertools;
use std::path::{Path, PathBuf};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[clap(
    name = "energymeter2mqtt",
    version,
    author,
    about = "Publish energy meter readings from Modbus RTU to Home Assistant via MQTT"
)]
struct Cli {
    /// Increase log output, repeat for more
    #[clap(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Settings file, defaults to ~/.energymeter2mqtt/energymeter2mqtt.toml
    #[clap(
        long,
        env = "ENERGYMETER2MQTT_SETTINGS",
        global = true,
        value_hint = clap::ValueHint::FilePath
    )]
    settings: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Print all values from the definitions until interrupted
    PrintValues,

    /// Print raw register contents, one register at a time
    PrintRegisters {
        #[clap(long, default_value_t = 0)]
        start: u16,

        /// Stop after this many failed reads
        #[clap(long, default_value_t = 5)]
        max_errors: usize,
    },

    /// Try every candidate serial port and print the values read through it
    ProbeUsbPorts {
        #[clap(long, default_value_t = 10)]
        max_port: u16,

        /// `{i}` is replaced by the port number
        #[clap(long, default_value = "/dev/ttyUSB{i}")]
        port_template: String,

        /// Only list the serial ports the OS knows about
        #[clap(long)]
        list: bool,
    },

    /// Publish all values to MQTT until interrupted
    PublishLoop,

    /// Open the settings file in $EDITOR, creating it with defaults first
    EditSettings,

    /// Print the settings with the MQTT password hidden
    DebugSettings,

    /// Print the systemd service file that would be written
    SystemdDebug,

    /// Write the systemd service file, enable and restart the service
    SystemdSetup,

    /// Stop and disable the service and remove its file
    SystemdRemove,

    /// Show the service status as reported by systemctl
    SystemdStatus,

    /// Stop the service
    SystemdStop,
}

fn log_level(verbose: u8) -> Level {
    match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(log_level(cli.verbose))
        .init();

    let path = match cli.settings {
        Some(path) => path,
        None => settings::default_path()?,
    };

    match cli.command {
        Commands::PrintValues => print_values(&path).await,
        Commands::PrintRegisters { start, max_errors } => {
            print_registers(&path, start, max_errors).await
        }
        Commands::ProbeUsbPorts {
            max_port,
            port_template,
            list,
        } => {
            if list {
                list_ports()
            } else {
                probe_usb_ports(&path, max_port, &port_template).await
            }
        }
        Commands::PublishLoop => {
            let (settings, table) = load(&path)?;
            let mut reader = open(&settings, &table, &settings.energy_meter.port).await?;
            server::run(&settings, &table, &mut reader, tokio::signal::ctrl_c()).await
        }
        Commands::EditSettings => edit_settings(&path),
        Commands::DebugSettings => {
            let settings = UserSettings::load(&path)?;
            println!("Settings file: {}", path.display());
            println!();
            print!("{}", settings.anonymized().to_toml()?);
            Ok(())
        }
        Commands::SystemdDebug => with_service(&path, |service| {
            service.debug();
            Ok(())
        }),
        Commands::SystemdSetup => {
            if !path.exists() {
                UserSettings::default().save(&path)?;
            }
            with_service(&path, |service| service.setup_and_restart())
        }
        Commands::SystemdRemove => with_service(&path, |service| service.remove()),
        Commands::SystemdStatus => with_service(&path, |service| service.status()),
        Commands::SystemdStop => with_service(&path, |service| service.stop()),
    }
}

fn load(path: &Path) -> Result<(UserSettings, DefinitionTable)> {
    let settings = UserSettings::load(path)?;
    let table = settings.energy_meter.get_definitions()?;
    info!(
        name = %settings.energy_meter.name,
        parameters = table.len(),
        "Loaded definitions"
    );
    Ok((settings, table))
}

async fn open(
    settings: &UserSettings,
    table: &DefinitionTable,
    port: &str,
) -> Result<connection::RtuReader> {
    let meter = &settings.energy_meter;
    connection::connect(port, &table.connection, meter.link_options(), meter.slave_id).await
}

async fn print_values(path: &Path) -> Result<()> {
    let (settings, table) = load(path)?;
    let mut reader = open(&settings, &table, &settings.energy_meter.port).await?;
    let unit = settings.energy_meter.slave_id;
    println!("slave_id={unit}");

    let mut interval = tokio::time::interval(settings.energy_meter.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut ctrl_c => return Ok(()),
        }

        let values = modbus::read_parameters(&mut reader, &table, unit).await?;
        println!("{}", values.iter().join("\n"));
        println!();
    }
}

async fn print_registers(path: &Path, start: u16, max_errors: usize) -> Result<()> {
    let (settings, table) = load(path)?;
    let mut reader = open(&settings, &table, &settings.energy_meter.port).await?;
    let unit = settings.energy_meter.slave_id;
    println!("slave_id={unit}");

    let answered = modbus::poll::scan_registers(&mut reader, unit, start, max_errors, |address, word| {
        println!("Read register dez: {address:02} hex: {address:04x} -> dez: {word:05} hex: {word:04x}")
    })
    .await;
    info!(answered, "Register scan finished");

    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = tokio_serial::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    } else {
        println!("{}", ports.iter().map(|port| &port.port_name).join("\n"));
    }
    Ok(())
}

async fn probe_usb_ports(path: &Path, max_port: u16, port_template: &str) -> Result<()> {
    let (settings, table) = load(path)?;

    for i in 0..max_port {
        let port = port_template.replace("{i}", &i.to_string());
        println!("Probe port: {port}...");

        match probe_port(&settings, &table, &port).await {
            Ok(values) if values.is_empty() => println!("No response"),
            Ok(values) => println!("{}", values.iter().join("\n")),
            Err(err) => println!("ERROR: {err}"),
        }
    }

    Ok(())
}

async fn probe_port(
    settings: &UserSettings,
    table: &DefinitionTable,
    port: &str,
) -> Result<Vec<modbus::DecodedValue>> {
    let mut reader = open(settings, table, port).await?;
    modbus::read_parameters(&mut reader, table, settings.energy_meter.slave_id).await
}

fn edit_settings(path: &Path) -> Result<()> {
    if !path.exists() {
        UserSettings::default().save(path)?;
    }

    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "nano".to_owned());
    info!(%editor, path = %path.display(), "Opening settings");
    let status = std::process::Command::new(&editor).arg(path).status()?;
    if !status.success() {
        warn!(%status, "Editor exited unsuccessfully");
    }

    // Surface syntax errors right away instead of at the next start of the service.
    UserSettings::load(path)?;
    Ok(())
}

fn with_service<F>(path: &Path, f: F) -> Result<()>
where
    F: FnOnce(&ServiceControl) -> Result<()>,
{
    let settings = UserSettings::load(path)?;
    let service = ServiceControl::new(&settings.systemd, systemd::exec_start(path)?);
    f(&service)
}
