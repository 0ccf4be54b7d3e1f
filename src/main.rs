use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use adb_wifi_lib::app::adb::parse::parse_endpoint;
use adb_wifi_lib::app::cancel::InterruptRouter;
use adb_wifi_lib::app::commands::{
    self, check_adb, clear_devices, connect, disconnect, disconnect_all, forget_device,
    known_devices, list_devices, reset_config, resolve_trace_id, restart_server, spawn_pair,
    spawn_quick_connect, DeviceChooser,
};
use adb_wifi_lib::app::config::{config_path, load_config, AppConfig, CONFIG_PATH_ENV};
use adb_wifi_lib::app::error::AppError;
use adb_wifi_lib::app::logging::init_logging;
use adb_wifi_lib::app::models::{CommandResponse, UsbDevice, DEFAULT_ADB_PORT};
use adb_wifi_lib::app::pairing::{PairingOutcome, PairingRequest};
use adb_wifi_lib::app::quick_connect::{DeviceChoice, QuickConnectOutcome};
use adb_wifi_lib::app::scheduler::TaskHandle;
use adb_wifi_lib::app::state::AppState;
use clap::{Args, Parser, Subcommand};
use inquire::Select;
use serde::Serialize;
use tracing::warn;

const EXIT_FAILURE: u8 = 1;
const EXIT_CANCELLED: u8 = 130;

/// Pair, connect and quick-connect Android devices over Wi-Fi with adb.
#[derive(Parser, Debug)]
#[command(name = "adb_wifi", version, about, long_about = None)]
struct Cli {
    /// Path to the adb executable (overrides the config file).
    #[arg(long, global = true, value_name = "PATH")]
    adb: Option<String>,

    /// Config file to use instead of ~/.adb_wifi_config.json.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that adb is installed and report its version.
    Check,
    /// List devices attached to adb.
    Devices,
    /// List remembered wireless devices.
    Known,
    /// Pair with a device using the code shown under Wireless debugging.
    Pair(PairArgs),
    /// Connect to a device over Wi-Fi.
    Connect {
        /// Device address, optionally with a port (ip[:port]).
        endpoint: String,
    },
    /// Disconnect one device, or all of them with --all.
    Disconnect {
        /// Device address, optionally with a port (ip[:port]).
        endpoint: Option<String>,
        #[arg(long, conflicts_with = "endpoint")]
        all: bool,
    },
    /// Switch a USB-attached device to Wi-Fi and connect to it.
    QuickConnect {
        /// USB serial to use; it must match an attached device.
        #[arg(long)]
        serial: Option<String>,
        /// TCP port for adb tcpip.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Remove a remembered device.
    Forget { address: String },
    /// Remove every remembered device.
    Clear,
    /// Restart the adb server.
    RestartServer,
    /// Write a troubleshooting bundle.
    Diagnostics {
        /// Output directory (defaults to the system temp dir).
        #[arg(long, value_name = "DIR")]
        out: Option<String>,
    },
    /// Show or initialise the config file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug)]
struct PairArgs {
    address: String,
    pairing_port: String,
    code: String,
    /// Port for the follow-up connect check. Android 11+ picks a random
    /// connect port, so without this (or a remembered port) the check is skipped.
    #[arg(long)]
    connect_port: Option<u16>,
    /// Name to remember the device by.
    #[arg(long)]
    name: Option<String>,
    /// Skip the connect check after pairing.
    #[arg(long)]
    no_verify: bool,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration.
    Show,
    /// Write a config file with default values.
    Init,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Some(path) = &cli.config {
        std::env::set_var(CONFIG_PATH_ENV, path);
    }

    let trace_id = resolve_trace_id(None);
    let loaded = load_config(&trace_id);
    let mut config = loaded.as_ref().cloned().unwrap_or_default();
    if let Some(adb) = &cli.adb {
        config.adb.command_path = adb.clone();
    }
    let mut logging = config.logging.clone();
    logging.json |= cli.log_json;
    init_logging(&logging);

    let config_optional = matches!(
        cli.command,
        Commands::Diagnostics { .. } | Commands::Config { action: ConfigAction::Init }
    );
    if let Err(err) = &loaded {
        if !config_optional {
            report_error(cli.json, err);
            return ExitCode::from(EXIT_FAILURE);
        }
        warn!(trace_id = %trace_id, error = %err, "config unreadable; continuing with defaults");
    }

    let interrupts = InterruptRouter::new();
    let handler_router = interrupts.clone();
    let handler = move || {
        if handler_router.interrupt() {
            std::process::exit(i32::from(EXIT_CANCELLED));
        }
    };
    if let Err(err) = ctrlc::set_handler(handler) {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }

    match run(&cli, config, loaded.is_ok(), &interrupts, trace_id) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            report_error(cli.json, &err);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn run(
    cli: &Cli,
    config: AppConfig,
    config_loaded: bool,
    interrupts: &InterruptRouter,
    trace_id: String,
) -> Result<u8, AppError> {
    let json = cli.json;
    let trace = Some(trace_id.clone());
    match &cli.command {
        Commands::Check => {
            let response = check_adb(&config, None, trace)?;
            let available = response.data.available;
            emit(json, &response, |info| match &info.version {
                Some(version) => println!("adb {version} at {}", info.command_path),
                None if info.available => println!("adb at {}", info.command_path),
                None => println!(
                    "adb is not available: {}",
                    info.error.as_deref().unwrap_or("unknown error")
                ),
            });
            return Ok(if available { 0 } else { EXIT_FAILURE });
        }
        Commands::Diagnostics { out } => {
            let state = AppState::initialize(config.clone(), &trace_id)
                .map_err(|err| warn!(trace_id = %trace_id, error = %err, "diagnostics without adb"))
                .ok();
            let config = config_loaded.then_some(&config);
            let response =
                commands::export_diagnostics_bundle(state.as_ref(), config, out.clone(), trace)?;
            emit(json, &response, |_| {});
            return Ok(0);
        }
        Commands::Config { action } => {
            let response = match action {
                ConfigAction::Show => CommandResponse {
                    trace_id,
                    message: format!("Config file: {}", config_path().display()),
                    data: config,
                },
                ConfigAction::Init => reset_config(trace)?,
            };
            emit(json, &response, |config| {
                if let Ok(text) = serde_json::to_string_pretty(config) {
                    println!("{text}");
                }
            });
            return Ok(0);
        }
        _ => {}
    }

    let state = AppState::initialize(config, &trace_id)?;
    match &cli.command {
        Commands::Devices => {
            let response = list_devices(&state, trace)?;
            emit(json, &response, |devices| {
                for device in devices {
                    println!("{:<28} {:<14} {}", device.serial, device.state, device.display_name());
                }
            });
        }
        Commands::Known => {
            let response = known_devices(&state, trace)?;
            emit(json, &response, |devices| {
                for device in devices {
                    let seen = device
                        .last_seen
                        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{:<24} {:<22} {}", device.name, device.endpoint(), seen);
                }
            });
        }
        Commands::Pair(args) => {
            let request = PairingRequest {
                address: args.address.clone(),
                pairing_port: args.pairing_port.clone(),
                code: args.code.clone(),
                connect_port: args.connect_port,
                name: args.name.clone(),
                verify_connect: !args.no_verify,
            };
            let handle = spawn_pair(&state, request, trace);
            let response = wait_for(handle, interrupts, &trace_id)?;
            let cancelled = matches!(response.data, PairingOutcome::Cancelled);
            emit(json, &response, |_| {});
            if cancelled {
                return Ok(EXIT_CANCELLED);
            }
        }
        Commands::Connect { endpoint } => {
            let (address, port) = split_endpoint(endpoint, &trace_id)?;
            let response = connect(&state, &address, port, trace)?;
            emit(json, &response, |_| {});
        }
        Commands::Disconnect { endpoint, all } => {
            let response = match (endpoint, all) {
                (_, true) => disconnect_all(&state, trace)?,
                (Some(endpoint), false) => {
                    let (address, port) = split_endpoint(endpoint, &trace_id)?;
                    disconnect(&state, &address, port, trace)?
                }
                (None, false) => {
                    return Err(AppError::validation(
                        "give an address to disconnect, or --all",
                        &trace_id,
                    ))
                }
            };
            emit(json, &response, |_| {});
        }
        Commands::QuickConnect { serial, port } => {
            let chooser: DeviceChooser = Box::new(prompt_for_device);
            let handle = spawn_quick_connect(&state, *port, serial.clone(), chooser, trace);
            let response = wait_for(handle, interrupts, &trace_id)?;
            let code = match response.data {
                QuickConnectOutcome::Verified { .. } => 0,
                QuickConnectOutcome::ConnectedUnverified { .. } => 0,
                QuickConnectOutcome::Cancelled => EXIT_CANCELLED,
            };
            emit(json, &response, |_| {});
            return Ok(code);
        }
        Commands::Forget { address } => {
            let response = forget_device(&state, address, trace)?;
            emit(json, &response, |_| {});
        }
        Commands::Clear => {
            let response = clear_devices(&state, trace)?;
            emit(json, &response, |_| {});
        }
        Commands::RestartServer => {
            let response = restart_server(&state, trace)?;
            emit(json, &response, |_| {});
        }
        Commands::Check | Commands::Diagnostics { .. } | Commands::Config { .. } => {}
    }
    Ok(0)
}

/// Waits for a background flow, forwarding Ctrl+C to its token. Outside of
/// this wait Ctrl+C exits the process with 130.
fn wait_for<T>(
    handle: TaskHandle<Result<T, AppError>>,
    interrupts: &InterruptRouter,
    trace_id: &str,
) -> Result<T, AppError> {
    let _flow = interrupts.enter_flow();
    let mut forwarded = false;
    while !handle.is_finished() {
        if interrupts.token().is_cancelled() && !forwarded {
            warn!(trace_id = %trace_id, task = %handle.name(), "cancelling");
            handle.cancel();
            forwarded = true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    handle.join(trace_id)?
}

fn split_endpoint(value: &str, trace_id: &str) -> Result<(String, Option<u16>), AppError> {
    let has_port = value.trim().contains(':');
    let (address, port) = parse_endpoint(value, DEFAULT_ADB_PORT)
        .map_err(|message| AppError::validation(message, trace_id))?;
    Ok((address, has_port.then_some(port)))
}

fn prompt_for_device(candidates: &[UsbDevice]) -> DeviceChoice {
    let labels: Vec<String> = candidates
        .iter()
        .map(|device| format!("{}  {}", device.serial, device.display_name()))
        .collect();
    match Select::new("Select a USB device:", labels.clone()).prompt() {
        Ok(choice) => labels
            .iter()
            .position(|label| *label == choice)
            .and_then(|index| candidates.get(index))
            .map(|device| DeviceChoice::Serial(device.serial.clone()))
            .unwrap_or(DeviceChoice::Cancel),
        Err(err) => {
            warn!(error = %err, "device selection aborted");
            DeviceChoice::Cancel
        }
    }
}

fn emit<T: Serialize>(json: bool, response: &CommandResponse<T>, details: impl FnOnce(&T)) {
    if json {
        match serde_json::to_string_pretty(response) {
            Ok(text) => println!("{text}"),
            Err(err) => eprintln!("error: failed to encode response: {err}"),
        }
        return;
    }
    if !response.message.is_empty() {
        println!("{}", response.message);
    }
    details(&response.data);
}

fn report_error(json: bool, err: &AppError) {
    if json {
        if let Ok(text) = serde_json::to_string_pretty(err) {
            println!("{text}");
            return;
        }
    }
    eprintln!("error: {err}");
    if let Some(detail) = err.detail.as_deref().filter(|detail| !detail.trim().is_empty()) {
        eprintln!("adb output:");
        for line in detail.lines() {
            eprintln!("  {line}");
        }
    }
    eprintln!("trace id: {}", err.trace_id);
}
