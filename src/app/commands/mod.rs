use tracing::{info, warn};
use uuid::Uuid;

use crate::app::adb::classify::{diagnose_failure, is_connect_success, is_not_connected};
use crate::app::adb::client::AdbClient;
use crate::app::adb::locator::{normalize_command_path, AdbProgram};
use crate::app::adb::parse::{parse_adb_devices, parse_adb_version, validate_ipv4_address};
use crate::app::cancel::CancelToken;
use crate::app::config::{load_config, save_config, AppConfig};
use crate::app::diagnostics;
use crate::app::error::AppError;
use crate::app::models::{
    AdbInfo, CommandResponse, CommandResult, Device, DisconnectOutcome, FailureCause, UsbDevice,
    DEFAULT_ADB_PORT,
};
use crate::app::pairing::{PairingFlow, PairingOutcome, PairingRequest};
use crate::app::quick_connect::{DeviceChoice, QuickConnect, QuickConnectOutcome};
use crate::app::scheduler::TaskHandle;
use crate::app::state::AppState;


pub type DeviceChooser = Box<dyn FnMut(&[UsbDevice]) -> DeviceChoice + Send>;

pub fn resolve_trace_id(input: Option<String>) -> String {
    input
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn ensure_non_empty(value: &str, field: &str, trace_id: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::validation(
            format!("{field} is required"),
            trace_id,
        ));
    }
    Ok(())
}

fn respond<T>(trace_id: String, message: impl Into<String>, data: T) -> CommandResponse<T> {
    CommandResponse {
        trace_id,
        message: message.into(),
        data,
    }
}

/// Maps a failed adb call to an error carrying the classified cause and raw output.
fn command_failure(result: &CommandResult, action: &str, trace_id: &str) -> AppError {
    if result.timed_out {
        return AppError::timeout(
            format!("{action} timed out. {}", FailureCause::Timeout.summary()),
            trace_id,
        )
        .with_cause(FailureCause::Timeout)
        .with_detail(result.combined_output());
    }
    let cause = diagnose_failure(result);
    AppError::dependency(format!("{action} failed: {}", cause.summary()), trace_id)
        .with_cause(cause)
        .with_detail(result.combined_output())
}

fn validated_address(address: &str, trace_id: &str) -> Result<String, AppError> {
    ensure_non_empty(address, "address", trace_id)?;
    validate_ipv4_address(address.trim())
        .map(|ip| ip.to_string())
        .map_err(|message| AppError::validation(message, trace_id))
}

pub fn get_config(trace_id: Option<String>) -> Result<CommandResponse<AppConfig>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = load_config(&trace_id)?;
    Ok(respond(trace_id, "Current configuration", config))
}

pub fn reset_config(trace_id: Option<String>) -> Result<CommandResponse<AppConfig>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = AppConfig::default();
    save_config(&config, &trace_id)?;
    info!(trace_id = %trace_id, "configuration reset to defaults");
    Ok(respond(trace_id, "Configuration written with defaults", config))
}

/// Never fails because adb is missing; availability is part of the answer.
pub fn check_adb(
    config: &AppConfig,
    command_path: Option<String>,
    trace_id: Option<String>,
) -> Result<CommandResponse<AdbInfo>, AppError> {
    check_adb_inner(config, command_path, trace_id, |program, trace_id| {
        AdbClient::new(program, config).version(trace_id)
    })
}

fn check_adb_inner(
    config: &AppConfig,
    command_path: Option<String>,
    trace_id: Option<String>,
    run_version: impl FnOnce(AdbProgram, &str) -> CommandResult,
) -> Result<CommandResponse<AdbInfo>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "check_adb");

    let requested = command_path
        .as_deref()
        .map(normalize_command_path)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| config.adb.command_path.clone());

    let unavailable = |command_path: String, message: String| AdbInfo {
        available: false,
        version_output: String::new(),
        version: None,
        command_path,
        error: Some(message),
    };

    let program = match AdbProgram::resolve(&requested, &trace_id) {
        Ok(program) => program,
        Err(err) => {
            warn!(trace_id = %trace_id, error = %err.error, "adb not found");
            let data = unavailable(requested, err.error);
            return Ok(respond(trace_id, "adb is not available", data));
        }
    };

    let command_path = program.as_str().to_string();
    let result = run_version(program, &trace_id);
    let version_output = result.combined_output();
    let data = if result.success {
        AdbInfo {
            available: true,
            version: parse_adb_version(&result.stdout),
            version_output,
            command_path,
            error: None,
        }
    } else {
        AdbInfo {
            available: false,
            version: None,
            error: Some(result.detail_line()),
            version_output,
            command_path,
        }
    };
    let message = if data.available {
        "adb is available"
    } else {
        "adb did not answer"
    };
    Ok(respond(trace_id, message, data))
}

/// Every transport adb reports, USB and network alike.
pub fn list_devices(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<UsbDevice>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let result = state.client.list_devices(&trace_id);
    if !result.success {
        return Err(command_failure(&result, "adb devices", &trace_id));
    }
    let devices = parse_adb_devices(&result.stdout);
    let message = format!("{} device(s) attached", devices.len());
    Ok(respond(trace_id, message, devices))
}

pub fn known_devices(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<Device>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let devices = state.registry.list();
    let message = format!("{} known device(s)", devices.len());
    Ok(respond(trace_id, message, devices))
}

/// Runs one pairing attempt. A rejected or timed-out attempt is an error
/// carrying the raw adb output; cancellation is a normal outcome.
pub fn pair(
    state: &AppState,
    request: PairingRequest,
    cancel: &CancelToken,
    trace_id: Option<String>,
) -> Result<CommandResponse<PairingOutcome>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, address = %request.address, "pair");

    let address = request.address.trim().to_string();
    let outcome = state.scheduler.with_address(&address, || {
        PairingFlow::new(&state.client, &state.registry).run(&request, cancel, &trace_id)
    })?;

    match outcome {
        PairingOutcome::Failed {
            cause,
            message,
            raw_output,
            ..
        } => Err(AppError::dependency(message, &trace_id)
            .with_cause(cause)
            .with_detail(raw_output)),
        PairingOutcome::TimedOut { raw_output, .. } => Err(AppError::timeout(
            format!("Pairing timed out. {}", FailureCause::Timeout.summary()),
            &trace_id,
        )
        .with_cause(FailureCause::Timeout)
        .with_detail(raw_output)),
        PairingOutcome::Done {
            ref device,
            connected,
            ..
        } => {
            let message = match connected {
                Some(false) => format!(
                    "Paired with {} but could not connect to {}",
                    device.address,
                    device.endpoint()
                ),
                Some(true) => format!("Paired and connected to {}", device.endpoint()),
                None => format!("Paired with {}", device.address),
            };
            Ok(respond(trace_id, message, outcome))
        }
        PairingOutcome::Cancelled => Ok(respond(trace_id, "Pairing cancelled", outcome)),
    }
}

pub fn spawn_pair(
    state: &AppState,
    request: PairingRequest,
    trace_id: Option<String>,
) -> TaskHandle<Result<CommandResponse<PairingOutcome>, AppError>> {
    let trace_id = resolve_trace_id(trace_id);
    let task_state = state.clone();
    let task_trace = trace_id.clone();
    state.scheduler.spawn("pair", &trace_id, move |cancel| {
        pair(&task_state, request, &cancel, Some(task_trace))
    })
}

/// Connects to `address`, using the stored port when none is given, and
/// refreshes the registry entry on success.
pub fn connect(
    state: &AppState,
    address: &str,
    port: Option<u16>,
    trace_id: Option<String>,
) -> Result<CommandResponse<Device>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let address = validated_address(address, &trace_id)?;
    let known = state.registry.get(&address);
    let port = port
        .or_else(|| known.as_ref().map(|device| device.port))
        .unwrap_or(DEFAULT_ADB_PORT);
    if port == 0 {
        return Err(AppError::validation("port must be between 1 and 65535", &trace_id));
    }

    let result = state.scheduler.with_address(&address, || {
        state
            .client
            .connect(&address, port, &CancelToken::new(), &trace_id)
    });
    if !is_connect_success(&result) {
        return Err(command_failure(&result, &format!("Connect to {address}:{port}"), &trace_id));
    }

    let name = known
        .map(|device| device.name)
        .unwrap_or_else(|| address.clone());
    let device = Device::new(name, address, port).seen_now();
    state.registry.upsert(device.clone(), &trace_id)?;
    let message = format!("Connected to {}", device.endpoint());
    Ok(respond(trace_id, message, device))
}

/// Disconnecting an address adb does not know is reported as success.
pub fn disconnect(
    state: &AppState,
    address: &str,
    port: Option<u16>,
    trace_id: Option<String>,
) -> Result<CommandResponse<DisconnectOutcome>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let address = validated_address(address, &trace_id)?;
    let port = port
        .or_else(|| state.registry.get(&address).map(|device| device.port))
        .unwrap_or(DEFAULT_ADB_PORT);
    let endpoint = format!("{address}:{port}");

    let result = state
        .scheduler
        .with_address(&address, || state.client.disconnect(&address, port, &trace_id));
    if result.success {
        let message = format!("Disconnected {endpoint}");
        return Ok(respond(trace_id, message, DisconnectOutcome::Disconnected { endpoint }));
    }
    if is_not_connected(&result) {
        info!(trace_id = %trace_id, endpoint = %endpoint, "disconnect: not connected");
        let message = format!("{endpoint} was not connected");
        return Ok(respond(trace_id, message, DisconnectOutcome::NotConnected { endpoint }));
    }
    Err(command_failure(&result, &format!("Disconnect {endpoint}"), &trace_id))
}

pub fn disconnect_all(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<DisconnectOutcome>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let result = state.client.disconnect_all(&trace_id);
    if !result.success {
        return Err(command_failure(&result, "Disconnect all", &trace_id));
    }
    Ok(respond(trace_id, "Disconnected everything", DisconnectOutcome::All))
}

/// `serial` pins the USB device; otherwise a lone device is picked and
/// `choose` settles between several.
pub fn quick_connect_usb(
    state: &AppState,
    port: Option<u16>,
    serial: Option<String>,
    choose: &mut dyn FnMut(&[UsbDevice]) -> DeviceChoice,
    cancel: &CancelToken,
    trace_id: Option<String>,
) -> Result<CommandResponse<QuickConnectOutcome>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "quick_connect_usb");

    let mut settings = state.config.quick_connect.clone();
    if let Some(port) = port {
        if port == 0 {
            return Err(AppError::validation("port must be between 1 and 65535", &trace_id));
        }
        settings.tcpip_port = port;
    }

    let outcome =
        QuickConnect::new(&state.client, &state.registry, settings)
        .with_serial(serial)
        .run(choose, cancel, &trace_id)?;
    let message = match &outcome {
        QuickConnectOutcome::Verified { device, .. } => {
            format!("Connected to {} ({})", device.endpoint(), device.name)
        }
        QuickConnectOutcome::ConnectedUnverified {
            device, last_state, ..
        } => {
            let state_label = if last_state.is_empty() { "unknown" } else { last_state.as_str() };
            format!(
                "Connected to {} but the device never reported online (last state: {state_label})",
                device.endpoint()
            )
        }
        QuickConnectOutcome::Cancelled => "Quick connect cancelled".to_string(),
    };
    Ok(respond(trace_id, message, outcome))
}

pub fn spawn_quick_connect(
    state: &AppState,
    port: Option<u16>,
    serial: Option<String>,
    mut choose: DeviceChooser,
    trace_id: Option<String>,
) -> TaskHandle<Result<CommandResponse<QuickConnectOutcome>, AppError>> {
    let trace_id = resolve_trace_id(trace_id);
    let task_state = state.clone();
    let task_trace = trace_id.clone();
    state.scheduler.spawn("quick-connect", &trace_id, move |cancel| {
        quick_connect_usb(&task_state, port, serial, &mut *choose, &cancel, Some(task_trace))
    })
}

/// `kill-server` then `start-server`. A failed kill is expected when no
/// server was running.
pub fn restart_server(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<()>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let killed = state.client.kill_server(&trace_id);
    if !killed.success {
        warn!(trace_id = %trace_id, detail = %killed.detail_line(), "adb kill-server failed");
    }
    let started = state.client.start_server(&CancelToken::new(), &trace_id);
    if !started.success {
        return Err(command_failure(&started, "adb start-server", &trace_id));
    }
    Ok(respond(trace_id, "adb server restarted", ()))
}

pub fn forget_device(
    state: &AppState,
    address: &str,
    trace_id: Option<String>,
) -> Result<CommandResponse<bool>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(address, "address", &trace_id)?;
    let address = address.trim();
    let removed = state.registry.remove(address, &trace_id)?;
    let message = if removed {
        format!("Forgot {address}")
    } else {
        format!("{address} was not a known device")
    };
    Ok(respond(trace_id, message, removed))
}

pub fn clear_devices(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<usize>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let count = state.registry.list().len();
    state.registry.clear(&trace_id)?;
    Ok(respond(trace_id, format!("Removed {count} known device(s)"), count))
}

/// Best effort: works without a resolved adb or a readable config.
pub fn export_diagnostics_bundle(
    state: Option<&AppState>,
    config: Option<&AppConfig>,
    output_dir: Option<String>,
    trace_id: Option<String>,
) -> Result<CommandResponse<String>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "export_diagnostics_bundle");

    let client = state.map(|state| state.client.as_ref());
    let config = config.or_else(|| state.map(|state| state.config.as_ref()));
    let bundle_path =
        diagnostics::export_diagnostics_bundle(client, config, output_dir.as_deref(), &trace_id)?;
    let path = bundle_path.to_string_lossy().to_string();
    Ok(respond(trace_id, format!("Diagnostics written to {path}"), path))
}
