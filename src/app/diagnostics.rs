use crate::app::adb::client::AdbClient;
use crate::app::adb::parse::{parse_adb_devices, parse_adb_version};
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::models::{Device, UsbDevice};
use crate::app::registry::{DeviceStore, JsonFileStore};
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zip::write::FileOptions;

#[derive(Debug, Serialize)]
struct DiagnosticsManifest {
    app_version: &'static str,
    os: &'static str,
    arch: &'static str,
    timestamp_utc: String,
    trace_id: String,
    adb_path: Option<String>,
    adb_version: Option<String>,
}

#[derive(Debug, Serialize)]
struct DevicesPayload {
    parsed: Vec<UsbDevice>,
    exit_code: i32,
    error: Option<String>,
}

fn resolve_output_dir(output_dir: Option<&str>) -> PathBuf {
    output_dir
        .map(str::trim)
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("adb_wifi_diagnostics"))
}

fn short_trace(trace_id: &str) -> String {
    trace_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(8)
        .collect()
}

fn load_known_devices(config: Option<&AppConfig>, trace_id: &str) -> Vec<Device> {
    let Some(config) = config else {
        return Vec::new();
    };
    match JsonFileStore::new(config.registry_path()).load() {
        Ok(devices) => devices,
        Err(err) => {
            warn!(trace_id = %trace_id, error = %err.error, "Failed to read known devices for diagnostics");
            Vec::new()
        }
    }
}

/// Writes a support bundle. Every section is best effort: a missing adb or a
/// broken config still produces a bundle.
pub fn export_diagnostics_bundle(
    client: Option<&AdbClient>,
    config: Option<&AppConfig>,
    output_dir: Option<&str>,
    trace_id: &str,
) -> Result<PathBuf, AppError> {
    let resolved_dir = resolve_output_dir(output_dir);
    fs::create_dir_all(&resolved_dir).map_err(|err| {
        AppError::system(format!("Failed to create output dir: {err}"), trace_id)
    })?;

    let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let filename = format!("diagnostics_{}_{}.zip", timestamp, short_trace(trace_id));
    let bundle_path = resolved_dir.join(filename);

    let (version_output, devices_output, devices_payload) = match client {
        Some(client) => {
            let version = client.version(trace_id);
            let devices = client.list_devices(trace_id);
            let payload = DevicesPayload {
                parsed: parse_adb_devices(&devices.stdout),
                exit_code: devices.exit_code,
                error: (!devices.success).then(|| devices.detail_line()),
            };
            (version.combined_output(), devices.combined_output(), payload)
        }
        None => (
            String::new(),
            String::new(),
            DevicesPayload {
                parsed: Vec::new(),
                exit_code: -1,
                error: Some("adb not available".to_string()),
            },
        ),
    };

    let manifest = DiagnosticsManifest {
        app_version: env!("CARGO_PKG_VERSION"),
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        timestamp_utc: Utc::now().to_rfc3339(),
        trace_id: trace_id.to_string(),
        adb_path: client.map(|client| client.program().as_str().to_string()),
        adb_version: parse_adb_version(&version_output),
    };
    let known_devices = load_known_devices(config, trace_id);

    let mut entries: Vec<(&str, Vec<u8>)> = vec![
        ("manifest.json", to_json(&manifest, trace_id)?),
        ("adb_version.txt", version_output.into_bytes()),
        ("adb_devices.txt", devices_output.into_bytes()),
        ("adb_devices.json", to_json(&devices_payload, trace_id)?),
        ("known_devices.json", to_json(&known_devices, trace_id)?),
    ];
    if let Some(config) = config {
        entries.push(("config.json", to_json(config, trace_id)?));
    }

    write_bundle(&bundle_path, &entries, trace_id)?;
    info!(trace_id = %trace_id, path = %bundle_path.display(), "diagnostics bundle written");
    Ok(bundle_path)
}

fn to_json<T: Serialize + ?Sized>(value: &T, trace_id: &str) -> Result<Vec<u8>, AppError> {
    serde_json::to_vec_pretty(value).map_err(|err| {
        AppError::system(format!("Failed to serialize diagnostics payload: {err}"), trace_id)
    })
}

fn write_bundle(path: &Path, entries: &[(&str, Vec<u8>)], trace_id: &str) -> Result<(), AppError> {
    let file = fs::File::create(path)
        .map_err(|err| AppError::system(format!("Failed to create bundle: {err}"), trace_id))?;
    let mut zip = zip::ZipWriter::new(file);
    for (name, bytes) in entries {
        zip.start_file(*name, FileOptions::<()>::default())
            .map_err(|err| AppError::system(format!("Failed to write bundle: {err}"), trace_id))?;
        zip.write_all(bytes)
            .map_err(|err| AppError::system(format!("Failed to write bundle: {err}"), trace_id))?;
    }
    zip.finish()
        .map_err(|err| AppError::system(format!("Failed to finalize bundle: {err}"), trace_id))?;
    Ok(())
}
