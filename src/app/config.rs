use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;
use crate::app::models::DEFAULT_ADB_PORT;

pub const CONFIG_PATH_ENV: &str = "ADB_WIFI_CONFIG_PATH";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AdbSettings {
    /// Empty means "discover adb at startup".
    pub command_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutSettings {
    pub version_secs: u64,
    pub devices_secs: u64,
    pub pair_secs: u64,
    pub connect_secs: u64,
    pub disconnect_secs: u64,
    pub disconnect_all_secs: u64,
    pub get_state_secs: u64,
    pub tcpip_secs: u64,
    pub shell_secs: u64,
    pub kill_server_secs: u64,
    pub start_server_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            version_secs: 10,
            devices_secs: 10,
            pair_secs: 30,
            connect_secs: 20,
            disconnect_secs: 10,
            disconnect_all_secs: 15,
            get_state_secs: 3,
            tcpip_secs: 10,
            shell_secs: 10,
            kill_server_secs: 10,
            start_server_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuickConnectSettings {
    pub tcpip_port: u16,
    pub poll_interval_ms: u64,
    pub verify_timeout_secs: u64,
    pub reverify_timeout_secs: u64,
    pub post_tcpip_delay_ms: u64,
}

impl Default for QuickConnectSettings {
    fn default() -> Self {
        Self {
            tcpip_port: DEFAULT_ADB_PORT,
            poll_interval_ms: 400,
            verify_timeout_secs: 15,
            reverify_timeout_secs: 8,
            post_tcpip_delay_ms: 1000,
        }
    }
}

impl QuickConnectSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn reverify_timeout(&self) -> Duration {
        Duration::from_secs(self.reverify_timeout_secs)
    }

    pub fn post_tcpip_delay(&self) -> Duration {
        Duration::from_millis(self.post_tcpip_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistrySettings {
    pub max_devices: usize,
    /// Empty means `~/.adb_wifi_devices.json`.
    pub path: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_devices: 10,
            path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonSettings {
    pub restart_delay_ms: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            restart_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerSettings {
    pub max_parallel_tasks: usize,
    pub serialize_per_address: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 4,
            serialize_per_address: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub quick_connect: QuickConnectSettings,
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            adb: AdbSettings::default(),
            timeouts: TimeoutSettings::default(),
            quick_connect: QuickConnectSettings::default(),
            registry: RegistrySettings::default(),
            daemon: DaemonSettings::default(),
            logging: LoggingSettings::default(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn registry_path(&self) -> PathBuf {
        let configured = self.registry.path.trim();
        if !configured.is_empty() {
            return PathBuf::from(configured);
        }
        home_dir().join(".adb_wifi_devices.json")
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    home_dir().join(".adb_wifi_config.json")
}

pub fn backup_config_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "config".to_string());
    path.with_file_name(format!("{stem}.backup.json"))
}

pub fn load_config(trace_id: &str) -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path(), trace_id)
}

pub fn save_config(config: &AppConfig, trace_id: &str) -> Result<(), AppError> {
    let path = config_path();
    save_config_to_path(config, &path, &backup_config_path(&path), trace_id)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::validation(format!("Failed to parse config: {err}"), trace_id))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
    trace_id: &str,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(&validate_config(config.clone()))
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), trace_id))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), trace_id))?;
    Ok(())
}

fn validate_config(mut config: AppConfig) -> AppConfig {
    let defaults = TimeoutSettings::default();
    let timeouts = &mut config.timeouts;
    for (value, fallback) in [
        (&mut timeouts.version_secs, defaults.version_secs),
        (&mut timeouts.devices_secs, defaults.devices_secs),
        (&mut timeouts.pair_secs, defaults.pair_secs),
        (&mut timeouts.connect_secs, defaults.connect_secs),
        (&mut timeouts.disconnect_secs, defaults.disconnect_secs),
        (&mut timeouts.disconnect_all_secs, defaults.disconnect_all_secs),
        (&mut timeouts.get_state_secs, defaults.get_state_secs),
        (&mut timeouts.tcpip_secs, defaults.tcpip_secs),
        (&mut timeouts.shell_secs, defaults.shell_secs),
        (&mut timeouts.kill_server_secs, defaults.kill_server_secs),
        (&mut timeouts.start_server_secs, defaults.start_server_secs),
    ] {
        if *value == 0 {
            *value = fallback;
        }
    }

    let quick = QuickConnectSettings::default();
    if config.quick_connect.tcpip_port == 0 {
        config.quick_connect.tcpip_port = quick.tcpip_port;
    }
    if config.quick_connect.poll_interval_ms < 50 {
        config.quick_connect.poll_interval_ms = quick.poll_interval_ms;
    }
    if config.quick_connect.verify_timeout_secs == 0 {
        config.quick_connect.verify_timeout_secs = quick.verify_timeout_secs;
    }
    if config.quick_connect.reverify_timeout_secs == 0 {
        config.quick_connect.reverify_timeout_secs = quick.reverify_timeout_secs;
    }
    if config.registry.max_devices == 0 {
        config.registry.max_devices = RegistrySettings::default().max_devices;
    }
    if config.scheduler.max_parallel_tasks == 0 {
        config.scheduler.max_parallel_tasks = SchedulerSettings::default().max_parallel_tasks;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().expect("tmp");
        let config = load_config_from_path(&dir.path().join("absent.json"), "trace-cfg-1")
            .expect("config");
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.quick_connect.tcpip_port, 5555);
        assert_eq!(config.registry.max_devices, 10);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_sections() {
        let dir = TempDir::new().expect("tmp");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            serde_json::json!({
                "adb": { "command_path": "/opt/platform-tools/adb" },
                "timeouts": { "pair_secs": 45 }
            })
            .to_string(),
        )
        .expect("write");

        let config = load_config_from_path(&path, "trace-cfg-2").expect("config");
        assert_eq!(config.adb.command_path, "/opt/platform-tools/adb");
        assert_eq!(config.timeouts.pair_secs, 45);
        assert_eq!(config.timeouts.connect_secs, 20);
        assert_eq!(config.quick_connect, QuickConnectSettings::default());
    }

    #[test]
    fn stale_version_key_is_ignored() {
        let dir = TempDir::new().expect("tmp");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "version": "0.0.1", "timeouts": { "pair_secs": 30 } }"#)
            .expect("write");

        let config = load_config_from_path(&path, "trace-cfg-6").expect("config");
        assert_eq!(config.timeouts.pair_secs, 30);
        assert!(!serde_json::to_string(&config).expect("json").contains("\"version\""));
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = AppConfig::default();
        config.timeouts.connect_secs = 0;
        config.quick_connect.poll_interval_ms = 0;
        config.quick_connect.tcpip_port = 0;
        config.registry.max_devices = 0;
        let validated = validate_config(config);
        assert_eq!(validated.timeouts.connect_secs, 20);
        assert_eq!(validated.quick_connect.poll_interval_ms, 400);
        assert_eq!(validated.quick_connect.tcpip_port, 5555);
        assert_eq!(validated.registry.max_devices, 10);
    }

    #[test]
    fn save_keeps_backup_of_previous_file() {
        let dir = TempDir::new().expect("tmp");
        let path = dir.path().join("config.json");
        let backup = backup_config_path(&path);

        let mut config = AppConfig::default();
        save_config_to_path(&config, &path, &backup, "trace-cfg-3").expect("save 1");
        config.registry.max_devices = 3;
        save_config_to_path(&config, &path, &backup, "trace-cfg-3").expect("save 2");

        let current = load_config_from_path(&path, "trace-cfg-3").expect("current");
        let previous = load_config_from_path(&backup, "trace-cfg-3").expect("backup");
        assert_eq!(current.registry.max_devices, 3);
        assert_eq!(previous.registry.max_devices, 10);
        assert_eq!(backup.file_name().and_then(|n| n.to_str()), Some("config.backup.json"));
    }

    #[test]
    fn unparseable_config_is_a_validation_error() {
        let dir = TempDir::new().expect("tmp");
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").expect("write");
        let err = load_config_from_path(&path, "trace-cfg-4").expect_err("bad config");
        assert_eq!(err.code, "ERR_VALIDATION");
        assert_eq!(err.trace_id, "trace-cfg-4");
    }
}
