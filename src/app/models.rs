use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ADB_PORT: u16 = 5555;
pub const DEFAULT_DEVICE_NAME: &str = "Android Device";

/// A wireless target known to the registry. Identified by `address`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

fn default_port() -> u16 {
    DEFAULT_ADB_PORT
}

impl Device {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            last_seen: None,
        }
    }

    pub fn seen_now(mut self) -> Self {
        self.last_seen = Some(Utc::now());
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// One line of `adb devices -l`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    pub serial: String,
    pub state: String,
    pub model: Option<String>,
    pub product: Option<String>,
    pub device: Option<String>,
    pub transport_id: Option<String>,
}

impl UsbDevice {
    pub fn is_eligible(&self) -> bool {
        self.state == "device"
    }

    pub fn display_name(&self) -> String {
        [&self.model, &self.product, &self.device]
            .into_iter()
            .flatten()
            .map(|label| label.replace('_', " "))
            .find(|label| !label.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string())
    }
}

/// Outcome of one adb process invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process never completed normally.
    pub exit_code: i32,
    pub timed_out: bool,
    #[serde(default)]
    pub cancelled: bool,
    pub command_line: String,
}

pub const EXIT_CODE_ABNORMAL: i32 = -1;

impl CommandResult {
    pub fn completed(command_line: String, exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            success: exit_code == 0,
            stdout,
            stderr,
            exit_code,
            timed_out: false,
            cancelled: false,
            command_line,
        }
    }

    pub fn spawn_failure(command_line: String, message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: message.into(),
            exit_code: EXIT_CODE_ABNORMAL,
            timed_out: false,
            cancelled: false,
            command_line,
        }
    }

    pub fn timed_out(command_line: String, stdout: String, stderr: String) -> Self {
        Self {
            success: false,
            stdout,
            stderr,
            exit_code: EXIT_CODE_ABNORMAL,
            timed_out: true,
            cancelled: false,
            command_line,
        }
    }

    pub fn cancelled(command_line: String, stdout: String, stderr: String) -> Self {
        Self {
            success: false,
            stdout,
            stderr,
            exit_code: EXIT_CODE_ABNORMAL,
            timed_out: false,
            cancelled: true,
            command_line,
        }
    }

    pub fn combined_output(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }

    /// Short, single-line summary of what the tool printed.
    pub fn detail_line(&self) -> String {
        let combined = self.combined_output();
        combined
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .unwrap_or_default()
            .to_string()
    }
}

/// Advisory classification of a failed adb call. Does not drive control flow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Authentication,
    ConnectionRefused,
    Timeout,
    NetworkUnreachable,
    InvalidPort,
    AlreadyPaired,
    Unknown,
}

impl FailureCause {
    pub fn summary(self) -> &'static str {
        match self {
            FailureCause::Authentication => {
                "Pairing code rejected. Check the 6-digit code shown on the device."
            }
            FailureCause::ConnectionRefused => {
                "Connection refused. Make sure Wireless debugging is enabled and the port is current."
            }
            FailureCause::Timeout => {
                "The device did not answer in time. Check the network and any firewall."
            }
            FailureCause::NetworkUnreachable => {
                "Device unreachable. Host and device must be on the same network."
            }
            FailureCause::InvalidPort => "Invalid port. Re-read the port from the device screen.",
            FailureCause::AlreadyPaired => "The device is already paired with this host.",
            FailureCause::Unknown => "adb reported an unrecognized failure.",
        }
    }
}

/// How much the pair classifier trusts a reported success.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PairConfidence {
    Confirmed,
    LowConfidence,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdbInfo {
    pub available: bool,
    pub version_output: String,
    pub version: Option<String>,
    pub command_path: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResponse<T> {
    pub trace_id: String,
    pub message: String,
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DisconnectOutcome {
    Disconnected { endpoint: String },
    /// adb had no such connection. Informational.
    NotConnected { endpoint: String },
    All,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_display_name_prefers_model_then_product_then_device() {
        let mut usb = UsbDevice {
            serial: "ABC".to_string(),
            state: "device".to_string(),
            model: Some("Pixel_7".to_string()),
            product: Some("panther".to_string()),
            device: Some("panther_dev".to_string()),
            transport_id: None,
        };
        assert_eq!(usb.display_name(), "Pixel 7");
        usb.model = None;
        assert_eq!(usb.display_name(), "panther");
        usb.product = None;
        assert_eq!(usb.display_name(), "panther dev");
        usb.device = None;
        assert_eq!(usb.display_name(), DEFAULT_DEVICE_NAME);
    }

    #[test]
    fn timed_out_result_is_never_successful() {
        let result = CommandResult::timed_out("adb pair".to_string(), "partial".to_string(), String::new());
        assert!(result.timed_out);
        assert!(!result.success);
        assert_eq!(result.exit_code, EXIT_CODE_ABNORMAL);
    }

    #[test]
    fn detail_line_is_last_non_empty_line() {
        let result = CommandResult::completed(
            "adb connect".to_string(),
            1,
            "* daemon started\n".to_string(),
            "failed to connect to 10.0.0.2:5555\n\n".to_string(),
        );
        assert_eq!(result.detail_line(), "failed to connect to 10.0.0.2:5555");
    }

    #[test]
    fn device_deserializes_without_optional_fields() {
        let device: Device =
            serde_json::from_str(r#"{"name":"Pixel","address":"192.168.1.5"}"#).expect("device");
        assert_eq!(device.port, DEFAULT_ADB_PORT);
        assert!(device.last_seen.is_none());
        assert_eq!(device.endpoint(), "192.168.1.5:5555");
    }
}
