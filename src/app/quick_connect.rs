use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::app::adb::classify::{diagnose_failure, is_connect_success, is_tcpip_success};
use crate::app::adb::client::AdbClient;
use crate::app::adb::parse::{
    eligible_usb_devices, is_online_state, parse_adb_devices, parse_device_ip, parse_device_state,
};
use crate::app::cancel::CancelToken;
use crate::app::config::QuickConnectSettings;
use crate::app::error::AppError;
use crate::app::models::{Device, UsbDevice};
use crate::app::registry::DeviceRegistry;

/// Shell queries tried in order until one yields a usable IPv4 address.
pub const IP_QUERIES: [&[&str]; 5] = [
    &["ip", "-f", "inet", "addr", "show", "wlan0"],
    &["ip", "addr", "show", "wlan0"],
    &["ifconfig", "wlan0"],
    &["ip", "route"],
    &["getprop", "dhcp.wlan0.ipaddress"],
];

/// The caller's answer when more than one USB device is eligible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceChoice {
    Serial(String),
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum QuickConnectOutcome {
    /// `get-state` reported `device`.
    Verified { serial: String, device: Device },
    /// Connected and saved, but `get-state` never reported `device`.
    ConnectedUnverified {
        serial: String,
        device: Device,
        last_state: String,
    },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PollResult {
    Online,
    Deadline(String),
    Cancelled,
}

pub struct QuickConnect<'a> {
    client: &'a AdbClient,
    registry: &'a DeviceRegistry,
    settings: QuickConnectSettings,
    serial: Option<String>,
}

impl<'a> QuickConnect<'a> {
    pub fn new(
        client: &'a AdbClient,
        registry: &'a DeviceRegistry,
        settings: QuickConnectSettings,
    ) -> Self {
        Self {
            client,
            registry,
            settings,
            serial: None,
        }
    }

    /// Restricts the flow to one USB serial; the chooser is then never asked.
    pub fn with_serial(mut self, serial: Option<String>) -> Self {
        self.serial = serial
            .map(|serial| serial.trim().to_string())
            .filter(|serial| !serial.is_empty());
        self
    }

    pub fn run(
        &self,
        choose: &mut dyn FnMut(&[UsbDevice]) -> DeviceChoice,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<QuickConnectOutcome, AppError> {
        macro_rules! bail_if_cancelled {
            () => {
                if cancel.is_cancelled() {
                    info!(trace_id = %trace_id, "quick connect cancelled");
                    return Ok(QuickConnectOutcome::Cancelled);
                }
            };
        }

        bail_if_cancelled!();
        let candidates = self.discover(trace_id)?;

        bail_if_cancelled!();
        let Some(usb) = self.select(candidates, choose, trace_id)? else {
            return Ok(QuickConnectOutcome::Cancelled);
        };

        bail_if_cancelled!();
        let Some(ip) = self.resolve_ip(&usb.serial, cancel, trace_id)? else {
            return Ok(QuickConnectOutcome::Cancelled);
        };
        let address = ip.to_string();
        let port = self.settings.tcpip_port;

        bail_if_cancelled!();
        let tcpip = self.client.tcpip(&usb.serial, port, cancel, trace_id);
        if tcpip.cancelled {
            return Ok(QuickConnectOutcome::Cancelled);
        }
        if !is_tcpip_success(&tcpip) {
            let cause = diagnose_failure(&tcpip);
            return Err(AppError::dependency(
                format!("Failed to enable TCP/IP mode on {}: {}", usb.serial, tcpip.detail_line()),
                trace_id,
            )
            .with_cause(cause)
            .with_detail(tcpip.combined_output()));
        }
        if !cancel.sleep(self.settings.post_tcpip_delay()) {
            return Ok(QuickConnectOutcome::Cancelled);
        }

        let connect = self.client.connect(&address, port, cancel, trace_id);
        if connect.cancelled {
            return Ok(QuickConnectOutcome::Cancelled);
        }
        if !is_connect_success(&connect) {
            let cause = diagnose_failure(&connect);
            return Err(AppError::dependency(
                format!("Failed to connect to {address}:{port}: {}", cause.summary()),
                trace_id,
            )
            .with_cause(cause)
            .with_detail(connect.combined_output()));
        }

        // Saved before verification: a connected-but-unverified device is still useful.
        let device = Device::new(usb.display_name(), address.clone(), port).seen_now();
        self.registry.upsert(device.clone(), trace_id)?;
        info!(trace_id = %trace_id, endpoint = %device.endpoint(), "device saved");

        let endpoint = device.endpoint();
        let last_state = match self.poll_online(&endpoint, self.settings.verify_timeout(), cancel, trace_id) {
            PollResult::Online => return Ok(QuickConnectOutcome::Verified { serial: usb.serial, device }),
            PollResult::Cancelled => return Ok(QuickConnectOutcome::Cancelled),
            PollResult::Deadline(last_state) => last_state,
        };

        warn!(
            trace_id = %trace_id,
            endpoint = %endpoint,
            last_state = %last_state,
            "device not online before deadline; reconnecting once"
        );
        let reconnect = self.client.connect(&address, port, cancel, trace_id);
        if reconnect.cancelled {
            return Ok(QuickConnectOutcome::Cancelled);
        }
        match self.poll_online(&endpoint, self.settings.reverify_timeout(), cancel, trace_id) {
            PollResult::Online => Ok(QuickConnectOutcome::Verified { serial: usb.serial, device }),
            PollResult::Cancelled => Ok(QuickConnectOutcome::Cancelled),
            PollResult::Deadline(final_state) => Ok(QuickConnectOutcome::ConnectedUnverified {
                serial: usb.serial,
                device,
                last_state: if final_state.is_empty() { last_state } else { final_state },
            }),
        }
    }

    fn discover(&self, trace_id: &str) -> Result<Vec<UsbDevice>, AppError> {
        let listed = self.client.list_devices(trace_id);
        if !listed.success {
            let cause = diagnose_failure(&listed);
            return Err(AppError::dependency(
                format!("adb devices failed: {}", listed.detail_line()),
                trace_id,
            )
            .with_cause(cause)
            .with_detail(listed.combined_output()));
        }
        let eligible = eligible_usb_devices(&parse_adb_devices(&listed.stdout));
        if eligible.is_empty() {
            return Err(AppError::no_device(
                "No eligible USB devices. Connect a device over USB and accept the debugging prompt",
                trace_id,
            )
            .with_detail(listed.combined_output()));
        }
        debug!(trace_id = %trace_id, count = eligible.len(), "eligible usb devices");
        Ok(eligible)
    }

    fn select(
        &self,
        mut candidates: Vec<UsbDevice>,
        choose: &mut dyn FnMut(&[UsbDevice]) -> DeviceChoice,
        trace_id: &str,
    ) -> Result<Option<UsbDevice>, AppError> {
        let choice = match &self.serial {
            Some(serial) => DeviceChoice::Serial(serial.clone()),
            None if candidates.len() == 1 => return Ok(candidates.pop()),
            None => choose(&candidates),
        };
        match choice {
            DeviceChoice::Cancel => {
                info!(trace_id = %trace_id, "device selection cancelled");
                Ok(None)
            }
            DeviceChoice::Serial(serial) => candidates
                .into_iter()
                .find(|candidate| candidate.serial == serial)
                .map(Some)
                .ok_or_else(|| {
                    AppError::no_device(
                        format!("{serial} is not an eligible USB device"),
                        trace_id,
                    )
                }),
        }
    }

    /// `Ok(None)` means cancelled.
    fn resolve_ip(
        &self,
        serial: &str,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<Option<Ipv4Addr>, AppError> {
        let mut attempts = Vec::new();
        for query in IP_QUERIES {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let result = self.client.shell(serial, query, cancel, trace_id);
            if result.cancelled {
                return Ok(None);
            }
            if let Some(ip) = parse_device_ip(&result.stdout) {
                info!(trace_id = %trace_id, serial = %serial, ip = %ip, query = %query.join(" "), "device ip resolved");
                return Ok(Some(ip));
            }
            attempts.push(format!("$ {}\n{}", query.join(" "), result.combined_output()));
        }
        Err(AppError::ip_unresolved(
            "Could not determine the device IP. Check that Wi-Fi is on and connected",
            trace_id,
        )
        .with_detail(attempts.join("\n")))
    }

    fn poll_online(
        &self,
        endpoint: &str,
        window: Duration,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> PollResult {
        let deadline = Instant::now() + window;
        let mut last_state = String::new();
        loop {
            if cancel.is_cancelled() {
                return PollResult::Cancelled;
            }
            let result = self.client.get_state(endpoint, cancel, trace_id);
            if result.cancelled {
                return PollResult::Cancelled;
            }
            if is_online_state(&result.stdout) {
                debug!(trace_id = %trace_id, endpoint = %endpoint, "device online");
                return PollResult::Online;
            }
            let state = parse_device_state(&result.stdout);
            if !state.is_empty() {
                last_state = state;
            }
            let now = Instant::now();
            if now >= deadline {
                return PollResult::Deadline(last_state);
            }
            let pause = self.settings.poll_interval().min(deadline - now);
            if !cancel.sleep(pause) {
                return PollResult::Cancelled;
            }
        }
    }
}
