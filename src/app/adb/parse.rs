use std::net::Ipv4Addr;
use std::sync::OnceLock;

use regex::Regex;

use crate::app::models::UsbDevice;

pub fn parse_adb_devices(output: &str) -> Vec<UsbDevice> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let serial = tokens[0].to_string();
            let state = tokens[1].to_string();
            let mut model = None;
            let mut product = None;
            let mut device = None;
            let mut transport_id = None;
            for token in tokens.iter().skip(2) {
                if let Some(value) = token.strip_prefix("model:") {
                    model = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("product:") {
                    product = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("device:") {
                    device = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("transport_id:") {
                    transport_id = Some(value.to_string());
                }
            }
            Some(UsbDevice {
                serial,
                state,
                model,
                product,
                device,
                transport_id,
            })
        })
        .collect()
}

/// True for serials that name a TCP transport (`ip:port`) or an mDNS service.
pub fn is_network_serial(serial: &str) -> bool {
    if serial.contains("._adb-tls-connect.") || serial.contains("._adb._tcp") {
        return true;
    }
    match serial.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Devices attached over USB and authorized (`state == "device"`).
pub fn eligible_usb_devices(devices: &[UsbDevice]) -> Vec<UsbDevice> {
    devices
        .iter()
        .filter(|device| device.is_eligible() && !is_network_serial(&device.serial))
        .cloned()
        .collect()
}

fn inet_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\binet\s+(?:addr:)?(\d{1,3}(?:\.\d{1,3}){3})").ok())
        .as_ref()
}

fn src_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bsrc\s+(\d{1,3}(?:\.\d{1,3}){3})").ok())
        .as_ref()
}

fn first_capture(re: Option<&Regex>, output: &str) -> Option<Ipv4Addr> {
    re?.captures_iter(output)
        .find_map(|caps| usable_ipv4(&caps[1]))
}

fn usable_ipv4(candidate: &str) -> Option<Ipv4Addr> {
    let ip = candidate.trim().parse::<Ipv4Addr>().ok()?;
    if ip.is_loopback() || ip.is_unspecified() || ip.is_link_local() || ip.is_broadcast() {
        return None;
    }
    Some(ip)
}

/// Extracts the device Wi-Fi address from `ip`/`ifconfig`/`getprop` output.
/// Tries `inet <ip>`, then `src <ip>`, then the whole output as a bare address.
pub fn parse_device_ip(output: &str) -> Option<Ipv4Addr> {
    first_capture(inet_regex(), output)
        .or_else(|| first_capture(src_regex(), output))
        .or_else(|| usable_ipv4(output))
}

pub fn parse_adb_version(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("Android Debug Bridge version")
            .map(|version| version.trim().to_string())
            .filter(|version| !version.is_empty())
    })
}

/// `get-state` prints a single word such as `device`, `offline` or `unauthorized`.
pub fn parse_device_state(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_lowercase()
}

pub fn is_online_state(output: &str) -> bool {
    parse_device_state(output) == "device"
}

/// Parses `ip[:port]`, falling back to `default_port` when no port is given.
pub fn parse_endpoint(value: &str, default_port: u16) -> Result<(String, u16), String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("address is required".to_string());
    }
    let (host, port) = match trimmed.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|port| *port > 0)
                .ok_or_else(|| format!("invalid port in {trimmed}"))?;
            (host.trim(), port)
        }
        None => (trimmed, default_port),
    };
    validate_ipv4_address(host)?;
    Ok((host.to_string(), port))
}

pub fn validate_ipv4_address(value: &str) -> Result<Ipv4Addr, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("address is required".to_string());
    }
    trimmed
        .parse::<Ipv4Addr>()
        .map_err(|_| format!("{trimmed} is not an IPv4 address"))
}
