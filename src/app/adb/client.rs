use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::classify::{is_daemon_unavailable, refine_success};
use crate::app::adb::locator::AdbProgram;
use crate::app::adb::parse::validate_ipv4_address;
use crate::app::adb::runner::{CommandRunner, ProcessRunner};
use crate::app::cancel::CancelToken;
use crate::app::config::{AppConfig, TimeoutSettings};
use crate::app::error::AppError;
use crate::app::models::CommandResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbTimeouts {
    pub version: Duration,
    pub devices: Duration,
    pub pair: Duration,
    pub connect: Duration,
    pub disconnect: Duration,
    pub disconnect_all: Duration,
    pub get_state: Duration,
    pub tcpip: Duration,
    pub shell: Duration,
    pub kill_server: Duration,
    pub start_server: Duration,
}

impl From<&TimeoutSettings> for AdbTimeouts {
    fn from(settings: &TimeoutSettings) -> Self {
        Self {
            version: Duration::from_secs(settings.version_secs),
            devices: Duration::from_secs(settings.devices_secs),
            pair: Duration::from_secs(settings.pair_secs),
            connect: Duration::from_secs(settings.connect_secs),
            disconnect: Duration::from_secs(settings.disconnect_secs),
            disconnect_all: Duration::from_secs(settings.disconnect_all_secs),
            get_state: Duration::from_secs(settings.get_state_secs),
            tcpip: Duration::from_secs(settings.tcpip_secs),
            shell: Duration::from_secs(settings.shell_secs),
            kill_server: Duration::from_secs(settings.kill_server_secs),
            start_server: Duration::from_secs(settings.start_server_secs),
        }
    }
}

impl Default for AdbTimeouts {
    fn default() -> Self {
        Self::from(&TimeoutSettings::default())
    }
}

/// Validated `adb pair` inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairTarget {
    pub address: String,
    pub pairing_port: u16,
    pub code: String,
}

impl PairTarget {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.pairing_port)
    }
}

pub fn validate_pairing_code(code: &str) -> Result<(), String> {
    if code.len() == 6 && code.bytes().all(|byte| byte.is_ascii_digit()) {
        Ok(())
    } else {
        Err("pairing code must be exactly 6 digits".to_string())
    }
}

pub fn validate_pair_inputs(
    address: &str,
    pairing_port: &str,
    code: &str,
    trace_id: &str,
) -> Result<PairTarget, AppError> {
    if address.trim().is_empty() {
        return Err(AppError::validation("address is required", trace_id));
    }
    if pairing_port.trim().is_empty() {
        return Err(AppError::validation("pairing_port is required", trace_id));
    }
    let ip = validate_ipv4_address(address).map_err(|message| AppError::validation(message, trace_id))?;
    let pairing_port = pairing_port
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|port| *port > 0)
        .ok_or_else(|| AppError::validation("pairing_port must be between 1 and 65535", trace_id))?;
    let code = code.trim();
    validate_pairing_code(code).map_err(|message| AppError::validation(message, trace_id))?;
    Ok(PairTarget {
        address: ip.to_string(),
        pairing_port,
        code: code.to_string(),
    })
}

/// Issues adb subcommands through a [`CommandRunner`]. Every method returns a
/// [`CommandResult`]; failures are values, never panics.
pub struct AdbClient {
    program: AdbProgram,
    timeouts: AdbTimeouts,
    daemon_restart_delay: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl AdbClient {
    pub fn new(program: AdbProgram, config: &AppConfig) -> Self {
        Self::with_runner(
            program,
            AdbTimeouts::from(&config.timeouts),
            Duration::from_millis(config.daemon.restart_delay_ms),
            Arc::new(ProcessRunner),
        )
    }

    pub fn with_runner(
        program: AdbProgram,
        timeouts: AdbTimeouts,
        daemon_restart_delay: Duration,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            program,
            timeouts,
            daemon_restart_delay,
            runner,
        }
    }

    pub fn program(&self) -> &AdbProgram {
        &self.program
    }

    pub fn timeouts(&self) -> &AdbTimeouts {
        &self.timeouts
    }

    fn run_once(&self, args: &[String], timeout: Duration, cancel: &CancelToken) -> CommandResult {
        refine_success(
            self.runner
                .run(self.program.as_str(), args, timeout, cancel),
        )
    }

    /// Runs a command; if the adb server is down, starts it, waits, and
    /// retries exactly once.
    fn exec(
        &self,
        args: Vec<String>,
        timeout: Duration,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> CommandResult {
        let first = self.run_once(&args, timeout, cancel);
        if first.success || first.cancelled || !is_daemon_unavailable(&first) {
            return first;
        }

        warn!(
            trace_id = %trace_id,
            command = %first.command_line,
            "adb server unavailable; starting it and retrying once"
        );
        let started = self.start_server(cancel, trace_id);
        if !started.success {
            warn!(trace_id = %trace_id, detail = %started.detail_line(), "adb start-server failed");
        }
        if !cancel.sleep(self.daemon_restart_delay) {
            return CommandResult::cancelled(first.command_line, first.stdout, first.stderr);
        }
        self.run_once(&args, timeout, cancel)
    }

    pub fn version(&self, trace_id: &str) -> CommandResult {
        self.exec(args(&["version"]), self.timeouts.version, &CancelToken::new(), trace_id)
    }

    pub fn list_devices(&self, trace_id: &str) -> CommandResult {
        self.exec(args(&["devices", "-l"]), self.timeouts.devices, &CancelToken::new(), trace_id)
    }

    /// Validates inputs before anything is spawned.
    pub fn pair(
        &self,
        address: &str,
        pairing_port: &str,
        code: &str,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<CommandResult, AppError> {
        let target = validate_pair_inputs(address, pairing_port, code, trace_id)?;
        Ok(self.pair_target(&target, cancel, trace_id))
    }

    pub fn pair_target(
        &self,
        target: &PairTarget,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> CommandResult {
        info!(trace_id = %trace_id, endpoint = %target.endpoint(), "adb pair");
        self.exec(
            vec!["pair".to_string(), target.endpoint(), target.code.clone()],
            self.timeouts.pair,
            cancel,
            trace_id,
        )
    }

    pub fn connect(
        &self,
        address: &str,
        port: u16,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> CommandResult {
        info!(trace_id = %trace_id, address = %address, port, "adb connect");
        self.exec(
            vec!["connect".to_string(), format!("{address}:{port}")],
            self.timeouts.connect,
            cancel,
            trace_id,
        )
    }

    pub fn disconnect(&self, address: &str, port: u16, trace_id: &str) -> CommandResult {
        info!(trace_id = %trace_id, address = %address, port, "adb disconnect");
        self.exec(
            vec!["disconnect".to_string(), format!("{address}:{port}")],
            self.timeouts.disconnect,
            &CancelToken::new(),
            trace_id,
        )
    }

    pub fn disconnect_all(&self, trace_id: &str) -> CommandResult {
        self.exec(
            args(&["disconnect"]),
            self.timeouts.disconnect_all,
            &CancelToken::new(),
            trace_id,
        )
    }

    pub fn get_state(&self, serial: &str, cancel: &CancelToken, trace_id: &str) -> CommandResult {
        self.exec(
            args(&["-s", serial, "get-state"]),
            self.timeouts.get_state,
            cancel,
            trace_id,
        )
    }

    pub fn tcpip(
        &self,
        serial: &str,
        port: u16,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> CommandResult {
        info!(trace_id = %trace_id, serial = %serial, port, "adb tcpip");
        self.exec(
            vec![
                "-s".to_string(),
                serial.to_string(),
                "tcpip".to_string(),
                port.to_string(),
            ],
            self.timeouts.tcpip,
            cancel,
            trace_id,
        )
    }

    pub fn shell(
        &self,
        serial: &str,
        command: &[&str],
        cancel: &CancelToken,
        trace_id: &str,
    ) -> CommandResult {
        let mut argv = args(&["-s", serial, "shell"]);
        argv.extend(command.iter().map(|part| part.to_string()));
        self.exec(argv, self.timeouts.shell, cancel, trace_id)
    }

    pub fn kill_server(&self, trace_id: &str) -> CommandResult {
        info!(trace_id = %trace_id, "adb kill-server");
        self.run_once(&args(&["kill-server"]), self.timeouts.kill_server, &CancelToken::new())
    }

    /// Never goes through the daemon-recovery path.
    pub fn start_server(&self, cancel: &CancelToken, trace_id: &str) -> CommandResult {
        info!(trace_id = %trace_id, "adb start-server");
        self.run_once(&args(&["start-server"]), self.timeouts.start_server, cancel)
    }
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_support::{ok, ScriptedRunner};

    fn client(runner: &Arc<ScriptedRunner>) -> AdbClient {
        AdbClient::with_runner(
            AdbProgram::from_path("adb"),
            AdbTimeouts::default(),
            Duration::from_millis(1),
            runner.clone(),
        )
    }

    #[test]
    fn pair_issues_exact_argument_vector() {
        let runner = ScriptedRunner::new();
        runner.respond("pair", ok("Successfully paired to 192.168.1.50:37000 [guid=adb-1]\n"));
        let result = client(&runner)
            .pair("192.168.1.50", "37000", "123456", &CancelToken::new(), "trace-pair-1")
            .expect("valid inputs");

        assert!(result.success);
        assert_eq!(
            runner.calls(),
            vec![vec![
                "pair".to_string(),
                "192.168.1.50:37000".to_string(),
                "123456".to_string()
            ]]
        );
    }

    #[test]
    fn pair_rejects_bad_codes_without_spawning() {
        let runner = ScriptedRunner::new();
        let adb = client(&runner);
        for code in ["12345", "1234567", "12a456", "", "１２３４５６"] {
            let err = adb
                .pair("192.168.1.50", "37000", code, &CancelToken::new(), "trace-pair-2")
                .expect_err("invalid code");
            assert_eq!(err.code, "ERR_VALIDATION");
        }
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn pair_rejects_blank_address_and_port_without_spawning() {
        let runner = ScriptedRunner::new();
        let adb = client(&runner);
        let cancel = CancelToken::new();
        assert!(adb.pair(" ", "37000", "123456", &cancel, "t").is_err());
        assert!(adb.pair("192.168.1.50", "", "123456", &cancel, "t").is_err());
        assert!(adb.pair("192.168.1.50", "99999", "123456", &cancel, "t").is_err());
        assert!(adb.pair("not-an-ip", "37000", "123456", &cancel, "t").is_err());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn daemon_unavailable_triggers_start_server_and_single_retry() {
        let runner = ScriptedRunner::new();
        let daemon_down = CommandResult::completed(
            "adb devices -l".to_string(),
            1,
            String::new(),
            "error: cannot connect to daemon at tcp:5037: Connection refused\n".to_string(),
        );
        runner.respond_seq(
            "devices",
            vec![daemon_down, ok("List of devices attached\nABC device\n")],
        );
        runner.respond("start-server", ok(""));

        let result = client(&runner).list_devices("trace-daemon-1");

        assert!(result.success);
        let verbs: Vec<String> = runner.calls().iter().map(|call| call[0].clone()).collect();
        assert_eq!(verbs, vec!["devices", "start-server", "devices"]);
    }

    #[test]
    fn daemon_recovery_does_not_loop() {
        let runner = ScriptedRunner::new();
        let daemon_down = CommandResult::completed(
            "adb connect".to_string(),
            1,
            String::new(),
            "cannot connect to daemon\n".to_string(),
        );
        runner.respond_seq("connect", vec![daemon_down.clone(), daemon_down]);
        runner.respond("start-server", ok(""));

        let result = client(&runner).connect("10.0.0.2", 5555, &CancelToken::new(), "trace-daemon-2");

        assert!(!result.success);
        assert_eq!(runner.calls().len(), 3);
    }

    #[test]
    fn subcommands_use_expected_arguments() {
        let runner = ScriptedRunner::new();
        let adb = client(&runner);
        let cancel = CancelToken::new();
        adb.version("t");
        adb.connect("10.0.0.2", 5555, &cancel, "t");
        adb.disconnect("10.0.0.2", 5555, "t");
        adb.disconnect_all("t");
        adb.get_state("10.0.0.2:5555", &cancel, "t");
        adb.tcpip("USB1", 5555, &cancel, "t");
        adb.shell("USB1", &["ip", "route"], &cancel, "t");
        adb.kill_server("t");

        let joined: Vec<String> = runner.calls().iter().map(|call| call.join(" ")).collect();
        assert_eq!(
            joined,
            vec![
                "version",
                "connect 10.0.0.2:5555",
                "disconnect 10.0.0.2:5555",
                "disconnect",
                "-s 10.0.0.2:5555 get-state",
                "-s USB1 tcpip 5555",
                "-s USB1 shell ip route",
                "kill-server",
            ]
        );
    }

    #[test]
    fn failure_phrase_overrides_zero_exit() {
        let runner = ScriptedRunner::new();
        runner.respond("connect", ok("failed to connect to 10.0.0.2:5555\n"));
        let result = client(&runner).connect("10.0.0.2", 5555, &CancelToken::new(), "t");
        assert!(!result.success);
        assert_eq!(result.exit_code, 0);
    }
}
