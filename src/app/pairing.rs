use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::adb::classify::{classify_pair, diagnose_failure, is_connect_success, PairVerdict};
use crate::app::adb::client::{validate_pair_inputs, AdbClient, PairTarget};
use crate::app::cancel::CancelToken;
use crate::app::error::AppError;
use crate::app::models::{Device, FailureCause, PairConfidence, DEFAULT_ADB_PORT};
use crate::app::registry::DeviceRegistry;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    Idle,
    Validating,
    Pairing,
    Paired,
    VerifyingConnect,
    Done,
    Failed,
    TimedOut,
    Cancelled,
}

impl PairingState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PairingState::Done
                | PairingState::Failed
                | PairingState::TimedOut
                | PairingState::Cancelled
        )
    }

    fn can_move_to(self, next: PairingState) -> bool {
        use PairingState::*;
        match (self, next) {
            (_, Cancelled) => !self.is_terminal(),
            (Idle, Validating) => true,
            (Validating, Pairing | Failed) => true,
            (Pairing, Paired | Failed | TimedOut) => true,
            (Paired, VerifyingConnect | Done) => true,
            (VerifyingConnect, Done) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PairingRequest {
    pub address: String,
    pub pairing_port: String,
    pub code: String,
    /// Port used for the follow-up `adb connect`; defaults to 5555.
    pub connect_port: Option<u16>,
    pub name: Option<String>,
    pub verify_connect: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PairingOutcome {
    Done {
        device: Device,
        confidence: PairConfidence,
        /// `None` when no connect check was requested.
        connected: Option<bool>,
        raw_output: String,
        elapsed_ms: u64,
    },
    Failed {
        cause: FailureCause,
        message: String,
        raw_output: String,
        elapsed_ms: u64,
    },
    TimedOut {
        raw_output: String,
        elapsed_ms: u64,
    },
    Cancelled,
}

/// One pairing attempt. A failed attempt is final; retry with a new flow.
pub struct PairingFlow<'a> {
    client: &'a AdbClient,
    registry: &'a DeviceRegistry,
    state: PairingState,
    history: Vec<PairingState>,
    started: Option<Instant>,
}

impl<'a> PairingFlow<'a> {
    pub fn new(client: &'a AdbClient, registry: &'a DeviceRegistry) -> Self {
        Self {
            client,
            registry,
            state: PairingState::Idle,
            history: vec![PairingState::Idle],
            started: None,
        }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn history(&self) -> &[PairingState] {
        &self.history
    }

    fn elapsed_ms(&self) -> u64 {
        self.started
            .map(|started| started.elapsed())
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }

    fn transition(&mut self, next: PairingState, trace_id: &str) -> Result<(), AppError> {
        if !self.state.can_move_to(next) {
            return Err(AppError::system(
                format!("Invalid pairing transition {:?} -> {:?}", self.state, next),
                trace_id,
            ));
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    fn cancelled(&mut self, trace_id: &str) -> Result<PairingOutcome, AppError> {
        info!(trace_id = %trace_id, state = ?self.state, "pairing cancelled");
        self.transition(PairingState::Cancelled, trace_id)?;
        Ok(PairingOutcome::Cancelled)
    }

    /// Validation errors are returned as `Err` before any process is spawned.
    pub fn run(
        &mut self,
        request: &PairingRequest,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<PairingOutcome, AppError> {
        if self.state != PairingState::Idle {
            return Err(AppError::validation(
                "A pairing flow can only run once; start a new attempt",
                trace_id,
            ));
        }
        self.started = Some(Instant::now());
        self.transition(PairingState::Validating, trace_id)?;

        let target = match validate_pair_inputs(
            &request.address,
            &request.pairing_port,
            &request.code,
            trace_id,
        ) {
            Ok(target) => target,
            Err(err) => {
                self.transition(PairingState::Failed, trace_id)?;
                return Err(err);
            }
        };
        if cancel.is_cancelled() {
            return self.cancelled(trace_id);
        }

        self.transition(PairingState::Pairing, trace_id)?;
        let result = self.client.pair_target(&target, cancel, trace_id);
        let raw_output = result.combined_output();
        if result.cancelled {
            return self.cancelled(trace_id);
        }
        if result.timed_out {
            warn!(trace_id = %trace_id, endpoint = %target.endpoint(), "adb pair timed out");
            self.transition(PairingState::TimedOut, trace_id)?;
            return Ok(PairingOutcome::TimedOut {
                raw_output,
                elapsed_ms: self.elapsed_ms(),
            });
        }

        let confidence = match classify_pair(&result) {
            PairVerdict::Paired(confidence) => confidence,
            PairVerdict::Rejected(cause) => {
                warn!(
                    trace_id = %trace_id,
                    endpoint = %target.endpoint(),
                    cause = ?cause,
                    "adb pair failed"
                );
                self.transition(PairingState::Failed, trace_id)?;
                return Ok(PairingOutcome::Failed {
                    cause,
                    message: format!("{} ({})", cause.summary(), result.detail_line()),
                    raw_output,
                    elapsed_ms: self.elapsed_ms(),
                });
            }
        };
        if confidence == PairConfidence::LowConfidence {
            warn!(
                trace_id = %trace_id,
                output = %raw_output,
                "adb pair treated as success with low confidence"
            );
        }
        self.transition(PairingState::Paired, trace_id)?;

        // Android 11+ picks a random connect port, so only check a port we were told or saw before.
        let port_known =
            request.connect_port.is_some() || self.registry.contains(&target.address);
        let device = self.persist(&target, request, trace_id)?;
        if request.verify_connect && !port_known {
            info!(
                trace_id = %trace_id,
                address = %device.address,
                "connect check skipped; no connect port known"
            );
        }
        if !request.verify_connect || !port_known {
            self.transition(PairingState::Done, trace_id)?;
            return Ok(PairingOutcome::Done {
                device,
                confidence,
                connected: None,
                raw_output,
                elapsed_ms: self.elapsed_ms(),
            });
        }

        if cancel.is_cancelled() {
            return self.cancelled(trace_id);
        }
        self.transition(PairingState::VerifyingConnect, trace_id)?;
        let connect = self
            .client
            .connect(&device.address, device.port, cancel, trace_id);
        if connect.cancelled {
            return self.cancelled(trace_id);
        }
        let connected = is_connect_success(&connect);
        let device = if connected {
            let refreshed = device.seen_now();
            self.registry.upsert(refreshed.clone(), trace_id)?;
            refreshed
        } else {
            warn!(
                trace_id = %trace_id,
                endpoint = %device.endpoint(),
                cause = ?diagnose_failure(&connect),
                "paired but connect check failed"
            );
            device
        };
        self.transition(PairingState::Done, trace_id)?;
        Ok(PairingOutcome::Done {
            device,
            confidence,
            connected: Some(connected),
            raw_output,
            elapsed_ms: self.elapsed_ms(),
        })
    }

    fn persist(
        &self,
        target: &PairTarget,
        request: &PairingRequest,
        trace_id: &str,
    ) -> Result<Device, AppError> {
        let existing = self.registry.get(&target.address);
        let name = request
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .or_else(|| existing.as_ref().map(|device| device.name.clone()))
            .unwrap_or_else(|| target.address.clone());
        let port = request
            .connect_port
            .or_else(|| existing.as_ref().map(|device| device.port))
            .unwrap_or(DEFAULT_ADB_PORT);
        let device = Device::new(name, target.address.clone(), port).seen_now();
        self.registry.upsert(device.clone(), trace_id)?;
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::client::AdbTimeouts;
    use crate::app::adb::locator::AdbProgram;
    use crate::app::models::CommandResult;
    use crate::app::test_support::{fail, ok, ScriptedRunner};
    use std::sync::Arc;

    fn client(runner: &Arc<ScriptedRunner>) -> AdbClient {
        AdbClient::with_runner(
            AdbProgram::from_path("adb"),
            AdbTimeouts::default(),
            Duration::from_millis(1),
            runner.clone(),
        )
    }

    fn request(code: &str) -> PairingRequest {
        PairingRequest {
            address: "192.168.1.50".to_string(),
            pairing_port: "37000".to_string(),
            code: code.to_string(),
            ..PairingRequest::default()
        }
    }

    #[test]
    fn successful_pair_reaches_done_and_persists_device() {
        let runner = ScriptedRunner::new();
        runner.respond("pair", ok("Successfully paired to 192.168.1.50:5555\n"));
        let adb = client(&runner);
        let registry = DeviceRegistry::in_memory(10);

        let mut flow = PairingFlow::new(&adb, &registry);
        let outcome = flow
            .run(&request("123456"), &CancelToken::new(), "trace-pf-1")
            .expect("outcome");

        match outcome {
            PairingOutcome::Done {
                device,
                confidence,
                connected,
                ..
            } => {
                assert_eq!(device.address, "192.168.1.50");
                assert_eq!(device.port, 5555);
                assert_eq!(confidence, PairConfidence::Confirmed);
                assert_eq!(connected, None);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(registry.contains("192.168.1.50"));
        assert_eq!(
            flow.history(),
            &[
                PairingState::Idle,
                PairingState::Validating,
                PairingState::Pairing,
                PairingState::Paired,
                PairingState::Done
            ]
        );
    }

    #[test]
    fn invalid_code_fails_validation_without_spawning() {
        let runner = ScriptedRunner::new();
        let adb = client(&runner);
        let registry = DeviceRegistry::in_memory(10);

        let mut flow = PairingFlow::new(&adb, &registry);
        let err = flow
            .run(&request("12a456"), &CancelToken::new(), "trace-pf-2")
            .expect_err("validation");

        assert_eq!(err.code, "ERR_VALIDATION");
        assert_eq!(flow.state(), PairingState::Failed);
        assert!(runner.calls().is_empty());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn authentication_failure_is_terminal_and_not_persisted() {
        let runner = ScriptedRunner::new();
        runner.respond(
            "pair",
            fail(1, "error: protocol fault (couldn't read status message): failed to authenticate\n"),
        );
        let adb = client(&runner);
        let registry = DeviceRegistry::in_memory(10);

        let mut flow = PairingFlow::new(&adb, &registry);
        let outcome = flow
            .run(&request("123456"), &CancelToken::new(), "trace-pf-3")
            .expect("outcome");

        assert!(matches!(
            outcome,
            PairingOutcome::Failed {
                cause: FailureCause::Authentication,
                ..
            }
        ));
        assert_eq!(flow.state(), PairingState::Failed);
        assert!(registry.list().is_empty());
        assert_eq!(runner.count("pair"), 1);

        let again = flow.run(&request("123456"), &CancelToken::new(), "trace-pf-3");
        assert!(again.is_err());
        assert_eq!(runner.count("pair"), 1);
    }

    #[test]
    fn timeout_reaches_timed_out_state() {
        let runner = ScriptedRunner::new();
        runner.respond(
            "pair",
            CommandResult::timed_out("adb pair".to_string(), String::new(), String::new()),
        );
        let adb = client(&runner);
        let registry = DeviceRegistry::in_memory(10);

        let mut flow = PairingFlow::new(&adb, &registry);
        let outcome = flow
            .run(&request("123456"), &CancelToken::new(), "trace-pf-4")
            .expect("outcome");

        assert!(matches!(outcome, PairingOutcome::TimedOut { .. }));
        assert_eq!(flow.state(), PairingState::TimedOut);
    }

    #[test]
    fn verify_connect_runs_after_pairing() {
        let runner = ScriptedRunner::new();
        runner.respond("pair", ok("Successfully paired to 192.168.1.50:37000\n"));
        runner.respond("connect", ok("connected to 192.168.1.50:41555\n"));
        let adb = client(&runner);
        let registry = DeviceRegistry::in_memory(10);

        let mut req = request("654321");
        req.verify_connect = true;
        req.connect_port = Some(41555);
        req.name = Some("Pixel 8".to_string());

        let mut flow = PairingFlow::new(&adb, &registry);
        let outcome = flow
            .run(&req, &CancelToken::new(), "trace-pf-5")
            .expect("outcome");

        match outcome {
            PairingOutcome::Done {
                device, connected, ..
            } => {
                assert_eq!(connected, Some(true));
                assert_eq!(device.name, "Pixel 8");
                assert_eq!(device.port, 41555);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            runner.calls()[1],
            vec!["connect".to_string(), "192.168.1.50:41555".to_string()]
        );
        assert!(flow.history().contains(&PairingState::VerifyingConnect));
    }

    #[test]
    fn failed_connect_check_still_finishes_paired() {
        let runner = ScriptedRunner::new();
        runner.respond("pair", ok("Successfully paired to 192.168.1.50:37000\n"));
        runner.respond("connect", fail(1, "failed to connect to 192.168.1.50:5555: Connection refused\n"));
        let adb = client(&runner);
        let registry = DeviceRegistry::in_memory(10);

        let mut req = request("123456");
        req.verify_connect = true;
        req.connect_port = Some(5555);
        let outcome = PairingFlow::new(&adb, &registry)
            .run(&req, &CancelToken::new(), "trace-pf-6")
            .expect("outcome");

        assert!(matches!(
            outcome,
            PairingOutcome::Done {
                connected: Some(false),
                ..
            }
        ));
        assert!(registry.contains("192.168.1.50"));
    }

    #[test]
    fn connect_check_is_skipped_without_a_known_port() {
        let runner = ScriptedRunner::new();
        runner.respond("pair", ok("Successfully paired to 192.168.1.50:37000\n"));
        let adb = client(&runner);
        let registry = DeviceRegistry::in_memory(10);

        let mut req = request("123456");
        req.verify_connect = true;
        let mut flow = PairingFlow::new(&adb, &registry);
        let outcome = flow
            .run(&req, &CancelToken::new(), "trace-pf-8")
            .expect("outcome");

        assert!(matches!(
            outcome,
            PairingOutcome::Done {
                connected: None,
                ..
            }
        ));
        assert_eq!(runner.count("connect"), 0);
        assert!(!flow.history().contains(&PairingState::VerifyingConnect));
    }

    #[test]
    fn connect_check_uses_port_of_known_device() {
        let runner = ScriptedRunner::new();
        runner.respond("pair", ok("Successfully paired to 192.168.1.50:37000\n"));
        runner.respond("connect", ok("connected to 192.168.1.50:40123\n"));
        let adb = client(&runner);
        let registry = DeviceRegistry::in_memory(10);
        registry
            .upsert(Device::new("Tablet", "192.168.1.50", 40123), "seed")
            .expect("seed");

        let mut req = request("123456");
        req.verify_connect = true;
        let outcome = PairingFlow::new(&adb, &registry)
            .run(&req, &CancelToken::new(), "trace-pf-9")
            .expect("outcome");

        assert!(matches!(
            outcome,
            PairingOutcome::Done {
                connected: Some(true),
                ..
            }
        ));
        assert_eq!(
            runner.calls()[1],
            vec!["connect".to_string(), "192.168.1.50:40123".to_string()]
        );
    }

    #[test]
    fn exit_zero_with_failure_phrase_is_rejected() {
        let runner = ScriptedRunner::new();
        runner.respond("pair", ok("Unable to start pairing client: connection refused\n"));
        let adb = client(&runner);
        let registry = DeviceRegistry::in_memory(10);

        let mut flow = PairingFlow::new(&adb, &registry);
        let outcome = flow
            .run(&request("123456"), &CancelToken::new(), "trace-pf-10")
            .expect("outcome");

        assert!(matches!(
            outcome,
            PairingOutcome::Failed {
                cause: FailureCause::ConnectionRefused,
                ..
            }
        ));
        assert_eq!(flow.state(), PairingState::Failed);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn cancellation_during_pair_leaves_nothing_persisted() {
        let runner = ScriptedRunner::new();
        let cancel = CancelToken::new();
        runner.cancel_on("pair", cancel.clone());
        let adb = client(&runner);
        let registry = DeviceRegistry::in_memory(10);

        let mut flow = PairingFlow::new(&adb, &registry);
        let outcome = flow
            .run(&request("123456"), &cancel, "trace-pf-7")
            .expect("outcome");

        assert_eq!(outcome, PairingOutcome::Cancelled);
        assert_eq!(flow.state(), PairingState::Cancelled);
        assert!(registry.list().is_empty());
    }
}
