//! Text heuristics layered on top of adb exit codes.
//!
//! adb reports some outcomes only through human-readable output, and older
//! releases exit 0 after `failed to connect`. Every phrase match lives here so
//! call sites never inspect raw output themselves.

use crate::app::models::{CommandResult, FailureCause, PairConfidence};

const FAILURE_PHRASES: [&str; 6] = [
    "failed to",
    "unable to",
    "cannot connect to daemon",
    "error:",
    "no such device",
    "connection refused",
];

const PAIR_SUCCESS_PHRASES: [&str; 2] = ["successfully paired", "paired to"];

fn lowered(result: &CommandResult) -> String {
    result.combined_output().to_lowercase()
}

pub fn has_failure_phrase(output: &str) -> bool {
    let lower = output.to_lowercase();
    FAILURE_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

/// Success means exit code 0 and no recognized failure phrase.
pub fn refine_success(mut result: CommandResult) -> CommandResult {
    if result.success && has_failure_phrase(&result.combined_output()) {
        result.success = false;
    }
    result
}

pub fn is_daemon_unavailable(result: &CommandResult) -> bool {
    lowered(result).contains("cannot connect to daemon")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairVerdict {
    Paired(PairConfidence),
    Rejected(FailureCause),
}

/// The success phrase is authoritative. The "exit 0, some output, no failure
/// words" fallback is reported as low confidence.
pub fn classify_pair(result: &CommandResult) -> PairVerdict {
    if result.timed_out {
        return PairVerdict::Rejected(FailureCause::Timeout);
    }
    let lower = lowered(result);
    // `success` is already refined: exit 0 and no failure phrase.
    if result.success {
        if PAIR_SUCCESS_PHRASES.iter().any(|phrase| lower.contains(phrase))
            && !lower.contains("failed")
        {
            return PairVerdict::Paired(PairConfidence::Confirmed);
        }
        if !lower.trim().is_empty() && !lower.contains("failed") && !lower.contains("error") {
            return PairVerdict::Paired(PairConfidence::LowConfidence);
        }
    }
    PairVerdict::Rejected(diagnose_failure(result))
}

pub fn diagnose_failure(result: &CommandResult) -> FailureCause {
    if result.timed_out {
        return FailureCause::Timeout;
    }
    diagnose_output(&result.combined_output())
}

pub fn diagnose_output(output: &str) -> FailureCause {
    let lower = output.to_lowercase();
    if lower.contains("failed to authenticate")
        || lower.contains("wrong password")
        || lower.contains("incorrect")
    {
        FailureCause::Authentication
    } else if lower.contains("connection refused") || lower.contains("refused") {
        FailureCause::ConnectionRefused
    } else if lower.contains("timed out") || lower.contains("timeout") {
        FailureCause::Timeout
    } else if lower.contains("no route to host")
        || lower.contains("unreachable")
        || lower.contains("network is down")
    {
        FailureCause::NetworkUnreachable
    } else if lower.contains("invalid port") || lower.contains("bad port") {
        FailureCause::InvalidPort
    } else if lower.contains("already paired") {
        FailureCause::AlreadyPaired
    } else {
        FailureCause::Unknown
    }
}

/// `adb tcpip` answers `restarting in TCP mode port: N` while the on-device
/// daemon restarts, which is the expected outcome.
pub fn is_tcpip_restarting(result: &CommandResult) -> bool {
    lowered(result).contains("restarting in")
}

pub fn is_tcpip_success(result: &CommandResult) -> bool {
    result.success || is_tcpip_restarting(result)
}

pub fn is_connect_success(result: &CommandResult) -> bool {
    if result.success {
        return true;
    }
    if result.timed_out || result.cancelled {
        return false;
    }
    let lower = lowered(result);
    (lower.contains("connected to") || lower.contains("already connected"))
        && !lower.contains("failed to connect")
        && !lower.contains("unable to connect")
}

/// `adb disconnect` of an unknown endpoint prints `no such device`.
pub fn is_not_connected(result: &CommandResult) -> bool {
    let lower = lowered(result);
    lower.contains("no such device") || lower.contains("not connected")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i32, stdout: &str, stderr: &str) -> CommandResult {
        CommandResult::completed(
            "adb test".to_string(),
            exit_code,
            stdout.to_string(),
            stderr.to_string(),
        )
    }

    #[test]
    fn refine_marks_exit_zero_failures() {
        let refined = refine_success(result(0, "failed to connect to 10.0.0.9:5555\n", ""));
        assert!(!refined.success);
        let refined = refine_success(result(0, "connected to 10.0.0.9:5555\n", ""));
        assert!(refined.success);
    }

    #[test]
    fn pair_success_phrase_is_confirmed() {
        let verdict = classify_pair(&result(
            0,
            "Successfully paired to 192.168.1.50:37000 [guid=adb-XYZ]\n",
            "",
        ));
        assert_eq!(verdict, PairVerdict::Paired(PairConfidence::Confirmed));
    }

    #[test]
    fn pair_without_phrase_is_low_confidence() {
        let verdict = classify_pair(&result(0, "ok\n", ""));
        assert_eq!(verdict, PairVerdict::Paired(PairConfidence::LowConfidence));
    }

    #[test]
    fn pair_empty_output_is_rejected() {
        let verdict = classify_pair(&result(0, "", ""));
        assert_eq!(verdict, PairVerdict::Rejected(FailureCause::Unknown));
    }

    #[test]
    fn pair_auth_failure_is_rejected_even_on_exit_zero() {
        let verdict = classify_pair(&result(
            0,
            "Failed: Unable to start pairing client.\nerror: protocol fault (failed to authenticate)\n",
            "",
        ));
        assert_eq!(verdict, PairVerdict::Rejected(FailureCause::Authentication));
    }

    #[test]
    fn pair_rejects_refined_failure_despite_exit_zero() {
        let refined = refine_success(result(
            0,
            "Unable to start pairing client: connection refused\n",
            "",
        ));
        assert!(!refined.success);
        assert_eq!(
            classify_pair(&refined),
            PairVerdict::Rejected(FailureCause::ConnectionRefused)
        );
    }

    #[test]
    fn pair_timeout_is_rejected_as_timeout() {
        let timed_out =
            CommandResult::timed_out("adb pair".to_string(), String::new(), String::new());
        assert_eq!(
            classify_pair(&timed_out),
            PairVerdict::Rejected(FailureCause::Timeout)
        );
    }

    #[test]
    fn diagnoses_common_causes() {
        assert_eq!(
            diagnose_output("failed to connect to '10.0.0.2:5555': Connection refused"),
            FailureCause::ConnectionRefused
        );
        assert_eq!(
            diagnose_output("failed to connect to 10.0.0.2:5555: No route to host"),
            FailureCause::NetworkUnreachable
        );
        assert_eq!(
            diagnose_output("failed to connect: Operation timed out"),
            FailureCause::Timeout
        );
        assert_eq!(diagnose_output("error: invalid port '99999'"), FailureCause::InvalidPort);
        assert_eq!(diagnose_output("device already paired"), FailureCause::AlreadyPaired);
        assert_eq!(diagnose_output("something odd"), FailureCause::Unknown);
    }

    #[test]
    fn tcpip_restarting_counts_as_success() {
        let output = result(1, "restarting in TCP mode port: 5555\n", "");
        assert!(is_tcpip_restarting(&output));
        assert!(is_tcpip_success(&output));
        assert!(!is_tcpip_success(&result(1, "", "error: no devices/emulators found\n")));
    }

    #[test]
    fn connect_success_detected_from_text() {
        assert!(is_connect_success(&result(1, "already connected to 10.0.0.2:5555\n", "")));
        assert!(is_connect_success(&result(0, "connected to 10.0.0.2:5555\n", "")));
        assert!(!is_connect_success(&refine_success(result(
            0,
            "failed to connect to 10.0.0.2:5555\n",
            ""
        ))));
    }

    #[test]
    fn detects_daemon_unavailable() {
        let output = result(
            1,
            "",
            "error: cannot connect to daemon at tcp:5037: Connection refused\n",
        );
        assert!(is_daemon_unavailable(&output));
    }

    #[test]
    fn detects_not_connected_disconnect() {
        assert!(is_not_connected(&result(
            1,
            "",
            "error: no such device '10.0.0.2:5555'\n"
        )));
        assert!(!is_not_connected(&result(0, "disconnected 10.0.0.2:5555\n", "")));
    }
}
