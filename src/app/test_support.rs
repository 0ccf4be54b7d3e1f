use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::app::adb::runner::{format_command_line, CommandRunner};
use crate::app::cancel::CancelToken;
use crate::app::models::CommandResult;

type Responder = Box<dyn Fn(usize, &[Vec<String>]) -> CommandResult + Send + Sync>;

/// Exit-0 result with the given stdout.
pub fn ok(stdout: &str) -> CommandResult {
    CommandResult::completed("adb".to_string(), 0, stdout.to_string(), String::new())
}

/// Non-zero result with the given stderr.
pub fn fail(exit_code: i32, stderr: &str) -> CommandResult {
    CommandResult::completed("adb".to_string(), exit_code, String::new(), stderr.to_string())
}

/// Replays canned results keyed by command prefix and records every argument vector.
///
/// The key is matched against the arguments with any leading `-s <serial>`
/// removed, e.g. `"pair"`, `"get-state"` or `"shell ip route"`. The longest
/// matching key wins. Unscripted commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    responders: Mutex<Vec<(String, Responder)>>,
    calls: Mutex<Vec<Vec<String>>>,
    counts: Mutex<Vec<(String, usize)>>,
    cancel_hooks: Mutex<Vec<(String, CancelToken)>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, key: &str, result: CommandResult) {
        self.respond_with(key, move |_, _| result.clone());
    }

    /// Returns results in order; the last one repeats once exhausted.
    pub fn respond_seq(&self, key: &str, results: Vec<CommandResult>) {
        self.respond_with(key, move |nth, _| {
            results
                .get(nth)
                .or_else(|| results.last())
                .cloned()
                .unwrap_or_else(|| ok(""))
        });
    }

    /// `responder` receives the 0-based call index for this key and all calls so far.
    pub fn respond_with(
        &self,
        key: &str,
        responder: impl Fn(usize, &[Vec<String>]) -> CommandResult + Send + Sync + 'static,
    ) {
        self.responders
            .lock()
            .expect("responders")
            .push((key.to_string(), Box::new(responder)));
    }

    /// Cancels `token` as soon as a command matching `key` runs.
    pub fn cancel_on(&self, key: &str, token: CancelToken) {
        self.cancel_hooks
            .lock()
            .expect("hooks")
            .push((key.to_string(), token));
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn count(&self, key: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| command_key(call).starts_with(key))
            .count()
    }

    fn next_index(&self, key: &str) -> usize {
        let mut counts = self.counts.lock().expect("counts");
        match counts.iter_mut().find(|(existing, _)| existing == key) {
            Some((_, count)) => {
                let nth = *count;
                *count += 1;
                nth
            }
            None => {
                counts.push((key.to_string(), 1));
                0
            }
        }
    }
}

fn command_key(args: &[String]) -> String {
    let rest = match args {
        [flag, _serial, rest @ ..] if flag == "-s" => rest,
        _ => args,
    };
    rest.join(" ")
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        _timeout: Duration,
        cancel: &CancelToken,
    ) -> CommandResult {
        let command_line = format_command_line(program, args);
        let key = command_key(args);
        let history = {
            let mut calls = self.calls.lock().expect("calls");
            calls.push(args.to_vec());
            calls.clone()
        };

        for (hook_key, token) in self.cancel_hooks.lock().expect("hooks").iter() {
            if key.starts_with(hook_key.as_str()) {
                token.cancel();
            }
        }
        if cancel.is_cancelled() {
            return CommandResult::cancelled(command_line, String::new(), String::new());
        }

        let responders = self.responders.lock().expect("responders");
        let matched = responders
            .iter()
            .filter(|(candidate, _)| key.starts_with(candidate.as_str()))
            .max_by_key(|(candidate, _)| candidate.len());
        let mut result = match matched {
            Some((candidate, responder)) => {
                let nth = self.next_index(candidate);
                responder(nth, &history)
            }
            None => ok(""),
        };
        result.command_line = command_line;
        result
    }
}
