use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::app::cancel::CancelToken;
use crate::app::models::CommandResult;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const REAP_GRACE: Duration = Duration::from_secs(1);

/// Seam between adb operations and the OS. Tests substitute a scripted runner.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> CommandResult;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> CommandResult {
        run_command_with_timeout(program, args, timeout, cancel)
    }
}

pub fn format_command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

struct StreamCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    done: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl StreamCapture {
    fn spawn<R: Read + Send + 'static>(reader: R) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::<u8>::new()));
        let done = Arc::new(AtomicBool::new(false));
        let thread_buffer = Arc::clone(&buffer);
        let thread_done = Arc::clone(&done);
        let handle = std::thread::spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut line = Vec::<u8>::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if let Ok(mut guard) = thread_buffer.lock() {
                            guard.extend_from_slice(&line);
                        }
                    }
                    Err(_) => break,
                }
            }
            thread_done.store(true, Ordering::Release);
        });
        Self {
            buffer,
            done,
            handle,
        }
    }

    /// Waits for the pipe to close, at most `grace`. A forked grandchild (the adb
    /// server started by `adb start-server`) can keep the pipe open indefinitely.
    fn finish(self, grace: Duration) -> String {
        let start = Instant::now();
        while !self.done.load(Ordering::Acquire) && start.elapsed() < grace {
            std::thread::sleep(Duration::from_millis(5));
        }
        if self.done.load(Ordering::Acquire) {
            let _ = self.handle.join();
        }
        let bytes = self
            .buffer
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        String::from_utf8_lossy(&bytes).to_string()
    }
}

fn terminate(child: &mut Child) {
    let _ = child.kill();
    let start = Instant::now();
    while start.elapsed() < REAP_GRACE {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(_) => break,
        }
    }
    // Blocking reap; kill() has already been delivered.
    let _ = child.wait();
}

/// Runs `program` with an argument vector (no shell), enforcing `timeout` and
/// honouring `cancel`. Every exit path reaps the child.
pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    cancel: &CancelToken,
) -> CommandResult {
    let command_line = format_command_line(program, args);
    if cancel.is_cancelled() {
        return CommandResult::cancelled(command_line, String::new(), String::new());
    }

    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            warn!(command = %command_line, error = %err, "failed to spawn command");
            return CommandResult::spawn_failure(
                command_line,
                format!("Failed to spawn {program}: {err}"),
            );
        }
    };

    // Drain stdout/stderr in parallel; otherwise, a chatty child process can block once the pipe
    // buffer fills, and we will incorrectly hit the timeout.
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        terminate(&mut child);
        return CommandResult::spawn_failure(command_line, "Failed to capture command output");
    };
    let stdout_capture = StreamCapture::spawn(stdout);
    let stderr_capture = StreamCapture::spawn(stderr);

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = stdout_capture.finish(REAP_GRACE);
                let stderr = stderr_capture.finish(REAP_GRACE);
                let exit_code = status.code().unwrap_or(-1);
                debug!(command = %command_line, exit_code, "command finished");
                return CommandResult::completed(command_line, exit_code, stdout, stderr);
            }
            Ok(None) => {
                if cancel.is_cancelled() {
                    terminate(&mut child);
                    let stdout = stdout_capture.finish(REAP_GRACE);
                    let stderr = stderr_capture.finish(REAP_GRACE);
                    debug!(command = %command_line, "command cancelled");
                    return CommandResult::cancelled(command_line, stdout, stderr);
                }
                if start.elapsed() > timeout {
                    terminate(&mut child);
                    let stdout = stdout_capture.finish(REAP_GRACE);
                    let stderr = stderr_capture.finish(REAP_GRACE);
                    warn!(
                        command = %command_line,
                        timeout_ms = timeout.as_millis() as u64,
                        "command timed out"
                    );
                    return CommandResult::timed_out(command_line, stdout, stderr);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                terminate(&mut child);
                let stdout = stdout_capture.finish(REAP_GRACE);
                let mut stderr = stderr_capture.finish(REAP_GRACE);
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&format!("Failed to poll command: {err}"));
                let mut result = CommandResult::spawn_failure(command_line, stderr);
                result.stdout = stdout;
                return result;
            }
        }
    }
}
