use std::path::{Path, PathBuf};

use tracing::debug;

use crate::app::error::AppError;

const SDK_ENV_VARS: [&str; 2] = ["ANDROID_HOME", "ANDROID_SDK_ROOT"];

/// An adb executable path resolved once at startup and handed to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbProgram {
    path: String,
}

impl AdbProgram {
    /// Resolves the executable: configured path first, then the SDK
    /// environment variables, then `PATH`.
    pub fn resolve(config_command_path: &str, trace_id: &str) -> Result<Self, AppError> {
        let configured = normalize_command_path(config_command_path);
        if !configured.is_empty() {
            validate_adb_program(&configured)
                .map_err(|message| AppError::tool_missing(message, trace_id))?;
            let path = if looks_like_bare_name(&configured) {
                which::which(&configured)
                    .map(|path| path.to_string_lossy().to_string())
                    .map_err(|_| {
                        AppError::tool_missing(
                            format!("{configured} was not found on PATH"),
                            trace_id,
                        )
                    })?
            } else {
                configured
            };
            return Ok(Self { path });
        }

        if let Some(path) = sdk_candidates().into_iter().find(|path| path.is_file()) {
            debug!(trace_id = %trace_id, path = %path.display(), "adb found in Android SDK");
            return Ok(Self {
                path: path.to_string_lossy().to_string(),
            });
        }

        which::which("adb")
            .map(|path| Self {
                path: path.to_string_lossy().to_string(),
            })
            .map_err(|_| {
                AppError::tool_missing(
                    "adb not found. Install Android platform-tools or configure adb.command_path",
                    trace_id,
                )
            })
    }

    /// Skips discovery and validation; for callers that already hold a known path.
    pub fn from_path(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }
}

fn looks_like_bare_name(value: &str) -> bool {
    !value.contains('/') && !value.contains('\\')
}

fn adb_file_name() -> &'static str {
    if cfg!(windows) {
        "adb.exe"
    } else {
        "adb"
    }
}

fn sdk_candidates() -> Vec<PathBuf> {
    SDK_ENV_VARS
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .filter(|value| !value.trim().is_empty())
        .map(|root| PathBuf::from(root).join("platform-tools").join(adb_file_name()))
        .collect()
}

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|candidate| candidate.strip_suffix('"'))
    {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|candidate| candidate.strip_suffix('\''))
    {
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

pub fn validate_adb_program(program: &str) -> Result<(), String> {
    if program.trim().is_empty() {
        return Err("ADB command is empty".to_string());
    }
    if looks_like_bare_name(program) {
        return Ok(());
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err("ADB path must point to an executable file".to_string());
    }
    if !path.exists() {
        return Err("ADB executable not found at the configured path".to_string());
    }
    if !is_executable(path) {
        return Err("ADB path is not executable".to_string());
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
