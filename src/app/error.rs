use serde::Serialize;
use std::fmt;

use crate::app::models::FailureCause;

#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    /// Raw stdout/stderr of the failing adb call, for troubleshooting output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_TOOL_MISSING: &str = "ERR_TOOL_MISSING";
pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";
pub const ERR_DEPENDENCY: &str = "ERR_DEPENDENCY";
pub const ERR_NO_DEVICE: &str = "ERR_NO_DEVICE";
pub const ERR_IP_UNRESOLVED: &str = "ERR_IP_UNRESOLVED";
pub const ERR_STORAGE: &str = "ERR_STORAGE";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
            cause: None,
            detail: None,
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    pub fn tool_missing(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TOOL_MISSING, message, trace_id)
    }

    pub fn timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TIMEOUT, message, trace_id).with_cause(FailureCause::Timeout)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_DEPENDENCY, message, trace_id)
    }

    pub fn no_device(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_NO_DEVICE, message, trace_id)
    }

    pub fn ip_unresolved(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_IP_UNRESOLVED, message, trace_id)
    }

    pub fn storage(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_STORAGE, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    pub fn with_cause(mut self, cause: FailureCause) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if !detail.trim().is_empty() {
            self.detail = Some(detail);
        }
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
