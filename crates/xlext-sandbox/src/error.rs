use thiserror::Error;
use xlext_permissions::Capability;

/// Enumerates supported `SandboxHostError` values.
///
/// `Display` output is what crosses the boundary as the `error` field of an
/// `ok: false` response, so capability denials render as the bare user-facing
/// sentence.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SandboxHostError {
    #[error("{message}")]
    CapabilityDenied {
        capability: Capability,
        message: String,
    },
    #[error("unsupported extension sandbox method '{method}'")]
    UnsupportedMethod { method: String },
    #[error("invalid params for '{method}': {message}")]
    InvalidParams { method: String, message: String },
    #[error("extension sandbox request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("extension sandbox was disposed")]
    Disposed,
    #[error("{message}")]
    Bootstrap { message: String },
    #[error("extension sandbox did not become ready within {timeout_ms}ms")]
    BootstrapTimeout { timeout_ms: u64 },
    #[error("extension sandbox transport error: {message}")]
    Transport { message: String },
    #[error("{message}")]
    Handler { message: String },
    #[error("{message}")]
    Sandbox { method: String, message: String },
}

impl SandboxHostError {
    pub(crate) fn handler(error: anyhow::Error) -> Self {
        Self::Handler {
            message: error.to_string(),
        }
    }

    pub(crate) fn invalid_params(method: &str, message: impl Into<String>) -> Self {
        Self::InvalidParams {
            method: method.to_string(),
            message: message.into(),
        }
    }
}
