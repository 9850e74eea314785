//! Injected execution ports.
//!
//! The engine never performs I/O itself. Connector and LLM dispatch go
//! through these traits, implemented by the hosting application. Builtin
//! operations (`shell.run`, `file.read`, ...) are routed through the
//! connector registry under their builtin reference, since builtins are
//! just connectors provided by the host.

use std::future::Future;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::output::TokenUsage;

// ---------------------------------------------------------------------------
// DispatchError
// ---------------------------------------------------------------------------

/// Error from a connector or LLM dispatch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The registry has no operation for this reference.
    #[error("unknown operation {reference:?}")]
    UnknownOperation { reference: String },

    /// The upstream call failed.
    #[error("{message}")]
    Upstream { message: String, retriable: bool },

    /// The dispatch was cancelled before completing.
    #[error("dispatch cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Whether the retry layer may attempt this dispatch again.
    pub fn is_retriable(&self) -> bool {
        match self {
            DispatchError::Upstream { retriable, .. } => *retriable,
            DispatchError::UnknownOperation { .. } | DispatchError::Cancelled => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Result of one connector operation.
#[derive(Debug, Clone, Default)]
pub struct ConnectorResult {
    /// The operation's response, after any configured transform.
    pub response: Value,
    /// The untransformed response body.
    pub raw_response: Value,
    /// HTTP status code, when the operation was an HTTP call.
    pub status_code: Option<u16>,
}

/// Result of one LLM completion.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub text: String,
    pub usage: TokenUsage,
    /// Provider name, for step metadata.
    pub provider: Option<String>,
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Executes connector operations by reference (`<connector>.<operation>`
/// or a builtin pair like `shell.run`).
pub trait ConnectorRegistry: Send + Sync {
    fn execute(
        &self,
        cancel: &CancellationToken,
        reference: &str,
        inputs: &Value,
    ) -> impl Future<Output = Result<ConnectorResult, DispatchError>> + Send;
}

/// Completes LLM prompts.
pub trait LlmProvider: Send + Sync {
    fn complete(
        &self,
        cancel: &CancellationToken,
        model: &str,
        prompt: &str,
        options: &Value,
    ) -> impl Future<Output = Result<LlmResponse, DispatchError>> + Send;
}
