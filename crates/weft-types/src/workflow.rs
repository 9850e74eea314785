//! Workflow domain types for Weft.
//!
//! Defines the canonical definition model for workflows: the YAML document
//! deserializes into `Definition`, which is immutable after parsing and is
//! the single source of truth for a workflow's shape. This module also
//! contains connector configuration, trigger configuration, the security
//! policy model, and retry/error-handling configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Definition (canonical IR)
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// Immutable after parsing. Steps execute in declared order; parallelism is
/// expressed explicitly via `parallel` and `foreach` steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    /// Human-readable workflow name.
    pub name: String,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Static workflow inputs, available to templates as `{{.<name>}}`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, Value>,
    /// Ordered sequence of steps.
    pub steps: Vec<StepDefinition>,
    /// Named connectors referenced by `connector`/`integration` steps.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub connectors: HashMap<String, Connector>,
    /// Trigger configuration (validated but not executed by the engine).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<TriggerConfig>,
    /// Advisory security policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityPolicy>,
    /// Default error-handling strategy for steps without `on_error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorHandling>,
    /// Workflow-level timeout in seconds (default 1800).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in a workflow.
///
/// The wire shape is flat: every kind shares this struct, and the validator
/// enforces each kind's required-field contract (`llm` requires `model` and
/// `prompt`, `connector` requires `ref`, `parallel` requires nested `steps`,
/// and so on).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDefinition {
    /// User-defined step ID, unique within its parent scope.
    pub id: String,
    /// The kind of step.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Model name (`llm` steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Prompt template (`llm` steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Operation reference of form `<connector>.<operation>`
    /// (`connector` and `integration` steps).
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Builtin operation of form `<builtin>.<operation>`,
    /// e.g. `shell.run` or `file.read` (`builtin` steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builtin: Option<String>,
    /// Name of the workflow to invoke (`subworkflow` steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    /// Free-form step inputs, resolved through the template engine.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, Value>,
    /// Alias for `inputs`; entries here override same-named `inputs` keys.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub with: HashMap<String, Value>,
    /// Template resolving to an array to iterate over (`foreach` steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<String>,
    /// Bound on in-flight children for `parallel`/`foreach` steps.
    /// 0 means the default; values above 100 are rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
    /// Boolean template expression gating execution of this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Loop halting condition, re-evaluated after each iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
    /// Loop iteration cap (hard default 100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Nested steps (`parallel` children, `foreach`/`loop` body,
    /// `condition` then-branch).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepDefinition>,
    /// `condition` else-branch.
    #[serde(rename = "else", default, skip_serializing_if = "Vec::is_empty")]
    pub else_steps: Vec<StepDefinition>,
    /// Retry policy applied around leaf dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Error-handling strategy for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorHandling>,
    /// Step-level timeout in seconds (default 300), applied per attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StepDefinition {
    /// Merge `inputs` and its `with` alias into one map.
    ///
    /// `with` entries override same-named `inputs` entries.
    pub fn effective_inputs(&self) -> HashMap<String, Value> {
        let mut merged = self.inputs.clone();
        for (k, v) in &self.with {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }
}

/// The kind of step in a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    #[default]
    Llm,
    Connector,
    Builtin,
    Integration,
    Parallel,
    Foreach,
    Condition,
    Loop,
    Subworkflow,
    Transform,
}

impl StepType {
    /// Lowercase name for log fields and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Llm => "llm",
            StepType::Connector => "connector",
            StepType::Builtin => "builtin",
            StepType::Integration => "integration",
            StepType::Parallel => "parallel",
            StepType::Foreach => "foreach",
            StepType::Condition => "condition",
            StepType::Loop => "loop",
            StepType::Subworkflow => "subworkflow",
            StepType::Transform => "transform",
        }
    }
}

// ---------------------------------------------------------------------------
// Retry Configuration
// ---------------------------------------------------------------------------

/// Retry policy for a workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (default 1 = no retry).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial backoff delay in milliseconds (default 1000).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Multiplier applied per attempt (default 2.0, must be >= 1.0).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Optional cap on the computed delay, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
    /// Multiply the delay by a uniform random factor in [0.5, 1.5].
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: None,
            jitter: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Error Handling
// ---------------------------------------------------------------------------

/// What to do when a step fails after exhausting its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandling {
    /// The strategy to apply.
    pub strategy: ErrorStrategy,
    /// Fallback value (literal or template reference), used by `fallback`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Value>,
}

/// Error-handling strategy for a failed step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Propagate the error; the workflow terminates.
    #[default]
    Fail,
    /// Record the error in the step output and proceed with siblings.
    Continue,
    /// Substitute the fallback value and proceed.
    Fallback,
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// A named adapter to an external service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connector {
    /// Base URL for all operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Packaged connector source; when set, operation existence is
    /// resolved by the connector layer rather than the inline table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Authentication configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    /// Client-side rate limit configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
    /// Named operations exposed by this connector.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub operations: HashMap<String, Operation>,
}

/// Connector authentication configuration.
///
/// `oauth2_client` is reserved: its shape is kept in the model but the
/// validator rejects it as not yet implemented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Auth {
    /// Bearer token in the `Authorization` header.
    Bearer { token: String },
    /// HTTP basic authentication.
    Basic { username: String, password: String },
    /// Static API key in a named header.
    ApiKey { header: String, value: String },
    /// OAuth2 client-credentials flow (reserved, not implemented).
    Oauth2Client {
        client_id: String,
        client_secret: String,
        token_url: String,
    },
}

impl Auth {
    /// Credential-bearing field values for security validation,
    /// paired with the field name they came from.
    pub fn credential_fields(&self) -> Vec<(&'static str, &str)> {
        match self {
            Auth::Bearer { token } => vec![("token", token)],
            Auth::Basic { password, .. } => vec![("password", password)],
            Auth::ApiKey { value, .. } => vec![("value", value)],
            Auth::Oauth2Client { client_secret, .. } => {
                vec![("client_secret", client_secret)]
            }
        }
    }
}

/// Client-side rate limit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_second: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<f64>,
    /// Burst allowance on top of the steady rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<f64>,
}

/// A single connector operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// HTTP method.
    pub method: HttpMethod,
    /// Request path, appended to the connector's base URL.
    pub path: String,
    /// Per-operation timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Response-transform expression, handled by the connector layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

/// HTTP methods accepted for connector operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

// ---------------------------------------------------------------------------
// Security Policy
// ---------------------------------------------------------------------------

/// Advisory security policy, evaluated by the validator.
/// Enforcement belongs to the connector layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<ShellPolicy>,
}

/// Filesystem access policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilesystemPolicy {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

/// Network access policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkPolicy {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

/// Shell command policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShellPolicy {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny_patterns: Vec<String>,
}

// ---------------------------------------------------------------------------
// Trigger Configuration
// ---------------------------------------------------------------------------

/// How a workflow can be triggered.
///
/// Exactly one sub-block must be present; the validator enforces this.
/// The engine does not run triggers -- this is configuration only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileTrigger>,
}

impl TriggerConfig {
    /// Number of trigger sub-blocks present.
    pub fn configured_count(&self) -> usize {
        [
            self.webhook.is_some(),
            self.api.is_some(),
            self.schedule.is_some(),
            self.poll.is_some(),
            self.file.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count()
    }
}

/// Incoming webhook trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTrigger {
    /// Webhook endpoint path (e.g. "/trigger/daily-digest").
    pub path: String,
    /// Secret reference used for signature verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Manual trigger via the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiTrigger {}

/// Cron schedule trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTrigger {
    /// Cron expression.
    pub cron: String,
    /// Optional timezone (e.g. "America/New_York").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// Polling trigger against a known integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollTrigger {
    /// Integration to poll (slack, pagerduty, jira, datadog).
    pub integration: String,
    /// Poll interval in seconds (>= 10).
    pub interval_secs: u64,
    /// Backfill window in seconds (<= 24 h).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backfill_secs: Option<u64>,
    /// Query parameters; values restricted to `[A-Za-z0-9_@.\-]+`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query: HashMap<String, String>,
}

/// Filesystem change trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTrigger {
    /// Paths to watch.
    pub paths: Vec<String>,
    /// Optional glob patterns to filter events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patterns: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
