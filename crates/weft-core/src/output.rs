//! Step output record and status machine.
//!
//! Every step that terminates (success, captured failure, or skip) produces
//! a `StepOutput`, which is stored in the workflow context under the step's
//! id and exposed to downstream templates through `to_map`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// StepStatus
// ---------------------------------------------------------------------------

/// Per-step status machine: `Pending -> Running -> {Success, Failed, Skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Whether this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Failed | StepStatus::Skipped)
    }
}

// ---------------------------------------------------------------------------
// StepMetadata
// ---------------------------------------------------------------------------

/// Token usage reported by an LLM provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Execution metadata attached to a step output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepMetadata {
    /// Wall-clock duration of the step, including retries.
    pub duration_ms: u64,
    /// LLM provider name (llm steps only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Model used (llm steps only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Token usage (llm steps only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    /// Number of dispatch attempts made (1 when no retry occurred).
    #[serde(default)]
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// StepOutput
// ---------------------------------------------------------------------------

/// The record produced when a step terminates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOutput {
    /// Terminal status of the step.
    pub status: StepStatus,
    /// Human-readable summary of the result.
    #[serde(default)]
    pub text: String,
    /// Free-form structured result.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Error message, non-empty only when the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Execution metadata.
    #[serde(default)]
    pub metadata: StepMetadata,
}

impl Default for StepStatus {
    fn default() -> Self {
        StepStatus::Pending
    }
}

impl StepOutput {
    /// A successful output with summary text and structured data.
    pub fn success(text: impl Into<String>, data: Value) -> Self {
        Self {
            status: StepStatus::Success,
            text: text.into(),
            data,
            error: None,
            metadata: StepMetadata::default(),
        }
    }

    /// A failed output carrying the error string.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            text: String::new(),
            data: Value::Null,
            error: Some(error.into()),
            metadata: StepMetadata::default(),
        }
    }

    /// An empty output for a skipped step.
    pub fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            text: String::new(),
            data: Value::Null,
            error: None,
            metadata: StepMetadata::default(),
        }
    }

    /// Project this output into the map templates reference as
    /// `{{.steps.<id>.<field>}}`.
    ///
    /// `data` object fields are flattened to the top level, then the
    /// reserved keys `text`, `response` (alias for `text`), and `error` are
    /// inserted last so user data can never shadow them.
    pub fn to_map(&self) -> Value {
        let mut map = Map::new();
        if let Value::Object(data) = &self.data {
            for (k, v) in data {
                map.insert(k.clone(), v.clone());
            }
        } else if !self.data.is_null() {
            map.insert("data".to_string(), self.data.clone());
        }
        map.insert("text".to_string(), json!(self.text));
        map.insert("response".to_string(), json!(self.text));
        map.insert("status".to_string(), json!(self.status));
        if let Some(err) = &self.error {
            map.insert("error".to_string(), json!(err));
        }
        Value::Object(map)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_map_exposes_text_and_response_alias() {
        let output = StepOutput::success("Hi Alice", json!({"status_code": 200}));
        let map = output.to_map();
        assert_eq!(map["text"], "Hi Alice");
        assert_eq!(map["response"], "Hi Alice");
        assert_eq!(map["status_code"], 200);
    }

    #[test]
    fn test_to_map_reserved_keys_win_over_data() {
        let output = StepOutput::success(
            "real text",
            json!({"text": "shadow", "response": "shadow", "custom": 1}),
        );
        let map = output.to_map();
        assert_eq!(map["text"], "real text");
        assert_eq!(map["response"], "real text");
        assert_eq!(map["custom"], 1);
    }

    #[test]
    fn test_to_map_non_object_data_nested_under_data_key() {
        let output = StepOutput::success("ok", json!([1, 2, 3]));
        let map = output.to_map();
        assert_eq!(map["data"], json!([1, 2, 3]));
    }

    #[test]
    fn test_to_map_includes_error_when_failed() {
        let output = StepOutput::failed("connector unreachable");
        let map = output.to_map();
        assert_eq!(map["error"], "connector unreachable");
        assert_eq!(map["status"], "failed");
    }

    #[test]
    fn test_skipped_output_is_empty() {
        let output = StepOutput::skipped();
        assert_eq!(output.status, StepStatus::Skipped);
        assert!(output.text.is_empty());
        assert!(output.error.is_none());
    }

    #[test]
    fn test_status_terminal() {
        assert!(StepStatus::Success.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }
}
