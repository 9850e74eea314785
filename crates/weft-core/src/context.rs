//! Workflow execution context: thread-safe typed state for one run.
//!
//! `WorkflowContext` carries three buckets across a run: `inputs` (set at
//! run start, read-only thereafter), `outputs` (written once per completed
//! step), and `vars` (runtime scratch). Reads take a shared lock, writes an
//! exclusive lock, so sibling templates in parallel blocks can read outputs
//! of already-completed steps safely.
//!
//! Accessor errors never echo the stored value. This keeps credentials out
//! of logs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::output::StepOutput;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum serialized size of a single step output (1 MiB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total serialized size of all context data (10 MiB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// ContextError
// ---------------------------------------------------------------------------

/// Typed accessor errors.
///
/// Messages name the key and the value's type class only -- never the value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The key is absent from every bucket.
    #[error("key {key:?} not found")]
    KeyNotFound { key: String },

    /// The key exists but holds a value of a different type class.
    #[error("key {key:?} is {actual}, not {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// A step output or the total context exceeded its size cap.
    #[error("context size limit exceeded ({size} > {max} bytes)")]
    SizeExceeded { size: usize, max: usize },
}

/// Type-class name of a JSON value, for TypeMismatch messages.
pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ContextInner {
    inputs: HashMap<String, Value>,
    outputs: HashMap<String, StepOutput>,
    vars: HashMap<String, Value>,
    env: HashMap<String, String>,
}

/// Shared, thread-safe execution context for one workflow run.
///
/// Cloning is cheap and shares state: parallel branches all observe the
/// same buckets.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    inner: Arc<RwLock<ContextInner>>,
    workflow_name: String,
    run_id: Uuid,
}

impl WorkflowContext {
    /// Create a context for a new run with the given static inputs.
    pub fn new(workflow_name: impl Into<String>, inputs: HashMap<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ContextInner {
                inputs,
                ..Default::default()
            })),
            workflow_name: workflow_name.into(),
            run_id: Uuid::now_v7(),
        }
    }

    /// Deep-copy this context into an independent one.
    ///
    /// Used for foreach/loop iterations: the body sees everything the parent
    /// has so far, but its own step outputs stay iteration-local.
    pub fn fork(&self) -> Self {
        let inner = self.inner.read().expect("context lock poisoned");
        Self {
            inner: Arc::new(RwLock::new(ContextInner {
                inputs: inner.inputs.clone(),
                outputs: inner.outputs.clone(),
                vars: inner.vars.clone(),
                env: inner.env.clone(),
            })),
            workflow_name: self.workflow_name.clone(),
            run_id: self.run_id,
        }
    }

    /// Expose selected environment variables to templates as `{{.env.NAME}}`.
    ///
    /// Only names in the allowlist are captured; unset variables are omitted.
    pub fn with_env_allowlist(self, names: &[&str]) -> Self {
        {
            let mut inner = self.inner.write().expect("context lock poisoned");
            for name in names {
                if let Ok(value) = std::env::var(name) {
                    inner.env.insert((*name).to_string(), value);
                }
            }
        }
        self
    }

    /// The workflow name this context belongs to.
    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    /// The run id.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    // -- outputs ----------------------------------------------------------

    /// Store the output of a terminated step.
    ///
    /// Enforces `MAX_STEP_OUTPUT_SIZE` per output: oversized `data` is
    /// replaced with a truncation marker. Enforces `MAX_CONTEXT_SIZE` in
    /// total. Output writes are single-writer per step id; a duplicate
    /// write is logged and overwrites.
    pub fn set_step_output(
        &self,
        step_id: &str,
        mut output: StepOutput,
    ) -> Result<(), ContextError> {
        let serialized_len = serde_json::to_string(&output.data)
            .map(|s| s.len())
            .unwrap_or(0);
        if serialized_len > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                step_id,
                size = serialized_len,
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            output.data = json!({
                "_truncated": true,
                "_original_size": serialized_len,
            });
        }

        let mut inner = self.inner.write().expect("context lock poisoned");
        if inner.outputs.insert(step_id.to_string(), output).is_some() {
            tracing::warn!(step_id, "step output overwritten");
        }

        let total = Self::total_size(&inner);
        if total > MAX_CONTEXT_SIZE {
            return Err(ContextError::SizeExceeded {
                size: total,
                max: MAX_CONTEXT_SIZE,
            });
        }
        Ok(())
    }

    /// Get a completed step's output, if present.
    pub fn step_output(&self, step_id: &str) -> Option<StepOutput> {
        let inner = self.inner.read().expect("context lock poisoned");
        inner.outputs.get(step_id).cloned()
    }

    /// Snapshot of all step outputs keyed by step id.
    pub fn outputs(&self) -> HashMap<String, StepOutput> {
        let inner = self.inner.read().expect("context lock poisoned");
        inner.outputs.clone()
    }

    // -- vars -------------------------------------------------------------

    /// Set a runtime variable.
    pub fn set_var(&self, key: &str, value: Value) {
        let mut inner = self.inner.write().expect("context lock poisoned");
        inner.vars.insert(key.to_string(), value);
    }

    // -- typed accessors --------------------------------------------------

    /// Raw lookup: inputs first, then vars.
    pub fn get(&self, key: &str) -> Result<Value, ContextError> {
        let inner = self.inner.read().expect("context lock poisoned");
        inner
            .inputs
            .get(key)
            .or_else(|| inner.vars.get(key))
            .cloned()
            .ok_or_else(|| ContextError::KeyNotFound {
                key: key.to_string(),
            })
    }

    /// Strict string accessor.
    pub fn get_string(&self, key: &str) -> Result<String, ContextError> {
        match self.get(key)? {
            Value::String(s) => Ok(s),
            other => Err(ContextError::TypeMismatch {
                key: key.to_string(),
                expected: "string",
                actual: value_kind(&other),
            }),
        }
    }

    /// Integer accessor; accepts any JSON number with an integral value.
    pub fn get_i64(&self, key: &str) -> Result<i64, ContextError> {
        let value = self.get(key)?;
        match &value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(i)
                } else if let Some(f) = n.as_f64() {
                    // JSON numbers parsed as floats still count as integers
                    // when they have no fractional part.
                    if f.fract() == 0.0 && f.is_finite() {
                        Ok(f as i64)
                    } else {
                        Err(ContextError::TypeMismatch {
                            key: key.to_string(),
                            expected: "int",
                            actual: "float",
                        })
                    }
                } else {
                    Err(ContextError::TypeMismatch {
                        key: key.to_string(),
                        expected: "int",
                        actual: value_kind(&value),
                    })
                }
            }
            other => Err(ContextError::TypeMismatch {
                key: key.to_string(),
                expected: "int",
                actual: value_kind(other),
            }),
        }
    }

    /// Float accessor; accepts any JSON number.
    pub fn get_f64(&self, key: &str) -> Result<f64, ContextError> {
        let value = self.get(key)?;
        match &value {
            Value::Number(n) => n.as_f64().ok_or(ContextError::TypeMismatch {
                key: key.to_string(),
                expected: "float",
                actual: "int",
            }),
            other => Err(ContextError::TypeMismatch {
                key: key.to_string(),
                expected: "float",
                actual: value_kind(other),
            }),
        }
    }

    /// Strict bool accessor.
    pub fn get_bool(&self, key: &str) -> Result<bool, ContextError> {
        match self.get(key)? {
            Value::Bool(b) => Ok(b),
            other => Err(ContextError::TypeMismatch {
                key: key.to_string(),
                expected: "bool",
                actual: value_kind(&other),
            }),
        }
    }

    /// Strict array accessor.
    pub fn get_slice(&self, key: &str) -> Result<Vec<Value>, ContextError> {
        match self.get(key)? {
            Value::Array(a) => Ok(a),
            other => Err(ContextError::TypeMismatch {
                key: key.to_string(),
                expected: "array",
                actual: value_kind(&other),
            }),
        }
    }

    /// Strict map accessor.
    pub fn get_map(&self, key: &str) -> Result<Map<String, Value>, ContextError> {
        match self.get(key)? {
            Value::Object(m) => Ok(m),
            other => Err(ContextError::TypeMismatch {
                key: key.to_string(),
                expected: "map",
                actual: value_kind(&other),
            }),
        }
    }

    // -- non-throwing variants -------------------------------------------

    /// `get_string` with a default; never errors.
    pub fn get_string_or(&self, key: &str, default: &str) -> String {
        self.get_string(key).unwrap_or_else(|_| default.to_string())
    }

    /// `get_i64` with a default; never errors.
    pub fn get_i64_or(&self, key: &str, default: i64) -> i64 {
        self.get_i64(key).unwrap_or(default)
    }

    /// `get_f64` with a default; never errors.
    pub fn get_f64_or(&self, key: &str, default: f64) -> f64 {
        self.get_f64(key).unwrap_or(default)
    }

    /// `get_bool` with a default; never errors.
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    // -- template scope ---------------------------------------------------

    /// Build the JSON object templates resolve against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "<input key>": ...,            // top-level input keys
    ///   "inputs": { ... },             // alias
    ///   "vars": { ... },
    ///   "steps": { "<id>": { "text": ..., "response": ..., ... } },
    ///   "env": { "<NAME>": "..." }
    /// }
    /// ```
    pub fn template_scope(&self) -> Value {
        let inner = self.inner.read().expect("context lock poisoned");

        let mut scope = Map::new();
        for (k, v) in &inner.inputs {
            scope.insert(k.clone(), v.clone());
        }
        scope.insert(
            "inputs".to_string(),
            Value::Object(inner.inputs.clone().into_iter().collect()),
        );
        scope.insert(
            "vars".to_string(),
            Value::Object(inner.vars.clone().into_iter().collect()),
        );

        let mut steps = Map::new();
        for (id, output) in &inner.outputs {
            steps.insert(id.clone(), output.to_map());
        }
        scope.insert("steps".to_string(), Value::Object(steps));

        let mut env = Map::new();
        for (name, value) in &inner.env {
            env.insert(name.clone(), json!(value));
        }
        scope.insert("env".to_string(), Value::Object(env));

        Value::Object(scope)
    }

    // -- sizing -----------------------------------------------------------

    fn total_size(inner: &ContextInner) -> usize {
        let outputs: usize = inner
            .outputs
            .values()
            .map(|o| serde_json::to_string(o).map(|s| s.len()).unwrap_or(0))
            .sum();
        let inputs: usize = inner
            .inputs
            .values()
            .map(|v| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0))
            .sum();
        let vars: usize = inner
            .vars
            .values()
            .map(|v| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0))
            .sum();
        outputs + inputs + vars
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::StepOutput;

    fn test_context() -> WorkflowContext {
        WorkflowContext::new(
            "test-workflow",
            HashMap::from([
                ("name".to_string(), json!("Alice")),
                ("count".to_string(), json!(3)),
                ("ratio".to_string(), json!(0.5)),
                ("flag".to_string(), json!(true)),
                ("tags".to_string(), json!(["a", "b"])),
                ("meta".to_string(), json!({"k": "v"})),
            ]),
        )
    }

    // -----------------------------------------------------------------------
    // Typed accessors
    // -----------------------------------------------------------------------

    #[test]
    fn test_get_string() {
        let ctx = test_context();
        assert_eq!(ctx.get_string("name").unwrap(), "Alice");
    }

    #[test]
    fn test_get_string_rejects_int() {
        let ctx = test_context();
        let err = ctx.get_string("count").unwrap_err();
        assert_eq!(
            err,
            ContextError::TypeMismatch {
                key: "count".to_string(),
                expected: "string",
                actual: "int",
            }
        );
    }

    #[test]
    fn test_get_i64_accepts_float_with_integral_value() {
        let ctx = WorkflowContext::new(
            "t",
            HashMap::from([("n".to_string(), json!(4.0))]),
        );
        assert_eq!(ctx.get_i64("n").unwrap(), 4);
    }

    #[test]
    fn test_get_i64_rejects_string() {
        let ctx = WorkflowContext::new(
            "t",
            HashMap::from([("n".to_string(), json!("42"))]),
        );
        assert!(matches!(
            ctx.get_i64("n"),
            Err(ContextError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_get_f64_accepts_int() {
        let ctx = test_context();
        assert_eq!(ctx.get_f64("count").unwrap(), 3.0);
        assert_eq!(ctx.get_f64("ratio").unwrap(), 0.5);
    }

    #[test]
    fn test_strict_accessors() {
        let ctx = test_context();
        assert!(ctx.get_bool("flag").unwrap());
        assert_eq!(ctx.get_slice("tags").unwrap().len(), 2);
        assert_eq!(ctx.get_map("meta").unwrap()["k"], json!("v"));
        assert!(ctx.get_bool("name").is_err());
        assert!(ctx.get_slice("meta").is_err());
        assert!(ctx.get_map("tags").is_err());
    }

    #[test]
    fn test_key_not_found() {
        let ctx = test_context();
        assert_eq!(
            ctx.get_string("missing").unwrap_err(),
            ContextError::KeyNotFound {
                key: "missing".to_string()
            }
        );
    }

    #[test]
    fn test_or_variants_return_default() {
        let ctx = test_context();
        assert_eq!(ctx.get_string_or("missing", "fallback"), "fallback");
        assert_eq!(ctx.get_i64_or("name", 7), 7);
        assert_eq!(ctx.get_f64_or("missing", 1.5), 1.5);
        assert!(ctx.get_bool_or("missing", true));
    }

    // -----------------------------------------------------------------------
    // No value leakage
    // -----------------------------------------------------------------------

    #[test]
    fn test_errors_never_echo_stored_value() {
        let ctx = WorkflowContext::new(
            "t",
            HashMap::from([("api_key".to_string(), json!("sk-super-secret-value"))]),
        );
        let err = ctx.get_i64("api_key").unwrap_err();
        let msg = err.to_string();
        assert!(!msg.contains("sk-super-secret-value"), "leaked: {msg}");
        assert!(msg.contains("api_key"));
        assert!(msg.contains("string"));
    }

    // -----------------------------------------------------------------------
    // Outputs and vars
    // -----------------------------------------------------------------------

    #[test]
    fn test_set_and_get_step_output() {
        let ctx = test_context();
        ctx.set_step_output("gather", StepOutput::success("news", json!({"n": 5})))
            .unwrap();
        let out = ctx.step_output("gather").unwrap();
        assert_eq!(out.text, "news");
        assert!(ctx.step_output("missing").is_none());
    }

    #[test]
    fn test_oversized_output_truncated() {
        let ctx = test_context();
        let big = "x".repeat(MAX_STEP_OUTPUT_SIZE + 100);
        ctx.set_step_output("big", StepOutput::success("ok", json!({"blob": big})))
            .unwrap();
        let out = ctx.step_output("big").unwrap();
        assert_eq!(out.data["_truncated"], json!(true));
    }

    #[test]
    fn test_vars_readable_through_accessors() {
        let ctx = test_context();
        ctx.set_var("attempts", json!(2));
        assert_eq!(ctx.get_i64("attempts").unwrap(), 2);
    }

    #[test]
    fn test_inputs_shadow_vars() {
        let ctx = test_context();
        ctx.set_var("name", json!("Bob"));
        // Inputs are read-only and win over scratch vars.
        assert_eq!(ctx.get_string("name").unwrap(), "Alice");
    }

    // -----------------------------------------------------------------------
    // Template scope
    // -----------------------------------------------------------------------

    #[test]
    fn test_template_scope_shape() {
        let ctx = test_context();
        ctx.set_step_output("gather", StepOutput::success("Hi", json!({"n": 5})))
            .unwrap();
        let scope = ctx.template_scope();
        assert_eq!(scope["name"], json!("Alice"));
        assert_eq!(scope["inputs"]["name"], json!("Alice"));
        assert_eq!(scope["steps"]["gather"]["text"], json!("Hi"));
        assert_eq!(scope["steps"]["gather"]["response"], json!("Hi"));
        assert_eq!(scope["steps"]["gather"]["n"], json!(5));
    }

    #[test]
    fn test_env_allowlist() {
        // SAFETY: test-local env mutation, no concurrent readers of this var.
        unsafe { std::env::set_var("WEFT_TEST_ENV_VAR", "hello") };
        let ctx = WorkflowContext::new("t", HashMap::new())
            .with_env_allowlist(&["WEFT_TEST_ENV_VAR", "WEFT_UNSET_VAR"]);
        let scope = ctx.template_scope();
        assert_eq!(scope["env"]["WEFT_TEST_ENV_VAR"], json!("hello"));
        assert!(scope["env"].get("WEFT_UNSET_VAR").is_none());
    }

    // -----------------------------------------------------------------------
    // Shared state across clones
    // -----------------------------------------------------------------------

    #[test]
    fn test_fork_is_independent() {
        let ctx = test_context();
        ctx.set_step_output("before", StepOutput::success("x", Value::Null))
            .unwrap();
        let fork = ctx.fork();
        // The fork sees prior state but later writes stay local.
        assert!(fork.step_output("before").is_some());
        fork.set_step_output("inside", StepOutput::success("y", Value::Null))
            .unwrap();
        assert!(ctx.step_output("inside").is_none());
    }

    #[test]
    fn test_clones_share_state() {
        let ctx = test_context();
        let clone = ctx.clone();
        clone
            .set_step_output("from-clone", StepOutput::success("x", Value::Null))
            .unwrap();
        assert!(ctx.step_output("from-clone").is_some());
        assert_eq!(ctx.run_id(), clone.run_id());
    }
}
