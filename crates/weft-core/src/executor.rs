//! The workflow engine: recursive step execution over a shared context.
//!
//! `Engine` is generic over its ports (connector registry, LLM provider)
//! and over the clock and jitter source so retry behavior is deterministic
//! under test. A run walks the definition's steps in declared order;
//! `parallel` and `foreach` steps fan out onto tasks gated by a counting
//! semaphore, and every suspension point observes the run's cancellation
//! token.
//!
//! Leaf steps (llm, connector, integration, builtin, transform) dispatch
//! through the retry layer; compound steps (parallel, foreach, condition,
//! loop, subworkflow) drive their bodies recursively.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use weft_types::workflow::{
    Definition, ErrorHandling, ErrorStrategy, StepDefinition, StepType,
};

use crate::connector::{ConnectorRegistry, DispatchError, LlmProvider};
use crate::context::{WorkflowContext, value_kind};
use crate::functions;
use crate::output::StepOutput;
use crate::resolver;
use crate::retry::{self, Clock, JitterSource, SleepOutcome, ThreadRngJitter, TokioClock};
use crate::template::{TemplateEngine, value_to_string};
use crate::validate::{
    MAX_CONCURRENCY_LIMIT, MAX_LOOP_ITERATIONS, ValidationError, validate_structure,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default whole-workflow timeout (30 minutes).
pub const DEFAULT_WORKFLOW_TIMEOUT_SECS: u64 = 1800;

/// Default per-attempt step timeout (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Maximum subworkflow nesting depth.
pub const MAX_SUBWORKFLOW_DEPTH: usize = 5;

/// Maximum number of elements a foreach array may resolve to.
pub const MAX_FOREACH_ITEMS: usize = 10_000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A step failure, as seen at the `run` boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("step {step_id:?} ({kind}) failed after {attempt} attempt(s): {cause}")]
pub struct StepError {
    pub step_id: String,
    pub kind: &'static str,
    /// Message of the underlying failure.
    pub cause: String,
    /// Attempts made before giving up.
    pub attempt: u32,
    /// Whether the final failure was of a retriable class.
    pub retriable: bool,
}

/// Errors from running a workflow.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(
        "invalid workflow definition ({} issue(s)): {}",
        errors.len(),
        errors.first().map(|e| e.to_string()).unwrap_or_default()
    )]
    Invalid { errors: Vec<ValidationError> },

    #[error(transparent)]
    Step(#[from] StepError),

    #[error("workflow run cancelled")]
    Cancelled,

    #[error("workflow timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("unknown workflow {name:?}")]
    UnknownWorkflow { name: String },

    #[error("subworkflow nesting exceeds the maximum depth of {max}")]
    DepthExceeded { max: usize },

    #[error(transparent)]
    Context(#[from] crate::context::ContextError),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Per-call execution state threaded down the step tree.
#[derive(Clone)]
struct Frame {
    cancel: CancellationToken,
    subworkflow_depth: usize,
    default_on_error: Option<ErrorHandling>,
}

/// The workflow execution engine.
///
/// All I/O goes through the injected `registry` and `llm` ports; `clock`
/// and `jitter` feed the retry layer.
pub struct Engine<R, L, C = TokioClock, J = ThreadRngJitter> {
    registry: R,
    llm: L,
    clock: C,
    jitter: J,
    template: TemplateEngine,
    workflows: RwLock<HashMap<String, Definition>>,
    runs: DashMap<Uuid, CancellationToken>,
    env_allowlist: Vec<String>,
}

impl<R, L> Engine<R, L>
where
    R: ConnectorRegistry + 'static,
    L: LlmProvider + 'static,
{
    pub fn new(registry: R, llm: L) -> Self {
        Self::with_parts(registry, llm, TokioClock, ThreadRngJitter)
    }
}

impl<R, L, C, J> Engine<R, L, C, J>
where
    R: ConnectorRegistry + 'static,
    L: LlmProvider + 'static,
    C: Clock + 'static,
    J: JitterSource + 'static,
{
    /// Construct with an explicit clock and jitter source.
    pub fn with_parts(registry: R, llm: L, clock: C, jitter: J) -> Self {
        Self {
            registry,
            llm,
            clock,
            jitter,
            template: TemplateEngine::new(),
            workflows: RwLock::new(HashMap::new()),
            runs: DashMap::new(),
            env_allowlist: Vec::new(),
        }
    }

    /// Expose the named environment variables to templates as
    /// `{{.env.NAME}}`. Applies to every run and to subworkflow contexts.
    pub fn with_env_allowlist(mut self, names: &[&str]) -> Self {
        self.env_allowlist = names.iter().map(|n| (*n).to_string()).collect();
        self
    }

    fn run_context(&self, workflow_name: &str, inputs: HashMap<String, Value>) -> WorkflowContext {
        let names: Vec<&str> = self.env_allowlist.iter().map(String::as_str).collect();
        WorkflowContext::new(workflow_name, inputs).with_env_allowlist(&names)
    }

    /// Register a definition so `subworkflow` steps can reference it by name.
    pub fn register_workflow(&self, definition: Definition) -> Result<(), EngineError> {
        let errors = validate_structure(&definition);
        if !errors.is_empty() {
            return Err(EngineError::Invalid { errors });
        }
        self.workflows
            .write()
            .expect("workflow registry lock poisoned")
            .insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Cancel a running workflow. Returns false if the run is unknown.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.runs.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of runs currently in flight.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.runs.iter().map(|entry| *entry.key()).collect()
    }

    /// Execute a workflow to completion.
    ///
    /// `inputs` override same-named static inputs from the definition. On
    /// success, returns every terminated step's output keyed by step id.
    pub async fn run(
        self: Arc<Self>,
        definition: Definition,
        inputs: HashMap<String, Value>,
    ) -> Result<HashMap<String, StepOutput>, EngineError> {
        let errors = validate_structure(&definition);
        if !errors.is_empty() {
            return Err(EngineError::Invalid { errors });
        }

        let mut merged = definition.inputs.clone();
        merged.extend(inputs);
        let ctx = self.run_context(&definition.name, merged);
        let run_id = ctx.run_id();

        let cancel = CancellationToken::new();
        self.runs.insert(run_id, cancel.clone());
        info!(workflow = %definition.name, %run_id, steps = definition.steps.len(), "workflow run started");

        let frame = Frame {
            cancel,
            subworkflow_depth: 0,
            default_on_error: definition.on_error.clone(),
        };
        let timeout_secs = definition.timeout_secs.unwrap_or(DEFAULT_WORKFLOW_TIMEOUT_SECS);

        let result = match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            run_sequence(&self, &frame, &definition.steps, &ctx, &Map::new()),
        )
        .await
        {
            Ok(inner) => inner,
            Err(_) => {
                frame.cancel.cancel();
                Err(EngineError::Timeout { secs: timeout_secs })
            }
        };

        self.runs.remove(&run_id);
        match result {
            Ok(()) => {
                info!(workflow = %definition.name, %run_id, "workflow run completed");
                Ok(ctx.outputs())
            }
            Err(error) => {
                warn!(workflow = %definition.name, %run_id, %error, "workflow run failed");
                Err(error)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Traversal
// ---------------------------------------------------------------------------

type StepResult = Result<StepOutput, EngineError>;

/// Run steps in declared order, registering each output as it terminates.
/// The first unhandled failure stops the walk; later siblings never run.
async fn run_sequence<R, L, C, J>(
    engine: &Arc<Engine<R, L, C, J>>,
    frame: &Frame,
    steps: &[StepDefinition],
    ctx: &WorkflowContext,
    overlay: &Map<String, Value>,
) -> Result<(), EngineError>
where
    R: ConnectorRegistry + 'static,
    L: LlmProvider + 'static,
    C: Clock + 'static,
    J: JitterSource + 'static,
{
    for step in steps {
        if frame.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let output = run_step(engine, frame, step, ctx, overlay).await?;
        ctx.set_step_output(&step.id, output)?;
    }
    Ok(())
}

/// Execute one step of any kind. Boxed because compound steps recurse.
fn run_step<'a, R, L, C, J>(
    engine: &'a Arc<Engine<R, L, C, J>>,
    frame: &'a Frame,
    step: &'a StepDefinition,
    ctx: &'a WorkflowContext,
    overlay: &'a Map<String, Value>,
) -> Pin<Box<dyn Future<Output = StepResult> + Send + 'a>>
where
    R: ConnectorRegistry + 'static,
    L: LlmProvider + 'static,
    C: Clock + 'static,
    J: JitterSource + 'static,
{
    Box::pin(async move {
        if frame.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // `when` gates execution of any non-condition step.
        if step.step_type != StepType::Condition {
            if let Some(when) = &step.when {
                let scope = scope_with_overlay(ctx, overlay);
                if !evaluate_condition(engine, when, &scope) {
                    debug!(step_id = %step.id, "when expression false, skipping step");
                    return Ok(StepOutput::skipped());
                }
            }
        }

        debug!(step_id = %step.id, kind = step.step_type.as_str(), "step running");
        let started = Instant::now();

        let result = match step.step_type {
            StepType::Llm
            | StepType::Connector
            | StepType::Integration
            | StepType::Builtin
            | StepType::Transform => dispatch_with_retry(engine, frame, step, ctx, overlay).await,
            StepType::Parallel => run_parallel(engine, frame, step, ctx, overlay).await,
            StepType::Foreach => run_foreach(engine, frame, step, ctx, overlay).await,
            StepType::Condition => run_condition(engine, frame, step, ctx, overlay).await,
            StepType::Loop => run_loop(engine, frame, step, ctx, overlay).await,
            StepType::Subworkflow => run_subworkflow(engine, frame, step, ctx, overlay).await,
        };

        match result {
            Ok(mut output) => {
                output.metadata.duration_ms = started.elapsed().as_millis() as u64;
                debug!(step_id = %step.id, status = ?output.status, "step terminated");
                Ok(output)
            }
            // Cancellation is terminal; no strategy applies.
            Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
            Err(error) => apply_error_strategy(engine, frame, step, ctx, overlay, error),
        }
    })
}

/// Resolve a failed step through its error-handling strategy.
fn apply_error_strategy<R, L, C, J>(
    engine: &Arc<Engine<R, L, C, J>>,
    frame: &Frame,
    step: &StepDefinition,
    ctx: &WorkflowContext,
    overlay: &Map<String, Value>,
    error: EngineError,
) -> StepResult
where
    R: ConnectorRegistry + 'static,
    L: LlmProvider + 'static,
    C: Clock + 'static,
    J: JitterSource + 'static,
{
    let handling = step
        .on_error
        .clone()
        .or_else(|| frame.default_on_error.clone());
    let strategy = handling
        .as_ref()
        .map(|h| h.strategy)
        .unwrap_or(ErrorStrategy::Fail);

    match strategy {
        ErrorStrategy::Fail => Err(error),
        ErrorStrategy::Continue => {
            warn!(step_id = %step.id, %error, "step failed, continuing");
            Ok(StepOutput::failed(error.to_string()))
        }
        ErrorStrategy::Fallback => {
            let Some(fallback) = handling.and_then(|h| h.fallback) else {
                return Err(error);
            };
            warn!(step_id = %step.id, %error, "step failed, using fallback");
            let scope = scope_with_overlay(ctx, overlay);
            let resolved = resolver::resolve_value(&engine.template, &fallback, &scope);
            let mut output = StepOutput::success(value_to_string(&resolved), resolved);
            output.error = Some(error.to_string());
            Ok(output)
        }
    }
}

// ---------------------------------------------------------------------------
// Leaf dispatch with retry
// ---------------------------------------------------------------------------

async fn dispatch_with_retry<R, L, C, J>(
    engine: &Arc<Engine<R, L, C, J>>,
    frame: &Frame,
    step: &StepDefinition,
    ctx: &WorkflowContext,
    overlay: &Map<String, Value>,
) -> StepResult
where
    R: ConnectorRegistry + 'static,
    L: LlmProvider + 'static,
    C: Clock + 'static,
    J: JitterSource + 'static,
{
    let scope = scope_with_overlay(ctx, overlay);
    let inputs = resolve_inputs(&engine.template, step, &scope);
    let policy = step.retry.clone().unwrap_or_default();
    let step_timeout = Duration::from_secs(step.timeout_secs.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS));
    let started = Instant::now();
    let mut attempt: u32 = 1;

    loop {
        if frame.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let dispatched = tokio::time::timeout(
            step_timeout,
            dispatch_once(engine, &frame.cancel, step, &inputs, &scope),
        )
        .await
        .unwrap_or_else(|_| {
            Err(DispatchError::Upstream {
                message: format!("step timed out after {}s", step_timeout.as_secs()),
                retriable: true,
            })
        });

        match dispatched {
            Ok(mut output) => {
                output.metadata.attempts = attempt;
                output.metadata.duration_ms = started.elapsed().as_millis() as u64;
                return Ok(output);
            }
            Err(DispatchError::Cancelled) => return Err(EngineError::Cancelled),
            Err(error) => {
                let retriable = error.is_retriable();
                if !retriable || !retry::should_retry(&policy, attempt) {
                    return Err(EngineError::Step(StepError {
                        step_id: step.id.clone(),
                        kind: step.step_type.as_str(),
                        cause: error.to_string(),
                        attempt,
                        retriable,
                    }));
                }
                let delay = retry::jittered_delay(&policy, attempt, &engine.jitter);
                debug!(
                    step_id = %step.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "dispatch failed, retrying after backoff"
                );
                if retry::cancellable_sleep(&engine.clock, &frame.cancel, delay).await
                    == SleepOutcome::Cancelled
                {
                    return Err(EngineError::Cancelled);
                }
                attempt += 1;
            }
        }
    }
}

/// One dispatch attempt for a leaf step.
async fn dispatch_once<R, L, C, J>(
    engine: &Arc<Engine<R, L, C, J>>,
    cancel: &CancellationToken,
    step: &StepDefinition,
    inputs: &Map<String, Value>,
    scope: &Value,
) -> Result<StepOutput, DispatchError>
where
    R: ConnectorRegistry + 'static,
    L: LlmProvider + 'static,
    C: Clock + 'static,
    J: JitterSource + 'static,
{
    match step.step_type {
        StepType::Llm => {
            let model = step.model.as_deref().ok_or_else(|| DispatchError::Upstream {
                message: "llm step has no model".to_string(),
                retriable: false,
            })?;
            let prompt_template = step.prompt.as_deref().unwrap_or_default();
            let prompt = value_to_string(&resolver::resolve_string(
                &engine.template,
                prompt_template,
                scope,
            ));
            let options = Value::Object(inputs.clone());
            let response = engine.llm.complete(cancel, model, &prompt, &options).await?;

            let mut output = StepOutput::success(response.text.clone(), Value::Null);
            output.metadata.model = Some(model.to_string());
            output.metadata.provider = response.provider;
            output.metadata.tokens = Some(response.usage);
            Ok(output)
        }
        StepType::Connector | StepType::Integration | StepType::Builtin => {
            let reference = step
                .reference
                .as_deref()
                .or(step.builtin.as_deref())
                .ok_or_else(|| DispatchError::Upstream {
                    message: format!("{} step has no reference", step.step_type.as_str()),
                    retriable: false,
                })?;
            let result = engine
                .registry
                .execute(cancel, reference, &Value::Object(inputs.clone()))
                .await?;
            let text = value_to_string(&result.response);
            // Object responses flatten into the step's data so templates can
            // reference their fields directly; anything else lands under
            // `body`.
            let mut data = match result.response {
                Value::Object(map) => map,
                other => Map::from_iter([("body".to_string(), other)]),
            };
            data.entry("status_code".to_string())
                .or_insert(json!(result.status_code));
            Ok(StepOutput::success(text, Value::Object(data)))
        }
        // Transform steps only reshape data through the resolver.
        StepType::Transform => {
            let text = inputs.get("value").map(value_to_string).unwrap_or_default();
            Ok(StepOutput::success(text, Value::Object(inputs.clone())))
        }
        _ => Err(DispatchError::Upstream {
            message: format!("{} is not a leaf step", step.step_type.as_str()),
            retriable: false,
        }),
    }
}

// ---------------------------------------------------------------------------
// Parallel and foreach drivers
// ---------------------------------------------------------------------------

fn effective_concurrency(children: usize, configured: Option<u32>) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|c| c.get())
        .unwrap_or(1);
    let limit = match configured {
        None | Some(0) => children.min(cores),
        Some(c) => c as usize,
    };
    limit.clamp(1, MAX_CONCURRENCY_LIMIT as usize)
}

async fn run_parallel<R, L, C, J>(
    engine: &Arc<Engine<R, L, C, J>>,
    frame: &Frame,
    step: &StepDefinition,
    ctx: &WorkflowContext,
    overlay: &Map<String, Value>,
) -> StepResult
where
    R: ConnectorRegistry + 'static,
    L: LlmProvider + 'static,
    C: Clock + 'static,
    J: JitterSource + 'static,
{
    let children = step.steps.len();
    let limit = effective_concurrency(children, step.max_concurrency);
    let semaphore = Arc::new(Semaphore::new(limit));
    let child_cancel = frame.cancel.child_token();
    debug!(step_id = %step.id, children, limit, "parallel fan-out");

    let mut join_set = JoinSet::new();
    for (index, child) in step.steps.iter().cloned().enumerate() {
        let engine = Arc::clone(engine);
        let ctx = ctx.clone();
        let overlay = overlay.clone();
        let semaphore = Arc::clone(&semaphore);
        let child_frame = Frame {
            cancel: child_cancel.clone(),
            ..frame.clone()
        };
        join_set.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (index, child.id.clone(), Err(EngineError::Cancelled)),
            };
            if child_frame.cancel.is_cancelled() {
                return (index, child.id.clone(), Err(EngineError::Cancelled));
            }
            let result = run_step(&engine, &child_frame, &child, &ctx, &overlay).await;
            (index, child.id, result)
        });
    }

    // Pre-allocated slots keyed by declared position, so aggregation is
    // deterministic regardless of completion order.
    let mut slots: Vec<Option<(String, StepOutput)>> = (0..children).map(|_| None).collect();
    let mut first_failure: Option<EngineError> = None;

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, id, Ok(output))) => slots[index] = Some((id, output)),
            Ok((_, id, Err(EngineError::Cancelled))) => {
                debug!(step_id = %id, "parallel child cancelled");
            }
            Ok((_, id, Err(error))) => {
                if first_failure.is_none() {
                    warn!(step_id = %id, %error, "parallel child failed, cancelling siblings");
                    child_cancel.cancel();
                    first_failure = Some(error);
                }
            }
            Err(join_error) => {
                if first_failure.is_none() {
                    child_cancel.cancel();
                    first_failure = Some(EngineError::Step(StepError {
                        step_id: step.id.clone(),
                        kind: step.step_type.as_str(),
                        cause: join_error.to_string(),
                        attempt: 1,
                        retriable: false,
                    }));
                }
            }
        }
    }

    let mut completed = 0usize;
    for slot in slots.into_iter().flatten() {
        let (id, output) = slot;
        completed += 1;
        ctx.set_step_output(&id, output)?;
    }

    if let Some(error) = first_failure {
        return Err(error);
    }
    if frame.cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    Ok(StepOutput::success(
        format!("{completed} parallel step(s) completed"),
        json!({ "completed": completed }),
    ))
}

async fn run_foreach<R, L, C, J>(
    engine: &Arc<Engine<R, L, C, J>>,
    frame: &Frame,
    step: &StepDefinition,
    ctx: &WorkflowContext,
    overlay: &Map<String, Value>,
) -> StepResult
where
    R: ConnectorRegistry + 'static,
    L: LlmProvider + 'static,
    C: Clock + 'static,
    J: JitterSource + 'static,
{
    let scope = scope_with_overlay(ctx, overlay);
    let template = step
        .foreach
        .as_deref()
        .ok_or_else(|| step_error(step, "foreach step has no template", false))?;

    let items = match resolver::resolve_string(&engine.template, template, &scope) {
        Value::Array(items) => items,
        other => {
            return Err(step_error(
                step,
                format!("foreach resolved to {}, not an array", value_kind(&other)),
                false,
            ));
        }
    };
    if items.len() > MAX_FOREACH_ITEMS {
        return Err(step_error(
            step,
            format!("foreach array has {} elements (limit {MAX_FOREACH_ITEMS})", items.len()),
            false,
        ));
    }

    let total = items.len();
    let limit = effective_concurrency(total, step.max_concurrency);
    let semaphore = Arc::new(Semaphore::new(limit));
    let child_cancel = frame.cancel.child_token();
    let body = Arc::new(step.steps.clone());
    debug!(step_id = %step.id, total, limit, "foreach fan-out");

    let mut join_set = JoinSet::new();
    for (index, item) in items.into_iter().enumerate() {
        let engine = Arc::clone(engine);
        let iter_ctx = ctx.fork();
        let body = Arc::clone(&body);
        let semaphore = Arc::clone(&semaphore);
        let mut iter_overlay = overlay.clone();
        iter_overlay.insert("item".to_string(), item);
        iter_overlay.insert("index".to_string(), json!(index));
        let child_frame = Frame {
            cancel: child_cancel.clone(),
            ..frame.clone()
        };
        join_set.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (index, Err(EngineError::Cancelled)),
            };
            if child_frame.cancel.is_cancelled() {
                return (index, Err(EngineError::Cancelled));
            }
            let result = run_sequence(&engine, &child_frame, &body, &iter_ctx, &iter_overlay)
                .await
                .map(|()| body_outputs(&body, &iter_ctx));
            (index, result)
        });
    }

    let mut slots: Vec<Option<Value>> = (0..total).map(|_| None).collect();
    let mut first_failure: Option<EngineError> = None;

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, Ok(entry))) => slots[index] = Some(entry),
            Ok((_, Err(EngineError::Cancelled))) => {}
            Ok((index, Err(error))) => {
                if first_failure.is_none() {
                    warn!(step_id = %step.id, index, %error, "foreach iteration failed, cancelling siblings");
                    child_cancel.cancel();
                    first_failure = Some(error);
                }
            }
            Err(join_error) => {
                if first_failure.is_none() {
                    child_cancel.cancel();
                    first_failure = Some(step_error(step, join_error.to_string(), false));
                }
            }
        }
    }

    if let Some(error) = first_failure {
        return Err(error);
    }
    if frame.cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    // Aggregation preserves input order regardless of completion order.
    let results: Vec<Value> = slots
        .into_iter()
        .map(|slot| slot.unwrap_or(Value::Null))
        .collect();
    Ok(StepOutput::success(
        format!("{total} iteration(s) completed"),
        json!({ "results": results, "count": total }),
    ))
}

/// Project an iteration body's outputs into one JSON object keyed by step id.
fn body_outputs(body: &[StepDefinition], ctx: &WorkflowContext) -> Value {
    let mut entry = Map::new();
    for step in body {
        if let Some(output) = ctx.step_output(&step.id) {
            entry.insert(step.id.clone(), output.to_map());
        }
    }
    Value::Object(entry)
}

// ---------------------------------------------------------------------------
// Condition, loop, subworkflow
// ---------------------------------------------------------------------------

async fn run_condition<R, L, C, J>(
    engine: &Arc<Engine<R, L, C, J>>,
    frame: &Frame,
    step: &StepDefinition,
    ctx: &WorkflowContext,
    overlay: &Map<String, Value>,
) -> StepResult
where
    R: ConnectorRegistry + 'static,
    L: LlmProvider + 'static,
    C: Clock + 'static,
    J: JitterSource + 'static,
{
    let scope = scope_with_overlay(ctx, overlay);
    let matched = match &step.when {
        Some(when) => evaluate_condition(engine, when, &scope),
        None => false,
    };
    let branch = if matched { &step.steps } else { &step.else_steps };
    run_sequence(engine, frame, branch, ctx, overlay).await?;
    Ok(StepOutput::success(
        format!("condition took the {} branch", if matched { "then" } else { "else" }),
        json!({ "condition": matched, "branch": if matched { "then" } else { "else" } }),
    ))
}

async fn run_loop<R, L, C, J>(
    engine: &Arc<Engine<R, L, C, J>>,
    frame: &Frame,
    step: &StepDefinition,
    ctx: &WorkflowContext,
    overlay: &Map<String, Value>,
) -> StepResult
where
    R: ConnectorRegistry + 'static,
    L: LlmProvider + 'static,
    C: Clock + 'static,
    J: JitterSource + 'static,
{
    let max = step
        .max_iterations
        .unwrap_or(MAX_LOOP_ITERATIONS)
        .clamp(1, MAX_LOOP_ITERATIONS);
    let mut history: Vec<Value> = Vec::new();

    for iteration in 1..=max {
        if frame.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let iter_ctx = ctx.fork();
        let mut iter_overlay = overlay.clone();
        iter_overlay.insert(
            "loop".to_string(),
            json!({
                "iteration": iteration,
                "max_iterations": max,
                "history": history,
            }),
        );
        run_sequence(engine, frame, &step.steps, &iter_ctx, &iter_overlay).await?;
        history.push(body_outputs(&step.steps, &iter_ctx));

        if let Some(until) = &step.until {
            // The halting check sees the just-finished iteration's outputs
            // and the updated history.
            iter_overlay.insert(
                "loop".to_string(),
                json!({
                    "iteration": iteration,
                    "max_iterations": max,
                    "history": history,
                }),
            );
            let scope = scope_with_overlay(&iter_ctx, &iter_overlay);
            if evaluate_condition(engine, until, &scope) {
                debug!(step_id = %step.id, iteration, "loop halting condition met");
                break;
            }
        }
    }

    let iterations = history.len();
    Ok(StepOutput::success(
        format!("loop completed after {iterations} iteration(s)"),
        json!({ "iterations": iterations, "history": history }),
    ))
}

async fn run_subworkflow<R, L, C, J>(
    engine: &Arc<Engine<R, L, C, J>>,
    frame: &Frame,
    step: &StepDefinition,
    ctx: &WorkflowContext,
    overlay: &Map<String, Value>,
) -> StepResult
where
    R: ConnectorRegistry + 'static,
    L: LlmProvider + 'static,
    C: Clock + 'static,
    J: JitterSource + 'static,
{
    let name = step
        .workflow
        .as_deref()
        .ok_or_else(|| step_error(step, "subworkflow step has no workflow name", false))?;
    if frame.subworkflow_depth + 1 > MAX_SUBWORKFLOW_DEPTH {
        return Err(EngineError::DepthExceeded {
            max: MAX_SUBWORKFLOW_DEPTH,
        });
    }

    let definition = engine
        .workflows
        .read()
        .expect("workflow registry lock poisoned")
        .get(name)
        .cloned()
        .ok_or_else(|| EngineError::UnknownWorkflow {
            name: name.to_string(),
        })?;

    // The subworkflow's static inputs, overridden by this step's resolved
    // inputs.
    let scope = scope_with_overlay(ctx, overlay);
    let resolved = resolve_inputs(&engine.template, step, &scope);
    let mut inputs = definition.inputs.clone();
    inputs.extend(resolved);

    debug!(step_id = %step.id, subworkflow = name, depth = frame.subworkflow_depth + 1, "delegating to subworkflow");
    let sub_ctx = engine.run_context(&definition.name, inputs);
    let sub_frame = Frame {
        cancel: frame.cancel.clone(),
        subworkflow_depth: frame.subworkflow_depth + 1,
        default_on_error: definition.on_error.clone(),
    };
    run_sequence(engine, &sub_frame, &definition.steps, &sub_ctx, &Map::new()).await?;

    let mut outputs = Map::new();
    for (id, output) in sub_ctx.outputs() {
        outputs.insert(id, output.to_map());
    }
    Ok(StepOutput::success(
        format!("subworkflow {name:?} completed"),
        json!({ "outputs": outputs }),
    ))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The context's template scope with overlay keys (`item`, `index`, `loop`)
/// merged on top.
fn scope_with_overlay(ctx: &WorkflowContext, overlay: &Map<String, Value>) -> Value {
    let mut scope = ctx.template_scope();
    if let Value::Object(map) = &mut scope {
        for (key, value) in overlay {
            map.insert(key.clone(), value.clone());
        }
    }
    scope
}

/// Resolve a step's effective inputs against the scope.
fn resolve_inputs(
    template: &TemplateEngine,
    step: &StepDefinition,
    scope: &Value,
) -> Map<String, Value> {
    let merged: Map<String, Value> = step.effective_inputs().into_iter().collect();
    match resolver::resolve_value(template, &Value::Object(merged), scope) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Evaluate a boolean template (`when`/`until`). Anything that does not
/// resolve to a recognized boolean form counts as false, so a reference to
/// an optional field skips rather than fails.
fn evaluate_condition<R, L, C, J>(
    engine: &Arc<Engine<R, L, C, J>>,
    expression: &str,
    scope: &Value,
) -> bool
where
    R: ConnectorRegistry + 'static,
    L: LlmProvider + 'static,
    C: Clock + 'static,
    J: JitterSource + 'static,
{
    let resolved = resolver::resolve_string(&engine.template, expression, scope);
    match functions::call("toBool", &[resolved]) {
        Ok(Value::Bool(b)) => b,
        _ => {
            debug!(expression, "condition did not resolve to a boolean, treating as false");
            false
        }
    }
}

fn step_error(step: &StepDefinition, cause: impl Into<String>, retriable: bool) -> EngineError {
    EngineError::Step(StepError {
        step_id: step.id.clone(),
        kind: step.step_type.as_str(),
        cause: cause.into(),
        attempt: 1,
        retriable,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
