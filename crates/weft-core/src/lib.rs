//! Weft workflow execution engine.
//!
//! This crate turns a parsed [`weft_types::workflow::Definition`] into a
//! running workflow: steps execute in declared order, templates resolve
//! against the accumulated context, and compound steps (parallel, foreach,
//! condition, loop, subworkflow) drive their bodies recursively.
//!
//! The engine performs no I/O of its own. Connector operations and LLM
//! completions go through the [`connector::ConnectorRegistry`] and
//! [`connector::LlmProvider`] ports supplied by the host, which also makes
//! retry timing and cancellation fully testable.
//!
//! Typical flow:
//!
//! ```ignore
//! let definition = definition::load_workflow("digest.yaml")?;
//! let engine = Arc::new(executor::Engine::new(registry, llm));
//! let outputs = engine.run(definition, inputs).await?;
//! ```

pub mod connector;
pub mod context;
pub mod definition;
pub mod executor;
pub mod functions;
pub mod output;
pub mod resolver;
pub mod retry;
pub mod template;
pub mod validate;
