//! Shared domain types for the Weft workflow engine.
//!
//! This crate contains the definition data model: workflows, steps,
//! connectors, triggers, security policies, and retry/error-handling
//! configuration. Zero infrastructure dependencies -- only serde and
//! serde_json.

pub mod workflow;
