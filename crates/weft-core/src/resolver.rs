//! Parameter resolution: turning templated step inputs into concrete values.
//!
//! Resolution walks arbitrarily nested values. String leaves go through one
//! of two modes:
//!
//! 1. Pure-reference mode: a string that is exactly one `{{.path}}`
//!    expression resolves to the raw typed value at that path, so arrays
//!    stay arrays and integers stay integers. A missing path falls back to
//!    the original string.
//! 2. Text mode: everything else renders through the template engine. A
//!    render that produced `<no value>` (or failed outright) returns the
//!    original string unchanged, so a reference to an optional field never
//!    fails a run.
//!
//! Maps and sequences are resolved recursively; non-string leaves pass
//! through untouched.

use serde_json::Value;
use tracing::debug;

use crate::template::{NO_VALUE, TemplateEngine, as_pure_reference, lookup_path};

/// Resolve every templated string inside `input` against `scope`.
pub fn resolve_value(engine: &TemplateEngine, input: &Value, scope: &Value) -> Value {
    match input {
        Value::String(s) => resolve_string(engine, s, scope),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(engine, v, scope)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_value(engine, v, scope))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve one string leaf, choosing pure-reference or text mode.
pub fn resolve_string(engine: &TemplateEngine, input: &str, scope: &Value) -> Value {
    if !input.contains("{{") {
        return Value::String(input.to_string());
    }

    if let Some(path) = as_pure_reference(input) {
        return match lookup_path(path, scope) {
            Some(value) => value,
            None => {
                debug!(path, "template path not found, keeping original text");
                Value::String(input.to_string())
            }
        };
    }

    match engine.render(input, scope) {
        Ok(rendered) if rendered.contains(NO_VALUE) => {
            debug!("template rendered undefined references, keeping original text");
            Value::String(input.to_string())
        }
        Ok(rendered) => Value::String(rendered),
        Err(error) => {
            debug!(%error, "template failed to render, keeping original text");
            Value::String(input.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "user": "alice",
            "count": 7,
            "items": [1, 2, 3],
            "steps": {
                "fetch": { "text": "fetched", "status_code": 200 }
            }
        })
    }

    #[test]
    fn test_pure_reference_preserves_type() {
        let engine = TemplateEngine::new();
        assert_eq!(
            resolve_string(&engine, "{{.items}}", &scope()),
            json!([1, 2, 3])
        );
        assert_eq!(resolve_string(&engine, "{{.count}}", &scope()), json!(7));
        assert_eq!(
            resolve_string(&engine, "  {{ .steps.fetch.status_code }} ", &scope()),
            json!(200)
        );
    }

    #[test]
    fn test_pure_reference_missing_falls_back_to_original() {
        let engine = TemplateEngine::new();
        assert_eq!(
            resolve_string(&engine, "{{.nope.deep}}", &scope()),
            json!("{{.nope.deep}}")
        );
    }

    #[test]
    fn test_text_mode_substitutes() {
        let engine = TemplateEngine::new();
        assert_eq!(
            resolve_string(&engine, "hello {{.user}}", &scope()),
            json!("hello alice")
        );
    }

    #[test]
    fn test_text_mode_undefined_returns_original() {
        let engine = TemplateEngine::new();
        assert_eq!(
            resolve_string(&engine, "hello {{.missing}}", &scope()),
            json!("hello {{.missing}}")
        );
    }

    #[test]
    fn test_text_mode_syntax_error_returns_original() {
        let engine = TemplateEngine::new();
        assert_eq!(
            resolve_string(&engine, "broken {{.user", &scope()),
            json!("broken {{.user")
        );
    }

    #[test]
    fn test_plain_string_is_identity() {
        let engine = TemplateEngine::new();
        assert_eq!(
            resolve_string(&engine, "no templates", &scope()),
            json!("no templates")
        );
    }

    #[test]
    fn test_recursive_resolution_of_maps_and_arrays() {
        let engine = TemplateEngine::new();
        let input = json!({
            "greeting": "hi {{.user}}",
            "raw": "{{.items}}",
            "nested": { "n": "{{.count}}", "keep": 42 },
            "list": ["{{.user}}", true]
        });
        let resolved = resolve_value(&engine, &input, &scope());
        assert_eq!(
            resolved,
            json!({
                "greeting": "hi alice",
                "raw": [1, 2, 3],
                "nested": { "n": 7, "keep": 42 },
                "list": ["alice", true]
            })
        );
    }

    #[test]
    fn test_non_string_leaves_pass_through() {
        let engine = TemplateEngine::new();
        assert_eq!(resolve_value(&engine, &json!(3.5), &scope()), json!(3.5));
        assert_eq!(resolve_value(&engine, &Value::Null, &scope()), Value::Null);
    }

    #[test]
    fn test_function_call_in_text_mode() {
        let engine = TemplateEngine::new();
        assert_eq!(
            resolve_string(&engine, "{{.user | upper}}!", &scope()),
            json!("ALICE!")
        );
    }
}
