//! Parsing, validation, and persistence of workflow definitions.
//!
//! A definition document is YAML (JSON is a subset and parses too). Parsing
//! always runs the structural validator, so a `Definition` obtained through
//! this module is known to be well-formed. The security pass is advisory
//! and left to the caller via [`crate::validate::validate_security`].

use std::path::Path;

use tracing::info;

use weft_types::workflow::Definition;

use crate::validate::{ValidationError, validate_structure};

/// Errors from loading or saving a workflow definition.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("failed to parse workflow document: {0}")]
    Parse(#[from] serde_yaml_ng::Error),

    #[error(
        "invalid workflow definition ({} issue(s)): {}",
        errors.len(),
        errors.first().map(|e| e.to_string()).unwrap_or_default()
    )]
    Invalid { errors: Vec<ValidationError> },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parse a YAML document into a structurally valid [`Definition`].
pub fn parse_workflow_yaml(yaml: &str) -> Result<Definition, DefinitionError> {
    let definition: Definition = serde_yaml_ng::from_str(yaml)?;
    let errors = validate_structure(&definition);
    if !errors.is_empty() {
        return Err(DefinitionError::Invalid { errors });
    }
    info!(
        workflow = %definition.name,
        steps = definition.steps.len(),
        "parsed workflow definition"
    );
    Ok(definition)
}

/// Serialize a definition back to YAML.
pub fn serialize_workflow_yaml(definition: &Definition) -> Result<String, DefinitionError> {
    Ok(serde_yaml_ng::to_string(definition)?)
}

/// Load and parse a definition from a file.
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Definition, DefinitionError> {
    let yaml = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&yaml)
}

/// Serialize a definition and write it to a file, creating parent
/// directories as needed.
pub fn save_workflow(path: impl AsRef<Path>, definition: &Definition) -> Result<(), DefinitionError> {
    let yaml = serialize_workflow_yaml(definition)?;
    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, yaml)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_YAML: &str = r#"
name: digest
steps:
  - id: gather
    type: llm
    model: claude-sonnet-4-20250514
    prompt: "Summarize {{.topic}}"
"#;

    #[test]
    fn test_parse_valid_yaml() {
        let def = parse_workflow_yaml(VALID_YAML).unwrap();
        assert_eq!(def.name, "digest");
        assert_eq!(def.steps.len(), 1);
    }

    #[test]
    fn test_parse_rejects_malformed_yaml() {
        let err = parse_workflow_yaml("name: [unclosed").unwrap_err();
        assert!(matches!(err, DefinitionError::Parse(_)));
    }

    #[test]
    fn test_parse_rejects_invalid_structure() {
        let yaml = r#"
name: broken
steps:
  - id: gather
    type: llm
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        let DefinitionError::Invalid { errors } = err else {
            panic!("expected Invalid");
        };
        assert_eq!(errors.len(), 2); // missing model and prompt
    }

    #[test]
    fn test_roundtrip_through_file() {
        let def = parse_workflow_yaml(VALID_YAML).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("digest.yaml");
        save_workflow(&path, &def).unwrap();
        let loaded = load_workflow(&path).unwrap();
        assert_eq!(loaded.name, def.name);
        assert_eq!(loaded.steps.len(), def.steps.len());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = load_workflow("/nonexistent/wf.yaml").unwrap_err();
        assert!(matches!(err, DefinitionError::Io(_)));
    }
}
