//! 产出校验：agent 的最终产出必须满足其声明的 JSON Schema

use serde_json::Value;

use crate::agent::AgentSpec;
use crate::core::AgentError;

pub fn validate_deliverable(spec: &AgentSpec, value: &Value) -> Result<(), AgentError> {
    let Some(schema) = &spec.deliverable_schema else {
        return Ok(());
    };
    let validator = jsonschema::validator_for(schema).map_err(|e| AgentError::InvalidDeliverable {
        agent: spec.id.clone(),
        detail: format!("invalid schema: {e}"),
    })?;
    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| e.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AgentError::InvalidDeliverable {
            agent: spec.id.clone(),
            detail: errors.join("; "),
        })
    }
}
