//! Payload validation hook
//!
//! Field rules for each entity live with the business logic, outside the
//! sync engine. The resolver only asks this trait whether a payload may be
//! written and turns a refusal into a per-entry validation rejection.

use serde_json::Value;

use super::types::OperationType;
use crate::entities::EntityType;

pub trait PayloadValidator: Send + Sync {
    fn validate(
        &self,
        entity_type: EntityType,
        operation: OperationType,
        payload: &Value,
    ) -> Result<(), String>;
}

/// Accepts any JSON object payload
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonObjectValidator;

impl PayloadValidator for JsonObjectValidator {
    fn validate(
        &self,
        entity_type: EntityType,
        operation: OperationType,
        payload: &Value,
    ) -> Result<(), String> {
        match (operation, payload) {
            (OperationType::Delete, _) => Ok(()),
            (_, Value::Object(_)) => Ok(()),
            _ => Err(format!(
                "{} payload for {} must be a JSON object",
                entity_type, operation
            )),
        }
    }
}
