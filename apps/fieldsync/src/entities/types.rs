//! Syncable entity types
//!
//! Every replicated record (supplier, product, rate, collection, payment)
//! shares one shape: a server id, a client-generated id, an optimistic
//! version, timestamps and a soft-delete tombstone. The payload is opaque
//! to the sync engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Types of entities that can be synced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Supplier,
    Product,
    Rate,
    Collection,
    Payment,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Supplier,
        EntityType::Product,
        EntityType::Rate,
        EntityType::Collection,
        EntityType::Payment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Supplier => "supplier",
            EntityType::Product => "product",
            EntityType::Rate => "rate",
            EntityType::Collection => "collection",
            EntityType::Payment => "payment",
        }
    }

    /// Server table holding rows of this type
    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Supplier => "suppliers",
            EntityType::Product => "products",
            EntityType::Rate => "rates",
            EntityType::Collection => "collections",
            EntityType::Payment => "payments",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "supplier" => Ok(EntityType::Supplier),
            "product" => Ok(EntityType::Product),
            "rate" => Ok(EntityType::Rate),
            "collection" => Ok(EntityType::Collection),
            "payment" => Ok(EntityType::Payment),
            other => Err(format!("unknown entity type: {}", other)),
        }
    }
}

/// Server-side state of a replicated record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableEntity {
    pub entity_type: EntityType,
    /// Server-assigned id, immutable once created
    pub id: i64,
    /// Client-generated id, the join key between a local record and its server row
    pub client_id: String,
    /// Optimistic concurrency token, starts at 1
    pub version: i64,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Tombstone; set rows still replicate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SyncableEntity {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Format a timestamp the way every table stores it
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// Shallow-merge a JSON patch into a stored payload. Patch keys win.
pub fn merge_payload(stored: &Value, patch: &Value) -> Value {
    match (stored, patch) {
        (Value::Object(stored_map), Value::Object(patch_map)) => {
            let mut merged = stored_map.clone();
            for (key, value) in patch_map {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, Value::Null) => stored.clone(),
        _ => patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_type_round_trips_through_str() {
        for entity_type in EntityType::ALL {
            assert_eq!(entity_type.as_str().parse::<EntityType>(), Ok(entity_type));
        }
        assert!("invoice".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_entity_type_serializes_lowercase() {
        let json = serde_json::to_string(&EntityType::Collection).unwrap();
        assert_eq!(json, "\"collection\"");
    }

    #[test]
    fn test_merge_payload() {
        let stored = json!({"name": "Acme", "phone": "111"});
        let patch = json!({"phone": "222", "region": "north"});

        let merged = merge_payload(&stored, &patch);

        assert_eq!(merged["name"], "Acme");
        assert_eq!(merged["phone"], "222");
        assert_eq!(merged["region"], "north");
    }

    #[test]
    fn test_merge_payload_null_patch_keeps_stored() {
        let stored = json!({"name": "Acme"});
        assert_eq!(merge_payload(&stored, &Value::Null), stored);
    }

    #[test]
    fn test_timestamp_format_is_parseable() {
        let now = Utc::now();
        let parsed = parse_timestamp(&format_timestamp(&now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }
}
