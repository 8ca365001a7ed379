use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ember_types::{EntityId, PersistenceState};

use crate::error::{StoreError, StoreResult};

/// The unit of storage: one serialized entity.
///
/// ```json
/// {"id": "…", "schemaVersion": 1, "created": "…", "saved": "…",
///  "item": {…}, "persistenceState": "persistent", "version": 3}
/// ```
///
/// `item` is opaque to the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub id: EntityId,
    pub schema_version: u32,
    pub created: DateTime<Utc>,
    pub saved: Option<DateTime<Utc>>,
    pub item: serde_json::Value,
    pub persistence_state: PersistenceState,
    pub version: u64,
}

impl EntityRecord {
    /// Encode as a JSON document.
    pub fn to_json_bytes(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Decode from a JSON document.
    pub fn from_json_bytes(bytes: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}
