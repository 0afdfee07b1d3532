//! Device payloads flowing through the validation pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One device snapshot offered to the pipeline.
///
/// The `data` field carries the full object graph the rule engine
/// navigates: nested objects, telemetry point arrays, and embedded parent
/// references for chain traversal. Payload shape is intentionally open;
/// rules address into it by property path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePayload {
    /// Stable device identifier (asset id).
    pub device_id: String,
    /// Asset kind, e.g. "ups", "pdu", "chiller". Selects macro sets.
    pub asset_kind: String,
    /// The navigable object graph.
    pub data: Value,
}

impl DevicePayload {
    /// Create a payload from an id, kind, and object graph.
    pub fn new(device_id: impl Into<String>, asset_kind: impl Into<String>, data: Value) -> Self {
        Self {
            device_id: device_id.into(),
            asset_kind: asset_kind.into(),
            data,
        }
    }
}
