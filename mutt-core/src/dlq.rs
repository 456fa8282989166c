//! The envelope every DLQ item is wrapped in: the original payload plus a
//! recorded reason label, so items are never silently dropped (spec §7).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEnvelope {
    pub reason: String,
    pub raw_payload: Value,
    pub queued_at: DateTime<Utc>,
}

impl DlqEnvelope {
    pub fn new(reason: impl Into<String>, raw_payload: Value) -> Self {
        Self {
            reason: reason.into(),
            raw_payload,
            queued_at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            serde_json::json!({"reason": self.reason, "raw_payload": null}).to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_reason_and_payload() {
        let envelope = DlqEnvelope::new("shed", serde_json::json!({"hostname": "core-01"}));
        let json = envelope.to_json();
        let parsed: DlqEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.reason, "shed");
        assert_eq!(parsed.raw_payload["hostname"], "core-01");
    }
}
