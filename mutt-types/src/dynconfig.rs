use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single audit record produced by every successful dynamic-config write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigAuditRecord {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub changed_by: String,
    pub reason: String,
    pub changed_at: DateTime<Utc>,
    pub version: u64,
}

/// A versioned dynamic config value as stored in the queue substrate's KV
/// store at `mutt:config:{key}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynConfigValue {
    pub key: String,
    pub value: String,
    pub version: u64,
    pub changed_at: DateTime<Utc>,
    pub changed_by: String,
    pub reason: String,
}
