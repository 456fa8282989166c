use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MuttError, Result};

/// Maximum allowed length of `Event::hostname`.
pub const MAX_HOSTNAME_LEN: usize = 255;
/// Maximum allowed byte length of `Event::message`.
pub const MAX_MESSAGE_LEN: usize = 65_535;

/// Where an event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Syslog,
    Snmp,
    Webhook,
    Other,
}

/// Syslog severity levels (RFC 5424), lowest value is most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyslogSeverity {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Informational,
    Debug,
}

/// A monitoring event as it arrives at the ingest gateway.
///
/// `extra` retains any vendor-specific fields verbatim so downstream
/// consumers (audit store, dashboard) can inspect the raw payload without
/// the core pipeline needing to understand every vendor's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub source_type: SourceType,
    pub hostname: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trap_oid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syslog_severity: Option<SyslogSeverity>,
    #[serde(default = "Uuid::new_v4")]
    pub correlation_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Event {
    /// Validate the fields required by the spec; does not mutate `self`.
    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(MuttError::Validation("hostname must not be empty".into()));
        }
        if self.hostname.len() > MAX_HOSTNAME_LEN {
            return Err(MuttError::Validation(format!(
                "hostname exceeds {MAX_HOSTNAME_LEN} bytes"
            )));
        }
        if self.message.len() > MAX_MESSAGE_LEN {
            return Err(MuttError::Validation(format!(
                "message exceeds {MAX_MESSAGE_LEN} bytes"
            )));
        }
        if let Some(oid) = &self.trap_oid {
            if oid.is_empty() || !oid.chars().all(|c| c.is_ascii_digit() || c == '.') {
                return Err(MuttError::Validation(format!(
                    "trap_oid is not dotted-decimal: {oid}"
                )));
            }
        }
        Ok(())
    }

    /// Stamp `received_at` if absent. `correlation_id` already defaults via serde.
    pub fn stamp_received(&mut self, now: DateTime<Utc>) {
        if self.received_at.is_none() {
            self.received_at = Some(now);
        }
    }

    /// A fingerprint used to aggregate unhandled events: hostname plus a
    /// normalized message (lowercased, digits collapsed) so near-duplicate
    /// messages bucket together.
    pub fn unhandled_fingerprint(&self) -> String {
        let normalized: String = self
            .message
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_digit() { '#' } else { c })
            .collect();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        use std::hash::{Hash, Hasher};
        normalized.hash(&mut hasher);
        format!("{:x}", hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Event {
        Event {
            source_type: SourceType::Syslog,
            hostname: "core-01".into(),
            timestamp: Utc::now(),
            message: "Interface down on Gi0/1".into(),
            trap_oid: None,
            syslog_severity: None,
            correlation_id: Uuid::new_v4(),
            received_at: None,
            extra: HashMap::new(),
        }
    }

    #[test]
    fn rejects_empty_hostname() {
        let mut e = sample();
        e.hostname = String::new();
        assert!(e.validate().is_err());
    }

    #[test]
    fn rejects_oversize_message() {
        let mut e = sample();
        e.message = "x".repeat(MAX_MESSAGE_LEN + 1);
        assert!(e.validate().is_err());
    }

    #[test]
    fn rejects_non_dotted_oid() {
        let mut e = sample();
        e.trap_oid = Some("not-an-oid".into());
        assert!(e.validate().is_err());
    }

    #[test]
    fn fingerprint_ignores_digits() {
        let mut a = sample();
        a.message = "disk 12 full".into();
        let mut b = sample();
        b.message = "disk 99 full".into();
        assert_eq!(a.unhandled_fingerprint(), b.unhandled_fingerprint());
    }
}
