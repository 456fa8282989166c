use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::rule::{Environment, HandlingDecision};

/// The outcome of classifying an `Event` against the rule cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    #[serde(flatten)]
    pub event: Event,
    pub matched_rule_id: Option<i64>,
    pub handling_decision: HandlingDecision,
    pub team_assignment: String,
    pub environment: Environment,
}

impl Alert {
    pub fn is_meta_alert(&self) -> bool {
        self.matched_rule_id.is_none()
    }
}
