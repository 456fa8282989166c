use serde::{Deserialize, Serialize};

use crate::event::SyslogSeverity;

/// How a rule's `match_string`/`trap_oid` fields are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Contains,
    Regex,
    OidPrefix,
}

/// What the alerter should do once a rule (or meta-alert) fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlingDecision {
    PageAndTicket,
    PageOnly,
    TicketOnly,
    Ignore,
}

/// Deployment environment a hostname belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Prod,
    Dev,
}

/// A single operator-defined classification rule, as read from the
/// relational rule store. The core treats this as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trap_oid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syslog_severity: Option<SyslogSeverity>,
    pub match_type: MatchType,
    pub priority: i32,
    pub prod_handling: HandlingDecision,
    pub dev_handling: HandlingDecision,
    pub team_assignment: String,
    pub is_active: bool,
}

impl Rule {
    /// A rule must specify at least one of `match_string` or `trap_oid`.
    pub fn is_well_formed(&self) -> bool {
        self.match_string.is_some() || self.trap_oid.is_some()
    }

    pub fn handling_for(&self, env: Environment) -> HandlingDecision {
        match env {
            Environment::Prod => self.prod_handling,
            Environment::Dev => self.dev_handling,
        }
    }
}
