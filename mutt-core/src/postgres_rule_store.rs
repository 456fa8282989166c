//! Read-only Postgres adapter for the rule corpus (spec §3 Rule, §6
//! out-of-scope schema). The dashboard/API layer owns writes; this adapter
//! only ever reads a full snapshot for the rule cache.
//!
//! Queries are built with runtime-checked `sqlx::query_as`/`query` rather
//! than the `query!`/`query_as!` macros the teacher otherwise prefers --
//! those macros validate against a live database (or a checked-in `.sqlx`
//! cache) at compile time, which this adapter cannot produce here. See
//! `DESIGN.md`.

use async_trait::async_trait;
use mutt_contracts::rule_store::{RuleSnapshot, RuleStore, RuleStoreError, RuleStoreResult};
use mutt_types::classification::{DevHosts, TeamMappings};
use mutt_types::rule::{HandlingDecision, MatchType, Rule};
use sqlx::{FromRow, PgPool, Row};
use std::collections::{HashMap, HashSet};

#[derive(FromRow)]
struct RuleRow {
    id: i64,
    match_string: Option<String>,
    trap_oid: Option<String>,
    syslog_severity: Option<String>,
    match_type: String,
    priority: i32,
    prod_handling: String,
    dev_handling: String,
    team_assignment: String,
    is_active: bool,
}

fn parse_match_type(raw: &str) -> Result<MatchType, RuleStoreError> {
    match raw {
        "contains" => Ok(MatchType::Contains),
        "regex" => Ok(MatchType::Regex),
        "oid_prefix" => Ok(MatchType::OidPrefix),
        other => Err(RuleStoreError::Query(format!("unknown match_type {other}"))),
    }
}

fn parse_handling(raw: &str) -> Result<HandlingDecision, RuleStoreError> {
    match raw {
        "page_and_ticket" => Ok(HandlingDecision::PageAndTicket),
        "page_only" => Ok(HandlingDecision::PageOnly),
        "ticket_only" => Ok(HandlingDecision::TicketOnly),
        "ignore" => Ok(HandlingDecision::Ignore),
        other => Err(RuleStoreError::Query(format!("unknown handling decision {other}"))),
    }
}

fn parse_severity(raw: &str) -> Result<mutt_types::event::SyslogSeverity, RuleStoreError> {
    use mutt_types::event::SyslogSeverity::*;
    Ok(match raw {
        "emergency" => Emergency,
        "alert" => Alert,
        "critical" => Critical,
        "error" => Error,
        "warning" => Warning,
        "notice" => Notice,
        "informational" => Informational,
        "debug" => Debug,
        other => return Err(RuleStoreError::Query(format!("unknown syslog_severity {other}"))),
    })
}

impl TryFrom<RuleRow> for Rule {
    type Error = RuleStoreError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        Ok(Rule {
            id: row.id,
            match_string: row.match_string,
            trap_oid: row.trap_oid,
            syslog_severity: row.syslog_severity.as_deref().map(parse_severity).transpose()?,
            match_type: parse_match_type(&row.match_type)?,
            priority: row.priority,
            prod_handling: parse_handling(&row.prod_handling)?,
            dev_handling: parse_handling(&row.dev_handling)?,
            team_assignment: row.team_assignment,
            is_active: row.is_active,
        })
    }
}

#[derive(Clone)]
pub struct PostgresRuleStore {
    pool: PgPool,
}

impl PostgresRuleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RuleStore for PostgresRuleStore {
    async fn load_snapshot(&self) -> RuleStoreResult<RuleSnapshot> {
        let rows = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT id, match_string, trap_oid, syslog_severity, match_type,
                   priority, prod_handling, dev_handling, team_assignment, is_active
            FROM rules
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RuleStoreError::Query(format!("failed to load rules: {e}")))?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            rules.push(Rule::try_from(row)?);
        }

        let dev_host_rows = sqlx::query("SELECT hostname FROM dev_hosts")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RuleStoreError::Query(format!("failed to load dev_hosts: {e}")))?;
        let dev_hosts: HashSet<String> = dev_host_rows
            .iter()
            .map(|r| r.get::<String, _>("hostname"))
            .collect();

        let team_rows = sqlx::query("SELECT hostname, team FROM team_mappings")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RuleStoreError::Query(format!("failed to load team_mappings: {e}")))?;
        let team_mappings: HashMap<String, String> = team_rows
            .iter()
            .map(|r| (r.get::<String, _>("hostname"), r.get::<String, _>("team")))
            .collect();

        Ok(RuleSnapshot {
            rules,
            dev_hosts: DevHosts(dev_hosts),
            team_mappings: TeamMappings(team_mappings),
        })
    }
}
