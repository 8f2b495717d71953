#![deny(clippy::print_stdout, clippy::print_stderr)]

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::DateTime;
use chrono::Utc;
use konto_common::BankAccountId;
use konto_common::LegalEntityId;
use konto_common::TenantId;
use konto_common::UserId;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

mod memory;

pub use memory::InMemoryExceptionQueue;

pub type ExceptionId = i64;
pub type StatementLineId = i64;

pub type ExceptionsResult<T> = Result<T, ExceptionsError>;

/// Resolution code written by the auto-resolve path.
pub const RESOLUTION_RECONCILED: &str = "RECONCILED";

#[derive(Debug, Error)]
pub enum ExceptionsError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionStatus {
    Open,
    Assigned,
    Resolved,
    Ignored,
}

impl ExceptionStatus {
    /// Queue ordering: open work first.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            ExceptionStatus::Open => 0,
            ExceptionStatus::Assigned => 1,
            ExceptionStatus::Resolved => 2,
            ExceptionStatus::Ignored => 3,
        }
    }

    #[must_use]
    pub fn is_workable(self) -> bool {
        matches!(self, ExceptionStatus::Open | ExceptionStatus::Assigned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonCode {
    NoRuleMatch,
    AmbiguousTarget,
    PolicyBlocked,
    ApplyError,
    RuleQueueException,
}

impl ReasonCode {
    #[must_use]
    pub fn default_severity(self) -> Severity {
        match self {
            ReasonCode::NoRuleMatch => Severity::Low,
            ReasonCode::AmbiguousTarget | ReasonCode::PolicyBlocked => Severity::Medium,
            ReasonCode::ApplyError => Severity::High,
            ReasonCode::RuleQueueException => Severity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Updated,
    Assigned,
    Resolved,
    Ignored,
    Retried,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionEvent {
    pub kind: EventKind,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    pub id: ExceptionId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub bank_account_id: BankAccountId,
    pub statement_line_id: StatementLineId,
    pub status: ExceptionStatus,
    pub severity: Severity,
    pub reason_code: ReasonCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule_id: Option<i64>,
    #[serde(default)]
    pub suggested_payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to_user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_approval_request_id: Option<i64>,
    pub last_seen_at: DateTime<Utc>,
    pub occurrence_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub events: Vec<ExceptionEvent>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertException {
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub bank_account_id: BankAccountId,
    pub statement_line_id: StatementLineId,
    pub reason_code: ReasonCode,
    pub matched_rule_id: Option<i64>,
    pub suggested_payload: serde_json::Value,
    /// Overrides the reason-code default.
    pub severity: Option<Severity>,
    pub actor: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExceptionFilter {
    pub status: Option<ExceptionStatus>,
    pub bank_account_id: Option<BankAccountId>,
    pub assigned_to_user_id: Option<UserId>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionPage {
    pub items: Vec<Exception>,
    pub next_cursor: Option<String>,
}

/// Opaque queue cursor: `rank|updated_at_micros|id`, base64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub status_rank: u8,
    pub updated_at_micros: i64,
    pub id: ExceptionId,
}

impl Cursor {
    #[must_use]
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!(
            "{}|{}|{}",
            self.status_rank, self.updated_at_micros, self.id
        ))
    }

    pub fn decode(token: &str) -> ExceptionsResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| ExceptionsError::Validation("malformed cursor".into()))?;
        let raw = String::from_utf8(bytes)
            .map_err(|_| ExceptionsError::Validation("malformed cursor".into()))?;
        let mut parts = raw.split('|');
        let (Some(rank), Some(updated), Some(id), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ExceptionsError::Validation("malformed cursor".into()));
        };
        Ok(Self {
            status_rank: rank
                .parse()
                .map_err(|_| ExceptionsError::Validation("malformed cursor".into()))?,
            updated_at_micros: updated
                .parse()
                .map_err(|_| ExceptionsError::Validation("malformed cursor".into()))?,
            id: id
                .parse()
                .map_err(|_| ExceptionsError::Validation("malformed cursor".into()))?,
        })
    }

    /// Sort key: status rank ascending, then most recently updated first.
    #[must_use]
    pub fn sort_key(&self) -> (u8, i64, i64) {
        (self.status_rank, -self.updated_at_micros, -self.id)
    }
}

impl From<&Exception> for Cursor {
    fn from(exception: &Exception) -> Self {
        Self {
            status_rank: exception.status.rank(),
            updated_at_micros: exception.updated_at.timestamp_micros(),
            id: exception.id,
        }
    }
}

#[async_trait]
pub trait ExceptionQueue: Send + Sync {
    /// Updates the line's OPEN/ASSIGNED exception in place, or inserts a
    /// new OPEN one; at most one workable exception exists per line.
    async fn upsert(&self, request: UpsertException) -> ExceptionsResult<Exception>;

    async fn get(
        &self,
        tenant_id: TenantId,
        exception_id: ExceptionId,
    ) -> ExceptionsResult<Exception>;

    async fn list(
        &self,
        tenant_id: TenantId,
        filter: ExceptionFilter,
    ) -> ExceptionsResult<ExceptionPage>;

    /// Assigns (or with `None` releases) a workable exception.
    async fn assign(
        &self,
        tenant_id: TenantId,
        exception_id: ExceptionId,
        user_id: Option<UserId>,
        actor: &str,
    ) -> ExceptionsResult<Exception>;

    async fn resolve(
        &self,
        tenant_id: TenantId,
        exception_id: ExceptionId,
        resolution_code: &str,
        note: Option<String>,
        actor: &str,
    ) -> ExceptionsResult<Exception>;

    async fn ignore(
        &self,
        tenant_id: TenantId,
        exception_id: ExceptionId,
        note: Option<String>,
        actor: &str,
    ) -> ExceptionsResult<Exception>;

    /// Reopens a finished exception for another pass.
    async fn retry(
        &self,
        tenant_id: TenantId,
        exception_id: ExceptionId,
        note: Option<String>,
        actor: &str,
    ) -> ExceptionsResult<Exception>;

    /// Resolves every workable exception of the line with
    /// [`RESOLUTION_RECONCILED`]; invoked when a line reaches MATCHED.
    async fn auto_resolve_open_for_line(
        &self,
        tenant_id: TenantId,
        statement_line_id: StatementLineId,
    ) -> ExceptionsResult<Vec<Exception>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cursor_roundtrip() {
        let cursor = Cursor {
            status_rank: 1,
            updated_at_micros: 1_700_000_000_000_000,
            id: 42,
        };
        let decoded = Cursor::decode(&cursor.encode()).expect("roundtrip");
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn malformed_cursors_are_validation_errors() {
        for token in ["", "!!!", "bm90LWEtY3Vyc29y", "MXwy"] {
            let err = Cursor::decode(token).expect_err("must fail");
            assert!(matches!(err, ExceptionsError::Validation(_)), "{token}");
        }
    }

    #[test]
    fn severity_defaults_by_reason() {
        assert_eq!(ReasonCode::NoRuleMatch.default_severity(), Severity::Low);
        assert_eq!(ReasonCode::ApplyError.default_severity(), Severity::High);
        assert_eq!(
            ReasonCode::AmbiguousTarget.default_severity(),
            Severity::Medium
        );
    }

    #[test]
    fn status_ranks_put_open_first() {
        assert!(ExceptionStatus::Open.rank() < ExceptionStatus::Assigned.rank());
        assert!(ExceptionStatus::Assigned.rank() < ExceptionStatus::Resolved.rank());
        assert!(ExceptionStatus::Open.is_workable());
        assert!(!ExceptionStatus::Ignored.is_workable());
    }
}
