#![deny(clippy::print_stdout, clippy::print_stderr)]

use async_trait::async_trait;
use chrono::NaiveDate;
use konto_common::BankAccountId;
use konto_common::DifferenceType;
use konto_common::LegalEntityId;
use konto_common::TenantId;
use konto_common::money::AmountMicros;
use konto_common::money::EPSILON_MICROS;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

mod memory;

pub use memory::InMemoryStatements;

pub type StatementLineId = i64;
pub type MatchId = i64;
pub type RuleId = i64;

pub type StatementsResult<T> = Result<T, StatementsError>;

#[derive(Debug, Error)]
pub enum StatementsError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Derived reconciliation state of a statement line. `Ignored` is sticky:
/// it is set and cleared only by the ignore/unignore operations and
/// suppresses derivation while active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconStatus {
    Unmatched,
    Partial,
    Matched,
    Ignored,
}

/// Pure derivation from the matched-total arithmetic.
#[must_use]
pub fn derive_status(amount_micros: AmountMicros, matched_total: AmountMicros) -> ReconStatus {
    if matched_total <= EPSILON_MICROS {
        return ReconStatus::Unmatched;
    }
    let remaining = (amount_micros.abs() - matched_total).abs();
    if remaining <= EPSILON_MICROS {
        ReconStatus::Matched
    } else {
        ReconStatus::Partial
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchType {
    Manual,
    AutoRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchedEntityType {
    Journal,
    PaymentBatch,
    CashTxn,
    ManualAdjustment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStatus {
    Active,
    Reversed,
}

/// How a line got reconciled; copied onto the line by the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconciliationMethod {
    Manual,
    RuleAutoMatch,
    RuleAutoPost,
    RuleReturn,
    RuleDiffExact,
    RuleDiffPay,
    RuleDiffAdj,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementLine {
    pub id: StatementLineId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub bank_account_id: BankAccountId,
    pub import_id: i64,
    pub line_no: i64,
    pub txn_date: NaiveDate,
    pub value_date: Option<NaiveDate>,
    pub description: Option<String>,
    pub reference_no: Option<String>,
    /// Signed; inflow positive, outflow negative.
    pub amount_micros: AmountMicros,
    pub currency_code: String,
    pub balance_after_micros: Option<AmountMicros>,
    pub recon_status: ReconStatus,
    pub reconciliation_method: Option<ReconciliationMethod>,
    pub matched_rule_id: Option<RuleId>,
    pub match_confidence: Option<f32>,
    pub auto_post_template_id: Option<i64>,
    pub auto_post_journal_entry_id: Option<i64>,
    pub difference_profile_id: Option<i64>,
    pub difference_journal_entry_id: Option<i64>,
    pub difference_amount_micros: Option<AmountMicros>,
    pub difference_type: Option<DifferenceType>,
}

impl StatementLine {
    /// Searchable text of the line: description plus reference.
    #[must_use]
    pub fn text_blob(&self) -> String {
        let mut parts = Vec::new();
        if let Some(description) = &self.description {
            parts.push(description.as_str());
        }
        if let Some(reference) = &self.reference_no {
            parts.push(reference.as_str());
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStatementLine {
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub bank_account_id: BankAccountId,
    pub import_id: i64,
    pub line_no: i64,
    pub txn_date: NaiveDate,
    pub value_date: Option<NaiveDate>,
    pub description: Option<String>,
    pub reference_no: Option<String>,
    pub amount_micros: AmountMicros,
    pub currency_code: String,
    pub balance_after_micros: Option<AmountMicros>,
}

impl NewStatementLine {
    pub fn validate(&self) -> StatementsResult<()> {
        if self.currency_code.trim().len() != 3 {
            return Err(StatementsError::Validation(
                "currency must be a 3-letter ISO code".into(),
            ));
        }
        if self.line_no <= 0 {
            return Err(StatementsError::Validation(
                "line_no must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: MatchId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub statement_line_id: StatementLineId,
    pub match_type: MatchType,
    pub matched_entity_type: MatchedEntityType,
    pub matched_entity_id: i64,
    /// Always positive.
    pub matched_amount_micros: AmountMicros,
    pub status: MatchStatus,
    pub notes: Option<String>,
    pub created_by: String,
}

/// Caller-supplied attribution for a new match.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchMeta {
    pub match_type: MatchType,
    pub reconciliation_method: Option<ReconciliationMethod>,
    pub rule_id: Option<RuleId>,
    pub confidence: Option<f32>,
    pub notes: Option<String>,
    pub actor: String,
}

impl MatchMeta {
    #[must_use]
    pub fn manual(actor: impl Into<String>) -> Self {
        Self {
            match_type: MatchType::Manual,
            reconciliation_method: Some(ReconciliationMethod::Manual),
            rule_id: None,
            confidence: None,
            notes: None,
            actor: actor.into(),
        }
    }

    #[must_use]
    pub fn auto_rule(rule_id: RuleId, method: ReconciliationMethod, actor: impl Into<String>) -> Self {
        Self {
            match_type: MatchType::AutoRule,
            reconciliation_method: Some(method),
            rule_id: Some(rule_id),
            confidence: None,
            notes: None,
            actor: actor.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchRequest {
    pub matched_entity_type: MatchedEntityType,
    pub matched_entity_id: i64,
    pub amount_micros: AmountMicros,
    pub meta: MatchMeta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub line: StatementLine,
    pub match_row: Match,
}

/// Result of the idempotent journal reconciliation; `match_row` is absent
/// when a zeroish remaining amount made the call a no-op.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub line: StatementLine,
    pub match_row: Option<Match>,
    pub idempotent: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineFilter {
    pub legal_entity_id: Option<LegalEntityId>,
    pub bank_account_id: Option<BankAccountId>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Suggested,
    Matched,
    Unmatched,
    Ignore,
    Unignore,
    AutoStatus,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Suggested => "SUGGESTED",
            AuditAction::Matched => "MATCHED",
            AuditAction::Unmatched => "UNMATCHED",
            AuditAction::Ignore => "IGNORE",
            AuditAction::Unignore => "UNIGNORE",
            AuditAction::AutoStatus => "AUTO_STATUS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub tenant_id: TenantId,
    pub statement_line_id: StatementLineId,
    pub action: AuditAction,
    pub actor: String,
    pub metadata: serde_json::Value,
}

/// Receives every audit-worthy mutation; wired to the tenant audit trail
/// by the composition root.
pub trait StatementAuditHook: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

#[derive(Default)]
pub struct NoopStatementAuditHook;

impl StatementAuditHook for NoopStatementAuditHook {
    fn record(&self, _event: &AuditEvent) {}
}

/// Notified after a line transitions into `Matched`; the exception queue
/// hangs off this seam to auto-resolve.
#[async_trait]
pub trait MatchedLineObserver: Send + Sync {
    async fn on_line_matched(&self, line: &StatementLine);
}

#[derive(Default)]
pub struct NoopMatchedLineObserver;

#[async_trait]
impl MatchedLineObserver for NoopMatchedLineObserver {
    async fn on_line_matched(&self, _line: &StatementLine) {}
}

/// Confirms a match target exists and is POSTED before a match row is
/// written.
#[async_trait]
pub trait MatchTargetVerifier: Send + Sync {
    async fn verify_posted(
        &self,
        tenant_id: TenantId,
        entity_type: MatchedEntityType,
        entity_id: i64,
    ) -> StatementsResult<()>;
}

/// Accepts every target; used by tests and by hosts that verify upstream.
#[derive(Default)]
pub struct AcceptAllTargets;

#[async_trait]
impl MatchTargetVerifier for AcceptAllTargets {
    async fn verify_posted(
        &self,
        _tenant_id: TenantId,
        _entity_type: MatchedEntityType,
        _entity_id: i64,
    ) -> StatementsResult<()> {
        Ok(())
    }
}

#[async_trait]
pub trait StatementsService: Send + Sync {
    async fn insert_line(&self, line: NewStatementLine) -> StatementsResult<StatementLine>;

    async fn get_line(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
    ) -> StatementsResult<StatementLine>;

    async fn active_matches(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
    ) -> StatementsResult<Vec<Match>>;

    async fn matched_total(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
    ) -> StatementsResult<AmountMicros>;

    /// UNMATCHED/PARTIAL lines in scope, ordered by (txn_date, id).
    async fn list_eligible(
        &self,
        tenant_id: TenantId,
        filter: LineFilter,
    ) -> StatementsResult<Vec<StatementLine>>;

    async fn match_line(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
        request: MatchRequest,
    ) -> StatementsResult<MatchOutcome>;

    /// Reverses one match or, with `match_id = None`, every active match.
    async fn unmatch(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
        match_id: Option<MatchId>,
        actor: &str,
    ) -> StatementsResult<StatementLine>;

    async fn ignore(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
        reason: &str,
        actor: &str,
    ) -> StatementsResult<StatementLine>;

    async fn unignore(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
        reason: &str,
        actor: &str,
    ) -> StatementsResult<StatementLine>;

    /// Idempotent journal reconciliation: an existing active journal match
    /// for the same journal, or a zeroish remaining amount, is a no-op.
    async fn reconcile_to_journal(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
        journal_entry_id: i64,
        amount_micros: Option<AmountMicros>,
        meta: MatchMeta,
    ) -> StatementsResult<ReconcileOutcome>;

    /// Writes the auto-post linkage onto the line.
    async fn record_auto_post(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
        template_id: i64,
        journal_entry_id: i64,
    ) -> StatementsResult<StatementLine>;

    /// Writes the difference linkage onto the line.
    async fn record_difference(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
        profile_id: i64,
        journal_entry_id: i64,
        difference_micros: AmountMicros,
        difference_type: DifferenceType,
    ) -> StatementsResult<StatementLine>;

    fn register_audit_hook(&self, hook: std::sync::Arc<dyn StatementAuditHook>);

    fn register_matched_observer(&self, observer: std::sync::Arc<dyn MatchedLineObserver>);
}
