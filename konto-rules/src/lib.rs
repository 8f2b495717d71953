#![deny(clippy::print_stdout, clippy::print_stderr)]

use async_trait::async_trait;
use chrono::NaiveDate;
use konto_common::ApprovalState;
use konto_common::DifferenceType;
use konto_common::GlAccountId;
use konto_common::ScopeSelector;
use konto_common::TenantId;
use konto_common::money::AmountMicros;
use konto_common::DebitCredit;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

mod engine;
mod memory;

pub use engine::BatchCandidateRow;
pub use engine::Candidate;
pub use engine::CandidateSources;
pub use engine::JournalCandidateRow;
pub use engine::LineView;
pub use engine::MatchTarget;
pub use engine::Outcome;
pub use engine::PaymentLineCandidateRow;
pub use engine::RuleEngine;
pub use memory::InMemoryProfileStore;
pub use memory::InMemoryRuleStore;
pub use memory::InMemoryTemplateStore;

pub type RuleId = i64;
pub type TemplateId = i64;
pub type ProfileId = i64;

pub type RulesResult<T> = Result<T, RulesError>;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleStatus {
    Active,
    Paused,
    Disabled,
}

/// Which candidate universe the rule searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleMatchKind {
    PaymentByBankReference,
    PaymentByTextAndAmount,
    JournalByTextAndAmount,
    JournalByReferenceAndAmount,
}

impl RuleMatchKind {
    #[must_use]
    pub fn searches_journals(self) -> bool {
        matches!(
            self,
            RuleMatchKind::JournalByTextAndAmount | RuleMatchKind::JournalByReferenceAndAmount
        )
    }
}

/// Kind of return event a PROCESS_PAYMENT_RETURN rule raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnEventKind {
    PaymentRejected,
    PaymentReturned,
}

/// Per-action payload; the variant carries exactly the references the
/// executor needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleAction {
    AutoMatchPaymentBatch,
    AutoMatchJournal,
    AutoMatchPaymentLineWithDifference { profile_id: ProfileId },
    AutoPostTemplate { template_id: TemplateId },
    ProcessPaymentReturn {
        event_type: ReturnEventKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    QueueException {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    SuggestOnly,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConditions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_includes_any: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub text_includes_any: Vec<String>,
    #[serde(default)]
    pub require_reference: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debit_credit: Option<DebitCredit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency_code: Option<String>,
    #[serde(default)]
    pub amount_tolerance_micros: AmountMicros,
    #[serde(default)]
    pub date_lag_days: i64,
}

impl RuleConditions {
    pub fn validate(&self) -> RulesResult<()> {
        if self.amount_tolerance_micros < 0 {
            return Err(RulesError::Validation(
                "amount tolerance must not be negative".into(),
            ));
        }
        if !(0..=365).contains(&self.date_lag_days) {
            return Err(RulesError::Validation(
                "date lag must be between 0 and 365 days".into(),
            ));
        }
        if self
            .reference_includes_any
            .iter()
            .chain(self.text_includes_any.iter())
            .any(|needle| needle.trim().is_empty())
        {
            return Err(RulesError::Validation(
                "text conditions must not contain blank needles".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub tenant_id: TenantId,
    /// Unique per tenant.
    pub rule_code: String,
    pub rule_name: String,
    pub status: RuleStatus,
    /// Smaller fires earlier.
    pub priority: i32,
    pub scope: ScopeSelector,
    pub match_kind: RuleMatchKind,
    pub action: RuleAction,
    pub conditions: RuleConditions,
    pub stop_on_match: bool,
    #[serde(flatten)]
    pub window: konto_common::EffectiveWindow,
    pub approval_state: ApprovalState,
    pub version_no: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_request_id: Option<i64>,
}

impl Rule {
    pub fn validate(&self) -> RulesResult<()> {
        if self.rule_code.trim().is_empty() {
            return Err(RulesError::Validation("rule code must be provided".into()));
        }
        if self.rule_name.trim().is_empty() {
            return Err(RulesError::Validation("rule name must be provided".into()));
        }
        self.scope
            .validate()
            .map_err(|err| RulesError::Validation(err.to_string()))?;
        self.conditions.validate()?;
        match &self.action {
            RuleAction::AutoPostTemplate { template_id } if *template_id <= 0 => Err(
                RulesError::Validation("auto-post rule requires a posting template".into()),
            ),
            RuleAction::AutoMatchPaymentLineWithDifference { profile_id } if *profile_id <= 0 => {
                Err(RulesError::Validation(
                    "difference rule requires a difference profile".into(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Whether the rule fires for a posting date, ignoring scope.
    #[must_use]
    pub fn is_effective(&self, txn_date: NaiveDate) -> bool {
        self.status == RuleStatus::Active
            && self.approval_state == ApprovalState::Approved
            && self.window.contains(txn_date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateStatus {
    Active,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaxMode {
    None,
    Included,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectionPolicy {
    InflowOnly,
    OutflowOnly,
    Both,
}

impl DirectionPolicy {
    #[must_use]
    pub fn allows(self, amount_micros: AmountMicros) -> bool {
        match self {
            DirectionPolicy::InflowOnly => amount_micros > 0,
            DirectionPolicy::OutflowOnly => amount_micros < 0,
            DirectionPolicy::Both => amount_micros != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptionMode {
    UseStatementText,
    Prefixed,
    FixedText,
}

/// Declarative auto-posting recipe: one counter account, optional
/// included-tax split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingTemplate {
    pub id: TemplateId,
    pub tenant_id: TenantId,
    pub name: String,
    pub status: TemplateStatus,
    pub scope: ScopeSelector,
    pub counter_account_id: GlAccountId,
    pub tax_mode: TaxMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_account_id: Option<GlAccountId>,
    /// Basis points; meaningful only when `tax_mode` is `Included`.
    #[serde(default)]
    pub tax_rate_bps: i64,
    pub direction_policy: DirectionPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_amount_abs_micros: Option<AmountMicros>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount_abs_micros: Option<AmountMicros>,
    pub currency_code: String,
    pub description_mode: DescriptionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_description: Option<String>,
    #[serde(flatten)]
    pub window: konto_common::EffectiveWindow,
    pub approval_state: ApprovalState,
    pub version_no: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_request_id: Option<i64>,
}

impl PostingTemplate {
    pub fn validate(&self) -> RulesResult<()> {
        if self.name.trim().is_empty() {
            return Err(RulesError::Validation(
                "template name must be provided".into(),
            ));
        }
        self.scope
            .validate()
            .map_err(|err| RulesError::Validation(err.to_string()))?;
        if self.currency_code.trim().len() != 3 {
            return Err(RulesError::Validation(
                "template currency must be a 3-letter ISO code".into(),
            ));
        }
        if self.tax_mode == TaxMode::Included {
            if self.tax_account_id.is_none() {
                return Err(RulesError::Validation(
                    "included tax requires a tax account".into(),
                ));
            }
            if !(1..10_000).contains(&self.tax_rate_bps) {
                return Err(RulesError::Validation(
                    "included tax rate must be strictly between 0 and 100 percent".into(),
                ));
            }
        }
        if let (Some(min), Some(max)) = (self.min_amount_abs_micros, self.max_amount_abs_micros)
            && min > max
        {
            return Err(RulesError::Validation(
                "template min amount exceeds max amount".into(),
            ));
        }
        if self.description_mode == DescriptionMode::FixedText
            && self
                .fixed_description
                .as_deref()
                .unwrap_or_default()
                .trim()
                .is_empty()
        {
            return Err(RulesError::Validation(
                "fixed-text template requires a description".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffDirectionPolicy {
    Both,
    IncreaseOnly,
    DecreaseOnly,
}

impl DiffDirectionPolicy {
    /// `diff_signed` is actual minus expected.
    #[must_use]
    pub fn allows(self, diff_signed: AmountMicros) -> bool {
        match self {
            DiffDirectionPolicy::Both => true,
            DiffDirectionPolicy::IncreaseOnly => diff_signed > 0,
            DiffDirectionPolicy::DecreaseOnly => diff_signed < 0,
        }
    }
}

/// Tolerance and GL wiring for absorbing FX/fee differences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferenceProfile {
    pub id: ProfileId,
    pub tenant_id: TenantId,
    pub name: String,
    pub status: TemplateStatus,
    pub scope: ScopeSelector,
    pub difference_type: DifferenceType,
    pub direction_policy: DiffDirectionPolicy,
    pub max_abs_difference_micros: AmountMicros,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expense_account_id: Option<GlAccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fx_gain_account_id: Option<GlAccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fx_loss_account_id: Option<GlAccountId>,
    pub currency_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_prefix: Option<String>,
    #[serde(flatten)]
    pub window: konto_common::EffectiveWindow,
    pub approval_state: ApprovalState,
    pub version_no: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_request_id: Option<i64>,
}

impl DifferenceProfile {
    pub fn validate(&self) -> RulesResult<()> {
        if self.name.trim().is_empty() {
            return Err(RulesError::Validation(
                "profile name must be provided".into(),
            ));
        }
        self.scope
            .validate()
            .map_err(|err| RulesError::Validation(err.to_string()))?;
        if self.max_abs_difference_micros < 0 {
            return Err(RulesError::Validation(
                "max absolute difference must not be negative".into(),
            ));
        }
        match self.difference_type {
            DifferenceType::Fee if self.expense_account_id.is_none() => Err(
                RulesError::Validation("fee profile requires an expense account".into()),
            ),
            DifferenceType::Fx
                if self.fx_gain_account_id.is_none() || self.fx_loss_account_id.is_none() =>
            {
                Err(RulesError::Validation(
                    "fx profile requires gain and loss accounts".into(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Scope + date filter for the active-rule listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveRuleQuery {
    pub legal_entity_id: konto_common::LegalEntityId,
    pub bank_account_id: konto_common::BankAccountId,
    pub txn_date: NaiveDate,
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn upsert(&self, rule: Rule) -> RulesResult<Rule>;
    async fn get(&self, tenant_id: TenantId, rule_id: RuleId) -> RulesResult<Rule>;
    async fn find_by_code(&self, tenant_id: TenantId, rule_code: &str) -> RulesResult<Option<Rule>>;
    async fn list(&self, tenant_id: TenantId) -> RulesResult<Vec<Rule>>;

    /// ACTIVE, approved rules applying to the scope and effective on the
    /// date, ordered by (priority, id).
    async fn list_active(&self, tenant_id: TenantId, query: ActiveRuleQuery)
    -> RulesResult<Vec<Rule>>;
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn upsert(&self, template: PostingTemplate) -> RulesResult<PostingTemplate>;
    async fn get(&self, tenant_id: TenantId, template_id: TemplateId)
    -> RulesResult<PostingTemplate>;
    async fn list(&self, tenant_id: TenantId) -> RulesResult<Vec<PostingTemplate>>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn upsert(&self, profile: DifferenceProfile) -> RulesResult<DifferenceProfile>;
    async fn get(&self, tenant_id: TenantId, profile_id: ProfileId)
    -> RulesResult<DifferenceProfile>;
    async fn list(&self, tenant_id: TenantId) -> RulesResult<Vec<DifferenceProfile>>;
}
