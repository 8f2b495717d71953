#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use konto_common::BankAccountId;
use konto_common::EffectiveWindow;
use konto_common::LegalEntityId;
use konto_common::ScopeSelector;
use konto_common::TenantId;
use konto_common::UserId;
use konto_common::money::AmountMicros;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

mod memory;

pub use memory::InMemoryApprovals;
pub use memory::InMemoryPolicyStore;

pub type PolicyId = i64;
pub type RequestId = i64;

pub type ApprovalsResult<T> = Result<T, ApprovalsError>;

#[derive(Debug, Error)]
pub enum ApprovalsError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("maker-checker violation: {0}")]
    MakerChecker(String),
    #[error("no executor registered for {0}")]
    NoExecutor(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyStatus {
    Active,
    Disabled,
}

/// A governance policy: which (module, target, action) writes require
/// approval, in which scope and amount band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub id: PolicyId,
    pub tenant_id: TenantId,
    pub module_code: String,
    pub target_type: String,
    pub action_type: String,
    pub scope: ScopeSelector,
    /// `None` is a currency wildcard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_amount_micros: Option<AmountMicros>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount_micros: Option<AmountMicros>,
    pub status: PolicyStatus,
    pub required_approvals: u32,
    pub maker_checker_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_permission_code: Option<String>,
    pub auto_execute_on_final_approval: bool,
    #[serde(flatten)]
    pub window: EffectiveWindow,
}

impl ApprovalPolicy {
    pub fn validate(&self) -> ApprovalsResult<()> {
        if self.module_code.trim().is_empty()
            || self.target_type.trim().is_empty()
            || self.action_type.trim().is_empty()
        {
            return Err(ApprovalsError::Validation(
                "policy module, target and action must be provided".into(),
            ));
        }
        if self.required_approvals == 0 {
            return Err(ApprovalsError::Validation(
                "policy requires at least one approval".into(),
            ));
        }
        self.scope
            .validate()
            .map_err(|err| ApprovalsError::Validation(err.to_string()))?;
        if let (Some(min), Some(max)) = (self.min_amount_micros, self.max_amount_micros)
            && min > max
        {
            return Err(ApprovalsError::Validation(
                "policy min amount exceeds max amount".into(),
            ));
        }
        Ok(())
    }
}

/// What a gated operation is about to do.
#[derive(Debug, Clone, PartialEq)]
pub struct GateContext {
    pub module_code: String,
    pub target_type: String,
    pub action_type: String,
    pub legal_entity_id: Option<LegalEntityId>,
    pub bank_account_id: Option<BankAccountId>,
    pub amount_micros: Option<AmountMicros>,
    pub currency_code: Option<String>,
    pub value_date: NaiveDate,
}

/// Selects the single applicable policy: matching policies are ordered by
/// scope rank, then min-amount, then required approvals, then id, all
/// descending; the head wins.
#[must_use]
pub fn evaluate_approval_need<'a>(
    policies: &'a [ApprovalPolicy],
    context: &GateContext,
) -> Option<&'a ApprovalPolicy> {
    let mut applicable: Vec<&ApprovalPolicy> = policies
        .iter()
        .filter(|policy| policy.status == PolicyStatus::Active)
        .filter(|policy| {
            policy.module_code == context.module_code
                && policy.target_type == context.target_type
                && policy.action_type == context.action_type
        })
        .filter(|policy| policy.window.contains(context.value_date))
        .filter(|policy| match policy.scope.scope_type {
            konto_common::ScopeType::Global => true,
            konto_common::ScopeType::LegalEntity => {
                context.legal_entity_id.is_some()
                    && policy.scope.legal_entity_id == context.legal_entity_id
            }
            konto_common::ScopeType::BankAccount => {
                context.legal_entity_id.is_some()
                    && context.bank_account_id.is_some()
                    && policy.scope.legal_entity_id == context.legal_entity_id
                    && policy.scope.bank_account_id == context.bank_account_id
            }
        })
        .filter(|policy| match (&policy.currency_code, &context.currency_code) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(policy_ccy), Some(ctx_ccy)) => policy_ccy.eq_ignore_ascii_case(ctx_ccy),
        })
        .filter(|policy| {
            let amount = context.amount_micros.map(AmountMicros::abs);
            match (policy.min_amount_micros, policy.max_amount_micros) {
                (None, None) => true,
                (min, max) => match amount {
                    None => false,
                    Some(amount) => {
                        min.is_none_or(|min| amount >= min) && max.is_none_or(|max| amount <= max)
                    }
                },
            }
        })
        .collect();

    applicable.sort_by(|a, b| {
        b.scope
            .scope_type
            .rank()
            .cmp(&a.scope.scope_type.rank())
            .then(b.min_amount_micros.cmp(&a.min_amount_micros))
            .then(b.required_approvals.cmp(&a.required_approvals))
            .then(b.id.cmp(&a.id))
    });
    applicable.first().copied()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    NotExecuted,
    Executing,
    Executed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionKind {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub user_id: UserId,
    pub decision: DecisionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: RequestId,
    pub tenant_id: TenantId,
    pub module_code: String,
    pub request_code: String,
    /// Unique per tenant; duplicate submissions replay.
    pub request_key: String,
    pub policy_id: PolicyId,
    pub target_type: String,
    pub target_id: i64,
    pub action_type: String,
    pub request_status: RequestStatus,
    pub execution_status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legal_entity_id: Option<LegalEntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_account_id: Option<BankAccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_amount_micros: Option<AmountMicros>,
    pub policy_snapshot: serde_json::Value,
    pub action_payload: serde_json::Value,
    pub target_snapshot: serde_json::Value,
    pub requested_by_user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<String>,
    pub decisions: Vec<Decision>,
}

impl ApprovalRequest {
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        !matches!(self.request_status, RequestStatus::Pending)
    }

    fn maker_checker_required(&self) -> bool {
        self.policy_snapshot
            .get("maker_checker_required")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    fn required_approvals(&self) -> u32 {
        self.policy_snapshot
            .get("required_approvals")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(1) as u32
    }

    fn auto_execute(&self) -> bool {
        self.policy_snapshot
            .get("auto_execute_on_final_approval")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub tenant_id: TenantId,
    pub request_key: String,
    pub policy: ApprovalPolicy,
    pub target_type: String,
    pub target_id: i64,
    pub action_type: String,
    pub legal_entity_id: Option<LegalEntityId>,
    pub bank_account_id: Option<BankAccountId>,
    pub threshold_amount_micros: Option<AmountMicros>,
    pub action_payload: serde_json::Value,
    pub target_snapshot: serde_json::Value,
    pub requested_by_user_id: UserId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub request: ApprovalRequest,
    /// True when the request key replayed an existing request.
    pub idempotent: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
    pub module_code: Option<String>,
    pub limit: Option<usize>,
}

/// Executes the approved action; errors become the request's FAILED text.
#[async_trait]
pub trait ApprovalExecutor: Send + Sync {
    async fn execute(&self, request: &ApprovalRequest) -> anyhow::Result<serde_json::Value>;
}

/// Dispatch registry keyed by (module, target, action).
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<(String, String, String), Arc<dyn ApprovalExecutor>>,
}

impl ExecutorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        module_code: &str,
        target_type: &str,
        action_type: &str,
        executor: Arc<dyn ApprovalExecutor>,
    ) {
        self.executors.insert(
            (
                module_code.to_string(),
                target_type.to_string(),
                action_type.to_string(),
            ),
            executor,
        );
    }

    pub fn resolve(
        &self,
        module_code: &str,
        target_type: &str,
        action_type: &str,
    ) -> ApprovalsResult<Arc<dyn ApprovalExecutor>> {
        self.executors
            .get(&(
                module_code.to_string(),
                target_type.to_string(),
                action_type.to_string(),
            ))
            .cloned()
            .ok_or_else(|| {
                ApprovalsError::NoExecutor(format!("{module_code}/{target_type}/{action_type}"))
            })
    }
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn upsert(&self, policy: ApprovalPolicy) -> ApprovalsResult<ApprovalPolicy>;
    async fn list_active(&self, tenant_id: TenantId) -> ApprovalsResult<Vec<ApprovalPolicy>>;
}

#[async_trait]
pub trait ApprovalService: Send + Sync {
    /// Stages a request; a duplicate `(tenant, request_key)` replays the
    /// existing one.
    async fn submit(&self, request: SubmitRequest) -> ApprovalsResult<SubmitOutcome>;

    async fn get(&self, tenant_id: TenantId, request_id: RequestId)
    -> ApprovalsResult<ApprovalRequest>;

    async fn list(
        &self,
        tenant_id: TenantId,
        filter: RequestFilter,
    ) -> ApprovalsResult<Vec<ApprovalRequest>>;

    /// Records one user's decision (upsert per user), recounts, and on
    /// final approval dispatches the executor when the policy says so.
    async fn decide(
        &self,
        tenant_id: TenantId,
        request_id: RequestId,
        user_id: UserId,
        decision: DecisionKind,
        comment: Option<String>,
    ) -> ApprovalsResult<ApprovalRequest>;

    async fn cancel(
        &self,
        tenant_id: TenantId,
        request_id: RequestId,
        actor: UserId,
    ) -> ApprovalsResult<ApprovalRequest>;
}

/// Snapshot of the matched policy copied onto a request at submit time.
#[must_use]
pub fn policy_snapshot(policy: &ApprovalPolicy) -> serde_json::Value {
    serde_json::json!({
        "policy_id": policy.id,
        "required_approvals": policy.required_approvals,
        "maker_checker_required": policy.maker_checker_required,
        "auto_execute_on_final_approval": policy.auto_execute_on_final_approval,
        "approver_permission_code": policy.approver_permission_code,
        "scope_type": policy.scope.scope_type,
        "min_amount_micros": policy.min_amount_micros,
        "max_amount_micros": policy.max_amount_micros,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn policy(id: PolicyId, scope: ScopeSelector) -> ApprovalPolicy {
        ApprovalPolicy {
            id,
            tenant_id: 1,
            module_code: "BANK".into(),
            target_type: "RECON_RULE".into(),
            action_type: "CREATE".into(),
            scope,
            currency_code: None,
            min_amount_micros: None,
            max_amount_micros: None,
            status: PolicyStatus::Active,
            required_approvals: 1,
            maker_checker_required: true,
            approver_permission_code: Some("bank.recon.approve".into()),
            auto_execute_on_final_approval: true,
            window: EffectiveWindow::open(),
        }
    }

    fn context() -> GateContext {
        GateContext {
            module_code: "BANK".into(),
            target_type: "RECON_RULE".into(),
            action_type: "CREATE".into(),
            legal_entity_id: Some(10),
            bank_account_id: Some(20),
            amount_micros: Some(150_000_000),
            currency_code: Some("EUR".into()),
            value_date: NaiveDate::from_ymd_opt(2025, 3, 1).expect("date"),
        }
    }

    #[test]
    fn narrowest_scope_wins() {
        let policies = vec![
            policy(1, ScopeSelector::global()),
            policy(2, ScopeSelector::legal_entity(10)),
            policy(3, ScopeSelector::bank_account(10, 20)),
        ];
        let selected = evaluate_approval_need(&policies, &context()).expect("policy");
        assert_eq!(selected.id, 3);
    }

    #[test]
    fn amount_band_and_currency_filter() {
        let mut banded = policy(1, ScopeSelector::global());
        banded.min_amount_micros = Some(200_000_000);
        let mut wrong_currency = policy(2, ScopeSelector::global());
        wrong_currency.currency_code = Some("USD".into());
        let wildcard = policy(3, ScopeSelector::global());

        let policies = vec![banded, wrong_currency, wildcard];
        let selected = evaluate_approval_need(&policies, &context()).expect("policy");
        assert_eq!(selected.id, 3);
    }

    #[test]
    fn higher_min_amount_outranks_within_same_scope() {
        let mut low = policy(1, ScopeSelector::global());
        low.min_amount_micros = Some(10_000_000);
        let mut high = policy(2, ScopeSelector::global());
        high.min_amount_micros = Some(100_000_000);
        let policies = [low, high];
        let selected = evaluate_approval_need(&policies, &context()).expect("policy");
        assert_eq!(selected.id, 2);
    }

    #[test]
    fn inactive_and_out_of_window_policies_never_apply() {
        let mut disabled = policy(1, ScopeSelector::global());
        disabled.status = PolicyStatus::Disabled;
        let mut expired = policy(2, ScopeSelector::global());
        expired.window.effective_to = NaiveDate::from_ymd_opt(2024, 12, 31);
        assert!(evaluate_approval_need(&[disabled, expired], &context()).is_none());
    }

    #[test]
    fn snapshot_carries_governance_fields() {
        let snapshot = policy_snapshot(&policy(5, ScopeSelector::global()));
        assert_eq!(snapshot["required_approvals"], 1);
        assert_eq!(snapshot["maker_checker_required"], true);
        assert_eq!(snapshot["auto_execute_on_final_approval"], true);
    }
}
