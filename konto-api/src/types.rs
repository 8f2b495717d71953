use chrono::NaiveDate;
use konto_approvals::ApprovalRequest;
use konto_common::ScopeSelector;
use konto_engine::AutoRun;
use konto_engine::RunOutcomeRow;
use konto_engine::RunSummary;
use konto_payments::ReturnEventType;
use konto_rules::RuleAction;
use konto_rules::RuleConditions;
use konto_rules::RuleMatchKind;
use konto_rules::RuleStatus;
use konto_statements::Match;
use konto_statements::MatchedEntityType;
use konto_statements::StatementLine;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ApiError;
use crate::error::ApiResult;

pub const MAX_RUN_LIMIT: usize = 500;

/// Envelope of a governed write: either the committed row, or the row
/// parked behind the staged approval request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatedWrite<T> {
    pub row: T,
    pub approval_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_request: Option<ApprovalRequest>,
    pub idempotent: bool,
}

impl<T> GatedWrite<T> {
    #[must_use]
    pub fn committed(row: T) -> Self {
        Self {
            row,
            approval_required: false,
            approval_request: None,
            idempotent: false,
        }
    }

    #[must_use]
    pub fn staged(row: T, request: ApprovalRequest, idempotent: bool) -> Self {
        Self {
            row,
            approval_required: true,
            approval_request: Some(request),
            idempotent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RuleDraft {
    pub rule_code: String,
    pub rule_name: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub scope: ScopeSelector,
    pub match_kind: RuleMatchKind,
    pub action: RuleAction,
    #[serde(default)]
    pub conditions: RuleConditions,
    #[serde(default = "default_stop_on_match")]
    pub stop_on_match: bool,
    #[serde(flatten)]
    pub window: konto_common::EffectiveWindow,
}

fn default_priority() -> i32 {
    100
}

fn default_stop_on_match() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RulePatch {
    #[serde(default)]
    pub rule_name: Option<String>,
    #[serde(default)]
    pub status: Option<RuleStatus>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub conditions: Option<RuleConditions>,
    #[serde(default)]
    pub action: Option<RuleAction>,
    #[serde(default)]
    pub stop_on_match: Option<bool>,
    #[serde(default)]
    pub window: Option<konto_common::EffectiveWindow>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AutoRunParams {
    #[serde(default)]
    pub legal_entity_id: Option<i64>,
    #[serde(default)]
    pub bank_account_id: Option<i64>,
    #[serde(default)]
    pub date_from: Option<NaiveDate>,
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub run_request_id: Option<String>,
}

impl AutoRunParams {
    pub fn validate(&self) -> ApiResult<()> {
        if let Some(limit) = self.limit
            && !(1..=MAX_RUN_LIMIT).contains(&limit)
        {
            return Err(ApiError::bad_request(format!(
                "limit must be between 1 and {MAX_RUN_LIMIT}"
            )));
        }
        if let (Some(from), Some(to)) = (self.date_from, self.date_to)
            && from > to
        {
            return Err(ApiError::bad_request("date_from must not be after date_to"));
        }
        if let Some(run_request_id) = &self.run_request_id
            && run_request_id.trim().is_empty()
        {
            return Err(ApiError::bad_request("run_request_id must not be blank"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutoRunResponse {
    pub run: AutoRun,
    pub summary: RunSummary,
    pub rows: Vec<RunOutcomeRow>,
    pub replay: bool,
}

impl From<konto_engine::RunReport> for AutoRunResponse {
    fn from(report: konto_engine::RunReport) -> Self {
        Self {
            summary: report.run.summary,
            rows: report.run.rows.clone(),
            replay: report.replay,
            run: report.run,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DecisionParams {
    #[serde(default)]
    pub decision_comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ManualMatchParams {
    pub matched_entity_type: MatchedEntityType,
    pub matched_entity_id: i64,
    pub amount_micros: i64,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ManualReturnParams {
    pub payment_line_id: i64,
    pub legal_entity_id: i64,
    pub event_type: ReturnEventType,
    #[serde(default)]
    pub amount_micros: i64,
    #[serde(default)]
    pub bank_reference: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Caller-supplied idempotency key.
    pub event_request_id: String,
}

impl ManualReturnParams {
    pub fn validate(&self) -> ApiResult<()> {
        if self.event_request_id.trim().is_empty() {
            return Err(ApiError::bad_request("event_request_id must be provided"));
        }
        if self.amount_micros < 0 {
            return Err(ApiError::bad_request("amount must not be negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualReturnResponse {
    pub event: konto_payments::PaymentReturnEvent,
    pub line: konto_payments::PaymentLine,
    pub idempotent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatementLineView {
    pub line: StatementLine,
    pub matches: Vec<Match>,
    pub matched_total_micros: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn run_params_limit_bounds() {
        let mut params = AutoRunParams::default();
        assert!(params.validate().is_ok());

        params.limit = Some(0);
        assert_eq!(params.validate().expect_err("zero limit").status, 400);

        params.limit = Some(501);
        assert_eq!(params.validate().expect_err("over limit").status, 400);

        params.limit = Some(500);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn run_params_reject_inverted_window_and_blank_key() {
        let params = AutoRunParams {
            date_from: NaiveDate::from_ymd_opt(2025, 3, 10),
            date_to: NaiveDate::from_ymd_opt(2025, 3, 1),
            ..AutoRunParams::default()
        };
        assert_eq!(params.validate().expect_err("inverted").status, 400);

        let params = AutoRunParams {
            run_request_id: Some("  ".into()),
            ..AutoRunParams::default()
        };
        assert_eq!(params.validate().expect_err("blank key").status, 400);
    }

    #[test]
    fn manual_return_requires_request_id() {
        let params = ManualReturnParams {
            payment_line_id: 1,
            legal_entity_id: 1,
            event_type: ReturnEventType::PaymentRejected,
            amount_micros: 0,
            bank_reference: None,
            reason: None,
            event_request_id: " ".into(),
        };
        assert_eq!(params.validate().expect_err("blank").status, 400);
    }

    #[test]
    fn rule_draft_parses_with_defaults() {
        let draft: RuleDraft = serde_json::from_value(serde_json::json!({
            "rule_code": "R-10",
            "rule_name": "Queue unknown inflows",
            "scope": {"scope_type": "Global"},
            "match_kind": "PaymentByTextAndAmount",
            "action": {"action": "QUEUE_EXCEPTION"},
        }))
        .expect("draft parses");
        assert_eq!(draft.priority, 100);
        assert!(draft.stop_on_match);
    }
}
