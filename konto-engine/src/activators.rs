use std::sync::Arc;

use async_trait::async_trait;
use konto_approvals::ApprovalExecutor;
use konto_approvals::ApprovalRequest;
use konto_common::ApprovalState;
use konto_exceptions::ExceptionQueue;
use konto_payments::NewReturnEvent;
use konto_payments::PaymentsService;
use konto_payments::ReturnEventType;
use konto_rules::ProfileStore;
use konto_rules::RuleStatus;
use konto_rules::RuleStore;
use konto_rules::TemplateStatus;
use konto_rules::TemplateStore;
use serde::Deserialize;

/// Final-approval executor for `BANK/RECON_RULE/{CREATE,UPDATE}`:
/// unpauses the rule and flips it back to APPROVED.
pub struct RuleActivator {
    rules: Arc<dyn RuleStore>,
}

impl RuleActivator {
    #[must_use]
    pub fn new(rules: Arc<dyn RuleStore>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl ApprovalExecutor for RuleActivator {
    async fn execute(&self, request: &ApprovalRequest) -> anyhow::Result<serde_json::Value> {
        let mut rule = self
            .rules
            .get(request.tenant_id, request.target_id)
            .await?;
        rule.approval_state = ApprovalState::Approved;
        if rule.status == RuleStatus::Paused {
            rule.status = RuleStatus::Active;
        }
        rule.approval_request_id = None;
        let rule = self.rules.upsert(rule).await?;
        Ok(serde_json::json!({ "rule_id": rule.id, "status": rule.status }))
    }
}

/// Final-approval executor for `BANK/POST_TEMPLATE/{CREATE,UPDATE}`.
pub struct TemplateActivator {
    templates: Arc<dyn TemplateStore>,
}

impl TemplateActivator {
    #[must_use]
    pub fn new(templates: Arc<dyn TemplateStore>) -> Self {
        Self { templates }
    }
}

#[async_trait]
impl ApprovalExecutor for TemplateActivator {
    async fn execute(&self, request: &ApprovalRequest) -> anyhow::Result<serde_json::Value> {
        let mut template = self
            .templates
            .get(request.tenant_id, request.target_id)
            .await?;
        template.approval_state = ApprovalState::Approved;
        template.status = TemplateStatus::Active;
        template.approval_request_id = None;
        let template = self.templates.upsert(template).await?;
        Ok(serde_json::json!({ "template_id": template.id }))
    }
}

/// Final-approval executor for `BANK/DIFF_PROFILE/{CREATE,UPDATE}`.
pub struct ProfileActivator {
    profiles: Arc<dyn ProfileStore>,
}

impl ProfileActivator {
    #[must_use]
    pub fn new(profiles: Arc<dyn ProfileStore>) -> Self {
        Self { profiles }
    }
}

#[async_trait]
impl ApprovalExecutor for ProfileActivator {
    async fn execute(&self, request: &ApprovalRequest) -> anyhow::Result<serde_json::Value> {
        let mut profile = self
            .profiles
            .get(request.tenant_id, request.target_id)
            .await?;
        profile.approval_state = ApprovalState::Approved;
        profile.status = TemplateStatus::Active;
        profile.approval_request_id = None;
        let profile = self.profiles.upsert(profile).await?;
        Ok(serde_json::json!({ "profile_id": profile.id }))
    }
}

#[derive(Debug, Deserialize)]
struct ManualReturnPayload {
    payment_line_id: i64,
    legal_entity_id: i64,
    event_type: ReturnEventType,
    #[serde(default)]
    amount_micros: i64,
    #[serde(default)]
    bank_reference: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    event_request_id: String,
}

/// Final-approval executor for `BANK/MANUAL_RETURN/CREATE`.
pub struct ManualReturnExecutor {
    payments: Arc<dyn PaymentsService>,
}

impl ManualReturnExecutor {
    #[must_use]
    pub fn new(payments: Arc<dyn PaymentsService>) -> Self {
        Self { payments }
    }
}

#[async_trait]
impl ApprovalExecutor for ManualReturnExecutor {
    async fn execute(&self, request: &ApprovalRequest) -> anyhow::Result<serde_json::Value> {
        let payload: ManualReturnPayload =
            serde_json::from_value(request.action_payload.clone())?;
        let applied = self
            .payments
            .apply_return_event(NewReturnEvent {
                tenant_id: request.tenant_id,
                legal_entity_id: payload.legal_entity_id,
                payment_line_id: payload.payment_line_id,
                request_id: payload.event_request_id,
                event_type: payload.event_type,
                amount_micros: payload.amount_micros,
                bank_reference: payload.bank_reference,
                reason: payload.reason,
            })
            .await?;
        Ok(serde_json::json!({
            "event_id": applied.event.id,
            "idempotent": applied.idempotent,
            "return_status": applied.line.return_status,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct ExceptionOverridePayload {
    exception_id: i64,
    #[serde(default)]
    resolution_code: Option<String>,
    #[serde(default)]
    note: Option<String>,
    actor: String,
}

/// Final-approval executor for `BANK/RECON_EXCEPTION_OVERRIDE/{RESOLVE,IGNORE}`.
pub struct ExceptionOverrideExecutor {
    exceptions: Arc<dyn ExceptionQueue>,
}

impl ExceptionOverrideExecutor {
    #[must_use]
    pub fn new(exceptions: Arc<dyn ExceptionQueue>) -> Self {
        Self { exceptions }
    }
}

#[async_trait]
impl ApprovalExecutor for ExceptionOverrideExecutor {
    async fn execute(&self, request: &ApprovalRequest) -> anyhow::Result<serde_json::Value> {
        let payload: ExceptionOverridePayload =
            serde_json::from_value(request.action_payload.clone())?;
        let exception = match request.action_type.as_str() {
            "RESOLVE" => {
                let code = payload
                    .resolution_code
                    .as_deref()
                    .unwrap_or("RESOLVED_MANUALLY");
                self.exceptions
                    .resolve(
                        request.tenant_id,
                        payload.exception_id,
                        code,
                        payload.note,
                        &payload.actor,
                    )
                    .await?
            }
            "IGNORE" => {
                self.exceptions
                    .ignore(
                        request.tenant_id,
                        payload.exception_id,
                        payload.note,
                        &payload.actor,
                    )
                    .await?
            }
            other => anyhow::bail!("unsupported exception override action {other}"),
        };
        Ok(serde_json::json!({
            "exception_id": exception.id,
            "status": exception.status,
        }))
    }
}
