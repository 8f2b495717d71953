use std::sync::Arc;

use chrono::Utc;
use konto_approvals::ApprovalPolicy;
use konto_approvals::ApprovalRequest;
use konto_approvals::ApprovalService;
use konto_approvals::DecisionKind;
use konto_approvals::GateContext;
use konto_approvals::PolicyStore;
use konto_approvals::RequestFilter;
use konto_approvals::SubmitRequest;
use konto_approvals::evaluate_approval_need;
use konto_audit::AuditFilter;
use konto_audit::AuditRecord;
use konto_audit::AuditTrail;
use konto_common::ApprovalState;
use konto_common::TenantId;
use konto_common::UserId;
use konto_engine::AutoRun;
use konto_engine::ReconciliationRunner;
use konto_engine::RunFilters;
use konto_exceptions::Exception;
use konto_exceptions::ExceptionFilter;
use konto_exceptions::ExceptionPage;
use konto_exceptions::ExceptionQueue;
use konto_ledger::BankAccountDirectory;
use konto_payments::NewReturnEvent;
use konto_payments::PaymentsService;
use konto_rules::DifferenceProfile;
use konto_rules::PostingTemplate;
use konto_rules::Rule;
use konto_rules::RuleId;
use konto_rules::RuleStatus;
use konto_rules::RuleStore;
use konto_rules::ProfileStore;
use konto_rules::TemplateStore;
use konto_statements::MatchMeta;
use konto_statements::MatchRequest;
use konto_statements::StatementsService;
use serde::Serialize;
use tracing::debug;

use crate::access::PermissionChecker;
use crate::access::ScopeGuard;
use crate::error::ApiError;
use crate::error::ApiResult;
use crate::types::AutoRunParams;
use crate::types::AutoRunResponse;
use crate::types::MAX_RUN_LIMIT;
use crate::types::DecisionParams;
use crate::types::GatedWrite;
use crate::types::ManualMatchParams;
use crate::types::ManualReturnParams;
use crate::types::ManualReturnResponse;
use crate::types::RuleDraft;
use crate::types::RulePatch;
use crate::types::StatementLineView;

const MODULE_BANK: &str = "BANK";

/// Everything the facade composes over.
pub struct ReconApiDeps {
    pub rules: Arc<dyn RuleStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub profiles: Arc<dyn ProfileStore>,
    pub policies: Arc<dyn PolicyStore>,
    pub approvals: Arc<dyn ApprovalService>,
    pub runner: Arc<ReconciliationRunner>,
    pub statements: Arc<dyn StatementsService>,
    pub exceptions: Arc<dyn ExceptionQueue>,
    pub payments: Arc<dyn PaymentsService>,
    pub bank_accounts: Arc<dyn BankAccountDirectory>,
    pub audit: Arc<dyn AuditTrail>,
    pub scope_guard: Arc<dyn ScopeGuard>,
    pub permissions: Arc<dyn PermissionChecker>,
}

/// The external operation surface of the reconciliation core.
pub struct ReconApi {
    deps: ReconApiDeps,
}

fn actor(user_id: UserId) -> String {
    format!("user:{user_id}")
}

fn snapshot<T: Serialize>(value: &T) -> ApiResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|err| ApiError::internal(err.to_string()))
}

impl ReconApi {
    #[must_use]
    pub fn new(deps: ReconApiDeps) -> Self {
        Self { deps }
    }

    async fn gate(
        &self,
        tenant_id: TenantId,
        context: &GateContext,
    ) -> ApiResult<Option<ApprovalPolicy>> {
        let policies = self.deps.policies.list_active(tenant_id).await?;
        let selected = evaluate_approval_need(&policies, context).cloned();
        debug!(
            tenant_id,
            target = %context.target_type,
            action = %context.action_type,
            gated = selected.is_some(),
            "approval gate evaluated"
        );
        Ok(selected)
    }

    fn bank_gate_context(
        target_type: &str,
        action_type: &str,
        legal_entity_id: Option<i64>,
        bank_account_id: Option<i64>,
        amount_micros: Option<i64>,
        currency_code: Option<String>,
    ) -> GateContext {
        GateContext {
            module_code: MODULE_BANK.into(),
            target_type: target_type.into(),
            action_type: action_type.into(),
            legal_entity_id,
            bank_account_id,
            amount_micros,
            currency_code,
            value_date: Utc::now().date_naive(),
        }
    }

    // ---- rules -----------------------------------------------------

    pub async fn create_rule(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        draft: RuleDraft,
    ) -> ApiResult<GatedWrite<Rule>> {
        if let Some(legal_entity_id) = draft.scope.legal_entity_id {
            self.deps
                .scope_guard
                .assert_scope_access(tenant_id, user_id, "legal_entity", legal_entity_id)
                .await?;
        }
        if self
            .deps
            .rules
            .find_by_code(tenant_id, &draft.rule_code)
            .await?
            .is_some()
        {
            return Err(ApiError::conflict(format!(
                "rule code {} already exists",
                draft.rule_code
            )));
        }

        let mut rule = Rule {
            id: 0,
            tenant_id,
            rule_code: draft.rule_code,
            rule_name: draft.rule_name,
            status: RuleStatus::Active,
            priority: draft.priority,
            scope: draft.scope,
            match_kind: draft.match_kind,
            action: draft.action,
            conditions: draft.conditions,
            stop_on_match: draft.stop_on_match,
            window: draft.window,
            approval_state: ApprovalState::Approved,
            version_no: 1,
            approval_request_id: None,
        };

        let context = Self::bank_gate_context(
            "RECON_RULE",
            "CREATE",
            rule.scope.legal_entity_id,
            rule.scope.bank_account_id,
            None,
            rule.conditions.currency_code.clone(),
        );
        match self.gate(tenant_id, &context).await? {
            None => {
                let stored = self.deps.rules.upsert(rule).await?;
                Ok(GatedWrite::committed(stored))
            }
            Some(policy) => {
                rule.status = RuleStatus::Paused;
                rule.approval_state = ApprovalState::PendingApproval;
                let stored = self.deps.rules.upsert(rule).await?;
                let request_key = format!("BANK:RECON_RULE:CREATE:{}", stored.rule_code);
                self.stage_rule_request(tenant_id, user_id, stored, policy, request_key, "CREATE")
                    .await
            }
        }
    }

    pub async fn update_rule(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        rule_id: RuleId,
        patch: RulePatch,
    ) -> ApiResult<GatedWrite<Rule>> {
        let mut rule = self.deps.rules.get(tenant_id, rule_id).await?;
        if let Some(legal_entity_id) = rule.scope.legal_entity_id {
            self.deps
                .scope_guard
                .assert_scope_access(tenant_id, user_id, "legal_entity", legal_entity_id)
                .await?;
        }
        if rule.approval_state == ApprovalState::PendingApproval {
            return Err(ApiError::conflict(format!(
                "rule {rule_id} already has a pending approval"
            )));
        }

        if let Some(rule_name) = patch.rule_name {
            rule.rule_name = rule_name;
        }
        if let Some(status) = patch.status {
            rule.status = status;
        }
        if let Some(priority) = patch.priority {
            rule.priority = priority;
        }
        if let Some(conditions) = patch.conditions {
            rule.conditions = conditions;
        }
        if let Some(action) = patch.action {
            rule.action = action;
        }
        if let Some(stop_on_match) = patch.stop_on_match {
            rule.stop_on_match = stop_on_match;
        }
        if let Some(window) = patch.window {
            rule.window = window;
        }
        rule.version_no += 1;

        let context = Self::bank_gate_context(
            "RECON_RULE",
            "UPDATE",
            rule.scope.legal_entity_id,
            rule.scope.bank_account_id,
            None,
            rule.conditions.currency_code.clone(),
        );
        match self.gate(tenant_id, &context).await? {
            None => {
                let stored = self.deps.rules.upsert(rule).await?;
                Ok(GatedWrite::committed(stored))
            }
            Some(policy) => {
                if rule.status == RuleStatus::Active {
                    rule.status = RuleStatus::Paused;
                }
                rule.approval_state = ApprovalState::PendingApproval;
                let stored = self.deps.rules.upsert(rule).await?;
                let request_key = format!(
                    "BANK:RECON_RULE:UPDATE:{}:v{}",
                    stored.id, stored.version_no
                );
                self.stage_rule_request(tenant_id, user_id, stored, policy, request_key, "UPDATE")
                    .await
            }
        }
    }

    async fn stage_rule_request(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        rule: Rule,
        policy: ApprovalPolicy,
        request_key: String,
        action_type: &str,
    ) -> ApiResult<GatedWrite<Rule>> {
        let submit = self
            .deps
            .approvals
            .submit(SubmitRequest {
                tenant_id,
                request_key,
                policy,
                target_type: "RECON_RULE".into(),
                target_id: rule.id,
                action_type: action_type.into(),
                legal_entity_id: rule.scope.legal_entity_id,
                bank_account_id: rule.scope.bank_account_id,
                threshold_amount_micros: None,
                action_payload: serde_json::json!({ "rule_id": rule.id }),
                target_snapshot: snapshot(&rule)?,
                requested_by_user_id: user_id,
            })
            .await?;
        let mut pinned = rule;
        pinned.approval_request_id = Some(submit.request.id);
        let pinned = self.deps.rules.upsert(pinned).await?;
        Ok(GatedWrite::staged(pinned, submit.request, submit.idempotent))
    }

    pub async fn get_rule(&self, tenant_id: TenantId, rule_id: RuleId) -> ApiResult<Rule> {
        Ok(self.deps.rules.get(tenant_id, rule_id).await?)
    }

    pub async fn list_rules(&self, tenant_id: TenantId) -> ApiResult<Vec<Rule>> {
        Ok(self.deps.rules.list(tenant_id).await?)
    }

    // ---- posting templates and difference profiles -----------------

    pub async fn upsert_template(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        mut template: PostingTemplate,
    ) -> ApiResult<GatedWrite<PostingTemplate>> {
        if let Some(legal_entity_id) = template.scope.legal_entity_id {
            self.deps
                .scope_guard
                .assert_scope_access(tenant_id, user_id, "legal_entity", legal_entity_id)
                .await?;
        }
        template.tenant_id = tenant_id;
        let action_type = if template.id > 0 { "UPDATE" } else { "CREATE" };
        let context = Self::bank_gate_context(
            "POST_TEMPLATE",
            action_type,
            template.scope.legal_entity_id,
            template.scope.bank_account_id,
            template.max_amount_abs_micros,
            Some(template.currency_code.clone()),
        );
        match self.gate(tenant_id, &context).await? {
            None => {
                template.approval_state = ApprovalState::Approved;
                let stored = self.deps.templates.upsert(template).await?;
                Ok(GatedWrite::committed(stored))
            }
            Some(policy) => {
                template.approval_state = ApprovalState::PendingApproval;
                let stored = self.deps.templates.upsert(template).await?;
                let request_key = format!(
                    "BANK:POST_TEMPLATE:{action_type}:{}:v{}",
                    stored.id, stored.version_no
                );
                let submit = self
                    .deps
                    .approvals
                    .submit(SubmitRequest {
                        tenant_id,
                        request_key,
                        policy,
                        target_type: "POST_TEMPLATE".into(),
                        target_id: stored.id,
                        action_type: action_type.into(),
                        legal_entity_id: stored.scope.legal_entity_id,
                        bank_account_id: stored.scope.bank_account_id,
                        threshold_amount_micros: stored.max_amount_abs_micros,
                        action_payload: serde_json::json!({ "template_id": stored.id }),
                        target_snapshot: snapshot(&stored)?,
                        requested_by_user_id: user_id,
                    })
                    .await?;
                let mut pinned = stored;
                pinned.approval_request_id = Some(submit.request.id);
                let pinned = self.deps.templates.upsert(pinned).await?;
                Ok(GatedWrite::staged(pinned, submit.request, submit.idempotent))
            }
        }
    }

    pub async fn upsert_profile(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        mut profile: DifferenceProfile,
    ) -> ApiResult<GatedWrite<DifferenceProfile>> {
        if let Some(legal_entity_id) = profile.scope.legal_entity_id {
            self.deps
                .scope_guard
                .assert_scope_access(tenant_id, user_id, "legal_entity", legal_entity_id)
                .await?;
        }
        profile.tenant_id = tenant_id;
        let action_type = if profile.id > 0 { "UPDATE" } else { "CREATE" };
        let context = Self::bank_gate_context(
            "DIFF_PROFILE",
            action_type,
            profile.scope.legal_entity_id,
            profile.scope.bank_account_id,
            Some(profile.max_abs_difference_micros),
            Some(profile.currency_code.clone()),
        );
        match self.gate(tenant_id, &context).await? {
            None => {
                profile.approval_state = ApprovalState::Approved;
                let stored = self.deps.profiles.upsert(profile).await?;
                Ok(GatedWrite::committed(stored))
            }
            Some(policy) => {
                profile.approval_state = ApprovalState::PendingApproval;
                let stored = self.deps.profiles.upsert(profile).await?;
                let request_key = format!(
                    "BANK:DIFF_PROFILE:{action_type}:{}:v{}",
                    stored.id, stored.version_no
                );
                let submit = self
                    .deps
                    .approvals
                    .submit(SubmitRequest {
                        tenant_id,
                        request_key,
                        policy,
                        target_type: "DIFF_PROFILE".into(),
                        target_id: stored.id,
                        action_type: action_type.into(),
                        legal_entity_id: stored.scope.legal_entity_id,
                        bank_account_id: stored.scope.bank_account_id,
                        threshold_amount_micros: Some(stored.max_abs_difference_micros),
                        action_payload: serde_json::json!({ "profile_id": stored.id }),
                        target_snapshot: snapshot(&stored)?,
                        requested_by_user_id: user_id,
                    })
                    .await?;
                let mut pinned = stored;
                pinned.approval_request_id = Some(submit.request.id);
                let pinned = self.deps.profiles.upsert(pinned).await?;
                Ok(GatedWrite::staged(pinned, submit.request, submit.idempotent))
            }
        }
    }

    // ---- auto runs -------------------------------------------------

    pub async fn auto_preview(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        params: AutoRunParams,
    ) -> ApiResult<AutoRunResponse> {
        self.check_run_scope(tenant_id, user_id, &params).await?;
        let report = self
            .deps
            .runner
            .preview(tenant_id, run_filters(&params))
            .await?;
        Ok(report.into())
    }

    pub async fn auto_apply(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        params: AutoRunParams,
    ) -> ApiResult<AutoRunResponse> {
        self.check_run_scope(tenant_id, user_id, &params).await?;
        let run_request_id = params.run_request_id.clone();
        let report = self
            .deps
            .runner
            .apply(tenant_id, run_filters(&params), run_request_id)
            .await?;
        Ok(report.into())
    }

    async fn check_run_scope(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        params: &AutoRunParams,
    ) -> ApiResult<()> {
        params.validate()?;
        if let Some(legal_entity_id) = params.legal_entity_id {
            self.deps
                .scope_guard
                .assert_scope_access(tenant_id, user_id, "legal_entity", legal_entity_id)
                .await?;
        }
        if let (Some(legal_entity_id), Some(bank_account_id)) =
            (params.legal_entity_id, params.bank_account_id)
        {
            let account = self.deps.bank_accounts.get(tenant_id, bank_account_id).await?;
            if account.legal_entity_id != legal_entity_id {
                return Err(ApiError::bad_request(
                    "bank account does not belong to the legal entity",
                ));
            }
        }
        Ok(())
    }

    pub async fn get_run(&self, tenant_id: TenantId, run_id: i64) -> ApiResult<AutoRun> {
        Ok(self.deps.runner_store().get(tenant_id, run_id).await?)
    }

    pub async fn list_runs(&self, tenant_id: TenantId, limit: usize) -> ApiResult<Vec<AutoRun>> {
        Ok(self
            .deps
            .runner_store()
            .list(tenant_id, limit.clamp(1, MAX_RUN_LIMIT))
            .await?)
    }

    // ---- exceptions ------------------------------------------------

    pub async fn list_exceptions(
        &self,
        tenant_id: TenantId,
        filter: ExceptionFilter,
    ) -> ApiResult<ExceptionPage> {
        Ok(self.deps.exceptions.list(tenant_id, filter).await?)
    }

    pub async fn get_exception(
        &self,
        tenant_id: TenantId,
        exception_id: i64,
    ) -> ApiResult<Exception> {
        Ok(self.deps.exceptions.get(tenant_id, exception_id).await?)
    }

    pub async fn assign_exception(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        exception_id: i64,
        assignee: Option<UserId>,
    ) -> ApiResult<Exception> {
        Ok(self
            .deps
            .exceptions
            .assign(tenant_id, exception_id, assignee, &actor(user_id))
            .await?)
    }

    pub async fn resolve_exception(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        exception_id: i64,
        resolution_code: &str,
        note: Option<String>,
    ) -> ApiResult<GatedWrite<Exception>> {
        self.override_exception(
            tenant_id,
            user_id,
            exception_id,
            "RESOLVE",
            Some(resolution_code.to_string()),
            note,
        )
        .await
    }

    pub async fn ignore_exception(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        exception_id: i64,
        note: Option<String>,
    ) -> ApiResult<GatedWrite<Exception>> {
        self.override_exception(tenant_id, user_id, exception_id, "IGNORE", None, note)
            .await
    }

    async fn override_exception(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        exception_id: i64,
        action_type: &str,
        resolution_code: Option<String>,
        note: Option<String>,
    ) -> ApiResult<GatedWrite<Exception>> {
        let exception = self.deps.exceptions.get(tenant_id, exception_id).await?;
        self.deps
            .scope_guard
            .assert_scope_access(tenant_id, user_id, "legal_entity", exception.legal_entity_id)
            .await?;
        let context = Self::bank_gate_context(
            "RECON_EXCEPTION_OVERRIDE",
            action_type,
            Some(exception.legal_entity_id),
            Some(exception.bank_account_id),
            None,
            None,
        );
        match self.gate(tenant_id, &context).await? {
            None => {
                let updated = match action_type {
                    "RESOLVE" => {
                        let code = resolution_code.as_deref().unwrap_or("RESOLVED_MANUALLY");
                        self.deps
                            .exceptions
                            .resolve(tenant_id, exception_id, code, note, &actor(user_id))
                            .await?
                    }
                    _ => {
                        self.deps
                            .exceptions
                            .ignore(tenant_id, exception_id, note, &actor(user_id))
                            .await?
                    }
                };
                Ok(GatedWrite::committed(updated))
            }
            Some(policy) => {
                let request_key = format!(
                    "BANK:RECON_EXCEPTION_OVERRIDE:{action_type}:{exception_id}:o{}",
                    exception.occurrence_count
                );
                let submit = self
                    .deps
                    .approvals
                    .submit(SubmitRequest {
                        tenant_id,
                        request_key,
                        policy,
                        target_type: "RECON_EXCEPTION_OVERRIDE".into(),
                        target_id: exception_id,
                        action_type: action_type.into(),
                        legal_entity_id: Some(exception.legal_entity_id),
                        bank_account_id: Some(exception.bank_account_id),
                        threshold_amount_micros: None,
                        action_payload: serde_json::json!({
                            "exception_id": exception_id,
                            "resolution_code": resolution_code,
                            "note": note,
                            "actor": actor(user_id),
                        }),
                        target_snapshot: snapshot(&exception)?,
                        requested_by_user_id: user_id,
                    })
                    .await?;
                Ok(GatedWrite::staged(exception, submit.request, submit.idempotent))
            }
        }
    }

    pub async fn retry_exception(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        exception_id: i64,
        note: Option<String>,
    ) -> ApiResult<(Exception, StatementLineView)> {
        let exception = self
            .deps
            .exceptions
            .retry(tenant_id, exception_id, note, &actor(user_id))
            .await?;
        let view = self
            .statement_line_view(tenant_id, exception.statement_line_id)
            .await?;
        Ok((exception, view))
    }

    // ---- approvals -------------------------------------------------

    pub async fn list_approvals(
        &self,
        tenant_id: TenantId,
        filter: RequestFilter,
    ) -> ApiResult<Vec<ApprovalRequest>> {
        Ok(self.deps.approvals.list(tenant_id, filter).await?)
    }

    pub async fn get_approval(
        &self,
        tenant_id: TenantId,
        request_id: i64,
    ) -> ApiResult<ApprovalRequest> {
        Ok(self.deps.approvals.get(tenant_id, request_id).await?)
    }

    pub async fn decide_approval(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        request_id: i64,
        approve: bool,
        params: DecisionParams,
    ) -> ApiResult<ApprovalRequest> {
        let request = self.deps.approvals.get(tenant_id, request_id).await?;
        if let Some(required_code) = request
            .policy_snapshot
            .get("approver_permission_code")
            .and_then(serde_json::Value::as_str)
        {
            let codes = self
                .deps
                .permissions
                .load_permission_codes(tenant_id, user_id)
                .await?;
            if !codes.iter().any(|code| code == required_code) {
                return Err(ApiError::forbidden(format!(
                    "approver permission {required_code} is required"
                )));
            }
        }
        let decision = if approve {
            DecisionKind::Approve
        } else {
            DecisionKind::Reject
        };
        Ok(self
            .deps
            .approvals
            .decide(tenant_id, request_id, user_id, decision, params.decision_comment)
            .await?)
    }

    // ---- manual matching surface ----------------------------------

    pub async fn statement_line_view(
        &self,
        tenant_id: TenantId,
        line_id: i64,
    ) -> ApiResult<StatementLineView> {
        let line = self.deps.statements.get_line(tenant_id, line_id).await?;
        let matches = self.deps.statements.active_matches(tenant_id, line_id).await?;
        let matched_total_micros = self.deps.statements.matched_total(tenant_id, line_id).await?;
        Ok(StatementLineView {
            line,
            matches,
            matched_total_micros,
        })
    }

    pub async fn match_line(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        line_id: i64,
        params: ManualMatchParams,
    ) -> ApiResult<StatementLineView> {
        let line = self.deps.statements.get_line(tenant_id, line_id).await?;
        self.deps
            .scope_guard
            .assert_scope_access(tenant_id, user_id, "legal_entity", line.legal_entity_id)
            .await?;
        let mut meta = MatchMeta::manual(actor(user_id));
        meta.notes = params.notes;
        self.deps
            .statements
            .match_line(
                tenant_id,
                line_id,
                MatchRequest {
                    matched_entity_type: params.matched_entity_type,
                    matched_entity_id: params.matched_entity_id,
                    amount_micros: params.amount_micros,
                    meta,
                },
            )
            .await?;
        self.statement_line_view(tenant_id, line_id).await
    }

    pub async fn unmatch_line(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        line_id: i64,
        match_id: Option<i64>,
    ) -> ApiResult<StatementLineView> {
        self.deps
            .statements
            .unmatch(tenant_id, line_id, match_id, &actor(user_id))
            .await?;
        self.statement_line_view(tenant_id, line_id).await
    }

    pub async fn ignore_line(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        line_id: i64,
        reason: &str,
    ) -> ApiResult<StatementLineView> {
        self.deps
            .statements
            .ignore(tenant_id, line_id, reason, &actor(user_id))
            .await?;
        self.statement_line_view(tenant_id, line_id).await
    }

    pub async fn unignore_line(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        line_id: i64,
        reason: &str,
    ) -> ApiResult<StatementLineView> {
        self.deps
            .statements
            .unignore(tenant_id, line_id, reason, &actor(user_id))
            .await?;
        self.statement_line_view(tenant_id, line_id).await
    }

    // ---- manual payment returns ------------------------------------

    pub async fn create_manual_return(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        params: ManualReturnParams,
    ) -> ApiResult<GatedWrite<Option<ManualReturnResponse>>> {
        params.validate()?;
        self.deps
            .scope_guard
            .assert_scope_access(tenant_id, user_id, "legal_entity", params.legal_entity_id)
            .await?;
        let payment_line = self
            .deps
            .payments
            .get_line(tenant_id, params.payment_line_id)
            .await?;
        let context = Self::bank_gate_context(
            "MANUAL_RETURN",
            "CREATE",
            Some(params.legal_entity_id),
            None,
            Some(params.amount_micros),
            Some(payment_line.currency_code.clone()),
        );
        match self.gate(tenant_id, &context).await? {
            None => {
                let applied = self
                    .deps
                    .payments
                    .apply_return_event(NewReturnEvent {
                        tenant_id,
                        legal_entity_id: params.legal_entity_id,
                        payment_line_id: params.payment_line_id,
                        request_id: params.event_request_id,
                        event_type: params.event_type,
                        amount_micros: params.amount_micros,
                        bank_reference: params.bank_reference,
                        reason: params.reason,
                    })
                    .await?;
                let idempotent = applied.idempotent;
                Ok(GatedWrite {
                    row: Some(ManualReturnResponse {
                        event: applied.event,
                        line: applied.line,
                        idempotent,
                    }),
                    approval_required: false,
                    approval_request: None,
                    idempotent,
                })
            }
            Some(policy) => {
                let request_key = format!("BANK:MANUAL_RETURN:CREATE:{}", params.event_request_id);
                let submit = self
                    .deps
                    .approvals
                    .submit(SubmitRequest {
                        tenant_id,
                        request_key,
                        policy,
                        target_type: "MANUAL_RETURN".into(),
                        target_id: params.payment_line_id,
                        action_type: "CREATE".into(),
                        legal_entity_id: Some(params.legal_entity_id),
                        bank_account_id: None,
                        threshold_amount_micros: Some(params.amount_micros),
                        action_payload: serde_json::json!({
                            "payment_line_id": params.payment_line_id,
                            "legal_entity_id": params.legal_entity_id,
                            "event_type": params.event_type,
                            "amount_micros": params.amount_micros,
                            "bank_reference": params.bank_reference,
                            "reason": params.reason,
                            "event_request_id": params.event_request_id,
                        }),
                        target_snapshot: snapshot(&payment_line)?,
                        requested_by_user_id: user_id,
                    })
                    .await?;
                Ok(GatedWrite::staged(None, submit.request, submit.idempotent))
            }
        }
    }

    // ---- audit -----------------------------------------------------

    pub async fn list_audit(
        &self,
        tenant_id: TenantId,
        filter: AuditFilter,
    ) -> ApiResult<Vec<AuditRecord>> {
        Ok(self.deps.audit.records(tenant_id, filter).await?)
    }
}

impl ReconApiDeps {
    fn runner_store(&self) -> &Arc<dyn konto_engine::RunStore> {
        self.runner.run_store()
    }
}

fn run_filters(params: &AutoRunParams) -> RunFilters {
    RunFilters {
        legal_entity_id: params.legal_entity_id,
        bank_account_id: params.bank_account_id,
        date_from: params.date_from,
        date_to: params.date_to,
        limit: params.limit,
    }
}
