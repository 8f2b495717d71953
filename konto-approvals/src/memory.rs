use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use konto_common::TenantId;
use konto_common::UserId;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::ApprovalPolicy;
use crate::ApprovalRequest;
use crate::ApprovalService;
use crate::ApprovalsError;
use crate::ApprovalsResult;
use crate::Decision;
use crate::DecisionKind;
use crate::ExecutionStatus;
use crate::ExecutorRegistry;
use crate::PolicyId;
use crate::PolicyStore;
use crate::RequestFilter;
use crate::RequestId;
use crate::RequestStatus;
use crate::SubmitOutcome;
use crate::SubmitRequest;
use crate::policy_snapshot;

#[derive(Default)]
pub struct InMemoryPolicyStore {
    policies: RwLock<HashMap<PolicyId, ApprovalPolicy>>,
    seq: RwLock<i64>,
}

impl InMemoryPolicyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn upsert(&self, mut policy: ApprovalPolicy) -> ApprovalsResult<ApprovalPolicy> {
        policy.validate()?;
        let mut guard = self.policies.write().await;
        if policy.id <= 0 {
            let mut seq = self.seq.write().await;
            *seq += 1;
            policy.id = *seq;
        }
        guard.insert(policy.id, policy.clone());
        Ok(policy)
    }

    async fn list_active(&self, tenant_id: TenantId) -> ApprovalsResult<Vec<ApprovalPolicy>> {
        let guard = self.policies.read().await;
        let mut policies: Vec<ApprovalPolicy> = guard
            .values()
            .filter(|policy| policy.tenant_id == tenant_id)
            .cloned()
            .collect();
        policies.sort_by_key(|policy| policy.id);
        Ok(policies)
    }
}

/// In-memory approval request store with executor dispatch.
///
/// Executors are registered after construction (the composition root owns
/// the wiring), hence the lock around the registry.
#[derive(Default)]
pub struct InMemoryApprovals {
    state: Mutex<State>,
    registry: RwLock<ExecutorRegistry>,
}

#[derive(Default)]
struct State {
    requests: HashMap<RequestId, ApprovalRequest>,
    keys: HashMap<(TenantId, String), RequestId>,
    seq: i64,
}

impl InMemoryApprovals {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_executor(
        &self,
        module_code: &str,
        target_type: &str,
        action_type: &str,
        executor: Arc<dyn crate::ApprovalExecutor>,
    ) {
        let mut registry = self.registry.write().await;
        registry.register(module_code, target_type, action_type, executor);
    }

    async fn run_executor(&self, request_id: RequestId, tenant_id: TenantId) {
        // Snapshot the request outside the execution itself.
        let request = {
            let state = self.state.lock().await;
            match state.requests.get(&request_id) {
                Some(request) => request.clone(),
                None => return,
            }
        };

        let executor = {
            let registry = self.registry.read().await;
            registry.resolve(
                &request.module_code,
                &request.target_type,
                &request.action_type,
            )
        };

        let result = match executor {
            Ok(executor) => executor.execute(&request).await,
            Err(err) => Err(anyhow::anyhow!(err)),
        };

        let mut state = self.state.lock().await;
        let Some(request) = state.requests.get_mut(&request_id) else {
            return;
        };
        if request.tenant_id != tenant_id {
            return;
        }
        let now = Utc::now();
        match result {
            Ok(value) => {
                request.request_status = RequestStatus::Executed;
                request.execution_status = ExecutionStatus::Executed;
                request.executed_at = Some(now);
                request.execution_result = Some(value);
            }
            Err(err) => {
                request.request_status = RequestStatus::Failed;
                request.execution_status = ExecutionStatus::Failed;
                request.execution_error = Some(err.to_string());
            }
        }
        request.updated_at = now;
    }
}

#[async_trait]
impl ApprovalService for InMemoryApprovals {
    async fn submit(&self, request: SubmitRequest) -> ApprovalsResult<SubmitOutcome> {
        if request.request_key.trim().is_empty() {
            return Err(ApprovalsError::Validation(
                "request key must be provided".into(),
            ));
        }
        let mut state = self.state.lock().await;
        let key = (request.tenant_id, request.request_key.clone());
        if let Some(existing_id) = state.keys.get(&key) {
            let existing = state
                .requests
                .get(existing_id)
                .cloned()
                .ok_or_else(|| ApprovalsError::Internal("dangling request key index".into()))?;
            return Ok(SubmitOutcome {
                request: existing,
                idempotent: true,
            });
        }

        state.seq += 1;
        let now = Utc::now();
        let stored = ApprovalRequest {
            id: state.seq,
            tenant_id: request.tenant_id,
            module_code: request.policy.module_code.clone(),
            request_code: Uuid::new_v4().to_string(),
            request_key: request.request_key,
            policy_id: request.policy.id,
            target_type: request.target_type,
            target_id: request.target_id,
            action_type: request.action_type,
            request_status: RequestStatus::Pending,
            execution_status: ExecutionStatus::NotExecuted,
            legal_entity_id: request.legal_entity_id,
            bank_account_id: request.bank_account_id,
            threshold_amount_micros: request.threshold_amount_micros,
            policy_snapshot: policy_snapshot(&request.policy),
            action_payload: request.action_payload,
            target_snapshot: request.target_snapshot,
            requested_by_user_id: request.requested_by_user_id,
            created_at: now,
            updated_at: now,
            executed_at: None,
            execution_result: None,
            execution_error: None,
            decisions: Vec::new(),
        };
        state.keys.insert(key, stored.id);
        state.requests.insert(stored.id, stored.clone());
        Ok(SubmitOutcome {
            request: stored,
            idempotent: false,
        })
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        request_id: RequestId,
    ) -> ApprovalsResult<ApprovalRequest> {
        let state = self.state.lock().await;
        state
            .requests
            .get(&request_id)
            .filter(|request| request.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| ApprovalsError::NotFound(format!("approval request {request_id}")))
    }

    async fn list(
        &self,
        tenant_id: TenantId,
        filter: RequestFilter,
    ) -> ApprovalsResult<Vec<ApprovalRequest>> {
        let state = self.state.lock().await;
        let mut requests: Vec<ApprovalRequest> = state
            .requests
            .values()
            .filter(|request| request.tenant_id == tenant_id)
            .filter(|request| {
                filter
                    .status
                    .is_none_or(|status| request.request_status == status)
            })
            .filter(|request| {
                filter
                    .module_code
                    .as_deref()
                    .is_none_or(|module| request.module_code == module)
            })
            .cloned()
            .collect();
        requests.sort_by_key(|request| std::cmp::Reverse(request.id));
        if let Some(limit) = filter.limit
            && requests.len() > limit
        {
            requests.truncate(limit);
        }
        Ok(requests)
    }

    async fn decide(
        &self,
        tenant_id: TenantId,
        request_id: RequestId,
        user_id: UserId,
        decision: DecisionKind,
        comment: Option<String>,
    ) -> ApprovalsResult<ApprovalRequest> {
        let (approved_for_execution, snapshot) = {
            let mut state = self.state.lock().await;
            let request = state
                .requests
                .get_mut(&request_id)
                .filter(|request| request.tenant_id == tenant_id)
                .ok_or_else(|| {
                    ApprovalsError::NotFound(format!("approval request {request_id}"))
                })?;
            if request.is_finalized() {
                return Err(ApprovalsError::Conflict(format!(
                    "approval request {request_id} is {:?}",
                    request.request_status
                )));
            }
            if decision == DecisionKind::Approve
                && request.maker_checker_required()
                && request.requested_by_user_id == user_id
            {
                return Err(ApprovalsError::MakerChecker(
                    "requester cannot approve their own request".into(),
                ));
            }

            let now = Utc::now();
            let record = Decision {
                user_id,
                decision,
                comment,
                decided_at: now,
            };
            match request
                .decisions
                .iter()
                .position(|existing| existing.user_id == user_id)
            {
                Some(index) => request.decisions[index] = record,
                None => request.decisions.push(record),
            }

            let rejects = request
                .decisions
                .iter()
                .filter(|d| d.decision == DecisionKind::Reject)
                .count();
            let approvals = request
                .decisions
                .iter()
                .filter(|d| d.decision == DecisionKind::Approve)
                .count() as u32;

            if rejects > 0 {
                request.request_status = RequestStatus::Rejected;
            } else if approvals >= request.required_approvals() {
                request.request_status = RequestStatus::Approved;
            }
            request.updated_at = now;

            let approved_for_execution =
                request.request_status == RequestStatus::Approved && request.auto_execute();
            if approved_for_execution {
                request.execution_status = ExecutionStatus::Executing;
            }
            (approved_for_execution, request.clone())
        };

        if approved_for_execution {
            self.run_executor(snapshot.id, tenant_id).await;
            return self.get(tenant_id, request_id).await;
        }
        Ok(snapshot)
    }

    async fn cancel(
        &self,
        tenant_id: TenantId,
        request_id: RequestId,
        actor: UserId,
    ) -> ApprovalsResult<ApprovalRequest> {
        let mut state = self.state.lock().await;
        let request = state
            .requests
            .get_mut(&request_id)
            .filter(|request| request.tenant_id == tenant_id)
            .ok_or_else(|| ApprovalsError::NotFound(format!("approval request {request_id}")))?;
        if request.is_finalized() {
            return Err(ApprovalsError::Conflict(format!(
                "approval request {request_id} is {:?}",
                request.request_status
            )));
        }
        if request.requested_by_user_id != actor {
            return Err(ApprovalsError::Validation(
                "only the requester can cancel a pending request".into(),
            ));
        }
        request.request_status = RequestStatus::Cancelled;
        request.updated_at = Utc::now();
        Ok(request.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ApprovalExecutor;
    use konto_common::EffectiveWindow;
    use konto_common::ScopeSelector;
    use pretty_assertions::assert_eq;

    fn policy(required: u32, auto_execute: bool) -> ApprovalPolicy {
        ApprovalPolicy {
            id: 1,
            tenant_id: 1,
            module_code: "BANK".into(),
            target_type: "RECON_RULE".into(),
            action_type: "CREATE".into(),
            scope: ScopeSelector::global(),
            currency_code: None,
            min_amount_micros: None,
            max_amount_micros: None,
            status: crate::PolicyStatus::Active,
            required_approvals: required,
            maker_checker_required: true,
            approver_permission_code: None,
            auto_execute_on_final_approval: auto_execute,
            window: EffectiveWindow::open(),
        }
    }

    fn submit(key: &str, policy: ApprovalPolicy) -> SubmitRequest {
        SubmitRequest {
            tenant_id: 1,
            request_key: key.into(),
            policy,
            target_type: "RECON_RULE".into(),
            target_id: 9,
            action_type: "CREATE".into(),
            legal_entity_id: Some(10),
            bank_account_id: None,
            threshold_amount_micros: None,
            action_payload: serde_json::json!({"rule_id": 9}),
            target_snapshot: serde_json::json!({"status": "Paused"}),
            requested_by_user_id: 100,
        }
    }

    struct RecordingExecutor {
        executed: tokio::sync::Mutex<Vec<RequestId>>,
        fail: bool,
    }

    #[async_trait]
    impl ApprovalExecutor for RecordingExecutor {
        async fn execute(&self, request: &ApprovalRequest) -> anyhow::Result<serde_json::Value> {
            self.executed.lock().await.push(request.id);
            if self.fail {
                anyhow::bail!("executor exploded");
            }
            Ok(serde_json::json!({"activated": request.target_id}))
        }
    }

    #[tokio::test]
    async fn submit_is_idempotent_by_request_key() {
        let service = InMemoryApprovals::new();
        let first = service
            .submit(submit("K-1", policy(1, false)))
            .await
            .expect("submit");
        assert!(!first.idempotent);

        let replay = service
            .submit(submit("K-1", policy(1, false)))
            .await
            .expect("replay");
        assert!(replay.idempotent);
        assert_eq!(replay.request.id, first.request.id);
    }

    #[tokio::test]
    async fn maker_checker_blocks_self_approval() {
        let service = InMemoryApprovals::new();
        let outcome = service
            .submit(submit("K-2", policy(1, false)))
            .await
            .expect("submit");
        let err = service
            .decide(1, outcome.request.id, 100, DecisionKind::Approve, None)
            .await
            .expect_err("self approval rejected");
        assert!(matches!(err, ApprovalsError::MakerChecker(_)));

        // The requester may still reject their own request.
        let rejected = service
            .decide(1, outcome.request.id, 100, DecisionKind::Reject, None)
            .await
            .expect("self reject allowed");
        assert_eq!(rejected.request_status, RequestStatus::Rejected);
    }

    #[tokio::test]
    async fn approval_counting_reaches_quorum() {
        let service = InMemoryApprovals::new();
        let outcome = service
            .submit(submit("K-3", policy(2, false)))
            .await
            .expect("submit");

        let after_one = service
            .decide(1, outcome.request.id, 201, DecisionKind::Approve, None)
            .await
            .expect("first approval");
        assert_eq!(after_one.request_status, RequestStatus::Pending);

        // The same approver deciding twice does not double-count.
        let after_repeat = service
            .decide(1, outcome.request.id, 201, DecisionKind::Approve, None)
            .await
            .expect("repeat approval");
        assert_eq!(after_repeat.request_status, RequestStatus::Pending);
        assert_eq!(after_repeat.decisions.len(), 1);

        let final_state = service
            .decide(1, outcome.request.id, 202, DecisionKind::Approve, None)
            .await
            .expect("second approval");
        assert_eq!(final_state.request_status, RequestStatus::Approved);
        assert_eq!(final_state.execution_status, ExecutionStatus::NotExecuted);
    }

    #[tokio::test]
    async fn auto_execute_dispatches_and_records_result() {
        let service = InMemoryApprovals::new();
        let executor = Arc::new(RecordingExecutor {
            executed: tokio::sync::Mutex::new(Vec::new()),
            fail: false,
        });
        service
            .register_executor("BANK", "RECON_RULE", "CREATE", executor.clone())
            .await;

        let outcome = service
            .submit(submit("K-4", policy(1, true)))
            .await
            .expect("submit");
        let executed = service
            .decide(1, outcome.request.id, 201, DecisionKind::Approve, None)
            .await
            .expect("decide");
        assert_eq!(executed.request_status, RequestStatus::Executed);
        assert_eq!(executed.execution_status, ExecutionStatus::Executed);
        assert_eq!(
            executed.execution_result,
            Some(serde_json::json!({"activated": 9}))
        );
        assert_eq!(executor.executed.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn failing_executor_marks_request_failed() {
        let service = InMemoryApprovals::new();
        service
            .register_executor(
                "BANK",
                "RECON_RULE",
                "CREATE",
                Arc::new(RecordingExecutor {
                    executed: tokio::sync::Mutex::new(Vec::new()),
                    fail: true,
                }),
            )
            .await;

        let outcome = service
            .submit(submit("K-5", policy(1, true)))
            .await
            .expect("submit");
        let failed = service
            .decide(1, outcome.request.id, 201, DecisionKind::Approve, None)
            .await
            .expect("decide");
        assert_eq!(failed.request_status, RequestStatus::Failed);
        assert_eq!(failed.execution_status, ExecutionStatus::Failed);
        assert_eq!(failed.execution_error.as_deref(), Some("executor exploded"));
    }

    #[tokio::test]
    async fn missing_executor_fails_the_request() {
        let service = InMemoryApprovals::new();
        let outcome = service
            .submit(submit("K-6", policy(1, true)))
            .await
            .expect("submit");
        let failed = service
            .decide(1, outcome.request.id, 201, DecisionKind::Approve, None)
            .await
            .expect("decide");
        assert_eq!(failed.execution_status, ExecutionStatus::Failed);
        assert!(
            failed
                .execution_error
                .as_deref()
                .is_some_and(|err| err.contains("no executor"))
        );
    }

    #[tokio::test]
    async fn rejected_requests_accept_no_further_decisions() {
        let service = InMemoryApprovals::new();
        let outcome = service
            .submit(submit("K-7", policy(2, false)))
            .await
            .expect("submit");
        service
            .decide(1, outcome.request.id, 201, DecisionKind::Reject, Some("no".into()))
            .await
            .expect("reject");
        let err = service
            .decide(1, outcome.request.id, 202, DecisionKind::Approve, None)
            .await
            .expect_err("finalized request refuses decisions");
        assert!(matches!(err, ApprovalsError::Conflict(_)));
    }
}
