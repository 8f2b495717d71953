use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use konto_common::BankAccountId;
use konto_common::LegalEntityId;
use konto_common::TenantId;
use konto_exceptions::ExceptionQueue;
use konto_exceptions::ReasonCode;
use konto_exceptions::UpsertException;
use konto_rules::ActiveRuleQuery;
use konto_rules::CandidateSources;
use konto_rules::LineView;
use konto_rules::Outcome;
use konto_rules::RuleEngine;
use konto_rules::RuleId;
use konto_rules::RuleStore;
use konto_statements::LineFilter;
use konto_statements::StatementLine;
use konto_statements::StatementsService;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;
use tracing::warn;

use crate::EngineError;
use crate::EngineResult;
use crate::EngineSettings;
use crate::executors::ExecutorSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    Preview,
    Apply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legal_entity_id: Option<LegalEntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_account_id: Option<BankAccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcomeRow {
    pub statement_line_id: i64,
    pub txn_date: NaiveDate,
    pub amount_micros: i64,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<RuleId>,
    #[serde(default)]
    pub detail: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub scanned_count: usize,
    /// Preview: lines with a ready outcome.
    pub matched_count: usize,
    /// Apply: lines actually reconciled by an executor.
    pub reconciled_count: usize,
    pub exception_count: usize,
    pub suggested_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoRun {
    pub id: i64,
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_request_id: Option<String>,
    pub mode: RunMode,
    pub status: RunStatus,
    pub filters: RunFilters,
    pub summary: RunSummary,
    /// Capped at the engine's payload row limit.
    pub rows: Vec<RunOutcomeRow>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run: AutoRun,
    pub replay: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunClaim {
    /// The request id was seen before; here is the winner's run.
    Replay(AutoRun),
    /// A fresh run id was reserved for this invocation.
    Started(i64),
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Reserves a run id. With a `run_request_id`, the first caller wins
    /// and later callers replay the winner's record.
    async fn claim(
        &self,
        tenant_id: TenantId,
        run_request_id: Option<&str>,
        mode: RunMode,
        filters: &RunFilters,
    ) -> EngineResult<RunClaim>;

    async fn complete(&self, run: AutoRun) -> EngineResult<AutoRun>;

    async fn get(&self, tenant_id: TenantId, run_id: i64) -> EngineResult<AutoRun>;

    async fn list(&self, tenant_id: TenantId, limit: usize) -> EngineResult<Vec<AutoRun>>;
}

#[derive(Default)]
pub struct InMemoryRunStore {
    state: Mutex<RunState>,
}

#[derive(Default)]
struct RunState {
    runs: HashMap<i64, AutoRun>,
    request_ids: HashMap<(TenantId, String), i64>,
    seq: i64,
}

impl InMemoryRunStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn claim(
        &self,
        tenant_id: TenantId,
        run_request_id: Option<&str>,
        mode: RunMode,
        filters: &RunFilters,
    ) -> EngineResult<RunClaim> {
        let mut state = self.state.lock().await;
        if let Some(request_id) = run_request_id {
            if let Some(existing_id) = state.request_ids.get(&(tenant_id, request_id.to_string())) {
                let existing = state
                    .runs
                    .get(existing_id)
                    .cloned()
                    .ok_or_else(|| EngineError::Conflict("dangling run request index".into()))?;
                return Ok(RunClaim::Replay(existing));
            }
        }
        state.seq += 1;
        let id = state.seq;
        // Placeholder so a concurrent replayer always finds a record;
        // complete() overwrites it with the real result.
        let placeholder = AutoRun {
            id,
            tenant_id,
            run_request_id: run_request_id.map(str::to_string),
            mode,
            status: RunStatus::Failed,
            filters: filters.clone(),
            summary: RunSummary::default(),
            rows: Vec::new(),
            created_at: Utc::now(),
        };
        if let Some(request_id) = run_request_id {
            state
                .request_ids
                .insert((tenant_id, request_id.to_string()), id);
        }
        state.runs.insert(id, placeholder);
        Ok(RunClaim::Started(id))
    }

    async fn complete(&self, run: AutoRun) -> EngineResult<AutoRun> {
        let mut state = self.state.lock().await;
        if !state.runs.contains_key(&run.id) {
            return Err(EngineError::Conflict(format!(
                "run {} was never claimed",
                run.id
            )));
        }
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get(&self, tenant_id: TenantId, run_id: i64) -> EngineResult<AutoRun> {
        let state = self.state.lock().await;
        state
            .runs
            .get(&run_id)
            .filter(|run| run.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("auto run {run_id}")))
    }

    async fn list(&self, tenant_id: TenantId, limit: usize) -> EngineResult<Vec<AutoRun>> {
        let state = self.state.lock().await;
        let mut runs: Vec<AutoRun> = state
            .runs
            .values()
            .filter(|run| run.tenant_id == tenant_id)
            .cloned()
            .collect();
        runs.sort_by_key(|run| std::cmp::Reverse(run.id));
        runs.truncate(limit);
        Ok(runs)
    }
}

/// Orchestrates preview and apply runs over the matching engine and the
/// executors.
pub struct ReconciliationRunner {
    statements: Arc<dyn StatementsService>,
    rules: Arc<dyn RuleStore>,
    sources: Arc<dyn CandidateSources>,
    executors: Arc<ExecutorSet>,
    exceptions: Arc<dyn ExceptionQueue>,
    runs: Arc<dyn RunStore>,
    engine: RuleEngine,
    settings: EngineSettings,
}

impl ReconciliationRunner {
    #[must_use]
    pub fn new(
        statements: Arc<dyn StatementsService>,
        rules: Arc<dyn RuleStore>,
        sources: Arc<dyn CandidateSources>,
        executors: Arc<ExecutorSet>,
        exceptions: Arc<dyn ExceptionQueue>,
        runs: Arc<dyn RunStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            statements,
            rules,
            sources,
            executors,
            exceptions,
            runs,
            engine: RuleEngine::new(),
            settings,
        }
    }

    #[must_use]
    pub fn run_store(&self) -> &Arc<dyn RunStore> {
        &self.runs
    }

    pub async fn preview(
        &self,
        tenant_id: TenantId,
        filters: RunFilters,
    ) -> EngineResult<RunReport> {
        self.execute(tenant_id, filters, None, RunMode::Preview).await
    }

    pub async fn apply(
        &self,
        tenant_id: TenantId,
        filters: RunFilters,
        run_request_id: Option<String>,
    ) -> EngineResult<RunReport> {
        self.execute(tenant_id, filters, run_request_id, RunMode::Apply)
            .await
    }

    async fn execute(
        &self,
        tenant_id: TenantId,
        filters: RunFilters,
        run_request_id: Option<String>,
        mode: RunMode,
    ) -> EngineResult<RunReport> {
        let run_id = match self
            .runs
            .claim(tenant_id, run_request_id.as_deref(), mode, &filters)
            .await?
        {
            RunClaim::Replay(run) => {
                info!(tenant_id, run_id = run.id, "auto run replayed");
                return Ok(RunReport { run, replay: true });
            }
            RunClaim::Started(id) => id,
        };

        let limit = self.settings.clamp_limit(filters.limit);
        let lines = self
            .statements
            .list_eligible(
                tenant_id,
                LineFilter {
                    legal_entity_id: filters.legal_entity_id,
                    bank_account_id: filters.bank_account_id,
                    date_from: filters.date_from,
                    date_to: filters.date_to,
                    limit: Some(limit),
                },
            )
            .await?;

        let mut summary = RunSummary::default();
        let mut rows = Vec::new();
        for line in &lines {
            summary.scanned_count += 1;
            let matched_total = self.statements.matched_total(tenant_id, line.id).await?;
            let view = LineView {
                line_id: line.id,
                legal_entity_id: line.legal_entity_id,
                bank_account_id: line.bank_account_id,
                txn_date: line.txn_date,
                description: line.description.clone(),
                reference_no: line.reference_no.clone(),
                amount_micros: line.amount_micros,
                remaining_abs_micros: line.amount_micros.abs() - matched_total,
                currency_code: line.currency_code.clone(),
            };
            let active_rules = self
                .rules
                .list_active(
                    tenant_id,
                    ActiveRuleQuery {
                        legal_entity_id: line.legal_entity_id,
                        bank_account_id: line.bank_account_id,
                        txn_date: line.txn_date,
                    },
                )
                .await?;
            let outcome = self
                .engine
                .evaluate_line(tenant_id, &view, &active_rules, self.sources.as_ref())
                .await?;

            let row = match mode {
                RunMode::Preview => preview_row(line, &outcome, &mut summary),
                RunMode::Apply => {
                    self.apply_outcome(tenant_id, line, outcome, &mut summary)
                        .await
                }
            };
            rows.push(row);
        }

        let status = if summary.exception_count == 0 && summary.suggested_count == 0 {
            RunStatus::Success
        } else {
            RunStatus::Partial
        };
        rows.truncate(self.settings.max_payload_rows);

        let run = self
            .runs
            .complete(AutoRun {
                id: run_id,
                tenant_id,
                run_request_id,
                mode,
                status,
                filters,
                summary,
                rows,
                created_at: Utc::now(),
            })
            .await?;
        info!(
            tenant_id,
            run_id = run.id,
            scanned = summary.scanned_count,
            reconciled = summary.reconciled_count,
            exceptions = summary.exception_count,
            "auto run completed"
        );
        Ok(RunReport { run, replay: false })
    }

    async fn apply_outcome(
        &self,
        tenant_id: TenantId,
        line: &StatementLine,
        outcome: Outcome,
        summary: &mut RunSummary,
    ) -> RunOutcomeRow {
        let rule_id = outcome.matched_rule_id();
        match outcome {
            Outcome::Skipped => {
                summary.skipped_count += 1;
                row(line, "SKIPPED", rule_id, serde_json::Value::Null, None)
            }
            Outcome::SuggestOnly { ref candidates, .. } => {
                summary.suggested_count += 1;
                row(
                    line,
                    "SUGGEST_ONLY",
                    rule_id,
                    serde_json::json!({ "candidates": candidates.len() }),
                    None,
                )
            }
            Outcome::NoRuleMatch => {
                self.queue_exception(
                    tenant_id,
                    line,
                    ReasonCode::NoRuleMatch,
                    rule_id,
                    serde_json::Value::Null,
                    "NO_RULE_MATCH",
                    summary,
                )
                .await
            }
            Outcome::AmbiguousTarget { ref candidates, .. } => {
                let detail = serde_json::json!({ "candidates": candidates.len() });
                self.queue_exception(
                    tenant_id,
                    line,
                    ReasonCode::AmbiguousTarget,
                    rule_id,
                    detail,
                    "AMBIGUOUS_TARGET",
                    summary,
                )
                .await
            }
            Outcome::PolicyBlocked { ref reason, .. } => {
                let detail = serde_json::json!({ "reason": reason });
                self.queue_exception(
                    tenant_id,
                    line,
                    ReasonCode::PolicyBlocked,
                    rule_id,
                    detail,
                    "POLICY_BLOCKED",
                    summary,
                )
                .await
            }
            Outcome::RuleQueueException { ref reason, .. } => {
                let detail = serde_json::json!({ "reason": reason });
                self.queue_exception(
                    tenant_id,
                    line,
                    ReasonCode::RuleQueueException,
                    rule_id,
                    detail,
                    "RULE_QUEUE_EXCEPTION",
                    summary,
                )
                .await
            }
            Outcome::AutoMatchReady {
                rule_id,
                target,
                candidate_amount_abs_micros,
                ..
            } => {
                let applied = self
                    .executors
                    .execute_auto_match(
                        tenant_id,
                        line,
                        rule_id,
                        target,
                        candidate_amount_abs_micros,
                    )
                    .await;
                self.executor_row(tenant_id, line, Some(rule_id), applied.map(|_| ()), "AUTO_MATCHED", summary)
                    .await
            }
            Outcome::AutoPostReady { rule_id, template_id } => {
                let applied = self
                    .executors
                    .execute_auto_post(tenant_id, line, rule_id, template_id)
                    .await;
                self.executor_row(
                    tenant_id,
                    line,
                    Some(rule_id),
                    applied.map(|_| ()),
                    "AUTO_POSTED_RECONCILED",
                    summary,
                )
                .await
            }
            Outcome::AutoReturnReady {
                rule_id,
                payment_line_id,
                batch_id,
                event_type,
                reason,
            } => {
                let applied = self
                    .executors
                    .execute_return(
                        tenant_id,
                        line,
                        rule_id,
                        payment_line_id,
                        batch_id,
                        event_type,
                        reason,
                        None,
                    )
                    .await;
                self.executor_row(
                    tenant_id,
                    line,
                    Some(rule_id),
                    applied.map(|_| ()),
                    "RETURN_PROCESSED_RECONCILED",
                    summary,
                )
                .await
            }
            Outcome::AutoDiffReady {
                rule_id,
                profile_id,
                payment_line_id,
                ..
            } => {
                let applied = self
                    .executors
                    .execute_difference(tenant_id, line, rule_id, profile_id, payment_line_id)
                    .await;
                self.executor_row(
                    tenant_id,
                    line,
                    Some(rule_id),
                    applied.map(|_| ()),
                    "DIFFERENCE_RECONCILED",
                    summary,
                )
                .await
            }
        }
    }

    async fn executor_row(
        &self,
        tenant_id: TenantId,
        line: &StatementLine,
        rule_id: Option<RuleId>,
        applied: EngineResult<()>,
        success_result: &str,
        summary: &mut RunSummary,
    ) -> RunOutcomeRow {
        match applied {
            Ok(()) => {
                summary.reconciled_count += 1;
                row(line, success_result, rule_id, serde_json::Value::Null, None)
            }
            Err(err) => {
                warn!(
                    tenant_id,
                    statement_line_id = line.id,
                    error = %err,
                    "executor failed; converting to APPLY_ERROR"
                );
                summary.error_count += 1;
                let detail = serde_json::json!({ "error": err.to_string() });
                self.queue_exception(
                    tenant_id,
                    line,
                    ReasonCode::ApplyError,
                    rule_id,
                    detail,
                    "APPLY_ERROR",
                    summary,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn queue_exception(
        &self,
        tenant_id: TenantId,
        line: &StatementLine,
        reason_code: ReasonCode,
        rule_id: Option<RuleId>,
        detail: serde_json::Value,
        result: &str,
        summary: &mut RunSummary,
    ) -> RunOutcomeRow {
        summary.exception_count += 1;
        let queued = self
            .exceptions
            .upsert(UpsertException {
                tenant_id,
                legal_entity_id: line.legal_entity_id,
                bank_account_id: line.bank_account_id,
                statement_line_id: line.id,
                reason_code,
                matched_rule_id: rule_id,
                suggested_payload: detail.clone(),
                severity: None,
                actor: "system".into(),
            })
            .await;
        let exception_id = match queued {
            Ok(exception) => Some(exception.id),
            Err(err) => {
                warn!(tenant_id, statement_line_id = line.id, error = %err, "exception upsert failed");
                None
            }
        };
        row(line, result, rule_id, detail, exception_id)
    }
}

fn preview_row(line: &StatementLine, outcome: &Outcome, summary: &mut RunSummary) -> RunOutcomeRow {
    let rule_id = outcome.matched_rule_id();
    match outcome {
        Outcome::AutoMatchReady { .. } => {
            summary.matched_count += 1;
            row(line, "AUTO_MATCH_READY", rule_id, serde_json::Value::Null, None)
        }
        Outcome::AutoPostReady { template_id, .. } => {
            summary.matched_count += 1;
            row(
                line,
                "AUTO_POST_READY",
                rule_id,
                serde_json::json!({ "template_id": template_id }),
                None,
            )
        }
        Outcome::AutoReturnReady { payment_line_id, .. } => {
            summary.matched_count += 1;
            row(
                line,
                "AUTO_RETURN_READY",
                rule_id,
                serde_json::json!({ "payment_line_id": payment_line_id }),
                None,
            )
        }
        Outcome::AutoDiffReady {
            payment_line_id,
            profile_id,
            ..
        } => {
            summary.matched_count += 1;
            row(
                line,
                "AUTO_DIFF_READY",
                rule_id,
                serde_json::json!({
                    "payment_line_id": payment_line_id,
                    "profile_id": profile_id,
                }),
                None,
            )
        }
        Outcome::SuggestOnly { candidates, .. } => {
            summary.suggested_count += 1;
            row(
                line,
                "SUGGEST_ONLY",
                rule_id,
                serde_json::json!({ "candidates": candidates.len() }),
                None,
            )
        }
        Outcome::AmbiguousTarget { candidates, .. } => {
            summary.exception_count += 1;
            row(
                line,
                "AMBIGUOUS_TARGET",
                rule_id,
                serde_json::json!({ "candidates": candidates.len() }),
                None,
            )
        }
        Outcome::PolicyBlocked { reason, .. } => {
            summary.exception_count += 1;
            row(
                line,
                "POLICY_BLOCKED",
                rule_id,
                serde_json::json!({ "reason": reason }),
                None,
            )
        }
        Outcome::RuleQueueException { reason, .. } => {
            summary.exception_count += 1;
            row(
                line,
                "RULE_QUEUE_EXCEPTION",
                rule_id,
                serde_json::json!({ "reason": reason }),
                None,
            )
        }
        Outcome::NoRuleMatch => {
            summary.exception_count += 1;
            row(line, "NO_RULE_MATCH", rule_id, serde_json::Value::Null, None)
        }
        Outcome::Skipped => {
            summary.skipped_count += 1;
            row(line, "SKIPPED", rule_id, serde_json::Value::Null, None)
        }
    }
}

fn row(
    line: &StatementLine,
    result: &str,
    rule_id: Option<RuleId>,
    detail: serde_json::Value,
    exception_id: Option<i64>,
) -> RunOutcomeRow {
    RunOutcomeRow {
        statement_line_id: line.id,
        txn_date: line.txn_date,
        amount_micros: line.amount_micros,
        result: result.to_string(),
        rule_id,
        detail,
        exception_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn claim_replays_for_duplicate_request_id() {
        let store = InMemoryRunStore::new();
        let filters = RunFilters::default();
        let first = store
            .claim(1, Some("RUN-1"), RunMode::Apply, &filters)
            .await
            .expect("claim");
        let RunClaim::Started(run_id) = first else {
            panic!("expected a fresh claim");
        };

        let replay = store
            .claim(1, Some("RUN-1"), RunMode::Apply, &filters)
            .await
            .expect("claim");
        match replay {
            RunClaim::Replay(run) => assert_eq!(run.id, run_id),
            RunClaim::Started(_) => panic!("duplicate request id must replay"),
        }

        // A different tenant is free to reuse the request id.
        let other = store
            .claim(2, Some("RUN-1"), RunMode::Apply, &filters)
            .await
            .expect("claim");
        assert!(matches!(other, RunClaim::Started(_)));
    }

    #[tokio::test]
    async fn runs_without_request_id_never_replay() {
        let store = InMemoryRunStore::new();
        let filters = RunFilters::default();
        for _ in 0..2 {
            let claim = store
                .claim(1, None, RunMode::Preview, &filters)
                .await
                .expect("claim");
            assert!(matches!(claim, RunClaim::Started(_)));
        }
    }
}
