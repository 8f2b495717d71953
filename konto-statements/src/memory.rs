use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use konto_common::DifferenceType;
use konto_common::TenantId;
use konto_common::money::AmountMicros;
use konto_common::money::EPSILON_MICROS;
use konto_common::money::format_amount;
use tokio::sync::Mutex;

use crate::AuditAction;
use crate::AuditEvent;
use crate::LineFilter;
use crate::Match;
use crate::MatchId;
use crate::MatchOutcome;
use crate::MatchRequest;
use crate::MatchStatus;
use crate::MatchTargetVerifier;
use crate::MatchedEntityType;
use crate::MatchedLineObserver;
use crate::MatchMeta;
use crate::NewStatementLine;
use crate::ReconStatus;
use crate::ReconcileOutcome;
use crate::StatementAuditHook;
use crate::StatementLine;
use crate::StatementLineId;
use crate::StatementsError;
use crate::StatementsResult;
use crate::StatementsService;
use crate::derive_status;

/// In-memory matching & status machine. A single mutex over lines and
/// matches makes every mutating operation one critical section, so the
/// matched-sum precondition holds under concurrent writers; a relational
/// store would take a row lock on the line instead.
pub struct InMemoryStatements {
    state: Mutex<State>,
    verifier: Arc<dyn MatchTargetVerifier>,
    audit_hooks: RwLock<Vec<Arc<dyn StatementAuditHook>>>,
    observers: RwLock<Vec<Arc<dyn MatchedLineObserver>>>,
}

#[derive(Default)]
struct State {
    lines: HashMap<StatementLineId, StatementLine>,
    matches: HashMap<MatchId, Match>,
    line_seq: i64,
    match_seq: i64,
}

impl State {
    fn matched_total(&self, line_id: StatementLineId) -> AmountMicros {
        self.matches
            .values()
            .filter(|row| row.statement_line_id == line_id && row.status == MatchStatus::Active)
            .map(|row| row.matched_amount_micros)
            .sum()
    }

    fn line_mut(
        &mut self,
        tenant_id: TenantId,
        line_id: StatementLineId,
    ) -> StatementsResult<&mut StatementLine> {
        self.lines
            .get_mut(&line_id)
            .filter(|line| line.tenant_id == tenant_id)
            .ok_or_else(|| StatementsError::NotFound(format!("statement line {line_id}")))
    }

    fn line_ref(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
    ) -> StatementsResult<&StatementLine> {
        self.lines
            .get(&line_id)
            .filter(|line| line.tenant_id == tenant_id)
            .ok_or_else(|| StatementsError::NotFound(format!("statement line {line_id}")))
    }
}

impl InMemoryStatements {
    #[must_use]
    pub fn new(verifier: Arc<dyn MatchTargetVerifier>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            verifier,
            audit_hooks: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    fn emit_audit(&self, event: AuditEvent) {
        if let Ok(hooks) = self.audit_hooks.read() {
            for hook in hooks.iter() {
                hook.record(&event);
            }
        }
    }

    async fn notify_matched(&self, line: &StatementLine) {
        let observers: Vec<Arc<dyn MatchedLineObserver>> = match self.observers.read() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        for observer in observers {
            observer.on_line_matched(line).await;
        }
    }

    /// Recomputes the derived status after a match mutation. Returns the
    /// audit event for the transition, if one happened. `Ignored` lines
    /// keep their status.
    fn recompute_status(
        line: &mut StatementLine,
        matched_total: AmountMicros,
        actor: &str,
    ) -> Option<AuditEvent> {
        if line.recon_status == ReconStatus::Ignored {
            return None;
        }
        let from = line.recon_status;
        let to = derive_status(line.amount_micros, matched_total);
        if from == to {
            return None;
        }
        line.recon_status = to;
        Some(AuditEvent {
            tenant_id: line.tenant_id,
            statement_line_id: line.id,
            action: AuditAction::AutoStatus,
            actor: actor.to_string(),
            metadata: serde_json::json!({
                "from": format!("{from:?}"),
                "to": format!("{to:?}"),
                "matched_total": format_amount(matched_total),
                "target_amount": format_amount(line.amount_micros.abs()),
            }),
        })
    }

    fn insert_match_locked(
        state: &mut State,
        tenant_id: TenantId,
        line_id: StatementLineId,
        request: MatchRequest,
    ) -> StatementsResult<(StatementLine, Match, Vec<AuditEvent>)> {
        if request.amount_micros <= 0 {
            return Err(StatementsError::Validation(
                "matched amount must be positive".into(),
            ));
        }

        let matched_total = state.matched_total(line_id);
        let line = state.line_mut(tenant_id, line_id)?;
        if line.recon_status == ReconStatus::Ignored {
            return Err(StatementsError::Validation(format!(
                "statement line {line_id} is ignored"
            )));
        }
        if matched_total + request.amount_micros > line.amount_micros.abs() + EPSILON_MICROS {
            return Err(StatementsError::Validation(
                "matched amount exceeds statement line amount".into(),
            ));
        }

        if let Some(method) = request.meta.reconciliation_method {
            line.reconciliation_method = Some(method);
        }
        if let Some(rule_id) = request.meta.rule_id {
            line.matched_rule_id = Some(rule_id);
        }
        if let Some(confidence) = request.meta.confidence {
            line.match_confidence = Some(confidence);
        }

        state.match_seq += 1;
        let row = Match {
            id: state.match_seq,
            tenant_id,
            legal_entity_id: state.line_ref(tenant_id, line_id)?.legal_entity_id,
            statement_line_id: line_id,
            match_type: request.meta.match_type,
            matched_entity_type: request.matched_entity_type,
            matched_entity_id: request.matched_entity_id,
            matched_amount_micros: request.amount_micros,
            status: MatchStatus::Active,
            notes: request.meta.notes.clone(),
            created_by: request.meta.actor.clone(),
        };
        state.matches.insert(row.id, row.clone());

        let new_total = matched_total + request.amount_micros;
        let mut events = Vec::new();
        let line = state.line_mut(tenant_id, line_id)?;
        if let Some(event) = Self::recompute_status(line, new_total, &request.meta.actor) {
            events.push(event);
        }
        events.push(AuditEvent {
            tenant_id,
            statement_line_id: line_id,
            action: AuditAction::Matched,
            actor: request.meta.actor,
            metadata: serde_json::json!({
                "match_id": row.id,
                "entity_type": format!("{:?}", row.matched_entity_type),
                "entity_id": row.matched_entity_id,
                "amount": format_amount(row.matched_amount_micros),
            }),
        });

        Ok((line.clone(), row, events))
    }
}

#[async_trait]
impl StatementsService for InMemoryStatements {
    async fn insert_line(&self, line: NewStatementLine) -> StatementsResult<StatementLine> {
        line.validate()?;
        let mut state = self.state.lock().await;
        state.line_seq += 1;
        let stored = StatementLine {
            id: state.line_seq,
            tenant_id: line.tenant_id,
            legal_entity_id: line.legal_entity_id,
            bank_account_id: line.bank_account_id,
            import_id: line.import_id,
            line_no: line.line_no,
            txn_date: line.txn_date,
            value_date: line.value_date,
            description: line.description,
            reference_no: line.reference_no,
            amount_micros: line.amount_micros,
            currency_code: line.currency_code.trim().to_ascii_uppercase(),
            balance_after_micros: line.balance_after_micros,
            recon_status: ReconStatus::Unmatched,
            reconciliation_method: None,
            matched_rule_id: None,
            match_confidence: None,
            auto_post_template_id: None,
            auto_post_journal_entry_id: None,
            difference_profile_id: None,
            difference_journal_entry_id: None,
            difference_amount_micros: None,
            difference_type: None,
        };
        state.lines.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_line(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
    ) -> StatementsResult<StatementLine> {
        let state = self.state.lock().await;
        state.line_ref(tenant_id, line_id).cloned()
    }

    async fn active_matches(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
    ) -> StatementsResult<Vec<Match>> {
        let state = self.state.lock().await;
        state.line_ref(tenant_id, line_id)?;
        let mut rows: Vec<Match> = state
            .matches
            .values()
            .filter(|row| {
                row.statement_line_id == line_id && row.status == MatchStatus::Active
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    async fn matched_total(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
    ) -> StatementsResult<AmountMicros> {
        let state = self.state.lock().await;
        state.line_ref(tenant_id, line_id)?;
        Ok(state.matched_total(line_id))
    }

    async fn list_eligible(
        &self,
        tenant_id: TenantId,
        filter: LineFilter,
    ) -> StatementsResult<Vec<StatementLine>> {
        let state = self.state.lock().await;
        let mut rows: Vec<StatementLine> = state
            .lines
            .values()
            .filter(|line| line.tenant_id == tenant_id)
            .filter(|line| {
                matches!(
                    line.recon_status,
                    ReconStatus::Unmatched | ReconStatus::Partial
                )
            })
            .filter(|line| {
                filter
                    .legal_entity_id
                    .is_none_or(|id| line.legal_entity_id == id)
            })
            .filter(|line| {
                filter
                    .bank_account_id
                    .is_none_or(|id| line.bank_account_id == id)
            })
            .filter(|line| filter.date_from.is_none_or(|from| line.txn_date >= from))
            .filter(|line| filter.date_to.is_none_or(|to| line.txn_date <= to))
            .cloned()
            .collect();
        rows.sort_by_key(|line| (line.txn_date, line.id));
        if let Some(limit) = filter.limit
            && rows.len() > limit
        {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn match_line(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
        request: MatchRequest,
    ) -> StatementsResult<MatchOutcome> {
        self.verifier
            .verify_posted(tenant_id, request.matched_entity_type, request.matched_entity_id)
            .await?;

        let (line, row, events) = {
            let mut state = self.state.lock().await;
            Self::insert_match_locked(&mut state, tenant_id, line_id, request)?
        };
        for event in events {
            self.emit_audit(event);
        }
        if line.recon_status == ReconStatus::Matched {
            self.notify_matched(&line).await;
        }
        Ok(MatchOutcome {
            line,
            match_row: row,
        })
    }

    async fn unmatch(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
        match_id: Option<MatchId>,
        actor: &str,
    ) -> StatementsResult<StatementLine> {
        let (line, events) = {
            let mut state = self.state.lock().await;
            state.line_ref(tenant_id, line_id)?;

            let targets: Vec<MatchId> = match match_id {
                Some(id) => {
                    let row = state
                        .matches
                        .get(&id)
                        .filter(|row| {
                            row.statement_line_id == line_id && row.tenant_id == tenant_id
                        })
                        .ok_or_else(|| StatementsError::NotFound(format!("match {id}")))?;
                    if row.status != MatchStatus::Active {
                        return Err(StatementsError::Validation(format!(
                            "match {id} is not active"
                        )));
                    }
                    vec![id]
                }
                None => state
                    .matches
                    .values()
                    .filter(|row| {
                        row.statement_line_id == line_id && row.status == MatchStatus::Active
                    })
                    .map(|row| row.id)
                    .collect(),
            };

            for id in &targets {
                if let Some(row) = state.matches.get_mut(id) {
                    row.status = MatchStatus::Reversed;
                }
            }

            let matched_total = state.matched_total(line_id);
            let line = state.line_mut(tenant_id, line_id)?;
            let mut events = Vec::new();
            if let Some(event) = Self::recompute_status(line, matched_total, actor) {
                events.push(event);
            }
            events.push(AuditEvent {
                tenant_id,
                statement_line_id: line_id,
                action: AuditAction::Unmatched,
                actor: actor.to_string(),
                metadata: serde_json::json!({ "reversed_matches": targets }),
            });
            (line.clone(), events)
        };
        for event in events {
            self.emit_audit(event);
        }
        Ok(line)
    }

    async fn ignore(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
        reason: &str,
        actor: &str,
    ) -> StatementsResult<StatementLine> {
        let line = {
            let mut state = self.state.lock().await;
            let matched_total = state.matched_total(line_id);
            let line = state.line_mut(tenant_id, line_id)?;
            if matched_total > 0 {
                return Err(StatementsError::Validation(
                    "cannot ignore a line with active matches".into(),
                ));
            }
            line.recon_status = ReconStatus::Ignored;
            line.clone()
        };
        self.emit_audit(AuditEvent {
            tenant_id,
            statement_line_id: line_id,
            action: AuditAction::Ignore,
            actor: actor.to_string(),
            metadata: serde_json::json!({ "reason": reason }),
        });
        Ok(line)
    }

    async fn unignore(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
        reason: &str,
        actor: &str,
    ) -> StatementsResult<StatementLine> {
        let (line, events) = {
            let mut state = self.state.lock().await;
            let matched_total = state.matched_total(line_id);
            let line = state.line_mut(tenant_id, line_id)?;
            if line.recon_status != ReconStatus::Ignored {
                return Err(StatementsError::Validation(format!(
                    "statement line {line_id} is not ignored"
                )));
            }
            let restored = derive_status(line.amount_micros, matched_total);
            line.recon_status = restored;
            let mut events = vec![AuditEvent {
                tenant_id,
                statement_line_id: line_id,
                action: AuditAction::Unignore,
                actor: actor.to_string(),
                metadata: serde_json::json!({ "reason": reason, "restored": format!("{restored:?}") }),
            }];
            events.push(AuditEvent {
                tenant_id,
                statement_line_id: line_id,
                action: AuditAction::AutoStatus,
                actor: actor.to_string(),
                metadata: serde_json::json!({
                    "from": "Ignored",
                    "to": format!("{restored:?}"),
                    "matched_total": format_amount(matched_total),
                    "target_amount": format_amount(line.amount_micros.abs()),
                }),
            });
            (line.clone(), events)
        };
        for event in events {
            self.emit_audit(event);
        }
        if line.recon_status == ReconStatus::Matched {
            self.notify_matched(&line).await;
        }
        Ok(line)
    }

    async fn reconcile_to_journal(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
        journal_entry_id: i64,
        amount_micros: Option<AmountMicros>,
        meta: MatchMeta,
    ) -> StatementsResult<ReconcileOutcome> {
        self.verifier
            .verify_posted(tenant_id, MatchedEntityType::Journal, journal_entry_id)
            .await?;

        enum Prepared {
            NoOp(StatementLine, Option<Match>),
            Insert(StatementLine, Match, Vec<AuditEvent>),
        }

        let prepared = {
            let mut state = self.state.lock().await;
            let existing = state
                .matches
                .values()
                .find(|row| {
                    row.statement_line_id == line_id
                        && row.status == MatchStatus::Active
                        && row.matched_entity_type == MatchedEntityType::Journal
                        && row.matched_entity_id == journal_entry_id
                })
                .cloned();
            let line = state.line_ref(tenant_id, line_id)?.clone();
            if let Some(existing) = existing {
                Prepared::NoOp(line, Some(existing))
            } else {
                let remaining = line.amount_micros.abs() - state.matched_total(line_id);
                if remaining <= EPSILON_MICROS {
                    Prepared::NoOp(line, None)
                } else {
                    let amount = amount_micros.unwrap_or(remaining);
                    let (line, row, events) = Self::insert_match_locked(
                        &mut state,
                        tenant_id,
                        line_id,
                        MatchRequest {
                            matched_entity_type: MatchedEntityType::Journal,
                            matched_entity_id: journal_entry_id,
                            amount_micros: amount,
                            meta,
                        },
                    )?;
                    Prepared::Insert(line, row, events)
                }
            }
        };

        match prepared {
            Prepared::NoOp(line, match_row) => Ok(ReconcileOutcome {
                line,
                match_row,
                idempotent: true,
            }),
            Prepared::Insert(line, row, events) => {
                for event in events {
                    self.emit_audit(event);
                }
                if line.recon_status == ReconStatus::Matched {
                    self.notify_matched(&line).await;
                }
                Ok(ReconcileOutcome {
                    line,
                    match_row: Some(row),
                    idempotent: false,
                })
            }
        }
    }

    async fn record_auto_post(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
        template_id: i64,
        journal_entry_id: i64,
    ) -> StatementsResult<StatementLine> {
        let mut state = self.state.lock().await;
        let line = state.line_mut(tenant_id, line_id)?;
        line.auto_post_template_id = Some(template_id);
        line.auto_post_journal_entry_id = Some(journal_entry_id);
        Ok(line.clone())
    }

    async fn record_difference(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
        profile_id: i64,
        journal_entry_id: i64,
        difference_micros: AmountMicros,
        difference_type: DifferenceType,
    ) -> StatementsResult<StatementLine> {
        let mut state = self.state.lock().await;
        let line = state.line_mut(tenant_id, line_id)?;
        line.difference_profile_id = Some(profile_id);
        line.difference_journal_entry_id = Some(journal_entry_id);
        line.difference_amount_micros = Some(difference_micros);
        line.difference_type = Some(difference_type);
        Ok(line.clone())
    }

    fn register_audit_hook(&self, hook: Arc<dyn StatementAuditHook>) {
        if let Ok(mut hooks) = self.audit_hooks.write() {
            hooks.push(hook);
        }
    }

    fn register_matched_observer(&self, observer: Arc<dyn MatchedLineObserver>) {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(observer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AcceptAllTargets;
    use crate::MatchType;
    use chrono::NaiveDate;
    use konto_common::money::from_units;
    use pretty_assertions::assert_eq;

    fn service() -> InMemoryStatements {
        InMemoryStatements::new(Arc::new(AcceptAllTargets))
    }

    fn new_line(amount: AmountMicros) -> NewStatementLine {
        NewStatementLine {
            tenant_id: 1,
            legal_entity_id: 10,
            bank_account_id: 20,
            import_id: 1,
            line_no: 1,
            txn_date: NaiveDate::from_ymd_opt(2025, 3, 5).expect("date"),
            value_date: None,
            description: Some("WIRE IN".into()),
            reference_no: Some("REF-1".into()),
            amount_micros: amount,
            currency_code: "EUR".into(),
            balance_after_micros: None,
        }
    }

    fn journal_match(journal_id: i64, amount: AmountMicros) -> MatchRequest {
        MatchRequest {
            matched_entity_type: MatchedEntityType::Journal,
            matched_entity_id: journal_id,
            amount_micros: amount,
            meta: MatchMeta::manual("user:1"),
        }
    }

    #[tokio::test]
    async fn partial_then_full_match_then_unmatch_roundtrip() {
        let service = service();
        let line = service
            .insert_line(new_line(from_units(100)))
            .await
            .expect("line");

        let first = service
            .match_line(1, line.id, journal_match(500, from_units(40)))
            .await
            .expect("first match");
        assert_eq!(first.line.recon_status, ReconStatus::Partial);

        let over = service
            .match_line(1, line.id, journal_match(500, from_units(70)))
            .await
            .expect_err("over-match must fail");
        assert!(matches!(over, StatementsError::Validation(_)));

        let second = service
            .match_line(1, line.id, journal_match(500, from_units(60)))
            .await
            .expect("completing match");
        assert_eq!(second.line.recon_status, ReconStatus::Matched);
        assert_eq!(
            service.active_matches(1, line.id).await.expect("rows").len(),
            2
        );

        let after_one = service
            .unmatch(1, line.id, Some(first.match_row.id), "user:1")
            .await
            .expect("unmatch one");
        assert_eq!(after_one.recon_status, ReconStatus::Partial);

        let after_all = service
            .unmatch(1, line.id, None, "user:1")
            .await
            .expect("unmatch all");
        assert_eq!(after_all.recon_status, ReconStatus::Unmatched);
        assert!(
            service
                .active_matches(1, line.id)
                .await
                .expect("rows")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn over_match_boundary_at_epsilon() {
        let service = service();
        let line = service
            .insert_line(new_line(from_units(100)))
            .await
            .expect("line");

        // Exactly epsilon over still passes.
        service
            .match_line(
                1,
                line.id,
                journal_match(500, from_units(100) + EPSILON_MICROS),
            )
            .await
            .expect("epsilon over-match succeeds");

        let line2 = service
            .insert_line(new_line(from_units(100)))
            .await
            .expect("line");
        let err = service
            .match_line(
                1,
                line2.id,
                journal_match(500, from_units(100) + 2 * EPSILON_MICROS),
            )
            .await
            .expect_err("two epsilon fails");
        assert!(matches!(err, StatementsError::Validation(_)));
    }

    #[tokio::test]
    async fn ignore_blocks_matching_and_unignore_restores() {
        let service = service();
        let line = service
            .insert_line(new_line(from_units(50)))
            .await
            .expect("line");

        let ignored = service
            .ignore(1, line.id, "duplicate import", "user:2")
            .await
            .expect("ignore");
        assert_eq!(ignored.recon_status, ReconStatus::Ignored);

        let err = service
            .match_line(1, line.id, journal_match(7, from_units(50)))
            .await
            .expect_err("ignored line rejects matches");
        assert!(matches!(err, StatementsError::Validation(_)));

        let restored = service
            .unignore(1, line.id, "re-checked", "user:2")
            .await
            .expect("unignore");
        assert_eq!(restored.recon_status, ReconStatus::Unmatched);
    }

    #[tokio::test]
    async fn ignore_rejected_when_matches_active() {
        let service = service();
        let line = service
            .insert_line(new_line(from_units(50)))
            .await
            .expect("line");
        service
            .match_line(1, line.id, journal_match(7, from_units(10)))
            .await
            .expect("match");
        let err = service
            .ignore(1, line.id, "nope", "user:2")
            .await
            .expect_err("active matches block ignore");
        assert!(matches!(err, StatementsError::Validation(_)));
    }

    #[tokio::test]
    async fn reconcile_to_journal_is_idempotent() {
        let service = service();
        let line = service
            .insert_line(new_line(from_units(200)))
            .await
            .expect("line");

        let first = service
            .reconcile_to_journal(1, line.id, 900, None, MatchMeta::manual("system"))
            .await
            .expect("reconcile");
        assert!(!first.idempotent);
        assert_eq!(first.line.recon_status, ReconStatus::Matched);
        assert_eq!(
            first.match_row.as_ref().map(|row| row.matched_amount_micros),
            Some(from_units(200))
        );

        let replay = service
            .reconcile_to_journal(1, line.id, 900, None, MatchMeta::manual("system"))
            .await
            .expect("replay");
        assert!(replay.idempotent);
        assert_eq!(
            service.active_matches(1, line.id).await.expect("rows").len(),
            1
        );
    }

    #[tokio::test]
    async fn audit_hook_sees_status_transitions() {
        #[derive(Default)]
        struct Collecting {
            actions: RwLock<Vec<AuditAction>>,
        }
        impl StatementAuditHook for Collecting {
            fn record(&self, event: &AuditEvent) {
                if let Ok(mut guard) = self.actions.write() {
                    guard.push(event.action);
                }
            }
        }

        let hook = Arc::new(Collecting::default());
        let service = service();
        service.register_audit_hook(hook.clone());

        let line = service
            .insert_line(new_line(from_units(30)))
            .await
            .expect("line");
        service
            .match_line(1, line.id, journal_match(3, from_units(30)))
            .await
            .expect("match");
        service
            .unmatch(1, line.id, None, "user:1")
            .await
            .expect("unmatch");

        let actions = hook.actions.read().expect("actions");
        assert_eq!(
            actions.as_slice(),
            &[
                AuditAction::AutoStatus,
                AuditAction::Matched,
                AuditAction::AutoStatus,
                AuditAction::Unmatched,
            ]
        );
    }

    #[tokio::test]
    async fn matched_observer_fires_once_per_transition() {
        #[derive(Default)]
        struct Counting {
            lines: tokio::sync::Mutex<Vec<StatementLineId>>,
        }
        #[async_trait]
        impl MatchedLineObserver for Counting {
            async fn on_line_matched(&self, line: &StatementLine) {
                self.lines.lock().await.push(line.id);
            }
        }

        let observer = Arc::new(Counting::default());
        let service = service();
        service.register_matched_observer(observer.clone());

        let line = service
            .insert_line(new_line(from_units(10)))
            .await
            .expect("line");
        service
            .match_line(1, line.id, journal_match(3, from_units(10)))
            .await
            .expect("match");

        assert_eq!(observer.lines.lock().await.as_slice(), &[line.id]);
    }

    #[tokio::test]
    async fn auto_rule_meta_is_copied_onto_line() {
        let service = service();
        let line = service
            .insert_line(new_line(from_units(25)))
            .await
            .expect("line");
        let outcome = service
            .match_line(
                1,
                line.id,
                MatchRequest {
                    matched_entity_type: MatchedEntityType::PaymentBatch,
                    matched_entity_id: 88,
                    amount_micros: from_units(25),
                    meta: MatchMeta::auto_rule(5, crate::ReconciliationMethod::RuleReturn, "system"),
                },
            )
            .await
            .expect("match");
        assert_eq!(outcome.line.matched_rule_id, Some(5));
        assert_eq!(
            outcome.line.reconciliation_method,
            Some(crate::ReconciliationMethod::RuleReturn)
        );
        assert_eq!(outcome.match_row.match_type, MatchType::AutoRule);
    }
}
