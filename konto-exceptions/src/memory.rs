use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use konto_common::TenantId;
use konto_common::UserId;
use tokio::sync::Mutex;

use crate::Cursor;
use crate::EventKind;
use crate::Exception;
use crate::ExceptionEvent;
use crate::ExceptionFilter;
use crate::ExceptionId;
use crate::ExceptionPage;
use crate::ExceptionQueue;
use crate::ExceptionStatus;
use crate::ExceptionsError;
use crate::ExceptionsResult;
use crate::RESOLUTION_RECONCILED;
use crate::StatementLineId;
use crate::UpsertException;

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;

/// In-memory exception queue. The single mutex makes the workable-
/// uniqueness check and the insert one critical section, standing in for
/// the partial unique index of a relational store.
#[derive(Default)]
pub struct InMemoryExceptionQueue {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    exceptions: HashMap<ExceptionId, Exception>,
    seq: i64,
}

impl State {
    fn get_mut(
        &mut self,
        tenant_id: TenantId,
        exception_id: ExceptionId,
    ) -> ExceptionsResult<&mut Exception> {
        self.exceptions
            .get_mut(&exception_id)
            .filter(|exception| exception.tenant_id == tenant_id)
            .ok_or_else(|| ExceptionsError::NotFound(format!("exception {exception_id}")))
    }

    fn workable_for_line(
        &self,
        tenant_id: TenantId,
        statement_line_id: StatementLineId,
    ) -> Option<ExceptionId> {
        self.exceptions
            .values()
            .find(|exception| {
                exception.tenant_id == tenant_id
                    && exception.statement_line_id == statement_line_id
                    && exception.status.is_workable()
            })
            .map(|exception| exception.id)
    }
}

fn event(kind: EventKind, actor: &str, note: Option<String>) -> ExceptionEvent {
    ExceptionEvent {
        kind,
        actor: actor.to_string(),
        note,
        occurred_at: Utc::now(),
        metadata: serde_json::Value::Null,
    }
}

impl InMemoryExceptionQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExceptionQueue for InMemoryExceptionQueue {
    async fn upsert(&self, request: UpsertException) -> ExceptionsResult<Exception> {
        if request.actor.trim().is_empty() {
            return Err(ExceptionsError::Validation("actor must be provided".into()));
        }
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if let Some(existing_id) =
            state.workable_for_line(request.tenant_id, request.statement_line_id)
        {
            let exception = state.get_mut(request.tenant_id, existing_id)?;
            exception.reason_code = request.reason_code;
            exception.matched_rule_id = request.matched_rule_id;
            exception.suggested_payload = request.suggested_payload;
            exception.severity = request
                .severity
                .unwrap_or_else(|| request.reason_code.default_severity());
            exception.last_seen_at = now;
            exception.updated_at = now;
            exception.occurrence_count += 1;
            exception
                .events
                .push(event(EventKind::Updated, &request.actor, None));
            return Ok(exception.clone());
        }

        state.seq += 1;
        let exception = Exception {
            id: state.seq,
            tenant_id: request.tenant_id,
            legal_entity_id: request.legal_entity_id,
            bank_account_id: request.bank_account_id,
            statement_line_id: request.statement_line_id,
            status: ExceptionStatus::Open,
            severity: request
                .severity
                .unwrap_or_else(|| request.reason_code.default_severity()),
            reason_code: request.reason_code,
            matched_rule_id: request.matched_rule_id,
            suggested_payload: request.suggested_payload,
            assigned_to_user_id: None,
            resolution_code: None,
            resolution_note: None,
            resolved_by: None,
            resolved_at: None,
            override_approval_request_id: None,
            last_seen_at: now,
            occurrence_count: 1,
            created_at: now,
            updated_at: now,
            events: vec![event(EventKind::Created, &request.actor, None)],
        };
        state.exceptions.insert(exception.id, exception.clone());
        Ok(exception)
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        exception_id: ExceptionId,
    ) -> ExceptionsResult<Exception> {
        let state = self.state.lock().await;
        state
            .exceptions
            .get(&exception_id)
            .filter(|exception| exception.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| ExceptionsError::NotFound(format!("exception {exception_id}")))
    }

    async fn list(
        &self,
        tenant_id: TenantId,
        filter: ExceptionFilter,
    ) -> ExceptionsResult<ExceptionPage> {
        let after = filter
            .cursor
            .as_deref()
            .map(Cursor::decode)
            .transpose()?
            .map(|cursor| cursor.sort_key());
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);

        let state = self.state.lock().await;
        let mut items: Vec<Exception> = state
            .exceptions
            .values()
            .filter(|exception| exception.tenant_id == tenant_id)
            .filter(|exception| filter.status.is_none_or(|status| exception.status == status))
            .filter(|exception| {
                filter
                    .bank_account_id
                    .is_none_or(|id| exception.bank_account_id == id)
            })
            .filter(|exception| {
                filter
                    .assigned_to_user_id
                    .is_none_or(|id| exception.assigned_to_user_id == Some(id))
            })
            .filter(|exception| {
                after.is_none_or(|key| Cursor::from(*exception).sort_key() > key)
            })
            .cloned()
            .collect();
        items.sort_by_key(|exception| Cursor::from(exception).sort_key());

        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|exception| Cursor::from(exception).encode())
        } else {
            None
        };
        Ok(ExceptionPage { items, next_cursor })
    }

    async fn assign(
        &self,
        tenant_id: TenantId,
        exception_id: ExceptionId,
        user_id: Option<UserId>,
        actor: &str,
    ) -> ExceptionsResult<Exception> {
        let mut state = self.state.lock().await;
        let exception = state.get_mut(tenant_id, exception_id)?;
        if !exception.status.is_workable() {
            return Err(ExceptionsError::InvalidTransition(format!(
                "exception {exception_id} is {:?}",
                exception.status
            )));
        }
        exception.assigned_to_user_id = user_id;
        exception.status = match user_id {
            Some(_) => ExceptionStatus::Assigned,
            None => ExceptionStatus::Open,
        };
        exception.updated_at = Utc::now();
        exception.events.push(event(
            EventKind::Assigned,
            actor,
            user_id.map(|id| format!("assigned to user {id}")),
        ));
        Ok(exception.clone())
    }

    async fn resolve(
        &self,
        tenant_id: TenantId,
        exception_id: ExceptionId,
        resolution_code: &str,
        note: Option<String>,
        actor: &str,
    ) -> ExceptionsResult<Exception> {
        if resolution_code.trim().is_empty() {
            return Err(ExceptionsError::Validation(
                "resolution code must be provided".into(),
            ));
        }
        let mut state = self.state.lock().await;
        let exception = state.get_mut(tenant_id, exception_id)?;
        if !exception.status.is_workable() {
            return Err(ExceptionsError::InvalidTransition(format!(
                "exception {exception_id} cannot be resolved from {:?}",
                exception.status
            )));
        }
        let now = Utc::now();
        exception.status = ExceptionStatus::Resolved;
        exception.resolution_code = Some(resolution_code.to_string());
        exception.resolution_note = note.clone();
        exception.resolved_by = Some(actor.to_string());
        exception.resolved_at = Some(now);
        exception.updated_at = now;
        exception.events.push(event(EventKind::Resolved, actor, note));
        Ok(exception.clone())
    }

    async fn ignore(
        &self,
        tenant_id: TenantId,
        exception_id: ExceptionId,
        note: Option<String>,
        actor: &str,
    ) -> ExceptionsResult<Exception> {
        let mut state = self.state.lock().await;
        let exception = state.get_mut(tenant_id, exception_id)?;
        if !exception.status.is_workable() {
            return Err(ExceptionsError::InvalidTransition(format!(
                "exception {exception_id} cannot be ignored from {:?}",
                exception.status
            )));
        }
        exception.status = ExceptionStatus::Ignored;
        exception.updated_at = Utc::now();
        exception.events.push(event(EventKind::Ignored, actor, note));
        Ok(exception.clone())
    }

    async fn retry(
        &self,
        tenant_id: TenantId,
        exception_id: ExceptionId,
        note: Option<String>,
        actor: &str,
    ) -> ExceptionsResult<Exception> {
        let mut state = self.state.lock().await;
        let line_id = state.get_mut(tenant_id, exception_id)?.statement_line_id;
        if let Some(other) = state.workable_for_line(tenant_id, line_id)
            && other != exception_id
        {
            return Err(ExceptionsError::Conflict(format!(
                "exception {other} is already open for statement line {line_id}"
            )));
        }
        let exception = state.get_mut(tenant_id, exception_id)?;
        exception.status = ExceptionStatus::Open;
        exception.assigned_to_user_id = None;
        exception.resolution_code = None;
        exception.resolution_note = None;
        exception.resolved_by = None;
        exception.resolved_at = None;
        let now = Utc::now();
        exception.last_seen_at = now;
        exception.updated_at = now;
        exception.occurrence_count += 1;
        exception.events.push(event(EventKind::Retried, actor, note));
        Ok(exception.clone())
    }

    async fn auto_resolve_open_for_line(
        &self,
        tenant_id: TenantId,
        statement_line_id: StatementLineId,
    ) -> ExceptionsResult<Vec<Exception>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut resolved = Vec::new();
        for exception in state.exceptions.values_mut() {
            if exception.tenant_id != tenant_id
                || exception.statement_line_id != statement_line_id
                || !exception.status.is_workable()
            {
                continue;
            }
            exception.status = ExceptionStatus::Resolved;
            exception.resolution_code = Some(RESOLUTION_RECONCILED.to_string());
            exception.resolved_by = Some("system".to_string());
            exception.resolved_at = Some(now);
            exception.updated_at = now;
            exception.events.push(ExceptionEvent {
                kind: EventKind::Resolved,
                actor: "system".into(),
                note: None,
                occurred_at: now,
                metadata: serde_json::json!({ "autoResolved": true }),
            });
            resolved.push(exception.clone());
        }
        resolved.sort_by_key(|exception| exception.id);
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReasonCode;
    use crate::Severity;
    use pretty_assertions::assert_eq;

    fn upsert(line_id: StatementLineId, reason: ReasonCode) -> UpsertException {
        UpsertException {
            tenant_id: 1,
            legal_entity_id: 10,
            bank_account_id: 20,
            statement_line_id: line_id,
            reason_code: reason,
            matched_rule_id: None,
            suggested_payload: serde_json::Value::Null,
            severity: None,
            actor: "system".into(),
        }
    }

    #[tokio::test]
    async fn upsert_updates_workable_exception_in_place() {
        let queue = InMemoryExceptionQueue::new();
        let first = queue
            .upsert(upsert(5, ReasonCode::NoRuleMatch))
            .await
            .expect("insert");
        assert_eq!(first.occurrence_count, 1);
        assert_eq!(first.severity, Severity::Low);
        assert_eq!(first.events.len(), 1);
        assert_eq!(first.events[0].kind, EventKind::Created);

        let second = queue
            .upsert(upsert(5, ReasonCode::AmbiguousTarget))
            .await
            .expect("update");
        assert_eq!(second.id, first.id);
        assert_eq!(second.occurrence_count, 2);
        assert_eq!(second.reason_code, ReasonCode::AmbiguousTarget);
        assert_eq!(second.severity, Severity::Medium);
        assert_eq!(second.events.last().map(|e| e.kind), Some(EventKind::Updated));
    }

    #[tokio::test]
    async fn lifecycle_assign_resolve_retry() {
        let queue = InMemoryExceptionQueue::new();
        let exception = queue
            .upsert(upsert(7, ReasonCode::RuleQueueException))
            .await
            .expect("insert");

        let assigned = queue
            .assign(1, exception.id, Some(99), "user:3")
            .await
            .expect("assign");
        assert_eq!(assigned.status, ExceptionStatus::Assigned);
        assert_eq!(assigned.assigned_to_user_id, Some(99));

        let resolved = queue
            .resolve(1, exception.id, "RESOLVED_MANUALLY", None, "user:3")
            .await
            .expect("resolve");
        assert_eq!(resolved.status, ExceptionStatus::Resolved);
        assert_eq!(resolved.resolution_code.as_deref(), Some("RESOLVED_MANUALLY"));

        // Finished exceptions refuse further transitions.
        let err = queue
            .assign(1, exception.id, Some(4), "user:3")
            .await
            .expect_err("resolved cannot be assigned");
        assert!(matches!(err, ExceptionsError::InvalidTransition(_)));
        let err = queue
            .ignore(1, exception.id, None, "user:3")
            .await
            .expect_err("resolved cannot be ignored");
        assert!(matches!(err, ExceptionsError::InvalidTransition(_)));

        let retried = queue
            .retry(1, exception.id, Some("second look".into()), "user:3")
            .await
            .expect("retry");
        assert_eq!(retried.status, ExceptionStatus::Open);
        assert_eq!(retried.assigned_to_user_id, None);
        assert_eq!(retried.resolution_code, None);
        assert_eq!(retried.occurrence_count, 2);

        let kinds: Vec<EventKind> = retried.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Created,
                EventKind::Assigned,
                EventKind::Resolved,
                EventKind::Retried,
            ]
        );
    }

    #[tokio::test]
    async fn retry_refuses_second_workable_exception_for_line() {
        let queue = InMemoryExceptionQueue::new();
        let first = queue
            .upsert(upsert(9, ReasonCode::NoRuleMatch))
            .await
            .expect("insert");
        queue
            .resolve(1, first.id, "RESOLVED_MANUALLY", None, "user:1")
            .await
            .expect("resolve");
        // A fresh apply run queues a new exception for the same line.
        queue
            .upsert(upsert(9, ReasonCode::ApplyError))
            .await
            .expect("insert");

        let err = queue
            .retry(1, first.id, None, "user:1")
            .await
            .expect_err("second workable exception would violate uniqueness");
        assert!(matches!(err, ExceptionsError::Conflict(_)));
    }

    #[tokio::test]
    async fn auto_resolve_marks_workable_rows() {
        let queue = InMemoryExceptionQueue::new();
        let open = queue
            .upsert(upsert(11, ReasonCode::NoRuleMatch))
            .await
            .expect("insert");
        let resolved = queue
            .auto_resolve_open_for_line(1, 11)
            .await
            .expect("auto resolve");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, open.id);
        assert_eq!(
            resolved[0].resolution_code.as_deref(),
            Some(RESOLUTION_RECONCILED)
        );
        assert_eq!(
            resolved[0].events.last().map(|e| e.metadata.clone()),
            Some(serde_json::json!({ "autoResolved": true }))
        );

        // Nothing workable remains.
        let again = queue
            .auto_resolve_open_for_line(1, 11)
            .await
            .expect("idempotent");
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn list_paginates_with_cursor() {
        let queue = InMemoryExceptionQueue::new();
        for line in 1..=5 {
            queue
                .upsert(upsert(line, ReasonCode::NoRuleMatch))
                .await
                .expect("insert");
        }

        let first_page = queue
            .list(
                1,
                ExceptionFilter {
                    limit: Some(2),
                    ..ExceptionFilter::default()
                },
            )
            .await
            .expect("page");
        assert_eq!(first_page.items.len(), 2);
        let cursor = first_page.next_cursor.expect("more pages");

        let second_page = queue
            .list(
                1,
                ExceptionFilter {
                    limit: Some(10),
                    cursor: Some(cursor),
                    ..ExceptionFilter::default()
                },
            )
            .await
            .expect("page");
        assert_eq!(second_page.items.len(), 3);
        assert_eq!(second_page.next_cursor, None);

        let seen: Vec<ExceptionId> = first_page
            .items
            .iter()
            .chain(second_page.items.iter())
            .map(|exception| exception.id)
            .collect();
        let mut deduped = seen.clone();
        deduped.dedup();
        assert_eq!(seen.len(), 5);
        assert_eq!(deduped, seen);

        let err = queue
            .list(
                1,
                ExceptionFilter {
                    cursor: Some("@@bad@@".into()),
                    ..ExceptionFilter::default()
                },
            )
            .await
            .expect_err("malformed cursor rejected");
        assert!(matches!(err, ExceptionsError::Validation(_)));
    }
}
