use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use chrono::Utc;
use konto_common::BankAccountId;
use konto_common::LegalEntityId;
use konto_common::TenantId;
use tokio::sync::Mutex;

use crate::AppliedReturn;
use crate::BatchAuditRecord;
use crate::BatchStatus;
use crate::NewReturnEvent;
use crate::PaymentBatch;
use crate::PaymentBatchId;
use crate::PaymentLine;
use crate::PaymentLineId;
use crate::PaymentReturnEvent;
use crate::PaymentsError;
use crate::PaymentsResult;
use crate::PaymentsService;
use crate::PostedBatchSummary;
use crate::PostedLineSummary;
use crate::apply_return_effects;

/// In-memory `PaymentsService`. One mutex over the whole state makes the
/// request-id check and the effect application a single critical section.
#[derive(Default)]
pub struct InMemoryPayments {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    batches: HashMap<PaymentBatchId, PaymentBatch>,
    lines: HashMap<PaymentLineId, PaymentLine>,
    events: Vec<PaymentReturnEvent>,
    event_requests: HashMap<(TenantId, LegalEntityId, String), usize>,
    audit: Vec<BatchAuditRecord>,
    event_seq: i64,
}

impl InMemoryPayments {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentsService for InMemoryPayments {
    async fn insert_batch(
        &self,
        batch: PaymentBatch,
        lines: Vec<PaymentLine>,
    ) -> PaymentsResult<PaymentBatch> {
        if batch.id <= 0 {
            return Err(PaymentsError::Validation("batch id must be positive".into()));
        }
        if batch.status == BatchStatus::Posted && batch.posted_at.is_none() {
            return Err(PaymentsError::Validation(
                "posted batch requires posted_at".into(),
            ));
        }
        let mut state = self.state.lock().await;
        if state.batches.contains_key(&batch.id) {
            return Err(PaymentsError::Conflict(format!(
                "payment batch {} already exists",
                batch.id
            )));
        }
        for line in &lines {
            if line.batch_id != batch.id {
                return Err(PaymentsError::Validation(format!(
                    "line {} does not belong to batch {}",
                    line.id, batch.id
                )));
            }
            if state.lines.contains_key(&line.id) {
                return Err(PaymentsError::Conflict(format!(
                    "payment line {} already exists",
                    line.id
                )));
            }
        }
        for line in lines {
            state.lines.insert(line.id, line);
        }
        state.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn get_batch(
        &self,
        tenant_id: TenantId,
        batch_id: PaymentBatchId,
    ) -> PaymentsResult<PaymentBatch> {
        let state = self.state.lock().await;
        state
            .batches
            .get(&batch_id)
            .filter(|batch| batch.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| PaymentsError::NotFound(format!("payment batch {batch_id}")))
    }

    async fn get_line(
        &self,
        tenant_id: TenantId,
        payment_line_id: PaymentLineId,
    ) -> PaymentsResult<PaymentLine> {
        let state = self.state.lock().await;
        state
            .lines
            .get(&payment_line_id)
            .filter(|line| line.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| PaymentsError::NotFound(format!("payment line {payment_line_id}")))
    }

    async fn apply_return_event(&self, event: NewReturnEvent) -> PaymentsResult<AppliedReturn> {
        event.validate()?;
        let mut state = self.state.lock().await;

        let request_key = (
            event.tenant_id,
            event.legal_entity_id,
            event.request_id.clone(),
        );
        if let Some(index) = state.event_requests.get(&request_key) {
            let existing = state
                .events
                .get(*index)
                .cloned()
                .ok_or_else(|| PaymentsError::Internal("dangling return event index".into()))?;
            let line = state
                .lines
                .get(&existing.payment_line_id)
                .cloned()
                .ok_or_else(|| {
                    PaymentsError::NotFound(format!("payment line {}", existing.payment_line_id))
                })?;
            return Ok(AppliedReturn {
                event: existing,
                line,
                idempotent: true,
            });
        }

        let line = state
            .lines
            .get(&event.payment_line_id)
            .filter(|line| {
                line.tenant_id == event.tenant_id && line.legal_entity_id == event.legal_entity_id
            })
            .cloned()
            .ok_or_else(|| {
                PaymentsError::NotFound(format!("payment line {}", event.payment_line_id))
            })?;
        let batch = state
            .batches
            .get(&line.batch_id)
            .cloned()
            .ok_or_else(|| PaymentsError::NotFound(format!("payment batch {}", line.batch_id)))?;
        if batch.status != BatchStatus::Posted {
            return Err(PaymentsError::Validation(format!(
                "payment batch {} is not posted",
                batch.id
            )));
        }

        let mut updated = line;
        apply_return_effects(&mut updated, event.event_type, event.amount_micros)?;

        state.event_seq += 1;
        let stored = PaymentReturnEvent {
            id: state.event_seq,
            tenant_id: event.tenant_id,
            legal_entity_id: event.legal_entity_id,
            payment_line_id: event.payment_line_id,
            request_id: event.request_id,
            event_type: event.event_type,
            amount_micros: event.amount_micros,
            bank_reference: event.bank_reference,
            reason: event.reason,
            created_at: Utc::now(),
        };
        state.lines.insert(updated.id, updated.clone());
        state.events.push(stored.clone());
        let event_index = state.events.len() - 1;
        state.event_requests.insert(request_key, event_index);
        state.audit.push(BatchAuditRecord {
            batch_id: batch.id,
            action: "STATUS".into(),
            detail: format!(
                "return event {:?} applied to line {} (request {})",
                stored.event_type, updated.id, stored.request_id
            ),
            occurred_at: stored.created_at,
        });

        Ok(AppliedReturn {
            event: stored,
            line: updated,
            idempotent: false,
        })
    }

    async fn batch_audit(
        &self,
        tenant_id: TenantId,
        batch_id: PaymentBatchId,
    ) -> PaymentsResult<Vec<BatchAuditRecord>> {
        let state = self.state.lock().await;
        let batch = state
            .batches
            .get(&batch_id)
            .filter(|batch| batch.tenant_id == tenant_id)
            .ok_or_else(|| PaymentsError::NotFound(format!("payment batch {batch_id}")))?;
        Ok(state
            .audit
            .iter()
            .filter(|record| record.batch_id == batch.id)
            .cloned()
            .collect())
    }

    async fn search_posted_batches(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        bank_account_id: BankAccountId,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> PaymentsResult<Vec<PostedBatchSummary>> {
        let state = self.state.lock().await;
        let mut rows = Vec::new();
        for batch in state.batches.values() {
            if batch.tenant_id != tenant_id
                || batch.legal_entity_id != legal_entity_id
                || batch.bank_account_id != bank_account_id
                || batch.status != BatchStatus::Posted
            {
                continue;
            }
            let Some(posted_at) = batch.posted_at else {
                continue;
            };
            if posted_at < date_from || posted_at > date_to {
                continue;
            }
            let lines: Vec<&PaymentLine> = state
                .lines
                .values()
                .filter(|line| line.batch_id == batch.id)
                .collect();
            let total_abs_micros = lines
                .iter()
                .map(|line| line.expected_amount_abs())
                .sum::<i64>();
            let mut blob_parts: Vec<String> = vec![batch.batch_no.clone()];
            if let Some(reference) = &batch.reference {
                blob_parts.push(reference.clone());
            }
            for line in &lines {
                blob_parts.extend(line.text_fields().into_iter().map(str::to_string));
            }
            rows.push(PostedBatchSummary {
                batch_id: batch.id,
                batch_no: batch.batch_no.clone(),
                posted_at,
                total_abs_micros,
                reference: batch.reference.clone(),
                text_blob: blob_parts.join(" "),
            });
        }
        rows.sort_by_key(|row| row.batch_id);
        Ok(rows)
    }

    async fn search_posted_lines(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        bank_account_id: BankAccountId,
        currency_code: &str,
        window: Option<(NaiveDate, NaiveDate)>,
    ) -> PaymentsResult<Vec<PostedLineSummary>> {
        let state = self.state.lock().await;
        let mut rows = Vec::new();
        for line in state.lines.values() {
            if line.tenant_id != tenant_id
                || line.legal_entity_id != legal_entity_id
                || !line.currency_code.eq_ignore_ascii_case(currency_code)
            {
                continue;
            }
            let Some(batch) = state.batches.get(&line.batch_id) else {
                continue;
            };
            if batch.bank_account_id != bank_account_id || batch.status != BatchStatus::Posted {
                continue;
            }
            let Some(posted_at) = batch.posted_at else {
                continue;
            };
            if let Some((from, to)) = window
                && (posted_at < from || posted_at > to)
            {
                continue;
            }
            let mut text_fields: Vec<String> = vec![batch.batch_no.clone()];
            text_fields.extend(line.text_fields().into_iter().map(str::to_string));
            rows.push(PostedLineSummary {
                payment_line_id: line.id,
                batch_id: batch.id,
                batch_no: batch.batch_no.clone(),
                posted_at,
                expected_abs_micros: line.expected_amount_abs(),
                currency_code: line.currency_code.clone(),
                text_fields,
            });
        }
        rows.sort_by_key(|row| row.payment_line_id);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PaymentLineStatus;
    use crate::ReturnEventType;
    use crate::ReturnStatus;
    use pretty_assertions::assert_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn posted_batch(id: PaymentBatchId) -> PaymentBatch {
        PaymentBatch {
            id,
            tenant_id: 1,
            legal_entity_id: 10,
            bank_account_id: 20,
            batch_no: format!("PB-{id}"),
            status: BatchStatus::Posted,
            posted_at: Some(date(2025, 3, 10)),
            currency_code: "EUR".into(),
            reference: Some("SALARY MARCH".into()),
        }
    }

    fn pending_line(id: PaymentLineId, batch_id: PaymentBatchId, amount: i64) -> PaymentLine {
        PaymentLine {
            id,
            batch_id,
            tenant_id: 1,
            legal_entity_id: 10,
            amount_micros: amount,
            executed_amount_micros: None,
            exported_amount_micros: None,
            currency_code: "EUR".into(),
            status: PaymentLineStatus::Pending,
            bank_reference: Some(format!("BRN-{id}")),
            external_payment_ref: None,
            beneficiary_bank_ref: None,
            payable_ref: None,
            beneficiary_name: Some("Jane Supplier".into()),
            return_status: None,
            bank_execution_status: None,
            returned_amount_micros: 0,
        }
    }

    async fn seeded() -> InMemoryPayments {
        let payments = InMemoryPayments::new();
        payments
            .insert_batch(
                posted_batch(1),
                vec![pending_line(100, 1, 80_000_000), pending_line(101, 1, 20_000_000)],
            )
            .await
            .expect("batch");
        payments
    }

    #[tokio::test]
    async fn return_event_is_idempotent_by_request_id() {
        let payments = seeded().await;
        let event = NewReturnEvent {
            tenant_id: 1,
            legal_entity_id: 10,
            payment_line_id: 100,
            request_id: "B08B-STMTRET:5:100".into(),
            event_type: ReturnEventType::PaymentRejected,
            amount_micros: 0,
            bank_reference: Some("X".into()),
            reason: None,
        };

        let first = payments
            .apply_return_event(event.clone())
            .await
            .expect("first apply");
        assert!(!first.idempotent);
        assert_eq!(first.line.return_status, Some(ReturnStatus::RejectedPostAck));
        assert_eq!(first.line.status, PaymentLineStatus::Failed);
        assert_eq!(first.line.returned_amount_micros, 0);

        let second = payments
            .apply_return_event(event)
            .await
            .expect("replay");
        assert!(second.idempotent);
        assert_eq!(second.event.id, first.event.id);

        let audit = payments.batch_audit(1, 1).await.expect("audit");
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "STATUS");
    }

    #[tokio::test]
    async fn batch_search_aggregates_expected_amounts() {
        let payments = seeded().await;
        let rows = payments
            .search_posted_batches(1, 10, 20, date(2025, 3, 1), date(2025, 3, 31))
            .await
            .expect("search");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_abs_micros, 100_000_000);
        assert!(rows[0].text_blob.contains("SALARY MARCH"));
        assert!(rows[0].text_blob.contains("BRN-100"));
    }

    #[tokio::test]
    async fn line_search_filters_currency_and_window() {
        let payments = seeded().await;
        let rows = payments
            .search_posted_lines(1, 10, 20, "EUR", None)
            .await
            .expect("search");
        assert_eq!(rows.len(), 2);

        let none = payments
            .search_posted_lines(1, 10, 20, "USD", None)
            .await
            .expect("search");
        assert!(none.is_empty());

        let outside = payments
            .search_posted_lines(1, 10, 20, "EUR", Some((date(2025, 4, 1), date(2025, 4, 2))))
            .await
            .expect("search");
        assert!(outside.is_empty());
    }

    #[tokio::test]
    async fn return_against_unposted_batch_fails() {
        let payments = InMemoryPayments::new();
        let mut batch = posted_batch(2);
        batch.status = BatchStatus::Submitted;
        batch.posted_at = None;
        payments
            .insert_batch(batch, vec![pending_line(200, 2, 50_000_000)])
            .await
            .expect("batch");

        let err = payments
            .apply_return_event(NewReturnEvent {
                tenant_id: 1,
                legal_entity_id: 10,
                payment_line_id: 200,
                request_id: "R-2".into(),
                event_type: ReturnEventType::PaymentReturned,
                amount_micros: 50_000_000,
                bank_reference: None,
                reason: None,
            })
            .await
            .expect_err("unposted batch rejected");
        assert!(matches!(err, PaymentsError::Validation(_)));
    }
}
