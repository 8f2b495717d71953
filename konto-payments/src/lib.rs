#![deny(clippy::print_stdout, clippy::print_stderr)]

use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use konto_common::BankAccountId;
use konto_common::LegalEntityId;
use konto_common::TenantId;
use konto_common::money::AmountMicros;
use konto_common::money::EPSILON_MICROS;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

mod memory;

pub use memory::InMemoryPayments;

pub type PaymentBatchId = i64;
pub type PaymentLineId = i64;
pub type ReturnEventId = i64;

pub type PaymentsResult<T> = Result<T, PaymentsError>;

#[derive(Debug, Error)]
pub enum PaymentsError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Draft,
    Submitted,
    Posted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentBatch {
    pub id: PaymentBatchId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub bank_account_id: BankAccountId,
    pub batch_no: String,
    pub status: BatchStatus,
    pub posted_at: Option<NaiveDate>,
    pub currency_code: String,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentLineStatus {
    Pending,
    Sent,
    Settled,
    Failed,
}

/// Return lifecycle as seen by the ledger side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnStatus {
    RejectedPostAck,
    PartiallyReturned,
    Returned,
}

/// Return lifecycle as mirrored from the bank's execution report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BankExecutionStatus {
    Rejected,
    PartiallyReturned,
    Returned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentLine {
    pub id: PaymentLineId,
    pub batch_id: PaymentBatchId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    /// Instructed amount, absolute.
    pub amount_micros: AmountMicros,
    pub executed_amount_micros: Option<AmountMicros>,
    pub exported_amount_micros: Option<AmountMicros>,
    pub currency_code: String,
    pub status: PaymentLineStatus,
    pub bank_reference: Option<String>,
    pub external_payment_ref: Option<String>,
    pub beneficiary_bank_ref: Option<String>,
    pub payable_ref: Option<String>,
    pub beneficiary_name: Option<String>,
    pub return_status: Option<ReturnStatus>,
    pub bank_execution_status: Option<BankExecutionStatus>,
    pub returned_amount_micros: AmountMicros,
}

impl PaymentLine {
    /// Amount the bank is expected to have moved: executed when reported,
    /// exported when the file went out, instructed otherwise.
    #[must_use]
    pub fn expected_amount_abs(&self) -> AmountMicros {
        self.executed_amount_micros
            .or(self.exported_amount_micros)
            .unwrap_or(self.amount_micros)
            .abs()
    }

    /// Search blob the return candidate scorer tokenizes against.
    #[must_use]
    pub fn text_fields(&self) -> Vec<&str> {
        [
            self.bank_reference.as_deref(),
            self.external_payment_ref.as_deref(),
            self.beneficiary_bank_ref.as_deref(),
            self.payable_ref.as_deref(),
            self.beneficiary_name.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnEventType {
    PaymentRejected,
    PaymentReturned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReturnEvent {
    pub id: ReturnEventId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub payment_line_id: PaymentLineId,
    /// Unique per (tenant, legal entity); retried submissions replay.
    pub request_id: String,
    pub event_type: ReturnEventType,
    pub amount_micros: AmountMicros,
    pub bank_reference: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReturnEvent {
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub payment_line_id: PaymentLineId,
    pub request_id: String,
    pub event_type: ReturnEventType,
    pub amount_micros: AmountMicros,
    pub bank_reference: Option<String>,
    pub reason: Option<String>,
}

impl NewReturnEvent {
    pub fn validate(&self) -> PaymentsResult<()> {
        if self.request_id.trim().is_empty() {
            return Err(PaymentsError::Validation(
                "return event request_id must be provided".into(),
            ));
        }
        if self.amount_micros < 0 {
            return Err(PaymentsError::Validation(
                "return event amount must not be negative".into(),
            ));
        }
        if self.event_type == ReturnEventType::PaymentReturned && self.amount_micros == 0 {
            return Err(PaymentsError::Validation(
                "returned amount must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedReturn {
    pub event: PaymentReturnEvent,
    pub line: PaymentLine,
    /// True when the request id replayed an existing event.
    pub idempotent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAuditRecord {
    pub batch_id: PaymentBatchId,
    pub action: String,
    pub detail: String,
    pub occurred_at: DateTime<Utc>,
}

/// Posted-batch aggregate row for reconciliation candidate search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedBatchSummary {
    pub batch_id: PaymentBatchId,
    pub batch_no: String,
    pub posted_at: NaiveDate,
    /// Σ of each line's expected amount, absolute.
    pub total_abs_micros: AmountMicros,
    pub reference: Option<String>,
    /// Concatenated searchable text of the batch and its lines.
    pub text_blob: String,
}

/// Posted payment line row for return / difference candidate search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedLineSummary {
    pub payment_line_id: PaymentLineId,
    pub batch_id: PaymentBatchId,
    pub batch_no: String,
    pub posted_at: NaiveDate,
    pub expected_abs_micros: AmountMicros,
    pub currency_code: String,
    pub text_fields: Vec<String>,
}

#[async_trait]
pub trait PaymentsService: Send + Sync {
    async fn insert_batch(
        &self,
        batch: PaymentBatch,
        lines: Vec<PaymentLine>,
    ) -> PaymentsResult<PaymentBatch>;

    async fn get_batch(
        &self,
        tenant_id: TenantId,
        batch_id: PaymentBatchId,
    ) -> PaymentsResult<PaymentBatch>;

    async fn get_line(
        &self,
        tenant_id: TenantId,
        payment_line_id: PaymentLineId,
    ) -> PaymentsResult<PaymentLine>;

    /// Applies a return event to a payment line. Replays by
    /// `(tenant, legal entity, request_id)` without re-applying effects.
    async fn apply_return_event(&self, event: NewReturnEvent) -> PaymentsResult<AppliedReturn>;

    async fn batch_audit(
        &self,
        tenant_id: TenantId,
        batch_id: PaymentBatchId,
    ) -> PaymentsResult<Vec<BatchAuditRecord>>;

    /// POSTED batches of the bank account posted within the window.
    async fn search_posted_batches(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        bank_account_id: BankAccountId,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> PaymentsResult<Vec<PostedBatchSummary>>;

    /// Lines of POSTED batches on the bank account in the given currency;
    /// the window filter is optional (return search is unwindowed).
    async fn search_posted_lines(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        bank_account_id: BankAccountId,
        currency_code: &str,
        window: Option<(NaiveDate, NaiveDate)>,
    ) -> PaymentsResult<Vec<PostedLineSummary>>;
}

/// Return-effect arithmetic shared by the store implementations.
///
/// The cap is the instructed line amount: a line can never be returned
/// beyond what was paid out.
pub(crate) fn apply_return_effects(
    line: &mut PaymentLine,
    event_type: ReturnEventType,
    event_amount: AmountMicros,
) -> PaymentsResult<()> {
    match event_type {
        ReturnEventType::PaymentRejected => {
            line.return_status = Some(ReturnStatus::RejectedPostAck);
            line.bank_execution_status = Some(BankExecutionStatus::Rejected);
            if line.status == PaymentLineStatus::Pending {
                line.status = PaymentLineStatus::Failed;
            }
        }
        ReturnEventType::PaymentReturned => {
            let cap = line.amount_micros.abs();
            if line.returned_amount_micros + event_amount > cap + EPSILON_MICROS {
                return Err(PaymentsError::Validation(format!(
                    "return of {} exceeds remaining returnable amount on line {}",
                    event_amount, line.id
                )));
            }
            let new_returned = cap.min(line.returned_amount_micros + event_amount);
            line.returned_amount_micros = new_returned;
            if (cap - new_returned).abs() <= EPSILON_MICROS {
                line.return_status = Some(ReturnStatus::Returned);
                line.bank_execution_status = Some(BankExecutionStatus::Returned);
            } else {
                line.return_status = Some(ReturnStatus::PartiallyReturned);
                line.bank_execution_status = Some(BankExecutionStatus::PartiallyReturned);
            }
        }
    }
    Ok(())
}
