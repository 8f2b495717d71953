use std::sync::Arc;

use async_trait::async_trait;
use konto_common::TenantId;
use konto_exceptions::ExceptionQueue;
use konto_ledger::JournalStatus;
use konto_ledger::LedgerService;
use konto_payments::BatchStatus;
use konto_payments::PaymentsService;
use konto_statements::MatchTargetVerifier;
use konto_statements::MatchedEntityType;
use konto_statements::MatchedLineObserver;
use konto_statements::StatementLine;
use konto_statements::StatementsError;
use konto_statements::StatementsResult;

/// Confirms match targets against the ledger and payment stores.
pub struct StoreTargetVerifier {
    ledger: Arc<dyn LedgerService>,
    payments: Arc<dyn PaymentsService>,
}

impl StoreTargetVerifier {
    #[must_use]
    pub fn new(ledger: Arc<dyn LedgerService>, payments: Arc<dyn PaymentsService>) -> Self {
        Self { ledger, payments }
    }
}

#[async_trait]
impl MatchTargetVerifier for StoreTargetVerifier {
    async fn verify_posted(
        &self,
        tenant_id: TenantId,
        entity_type: MatchedEntityType,
        entity_id: i64,
    ) -> StatementsResult<()> {
        match entity_type {
            MatchedEntityType::Journal => {
                let journal = self
                    .ledger
                    .get_journal(tenant_id, entity_id)
                    .await
                    .map_err(|err| StatementsError::NotFound(err.to_string()))?;
                if journal.status != JournalStatus::Posted {
                    return Err(StatementsError::Validation(format!(
                        "journal {entity_id} is not posted"
                    )));
                }
                Ok(())
            }
            MatchedEntityType::PaymentBatch => {
                let batch = self
                    .payments
                    .get_batch(tenant_id, entity_id)
                    .await
                    .map_err(|err| StatementsError::NotFound(err.to_string()))?;
                if batch.status != BatchStatus::Posted {
                    return Err(StatementsError::Validation(format!(
                        "payment batch {entity_id} is not posted"
                    )));
                }
                Ok(())
            }
            // Cash transactions and manual adjustments are verified by
            // their own modules before the match is requested.
            MatchedEntityType::CashTxn | MatchedEntityType::ManualAdjustment => Ok(()),
        }
    }
}

/// Resolves a line's open exceptions once it reaches MATCHED.
pub struct ExceptionAutoResolver {
    exceptions: Arc<dyn ExceptionQueue>,
}

impl ExceptionAutoResolver {
    #[must_use]
    pub fn new(exceptions: Arc<dyn ExceptionQueue>) -> Self {
        Self { exceptions }
    }
}

#[async_trait]
impl MatchedLineObserver for ExceptionAutoResolver {
    async fn on_line_matched(&self, line: &StatementLine) {
        // Auto-resolution is best-effort: a failure here must not undo
        // the match that triggered it.
        let _ = self
            .exceptions
            .auto_resolve_open_for_line(line.tenant_id, line.id)
            .await;
    }
}
