use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use konto_common::TenantId;
use konto_ledger::BankAccountDirectory;
use konto_ledger::LedgerService;
use konto_payments::PaymentsService;
use konto_rules::BatchCandidateRow;
use konto_rules::CandidateSources;
use konto_rules::JournalCandidateRow;
use konto_rules::LineView;
use konto_rules::PaymentLineCandidateRow;
use konto_rules::RulesError;
use konto_rules::RulesResult;

/// [`CandidateSources`] over the payment and ledger stores.
pub struct StoreCandidateSources {
    payments: Arc<dyn PaymentsService>,
    ledger: Arc<dyn LedgerService>,
    bank_accounts: Arc<dyn BankAccountDirectory>,
}

impl StoreCandidateSources {
    #[must_use]
    pub fn new(
        payments: Arc<dyn PaymentsService>,
        ledger: Arc<dyn LedgerService>,
        bank_accounts: Arc<dyn BankAccountDirectory>,
    ) -> Self {
        Self {
            payments,
            ledger,
            bank_accounts,
        }
    }
}

#[async_trait]
impl CandidateSources for StoreCandidateSources {
    async fn posted_batches(
        &self,
        tenant_id: TenantId,
        line: &LineView,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> RulesResult<Vec<BatchCandidateRow>> {
        let rows = self
            .payments
            .search_posted_batches(
                tenant_id,
                line.legal_entity_id,
                line.bank_account_id,
                date_from,
                date_to,
            )
            .await
            .map_err(|err| RulesError::Storage(err.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|row| BatchCandidateRow {
                batch_id: row.batch_id,
                batch_no: row.batch_no,
                posted_at: row.posted_at,
                total_abs_micros: row.total_abs_micros,
                reference: row.reference,
                text_blob: row.text_blob,
            })
            .collect())
    }

    async fn posted_journals(
        &self,
        tenant_id: TenantId,
        line: &LineView,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> RulesResult<Vec<JournalCandidateRow>> {
        let bank_account = self
            .bank_accounts
            .get(tenant_id, line.bank_account_id)
            .await
            .map_err(|err| RulesError::Storage(err.to_string()))?;
        let rows = self
            .ledger
            .search_posted_on_account(
                tenant_id,
                line.legal_entity_id,
                bank_account.gl_account_id,
                date_from,
                date_to,
            )
            .await
            .map_err(|err| RulesError::Storage(err.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|row| JournalCandidateRow {
                journal_id: row.journal_id,
                entry_date: row.entry_date,
                amount_abs_micros: row.bank_net_abs_micros,
                reference: row.reference,
                narration: row.narration,
            })
            .collect())
    }

    async fn posted_payment_lines(
        &self,
        tenant_id: TenantId,
        line: &LineView,
        window: Option<(NaiveDate, NaiveDate)>,
    ) -> RulesResult<Vec<PaymentLineCandidateRow>> {
        let rows = self
            .payments
            .search_posted_lines(
                tenant_id,
                line.legal_entity_id,
                line.bank_account_id,
                &line.currency_code,
                window,
            )
            .await
            .map_err(|err| RulesError::Storage(err.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|row| PaymentLineCandidateRow {
                payment_line_id: row.payment_line_id,
                batch_id: row.batch_id,
                batch_no: row.batch_no,
                posted_at: row.posted_at,
                expected_abs_micros: row.expected_abs_micros,
                currency_code: row.currency_code,
                text_fields: row.text_fields,
            })
            .collect())
    }
}
