use std::collections::HashMap;

use async_trait::async_trait;
use konto_common::BankAccountId;
use konto_common::GlAccountId;
use konto_common::LegalEntityId;
use konto_common::TenantId;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::LedgerError;
use crate::LedgerResult;

/// Bank account master data: the GL account the bank balance posts to and
/// the account currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankAccount {
    pub id: BankAccountId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub gl_account_id: GlAccountId,
    pub currency_code: String,
    pub iban: Option<String>,
}

#[async_trait]
pub trait BankAccountDirectory: Send + Sync {
    async fn upsert(&self, account: BankAccount) -> LedgerResult<BankAccount>;
    async fn get(
        &self,
        tenant_id: TenantId,
        bank_account_id: BankAccountId,
    ) -> LedgerResult<BankAccount>;
}

#[derive(Default)]
pub struct InMemoryBankAccounts {
    accounts: RwLock<HashMap<BankAccountId, BankAccount>>,
}

impl InMemoryBankAccounts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BankAccountDirectory for InMemoryBankAccounts {
    async fn upsert(&self, account: BankAccount) -> LedgerResult<BankAccount> {
        if account.id <= 0 {
            return Err(LedgerError::Validation(
                "bank account id must be positive".into(),
            ));
        }
        let mut guard = self.accounts.write().await;
        guard.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        bank_account_id: BankAccountId,
    ) -> LedgerResult<BankAccount> {
        let guard = self.accounts.read().await;
        guard
            .get(&bank_account_id)
            .filter(|account| account.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("bank account {bank_account_id}")))
    }
}
