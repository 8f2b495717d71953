#![deny(clippy::print_stdout, clippy::print_stderr)]

use async_trait::async_trait;
use chrono::NaiveDate;
use konto_common::GlAccountId;
use konto_common::LegalEntityId;
use konto_common::TenantId;
use konto_common::money::AmountMicros;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

mod accounts;
mod memory;

pub use accounts::BankAccount;
pub use accounts::BankAccountDirectory;
pub use accounts::InMemoryBankAccounts;
pub use memory::InMemoryLedger;

pub type BookId = i64;
pub type FiscalPeriodId = i64;
pub type JournalEntryId = i64;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
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
pub enum BookType {
    Local,
    Ifrs,
    Tax,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub book_type: BookType,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeriodStatus {
    Open,
    Closed,
}

/// A fiscal period; posting eligibility is tracked per (book, period).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalPeriod {
    pub id: FiscalPeriodId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl FiscalPeriod {
    #[must_use]
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalStatus {
    Draft,
    Posted,
    Reversed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalSource {
    Manual,
    BankAutoPost,
    BankDifference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostingSide {
    Debit,
    Credit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalLine {
    pub gl_account_id: GlAccountId,
    pub side: PostingSide,
    /// Always positive; the side carries the direction.
    pub amount_micros: AmountMicros,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: JournalEntryId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub book_id: BookId,
    pub journal_no: String,
    pub entry_date: NaiveDate,
    pub narration: String,
    pub reference: Option<String>,
    pub status: JournalStatus,
    pub source: JournalSource,
    pub lines: Vec<JournalLine>,
}

impl JournalEntry {
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        let (debits, credits) =
            self.lines
                .iter()
                .fold((0_i64, 0_i64), |(d, c), line| match line.side {
                    PostingSide::Debit => (d + line.amount_micros, c),
                    PostingSide::Credit => (d, c + line.amount_micros),
                });
        debits == credits
    }

    /// Net movement on one account: Σ debits − Σ credits for its lines.
    #[must_use]
    pub fn net_on_account(&self, gl_account_id: GlAccountId) -> AmountMicros {
        self.lines
            .iter()
            .filter(|line| line.gl_account_id == gl_account_id)
            .fold(0_i64, |net, line| match line.side {
                PostingSide::Debit => net + line.amount_micros,
                PostingSide::Credit => net - line.amount_micros,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJournalEntry {
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub book_id: BookId,
    pub journal_no: String,
    pub entry_date: NaiveDate,
    pub narration: String,
    pub reference: Option<String>,
    pub source: JournalSource,
    pub lines: Vec<JournalLine>,
}

impl NewJournalEntry {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.journal_no.trim().is_empty() {
            return Err(LedgerError::Validation(
                "journal number must be provided".into(),
            ));
        }
        if self.lines.len() < 2 {
            return Err(LedgerError::Validation(
                "journal entry needs at least two lines".into(),
            ));
        }
        if self.lines.iter().any(|line| line.amount_micros <= 0) {
            return Err(LedgerError::Validation(
                "journal line amounts must be positive".into(),
            ));
        }
        let (debits, credits) =
            self.lines
                .iter()
                .fold((0_i64, 0_i64), |(d, c), line| match line.side {
                    PostingSide::Debit => (d + line.amount_micros, c),
                    PostingSide::Credit => (d, c + line.amount_micros),
                });
        if debits != credits {
            return Err(LedgerError::Validation("journal entry must balance".into()));
        }
        Ok(())
    }
}

/// Condensed posted-journal row used by reconciliation candidate search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedJournalSummary {
    pub journal_id: JournalEntryId,
    pub entry_date: NaiveDate,
    /// |Σ debit − Σ credit| across the lines on the searched bank account.
    pub bank_net_abs_micros: AmountMicros,
    pub reference: Option<String>,
    pub narration: String,
}

/// The narrow journal contract the reconciliation core posts through.
#[async_trait]
pub trait LedgerService: Send + Sync {
    async fn upsert_book(&self, book: Book) -> LedgerResult<Book>;
    async fn upsert_period(&self, period: FiscalPeriod) -> LedgerResult<FiscalPeriod>;
    async fn set_period_status(
        &self,
        tenant_id: TenantId,
        book_id: BookId,
        period_id: FiscalPeriodId,
        status: PeriodStatus,
    ) -> LedgerResult<()>;

    /// Book (LOCAL preferred) and the OPEN fiscal period covering
    /// `post_date` for that book.
    async fn resolve_book_and_period(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        post_date: NaiveDate,
    ) -> LedgerResult<(Book, FiscalPeriod)>;

    /// Inserts a POSTED journal under a deterministic number. When a
    /// POSTED journal already exists for `(book, journal_no)` it is
    /// returned unchanged with `created = false`; a non-POSTED occupant
    /// is a conflict.
    async fn insert_posted(&self, entry: NewJournalEntry) -> LedgerResult<(JournalEntry, bool)>;

    async fn get_journal(
        &self,
        tenant_id: TenantId,
        journal_id: JournalEntryId,
    ) -> LedgerResult<JournalEntry>;

    async fn find_by_number(
        &self,
        tenant_id: TenantId,
        book_id: BookId,
        journal_no: &str,
    ) -> LedgerResult<Option<JournalEntry>>;

    /// POSTED journals with an entry date inside the window and at least
    /// one line on the given bank GL account.
    async fn search_posted_on_account(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        bank_gl_account_id: GlAccountId,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> LedgerResult<Vec<PostedJournalSummary>>;
}
