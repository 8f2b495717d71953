use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use konto_common::GlAccountId;
use konto_common::LegalEntityId;
use konto_common::TenantId;
use tokio::sync::Mutex;

use crate::Book;
use crate::BookId;
use crate::BookType;
use crate::FiscalPeriod;
use crate::FiscalPeriodId;
use crate::JournalEntry;
use crate::JournalEntryId;
use crate::JournalStatus;
use crate::LedgerError;
use crate::LedgerResult;
use crate::LedgerService;
use crate::NewJournalEntry;
use crate::PeriodStatus;
use crate::PostedJournalSummary;

/// In-memory `LedgerService`. A single mutex over the whole state keeps
/// the deterministic-number insert race-free: the existence check and the
/// insert happen in one critical section.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    books: HashMap<BookId, Book>,
    periods: HashMap<FiscalPeriodId, FiscalPeriod>,
    period_statuses: HashMap<(BookId, FiscalPeriodId), PeriodStatus>,
    entries: HashMap<JournalEntryId, JournalEntry>,
    numbers: HashMap<(BookId, String), JournalEntryId>,
    entry_seq: i64,
}

impl InMemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerService for InMemoryLedger {
    async fn upsert_book(&self, book: Book) -> LedgerResult<Book> {
        if book.id <= 0 {
            return Err(LedgerError::Validation("book id must be positive".into()));
        }
        let mut state = self.state.lock().await;
        state.books.insert(book.id, book.clone());
        Ok(book)
    }

    async fn upsert_period(&self, period: FiscalPeriod) -> LedgerResult<FiscalPeriod> {
        if period.start_date > period.end_date {
            return Err(LedgerError::Validation(
                "period start must not be after end".into(),
            ));
        }
        let mut state = self.state.lock().await;
        state.periods.insert(period.id, period.clone());
        Ok(period)
    }

    async fn set_period_status(
        &self,
        tenant_id: TenantId,
        book_id: BookId,
        period_id: FiscalPeriodId,
        status: PeriodStatus,
    ) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let book = state
            .books
            .get(&book_id)
            .ok_or_else(|| LedgerError::NotFound(format!("book {book_id}")))?;
        if book.tenant_id != tenant_id {
            return Err(LedgerError::NotFound(format!("book {book_id}")));
        }
        if !state.periods.contains_key(&period_id) {
            return Err(LedgerError::NotFound(format!("fiscal period {period_id}")));
        }
        state.period_statuses.insert((book_id, period_id), status);
        Ok(())
    }

    async fn resolve_book_and_period(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        post_date: NaiveDate,
    ) -> LedgerResult<(Book, FiscalPeriod)> {
        let state = self.state.lock().await;
        let mut books: Vec<&Book> = state
            .books
            .values()
            .filter(|book| book.tenant_id == tenant_id && book.legal_entity_id == legal_entity_id)
            .collect();
        // LOCAL first, then stable by id.
        books.sort_by_key(|book| (book.book_type != BookType::Local, book.id));
        let book = books
            .first()
            .copied()
            .ok_or_else(|| {
                LedgerError::NotFound(format!("no book for legal entity {legal_entity_id}"))
            })?
            .clone();

        let period = state
            .periods
            .values()
            .filter(|period| {
                period.tenant_id == tenant_id
                    && period.legal_entity_id == legal_entity_id
                    && period.covers(post_date)
            })
            .min_by_key(|period| period.id)
            .cloned()
            .ok_or_else(|| {
                LedgerError::NotFound(format!("no fiscal period covering {post_date}"))
            })?;

        match state
            .period_statuses
            .get(&(book.id, period.id))
            .copied()
            .unwrap_or(PeriodStatus::Closed)
        {
            PeriodStatus::Open => Ok((book, period)),
            PeriodStatus::Closed => Err(LedgerError::Validation(format!(
                "fiscal period {} is closed for book {}",
                period.id, book.id
            ))),
        }
    }

    async fn insert_posted(&self, entry: NewJournalEntry) -> LedgerResult<(JournalEntry, bool)> {
        entry.validate()?;
        let mut state = self.state.lock().await;
        if !state.books.contains_key(&entry.book_id) {
            return Err(LedgerError::NotFound(format!("book {}", entry.book_id)));
        }

        let number_key = (entry.book_id, entry.journal_no.clone());
        if let Some(existing_id) = state.numbers.get(&number_key) {
            let existing = state
                .entries
                .get(existing_id)
                .ok_or_else(|| LedgerError::Internal("dangling journal number index".into()))?;
            if existing.status == JournalStatus::Posted {
                return Ok((existing.clone(), false));
            }
            return Err(LedgerError::Conflict(format!(
                "journal {} exists with status {:?}",
                entry.journal_no, existing.status
            )));
        }

        state.entry_seq += 1;
        let id = state.entry_seq;
        let stored = JournalEntry {
            id,
            tenant_id: entry.tenant_id,
            legal_entity_id: entry.legal_entity_id,
            book_id: entry.book_id,
            journal_no: entry.journal_no,
            entry_date: entry.entry_date,
            narration: entry.narration,
            reference: entry.reference,
            status: JournalStatus::Posted,
            source: entry.source,
            lines: entry.lines,
        };
        state
            .numbers
            .insert((stored.book_id, stored.journal_no.clone()), id);
        state.entries.insert(id, stored.clone());
        Ok((stored, true))
    }

    async fn get_journal(
        &self,
        tenant_id: TenantId,
        journal_id: JournalEntryId,
    ) -> LedgerResult<JournalEntry> {
        let state = self.state.lock().await;
        state
            .entries
            .get(&journal_id)
            .filter(|entry| entry.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("journal {journal_id}")))
    }

    async fn find_by_number(
        &self,
        tenant_id: TenantId,
        book_id: BookId,
        journal_no: &str,
    ) -> LedgerResult<Option<JournalEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .numbers
            .get(&(book_id, journal_no.to_string()))
            .and_then(|id| state.entries.get(id))
            .filter(|entry| entry.tenant_id == tenant_id)
            .cloned())
    }

    async fn search_posted_on_account(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        bank_gl_account_id: GlAccountId,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> LedgerResult<Vec<PostedJournalSummary>> {
        let state = self.state.lock().await;
        let mut rows: Vec<PostedJournalSummary> = state
            .entries
            .values()
            .filter(|entry| {
                entry.tenant_id == tenant_id
                    && entry.legal_entity_id == legal_entity_id
                    && entry.status == JournalStatus::Posted
                    && entry.entry_date >= date_from
                    && entry.entry_date <= date_to
            })
            .filter(|entry| {
                entry
                    .lines
                    .iter()
                    .any(|line| line.gl_account_id == bank_gl_account_id)
            })
            .map(|entry| PostedJournalSummary {
                journal_id: entry.id,
                entry_date: entry.entry_date,
                bank_net_abs_micros: entry.net_on_account(bank_gl_account_id).abs(),
                reference: entry.reference.clone(),
                narration: entry.narration.clone(),
            })
            .collect();
        rows.sort_by_key(|row| row.journal_id);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JournalLine;
    use crate::JournalSource;
    use crate::PostingSide;
    use pretty_assertions::assert_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    async fn seeded() -> InMemoryLedger {
        let ledger = InMemoryLedger::new();
        ledger
            .upsert_book(Book {
                id: 1,
                tenant_id: 1,
                legal_entity_id: 10,
                book_type: BookType::Ifrs,
                name: "IFRS".into(),
            })
            .await
            .expect("book");
        ledger
            .upsert_book(Book {
                id: 2,
                tenant_id: 1,
                legal_entity_id: 10,
                book_type: BookType::Local,
                name: "Local".into(),
            })
            .await
            .expect("book");
        ledger
            .upsert_period(FiscalPeriod {
                id: 3,
                tenant_id: 1,
                legal_entity_id: 10,
                start_date: date(2025, 3, 1),
                end_date: date(2025, 3, 31),
            })
            .await
            .expect("period");
        ledger
            .set_period_status(1, 2, 3, PeriodStatus::Open)
            .await
            .expect("status");
        ledger
    }

    fn bank_fee_entry(journal_no: &str) -> NewJournalEntry {
        NewJournalEntry {
            tenant_id: 1,
            legal_entity_id: 10,
            book_id: 2,
            journal_no: journal_no.into(),
            entry_date: date(2025, 3, 5),
            narration: "Bank fee".into(),
            reference: Some("FEE-1".into()),
            source: JournalSource::BankAutoPost,
            lines: vec![
                JournalLine {
                    gl_account_id: 500,
                    side: PostingSide::Debit,
                    amount_micros: 25_000_000,
                },
                JournalLine {
                    gl_account_id: 100,
                    side: PostingSide::Credit,
                    amount_micros: 25_000_000,
                },
            ],
        }
    }

    #[tokio::test]
    async fn resolve_prefers_local_book_and_open_period() {
        let ledger = seeded().await;
        let (book, period) = ledger
            .resolve_book_and_period(1, 10, date(2025, 3, 15))
            .await
            .expect("resolve");
        assert_eq!(book.book_type, BookType::Local);
        assert_eq!(period.id, 3);

        ledger
            .set_period_status(1, 2, 3, PeriodStatus::Closed)
            .await
            .expect("close");
        let err = ledger
            .resolve_book_and_period(1, 10, date(2025, 3, 15))
            .await
            .expect_err("closed period must fail");
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn deterministic_insert_returns_existing_posted() {
        let ledger = seeded().await;
        let (first, created) = ledger
            .insert_posted(bank_fee_entry("BAP-42"))
            .await
            .expect("insert");
        assert!(created);

        let (second, created_again) = ledger
            .insert_posted(bank_fee_entry("BAP-42"))
            .await
            .expect("reinsert is idempotent");
        assert!(!created_again);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn search_filters_window_and_account() {
        let ledger = seeded().await;
        ledger
            .insert_posted(bank_fee_entry("BAP-1"))
            .await
            .expect("insert");

        let rows = ledger
            .search_posted_on_account(1, 10, 100, date(2025, 3, 1), date(2025, 3, 31))
            .await
            .expect("search");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bank_net_abs_micros, 25_000_000);

        let out_of_window = ledger
            .search_posted_on_account(1, 10, 100, date(2025, 4, 1), date(2025, 4, 30))
            .await
            .expect("search");
        assert!(out_of_window.is_empty());

        let other_account = ledger
            .search_posted_on_account(1, 10, 999, date(2025, 3, 1), date(2025, 3, 31))
            .await
            .expect("search");
        assert!(other_account.is_empty());
    }
}
