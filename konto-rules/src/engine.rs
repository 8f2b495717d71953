use async_trait::async_trait;
use chrono::Days;
use chrono::NaiveDate;
use konto_common::BankAccountId;
use konto_common::LegalEntityId;
use konto_common::TenantId;
use konto_common::money::AmountMicros;
use konto_common::money::EPSILON_MICROS;

use crate::ProfileId;
use crate::Rule;
use crate::RuleAction;
use crate::RuleConditions;
use crate::RuleId;
use crate::RuleMatchKind;
use crate::RulesResult;
use crate::ReturnEventKind;
use crate::TemplateId;

const SCORE_EXACT_REFERENCE: i32 = 50;
const SCORE_TOKEN_HIT: i32 = 10;
const SCORE_AMOUNT_CLOSE: i32 = 15;
/// "Amounts match" bonus threshold: 0.01 currency units.
const AMOUNT_CLOSE_MICROS: AmountMicros = 10_000;
/// Tokens shorter than this carry no signal.
const MIN_TOKEN_LEN: usize = 3;

/// The slice of a statement line the engine evaluates against.
#[derive(Debug, Clone, PartialEq)]
pub struct LineView {
    pub line_id: i64,
    pub legal_entity_id: LegalEntityId,
    pub bank_account_id: BankAccountId,
    pub txn_date: NaiveDate,
    pub description: Option<String>,
    pub reference_no: Option<String>,
    /// Signed full statement amount.
    pub amount_micros: AmountMicros,
    /// |amount| minus the active matched total.
    pub remaining_abs_micros: AmountMicros,
    pub currency_code: String,
}

impl LineView {
    fn text_blob(&self) -> String {
        let mut parts = Vec::new();
        if let Some(description) = &self.description {
            parts.push(description.as_str());
        }
        if let Some(reference) = &self.reference_no {
            parts.push(reference.as_str());
        }
        parts.join(" ")
    }

    fn tokens(&self) -> Vec<String> {
        tokenize(&self.text_blob())
    }
}

/// Posted payment batch as seen by the candidate search.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCandidateRow {
    pub batch_id: i64,
    pub batch_no: String,
    pub posted_at: NaiveDate,
    pub total_abs_micros: AmountMicros,
    pub reference: Option<String>,
    pub text_blob: String,
}

/// Posted journal as seen by the candidate search.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalCandidateRow {
    pub journal_id: i64,
    pub entry_date: NaiveDate,
    /// |Σ debit − Σ credit| over the bank-GL lines.
    pub amount_abs_micros: AmountMicros,
    pub reference: Option<String>,
    pub narration: String,
}

/// Posted payment line as seen by the return / difference searches.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentLineCandidateRow {
    pub payment_line_id: i64,
    pub batch_id: i64,
    pub batch_no: String,
    pub posted_at: NaiveDate,
    pub expected_abs_micros: AmountMicros,
    pub currency_code: String,
    pub text_fields: Vec<String>,
}

/// Data access the engine needs; implemented over the payment and ledger
/// stores by the composition root.
#[async_trait]
pub trait CandidateSources: Send + Sync {
    async fn posted_batches(
        &self,
        tenant_id: TenantId,
        line: &LineView,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> RulesResult<Vec<BatchCandidateRow>>;

    async fn posted_journals(
        &self,
        tenant_id: TenantId,
        line: &LineView,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> RulesResult<Vec<JournalCandidateRow>>;

    /// Same-currency lines of posted batches; `window` is absent for the
    /// return search, which is unwindowed.
    async fn posted_payment_lines(
        &self,
        tenant_id: TenantId,
        line: &LineView,
        window: Option<(NaiveDate, NaiveDate)>,
    ) -> RulesResult<Vec<PaymentLineCandidateRow>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTarget {
    Journal(i64),
    PaymentBatch(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub target: MatchTarget,
    pub amount_abs_micros: AmountMicros,
    pub score: i32,
    pub diff_abs_micros: AmountMicros,
}

/// The engine's verdict for one line.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    AutoMatchReady {
        rule_id: RuleId,
        target: MatchTarget,
        candidate_amount_abs_micros: AmountMicros,
        score: i32,
    },
    AutoPostReady {
        rule_id: RuleId,
        template_id: TemplateId,
    },
    AutoReturnReady {
        rule_id: RuleId,
        payment_line_id: i64,
        batch_id: i64,
        event_type: ReturnEventKind,
        reason: Option<String>,
    },
    AutoDiffReady {
        rule_id: RuleId,
        profile_id: ProfileId,
        payment_line_id: i64,
        batch_id: i64,
        expected_abs_micros: AmountMicros,
    },
    SuggestOnly {
        rule_id: RuleId,
        candidates: Vec<Candidate>,
    },
    AmbiguousTarget {
        rule_id: RuleId,
        candidates: Vec<Candidate>,
    },
    PolicyBlocked {
        rule_id: RuleId,
        reason: String,
    },
    RuleQueueException {
        rule_id: RuleId,
        reason: Option<String>,
    },
    NoRuleMatch,
    Skipped,
}

impl Outcome {
    /// Ready/Suggest outcomes participate in the stop-on-match walk
    /// policy; everything else is terminal by nature.
    #[must_use]
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            Outcome::AutoMatchReady { .. }
                | Outcome::AutoPostReady { .. }
                | Outcome::AutoReturnReady { .. }
                | Outcome::AutoDiffReady { .. }
                | Outcome::SuggestOnly { .. }
        )
    }

    #[must_use]
    pub fn matched_rule_id(&self) -> Option<RuleId> {
        match self {
            Outcome::AutoMatchReady { rule_id, .. }
            | Outcome::AutoPostReady { rule_id, .. }
            | Outcome::AutoReturnReady { rule_id, .. }
            | Outcome::AutoDiffReady { rule_id, .. }
            | Outcome::SuggestOnly { rule_id, .. }
            | Outcome::AmbiguousTarget { rule_id, .. }
            | Outcome::PolicyBlocked { rule_id, .. }
            | Outcome::RuleQueueException { rule_id, .. } => Some(*rule_id),
            Outcome::NoRuleMatch | Outcome::Skipped => None,
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() >= MIN_TOKEN_LEN)
        .map(str::to_ascii_uppercase)
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_uppercase()
        .contains(&needle.to_ascii_uppercase())
}

fn token_hits(tokens: &[String], blob: &str) -> i32 {
    let blob_upper = blob.to_ascii_uppercase();
    tokens
        .iter()
        .filter(|token| blob_upper.contains(token.as_str()))
        .count() as i32
}

/// Text prechecks: a non-empty `reference_includes_any` must hit the
/// reference, a non-empty `text_includes_any` must hit the full blob.
fn passes_text_prechecks(conditions: &RuleConditions, line: &LineView) -> bool {
    if !conditions.reference_includes_any.is_empty() {
        let Some(reference) = line.reference_no.as_deref() else {
            return false;
        };
        if !conditions
            .reference_includes_any
            .iter()
            .any(|needle| contains_ci(reference, needle))
        {
            return false;
        }
    }
    if !conditions.text_includes_any.is_empty() {
        let blob = line.text_blob();
        if !conditions
            .text_includes_any
            .iter()
            .any(|needle| contains_ci(&blob, needle))
        {
            return false;
        }
    }
    true
}

fn lag_window(txn_date: NaiveDate, lag_days: i64) -> (NaiveDate, NaiveDate) {
    let lag = Days::new(lag_days.unsigned_abs());
    let from = txn_date.checked_sub_days(lag).unwrap_or(txn_date);
    let to = txn_date.checked_add_days(lag).unwrap_or(txn_date);
    (from, to)
}

/// Stateless rule engine; all I/O goes through [`CandidateSources`].
#[derive(Default)]
pub struct RuleEngine;

impl RuleEngine {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Walks the ordered rules and produces exactly one outcome for the
    /// line. `rules` must already be filtered to ACTIVE/approved and
    /// sorted by (priority, id).
    pub async fn evaluate_line(
        &self,
        tenant_id: TenantId,
        line: &LineView,
        rules: &[Rule],
        sources: &dyn CandidateSources,
    ) -> RulesResult<Outcome> {
        if line.remaining_abs_micros <= EPSILON_MICROS {
            return Ok(Outcome::Skipped);
        }

        // Terminal outcomes end the walk outright; actionable ones obey
        // the stop-on-match policy, and the first recorded one wins.
        enum Verdict {
            Terminal(Outcome),
            Actionable(Outcome),
        }

        let mut recorded: Option<Outcome> = None;
        for rule in rules {
            if !rule
                .scope
                .applies_to(line.legal_entity_id, line.bank_account_id)
            {
                continue;
            }
            if !rule.window.contains(line.txn_date) {
                continue;
            }
            if !passes_text_prechecks(&rule.conditions, line) {
                continue;
            }

            // Policy checks are terminal for the line.
            if let Some(debit_credit) = rule.conditions.debit_credit
                && !debit_credit.matches_amount(line.amount_micros)
            {
                if recorded.is_none() {
                    return Ok(Outcome::PolicyBlocked {
                        rule_id: rule.id,
                        reason: format!(
                            "direction {debit_credit:?} does not match statement amount"
                        ),
                    });
                }
                continue;
            }
            if let Some(currency) = &rule.conditions.currency_code
                && !currency.eq_ignore_ascii_case(&line.currency_code)
            {
                if recorded.is_none() {
                    return Ok(Outcome::PolicyBlocked {
                        rule_id: rule.id,
                        reason: format!(
                            "rule currency {currency} does not match line currency {}",
                            line.currency_code
                        ),
                    });
                }
                continue;
            }

            let verdict = match &rule.action {
                RuleAction::QueueException { reason } => {
                    Some(Verdict::Terminal(Outcome::RuleQueueException {
                        rule_id: rule.id,
                        reason: reason.clone(),
                    }))
                }
                RuleAction::AutoPostTemplate { template_id } => {
                    Some(Verdict::Actionable(Outcome::AutoPostReady {
                        rule_id: rule.id,
                        template_id: *template_id,
                    }))
                }
                RuleAction::AutoMatchPaymentBatch
                | RuleAction::AutoMatchJournal
                | RuleAction::SuggestOnly => {
                    let candidates = if rule.match_kind.searches_journals() {
                        self.journal_candidates(tenant_id, line, rule, sources).await?
                    } else {
                        self.batch_candidates(tenant_id, line, rule, sources).await?
                    };
                    if candidates.is_empty() {
                        None
                    } else if matches!(rule.action, RuleAction::SuggestOnly) {
                        Some(Verdict::Actionable(Outcome::SuggestOnly {
                            rule_id: rule.id,
                            candidates,
                        }))
                    } else if candidates.len() > 1 {
                        Some(Verdict::Terminal(Outcome::AmbiguousTarget {
                            rule_id: rule.id,
                            candidates,
                        }))
                    } else {
                        let only = &candidates[0];
                        Some(Verdict::Actionable(Outcome::AutoMatchReady {
                            rule_id: rule.id,
                            target: only.target,
                            candidate_amount_abs_micros: only.amount_abs_micros,
                            score: only.score,
                        }))
                    }
                }
                RuleAction::ProcessPaymentReturn { event_type, reason } => {
                    let survivors = self.return_candidates(tenant_id, line, sources).await?;
                    if survivors.is_empty() {
                        None
                    } else if survivors.len() > 1 {
                        Some(Verdict::Terminal(Outcome::AmbiguousTarget {
                            rule_id: rule.id,
                            candidates: survivors
                                .iter()
                                .map(|row| Candidate {
                                    target: MatchTarget::PaymentBatch(row.0.batch_id),
                                    amount_abs_micros: row.0.expected_abs_micros,
                                    score: row.1,
                                    diff_abs_micros: 0,
                                })
                                .collect(),
                        }))
                    } else {
                        let (row, _) = &survivors[0];
                        Some(Verdict::Actionable(Outcome::AutoReturnReady {
                            rule_id: rule.id,
                            payment_line_id: row.payment_line_id,
                            batch_id: row.batch_id,
                            event_type: *event_type,
                            reason: reason.clone(),
                        }))
                    }
                }
                RuleAction::AutoMatchPaymentLineWithDifference { profile_id } => {
                    let survivors = self
                        .difference_candidates(tenant_id, line, rule, sources)
                        .await?;
                    if survivors.is_empty() {
                        None
                    } else if survivors.len() > 1 {
                        Some(Verdict::Terminal(Outcome::AmbiguousTarget {
                            rule_id: rule.id,
                            candidates: survivors
                                .iter()
                                .map(|row| Candidate {
                                    target: MatchTarget::PaymentBatch(row.0.batch_id),
                                    amount_abs_micros: row.0.expected_abs_micros,
                                    score: row.1,
                                    diff_abs_micros: row.2,
                                })
                                .collect(),
                        }))
                    } else {
                        let (row, _, _) = &survivors[0];
                        Some(Verdict::Actionable(Outcome::AutoDiffReady {
                            rule_id: rule.id,
                            profile_id: *profile_id,
                            payment_line_id: row.payment_line_id,
                            batch_id: row.batch_id,
                            expected_abs_micros: row.expected_abs_micros,
                        }))
                    }
                }
            };

            match verdict {
                // Empty candidate set: the walk continues regardless of
                // stop_on_match.
                None => continue,
                Some(Verdict::Terminal(outcome)) => {
                    if recorded.is_none() {
                        return Ok(outcome);
                    }
                }
                Some(Verdict::Actionable(outcome)) => {
                    if recorded.is_none() {
                        if rule.stop_on_match {
                            return Ok(outcome);
                        }
                        recorded = Some(outcome);
                    }
                }
            }
        }

        Ok(recorded.unwrap_or(Outcome::NoRuleMatch))
    }

    async fn batch_candidates(
        &self,
        tenant_id: TenantId,
        line: &LineView,
        rule: &Rule,
        sources: &dyn CandidateSources,
    ) -> RulesResult<Vec<Candidate>> {
        let (from, to) = lag_window(line.txn_date, rule.conditions.date_lag_days);
        let rows = sources.posted_batches(tenant_id, line, from, to).await?;
        let tokens = line.tokens();
        let mut candidates = Vec::new();
        for row in rows {
            let diff = (row.total_abs_micros - line.remaining_abs_micros).abs();
            if diff > rule.conditions.amount_tolerance_micros {
                continue;
            }
            let exact_reference = line
                .reference_no
                .as_deref()
                .is_some_and(|reference| contains_ci(&row.text_blob, reference));
            let wants_exact_reference = rule.match_kind == RuleMatchKind::PaymentByBankReference
                || rule.conditions.require_reference;
            if wants_exact_reference && !exact_reference {
                continue;
            }
            let hits = token_hits(&tokens, &row.text_blob);
            if rule.match_kind == RuleMatchKind::PaymentByTextAndAmount {
                let needle_hit = rule
                    .conditions
                    .reference_includes_any
                    .iter()
                    .chain(rule.conditions.text_includes_any.iter())
                    .any(|needle| contains_ci(&row.text_blob, needle));
                if !needle_hit && hits == 0 && !exact_reference {
                    continue;
                }
            }
            let mut score = hits * SCORE_TOKEN_HIT;
            if exact_reference {
                score += SCORE_EXACT_REFERENCE;
            }
            if diff <= AMOUNT_CLOSE_MICROS {
                score += SCORE_AMOUNT_CLOSE;
            }
            candidates.push(Candidate {
                target: MatchTarget::PaymentBatch(row.batch_id),
                amount_abs_micros: row.total_abs_micros,
                score,
                diff_abs_micros: diff,
            });
        }
        candidates.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(a.diff_abs_micros.cmp(&b.diff_abs_micros))
        });
        Ok(candidates)
    }

    async fn journal_candidates(
        &self,
        tenant_id: TenantId,
        line: &LineView,
        rule: &Rule,
        sources: &dyn CandidateSources,
    ) -> RulesResult<Vec<Candidate>> {
        let (from, to) = lag_window(line.txn_date, rule.conditions.date_lag_days);
        let rows = sources.posted_journals(tenant_id, line, from, to).await?;
        let tokens = line.tokens();
        let mut candidates = Vec::new();
        for row in rows {
            let diff = (row.amount_abs_micros - line.remaining_abs_micros).abs();
            if diff > rule.conditions.amount_tolerance_micros {
                continue;
            }
            let journal_blob = match &row.reference {
                Some(reference) => format!("{} {reference}", row.narration),
                None => row.narration.clone(),
            };
            let exact_reference = line
                .reference_no
                .as_deref()
                .is_some_and(|reference| contains_ci(&journal_blob, reference));
            if rule.match_kind == RuleMatchKind::JournalByReferenceAndAmount && !exact_reference {
                continue;
            }
            let hits = token_hits(&tokens, &journal_blob);
            if rule.match_kind == RuleMatchKind::JournalByTextAndAmount {
                let needle_hit = rule
                    .conditions
                    .text_includes_any
                    .iter()
                    .any(|needle| contains_ci(&journal_blob, needle));
                if !needle_hit && hits == 0 && !exact_reference {
                    continue;
                }
            }
            let mut score = hits * SCORE_TOKEN_HIT;
            if exact_reference {
                score += SCORE_EXACT_REFERENCE;
            }
            if diff <= AMOUNT_CLOSE_MICROS {
                score += SCORE_AMOUNT_CLOSE;
            }
            candidates.push(Candidate {
                target: MatchTarget::Journal(row.journal_id),
                amount_abs_micros: row.amount_abs_micros,
                score,
                diff_abs_micros: diff,
            });
        }
        candidates.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(a.diff_abs_micros.cmp(&b.diff_abs_micros))
        });
        Ok(candidates)
    }

    /// Scored return search: token hits against the line texts, winners
    /// are the top-score ties.
    async fn return_candidates(
        &self,
        tenant_id: TenantId,
        line: &LineView,
        sources: &dyn CandidateSources,
    ) -> RulesResult<Vec<(PaymentLineCandidateRow, i32)>> {
        let rows = sources.posted_payment_lines(tenant_id, line, None).await?;
        let tokens = line.tokens();
        let mut scored: Vec<(PaymentLineCandidateRow, i32)> = rows
            .into_iter()
            .filter_map(|row| {
                let blob = row.text_fields.join(" ");
                let mut score = token_hits(&tokens, &blob) * SCORE_TOKEN_HIT;
                if line
                    .reference_no
                    .as_deref()
                    .is_some_and(|reference| contains_ci(&blob, reference))
                {
                    score += SCORE_EXACT_REFERENCE;
                }
                (score > 0).then_some((row, score))
            })
            .collect();
        let Some(top) = scored.iter().map(|(_, score)| *score).max() else {
            return Ok(Vec::new());
        };
        scored.retain(|(_, score)| *score == top);
        scored.sort_by_key(|(row, _)| row.payment_line_id);
        Ok(scored)
    }

    /// Scored difference search: ranked by score, then smaller absolute
    /// difference; only an undisputed top survives.
    async fn difference_candidates(
        &self,
        tenant_id: TenantId,
        line: &LineView,
        rule: &Rule,
        sources: &dyn CandidateSources,
    ) -> RulesResult<Vec<(PaymentLineCandidateRow, i32, AmountMicros)>> {
        let window = lag_window(line.txn_date, rule.conditions.date_lag_days);
        let rows = sources
            .posted_payment_lines(tenant_id, line, Some(window))
            .await?;
        let tokens = line.tokens();
        let mut scored: Vec<(PaymentLineCandidateRow, i32, AmountMicros)> = rows
            .into_iter()
            .filter_map(|row| {
                let blob = row.text_fields.join(" ");
                let mut score = token_hits(&tokens, &blob) * SCORE_TOKEN_HIT;
                if line
                    .reference_no
                    .as_deref()
                    .is_some_and(|reference| contains_ci(&blob, reference))
                {
                    score += SCORE_EXACT_REFERENCE;
                }
                let diff = (line.remaining_abs_micros - row.expected_abs_micros).abs();
                if diff <= AMOUNT_CLOSE_MICROS {
                    score += SCORE_AMOUNT_CLOSE;
                }
                (score > 0).then_some((row, score, diff))
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        match scored.len() {
            0 | 1 => Ok(scored),
            _ => {
                // An exact tie on (score, diff) stays ambiguous; a strict
                // winner drops the rest.
                if scored[0].1 == scored[1].1 && scored[0].2 == scored[1].2 {
                    Ok(scored)
                } else {
                    scored.truncate(1);
                    Ok(scored)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuleStatus;
    use konto_common::ApprovalState;
    use konto_common::DebitCredit;
    use konto_common::EffectiveWindow;
    use konto_common::ScopeSelector;
    use konto_common::money::from_units;
    use pretty_assertions::assert_eq;
    use tokio::sync::Mutex;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[derive(Default)]
    struct StubSources {
        batches: Vec<BatchCandidateRow>,
        journals: Vec<JournalCandidateRow>,
        payment_lines: Vec<PaymentLineCandidateRow>,
        batch_queries: Mutex<u32>,
    }

    #[async_trait]
    impl CandidateSources for StubSources {
        async fn posted_batches(
            &self,
            _tenant_id: TenantId,
            _line: &LineView,
            date_from: NaiveDate,
            date_to: NaiveDate,
        ) -> RulesResult<Vec<BatchCandidateRow>> {
            *self.batch_queries.lock().await += 1;
            Ok(self
                .batches
                .iter()
                .filter(|row| row.posted_at >= date_from && row.posted_at <= date_to)
                .cloned()
                .collect())
        }

        async fn posted_journals(
            &self,
            _tenant_id: TenantId,
            _line: &LineView,
            date_from: NaiveDate,
            date_to: NaiveDate,
        ) -> RulesResult<Vec<JournalCandidateRow>> {
            Ok(self
                .journals
                .iter()
                .filter(|row| row.entry_date >= date_from && row.entry_date <= date_to)
                .cloned()
                .collect())
        }

        async fn posted_payment_lines(
            &self,
            _tenant_id: TenantId,
            _line: &LineView,
            window: Option<(NaiveDate, NaiveDate)>,
        ) -> RulesResult<Vec<PaymentLineCandidateRow>> {
            Ok(self
                .payment_lines
                .iter()
                .filter(|row| {
                    window.is_none_or(|(from, to)| row.posted_at >= from && row.posted_at <= to)
                })
                .cloned()
                .collect())
        }
    }

    fn line(amount: AmountMicros, reference: &str) -> LineView {
        LineView {
            line_id: 1,
            legal_entity_id: 10,
            bank_account_id: 20,
            txn_date: date(2025, 3, 10),
            description: Some("OUTGOING TRANSFER".into()),
            reference_no: Some(reference.into()),
            amount_micros: amount,
            remaining_abs_micros: amount.abs(),
            currency_code: "EUR".into(),
        }
    }

    fn rule(id: RuleId, priority: i32, action: RuleAction, kind: RuleMatchKind) -> Rule {
        Rule {
            id,
            tenant_id: 1,
            rule_code: format!("R-{id}"),
            rule_name: format!("rule {id}"),
            status: RuleStatus::Active,
            priority,
            scope: ScopeSelector::global(),
            match_kind: kind,
            action,
            conditions: RuleConditions {
                amount_tolerance_micros: 50_000,
                date_lag_days: 3,
                ..RuleConditions::default()
            },
            stop_on_match: true,
            window: EffectiveWindow::open(),
            approval_state: ApprovalState::Approved,
            version_no: 1,
            approval_request_id: None,
        }
    }

    fn batch_row(batch_id: i64, total: AmountMicros, blob: &str) -> BatchCandidateRow {
        BatchCandidateRow {
            batch_id,
            batch_no: format!("PB-{batch_id}"),
            posted_at: date(2025, 3, 9),
            total_abs_micros: total,
            reference: None,
            text_blob: blob.into(),
        }
    }

    #[tokio::test]
    async fn zero_remaining_is_skipped() {
        let mut view = line(from_units(100), "PAY-1");
        view.remaining_abs_micros = 0;
        let engine = RuleEngine::new();
        let outcome = engine
            .evaluate_line(1, &view, &[], &StubSources::default())
            .await
            .expect("evaluate");
        assert_eq!(outcome, Outcome::Skipped);
    }

    #[tokio::test]
    async fn single_batch_candidate_produces_ready() {
        let sources = StubSources {
            batches: vec![batch_row(7, from_units(100), "PB-7 PAY-1 SUPPLIER")],
            ..StubSources::default()
        };
        let rules = vec![rule(
            1,
            10,
            RuleAction::AutoMatchPaymentBatch,
            RuleMatchKind::PaymentByBankReference,
        )];
        let outcome = RuleEngine::new()
            .evaluate_line(1, &line(from_units(-100), "PAY-1"), &rules, &sources)
            .await
            .expect("evaluate");
        match outcome {
            Outcome::AutoMatchReady { rule_id, target, score, .. } => {
                assert_eq!(rule_id, 1);
                assert_eq!(target, MatchTarget::PaymentBatch(7));
                assert!(score >= SCORE_EXACT_REFERENCE + SCORE_AMOUNT_CLOSE);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn two_candidates_are_ambiguous() {
        let sources = StubSources {
            batches: vec![
                batch_row(7, from_units(100), "PAY-1 A"),
                batch_row(8, from_units(100), "PAY-1 B"),
            ],
            ..StubSources::default()
        };
        let rules = vec![rule(
            1,
            10,
            RuleAction::AutoMatchPaymentBatch,
            RuleMatchKind::PaymentByBankReference,
        )];
        let outcome = RuleEngine::new()
            .evaluate_line(1, &line(from_units(-100), "PAY-1"), &rules, &sources)
            .await
            .expect("evaluate");
        assert!(matches!(outcome, Outcome::AmbiguousTarget { rule_id: 1, .. }));
    }

    #[tokio::test]
    async fn empty_candidates_continue_to_next_rule() {
        let sources = StubSources {
            batches: Vec::new(),
            journals: vec![JournalCandidateRow {
                journal_id: 55,
                entry_date: date(2025, 3, 10),
                amount_abs_micros: from_units(100),
                reference: Some("PAY-1".into()),
                narration: "Transfer out".into(),
            }],
            ..StubSources::default()
        };
        let rules = vec![
            rule(
                1,
                10,
                RuleAction::AutoMatchPaymentBatch,
                RuleMatchKind::PaymentByBankReference,
            ),
            rule(
                2,
                20,
                RuleAction::AutoMatchJournal,
                RuleMatchKind::JournalByReferenceAndAmount,
            ),
        ];
        let outcome = RuleEngine::new()
            .evaluate_line(1, &line(from_units(-100), "PAY-1"), &rules, &sources)
            .await
            .expect("evaluate");
        assert!(matches!(
            outcome,
            Outcome::AutoMatchReady {
                rule_id: 2,
                target: MatchTarget::Journal(55),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn policy_check_failure_is_terminal() {
        let sources = StubSources {
            batches: vec![batch_row(7, from_units(100), "PAY-1")],
            ..StubSources::default()
        };
        let mut blocked = rule(
            1,
            10,
            RuleAction::AutoMatchPaymentBatch,
            RuleMatchKind::PaymentByBankReference,
        );
        blocked.conditions.debit_credit = Some(DebitCredit::In);
        let fallback = rule(
            2,
            20,
            RuleAction::AutoMatchPaymentBatch,
            RuleMatchKind::PaymentByBankReference,
        );
        let outcome = RuleEngine::new()
            .evaluate_line(
                1,
                &line(from_units(-100), "PAY-1"),
                &[blocked, fallback],
                &sources,
            )
            .await
            .expect("evaluate");
        assert!(matches!(outcome, Outcome::PolicyBlocked { rule_id: 1, .. }));
    }

    #[tokio::test]
    async fn text_precheck_miss_skips_rule_silently() {
        let sources = StubSources {
            batches: vec![batch_row(7, from_units(100), "PAY-1")],
            ..StubSources::default()
        };
        let mut gated = rule(
            1,
            10,
            RuleAction::AutoMatchPaymentBatch,
            RuleMatchKind::PaymentByBankReference,
        );
        gated.conditions.reference_includes_any = vec!["OTHER-REF".into()];
        let outcome = RuleEngine::new()
            .evaluate_line(1, &line(from_units(-100), "PAY-1"), &[gated], &sources)
            .await
            .expect("evaluate");
        assert_eq!(outcome, Outcome::NoRuleMatch);
    }

    #[tokio::test]
    async fn queue_exception_action_short_circuits() {
        let rules = vec![rule(
            9,
            5,
            RuleAction::QueueException {
                reason: Some("manual review".into()),
            },
            RuleMatchKind::PaymentByTextAndAmount,
        )];
        let outcome = RuleEngine::new()
            .evaluate_line(
                1,
                &line(from_units(175), "PRB07-REF-001"),
                &rules,
                &StubSources::default(),
            )
            .await
            .expect("evaluate");
        assert!(matches!(
            outcome,
            Outcome::RuleQueueException { rule_id: 9, .. }
        ));
    }

    #[tokio::test]
    async fn stop_on_match_false_keeps_first_recorded_outcome() {
        let sources = StubSources {
            batches: vec![batch_row(7, from_units(100), "PAY-1")],
            ..StubSources::default()
        };
        let mut soft = rule(
            1,
            10,
            RuleAction::AutoMatchPaymentBatch,
            RuleMatchKind::PaymentByBankReference,
        );
        soft.stop_on_match = false;
        let later = rule(
            2,
            20,
            RuleAction::AutoMatchPaymentBatch,
            RuleMatchKind::PaymentByBankReference,
        );
        let outcome = RuleEngine::new()
            .evaluate_line(1, &line(from_units(-100), "PAY-1"), &[soft, later], &sources)
            .await
            .expect("evaluate");
        // Both rules matched; the first recorded outcome wins.
        assert!(matches!(outcome, Outcome::AutoMatchReady { rule_id: 1, .. }));
        assert_eq!(*sources.batch_queries.lock().await, 2);
    }

    #[tokio::test]
    async fn difference_search_picks_strict_winner() {
        let payment_row = |id: i64, expected: AmountMicros| PaymentLineCandidateRow {
            payment_line_id: id,
            batch_id: 70 + id,
            batch_no: format!("PB-{id}"),
            posted_at: date(2025, 3, 9),
            expected_abs_micros: expected,
            currency_code: "EUR".into(),
            text_fields: vec!["OUTGOING".into(), "TRANSFER".into()],
        };
        let sources = StubSources {
            payment_lines: vec![payment_row(1, from_units(100)), payment_row(2, from_units(120))],
            ..StubSources::default()
        };
        let rules = vec![rule(
            3,
            10,
            RuleAction::AutoMatchPaymentLineWithDifference { profile_id: 5 },
            RuleMatchKind::PaymentByTextAndAmount,
        )];
        let outcome = RuleEngine::new()
            .evaluate_line(1, &line(from_units(-95), "PAY-X"), &rules, &sources)
            .await
            .expect("evaluate");
        // Same token score; line 1's diff (5) is strictly smaller than
        // line 2's (25), so it wins.
        assert!(matches!(
            outcome,
            Outcome::AutoDiffReady {
                rule_id: 3,
                profile_id: 5,
                payment_line_id: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn return_search_requires_positive_score() {
        let sources = StubSources {
            payment_lines: vec![PaymentLineCandidateRow {
                payment_line_id: 1,
                batch_id: 71,
                batch_no: "PB-1".into(),
                posted_at: date(2025, 1, 1),
                expected_abs_micros: from_units(80),
                currency_code: "EUR".into(),
                text_fields: vec!["UNRELATED".into()],
            }],
            ..StubSources::default()
        };
        let rules = vec![rule(
            4,
            10,
            RuleAction::ProcessPaymentReturn {
                event_type: ReturnEventKind::PaymentReturned,
                reason: None,
            },
            RuleMatchKind::PaymentByTextAndAmount,
        )];
        let outcome = RuleEngine::new()
            .evaluate_line(1, &line(from_units(80), "PAY-Z"), &rules, &sources)
            .await
            .expect("evaluate");
        assert_eq!(outcome, Outcome::NoRuleMatch);
    }

    #[test]
    fn tokenizer_keeps_significant_words() {
        assert_eq!(
            tokenize("Pay-1 to ACME GmbH #42"),
            vec!["ACME".to_string(), "GMBH".to_string(), "PAY".to_string()]
        );
    }
}
