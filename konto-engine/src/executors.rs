use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use konto_common::DifferenceType;
use konto_common::GlAccountId;
use konto_common::TenantId;
use konto_common::money::AmountMicros;
use konto_common::money::EPSILON_MICROS;
use konto_common::money::format_amount;
use konto_common::money::split_tax_inclusive;
use konto_ledger::BankAccountDirectory;
use konto_ledger::JournalEntry;
use konto_ledger::JournalLine;
use konto_ledger::JournalSource;
use konto_ledger::JournalStatus;
use konto_ledger::LedgerService;
use konto_ledger::NewJournalEntry;
use konto_ledger::PostingSide;
use konto_payments::BatchStatus;
use konto_payments::NewReturnEvent;
use konto_payments::PaymentsService;
use konto_payments::ReturnEventType;
use konto_rules::DescriptionMode;
use konto_rules::MatchTarget;
use konto_rules::PostingTemplate;
use konto_rules::ProfileId;
use konto_rules::ProfileStore;
use konto_rules::ReturnEventKind;
use konto_rules::RuleId;
use konto_rules::TaxMode;
use konto_rules::TemplateId;
use konto_rules::TemplateStatus;
use konto_rules::TemplateStore;
use konto_statements::MatchMeta;
use konto_statements::MatchRequest;
use konto_statements::MatchedEntityType;
use konto_statements::ReconciliationMethod;
use konto_statements::StatementLine;
use konto_statements::StatementLineId;
use konto_statements::StatementsService;
use konto_common::ApprovalState;
use tokio::sync::Mutex;

use crate::EngineError;
use crate::EngineResult;

const NARRATION_MAX_LEN: usize = 255;
const DEFAULT_DIFFERENCE_PREFIX: &str = "Reconciliation difference";

/// Idempotency anchor of the auto-post executor: one trace per line.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoPostTrace {
    pub tenant_id: TenantId,
    pub statement_line_id: StatementLineId,
    pub template_id: TemplateId,
    pub journal_entry_id: i64,
    pub posted_amount_micros: AmountMicros,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Idempotency anchor of the difference executor: one adjustment per line.
#[derive(Debug, Clone, PartialEq)]
pub struct DifferenceAdjustment {
    pub tenant_id: TenantId,
    pub statement_line_id: StatementLineId,
    pub payment_line_id: i64,
    pub batch_id: i64,
    pub profile_id: ProfileId,
    pub journal_entry_id: i64,
    /// Expected minus actual, signed.
    pub difference_amount_micros: AmountMicros,
    pub difference_type: DifferenceType,
    pub payment_match_micros: AmountMicros,
    pub diff_match_micros: AmountMicros,
    pub created_at: DateTime<Utc>,
}

/// The four action executors behind the apply run and the approval
/// dispatcher.
pub struct ExecutorSet {
    statements: Arc<dyn StatementsService>,
    payments: Arc<dyn PaymentsService>,
    ledger: Arc<dyn LedgerService>,
    bank_accounts: Arc<dyn BankAccountDirectory>,
    templates: Arc<dyn TemplateStore>,
    profiles: Arc<dyn ProfileStore>,
    traces: Mutex<HashMap<(TenantId, StatementLineId), AutoPostTrace>>,
    adjustments: Mutex<HashMap<(TenantId, StatementLineId), DifferenceAdjustment>>,
}

impl ExecutorSet {
    #[must_use]
    pub fn new(
        statements: Arc<dyn StatementsService>,
        payments: Arc<dyn PaymentsService>,
        ledger: Arc<dyn LedgerService>,
        bank_accounts: Arc<dyn BankAccountDirectory>,
        templates: Arc<dyn TemplateStore>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        Self {
            statements,
            payments,
            ledger,
            bank_accounts,
            templates,
            profiles,
            traces: Mutex::new(HashMap::new()),
            adjustments: Mutex::new(HashMap::new()),
        }
    }

    pub async fn auto_post_trace(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
    ) -> Option<AutoPostTrace> {
        let traces = self.traces.lock().await;
        traces.get(&(tenant_id, line_id)).cloned()
    }

    pub async fn difference_adjustment(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
    ) -> Option<DifferenceAdjustment> {
        let adjustments = self.adjustments.lock().await;
        adjustments.get(&(tenant_id, line_id)).cloned()
    }

    async fn remaining_abs(
        &self,
        tenant_id: TenantId,
        line: &StatementLine,
    ) -> EngineResult<AmountMicros> {
        let matched = self.statements.matched_total(tenant_id, line.id).await?;
        Ok(line.amount_micros.abs() - matched)
    }

    async fn has_active_match(
        &self,
        tenant_id: TenantId,
        line_id: StatementLineId,
        entity_type: MatchedEntityType,
        entity_id: i64,
    ) -> EngineResult<bool> {
        let matches = self.statements.active_matches(tenant_id, line_id).await?;
        Ok(matches.iter().any(|row| {
            row.matched_entity_type == entity_type && row.matched_entity_id == entity_id
        }))
    }

    /// Direct match of the single rule-engine candidate.
    pub async fn execute_auto_match(
        &self,
        tenant_id: TenantId,
        line: &StatementLine,
        rule_id: RuleId,
        target: MatchTarget,
        candidate_amount_abs_micros: AmountMicros,
    ) -> EngineResult<StatementLine> {
        let (entity_type, entity_id) = match target {
            MatchTarget::Journal(id) => (MatchedEntityType::Journal, id),
            MatchTarget::PaymentBatch(id) => (MatchedEntityType::PaymentBatch, id),
        };
        if self
            .has_active_match(tenant_id, line.id, entity_type, entity_id)
            .await?
        {
            return Ok(self.statements.get_line(tenant_id, line.id).await?);
        }
        let remaining = self.remaining_abs(tenant_id, line).await?;
        if remaining <= EPSILON_MICROS {
            return Ok(self.statements.get_line(tenant_id, line.id).await?);
        }
        let amount = remaining.min(candidate_amount_abs_micros);
        let outcome = self
            .statements
            .match_line(
                tenant_id,
                line.id,
                MatchRequest {
                    matched_entity_type: entity_type,
                    matched_entity_id: entity_id,
                    amount_micros: amount,
                    meta: MatchMeta::auto_rule(
                        rule_id,
                        ReconciliationMethod::RuleAutoMatch,
                        "system",
                    ),
                },
            )
            .await?;
        Ok(outcome.line)
    }

    /// Auto-post: deterministic `BAP-{line}` journal plus reconciliation.
    pub async fn execute_auto_post(
        &self,
        tenant_id: TenantId,
        line: &StatementLine,
        rule_id: RuleId,
        template_id: TemplateId,
    ) -> EngineResult<(StatementLine, JournalEntry)> {
        let template = self.templates.get(tenant_id, template_id).await?;
        validate_template_for_line(&template, line)?;

        let total_abs = line.amount_micros.abs();

        // The trace short-circuits the posting steps; the reconcile call
        // below is idempotent on its own.
        let existing = {
            let traces = self.traces.lock().await;
            traces.get(&(tenant_id, line.id)).cloned()
        };
        let journal = if let Some(trace) = existing {
            let journal = self
                .ledger
                .get_journal(tenant_id, trace.journal_entry_id)
                .await?;
            if journal.status != JournalStatus::Posted {
                return Err(EngineError::Conflict(format!(
                    "auto-post journal {} is no longer posted",
                    journal.journal_no
                )));
            }
            journal
        } else {
            let (book, _period) = self
                .ledger
                .resolve_book_and_period(tenant_id, line.legal_entity_id, line.txn_date)
                .await?;
            let bank_account = self
                .bank_accounts
                .get(tenant_id, line.bank_account_id)
                .await?;
            let narration = auto_post_narration(&template, line);
            let lines =
                build_auto_post_lines(&template, bank_account.gl_account_id, line.amount_micros)?;
            let (journal, _created) = self
                .ledger
                .insert_posted(NewJournalEntry {
                    tenant_id,
                    legal_entity_id: line.legal_entity_id,
                    book_id: book.id,
                    journal_no: format!("BAP-{}", line.id),
                    entry_date: line.txn_date,
                    narration,
                    reference: line.reference_no.clone(),
                    source: JournalSource::BankAutoPost,
                    lines,
                })
                .await?;

            let trace = AutoPostTrace {
                tenant_id,
                statement_line_id: line.id,
                template_id: template.id,
                journal_entry_id: journal.id,
                posted_amount_micros: total_abs,
                payload: serde_json::json!({
                    "tax_mode": template.tax_mode,
                    "tax_rate_bps": template.tax_rate_bps,
                    "narration": journal.narration,
                }),
                created_at: Utc::now(),
            };
            let mut traces = self.traces.lock().await;
            traces.insert((tenant_id, line.id), trace);
            journal
        };

        self.statements
            .record_auto_post(tenant_id, line.id, template.id, journal.id)
            .await?;
        let reconciled = self
            .statements
            .reconcile_to_journal(
                tenant_id,
                line.id,
                journal.id,
                None,
                MatchMeta::auto_rule(rule_id, ReconciliationMethod::RuleAutoPost, "system"),
            )
            .await?;
        Ok((reconciled.line, journal))
    }

    /// Payment return: idempotent event, line failure effects, batch match.
    pub async fn execute_return(
        &self,
        tenant_id: TenantId,
        line: &StatementLine,
        rule_id: RuleId,
        payment_line_id: i64,
        batch_id: i64,
        event_kind: ReturnEventKind,
        reason: Option<String>,
        request_id: Option<String>,
    ) -> EngineResult<StatementLine> {
        let payment_line = self.payments.get_line(tenant_id, payment_line_id).await?;
        if payment_line.batch_id != batch_id {
            return Err(EngineError::Validation(format!(
                "payment line {payment_line_id} does not belong to batch {batch_id}"
            )));
        }
        let batch = self.payments.get_batch(tenant_id, batch_id).await?;
        if batch.legal_entity_id != line.legal_entity_id
            || batch.bank_account_id != line.bank_account_id
        {
            return Err(EngineError::Validation(
                "payment batch scope does not match the statement line".into(),
            ));
        }
        if batch.status != BatchStatus::Posted {
            return Err(EngineError::Validation(format!(
                "payment batch {batch_id} is not posted"
            )));
        }
        if !payment_line
            .currency_code
            .eq_ignore_ascii_case(&line.currency_code)
        {
            return Err(EngineError::Validation(
                "payment line currency does not match the statement line".into(),
            ));
        }

        let (event_type, amount) = match event_kind {
            ReturnEventKind::PaymentRejected => (ReturnEventType::PaymentRejected, 0),
            ReturnEventKind::PaymentReturned => {
                (ReturnEventType::PaymentReturned, line.amount_micros.abs())
            }
        };
        self.payments
            .apply_return_event(NewReturnEvent {
                tenant_id,
                legal_entity_id: line.legal_entity_id,
                payment_line_id,
                request_id: request_id
                    .unwrap_or_else(|| format!("B08B-STMTRET:{}:{payment_line_id}", line.id)),
                event_type,
                amount_micros: amount,
                bank_reference: line.reference_no.clone(),
                reason,
            })
            .await?;

        if self
            .has_active_match(tenant_id, line.id, MatchedEntityType::PaymentBatch, batch_id)
            .await?
        {
            return Ok(self.statements.get_line(tenant_id, line.id).await?);
        }
        let outcome = self
            .statements
            .match_line(
                tenant_id,
                line.id,
                MatchRequest {
                    matched_entity_type: MatchedEntityType::PaymentBatch,
                    matched_entity_id: batch_id,
                    amount_micros: line.amount_micros.abs(),
                    meta: MatchMeta::auto_rule(rule_id, ReconciliationMethod::RuleReturn, "system"),
                },
            )
            .await?;
        Ok(outcome.line)
    }

    /// FX/fee difference: split match plus deterministic `BDIFF-{line}`
    /// adjustment journal.
    pub async fn execute_difference(
        &self,
        tenant_id: TenantId,
        line: &StatementLine,
        rule_id: RuleId,
        profile_id: ProfileId,
        payment_line_id: i64,
    ) -> EngineResult<StatementLine> {
        let profile = self.profiles.get(tenant_id, profile_id).await?;
        if profile.status != TemplateStatus::Active
            || profile.approval_state != ApprovalState::Approved
        {
            return Err(EngineError::Validation(format!(
                "difference profile {profile_id} is not active and approved"
            )));
        }
        if !profile
            .scope
            .applies_to(line.legal_entity_id, line.bank_account_id)
        {
            return Err(EngineError::Validation(
                "difference profile scope does not cover the statement line".into(),
            ));
        }
        if !profile.window.contains(line.txn_date) {
            return Err(EngineError::Validation(
                "difference profile is not effective on the transaction date".into(),
            ));
        }
        if !profile.currency_code.eq_ignore_ascii_case(&line.currency_code) {
            return Err(EngineError::Validation(
                "difference profile currency does not match the statement line".into(),
            ));
        }

        let payment_line = self.payments.get_line(tenant_id, payment_line_id).await?;
        let batch = self
            .payments
            .get_batch(tenant_id, payment_line.batch_id)
            .await?;
        if batch.legal_entity_id != line.legal_entity_id
            || batch.bank_account_id != line.bank_account_id
            || batch.status != BatchStatus::Posted
        {
            return Err(EngineError::Validation(
                "payment batch is not a posted batch of the statement line's account".into(),
            ));
        }

        let actual = self.remaining_abs(tenant_id, line).await?;
        if actual <= EPSILON_MICROS {
            return Ok(self.statements.get_line(tenant_id, line.id).await?);
        }
        let expected = payment_line.expected_amount_abs();
        let delta = actual - expected;
        let diff_abs = delta.abs();

        if diff_abs <= EPSILON_MICROS {
            // Within tolerance of the payment: one exact batch match.
            if !self
                .has_active_match(
                    tenant_id,
                    line.id,
                    MatchedEntityType::PaymentBatch,
                    batch.id,
                )
                .await?
            {
                let outcome = self
                    .statements
                    .match_line(
                        tenant_id,
                        line.id,
                        MatchRequest {
                            matched_entity_type: MatchedEntityType::PaymentBatch,
                            matched_entity_id: batch.id,
                            amount_micros: actual,
                            meta: MatchMeta::auto_rule(
                                rule_id,
                                ReconciliationMethod::RuleDiffExact,
                                "system",
                            ),
                        },
                    )
                    .await?;
                return Ok(outcome.line);
            }
            return Ok(self.statements.get_line(tenant_id, line.id).await?);
        }

        if !profile.direction_policy.allows(delta) {
            return Err(EngineError::Validation(format!(
                "difference of {} violates the profile direction policy",
                format_amount(delta)
            )));
        }
        if diff_abs > profile.max_abs_difference_micros + EPSILON_MICROS {
            return Err(EngineError::Validation(format!(
                "difference of {} exceeds the profile maximum {}",
                format_amount(diff_abs),
                format_amount(profile.max_abs_difference_micros)
            )));
        }

        let diff_match = diff_abs;
        let payment_match = actual - diff_abs;
        if payment_match > EPSILON_MICROS
            && !self
                .has_active_match(
                    tenant_id,
                    line.id,
                    MatchedEntityType::PaymentBatch,
                    batch.id,
                )
                .await?
        {
            self.statements
                .match_line(
                    tenant_id,
                    line.id,
                    MatchRequest {
                        matched_entity_type: MatchedEntityType::PaymentBatch,
                        matched_entity_id: batch.id,
                        amount_micros: payment_match,
                        meta: MatchMeta::auto_rule(
                            rule_id,
                            ReconciliationMethod::RuleDiffPay,
                            "system",
                        ),
                    },
                )
                .await?;
        }

        // Reported difference is expected minus actual: positive when the
        // bank moved less money than the payment instructed.
        let reported_difference = -delta;
        let inflow = line.amount_micros > 0;
        let bank_is_debit =
            (inflow && reported_difference > 0) || (!inflow && reported_difference < 0);
        let counter_account = difference_counter_account(&profile, bank_is_debit)?;
        let bank_account = self
            .bank_accounts
            .get(tenant_id, line.bank_account_id)
            .await?;
        let (bank_side, counter_side) = if bank_is_debit {
            (PostingSide::Debit, PostingSide::Credit)
        } else {
            (PostingSide::Credit, PostingSide::Debit)
        };

        let (book, _period) = self
            .ledger
            .resolve_book_and_period(tenant_id, line.legal_entity_id, line.txn_date)
            .await?;
        let statement_text = line
            .description
            .clone()
            .or_else(|| line.reference_no.clone())
            .unwrap_or_default();
        let prefix = profile
            .description_prefix
            .as_deref()
            .unwrap_or(DEFAULT_DIFFERENCE_PREFIX);
        let narration = truncate(&format!("{prefix}: {statement_text}"), NARRATION_MAX_LEN);

        let (journal, _created) = self
            .ledger
            .insert_posted(NewJournalEntry {
                tenant_id,
                legal_entity_id: line.legal_entity_id,
                book_id: book.id,
                journal_no: format!("BDIFF-{}", line.id),
                entry_date: line.txn_date,
                narration,
                reference: line.reference_no.clone(),
                source: JournalSource::BankDifference,
                lines: vec![
                    JournalLine {
                        gl_account_id: bank_account.gl_account_id,
                        side: bank_side,
                        amount_micros: diff_abs,
                    },
                    JournalLine {
                        gl_account_id: counter_account,
                        side: counter_side,
                        amount_micros: diff_abs,
                    },
                ],
            })
            .await?;

        {
            let mut adjustments = self.adjustments.lock().await;
            adjustments
                .entry((tenant_id, line.id))
                .or_insert_with(|| DifferenceAdjustment {
                    tenant_id,
                    statement_line_id: line.id,
                    payment_line_id,
                    batch_id: batch.id,
                    profile_id: profile.id,
                    journal_entry_id: journal.id,
                    difference_amount_micros: reported_difference,
                    difference_type: profile.difference_type,
                    payment_match_micros: payment_match,
                    diff_match_micros: diff_match,
                    created_at: Utc::now(),
                });
        }
        self.statements
            .record_difference(
                tenant_id,
                line.id,
                profile.id,
                journal.id,
                reported_difference,
                profile.difference_type,
            )
            .await?;

        let reconciled = self
            .statements
            .reconcile_to_journal(
                tenant_id,
                line.id,
                journal.id,
                Some(diff_match),
                MatchMeta::auto_rule(rule_id, ReconciliationMethod::RuleDiffAdj, "system"),
            )
            .await?;
        Ok(reconciled.line)
    }
}

fn validate_template_for_line(
    template: &PostingTemplate,
    line: &StatementLine,
) -> EngineResult<()> {
    if template.status != TemplateStatus::Active
        || template.approval_state != ApprovalState::Approved
    {
        return Err(EngineError::Validation(format!(
            "posting template {} is not active and approved",
            template.id
        )));
    }
    if !template
        .scope
        .applies_to(line.legal_entity_id, line.bank_account_id)
    {
        return Err(EngineError::Validation(
            "posting template scope does not cover the statement line".into(),
        ));
    }
    if !template.window.contains(line.txn_date) {
        return Err(EngineError::Validation(
            "posting template is not effective on the transaction date".into(),
        ));
    }
    if !template.direction_policy.allows(line.amount_micros) {
        return Err(EngineError::Validation(
            "statement direction is outside the template policy".into(),
        ));
    }
    let total_abs = line.amount_micros.abs();
    if let Some(min) = template.min_amount_abs_micros
        && total_abs < min
    {
        return Err(EngineError::Validation(
            "statement amount is below the template minimum".into(),
        ));
    }
    if let Some(max) = template.max_amount_abs_micros
        && total_abs > max
    {
        return Err(EngineError::Validation(
            "statement amount is above the template maximum".into(),
        ));
    }
    if !template
        .currency_code
        .eq_ignore_ascii_case(&line.currency_code)
    {
        return Err(EngineError::Validation(
            "template currency does not match the statement line".into(),
        ));
    }
    Ok(())
}

fn auto_post_narration(template: &PostingTemplate, line: &StatementLine) -> String {
    let statement_text = line
        .description
        .clone()
        .or_else(|| line.reference_no.clone())
        .unwrap_or_else(|| "Bank statement".into());
    let narration = match template.description_mode {
        DescriptionMode::UseStatementText => statement_text,
        DescriptionMode::Prefixed => match template.description_prefix.as_deref() {
            Some(prefix) => format!("{prefix} {statement_text}"),
            None => statement_text,
        },
        DescriptionMode::FixedText => template
            .fixed_description
            .clone()
            .unwrap_or(statement_text),
    };
    truncate(&narration, NARRATION_MAX_LEN)
}

fn build_auto_post_lines(
    template: &PostingTemplate,
    bank_gl_account_id: GlAccountId,
    amount_micros: AmountMicros,
) -> EngineResult<Vec<JournalLine>> {
    let total_abs = amount_micros.abs();
    if total_abs == 0 {
        return Err(EngineError::Validation(
            "cannot auto-post a zero-amount statement line".into(),
        ));
    }
    let outflow = amount_micros < 0;

    let (counter, tax) = match template.tax_mode {
        TaxMode::None => (total_abs, None),
        TaxMode::Included => {
            let tax_account = template.tax_account_id.ok_or_else(|| {
                EngineError::Validation("included tax requires a tax account".into())
            })?;
            let (base, tax) = split_tax_inclusive(total_abs, template.tax_rate_bps);
            if base <= 0 || tax <= 0 {
                return Err(EngineError::Validation(
                    "tax split must produce strictly positive base and tax amounts".into(),
                ));
            }
            (base, Some((tax_account, tax)))
        }
    };

    let (counter_side, bank_side) = if outflow {
        (PostingSide::Debit, PostingSide::Credit)
    } else {
        (PostingSide::Credit, PostingSide::Debit)
    };

    let mut lines = vec![JournalLine {
        gl_account_id: template.counter_account_id,
        side: counter_side,
        amount_micros: counter,
    }];
    if let Some((tax_account, tax_amount)) = tax {
        lines.push(JournalLine {
            gl_account_id: tax_account,
            side: counter_side,
            amount_micros: tax_amount,
        });
    }
    lines.push(JournalLine {
        gl_account_id: bank_gl_account_id,
        side: bank_side,
        amount_micros: total_abs,
    });
    Ok(lines)
}

fn difference_counter_account(
    profile: &konto_rules::DifferenceProfile,
    bank_is_debit: bool,
) -> EngineResult<GlAccountId> {
    match profile.difference_type {
        DifferenceType::Fee => profile.expense_account_id.ok_or_else(|| {
            EngineError::Validation("fee profile is missing its expense account".into())
        }),
        DifferenceType::Fx => {
            let account = if bank_is_debit {
                profile.fx_gain_account_id
            } else {
                profile.fx_loss_account_id
            };
            account.ok_or_else(|| {
                EngineError::Validation("fx profile is missing a gain/loss account".into())
            })
        }
    }
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    text.chars().take(max_len).collect()
}
