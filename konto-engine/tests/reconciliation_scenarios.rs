//! End-to-end reconciliation flows over the full in-memory stack.

use std::sync::Arc;

use chrono::NaiveDate;
use konto_common::ApprovalState;
use konto_common::DifferenceType;
use konto_common::EffectiveWindow;
use konto_common::ScopeSelector;
use konto_common::money::from_units;
use konto_audit::AuditFilter;
use konto_audit::AuditTrail;
use konto_audit::InMemoryAuditTrail;
use konto_engine::BufferedAuditBridge;
use konto_engine::EngineSettings;
use konto_engine::ExceptionAutoResolver;
use konto_engine::ExecutorSet;
use konto_engine::InMemoryRunStore;
use konto_engine::ReconciliationRunner;
use konto_engine::RunFilters;
use konto_engine::RunStatus;
use konto_engine::StoreCandidateSources;
use konto_engine::StoreTargetVerifier;
use konto_exceptions::EventKind;
use konto_exceptions::ExceptionQueue;
use konto_exceptions::ExceptionStatus;
use konto_exceptions::InMemoryExceptionQueue;
use konto_ledger::BankAccount;
use konto_ledger::BankAccountDirectory;
use konto_ledger::Book;
use konto_ledger::BookType;
use konto_ledger::FiscalPeriod;
use konto_ledger::InMemoryBankAccounts;
use konto_ledger::InMemoryLedger;
use konto_ledger::JournalStatus;
use konto_ledger::LedgerService;
use konto_ledger::PeriodStatus;
use konto_ledger::PostingSide;
use konto_payments::BatchStatus;
use konto_payments::InMemoryPayments;
use konto_payments::PaymentBatch;
use konto_payments::PaymentLine;
use konto_payments::PaymentLineStatus;
use konto_payments::PaymentsService;
use konto_rules::DescriptionMode;
use konto_rules::DiffDirectionPolicy;
use konto_rules::DifferenceProfile;
use konto_rules::DirectionPolicy;
use konto_rules::InMemoryProfileStore;
use konto_rules::InMemoryRuleStore;
use konto_rules::InMemoryTemplateStore;
use konto_rules::PostingTemplate;
use konto_rules::ProfileStore;
use konto_rules::Rule;
use konto_rules::RuleAction;
use konto_rules::RuleConditions;
use konto_rules::RuleMatchKind;
use konto_rules::RuleStatus;
use konto_rules::RuleStore;
use konto_rules::TaxMode;
use konto_rules::TemplateStatus;
use konto_rules::TemplateStore;
use konto_statements::InMemoryStatements;
use konto_statements::MatchMeta;
use konto_statements::MatchRequest;
use konto_statements::MatchedEntityType;
use konto_statements::NewStatementLine;
use konto_statements::ReconStatus;
use konto_statements::StatementsService;
use pretty_assertions::assert_eq;

const TENANT: i64 = 1;
const LEGAL_ENTITY: i64 = 10;
const BANK_ACCOUNT: i64 = 20;
const BANK_GL: i64 = 100;

struct Stack {
    statements: Arc<InMemoryStatements>,
    payments: Arc<InMemoryPayments>,
    ledger: Arc<InMemoryLedger>,
    rules: Arc<InMemoryRuleStore>,
    templates: Arc<InMemoryTemplateStore>,
    profiles: Arc<InMemoryProfileStore>,
    exceptions: Arc<InMemoryExceptionQueue>,
    executors: Arc<ExecutorSet>,
    runner: ReconciliationRunner,
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

async fn stack() -> Stack {
    let ledger = Arc::new(InMemoryLedger::new());
    let payments = Arc::new(InMemoryPayments::new());
    let bank_accounts = Arc::new(InMemoryBankAccounts::new());
    let exceptions = Arc::new(InMemoryExceptionQueue::new());
    let verifier = Arc::new(StoreTargetVerifier::new(ledger.clone(), payments.clone()));
    let statements = Arc::new(InMemoryStatements::new(verifier));
    statements.register_matched_observer(Arc::new(ExceptionAutoResolver::new(exceptions.clone())));

    let rules = Arc::new(InMemoryRuleStore::new());
    let templates = Arc::new(InMemoryTemplateStore::new());
    let profiles = Arc::new(InMemoryProfileStore::new());

    bank_accounts
        .upsert(BankAccount {
            id: BANK_ACCOUNT,
            tenant_id: TENANT,
            legal_entity_id: LEGAL_ENTITY,
            gl_account_id: BANK_GL,
            currency_code: "EUR".into(),
            iban: None,
        })
        .await
        .expect("bank account");
    ledger
        .upsert_book(Book {
            id: 1,
            tenant_id: TENANT,
            legal_entity_id: LEGAL_ENTITY,
            book_type: BookType::Local,
            name: "Local books".into(),
        })
        .await
        .expect("book");
    ledger
        .upsert_period(FiscalPeriod {
            id: 1,
            tenant_id: TENANT,
            legal_entity_id: LEGAL_ENTITY,
            start_date: date(2025, 3, 1),
            end_date: date(2025, 3, 31),
        })
        .await
        .expect("period");
    ledger
        .set_period_status(TENANT, 1, 1, PeriodStatus::Open)
        .await
        .expect("open period");

    let sources = Arc::new(StoreCandidateSources::new(
        payments.clone(),
        ledger.clone(),
        bank_accounts.clone(),
    ));
    let executors = Arc::new(ExecutorSet::new(
        statements.clone(),
        payments.clone(),
        ledger.clone(),
        bank_accounts.clone(),
        templates.clone(),
        profiles.clone(),
    ));
    let runner = ReconciliationRunner::new(
        statements.clone(),
        rules.clone(),
        sources,
        executors.clone(),
        exceptions.clone(),
        Arc::new(InMemoryRunStore::new()),
        EngineSettings::default(),
    );

    Stack {
        statements,
        payments,
        ledger,
        rules,
        templates,
        profiles,
        exceptions,
        executors,
        runner,
    }
}

fn base_rule(code: &str, match_kind: RuleMatchKind, action: RuleAction) -> Rule {
    Rule {
        id: 0,
        tenant_id: TENANT,
        rule_code: code.into(),
        rule_name: format!("rule {code}"),
        status: RuleStatus::Active,
        priority: 10,
        scope: ScopeSelector::global(),
        match_kind,
        action,
        conditions: RuleConditions {
            amount_tolerance_micros: 50_000,
            date_lag_days: 5,
            ..RuleConditions::default()
        },
        stop_on_match: true,
        window: EffectiveWindow::open(),
        approval_state: ApprovalState::Approved,
        version_no: 1,
        approval_request_id: None,
    }
}

fn statement_line(amount: i64, description: &str, reference: &str) -> NewStatementLine {
    NewStatementLine {
        tenant_id: TENANT,
        legal_entity_id: LEGAL_ENTITY,
        bank_account_id: BANK_ACCOUNT,
        import_id: 1,
        line_no: 1,
        txn_date: date(2025, 3, 10),
        value_date: None,
        description: Some(description.into()),
        reference_no: Some(reference.into()),
        amount_micros: amount,
        currency_code: "EUR".into(),
        balance_after_micros: None,
    }
}

fn payment_line(id: i64, batch_id: i64, amount: i64, beneficiary: &str) -> PaymentLine {
    PaymentLine {
        id,
        batch_id,
        tenant_id: TENANT,
        legal_entity_id: LEGAL_ENTITY,
        amount_micros: amount,
        executed_amount_micros: None,
        exported_amount_micros: None,
        currency_code: "EUR".into(),
        status: PaymentLineStatus::Settled,
        bank_reference: Some(format!("BREF-{id}")),
        external_payment_ref: None,
        beneficiary_bank_ref: None,
        payable_ref: None,
        beneficiary_name: Some(beneficiary.into()),
        return_status: None,
        bank_execution_status: None,
        returned_amount_micros: 0,
    }
}

fn posted_batch(id: i64, batch_no: &str) -> PaymentBatch {
    PaymentBatch {
        id,
        tenant_id: TENANT,
        legal_entity_id: LEGAL_ENTITY,
        bank_account_id: BANK_ACCOUNT,
        batch_no: batch_no.into(),
        status: BatchStatus::Posted,
        posted_at: Some(date(2025, 3, 9)),
        currency_code: "EUR".into(),
        reference: None,
    }
}

#[tokio::test]
async fn queue_exception_rule_lifecycle() {
    let stack = stack().await;
    let line = stack
        .statements
        .insert_line(statement_line(from_units(175), "INCOMING", "PRB07-REF-001"))
        .await
        .expect("line");
    let mut queue_rule = base_rule(
        "R-QUEUE",
        RuleMatchKind::PaymentByTextAndAmount,
        RuleAction::QueueException {
            reason: Some("route to operations".into()),
        },
    );
    queue_rule.conditions.reference_includes_any = vec!["PRB07-REF-001".into()];
    stack.rules.upsert(queue_rule).await.expect("rule");

    let preview = stack
        .runner
        .preview(TENANT, RunFilters::default())
        .await
        .expect("preview");
    assert!(!preview.replay);
    assert_eq!(preview.run.summary.scanned_count, 1);
    assert_eq!(preview.run.summary.exception_count, 1);
    assert_eq!(preview.run.rows[0].result, "RULE_QUEUE_EXCEPTION");
    // Preview only counts; no exception row yet.
    assert!(
        stack
            .exceptions
            .list(TENANT, Default::default())
            .await
            .expect("list")
            .items
            .is_empty()
    );

    let apply = stack
        .runner
        .apply(TENANT, RunFilters::default(), Some("PRB07_APPLY_1".into()))
        .await
        .expect("apply");
    assert!(!apply.replay);
    assert_eq!(apply.run.status, RunStatus::Partial);
    assert_eq!(apply.run.summary.exception_count, 1);
    let exception_id = apply.run.rows[0].exception_id.expect("exception id");
    assert!(exception_id > 0);

    let replay = stack
        .runner
        .apply(TENANT, RunFilters::default(), Some("PRB07_APPLY_1".into()))
        .await
        .expect("replay");
    assert!(replay.replay);
    assert_eq!(replay.run.id, apply.run.id);
    assert_eq!(replay.run.summary, apply.run.summary);

    let assigned = stack
        .exceptions
        .assign(TENANT, exception_id, Some(7), "user:7")
        .await
        .expect("assign");
    assert_eq!(assigned.status, ExceptionStatus::Assigned);

    let resolved = stack
        .exceptions
        .resolve(TENANT, exception_id, "RESOLVED_MANUALLY", None, "user:7")
        .await
        .expect("resolve");
    assert_eq!(resolved.status, ExceptionStatus::Resolved);

    let retried = stack
        .exceptions
        .retry(TENANT, exception_id, None, "user:7")
        .await
        .expect("retry");
    assert_eq!(retried.status, ExceptionStatus::Open);
    let kinds: Vec<EventKind> = retried.events.iter().map(|event| event.kind).collect();
    for expected in [
        EventKind::Created,
        EventKind::Assigned,
        EventKind::Resolved,
        EventKind::Retried,
    ] {
        assert!(kinds.contains(&expected), "missing {expected:?}");
    }

    // Matching the line afterwards auto-resolves the reopened exception.
    stack
        .statements
        .match_line(
            TENANT,
            line.id,
            MatchRequest {
                matched_entity_type: MatchedEntityType::ManualAdjustment,
                matched_entity_id: 1,
                amount_micros: from_units(175),
                meta: MatchMeta::manual("user:7"),
            },
        )
        .await
        .expect("manual match");
    let after = stack
        .exceptions
        .get(TENANT, exception_id)
        .await
        .expect("exception");
    assert_eq!(after.status, ExceptionStatus::Resolved);
    assert_eq!(after.resolution_code.as_deref(), Some("RECONCILED"));
}

#[tokio::test]
async fn fx_difference_splits_matches_and_posts_adjustment() {
    let stack = stack().await;
    let line = stack
        .statements
        .insert_line(statement_line(
            from_units(-95),
            "SUPPLIER PAYMENT",
            "PAY-FX-1",
        ))
        .await
        .expect("line");
    stack
        .payments
        .insert_batch(
            posted_batch(50, "PB-FX"),
            vec![payment_line(500, 50, from_units(100), "SUPPLIER PAYMENT LTD")],
        )
        .await
        .expect("batch");
    let profile = stack
        .profiles
        .upsert(DifferenceProfile {
            id: 0,
            tenant_id: TENANT,
            name: "FX tolerance".into(),
            status: TemplateStatus::Active,
            scope: ScopeSelector::global(),
            difference_type: DifferenceType::Fx,
            direction_policy: DiffDirectionPolicy::Both,
            max_abs_difference_micros: from_units(10),
            expense_account_id: None,
            fx_gain_account_id: Some(801),
            fx_loss_account_id: Some(802),
            currency_code: "EUR".into(),
            description_prefix: None,
            window: EffectiveWindow::open(),
            approval_state: ApprovalState::Approved,
            version_no: 1,
            approval_request_id: None,
        })
        .await
        .expect("profile");
    stack
        .rules
        .upsert(base_rule(
            "R-DIFF",
            RuleMatchKind::PaymentByTextAndAmount,
            RuleAction::AutoMatchPaymentLineWithDifference {
                profile_id: profile.id,
            },
        ))
        .await
        .expect("rule");

    let apply = stack
        .runner
        .apply(TENANT, RunFilters::default(), None)
        .await
        .expect("apply");
    assert_eq!(apply.run.status, RunStatus::Success);
    assert_eq!(apply.run.summary.reconciled_count, 1);
    assert_eq!(apply.run.rows[0].result, "DIFFERENCE_RECONCILED");

    let adjustment = stack
        .executors
        .difference_adjustment(TENANT, line.id)
        .await
        .expect("adjustment row");
    assert_eq!(adjustment.difference_type, DifferenceType::Fx);
    assert_eq!(adjustment.difference_amount_micros, from_units(5));
    assert_eq!(adjustment.payment_match_micros, from_units(90));
    assert_eq!(adjustment.diff_match_micros, from_units(5));

    let journal = stack
        .ledger
        .get_journal(TENANT, adjustment.journal_entry_id)
        .await
        .expect("journal");
    assert_eq!(journal.journal_no, format!("BDIFF-{}", line.id));
    assert_eq!(journal.status, JournalStatus::Posted);
    assert_eq!(journal.lines.len(), 2);
    let bank_line = journal
        .lines
        .iter()
        .find(|entry| entry.gl_account_id == BANK_GL)
        .expect("bank line");
    assert_eq!(bank_line.side, PostingSide::Credit);
    assert_eq!(bank_line.amount_micros, from_units(5));
    let counter_line = journal
        .lines
        .iter()
        .find(|entry| entry.gl_account_id == 802)
        .expect("fx loss line");
    assert_eq!(counter_line.side, PostingSide::Debit);

    let matches = stack
        .statements
        .active_matches(TENANT, line.id)
        .await
        .expect("matches");
    assert_eq!(matches.len(), 2);
    let updated = stack
        .statements
        .get_line(TENANT, line.id)
        .await
        .expect("line");
    assert_eq!(updated.recon_status, ReconStatus::Matched);
    assert_eq!(updated.difference_amount_micros, Some(from_units(5)));
    assert_eq!(updated.difference_type, Some(DifferenceType::Fx));
    assert_eq!(updated.difference_profile_id, Some(profile.id));
}

#[tokio::test]
async fn auto_post_reconciles_inflow_and_is_idempotent() {
    let stack = stack().await;
    let line = stack
        .statements
        .insert_line(statement_line(from_units(200), "INTEREST CREDIT", "INT-1"))
        .await
        .expect("line");
    let template = stack
        .templates
        .upsert(PostingTemplate {
            id: 0,
            tenant_id: TENANT,
            name: "Interest income".into(),
            status: TemplateStatus::Active,
            scope: ScopeSelector::global(),
            counter_account_id: 600,
            tax_mode: TaxMode::None,
            tax_account_id: None,
            tax_rate_bps: 0,
            direction_policy: DirectionPolicy::Both,
            min_amount_abs_micros: None,
            max_amount_abs_micros: None,
            currency_code: "EUR".into(),
            description_mode: DescriptionMode::UseStatementText,
            description_prefix: None,
            fixed_description: None,
            window: EffectiveWindow::open(),
            approval_state: ApprovalState::Approved,
            version_no: 1,
            approval_request_id: None,
        })
        .await
        .expect("template");
    stack
        .rules
        .upsert(base_rule(
            "R-POST",
            RuleMatchKind::PaymentByTextAndAmount,
            RuleAction::AutoPostTemplate {
                template_id: template.id,
            },
        ))
        .await
        .expect("rule");

    let apply = stack
        .runner
        .apply(TENANT, RunFilters::default(), Some("POST_APPLY_1".into()))
        .await
        .expect("apply");
    assert_eq!(apply.run.status, RunStatus::Success);
    assert_eq!(apply.run.rows[0].result, "AUTO_POSTED_RECONCILED");

    let updated = stack
        .statements
        .get_line(TENANT, line.id)
        .await
        .expect("line");
    assert_eq!(updated.recon_status, ReconStatus::Matched);
    assert_eq!(updated.auto_post_template_id, Some(template.id));
    let journal_id = updated.auto_post_journal_entry_id.expect("journal link");

    let journal = stack
        .ledger
        .get_journal(TENANT, journal_id)
        .await
        .expect("journal");
    assert_eq!(journal.journal_no, format!("BAP-{}", line.id));
    assert_eq!(journal.narration, "INTEREST CREDIT");
    let bank_line = journal
        .lines
        .iter()
        .find(|entry| entry.gl_account_id == BANK_GL)
        .expect("bank line");
    assert_eq!(bank_line.side, PostingSide::Debit);
    assert_eq!(bank_line.amount_micros, from_units(200));
    let counter_line = journal
        .lines
        .iter()
        .find(|entry| entry.gl_account_id == 600)
        .expect("counter line");
    assert_eq!(counter_line.side, PostingSide::Credit);

    let trace = stack
        .executors
        .auto_post_trace(TENANT, line.id)
        .await
        .expect("trace");
    assert_eq!(trace.posted_amount_micros, from_units(200));

    // A later apply has nothing left to scan; no duplicate journal or match.
    let second = stack
        .runner
        .apply(TENANT, RunFilters::default(), Some("POST_APPLY_2".into()))
        .await
        .expect("second apply");
    assert_eq!(second.run.summary.scanned_count, 0);
    assert_eq!(
        stack
            .statements
            .active_matches(TENANT, line.id)
            .await
            .expect("matches")
            .len(),
        1
    );
}

#[tokio::test]
async fn auto_match_by_bank_reference_reconciles_batch() {
    let stack = stack().await;
    let bridge = Arc::new(BufferedAuditBridge::new());
    stack.statements.register_audit_hook(bridge.clone());
    let line = stack
        .statements
        .insert_line(statement_line(
            from_units(-100),
            "OUTGOING TRANSFER",
            "PB-MARCH-01",
        ))
        .await
        .expect("line");
    stack
        .payments
        .insert_batch(
            posted_batch(60, "PB-MARCH-01"),
            vec![payment_line(600, 60, from_units(100), "ACME SUPPLIES")],
        )
        .await
        .expect("batch");
    stack
        .rules
        .upsert(base_rule(
            "R-REF",
            RuleMatchKind::PaymentByBankReference,
            RuleAction::AutoMatchPaymentBatch,
        ))
        .await
        .expect("rule");

    let preview = stack
        .runner
        .preview(TENANT, RunFilters::default())
        .await
        .expect("preview");
    assert_eq!(preview.run.summary.matched_count, 1);
    assert_eq!(preview.run.rows[0].result, "AUTO_MATCH_READY");

    let apply = stack
        .runner
        .apply(TENANT, RunFilters::default(), None)
        .await
        .expect("apply");
    assert_eq!(apply.run.status, RunStatus::Success);
    assert_eq!(apply.run.summary.reconciled_count, 1);

    let matches = stack
        .statements
        .active_matches(TENANT, line.id)
        .await
        .expect("matches");
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].matched_entity_type, MatchedEntityType::PaymentBatch);
    assert_eq!(matches[0].matched_amount_micros, from_units(100));

    // The audit bridge captured the match and the status transition.
    let trail = InMemoryAuditTrail::shared();
    let flushed = bridge.flush(trail.as_ref()).await.expect("flush");
    assert!(flushed >= 2);
    let records = trail
        .records(TENANT, AuditFilter::default())
        .await
        .expect("records");
    assert!(records.iter().any(|record| record.action == "MATCHED"));
    assert!(records.iter().any(|record| record.action == "AUTO_STATUS"));
}

#[tokio::test]
async fn payment_return_rule_fails_line_and_matches_batch() {
    let stack = stack().await;
    let line = stack
        .statements
        .insert_line(statement_line(
            from_units(80),
            "RETURNED PAYMENT BREF-700",
            "BREF-700",
        ))
        .await
        .expect("line");
    let mut pending = payment_line(700, 70, from_units(80), "GONE LTD");
    pending.status = PaymentLineStatus::Pending;
    stack
        .payments
        .insert_batch(posted_batch(70, "PB-RET"), vec![pending])
        .await
        .expect("batch");
    stack
        .rules
        .upsert(base_rule(
            "R-RET",
            RuleMatchKind::PaymentByTextAndAmount,
            RuleAction::ProcessPaymentReturn {
                event_type: konto_rules::ReturnEventKind::PaymentReturned,
                reason: Some("account closed".into()),
            },
        ))
        .await
        .expect("rule");

    let apply = stack
        .runner
        .apply(TENANT, RunFilters::default(), None)
        .await
        .expect("apply");
    assert_eq!(apply.run.rows[0].result, "RETURN_PROCESSED_RECONCILED");

    let payment = stack
        .payments
        .get_line(TENANT, 700)
        .await
        .expect("payment line");
    assert_eq!(payment.returned_amount_micros, from_units(80));
    assert_eq!(
        payment.return_status,
        Some(konto_payments::ReturnStatus::Returned)
    );

    let matches = stack
        .statements
        .active_matches(TENANT, line.id)
        .await
        .expect("matches");
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].matched_amount_micros, from_units(80));

    let audit = stack.payments.batch_audit(TENANT, 70).await.expect("audit");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, "STATUS");
}

#[tokio::test]
async fn no_rule_match_queues_exception_and_match_resolves_it() {
    let stack = stack().await;
    let line = stack
        .statements
        .insert_line(statement_line(from_units(33), "MYSTERY CREDIT", "UNKNOWN-1"))
        .await
        .expect("line");

    let apply = stack
        .runner
        .apply(TENANT, RunFilters::default(), None)
        .await
        .expect("apply");
    assert_eq!(apply.run.status, RunStatus::Partial);
    assert_eq!(apply.run.rows[0].result, "NO_RULE_MATCH");
    let exception_id = apply.run.rows[0].exception_id.expect("exception");

    // Re-running bumps the occurrence count instead of duplicating.
    stack
        .runner
        .apply(TENANT, RunFilters::default(), None)
        .await
        .expect("second apply");
    let exception = stack
        .exceptions
        .get(TENANT, exception_id)
        .await
        .expect("exception");
    assert_eq!(exception.occurrence_count, 2);
    assert_eq!(exception.status, ExceptionStatus::Open);

    stack
        .statements
        .match_line(
            TENANT,
            line.id,
            MatchRequest {
                matched_entity_type: MatchedEntityType::ManualAdjustment,
                matched_entity_id: 9,
                amount_micros: from_units(33),
                meta: MatchMeta::manual("user:2"),
            },
        )
        .await
        .expect("manual match");
    let resolved = stack
        .exceptions
        .get(TENANT, exception_id)
        .await
        .expect("exception");
    assert_eq!(resolved.status, ExceptionStatus::Resolved);
}
