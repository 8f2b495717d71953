#![deny(clippy::print_stdout, clippy::print_stderr)]

use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub mod money;

pub type TenantId = i64;
pub type LegalEntityId = i64;
pub type BankAccountId = i64;
pub type GlAccountId = i64;
pub type UserId = i64;

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("scope validation error: {0}")]
    Invalid(String),
}

/// Where an entity (rule, template, profile, policy) is anchored.
///
/// `BankAccount` is the narrowest anchor and implies a legal entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeType {
    Global,
    LegalEntity,
    BankAccount,
}

impl ScopeType {
    /// Narrower scopes outrank wider ones when several anchored entities
    /// apply to the same target.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            ScopeType::Global => 0,
            ScopeType::LegalEntity => 1,
            ScopeType::BankAccount => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSelector {
    pub scope_type: ScopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legal_entity_id: Option<LegalEntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_account_id: Option<BankAccountId>,
}

impl ScopeSelector {
    #[must_use]
    pub fn global() -> Self {
        Self {
            scope_type: ScopeType::Global,
            legal_entity_id: None,
            bank_account_id: None,
        }
    }

    #[must_use]
    pub fn legal_entity(legal_entity_id: LegalEntityId) -> Self {
        Self {
            scope_type: ScopeType::LegalEntity,
            legal_entity_id: Some(legal_entity_id),
            bank_account_id: None,
        }
    }

    #[must_use]
    pub fn bank_account(legal_entity_id: LegalEntityId, bank_account_id: BankAccountId) -> Self {
        Self {
            scope_type: ScopeType::BankAccount,
            legal_entity_id: Some(legal_entity_id),
            bank_account_id: Some(bank_account_id),
        }
    }

    pub fn validate(&self) -> Result<(), ScopeError> {
        match self.scope_type {
            ScopeType::Global => Ok(()),
            ScopeType::LegalEntity => {
                if self.legal_entity_id.is_none() {
                    return Err(ScopeError::Invalid(
                        "legal-entity scope requires legal_entity_id".into(),
                    ));
                }
                Ok(())
            }
            ScopeType::BankAccount => {
                if self.legal_entity_id.is_none() || self.bank_account_id.is_none() {
                    return Err(ScopeError::Invalid(
                        "bank-account scope requires legal_entity_id and bank_account_id".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Whether an entity with this scope applies to the given target.
    #[must_use]
    pub fn applies_to(
        &self,
        legal_entity_id: LegalEntityId,
        bank_account_id: BankAccountId,
    ) -> bool {
        match self.scope_type {
            ScopeType::Global => true,
            ScopeType::LegalEntity => self.legal_entity_id == Some(legal_entity_id),
            ScopeType::BankAccount => {
                self.legal_entity_id == Some(legal_entity_id)
                    && self.bank_account_id == Some(bank_account_id)
            }
        }
    }
}

/// Inclusive date window; a missing side is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_from: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_to: Option<NaiveDate>,
}

impl EffectiveWindow {
    #[must_use]
    pub fn open() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        if let Some(from) = self.effective_from
            && date < from
        {
            return false;
        }
        if let Some(to) = self.effective_to
            && date > to
        {
            return false;
        }
        true
    }
}

/// Governance state of a rule, posting template or difference profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalState {
    Approved,
    PendingApproval,
}

/// Kind of reconciliation difference absorbed by an adjustment journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DifferenceType {
    Fee,
    Fx,
}

/// Direction constraint expressed against the statement amount sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebitCredit {
    In,
    Out,
}

impl DebitCredit {
    /// `In` matches strictly positive amounts, `Out` strictly negative.
    /// A zero amount matches neither.
    #[must_use]
    pub fn matches_amount(self, amount_micros: i64) -> bool {
        match self {
            DebitCredit::In => amount_micros > 0,
            DebitCredit::Out => amount_micros < 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn scope_selector_applies_by_narrowing() {
        let global = ScopeSelector::global();
        let entity = ScopeSelector::legal_entity(7);
        let account = ScopeSelector::bank_account(7, 12);

        assert!(global.applies_to(1, 1));
        assert!(entity.applies_to(7, 99));
        assert!(!entity.applies_to(8, 12));
        assert!(account.applies_to(7, 12));
        assert!(!account.applies_to(7, 13));
    }

    #[test]
    fn scope_selector_validation_requires_anchors() {
        let broken = ScopeSelector {
            scope_type: ScopeType::BankAccount,
            legal_entity_id: Some(7),
            bank_account_id: None,
        };
        assert!(broken.validate().is_err());
        assert!(ScopeSelector::bank_account(7, 12).validate().is_ok());
    }

    #[test]
    fn effective_window_is_inclusive_with_open_sides() {
        let window = EffectiveWindow {
            effective_from: Some(date(2025, 1, 1)),
            effective_to: Some(date(2025, 1, 31)),
        };
        assert!(window.contains(date(2025, 1, 1)));
        assert!(window.contains(date(2025, 1, 31)));
        assert!(!window.contains(date(2024, 12, 31)));
        assert!(!window.contains(date(2025, 2, 1)));
        assert!(EffectiveWindow::open().contains(date(1999, 6, 1)));
    }

    #[test]
    fn debit_credit_requires_nonzero_amount() {
        assert!(DebitCredit::In.matches_amount(1));
        assert!(!DebitCredit::In.matches_amount(0));
        assert!(!DebitCredit::In.matches_amount(-1));
        assert!(DebitCredit::Out.matches_amount(-1));
        assert!(!DebitCredit::Out.matches_amount(0));
    }

    #[test]
    fn scope_rank_orders_narrow_first() {
        assert!(ScopeType::BankAccount.rank() > ScopeType::LegalEntity.rank());
        assert!(ScopeType::LegalEntity.rank() > ScopeType::Global.rank());
    }
}
