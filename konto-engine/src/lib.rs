#![deny(clippy::print_stdout, clippy::print_stderr)]

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

mod activators;
mod audit_bridge;
mod executors;
mod run;
mod sources;
mod verify;

pub use activators::ExceptionOverrideExecutor;
pub use audit_bridge::BufferedAuditBridge;
pub use activators::ManualReturnExecutor;
pub use activators::ProfileActivator;
pub use activators::RuleActivator;
pub use activators::TemplateActivator;
pub use executors::AutoPostTrace;
pub use executors::DifferenceAdjustment;
pub use executors::ExecutorSet;
pub use run::AutoRun;
pub use run::InMemoryRunStore;
pub use run::RunClaim;
pub use run::ReconciliationRunner;
pub use run::RunFilters;
pub use run::RunMode;
pub use run::RunOutcomeRow;
pub use run::RunReport;
pub use run::RunStatus;
pub use run::RunStore;
pub use run::RunSummary;
pub use sources::StoreCandidateSources;
pub use verify::ExceptionAutoResolver;
pub use verify::StoreTargetVerifier;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Statements(#[from] konto_statements::StatementsError),
    #[error(transparent)]
    Payments(#[from] konto_payments::PaymentsError),
    #[error(transparent)]
    Ledger(#[from] konto_ledger::LedgerError),
    #[error(transparent)]
    Rules(#[from] konto_rules::RulesError),
    #[error(transparent)]
    Exceptions(#[from] konto_exceptions::ExceptionsError),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Tunables of the run orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Outcome rows kept on the persisted run payload.
    pub max_payload_rows: usize,
    /// Upper bound on lines scanned per run.
    pub max_scan_limit: usize,
    /// Scan limit when the caller does not pass one.
    pub default_scan_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_payload_rows: 200,
            max_scan_limit: 500,
            default_scan_limit: 100,
        }
    }
}

impl EngineSettings {
    #[must_use]
    pub fn clamp_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_scan_limit)
            .clamp(1, self.max_scan_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn limits_clamp_to_configured_bounds() {
        let settings = EngineSettings::default();
        assert_eq!(settings.clamp_limit(None), 100);
        assert_eq!(settings.clamp_limit(Some(0)), 1);
        assert_eq!(settings.clamp_limit(Some(10_000)), 500);
        assert_eq!(settings.clamp_limit(Some(42)), 42);
    }

    #[test]
    fn settings_deserialize_from_config() {
        let settings: EngineSettings = serde_json::from_str(
            r#"{"max_payload_rows": 100, "max_scan_limit": 250, "default_scan_limit": 50}"#,
        )
        .expect("settings parse");
        assert_eq!(settings.max_payload_rows, 100);
        assert_eq!(settings.clamp_limit(Some(400)), 250);
    }
}
