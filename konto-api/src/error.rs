use serde::Serialize;
use thiserror::Error;

/// HTTP-shaped error: status code plus the `{ "error": message }` body.
#[derive(Debug, Error)]
#[error("{status}: {message}")]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

impl ApiError {
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: 403,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: 404,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: 409,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: 500,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<konto_statements::StatementsError> for ApiError {
    fn from(err: konto_statements::StatementsError) -> Self {
        use konto_statements::StatementsError::*;
        match err {
            NotFound(message) => Self::not_found(message),
            Validation(message) => Self::bad_request(message),
            Internal(message) => Self::internal(message),
        }
    }
}

impl From<konto_payments::PaymentsError> for ApiError {
    fn from(err: konto_payments::PaymentsError) -> Self {
        use konto_payments::PaymentsError::*;
        match err {
            NotFound(message) => Self::not_found(message),
            Conflict(message) => Self::conflict(message),
            Validation(message) => Self::bad_request(message),
            Internal(message) => Self::internal(message),
        }
    }
}

impl From<konto_ledger::LedgerError> for ApiError {
    fn from(err: konto_ledger::LedgerError) -> Self {
        use konto_ledger::LedgerError::*;
        match err {
            NotFound(message) => Self::not_found(message),
            Conflict(message) => Self::conflict(message),
            Validation(message) => Self::bad_request(message),
            Internal(message) => Self::internal(message),
        }
    }
}

impl From<konto_rules::RulesError> for ApiError {
    fn from(err: konto_rules::RulesError) -> Self {
        use konto_rules::RulesError::*;
        match err {
            NotFound(message) => Self::not_found(message),
            Conflict(message) => Self::conflict(message),
            Validation(message) => Self::bad_request(message),
            Storage(message) => Self::internal(message),
        }
    }
}

impl From<konto_exceptions::ExceptionsError> for ApiError {
    fn from(err: konto_exceptions::ExceptionsError) -> Self {
        use konto_exceptions::ExceptionsError::*;
        match err {
            NotFound(message) => Self::not_found(message),
            Conflict(message) => Self::conflict(message),
            Validation(message) => Self::bad_request(message),
            InvalidTransition(message) => Self::bad_request(message),
        }
    }
}

impl From<konto_approvals::ApprovalsError> for ApiError {
    fn from(err: konto_approvals::ApprovalsError) -> Self {
        use konto_approvals::ApprovalsError::*;
        match err {
            NotFound(message) => Self::not_found(message),
            Conflict(message) => Self::conflict(message),
            Validation(message) => Self::bad_request(message),
            MakerChecker(message) => Self::forbidden(message),
            NoExecutor(message) => Self::conflict(format!("unsupported dispatch: {message}")),
            Internal(message) => Self::internal(message),
        }
    }
}

impl From<konto_engine::EngineError> for ApiError {
    fn from(err: konto_engine::EngineError) -> Self {
        use konto_engine::EngineError::*;
        match err {
            NotFound(message) => Self::not_found(message),
            Statements(inner) => inner.into(),
            Payments(inner) => inner.into(),
            Ledger(inner) => inner.into(),
            Rules(inner) => inner.into(),
            Exceptions(inner) => inner.into(),
            Validation(message) => Self::bad_request(message),
            Conflict(message) => Self::conflict(message),
        }
    }
}

impl From<konto_audit::AuditError> for ApiError {
    fn from(err: konto_audit::AuditError) -> Self {
        use konto_audit::AuditError::*;
        match err {
            Validation(message) => Self::bad_request(message),
            Storage(message) | Corrupted(message) => Self::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn statuses_map_per_error_taxonomy() {
        let not_found: ApiError =
            konto_statements::StatementsError::NotFound("line 1".into()).into();
        assert_eq!(not_found.status, 404);

        let invalid: ApiError =
            konto_exceptions::ExceptionsError::InvalidTransition("resolved".into()).into();
        assert_eq!(invalid.status, 400);

        let maker_checker: ApiError =
            konto_approvals::ApprovalsError::MakerChecker("self approval".into()).into();
        assert_eq!(maker_checker.status, 403);

        let dispatch: ApiError =
            konto_approvals::ApprovalsError::NoExecutor("BANK/X/Y".into()).into();
        assert_eq!(dispatch.status, 409);

        assert_eq!(dispatch.body().error, "unsupported dispatch: BANK/X/Y");
    }
}
