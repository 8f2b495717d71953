#![deny(clippy::print_stdout, clippy::print_stderr)]

mod access;
mod error;
mod facade;
mod types;

pub use access::AllowAllAccess;
pub use access::PermissionChecker;
pub use access::ScopeGuard;
pub use access::StaticScopeGuard;
pub use error::ApiError;
pub use error::ApiResult;
pub use error::ErrorBody;
pub use facade::ReconApi;
pub use facade::ReconApiDeps;
pub use types::AutoRunParams;
pub use types::AutoRunResponse;
pub use types::DecisionParams;
pub use types::GatedWrite;
pub use types::ManualMatchParams;
pub use types::ManualReturnParams;
pub use types::ManualReturnResponse;
pub use types::RuleDraft;
pub use types::RulePatch;
pub use types::StatementLineView;
pub use types::MAX_RUN_LIMIT;
