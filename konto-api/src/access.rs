use async_trait::async_trait;
use konto_common::TenantId;
use konto_common::UserId;

use crate::error::ApiError;
use crate::error::ApiResult;

/// Host-provided row-level access check; throws 403 on denial.
#[async_trait]
pub trait ScopeGuard: Send + Sync {
    async fn assert_scope_access(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        scope_kind: &str,
        scope_id: i64,
    ) -> ApiResult<()>;
}

/// Host-provided permission lookup for approver checks.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn load_permission_codes(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> ApiResult<Vec<String>>;
}

/// Development/test collaborator that lets everything through.
#[derive(Default)]
pub struct AllowAllAccess;

#[async_trait]
impl ScopeGuard for AllowAllAccess {
    async fn assert_scope_access(
        &self,
        _tenant_id: TenantId,
        _user_id: UserId,
        _scope_kind: &str,
        _scope_id: i64,
    ) -> ApiResult<()> {
        Ok(())
    }
}

#[async_trait]
impl PermissionChecker for AllowAllAccess {
    async fn load_permission_codes(
        &self,
        _tenant_id: TenantId,
        _user_id: UserId,
    ) -> ApiResult<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Denies every legal-entity outside an allow list; used by tests to
/// exercise the 403 paths.
pub struct StaticScopeGuard {
    pub allowed_legal_entities: Vec<i64>,
}

#[async_trait]
impl ScopeGuard for StaticScopeGuard {
    async fn assert_scope_access(
        &self,
        _tenant_id: TenantId,
        _user_id: UserId,
        scope_kind: &str,
        scope_id: i64,
    ) -> ApiResult<()> {
        if scope_kind == "legal_entity" && !self.allowed_legal_entities.contains(&scope_id) {
            return Err(ApiError::forbidden(format!(
                "no access to legal entity {scope_id}"
            )));
        }
        Ok(())
    }
}
