#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use konto_common::TenantId;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("corrupted chain: {0}")]
    Corrupted(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub tenant_id: TenantId,
    /// Entity key, e.g. `statement_line:42` or `payment_batch:7`.
    pub entity: String,
    pub actor: String,
    pub action: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub tenant_id: TenantId,
    pub entity: String,
    pub actor: String,
    pub action: String,
    pub occurred_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub previous_hash: String,
    pub hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub entity: Option<String>,
    pub action: Option<String>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait AuditTrail: Send + Sync {
    async fn append(&self, request: AppendRequest) -> AuditResult<AuditRecord>;

    /// Records for one tenant, in insertion order. Verifies the tenant's
    /// hash chain before returning.
    async fn records(&self, tenant_id: TenantId, filter: AuditFilter)
    -> AuditResult<Vec<AuditRecord>>;
}

/// Tenant-partitioned audit trail. Each tenant owns an independent hash
/// chain so one tenant's history can be exported and verified alone.
#[derive(Default)]
pub struct InMemoryAuditTrail {
    chains: RwLock<HashMap<TenantId, Vec<AuditRecord>>>,
}

impl InMemoryAuditTrail {
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn compute_hash(
        previous: &str,
        entity: &str,
        action: &str,
        occurred_at: DateTime<Utc>,
        metadata: &serde_json::Value,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(previous.as_bytes());
        hasher.update(entity.as_bytes());
        hasher.update(action.as_bytes());
        let nanos = occurred_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| occurred_at.timestamp_micros() * 1_000);
        hasher.update(nanos.to_be_bytes());
        hasher.update(metadata.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn validate_request(request: &AppendRequest) -> AuditResult<()> {
        if request.tenant_id <= 0 {
            return Err(AuditError::Validation("tenant_id must be positive".into()));
        }
        if request.entity.trim().is_empty() {
            return Err(AuditError::Validation("entity must be provided".into()));
        }
        if request.action.trim().is_empty() {
            return Err(AuditError::Validation("action must be provided".into()));
        }
        if request.actor.trim().is_empty() {
            return Err(AuditError::Validation("actor must be provided".into()));
        }
        Ok(())
    }

    fn verify_chain(records: &[AuditRecord]) -> AuditResult<()> {
        let mut previous = String::from("genesis");
        for record in records {
            if record.previous_hash != previous {
                return Err(AuditError::Corrupted(format!(
                    "unexpected previous hash for {}",
                    record.id
                )));
            }
            let expected = Self::compute_hash(
                &record.previous_hash,
                &record.entity,
                &record.action,
                record.occurred_at,
                &record.metadata,
            );
            if expected != record.hash {
                return Err(AuditError::Corrupted(format!(
                    "hash mismatch for {}",
                    record.id
                )));
            }
            previous = record.hash.clone();
        }
        Ok(())
    }
}

#[async_trait]
impl AuditTrail for InMemoryAuditTrail {
    async fn append(&self, request: AppendRequest) -> AuditResult<AuditRecord> {
        Self::validate_request(&request)?;

        let mut guard = self.chains.write().await;
        let chain = guard.entry(request.tenant_id).or_default();
        let previous_hash = chain
            .last()
            .map(|record| record.hash.clone())
            .unwrap_or_else(|| "genesis".into());

        let occurred_at = Utc::now();
        let hash = Self::compute_hash(
            &previous_hash,
            &request.entity,
            &request.action,
            occurred_at,
            &request.metadata,
        );

        let record = AuditRecord {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id,
            entity: request.entity,
            actor: request.actor,
            action: request.action,
            occurred_at,
            metadata: request.metadata,
            previous_hash,
            hash,
        };

        chain.push(record.clone());
        Ok(record)
    }

    async fn records(
        &self,
        tenant_id: TenantId,
        filter: AuditFilter,
    ) -> AuditResult<Vec<AuditRecord>> {
        let guard = self.chains.read().await;
        let chain = guard.get(&tenant_id).map(Vec::as_slice).unwrap_or(&[]);
        Self::verify_chain(chain)?;
        let mut filtered: Vec<AuditRecord> = chain.to_vec();

        if let Some(entity) = filter.entity {
            filtered.retain(|record| record.entity == entity);
        }
        if let Some(action) = filter.action {
            filtered.retain(|record| record.action == action);
        }
        if let Some(limit) = filter.limit
            && filtered.len() > limit
        {
            filtered.truncate(limit);
        }

        Ok(filtered)
    }
}
