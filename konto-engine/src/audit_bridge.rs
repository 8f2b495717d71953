use std::sync::Mutex;

use konto_audit::AppendRequest;
use konto_audit::AuditResult;
use konto_audit::AuditTrail;
use konto_statements::AuditEvent;
use konto_statements::StatementAuditHook;

/// Bridges the matching machine's synchronous audit hook into the
/// tenant audit trail. Events are buffered at record time and drained
/// with [`BufferedAuditBridge::flush`] at a run boundary, keeping the
/// hook non-blocking.
#[derive(Default)]
pub struct BufferedAuditBridge {
    pending: Mutex<Vec<AppendRequest>>,
}

impl BufferedAuditBridge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    /// Appends every buffered event to the trail, in order. Returns the
    /// number of records written.
    pub async fn flush(&self, trail: &dyn AuditTrail) -> AuditResult<usize> {
        let drained: Vec<AppendRequest> = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| konto_audit::AuditError::Storage("audit buffer poisoned".into()))?;
            pending.drain(..).collect()
        };
        let count = drained.len();
        for request in drained {
            trail.append(request).await?;
        }
        Ok(count)
    }
}

impl StatementAuditHook for BufferedAuditBridge {
    fn record(&self, event: &AuditEvent) {
        let request = AppendRequest {
            tenant_id: event.tenant_id,
            entity: format!("statement_line:{}", event.statement_line_id),
            actor: event.actor.clone(),
            action: event.action.as_str().to_string(),
            metadata: event.metadata.clone(),
        };
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(request);
        }
    }
}
