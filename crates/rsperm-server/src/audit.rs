//! Audit sink that writes decisions to the log.

use async_trait::async_trait;
use tracing::info;

use rsperm_domain::error::DomainResult;
use rsperm_domain::resolver::{AuditRecord, AuditSink};

/// Emits one `info` event per decision under the `rsperm::audit` target, so
/// a subscriber can route the audit trail separately from service logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> DomainResult<()> {
        info!(
            target: "rsperm::audit",
            user_id = %record.user_id,
            action = %record.action,
            resource = %record.resource,
            tenant_id = record.tenant_id.as_deref().unwrap_or(""),
            entity_id = record.entity_id.as_deref().unwrap_or(""),
            resource_id = record.resource_id.as_deref().unwrap_or(""),
            granted = record.decision.is_granted(),
            reason = record.decision.reason(),
            cached = record.decision.cache_hit,
            "decision"
        );
        Ok(())
    }
}
