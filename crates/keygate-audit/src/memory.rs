//! In-memory audit log backend for tests and single-node deployments.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::{AuditEvent, AuditLog, AuditLogError, AuditLogFilter, AuditLogId};

/// In-memory [`AuditLog`]. Events live in insertion order; queries sort by
/// timestamp descending to match the trait contract.
#[derive(Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches(event: &AuditEvent, filter: &AuditLogFilter) -> bool {
    if let Some(actor_id) = &filter.actor_id {
        if event.actor_id != Some(actor_id.0) {
            return false;
        }
    }
    if let Some(org_id) = &filter.organization_id {
        if event.organization_id != Some(org_id.0) {
            return false;
        }
    }
    if let Some(sub_id) = &filter.subscription_id {
        if event.subscription_id != Some(sub_id.0) {
            return false;
        }
    }
    if let Some(license_id) = &filter.license_id {
        if event.license_id != Some(license_id.0) {
            return false;
        }
    }
    if let Some(action) = &filter.action {
        if event.action != *action {
            return false;
        }
    }
    if let Some(result) = &filter.result {
        if event.result != *result {
            return false;
        }
    }
    if let Some(from) = &filter.from {
        if event.timestamp < *from {
            return false;
        }
    }
    if let Some(to) = &filter.to {
        if event.timestamp >= *to {
            return false;
        }
    }
    true
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditLogError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn query(&self, filter: AuditLogFilter) -> Result<Vec<AuditEvent>, AuditLogError> {
        let events = self.events.lock().unwrap();
        let mut out: Vec<_> = events.iter().filter(|e| matches(e, &filter)).cloned().collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let offset = filter.offset.unwrap_or(0) as usize;
        let out: Vec<_> = out.into_iter().skip(offset).collect();
        match filter.limit {
            Some(limit) => Ok(out.into_iter().take(limit as usize).collect()),
            None => Ok(out),
        }
    }

    async fn get(&self, id: AuditLogId) -> Result<AuditEvent, AuditLogError> {
        let events = self.events.lock().unwrap();
        events
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(AuditLogError::NotFound(id))
    }

    async fn count(&self, filter: AuditLogFilter) -> Result<u64, AuditLogError> {
        let events = self.events.lock().unwrap();
        Ok(events.iter().filter(|e| matches(e, &filter)).count() as u64)
    }
}
