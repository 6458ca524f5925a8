//! # src/audit.rs
//!
//! Die Schnittstelle zum externen Audit-Protokoll und zwei Implementierungen:
//! eine, die Ereignisse als strukturierte `tracing`-Einträge ausgibt, und eine,
//! die sie im Speicher sammelt.
//!
//! Das Aufzeichnen ist "fire and forget": ein Fehler hier bricht niemals die
//! eigentliche Geschäftsoperation ab.

use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::audit::AuditEvent;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),
}

pub trait AuditRecorder: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Schreibt jedes Ereignis unter dem Target `voucher_engine::audit` ins Log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditRecorder;

impl AuditRecorder for TracingAuditRecorder {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let before = event.before_status.map(|s| s.as_str()).unwrap_or("-");
        let after = event.after_status.map(|s| s.as_str()).unwrap_or("-");
        if event.success {
            info!(
                target: "voucher_engine::audit",
                action = event.action.as_str(),
                actor = %event.actor_id,
                target_id = %event.target_id,
                before,
                after,
                details = %event.details,
                "audit"
            );
        } else {
            warn!(
                target: "voucher_engine::audit",
                action = event.action.as_str(),
                actor = %event.actor_id,
                target_id = %event.target_id,
                before,
                after,
                details = %event.details,
                "audit: rejected"
            );
        }
        Ok(())
    }
}

/// Sammelt Ereignisse im Speicher, z.B. für Tests oder eine nachgelagerte Übertragung.
#[derive(Debug, Default)]
pub struct MemoryAuditRecorder {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Eine Kopie aller bisher aufgezeichneten Ereignisse.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }
}

impl AuditRecorder for MemoryAuditRecorder {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events
            .lock()
            .map_err(|_| AuditError::Unavailable("audit buffer lock poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}
