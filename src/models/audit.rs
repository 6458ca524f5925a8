//! # src/models/audit.rs
//!
//! Das Audit-Ereignis, das jeder Lebenszyklus-Übergang erzeugt, auch ein abgelehnter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::voucher::VoucherStatus;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Register,
    Issue,
    Reissue,
    Use,
    Recall,
    Dispose,
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Register => "voucher.register",
            AuditAction::Issue => "voucher.issue",
            AuditAction::Reissue => "voucher.reissue",
            AuditAction::Use => "voucher.use",
            AuditAction::Recall => "voucher.recall",
            AuditAction::Dispose => "voucher.dispose",
            AuditAction::Delete => "voucher.delete",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ein unveränderliches Audit-Ereignis.
///
/// `target_id` ist die Gutschein-ID, oder die Seriennummer, wenn der Gutschein
/// (noch) nicht aufgelöst werden konnte.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub actor_id: String,
    pub target_id: String,
    pub before_status: Option<VoucherStatus>,
    pub after_status: Option<VoucherStatus>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}
