//! # voucher_engine
//!
//! Die Kernlogik für papier- bzw. QR-basierte Gutscheine mit festem Betrag:
//! Seriennummern mit Prüfsumme, signierte Redemption-Payloads, der
//! Lebenszyklus `registered → issued → used/recalled/disposed` mit genau
//! einmaliger Einlösung sowie die Verschlüsselung personenbezogener Felder.

// Deklariert die Hauptmodule der Bibliothek und macht sie öffentlich.
pub mod audit;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;

#[doc(hidden)]
pub mod test_utils;

// Re-exportiert die wichtigsten öffentlichen Typen für eine einfachere Nutzung.
// Anstatt `voucher_engine::models::voucher::Voucher` kann `voucher_engine::Voucher` geschrieben werden.

// Modelle
pub use models::audit::{AuditAction, AuditEvent};
pub use models::recipient::{RecipientStatus, VoucherRecipient};
pub use models::voucher::{PiiFields, Voucher, VoucherStatus};

// Services
pub use services::lifecycle::{
    transition_target, IssueOutcome, LifecycleStateMachine, NewVoucher, Operation, PayloadCheck, Redemption,
    VoucherRef,
};
pub use services::payload_signer::{DateDiscrepancy, PayloadKind, PayloadSigner, VerifiedPayload};
pub use services::pii_cipher::{mask_for_display, MaskKind, PiiCipher};
pub use services::serial_number;
pub use services::utils::{Clock, FixedClock, SystemClock};

// Infrastruktur
pub use audit::{AuditRecorder, MemoryAuditRecorder, TracingAuditRecorder};
pub use config::EngineConfig;
pub use error::VoucherEngineError;
pub use storage::{file_storage::FileStore, memory_storage::MemoryStore, StorageError, VoucherStore};
