//! # src/error.rs
//!
//! Definiert den zentralen Fehlertyp für die gesamte voucher_engine-Bibliothek.
//! Verwendet `thiserror` zur einfachen Erstellung von aussagekräftigen Fehlern
//! und zur automatischen Konvertierung von untergeordneten Fehlertypen.

use chrono::NaiveDate;
use thiserror::Error;

use crate::config::ConfigError;
use crate::models::voucher::VoucherStatus;
use crate::services::lifecycle::Operation;
use crate::services::payload_signer::PayloadError;
use crate::services::pii_cipher::CipherError;
use crate::services::serial_number::SerialError;
use crate::storage::StorageError;

/// Der zentrale Fehlertyp für alle Operationen der `voucher_engine`-Bibliothek.
///
/// Geschäftsregel-Verletzungen (`AlreadyUsed`, `InvalidStateTransition`, …) sind
/// endgültig. `ConcurrencyConflict` bedeutet dagegen nur, dass ein paralleler
/// Schreiber gewonnen hat; siehe `is_retryable`.
#[derive(Error, Debug)]
pub enum VoucherEngineError {
    /// Fehlerhafte Seriennummer oder Prüfsumme.
    #[error("Validation error: {0}")]
    Serial(#[from] SerialError),

    /// Fehlerhaft aufgebauter Payload.
    #[error("Validation error: {0}")]
    Payload(PayloadError),

    #[error("Payload signature is invalid.")]
    InvalidSignature,

    #[error("Stale payload: issued on {payload_date}, but the voucher was issued on {recorded_date}.")]
    StalePayload {
        payload_date: NaiveDate,
        recorded_date: NaiveDate,
    },

    #[error("Voucher '{serial}' has already been used.")]
    AlreadyUsed { serial: String },

    #[error("Voucher '{serial}' has been recalled.")]
    AlreadyRecalled { serial: String },

    #[error("Voucher '{serial}' has been disposed.")]
    AlreadyDisposed { serial: String },

    #[error("Operation '{operation}' is not allowed for a voucher in status '{status}'.")]
    InvalidStateTransition {
        operation: Operation,
        status: VoucherStatus,
    },

    #[error("Voucher '{0}' not found.")]
    NotFound(String),

    /// Ein paralleler Schreiber hat den Status zwischen Lesen und bedingtem Schreiben geändert.
    #[error("Concurrent update on voucher '{serial}', the operation may be retried.")]
    ConcurrencyConflict { serial: String },

    #[error("Decryption error: {0}")]
    Decryption(#[from] CipherError),

    #[error("Recipient '{0}' has already been consumed.")]
    RecipientConsumed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<PayloadError> for VoucherEngineError {
    fn from(err: PayloadError) -> Self {
        match err {
            PayloadError::InvalidSignature => VoucherEngineError::InvalidSignature,
            PayloadError::StalePayload { payload_date, recorded_date } => {
                VoucherEngineError::StalePayload { payload_date, recorded_date }
            }
            other => VoucherEngineError::Payload(other),
        }
    }
}

impl VoucherEngineError {
    /// Stabiler, maschinenlesbarer Fehlercode für Aufrufer und Audit-Details.
    pub fn code(&self) -> &'static str {
        match self {
            VoucherEngineError::Serial(_) | VoucherEngineError::Payload(_) => "VALIDATION_ERROR",
            VoucherEngineError::InvalidSignature => "INVALID_SIGNATURE",
            VoucherEngineError::StalePayload { .. } => "STALE_PAYLOAD",
            VoucherEngineError::AlreadyUsed { .. } => "ALREADY_USED",
            VoucherEngineError::AlreadyRecalled { .. } => "ALREADY_RECALLED",
            VoucherEngineError::AlreadyDisposed { .. } => "ALREADY_DISPOSED",
            VoucherEngineError::InvalidStateTransition { .. } => "INVALID_STATE",
            VoucherEngineError::NotFound(_) => "NOT_FOUND",
            VoucherEngineError::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            VoucherEngineError::Decryption(_) => "DECRYPTION_ERROR",
            VoucherEngineError::RecipientConsumed(_) => "RECIPIENT_CONSUMED",
            VoucherEngineError::Storage(_) => "STORAGE_ERROR",
            VoucherEngineError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// `true`, wenn ein erneuter Versuch derselben Operation sinnvoll ist.
    pub fn is_retryable(&self) -> bool {
        match self {
            VoucherEngineError::ConcurrencyConflict { .. } => true,
            VoucherEngineError::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}
