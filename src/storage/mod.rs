//! # src/storage/mod.rs
//!
//! Definiert die Abstraktion für die persistente Speicherung von Gutscheinen.
//! Die Kernlogik stellt keine eigenen Abfragen, sondern ruft ausschließlich diese
//! Schnittstelle auf.

pub mod file_storage;
pub mod memory_storage;

use chrono::NaiveDate;
use thiserror::Error;
use uuid::Uuid;

use crate::models::voucher::{TransitionFields, Voucher, VoucherStatus};

/// Ein generischer Fehler-Typ für alle Speicheroperationen.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("A voucher with serial '{0}' already exists.")]
    DuplicateSerial(String),

    #[error("A voucher with id '{0}' already exists.")]
    DuplicateId(Uuid),

    #[error("Recipient '{0}' has already been turned into a voucher.")]
    DuplicateRecipient(Uuid),

    #[error("No serial numbers left for {year_month}.")]
    SequenceExhausted { year_month: String },

    #[error("Data is corrupted or has an invalid format: {0}")]
    InvalidFormat(String),

    #[error("Underlying I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage lock was poisoned by a panicking writer.")]
    LockPoisoned,

    #[error("An unexpected error occurred: {0}")]
    Generic(String),
}

impl StorageError {
    /// Vorübergehende Fehler, bei denen ein erneuter Versuch sinnvoll ist.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Io(_) | StorageError::DuplicateSerial(_))
    }
}

/// Die Schnittstelle zum Gutschein-Speicher.
///
/// Alle Methoden nehmen `&self`: Implementierungen werden von mehreren Threads
/// geteilt und sind selbst für ihre Synchronisation verantwortlich.
pub trait VoucherStore: Send + Sync {
    fn find_by_serial(&self, serial: &str) -> Result<Option<Voucher>, StorageError>;

    fn find_by_id(&self, id: &Uuid) -> Result<Option<Voucher>, StorageError>;

    /// Fügt einen neuen Gutschein ein. Seriennummern sind eindeutig, und aus einem
    /// Empfänger (`recipient_id`) entsteht höchstens ein Gutschein.
    fn insert(&self, voucher: Voucher) -> Result<(), StorageError>;

    /// Bedingte Aktualisierung: wendet `fields` nur an, wenn der gespeicherte Status
    /// noch `expected` ist, in einem einzigen atomaren Schritt.
    ///
    /// `Ok(false)` bedeutet, dass der Status nicht passte (verlorenes Rennen) oder
    /// der Datensatz nicht existiert.
    fn atomic_transition(
        &self,
        id: &Uuid,
        expected: VoucherStatus,
        fields: &TransitionFields,
    ) -> Result<bool, StorageError>;

    /// Bedingtes Löschen, nur wenn der gespeicherte Status noch `expected` ist.
    fn delete_if_status(&self, id: &Uuid, expected: VoucherStatus) -> Result<bool, StorageError>;

    /// Reserviert atomar einen zusammenhängenden Block von `count` Laufnummern für den
    /// Monat von `issue_date` und gibt die erste Nummer zurück.
    fn reserve_sequence_block(&self, issue_date: NaiveDate, count: u32) -> Result<u32, StorageError>;
}
