//! # src/storage/memory_storage.rs
//!
//! Ein `VoucherStore` im Arbeitsspeicher. Ein einzelner Mutex schützt Daten,
//! Serien-Index und Laufnummern-Cursor; jede Trait-Methode ist damit atomar.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{StorageError, VoucherStore};
use crate::models::voucher::{TransitionFields, Voucher, VoucherStatus};
use crate::services::serial_number::{self, MAX_SEQUENCE};

/// Der vollständige Speicherinhalt, auch als Datei-Format von `FileStore` verwendet.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub(crate) struct StoreState {
    vouchers: HashMap<Uuid, Voucher>,
    #[serde(skip)]
    serial_index: HashMap<String, Uuid>,
    /// Nächste freie Laufnummer je `YYYYMM`.
    sequence_cursors: BTreeMap<String, u32>,
    /// Empfänger, aus denen bereits ein Gutschein erzeugt wurde. Bleibt auch nach
    /// dem Löschen des Gutscheins bestehen.
    #[serde(default)]
    consumed_recipients: BTreeSet<Uuid>,
}

impl StoreState {
    /// Baut den Serien-Index nach dem Laden neu auf.
    pub(crate) fn reindex(&mut self) -> Result<(), StorageError> {
        self.serial_index.clear();
        for (id, voucher) in &self.vouchers {
            if self.serial_index.insert(voucher.serial_no().to_string(), *id).is_some() {
                return Err(StorageError::InvalidFormat(format!(
                    "duplicate serial '{}' in stored data",
                    voucher.serial_no()
                )));
            }
            if let Some(recipient_id) = voucher.recipient_id() {
                self.consumed_recipients.insert(recipient_id);
            }
        }
        Ok(())
    }

    pub(crate) fn find_by_serial(&self, serial: &str) -> Option<Voucher> {
        self.serial_index.get(serial).and_then(|id| self.vouchers.get(id)).cloned()
    }

    pub(crate) fn find_by_id(&self, id: &Uuid) -> Option<Voucher> {
        self.vouchers.get(id).cloned()
    }

    pub(crate) fn insert(&mut self, voucher: Voucher) -> Result<(), StorageError> {
        if self.serial_index.contains_key(voucher.serial_no()) {
            return Err(StorageError::DuplicateSerial(voucher.serial_no().to_string()));
        }
        if self.vouchers.contains_key(&voucher.id()) {
            return Err(StorageError::DuplicateId(voucher.id()));
        }
        if let Some(recipient_id) = voucher.recipient_id() {
            if !self.consumed_recipients.insert(recipient_id) {
                return Err(StorageError::DuplicateRecipient(recipient_id));
            }
        }
        self.serial_index.insert(voucher.serial_no().to_string(), voucher.id());
        self.vouchers.insert(voucher.id(), voucher);
        Ok(())
    }

    pub(crate) fn atomic_transition(
        &mut self,
        id: &Uuid,
        expected: VoucherStatus,
        fields: &TransitionFields,
    ) -> bool {
        match self.vouchers.get_mut(id) {
            Some(voucher) if voucher.status() == expected => {
                fields.apply_to(voucher);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn delete_if_status(&mut self, id: &Uuid, expected: VoucherStatus) -> bool {
        let matches = self.vouchers.get(id).is_some_and(|v| v.status() == expected);
        if !matches {
            return false;
        }
        if let Some(removed) = self.vouchers.remove(id) {
            self.serial_index.remove(removed.serial_no());
        }
        true
    }

    pub(crate) fn reserve_sequence_block(
        &mut self,
        issue_date: NaiveDate,
        count: u32,
    ) -> Result<u32, StorageError> {
        let year_month = serial_number::year_month_prefix(issue_date);
        let from_existing = serial_number::next_sequence(
            self.serial_index.keys().map(String::as_str),
            issue_date,
        );
        let cursor = self.sequence_cursors.get(&year_month).copied().unwrap_or(1);
        let first = cursor.max(from_existing);

        let last = first.checked_add(count.saturating_sub(1)).filter(|last| *last <= MAX_SEQUENCE);
        if count == 0 || last.is_none() {
            return Err(StorageError::SequenceExhausted { year_month });
        }
        self.sequence_cursors.insert(year_month, first + count);
        Ok(first)
    }
}

/// Ein thread-sicherer In-Memory-Speicher.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StorageError> {
        self.state.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Anzahl gespeicherter Gutscheine.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.vouchers.len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

impl VoucherStore for MemoryStore {
    fn find_by_serial(&self, serial: &str) -> Result<Option<Voucher>, StorageError> {
        Ok(self.lock()?.find_by_serial(serial))
    }

    fn find_by_id(&self, id: &Uuid) -> Result<Option<Voucher>, StorageError> {
        Ok(self.lock()?.find_by_id(id))
    }

    fn insert(&self, voucher: Voucher) -> Result<(), StorageError> {
        self.lock()?.insert(voucher)
    }

    fn atomic_transition(
        &self,
        id: &Uuid,
        expected: VoucherStatus,
        fields: &TransitionFields,
    ) -> Result<bool, StorageError> {
        Ok(self.lock()?.atomic_transition(id, expected, fields))
    }

    fn delete_if_status(&self, id: &Uuid, expected: VoucherStatus) -> Result<bool, StorageError> {
        Ok(self.lock()?.delete_if_status(id, expected))
    }

    fn reserve_sequence_block(&self, issue_date: NaiveDate, count: u32) -> Result<u32, StorageError> {
        self.lock()?.reserve_sequence_block(issue_date, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    use crate::models::voucher::PiiFields;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn voucher(sequence: u32) -> Voucher {
        let serial = serial_number::generate(sequence, date(2024, 12, 1)).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 12, 1, 9, 0, 0).unwrap();
        Voucher::new_registered(serial, Decimal::new(1000, 0), PiiFields::default(), None, at)
    }

    #[test]
    fn test_insert_rejects_duplicate_serial() {
        let store = MemoryStore::new();
        store.insert(voucher(1)).unwrap();
        let err = store.insert(voucher(1)).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateSerial(_)));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_atomic_transition_checks_expected_status() {
        let store = MemoryStore::new();
        let v = voucher(1);
        let id = v.id();
        store.insert(v).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 12, 2, 9, 0, 0).unwrap();

        assert!(!store.atomic_transition(&id, VoucherStatus::Issued, &TransitionFields::used(at, "s")).unwrap());
        assert!(store.atomic_transition(&id, VoucherStatus::Registered, &TransitionFields::issued(at)).unwrap());
        assert_eq!(store.find_by_id(&id).unwrap().unwrap().status(), VoucherStatus::Issued);
        assert!(!store.atomic_transition(&Uuid::new_v4(), VoucherStatus::Issued, &TransitionFields::issued(at)).unwrap());
    }

    #[test]
    fn test_sequence_blocks_are_contiguous_and_disjoint() {
        let store = MemoryStore::new();
        store.insert(voucher(7)).unwrap();

        let first = store.reserve_sequence_block(date(2024, 12, 15), 10).unwrap();
        assert_eq!(first, 8);
        let second = store.reserve_sequence_block(date(2024, 12, 15), 5).unwrap();
        assert_eq!(second, 18);
        // Anderer Monat beginnt bei 1
        assert_eq!(store.reserve_sequence_block(date(2025, 1, 2), 1).unwrap(), 1);
    }

    #[test]
    fn test_sequence_block_cannot_exceed_maximum() {
        let store = MemoryStore::new();
        let err = store.reserve_sequence_block(date(2024, 12, 1), MAX_SEQUENCE + 1).unwrap_err();
        assert!(matches!(err, StorageError::SequenceExhausted { .. }));
        assert_eq!(store.reserve_sequence_block(date(2024, 12, 1), MAX_SEQUENCE).unwrap(), 1);
        assert!(store.reserve_sequence_block(date(2024, 12, 1), 1).is_err());
    }

    #[test]
    fn test_recipient_is_consumed_once_even_after_delete() {
        let store = MemoryStore::new();
        let recipient = Uuid::new_v4();
        let at = Utc.with_ymd_and_hms(2024, 12, 1, 9, 0, 0).unwrap();
        let minted = |sequence| {
            let serial = serial_number::generate(sequence, date(2024, 12, 1)).unwrap();
            Voucher::new_registered(serial, Decimal::new(1000, 0), PiiFields::default(), Some(recipient), at)
        };

        let first = minted(1);
        let first_id = first.id();
        store.insert(first).unwrap();
        assert!(matches!(store.insert(minted(2)), Err(StorageError::DuplicateRecipient(id)) if id == recipient));
        assert!(store.find_by_serial(&serial_number::generate(2, date(2024, 12, 1)).unwrap()).unwrap().is_none());

        assert!(store.delete_if_status(&first_id, VoucherStatus::Registered).unwrap());
        assert!(matches!(store.insert(minted(3)), Err(StorageError::DuplicateRecipient(_))));
    }

    #[test]
    fn test_delete_if_status_frees_serial() {
        let store = MemoryStore::new();
        let v = voucher(3);
        let (id, serial) = (v.id(), v.serial_no().to_string());
        store.insert(v).unwrap();

        assert!(!store.delete_if_status(&id, VoucherStatus::Issued).unwrap());
        assert!(store.delete_if_status(&id, VoucherStatus::Registered).unwrap());
        assert!(store.find_by_serial(&serial).unwrap().is_none());
        assert!(store.is_empty().unwrap());
    }
}
