//! # src/storage/file_storage.rs
//!
//! Eine Implementierung des `VoucherStore`-Traits, die den gesamten Bestand als
//! JSON-Datei ablegt. Jede schreibende Operation wird vollständig auf eine Kopie
//! angewendet, über eine temporäre Datei mit atomarem Umbenennen gespeichert und
//! erst danach im Speicher übernommen.
//!
//! Die Datei ist nicht für mehrere Prozesse gleichzeitig gedacht; die Atomarität
//! von `atomic_transition` gilt innerhalb eines Prozesses.

use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::memory_storage::StoreState;
use super::{StorageError, VoucherStore};
use crate::models::voucher::{TransitionFields, Voucher, VoucherStatus};

const TEMP_SUFFIX: &str = "tmp";

pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Öffnet den Speicher unter `path`. Existiert die Datei nicht, wird mit einem
    /// leeren Bestand begonnen; die Datei entsteht beim ersten Schreiben.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let state = if path.exists() {
            let bytes = fs::read(&path)?;
            let mut state: StoreState = serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::InvalidFormat(e.to_string()))?;
            state.reindex()?;
            state
        } else {
            StoreState::default()
        };
        debug!(path = %path.display(), "Opened voucher file store");
        Ok(FileStore { path, state: Mutex::new(state) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StorageError> {
        self.state.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn persist(&self, state: &StoreState) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| StorageError::InvalidFormat(e.to_string()))?;
        let temp_path = self.path.with_extension(TEMP_SUFFIX);
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    /// Führt `op` auf einer Kopie aus und übernimmt sie nur, wenn `op` eine Änderung
    /// meldet und das Speichern gelingt.
    fn write<T>(
        &self,
        op: impl FnOnce(&mut StoreState) -> Result<(T, bool), StorageError>,
    ) -> Result<T, StorageError> {
        let mut guard = self.lock()?;
        let mut next = guard.clone();
        let (result, changed) = op(&mut next)?;
        if changed {
            self.persist(&next)?;
            *guard = next;
        }
        Ok(result)
    }
}

impl VoucherStore for FileStore {
    fn find_by_serial(&self, serial: &str) -> Result<Option<Voucher>, StorageError> {
        Ok(self.lock()?.find_by_serial(serial))
    }

    fn find_by_id(&self, id: &Uuid) -> Result<Option<Voucher>, StorageError> {
        Ok(self.lock()?.find_by_id(id))
    }

    fn insert(&self, voucher: Voucher) -> Result<(), StorageError> {
        self.write(|state| state.insert(voucher).map(|()| ((), true)))
    }

    fn atomic_transition(
        &self,
        id: &Uuid,
        expected: VoucherStatus,
        fields: &TransitionFields,
    ) -> Result<bool, StorageError> {
        self.write(|state| {
            let applied = state.atomic_transition(id, expected, fields);
            Ok((applied, applied))
        })
    }

    fn delete_if_status(&self, id: &Uuid, expected: VoucherStatus) -> Result<bool, StorageError> {
        self.write(|state| {
            let deleted = state.delete_if_status(id, expected);
            Ok((deleted, deleted))
        })
    }

    fn reserve_sequence_block(&self, issue_date: NaiveDate, count: u32) -> Result<u32, StorageError> {
        self.write(|state| state.reserve_sequence_block(issue_date, count).map(|first| (first, true)))
    }
}
