//! # src/services/lifecycle.rs
//!
//! Die Zustandsmaschine des Gutschein-Lebenszyklus.
//!
//! ```text
//! registered ──issue──▶ issued ──use──────▶ used      (terminal)
//!                        │  ▲ └──recall───▶ recalled
//!                        │  └─issue (re-issue)   │
//!                        └──dispose──▶ disposed ◀┘ (terminal)
//! ```
//!
//! Alle Statusänderungen laufen über `TRANSITIONS` und werden im Speicher als
//! bedingte Aktualisierung (`atomic_transition`) ausgeführt. Es gibt kein
//! Lesen-dann-Schreiben: wer das bedingte Schreiben verliert, erhält den Fehler,
//! der zum dann gespeicherten Status passt. Jeder Versuch, auch ein abgelehnter,
//! erzeugt genau ein Audit-Ereignis.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditRecorder;
use crate::config::EngineConfig;
use crate::error::VoucherEngineError;
use crate::models::audit::{AuditAction, AuditEvent};
use crate::models::recipient::VoucherRecipient;
use crate::models::voucher::{PiiFields, TransitionFields, Voucher, VoucherStatus};
use crate::services::payload_signer::{
    check_freshness, DateDiscrepancy, PayloadKind, PayloadSigner, VerifiedPayload,
};
use crate::services::serial_number::{self, SerialError};
use crate::services::utils::{local_date, Clock, SystemClock};
use crate::storage::{StorageError, VoucherStore};

/// Wie oft eine neue Seriennummer versucht wird, wenn das Einfügen an der
/// Eindeutigkeit scheitert.
const MAX_ALLOCATION_ATTEMPTS: u32 = 3;
const UNPARSED_TARGET: &str = "<unparsed-payload>";

/// Die Operationen der Zustandsmaschine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Issue,
    Use,
    Recall,
    Dispose,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 5] = [
        Operation::Issue,
        Operation::Use,
        Operation::Recall,
        Operation::Dispose,
        Operation::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Issue => "issue",
            Operation::Use => "use",
            Operation::Recall => "recall",
            Operation::Dispose => "dispose",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Die vollständige Übergangstabelle `(Operation, von, nach)`.
///
/// `Delete` behält den Status bei, weil der Datensatz danach nicht mehr existiert.
const TRANSITIONS: &[(Operation, VoucherStatus, VoucherStatus)] = &[
    (Operation::Issue, VoucherStatus::Registered, VoucherStatus::Issued),
    (Operation::Issue, VoucherStatus::Issued, VoucherStatus::Issued),
    (Operation::Use, VoucherStatus::Issued, VoucherStatus::Used),
    (Operation::Recall, VoucherStatus::Issued, VoucherStatus::Recalled),
    (Operation::Dispose, VoucherStatus::Issued, VoucherStatus::Disposed),
    (Operation::Dispose, VoucherStatus::Recalled, VoucherStatus::Disposed),
    (Operation::Delete, VoucherStatus::Registered, VoucherStatus::Registered),
    (Operation::Delete, VoucherStatus::Issued, VoucherStatus::Issued),
    (Operation::Delete, VoucherStatus::Recalled, VoucherStatus::Recalled),
];

/// Der Zielstatus von `operation` aus `from`, oder `None`, wenn der Übergang verboten ist.
pub fn transition_target(operation: Operation, from: VoucherStatus) -> Option<VoucherStatus> {
    TRANSITIONS
        .iter()
        .find(|(op, source, _)| *op == operation && *source == from)
        .map(|(_, _, target)| *target)
}

/// Der Fehler für eine verbotene Operation auf einem Gutschein im gegebenen Zustand.
fn rejection(operation: Operation, voucher: &Voucher) -> VoucherEngineError {
    let serial = voucher.serial_no().to_string();
    match voucher.status() {
        VoucherStatus::Used => VoucherEngineError::AlreadyUsed { serial },
        VoucherStatus::Disposed => VoucherEngineError::AlreadyDisposed { serial },
        VoucherStatus::Recalled => VoucherEngineError::AlreadyRecalled { serial },
        status => VoucherEngineError::InvalidStateTransition { operation, status },
    }
}

/// Verweis auf einen Gutschein über ID oder Seriennummer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoucherRef {
    Id(Uuid),
    Serial(String),
}

impl fmt::Display for VoucherRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoucherRef::Id(id) => write!(f, "{id}"),
            VoucherRef::Serial(serial) => f.write_str(serial),
        }
    }
}

impl From<Uuid> for VoucherRef {
    fn from(id: Uuid) -> Self {
        VoucherRef::Id(id)
    }
}

impl From<&str> for VoucherRef {
    fn from(serial: &str) -> Self {
        VoucherRef::Serial(serial.to_string())
    }
}

impl From<String> for VoucherRef {
    fn from(serial: String) -> Self {
        VoucherRef::Serial(serial)
    }
}

/// Die Daten eines neu zu registrierenden Gutscheins.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVoucher {
    pub amount: Decimal,
    pub pii: PiiFields,
    pub recipient_id: Option<Uuid>,
}

impl NewVoucher {
    pub fn new(amount: Decimal, pii: PiiFields) -> Self {
        NewVoucher { amount, pii, recipient_id: None }
    }
}

/// Ergebnis von `issue`.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueOutcome {
    pub voucher: Voucher,
    /// `true`, wenn der Gutschein bereits ausgegeben war.
    pub reissued: bool,
}

/// Ein geprüfter Payload samt zugehörigem Gutschein, ohne dass eingelöst wurde.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadCheck {
    pub voucher: Voucher,
    pub payload: VerifiedPayload,
    /// Eine am Ausgabetag tolerierte Datumsabweichung.
    pub discrepancy: Option<DateDiscrepancy>,
}

/// Ergebnis einer erfolgreichen Einlösung.
#[derive(Debug, Clone, PartialEq)]
pub struct Redemption {
    pub voucher: Voucher,
    pub payload_kind: PayloadKind,
    pub discrepancy: Option<DateDiscrepancy>,
}

/// Die Lebenszyklus-Zustandsmaschine. Einziger Schreiber von `status`.
pub struct LifecycleStateMachine {
    store: Arc<dyn VoucherStore>,
    audit: Arc<dyn AuditRecorder>,
    signer: PayloadSigner,
    clock: Arc<dyn Clock>,
}

impl LifecycleStateMachine {
    pub fn new(store: Arc<dyn VoucherStore>, audit: Arc<dyn AuditRecorder>, signer: PayloadSigner) -> Self {
        LifecycleStateMachine { store, audit, signer, clock: Arc::new(SystemClock) }
    }

    /// Erzeugt die Zustandsmaschine mit dem Payload-Geheimnis aus `config`.
    pub fn from_config(config: &EngineConfig, store: Arc<dyn VoucherStore>, audit: Arc<dyn AuditRecorder>) -> Self {
        Self::new(store, audit, config.payload_signer())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn signer(&self) -> &PayloadSigner {
        &self.signer
    }

    pub fn find_by_serial(&self, serial: &str) -> Result<Option<Voucher>, VoucherEngineError> {
        Ok(self.store.find_by_serial(serial)?)
    }

    pub fn find_by_id(&self, id: &Uuid) -> Result<Option<Voucher>, VoucherEngineError> {
        Ok(self.store.find_by_id(id)?)
    }

    /// Der aktuelle Redemption-Payload eines ausgegebenen Gutscheins.
    pub fn payload_for(&self, voucher: &Voucher) -> Option<String> {
        voucher
            .issued_at()
            .map(|issued_at| self.signer.make_payload(voucher.serial_no(), &issued_at))
    }

    // --- Registrierung ---

    /// Registriert einen einzelnen Gutschein mit einer neuen Seriennummer.
    pub fn register(
        &self,
        new_voucher: NewVoucher,
        issue_date: NaiveDate,
        actor: &str,
    ) -> Result<Voucher, VoucherEngineError> {
        let mut vouchers = self.register_batch(vec![new_voucher], issue_date, actor)?;
        vouchers
            .pop()
            .ok_or_else(|| StorageError::Generic("batch registration returned no voucher".to_string()).into())
    }

    /// Registriert mehrere Gutscheine. Die Laufnummern werden vorab als
    /// zusammenhängender Block reserviert, damit parallele Batches nicht kollidieren.
    ///
    /// Der Batch ist nicht transaktional: scheitert ein Eintrag, bleiben die zuvor
    /// eingefügten Gutscheine gespeichert. Ihre IDs stehen im fehlgeschlagenen
    /// Audit-Ereignis unter `context.registered_ids`.
    pub fn register_batch(
        &self,
        entries: Vec<NewVoucher>,
        issue_date: NaiveDate,
        actor: &str,
    ) -> Result<Vec<Voucher>, VoucherEngineError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let count = u32::try_from(entries.len())
            .map_err(|_| SerialError::SequenceOutOfRange(u32::MAX))?;
        let first = match self.store.reserve_sequence_block(issue_date, count) {
            Ok(first) => first,
            Err(e) => {
                let err = VoucherEngineError::from(e);
                self.record_rejection(AuditAction::Register, actor, "batch", None, &err, json!({ "count": count }));
                return Err(err);
            }
        };
        debug!(first, count, %issue_date, "Reserved serial sequence block");

        let now = self.clock.now();
        let mut registered = Vec::with_capacity(entries.len());
        for (sequence, entry) in (first..).zip(entries) {
            match self.insert_new(sequence, issue_date, &entry, now) {
                Ok(voucher) => {
                    self.record(AuditEvent {
                        action: AuditAction::Register,
                        actor_id: actor.to_string(),
                        target_id: voucher.id().to_string(),
                        before_status: None,
                        after_status: Some(voucher.status()),
                        success: true,
                        timestamp: now,
                        details: json!({ "serial_no": voucher.serial_no(), "amount": voucher.amount().to_string() }),
                    });
                    registered.push(voucher);
                }
                Err(err) => {
                    self.record_rejection(
                        AuditAction::Register,
                        actor,
                        "batch",
                        None,
                        &err,
                        json!({
                            "registered_before_failure": registered.len(),
                            "registered_ids": registered.iter().map(|v| v.id().to_string()).collect::<Vec<_>>(),
                        }),
                    );
                    return Err(err);
                }
            }
        }
        info!(count = registered.len(), "Registered vouchers");
        Ok(registered)
    }

    fn insert_new(
        &self,
        mut sequence: u32,
        issue_date: NaiveDate,
        entry: &NewVoucher,
        now: DateTime<Utc>,
    ) -> Result<Voucher, VoucherEngineError> {
        let mut attempt = 1;
        loop {
            let serial = serial_number::generate(sequence, issue_date)?;
            let voucher = Voucher::new_registered(serial, entry.amount, entry.pii.clone(), entry.recipient_id, now);
            match self.store.insert(voucher.clone()) {
                Ok(()) => return Ok(voucher),
                Err(StorageError::DuplicateSerial(serial)) if attempt < MAX_ALLOCATION_ATTEMPTS => {
                    warn!(serial = %serial, attempt, "Serial already taken, reserving a new sequence");
                    sequence = self.store.reserve_sequence_block(issue_date, 1)?;
                    attempt += 1;
                }
                Err(StorageError::DuplicateRecipient(recipient_id)) => {
                    return Err(VoucherEngineError::RecipientConsumed(recipient_id.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Erzeugt aus einem importierten Empfänger einen registrierten Gutschein.
    ///
    /// Ein Empfänger wird genau einmal verbraucht; danach steht er auf `Issued`
    /// und verweist auf den erzeugten Gutschein. Der Speicher lehnt einen zweiten
    /// Gutschein für dieselbe `recipient_id` ab, auch bei veralteten Kopien des
    /// Empfängers oder parallelen Aufrufen.
    pub fn mint_from_recipient(
        &self,
        recipient: &mut VoucherRecipient,
        issue_date: NaiveDate,
        actor: &str,
    ) -> Result<Voucher, VoucherEngineError> {
        if recipient.is_consumed() {
            let err = VoucherEngineError::RecipientConsumed(recipient.id.to_string());
            self.record_rejection(AuditAction::Register, actor, &recipient.id.to_string(), None, &err, Value::Null);
            return Err(err);
        }
        let entry = NewVoucher {
            amount: recipient.amount,
            pii: recipient.pii.clone(),
            recipient_id: Some(recipient.id),
        };
        let voucher = self.register(entry, issue_date, actor)?;
        recipient.mark_issued(voucher.id());
        Ok(voucher)
    }

    // --- Statusübergänge ---

    /// Gibt einen Gutschein aus (`registered` → `issued`) oder erneut aus (`issued` → `issued`).
    pub fn issue(&self, voucher_id: Uuid, actor: &str) -> Result<IssueOutcome, VoucherEngineError> {
        let voucher = self.load(&VoucherRef::Id(voucher_id), AuditAction::Issue, actor)?;
        let reissued = voucher.status() == VoucherStatus::Issued;
        let action = if reissued { AuditAction::Reissue } else { AuditAction::Issue };
        let fields = TransitionFields::issued(self.clock.now());
        let voucher = self.apply(Operation::Issue, action, voucher, &fields, actor, json!({ "reissue": reissued }))?;
        Ok(IssueOutcome { voucher, reissued })
    }

    /// Löst einen ausgegebenen Gutschein an `site_id` ein.
    ///
    /// Bei parallelen Aufrufen für dieselbe Seriennummer gelingt genau einer; alle
    /// anderen erhalten `AlreadyUsed`.
    pub fn use_voucher(&self, serial: &str, site_id: &str, actor: &str) -> Result<Voucher, VoucherEngineError> {
        if let Err(e) = serial_number::parse(serial) {
            let err = VoucherEngineError::from(e);
            self.record_rejection(AuditAction::Use, actor, serial, None, &err, json!({ "site_id": site_id }));
            return Err(err);
        }
        let voucher = self.load(&VoucherRef::Serial(serial.to_string()), AuditAction::Use, actor)?;
        self.use_loaded(voucher, site_id, actor, json!({ "site_id": site_id }))
    }

    fn use_loaded(
        &self,
        voucher: Voucher,
        site_id: &str,
        actor: &str,
        details: Value,
    ) -> Result<Voucher, VoucherEngineError> {
        let fields = TransitionFields::used(self.clock.now(), site_id);
        self.apply(Operation::Use, AuditAction::Use, voucher, &fields, actor, details)
    }

    /// Ruft einen ausgegebenen, unbenutzten Gutschein zurück.
    pub fn recall(
        &self,
        target: impl Into<VoucherRef>,
        reason: &str,
        actor: &str,
    ) -> Result<Voucher, VoucherEngineError> {
        let voucher = self.load(&target.into(), AuditAction::Recall, actor)?;
        let fields = TransitionFields::recalled(self.clock.now(), reason);
        self.apply(Operation::Recall, AuditAction::Recall, voucher, &fields, actor, json!({ "reason": reason }))
    }

    /// Schreibt einen ausgegebenen oder zurückgerufenen Gutschein endgültig ab.
    pub fn dispose(&self, voucher_id: Uuid, reason: &str, actor: &str) -> Result<Voucher, VoucherEngineError> {
        let voucher = self.load(&VoucherRef::Id(voucher_id), AuditAction::Dispose, actor)?;
        let fields = TransitionFields::disposed(self.clock.now(), reason);
        self.apply(Operation::Dispose, AuditAction::Dispose, voucher, &fields, actor, json!({ "reason": reason }))
    }

    /// Löscht einen noch nicht benutzten Gutschein.
    pub fn delete(&self, voucher_id: Uuid, actor: &str) -> Result<(), VoucherEngineError> {
        let voucher = self.load(&VoucherRef::Id(voucher_id), AuditAction::Delete, actor)?;
        let before = voucher.status();
        let details = json!({ "serial_no": voucher.serial_no() });

        if transition_target(Operation::Delete, before).is_none() {
            let err = rejection(Operation::Delete, &voucher);
            self.record_rejection(AuditAction::Delete, actor, &voucher_id.to_string(), Some(before), &err, details);
            return Err(err);
        }
        let outcome = match self.store.delete_if_status(&voucher_id, before) {
            Ok(true) => Ok(()),
            Ok(false) => Err(self.lost_race(Operation::Delete, &voucher)),
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(()) => {
                info!(serial = voucher.serial_no(), "Deleted voucher");
                self.record(AuditEvent {
                    action: AuditAction::Delete,
                    actor_id: actor.to_string(),
                    target_id: voucher_id.to_string(),
                    before_status: Some(before),
                    after_status: None,
                    success: true,
                    timestamp: self.clock.now(),
                    details,
                });
                Ok(())
            }
            Err(err) => {
                self.record_rejection(AuditAction::Delete, actor, &voucher_id.to_string(), Some(before), &err, details);
                Err(err)
            }
        }
    }

    // --- Einlösung über Payload ---

    /// Prüft einen gescannten Payload, ohne einzulösen.
    ///
    /// Signatur, Gutschein-Existenz und Ausgabedatum werden geprüft. Eine am
    /// heutigen Tag tolerierte Datumsabweichung wird in `discrepancy` gemeldet.
    pub fn verify_payload(&self, payload: &str) -> Result<PayloadCheck, VoucherEngineError> {
        let parsed = self.signer.parse_payload(payload)?;
        self.check_payload(parsed)
    }

    fn check_payload(&self, parsed: VerifiedPayload) -> Result<PayloadCheck, VoucherEngineError> {
        let voucher = self
            .store
            .find_by_serial(&parsed.serial)?
            .ok_or_else(|| VoucherEngineError::NotFound(parsed.serial.clone()))?;

        let discrepancy = match (parsed.issued_date, voucher.issued_at()) {
            (Some(payload_date), Some(issued_at)) => {
                check_freshness(payload_date, local_date(&issued_at), self.clock.today())?
            }
            _ => None,
        };
        if let Some(d) = &discrepancy {
            warn!(
                serial = voucher.serial_no(),
                payload_date = %d.payload_date,
                recorded_date = %d.recorded_date,
                "Tolerating same-day issue date mismatch"
            );
        }
        Ok(PayloadCheck { voucher, payload: parsed, discrepancy })
    }

    /// Prüft einen gescannten Payload und löst den Gutschein ein.
    pub fn redeem(&self, payload: &str, site_id: &str, actor: &str) -> Result<Redemption, VoucherEngineError> {
        let parsed = match self.signer.parse_payload(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                let err = VoucherEngineError::from(e);
                self.record_rejection(AuditAction::Use, actor, UNPARSED_TARGET, None, &err, json!({ "site_id": site_id }));
                return Err(err);
            }
        };
        let serial = parsed.serial.clone();
        let kind = parsed.kind;

        let check = match self.check_payload(parsed) {
            Ok(check) => check,
            Err(err) => {
                self.record_rejection(AuditAction::Use, actor, &serial, None, &err, json!({ "site_id": site_id }));
                return Err(err);
            }
        };

        let details = json!({
            "site_id": site_id,
            "payload_kind": format!("{kind:?}"),
            "signed": kind.is_signed(),
            "discrepancy": check.discrepancy.map(|d| json!({
                "payload_date": d.payload_date.to_string(),
                "recorded_date": d.recorded_date.to_string(),
            })),
        });
        let voucher = self.use_loaded(check.voucher, site_id, actor, details)?;
        Ok(Redemption { voucher, payload_kind: kind, discrepancy: check.discrepancy })
    }

    // --- Interne Hilfen ---

    fn load(&self, target: &VoucherRef, action: AuditAction, actor: &str) -> Result<Voucher, VoucherEngineError> {
        let found = match target {
            VoucherRef::Id(id) => self.store.find_by_id(id),
            VoucherRef::Serial(serial) => self.store.find_by_serial(serial),
        };
        let err = match found {
            Ok(Some(voucher)) => return Ok(voucher),
            Ok(None) => VoucherEngineError::NotFound(target.to_string()),
            Err(e) => e.into(),
        };
        self.record_rejection(action, actor, &target.to_string(), None, &err, Value::Null);
        Err(err)
    }

    /// Führt einen Übergang als bedingte Aktualisierung aus und protokolliert das Ergebnis.
    fn apply(
        &self,
        operation: Operation,
        action: AuditAction,
        voucher: Voucher,
        fields: &TransitionFields,
        actor: &str,
        details: Value,
    ) -> Result<Voucher, VoucherEngineError> {
        let before = voucher.status();
        let target_id = voucher.id().to_string();

        let outcome = match transition_target(operation, before) {
            None => Err(rejection(operation, &voucher)),
            Some(_) => match self.store.atomic_transition(&voucher.id(), before, fields) {
                Ok(true) => Ok(()),
                Ok(false) => Err(self.lost_race(operation, &voucher)),
                Err(e) => Err(e.into()),
            },
        };

        match outcome {
            Ok(()) => {
                let mut updated = voucher;
                fields.apply_to(&mut updated);
                info!(
                    serial = updated.serial_no(),
                    operation = operation.as_str(),
                    from = before.as_str(),
                    to = updated.status().as_str(),
                    "Voucher status changed"
                );
                self.record(AuditEvent {
                    action,
                    actor_id: actor.to_string(),
                    target_id,
                    before_status: Some(before),
                    after_status: Some(updated.status()),
                    success: true,
                    timestamp: self.clock.now(),
                    details,
                });
                Ok(updated)
            }
            Err(err) => {
                self.record_rejection(action, actor, &target_id, Some(before), &err, details);
                Err(err)
            }
        }
    }

    /// Bestimmt den Fehler, nachdem eine bedingte Aktualisierung nicht gegriffen hat.
    fn lost_race(&self, operation: Operation, seen: &Voucher) -> VoucherEngineError {
        match self.store.find_by_id(&seen.id()) {
            Ok(None) => VoucherEngineError::NotFound(seen.serial_no().to_string()),
            Ok(Some(current)) if transition_target(operation, current.status()).is_none() => {
                rejection(operation, &current)
            }
            Ok(Some(current)) => VoucherEngineError::ConcurrencyConflict {
                serial: current.serial_no().to_string(),
            },
            Err(e) => e.into(),
        }
    }

    fn record_rejection(
        &self,
        action: AuditAction,
        actor: &str,
        target_id: &str,
        before: Option<VoucherStatus>,
        err: &VoucherEngineError,
        details: Value,
    ) {
        debug!(action = action.as_str(), target_id, code = err.code(), "Lifecycle operation rejected");
        self.record(AuditEvent {
            action,
            actor_id: actor.to_string(),
            target_id: target_id.to_string(),
            before_status: before,
            after_status: before,
            success: false,
            timestamp: self.clock.now(),
            details: json!({ "error": err.code(), "message": err.to_string(), "context": details }),
        });
    }

    /// Übergibt ein Ereignis an den Audit-Empfänger. Fehler werden nur geloggt.
    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(&event) {
            warn!(error = %e, action = event.action.as_str(), "Audit recording failed, continuing");
        }
    }
}
