//! # src/models/voucher.rs
//!
//! Definiert den `Voucher`-Datensatz, seinen geschlossenen Status-Enum und die
//! Feldänderungen, die ein Statusübergang auf den Datensatz anwendet.
//!
//! Status und die zugehörigen Zeitstempel sind nur lesend zugänglich. Geschrieben
//! werden sie ausschließlich über `TransitionFields`, die nur der
//! `LifecycleStateMachine` erzeugen kann.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Der Lebenszyklus-Status eines Gutscheins.
///
/// `Used` und `Disposed` sind terminal.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VoucherStatus {
    Registered,
    Issued,
    Used,
    Recalled,
    Disposed,
}

impl VoucherStatus {
    /// Alle Zustände, z.B. für die erschöpfende Prüfung der Übergangstabelle.
    pub const ALL: [VoucherStatus; 5] = [
        VoucherStatus::Registered,
        VoucherStatus::Issued,
        VoucherStatus::Used,
        VoucherStatus::Recalled,
        VoucherStatus::Disposed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VoucherStatus::Registered => "registered",
            VoucherStatus::Issued => "issued",
            VoucherStatus::Used => "used",
            VoucherStatus::Recalled => "recalled",
            VoucherStatus::Disposed => "disposed",
        }
    }

    /// `true` für Zustände, aus denen kein Übergang mehr möglich ist.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VoucherStatus::Used | VoucherStatus::Disposed)
    }
}

impl fmt::Display for VoucherStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Die verschlüsselten personenbezogenen Felder eines Empfängers.
///
/// Jedes Feld enthält ausschließlich ein Token im Format von
/// `PiiCipher::encrypt_field`, niemals Klartext.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PiiFields {
    pub name: Option<String>,
    pub date_of_birth: Option<String>,
    pub phone: Option<String>,
}

/// Ein ausgegebener oder registrierter Gutschein.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Voucher {
    id: Uuid,
    serial_no: String,
    status: VoucherStatus,
    amount: Decimal,
    #[serde(default)]
    pii: PiiFields,
    #[serde(default)]
    recipient_id: Option<Uuid>,
    registered_at: DateTime<Utc>,
    #[serde(default)]
    issued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    used_at_site_id: Option<String>,
    #[serde(default)]
    recalled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    recall_reason: Option<String>,
    #[serde(default)]
    disposed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    disposal_reason: Option<String>,
}

impl Voucher {
    /// Erzeugt einen neuen Datensatz im Status `Registered`.
    ///
    /// Die Seriennummer wird hier nicht geprüft; das übernimmt der Aufrufer
    /// (`LifecycleStateMachine::register`), der sie auch erzeugt hat.
    pub fn new_registered(
        serial_no: impl Into<String>,
        amount: Decimal,
        pii: PiiFields,
        recipient_id: Option<Uuid>,
        registered_at: DateTime<Utc>,
    ) -> Self {
        Voucher {
            id: Uuid::new_v4(),
            serial_no: serial_no.into(),
            status: VoucherStatus::Registered,
            amount,
            pii,
            recipient_id,
            registered_at,
            issued_at: None,
            used_at: None,
            used_at_site_id: None,
            recalled_at: None,
            recall_reason: None,
            disposed_at: None,
            disposal_reason: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn serial_no(&self) -> &str {
        &self.serial_no
    }

    pub fn status(&self) -> VoucherStatus {
        self.status
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn pii(&self) -> &PiiFields {
        &self.pii
    }

    pub fn recipient_id(&self) -> Option<Uuid> {
        self.recipient_id
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.issued_at
    }

    pub fn used_at(&self) -> Option<DateTime<Utc>> {
        self.used_at
    }

    pub fn used_at_site_id(&self) -> Option<&str> {
        self.used_at_site_id.as_deref()
    }

    pub fn recalled_at(&self) -> Option<DateTime<Utc>> {
        self.recalled_at
    }

    pub fn recall_reason(&self) -> Option<&str> {
        self.recall_reason.as_deref()
    }

    pub fn disposed_at(&self) -> Option<DateTime<Utc>> {
        self.disposed_at
    }

    pub fn disposal_reason(&self) -> Option<&str> {
        self.disposal_reason.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Prüft die Datensatz-Invarianten.
    ///
    /// `used_at` ist genau dann gesetzt, wenn der Status `Used` ist, und ein
    /// `Used`-Gutschein trägt immer eine Einlösestelle.
    pub fn check_invariants(&self) -> Result<(), String> {
        let is_used = self.status == VoucherStatus::Used;
        if is_used != self.used_at.is_some() {
            return Err(format!(
                "voucher {}: used_at must be set if and only if status is used (status: {})",
                self.serial_no, self.status
            ));
        }
        if is_used && self.used_at_site_id.is_none() {
            return Err(format!("voucher {}: used without a site id", self.serial_no));
        }
        if self.status != VoucherStatus::Registered && self.issued_at.is_none() {
            return Err(format!(
                "voucher {}: status {} requires issued_at",
                self.serial_no, self.status
            ));
        }
        Ok(())
    }
}

/// Die Feldänderungen eines einzelnen Statusübergangs.
///
/// Wird an `VoucherStore::atomic_transition` übergeben. Konstruktoren sind
/// crate-intern, damit nur die Zustandsmaschine Status schreibt; Speicher-
/// Implementierungen wenden die Änderung mit `apply_to` an.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionFields {
    status: VoucherStatus,
    issued_at: Option<DateTime<Utc>>,
    used_at: Option<DateTime<Utc>>,
    used_at_site_id: Option<String>,
    recalled_at: Option<DateTime<Utc>>,
    recall_reason: Option<String>,
    disposed_at: Option<DateTime<Utc>>,
    disposal_reason: Option<String>,
}

impl TransitionFields {
    fn to_status(status: VoucherStatus) -> Self {
        TransitionFields {
            status,
            issued_at: None,
            used_at: None,
            used_at_site_id: None,
            recalled_at: None,
            recall_reason: None,
            disposed_at: None,
            disposal_reason: None,
        }
    }

    pub(crate) fn issued(now: DateTime<Utc>) -> Self {
        TransitionFields { issued_at: Some(now), ..Self::to_status(VoucherStatus::Issued) }
    }

    pub(crate) fn used(now: DateTime<Utc>, site_id: &str) -> Self {
        TransitionFields {
            used_at: Some(now),
            used_at_site_id: Some(site_id.to_string()),
            ..Self::to_status(VoucherStatus::Used)
        }
    }

    pub(crate) fn recalled(now: DateTime<Utc>, reason: &str) -> Self {
        TransitionFields {
            recalled_at: Some(now),
            recall_reason: Some(reason.to_string()),
            ..Self::to_status(VoucherStatus::Recalled)
        }
    }

    pub(crate) fn disposed(now: DateTime<Utc>, reason: &str) -> Self {
        TransitionFields {
            disposed_at: Some(now),
            disposal_reason: Some(reason.to_string()),
            ..Self::to_status(VoucherStatus::Disposed)
        }
    }

    /// Der Zielstatus dieses Übergangs.
    pub fn status(&self) -> VoucherStatus {
        self.status
    }

    /// Wendet die Änderungen auf einen Datensatz an. Nicht gesetzte Felder bleiben unverändert.
    pub fn apply_to(&self, voucher: &mut Voucher) {
        voucher.status = self.status;
        if let Some(at) = self.issued_at {
            voucher.issued_at = Some(at);
        }
        if let Some(at) = self.used_at {
            voucher.used_at = Some(at);
        }
        if let Some(site) = &self.used_at_site_id {
            voucher.used_at_site_id = Some(site.clone());
        }
        if let Some(at) = self.recalled_at {
            voucher.recalled_at = Some(at);
        }
        if let Some(reason) = &self.recall_reason {
            voucher.recall_reason = Some(reason.clone());
        }
        if let Some(at) = self.disposed_at {
            voucher.disposed_at = Some(at);
        }
        if let Some(reason) = &self.disposal_reason {
            voucher.disposal_reason = Some(reason.clone());
        }
    }
}
