//! # src/models/recipient.rs
//!
//! Der Empfänger-Datensatz vor der Ausgabe eines Gutscheins. Er entsteht beim
//! Massenimport und wird genau einmal verbraucht, wenn daraus ein `Voucher`
//! erzeugt wird.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::voucher::PiiFields;

/// Status eines Empfängers. Die Reihenfolge der Varianten ist die Reihenfolge im Ablauf.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Registered,
    Issued,
    Printed,
    Delivered,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VoucherRecipient {
    pub id: Uuid,
    pub member_id: String,
    pub association_id: Option<String>,
    /// Verschlüsselte personenbezogene Felder.
    pub pii: PiiFields,
    pub amount: Decimal,
    pub status: RecipientStatus,
    /// Der aus diesem Empfänger erzeugte Gutschein, sobald einer existiert.
    pub voucher_id: Option<Uuid>,
}

impl VoucherRecipient {
    pub fn new(
        member_id: impl Into<String>,
        association_id: Option<String>,
        pii: PiiFields,
        amount: Decimal,
    ) -> Self {
        VoucherRecipient {
            id: Uuid::new_v4(),
            member_id: member_id.into(),
            association_id,
            pii,
            amount,
            status: RecipientStatus::Registered,
            voucher_id: None,
        }
    }

    /// `true`, sobald aus diesem Empfänger ein Gutschein erzeugt wurde.
    pub fn is_consumed(&self) -> bool {
        self.voucher_id.is_some() || self.status != RecipientStatus::Registered
    }

    /// Bewegt den Empfänger im Ablauf vorwärts (issued → printed → delivered).
    ///
    /// Rückschritte und Sprünge über `Issued` hinweg werden abgelehnt; der Übergang
    /// nach `Issued` selbst erfolgt nur beim Erzeugen des Gutscheins.
    pub fn advance(&mut self, next: RecipientStatus) -> Result<(), String> {
        let allowed = matches!(
            (self.status, next),
            (RecipientStatus::Issued, RecipientStatus::Printed)
                | (RecipientStatus::Issued, RecipientStatus::Delivered)
                | (RecipientStatus::Printed, RecipientStatus::Delivered)
        );
        if !allowed {
            return Err(format!(
                "recipient {}: cannot move from {:?} to {:?}",
                self.id, self.status, next
            ));
        }
        self.status = next;
        Ok(())
    }

    pub(crate) fn mark_issued(&mut self, voucher_id: Uuid) {
        self.status = RecipientStatus::Issued;
        self.voucher_id = Some(voucher_id);
    }
}
