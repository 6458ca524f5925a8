//! # src/services/payload_signer.rs
//!
//! Signiert und prüft den QR-/Barcode-Payload, der bei der Einlösung gescannt wird.
//!
//! Unterstützte Formate:
//! - aktuell: `VCH:<serial>|ISSUED:<YYYYMMDD>|TS:<YYYYMMDDHHMM>|SIG:<hex>`
//! - legacy:  `VCH:<serial>|TS:<YYYYMMDDHHMM>|SIG:<hex>`
//! - bare:    `<serial>` ohne Präfix und ohne Signaturprüfung
//!
//! Die Signatur ist HMAC-SHA256 über die mit `|` verbundenen Felder.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::services::serial_number;
use crate::services::utils::{
    format_payload_date, format_payload_timestamp, local_date, local_minute, parse_payload_date,
    parse_payload_timestamp,
};

type HmacSha256 = Hmac<Sha256>;

pub const PAYLOAD_PREFIX: &str = "VCH:";
const ISSUED_PREFIX: &str = "ISSUED:";
const TIMESTAMP_PREFIX: &str = "TS:";
const SIGNATURE_PREFIX: &str = "SIG:";
const SIGNATURE_HEX_LENGTH: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Payload carries an invalid serial number: '{0}'")]
    InvalidSerial(String),

    #[error("Payload signature does not match.")]
    InvalidSignature,

    #[error("Payload was issued on {payload_date}, but the voucher was issued on {recorded_date}.")]
    StalePayload {
        payload_date: NaiveDate,
        recorded_date: NaiveDate,
    },
}

/// Das erkannte Payload-Format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Datumsgebundenes Format mit `ISSUED`-Segment.
    Current,
    /// Älteres Format ohne Ausgabedatum.
    Legacy,
    /// Nur die Seriennummer. Es wurde keine Signatur geprüft.
    BareSerial,
}

impl PayloadKind {
    pub fn is_signed(&self) -> bool {
        !matches!(self, PayloadKind::BareSerial)
    }
}

/// Ein geparster und, sofern signiert, verifizierter Payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPayload {
    pub serial: String,
    pub kind: PayloadKind,
    pub issued_date: Option<NaiveDate>,
    pub timestamp: Option<NaiveDateTime>,
}

/// Eine tolerierte Abweichung zwischen Payload-Datum und gespeichertem Ausgabedatum.
///
/// Entsteht nur, wenn eines der beiden Daten "heute" ist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateDiscrepancy {
    pub payload_date: NaiveDate,
    pub recorded_date: NaiveDate,
}

/// Vergleicht das `ISSUED`-Datum eines Payloads mit dem gespeicherten Ausgabedatum.
///
/// Gleiche Daten: `Ok(None)`. Abweichung, bei der eines der Daten `today` ist:
/// `Ok(Some(DateDiscrepancy))`. Jede andere Abweichung ist `StalePayload`.
pub fn check_freshness(
    payload_date: NaiveDate,
    recorded_date: NaiveDate,
    today: NaiveDate,
) -> Result<Option<DateDiscrepancy>, PayloadError> {
    if payload_date == recorded_date {
        return Ok(None);
    }
    if payload_date == today || recorded_date == today {
        return Ok(Some(DateDiscrepancy { payload_date, recorded_date }));
    }
    Err(PayloadError::StalePayload { payload_date, recorded_date })
}

/// Signiert und verifiziert Redemption-Payloads mit einem gemeinsamen Geheimnis.
///
/// Zustandslos und ohne innere Veränderlichkeit; kann beliebig geteilt werden.
#[derive(Clone)]
pub struct PayloadSigner {
    key: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for PayloadSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadSigner").field("key", &"<redacted>").finish()
    }
}

impl PayloadSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        PayloadSigner { key: Zeroizing::new(secret.as_ref().to_vec()) }
    }

    fn mac(&self, parts: &[&str]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(self.key.as_slice())
            .expect("HMAC-SHA256 accepts keys of any length");
        mac.update(parts.join("|").as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    fn matches(&self, parts: &[&str], signature_hex: &str) -> bool {
        let Ok(provided) = hex::decode(signature_hex) else {
            return false;
        };
        let expected = self.mac(parts);
        // Konstante Laufzeit; Slices unterschiedlicher Länge vergleichen zu `false`.
        expected.as_slice().ct_eq(provided.as_slice()).into()
    }

    /// HMAC über `serial|issued_date|timestamp`, hex-kodiert.
    pub fn sign(&self, serial: &str, issued_date: &str, timestamp: &str) -> String {
        hex::encode(self.mac(&[serial, issued_date, timestamp]))
    }

    pub fn verify(&self, serial: &str, issued_date: &str, timestamp: &str, signature: &str) -> bool {
        self.matches(&[serial, issued_date, timestamp], signature)
    }

    /// HMAC über `serial|timestamp` (Legacy-Format ohne Datum).
    pub fn sign_legacy(&self, serial: &str, timestamp: &str) -> String {
        hex::encode(self.mac(&[serial, timestamp]))
    }

    pub fn verify_legacy(&self, serial: &str, timestamp: &str, signature: &str) -> bool {
        self.matches(&[serial, timestamp], signature)
    }

    /// Baut den aktuellen Payload für einen ausgegebenen Gutschein.
    ///
    /// `ISSUED` ist das lokale Ausgabedatum, `TS` der lokale Ausgabezeitpunkt auf die Minute gekürzt.
    pub fn make_payload(&self, serial: &str, issued_at: &DateTime<Utc>) -> String {
        let issued = format_payload_date(local_date(issued_at));
        let timestamp = format_payload_timestamp(local_minute(issued_at));
        self.make_payload_from_parts(serial, &issued, &timestamp)
    }

    /// Baut den aktuellen Payload aus bereits formatierten Segmenten.
    pub fn make_payload_from_parts(&self, serial: &str, issued_date: &str, timestamp: &str) -> String {
        let signature = self.sign(serial, issued_date, timestamp);
        format!("{PAYLOAD_PREFIX}{serial}|{ISSUED_PREFIX}{issued_date}|{TIMESTAMP_PREFIX}{timestamp}|{SIGNATURE_PREFIX}{signature}")
    }

    /// Baut einen Payload im Legacy-Format. Nur für bereits gedruckte Altbestände und Migrationstests.
    pub fn make_legacy_payload(&self, serial: &str, at: &DateTime<Utc>) -> String {
        let timestamp = format_payload_timestamp(local_minute(at));
        let signature = self.sign_legacy(serial, &timestamp);
        format!("{PAYLOAD_PREFIX}{serial}|{TIMESTAMP_PREFIX}{timestamp}|{SIGNATURE_PREFIX}{signature}")
    }

    /// Parst einen gescannten Payload und prüft die Signatur passend zum Format.
    ///
    /// Ein Payload ohne `VCH:`-Präfix wird als bloße Seriennummer akzeptiert, ohne
    /// Signaturprüfung. Nur die Prüfsumme der Seriennummer wird kontrolliert.
    pub fn parse_payload(&self, payload: &str) -> Result<VerifiedPayload, PayloadError> {
        let payload = payload.trim();
        let Some(body) = payload.strip_prefix(PAYLOAD_PREFIX) else {
            return parse_bare_serial(payload);
        };

        let segments: Vec<&str> = body.split('|').collect();
        let has_issued = segments.iter().any(|s| s.starts_with(ISSUED_PREFIX));

        let (serial, issued, timestamp, signature) = match (has_issued, segments.as_slice()) {
            (true, [serial, issued, timestamp, signature]) => (
                *serial,
                Some(segment(issued, ISSUED_PREFIX)?),
                segment(timestamp, TIMESTAMP_PREFIX)?,
                segment(signature, SIGNATURE_PREFIX)?,
            ),
            (false, [serial, timestamp, signature]) => (
                *serial,
                None,
                segment(timestamp, TIMESTAMP_PREFIX)?,
                segment(signature, SIGNATURE_PREFIX)?,
            ),
            _ => {
                return Err(PayloadError::Malformed(format!(
                    "unexpected segment count {}",
                    segments.len()
                )))
            }
        };

        if !serial_number::validate(serial) {
            return Err(PayloadError::InvalidSerial(serial.to_string()));
        }
        let parsed_timestamp = parse_payload_timestamp(timestamp)
            .ok_or_else(|| PayloadError::Malformed(format!("invalid timestamp '{timestamp}'")))?;
        if signature.len() != SIGNATURE_HEX_LENGTH {
            return Err(PayloadError::Malformed(format!(
                "signature must be {SIGNATURE_HEX_LENGTH} hex characters"
            )));
        }

        match issued {
            Some(issued) => {
                let issued_date = parse_payload_date(issued)
                    .ok_or_else(|| PayloadError::Malformed(format!("invalid issue date '{issued}'")))?;
                if !self.verify(serial, issued, timestamp, signature) {
                    warn!(serial, "Rejected payload with invalid signature");
                    return Err(PayloadError::InvalidSignature);
                }
                debug!(serial, "Verified current-format payload");
                Ok(VerifiedPayload {
                    serial: serial.to_string(),
                    kind: PayloadKind::Current,
                    issued_date: Some(issued_date),
                    timestamp: Some(parsed_timestamp),
                })
            }
            None => {
                if !self.verify_legacy(serial, timestamp, signature) {
                    warn!(serial, "Rejected legacy payload with invalid signature");
                    return Err(PayloadError::InvalidSignature);
                }
                debug!(serial, "Verified legacy-format payload");
                Ok(VerifiedPayload {
                    serial: serial.to_string(),
                    kind: PayloadKind::Legacy,
                    issued_date: None,
                    timestamp: Some(parsed_timestamp),
                })
            }
        }
    }
}

fn segment<'a>(value: &'a str, prefix: &str) -> Result<&'a str, PayloadError> {
    value
        .strip_prefix(prefix)
        .ok_or_else(|| PayloadError::Malformed(format!("expected segment '{prefix}', found '{value}'")))
}

fn parse_bare_serial(payload: &str) -> Result<VerifiedPayload, PayloadError> {
    if !serial_number::validate(payload) {
        return Err(PayloadError::InvalidSerial(payload.to_string()));
    }
    warn!(serial = payload, "Accepted bare serial without signature check");
    Ok(VerifiedPayload {
        serial: payload.to_string(),
        kind: PayloadKind::BareSerial,
        issued_date: None,
        timestamp: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERIAL: &str = "20241200000130";

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_signature_is_lowercase_hex_of_fixed_length() {
        let signer = PayloadSigner::new("secret");
        let sig = signer.sign(SERIAL, "20241205", "202412051430");
        assert_eq!(sig.len(), SIGNATURE_HEX_LENGTH);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_verify_rejects_non_hex_and_short_signatures() {
        let signer = PayloadSigner::new("secret");
        assert!(!signer.verify(SERIAL, "20241205", "202412051430", "zz"));
        assert!(!signer.verify(SERIAL, "20241205", "202412051430", "abcd"));
        assert!(!signer.verify(SERIAL, "20241205", "202412051430", ""));
    }

    #[test]
    fn test_freshness_rules() {
        let today = date(2024, 12, 5);
        assert_eq!(check_freshness(today, today, today), Ok(None));
        assert_eq!(
            check_freshness(date(2024, 12, 4), today, today),
            Ok(Some(DateDiscrepancy { payload_date: date(2024, 12, 4), recorded_date: today }))
        );
        assert_eq!(
            check_freshness(today, date(2024, 12, 3), today),
            Ok(Some(DateDiscrepancy { payload_date: today, recorded_date: date(2024, 12, 3) }))
        );
        assert_eq!(
            check_freshness(date(2024, 12, 2), date(2024, 12, 3), today),
            Err(PayloadError::StalePayload {
                payload_date: date(2024, 12, 2),
                recorded_date: date(2024, 12, 3)
            })
        );
        assert_eq!(check_freshness(date(2024, 12, 2), date(2024, 12, 2), today), Ok(None));
    }

    #[test]
    fn test_parse_rejects_wrong_segment_order() {
        let signer = PayloadSigner::new("secret");
        let sig = signer.sign(SERIAL, "20241205", "202412051430");
        let payload = format!("VCH:{SERIAL}|TS:202412051430|ISSUED:20241205|SIG:{sig}");
        assert!(matches!(signer.parse_payload(&payload), Err(PayloadError::Malformed(_))));
    }

    #[test]
    fn test_debug_output_redacts_key() {
        let signer = PayloadSigner::new("very-secret");
        assert!(!format!("{signer:?}").contains("very-secret"));
    }
}
