//! # src/services/serial_number.rs
//!
//! Erzeugung und Prüfung der 14-stelligen Gutschein-Seriennummern.
//!
//! Aufbau: `YYYYMM` (6) + Laufnummer (6, 1..=999999) + Prüfsumme (2).
//! Die Prüfsumme ist die gewichtete Ziffernsumme der ersten 12 Stellen mit dem
//! Gewichtszyklus `3,7,1` modulo 100. Sie ist unabhängig von jedem Schlüssel und
//! dient nur dazu, Tippfehler beim manuellen Abtippen zu erkennen.

use chrono::{Datelike, NaiveDate};
use thiserror::Error;

pub const SERIAL_LENGTH: usize = 14;
pub const MIN_SEQUENCE: u32 = 1;
pub const MAX_SEQUENCE: u32 = 999_999;
pub const MIN_YEAR: i32 = 2020;
pub const MAX_YEAR: i32 = 2099;

const BASE_LENGTH: usize = 12;
const CHECKSUM_WEIGHTS: [u32; BASE_LENGTH] = [3, 7, 1, 3, 7, 1, 3, 7, 1, 3, 7, 1];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerialError {
    #[error("Sequence {0} is out of range (1..=999999).")]
    SequenceOutOfRange(u32),

    #[error("Issue year {0} is outside the supported range 2020..=2099.")]
    YearOutOfRange(i32),

    #[error("Invalid serial number: '{0}'")]
    InvalidSerial(String),
}

/// Die Bestandteile einer gültigen Seriennummer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialParts {
    pub year: i32,
    pub month: u32,
    pub sequence: u32,
    pub checksum: u8,
}

impl SerialParts {
    /// Das `YYYYMM`-Präfix dieser Seriennummer.
    pub fn year_month(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }
}

/// Das `YYYYMM`-Präfix für ein Ausgabedatum.
pub fn year_month_prefix(issue_date: NaiveDate) -> String {
    format!("{:04}{:02}", issue_date.year(), issue_date.month())
}

/// Berechnet die Prüfsumme über genau 12 ASCII-Ziffern.
///
/// Gibt `None` zurück, wenn `base` nicht aus genau 12 Ziffern besteht.
pub fn compute_checksum(base: &str) -> Option<u8> {
    let bytes = base.as_bytes();
    if bytes.len() != BASE_LENGTH || !bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let sum: u32 = bytes
        .iter()
        .zip(CHECKSUM_WEIGHTS.iter())
        .map(|(digit, weight)| u32::from(digit - b'0') * weight)
        .sum();
    u8::try_from(sum % 100).ok()
}

/// Erzeugt die Seriennummer für eine Laufnummer und ein Ausgabedatum.
pub fn generate(sequence: u32, issue_date: NaiveDate) -> Result<String, SerialError> {
    if !(MIN_SEQUENCE..=MAX_SEQUENCE).contains(&sequence) {
        return Err(SerialError::SequenceOutOfRange(sequence));
    }
    let year = issue_date.year();
    if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
        return Err(SerialError::YearOutOfRange(year));
    }

    let base = format!("{}{:06}", year_month_prefix(issue_date), sequence);
    let checksum = compute_checksum(&base).ok_or_else(|| SerialError::InvalidSerial(base.clone()))?;
    Ok(format!("{base}{checksum:02}"))
}

/// Prüft Länge, Ziffern, Jahr, Monat und Prüfsumme.
pub fn validate(serial: &str) -> bool {
    parse_unchecked(serial).is_some()
}

/// Zerlegt eine Seriennummer in ihre Bestandteile.
pub fn parse(serial: &str) -> Result<SerialParts, SerialError> {
    parse_unchecked(serial).ok_or_else(|| SerialError::InvalidSerial(serial.to_string()))
}

fn parse_unchecked(serial: &str) -> Option<SerialParts> {
    if serial.len() != SERIAL_LENGTH || !serial.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Alle Zeichen sind ASCII-Ziffern, die Slices liegen also auf Zeichengrenzen.
    let year: i32 = serial[0..4].parse().ok()?;
    let month: u32 = serial[4..6].parse().ok()?;
    let sequence: u32 = serial[6..12].parse().ok()?;
    let checksum: u8 = serial[12..14].parse().ok()?;

    if !(MIN_YEAR..=MAX_YEAR).contains(&year) || !(1..=12).contains(&month) {
        return None;
    }
    if compute_checksum(&serial[0..BASE_LENGTH])? != checksum {
        return None;
    }
    Some(SerialParts { year, month, sequence, checksum })
}

/// Die nächste freie Laufnummer für den Monat von `issue_date`.
///
/// Berücksichtigt nur gültige Seriennummern desselben Jahr-Monats; ohne Treffer
/// beginnt die Zählung bei 1.
pub fn next_sequence<'a, I>(existing_serials: I, issue_date: NaiveDate) -> u32
where
    I: IntoIterator<Item = &'a str>,
{
    let year = issue_date.year();
    let month = issue_date.month();
    existing_serials
        .into_iter()
        .filter_map(parse_unchecked)
        .filter(|parts| parts.year == year && parts.month == month)
        .map(|parts| parts.sequence)
        .max()
        .map_or(MIN_SEQUENCE, |max| max + 1)
}
