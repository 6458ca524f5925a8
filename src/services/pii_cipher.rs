//! # src/services/pii_cipher.rs
//!
//! Authentifizierte Verschlüsselung personenbezogener Felder (Name, Geburtsdatum,
//! Telefonnummer) sowie die Maskierung für die Anzeige.
//!
//! Token-Formate:
//! - aktuell: `<iv-hex 32>:<tag-hex 32>:<cipher-hex>` (AES-256-GCM, 16-Byte-IV)
//! - legacy:  `<iv-hex 32>:<cipher-hex>` (AES-256-CBC ohne Integritätsschutz, nur lesend)
//!
//! Der Schlüssel ist SHA-256 über das konfigurierte Geheimnis.

use aes::Aes256;
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::AesGcm;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::models::voucher::PiiFields;

/// AES-256-GCM mit 16-Byte-IV statt der üblichen 12 Byte.
type Aes256Gcm16 = AesGcm<Aes256, U16>;
type LegacyEncryptor = cbc::Encryptor<Aes256>;
type LegacyDecryptor = cbc::Decryptor<Aes256>;

const KEY_SIZE: usize = 32;
const IV_SIZE: usize = 16;
const TAG_SIZE: usize = 16;

/// Fehler der Feldverschlüsselung.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("AEAD encryption failed.")]
    EncryptionFailed,

    /// Falscher Schlüssel, manipulierte Daten oder ein nicht entschlüsselbares Legacy-Token.
    #[error("Decryption failed. The key may be incorrect or the data may have been tampered with.")]
    DecryptionFailed,

    #[error("Decrypted field is not valid UTF-8.")]
    InvalidUtf8,

    #[error("Token does not match any known encrypted-field format.")]
    UnrecognizedFormat,
}

/// Das erkannte Format eines gespeicherten Feldes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFormat {
    Authenticated,
    Legacy,
    Unrecognized,
}

/// Bestimmt das Format eines Tokens allein anhand der Anzahl der `:`-Segmente.
///
/// Drei Segmente sind immer ein authentifiziertes Token, zwei immer ein Legacy-Token.
/// Ob die Segmente gültiges Hex mit passender Länge sind, prüft erst die
/// Entschlüsselung; ein beschädigtes Token wird so nie als Klartext durchgereicht.
pub fn detect_format(token: &str) -> TokenFormat {
    match token.split(':').count() {
        3 => TokenFormat::Authenticated,
        2 => TokenFormat::Legacy,
        _ => TokenFormat::Unrecognized,
    }
}

fn decode_hex(value: &str) -> Result<Vec<u8>, CipherError> {
    hex::decode(value).map_err(|_| CipherError::DecryptionFailed)
}

/// Ver- und entschlüsselt PII-Felder. Zustandslos und frei teilbar.
#[derive(Clone)]
pub struct PiiCipher {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl fmt::Debug for PiiCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PiiCipher").field("key", &"<redacted>").finish()
    }
}

impl PiiCipher {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let key: [u8; KEY_SIZE] = Sha256::digest(secret.as_ref()).into();
        PiiCipher { key: Zeroizing::new(key) }
    }

    /// Verschlüsselt ein Feld mit frischem, zufälligem IV.
    pub fn encrypt_field(&self, plaintext: &str) -> Result<String, CipherError> {
        let cipher = Aes256Gcm16::new_from_slice(self.key.as_slice())
            .map_err(|_| CipherError::EncryptionFailed)?;
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);

        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&iv), b"", &mut buffer)
            .map_err(|_| CipherError::EncryptionFailed)?;

        Ok(format!("{}:{}:{}", hex::encode(iv), hex::encode(tag.as_slice()), hex::encode(&buffer)))
    }

    /// Erzeugt ein Token im Legacy-Format.
    ///
    /// Neue Daten werden nie so geschrieben; die Funktion existiert für
    /// Migrationsfixtures und Tests des Lesepfads.
    pub fn encrypt_legacy_field(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);
        let encryptor = LegacyEncryptor::new_from_slices(self.key.as_slice(), &iv)
            .map_err(|_| CipherError::EncryptionFailed)?;
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
    }

    /// Entschlüsselt ein Feld; das Format wird an der Struktur erkannt.
    ///
    /// Ein unbekanntes Format wird unverändert zurückgegeben. Dieser Pfad ist nur
    /// für die Übernahme von Altdaten gedacht; im Kern `decrypt_field_strict` verwenden.
    pub fn decrypt_field(&self, token: &str) -> Result<String, CipherError> {
        match self.decrypt_field_strict(token) {
            Err(CipherError::UnrecognizedFormat) => {
                debug!("Passing through field with unrecognized format");
                Ok(token.to_string())
            }
            other => other,
        }
    }

    /// Wie `decrypt_field`, aber ein unbekanntes Format ist ein Fehler.
    pub fn decrypt_field_strict(&self, token: &str) -> Result<String, CipherError> {
        match detect_format(token) {
            TokenFormat::Authenticated => self.decrypt_authenticated(token),
            TokenFormat::Legacy => self.decrypt_legacy(token),
            TokenFormat::Unrecognized => Err(CipherError::UnrecognizedFormat),
        }
    }

    fn decrypt_authenticated(&self, token: &str) -> Result<String, CipherError> {
        let mut parts = token.splitn(3, ':');
        let (Some(iv), Some(tag), Some(cipher_hex)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(CipherError::UnrecognizedFormat);
        };
        let iv = decode_hex(iv)?;
        let tag = decode_hex(tag)?;
        let mut buffer = decode_hex(cipher_hex)?;
        if iv.len() != IV_SIZE || tag.len() != TAG_SIZE {
            return Err(CipherError::DecryptionFailed);
        }

        let cipher = Aes256Gcm16::new_from_slice(self.key.as_slice())
            .map_err(|_| CipherError::DecryptionFailed)?;
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(&iv),
                b"",
                &mut buffer,
                GenericArray::from_slice(&tag),
            )
            .map_err(|_| CipherError::DecryptionFailed)?;
        String::from_utf8(buffer).map_err(|_| CipherError::InvalidUtf8)
    }

    fn decrypt_legacy(&self, token: &str) -> Result<String, CipherError> {
        let Some((iv, cipher_hex)) = token.split_once(':') else {
            return Err(CipherError::UnrecognizedFormat);
        };
        let iv = decode_hex(iv)?;
        let ciphertext = decode_hex(cipher_hex)?;
        if iv.len() != IV_SIZE || ciphertext.is_empty() {
            return Err(CipherError::DecryptionFailed);
        }
        let decryptor = LegacyDecryptor::new_from_slices(self.key.as_slice(), &iv)
            .map_err(|_| CipherError::DecryptionFailed)?;
        let plaintext = decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| CipherError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::InvalidUtf8)
    }

    /// Verschlüsselt die drei PII-Felder eines Empfängers.
    pub fn encrypt_pii(
        &self,
        name: Option<&str>,
        date_of_birth: Option<&str>,
        phone: Option<&str>,
    ) -> Result<PiiFields, CipherError> {
        Ok(PiiFields {
            name: name.map(|v| self.encrypt_field(v)).transpose()?,
            date_of_birth: date_of_birth.map(|v| self.encrypt_field(v)).transpose()?,
            phone: phone.map(|v| self.encrypt_field(v)).transpose()?,
        })
    }

    /// Entschlüsselt die PII-Felder eines Datensatzes (strikt, ohne Durchreichen).
    pub fn decrypt_pii(&self, fields: &PiiFields) -> Result<DecryptedPii, CipherError> {
        let decrypt = |value: &Option<String>| {
            value.as_deref().map(|v| self.decrypt_field_strict(v)).transpose()
        };
        Ok(DecryptedPii {
            name: decrypt(&fields.name)?,
            date_of_birth: decrypt(&fields.date_of_birth)?,
            phone: decrypt(&fields.phone)?,
        })
    }
}

/// Entschlüsselte PII. Wird beim Verwerfen überschrieben, `Debug` zeigt nur maskierte Werte.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DecryptedPii {
    pub name: Option<String>,
    pub date_of_birth: Option<String>,
    pub phone: Option<String>,
}

impl fmt::Debug for DecryptedPii {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedPii")
            .field("name", &self.name.as_deref().map(|v| mask_for_display(v, MaskKind::Name)))
            .field("date_of_birth", &self.date_of_birth.as_ref().map(|_| "<redacted>"))
            .field("phone", &self.phone.as_deref().map(|v| mask_for_display(v, MaskKind::Phone)))
            .finish()
    }
}

/// Art des zu maskierenden Wertes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskKind {
    Phone,
    Name,
    Id,
}

impl FromStr for MaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "phone" => Ok(MaskKind::Phone),
            "name" => Ok(MaskKind::Name),
            "id" => Ok(MaskKind::Id),
            other => Err(format!("unknown mask kind '{other}' (expected phone, name or id)")),
        }
    }
}

const MASK_CHAR: char = '*';

/// Maskiert einen Wert für die Anzeige.
///
/// - `Phone`: erste 3 und letzte 4 Ziffern bleiben, Trennzeichen bleiben erhalten.
///   Bei höchstens 7 Ziffern gäbe es keine Mitte zu maskieren; dann werden alle
///   Ziffern maskiert, statt die Nummer vollständig anzuzeigen.
/// - `Name`: erstes und letztes Zeichen bleiben; zweistellige Namen werden zu `X*`.
/// - `Id`: die ersten 4 Zeichen bleiben.
pub fn mask_for_display(value: &str, kind: MaskKind) -> String {
    match kind {
        MaskKind::Phone => mask_phone(value),
        MaskKind::Name => mask_name(value),
        MaskKind::Id => mask_id(value),
    }
}

fn mask_phone(value: &str) -> String {
    let digit_count = value.chars().filter(char::is_ascii_digit).count();
    if digit_count <= 7 {
        return value
            .chars()
            .map(|c| if c.is_ascii_digit() { MASK_CHAR } else { c })
            .collect();
    }
    let keep_until = 3;
    let keep_from = digit_count - 4;
    let mut index = 0;
    value
        .chars()
        .map(|c| {
            if !c.is_ascii_digit() {
                return c;
            }
            let masked = index >= keep_until && index < keep_from;
            index += 1;
            if masked {
                MASK_CHAR
            } else {
                c
            }
        })
        .collect()
}

fn mask_name(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    match chars.as_slice() {
        [] => String::new(),
        [single] => single.to_string(),
        [first, _] => format!("{first}{MASK_CHAR}"),
        [first, middle @ .., last] => {
            let mut masked = String::with_capacity(value.len());
            masked.push(*first);
            masked.extend(std::iter::repeat(MASK_CHAR).take(middle.len()));
            masked.push(*last);
            masked
        }
    }
}

fn mask_id(value: &str) -> String {
    let visible: String = value.chars().take(4).collect();
    let hidden = value.chars().count().saturating_sub(4);
    format!("{visible}{}", MASK_CHAR.to_string().repeat(hidden))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_layout() {
        let cipher = PiiCipher::new("pii-secret");
        let token = cipher.encrypt_field("홍길동").unwrap();
        let parts: Vec<&str> = token.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 32);
        assert_eq!(parts[1].len(), 32);
        assert_eq!(detect_format(&token), TokenFormat::Authenticated);
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let cipher = PiiCipher::new("pii-secret");
        let a = cipher.encrypt_field("same").unwrap();
        let b = cipher.encrypt_field("same").unwrap();
        assert_ne!(a, b);
        assert_ne!(a.split(':').next(), b.split(':').next());
    }

    #[test]
    fn test_detect_format_counts_segments() {
        assert_eq!(detect_format("plain text"), TokenFormat::Unrecognized);
        assert_eq!(detect_format("a:b:c:d"), TokenFormat::Unrecognized);
        assert_eq!(detect_format("12:30"), TokenFormat::Legacy);
        assert_eq!(detect_format(&format!("{}:abcd", "0".repeat(32))), TokenFormat::Legacy);
        assert_eq!(detect_format("zz:yy:xx"), TokenFormat::Authenticated);
    }

    #[test]
    fn test_damaged_tokens_fail_instead_of_passing_through() {
        let cipher = PiiCipher::new("pii-secret");
        let token = cipher.encrypt_field("홍길동").unwrap();
        let parts: Vec<&str> = token.split(':').collect();
        let short_tag = format!("{}:{}:{}", parts[0], &parts[1][..30], parts[2]);

        assert_eq!(cipher.decrypt_field(&short_tag), Err(CipherError::DecryptionFailed));
        assert_eq!(cipher.decrypt_field("zz:abc"), Err(CipherError::DecryptionFailed));
        assert_eq!(cipher.decrypt_field(&format!("{}:", "0".repeat(32))), Err(CipherError::DecryptionFailed));
    }

    #[test]
    fn test_mask_phone() {
        assert_eq!(mask_for_display("01012345678", MaskKind::Phone), "010****5678");
        assert_eq!(mask_for_display("010-1234-5678", MaskKind::Phone), "010-****-5678");
        assert_eq!(mask_for_display("1234567", MaskKind::Phone), "*******");
        assert_eq!(mask_for_display("123-4567", MaskKind::Phone), "***-****");
        assert_eq!(mask_for_display("12345678", MaskKind::Phone), "123*5678");
    }

    #[test]
    fn test_mask_name() {
        assert_eq!(mask_for_display("홍길동", MaskKind::Name), "홍*동");
        assert_eq!(mask_for_display("김철", MaskKind::Name), "김*");
        assert_eq!(mask_for_display("Alexander", MaskKind::Name), "A*******r");
        assert_eq!(mask_for_display("A", MaskKind::Name), "A");
        assert_eq!(mask_for_display("", MaskKind::Name), "");
    }

    #[test]
    fn test_mask_id() {
        assert_eq!(mask_for_display("900101-1234567", MaskKind::Id), "9001**********");
        assert_eq!(mask_for_display("abc", MaskKind::Id), "abc");
    }

    #[test]
    fn test_decrypted_pii_debug_is_masked() {
        let pii = DecryptedPii {
            name: Some("홍길동".to_string()),
            date_of_birth: Some("1990-01-01".to_string()),
            phone: Some("01012345678".to_string()),
        };
        let rendered = format!("{pii:?}");
        assert!(!rendered.contains("홍길동"));
        assert!(!rendered.contains("1990-01-01"));
        assert!(rendered.contains("010****5678"));
    }
}
