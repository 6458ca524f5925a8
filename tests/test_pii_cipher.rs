//! tests/test_pii_cipher.rs
//!
//! Integrationstests für die Feldverschlüsselung und die Maskierung.

use voucher_engine::services::pii_cipher::{detect_format, CipherError, TokenFormat};
use voucher_engine::test_utils::test_cipher;
use voucher_engine::{mask_for_display, MaskKind, PiiCipher};

#[test]
fn test_round_trip_unicode_and_edge_values() {
    let cipher = test_cipher();
    for plaintext in ["홍길동", "1950-03-01", "010-1234-5678", "", "Ünïcødé 😀 混合", &"x".repeat(4096)] {
        let token = cipher.encrypt_field(plaintext).unwrap();
        assert_eq!(detect_format(&token), TokenFormat::Authenticated);
        assert!(!token.contains(plaintext) || plaintext.is_empty());
        assert_eq!(cipher.decrypt_field(&token).unwrap(), plaintext);
        assert_eq!(cipher.decrypt_field_strict(&token).unwrap(), plaintext);
    }
}

#[test]
fn test_wrong_key_fails_authentication() {
    let token = test_cipher().encrypt_field("홍길동").unwrap();
    assert_eq!(
        PiiCipher::new("a-different-secret").decrypt_field(&token),
        Err(CipherError::DecryptionFailed)
    );
}

#[test]
fn test_tampered_token_is_rejected() {
    let cipher = test_cipher();
    let token = cipher.encrypt_field("010-1234-5678").unwrap();
    let parts: Vec<&str> = token.split(':').collect();

    let flip = |hex_str: &str| -> String {
        let mut bytes = hex::decode(hex_str).unwrap();
        bytes[0] ^= 0x01;
        hex::encode(bytes)
    };

    let bad_cipher = format!("{}:{}:{}", parts[0], parts[1], flip(parts[2]));
    let bad_tag = format!("{}:{}:{}", parts[0], flip(parts[1]), parts[2]);
    let bad_iv = format!("{}:{}:{}", flip(parts[0]), parts[1], parts[2]);
    for tampered in [bad_cipher, bad_tag, bad_iv] {
        assert_eq!(cipher.decrypt_field(&tampered), Err(CipherError::DecryptionFailed));
    }
}

#[test]
fn test_legacy_tokens_remain_readable() {
    let cipher = test_cipher();
    for plaintext in ["김철수", "1988-12-24", "exactly sixteen!", ""] {
        let token = cipher.encrypt_legacy_field(plaintext).unwrap();
        assert_eq!(detect_format(&token), TokenFormat::Legacy);
        assert_eq!(cipher.decrypt_field(&token).unwrap(), plaintext);
    }
}

#[test]
fn test_unrecognized_values_pass_through_only_in_soft_mode() {
    let cipher = test_cipher();
    for raw in ["홍길동", "plain text", "010-1234-5678", "a:b:c:d"] {
        assert_eq!(cipher.decrypt_field(raw).unwrap(), raw);
        assert_eq!(cipher.decrypt_field_strict(raw), Err(CipherError::UnrecognizedFormat));
    }
}

#[test]
fn test_corrupted_tokens_are_never_returned_as_plaintext() {
    let cipher = test_cipher();
    let token = cipher.encrypt_field("010-1234-5678").unwrap();
    let parts: Vec<&str> = token.split(':').collect();

    let truncated_tag = format!("{}:{}:{}", parts[0], &parts[1][..30], parts[2]);
    let truncated_iv = format!("{}:{}:{}", &parts[0][..31], parts[1], parts[2]);
    let not_hex = format!("{}:{}:{}", parts[0], parts[1], "xyz");
    for damaged in [truncated_tag, truncated_iv, not_hex, "zz:abc".to_string(), "12:30".to_string()] {
        assert_eq!(cipher.decrypt_field(&damaged), Err(CipherError::DecryptionFailed), "{damaged}");
        assert_eq!(cipher.decrypt_field_strict(&damaged), Err(CipherError::DecryptionFailed), "{damaged}");
    }
}

#[test]
fn test_encrypt_and_decrypt_pii_record() {
    let cipher = test_cipher();
    let fields = cipher.encrypt_pii(Some("홍길동"), None, Some("01012345678")).unwrap();
    assert!(fields.date_of_birth.is_none());
    assert_ne!(fields.name.as_deref(), Some("홍길동"));

    let decrypted = cipher.decrypt_pii(&fields).unwrap();
    assert_eq!(decrypted.name.as_deref(), Some("홍길동"));
    assert_eq!(decrypted.date_of_birth, None);
    assert_eq!(decrypted.phone.as_deref(), Some("01012345678"));
}

#[test]
fn test_decrypt_pii_is_strict() {
    let cipher = test_cipher();
    let mut fields = cipher.encrypt_pii(Some("홍길동"), None, None).unwrap();
    fields.phone = Some("010-0000-0000".to_string());
    assert_eq!(cipher.decrypt_pii(&fields).unwrap_err(), CipherError::UnrecognizedFormat);
}

#[test]
fn test_masking_for_display() {
    assert_eq!(mask_for_display("010-9876-5432", MaskKind::Phone), "010-****-5432");
    assert_eq!(mask_for_display("홍길동", MaskKind::Name), "홍*동");
    assert_eq!(mask_for_display("남궁민수", MaskKind::Name), "남**수");
    assert_eq!(mask_for_display("ID-20241205", MaskKind::Id), "ID-2*******");
    assert_eq!("phone".parse::<MaskKind>(), Ok(MaskKind::Phone));
    assert!("email".parse::<MaskKind>().is_err());
}
