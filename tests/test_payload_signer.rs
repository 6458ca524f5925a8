//! tests/test_payload_signer.rs
//!
//! Integrationstests für Erzeugen, Parsen und Prüfen der Redemption-Payloads.

use voucher_engine::services::payload_signer::PayloadError;
use voucher_engine::services::utils::local_date;
use voucher_engine::test_utils::{date, local_time, test_signer};
use voucher_engine::{PayloadKind, PayloadSigner};

const SERIAL: &str = "20241200000130";

#[test]
fn test_current_payload_round_trip() {
    let signer = test_signer();
    let issued_at = local_time(2024, 12, 5, 14, 30);
    let payload = signer.make_payload(SERIAL, &issued_at);

    assert!(payload.starts_with("VCH:20241200000130|ISSUED:20241205|TS:202412051430|SIG:"));

    let verified = signer.parse_payload(&payload).unwrap();
    assert_eq!(verified.serial, SERIAL);
    assert_eq!(verified.kind, PayloadKind::Current);
    assert_eq!(verified.issued_date, Some(date(2024, 12, 5)));
    assert_eq!(verified.issued_date, Some(local_date(&issued_at)));
    assert!(verified.kind.is_signed());
}

#[test]
fn test_sign_and_verify_match() {
    let signer = test_signer();
    let sig = signer.sign(SERIAL, "20241205", "202412051430");
    assert!(signer.verify(SERIAL, "20241205", "202412051430", &sig));
    assert!(!signer.verify(SERIAL, "20241206", "202412051430", &sig));
    assert!(!signer.verify(SERIAL, "20241205", "202412051431", &sig));
    assert!(!PayloadSigner::new("other-secret").verify(SERIAL, "20241205", "202412051430", &sig));
}

#[test]
fn test_tampered_segments_are_rejected() {
    let signer = test_signer();
    let sig = signer.sign(SERIAL, "20241205", "202412051430");

    let tampered_date = format!("VCH:{SERIAL}|ISSUED:20241204|TS:202412051430|SIG:{sig}");
    assert_eq!(signer.parse_payload(&tampered_date), Err(PayloadError::InvalidSignature));

    let tampered_ts = format!("VCH:{SERIAL}|ISSUED:20241205|TS:202412051431|SIG:{sig}");
    assert_eq!(signer.parse_payload(&tampered_ts), Err(PayloadError::InvalidSignature));

    // Andere gültige Seriennummer: die Prüfsumme passt, die Signatur nicht.
    let other_serial = "20241200000231";
    assert!(voucher_engine::serial_number::validate(other_serial));
    let tampered_serial = format!("VCH:{other_serial}|ISSUED:20241205|TS:202412051430|SIG:{sig}");
    assert_eq!(signer.parse_payload(&tampered_serial), Err(PayloadError::InvalidSignature));

    let mut flipped = sig.clone().into_bytes();
    flipped[0] = if flipped[0] == b'0' { b'1' } else { b'0' };
    let flipped = String::from_utf8(flipped).unwrap();
    let tampered_sig = format!("VCH:{SERIAL}|ISSUED:20241205|TS:202412051430|SIG:{flipped}");
    assert_eq!(signer.parse_payload(&tampered_sig), Err(PayloadError::InvalidSignature));
}

#[test]
fn test_wrong_key_is_rejected() {
    let payload = test_signer().make_payload(SERIAL, &local_time(2024, 12, 5, 9, 0));
    assert_eq!(
        PayloadSigner::new("another-secret").parse_payload(&payload),
        Err(PayloadError::InvalidSignature)
    );
}

#[test]
fn test_formats_do_not_accept_each_others_signatures() {
    let signer = test_signer();
    let current_sig = signer.sign(SERIAL, "20241205", "202412051430");
    let legacy_sig = signer.sign_legacy(SERIAL, "202412051430");
    assert_ne!(current_sig, legacy_sig);

    let legacy_with_current_sig = format!("VCH:{SERIAL}|TS:202412051430|SIG:{current_sig}");
    assert_eq!(signer.parse_payload(&legacy_with_current_sig), Err(PayloadError::InvalidSignature));

    let current_with_legacy_sig = format!("VCH:{SERIAL}|ISSUED:20241205|TS:202412051430|SIG:{legacy_sig}");
    assert_eq!(signer.parse_payload(&current_with_legacy_sig), Err(PayloadError::InvalidSignature));
}

#[test]
fn test_legacy_payload_is_accepted_without_issue_date() {
    let signer = test_signer();
    let payload = signer.make_legacy_payload(SERIAL, &local_time(2024, 12, 5, 14, 30));
    assert!(!payload.contains("ISSUED:"));

    let verified = signer.parse_payload(&payload).unwrap();
    assert_eq!(verified.kind, PayloadKind::Legacy);
    assert_eq!(verified.issued_date, None);
    assert!(verified.timestamp.is_some());
}

#[test]
fn test_bare_serial_requires_valid_checksum_only() {
    let signer = test_signer();
    let verified = signer.parse_payload(SERIAL).unwrap();
    assert_eq!(verified.kind, PayloadKind::BareSerial);
    assert!(!verified.kind.is_signed());
    assert_eq!(verified.issued_date, None);

    assert_eq!(
        signer.parse_payload("20241200000131"),
        Err(PayloadError::InvalidSerial("20241200000131".to_string()))
    );
}

#[test]
fn test_malformed_payloads() {
    let signer = test_signer();
    let sig = signer.sign(SERIAL, "20241205", "202412051430");
    let cases = [
        "VCH:".to_string(),
        format!("VCH:{SERIAL}"),
        format!("VCH:{SERIAL}|ISSUED:20241205|TS:202412051430"),
        format!("VCH:{SERIAL}|ISSUED:20241205|TS:202412051430|SIG:{sig}|EXTRA:1"),
        format!("VCH:{SERIAL}|ISSUED:2024125|TS:202412051430|SIG:{sig}"),
        format!("VCH:{SERIAL}|ISSUED:20241205|TS:2024120514|SIG:{sig}"),
        format!("VCH:{SERIAL}|ISSUED:20241205|TS:202412051430|SIG:abcd"),
        format!("VCH:{SERIAL}|ISSUED:20241205|XX:202412051430|SIG:{sig}"),
    ];
    for payload in &cases {
        assert!(
            matches!(signer.parse_payload(payload), Err(PayloadError::Malformed(_))),
            "expected Malformed for {payload}"
        );
    }

    let bad_serial = format!("VCH:20241200000131|ISSUED:20241205|TS:202412051430|SIG:{sig}");
    assert!(matches!(signer.parse_payload(&bad_serial), Err(PayloadError::InvalidSerial(_))));
}

#[test]
fn test_surrounding_whitespace_from_scanners_is_ignored() {
    let signer = test_signer();
    let payload = signer.make_payload(SERIAL, &local_time(2024, 12, 5, 8, 15));
    let verified = signer.parse_payload(&format!("  {payload}\n")).unwrap();
    assert_eq!(verified.kind, PayloadKind::Current);
}
