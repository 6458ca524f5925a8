//! # src/test_utils.rs
//!
//! Zentrale Hilfsfunktionen für alle Tests (intern und extern).
//!
//! Alle Zeitpunkte werden über `local_noon` in lokaler Zeit gebildet, damit
//! "heute" und das Ausgabedatum unabhängig von der Zeitzone der Testmaschine sind.

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::audit::MemoryAuditRecorder;
use crate::models::audit::{AuditAction, AuditEvent};
use crate::models::voucher::{PiiFields, Voucher};
use crate::services::lifecycle::{LifecycleStateMachine, NewVoucher};
use crate::services::payload_signer::PayloadSigner;
use crate::services::pii_cipher::PiiCipher;
use crate::services::utils::{local_date, Clock, FixedClock};
use crate::storage::memory_storage::MemoryStore;
use crate::storage::VoucherStore;

pub const TEST_HMAC_SECRET: &str = "test-hmac-secret-do-not-use";
pub const TEST_PII_SECRET: &str = "test-pii-secret-do-not-use";
pub const TEST_ACTOR: &str = "operator-01";
pub const TEST_SITE: &str = "site-001";

/// 12:00 Uhr Ortszeit am gegebenen Tag, als UTC-Zeitpunkt.
pub fn local_noon(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    local_time(year, month, day, 12, 0)
}

pub fn local_time(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Local
        .with_ymd_and_hms(year, month, day, hour, minute, 0)
        .earliest()
        .expect("test timestamps must exist in the local time zone")
        .with_timezone(&Utc)
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid test date")
}

pub fn test_signer() -> PayloadSigner {
    PayloadSigner::new(TEST_HMAC_SECRET)
}

pub fn test_cipher() -> PiiCipher {
    PiiCipher::new(TEST_PII_SECRET)
}

/// Ein Registrierungseintrag mit verschlüsselten Beispieldaten.
pub fn sample_entry(amount: Decimal) -> NewVoucher {
    let pii = test_cipher()
        .encrypt_pii(Some("홍길동"), Some("1950-03-01"), Some("010-1234-5678"))
        .expect("encrypting test PII");
    NewVoucher::new(amount, pii)
}

pub fn plain_entry(amount: Decimal) -> NewVoucher {
    NewVoucher::new(amount, PiiFields::default())
}

/// Eine Zustandsmaschine mit In-Memory-Speicher, gesammeltem Audit und fester Uhr.
pub struct TestEngine {
    pub engine: LifecycleStateMachine,
    pub store: Arc<dyn VoucherStore>,
    pub audit: Arc<MemoryAuditRecorder>,
    pub clock: Arc<FixedClock>,
}

impl TestEngine {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), now)
    }

    pub fn with_store(store: Arc<dyn VoucherStore>, now: DateTime<Utc>) -> Self {
        let audit = Arc::new(MemoryAuditRecorder::new());
        let clock = Arc::new(FixedClock::new(now));
        let engine = LifecycleStateMachine::new(store.clone(), audit.clone(), test_signer()).with_clock(clock.clone());
        TestEngine { engine, store, audit, clock }
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        self.clock.set(now);
    }

    /// Registriert einen Gutschein mit dem heutigen Datum als Ausgabedatum.
    pub fn registered(&self, amount: Decimal) -> Voucher {
        let today = local_date(&self.clock.now());
        self.engine
            .register(plain_entry(amount), today, TEST_ACTOR)
            .expect("registering test voucher")
    }

    /// Registriert und gibt einen Gutschein aus.
    pub fn issued(&self, amount: Decimal) -> Voucher {
        let voucher = self.registered(amount);
        self.engine
            .issue(voucher.id(), TEST_ACTOR)
            .expect("issuing test voucher")
            .voucher
    }

    pub fn payload_for(&self, voucher: &Voucher) -> String {
        self.engine.payload_for(voucher).expect("voucher has been issued")
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.audit.events()
    }

    pub fn events_for(&self, action: AuditAction) -> Vec<AuditEvent> {
        self.events().into_iter().filter(|e| e.action == action).collect()
    }
}
