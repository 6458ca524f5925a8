//! # voucher-cli.rs
//!
//! Ein Kommandozeilen-Tool für Betreiber der Gutschein-Engine.
//!
//! ## Befehle:
//! - `serial`: Seriennummern erzeugen, prüfen und zerlegen.
//! - `payload`: Redemption-Payloads erzeugen und prüfen.
//! - `pii`: Einzelne PII-Felder ver- und entschlüsseln oder maskieren.
//! - `voucher`: Lebenszyklus-Operationen auf einem dateibasierten Bestand.
//!
//! Geheimnisse kommen aus `--config <datei.toml>` und/oder den Umgebungsvariablen
//! `VOUCHER_HMAC_SECRET` und `VOUCHER_PII_SECRET`.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use voucher_engine::services::utils::{local_date, parse_payload_date, parse_payload_timestamp};
use voucher_engine::{
    mask_for_display, serial_number, EngineConfig, FileStore, LifecycleStateMachine, MaskKind, NewVoucher,
    TracingAuditRecorder, Voucher, VoucherRef,
};

/// Das Haupt-Struct für das CLI-Tool, das von `clap` geparst wird.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML-Datei mit `hmac_secret` und `pii_secret`. Umgebungsvariablen haben Vorrang.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Definiert die verfügbaren Unterbefehle.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Seriennummern erzeugen und prüfen.
    #[command(subcommand)]
    Serial(SerialCommand),

    /// Redemption-Payloads erzeugen und prüfen.
    #[command(subcommand)]
    Payload(PayloadCommand),

    /// PII-Felder ver- und entschlüsseln.
    #[command(subcommand)]
    Pii(PiiCommand),

    /// Lebenszyklus-Operationen auf einem Gutscheinbestand.
    Voucher {
        /// Pfad zur JSON-Datei des Bestands.
        #[arg(short, long, env = "VOUCHER_STORE", default_value = "vouchers.json")]
        store: PathBuf,

        /// Kennung des ausführenden Bedieners für das Audit-Protokoll.
        #[arg(long, default_value = "cli")]
        actor: String,

        #[command(subcommand)]
        command: VoucherCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SerialCommand {
    /// Erzeugt die Seriennummer für eine Laufnummer und ein Ausgabedatum.
    Generate {
        sequence: u32,
        /// Ausgabedatum als YYYY-MM-DD, Standard ist heute.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Prüft Länge, Ziffern und Prüfsumme.
    Validate { serial: String },
    /// Zerlegt eine Seriennummer in ihre Bestandteile.
    Parse { serial: String },
}

#[derive(Subcommand, Debug)]
enum PayloadCommand {
    /// Baut einen signierten Payload im aktuellen Format.
    Make {
        serial: String,
        /// Ausgabedatum im Format YYYYMMDD.
        #[arg(long)]
        issued: Option<String>,
        /// Zeitstempel im Format YYYYMMDDHHMM.
        #[arg(long)]
        timestamp: Option<String>,
    },
    /// Parst einen Payload und prüft seine Signatur.
    Verify { payload: String },
}

#[derive(Subcommand, Debug)]
enum PiiCommand {
    Encrypt { value: String },
    Decrypt {
        token: String,
        /// Unbekannte Formate als Fehler behandeln statt durchzureichen.
        #[arg(long)]
        strict: bool,
    },
    /// Maskiert einen Klartext für die Anzeige (`phone`, `name`, `id`).
    Mask { kind: MaskKind, value: String },
}

#[derive(Subcommand, Debug)]
enum VoucherCommand {
    Register {
        amount: Decimal,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        birth_date: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        /// Anzahl gleichartiger Gutscheine.
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    Issue { id: Uuid },
    Use {
        serial: String,
        #[arg(long)]
        site: String,
    },
    /// Prüft einen gescannten Payload und löst ein.
    Redeem {
        payload: String,
        #[arg(long)]
        site: String,
    },
    Recall {
        /// Gutschein-ID oder Seriennummer.
        target: String,
        #[arg(long)]
        reason: String,
    },
    Dispose {
        id: Uuid,
        #[arg(long)]
        reason: String,
    },
    Delete { id: Uuid },
    Show { serial: String },
}

/// Hauptfunktion des Programms.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serial(command) => run_serial(command)?,
        Commands::Payload(command) => run_payload(command, cli.config.as_deref())?,
        Commands::Pii(command) => run_pii(command, cli.config.as_deref())?,
        Commands::Voucher { store, actor, command } => run_voucher(command, &store, &actor, cli.config.as_deref())?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Konnte Konfiguration aus {} nicht laden", path.display())),
        None => EngineConfig::from_env().context("Geheimnisse fehlen in der Umgebung"),
    }
}

fn today() -> NaiveDate {
    local_date(&Utc::now())
}

fn run_serial(command: SerialCommand) -> Result<()> {
    match command {
        SerialCommand::Generate { sequence, date } => {
            let serial = serial_number::generate(sequence, date.unwrap_or_else(today))?;
            println!("{serial}");
        }
        SerialCommand::Validate { serial } => {
            if !serial_number::validate(&serial) {
                bail!("'{serial}' ist keine gültige Seriennummer");
            }
            println!("✅ {serial} ist gültig.");
        }
        SerialCommand::Parse { serial } => {
            let parts = serial_number::parse(&serial)?;
            println!("year:     {}", parts.year);
            println!("month:    {:02}", parts.month);
            println!("sequence: {:06}", parts.sequence);
            println!("checksum: {:02}", parts.checksum);
        }
    }
    Ok(())
}

fn run_payload(command: PayloadCommand, config: Option<&Path>) -> Result<()> {
    let signer = load_config(config)?.payload_signer();
    match command {
        PayloadCommand::Make { serial, issued, timestamp } => {
            if !serial_number::validate(&serial) {
                bail!("'{serial}' ist keine gültige Seriennummer");
            }
            let payload = match (issued, timestamp) {
                (None, None) => signer.make_payload(&serial, &Utc::now()),
                (Some(issued), Some(timestamp)) => {
                    parse_payload_date(&issued).ok_or_else(|| anyhow!("ungültiges Datum '{issued}'"))?;
                    parse_payload_timestamp(&timestamp).ok_or_else(|| anyhow!("ungültiger Zeitstempel '{timestamp}'"))?;
                    signer.make_payload_from_parts(&serial, &issued, &timestamp)
                }
                _ => bail!("--issued und --timestamp nur gemeinsam angeben"),
            };
            println!("{payload}");
        }
        PayloadCommand::Verify { payload } => {
            let verified = signer.parse_payload(&payload)?;
            println!("serial: {}", verified.serial);
            println!("kind:   {:?}", verified.kind);
            if let Some(issued) = verified.issued_date {
                println!("issued: {issued}");
            }
            if !verified.kind.is_signed() {
                println!("⚠️  Keine Signatur geprüft (bloße Seriennummer).");
            }
        }
    }
    Ok(())
}

fn run_pii(command: PiiCommand, config: Option<&Path>) -> Result<()> {
    match command {
        PiiCommand::Encrypt { value } => {
            let cipher = load_config(config)?.pii_cipher();
            println!("{}", cipher.encrypt_field(&value)?);
        }
        PiiCommand::Decrypt { token, strict } => {
            let cipher = load_config(config)?.pii_cipher();
            let plaintext = if strict { cipher.decrypt_field_strict(&token)? } else { cipher.decrypt_field(&token)? };
            println!("{plaintext}");
        }
        // Maskieren braucht kein Geheimnis.
        PiiCommand::Mask { kind, value } => println!("{}", mask_for_display(&value, kind)),
    }
    Ok(())
}

fn run_voucher(command: VoucherCommand, store_path: &Path, actor: &str, config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let store = FileStore::open(store_path)
        .with_context(|| format!("Konnte Bestand {} nicht öffnen", store_path.display()))?;
    let engine = LifecycleStateMachine::from_config(&config, Arc::new(store), Arc::new(TracingAuditRecorder));

    match command {
        VoucherCommand::Register { amount, date, name, birth_date, phone, count } => {
            let pii = config
                .pii_cipher()
                .encrypt_pii(name.as_deref(), birth_date.as_deref(), phone.as_deref())?;
            let entries = (0..count).map(|_| NewVoucher::new(amount, pii.clone())).collect();
            for voucher in engine.register_batch(entries, date.unwrap_or_else(today), actor)? {
                println!("{}  {}", voucher.id(), voucher.serial_no());
            }
        }
        VoucherCommand::Issue { id } => {
            let outcome = engine.issue(id, actor)?;
            if outcome.reissued {
                println!("ℹ️  Gutschein wurde erneut ausgegeben.");
            }
            let payload = engine
                .payload_for(&outcome.voucher)
                .ok_or_else(|| anyhow!("Gutschein hat kein Ausgabedatum"))?;
            println!("{payload}");
        }
        VoucherCommand::Use { serial, site } => print_voucher(&engine.use_voucher(&serial, &site, actor)?),
        VoucherCommand::Redeem { payload, site } => {
            let redemption = engine.redeem(&payload, &site, actor)?;
            if let Some(d) = redemption.discrepancy {
                println!("⚠️  Ausgabedatum weicht ab: Payload {} / gespeichert {}", d.payload_date, d.recorded_date);
            }
            print_voucher(&redemption.voucher);
        }
        VoucherCommand::Recall { target, reason } => {
            let target = match Uuid::parse_str(&target) {
                Ok(id) => VoucherRef::Id(id),
                Err(_) => VoucherRef::Serial(target),
            };
            print_voucher(&engine.recall(target, &reason, actor)?);
        }
        VoucherCommand::Dispose { id, reason } => print_voucher(&engine.dispose(id, &reason, actor)?),
        VoucherCommand::Delete { id } => {
            engine.delete(id, actor)?;
            println!("✅ Gutschein {id} gelöscht.");
        }
        VoucherCommand::Show { serial } => {
            let voucher = engine
                .find_by_serial(&serial)?
                .ok_or_else(|| anyhow!("Gutschein '{serial}' nicht gefunden"))?;
            print_voucher(&voucher);
        }
    }
    Ok(())
}

fn print_voucher(voucher: &Voucher) {
    println!("id:     {}", voucher.id());
    println!("serial: {}", voucher.serial_no());
    println!("status: {}", voucher.status());
    println!("amount: {}", voucher.amount());
    if let Some(site) = voucher.used_at_site_id() {
        println!("site:   {site}");
    }
    if let Some(reason) = voucher.recall_reason().or(voucher.disposal_reason()) {
        println!("reason: {reason}");
    }
}
