use std::{fmt, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zkledger_ledger::{
    config::NOTE_KEY_ENV, Ledger, LedgerConfig, MemoryVault, NoopPublisher, Note,
};
use zkledger_merkle::{digest_from_hex, Digest};

const DEFAULT_LOG_FILTER: &str = "info,zkledger=debug";

#[derive(Parser)]
#[command(name = "zkledger", about = "Inspect and drive zkledger note/nullifier ledgers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a proof/witness pair as a new note, spending the previous note.
    Record(RecordArgs),
    /// Spend a note whose successor was recorded without spending it.
    ///
    /// The newest note is spent by the next record and is rejected here.
    Nullify(IndexArgs),
    /// Print heights and roots of both trees.
    Status(ProverArgs),
    /// Decrypt the note at an index and print it with its nullifier key.
    Note(IndexArgs),
    /// Print the value stored under a nullifier key.
    Nullifier(NullifierArgs),
    /// Reload both trees from disk and re-verify them.
    Check(ProverArgs),
}

#[derive(Args)]
struct ProverArgs {
    #[arg(long)]
    prover: String,
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct RecordArgs {
    #[command(flatten)]
    prover: ProverArgs,
    /// Proof bytes, hex encoded.
    #[arg(long)]
    proof: String,
    /// Witness bytes, hex encoded.
    #[arg(long)]
    witness: String,
}

#[derive(Args)]
struct IndexArgs {
    #[command(flatten)]
    prover: ProverArgs,
    #[arg(long)]
    index: usize,
}

#[derive(Args)]
struct NullifierArgs {
    #[command(flatten)]
    prover: ProverArgs,
    /// Nullifier key, 32 bytes hex.
    #[arg(long)]
    key: String,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = LedgerConfig::from_env().context("invalid zkledger configuration")?;
    match cli.command {
        Commands::Record(args) => record(&config, args),
        Commands::Nullify(args) => nullify(&config, args),
        Commands::Status(args) => status(&config, args),
        Commands::Note(args) => note(&config, args),
        Commands::Nullifier(args) => nullifier(&config, args),
        Commands::Check(args) => check(&config, args),
    }
}

/// Open a prover's ledger; inspection commands pass `read_only`.
fn open_ledger(config: &LedgerConfig, prover: &str, read_only: bool) -> Result<Ledger> {
    let store = config
        .open_store()
        .with_context(|| format!("failed to open record store at {}", config.db_path.display()))?;
    store.set_read_only(read_only);

    let vault = MemoryVault::new();
    if let Some(key) = &config.note_key {
        vault.set_key(prover, key).context("invalid note key")?;
    }

    Ledger::open(
        store,
        config.ledger_params(prover),
        Arc::new(vault),
        Arc::new(NoopPublisher),
    )
    .with_context(|| format!("failed to open ledger for prover {prover}"))
}

fn require_note_key(config: &LedgerConfig) -> Result<()> {
    if config.note_key.is_none() {
        bail!("{NOTE_KEY_ENV} must be set to a 32-byte hex key to read or write notes");
    }
    Ok(())
}

fn record(config: &LedgerConfig, args: RecordArgs) -> Result<()> {
    require_note_key(config)?;
    let proof = decode_hex(&args.proof).context("--proof is not valid hex")?;
    let witness = decode_hex(&args.witness).context("--witness is not valid hex")?;

    let ledger = open_ledger(config, &args.prover.prover, false)?;
    let receipt = ledger
        .record_proof(&Note::new(proof, witness))
        .context("failed to record proof")?;
    info!(index = receipt.index, "recorded note");

    let summary = RecordSummary {
        index: receipt.index,
        note_root: hex::encode(receipt.note_root),
        nullified_index: receipt.nullified.as_ref().map(|n| n.index),
        nullifier: receipt.nullified.as_ref().map(|n| hex::encode(n.key)),
    };
    output_summary(&summary, args.prover.json)
}

fn nullify(config: &LedgerConfig, args: IndexArgs) -> Result<()> {
    require_note_key(config)?;
    let ledger = open_ledger(config, &args.prover.prover, false)?;
    let spent = ledger
        .nullify_note(args.index)
        .with_context(|| format!("failed to nullify note {}", args.index))?;

    let summary = NullifySummary {
        index: spent.index,
        nullifier: hex::encode(spent.key),
        nullifier_root: hex::encode(spent.nullifier_root),
    };
    output_summary(&summary, args.prover.json)
}

fn status(config: &LedgerConfig, args: ProverArgs) -> Result<()> {
    let ledger = open_ledger(config, &args.prover, true)?;
    let status = ledger.status()?;
    let summary = StatusSummary {
        prover: status.prover_id,
        hash: config.hash.to_string(),
        note_height: status.note_height,
        note_root: status.note_root.map(hex::encode),
        nullifier_height: status.nullifier_height,
        nullifier_root: hex::encode(status.nullifier_root),
    };
    output_summary(&summary, args.json)
}

fn note(config: &LedgerConfig, args: IndexArgs) -> Result<()> {
    require_note_key(config)?;
    let ledger = open_ledger(config, &args.prover.prover, true)?;
    let note = ledger
        .note_at(args.index)
        .with_context(|| format!("failed to read note {}", args.index))?;
    let (_, key) = ledger.note_value_at(args.index)?;

    let summary = NoteSummary {
        index: args.index,
        proof: hex::encode(&note.proof),
        witness: hex::encode(&note.witness),
        nullifier: hex::encode(key),
        spent: ledger.is_spent(args.index)?,
    };
    output_summary(&summary, args.prover.json)
}

fn nullifier(config: &LedgerConfig, args: NullifierArgs) -> Result<()> {
    let key: Digest = digest_from_hex(&args.key).context("--key must be 32 bytes of hex")?;
    let ledger = open_ledger(config, &args.prover.prover, true)?;
    let value = ledger
        .nullifier_value_at(&key)
        .with_context(|| format!("no nullifier stored under {}", args.key))?;

    let summary = NullifierSummary {
        key: hex::encode(key),
        value: String::from_utf8_lossy(&value).into_owned(),
    };
    output_summary(&summary, args.prover.json)
}

fn check(config: &LedgerConfig, args: ProverArgs) -> Result<()> {
    // Opening the ledger replays and verifies both trees.
    let ledger = open_ledger(config, &args.prover, true)?;
    ledger.verify().context("in-memory verification failed")?;
    let status = ledger.status()?;

    let summary = CheckSummary {
        prover: status.prover_id,
        notes: status.note_height,
        nullifiers: status.nullifier_height,
        ok: true,
    };
    output_summary(&summary, args.json)
}

fn decode_hex(value: &str) -> Result<Vec<u8>> {
    let trimmed = value.strip_prefix("0x").unwrap_or(value);
    Ok(hex::decode(trimmed)?)
}

fn output_summary<T>(summary: &T, json: bool) -> Result<()>
where
    T: Serialize + fmt::Display,
{
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        println!("{}", summary);
    }
    Ok(())
}

#[derive(Serialize)]
struct RecordSummary {
    index: usize,
    note_root: String,
    nullified_index: Option<usize>,
    nullifier: Option<String>,
}

impl fmt::Display for RecordSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Recorded note {}", self.index)?;
        write!(f, "  note root: {}", self.note_root)?;
        if let (Some(index), Some(nullifier)) = (self.nullified_index, &self.nullifier) {
            write!(f, "\n  spent note {index} (nullifier {nullifier})")?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct NullifySummary {
    index: usize,
    nullifier: String,
    nullifier_root: String,
}

impl fmt::Display for NullifySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Nullified note {}", self.index)?;
        writeln!(f, "  nullifier: {}", self.nullifier)?;
        write!(f, "  nullifier root: {}", self.nullifier_root)
    }
}

#[derive(Serialize)]
struct StatusSummary {
    prover: String,
    hash: String,
    note_height: usize,
    note_root: Option<String>,
    nullifier_height: usize,
    nullifier_root: String,
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Prover {} ({})", self.prover, self.hash)?;
        writeln!(
            f,
            "  notes:      {} (root {})",
            self.note_height,
            self.note_root.as_deref().unwrap_or("-")
        )?;
        write!(
            f,
            "  nullifiers: {} (root {})",
            self.nullifier_height, self.nullifier_root
        )
    }
}

#[derive(Serialize)]
struct NoteSummary {
    index: usize,
    proof: String,
    witness: String,
    nullifier: String,
    spent: bool,
}

impl fmt::Display for NoteSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Note {}{}", self.index, if self.spent { " (spent)" } else { "" })?;
        writeln!(f, "  proof:     {}", self.proof)?;
        writeln!(f, "  witness:   {}", self.witness)?;
        write!(f, "  nullifier: {}", self.nullifier)
    }
}

#[derive(Serialize)]
struct NullifierSummary {
    key: String,
    value: String,
}

impl fmt::Display for NullifierSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Nullifier {}", self.key)?;
        write!(f, "  value: {}", self.value)
    }
}

#[derive(Serialize)]
struct CheckSummary {
    prover: String,
    notes: usize,
    nullifiers: usize,
    ok: bool,
}

impl fmt::Display for CheckSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Prover {}: {} notes, {} nullifiers, integrity {}",
            self.prover,
            self.notes,
            self.nullifiers,
            if self.ok { "ok" } else { "FAILED" }
        )
    }
}
