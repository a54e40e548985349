use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use persona_core::{
    ActorId, Field, HistoryEntry, MergeSubjectsInput, MigrateTimelineInput, MigrationRecord,
    PersonMergeApi, PersonMigrationApi, PersonReadApi, SubjectId, entry_order,
};
use persona_store::PersonaStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::ImportTimeline(args) => import_timeline(args).await,
        Command::History(args) => show_history(args).await,
        Command::Merge(args) => merge(args).await,
        Command::Anomalies(args) => show_anomalies(args).await,
        Command::Health(args) => check_health(args).await,
    }
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Developer utilities for persona history stores"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a subject's full timeline from a JSON export, replacing earlier migrations.
    ImportTimeline(ImportTimelineArgs),
    /// Print the history of one field, oldest first.
    History(HistoryArgs),
    /// Merge one subject's timeline into another.
    Merge(MergeArgs),
    /// List entries whose interval could not be resolved.
    Anomalies(SubjectArgs),
    /// Check interval validity, single open entries and live values for every subject.
    Health(HealthArgs),
}

#[derive(Parser)]
struct DatastoreArgs {
    /// Directory holding persona.json and the SQLite file.
    #[arg(long, default_value = ".persona")]
    datastore: PathBuf,
}

#[derive(Parser)]
struct ImportTimelineArgs {
    #[command(flatten)]
    store: DatastoreArgs,
    #[arg(long)]
    subject: String,
    /// JSON array of migration records.
    #[arg(long)]
    input: PathBuf,
    /// Actor recorded for fields without source metadata (random when omitted).
    #[arg(long)]
    actor: Option<String>,
}

#[derive(Parser)]
struct HistoryArgs {
    #[command(flatten)]
    store: DatastoreArgs,
    #[arg(long)]
    subject: String,
    #[arg(long)]
    field: Field,
}

#[derive(Parser)]
struct MergeArgs {
    #[command(flatten)]
    store: DatastoreArgs,
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: String,
}

#[derive(Parser)]
struct SubjectArgs {
    #[command(flatten)]
    store: DatastoreArgs,
    #[arg(long)]
    subject: String,
}

#[derive(Parser)]
struct HealthArgs {
    #[command(flatten)]
    store: DatastoreArgs,
    /// Reduce output to errors only.
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

async fn open(args: &DatastoreArgs) -> Result<PersonaStore> {
    PersonaStore::open(&args.datastore)
        .await
        .with_context(|| format!("open datastore {}", args.datastore.display()))
}

fn subject(raw: &str) -> Result<SubjectId> {
    SubjectId::parse(raw).with_context(|| format!("invalid subject id '{raw}'"))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn import_timeline(args: ImportTimelineArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.input)
        .with_context(|| format!("read {}", args.input.display()))?;
    let records: Vec<MigrationRecord> = serde_json::from_str(&raw)
        .with_context(|| format!("parse records in {}", args.input.display()))?;
    let actor = match args.actor.as_deref() {
        Some(raw) => ActorId::parse(raw).with_context(|| format!("invalid actor id '{raw}'"))?,
        None => ActorId::new(),
    };
    let store = open(&args.store).await?;
    let report = store
        .migrate_timeline(MigrateTimelineInput {
            subject_id: subject(&args.subject)?,
            actor,
            records,
        })
        .await?;
    print_json(&report)
}

async fn show_history(args: HistoryArgs) -> Result<()> {
    let store = open(&args.store).await?;
    let history = store
        .field_history(subject(&args.subject)?, args.field)
        .await?;
    print_json(&history)
}

async fn merge(args: MergeArgs) -> Result<()> {
    let store = open(&args.store).await?;
    let report = store
        .merge_subjects(MergeSubjectsInput {
            from: subject(&args.from)?,
            to: subject(&args.to)?,
        })
        .await?;
    print_json(&report)
}

async fn show_anomalies(args: SubjectArgs) -> Result<()> {
    let store = open(&args.store).await?;
    let anomalies = store.list_anomalies(subject(&args.subject)?).await?;
    print_json(&anomalies)
}

struct Finding {
    kind: &'static str,
    message: String,
}

/// Checks one field's history: consistent intervals, at most one open entry
/// and a live value equal to the head of the history.
fn check_field(
    subject_id: SubjectId,
    field: Field,
    history: &[HistoryEntry],
    live: Option<&persona_core::FieldValue>,
    findings: &mut Vec<Finding>,
) {
    for entry in history.iter().filter(|entry| !entry.interval_is_consistent()) {
        findings.push(Finding {
            kind: "error",
            message: format!(
                "{subject_id}/{field}: entry {} ends before it starts",
                entry.entry_id
            ),
        });
    }
    let open = history.iter().filter(|entry| entry.is_open()).count();
    if open > 1 {
        findings.push(Finding {
            kind: "error",
            message: format!("{subject_id}/{field}: {open} open entries"),
        });
    }
    let head = history
        .iter()
        .max_by(|left, right| entry_order(left, right))
        .and_then(|entry| entry.value.as_ref());
    if !history.is_empty() && head != live {
        findings.push(Finding {
            kind: "error",
            message: format!("{subject_id}/{field}: live value differs from latest entry"),
        });
    }
    let anomalous = history.iter().filter(|entry| entry.anomalous).count();
    if anomalous > 0 {
        findings.push(Finding {
            kind: "warning",
            message: format!("{subject_id}/{field}: {anomalous} anomalous entries"),
        });
    }
}

async fn check_health(args: HealthArgs) -> Result<()> {
    let store = open(&args.store).await?;
    let subjects = store.subject_ids().await?;
    let mut findings = Vec::new();
    for subject_id in &subjects {
        let view = store.read_person(*subject_id).await?;
        for field in Field::ALL {
            let history = store.field_history(*subject_id, field).await?;
            let live = field.get(&view.state);
            check_field(*subject_id, field, &history, live.as_ref(), &mut findings);
        }
    }

    let errors = findings.iter().filter(|finding| finding.kind == "error").count();
    for finding in &findings {
        if args.quiet && finding.kind != "error" {
            continue;
        }
        println!("[{}] {}", finding.kind, finding.message);
    }
    if !args.quiet {
        println!(
            "checked {} subjects: {errors} errors, {} warnings",
            subjects.len(),
            findings.len() - errors
        );
    }
    if errors > 0 {
        return Err(anyhow!("datastore has {errors} integrity errors"));
    }
    Ok(())
}
