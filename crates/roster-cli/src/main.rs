use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use roster_core::{
    Classification, DeletedAccountClassifier, DeletionAttempt, DeletionOutcome, IngestConfig,
    IngestionPhase, MemberId, MemberQuery, MemberRecord, NamePattern,
};
use roster_ingest::{IngestEngine, NdjsonFileSource, ProgressReport};
use roster_store_sqlite::SqliteStore;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const CLASSIFY_CHUNK: usize = 1_000;

#[derive(Debug, Parser)]
#[command(name = "roster")]
#[command(about = "Checkpointed member roster ingestion and cleanup")]
struct Cli {
    #[arg(long, env = "ROSTER_DB", default_value = "./roster.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Ingest(Box<IngestArgs>),
    Checkpoint {
        #[command(subcommand)]
        command: Box<CheckpointCommand>,
    },
    Members {
        #[command(subcommand)]
        command: Box<MembersCommand>,
    },
    Deletion {
        #[command(subcommand)]
        command: Box<DeletionCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long)]
    target: String,
    /// Newline-delimited JSON listing, one member per line.
    #[arg(long = "from")]
    from: PathBuf,
    /// JSON file with `IngestConfig` fields; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, env = "ROSTER_PAGE_SIZE")]
    page_size: Option<u32>,
    #[arg(long, env = "ROSTER_DELAY_MS")]
    delay_ms: Option<u64>,
    #[arg(long, env = "ROSTER_CHECKPOINT_EVERY")]
    checkpoint_every: Option<u32>,
    #[arg(long, env = "ROSTER_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,
    #[arg(long, env = "ROSTER_REJECT_THRESHOLD")]
    reject_threshold: Option<f64>,
}

#[derive(Debug, Subcommand)]
enum CheckpointCommand {
    Show(TargetArgs),
    List,
    Reset(TargetArgs),
}

#[derive(Debug, Args)]
struct TargetArgs {
    #[arg(long)]
    target: String,
}

#[derive(Debug, Subcommand)]
enum MembersCommand {
    List(MembersListArgs),
    Classify(MembersClassifyArgs),
    Move(MembersMoveArgs),
    Counts(OptionalTargetArgs),
}

#[derive(Debug, Args)]
struct MembersListArgs {
    #[arg(long)]
    target: Option<String>,
    #[arg(long, value_enum, default_value_t = PatternArg::Any)]
    pattern: PatternArg,
    #[arg(long)]
    after: Option<i64>,
    #[arg(long, default_value_t = 100)]
    limit: usize,
}

#[derive(Debug, Args)]
struct MembersClassifyArgs {
    #[arg(long)]
    target: Option<String>,
    #[arg(long, default_value_t = 0.8)]
    min_confidence: f64,
    /// Also report weaker signals (placeholder usernames, default names).
    #[arg(long, default_value_t = false)]
    all_signals: bool,
}

#[derive(Debug, Args)]
struct MembersMoveArgs {
    #[arg(long = "id", required = true)]
    ids: Vec<i64>,
    #[arg(long)]
    reason: String,
}

#[derive(Debug, Args)]
struct OptionalTargetArgs {
    #[arg(long)]
    target: Option<String>,
}

#[derive(Debug, Subcommand)]
enum DeletionCommand {
    Log(DeletionLogArgs),
    Stats,
}

#[derive(Debug, Args)]
struct DeletionLogArgs {
    #[arg(long)]
    id: i64,
    #[arg(long, value_enum)]
    outcome: OutcomeArg,
    #[arg(long, default_value = "")]
    username: String,
    #[arg(long)]
    error: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PatternArg {
    Any,
    DeletedAccount,
    EmptyProfile,
}

impl From<PatternArg> for NamePattern {
    fn from(value: PatternArg) -> Self {
        match value {
            PatternArg::Any => Self::Any,
            PatternArg::DeletedAccount => Self::DeletedAccount,
            PatternArg::EmptyProfile => Self::EmptyProfile,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutcomeArg {
    Success,
    Error,
}

impl From<OutcomeArg> for DeletionOutcome {
    fn from(value: OutcomeArg) -> Self {
        match value {
            OutcomeArg::Success => Self::Success,
            OutcomeArg::Error => Self::Error,
        }
    }
}

#[derive(Debug, Serialize)]
struct Candidate<'a> {
    member_id: MemberId,
    username: &'a str,
    first_name: &'a str,
    last_name: &'a str,
    reason: &'static str,
    reason_tag: String,
    pattern: &'a str,
    confidence: f64,
}

impl<'a> Candidate<'a> {
    fn new(member: &'a MemberRecord, classification: &'a Classification) -> Self {
        Self {
            member_id: member.member_id,
            username: &member.username,
            first_name: &member.first_name,
            last_name: &member.last_name,
            reason: classification.reason.as_str(),
            reason_tag: classification.reason_tag(),
            pattern: &classification.pattern,
            confidence: classification.confidence,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
        Command::Ingest(args) => run_ingest(&cli.db, &args),
        Command::Checkpoint { command } => {
            let mut store = SqliteStore::initialize(&cli.db)?;
            run_checkpoint(*command, &mut store)
        }
        Command::Members { command } => {
            let mut store = SqliteStore::initialize(&cli.db)?;
            run_members(*command, &mut store)
        }
        Command::Deletion { command } => {
            let mut store = SqliteStore::initialize(&cli.db)?;
            run_deletion(*command, &mut store)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }));
    }

    let report = store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": report.from_version,
        "applied_versions": report.applied.iter().map(|step| step.version).collect::<Vec<_>>(),
        "applied": report.applied,
        "after_version": report.to_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out.display().to_string(),
        "schema_version": store.schema_status()?.current_version
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    let value = serde_json::to_value(&report).context("failed to serialize integrity report")?;
    emit_json(value)
}

fn run_ingest(db: &Path, args: &IngestArgs) -> Result<()> {
    let config = load_ingest_config(args)?;
    let store = SqliteStore::initialize(db)?;
    let source = NdjsonFileSource::new(&args.from);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let report = runtime.block_on(ingest_until_interrupted(store, source, config, &args.target))?;
    emit_json(serde_json::to_value(&report).context("failed to serialize progress report")?)
}

async fn ingest_until_interrupted(
    store: SqliteStore,
    source: NdjsonFileSource,
    config: IngestConfig,
    target: &str,
) -> Result<ProgressReport> {
    let mut engine = IngestEngine::new(store, source, config)?;
    let token = engine.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current page");
            token.cancel();
        }
    });

    let outcome = engine.ingest(target).await;
    interrupt.abort();
    Ok(outcome?)
}

fn load_ingest_config(args: &IngestArgs) -> Result<IngestConfig> {
    let mut config = match args.config.as_ref() {
        Some(path) => {
            let body = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str::<IngestConfig>(&body)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        }
        None => IngestConfig::default(),
    };

    if let Some(page_size) = args.page_size {
        config.page_size = page_size;
    }
    if let Some(delay_ms) = args.delay_ms {
        config.inter_page_delay_ms = delay_ms;
    }
    if let Some(checkpoint_every) = args.checkpoint_every {
        config.checkpoint_every_pages = checkpoint_every;
    }
    if let Some(max_attempts) = args.max_attempts {
        config.retry.max_attempts = max_attempts;
    }
    if let Some(reject_threshold) = args.reject_threshold {
        config.reject_threshold = reject_threshold;
    }

    config.validate().context("invalid ingest configuration")?;
    Ok(config)
}

fn run_checkpoint(command: CheckpointCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        CheckpointCommand::Show(args) => {
            let state = store.load_checkpoint(&args.target)?;
            emit_json(serde_json::json!({
                "target_id": args.target,
                "phase": IngestionPhase::of(state.as_ref()).as_str(),
                "checkpoint": state
            }))
        }
        CheckpointCommand::List => {
            let checkpoints = store.list_checkpoints()?;
            let rows: Vec<Value> = checkpoints
                .iter()
                .map(|state| {
                    serde_json::json!({
                        "phase": IngestionPhase::of(Some(state)).as_str(),
                        "checkpoint": state
                    })
                })
                .collect();
            emit_json(serde_json::json!({ "checkpoints": rows }))
        }
        CheckpointCommand::Reset(args) => {
            let reset = store.reset_checkpoint(&args.target)?;
            emit_json(serde_json::json!({
                "target_id": args.target,
                "reset": reset
            }))
        }
    }
}

fn run_members(command: MembersCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        MembersCommand::List(args) => run_members_list(&args, store),
        MembersCommand::Classify(args) => run_members_classify(&args, store),
        MembersCommand::Move(args) => run_members_move(&args, store),
        MembersCommand::Counts(args) => {
            let counts = store.member_counts(args.target.as_deref())?;
            emit_json(serde_json::json!({
                "target_id": args.target,
                "active": counts.active,
                "removed": counts.removed,
                "total": counts.total,
                "removed_snapshots": counts.removed_snapshots
            }))
        }
    }
}

fn member_query(target: Option<&str>, pattern: NamePattern) -> MemberQuery {
    let query = MemberQuery::all().with_pattern(pattern);
    match target {
        Some(target) => query.for_target(target),
        None => query,
    }
}

fn run_members_list(args: &MembersListArgs, store: &SqliteStore) -> Result<()> {
    let after = args.after.map(MemberId::new).transpose()?;
    let query = member_query(args.target.as_deref(), args.pattern.into());
    let page = store.query_active_page(&query, after, args.limit)?;
    emit_json(serde_json::json!({
        "pattern": query.pattern.as_str(),
        "count": page.items.len(),
        "items": page.items,
        "next_cursor": page.next_cursor
    }))
}

fn run_members_classify(args: &MembersClassifyArgs, store: &SqliteStore) -> Result<()> {
    let classifier = DeletedAccountClassifier::new()?;
    let query = member_query(args.target.as_deref(), NamePattern::Any);

    let mut scanned = 0_u64;
    let mut found: Vec<(MemberRecord, Classification)> = Vec::new();
    for member in store.active_members(query, CLASSIFY_CHUNK) {
        let member = member?;
        scanned += 1;
        let verdicts = if args.all_signals {
            classifier.analyze(&member)
        } else {
            classifier.classify(&member).into_iter().collect()
        };
        for verdict in verdicts {
            if verdict.confidence >= args.min_confidence {
                found.push((member.clone(), verdict));
            }
        }
    }

    let candidates: Vec<Candidate<'_>> = found
        .iter()
        .map(|(member, classification)| Candidate::new(member, classification))
        .collect();
    emit_json(serde_json::json!({
        "scanned": scanned,
        "min_confidence": args.min_confidence,
        "candidate_count": candidates.len(),
        "candidates": candidates
    }))
}

fn run_members_move(args: &MembersMoveArgs, store: &mut SqliteStore) -> Result<()> {
    let ids = args
        .ids
        .iter()
        .map(|raw| MemberId::new(*raw))
        .collect::<Result<Vec<_>, _>>()?;
    let moved = store.move_to_removed(&ids, &args.reason)?;
    emit_json(serde_json::json!({
        "requested": ids.len(),
        "moved": moved,
        "reason": args.reason.trim()
    }))
}

fn run_deletion(command: DeletionCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DeletionCommand::Log(args) => {
            let outcome = DeletionOutcome::from(args.outcome);
            if outcome == DeletionOutcome::Error && args.error.is_none() {
                return Err(anyhow!("--error is required when --outcome is error"));
            }
            let attempt = DeletionAttempt {
                member_id: MemberId::new(args.id)?,
                username: args.username,
                outcome,
                error_message: args.error,
                attempted_at: OffsetDateTime::now_utc(),
            };
            let log_id = store.log_deletion(&attempt)?;
            emit_json(serde_json::json!({
                "log_id": log_id,
                "member_id": attempt.member_id,
                "outcome": outcome.as_str()
            }))
        }
        DeletionCommand::Stats => {
            let stats = store.deletion_stats()?;
            emit_json(serde_json::to_value(stats).context("failed to serialize deletion stats")?)
        }
    }
}
