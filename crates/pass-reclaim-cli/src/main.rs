use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pass_reclaim_api::{
    plan_from_pool, AppConfig, PoolSnapshot, ReclaimSession, SearchOverrides,
};
use pass_reclaim_core::{GroupKeyMode, MatchMode, NormalizeMode, RecyclePool};
use pass_reclaim_store_sqlite::{RunSummary, SqlitePool};
use pass_reclaim_vendor::HttpMemberDirectory;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DEFAULT_ASSIGN_LIMIT: usize = 50;

#[derive(Debug, Parser)]
#[command(name = "prc")]
#[command(about = "Pass Reclaim CLI: duplicate reconciliation and identifier recycling")]
struct Cli {
    #[arg(long, default_value = "./pass-reclaim.yaml")]
    config: PathBuf,

    #[arg(long, default_value = "./pass_reclaim_pool.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Search a batch of names and feed the recycle pool.
    Search(SearchArgs),
    /// Dry-run: show the assignment plan without touching the vendor.
    Plan(PlanArgs),
    /// Apply the assignment plan. Requires --confirm.
    Execute(ExecuteArgs),
    Pool {
        #[command(subcommand)]
        command: PoolCommand,
    },
    Missing {
        #[command(subcommand)]
        command: MissingCommand,
    },
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
struct SearchArgs {
    /// File with one name per line; stdin when omitted.
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    max_hits: Option<usize>,
    #[arg(long)]
    throttle_ms: Option<u64>,
    #[arg(long, value_enum)]
    match_mode: Option<MatchModeArg>,
    #[arg(long, value_enum)]
    normalize_mode: Option<NormalizeModeArg>,
    #[arg(long, value_enum)]
    group_key: Option<GroupKeyArg>,
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct ExecuteArgs {
    /// Explicit operator acknowledgment; execution refuses to run without it.
    #[arg(long, default_value_t = false)]
    confirm: bool,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    delay_ms: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum PoolCommand {
    List,
    Clear,
}

#[derive(Debug, Subcommand)]
enum MissingCommand {
    List,
}

#[derive(Debug, Subcommand)]
enum RunsCommand {
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Check,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MatchModeArg {
    Exact,
    Substring,
}

impl MatchModeArg {
    fn into_match_mode(self) -> MatchMode {
        match self {
            Self::Exact => MatchMode::Exact,
            Self::Substring => MatchMode::Substring,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum NormalizeModeArg {
    Collapse,
    Strip,
}

impl NormalizeModeArg {
    fn into_normalize_mode(self) -> NormalizeMode {
        match self {
            Self::Collapse => NormalizeMode::CollapseWhitespace,
            Self::Strip => NormalizeMode::StripWhitespace,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GroupKeyArg {
    SearchKey,
    DisplayName,
}

impl GroupKeyArg {
    fn into_group_key_mode(self) -> GroupKeyMode {
        match self {
            Self::SearchKey => GroupKeyMode::SearchKey,
            Self::DisplayName => GroupKeyMode::DisplayName,
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
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Search(args) => run_search(&args, &cli.config, &cli.db),
        Command::Plan(args) => run_plan(&args, &cli.db),
        Command::Execute(args) => run_execute(&args, &cli.config, &cli.db),
        Command::Pool { command } => run_pool(command, &cli.db),
        Command::Missing { command } => run_missing(command, &cli.db),
        Command::Runs { command } => run_runs(command, &cli.db),
        Command::Db { command } => run_db(command, &cli.db),
        Command::Config { command } => run_config(command, &cli.config),
    }
}

fn open_migrated_pool(db_path: &Path) -> Result<SqlitePool> {
    let mut store = SqlitePool::open(db_path)?;
    store.migrate()?;
    Ok(store)
}

fn read_names_input(input: Option<&Path>) -> Result<String> {
    match input {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read names file {}", path.display())),
        None => {
            let mut body = String::new();
            std::io::stdin()
                .read_to_string(&mut body)
                .context("failed to read names from stdin")?;
            Ok(body)
        }
    }
}

fn run_search(args: &SearchArgs, config_path: &Path, db_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let input = read_names_input(args.input.as_deref())?;
    let store = open_migrated_pool(db_path)?;
    let directory = HttpMemberDirectory::new(&config.directory_config());
    let mut session = ReclaimSession::new(directory, store, config.defaults.clone());

    let overrides = SearchOverrides {
        max_hits_per_name: args.max_hits,
        search_throttle_ms: args.throttle_ms,
        match_mode: args.match_mode.map(MatchModeArg::into_match_mode),
        normalize_mode: args.normalize_mode.map(NormalizeModeArg::into_normalize_mode),
        group_key_mode: args.group_key.map(GroupKeyArg::into_group_key_mode),
    };
    let report = session.run_search(&input, &overrides)?;

    session.pool_mut().save_run(&RunSummary {
        run_id: report.run_id,
        started_at: report.started_at,
        summary: serde_json::json!({
            "names": report.names.len(),
            "hits": report.hits.len(),
            "missing": report.missing.len(),
            "warnings": report.warnings.len(),
            "candidates_added": report.candidates_added,
        }),
    })?;

    emit_json(serde_json::to_value(&report).context("failed to serialize search report")?)
}

fn run_plan(args: &PlanArgs, db_path: &Path) -> Result<()> {
    let store = open_migrated_pool(db_path)?;
    let report = plan_from_pool(&store, args.limit.unwrap_or(DEFAULT_ASSIGN_LIMIT))?;
    emit_json(serde_json::to_value(&report).context("failed to serialize plan report")?)
}

fn run_execute(args: &ExecuteArgs, config_path: &Path, db_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let store = open_migrated_pool(db_path)?;
    let directory = HttpMemberDirectory::new(&config.directory_config());
    let mut session = ReclaimSession::new(directory, store, config.defaults.clone());
    let report = session.execute(args.confirm, args.limit, args.delay_ms)?;
    emit_json(serde_json::to_value(&report).context("failed to serialize execution report")?)
}

fn run_pool(command: PoolCommand, db_path: &Path) -> Result<()> {
    let mut store = open_migrated_pool(db_path)?;
    match command {
        PoolCommand::List => {
            let snapshot = PoolSnapshot {
                candidates: store.list_candidates()?,
                missing: store.list_missing()?,
            };
            emit_json(serde_json::to_value(&snapshot).context("failed to serialize pool")?)
        }
        PoolCommand::Clear => {
            store.clear()?;
            emit_json(serde_json::json!({ "cleared": true }))
        }
    }
}

fn run_missing(command: MissingCommand, db_path: &Path) -> Result<()> {
    let store = open_migrated_pool(db_path)?;
    match command {
        MissingCommand::List => {
            let missing = store.list_missing()?;
            emit_json(serde_json::json!({ "missing": missing }))
        }
    }
}

fn run_runs(command: RunsCommand, db_path: &Path) -> Result<()> {
    let store = open_migrated_pool(db_path)?;
    match command {
        RunsCommand::List { limit } => {
            let runs = store.list_runs(limit)?;
            emit_json(serde_json::json!({ "runs": runs }))
        }
    }
}

fn run_db(command: DbCommand, db_path: &Path) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let store = SqlitePool::open(db_path)?;
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let mut store = SqlitePool::open(db_path)?;
            let before = store.schema_status()?;
            if args.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions
                }));
            }
            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
    }
}

fn run_config(command: ConfigCommand, config_path: &Path) -> Result<()> {
    match command {
        ConfigCommand::Check => {
            let config = AppConfig::load(config_path)?;
            emit_json(serde_json::json!({
                "base_url": config.vendor.base_url,
                "api_key_present": !config.vendor.api_key.is_empty(),
                "timeout_secs": config.vendor.timeout_secs,
                "defaults": config.defaults
            }))
        }
    }
}
