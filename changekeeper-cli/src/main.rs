//! Command-line runner for changekeeper changelogs.
//!
//! ```text
//! changekeeper --url sqlite://app.db --changelog db/changelog.sql update --tag v1 --labels base
//! ```

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use changekeeper::{
    Backend, BackendRegistry, Changeset, ConnectOptions, Credentials, Expression,
    Filter, Migrator, UpdateOptions,
};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod config;

use config::{FileConfig, Overrides, Settings};

type CliResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Apply a SQL changelog to a database and track what was applied
#[derive(Parser)]
#[command(name = "changekeeper", version, about, long_about = None)]
struct Cli {
    /// Database URL (sqlite://path, sqlite::memory:, postgres://...)
    ///
    /// Cloud Spanner is reached through PGAdapter with a postgres:// URL. Spanner does not
    /// run DDL inside the transaction that also writes the ledger row, so a changeset there
    /// is only atomic when it holds a single DDL statement or only DML.
    #[arg(long, env = "CHANGEKEEPER_URL", global = true)]
    url: Option<String>,

    /// Path to the changelog file
    #[arg(long, env = "CHANGEKEEPER_CHANGELOG", global = true)]
    changelog: Option<PathBuf>,

    /// JSON file with `username` and `password` merged into the connection
    #[arg(long, env = "CHANGEKEEPER_CREDENTIALS", global = true)]
    credentials: Option<PathBuf>,

    /// Config file (defaults to ./changekeeper.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct FilterArgs {
    /// Label expression, eg `base and not slow`
    #[arg(long, env = "CHANGEKEEPER_LABELS")]
    labels: Option<String>,

    /// Comma-separated contexts of this run
    #[arg(long, env = "CHANGEKEEPER_CONTEXTS")]
    contexts: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending changesets
    Update {
        /// Tag the ledger once every pending changeset is applied
        #[arg(long)]
        tag: Option<String>,

        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Tag the current end of the ledger
    Tag {
        name: String,
    },
    /// Roll back every changeset applied after a tag
    Rollback {
        tag: String,

        /// List what would be rolled back without doing it
        #[arg(long)]
        dry_run: bool,
    },
    /// List pending changesets
    Status {
        /// Also print each pending changeset's SQL and rollback SQL
        #[arg(long)]
        sql: bool,

        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Show the ledger
    History,
    /// Check applied changesets against the changelog
    Validate,
    /// Record pending changesets as applied without running them
    ChangelogSync {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Show who holds the changelog lock
    ListLocks,
    /// Clear a lock left behind by a killed run
    ReleaseLocks,
}

impl Commands {
    fn filter_args(&self) -> FilterArgs {
        match self {
            Commands::Update { filter, .. }
            | Commands::Status { filter, .. }
            | Commands::ChangelogSync { filter } => filter.clone(),
            _ => FilterArgs::default(),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cancel = Arc::new(AtomicBool::new(false));
    let signal_flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received interrupt, stopping after the current changeset");
            signal_flag.store(true, Ordering::SeqCst);
        }
    });

    let result = match tokio::task::spawn_blocking(move || run(cli, cancel)).await {
        Ok(result) => result,
        Err(e) => Err(format!("worker task failed: {}", e).into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn settings(cli: &Cli) -> CliResult<Settings> {
    let file = FileConfig::load(cli.config.as_deref())?;
    let filter = cli.command.filter_args();
    Settings::resolve(
        Overrides {
            url: cli.url.clone(),
            changelog: cli.changelog.clone(),
            credentials: cli.credentials.clone(),
            labels: filter.labels,
            contexts: filter.contexts,
        },
        file,
    )
}

fn connect(settings: &Settings) -> CliResult<Box<dyn Backend>> {
    let mut options = ConnectOptions::new(settings.url.as_str());
    if let Some(path) = &settings.credentials {
        options = options.with_credentials(Credentials::from_path(path)?);
    }
    if let Some(timeout) = settings.connect_timeout {
        options = options.with_timeout(timeout);
    }
    Ok(BackendRegistry::with_defaults().connect(&options)?)
}

fn migrator(settings: &Settings, cancel: Arc<AtomicBool>) -> CliResult<Migrator> {
    let mut migrator = Migrator::from_path(&settings.changelog)?
        .with_cancel_flag(cancel)
        .on_changeset_start(|id| tracing::debug!(changeset = %id, "Applying changeset"))
        .on_changeset_skipped(|id| tracing::info!(changeset = %id, "Marked as ran"));
    if let Some(table) = &settings.ledger_table {
        migrator = migrator.with_ledger_table_name(table.as_str());
    }
    if let Some(table) = &settings.lock_table {
        migrator = migrator.with_lock_table_name(table.as_str());
    }
    if let Some(wait) = settings.lock_wait {
        migrator = migrator.with_lock_wait(wait);
    }
    Ok(migrator)
}

fn filter(settings: &Settings) -> CliResult<Filter> {
    let mut filter = Filter::new().with_contexts(&settings.contexts);
    if let Some(labels) = &settings.labels {
        let labels =
            Expression::parse(labels).map_err(|e| format!("invalid --labels expression: {}", e))?;
        filter = filter.with_labels(labels);
    }
    Ok(filter)
}

/// Forward and rollback SQL of a changeset, indented under its id.
fn changeset_sql(changeset: &Changeset) -> String {
    let mut out = String::new();
    for statement in &changeset.statements {
        out.push_str(&format!("      {};\n", statement));
    }
    if !changeset.rollback.declared {
        out.push_str("    rollback: none declared\n");
    } else if changeset.rollback.statements.is_empty() {
        out.push_str("    rollback: not required\n");
    } else {
        out.push_str("    rollback:\n");
        for statement in &changeset.rollback.statements {
            out.push_str(&format!("      {};\n", statement));
        }
    }
    out
}

fn run(cli: Cli, cancel: Arc<AtomicBool>) -> CliResult<()> {
    let settings = settings(&cli)?;
    let migrator = migrator(&settings, cancel)?;
    let mut backend = connect(&settings)?;
    let backend = backend.as_mut();

    match cli.command {
        Commands::Update { tag, .. } => {
            let options = UpdateOptions {
                filter: filter(&settings)?,
                tag,
            };
            let report = migrator.update(backend, &options)?;
            if report.applied.is_empty() {
                println!("Database is up to date.");
            } else {
                println!("Applied {} changeset(s):", report.applied.len());
                for id in &report.applied {
                    println!("  {}", id);
                }
            }
            if !report.filtered_out.is_empty() {
                println!(
                    "{} pending changeset(s) excluded by labels or contexts.",
                    report.filtered_out.len()
                );
            }
            if let Some(tag) = &report.tag {
                println!("Tagged as '{}'.", tag);
            }
        }
        Commands::Tag { name } => {
            migrator.tag(backend, &name)?;
            println!("Tagged as '{}'.", name);
        }
        Commands::Rollback { tag, dry_run } => {
            if dry_run {
                let entries = migrator.preview_rollback(backend, &tag)?;
                if entries.is_empty() {
                    println!("Nothing applied after tag '{}'.", tag);
                } else {
                    println!("Would roll back {} entr(ies):", entries.len());
                    for entry in &entries {
                        println!("  {} ({})", entry.id, entry.exec_type);
                    }
                }
            } else {
                let report = migrator.rollback_to_tag(backend, &tag)?;
                println!(
                    "Rolled back {} entr(ies) to tag '{}'.",
                    report.rolled_back.len(),
                    report.tag
                );
                for id in &report.rolled_back {
                    println!("  {}", id);
                }
            }
        }
        Commands::Status { sql, .. } => {
            let plan = migrator.preview_update(backend, &filter(&settings)?)?;
            println!("Changelog: {}", migrator.changelog().path());
            println!("Applied: {}", plan.already_applied);
            if plan.pending.is_empty() {
                println!("Pending: none");
            } else {
                println!("Pending: {}", plan.pending.len());
                for changeset in &plan.pending {
                    println!("  {}", changeset.id);
                    if sql {
                        print!("{}", changeset_sql(changeset));
                    }
                }
            }
            for id in &plan.filtered_out {
                println!("  {} (excluded by filter)", id);
            }
            for id in &plan.unknown_applied {
                println!("  {} (in ledger, not in changelog)", id);
            }
        }
        Commands::History => {
            let history = migrator.history(backend)?;
            if history.is_empty() {
                println!("No changesets have been applied.");
            }
            for entry in &history {
                let tag = entry
                    .tag
                    .as_deref()
                    .map(|t| format!(" [tag: {}]", t))
                    .unwrap_or_default();
                println!(
                    "{:>4}  {}  {:<8}  {}{}",
                    entry.order_executed,
                    entry.applied_at.to_rfc3339(),
                    entry.exec_type,
                    entry.id,
                    tag
                );
            }
        }
        Commands::Validate => {
            migrator.validate(backend)?;
            println!("Changelog is consistent with the ledger.");
        }
        Commands::ChangelogSync { .. } => {
            let marked = migrator.changelog_sync(backend, &filter(&settings)?)?;
            println!("Marked {} changeset(s) as ran.", marked.len());
            for id in &marked {
                println!("  {}", id);
            }
        }
        Commands::ListLocks => match migrator.lock_status(backend)? {
            Some(status) if status.locked => {
                println!(
                    "Locked by {} since {}",
                    status.locked_by.as_deref().unwrap_or("unknown"),
                    status
                        .granted
                        .map(|g| g.to_rfc3339())
                        .unwrap_or_else(|| "unknown".to_string())
                );
            }
            _ => println!("Not locked."),
        },
        Commands::ReleaseLocks => {
            if migrator.release_locks(backend)? {
                println!("Released the changelog lock.");
            } else {
                println!("No lock was held.");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use changekeeper::Changelog;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn update_flags_parse() {
        let cli = Cli::try_parse_from([
            "changekeeper",
            "--url",
            "sqlite::memory:",
            "update",
            "--tag",
            "v1",
            "--labels",
            "base and not slow",
        ])
        .unwrap();
        assert_eq!(cli.url.as_deref(), Some("sqlite::memory:"));
        match cli.command {
            Commands::Update { tag, filter } => {
                assert_eq!(tag.as_deref(), Some("v1"));
                assert_eq!(filter.labels.as_deref(), Some("base and not slow"));
            }
            _ => panic!("expected update"),
        }
    }

    #[test]
    fn status_sql_lists_forward_and_rollback() {
        let changelog = Changelog::parse(
            "--liquibase formatted sql\n\
             --changeset alice:1\n\
             CREATE TABLE person (id INTEGER PRIMARY KEY);\n\
             --rollback DROP TABLE person;\n\
             --changeset alice:2\n\
             INSERT INTO person VALUES (1);\n",
            "changelog.sql",
        )
        .unwrap();
        let first = changeset_sql(&changelog.changesets()[0]);
        assert!(first.contains("CREATE TABLE person (id INTEGER PRIMARY KEY);"));
        assert!(first.contains("rollback:\n      DROP TABLE person;"));
        let second = changeset_sql(&changelog.changesets()[1]);
        assert!(second.contains("rollback: none declared"));

        let cli = Cli::try_parse_from(["changekeeper", "status", "--sql"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { sql: true, .. }));
    }

    #[test]
    fn end_to_end_against_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let changelog = dir.path().join("changelog.sql");
        std::fs::write(
            &changelog,
            "--liquibase formatted sql\n\
             --changeset alice:1\n\
             CREATE TABLE person (id INTEGER PRIMARY KEY);\n\
             --rollback DROP TABLE person;\n",
        )
        .unwrap();
        let url = format!("sqlite://{}", dir.path().join("app.db").display());
        let args = |command: &[&str]| {
            let mut argv = vec![
                "changekeeper".to_string(),
                "--url".to_string(),
                url.clone(),
                "--changelog".to_string(),
                changelog.display().to_string(),
                "--config".to_string(),
                dir.path().join("absent.toml").display().to_string(),
            ];
            argv.extend(command.iter().map(|s| s.to_string()));
            argv
        };
        let cancel = Arc::new(AtomicBool::new(false));

        // explicit config file that does not exist
        let cli = Cli::try_parse_from(args(&["update"])).unwrap();
        assert!(run(cli, cancel.clone()).is_err());

        std::fs::write(dir.path().join("absent.toml"), "").unwrap();
        let cli = Cli::try_parse_from(args(&["update", "--tag", "v1"])).unwrap();
        run(cli, cancel.clone()).unwrap();
        let cli = Cli::try_parse_from(args(&["validate"])).unwrap();
        run(cli, cancel.clone()).unwrap();
        let cli = Cli::try_parse_from(args(&["tag", "v1"])).unwrap();
        assert!(run(cli, cancel.clone()).is_err());
    }
}
