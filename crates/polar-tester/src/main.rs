//! Generate and validate Polar policies from plain-language requirements.
//!
//! Reads the model API key from the variable named by `model.api_key_env`
//! (default `OPENAI_API_KEY`).
//!
//! # Examples
//!
//! ```sh
//! # Write a default config file
//! polar-tester init
//!
//! # One-off generation against a context document
//! polar-tester generate --context docs/polar.md \
//!   --requirement "Members can read documents in their organization"
//!
//! # Check a policy file with the configured validator
//! polar-tester validate --policy-file policy.polar
//!
//! # Record a generation in a session
//! polar-tester session new "Org documents"
//! polar-tester generate --session <ID> --context docs/polar.md \
//!   --requirement-file requirement.txt
//! polar-tester session events <ID> --type TestRun --since 2026-01-01T00:00:00Z
//!
//! # Back up a session and roll it back later
//! polar-tester session backup <ID>
//! polar-tester session restore <ID>
//! ```

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use polar_tester::client::KNOWN_MODELS;
use polar_tester::config::DEFAULT_CONFIG_FILE;
use polar_tester::events::SessionStats;
use polar_tester::generate::{FnObserver, GenerationEvent};
use polar_tester::prompt::{assemble, load_contexts};
use polar_tester::{
    AppConfig, ChatClient, Error, EventType, GenerationResult, Generator, ModelOverrides,
    SessionManager, Validation, Validator,
};
use tracing_subscriber::EnvFilter;

/// Generate Polar policies with an LLM and check them with a validator.
#[derive(Parser)]
#[command(name = "polar-tester", version)]
struct Cli {
    /// Config file (default: ./polar-tester.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (overrides RUST_LOG and logging.level)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a policy for a requirement, retrying on validation failure
    Generate(GenerateArgs),

    /// Validate an existing policy file
    Validate {
        #[arg(long)]
        policy_file: PathBuf,
    },

    /// List commonly used model names
    ListModels,

    /// Write the default configuration to a file
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config_file: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Manage recorded sessions
    #[command(subcommand)]
    Session(SessionCommand),
}

impl Command {
    /// `init` writes a fresh config, so it must work when the current one
    /// does not load.
    fn loads_config(&self) -> bool {
        !matches!(self, Command::Init { .. })
    }
}

#[derive(Args)]
struct GenerateArgs {
    // ── Requirement source ─────────────────────────────────────
    /// Requirement text
    #[arg(long, conflicts_with_all = ["requirement_file", "stdin"])]
    requirement: Option<String>,

    /// Read the requirement from a file
    #[arg(long, conflicts_with = "stdin")]
    requirement_file: Option<PathBuf>,

    /// Read the requirement from stdin
    #[arg(long)]
    stdin: bool,

    /// Context document, repeatable; order is preserved
    #[arg(long = "context")]
    contexts: Vec<PathBuf>,

    // ── Model ──────────────────────────────────────────────────
    /// Model name override
    #[arg(long)]
    model: Option<String>,

    /// Sampling temperature override
    #[arg(long)]
    temperature: Option<f32>,

    /// Total model calls allowed, including the first
    #[arg(long)]
    max_attempts: Option<u32>,

    // ── Output ─────────────────────────────────────────────────
    /// Write the final policy here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Record the run in this session
    #[arg(long)]
    session: Option<String>,
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Create a session
    New {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List sessions, newest first
    List,
    /// Show a session's replayed state
    Show { id: String },
    /// Print a session's event timeline
    Events {
        id: String,
        /// Only events of this type, repeatable (e.g. TestRun)
        #[arg(long = "type")]
        types: Vec<String>,
        /// Only events at or after this RFC 3339 time
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// Only events at or before this RFC 3339 time
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },
    /// Check a session's event log for inconsistencies
    Check { id: String },
    /// Set the session notes
    Notes { id: String, text: String },
    /// Set the session requirements
    Requirements { id: String, text: String },
    /// Rename a session
    Rename { id: String, name: String },
    /// Delete a session and its history (backups are kept)
    Delete { id: String },
    /// Show generation and validation totals
    Stats { id: String },
    /// Copy a session's current state into a new backup
    Backup { id: String },
    /// List a session's backups, newest first
    Backups { id: String },
    /// Restore a session from a backup (the newest if none is named)
    Restore {
        id: String,
        #[arg(long)]
        backup: Option<String>,
    },
    /// Integrity-check every stored session
    Scan,
    /// Delete event logs idle for longer than the retention period
    Cleanup {
        /// Overrides storage.retention_days
        #[arg(long)]
        days: Option<u32>,
    },
}

// ── Helpers ────────────────────────────────────────────────────────

fn init_tracing(level: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn read_requirement(args: &GenerateArgs) -> Result<Option<String>, Error> {
    if let Some(text) = &args.requirement {
        return Ok(Some(text.clone()));
    }
    if let Some(path) = &args.requirement_file {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!(
                "failed to read requirement file {}: {e}",
                path.display()
            ))
        })?;
        return Ok(Some(text));
    }
    if args.stdin {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| Error::Configuration(format!("failed to read stdin: {e}")))?;
        return Ok(Some(buf));
    }
    Ok(None)
}

fn progress(event: &GenerationEvent<'_>) {
    match event {
        GenerationEvent::AttemptStarted {
            attempt,
            max_attempts,
            correction,
        } => {
            let kind = if *correction { "correcting" } else { "generating" };
            eprintln!("  [attempt {attempt}/{max_attempts}] {kind}...");
        }
        GenerationEvent::Validated { outcome, .. } => match outcome {
            Validation::Pass => eprintln!("  validation passed"),
            Validation::Fail { message } => {
                let first = message.lines().next().unwrap_or_default();
                eprintln!("  validation failed: {first}");
            }
        },
        _ => {}
    }
}

fn percent(rate: Option<f64>) -> String {
    rate.map_or_else(|| "-".to_string(), |r| format!("{:.0}%", r * 100.0))
}

fn print_stats(stats: &SessionStats) {
    println!(
        "runs:        {} ({} passed, {} failed, success {})",
        stats.test_runs,
        stats.passed_runs,
        stats.failed_runs,
        percent(stats.run_success_rate())
    );
    println!(
        "attempts:    {} ({} retries)",
        stats.total_attempts, stats.retries
    );
    println!(
        "policies:    {} ({} reworked)",
        stats.policies_generated, stats.policies_reworked
    );
    println!(
        "validations: {} ({} passed, {} failed, success {})",
        stats.validations(),
        stats.validations_passed,
        stats.validations_failed,
        percent(stats.validation_success_rate())
    );
    println!("tokens:      {}", stats.tokens_used);
}

fn print_summary(result: &GenerationResult) {
    let status = if result.passed() { "PASSED" } else { "FAILED" };
    eprintln!(
        "{status} after {} attempt(s) in {:.1}s",
        result.attempts,
        result.elapsed.as_secs_f64()
    );
    if let Some(tokens) = result.tokens_used {
        eprintln!("  tokens used: {tokens}");
    }
    if let Validation::Fail { message } = &result.outcome {
        eprintln!("\nValidator output:\n{message}");
    }
}

// ── Commands ───────────────────────────────────────────────────────

async fn generate(config: &AppConfig, args: GenerateArgs) -> Result<ExitCode, Error> {
    let requirement = read_requirement(&args)?;
    let context_paths = if args.contexts.is_empty() {
        config.generation.context_files.clone()
    } else {
        args.contexts.clone()
    };
    let contexts = load_contexts(&context_paths).await?;
    let overrides = ModelOverrides {
        model: args.model,
        temperature: args.temperature,
        max_tokens: None,
    };

    let mut loop_config = config.generate_config();
    if let Some(n) = args.max_attempts {
        loop_config.max_attempts = n;
    }
    let model = ChatClient::new(config.model.client_config()?)?;
    let generator = Generator::new(Arc::new(model), Arc::new(config.validator.build()))
        .with_config(loop_config)
        .with_observer(FnObserver::new(progress));

    let result = match &args.session {
        Some(id) => {
            let manager = SessionManager::new(config.storage.open()?);
            if let Some(text) = &requirement {
                manager.set_requirements(id, text).await?;
            }
            manager
                .run_generation(id, contexts, overrides, &generator)
                .await?
        }
        None => {
            let requirement = requirement.ok_or_else(|| {
                Error::Configuration(
                    "provide --requirement, --requirement-file, --stdin, or --session".into(),
                )
            })?;
            let request = assemble(contexts, requirement, None, None)?.with_overrides(overrides);
            generator.generate(request).await?
        }
    };

    match &args.output {
        Some(path) => {
            tokio::fs::write(path, format!("{}\n", result.text))
                .await
                .map_err(|e| {
                    Error::Configuration(format!("failed to write {}: {e}", path.display()))
                })?;
            eprintln!("Wrote {}", path.display());
        }
        None => println!("{}", result.text),
    }
    print_summary(&result);
    Ok(if result.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

async fn validate(config: &AppConfig, policy_file: &Path) -> Result<ExitCode, Error> {
    let policy = tokio::fs::read_to_string(policy_file).await.map_err(|e| {
        Error::Configuration(format!("failed to read {}: {e}", policy_file.display()))
    })?;
    match config.validator.build().validate(&policy).await? {
        Validation::Pass => {
            println!("{} is valid", policy_file.display());
            Ok(ExitCode::SUCCESS)
        }
        Validation::Fail { message } => {
            println!("{} failed validation:\n{message}", policy_file.display());
            Ok(ExitCode::from(2))
        }
    }
}

fn init(path: &Path, force: bool) -> Result<ExitCode, Error> {
    if path.exists() && !force {
        return Err(Error::Configuration(format!(
            "{} already exists; pass --force to overwrite",
            path.display()
        )));
    }
    std::fs::write(path, AppConfig::default().to_toml()?)
        .map_err(|e| Error::Configuration(format!("failed to write {}: {e}", path.display())))?;
    println!("Wrote {}", path.display());
    Ok(ExitCode::SUCCESS)
}

async fn session(config: &AppConfig, command: SessionCommand) -> Result<ExitCode, Error> {
    let manager = SessionManager::new(config.storage.open()?);
    match command {
        SessionCommand::New { name, description } => {
            let summary = manager.create_session(&name, &description).await?;
            println!("{}", summary.id);
        }
        SessionCommand::List => {
            for s in manager.list_sessions().await? {
                println!(
                    "{}  {}  {}",
                    s.id,
                    s.created_at.format("%Y-%m-%d %H:%M"),
                    s.name
                );
            }
        }
        SessionCommand::Show { id } => {
            let session = manager.load(&id).await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        SessionCommand::Events {
            id,
            types,
            since,
            until,
        } => {
            manager.summary(&id).await?;
            if types.is_empty() && since.is_none() && until.is_none() {
                for entry in manager.events().timeline(&id).await? {
                    println!(
                        "{}  {:<20} {} v{}  {}",
                        entry.timestamp,
                        entry.event_type,
                        entry.document_id,
                        entry.version,
                        entry.summary
                    );
                }
            } else {
                let types: Vec<EventType> = types.into_iter().map(EventType::from).collect();
                for event in manager
                    .events()
                    .events_filtered(&id, &types, since, until)
                    .await?
                {
                    println!("{}", serde_json::to_string(&event)?);
                }
            }
        }
        SessionCommand::Check { id } => {
            let report = manager.events().check_integrity(&id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_valid {
                return Ok(ExitCode::from(2));
            }
        }
        SessionCommand::Notes { id, text } => {
            manager.set_notes(&id, &text).await?;
        }
        SessionCommand::Requirements { id, text } => {
            manager.set_requirements(&id, &text).await?;
        }
        SessionCommand::Rename { id, name } => {
            manager.rename(&id, &name).await?;
        }
        SessionCommand::Delete { id } => {
            manager.delete_session(&id).await?;
            println!("Deleted {id}");
        }
        SessionCommand::Stats { id } => print_stats(&manager.stats(&id).await?),
        SessionCommand::Backup { id } => {
            let info = manager.backup_session(&id).await?;
            println!("{}  ({} files)", info.backup_id, info.file_count);
        }
        SessionCommand::Backups { id } => {
            for info in manager.list_backups(&id).await? {
                println!(
                    "{}  {}  {} files",
                    info.backup_id,
                    info.created_at.format("%Y-%m-%d %H:%M:%S"),
                    info.file_count
                );
            }
        }
        SessionCommand::Restore { id, backup } => {
            let info = manager.restore_backup(&id, backup.as_deref()).await?;
            println!("Restored {id} from {}", info.backup_id);
        }
        SessionCommand::Scan => {
            let report = manager.scan_sessions().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.corrupted > 0 {
                return Ok(ExitCode::from(2));
            }
        }
        SessionCommand::Cleanup { days } => {
            let days = days.unwrap_or(config.storage.retention_days);
            let removed = manager.cleanup_events(days).await?;
            println!("Removed {removed} event log(s) idle for more than {days} days");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run(cli: Cli, config: AppConfig) -> Result<ExitCode, Error> {
    match cli.command {
        Command::Generate(args) => generate(&config, args).await,
        Command::Validate { policy_file } => validate(&config, &policy_file).await,
        Command::ListModels => {
            for model in KNOWN_MODELS {
                println!("{model}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Init { config_file, force } => init(&config_file, force),
        Command::Session(command) => session(&config, command).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = if cli.command.loads_config() {
        AppConfig::load(cli.config.as_deref())
    } else {
        Ok(AppConfig::default())
    };
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging.level, cli.verbose);

    match run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_init_skips_config_loading() {
        let cli = Cli::try_parse_from(["polar-tester", "init", "--force"]).unwrap();
        assert!(!cli.command.loads_config());
        let cli = Cli::try_parse_from(["polar-tester", "list-models"]).unwrap();
        assert!(cli.command.loads_config());
    }

    #[test]
    fn init_force_replaces_a_broken_config() {
        figment::Jail::expect_with(|jail| {
            let path = jail.directory().join(DEFAULT_CONFIG_FILE);
            std::fs::write(&path, "[generation\nmax_attempts = ").unwrap();
            assert!(AppConfig::load(Some(path.as_path())).is_err());

            assert!(init(&path, false).is_err());
            init(&path, true).unwrap();
            let repaired = AppConfig::load(Some(path.as_path())).map_err(|e| e.to_string())?;
            assert_eq!(repaired, AppConfig::default());
            Ok(())
        });
    }

    #[test]
    fn events_filters_parse() {
        let cli = Cli::try_parse_from([
            "polar-tester",
            "session",
            "events",
            "abc",
            "--type",
            "TestRun",
            "--type",
            "NotesAdded",
            "--since",
            "2026-01-01T00:00:00Z",
        ])
        .unwrap();
        let Command::Session(SessionCommand::Events { types, since, until, .. }) = cli.command
        else {
            panic!("expected session events");
        };
        assert_eq!(types, vec!["TestRun", "NotesAdded"]);
        assert!(since.is_some());
        assert!(until.is_none());
    }
}
