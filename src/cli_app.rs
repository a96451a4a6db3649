//! Top-level CLI definition and dispatch.

use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use lazarus::controller::{
    ReconcileAction, Reconciler, ReconcilerSettings, TriggerRequest, create_from_spec, create_test,
    request_deletion,
};
use lazarus::core::cancel::CancelToken;
use lazarus::core::clock::SystemClock;
use lazarus::core::config::Config;
use lazarus::core::errors::LzrError;
use lazarus::core::naming::{format_duration, parse_duration};
use lazarus::daemon::loop_main::{DaemonArgs as DaemonOptions, ReconcileDaemon, production_collaborators};
use lazarus::logger::{ActivityLoggerConfig, JsonlConfig, spawn_logger};
use lazarus::model::{Phase, RestoreTest, RestoreTestSpec};
use lazarus::store::{SqliteTestStore, TestStore};

/// lazarus: proves backups restore by restoring and health-checking them.
#[derive(Debug, Parser)]
#[command(
    name = "lazarus",
    author,
    version,
    about = "Restore-test controller for backup disaster-recovery drills",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the reconcile daemon.
    Daemon(DaemonArgs),
    /// Create a restore test for a backup.
    Create(CreateArgs),
    /// List restore tests.
    List,
    /// Show one restore test in detail.
    Status(NameArgs),
    /// Request deletion; cleanup runs on the next pass.
    Delete(NameArgs),
    /// Run a single reconcile pass in this process.
    Reconcile(NameArgs),
    /// Inspect configuration.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct DaemonArgs {
    /// Worker threads (overrides `daemon.workers`).
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
}

#[derive(Debug, Clone, Args)]
struct CreateArgs {
    /// Backup to restore.
    #[arg(value_name = "BACKUP", required_unless_present = "spec")]
    backup: Option<String>,
    /// Test name; derived from the backup when omitted.
    #[arg(long)]
    name: Option<String>,
    /// Namespace holding the backup object.
    #[arg(long, value_name = "NS")]
    backup_namespace: Option<String>,
    /// Restore into this namespace instead of a generated one.
    #[arg(long, value_name = "NS")]
    restore_namespace: Option<String>,
    /// Time to keep restored resources after the outcome (e.g. `24h`).
    #[arg(long, value_name = "DURATION")]
    ttl: Option<String>,
    /// Full test spec as JSON or TOML.
    #[arg(long, value_name = "PATH", conflicts_with_all = ["backup", "backup_namespace", "restore_namespace", "ttl"])]
    spec: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct NameArgs {
    /// Restore test name.
    name: String,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the config file path.
    Path,
    /// Print the effective configuration.
    Show,
    /// Load and validate the configuration.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
        }
    }
}

impl From<LzrError> for CliError {
    fn from(e: LzrError) -> Self {
        match e {
            LzrError::Validation { .. }
            | LzrError::NotFound { .. }
            | LzrError::AlreadyExists { .. }
            | LzrError::InvalidConfig { .. }
            | LzrError::MissingConfig { .. }
            | LzrError::ConfigParse { .. } => Self::User(e.to_string()),
            other => Self::Runtime(other.to_string()),
        }
    }
}

/// `tracing` filter directive for this invocation.
pub fn log_directive(cli: &Cli) -> String {
    if cli.verbose {
        return "lazarus=debug,info".to_string();
    }
    if cli.quiet {
        return "error".to_string();
    }
    if let Ok(env) = std::env::var("RUST_LOG") {
        if !env.trim().is_empty() {
            return env;
        }
    }
    Config::load(cli.config.as_deref()).map_or_else(|_| "info".to_string(), |c| c.operator.log_level)
}

pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Daemon(args) => run_daemon(cli, args),
        Command::Create(args) => run_create(cli, args),
        Command::List => run_list(cli),
        Command::Status(args) => run_status(cli, args),
        Command::Delete(args) => run_delete(cli, args),
        Command::Reconcile(args) => run_reconcile(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Ok(Config::load(cli.config.as_deref())?)
}

fn open_store(config: &Config) -> Result<SqliteTestStore, CliError> {
    Ok(SqliteTestStore::open(&config.paths.store_db)?)
}

// ──────────────────── daemon ────────────────────

fn run_daemon(cli: &Cli, args: &DaemonArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let mut daemon = ReconcileDaemon::init(
        &config,
        &DaemonOptions {
            workers: args.workers,
        },
    )?;
    daemon.run()?;
    Ok(())
}

// ──────────────────── create / delete ────────────────────

fn run_create(cli: &Cli, args: &CreateArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let clock = SystemClock;

    let test = if let Some(path) = &args.spec {
        let spec = read_spec(path)?;
        let name = match &args.name {
            Some(name) => name.clone(),
            None => TriggerRequest::for_backup(spec.backup_name.clone()).resolved_name()?,
        };
        create_from_spec(&store, &clock, &name, spec)?
    } else {
        let ttl = args
            .ttl
            .as_deref()
            .map(parse_duration)
            .transpose()?;
        let request = TriggerRequest {
            name: args.name.clone(),
            backup_reference: args.backup.clone().unwrap_or_default(),
            backup_namespace: args.backup_namespace.clone(),
            restore_namespace: args.restore_namespace.clone(),
            ttl,
        };
        create_test(&store, &clock, &request)?
    };

    match output_mode(cli) {
        OutputMode::Human => {
            println!(
                "restore test {} created for backup {} ({})",
                test.name().bold(),
                test.spec.backup_name,
                phase_label(test.status.phase)
            );
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "create",
            "test": serde_json::to_value(&test)?,
        }))?,
    }
    Ok(())
}

fn read_spec(path: &Path) -> Result<RestoreTestSpec, CliError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| CliError::User(format!("cannot read {}: {e}", path.display())))?;
    let is_toml = path.extension().is_some_and(|ext| ext == "toml");
    if is_toml {
        toml::from_str(&raw).map_err(|e| CliError::User(format!("invalid spec {}: {e}", path.display())))
    } else {
        serde_json::from_str(&raw).map_err(|e| CliError::User(format!("invalid spec {}: {e}", path.display())))
    }
}

fn run_delete(cli: &Cli, args: &NameArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let test = request_deletion(&store, &SystemClock, &args.name)?;

    match output_mode(cli) {
        OutputMode::Human => println!(
            "deletion of {} requested ({}); cleanup runs on the next pass",
            test.name().bold(),
            phase_label(test.status.phase)
        ),
        OutputMode::Json => write_json_line(&json!({
            "command": "delete",
            "name": test.name(),
            "phase": test.status.phase,
            "deletionRequestedAt": test.metadata.deletion_requested_at,
        }))?,
    }
    Ok(())
}

// ──────────────────── list / status ────────────────────

fn run_list(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let tests = open_store(&config)?.list()?;

    match output_mode(cli) {
        OutputMode::Human => {
            if tests.is_empty() {
                println!("No restore tests.");
                return Ok(());
            }
            println!("{:<40} {:<24} {:<22} {:>8}", "NAME", "BACKUP", "PHASE", "RTO");
            for test in &tests {
                let rto = test
                    .status
                    .result
                    .as_ref()
                    .map_or_else(|| "-".to_string(), |r| format!("{:.0}s", r.rto_seconds));
                println!(
                    "{:<40} {:<24} {:<22} {:>8}",
                    test.name(),
                    test.spec.backup_name,
                    phase_label(test.status.phase),
                    rto
                );
            }
        }
        OutputMode::Json => {
            let items: Vec<Value> = tests
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name(),
                        "backup": t.spec.backup_name,
                        "phase": t.status.phase,
                        "deleting": t.is_deleting(),
                        "result": t.status.result,
                    })
                })
                .collect();
            write_json_line(&json!({ "command": "list", "tests": items }))?;
        }
    }
    Ok(())
}

fn run_status(cli: &Cli, args: &NameArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let test = open_store(&config)?.get(&args.name)?;
    match output_mode(cli) {
        OutputMode::Human => print_status(&test),
        OutputMode::Json => write_json_line(&json!({
            "command": "status",
            "test": serde_json::to_value(&test)?,
        }))?,
    }
    Ok(())
}

fn print_status(test: &RestoreTest) {
    let status = &test.status;
    println!("{}  {}", test.name().bold(), phase_label(status.phase));
    println!("  Backup:            {}", test.spec.backup_name);
    if let Some(ns) = &status.restore_namespace {
        println!("  Restore namespace: {ns}");
    }
    if let Some(id) = &status.restore_state.restore_id {
        println!(
            "  Restore:           {id} ({}/{} items)",
            status.restore_state.items_restored, status.restore_state.items_attempted
        );
    }
    if let Some(at) = test.metadata.deletion_requested_at {
        println!("  Deletion:          requested {}", at.to_rfc3339());
    }

    if !status.conditions.is_empty() {
        println!("\n  Conditions:");
        for c in &status.conditions {
            println!(
                "    {:<22} {:<20} {} {}",
                c.kind.as_str(),
                c.reason,
                c.transition_time.format("%Y-%m-%d %H:%M:%S"),
                c.message.dimmed()
            );
        }
    }

    if !status.health_check_results.is_empty() {
        println!("\n  Health checks:");
        for r in &status.health_check_results {
            let label = match r.status {
                lazarus::health::ProbeStatus::Passed => r.status.to_string().green(),
                lazarus::health::ProbeStatus::Failed => r.status.to_string().red(),
                lazarus::health::ProbeStatus::Timeout => r.status.to_string().yellow(),
            };
            println!(
                "    {:<28} {:<9} {:<8} {:>7.2}s  {}",
                r.name, r.category.to_string(), label, r.duration_seconds, r.detail
            );
        }
    }

    if let Some(result) = &status.result {
        println!("\n  Result:");
        println!("    RTO: {:.0}s", result.rto_seconds);
        if result.rpo_measured {
            println!("    RPO: {:.0}s", result.rpo_seconds);
        } else {
            println!("    RPO: not measured");
        }
        println!(
            "    Resources: {} recovered, {} failed",
            result.resources_recovered, result.resources_failed
        );
        println!("    {}", result.message);
    }

    let cleanup = &status.cleanup;
    if let Some(deadline) = cleanup.deadline {
        println!("\n  Cleanup due: {}", deadline.to_rfc3339());
    } else if cleanup.retained {
        println!("\n  Cleanup: resources retained until the test is deleted");
    }
    if let Some(err) = &cleanup.last_error {
        println!("  Last cleanup error: {}", err.red());
    }
}

fn phase_label(phase: Phase) -> colored::ColoredString {
    match phase {
        Phase::Succeeded => phase.as_str().green().bold(),
        Phase::Failed | Phase::RestoreFailed => phase.as_str().red().bold(),
        Phase::CleaningUp | Phase::Expired => phase.as_str().dimmed(),
        _ => phase.as_str().cyan(),
    }
}

// ──────────────────── reconcile ────────────────────

fn run_reconcile(cli: &Cli, args: &NameArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let (logger, logger_join) = spawn_logger(ActivityLoggerConfig::new(JsonlConfig::at(
        config.paths.jsonl_log.clone(),
    )))?;
    let parts = production_collaborators(&config, Arc::new(logger.clone()))?;
    let reconciler = Reconciler::new(parts, ReconcilerSettings::from_config(&config))
        .with_activity_log(logger.clone());

    let outcome = reconciler.reconcile(&args.name, &CancelToken::new());
    logger.shutdown();
    let _ = logger_join.join();
    let action = outcome?;

    let test = match reconciler.store().get(&args.name) {
        Ok(test) => Some(test),
        Err(LzrError::NotFound { .. }) => None,
        Err(e) => return Err(e.into()),
    };
    let requeue = match action {
        ReconcileAction::Done => None,
        ReconcileAction::RequeueAfter(delay) => Some(delay),
    };

    match output_mode(cli) {
        OutputMode::Human => {
            match &test {
                Some(test) => println!("{}  {}", test.name().bold(), phase_label(test.status.phase)),
                None => println!("{} removed", args.name),
            }
            match requeue {
                Some(delay) => println!("  next pass due in {}", format_requeue(delay)),
                None => println!("  nothing further to do until the test changes"),
            }
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "reconcile",
            "name": args.name,
            "phase": test.as_ref().map(|t| t.status.phase),
            "removed": test.is_none(),
            "requeueAfterSecs": requeue.map(|d| d.as_secs_f64()),
        }))?,
    }
    Ok(())
}

fn format_requeue(delay: Duration) -> String {
    if delay.is_zero() {
        "0s".to_string()
    } else {
        format_duration(delay)
    }
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();
            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "config path",
                    "path": path.to_string_lossy(),
                    "exists": exists,
                }))?,
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;
            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "config show",
                    "config": serde_json::to_value(&config)?,
                }))?,
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;
                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => write_json_line(&json!({
                        "command": "config validate",
                        "valid": true,
                        "path": config.paths.config_file.to_string_lossy(),
                        "hash": hash,
                    }))?,
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => eprintln!("Configuration is INVALID: {e}"),
                    OutputMode::Json => write_json_line(&json!({
                        "command": "config validate",
                        "valid": false,
                        "error": e.to_string(),
                    }))?,
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ──────────────────── output ────────────────────

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("LAZARUS_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }
    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ if stdout_is_tty => OutputMode::Human,
        _ => OutputMode::Json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_before_and_after_subcommand() {
        let before = Cli::try_parse_from(["lazarus", "--config", "/tmp/l.toml", "--json", "-v", "list"]);
        assert!(before.is_ok());
        let after = Cli::try_parse_from(["lazarus", "list", "--json", "--no-color", "-q"]);
        assert!(after.is_ok());
    }

    #[test]
    fn parses_every_subcommand() {
        let cases = [
            vec!["lazarus", "daemon", "--workers", "8"],
            vec!["lazarus", "create", "daily-2026-01-01"],
            vec!["lazarus", "create", "daily", "--name", "drill", "--ttl", "2h", "--restore-namespace", "scratch"],
            vec!["lazarus", "create", "--spec", "/tmp/spec.json"],
            vec!["lazarus", "status", "drill"],
            vec!["lazarus", "delete", "drill"],
            vec!["lazarus", "reconcile", "drill"],
            vec!["lazarus", "config", "show"],
            vec!["lazarus", "config", "validate"],
            vec!["lazarus", "config"],
            vec!["lazarus", "completions", "bash"],
        ];
        for case in cases {
            assert!(Cli::try_parse_from(case.clone()).is_ok(), "failed to parse {case:?}");
        }
    }

    #[test]
    fn create_needs_backup_or_spec() {
        assert!(Cli::try_parse_from(["lazarus", "create"]).is_err());
        assert!(Cli::try_parse_from(["lazarus", "create", "daily", "--spec", "/tmp/s.json"]).is_err());
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["lazarus", "-v", "-q", "list"]).is_err());
    }

    #[test]
    fn output_mode_resolution() {
        assert_eq!(resolve_output_mode(true, Some("human"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("json"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("HUMAN"), false), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, None, true), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, Some("auto"), false), OutputMode::Json);
    }

    #[test]
    fn user_errors_map_to_exit_code_one() {
        let err: CliError = LzrError::validation("bad").into();
        assert_eq!(err.exit_code(), 1);
        let err: CliError = LzrError::transient("kubectl", "down").into();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn log_directive_honours_flags() {
        let cli = Cli::try_parse_from(["lazarus", "-v", "list"]).unwrap();
        assert_eq!(log_directive(&cli), "lazarus=debug,info");
        let cli = Cli::try_parse_from(["lazarus", "-q", "list"]).unwrap();
        assert_eq!(log_directive(&cli), "error");
    }
}
