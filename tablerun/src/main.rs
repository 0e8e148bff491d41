//! Claim-and-arbitrate goal runner over shared tables.
//!
//! `tablerun dispatch` walks the tables and launches one `<goal>_agent`
//! executable per goal column and entry. `tablerun claim` is a generic goal
//! executable: it claims the goal on one entry and runs a command as the work.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use tablerun::agent::{Agent, AgentEnv, AgentOptions, locate_entry};
use tablerun::exit_codes;
use tablerun::io::clock::SystemClock;
use tablerun::io::config::{Config, load_config};
use tablerun::io::host::{Identity, default_goal_dir};
use tablerun::io::json_store::JsonDirStore;
use tablerun::io::launcher::ProcessLauncher;
use tablerun::io::notify::notifier_from_config;
use tablerun::io::probe::PsProbe;
use tablerun::io::store::RecordStore;
use tablerun::logging;
use tablerun::runner::{DEFAULT_SLEEP_BETWEEN, Runner, RunnerEnv, RunnerOptions};
use tablerun::work::WorkCommand;

#[derive(Parser)]
#[command(
    name = "tablerun",
    version,
    about = "Claim-and-arbitrate goal runner over shared tables"
)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = "tablerun.toml")]
    config: PathBuf,

    /// Log progress live instead of buffering agent diagnostics.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch goal executables for every entry of the selected tables.
    Dispatch(DispatchArgs),
    /// Claim one goal on one entry and run a command as the work.
    Claim(ClaimArgs),
    /// Print one entry as JSON.
    Entry {
        table: String,
        /// Key values in rank order.
        keys: Vec<String>,
    },
}

#[derive(Args)]
struct DispatchArgs {
    /// Visit only this table (repeatable).
    #[arg(long = "only", value_name = "TABLE", conflicts_with = "skip")]
    only: Vec<String>,

    /// Visit every table except this one (repeatable).
    #[arg(long = "skip", value_name = "TABLE")]
    skip: Vec<String>,

    /// Never launch this goal (repeatable).
    #[arg(long = "skip-goal", value_name = "GOAL")]
    skip_goal: Vec<String>,

    /// Log what would be launched without launching it.
    #[arg(long)]
    dry_run: bool,

    /// Wait for each goal executable before starting the next.
    #[arg(long)]
    serial: bool,

    /// Seconds to pause after each launched goal.
    #[arg(long, value_name = "SECS")]
    sleep: Option<u64>,

    /// Directory of `<goal>_agent` executables.
    #[arg(long)]
    goal_dir: Option<PathBuf>,
}

#[derive(Args)]
struct ClaimArgs {
    goal: String,
    table: String,
    /// Key values in rank order.
    keys: Vec<String>,

    /// Field that must read "1" before the goal may run (repeatable).
    #[arg(long = "prereq", value_name = "FIELD")]
    prereq: Vec<String>,

    /// Refuse when this many instances already run on this host.
    #[arg(long)]
    max_selves: Option<usize>,

    /// Refuse when N processes matching NAME run on this host (repeatable).
    #[arg(long = "conflicts-with", value_name = "NAME=N", value_parser = parse_conflict)]
    conflicts_with: Vec<(String, usize)>,

    /// Field also set to "1" on success (repeatable).
    #[arg(long = "subsumes", value_name = "FIELD")]
    subsumes: Vec<String>,

    /// Process table pattern counted against --max-selves. Defaults to
    /// "claim <goal>".
    #[arg(long, value_name = "PATTERN")]
    self_pattern: Option<String>,

    /// Settle interval in seconds, overriding the config.
    #[arg(long, value_name = "SECS")]
    settle: Option<u64>,

    /// Work command; receives the entry as JSON on stdin.
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn parse_conflict(raw: &str) -> Result<(String, usize), String> {
    let (name, count) = raw
        .rsplit_once('=')
        .ok_or_else(|| format!("expected NAME=N, got {raw:?}"))?;
    if name.is_empty() {
        return Err(format!("empty process name in {raw:?}"));
    }
    let count = count
        .parse()
        .map_err(|_| format!("invalid count in {raw:?}"))?;
    Ok((name.to_string(), count))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.debug);
    match run(cli) {
        Ok(code) => exit_code(code),
        Err(err) => {
            eprintln!("{err:#}");
            exit_code(exit_codes::INVALID)
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
}

fn run(cli: Cli) -> Result<i32> {
    let config = load_config(&cli.config)?;
    debug!(config = %cli.config.display(), "loaded config");
    let store = JsonDirStore::new(resolve_root(&cli.config, &config.store.root));
    match cli.command {
        Command::Dispatch(args) => cmd_dispatch(&config, &store, cli.debug, args),
        Command::Claim(args) => cmd_claim(&config, &store, cli.debug, args),
        Command::Entry { table, keys } => cmd_entry(&config, &store, &table, &keys),
    }
}

/// Relative store roots are resolved against the config file's directory.
fn resolve_root(config_path: &Path, root: &Path) -> PathBuf {
    if root.is_absolute() {
        return root.to_path_buf();
    }
    match config_path.parent() {
        Some(dir) => dir.join(root),
        None => root.to_path_buf(),
    }
}

fn cmd_dispatch(
    config: &Config,
    store: &dyn RecordStore,
    debug: bool,
    args: DispatchArgs,
) -> Result<i32> {
    let goal_dir = match args.goal_dir.or_else(|| config.runner.goal_dir.clone()) {
        Some(dir) => dir,
        None => default_goal_dir()?,
    };
    let sleep_between = args
        .sleep
        .or(config.runner.sleep_between_secs)
        .map_or(DEFAULT_SLEEP_BETWEEN, Duration::from_secs);
    let options = RunnerOptions {
        only_pages: args.only,
        skip_pages: args.skip,
        dry_run: args.dry_run,
        run_in_serial: args.serial,
        debug,
        sleep_between,
        goal_dir,
    };
    let env = RunnerEnv {
        store,
        launcher: &ProcessLauncher,
        clock: &SystemClock,
    };
    let skip_goal = args.skip_goal;
    let runner = Runner::new(options, config.key_fields()?, env)?
        .skip_goal(|goal| skip_goal.iter().any(|skipped| skipped == goal));
    let summary = runner.dispatch()?;
    debug!(?summary, "dispatch finished");
    Ok(exit_codes::OK)
}

fn cmd_claim(
    config: &Config,
    store: &dyn RecordStore,
    debug: bool,
    args: ClaimArgs,
) -> Result<i32> {
    let key_fields = config.key_fields()?;
    let keys = key_fields.from_positional(&args.keys)?;
    let pattern = args
        .self_pattern
        .unwrap_or_else(|| format!("claim {}", args.goal));
    let identity = Identity::detect(pattern)?;
    let notifier = notifier_from_config(&config.notify);

    let mut options = AgentOptions::new(args.goal, args.table, keys);
    options.prerequisites = args.prereq;
    options.max_selves = args.max_selves;
    options.conflicts_with = args.conflicts_with.into_iter().collect::<BTreeMap<_, _>>();
    options.subsumes = args.subsumes;
    options.debug = debug;
    options.settle = args
        .settle
        .map_or_else(|| config.settle_interval(), Duration::from_secs);

    let env = AgentEnv {
        store,
        probe: &PsProbe,
        clock: &SystemClock,
        notifier: notifier.as_ref(),
        identity: &identity,
    };
    let agent = Agent::new(options, &key_fields, config.flag_columns(), env)?;
    let work = WorkCommand::new(
        args.command,
        Duration::from_secs(config.agent.work_timeout_secs),
        config.agent.output_limit_bytes,
    );
    if agent.process(|entry| work.run(entry)) {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::FAILED)
    }
}

fn cmd_entry(
    config: &Config,
    store: &dyn RecordStore,
    table: &str,
    keys: &[String],
) -> Result<i32> {
    let key_fields = config.key_fields()?;
    let keys = key_fields.from_positional(keys)?;
    key_fields.validate_lookup(&keys)?;
    let table = store
        .fetch(table)
        .with_context(|| format!("load table {table}"))?
        .with_context(|| format!("table {table} not found"))?;
    let row = locate_entry(&table, &keys)?;
    let entry = table
        .entry_at_row(row)
        .with_context(|| format!("row {row} missing from table {}", table.name()))?;
    let rendered = serde_json::to_string_pretty(entry.fields()).context("serialize entry")?;
    println!("{rendered}");
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dispatch_flags() {
        let cli = Cli::parse_from([
            "tablerun",
            "--debug",
            "dispatch",
            "--only",
            "jobs",
            "--only",
            "builds",
            "--skip-goal",
            "id",
            "--dry-run",
            "--sleep",
            "10",
        ]);
        assert!(cli.debug);
        let Command::Dispatch(args) = cli.command else {
            panic!("expected dispatch");
        };
        assert_eq!(args.only, vec!["jobs", "builds"]);
        assert_eq!(args.skip_goal, vec!["id"]);
        assert!(args.dry_run);
        assert!(!args.serial);
        assert_eq!(args.sleep, Some(10));
    }

    #[test]
    fn only_and_skip_are_exclusive() {
        let result = Cli::try_parse_from(["tablerun", "dispatch", "--only", "a", "--skip", "b"]);
        assert!(result.is_err());
    }

    #[test]
    fn parse_claim_with_command() {
        let cli = Cli::parse_from([
            "tablerun",
            "claim",
            "build",
            "jobs",
            "7",
            "en",
            "--prereq",
            "fetch",
            "--max-selves",
            "2",
            "--conflicts-with",
            "ffmpeg=1",
            "--subsumes",
            "lint",
            "--",
            "make",
            "-C",
            "/srv/build",
        ]);
        assert_eq!(cli.config, PathBuf::from("tablerun.toml"));
        let Command::Claim(args) = cli.command else {
            panic!("expected claim");
        };
        assert_eq!(args.goal, "build");
        assert_eq!(args.table, "jobs");
        assert_eq!(args.keys, vec!["7", "en"]);
        assert_eq!(args.prereq, vec!["fetch"]);
        assert_eq!(args.max_selves, Some(2));
        assert_eq!(args.conflicts_with, vec![("ffmpeg".to_string(), 1)]);
        assert_eq!(args.subsumes, vec!["lint"]);
        assert_eq!(args.command, vec!["make", "-C", "/srv/build"]);
    }

    #[test]
    fn claim_requires_a_command() {
        assert!(Cli::try_parse_from(["tablerun", "claim", "build", "jobs", "7"]).is_err());
    }

    #[test]
    fn conflicts_with_argument_parsing() {
        assert_eq!(parse_conflict("ffmpeg=2"), Ok(("ffmpeg".to_string(), 2)));
        assert_eq!(parse_conflict("a=b=3"), Ok(("a=b".to_string(), 3)));
        assert!(parse_conflict("ffmpeg").is_err());
        assert!(parse_conflict("=2").is_err());
        assert!(parse_conflict("ffmpeg=many").is_err());
    }

    #[test]
    fn store_root_is_relative_to_config() {
        assert_eq!(
            resolve_root(Path::new("/etc/tablerun/tablerun.toml"), Path::new("tables")),
            PathBuf::from("/etc/tablerun/tables")
        );
        assert_eq!(
            resolve_root(Path::new("tablerun.toml"), Path::new("tables")),
            PathBuf::from("tables")
        );
        assert_eq!(
            resolve_root(Path::new("x/tablerun.toml"), Path::new("/srv/tables")),
            PathBuf::from("/srv/tables")
        );
    }
}
