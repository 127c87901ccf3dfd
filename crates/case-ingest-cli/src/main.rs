//! case-ingest — entry point.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;

use case_ingest::{RunFilter, RunStatus, RunSummary};
use case_ingest_cli::{open_core, orchestrator, resolve_home, resolve_sources, source_overview, Settings};

#[derive(Parser)]
#[command(
    name = "case-ingest",
    about = "Governed ingestion of court portals and APIs into evidence and records",
    version
)]
struct Cli {
    /// Data directory (database, evidence, captcha sentinels).
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Path to sources.toml.
    #[arg(long, global = true)]
    sources: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Show the browser window, for solving captchas by hand.
    #[arg(long, global = true)]
    headful: bool,

    /// Minutes to wait for a human to clear a captcha.
    #[arg(long, global = true, default_value_t = 20)]
    captcha_wait_mins: u64,

    /// Seconds allowed per document download.
    #[arg(long, global = true, default_value_t = 120)]
    document_timeout_secs: u64,

    /// Seconds allowed per navigation, click, or fetch.
    #[arg(long, global = true, default_value_t = 60)]
    step_timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Run status as typed on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StatusArg {
    #[value(name = "RUNNING")]
    Running,
    #[value(name = "SUCCESS")]
    Success,
    #[value(name = "PARTIAL")]
    Partial,
    #[value(name = "FAILED")]
    Failed,
    #[value(name = "CAPTCHA_BLOCKED")]
    CaptchaBlocked,
    #[value(name = "FAILED_STALE")]
    FailedStale,
}

impl From<StatusArg> for RunStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Running => RunStatus::Running,
            StatusArg::Success => RunStatus::Success,
            StatusArg::Partial => RunStatus::Partial,
            StatusArg::Failed => RunStatus::Failed,
            StatusArg::CaptchaBlocked => RunStatus::CaptchaBlocked,
            StatusArg::FailedStale => RunStatus::FailedStale,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest one unit (e.g. a case number) from a source.
    Run {
        #[arg(long)]
        source: String,
        #[arg(long)]
        unit: String,
    },

    /// Sweep a date window, inclusive on both ends.
    Window {
        #[arg(long)]
        source: String,
        /// Start date (YYYY-MM-DD).
        #[arg(long)]
        start: NaiveDate,
        /// End date (YYYY-MM-DD).
        #[arg(long)]
        end: NaiveDate,
    },

    /// List recorded runs, newest first.
    Runs {
        #[arg(long)]
        source: Option<String>,
        #[arg(long, value_enum, ignore_case = true)]
        status: Option<StatusArg>,
        #[arg(long)]
        unit: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },

    /// List evidence captured for a unit.
    Evidence {
        #[arg(long)]
        unit: String,
    },

    /// Mark orphaned RUNNING rows as FAILED_STALE.
    Reclaim {
        /// Age in minutes after which a RUNNING row is considered orphaned.
        #[arg(long, default_value_t = 120)]
        liveness_mins: u64,
    },

    /// Show configured sources with their admission state.
    Sources,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   case-ingest completions bash > ~/.local/share/bash-completion/completions/case-ingest
    ///   case-ingest completions zsh > ~/.zfunc/_case-ingest
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

fn init_logging(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn finish(summary: RunSummary) -> Result<()> {
    print_json(&summary)?;
    if !summary.exit_ok() {
        std::process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(
            *shell,
            &mut Cli::command(),
            "case-ingest",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    init_logging(&cli);

    let home = resolve_home(cli.home.as_deref());
    let sources = resolve_sources(cli.sources.as_deref(), &home);
    let mut settings = Settings::new(home, sources);
    settings.headful = cli.headful;
    settings.automation.captcha_wait = Duration::from_secs(cli.captcha_wait_mins * 60);
    settings.automation.document_timeout = Duration::from_secs(cli.document_timeout_secs);
    settings.automation.step_timeout = Duration::from_secs(cli.step_timeout_secs);

    match cli.command {
        Commands::Run { source, unit } => {
            let orchestrator = orchestrator(&settings)?;
            finish(orchestrator.run_unit(&source, &unit).await?)?;
        }

        Commands::Window { source, start, end } => {
            let orchestrator = orchestrator(&settings)?;
            finish(orchestrator.run_window(&source, start, end).await?)?;
        }

        Commands::Runs {
            source,
            status,
            unit,
            limit,
        } => {
            let core = open_core(&settings)?;
            let runs = core.ledger.list(&RunFilter {
                source,
                unit_key: unit,
                status: status.map(RunStatus::from),
                limit: Some(limit),
            })?;
            print_json(&runs)?;
        }

        Commands::Evidence { unit } => {
            let core = open_core(&settings)?;
            print_json(&core.evidence.list_for_unit(&unit)?)?;
        }

        Commands::Reclaim { liveness_mins } => {
            let core = open_core(&settings)?;
            let ids = core
                .ledger
                .reclaim_stale_runs(Duration::from_secs(liveness_mins * 60))?;
            print_json(&ids)?;
        }

        Commands::Sources => {
            let core = open_core(&settings)?;
            print_json(&source_overview(&core).await?)?;
        }

        Commands::Completions { .. } => {}
    }

    Ok(())
}
