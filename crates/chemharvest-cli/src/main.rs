//! chemharvest - resumable harvesting of chemistry corpora
//!
//! Gathers ChemRxiv preprint metadata and PDFs, downloads and flattens
//! PubChem compound records, and generates LLM queries over tabular text,
//! each as a resumable, rate-limited job.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use chemharvest_core::{JobError, JobSummary, ProgressContext, Shutdown};
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::Config;

/// Exit code of a startup error (bad configuration)
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "chemharvest")]
#[command(about = "Resumable harvesting of chemistry datasets")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "debug")]
    quiet: bool,

    /// Config file path (default: ./chemharvest.toml or ~/.config/chemharvest/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// ChemRxiv preprint metadata and PDFs
    Chemrxiv(cmd::chemrxiv::ChemRxivArgs),
    /// PubChem compound records
    Pubchem(cmd::pubchem::PubChemArgs),
    /// LLM query generation over a CSV of texts
    Querygen(cmd::querygen::QueryGenArgs),
    /// Show effective configuration
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Progress context (TTY auto-detect)
    let progress = ProgressContext::new();

    // Logging:
    //   TTY:     warn unless --debug: progress bars show activity
    //   non-TTY: info unless --quiet: logs are the only progress indicator
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = cli.quiet || (is_tty && !cli.debug);
    if let Err(e) = chemharvest_core::init_logging(quiet, cli.debug, multi) {
        eprintln!("failed to initialize logging: {e}");
    }

    let config = match cli.config {
        Some(path) => Config::from_file(&path),
        None => Config::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let shutdown = Shutdown::new();
    if let Err(e) = setup_signal_handler(&shutdown) {
        log::error!("failed to register signal handlers: {e}");
        return ExitCode::from(EXIT_CONFIG);
    }

    let outcome = match cli.command {
        Command::Chemrxiv(args) => cmd::chemrxiv::run(args, &config, &shutdown, &progress),
        Command::Pubchem(args) => cmd::pubchem::run(args, &config, &shutdown, &progress),
        Command::Querygen(args) => cmd::querygen::run(args, &config, &shutdown, &progress),
        Command::Config => cmd::show_config(&config).map(|()| 0),
    };

    match outcome {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::from(error_exit_code(&e))
        }
    }
}

/// First signal requests a graceful shutdown; a second one exits at once.
fn setup_signal_handler(shutdown: &Shutdown) -> std::io::Result<()> {
    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        let flag = shutdown.flag();
        // SAFETY: AtomicBool::swap and _exit are async-signal-safe
        unsafe {
            signal_hook::low_level::register(signal, move || {
                if flag.swap(true, Ordering::Relaxed) {
                    signal_hook::low_level::exit(130);
                }
            })?;
        }
    }
    Ok(())
}

/// 2 when a configuration error caused the failure, 1 otherwise.
fn error_exit_code(err: &anyhow::Error) -> u8 {
    let is_config = err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<JobError>(), Some(JobError::Config(_))));
    if is_config { EXIT_CONFIG } else { 1 }
}

/// Print (TTY) or log the summary of a finished job; its exit code.
pub(crate) fn report(summary: &JobSummary, progress: &ProgressContext) -> u8 {
    if progress.is_tty() {
        summary.print();
    } else {
        summary.log();
    }
    summary.exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn config_errors_map_to_two() {
        let err = Err::<(), _>(JobError::Config("worker_count must be at least 1".into()))
            .context("pubchem download")
            .unwrap_err();
        assert_eq!(error_exit_code(&err), EXIT_CONFIG);
    }

    #[test]
    fn other_errors_map_to_one() {
        let err = anyhow::Error::new(JobError::Ledger(std::io::Error::other("unreadable")));
        assert_eq!(error_exit_code(&err), 1);
        assert_eq!(error_exit_code(&anyhow::anyhow!("disk full")), 1);
    }

    #[test]
    fn cli_parses_stage_selectors() {
        let cli = Cli::try_parse_from(["chemharvest", "querygen", "collect", "--no-wait"]).unwrap();
        assert!(matches!(cli.command, Command::Querygen(_)));
        let cli = Cli::try_parse_from(["chemharvest", "--debug", "pubchem", "parse"]).unwrap();
        assert!(cli.debug);
        assert!(Cli::try_parse_from(["chemharvest", "--debug", "--quiet", "config"]).is_err());
        assert!(Cli::try_parse_from(["chemharvest", "chemrxiv", "upload"]).is_err());
    }
}
