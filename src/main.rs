mod config;
mod coverage;
mod instrument;
mod launcher;
mod report;
mod runner;
mod signals;
mod watcher;
mod workspace;

use clap::{Args, Parser, Subcommand};
use config::CovConfig;
use report::{CommandRenderer, ReportDescriptor, ReportOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Instrument a JavaScript project, run it until it reports ready, then stop
/// it and render a coverage report from the counters it flushes on SIGINT.
#[derive(Parser, Debug)]
#[command(name = "covwatch", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, default_value = "covwatch.toml", global = true)]
    config: PathBuf,

    /// Validate config and print resolved settings, don't run
    #[arg(long, global = true)]
    dry_run: bool,

    /// Extra logging (poll attempts, child process details)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings, errors and the final summary
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Instrument, run until ready, collect coverage and write a report (default)
    Run(RunArgs),
    /// Send SIGINT to the run command recorded in the pid file
    Stop,
    /// Merge existing snapshot files and write a report
    Report {
        /// Snapshot files to merge
        #[arg(required = true)]
        snapshots: Vec<PathBuf>,

        #[command(flatten)]
        format: FormatArgs,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Ready pattern (overrides config)
    #[arg(long)]
    ready_pattern: Option<String>,

    /// Seconds to wait for the coverage snapshot (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    #[command(flatten)]
    format: FormatArgs,
}

#[derive(Args, Debug, Default)]
struct FormatArgs {
    /// Report destination directory (overrides config)
    #[arg(short, long)]
    dest: Option<PathBuf>,

    /// HTML report plus lcov.info
    #[arg(long)]
    html_lcov: bool,

    /// lcov.info only
    #[arg(long)]
    lcov_only: bool,

    /// Cobertura XML
    #[arg(long)]
    cobertura: bool,
}

impl FormatArgs {
    /// CLI flags win over config when any is given.
    fn descriptor(&self, config: &CovConfig) -> ReportDescriptor {
        let options = if self.html_lcov || self.lcov_only || self.cobertura {
            ReportOptions {
                html_lcov: self.html_lcov,
                lcov_only: self.lcov_only,
                cobertura: self.cobertura,
            }
        } else {
            ReportOptions {
                html_lcov: config.report.html_lcov,
                lcov_only: config.report.lcov_only,
                cobertura: config.report.cobertura,
            }
        };
        let destination = self
            .dest
            .clone()
            .unwrap_or_else(|| config.report.destination.clone());
        ReportDescriptor::new(Some(&options), destination)
    }
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn print_error_chain(err: &dyn std::error::Error) {
    eprintln!("error: {err}");
    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match CovConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            print_error_chain(&e);
            std::process::exit(2);
        }
    };

    let command = cli.command.unwrap_or(Commands::Run(RunArgs::default()));
    if let Commands::Run(args) = &command {
        if let Some(pattern) = &args.ready_pattern {
            config.run.ready_pattern = pattern.clone();
        }
        if let Some(timeout) = args.timeout {
            config.watch.timeout_secs = timeout;
        }
    }

    if let Err(e) = config.validate() {
        print_error_chain(&e);
        std::process::exit(2);
    }

    if cli.dry_run {
        println!("covwatch v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("{config:#?}");
        println!("Dry run mode, not running.");
        return;
    }

    let code = match command {
        Commands::Run(args) => run(&config, &args).await,
        Commands::Stop => stop(&config),
        Commands::Report { snapshots, format } => report(&config, &snapshots, &format).await,
    };
    std::process::exit(code);
}

async fn run(config: &CovConfig, args: &RunArgs) -> i32 {
    let descriptor = args.format.descriptor(config);
    let result = match runner::Runner::from_config(config, descriptor) {
        Ok(r) => r.run().await,
        Err(e) => Err(e),
    };
    match result {
        Ok(summary) => {
            tracing::info!(
                pid = summary.pid,
                exit_code = ?summary.exit_code,
                instrumented = summary.instrumented_files,
                "coverage run complete"
            );
            println!("{}", summary.coverage);
            println!(
                "{} report written to {}",
                summary.descriptor.format,
                summary.descriptor.destination.display()
            );
            0
        }
        Err(e) => {
            print_error_chain(&e);
            1
        }
    }
}

fn stop(config: &CovConfig) -> i32 {
    let pid_file = workspace::Workspace::new(&config.workspace).pid_file();
    let result = signals::read_pid_file(&pid_file).and_then(|pid| {
        tracing::info!(pid, "sending SIGINT to recorded run command");
        signals::interrupt(pid)
    });
    match result {
        Ok(()) => 0,
        Err(e) => {
            print_error_chain(&e);
            1
        }
    }
}

async fn report(config: &CovConfig, snapshots: &[PathBuf], format: &FormatArgs) -> i32 {
    let descriptor = format.descriptor(config);
    let renderer = Arc::new(CommandRenderer::new(
        config.report.command.clone(),
        config.report.args.clone(),
    ));
    match runner::report_snapshots(snapshots, &descriptor, renderer).await {
        Ok(coverage) => {
            println!("{coverage}");
            println!(
                "{} report written to {}",
                descriptor.format,
                descriptor.destination.display()
            );
            0
        }
        Err(e) => {
            print_error_chain(&e);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::try_parse_from(["covwatch"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("covwatch.toml"));
    }

    #[test]
    fn test_cli_run_overrides() {
        let cli = Cli::try_parse_from([
            "covwatch",
            "run",
            "--ready-pattern",
            "listening",
            "--timeout",
            "9",
            "--cobertura",
            "--dest",
            "out",
        ])
        .unwrap();
        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(args.ready_pattern.as_deref(), Some("listening"));
        assert_eq!(args.timeout, Some(9));

        let descriptor = args.format.descriptor(&CovConfig::default());
        assert_eq!(descriptor.format, report::ReportFormat::Cobertura);
        assert_eq!(descriptor.destination, PathBuf::from("out"));
    }

    #[test]
    fn test_format_args_fall_back_to_config() {
        let mut config = CovConfig::default();
        config.report.lcov_only = true;
        let descriptor = FormatArgs::default().descriptor(&config);
        assert_eq!(descriptor.format, report::ReportFormat::LcovOnly);
        assert_eq!(descriptor.destination, PathBuf::from("coverage"));
    }

    #[test]
    fn test_format_args_cli_flags_replace_config_flags() {
        let mut config = CovConfig::default();
        config.report.html_lcov = true;
        let args = FormatArgs {
            cobertura: true,
            ..Default::default()
        };
        assert_eq!(
            args.descriptor(&config).format,
            report::ReportFormat::Cobertura
        );
    }

    #[test]
    fn test_cli_report_requires_snapshots() {
        assert!(Cli::try_parse_from(["covwatch", "report"]).is_err());
        let cli = Cli::try_parse_from(["covwatch", "report", "a.json", "b.json", "--lcov-only"])
            .unwrap();
        let Some(Commands::Report { snapshots, format }) = cli.command else {
            panic!("expected report subcommand");
        };
        assert_eq!(snapshots.len(), 2);
        assert!(format.lcov_only);
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["covwatch", "stop", "--config", "x.toml", "-v"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Stop)));
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        assert!(cli.verbose);
    }
}
