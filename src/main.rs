//! Weft CLI.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, ValueEnum};

use weft::util::logger::{self, LogLevel};
use weft::{run_files, RuntimeConfig, NAME, VERSION};

/// Log level enum for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for LogLevel {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Error => LogLevel::Error,
        }
    }
}

/// A multi-VM scripting runtime host
#[derive(Parser, Debug)]
#[command(name = NAME)]
#[command(version = VERSION)]
#[command(about = "Run weft scripts", long_about = None)]
struct Args {
    /// Script files to run, in order
    #[arg(value_name = "FILE")]
    files: Vec<PathBuf>,

    /// Arguments passed through to the scripts
    #[arg(last = true, value_name = "ARG")]
    script_args: Vec<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Set log level (debug, info, warn, error)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevelArg>,

    /// Worker threads for blocking tasks (defaults to available cores)
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{}", err);
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            // clap's rendering includes the offending argument and usage
            eprint!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let level = match args.log_level {
        Some(level) => level.into(),
        None if args.verbose => LogLevel::Debug,
        None => LogLevel::Warn,
    };
    logger::init_with_level(level);

    if args.files.is_empty() {
        eprintln!("Error: {} expects a file to run.", NAME);
        eprintln!();
        eprintln!("{}", Args::command().render_usage());
        return ExitCode::FAILURE;
    }

    let config = RuntimeConfig {
        worker_threads: args.workers,
        ..RuntimeConfig::default()
    };

    if run_files(&args.files, &args.script_args, config) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
