//! gscript command-line front end

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gscript::util::logger::{self, LogLevel};
use gscript::{Value, NAME, VERSION};
use tracing::info;

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

/// An embeddable, dynamically-typed scripting language
#[derive(Parser, Debug)]
#[command(name = "gscript")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Set log level (debug, info, warn, error)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevelArg>,

    /// Additional module search path (repeatable)
    #[arg(short = 'I', long = "search-path")]
    search_paths: Vec<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a script file and invoke main
    Run {
        /// Source file to run
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Compile a script file to bytecode text
    Build {
        /// Source file to compile
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Output file (defaults to <input>.gsbc)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a compiled bytecode file and invoke main
    RunBytecode {
        /// Bytecode file to run
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Dump compiled bytecode for debugging
    Dump {
        /// Source file to dump
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

fn report(result: Value) {
    if !matches!(result, Value::Nil) {
        info!("main returned {:?}", result);
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.log_level {
        Some(level) => logger::init_with_level(level.into()),
        None => logger::init(),
    }

    match args.command {
        Commands::Run { file } => {
            let runtime = gscript::Runtime::new();
            for path in &args.search_paths {
                runtime.add_search_path(path);
            }
            runtime
                .load_source_file(&file)
                .with_context(|| format!("Failed to load: {}", file.display()))?;
            let result = runtime
                .call("main", &[])
                .with_context(|| format!("Failed to run: {}", file.display()))?;
            report(result);
        }
        Commands::Build { file, output } => {
            let output_path = output.unwrap_or_else(|| {
                let mut path = file.clone();
                path.set_extension("gsbc");
                path
            });
            gscript::build_bytecode(&file, &output_path)
                .with_context(|| format!("Failed to build: {}", file.display()))?;
            info!("wrote {}", output_path.display());
        }
        Commands::RunBytecode { file } => {
            let result = gscript::run_bytecode_file(&file)?;
            report(result);
        }
        Commands::Dump { file } => {
            gscript::dump_bytecode(&file)
                .with_context(|| format!("Failed to dump: {}", file.display()))?;
        }
    }

    Ok(())
}
