use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use covlua::cli;
use covlua::instrument::cache::DiskCache;
use covlua::Strategy;

/// Line, block and function coverage for Lua test runs.
#[derive(Parser)]
#[command(name = "covlua", version, about)]
struct Cli {
    /// JSON configuration file (default: built-in settings rooted at the
    /// current directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show how each line of a Lua file is classified.
    Analyze {
        /// The Lua source file.
        file: PathBuf,
    },

    /// Print the instrumented form of a Lua file.
    Instrument {
        /// The Lua source file.
        file: PathBuf,

        /// Print the output-to-original line map instead of the code.
        #[arg(long)]
        sourcemap: bool,
    },

    /// Run a recorded event script through a session and print the snapshot.
    Replay {
        /// JSON array of host events.
        script: PathBuf,

        /// Collection strategy (trace, instrument).
        #[arg(long, default_value = "trace")]
        strategy: Strategy,

        /// Write the snapshot here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Show a summary of a coverage snapshot.
    Summary {
        snapshot: PathBuf,
    },

    /// List per-file coverage in a snapshot.
    Files {
        snapshot: PathBuf,

        /// Sort by execution rate ascending (show worst files first).
        #[arg(long)]
        sort_by_rate: bool,
    },

    /// Show line-level coverage for a source file.
    Lines {
        snapshot: PathBuf,

        /// The normalized source path as stored in the snapshot.
        source_file: String,
    },

    /// Show only executable lines that never ran.
    Unexecuted {
        snapshot: PathBuf,

        source_file: String,
    },

    /// Merge snapshots from parallel workers.
    Merge {
        /// Snapshots to combine.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Write the merged snapshot here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Inspect or clear the instrumented source cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show entry counts and size.
    Stats,
    /// Remove every cached source.
    Clear,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("COVLUA_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    let config = cli::load_config(args.config.as_deref())?;

    let output = match args.command {
        Commands::Analyze { file } => cli::cmd_analyze(&config, &file)?,
        Commands::Instrument { file, sourcemap } => cli::cmd_instrument(&config, &file, sourcemap)?,
        Commands::Replay {
            script,
            strategy,
            output,
        } => {
            let json = cli::cmd_replay(config, strategy, &script)?;
            return emit(output.as_deref(), &json);
        }
        Commands::Summary { snapshot } => cli::cmd_summary(&cli::load_store(&snapshot)?),
        Commands::Files {
            snapshot,
            sort_by_rate,
        } => cli::cmd_files(&cli::load_store(&snapshot)?, sort_by_rate),
        Commands::Lines {
            snapshot,
            source_file,
        } => cli::cmd_lines(&cli::load_store(&snapshot)?, &source_file, false)?,
        Commands::Unexecuted {
            snapshot,
            source_file,
        } => cli::cmd_lines(&cli::load_store(&snapshot)?, &source_file, true)?,
        Commands::Merge { inputs, output } => {
            let inputs: Vec<&Path> = inputs.iter().map(PathBuf::as_path).collect();
            let json = cli::cmd_merge(&inputs)?;
            return emit(output.as_deref(), &json);
        }
        Commands::Cache { action } => {
            let path = config
                .cache_path
                .as_deref()
                .context("No cache_path set in the configuration")?;
            let cache = DiskCache::open(path).context("Failed to open cache database")?;
            match action {
                CacheAction::Stats => cli::cmd_cache_stats(&cache)?,
                CacheAction::Clear => cli::cmd_cache_clear(&cache)?,
            }
        }
    };

    print!("{output}");
    Ok(())
}

fn emit(path: Option<&Path>, json: &str) -> Result<()> {
    match path {
        Some(p) => std::fs::write(p, json).with_context(|| format!("Failed to write {}", p.display())),
        None => {
            println!("{json}");
            Ok(())
        }
    }
}
