//! ac2git — AccuRev depot to Git repository converter.
//!
//! Supports:
//! - Full conversion (retrieve + process)
//! - Running either stage on its own
//! - Conversion status inspection
//! - Example configuration emission
//!
//! # Usage
//!
//! ```bash
//! # Write a starting configuration
//! ac2git example-config > ac2git.config.json
//!
//! # Convert (resumable; re-run after an interruption)
//! ac2git run --config ac2git.config.json
//!
//! # Only fetch the per-stream histories
//! ac2git retrieve --config ac2git.config.json
//!
//! # Only process already-fetched histories into branches
//! ac2git process --config ac2git.config.json
//!
//! # Show per-stream progress
//! ac2git info --config ac2git.config.json
//! ```
//!
//! Exit codes: 0 success, 1 configuration or external client error,
//! 2 interrupted (restartable), 3 internal invariant violation.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ac2git_core::{
    read_hwm, AccurevClient, Config, Converter, Error, RefLayout, StateStore, StopFlag,
};

#[derive(Parser, Debug)]
#[command(name = "ac2git")]
#[command(version = "0.1.0")]
#[command(about = "Convert an AccuRev depot into a git repository")]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "ac2git.config.json", global = true)]
    config: PathBuf,

    /// Verbose (debug) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Full conversion: retrieve every stream, then process
    Run,

    /// Retrieve per-stream histories into the hidden refs
    Retrieve,

    /// Process retrieved histories into visible branches
    Process,

    /// Show conversion progress per stream
    Info,

    /// Print an example configuration file
    #[command(name = "example-config")]
    ExampleConfig,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("ac2git={}", default_level).parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match run(&cli) {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!("{:#}", err);
            err.downcast_ref::<Error>()
                .map(Error::exit_code)
                .unwrap_or(1)
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<()> {
    match cli.command {
        Commands::ExampleConfig => {
            println!("{}", Config::example_json());
            Ok(())
        }
        Commands::Run => cmd_run(cli, true, true),
        Commands::Retrieve => cmd_run(cli, true, false),
        Commands::Process => cmd_run(cli, false, true),
        Commands::Info => cmd_info(cli),
    }
}

fn make_client(config: &Config) -> AccurevClient {
    let deadline = config.command_timeout_secs.map(std::time::Duration::from_secs);
    let credentials = match (&config.username, &config.password) {
        (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
        _ => None,
    };
    AccurevClient::new(deadline, credentials)
}

fn cmd_run(cli: &Cli, retrieve: bool, process: bool) -> Result<()> {
    let config = Config::load(&cli.config)?;
    let client = make_client(&config);
    if config.username.is_some() && config.password.is_some() {
        client.login().context("source login failed")?;
    }

    let started = std::time::Instant::now();
    let converter = Converter::new(&config, &client, StopFlag::new())?;

    if retrieve {
        let stats = converter.retrieve()?;
        let transactions: u64 = stats.iter().map(|s| s.transactions).sum();
        let populated: u64 = stats.iter().map(|s| s.populated).sum();
        println!("Retrieval completed:");
        println!("  Streams:      {}", stats.len());
        println!("  Transactions: {}", transactions);
        println!("  Populates:    {}", populated);
    }

    if process {
        let stats = converter.process()?;
        println!("Processing completed:");
        println!("  Transactions: {}", stats.transactions);
        println!("  Commits:      {}", stats.commits);
        if let Some(tx) = stats.last_tx {
            println!("  Last tx:      #{}", tx);
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if elapsed_ms > 0 && stats.transactions > 0 {
            let tx_per_sec = (stats.transactions as f64 / elapsed_ms as f64) * 1000.0;
            println!("  Speed:        {:.1} transactions/sec", tx_per_sec);
        }
    }

    println!("  Time:         {}", format_duration(started.elapsed()));
    Ok(())
}

fn cmd_info(cli: &Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;
    let client = make_client(&config);
    let converter = Converter::new(&config, &client, StopFlag::new())?;
    let store = converter.store();
    let layout = converter.layout();

    println!("Repository: {}", config.repo_path.display());
    println!("Depot:      {} (id {})", config.depot, layout.depot());

    let state = StateStore::new(store, layout);
    match state.read_last()? {
        Some(last) => {
            let date = chrono::DateTime::from_timestamp(last.time, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| last.time.to_string());
            println!("\nLast processed transaction: #{} ({})", last.tx, date);
        }
        None => println!("\nNo transactions processed yet."),
    }

    println!("\nStreams:");
    for stream in converter.tracked().iter() {
        let hwm = read_hwm(store, layout, stream.id)?;
        let tip = store.read_ref(&RefLayout::branch(&stream.branch))?;
        println!("  {} (id {})", stream.name, stream.id);
        println!(
            "    retrieved through: {}",
            hwm.map(|t| format!("#{}", t)).unwrap_or_else(|| "-".into())
        );
        println!(
            "    branch {}: {}",
            stream.branch,
            tip.map(|c| c.as_str()[..8].to_string())
                .unwrap_or_else(|| "not created".into())
        );
    }
    Ok(())
}

fn format_duration(elapsed: std::time::Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}.{:03}s", secs, elapsed.subsec_millis())
    }
}
