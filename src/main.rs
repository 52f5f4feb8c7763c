use agrosync::config::Config;
use agrosync::sync::DrainOutcome;
use agrosync::{logging, Connectivity, Engine, EnqueueOptions, Operation, Priority};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "agrosync")]
#[command(about = "Inspect and drive the offline sync engine")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/agrosync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Sync progress by status and resource type
  Stats,
  /// Item counts and approximate size per collection
  Storage,
  /// Run one sync pass
  Drain,
  /// Queue the operation described in a JSON file
  Enqueue {
    file: PathBuf,
    /// high, medium or low
    #[arg(short, long)]
    priority: Option<Priority>,
    #[arg(long)]
    max_retries: Option<u32>,
  },
  /// Re-enqueue a terminally failed item
  Requeue { key: String },
  /// Remove expired cache entries
  Sweep,
  /// Erase all offline data
  Clear,
  /// Keep syncing until interrupted; reads `online`/`offline` lines on stdin
  Run {
    /// Start in offline mode
    #[arg(long)]
    offline: bool,
  },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", text);
  Ok(())
}

fn read_operation(path: &Path) -> Result<Operation> {
  let contents = std::fs::read_to_string(path)
    .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
  serde_json::from_str(&contents)
    .map_err(|e| eyre!("Failed to parse operation in {}: {}", path.display(), e))
}

/// Forward `online`/`offline` lines from stdin to the connectivity flag.
fn watch_stdin(connectivity: Connectivity) {
  tokio::spawn(async move {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
      match line.trim() {
        "online" => {
          connectivity.set_online(true);
        }
        "offline" => {
          connectivity.set_online(false);
        }
        "" => {}
        other => eprintln!("Unknown command {:?}, expected online or offline", other),
      }
    }
  });
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(&logging::default_log_dir()?)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let online = !matches!(args.command, Command::Run { offline: true });
  let connectivity = Connectivity::new(online);
  let (engine, tags) = Engine::open(&config, connectivity.clone())?;

  match args.command {
    Command::Stats => print_json(&engine.sync_stats().await?)?,
    Command::Storage => print_json(&engine.storage_stats().await?)?,
    Command::Drain => match engine.drain().await? {
      DrainOutcome::Offline => println!("Offline, nothing sent"),
      DrainOutcome::Ran(report) => println!("{}", report.summary()),
    },
    Command::Enqueue {
      file,
      priority,
      max_retries,
    } => {
      let operation = read_operation(&file)?;
      let options = EnqueueOptions {
        priority,
        max_retries,
        metadata: None,
      };
      let id = engine.enqueue(operation, options).await?;
      println!("{}", id);
      // Waits for the pass started by enqueue before the process exits
      if let DrainOutcome::Ran(report) = engine.drain().await? {
        println!("{}", report.summary());
      }
    }
    Command::Requeue { key } => match engine.requeue_failed(&key).await? {
      Some(id) => println!("{}", id),
      None => return Err(eyre!("No failed item with key {}", key)),
    },
    Command::Sweep => {
      let removed = engine.sweep_cache().await?;
      println!("Removed {} expired cache entries", removed);
    }
    Command::Clear => {
      engine.clear_all().await?;
      println!("Cleared all offline data");
    }
    Command::Run { .. } => {
      watch_stdin(connectivity);
      info!(online, "Sync loop started");
      engine
        .run(tags, async {
          let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    }
  }

  Ok(())
}
