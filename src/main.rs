use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

use propsync::app::{self, App};
use propsync::config::Config;
use propsync::persist::{DurableStore, PersistenceBridge};

#[derive(Parser, Debug)]
#[command(name = "propsync")]
#[command(about = "Cache, persistence and realtime sync for property-management data")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/propsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Restore the cache, follow the change feed and warm the dashboard until Ctrl-C
  Run,
  /// Delete expired cache snapshots
  Sweep,
  /// List cache snapshots with their age and expiry
  Inspect,
  /// Delete every cache snapshot
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = propsync::logging::init()?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  match args.command.unwrap_or(Cmd::Run) {
    Cmd::Run => {
      let app = App::new(config)?;
      app.run().await?;
    }
    Cmd::Sweep => {
      let store = app::open_store(&config.persistence);
      let bridge = PersistenceBridge::new(store, config.persistence.options());
      println!("Removed {} expired snapshot(s)", bridge.sweep());
    }
    Cmd::Inspect => {
      let store = app::open_store(&config.persistence);
      let rows = app::inspect(store.as_ref(), Utc::now(), &config.persistence.buster)?;
      if rows.is_empty() {
        println!("No cache snapshots");
      }
      for row in rows {
        println!(
          "{:<40} age {:>6}s  expires in {:>6}s{}{}",
          row.key,
          row.age.num_seconds(),
          row.expires_in.num_seconds(),
          if row.invalidated { "  (stale)" } else { "" },
          if row.current { "" } else { "  (outdated)" }
        );
      }
    }
    Cmd::Clear => {
      let store = app::open_store(&config.persistence);
      println!("Removed {} snapshot(s)", store.clear()?);
    }
  }

  Ok(())
}
