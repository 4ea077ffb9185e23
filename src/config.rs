use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::persist::PersistOptions;
use crate::realtime::ReconnectConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub persistence: PersistenceConfig,
  #[serde(default)]
  pub realtime: RealtimeConfig,
  #[serde(default)]
  pub prefetch: PrefetchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Project URL, e.g. https://abc.supabase.co
  pub url: String,
  /// Realtime endpoint when it differs from `url` (defaults to the ws form of `url`)
  pub realtime_url: Option<String>,
  /// Database schema the change feed listens on
  #[serde(default = "default_schema")]
  pub schema: String,
}

fn default_schema() -> String {
  "public".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Idle time after which unobserved entries are dropped
  pub gc_secs: u64,
  /// How often the idle collector runs
  pub gc_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      gc_secs: 600,
      gc_interval_secs: 60,
    }
  }
}

impl CacheConfig {
  pub fn gc_time(&self) -> Duration {
    Duration::seconds(self.gc_secs as i64)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
  pub enabled: bool,
  /// Database path (defaults to $XDG_DATA_HOME/propsync/cache.db)
  pub path: Option<PathBuf>,
  pub max_age_secs: u64,
  pub sweep_interval_secs: u64,
  pub max_records: usize,
  /// Bump to discard every snapshot written by an older build
  pub buster: String,
}

impl Default for PersistenceConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      max_age_secs: 24 * 60 * 60,
      sweep_interval_secs: 60 * 60,
      max_records: 500,
      buster: env!("CARGO_PKG_VERSION").to_string(),
    }
  }
}

impl PersistenceConfig {
  pub fn options(&self) -> PersistOptions {
    PersistOptions {
      max_age: Duration::seconds(self.max_age_secs as i64),
      max_records: self.max_records,
      buster: self.buster.clone(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
  pub enabled: bool,
  /// Tables whose changes invalidate cached queries
  pub tables: Vec<String>,
  pub reconnect: ReconnectConfig,
}

impl Default for RealtimeConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      tables: [
        "properties",
        "bookings",
        "guests",
        "invoices",
        "expenses",
        "vendors",
        "documents",
        "media",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      reconnect: ReconnectConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
  pub enabled: bool,
  /// Minimum confidence a prediction needs before it is fetched
  pub threshold: f32,
  /// Maximum background loads outstanding at once
  pub max_pending: usize,
}

impl Default for PrefetchConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      threshold: 0.85,
      max_pending: 4,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./propsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/propsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/propsync/config.yaml\n\
                 See propsync.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("propsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("propsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if !(0.0..=1.0).contains(&self.prefetch.threshold) {
      return Err(eyre!(
        "prefetch.threshold must be between 0 and 1, got {}",
        self.prefetch.threshold
      ));
    }
    if self.cache.gc_interval_secs == 0 || self.persistence.sweep_interval_secs == 0 {
      return Err(eyre!("gc and sweep intervals must be greater than zero"));
    }
    Ok(())
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks PROPSYNC_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("PROPSYNC_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("Backend API key not found. Set PROPSYNC_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }
}
