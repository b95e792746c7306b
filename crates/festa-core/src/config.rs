use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Default cadence of the effects reconciliation sweep.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Top-level config (festa.toml + FESTA_* env overrides).
///
/// Env keys use `__` between sections so field names keep their underscores,
/// e.g. `FESTA_DATABASE__PATH`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FestaConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl DatabaseConfig {
    /// Create the directory the database file lives in, if it is missing.
    pub fn ensure_parent_dir(&self) -> crate::error::Result<()> {
        if let Some(parent) = std::path::Path::new(&self.path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Timer engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between reconciliation sweeps of the effects scheduler.
    /// `0` disables the sweep.
    /// Override with env var: FESTA_SCHEDULER__SWEEP_INTERVAL_SECS=30
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Start the schedulers on boot when the game timeline says a game is running.
    #[serde(default = "bool_true")]
    pub autostart: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            autostart: true,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.festa/festa.db", home)
}

impl FestaConfig {
    /// Load config from a TOML file with FESTA_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.festa/festa.toml
    ///
    /// A missing file is not an error; defaults and env vars still apply.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: FestaConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("FESTA_").split("__"))
            .extract()
            .map_err(|e| crate::error::FestaError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.festa/festa.toml", home)
}
