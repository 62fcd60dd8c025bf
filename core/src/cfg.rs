use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::job::AccrualSettings;
use crate::logx::LogFormat;

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"com"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"local"`.
    pub organization: &'static str,
    /// Application name, e.g. `"pointsd"`.
    pub application: &'static str,
}

/// Application configuration persisted to `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    pub log_level: String,
    /// Log line layout.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Record store directory; the per-app data dir when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Listen address of the HTTP API.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// How long user-facing mutations wait for a record lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Period of the daemon's heartbeat log line.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Accrual job tuning.
    #[serde(default)]
    pub accrual: AccrualConfig,
}

/// `[accrual]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccrualConfig {
    /// Seconds between ticks.
    pub tick_secs: u64,
    /// Ticks per job.
    pub total_ticks: u32,
    /// Smallest increment per tick.
    pub min_points: u32,
    /// Largest increment per tick.
    pub max_points: u32,
}

impl Default for AccrualConfig {
    fn default() -> Self {
        Self { tick_secs: 60, total_ticks: 30, min_points: 1, max_points: 9 }
    }
}

impl AccrualConfig {
    /// Job settings derived from this section.
    pub fn settings(&self) -> AccrualSettings {
        AccrualSettings {
            tick_interval: Duration::from_secs(self.tick_secs),
            total_ticks: self.total_ticks,
        }
    }
}

fn default_http_addr() -> String { "127.0.0.1:5000".to_string() }
fn default_lock_timeout_ms() -> u64 { 2_000 }
fn default_heartbeat_secs() -> u64 { 60 }

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            data_dir: None,
            http_addr: default_http_addr(),
            lock_timeout_ms: default_lock_timeout_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            accrual: AccrualConfig::default(),
        }
    }
}

impl Config {
    /// Reject values the accrual subsystem cannot run with.
    pub fn validate(&self) -> Result<()> {
        let a = &self.accrual;
        if a.total_ticks == 0 {
            bail!("accrual.total_ticks must be at least 1");
        }
        if a.tick_secs == 0 {
            bail!("accrual.tick_secs must be at least 1");
        }
        if a.min_points > a.max_points {
            bail!("accrual.min_points ({}) exceeds accrual.max_points ({})", a.min_points, a.max_points);
        }
        Ok(())
    }

    /// Lock wait budget for API mutations.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Record store directory, falling back to the app's data dir.
    pub fn data_dir(&self, app: &AppId) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs(app)?.data_dir().join("records")),
        }
    }
}

fn project_dirs(app: &AppId) -> Result<ProjectDirs> {
    ProjectDirs::from(app.qualifier, app.organization, app.application)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))
}

/// Return the configuration directory for this app, creating it if needed.
pub fn config_dir(app: &AppId) -> Result<PathBuf> {
    let dir = project_dirs(app)?.config_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create config dir {}", dir.display()))?;
    Ok(dir)
}

/// Load `config.toml` from the app config dir or create a default one.
pub fn load_or_init(app: &AppId) -> Result<Config> {
    let dir = config_dir(app)?;
    load_or_init_at(&dir.join("config.toml"))
}

/// Load the config at `path`, writing defaults there first if it is missing.
pub fn load_or_init_at(path: &Path) -> Result<Config> {
    let cfg = if path.exists() {
        let txt = fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        toml::from_str::<Config>(&txt)
            .with_context(|| format!("parse {}", path.display()))?
    } else {
        let cfg = Config::default();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create config dir {}", parent.display()))?;
        }
        save_config(path, &cfg)?;
        cfg
    };
    cfg.validate().with_context(|| format!("invalid {}", path.display()))?;
    Ok(cfg)
}

fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
