use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::bucket::BucketConfig;
use crate::event::CpuModel;
use crate::offline::OfflineMode;

/// Top-level configuration for the cemond daemon.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// CPU model the decoded events come from; selects model-specific
    /// filtering. Default: "generic".
    #[serde(default = "default_cpu_model")]
    pub cpu_model: String,

    /// Unix socket accepting decoded event lines and control commands.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Per-page accounting configuration.
    #[serde(default)]
    pub page: PageConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Per-page CE accounting configuration (the `page` section).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PageConfig {
    /// Per-page error threshold.
    #[serde(default)]
    pub memory_ce: ThresholdConfig,

    /// Threshold on the rate of counter replacements; crossing it means the
    /// table is undersized.
    #[serde(default)]
    pub memory_ce_counter_replacement: ThresholdConfig,

    /// Offlining mode: off / account / soft / hard / soft-then-hard.
    #[serde(default = "default_action")]
    pub memory_ce_action: String,

    /// Command run synchronously before a soft offline.
    #[serde(default)]
    pub memory_pre_sync_soft_ce_trigger: Option<PathBuf>,

    /// Command run synchronously after a soft offline.
    #[serde(default)]
    pub memory_post_sync_soft_ce_trigger: Option<PathBuf>,

    /// Upper bound on tracked page counters; rounded up at setup to a
    /// multiple of the cluster slot count. Default: 8192.
    #[serde(default = "default_max_corr_err_counters")]
    pub max_corr_err_counters: usize,

    /// Neighbour pages offlined on each side of a misbehaving page.
    /// Default: 0 (target page only).
    #[serde(default)]
    pub row_offline_pages: u32,

    /// Upper bound on how long a synchronous pre/post-soft trigger may run
    /// before it is killed. Absent means no limit.
    #[serde(default, with = "humantime_serde::option")]
    pub sync_trigger_timeout: Option<Duration>,
}

/// One bucket threshold: `"<count> / <window>"` plus an optional trigger
/// command and a log flag.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ThresholdConfig {
    /// Rate specification, e.g. "10 / 24h". Absent means disabled.
    #[serde(default)]
    pub threshold: Option<String>,

    /// User command run when the threshold is crossed.
    #[serde(default)]
    pub trigger: Option<PathBuf>,

    /// Also emit the threshold message through the log.
    #[serde(default)]
    pub log: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HealthConfig {
    /// Listen address. Default: ":9803". Empty disables the server.
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Threshold string parse failure.
#[derive(Debug, thiserror::Error)]
pub enum ThresholdParseError {
    #[error("expected `<count> / <window>`, got `{0}`")]
    Format(String),
    #[error("invalid count in `{0}`")]
    Count(String),
    #[error("invalid window in `{0}`: {1}")]
    Window(String, humantime::DurationError),
    #[error("window must be non-zero when count > 0 in `{0}`")]
    ZeroWindow(String),
}

impl ThresholdConfig {
    /// Resolve the serialized form into bucket parameters.
    pub fn resolve(&self) -> Result<BucketConfig, ThresholdParseError> {
        let (capacity, agetime) = match &self.threshold {
            None => (0, Duration::ZERO),
            Some(spec) => parse_threshold(spec)?,
        };
        Ok(BucketConfig {
            capacity,
            agetime,
            log: self.log,
            trigger: self.trigger.clone(),
        })
    }
}

/// Parse `"<count> / <window>"` (e.g. "10 / 24h") into capacity and window.
fn parse_threshold(spec: &str) -> Result<(u32, Duration), ThresholdParseError> {
    let (count, window) = spec
        .split_once('/')
        .ok_or_else(|| ThresholdParseError::Format(spec.to_string()))?;
    let capacity: u32 = count
        .trim()
        .parse()
        .map_err(|_| ThresholdParseError::Count(spec.to_string()))?;
    let agetime = humantime::parse_duration(window.trim())
        .map_err(|e| ThresholdParseError::Window(spec.to_string(), e))?;
    if capacity > 0 && agetime.is_zero() {
        return Err(ThresholdParseError::ZeroWindow(spec.to_string()));
    }
    Ok((capacity, agetime))
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cpu_model() -> String {
    CpuModel::Generic.as_str().to_string()
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/cemond/cemond.sock")
}

fn default_action() -> String {
    OfflineMode::Off.as_str().to_string()
}

fn default_max_corr_err_counters() -> usize {
    8 * 1024
}

fn default_health_addr() -> String {
    ":9803".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            cpu_model: default_cpu_model(),
            socket_path: default_socket_path(),
            page: PageConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            memory_ce: ThresholdConfig::default(),
            memory_ce_counter_replacement: ThresholdConfig::default(),
            memory_ce_action: default_action(),
            memory_pre_sync_soft_ce_trigger: None,
            memory_post_sync_soft_ce_trigger: None,
            max_corr_err_counters: default_max_corr_err_counters(),
            row_offline_pages: 0,
            sync_trigger_timeout: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.resolved_cpu_model().is_none() {
            bail!("unknown cpu-model: {}", self.cpu_model);
        }

        if self.page.resolved_action().is_none() {
            bail!("unknown memory-ce-action: {}", self.page.memory_ce_action);
        }

        if self.page.max_corr_err_counters == 0 {
            bail!("max-corr-err-counters must be positive");
        }

        self.page
            .memory_ce
            .resolve()
            .context("invalid page.memory-ce threshold")?;
        self.page
            .memory_ce_counter_replacement
            .resolve()
            .context("invalid page.memory-ce-counter-replacement threshold")?;

        Ok(())
    }

    /// The CPU model, if the configured name is known.
    pub fn resolved_cpu_model(&self) -> Option<CpuModel> {
        CpuModel::from_str(&self.cpu_model)
    }
}

impl PageConfig {
    /// The offline mode, if the configured name is known.
    pub fn resolved_action(&self) -> Option<OfflineMode> {
        OfflineMode::from_str(&self.memory_ce_action)
    }
}
