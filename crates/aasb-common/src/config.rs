//! ---
//! aasb_section: "01-core-functionality"
//! aasb_subsection: "module"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Shared configuration and tracing setup."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use aasb_msg::{BrokerConfig, TransportConfig, TransportKind};
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::LogFormat;

const MIN_FRAME_BYTES: usize = 1024;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9899))
}

fn default_responder_payload() -> String {
    "{}".to_owned()
}

/// Top-level configuration for the AASB tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    /// Canned replies served by `aasbctl serve`.
    #[serde(default)]
    pub responders: Vec<ResponderConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "AASB_CONFIG";

    /// Load configuration from disk, respecting the `AASB_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                return Ok(LoadedAppConfig {
                    config: Self::from_path(path)?,
                    source: path.to_path_buf(),
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Read and validate one file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.broker.default_reply_timeout.is_zero() {
            bail!("broker.default_reply_timeout_ms must be greater than zero");
        }
        if self.transport.kind == TransportKind::UnixSocket
            && self.transport.socket_path.as_os_str().is_empty()
        {
            bail!("transport.socket_path is required for the unix_socket transport");
        }
        if self.transport.max_frame_bytes < MIN_FRAME_BYTES {
            bail!(
                "transport.max_frame_bytes must be at least {MIN_FRAME_BYTES}, got {}",
                self.transport.max_frame_bytes
            );
        }
        if self.journal.enabled && self.journal.path.is_none() {
            bail!("journal.path is required when the journal is enabled");
        }
        for (index, responder) in self.responders.iter().enumerate() {
            responder
                .validate()
                .with_context(|| format!("responders[{index}] is invalid"))?;
        }
        Ok(())
    }

    /// Responder configured for (topic, action), if any.
    pub fn responder(&self, topic: &str, action: &str) -> Option<&ResponderConfig> {
        self.responders
            .iter()
            .find(|responder| responder.topic == topic && responder.action == action)
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

/// Message journal settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Canned reply for one (topic, action) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponderConfig {
    pub topic: String,
    pub action: String,
    #[serde(default = "default_responder_payload")]
    pub payload: String,
}

impl ResponderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() || self.action.trim().is_empty() {
            bail!("responder topic and action must not be empty");
        }
        serde_json::from_str::<serde_json::Value>(&self.payload).with_context(|| {
            format!(
                "responder payload for {}/{} is not valid JSON",
                self.topic, self.action
            )
        })?;
        Ok(())
    }
}
