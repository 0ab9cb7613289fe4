use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use slotstream_pg::{
    ConsumerOptions, DecodePolicy, FeedbackPolicy, InactiveWait, ServerVersion, SessionConfig,
    SlotPolicy, WaitStrategy,
};

/// Project configuration from slotstream.toml
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub postgres: PostgresConfig,
    pub slot: SlotConfig,
    pub stream: StreamConfig,
    pub publication: Option<PublicationConfig>,
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub connection_string: String,
    pub application_name: String,
    /// Version assumed when the streaming session does not report one.
    pub assume_min_server_version: Option<String>,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            connection_string: "${DATABASE_URL}".to_string(),
            application_name: "slotstream".to_string(),
            assume_min_server_version: Some("9.4".to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SlotConfig {
    pub name: String,
    pub plugin: String,
    pub policy: SlotPolicy,
    pub inactive_poll_ms: u64,
    pub inactive_timeout_ms: u64,
}

impl Default for SlotConfig {
    fn default() -> Self {
        let wait = InactiveWait::default();
        Self {
            name: "slot".to_string(),
            plugin: "wal2json".to_string(),
            policy: SlotPolicy::default(),
            inactive_poll_ms: wait.poll_interval.as_millis() as u64,
            inactive_timeout_ms: wait.timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    #[default]
    Readiness,
    Poll,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub status_interval_secs: u64,
    pub wait: WaitMode,
    pub poll_interval_ms: u64,
    pub feedback: FeedbackPolicy,
    pub decode: DecodePolicy,
    /// Passed through to the output plugin untouched.
    pub plugin_options: BTreeMap<String, String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: 10,
            wait: WaitMode::default(),
            poll_interval_ms: WaitStrategy::DEFAULT_POLL_INTERVAL.as_millis() as u64,
            feedback: FeedbackPolicy::default(),
            decode: DecodePolicy::default(),
            plugin_options: BTreeMap::from([("include-xids".to_string(), "true".to_string())]),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PublicationConfig {
    pub name: String,
    /// Drop and recreate the publication before streaming.
    #[serde(default)]
    pub recreate: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
}

impl ProjectConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ProjectConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.slot.name.is_empty() {
            bail!("slot.name must not be empty");
        }
        if self.slot.inactive_poll_ms == 0 {
            bail!("slot.inactive_poll_ms must be greater than zero");
        }
        if self.slot.inactive_timeout_ms == 0 {
            bail!("slot.inactive_timeout_ms must be greater than zero");
        }
        // `run --poll` can switch to poll mode after loading.
        if self.stream.poll_interval_ms == 0 {
            bail!("stream.poll_interval_ms must be greater than zero");
        }
        if self.stream.status_interval_secs == 0 {
            bail!("stream.status_interval_secs must be greater than zero");
        }
        Ok(())
    }

    /// Resolve environment variables in a string.
    /// Supports ${VAR_NAME} syntax; an unset variable is an error.
    pub fn resolve_env(s: &str) -> Result<String> {
        let mut result = String::with_capacity(s.len());
        let mut rest = s;

        while let Some(start) = rest.find("${") {
            let Some(end) = rest[start..].find('}') else {
                break;
            };
            let var_name = &rest[start + 2..start + end];
            let value = std::env::var(var_name)
                .with_context(|| format!("Environment variable {} is not set", var_name))?;

            result.push_str(&rest[..start]);
            result.push_str(&value);
            rest = &rest[start + end + 1..];
        }
        result.push_str(rest);

        Ok(result)
    }

    pub fn postgres_connection_string(&self) -> Result<String> {
        Self::resolve_env(&self.postgres.connection_string)
    }

    pub fn session_config(&self) -> Result<SessionConfig> {
        let mut session = SessionConfig::new(self.postgres_connection_string()?);
        session.application_name = self.postgres.application_name.clone();
        session.assume_min_server_version = match &self.postgres.assume_min_server_version {
            Some(version) => Some(
                ServerVersion::parse(version)
                    .with_context(|| format!("Invalid server version: {}", version))?,
            ),
            None => None,
        };
        Ok(session)
    }

    pub fn inactive_wait(&self) -> InactiveWait {
        InactiveWait {
            poll_interval: Duration::from_millis(self.slot.inactive_poll_ms),
            timeout: Duration::from_millis(self.slot.inactive_timeout_ms),
        }
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        let wait = match self.stream.wait {
            WaitMode::Readiness => WaitStrategy::Readiness,
            WaitMode::Poll => WaitStrategy::Poll {
                interval: Duration::from_millis(self.stream.poll_interval_ms),
            },
        };

        ConsumerOptions {
            status_interval: Duration::from_secs(self.stream.status_interval_secs),
            plugin_options: self
                .stream
                .plugin_options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            wait,
            feedback: self.stream.feedback,
            decode: self.stream.decode,
        }
    }
}
