//! slotgrid.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    #[serde(default)]
    pub master: ListenConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default = "default_pools")]
    pub pools: Vec<PoolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

/// Scheduler timings as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub interval: Option<String>,
    pub agent_timeout: Option<String>,
    pub start_timeout: Option<String>,
    pub teardown_timeout: Option<String>,
    pub max_attempts: Option<u32>,
    pub backoff_base: Option<String>,
    pub backoff_max: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Some("1s".to_string()),
            agent_timeout: Some("30s".to_string()),
            start_timeout: Some("60s".to_string()),
            teardown_timeout: Some("30s".to_string()),
            max_attempts: Some(3),
            backoff_base: Some("1s".to_string()),
            backoff_max: Some("60s".to_string()),
        }
    }
}

/// Scheduling policy for a resource pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPolicy {
    #[default]
    Priority,
    FairShare,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    #[serde(default)]
    pub policy: PoolPolicy,
    /// Place every unit of a task on one agent unless the task says otherwise.
    #[serde(default)]
    pub co_locate: bool,
    #[serde(default)]
    pub fair_share: Option<FairShareConfig>,
}

impl PoolConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            policy: PoolPolicy::Priority,
            co_locate: false,
            fair_share: None,
        }
    }

    /// Half-life of the decaying usage counter (fair-share pools only).
    pub fn usage_half_life(&self) -> Duration {
        self.fair_share
            .as_ref()
            .and_then(|f| f.half_life.as_deref())
            .and_then(parse_duration)
            .unwrap_or(Duration::from_secs(3600))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FairShareConfig {
    /// e.g. "1h". Usage halves every `half_life`.
    pub half_life: Option<String>,
}

/// Resolved scheduler timings.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerTimings {
    pub interval: Duration,
    pub agent_timeout: Duration,
    pub start_timeout: Duration,
    pub teardown_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for SchedulerTimings {
    fn default() -> Self {
        SchedulerConfig::default()
            .resolve()
            .unwrap_or(SchedulerTimings {
                interval: Duration::from_secs(1),
                agent_timeout: Duration::from_secs(30),
                start_timeout: Duration::from_secs(60),
                teardown_timeout: Duration::from_secs(30),
                max_attempts: 3,
                backoff_base: Duration::from_secs(1),
                backoff_max: Duration::from_secs(60),
            })
    }
}

impl SchedulerConfig {
    pub fn resolve(&self) -> Result<SchedulerTimings, ConfigError> {
        fn field(name: &str, value: &Option<String>, default: Duration) -> Result<Duration, ConfigError> {
            match value {
                Some(s) => parse_duration(s)
                    .ok_or_else(|| ConfigError::Invalid(format!("scheduler.{name}: bad duration {s:?}"))),
                None => Ok(default),
            }
        }

        let timings = SchedulerTimings {
            interval: field("interval", &self.interval, Duration::from_secs(1))?,
            agent_timeout: field("agent_timeout", &self.agent_timeout, Duration::from_secs(30))?,
            start_timeout: field("start_timeout", &self.start_timeout, Duration::from_secs(60))?,
            teardown_timeout: field("teardown_timeout", &self.teardown_timeout, Duration::from_secs(30))?,
            max_attempts: self.max_attempts.unwrap_or(3),
            backoff_base: field("backoff_base", &self.backoff_base, Duration::from_secs(1))?,
            backoff_max: field("backoff_max", &self.backoff_max, Duration::from_secs(60))?,
        };

        if timings.max_attempts == 0 {
            return Err(ConfigError::Invalid("scheduler.max_attempts: must be >= 1".to_string()));
        }
        if timings.interval.is_zero() {
            return Err(ConfigError::Invalid("scheduler.interval: must be > 0".to_string()));
        }
        Ok(timings)
    }
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> String {
    "/var/lib/slotgrid".to_string()
}

fn default_pools() -> Vec<PoolConfig> {
    vec![PoolConfig::new("default")]
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            master: ListenConfig::default(),
            scheduler: SchedulerConfig::default(),
            pools: default_pools(),
        }
    }
}

impl MasterConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: MasterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints that serde can't express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pools.is_empty() {
            return Err(ConfigError::Invalid("at least one pool is required".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for pool in &self.pools {
            if pool.name.trim().is_empty() {
                return Err(ConfigError::Invalid("pools: name must not be empty".to_string()));
            }
            if !seen.insert(pool.name.as_str()) {
                return Err(ConfigError::Invalid(format!("pools: duplicate pool {:?}", pool.name)));
            }
            if let Some(half_life) = pool.fair_share.as_ref().and_then(|f| f.half_life.as_deref()) {
                if parse_duration(half_life).is_none_or(|d| d.is_zero()) {
                    return Err(ConfigError::Invalid(format!(
                        "pools.{}.fair_share.half_life: bad duration {half_life:?}",
                        pool.name
                    )));
                }
            }
        }
        self.scheduler.resolve()?;
        Ok(())
    }

    pub fn timings(&self) -> Result<SchedulerTimings, ConfigError> {
        self.scheduler.resolve()
    }
}

/// Parse a duration string like "5s", "500ms", "1m", "2h".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_uses_defaults() {
        let config = MasterConfig::parse("").unwrap();
        assert_eq!(config.master.port, 8080);
        assert_eq!(config.pools.len(), 1);
        assert_eq!(config.pools[0].name, "default");
        let timings = config.timings().unwrap();
        assert_eq!(timings.max_attempts, 3);
        assert_eq!(timings.start_timeout, Duration::from_secs(60));
    }

    #[test]
    fn parse_pools() {
        let toml_str = r#"
[master]
port = 9090

[scheduler]
start_timeout = "10s"
backoff_base = "500ms"

[[pools]]
name = "gpu"
co_locate = true

[[pools]]
name = "research"
policy = "fair_share"
fair_share = { half_life = "30m" }
"#;
        let config = MasterConfig::parse(toml_str).unwrap();
        assert_eq!(config.master.port, 9090);
        assert_eq!(config.pools.len(), 2);
        assert!(config.pools[0].co_locate);
        assert_eq!(config.pools[1].policy, PoolPolicy::FairShare);
        assert_eq!(config.pools[1].usage_half_life(), Duration::from_secs(1800));

        let timings = config.timings().unwrap();
        assert_eq!(timings.start_timeout, Duration::from_secs(10));
        assert_eq!(timings.backoff_base, Duration::from_millis(500));
    }

    #[test]
    fn rejects_duplicate_pools() {
        let toml_str = r#"
[[pools]]
name = "a"

[[pools]]
name = "a"
"#;
        assert!(matches!(MasterConfig::parse(toml_str), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_bad_duration() {
        let toml_str = r#"
[scheduler]
start_timeout = "soon"
"#;
        let err = MasterConfig::parse(toml_str).unwrap_err();
        assert!(err.to_string().contains("start_timeout"));
    }

    #[test]
    fn rejects_zero_attempts() {
        let toml_str = r#"
[scheduler]
max_attempts = 0
"#;
        assert!(MasterConfig::parse(toml_str).is_err());
    }

    #[test]
    fn renders_back_to_toml() {
        let config = MasterConfig::default();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("default"));
        let back = MasterConfig::parse(&rendered).unwrap();
        assert_eq!(back.pools[0].name, "default");
    }

    #[test]
    fn duration_strings() {
        assert_eq!(parse_duration("2s"), Some(Duration::from_secs(2)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("fast"), None);
    }
}
