use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::errors::{CoordinatorError, Result};

/// Coordinator configuration with all tuning parameters
///
/// Durations are (de)serialized as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    // Prepare phase
    /// Upper bound on the Prepare fan-in wait
    #[serde(with = "millis", rename = "prepare_timeout_ms")]
    pub prepare_timeout: Duration,

    // Retry configuration
    /// Attempts per participant per phase (first call included)
    pub max_retries: u32,
    /// Delay before the second attempt; doubles for each one after
    #[serde(with = "millis", rename = "base_backoff_ms")]
    pub base_backoff: Duration,
    /// Cap on a single backoff delay
    #[serde(with = "millis", rename = "max_backoff_ms")]
    pub max_backoff: Duration,
    /// Perturb each delay by up to +/-10%
    pub backoff_jitter: bool,

    // Lifecycle
    /// How long terminal records stay queryable; `None` keeps them until forgotten
    #[serde(with = "opt_millis", rename = "retention_ms")]
    pub retention: Option<Duration>,
    /// Buffered events per subscriber before the oldest are dropped
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_secs(5),
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_jitter: false,
            retention: Some(Duration::from_secs(300)),
            event_capacity: 1024,
        }
    }
}

impl CoordinatorConfig {
    /// Create a new builder for CoordinatorConfig
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(CoordinatorError::configuration(
                "max_retries must be greater than 0",
            ));
        }
        if self.prepare_timeout.is_zero() {
            return Err(CoordinatorError::configuration(
                "prepare_timeout must be greater than 0",
            ));
        }
        if self.base_backoff > self.max_backoff {
            return Err(CoordinatorError::configuration(
                "base_backoff cannot exceed max_backoff",
            ));
        }
        if self.event_capacity == 0 {
            return Err(CoordinatorError::configuration(
                "event_capacity must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Short timeouts and fast retries for local runs and tests
    pub fn development() -> Self {
        Self {
            prepare_timeout: Duration::from_millis(500),
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(100),
            retention: Some(Duration::from_secs(30)),
            ..Default::default()
        }
    }

    /// Parse a YAML document; omitted fields take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| CoordinatorError::configuration(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            CoordinatorError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }
}

/// Builder for CoordinatorConfig
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
        }
    }

    pub fn prepare_timeout(mut self, timeout: Duration) -> Self {
        self.config.prepare_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, attempts: u32) -> Self {
        self.config.max_retries = attempts;
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.base_backoff = base;
        self.config.max_backoff = max;
        self
    }

    pub fn backoff_jitter(mut self, enabled: bool) -> Self {
        self.config.backoff_jitter = enabled;
        self
    }

    pub fn retention(mut self, retention: Option<Duration>) -> Self {
        self.config.retention = retention;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<CoordinatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for CoordinatorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
