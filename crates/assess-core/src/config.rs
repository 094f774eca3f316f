use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::execution::{CommandSpec, ProcessExecutor};
use crate::models::{CoreError, CoreErrorKind, ProviderName, QueueClass};
use crate::orchestration::{LaneConfig, RunCoordinatorConfig, WorkerPoolConfig};
use crate::persistence::PersistRetry;
use crate::providers::{ProcessProvider, ProviderAdapter};
use crate::registry::{ProviderProfile, ProviderRegistry, RegisteredProvider};
use crate::retry::RetryPolicy;

pub type ConfigResult<T> = Result<T, CoreError>;

/// Orchestrator settings as read from JSON. Every field has a default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub pool: PoolSettings,
    pub retry: RetrySettings,
    pub dedup_window_ms: u64,
    pub persist_retry: PersistRetrySettings,
    pub aggregation_retry: PersistRetrySettings,
    pub default_timeout_ms: u64,
    pub providers: BTreeMap<String, ProviderSettings>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            retry: RetrySettings::default(),
            dedup_window_ms: 60_000,
            persist_retry: PersistRetrySettings::default(),
            aggregation_retry: PersistRetrySettings::default(),
            default_timeout_ms: 30_000,
            providers: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    pub high_priority: LaneSettings,
    pub assessment: LaneSettings,
    pub llm: LaneSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let defaults = WorkerPoolConfig::default();
        Self {
            high_priority: defaults.high_priority.into(),
            assessment: defaults.assessment.into(),
            llm: defaults.llm.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaneSettings {
    pub concurrency: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub memory_ceiling_bytes: Option<u64>,
}

impl From<LaneConfig> for LaneSettings {
    fn from(lane: LaneConfig) -> Self {
        Self {
            concurrency: lane.concurrency,
            queue_capacity: lane.queue_capacity,
            memory_ceiling_bytes: lane.memory_ceiling_bytes,
        }
    }
}

impl From<LaneSettings> for LaneConfig {
    fn from(lane: LaneSettings) -> Self {
        Self {
            concurrency: lane.concurrency,
            queue_capacity: lane.queue_capacity,
            memory_ceiling_bytes: lane.memory_ceiling_bytes,
        }
    }
}

fn default_queue_capacity() -> usize {
    64
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_fraction: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: duration_millis(policy.base_delay),
            backoff_multiplier: policy.backoff_multiplier,
            jitter_fraction: policy.jitter_fraction,
            max_delay_ms: duration_millis(policy.max_delay),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PersistRetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for PersistRetrySettings {
    fn default() -> Self {
        let retry = PersistRetry::default();
        Self {
            max_attempts: retry.max_attempts,
            base_delay_ms: duration_millis(retry.base_delay),
        }
    }
}

impl From<PersistRetrySettings> for PersistRetry {
    fn from(settings: PersistRetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.base_delay_ms),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderSettings {
    pub queue_class: QueueClass,
    pub timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub cost_micros: u64,
    pub command: Option<CommandSpec>,
}

impl OrchestratorConfig {
    pub fn from_json_str(raw: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|error| invalid(format!("invalid orchestrator config: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|error| {
            invalid(format!("failed to read config '{}': {error}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        for class in QueueClass::ALL {
            if self.lane(class).concurrency == 0 {
                return Err(invalid(format!(
                    "pool.{}.concurrency must be at least 1",
                    class.as_str()
                )));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.backoff_multiplier.is_nan() || self.retry.backoff_multiplier < 1.0 {
            return Err(invalid("retry.backoff_multiplier must be at least 1.0"));
        }
        if !(0.0..1.0).contains(&self.retry.jitter_fraction) {
            return Err(invalid("retry.jitter_fraction must be in [0, 1)"));
        }
        if self.default_timeout_ms == 0 {
            return Err(invalid("default_timeout_ms must be greater than zero"));
        }
        if self.persist_retry.max_attempts == 0 || self.aggregation_retry.max_attempts == 0 {
            return Err(invalid("store retry max_attempts must be at least 1"));
        }

        for (name, provider) in &self.providers {
            if name.trim().is_empty() {
                return Err(invalid("provider names must not be empty"));
            }
            if provider.max_attempts == Some(0) {
                return Err(invalid(format!(
                    "providers.{name}.max_attempts must be at least 1"
                )));
            }
            if provider.timeout_ms == Some(0) {
                return Err(invalid(format!(
                    "providers.{name}.timeout_ms must be greater than zero"
                )));
            }
        }

        Ok(())
    }

    pub fn lane(&self, class: QueueClass) -> &LaneSettings {
        match class {
            QueueClass::HighPriority => &self.pool.high_priority,
            QueueClass::Assessment => &self.pool.assessment,
            QueueClass::Llm => &self.pool.llm,
        }
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        let mut config = WorkerPoolConfig::default();
        for class in QueueClass::ALL {
            *config.lane_mut(class) = (*self.lane(class)).into();
        }
        config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
            jitter_fraction: self.retry.jitter_fraction,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn coordinator_config(&self) -> RunCoordinatorConfig {
        RunCoordinatorConfig {
            dedup_window: Duration::from_millis(self.dedup_window_ms),
            persist_retry: self.persist_retry.into(),
            aggregation_retry: self.aggregation_retry.into(),
        }
    }

    /// Profile for `name`, falling back to the global retry and timeout settings.
    pub fn profile_for(&self, name: &str, fallback_class: QueueClass) -> ProviderProfile {
        let settings = self.providers.get(name);
        let queue_class = settings.map_or(fallback_class, |provider| provider.queue_class);
        let timeout_ms = settings
            .and_then(|provider| provider.timeout_ms)
            .unwrap_or(self.default_timeout_ms);
        let mut retry = self.retry_policy();
        if let Some(max_attempts) = settings.and_then(|provider| provider.max_attempts) {
            retry = retry.with_max_attempts(max_attempts);
        }

        ProviderProfile::new(queue_class)
            .with_timeout(Duration::from_millis(timeout_ms))
            .with_retry(retry)
    }

    /// Wires the registry: configured commands become process providers, and
    /// `adapters` get their profile from the matching config entry when there is one.
    pub fn build_registry(
        &self,
        executor: Arc<dyn ProcessExecutor>,
        adapters: impl IntoIterator<Item = Arc<dyn ProviderAdapter>>,
    ) -> ConfigResult<ProviderRegistry> {
        let mut providers = Vec::new();
        let mut supplied = Vec::new();

        for adapter in adapters {
            let descriptor = adapter.descriptor();
            let profile = self.profile_for(descriptor.name.as_str(), descriptor.queue_class);
            supplied.push(descriptor.name.clone());
            providers.push(RegisteredProvider::new(adapter).with_profile(profile));
        }

        for (name, settings) in &self.providers {
            if supplied.contains(&ProviderName::new(name.as_str())) {
                continue;
            }
            let Some(command) = settings.command.clone() else {
                return Err(invalid(format!(
                    "provider '{name}' has no command and no adapter was supplied for it"
                )));
            };

            let adapter: Arc<dyn ProviderAdapter> = Arc::new(
                ProcessProvider::new(name, settings.queue_class, command, Arc::clone(&executor))
                    .with_cost_per_call(settings.cost_micros),
            );
            let profile = self.profile_for(name, settings.queue_class);
            providers.push(RegisteredProvider::new(adapter).with_profile(profile));
        }

        ProviderRegistry::new(providers)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn invalid(message: impl Into<String>) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidInput, message)
}
