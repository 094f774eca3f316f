use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::models::{CoreError, CoreErrorKind, ProviderName, QueueClass};
use crate::providers::ProviderAdapter;
use crate::retry::RetryPolicy;

pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Scheduling and retry settings for one provider.
#[derive(Clone, Debug)]
pub struct ProviderProfile {
    pub queue_class: QueueClass,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl ProviderProfile {
    pub fn new(queue_class: QueueClass) -> Self {
        Self {
            queue_class,
            timeout: DEFAULT_PROVIDER_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Clone)]
pub struct RegisteredProvider {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub profile: ProviderProfile,
}

impl RegisteredProvider {
    /// Uses the adapter's own queue class with default timeout and retry.
    pub fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        let profile = ProviderProfile::new(adapter.descriptor().queue_class);
        Self { adapter, profile }
    }

    pub fn with_profile(mut self, profile: ProviderProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn name(&self) -> &ProviderName {
        self.adapter.name()
    }
}

/// Immutable set of providers a run may fan out to.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Arc<BTreeMap<ProviderName, RegisteredProvider>>,
}

impl ProviderRegistry {
    pub fn new(
        providers: impl IntoIterator<Item = RegisteredProvider>,
    ) -> Result<Self, CoreError> {
        let mut mapped = BTreeMap::new();
        for provider in providers {
            let name = provider.name().clone();
            if provider.profile.timeout.is_zero() {
                return Err(CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("provider '{name}' must have a non-zero timeout"),
                )
                .for_provider(&name));
            }
            if provider.profile.retry.max_attempts == 0 {
                return Err(CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("provider '{name}' must allow at least one attempt"),
                )
                .for_provider(&name));
            }
            if mapped.insert(name.clone(), provider).is_some() {
                return Err(CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("duplicate provider registration for '{name}'"),
                )
                .for_provider(&name));
            }
        }

        Ok(Self {
            providers: Arc::new(mapped),
        })
    }

    pub fn from_adapters(
        adapters: impl IntoIterator<Item = Arc<dyn ProviderAdapter>>,
    ) -> Result<Self, CoreError> {
        Self::new(adapters.into_iter().map(RegisteredProvider::new))
    }

    pub fn get(&self, name: &ProviderName) -> Option<&RegisteredProvider> {
        self.providers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &ProviderName> {
        self.providers.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredProvider> {
        self.providers.values()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Resolves a requested provider set, rejecting unknown and repeated names.
    pub fn resolve(&self, names: &[ProviderName]) -> Result<Vec<RegisteredProvider>, CoreError> {
        if names.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "at least one provider must be requested",
            ));
        }

        let mut seen = BTreeSet::new();
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            if !seen.insert(name) {
                return Err(CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("provider '{name}' requested more than once"),
                )
                .for_provider(name));
            }
            let provider = self.providers.get(name).cloned().ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("no provider is registered as '{name}'"),
                )
                .for_provider(name)
            })?;
            resolved.push(provider);
        }
        Ok(resolved)
    }

    pub fn resolve_all(&self) -> Result<Vec<RegisteredProvider>, CoreError> {
        let names: Vec<ProviderName> = self.providers.keys().cloned().collect();
        self.resolve(&names)
    }
}
