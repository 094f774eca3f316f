use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{CostInfo, ProviderName, RunId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreErrorKind {
    InvalidInput,
    MalformedInput,
    AuthFailure,
    RateLimited,
    Network,
    Upstream,
    Timeout,
    Cancelled,
    ProcessFailure,
    StorageFailure,
    Backpressure,
    DuplicateSubmission,
    UnknownRun,
    ShuttingDown,
    Internal,
}

impl CoreErrorKind {
    pub const ALL: [CoreErrorKind; 15] = [
        CoreErrorKind::InvalidInput,
        CoreErrorKind::MalformedInput,
        CoreErrorKind::AuthFailure,
        CoreErrorKind::RateLimited,
        CoreErrorKind::Network,
        CoreErrorKind::Upstream,
        CoreErrorKind::Timeout,
        CoreErrorKind::Cancelled,
        CoreErrorKind::ProcessFailure,
        CoreErrorKind::StorageFailure,
        CoreErrorKind::Backpressure,
        CoreErrorKind::DuplicateSubmission,
        CoreErrorKind::UnknownRun,
        CoreErrorKind::ShuttingDown,
        CoreErrorKind::Internal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::MalformedInput => "malformed_input",
            Self::AuthFailure => "auth_failure",
            Self::RateLimited => "rate_limited",
            Self::Network => "network",
            Self::Upstream => "upstream",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ProcessFailure => "process_failure",
            Self::StorageFailure => "storage_failure",
            Self::Backpressure => "backpressure",
            Self::DuplicateSubmission => "duplicate_submission",
            Self::UnknownRun => "unknown_run",
            Self::ShuttingDown => "shutting_down",
            Self::Internal => "internal",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub run: Option<RunId>,
    pub provider: Option<ProviderName>,
    pub kind: CoreErrorKind,
    pub message: String,
    /// What a failed provider attempt consumed before it gave up, when the adapter knows.
    pub cost: Option<CostInfo>,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            run: None,
            provider: None,
            kind,
            message: message.into(),
            cost: None,
        }
    }

    /// Fills in run attribution without overwriting a more specific one.
    pub fn for_run(mut self, run: RunId) -> Self {
        self.run = self.run.or(Some(run));
        self
    }

    pub fn for_provider(mut self, provider: &ProviderName) -> Self {
        if self.provider.is_none() {
            self.provider = Some(provider.clone());
        }
        self
    }

    pub fn with_cost(mut self, cost: CostInfo) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn peak_memory_bytes(&self) -> Option<u64> {
        self.cost.and_then(|cost| cost.peak_memory_bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{CoreError, CoreErrorKind};
    use crate::models::{CostInfo, ProviderName, RunId};

    #[test]
    fn kind_names_round_trip_through_parse() {
        for kind in CoreErrorKind::ALL {
            assert_eq!(CoreErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CoreErrorKind::parse("bogus"), None);
    }

    #[test]
    fn attribution_keeps_existing_values() {
        let error = CoreError::new(CoreErrorKind::Upstream, "502 from upstream")
            .for_run(RunId(7))
            .for_run(RunId(9))
            .for_provider(&ProviderName::new("pagespeed"));

        assert_eq!(error.run, Some(RunId(7)));
        assert_eq!(error.provider.as_ref().map(ProviderName::as_str), Some("pagespeed"));
        assert_eq!(error.to_string(), "Upstream: 502 from upstream");
    }

    #[test]
    fn failure_cost_survives_attribution() {
        let error = CoreError::new(CoreErrorKind::MalformedInput, "renderer crashed")
            .with_cost(CostInfo {
                cost_micros: 12,
                latency: Duration::from_millis(800),
                peak_memory_bytes: Some(3 << 30),
            })
            .for_run(RunId(3));

        assert_eq!(error.peak_memory_bytes(), Some(3 << 30));
        assert_eq!(CoreError::new(CoreErrorKind::Network, "reset").peak_memory_bytes(), None);
    }
}
