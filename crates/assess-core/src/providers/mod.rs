pub mod process;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::models::{CoreError, ProviderName, ProviderResult, QueueClass, RunId, SubjectRef};
use crate::orchestration::CancellationToken;

pub use process::{ProcessProvider, exit_code_error};

pub type AdapterResult<T> = Result<T, CoreError>;

pub type InvokeFuture<'a> = Pin<Box<dyn Future<Output = AdapterResult<ProviderResult>> + Send + 'a>>;

/// Key handed to adapters so the external system can reject duplicate side effects.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(run: RunId, provider: &ProviderName, attempt: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(run.0.to_be_bytes());
        hasher.update(provider.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(attempt.to_be_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug)]
pub struct InvocationContext {
    pub run: RunId,
    pub provider: ProviderName,
    pub attempt: u32,
    pub idempotency_key: IdempotencyKey,
    pub deadline: Duration,
    pub cancellation: CancellationToken,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProviderInput {
    pub subject: SubjectRef,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProviderDescriptor {
    pub name: ProviderName,
    pub queue_class: QueueClass,
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<ProviderName>, queue_class: QueueClass) -> Self {
        Self {
            name: name.into(),
            queue_class,
        }
    }
}

/// One external assessment capability.
///
/// Implementations return structured [`CoreError`]s so the retry policy can tell
/// transient failures from permanent ones, and must honour the idempotency key in the
/// context when talking to the external system. A failed attempt that knows what it
/// consumed attaches it with [`CoreError::with_cost`]; its peak memory counts toward the
/// lane's recycling ceiling just like a successful one.
pub trait ProviderAdapter: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    fn name(&self) -> &ProviderName {
        &self.descriptor().name
    }

    fn invoke<'a>(&'a self, context: InvocationContext, input: ProviderInput) -> InvokeFuture<'a>;
}

#[cfg(test)]
mod tests {
    use super::IdempotencyKey;
    use crate::models::{ProviderName, RunId};

    #[test]
    fn idempotency_key_is_stable_per_attempt() {
        let provider = ProviderName::new("seo_metrics");
        let first = IdempotencyKey::derive(RunId(42), &provider, 1);

        assert_eq!(first, IdempotencyKey::derive(RunId(42), &provider, 1));
        assert_ne!(first, IdempotencyKey::derive(RunId(42), &provider, 2));
        assert_ne!(first, IdempotencyKey::derive(RunId(43), &provider, 1));
        assert_eq!(first.as_str().len(), 64);
        assert!(
            first
                .as_str()
                .bytes()
                .all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f'))
        );
    }
}
