use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use assess_core::config::OrchestratorConfig;
use assess_core::execution::{ProcessExecutor, TokioProcessExecutor};
use assess_core::models::{CoreErrorKind, ProviderName, QueueClass};
use assess_core::providers::{
    InvocationContext, InvokeFuture, ProviderAdapter, ProviderDescriptor, ProviderInput,
};
use assess_core::registry::{ProviderProfile, ProviderRegistry, RegisteredProvider};

struct NoopProvider {
    descriptor: ProviderDescriptor,
}

impl NoopProvider {
    fn new(name: &str, queue_class: QueueClass) -> Arc<dyn ProviderAdapter> {
        Arc::new(Self {
            descriptor: ProviderDescriptor::new(name, queue_class),
        })
    }
}

impl ProviderAdapter for NoopProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn invoke<'a>(&'a self, _context: InvocationContext, _input: ProviderInput) -> InvokeFuture<'a> {
        Box::pin(async {
            Err(assess_core::models::CoreError::new(
                CoreErrorKind::Internal,
                "not invoked in registry tests",
            ))
        })
    }
}

fn names(list: &[&str]) -> Vec<ProviderName> {
    list.iter().copied().map(ProviderName::new).collect()
}

fn executor() -> Arc<dyn ProcessExecutor> {
    Arc::new(TokioProcessExecutor)
}

#[test]
fn registry_rejects_duplicate_names() {
    let error = ProviderRegistry::from_adapters([
        NoopProvider::new("seo_metrics", QueueClass::Assessment),
        NoopProvider::new("seo_metrics", QueueClass::Llm),
    ])
    .err()
    .unwrap();

    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
    assert_eq!(error.provider, Some(ProviderName::new("seo_metrics")));
}

#[test]
fn registry_rejects_unusable_profiles() {
    let zero_timeout = RegisteredProvider::new(NoopProvider::new("a", QueueClass::Assessment))
        .with_profile(ProviderProfile::new(QueueClass::Assessment).with_timeout(Duration::ZERO));
    assert!(ProviderRegistry::new([zero_timeout]).is_err());

    let no_attempts = RegisteredProvider::new(NoopProvider::new("b", QueueClass::Assessment));
    let profile = ProviderProfile::new(QueueClass::Assessment);
    let retry = profile.retry.clone().with_max_attempts(0);
    let no_attempts = no_attempts.with_profile(profile.with_retry(retry));
    assert!(ProviderRegistry::new([no_attempts]).is_err());
}

#[test]
fn registry_resolves_requested_sets_in_order() {
    let registry = ProviderRegistry::from_adapters([
        NoopProvider::new("accessibility", QueueClass::Assessment),
        NoopProvider::new("llm_summary", QueueClass::Llm),
        NoopProvider::new("performance", QueueClass::Assessment),
    ])
    .unwrap();

    assert_eq!(registry.len(), 3);
    let resolved = registry
        .resolve(&names(&["performance", "accessibility"]))
        .unwrap();
    let resolved: Vec<&str> = resolved.iter().map(|provider| provider.name().as_str()).collect();
    assert_eq!(resolved, vec!["performance", "accessibility"]);

    assert_eq!(registry.resolve_all().unwrap().len(), 3);
    assert_eq!(
        registry
            .get(&ProviderName::new("llm_summary"))
            .map(|provider| provider.profile.queue_class),
        Some(QueueClass::Llm)
    );
}

#[test]
fn registry_rejects_empty_unknown_and_repeated_requests() {
    let registry =
        ProviderRegistry::from_adapters([NoopProvider::new("a", QueueClass::Assessment)]).unwrap();

    for request in [names(&[]), names(&["missing"]), names(&["a", "a"])] {
        let error = registry.resolve(&request).err().unwrap();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput, "{request:?}");
    }
}

#[test]
fn config_file_builds_process_and_supplied_providers() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "retry": {{ "max_attempts": 4, "base_delay_ms": 10 }},
            "default_timeout_ms": 5000,
            "providers": {{
                "screenshot": {{
                    "queue_class": "high_priority",
                    "timeout_ms": 1500,
                    "cost_micros": 300,
                    "command": {{ "program": "/bin/echo", "args": ["{{}}"] }}
                }},
                "llm_summary": {{ "queue_class": "llm", "max_attempts": 2 }}
            }}
        }}"#
    )
    .unwrap();

    let config = OrchestratorConfig::load(file.path()).unwrap();
    let registry = config
        .build_registry(
            executor(),
            [
                NoopProvider::new("llm_summary", QueueClass::Assessment),
                NoopProvider::new("accessibility", QueueClass::Assessment),
            ],
        )
        .unwrap();

    assert_eq!(registry.len(), 3);

    let screenshot = registry.get(&ProviderName::new("screenshot")).unwrap();
    assert_eq!(screenshot.profile.queue_class, QueueClass::HighPriority);
    assert_eq!(screenshot.profile.timeout, Duration::from_millis(1500));
    assert_eq!(screenshot.profile.retry.max_attempts, 4);

    let summary = registry.get(&ProviderName::new("llm_summary")).unwrap();
    assert_eq!(summary.profile.queue_class, QueueClass::Llm);
    assert_eq!(summary.profile.retry.max_attempts, 2);
    assert_eq!(summary.profile.timeout, Duration::from_secs(5));

    let accessibility = registry.get(&ProviderName::new("accessibility")).unwrap();
    assert_eq!(accessibility.profile.queue_class, QueueClass::Assessment);
    assert_eq!(accessibility.profile.retry.base_delay, Duration::from_millis(10));
}

#[test]
fn configured_provider_without_command_or_adapter_is_rejected() {
    let config =
        OrchestratorConfig::from_json_str(r#"{ "providers": { "orphan": { "queue_class": "llm" } } }"#)
            .unwrap();
    let error = config
        .build_registry(executor(), std::iter::empty())
        .err()
        .unwrap();
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
    assert!(error.message.contains("orphan"));
}

#[test]
fn missing_or_malformed_config_is_invalid_input() {
    let dir = tempfile::tempdir().unwrap();
    let missing = OrchestratorConfig::load(dir.path().join("absent.json")).unwrap_err();
    assert_eq!(missing.kind, CoreErrorKind::InvalidInput);

    let unknown_field = OrchestratorConfig::from_json_str(r#"{ "workers": 4 }"#).unwrap_err();
    assert_eq!(unknown_field.kind, CoreErrorKind::InvalidInput);
}
