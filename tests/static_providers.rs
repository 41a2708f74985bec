use std::sync::Arc;

use mmg_service_registry::prelude::*;
use mmg_service_registry::provider::{self, no_attributes, ProviderRegistration};
use mmg_service_registry::service::{DynProvider, SERVICE_RANKING};

fn clock_types() -> Vec<&'static str> {
    vec!["demo.Clock"]
}

fn clock_attributes() -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert("zone".into(), "utc".into());
    // 显式 rank 优先于属性中的排名
    attrs.insert(SERVICE_RANKING.into(), 1.into());
    attrs
}

fn clock_provider() -> DynProvider {
    provider_fn(|| Ok(Arc::new("system-clock".to_string()) as Instance), |_| {})
}

fn untyped() -> Vec<&'static str> {
    Vec::new()
}

fn echo_provider() -> DynProvider {
    provider_fn(|| Ok(Arc::new(7u32) as Instance), |_| {})
}

inventory::submit! {
    ProviderRegistration {
        id: "system-clock",
        rank: 7,
        provides: clock_types,
        attributes: clock_attributes,
        new_provider: clock_provider,
    }
}

inventory::submit! {
    ProviderRegistration {
        id: "echo",
        rank: 0,
        provides: untyped,
        attributes: no_attributes,
        new_provider: echo_provider,
    }
}

#[test]
fn registrations_are_discoverable_by_id() {
    assert_eq!(provider::all().len(), 2);
    let reg = provider::find("system-clock").expect("registered");
    assert_eq!(reg.rank, 7);
    assert!(provider::find("missing").is_none());
}

#[test]
fn publish_feeds_every_registration_into_the_registry() {
    let registry = ServiceRegistry::default();
    assert_eq!(registry.publish_registered(), 2);
    assert_eq!(registry.member_count(), 2);

    let clocks = QueryKey::new(Some("demo.Clock"), Some(Filter::eq("zone", "utc")));
    let clock = registry.lookup(&clocks).next().expect("typed member");
    assert_eq!(clock.id().as_str(), "system-clock");
    assert_eq!(clock.rank(), 7);
    let inst = clock.acquire_as::<String>().expect("string instance");
    assert_eq!(inst.as_str(), "system-clock");
    clock.release();

    // 无类型成员只出现在不带类型约束的查询中
    let all: Vec<_> = registry
        .lookup(&QueryKey::all())
        .map(|h| h.id().to_string())
        .collect();
    assert_eq!(all, vec!["system-clock", "echo"]);
    assert_eq!(registry.lookup(&QueryKey::new(Some("demo.Clock"), None)).count(), 1);
}

#[test]
fn to_member_carries_types_and_attributes() {
    let reg = provider::find("system-clock").expect("registered");
    let spec = reg.to_member();
    assert_eq!(spec.effective_rank(), 7);
    assert_eq!(
        spec.attributes.get("objectClass"),
        Some(&serde_json::json!(["demo.Clock"]))
    );
    assert_eq!(spec.attributes.get("zone").and_then(|v| v.as_str()), Some("utc"));
}
