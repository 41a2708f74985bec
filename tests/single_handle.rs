mod common;

use std::sync::{atomic::Ordering, Arc, Barrier};

use common::{member, name_of, Counting};
use mmg_service_registry::prelude::*;

fn registry_with(members: &[(&'static str, i64)]) -> (ServiceRegistry, Vec<Arc<Counting>>) {
    let reg = ServiceRegistry::default();
    let providers = members
        .iter()
        .map(|&(id, rank)| {
            let p = Counting::new(id);
            reg.member_appeared(member(id, rank, p.clone()).attr("role", "store"));
            p
        })
        .collect();
    (reg, providers)
}

fn single(reg: &ServiceRegistry) -> ConcurrentSingleHandle {
    ConcurrentSingleHandle::new(
        Arc::new(reg.clone()),
        QueryKey::new(None, Some(Filter::eq("role", "store"))),
    )
}

#[test]
fn rotation_to_new_best_happens_only_at_zero_use_count() {
    let (reg, _) = registry_with(&[("A", 5), ("B", 3)]);
    let s = single(&reg);

    let first = s.acquire().expect("acquire");
    assert_eq!(name_of(&first), "A");

    let mut attrs = Attributes::new();
    attrs.insert("role".into(), "store".into());
    reg.member_updated(&ServiceId::new("B"), 9, attrs);

    // 会话仍在进行：继续使用 A
    let during = s.acquire().expect("acquire");
    assert_eq!(name_of(&during), "A");
    s.release();
    s.release();
    assert_eq!(s.use_count(), 0);

    let after = s.acquire().expect("acquire");
    assert_eq!(name_of(&after), "B");
    s.release();
}

#[test]
fn one_underlying_acquire_per_session() {
    let (reg, providers) = registry_with(&[("A", 5)]);
    let s = single(&reg);
    for _ in 0..3 {
        s.acquire().expect("acquire");
    }
    let held = s.current().expect("held handle");
    assert_eq!(held.use_count(), 1);
    for _ in 0..3 {
        s.release();
    }
    assert_eq!(held.use_count(), 0);
    assert!(s.current().is_none());
    assert_eq!(providers[0].acquired(), 1);
}

#[test]
fn no_matching_member_reports_no_service() {
    let reg = ServiceRegistry::default();
    let s = single(&reg);
    let err = s.acquire().expect_err("empty registry");
    assert!(matches!(err, RegistryError::NoService { .. }));
    assert!(err.is_unavailable());
    s.release();
    assert_eq!(s.use_count(), 0);
    assert!(s.attributes().is_none());
}

#[test]
fn failed_materialization_fails_the_whole_session() {
    let (reg, providers) = registry_with(&[("A", 5)]);
    providers[0].fail.store(true, Ordering::SeqCst);
    let s = single(&reg);
    let first = s.acquire().expect_err("materialization fails");
    let second = s.acquire().expect_err("same session fails");
    // 后续获取者拿到同一个原因，而不是“已失效”
    for err in [&first, &second] {
        assert!(matches!(err, RegistryError::Unavailable { source: Some(_), .. }));
        let cause = std::error::Error::source(err).map(|c| c.to_string());
        assert_eq!(cause.as_deref(), Some("A refused"));
    }
    let held = s.current().expect("handle kept for pairing");
    assert_eq!(held.use_count(), 1);
    s.release();
    s.release();
    assert_eq!(held.use_count(), 0);

    providers[0].fail.store(false, Ordering::SeqCst);
    let ok = s.with(|inst| name_of(inst)).expect("recovered");
    assert_eq!(ok, "A");
    assert_eq!(s.use_count(), 0);
}

#[test]
fn attributes_peek_without_committing() {
    let (reg, providers) = registry_with(&[("A", 5), ("B", 3)]);
    let s = single(&reg);
    let peeked = s.attributes().expect("best attributes");
    assert_eq!(peeked.get("role").and_then(|v| v.as_str()), Some("store"));
    assert!(s.current().is_none());
    assert_eq!(providers[0].acquired(), 0);

    s.acquire().expect("acquire");
    let mut attrs = Attributes::new();
    attrs.insert("role".into(), "store".into());
    attrs.insert("extra".into(), true.into());
    reg.member_updated(&ServiceId::new("A"), 5, attrs);
    let held = s.attributes().expect("held attributes");
    assert_eq!(held.get("extra").and_then(|v| v.as_bool()), Some(true));
    s.release();
}

#[test]
fn threads_share_one_instance_while_overlapping() {
    let (reg, providers) = registry_with(&[("A", 5)]);
    let s = Arc::new(single(&reg));
    // 先持有一次，保证所有线程落在同一会话
    s.acquire().expect("anchor");
    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));
    let joins: Vec<_> = (0..threads)
        .map(|_| {
            let s = s.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                let name = s.with(|inst| name_of(inst)).expect("with");
                assert_eq!(name, "A");
            })
        })
        .collect();
    for j in joins {
        j.join().expect("thread");
    }
    s.release();
    assert_eq!(s.use_count(), 0);
    assert_eq!(providers[0].acquired(), 1);
}

#[test]
fn invalidated_best_is_replaced_on_next_session() {
    let (reg, _) = registry_with(&[("A", 5), ("B", 3)]);
    let s = single(&reg);
    let a = s.acquire().expect("A");
    assert_eq!(name_of(&a), "A");
    reg.member_disappeared(&ServiceId::new("A"));
    // 当前会话保留最后一个有效实例
    assert_eq!(name_of(&s.acquire().expect("still A")), "A");
    s.release();
    s.release();
    assert_eq!(name_of(&s.acquire().expect("B")), "B");
    s.release();
}
