//! 只镜像“当前最优成员”的观察者：任意时刻至多一个对外导出。
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    filter::QueryKey,
    handle::ServiceHandle,
    iter::ServiceSource,
    service::{Attributes, ServiceId},
    watch::{guard, Export, ImportWatcher},
};

#[derive(Default)]
struct Current {
    best: Option<Arc<ServiceHandle>>,
    export: Option<Box<dyn Export>>,
}

struct Inner {
    source: Arc<dyn ServiceSource>,
    key: QueryKey,
    downstream: Arc<dyn ImportWatcher>,
    current: Mutex<Current>,
}

/// Keeps exactly one downstream export pointing at whichever member of `key` ranks best.
///
/// Every member is tracked through a private export; on any add/update/remove the head of
/// the collection is re-read and, if it changed, the old export is retracted and a new one
/// created under the same lock. Attribute changes of the current best are forwarded to the
/// live export in place.
pub struct ConcurrentBestWatcher {
    inner: Arc<Inner>,
}

impl ConcurrentBestWatcher {
    pub fn new(
        source: Arc<dyn ServiceSource>,
        key: QueryKey,
        downstream: Arc<dyn ImportWatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                key,
                downstream,
                current: Mutex::new(Current::default()),
            }),
        }
    }

    /// Builds the watcher and attaches it to `key` on `source`.
    pub fn attach(
        source: Arc<dyn ServiceSource>,
        key: QueryKey,
        downstream: Arc<dyn ImportWatcher>,
    ) -> Arc<Self> {
        let watcher = Arc::new(Self::new(source.clone(), key.clone(), downstream));
        source.watch(&key, watcher.clone());
        watcher
    }

    pub fn current(&self) -> Option<Arc<ServiceHandle>> {
        self.inner.current.lock().best.clone()
    }
}

impl Inner {
    /// 返回是否发生了切换
    fn recompute(&self) -> bool {
        let mut current = self.current.lock();
        let head = self.source.lookup(&self.key).next();
        let unchanged = match (&current.best, &head) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return false;
        }
        if let Some(mut old) = current.export.take() {
            let name = old.name();
            guard(name, || old.on_removed());
        }
        current.export = head.as_ref().and_then(|h| {
            guard(self.downstream.name(), || self.downstream.on_added(h)).flatten()
        });
        tracing::debug!(
            key = %self.key,
            best = ?head.as_ref().map(|h| h.id().clone()),
            "best member changed"
        );
        current.best = head;
        true
    }

    fn member_updated(&self, id: &ServiceId, attributes: &Attributes) {
        if self.recompute() {
            return;
        }
        let mut current = self.current.lock();
        let is_best = current.best.as_ref().is_some_and(|b| b.id() == id);
        if let (true, Some(export)) = (is_best, current.export.as_mut()) {
            let name = export.name();
            guard(name, || export.on_updated(attributes));
        }
    }
}

impl ImportWatcher for ConcurrentBestWatcher {
    fn on_added(&self, handle: &Arc<ServiceHandle>) -> Option<Box<dyn Export>> {
        self.inner.recompute();
        Some(Box::new(Tracker {
            inner: self.inner.clone(),
            id: handle.id().clone(),
        }))
    }
}

struct Tracker {
    inner: Arc<Inner>,
    id: ServiceId,
}

impl Export for Tracker {
    fn on_updated(&mut self, attributes: &Attributes) {
        self.inner.member_updated(&self.id, attributes);
    }

    fn on_removed(&mut self) {
        self.inner.recompute();
    }
}
