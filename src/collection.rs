//! 一个 (类型, 过滤器) 查询对应的有序句柄集合。
//!
//! 锁分两级：`dispatch` 串行化成员变更与观察者通知，`entries` 只在调整顺序时短暂持有；
//! 句柄级锁从不在 `entries` 持有期间获取。
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::{Mutex, RwLock};

use crate::{
    filter::QueryKey,
    handle::ServiceHandle,
    service::{GenerationClock, MemberRecord, ServiceId, SortKey},
    watch::{guard, ImportWatcher},
};

/// Resume position for [`RankedCollection::find_next`]: the identity and sort key of the last
/// member handed out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    id: ServiceId,
    key: SortKey,
}

impl Cursor {
    pub fn at(handle: &ServiceHandle) -> Self {
        Self {
            id: handle.id().clone(),
            key: handle.sort_key(),
        }
    }
    pub fn id(&self) -> &ServiceId {
        &self.id
    }
}

struct Slot {
    key: SortKey,
    handle: Arc<ServiceHandle>,
}

enum Change {
    Added(Arc<ServiceHandle>),
    Updated(Arc<ServiceHandle>),
}

pub struct RankedCollection {
    key: QueryKey,
    clock: GenerationClock,
    entries: RwLock<Vec<Slot>>,
    dispatch: Mutex<Vec<Arc<dyn ImportWatcher>>>,
    started: AtomicBool,
}

impl RankedCollection {
    pub fn new(key: QueryKey, clock: GenerationClock) -> Self {
        Self {
            key,
            clock,
            entries: RwLock::new(Vec::new()),
            dispatch: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Current members in rank order.
    pub fn snapshot(&self) -> Vec<Arc<ServiceHandle>> {
        self.entries.read().iter().map(|s| s.handle.clone()).collect()
    }

    pub fn get(&self, id: &ServiceId) -> Option<Arc<ServiceHandle>> {
        self.entries
            .read()
            .iter()
            .find(|s| s.handle.id() == id)
            .map(|s| s.handle.clone())
    }

    /// 仅首次返回 true
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    /// Inserts a new member or updates the existing handle with the same identity.
    /// An existing handle is never replaced: in-flight acquirers keep using it.
    pub fn insert_or_update(&self, record: &MemberRecord) -> Arc<ServiceHandle> {
        let watchers = self.dispatch.lock();
        let key = record.sort_key();
        let change = {
            let mut entries = self.entries.write();
            let found = match entries.binary_search_by(|s| s.key.cmp(&key)) {
                Ok(i) if entries[i].handle.id() == &record.id => Some(i),
                // 排名可能已漂移，按身份线性确认
                _ => entries.iter().position(|s| s.handle.id() == &record.id),
            };
            match found {
                None => {
                    let handle = Arc::new(ServiceHandle::new(record, self.clock.clone()));
                    let at = entries.partition_point(|s| s.key < key);
                    entries.insert(
                        at,
                        Slot {
                            key,
                            handle: handle.clone(),
                        },
                    );
                    Change::Added(handle)
                }
                Some(i) => {
                    let handle = entries[i].handle.clone();
                    if entries[i].key != key {
                        let slot = entries.remove(i);
                        let at = entries.partition_point(|s| s.key < key);
                        entries.insert(
                            at,
                            Slot {
                                key,
                                handle: slot.handle,
                            },
                        );
                    }
                    handle.set_meta(record.rank, record.attributes.clone());
                    Change::Updated(handle)
                }
            }
        };
        match change {
            Change::Added(handle) => {
                tracing::debug!(key = %self.key, service = %handle.id(), rank = record.rank, "member added");
                for w in watchers.iter() {
                    offer(w, &handle);
                }
                handle
            }
            Change::Updated(handle) => {
                tracing::debug!(key = %self.key, service = %handle.id(), rank = record.rank, "member updated");
                handle.notify_updated();
                handle
            }
        }
    }

    /// Unlinks and invalidates the member, even if it is currently acquired.
    pub fn remove(&self, id: &ServiceId) -> Option<Arc<ServiceHandle>> {
        let _watchers = self.dispatch.lock();
        let removed = {
            let mut entries = self.entries.write();
            entries
                .iter()
                .position(|s| s.handle.id() == id)
                .map(|i| entries.remove(i).handle)
        };
        if let Some(handle) = &removed {
            tracing::debug!(key = %self.key, service = %id, in_use = handle.use_count(), "member removed");
            handle.invalidate();
        }
        removed
    }

    /// First available member after `cursor` (or from the start) accepted by `predicate`.
    ///
    /// The resume index is estimated from the cursor's remembered sort key, then scanned
    /// forward. Under concurrent mutation this makes monotonic progress but is only
    /// best-effort complete: a member whose rank moves across the cursor between calls can
    /// be skipped or seen twice. Once mutation stops, iteration observes a stable order.
    pub fn find_next(
        &self,
        cursor: Option<&Cursor>,
        predicate: &dyn Fn(&ServiceHandle) -> bool,
    ) -> Option<Arc<ServiceHandle>> {
        let entries = self.entries.read();
        let start = cursor.map_or(0, |c| entries.partition_point(|s| s.key <= c.key));
        entries[start..]
            .iter()
            .find(|s| s.handle.is_available() && predicate(&s.handle))
            .map(|s| s.handle.clone())
    }

    /// Evicts every idle member last released in `generation`; returns how many were evicted.
    pub fn flush(&self, generation: u64) -> usize {
        self.snapshot()
            .iter()
            .filter(|h| h.try_evict(generation))
            .count()
    }

    /// Replays an "added" event for every current member in order, then subscribes `watcher`.
    pub fn attach_watcher(&self, watcher: Arc<dyn ImportWatcher>) {
        let mut watchers = self.dispatch.lock();
        for handle in self.snapshot() {
            offer(&watcher, &handle);
        }
        watchers.push(watcher);
    }

    /// Stops future "added" events; exports already created stay attached to their members.
    pub fn detach_watcher(&self, watcher: &Arc<dyn ImportWatcher>) -> bool {
        let mut watchers = self.dispatch.lock();
        let before = watchers.len();
        watchers.retain(|w| !same_watcher(w, watcher));
        watchers.len() != before
    }
}

fn same_watcher(a: &Arc<dyn ImportWatcher>, b: &Arc<dyn ImportWatcher>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn offer(watcher: &Arc<dyn ImportWatcher>, handle: &Arc<ServiceHandle>) {
    if let Some(Some(export)) = guard(watcher.name(), || watcher.on_added(handle)) {
        handle.attach_export(export);
    }
}

impl std::fmt::Debug for RankedCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankedCollection")
            .field("key", &self.key)
            .field("len", &self.len())
            .finish()
    }
}
