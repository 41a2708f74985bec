use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use dashmap::DashMap;
use parking_lot::{ReentrantMutex, RwLock};

use crate::{
    collection::{Cursor, RankedCollection},
    config::RegistryConfig,
    filter::{Filter, QueryKey},
    iter::{Imports, ServiceIter, ServiceSource},
    service::{Attributes, GenerationClock, MemberRecord, MemberSpec, Rank, ServiceId},
    watch::{ChannelWatcher, EventStream, ImportWatcher},
};

/// Something that discovers members for a query and pushes them through a [`Feed`].
/// Called once per newly created collection.
pub trait DiscoverySource: Send + Sync {
    fn subscribe(&self, key: &QueryKey, feed: Feed) -> anyhow::Result<()>;
}

/// Maps (type, filter) queries to ranked collections and routes discovery events into them.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    cfg: RegistryConfig,
    clock: GenerationClock,
    collections: DashMap<QueryKey, Arc<RankedCollection>>,
    // 主成员表：新建集合据此回填；写锁只在改表时短暂持有
    members: RwLock<BTreeMap<ServiceId, MemberRecord>>,
    // 串行化“改表 + 分发”与回填；可重入，回调内新建集合不会自锁
    sequence: ReentrantMutex<()>,
    next_seq: AtomicU64,
    sources: RwLock<Vec<Arc<dyn DiscoverySource>>>,
}

enum Change {
    Upsert(MemberRecord),
    Gone(ServiceId),
    Nothing,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("collections", &self.inner.collections.len())
            .field("members", &self.inner.members.read().len())
            .field("generation", &self.inner.clock.current())
            .finish()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl ServiceRegistry {
    pub fn new(cfg: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                cfg,
                clock: GenerationClock::default(),
                collections: DashMap::new(),
                members: RwLock::new(BTreeMap::new()),
                sequence: ReentrantMutex::new(()),
                next_seq: AtomicU64::new(0),
                sources: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.cfg
    }

    /// Write side of the discovery feed for external sources.
    pub fn feed(&self) -> Feed {
        Feed {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Registers a discovery source; it is subscribed for every existing and future query.
    pub fn add_source(&self, source: Arc<dyn DiscoverySource>) {
        self.inner.sources.write().push(source.clone());
        for collection in self.inner.snapshot() {
            self.inner.start_source(&source, collection.key());
        }
    }

    /// Resolves (creating exactly once) the collection for `key`.
    pub fn collection(&self, key: &QueryKey) -> Arc<RankedCollection> {
        self.inner.collection(key)
    }

    pub fn lookup(&self, key: &QueryKey) -> Imports {
        Imports::new(self.collection(key))
    }

    /// Typed lookup: folds `T`'s type name and `filter` into one key.
    pub fn lookup_type<T: ?Sized + 'static>(&self, filter: Option<Filter>) -> Imports {
        self.lookup(&QueryKey::of::<T>(filter))
    }

    /// Resumes iteration after a cursor obtained from an earlier [`Imports`].
    pub fn lookup_from(&self, key: &QueryKey, cursor: Cursor) -> Imports {
        Imports::resume(self.collection(key), cursor)
    }

    pub fn watch(&self, key: &QueryKey, watcher: Arc<dyn ImportWatcher>) {
        let collection = self.collection(key);
        // 回放与成员事件分发同序：先 sequence 后 dispatch
        let _sequence = self.inner.sequence.lock();
        collection.attach_watcher(watcher);
    }

    pub fn unwatch(&self, key: &QueryKey, watcher: &Arc<dyn ImportWatcher>) -> bool {
        self.inner
            .collections
            .get(key)
            .map(|c| Arc::clone(c.value()))
            .is_some_and(|c| c.detach_watcher(watcher))
    }

    /// Watches `key` through a bounded event queue sized by the config.
    pub fn subscribe(&self, key: &QueryKey) -> EventStream {
        let (watcher, stream) = ChannelWatcher::new(self.inner.cfg.queue_capacity());
        self.watch(key, Arc::new(watcher));
        stream
    }

    /// Evicts idle handles last released in `generation` across every collection.
    /// A generation no handle carries is simply a no-op.
    pub fn flush(&self, generation: u64) -> usize {
        let evicted: usize = self
            .inner
            .snapshot()
            .iter()
            .map(|c| c.flush(generation))
            .sum();
        if evicted > 0 {
            tracing::debug!(generation, evicted, "flush");
        }
        evicted
    }

    pub fn generation(&self) -> u64 {
        self.inner.clock.current()
    }

    pub fn set_generation(&self, generation: u64) {
        self.inner.clock.set(generation);
    }

    pub fn advance_generation(&self) -> u64 {
        self.inner.clock.advance()
    }

    pub fn member_appeared(&self, spec: MemberSpec) {
        self.inner.member_appeared(spec);
    }

    pub fn member_updated(&self, id: &ServiceId, rank: Rank, attributes: Attributes) {
        self.inner.member_updated(id, rank, attributes);
    }

    pub fn member_disappeared(&self, id: &ServiceId) {
        self.inner.member_disappeared(id);
    }

    pub fn member_count(&self) -> usize {
        self.inner.members.read().len()
    }

    pub fn collection_count(&self) -> usize {
        self.inner.collections.len()
    }
}

impl RegistryInner {
    fn snapshot(&self) -> Vec<Arc<RankedCollection>> {
        // 先复制出来再分发，避免回调期间持有分片锁
        self.collections.iter().map(|e| Arc::clone(e.value())).collect()
    }

    fn collection(self: &Arc<Self>, key: &QueryKey) -> Arc<RankedCollection> {
        if let Some(c) = self.collections.get(key) {
            return Arc::clone(c.value());
        }
        let collection = {
            let entry = self
                .collections
                .entry(key.clone())
                .or_insert_with(|| Arc::new(RankedCollection::new(key.clone(), self.clock.clone())));
            Arc::clone(entry.value())
        };
        if collection.mark_started() {
            self.start(&collection);
        }
        collection
    }

    fn start(self: &Arc<Self>, collection: &RankedCollection) {
        let key = collection.key();
        {
            // 可能在分发回调中被调用：同线程可重入
            let _sequence = self.sequence.lock();
            let matching: Vec<MemberRecord> = self
                .members
                .read()
                .values()
                .filter(|r| key.matches(&r.attributes))
                .cloned()
                .collect();
            for record in &matching {
                collection.insert_or_update(record);
            }
        }
        tracing::debug!(key = %key, members = collection.len(), "collection created");
        let sources: Vec<_> = self.sources.read().clone();
        for source in &sources {
            self.start_source(source, key);
        }
    }

    fn start_source(self: &Arc<Self>, source: &Arc<dyn DiscoverySource>, key: &QueryKey) {
        let feed = Feed {
            inner: Arc::downgrade(self),
        };
        if let Err(e) = source.subscribe(key, feed) {
            tracing::warn!(key = %key, error = %e, "discovery failed to start; collection stays empty until members arrive");
        }
    }

    fn apply(&self, mutate: impl FnOnce(&mut BTreeMap<ServiceId, MemberRecord>) -> Change) {
        let _sequence = self.sequence.lock();
        let change = mutate(&mut self.members.write());
        // 分发期间不持有成员表锁：回调可以自由读取注册表
        match change {
            Change::Nothing => {}
            Change::Upsert(record) => {
                for c in self.snapshot() {
                    if c.key().matches(&record.attributes) {
                        c.insert_or_update(&record);
                    } else {
                        c.remove(&record.id);
                    }
                }
            }
            Change::Gone(id) => {
                for c in self.snapshot() {
                    c.remove(&id);
                }
            }
        }
    }

    fn member_appeared(&self, spec: MemberSpec) {
        let rank = spec.effective_rank();
        self.apply(|members| {
            let record = match members.get_mut(&spec.id) {
                // 重复出现按更新处理，保留原 seq 与物化回调
                Some(existing) => {
                    existing.rank = rank;
                    existing.attributes = spec.attributes;
                    existing.clone()
                }
                None => {
                    let record = MemberRecord {
                        id: spec.id.clone(),
                        seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                        rank,
                        attributes: spec.attributes,
                        provider: spec.provider,
                    };
                    members.insert(spec.id, record.clone());
                    record
                }
            };
            Change::Upsert(record)
        });
    }

    fn member_updated(&self, id: &ServiceId, rank: Rank, attributes: Attributes) {
        self.apply(|members| match members.get_mut(id) {
            Some(existing) => {
                existing.rank = rank;
                existing.attributes = attributes;
                Change::Upsert(existing.clone())
            }
            None => {
                tracing::warn!(service = %id, "update for unknown member ignored");
                Change::Nothing
            }
        });
    }

    fn member_disappeared(&self, id: &ServiceId) {
        self.apply(|members| match members.remove(id) {
            Some(_) => Change::Gone(id.clone()),
            None => Change::Nothing,
        });
    }
}

/// Write side of the discovery feed. Holds the registry weakly; events after the registry
/// is dropped are ignored.
#[derive(Clone)]
pub struct Feed {
    inner: Weak<RegistryInner>,
}

impl Feed {
    pub fn member_appeared(&self, spec: MemberSpec) {
        if let Some(inner) = self.inner.upgrade() {
            inner.member_appeared(spec);
        }
    }

    pub fn member_updated(&self, id: &ServiceId, rank: Rank, attributes: Attributes) {
        if let Some(inner) = self.inner.upgrade() {
            inner.member_updated(id, rank, attributes);
        }
    }

    pub fn member_disappeared(&self, id: &ServiceId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.member_disappeared(id);
        }
    }
}

impl ServiceSource for ServiceRegistry {
    fn lookup(&self, key: &QueryKey) -> ServiceIter {
        Box::new(ServiceRegistry::lookup(self, key))
    }

    fn watch(&self, key: &QueryKey, watcher: Arc<dyn ImportWatcher>) {
        ServiceRegistry::watch(self, key, watcher);
    }
}
