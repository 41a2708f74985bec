//! 单个服务实例的缓存句柄：惰性物化、引用计数、代数戳与三态生命周期。
use std::{
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::{
    error::{RegistryError, Result},
    service::{Attributes, DynProvider, GenerationClock, Instance, MemberRecord, Rank, ServiceId, SortKey},
    watch::{guard, Export},
};

/// Lifecycle of a handle. Only `Active` carries the instance.
pub enum HandleState {
    Dormant,
    Active(Instance),
    Invalid,
}

impl fmt::Debug for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleState::Dormant => f.write_str("Dormant"),
            HandleState::Active(_) => f.write_str("Active(..)"),
            HandleState::Invalid => f.write_str("Invalid"),
        }
    }
}

struct Meta {
    rank: Rank,
    attributes: Attributes,
}

pub struct ServiceHandle {
    id: ServiceId,
    seq: u64,
    meta: RwLock<Meta>,
    provider: DynProvider,
    clock: GenerationClock,
    use_count: AtomicUsize,
    generation: AtomicU64,
    // 句柄级锁：仅覆盖物化/释放回调
    state: Mutex<HandleState>,
    invalidated: AtomicBool,
    exports: Mutex<SmallVec<[Box<dyn Export>; 2]>>,
}

impl ServiceHandle {
    pub fn new(record: &MemberRecord, clock: GenerationClock) -> Self {
        let generation = clock.current();
        Self {
            id: record.id.clone(),
            seq: record.seq,
            meta: RwLock::new(Meta {
                rank: record.rank,
                attributes: record.attributes.clone(),
            }),
            provider: record.provider.clone(),
            clock,
            use_count: AtomicUsize::new(0),
            generation: AtomicU64::new(generation),
            state: Mutex::new(HandleState::Dormant),
            invalidated: AtomicBool::new(false),
            exports: Mutex::new(SmallVec::new()),
        }
    }

    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    pub fn rank(&self) -> Rank {
        self.meta.read().rank
    }

    pub fn sort_key(&self) -> SortKey {
        SortKey {
            rank: self.rank(),
            seq: self.seq,
        }
    }

    pub fn attributes(&self) -> Attributes {
        self.meta.read().attributes.clone()
    }

    pub fn with_attributes<R>(&self, f: impl FnOnce(&Attributes) -> R) -> R {
        f(&self.meta.read().attributes)
    }

    pub fn use_count(&self) -> usize {
        self.use_count.load(Ordering::Acquire)
    }

    /// Generation recorded by the most recent `release()`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_available(&self) -> bool {
        !self.invalidated.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.is_available() && matches!(*self.state.lock(), HandleState::Active(_))
    }

    /// Increments the use count, then returns the cached instance, materializing it first
    /// when dormant. The count is incremented even on failure: every call must be paired
    /// with exactly one [`release`](Self::release).
    pub fn acquire(&self) -> Result<Instance> {
        self.use_count.fetch_add(1, Ordering::AcqRel);
        let mut state = self.state.lock();
        if !self.is_available() {
            // invalidate() 未能拿到锁时由此补记终态
            *state = HandleState::Invalid;
            return Err(RegistryError::invalidated(&self.id));
        }
        if let HandleState::Active(instance) = &*state {
            return Ok(instance.clone());
        }
        // 持锁物化：同一句柄的并发获取者在此排队，回调只执行一次
        match self.provider.acquire() {
            Ok(instance) => {
                tracing::trace!(service = %self.id, "materialized");
                // 物化期间被失效：本次获取者照常持有，但不再缓存
                *state = if self.is_available() {
                    HandleState::Active(instance.clone())
                } else {
                    HandleState::Invalid
                };
                Ok(instance)
            }
            Err(e) => {
                tracing::warn!(service = %self.id, error = %e, "materialization failed");
                Err(RegistryError::materialize(&self.id, e))
            }
        }
    }

    /// Same contract as [`acquire`](Self::acquire), downcast to `T`.
    pub fn acquire_as<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.acquire()?
            .downcast::<T>()
            .map_err(|_| RegistryError::TypeMismatch {
                id: self.id.clone(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Acquire wrapped in a guard that releases on drop.
    pub fn lease(self: &Arc<Self>) -> Result<Lease> {
        match self.acquire() {
            Ok(instance) => Ok(Lease {
                handle: Arc::clone(self),
                instance,
            }),
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    pub fn release(&self) {
        self.generation.store(self.clock.current(), Ordering::Release);
        let prev = self
            .use_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if prev.is_err() {
            tracing::warn!(service = %self.id, "release without matching acquire; ignored");
        }
    }

    /// Returns the cached instance to the provider if the handle is idle and was last
    /// released in `target`. Returns whether an eviction happened.
    pub fn try_evict(&self, target: u64) -> bool {
        if self.generation() != target || self.use_count() != 0 {
            return false;
        }
        let mut state = self.state.lock();
        if !self.is_available() {
            *state = HandleState::Invalid;
            return false;
        }
        let instance = match std::mem::replace(&mut *state, HandleState::Dormant) {
            HandleState::Active(instance) => instance,
            other => {
                *state = other;
                return false;
            }
        };
        // 外层检查之后可能有新的获取者到达
        if self.use_count() != 0 {
            *state = HandleState::Active(instance);
            return false;
        }
        self.provider.release(instance);
        tracing::debug!(service = %self.id, generation = target, "evicted");
        true
    }

    /// Terminal: notifies and drops attached exports, then discards the instance.
    /// Holders of an already acquired instance keep it until they release.
    ///
    /// Never waits on the handle lock. If a materialization is in flight, the flag alone is
    /// set here and whoever holds the lock records `Invalid` when it next looks at the state.
    pub fn invalidate(&self) {
        if self.invalidated.swap(true, Ordering::AcqRel) {
            return;
        }
        let exports = std::mem::take(&mut *self.exports.lock());
        for mut export in exports {
            let name = export.name();
            guard(name, || export.on_removed());
        }
        let prev = self
            .state
            .try_lock()
            .map(|mut state| std::mem::replace(&mut *state, HandleState::Invalid));
        drop(prev);
        tracing::debug!(service = %self.id, "invalidated");
    }

    pub(crate) fn set_meta(&self, rank: Rank, attributes: Attributes) {
        let mut meta = self.meta.write();
        meta.rank = rank;
        meta.attributes = attributes;
    }

    pub(crate) fn notify_updated(&self) {
        let attributes = self.attributes();
        let mut exports = self.exports.lock();
        for export in exports.iter_mut() {
            let name = export.name();
            guard(name, || export.on_updated(&attributes));
        }
    }

    pub(crate) fn attach_export(&self, mut export: Box<dyn Export>) {
        {
            let mut exports = self.exports.lock();
            if self.is_available() {
                exports.push(export);
                return;
            }
        }
        // 已失效：立即撤回
        let name = export.name();
        guard(name, || export.on_removed());
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("id", &self.id)
            .field("rank", &self.rank())
            .field("use_count", &self.use_count())
            .field("generation", &self.generation())
            .field("available", &self.is_available())
            .finish()
    }
}

/// An acquired instance; releases its handle when dropped.
pub struct Lease {
    handle: Arc<ServiceHandle>,
    instance: Instance,
}

impl Lease {
    pub fn handle(&self) -> &Arc<ServiceHandle> {
        &self.handle
    }
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.instance.downcast_ref::<T>()
    }
}

impl Deref for Lease {
    type Target = Instance;
    fn deref(&self) -> &Instance {
        &self.instance
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.handle.release();
    }
}
