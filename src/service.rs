use std::{
    any::Any,
    cmp::Ordering as CmpOrdering,
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde_json::Value;

/// Stable identity of one discovered member; independent of its rank.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ServiceId(pub String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        ServiceId(id.into())
    }
    /// 为没有自带标识的来源生成随机 id
    pub fn generate() -> Self {
        ServiceId(uuid::Uuid::new_v4().to_string())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        ServiceId(s.to_string())
    }
}

pub type Attributes = BTreeMap<String, Value>;
pub type Rank = i64;
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Attribute naming the types a member provides (string or array of strings).
pub const OBJECT_CLASS: &str = "objectClass";
/// Attribute carrying the integer rank.
pub const SERVICE_RANKING: &str = "service.ranking";

pub fn type_key<T: ?Sized + 'static>() -> &'static str {
    std::any::type_name::<T>()
}

pub fn rank_of(attributes: &Attributes) -> Rank {
    attributes
        .get(SERVICE_RANKING)
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// Ordering key of a member inside a ranked collection: higher rank first, then lower `seq`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SortKey {
    pub rank: Rank,
    pub seq: u64,
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .rank
            .cmp(&self.rank)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}
impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// 物化回调：由发现源提供，注册表只负责何时调用。
pub trait ServiceProvider: Send + Sync {
    fn acquire(&self) -> anyhow::Result<Instance>;
    fn release(&self, _instance: Instance) {}
}

pub type DynProvider = Arc<dyn ServiceProvider>;

struct FnProvider<A, R> {
    acquire: A,
    release: R,
}

impl<A, R> ServiceProvider for FnProvider<A, R>
where
    A: Fn() -> anyhow::Result<Instance> + Send + Sync,
    R: Fn(Instance) + Send + Sync,
{
    fn acquire(&self) -> anyhow::Result<Instance> {
        (self.acquire)()
    }
    fn release(&self, instance: Instance) {
        (self.release)(instance)
    }
}

/// Adapts an acquire/release closure pair into a provider.
pub fn provider_fn<A, R>(acquire: A, release: R) -> DynProvider
where
    A: Fn() -> anyhow::Result<Instance> + Send + Sync + 'static,
    R: Fn(Instance) + Send + Sync + 'static,
{
    Arc::new(FnProvider { acquire, release })
}

/// Payload of a `member_appeared` feed event.
#[derive(Clone)]
pub struct MemberSpec {
    pub id: ServiceId,
    pub rank: Option<Rank>,
    pub attributes: Attributes,
    pub provider: DynProvider,
}

impl MemberSpec {
    pub fn new(id: impl Into<ServiceId>, provider: DynProvider) -> Self {
        Self {
            id: id.into(),
            rank: None,
            attributes: Attributes::new(),
            provider,
        }
    }
    pub fn rank(mut self, rank: Rank) -> Self {
        self.rank = Some(rank);
        self
    }
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
    pub fn attributes(mut self, attributes: Attributes) -> Self {
        self.attributes.extend(attributes);
        self
    }
    /// Appends `T` to the member's `objectClass` list.
    pub fn provides<T: ?Sized + 'static>(self) -> Self {
        self.provides_name(type_key::<T>())
    }
    pub fn provides_name(mut self, name: &str) -> Self {
        let entry = self
            .attributes
            .entry(OBJECT_CLASS.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match entry {
            Value::Array(list) => list.push(Value::String(name.to_string())),
            other => {
                let prev = other.take();
                *other = Value::Array(vec![prev, Value::String(name.to_string())]);
            }
        }
        self
    }
    /// 未显式给出时由属性推导
    pub fn effective_rank(&self) -> Rank {
        self.rank.unwrap_or_else(|| rank_of(&self.attributes))
    }
}

/// A member as held by the registry's master table: the feed payload plus the
/// registry-assigned `seq` that breaks rank ties.
#[derive(Clone)]
pub struct MemberRecord {
    pub id: ServiceId,
    pub seq: u64,
    pub rank: Rank,
    pub attributes: Attributes,
    pub provider: DynProvider,
}

impl MemberRecord {
    pub fn sort_key(&self) -> SortKey {
        SortKey {
            rank: self.rank,
            seq: self.seq,
        }
    }
}

impl fmt::Debug for MemberRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberRecord")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("rank", &self.rank)
            .finish()
    }
}

impl From<String> for ServiceId {
    fn from(s: String) -> Self {
        ServiceId(s)
    }
}

impl fmt::Debug for MemberSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberSpec")
            .field("id", &self.id)
            .field("rank", &self.rank)
            .field("attributes", &self.attributes)
            .finish()
    }
}

/// Process-wide generation counter; advanced by an external policy, read on every release.
#[derive(Clone, Default)]
pub struct GenerationClock(Arc<AtomicU64>);

impl GenerationClock {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
    pub fn set(&self, generation: u64) {
        self.0.store(generation, Ordering::Release);
    }
    /// 返回推进后的新代数
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl fmt::Debug for GenerationClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GenerationClock({})", self.current())
    }
}
