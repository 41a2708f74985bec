//! 惰性、容忍并发变更的迭代：游标迭代器、过滤叠加与多来源串联。
use std::{collections::VecDeque, fmt, sync::Arc};

use crate::{
    collection::{Cursor, RankedCollection},
    filter::{Filter, QueryKey},
    handle::ServiceHandle,
    watch::ImportWatcher,
};

pub type ServiceIter = Box<dyn Iterator<Item = Arc<ServiceHandle>> + Send>;
pub type Predicate = Arc<dyn Fn(&ServiceHandle) -> bool + Send + Sync>;

/// Anything that can be queried like a registry. Implemented by
/// [`ServiceRegistry`](crate::registry::ServiceRegistry) and [`ChainedRegistry`].
pub trait ServiceSource: Send + Sync {
    fn lookup(&self, key: &QueryKey) -> ServiceIter;
    fn watch(&self, key: &QueryKey, watcher: Arc<dyn ImportWatcher>);
}

/// Cursor-based view over one ranked collection.
///
/// Single pass and not restartable; members cannot be removed through it. Each step resumes
/// from the last member handed out, so concurrent inserts and removals never invalidate the
/// iterator, but completeness under concurrent mutation is best-effort
/// (see [`RankedCollection::find_next`]).
pub struct Imports {
    collection: Arc<RankedCollection>,
    cursor: Option<Cursor>,
    pending: Option<Arc<ServiceHandle>>,
    predicate: Option<Predicate>,
}

impl Imports {
    pub fn new(collection: Arc<RankedCollection>) -> Self {
        Self {
            collection,
            cursor: None,
            pending: None,
            predicate: None,
        }
    }

    pub fn resume(collection: Arc<RankedCollection>, cursor: Cursor) -> Self {
        Self {
            cursor: Some(cursor),
            ..Self::new(collection)
        }
    }

    pub fn has_next(&mut self) -> bool {
        if self.pending.is_none() {
            self.pending = self.fetch();
        }
        self.pending.is_some()
    }

    /// Position after the last member returned (or prefetched by `has_next`).
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    /// Narrows the remaining iteration with an extra predicate; shares the current cursor.
    pub fn filtered<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ServiceHandle) -> bool + Send + Sync + 'static,
    {
        let combined: Predicate = match self.predicate.take() {
            Some(prev) => Arc::new(move |h: &ServiceHandle| prev(h) && predicate(h)),
            None => Arc::new(predicate),
        };
        if let Some(h) = &self.pending {
            if !combined(h) {
                self.pending = None;
            }
        }
        self.predicate = Some(combined);
        self
    }

    pub fn matching(self, filter: Filter) -> Self {
        self.filtered(move |h| h.with_attributes(|a| filter.matches(a)))
    }

    fn fetch(&mut self) -> Option<Arc<ServiceHandle>> {
        let found = match &self.predicate {
            Some(p) => self.collection.find_next(self.cursor.as_ref(), p.as_ref()),
            None => self.collection.find_next(self.cursor.as_ref(), &|_| true),
        }?;
        self.cursor = Some(Cursor::at(&found));
        Some(found)
    }
}

impl Iterator for Imports {
    type Item = Arc<ServiceHandle>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.pending.take() {
            Some(h) => Some(h),
            None => self.fetch(),
        }
    }
}

impl fmt::Debug for Imports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Imports")
            .field("key", self.collection.key())
            .field("cursor", &self.cursor)
            .finish()
    }
}

type Opener = Box<dyn FnOnce() -> ServiceIter + Send>;

/// Concatenates lazily opened sequences in fixed order. A source is opened only when
/// reached and never revisited once exhausted.
#[derive(Default)]
pub struct Chained {
    pending: VecDeque<Opener>,
    current: Option<ServiceIter>,
}

impl Chained {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then<F>(mut self, open: F) -> Self
    where
        F: FnOnce() -> ServiceIter + Send + 'static,
    {
        self.pending.push_back(Box::new(open));
        self
    }
}

impl Iterator for Chained {
    type Item = Arc<ServiceHandle>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cur) = self.current.as_mut() {
                if let Some(h) = cur.next() {
                    return Some(h);
                }
                self.current = None;
            }
            let open = self.pending.pop_front()?;
            self.current = Some(open());
        }
    }
}

/// Federates several sources: lookups walk them in order, watchers attach to each.
#[derive(Clone, Default)]
pub struct ChainedRegistry {
    sources: Vec<Arc<dyn ServiceSource>>,
}

impl ChainedRegistry {
    pub fn new(sources: Vec<Arc<dyn ServiceSource>>) -> Self {
        Self { sources }
    }

    pub fn push(&mut self, source: Arc<dyn ServiceSource>) {
        self.sources.push(source);
    }
}

impl ServiceSource for ChainedRegistry {
    fn lookup(&self, key: &QueryKey) -> ServiceIter {
        let chained = self.sources.iter().fold(Chained::new(), |acc, source| {
            let source = Arc::clone(source);
            let key = key.clone();
            acc.then(move || source.lookup(&key))
        });
        Box::new(chained)
    }

    fn watch(&self, key: &QueryKey, watcher: Arc<dyn ImportWatcher>) {
        for source in &self.sources {
            source.watch(key, Arc::clone(&watcher));
        }
    }
}
