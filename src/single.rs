use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    error::{RegistryError, Result},
    filter::QueryKey,
    handle::ServiceHandle,
    iter::ServiceSource,
    service::{Attributes, Instance},
};

#[derive(Default)]
struct Session {
    handle: Option<Arc<ServiceHandle>>,
    instance: Option<Instance>,
    // 本轮会话物化失败的原因，供后续获取者复述
    failure: Option<String>,
    use_count: usize,
}

/// One shared consumer of "the best member of `key`" for many threads.
///
/// While at least one caller holds it, every `acquire()` returns the same instance from the
/// same handle; the best member is re-resolved only after the use count returns to zero.
/// A better-ranked member appearing mid-session therefore waits for that boundary, which
/// keeps acquire/release paired on one handle without per-thread bookkeeping.
pub struct ConcurrentSingleHandle {
    source: Arc<dyn ServiceSource>,
    key: QueryKey,
    session: Mutex<Session>,
}

impl ConcurrentSingleHandle {
    pub fn new(source: Arc<dyn ServiceSource>, key: QueryKey) -> Self {
        Self {
            source,
            key,
            session: Mutex::new(Session::default()),
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Every call, successful or not, must be paired with one [`release`](Self::release).
    pub fn acquire(&self) -> Result<Instance> {
        let mut session = self.session.lock();
        session.use_count += 1;
        if session.handle.is_none() {
            if let Some(handle) = self.source.lookup(&self.key).next() {
                // 本轮会话内只对底层句柄获取一次
                let acquired = handle.acquire();
                session.handle = Some(handle);
                match acquired {
                    Ok(instance) => session.instance = Some(instance),
                    Err(e) => {
                        session.failure = std::error::Error::source(&e).map(|cause| cause.to_string());
                        return Err(e);
                    }
                }
            }
        }
        match (&session.instance, &session.handle) {
            (Some(instance), _) => Ok(instance.clone()),
            // 本轮会话的物化已失败，等计数归零后重新解析
            (None, Some(handle)) => Err(match &session.failure {
                Some(cause) => RegistryError::materialize(handle.id(), anyhow::anyhow!(cause.clone())),
                None => RegistryError::invalidated(handle.id()),
            }),
            (None, None) => Err(RegistryError::NoService {
                key: self.key.clone(),
            }),
        }
    }

    pub fn release(&self) {
        let mut session = self.session.lock();
        if session.use_count == 0 {
            tracing::warn!(key = %self.key, "release without matching acquire; ignored");
            return;
        }
        session.use_count -= 1;
        if session.use_count == 0 {
            let ended = std::mem::take(&mut *session);
            if let Some(handle) = ended.handle {
                handle.release();
            }
        }
    }

    /// Runs `f` between a paired acquire and release.
    pub fn with<R>(&self, f: impl FnOnce(&Instance) -> R) -> Result<R> {
        let out = self.acquire().map(|instance| f(&instance));
        self.release();
        out
    }

    /// Attributes of the held member, or a non-committing peek at the current best.
    pub fn attributes(&self) -> Option<Attributes> {
        let held = self.session.lock().handle.clone();
        match held {
            Some(handle) => Some(handle.attributes()),
            None => self.source.lookup(&self.key).next().map(|h| h.attributes()),
        }
    }

    pub fn use_count(&self) -> usize {
        self.session.lock().use_count
    }

    pub fn current(&self) -> Option<Arc<ServiceHandle>> {
        self.session.lock().handle.clone()
    }
}
