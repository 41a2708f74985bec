#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use mmg_service_registry::prelude::*;
use mmg_service_registry::service::{GenerationClock, MemberRecord};

/// Provider that counts materializations/releases and can be told to fail.
#[derive(Default)]
pub struct Counting {
    pub name: &'static str,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub fail: AtomicBool,
    pub delay_ms: u64,
}

impl Counting {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            ..Default::default()
        })
    }
    pub fn slow(name: &'static str, delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            name,
            delay_ms,
            ..Default::default()
        })
    }
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl ServiceProvider for Counting {
    fn acquire(&self) -> anyhow::Result<Instance> {
        if self.delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.delay_ms));
        }
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("{} refused", self.name);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.name.to_string()))
    }
    fn release(&self, _instance: Instance) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn member(id: &'static str, rank: i64, provider: Arc<Counting>) -> MemberSpec {
    MemberSpec::new(id, provider).rank(rank)
}

pub fn record(id: &'static str, seq: u64, rank: i64, provider: Arc<Counting>) -> MemberRecord {
    MemberRecord {
        id: ServiceId::new(id),
        seq,
        rank,
        attributes: Attributes::new(),
        provider,
    }
}

pub fn handle(id: &'static str, provider: Arc<Counting>, clock: &GenerationClock) -> Arc<ServiceHandle> {
    Arc::new(ServiceHandle::new(&record(id, 0, 0, provider), clock.clone()))
}

pub fn name_of(instance: &Instance) -> String {
    instance
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_default()
}

pub fn ids(handles: impl IntoIterator<Item = Arc<ServiceHandle>>) -> Vec<String> {
    handles.into_iter().map(|h| h.id().to_string()).collect()
}

/// Watcher that records every callback as text: `+id`, `~id`, `-id`.
#[derive(Default)]
pub struct Recorder {
    pub log: parking_lot::Mutex<Vec<String>>,
    pub decline: Vec<&'static str>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
    pub fn declining(ids: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            decline: ids,
            ..Default::default()
        })
    }
    pub fn events(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

pub struct RecorderExport {
    owner: Arc<Recorder>,
    id: String,
}

impl Export for RecorderExport {
    fn on_updated(&mut self, _attributes: &Attributes) {
        self.owner.log.lock().push(format!("~{}", self.id));
    }
    fn on_removed(&mut self) {
        self.owner.log.lock().push(format!("-{}", self.id));
    }
}

/// `ImportWatcher` for `Arc<Recorder>` so exports can point back at the shared log.
pub struct RecordingWatcher(pub Arc<Recorder>);

impl ImportWatcher for RecordingWatcher {
    fn on_added(&self, handle: &Arc<ServiceHandle>) -> Option<Box<dyn Export>> {
        let id = handle.id().to_string();
        if self.0.decline.contains(&id.as_str()) {
            return None;
        }
        self.0.log.lock().push(format!("+{id}"));
        Some(Box::new(RecorderExport {
            owner: self.0.clone(),
            id,
        }))
    }
}

pub fn recording(rec: &Arc<Recorder>) -> Arc<dyn ImportWatcher> {
    Arc::new(RecordingWatcher(rec.clone()))
}
