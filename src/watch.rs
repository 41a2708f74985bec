//! 观察者分发：成员增删改事件的外部观察接口，以及把事件转发到 tokio 队列的通道观察者。
use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use tokio::sync::{mpsc, watch};

use crate::{
    error::RegistryError,
    handle::ServiceHandle,
    service::{Attributes, Rank, ServiceId},
};

/// Observer of one collection. Called once per member as it enters the collection;
/// returning `None` declines to track that member.
pub trait ImportWatcher: Send + Sync {
    fn on_added(&self, handle: &Arc<ServiceHandle>) -> Option<Box<dyn Export>>;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Outward mirror of a single member, created by an [`ImportWatcher`].
pub trait Export: Send {
    fn on_updated(&mut self, attributes: &Attributes);
    fn on_removed(&mut self);

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// 观察者回调的隔离边界：恐慌被捕获、记录，不影响后续观察者与集合状态。
pub(crate) fn guard<T>(watcher: &'static str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => Some(v),
        Err(payload) => {
            let fault = RegistryError::WatcherFault {
                watcher,
                message: panic_message(payload.as_ref()),
            };
            tracing::error!(error = %fault, "watcher callback faulted; continuing dispatch");
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    Added {
        id: ServiceId,
        rank: Rank,
        attributes: Attributes,
    },
    Updated {
        id: ServiceId,
        attributes: Attributes,
    },
    Removed {
        id: ServiceId,
    },
}

impl WatchEvent {
    pub fn id(&self) -> &ServiceId {
        match self {
            WatchEvent::Added { id, .. }
            | WatchEvent::Updated { id, .. }
            | WatchEvent::Removed { id } => id,
        }
    }
}

/// Forwards every event into a bounded queue. Dispatch is synchronous, so a full queue
/// drops the event (logged) instead of blocking the collection.
pub struct ChannelWatcher {
    tx: mpsc::Sender<WatchEvent>,
}

impl ChannelWatcher {
    pub fn new(capacity: usize) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, EventStream { rx })
    }
}

fn forward(tx: &mpsc::Sender<WatchEvent>, ev: WatchEvent) {
    match tx.try_send(ev) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(ev)) => {
            tracing::warn!(service = %ev.id(), "watch queue full; dropping event");
        }
        // 接收端已关闭：静默丢弃
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

impl ImportWatcher for ChannelWatcher {
    fn on_added(&self, handle: &Arc<ServiceHandle>) -> Option<Box<dyn Export>> {
        if self.tx.is_closed() {
            return None;
        }
        forward(
            &self.tx,
            WatchEvent::Added {
                id: handle.id().clone(),
                rank: handle.rank(),
                attributes: handle.attributes(),
            },
        );
        Some(Box::new(ChannelExport {
            id: handle.id().clone(),
            tx: self.tx.clone(),
        }))
    }
}

struct ChannelExport {
    id: ServiceId,
    tx: mpsc::Sender<WatchEvent>,
}

impl Export for ChannelExport {
    fn on_updated(&mut self, attributes: &Attributes) {
        forward(
            &self.tx,
            WatchEvent::Updated {
                id: self.id.clone(),
                attributes: attributes.clone(),
            },
        );
    }
    fn on_removed(&mut self) {
        forward(&self.tx, WatchEvent::Removed { id: self.id.clone() });
    }
}

pub struct EventStream {
    rx: mpsc::Receiver<WatchEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
    /// Like [`recv`](Self::recv), but yields `None` once `shutdown` changes.
    pub async fn recv_or_shutdown(&mut self, shutdown: &watch::Receiver<bool>) -> Option<WatchEvent> {
        let mut sd = shutdown.clone();
        tokio::select! {
            _ = sd.changed() => None,
            ev = self.rx.recv() => ev,
        }
    }
    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }
}
