use std::{path::Path, time::Duration};

use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 调度器推进代数并回收上一代空闲句柄的周期。
    pub flush_interval_ms: u64,
    /// `ChannelWatcher` 事件队列容量。
    pub event_queue_capacity: usize,
}

pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_EVENT_QUEUE: usize = 1024;

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            event_queue_capacity: DEFAULT_EVENT_QUEUE,
        }
    }
}

impl RegistryConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn flush_interval(&self) -> Duration {
        // 0 会让 interval 恐慌，至少 1ms
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub(crate) fn queue_capacity(&self) -> usize {
        self.event_queue_capacity.max(1)
    }
}
