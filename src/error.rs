//! 注册表统一错误类型。
use std::error::Error as StdError;

use thiserror::Error;

use crate::filter::QueryKey;
use crate::service::ServiceId;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Materialization failed, or the handle was already invalidated.
    #[error("service {id} is unavailable")]
    Unavailable {
        id: ServiceId,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },
    #[error("no service matches {key}")]
    NoService { key: QueryKey },
    #[error("service {id} is not a {expected}")]
    TypeMismatch { id: ServiceId, expected: &'static str },
    #[error("watcher `{watcher}` faulted: {message}")]
    WatcherFault { watcher: &'static str, message: String },
    #[error("invalid filter `{filter}` at {position}: {reason}")]
    InvalidFilter {
        filter: String,
        position: usize,
        reason: &'static str,
    },
    #[error("config: {0}")]
    Config(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    pub(crate) fn invalidated(id: &ServiceId) -> Self {
        RegistryError::Unavailable {
            id: id.clone(),
            source: None,
        }
    }

    pub(crate) fn materialize(id: &ServiceId, err: anyhow::Error) -> Self {
        RegistryError::Unavailable {
            id: id.clone(),
            source: Some(err.into()),
        }
    }

    /// 可重试：调用方稍后再次 `acquire()` 可能成功。
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            RegistryError::Unavailable { .. } | RegistryError::NoService { .. }
        )
    }
}

pub type Result<T = ()> = std::result::Result<T, RegistryError>;
