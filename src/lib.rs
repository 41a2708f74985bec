pub mod best;
pub mod collection;
pub mod config;
pub mod error;
pub mod filter;
pub mod handle;
pub mod iter;
pub mod provider;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod single;
pub mod watch;

pub mod prelude {
    pub use crate::best::ConcurrentBestWatcher;
    pub use crate::config::RegistryConfig;
    pub use crate::error::{RegistryError, Result};
    pub use crate::filter::{Filter, QueryKey};
    pub use crate::handle::{Lease, ServiceHandle};
    pub use crate::iter::{Chained, ChainedRegistry, Imports, ServiceSource};
    pub use crate::registry::{DiscoverySource, Feed, ServiceRegistry};
    pub use crate::scheduler::FlushScheduler;
    pub use crate::service::{provider_fn, Attributes, Instance, MemberSpec, ServiceId, ServiceProvider};
    pub use crate::single::ConcurrentSingleHandle;
    pub use crate::watch::{ChannelWatcher, EventStream, Export, ImportWatcher, WatchEvent};
}
