//! 代数推进策略：周期性推进代数并回收上一代的空闲句柄。
use std::time::Duration;

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::registry::ServiceRegistry;

pub struct FlushScheduler {
    registry: ServiceRegistry,
    period: Duration,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl FlushScheduler {
    pub fn new(registry: ServiceRegistry) -> Self {
        let period = registry.config().flush_interval();
        let (shutdown, _) = watch::channel(false);
        Self {
            registry,
            period,
            shutdown,
            task: None,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period.max(Duration::from_millis(1));
        self
    }

    /// One step of the policy: advance the generation, then flush the one just closed.
    /// A handle released during generation `g` and untouched since is reclaimed here.
    pub fn tick(&self) -> usize {
        step(&self.registry)
    }

    /// Spawns the periodic task on the current tokio runtime. Calling twice is a no-op.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        self.shutdown.send_replace(false);
        let mut rx = self.shutdown.subscribe();
        let registry = self.registry.clone();
        let period = self.period;
        self.task = Some(tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = interval.tick() => {
                        step(&registry);
                    }
                }
            }
            tracing::debug!("flush scheduler stopped");
        }));
    }

    /// Signals the task and waits for it to finish.
    pub async fn stop(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_started(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

fn step(registry: &ServiceRegistry) -> usize {
    let closed = registry.generation();
    let next = registry.advance_generation();
    let evicted = registry.flush(closed);
    tracing::trace!(generation = next, evicted, "flush tick");
    evicted
}
