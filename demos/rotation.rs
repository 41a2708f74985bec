//! 示例：两个存储后端按排名轮换；单句柄在会话边界切换，调度器回收空闲实例。
use std::{sync::Arc, time::Duration};

use mmg_service_registry::prelude::*;

struct Backend {
    name: &'static str,
}

impl ServiceProvider for Backend {
    fn acquire(&self) -> anyhow::Result<Instance> {
        tracing::info!(backend = self.name, "connecting");
        Ok(Arc::new(format!("conn:{}", self.name)))
    }

    fn release(&self, _instance: Instance) {
        tracing::info!(backend = self.name, "closing idle connection");
    }
}

fn store(id: &'static str, rank: i64) -> MemberSpec {
    MemberSpec::new(id, Arc::new(Backend { name: id }))
        .rank(rank)
        .attr("role", "store")
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let cfg = RegistryConfig::from_json_str(r#"{ "flush_interval_ms": 100 }"#)?;
    let registry = ServiceRegistry::new(cfg);
    let key = QueryKey::new(None, Some(Filter::eq("role", "store")));

    // 外部观察：事件流
    let mut events = registry.subscribe(&key);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let printer = tokio::spawn(async move {
        while let Some(ev) = events.recv_or_shutdown(&shutdown_rx).await {
            tracing::info!(event = ?ev, "membership");
        }
    });

    registry.member_appeared(store("primary", 5));
    registry.member_appeared(store("replica", 3));

    let single = ConcurrentSingleHandle::new(Arc::new(registry.clone()), key.clone());
    let conn = single.acquire()?;
    tracing::info!(conn = ?conn.downcast_ref::<String>(), "session opened");

    // 会话进行中提升 replica：当前会话不受影响
    let mut attrs = Attributes::new();
    attrs.insert("role".into(), "store".into());
    registry.member_updated(&ServiceId::new("replica"), 9, attrs);
    let still = single.with(|i| i.downcast_ref::<String>().cloned())?;
    tracing::info!(conn = ?still, "mid-session");
    single.release();

    let next = single.with(|i| i.downcast_ref::<String>().cloned())?;
    tracing::info!(conn = ?next, "next session");

    let mut scheduler = FlushScheduler::new(registry.clone());
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(350)).await;
    scheduler.stop().await;

    registry.member_disappeared(&ServiceId::new("primary"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown_tx.send_replace(true);
    printer.await?;
    Ok(())
}
