use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the tenant's WAL once more than `threshold` events were appended
/// since the last compaction. Returns whether it compacted.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends <= threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!(tenant = engine.slug(), appends, "compacted tenant WAL");
            true
        }
        Err(e) => {
            warn!(tenant = engine.slug(), error = %e, "WAL compaction failed");
            false
        }
    }
}

/// Background task: one per tenant, for the life of the process.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::provider::ProviderRegistry;
    use rust_decimal_macros::dec;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotledger_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(
            path,
            "compactor",
            Arc::new(ProviderRegistry::with_defaults()),
            Duration::from_secs(1),
        )
        .unwrap();

        let sid = Ulid::new();
        engine
            .create_service(NewService {
                id: sid,
                title: "Kayak".into(),
                category: Some("rental".into()),
                price: dec!(800),
                available: true,
            })
            .await
            .unwrap();
        assert!(!compact_if_due(&engine, 10).await);

        for i in 0..12 {
            engine
                .update_service(
                    sid,
                    ServicePatch {
                        price: Some(dec!(800) + rust_decimal::Decimal::from(i)),
                        ..ServicePatch::default()
                    },
                )
                .await
                .unwrap();
        }
        assert!(compact_if_due(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.service_by_id(sid).await.unwrap().price, dec!(811));
    }
}
