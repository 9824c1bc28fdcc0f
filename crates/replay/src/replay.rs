//! Drive a recorded event log through a fresh engine and summarize the cache.

use chrono::{DateTime, Utc};
use miette::Result;
use pipedash_cache::{CacheStats, CacheStore};
use pipedash_events::{EventBus, run_bridge};
use pipedash_sync::{CacheSink, RecordingSink, SyncConfig, SyncEngine};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Final state after a replay
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySummary {
    /// Identifier of this run
    pub replay_id: Uuid,
    /// When the replay began
    pub started_at: DateTime<Utc>,
    /// Wire messages published to the engine
    pub published: usize,
    /// Lines skipped as undecodable
    pub malformed: usize,
    /// Event types the engine could not subscribe to
    pub unobserved: Vec<String>,
    /// Resync passes triggered by connection-status messages
    pub reconnect_passes: u64,
    /// Cache mutations issued, by operation
    pub operations: BTreeMap<&'static str, usize>,
    /// Store counters at the end of the replay
    pub stats: CacheStats,
    /// Keys holding a value, with whether each awaits refetch
    pub entries: BTreeMap<String, bool>,
}

/// Replay `reader` into a new store and return the resulting summary.
///
/// Batches still pending when the log ends are flushed by the engine's stop.
pub async fn replay<R>(
    reader: R,
    config: SyncConfig,
    replay_id: Uuid,
    cancel: CancellationToken,
) -> Result<ReplaySummary>
where
    R: AsyncBufRead + Unpin,
{
    let started_at = Utc::now();
    let store: CacheStore = CacheStore::with_options(config.store_options());
    let store_sink: Arc<dyn CacheSink> = Arc::new(store.clone());
    let recorder = Arc::new(RecordingSink::forwarding(store_sink));
    let engine = SyncEngine::new(recorder.clone(), config)?;

    let bus = EventBus::new();
    let registration = engine.start(&bus).await?;

    let bridge = run_bridge(reader, bus.clone(), cancel).await;
    engine.stop();
    bus.shutdown();
    let bridge = bridge?;

    tracing::info!(
        %replay_id,
        published = bridge.published,
        malformed = bridge.malformed,
        "Replay finished"
    );

    let mut operations = BTreeMap::new();
    for op in recorder.ops() {
        *operations.entry(op.name()).or_insert(0) += 1;
    }
    let entries = store
        .keys()
        .into_iter()
        .filter_map(|key| {
            let entry = store.get(&key)?;
            Some((key.to_string(), entry.is_invalidated()))
        })
        .collect();

    Ok(ReplaySummary {
        replay_id,
        started_at,
        published: bridge.published,
        malformed: bridge.malformed,
        unobserved: registration.failed,
        reconnect_passes: engine.reconnect().passes(),
        operations,
        stats: store.stats(),
        entries,
    })
}
