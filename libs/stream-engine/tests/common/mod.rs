#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use stream_api::{Codec, Record, RecordCodec};
use stream_engine::LogManager;
use stream_storage_memory::{MemCheckpointStore, MemLogStore};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

pub fn memory_manager() -> LogManager {
    memory_manager_with_store().0
}

/// Manager plus direct access to its log store, to write bytes no codec
/// would produce.
pub fn memory_manager_with_store() -> (LogManager, Arc<MemLogStore>) {
    let logs = Arc::new(MemLogStore::new());
    let manager = LogManager::new(logs.clone(), Arc::new(MemCheckpointStore::new()));
    (manager, logs)
}

pub fn codec() -> Arc<dyn Codec<Record>> {
    Arc::new(RecordCodec)
}

pub async fn wait_for_condition<F>(timeout: Duration, interval: Duration, f: F)
where
    F: Fn() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        tokio::time::sleep(interval).await;
    }
    panic!("condition not met within {timeout:?}");
}
