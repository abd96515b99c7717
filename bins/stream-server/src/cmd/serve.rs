use std::sync::Arc;
use std::time::Duration;

use crate::config::ServeArgs;
use crate::error::ServerError;
use stream_engine::config::StreamConfig;
use stream_engine::{LogManager, StreamProcessor};
use stream_storage_memory::{MemCheckpointStore, MemLogStore, MemoryStoreConfig};

/// Upper bound of the final drain when `--drain` is set.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3600);

fn memory_config(value: Option<&toml::Value>) -> Result<MemoryStoreConfig, ServerError> {
    let Some(value) = value else {
        return Ok(MemoryStoreConfig::default());
    };
    let json = serde_json::to_string(value)
        .map_err(|e| ServerError::Config { context: "storage", detail: e.to_string() })?;
    serde_json::from_str(&json).map_err(|e| ServerError::Config { context: "storage", detail: e.to_string() })
}

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("stream-server starting");

    let config = StreamConfig::load(&args.config)?;
    tracing::info!(config = %args.config, "loaded config");
    if config.computations.is_empty() {
        return Err(ServerError::Config { context: "computations", detail: "no [[computations]] configured".into() });
    }

    let settings = config.settings()?;
    let topology = config.topology()?;

    let storage = memory_config(config.storage.as_ref())?;
    tracing::info!(max_records = storage.max_records, "using memory storage");
    let manager = LogManager::new(
        Arc::new(MemLogStore::with_config(&storage)),
        Arc::new(MemCheckpointStore::new()),
    );

    let computations: Vec<String> = topology.computations().into_iter().map(String::from).collect();
    let mut processor = StreamProcessor::new(manager.clone(), topology, settings);
    processor.start()?;

    if args.drain {
        tokio::select! {
            drained = processor.drain_and_stop(DRAIN_TIMEOUT) => {
                tracing::info!(drained, "topology drained");
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("received ctrl-c, shutting down");
            }
        }
    } else {
        let mut report = tokio::time::interval(Duration::from_secs(args.report_interval.max(1)));
        report.tick().await;
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    tracing::info!("received ctrl-c, shutting down");
                    break;
                }
                _ = report.tick() => {
                    for computation in &computations {
                        match processor.get_latency(computation) {
                            Ok(latency) => tracing::info!(
                                computation = %computation,
                                lag = latency.lag.lag,
                                latency_ms = latency.latency_ms,
                                "progress"
                            ),
                            Err(e) => tracing::warn!(computation = %computation, error = %e, "latency unavailable"),
                        }
                    }
                    if processor.is_terminated() {
                        tracing::info!("every runner stopped");
                        break;
                    }
                }
            }
        }
    }

    processor.shutdown().await;
    manager.close();

    let faults = processor.faults();
    for fault in &faults {
        match serde_json::to_string(fault) {
            Ok(json) => tracing::error!(fault = %json, "computation failed"),
            Err(e) => tracing::error!(computation = %fault.computation, error = %e, "computation failed"),
        }
    }
    tracing::info!(low_watermark = processor.get_low_watermark(), "stream-server stopped");
    if faults.is_empty() { Ok(()) } else { Err(ServerError::Faulted(faults.len())) }
}
