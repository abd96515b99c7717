use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use stream_api::log::Latency;
use stream_api::{Record, Watermark};

use crate::error::EngineError;
use crate::manager::LogManager;
use crate::runner::{Fault, Runner, RunnerStatus};
use crate::settings::Settings;
use crate::topology::Topology;

/// Interval between two checks while waiting on runners.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Join handle and status of a spawned runner.
struct RunnerSlot {
    computation: String,
    id: String,
    handle: Option<tokio::task::JoinHandle<()>>,
    status: Arc<RunnerStatus>,
}

/// Runs a topology: creates its streams, spawns `concurrency` runners per
/// computation, drains and stops them. A computation with a concurrency of
/// 0 is registered, its streams exist, but nothing consumes them.
pub struct StreamProcessor {
    manager: LogManager,
    topology: Topology,
    settings: Settings,
    runners: Vec<RunnerSlot>,
    faults: Arc<Mutex<Vec<Fault>>>,
    shutdown_tx: watch::Sender<bool>,
    started: bool,
}

impl std::fmt::Debug for StreamProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("topology", &self.topology)
            .field("settings", &self.settings)
            .field("runners", &self.runners.iter().map(|r| &r.id).collect::<Vec<_>>())
            .field("started", &self.started)
            .finish()
    }
}

impl StreamProcessor {
    pub fn new(manager: LogManager, topology: Topology, settings: Settings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            manager,
            topology,
            settings,
            runners: Vec::new(),
            faults: Arc::new(Mutex::new(Vec::new())),
            shutdown_tx,
            started: false,
        }
    }

    pub fn manager(&self) -> &LogManager {
        &self.manager
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Create missing streams and spawn the runners.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.started {
            return Err(EngineError::Config("stream processor already started".into()));
        }
        self.started = true;

        let mut streams: Vec<&str> = self.topology.streams().into_iter().collect();
        for computation in self.topology.computations() {
            if let Some(stream) = self.settings.error_stream(computation) {
                streams.push(stream);
            }
        }
        for stream in streams {
            let partitions = self.settings.partitions(stream);
            self.manager
                .create_if_not_exists(stream, partitions)
                .map_err(|e| EngineError::from(e).with_context(format!("stream '{stream}'")))?;
        }

        for computation in self.topology.computations() {
            let ctx = format!("computation '{computation}'");
            let concurrency = self.settings.concurrency(computation);
            if concurrency == 0 {
                tracing::info!(computation = %computation, "registered without runner");
                continue;
            }
            for index in 0..concurrency {
                let (runner, status) = Runner::create(
                    &self.manager,
                    &self.topology,
                    &self.settings,
                    computation,
                    index,
                    self.faults.clone(),
                    self.shutdown_tx.subscribe(),
                )
                .map_err(|e| e.with_context(&ctx))?;
                let handle = tokio::spawn(runner.run());
                self.runners.push(RunnerSlot {
                    computation: computation.to_string(),
                    id: format!("{computation}-{index}"),
                    handle: Some(handle),
                    status,
                });
            }
            tracing::info!(computation = %computation, concurrency, "spawned runners");
        }
        Ok(())
    }

    /// Wait until every input partition is owned by a runner.
    pub async fn wait_for_assignments(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.assignments_complete() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    /// Computations with at least one runner.
    fn running_computations(&self) -> Vec<&str> {
        self.topology
            .computations()
            .into_iter()
            .filter(|c| self.runners_of(c).next().is_some())
            .collect()
    }

    fn assignments_complete(&self) -> bool {
        self.running_computations().into_iter().all(|computation| {
            let Some(mapping) = self.topology.metadata(computation) else {
                return false;
            };
            let expected: u32 = mapping
                .input_streams()
                .iter()
                .map(|s| self.manager.size(s).unwrap_or(0))
                .sum();
            let assigned: usize = self
                .runners_of(computation)
                .map(|r| r.status.assigned().len())
                .sum();
            assigned == expected as usize
        })
    }

    /// Wait until sources are done and every input is fully consumed, then
    /// shut down. Returns `false` when the timeout expired first, the
    /// processor is shut down anyway.
    pub async fn drain_and_stop(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stable = 0;
        let drained = loop {
            // Two consecutive drained checks, a runner may be between a
            // read and its checkpoint.
            if self.is_drained() {
                stable += 1;
                if stable >= 2 {
                    break true;
                }
            } else {
                stable = 0;
            }
            if Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        };
        if !drained {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "drain timed out, stopping anyway");
        }
        self.shutdown().await;
        drained
    }

    fn is_drained(&self) -> bool {
        let sources_done = self
            .runners
            .iter()
            .filter(|r| self.topology.is_source(&r.computation))
            .all(|r| r.status.is_terminated());
        if !sources_done {
            return false;
        }
        self.running_computations().into_iter().all(|computation| {
            let group = self.settings.consumer_group(computation);
            let Some(mapping) = self.topology.metadata(computation) else {
                return false;
            };
            mapping.input_streams().into_iter().all(|stream| {
                self.manager
                    .get_lag(stream, group)
                    .is_ok_and(|lag| lag.lag == 0)
            })
        })
    }

    /// Stop every runner: no new read, in-flight callbacks finish, then
    /// each computation is destroyed.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for slot in &mut self.runners {
            if let Some(handle) = slot.handle.take() {
                if let Err(e) = handle.await {
                    tracing::error!(runner = %slot.id, error = %e, "runner task failed");
                }
            }
        }
        tracing::info!("stream processor shut down");
    }

    fn runners_of<'a>(&'a self, computation: &'a str) -> impl Iterator<Item = &'a RunnerSlot> + 'a {
        self.runners.iter().filter(move |r| r.computation == computation)
    }

    /// Lowest watermark published by any runner, 0 when none did.
    pub fn get_low_watermark(&self) -> i64 {
        min_watermark(self.runners.iter())
    }

    pub fn get_low_watermark_of(&self, computation: &str) -> i64 {
        min_watermark(self.runners_of(computation))
    }

    /// Whether every record up to `timestamp` went through the topology.
    pub fn is_done(&self, timestamp: i64) -> bool {
        let low = self.get_low_watermark();
        low > 0 && Watermark::of_value(low).is_done(timestamp)
    }

    /// Latency of a computation over all of its input streams.
    pub fn get_latency(&self, computation: &str) -> Result<Latency, EngineError> {
        let mapping = self
            .topology
            .metadata(computation)
            .ok_or_else(|| EngineError::Topology(format!("unknown computation '{computation}'")))?;
        let group = self.settings.consumer_group(computation);
        let mut latencies = Vec::new();
        for stream in mapping.input_streams() {
            let codec = self.settings.codec(stream);
            latencies.push(self.manager.get_latency(
                stream,
                group,
                codec.as_ref(),
                |r: &Record| Watermark::of_value(r.watermark()).timestamp(),
                |r: &Record| r.key().to_string(),
            )?);
        }
        Ok(Latency::of(&latencies))
    }

    pub fn faults(&self) -> Vec<Fault> {
        match self.faults.lock() {
            Ok(faults) => faults.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Every runner has stopped, trivially true when none was spawned.
    pub fn is_terminated(&self) -> bool {
        self.started && self.runners.iter().all(|r| r.status.is_terminated())
    }
}

impl Drop for StreamProcessor {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn min_watermark<'a>(runners: impl Iterator<Item = &'a RunnerSlot>) -> i64 {
    runners
        .map(|r| r.status.low_watermark())
        .filter(|wm| *wm > 0)
        .min()
        .unwrap_or(0)
}
