mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{POLL_INTERVAL, READ_TIMEOUT, WAIT_TIMEOUT, codec, memory_manager, wait_for_condition};
use stream_api::{
    Computation, ComputationContext, ComputationError, ComputationMetadata, LogLag, LogPartition,
    RebalanceListener, Record, StreamError,
};
use stream_engine::{LogManager, Settings, StreamProcessor, Topology};

/// Buffers read values and flushes them when partitions are revoked,
/// remembering the committed lag seen at that moment.
struct FlushingListener {
    manager: LogManager,
    buffered: Arc<Mutex<Vec<String>>>,
    flushed: Arc<Mutex<Vec<String>>>,
    revoked: Mutex<Vec<(LogPartition, LogLag)>>,
    assigned: Mutex<Vec<LogPartition>>,
}

impl FlushingListener {
    fn new(manager: &LogManager) -> Arc<Self> {
        Arc::new(Self {
            manager: manager.clone(),
            buffered: Arc::default(),
            flushed: Arc::default(),
            revoked: Mutex::default(),
            assigned: Mutex::default(),
        })
    }
}

impl RebalanceListener for FlushingListener {
    fn on_partitions_revoked(&self, partitions: &[LogPartition]) -> Result<(), StreamError> {
        let lags = self.manager.get_lag_per_partition("s", "g")?;
        let mut revoked = self.revoked.lock().unwrap();
        for p in partitions {
            revoked.push((p.clone(), lags[p.partition() as usize]));
        }
        let mut buffered = self.buffered.lock().unwrap();
        self.flushed.lock().unwrap().append(&mut buffered);
        Ok(())
    }

    fn on_partitions_assigned(&self, partitions: &[LogPartition]) {
        self.assigned.lock().unwrap().extend(partitions.iter().cloned());
    }
}

#[tokio::test]
async fn revoked_partition_is_flushed_and_committed_before_handover() {
    let manager = memory_manager();
    manager.create_if_not_exists("s", 2).unwrap();
    let appender = manager.get_appender("s", codec()).unwrap();
    for i in 0..3 {
        appender.append_to(0, &Record::of("a", format!("a{i}"))).unwrap();
        appender.append_to(1, &Record::of("b", format!("b{i}"))).unwrap();
    }
    let p0 = LogPartition::of("s", 0);
    let p1 = LogPartition::of("s", 1);

    let first_listener = FlushingListener::new(&manager);
    let mut first = manager.subscribe("g", &["s"], first_listener.clone(), codec()).unwrap();
    for _ in 0..2 {
        let record = first.read(READ_TIMEOUT).await.unwrap().unwrap();
        let value = String::from_utf8(record.message().data().to_vec()).unwrap();
        first_listener.buffered.lock().unwrap().push(value);
    }
    assert_eq!(first.assignments(), &[p0.clone(), p1.clone()]);

    let second_listener = FlushingListener::new(&manager);
    let mut second = manager.subscribe("g", &["s"], second_listener.clone(), codec()).unwrap();
    // The partition is still owned by the first member.
    assert!(second.read(Duration::from_millis(50)).await.unwrap().is_none());
    assert!(second.assignments().is_empty());

    // Next read of the first member hands s-01 over.
    first.read(READ_TIMEOUT).await.unwrap().unwrap();
    assert_eq!(first.assignments(), &[p0.clone()]);
    assert_eq!(*first_listener.revoked.lock().unwrap(), vec![(p1.clone(), LogLag::of(3))]);
    assert_eq!(*first_listener.flushed.lock().unwrap(), vec!["a0", "b0"]);
    assert_eq!(manager.get_lag_per_partition("s", "g").unwrap()[1], LogLag::of_range(1, 3));

    let record = second.read(READ_TIMEOUT).await.unwrap().unwrap();
    assert_eq!(record.offset().partition(), &p1);
    assert_eq!(record.offset().offset(), 1);
    assert_eq!(*second_listener.assigned.lock().unwrap(), vec![p1]);
}

#[tokio::test]
async fn closing_a_member_gives_its_partitions_back() {
    let manager = memory_manager();
    manager.create_if_not_exists("s", 2).unwrap();
    let appender = manager.get_appender("s", codec()).unwrap();
    appender.append_to(0, &Record::of("a", "a0")).unwrap();

    let listener = FlushingListener::new(&manager);
    let mut first = manager.subscribe("g", &["s"], listener.clone(), codec()).unwrap();
    let mut second = manager.subscribe("g", &["s"], listener.clone(), codec()).unwrap();
    first.read(Duration::from_millis(50)).await.unwrap();
    second.read(Duration::from_millis(50)).await.unwrap();
    assert_eq!(first.assignments().len() + second.assignments().len(), 2);

    first.close();
    // Nothing was committed, the record of s-00 is read again.
    let record = second.read(READ_TIMEOUT).await.unwrap().unwrap();
    assert_eq!(record.message().data(), b"a0");
    assert_eq!(second.assignments().len(), 2);
}

/// Forwards records but never checkpoints, output stays buffered until a
/// rebalance flushes it.
struct Buffering {
    processed: Arc<AtomicUsize>,
}

impl Computation for Buffering {
    fn metadata(&self) -> ComputationMetadata {
        ComputationMetadata::with_counts("BUF", 1, 1)
    }

    fn init(&mut self, _ctx: &mut dyn ComputationContext) -> Result<(), ComputationError> {
        Ok(())
    }

    fn process_record(
        &mut self,
        ctx: &mut dyn ComputationContext,
        _input: &str,
        record: &Record,
    ) -> Result<(), ComputationError> {
        ctx.produce_record("o1", record.clone())?;
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn buffering_topology(processed: Arc<AtomicUsize>) -> Topology {
    Topology::builder()
        .add_computation(
            move || Box::new(Buffering { processed: processed.clone() }) as Box<dyn Computation>,
            ["i1:in", "o1:out"],
        )
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn joining_processor_flushes_and_commits_the_revoked_partition() {
    let manager = memory_manager();
    manager.create_if_not_exists("in", 2).unwrap();
    let input = manager.get_appender("in", codec()).unwrap();
    for i in 0..3 {
        input.append_to(0, &Record::of("a", format!("a{i}"))).unwrap();
        input.append_to(1, &Record::of("b", format!("b{i}"))).unwrap();
    }

    let processed = Arc::new(AtomicUsize::new(0));
    let settings = Settings::new(1, 2).with_read_timeout(Duration::from_millis(50));
    let out_end = || manager.get_lag("out", "reader").map(|l| l.upper).unwrap_or(0);

    let mut first = StreamProcessor::new(manager.clone(), buffering_topology(processed.clone()), settings.clone());
    first.start().unwrap();
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || processed.load(Ordering::SeqCst) == 6).await;
    assert_eq!(out_end(), 0);

    // The second member takes partition 1, the first one gives it up.
    let mut second = StreamProcessor::new(manager.clone(), buffering_topology(processed.clone()), settings);
    second.start().unwrap();
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        out_end() == 6
            && manager
                .get_lag_per_partition("in", "BUF")
                .is_ok_and(|lags| lags[0].lag == 3 && lags[1].lag == 0)
    })
    .await;
    let lags = manager.get_lag_per_partition("in", "BUF").unwrap();
    assert_eq!(lags, vec![LogLag::of_range(0, 3), LogLag::of_range(3, 3)]);

    // Leaving in reverse order only hands partitions back to the first member.
    second.shutdown().await;
    first.shutdown().await;
    assert_eq!(out_end(), 6);
    assert_eq!(processed.load(Ordering::SeqCst), 6);
}
