pub mod codec;
pub mod computation;
pub mod error;
pub mod log;
pub mod record;
pub mod storage;
pub mod watermark;

pub use codec::{Codec, JsonCodec, RawCodec, RecordCodec};
pub use computation::{
    Computation, ComputationContext, ComputationMetadata, ComputationState, ComputationSupplier,
    NoopRebalanceListener, RebalanceListener,
};
pub use error::{CodecError, ComputationError, FailureKind, StreamError};
pub use log::{Latency, LogLag, LogOffset, LogPartition, LogRecord};
pub use record::{Record, RecordFlags};
pub use watermark::Watermark;

/// Wall clock in epoch milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
