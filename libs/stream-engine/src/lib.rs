pub mod appender;
pub mod computations;
pub mod config;
pub mod context;
pub mod error;
mod group;
pub mod identity;
pub mod manager;
pub mod processor;
mod runner;
pub mod settings;
pub mod tailer;
pub mod topology;

pub use appender::LogAppender;
pub use context::ComputationContextImpl;
pub use error::EngineError;
pub use identity::{IdempotentAppender, IdentityExtractor};
pub use manager::LogManager;
pub use processor::StreamProcessor;
pub use runner::Fault;
pub use settings::{BatchPolicy, RetryPolicy, Settings, TimerSpec};
pub use tailer::LogTailer;
pub use topology::{ComputationMapping, Topology, TopologyBuilder};
