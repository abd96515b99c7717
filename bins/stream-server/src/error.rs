#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("{0}")]
    Engine(#[from] stream_engine::EngineError),

    #[error("{0} computation(s) failed")]
    Faulted(usize),

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}
