use stream_api::StreamError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("topology error: {0}")]
    Topology(String),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
}

impl EngineError {
    /// Add context to the error.
    ///
    /// For `Stream` variant, context is added to the inner `StreamError`.
    /// For other variants, context is prepended to the message.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            EngineError::Stream(e) => EngineError::Stream(e.with_context(ctx)),
            EngineError::Config(msg) => EngineError::Config(format!("{ctx}: {msg}")),
            EngineError::Topology(msg) => EngineError::Topology(format!("{ctx}: {msg}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_prepended_to_every_variant() {
        let err = EngineError::Config("bad retry".into()).with_context("computation 'FWD'");
        assert_eq!(err.to_string(), "config error: computation 'FWD': bad retry");

        let err = EngineError::Topology("cycle".into()).with_context("build");
        assert!(matches!(err, EngineError::Topology(ref msg) if msg == "build: cycle"));

        let err = EngineError::from(StreamError::Store("disk full".into())).with_context("stream 'in'");
        assert!(matches!(err, EngineError::Stream(StreamError::Store(ref msg)) if msg == "stream 'in': disk full"));
    }

    #[test]
    fn missing_config_file_is_a_config_error() {
        let err = crate::config::StreamConfig::load("/nonexistent/stream.toml").unwrap_err();
        assert!(matches!(err, EngineError::Config(ref msg) if msg.starts_with("/nonexistent/stream.toml")));
    }
}
