use std::sync::Arc;

use sha2::{Digest, Sha256};

use stream_api::StreamError;
use stream_api::log::{LogOffset, partition_for_key};
use stream_api::storage::{IdentityEntry, IdentityStore};

use crate::appender::LogAppender;

/// Derives the logical identity of a message from its key and value.
pub type IdentityExtractor<M> = Arc<dyn Fn(&str, &M) -> String + Send + Sync>;

/// Appender suppressing duplicate logical appends.
///
/// An append whose identity was already appended to this log with the same
/// encoded payload returns the recorded offset and writes nothing. The
/// lookup and the append run under the identity's lock in the store.
pub struct IdempotentAppender<M> {
    inner: LogAppender<M>,
    identities: Arc<dyn IdentityStore>,
    extractor: IdentityExtractor<M>,
}

impl<M: 'static> IdempotentAppender<M> {
    /// Identity defaults to the record key.
    pub fn new(inner: LogAppender<M>, identities: Arc<dyn IdentityStore>) -> Self {
        Self {
            inner,
            identities,
            extractor: Arc::new(|key: &str, _: &M| key.to_string()),
        }
    }

    pub fn with_extractor(mut self, extractor: IdentityExtractor<M>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn append(&self, key: &str, message: &M) -> Result<LogOffset, StreamError> {
        let bytes = self.inner.codec().encode(message)?;
        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        let identity = (self.extractor)(key, message);
        let partition = partition_for_key(key, self.inner.size());

        let mut appended = false;
        let entry = self.identities.upsert_with(&identity, &mut |previous| {
            match previous {
                Some(prev) if prev.digest == digest && prev.offset.partition().name() == self.inner.name() => {
                    Ok(prev.clone())
                }
                _ => {
                    let offset = self.inner.append_bytes(partition, bytes.clone())?;
                    appended = true;
                    Ok(IdentityEntry { offset, digest })
                }
            }
        })?;

        if appended {
            tracing::trace!(identity = %identity, offset = %entry.offset, "appended");
        } else {
            tracing::debug!(identity = %identity, offset = %entry.offset, "duplicate append suppressed");
        }
        Ok(entry.offset)
    }

    pub fn inner(&self) -> &LogAppender<M> {
        &self.inner
    }

    pub fn into_inner(self) -> LogAppender<M> {
        self.inner
    }
}
