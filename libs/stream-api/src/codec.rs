use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CodecError;
use crate::record::{Record, RecordFlags};
use crate::watermark::Watermark;

/// Current version byte of the binary record layout.
pub const RECORD_WIRE_VERSION: u8 = 1;

/// Fixed header: version, flags, watermark, key length.
const HEADER_LEN: usize = 1 + 1 + 8 + 4;

/// Encode/decode of a typed message to/from the raw bytes stored in a log.
///
/// `decode(encode(v)) == v` for every value. Malformed input is reported as a
/// `CodecError`, never a panic.
pub trait Codec<M>: Send + Sync {
    fn name(&self) -> &str;

    fn encode(&self, message: &M) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<M, CodecError>;
}

/// Identity codec over raw byte payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl Codec<Vec<u8>> for RawCodec {
    fn name(&self) -> &str {
        "raw"
    }

    fn encode(&self, message: &Vec<u8>) -> Result<Vec<u8>, CodecError> {
        Ok(message.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }
}

/// Binary codec for [`Record`].
///
/// Layout (big-endian):
/// `u8 version | u8 flags | i64 watermark | u32 key_len | key | u32 payload_len | payload`
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordCodec;

impl Codec<Record> for RecordCodec {
    fn name(&self) -> &str {
        "record"
    }

    fn encode(&self, record: &Record) -> Result<Vec<u8>, CodecError> {
        let key = record.key().as_bytes();
        let data = record.data();
        let key_len = u32::try_from(key.len())
            .map_err(|_| CodecError::Invalid(format!("key too large: {} bytes", key.len())))?;
        let data_len = u32::try_from(data.len())
            .map_err(|_| CodecError::Invalid(format!("payload too large: {} bytes", data.len())))?;

        let mut buf = Vec::with_capacity(HEADER_LEN + key.len() + 4 + data.len());
        buf.push(RECORD_WIRE_VERSION);
        buf.push(record.flags().bits());
        buf.extend_from_slice(&record.watermark().to_be_bytes());
        buf.extend_from_slice(&key_len.to_be_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&data_len.to_be_bytes());
        buf.extend_from_slice(data);
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Record, CodecError> {
        let mut reader = WireReader { buf: bytes, pos: 0 };

        let version = reader.take_u8("version")?;
        if version != RECORD_WIRE_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let flags = RecordFlags::from_bits(reader.take_u8("flags")?);
        let watermark = i64::from_be_bytes(reader.take_array("watermark")?);
        let key_len = u32::from_be_bytes(reader.take_array("key length")?) as usize;
        let key = String::from_utf8(reader.take(key_len, "key")?.to_vec())?;
        let data_len = u32::from_be_bytes(reader.take_array("payload length")?) as usize;
        let data = reader.take(data_len, "payload")?.to_vec();

        let rest = bytes.len() - reader.pos;
        if rest > 0 {
            return Err(CodecError::TrailingBytes(rest));
        }
        Ok(Record::new(key, data, Watermark::of_value(watermark), flags))
    }
}

struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(len).ok_or(CodecError::Truncated(what))?;
        if end > self.buf.len() {
            return Err(CodecError::Truncated(what));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self, what: &'static str) -> Result<u8, CodecError> {
        Ok(self.take(1, what)?[0])
    }

    fn take_array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }
}

/// JSON codec for any serde type.
pub struct JsonCodec<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> JsonCodec<M> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<M> Default for JsonCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> std::fmt::Debug for JsonCodec<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<M: Serialize + DeserializeOwned> Codec<M> for JsonCodec<M> {
    fn name(&self) -> &str {
        "json"
    }

    fn encode(&self, message: &M) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(message)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<M, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Resolve a configured codec name to a record codec.
pub fn record_codec(name: &str) -> Option<Arc<dyn Codec<Record>>> {
    match name {
        "record" => Some(Arc::new(RecordCodec)),
        "json" => Some(Arc::new(JsonCodec::<Record>::new())),
        _ => None,
    }
}
