use std::fmt;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::watermark::Watermark;

/// Bit flags carried by a record. `DEFAULT` is the empty set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordFlags(u8);

impl RecordFlags {
    pub const DEFAULT: RecordFlags = RecordFlags(0);
    pub const COMMIT: RecordFlags = RecordFlags(1);
    pub const POISON_PILL: RecordFlags = RecordFlags(1 << 1);
    pub const EXTERNAL_VALUE: RecordFlags = RecordFlags(1 << 2);
    pub const TRACE: RecordFlags = RecordFlags(1 << 3);
    pub const USER1: RecordFlags = RecordFlags(1 << 6);
    pub const USER2: RecordFlags = RecordFlags(1 << 7);

    pub fn from_bits(bits: u8) -> Self {
        RecordFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: RecordFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: RecordFlags) -> Self {
        RecordFlags(self.0 | other.0)
    }
}

impl fmt::Debug for RecordFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordFlags({:#010b})", self.0)
    }
}

/// Immutable message envelope exchanged between producers, logs and computations.
///
/// The key selects the partition, the payload is opaque to the log layer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    key: String,
    watermark: i64,
    #[serde(default)]
    flags: RecordFlags,
    #[serde(with = "base64_payload")]
    data: Vec<u8>,
}

impl Record {
    /// Build a record stamped with the current time as watermark.
    pub fn of(key: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::new(key, data, Watermark::now(), RecordFlags::DEFAULT)
    }

    pub fn new(
        key: impl Into<String>,
        data: impl Into<Vec<u8>>,
        watermark: Watermark,
        flags: RecordFlags,
    ) -> Self {
        Self {
            key: key.into(),
            watermark: watermark.value(),
            flags,
            data: data.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn watermark(&self) -> i64 {
        self.watermark
    }

    pub fn flags(&self) -> RecordFlags {
        self.flags
    }

    pub fn has_flag(&self, flag: RecordFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Same key and payload under a different watermark.
    pub fn with_watermark(&self, watermark: Watermark) -> Self {
        Self {
            watermark: watermark.value(),
            ..self.clone()
        }
    }

    /// Same record with extra flags set.
    pub fn with_flags(&self, flags: RecordFlags) -> Self {
        Self {
            flags: self.flags.with(flags),
            ..self.clone()
        }
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("key", &self.key)
            .field("watermark", &Watermark::of_value(self.watermark))
            .field("flags", &self.flags)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Payload as base64 in human-readable encodings.
mod base64_payload {
    use super::*;

    pub fn serialize<S: serde::Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine() {
        let flags = RecordFlags::DEFAULT.with(RecordFlags::COMMIT).with(RecordFlags::USER2);
        assert!(flags.contains(RecordFlags::COMMIT));
        assert!(flags.contains(RecordFlags::USER2));
        assert!(!flags.contains(RecordFlags::POISON_PILL));
        assert_eq!(RecordFlags::from_bits(flags.bits()), flags);
    }

    #[test]
    fn derived_records_leave_the_original_untouched() {
        let original = Record::new("k", b"v".to_vec(), Watermark::of_timestamp(10, 0), RecordFlags::DEFAULT);
        let flagged = original.with_flags(RecordFlags::TRACE);
        let later = original.with_watermark(Watermark::of_timestamp(20, 0));

        assert_eq!(original.flags(), RecordFlags::DEFAULT);
        assert!(flagged.has_flag(RecordFlags::TRACE));
        assert_eq!(Watermark::of_value(later.watermark()).timestamp(), 20);
        assert_eq!(later.data(), original.data());
    }

    #[test]
    fn json_form_carries_payload_as_base64() {
        let record = Record::new("doc-1", vec![0u8, 159, 255], Watermark::of_timestamp(5, 1), RecordFlags::COMMIT);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["data"], "AJ//");
        assert_eq!(json["flags"], 1);
        let back: Record = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
