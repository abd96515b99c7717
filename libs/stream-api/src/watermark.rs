use std::fmt;

const SEQUENCE_MASK: i64 = 0x7FFF;

/// Monotonic time-ordering token packed into an `i64`.
///
/// Layout: `timestamp_ms << 16 | sequence << 1 | completed`. Comparing two
/// values compares timestamps first, then sequences, then completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Watermark(i64);

impl Watermark {
    pub const LOWEST: Watermark = Watermark(0);

    /// Largest sequence the 15 bits of the layout hold.
    pub const MAX_SEQUENCE: u16 = SEQUENCE_MASK as u16;

    /// Sequences above [`Self::MAX_SEQUENCE`] saturate, so a larger
    /// sequence never orders before a smaller one.
    pub fn of_timestamp(timestamp_ms: i64, sequence: u16) -> Self {
        let seq = i64::from(sequence.min(Self::MAX_SEQUENCE));
        Watermark((timestamp_ms << 16) | (seq << 1))
    }

    /// `None` when the sequence does not fit.
    pub fn try_of_timestamp(timestamp_ms: i64, sequence: u16) -> Option<Self> {
        (sequence <= Self::MAX_SEQUENCE).then(|| Self::of_timestamp(timestamp_ms, sequence))
    }

    pub fn of_value(value: i64) -> Self {
        Watermark(value)
    }

    /// Watermark stamped with the current wall clock time.
    pub fn now() -> Self {
        Self::of_timestamp(crate::now_ms(), 0)
    }

    pub fn completed(self) -> Self {
        Watermark(self.0 | 1)
    }

    pub fn value(self) -> i64 {
        self.0
    }

    pub fn timestamp(self) -> i64 {
        self.0 >> 16
    }

    pub fn sequence(self) -> u16 {
        ((self.0 >> 1) & SEQUENCE_MASK) as u16
    }

    pub fn is_completed(self) -> bool {
        self.0 & 1 == 1
    }

    /// True once everything up to `timestamp_ms` is known to be processed.
    pub fn is_done(self, timestamp_ms: i64) -> bool {
        Watermark::of_timestamp(timestamp_ms, 0).0 < self.0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wm{{ts: {}, seq: {}", self.timestamp(), self.sequence())?;
        if self.is_completed() {
            f.write_str(", completed")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_and_unpacks_fields() {
        let wm = Watermark::of_timestamp(1_700_000_000_123, 42);
        assert_eq!(wm.timestamp(), 1_700_000_000_123);
        assert_eq!(wm.sequence(), 42);
        assert!(!wm.is_completed());

        let done = wm.completed();
        assert!(done.is_completed());
        assert_eq!(done.timestamp(), wm.timestamp());
        assert_eq!(Watermark::of_value(done.value()), done);
    }

    #[test]
    fn ordering_follows_time_then_sequence_then_completion() {
        let a = Watermark::of_timestamp(100, 1);
        let b = Watermark::of_timestamp(100, 2);
        let c = Watermark::of_timestamp(101, 0);
        assert!(a < b && b < c);
        assert!(a < a.completed());
        assert!(Watermark::LOWEST < a);
    }

    #[test]
    fn oversized_sequence_saturates_instead_of_wrapping() {
        let wm = Watermark::of_timestamp(100, 40_000);
        assert_eq!(wm.sequence(), Watermark::MAX_SEQUENCE);
        assert_eq!(wm.timestamp(), 100);
        assert!(Watermark::of_timestamp(100, 7_232) < wm);
        assert!(wm < Watermark::of_timestamp(101, 0));

        assert_eq!(Watermark::try_of_timestamp(100, 40_000), None);
        assert_eq!(Watermark::try_of_timestamp(100, Watermark::MAX_SEQUENCE), Some(Watermark::of_timestamp(100, 32_767)));
    }

    #[test]
    fn done_once_completed_at_timestamp() {
        assert!(!Watermark::of_timestamp(100, 0).is_done(100));
        assert!(Watermark::of_timestamp(100, 0).completed().is_done(100));
        assert!(Watermark::of_timestamp(101, 0).is_done(100));
        assert!(!Watermark::LOWEST.is_done(0));
    }
}
