use chrono::Utc;
use std::sync::atomic::{AtomicU16, Ordering};
use uuid::Uuid;

/// Issues human-readable order numbers.
pub trait OrderNumberGenerator: Send + Sync {
    fn next_number(&self) -> String;
}

/// `<prefix><yyMMddHHmmssSSS>-<SEQ>` where SEQ is a 4-hex-digit counter.
///
/// The counter wraps after 65 536 numbers, so two numbers issued in the same
/// millisecond by one process never match. The starting point is random so
/// separate processes are unlikely to walk the same sequence; the unique index
/// on `orders.order_number` catches whatever slips through.
#[derive(Debug)]
pub struct TimestampSequenceGenerator {
    prefix: String,
    sequence: AtomicU16,
}

impl TimestampSequenceGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        let seed = (Uuid::new_v4().as_u128() & 0xFFFF) as u16;
        Self::with_start(prefix, seed)
    }

    pub fn with_start(prefix: impl Into<String>, start: u16) -> Self {
        Self {
            prefix: prefix.into(),
            sequence: AtomicU16::new(start),
        }
    }
}

impl OrderNumberGenerator for TimestampSequenceGenerator {
    fn next_number(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}{}-{:04X}",
            self.prefix,
            Utc::now().format("%y%m%d%H%M%S%3f"),
            seq
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn format_matches_prefix_timestamp_sequence() {
        let gen = TimestampSequenceGenerator::with_start("TB", 0x002A);
        let number = gen.next_number();

        assert!(number.starts_with("TB"));
        let (stamp, seq) = number[2..].split_once('-').unwrap();
        assert_eq!(stamp.len(), 15);
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(seq, "002A");
        assert!(gen.next_number().ends_with("-002B"));
    }

    #[test]
    fn sequence_wraps_without_panicking() {
        let gen = TimestampSequenceGenerator::with_start("TB", u16::MAX);
        assert!(gen.next_number().ends_with("-FFFF"));
        assert!(gen.next_number().ends_with("-0000"));
    }

    #[test]
    fn concurrent_numbers_are_pairwise_unique() {
        let gen = Arc::new(TimestampSequenceGenerator::new("TB"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = gen.clone();
                std::thread::spawn(move || (0..500).map(|_| gen.next_number()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for number in handle.join().unwrap() {
                assert!(seen.insert(number), "duplicate order number issued");
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
