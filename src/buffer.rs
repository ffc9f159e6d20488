//! In-memory buffering of log records awaiting ingestion

use crate::record::{IngestBatch, LogRecord};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Result of appending a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Record buffered, no flush needed yet
    Buffered,
    /// Record buffered and the batch size was reached; reported once per drain
    BatchFull,
    /// Buffer is closed, record discarded
    Rejected,
}

#[derive(Debug, Default)]
struct Inner {
    records: Vec<LogRecord>,
    closed: bool,
}

/// Thread-safe buffer shared by any number of producers and one consumer.
///
/// Appends never wait on I/O. `drain` swaps the contents out atomically, so
/// a record is either in the drained batch or stays for the next one.
#[derive(Debug)]
pub struct EventBuffer {
    inner: Mutex<Inner>,
    batch_size: usize,
    full_signalled: AtomicBool,
    rejected: AtomicU64,
}

impl EventBuffer {
    /// Empty buffer signalling a full batch at `batch_size` records (at least 1)
    pub fn new(batch_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            batch_size: batch_size.max(1),
            full_signalled: AtomicBool::new(false),
            rejected: AtomicU64::new(0),
        }
    }

    /// Add a record to the buffer
    pub fn append(&self, record: LogRecord) -> AppendOutcome {
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return AppendOutcome::Rejected;
        }
        inner.records.push(record);

        // Checked under the lock so a concurrent drain cannot leave the latch set.
        let full = inner.records.len() >= self.batch_size;
        if full && !self.full_signalled.swap(true, Ordering::AcqRel) {
            AppendOutcome::BatchFull
        } else {
            AppendOutcome::Buffered
        }
    }

    /// Remove and return everything buffered so far
    pub fn drain(&self) -> IngestBatch {
        let records = {
            let mut inner = self.inner.lock();
            self.full_signalled.store(false, Ordering::Release);
            std::mem::take(&mut inner.records)
        };
        IngestBatch::new(records)
    }

    /// Stop accepting records. Records already buffered stay until drained.
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of records waiting for the next drain
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Threshold at which appends report [`AppendOutcome::BatchFull`]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of records discarded because the buffer was closed
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldValue;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn record(seq: i64) -> LogRecord {
        LogRecord::new().with_field("seq", seq)
    }

    fn seqs(batch: &IngestBatch) -> Vec<i64> {
        batch
            .records()
            .iter()
            .map(|r| match r.get("seq") {
                Some(FieldValue::I64(n)) => *n,
                other => panic!("unexpected seq {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_basic_buffer_operations() {
        let buffer = EventBuffer::new(10);
        assert_eq!(buffer.append(record(1)), AppendOutcome::Buffered);
        assert_eq!(buffer.len(), 1);

        let batch = buffer.drain();
        assert_eq!(seqs(&batch), vec![1]);
        assert!(buffer.is_empty());

        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn test_batch_full_reported_once_per_drain() {
        let buffer = EventBuffer::new(2);
        assert_eq!(buffer.append(record(1)), AppendOutcome::Buffered);
        assert_eq!(buffer.append(record(2)), AppendOutcome::BatchFull);
        assert_eq!(buffer.append(record(3)), AppendOutcome::Buffered);

        buffer.drain();
        assert_eq!(buffer.append(record(4)), AppendOutcome::Buffered);
        assert_eq!(buffer.append(record(5)), AppendOutcome::BatchFull);
    }

    #[test]
    fn test_closed_buffer_rejects() {
        let buffer = EventBuffer::new(10);
        buffer.append(record(1));
        buffer.close();

        assert_eq!(buffer.append(record(2)), AppendOutcome::Rejected);
        assert_eq!(buffer.rejected(), 1);
        assert_eq!(seqs(&buffer.drain()), vec![1]);
    }

    #[test]
    fn test_drain_is_exactly_once_under_concurrency() {
        let buffer = Arc::new(EventBuffer::new(1000));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        buffer.append(record(p * 1000 + i));
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        while producers.iter().any(|h| !h.is_finished()) {
            seen.extend(seqs(&buffer.drain()));
        }
        for handle in producers {
            handle.join().unwrap();
        }
        seen.extend(seqs(&buffer.drain()));

        assert_eq!(seen.len(), 2000);
        let unique: HashSet<i64> = seen.iter().copied().collect();
        assert_eq!(unique.len(), 2000);

        // Per-producer order survives draining.
        for p in 0..4 {
            let own: Vec<i64> = seen.iter().copied().filter(|s| s / 1000 == p).collect();
            assert!(own.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
