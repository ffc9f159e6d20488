//! Buffered log shipping driven by a background thread.

use crate::blocking;
use crate::buffer::EventBuffer;
use crate::config::{FlushPolicy, MAX_FLUSH_INTERVAL};
use crate::errors::{ClientError, Result};
use crate::layer::{Appender, AxiomLayer, Wake};
use crate::record::{IngestBatch, LogRecord};
use crate::scheduler::{self, FlushAction, FlushEvent, FlushScheduler};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Destination of flushed batches for [`AxiomHandler`].
pub trait Ingest: Send + 'static {
    fn ingest_batch(&self, dataset: &str, records: &[LogRecord]) -> Result<()>;
}

impl Ingest for blocking::Client {
    fn ingest_batch(&self, dataset: &str, records: &[LogRecord]) -> Result<()> {
        self.ingest_records(dataset, records).map(|_| ())
    }
}

#[derive(Debug)]
enum Command {
    Wake,
    Flush(Sender<Result<()>>),
    Shutdown,
}

#[derive(Debug)]
struct ThreadWaker {
    tx: Sender<Command>,
}

impl Wake for ThreadWaker {
    fn wake(&self) {
        // The worker may already be gone after close; nothing left to wake.
        let _ = self.tx.send(Command::Wake);
    }
}

/// Ships buffered records to a dataset from a dedicated flush thread.
///
/// Flushes every `flush_interval`, as soon as `max_batch_size` records are
/// buffered, on [`AxiomHandler::flush`], and one final time on
/// [`AxiomHandler::close`] or drop. Failed batches are logged and dropped.
#[derive(Debug)]
pub struct AxiomHandler {
    appender: Appender,
    tx: Sender<Command>,
    worker: Option<JoinHandle<Result<()>>>,
    dataset: String,
}

impl AxiomHandler {
    /// Validate `policy` and start the flush thread for `dataset`.
    pub fn new<C: Ingest>(
        client: C,
        dataset: impl Into<String>,
        policy: FlushPolicy,
    ) -> Result<Self> {
        policy.validate().map_err(ClientError::Config)?;
        let dataset = dataset.into();

        let buffer = Arc::new(EventBuffer::new(policy.max_batch_size));
        let (tx, rx) = mpsc::channel();
        let waker = Arc::new(ThreadWaker { tx: tx.clone() });
        let appender = Appender::new(Arc::clone(&buffer), waker);

        let worker = FlushWorker {
            client,
            dataset: dataset.clone(),
            buffer,
            interval: policy.flush_interval,
            rx,
            scheduler: FlushScheduler::new(),
        };
        let worker = std::thread::Builder::new()
            .name("axiom-flush".to_string())
            .spawn(move || worker.run())?;

        info!(
            "Started log handler for {} (batch size {}, interval {}ms)",
            dataset,
            policy.max_batch_size,
            policy.flush_interval.as_millis()
        );

        Ok(Self {
            appender,
            tx,
            worker: Some(worker),
            dataset,
        })
    }

    /// Dataset the records are shipped to
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Buffer a record; never blocks on the network.
    pub fn append(&self, record: LogRecord) {
        self.appender.append(record);
    }

    /// Producer handle that can be shared across threads
    pub fn appender(&self) -> Appender {
        self.appender.clone()
    }

    /// `tracing` layer writing into this handler
    pub fn layer(&self) -> AxiomLayer {
        AxiomLayer::new(self.appender())
    }

    /// Flush now and wait for the result.
    pub fn flush(&self) -> Result<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Command::Flush(reply_tx))
            .map_err(|_| ClientError::HandlerClosed)?;
        reply_rx.recv().map_err(|_| ClientError::HandlerClosed)?
    }

    /// Stop accepting records, flush what is buffered and stop the thread.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        // A send error means the worker already exited; join still reports why.
        let _ = self.tx.send(Command::Shutdown);
        match worker.join() {
            Ok(result) => result,
            Err(_) => Err(ClientError::Other("flush thread panicked".to_string())),
        }
    }
}

impl Drop for AxiomHandler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Final flush for {} failed: {}", self.dataset, e);
        }
    }
}

struct FlushWorker<C> {
    client: C,
    dataset: String,
    buffer: Arc<EventBuffer>,
    interval: Duration,
    rx: Receiver<Command>,
    scheduler: FlushScheduler,
}

impl<C: Ingest> FlushWorker<C> {
    fn run(mut self) -> Result<()> {
        let mut deadline = self.next_deadline();

        loop {
            let timeout = deadline.saturating_duration_since(Instant::now());
            let (event, reply) = match self.rx.recv_timeout(timeout) {
                Ok(Command::Wake) => (FlushEvent::BatchFull, None),
                Ok(Command::Flush(reply)) => (FlushEvent::FlushRequested, Some(reply)),
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    (FlushEvent::ShutdownRequested, None)
                }
                Err(RecvTimeoutError::Timeout) => (FlushEvent::TimerFired, None),
            };

            let result = match self.scheduler.handle(event) {
                FlushAction::StartFlush => {
                    let result = self.pass();
                    deadline = self.next_deadline();
                    result
                }
                FlushAction::FinalFlush => return self.final_flush(),
                _ => Ok(()),
            };

            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
    }

    fn next_deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.interval)
            .unwrap_or_else(|| now + MAX_FLUSH_INTERVAL)
    }

    fn pass(&mut self) -> Result<()> {
        if self.scheduler.handle(FlushEvent::DrainStarted) != FlushAction::Drain {
            return Ok(());
        }

        let result = self.send_all(scheduler::drain_batches(&self.buffer));

        // Commands are only read between passes, so a shutdown is never
        // pending here and completion always rearms.
        self.scheduler.handle(FlushEvent::FlushCompleted);
        result
    }

    fn final_flush(&mut self) -> Result<()> {
        self.buffer.close();
        let result = self.send_all(scheduler::drain_batches(&self.buffer));
        debug!(
            "Log handler for {} stopped ({} records rejected after close)",
            self.dataset,
            self.buffer.rejected()
        );
        result
    }

    /// Send every batch; the last failure is returned.
    fn send_all(&self, batches: Vec<IngestBatch>) -> Result<()> {
        let mut last = Ok(());
        for batch in batches {
            let result = self.client.ingest_batch(&self.dataset, batch.records());
            if let Err(e) = scheduler::settle(&self.dataset, &batch, result) {
                last = Err(e);
            }
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldValue;
    use std::sync::Mutex;

    /// Records every batch it receives and fails on demand.
    #[derive(Clone, Default)]
    struct RecordingIngest {
        batches: Arc<Mutex<Vec<Vec<LogRecord>>>>,
        fail: Arc<std::sync::atomic::AtomicBool>,
    }

    impl RecordingIngest {
        fn batches(&self) -> Vec<Vec<LogRecord>> {
            self.batches.lock().unwrap().clone()
        }
    }

    impl Ingest for RecordingIngest {
        fn ingest_batch(&self, _dataset: &str, records: &[LogRecord]) -> Result<()> {
            self.batches.lock().unwrap().push(records.to_vec());
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(ClientError::Api {
                    status: 500,
                    message: "down".to_string(),
                });
            }
            Ok(())
        }
    }

    fn seq(record: &LogRecord) -> i64 {
        match record.get("seq") {
            Some(FieldValue::I64(n)) => *n,
            other => panic!("unexpected seq {:?}", other),
        }
    }

    fn policy(max_batch_size: usize, interval: Duration) -> FlushPolicy {
        FlushPolicy {
            max_batch_size,
            flush_interval: interval,
        }
    }

    fn start(ingest: &RecordingIngest, max_batch_size: usize, interval: Duration) -> AxiomHandler {
        AxiomHandler::new(ingest.clone(), "logs", policy(max_batch_size, interval)).unwrap()
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_no_flush_below_batch_size_before_interval() {
        let ingest = RecordingIngest::default();
        let handler = start(&ingest, 10, Duration::from_secs(60));

        for i in 0..5 {
            handler.append(LogRecord::new().with_field("seq", i as i64));
        }
        std::thread::sleep(Duration::from_millis(100));
        assert!(ingest.batches().is_empty());

        handler.close().unwrap();
        let batches = ingest.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].iter().map(seq).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_batch_full_flushes_before_timer() {
        let ingest = RecordingIngest::default();
        let handler = start(&ingest, 3, Duration::from_secs(60));

        for i in 0..3 {
            handler.append(LogRecord::new().with_field("seq", i as i64));
        }
        wait_for(|| !ingest.batches().is_empty());

        let first = &ingest.batches()[0];
        assert_eq!(first.iter().map(seq).collect::<Vec<_>>(), vec![0, 1, 2]);
        handler.close().unwrap();
    }

    #[test]
    fn test_timer_flushes() {
        let ingest = RecordingIngest::default();
        let handler = start(&ingest, 100, Duration::from_millis(50));

        handler.append(LogRecord::new().with_field("seq", 1i64));
        wait_for(|| ingest.batches().len() == 1);
        handler.close().unwrap();
        assert_eq!(ingest.batches().len(), 1);
    }

    #[test]
    fn test_manual_flush_surfaces_error_and_drops_batch() {
        let ingest = RecordingIngest::default();
        ingest.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let handler = start(&ingest, 100, Duration::from_secs(60));

        handler.append(LogRecord::new().with_field("seq", 1i64));
        let err = handler.flush().unwrap_err();
        assert!(matches!(err, ClientError::Flush { records: 1, .. }));

        // Dropped, not re-buffered.
        ingest.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        handler.flush().unwrap();
        assert_eq!(ingest.batches().len(), 1);
        handler.close().unwrap();
    }

    #[test]
    fn test_empty_flush_skips_ingest() {
        let ingest = RecordingIngest::default();
        let handler = start(&ingest, 100, Duration::from_secs(60));
        handler.flush().unwrap();
        handler.close().unwrap();
        assert!(ingest.batches().is_empty());
    }

    #[test]
    fn test_drop_performs_final_flush() {
        let ingest = RecordingIngest::default();
        {
            let handler = start(&ingest, 100, Duration::from_secs(60));
            handler.append(LogRecord::new().with_field("seq", 7i64));
        }
        assert_eq!(ingest.batches().len(), 1);
    }

    #[test]
    fn test_shutdown_with_concurrent_appends_loses_nothing() {
        let ingest = RecordingIngest::default();
        let handler = start(&ingest, 10_000, Duration::from_secs(60));

        for i in 0..5 {
            handler.append(LogRecord::new().with_field("seq", i as i64));
        }

        let appender = handler.appender();
        let producer = std::thread::spawn(move || {
            for i in 100..1100 {
                appender.append(LogRecord::new().with_field("seq", i as i64));
            }
            appender
        });

        handler.close().unwrap();
        let appender = producer.join().unwrap();

        let batches = ingest.batches();
        assert_eq!(batches.len(), 1);
        let delivered: Vec<i64> = batches[0].iter().map(seq).collect();
        assert_eq!(&delivered[..5], &[0, 1, 2, 3, 4]);
        assert_eq!(delivered.len() as u64 + appender.rejected(), 1005);

        let unique: std::collections::HashSet<i64> = delivered.iter().copied().collect();
        assert_eq!(unique.len(), delivered.len());
    }

    #[test]
    fn test_rejects_invalid_policy() {
        let ingest = RecordingIngest::default();
        let err = AxiomHandler::new(ingest, "logs", policy(0, Duration::from_secs(1))).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_rejects_interval_that_would_overflow_deadline() {
        let ingest = RecordingIngest::default();
        let huge = policy(10, Duration::from_secs(u64::MAX));
        let err = AxiomHandler::new(ingest, "logs", huge).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_longest_interval_still_flushes_on_close() {
        let ingest = RecordingIngest::default();
        let handler = start(&ingest, 10, MAX_FLUSH_INTERVAL);

        handler.append(LogRecord::new().with_field("seq", 1i64));
        handler.flush().unwrap();
        handler.append(LogRecord::new().with_field("seq", 2i64));
        handler.close().unwrap();

        let delivered: Vec<Vec<i64>> =
            ingest.batches().iter().map(|b| b.iter().map(seq).collect()).collect();
        assert_eq!(delivered, vec![vec![1], vec![2]]);
    }
}
