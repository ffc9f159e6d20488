//! Buffered log shipping driven by a tokio task.

use crate::buffer::EventBuffer;
use crate::client::Client;
use crate::config::{FlushPolicy, MAX_FLUSH_INTERVAL};
use crate::errors::{ClientError, Result};
use crate::layer::{Appender, AxiomLayer, Wake};
use crate::record::{IngestBatch, LogRecord};
use crate::scheduler::{self, FlushAction, FlushEvent, FlushScheduler};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{debug, info};

/// Destination of flushed batches for [`AsyncAxiomHandler`].
#[async_trait]
pub trait AsyncIngest: Send + Sync + 'static {
    async fn ingest_batch(&self, dataset: &str, records: &[LogRecord]) -> Result<()>;
}

#[async_trait]
impl AsyncIngest for Client {
    async fn ingest_batch(&self, dataset: &str, records: &[LogRecord]) -> Result<()> {
        self.ingest_records(dataset, records).await.map(|_| ())
    }
}

#[derive(Debug)]
enum Command {
    Wake,
    Flush(oneshot::Sender<Result<()>>),
}

#[derive(Debug)]
struct TaskWaker {
    tx: mpsc::Sender<Command>,
}

impl Wake for TaskWaker {
    fn wake(&self) {
        // A full queue already holds work that will drain the buffer.
        let _ = self.tx.try_send(Command::Wake);
    }
}

/// Async counterpart of [`crate::AxiomHandler`].
///
/// Must be spawned from inside a tokio runtime. Dropping the handler without
/// [`close`](Self::close) still requests the final flush, but nothing waits
/// for it.
#[derive(Debug)]
pub struct AsyncAxiomHandler {
    appender: Appender,
    tx: mpsc::Sender<Command>,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<Result<()>>>,
    dataset: String,
}

impl AsyncAxiomHandler {
    /// Validate `policy` and spawn the flush task on the current runtime.
    pub fn spawn<C: AsyncIngest>(
        client: C,
        dataset: impl Into<String>,
        policy: FlushPolicy,
    ) -> Result<Self> {
        policy.validate().map_err(ClientError::Config)?;
        let runtime = Handle::try_current()
            .map_err(|e| ClientError::Other(format!("no tokio runtime: {}", e)))?;
        let dataset = dataset.into();

        let buffer = Arc::new(EventBuffer::new(policy.max_batch_size));
        let (tx, rx) = mpsc::channel(16);
        let shutdown = Arc::new(Notify::new());
        let waker = Arc::new(TaskWaker { tx: tx.clone() });
        let appender = Appender::new(Arc::clone(&buffer), waker);

        let worker = FlushTask {
            client,
            dataset: dataset.clone(),
            buffer,
            interval: policy.flush_interval,
            rx,
            shutdown: Arc::clone(&shutdown),
            scheduler: FlushScheduler::new(),
        };
        let task = runtime.spawn(worker.run());

        info!(
            "Started async log handler for {} (batch size {}, interval {}ms)",
            dataset,
            policy.max_batch_size,
            policy.flush_interval.as_millis()
        );

        Ok(Self {
            appender,
            tx,
            shutdown,
            task: Some(task),
            dataset,
        })
    }

    /// Dataset the records are shipped to
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Buffer a record; never awaits the network.
    pub fn append(&self, record: LogRecord) {
        self.appender.append(record);
    }

    /// Producer handle that can be moved into other tasks or threads
    pub fn appender(&self) -> Appender {
        self.appender.clone()
    }

    /// `tracing` layer writing into this handler
    pub fn layer(&self) -> AxiomLayer {
        AxiomLayer::new(self.appender())
    }

    /// Flush now and wait for the result.
    pub async fn flush(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply_tx))
            .await
            .map_err(|_| ClientError::HandlerClosed)?;
        reply_rx.await.map_err(|_| ClientError::HandlerClosed)?
    }

    /// Stop accepting records, flush what is buffered and wait for the task.
    pub async fn close(mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        self.shutdown.notify_one();
        task.await
            .map_err(|e| ClientError::Other(format!("flush task failed: {}", e)))?
    }
}

impl Drop for AsyncAxiomHandler {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.shutdown.notify_one();
        }
    }
}

struct FlushTask<C> {
    client: C,
    dataset: String,
    buffer: Arc<EventBuffer>,
    interval: Duration,
    rx: mpsc::Receiver<Command>,
    shutdown: Arc<Notify>,
    scheduler: FlushScheduler,
}

impl<C: AsyncIngest> FlushTask<C> {
    async fn run(mut self) -> Result<()> {
        let mut ticker = self.ticker();
        let shutdown = Arc::clone(&self.shutdown);

        loop {
            let (event, reply) = tokio::select! {
                biased;
                _ = shutdown.notified() => (FlushEvent::ShutdownRequested, None),
                command = self.rx.recv() => match command {
                    Some(Command::Wake) => (FlushEvent::BatchFull, None),
                    Some(Command::Flush(reply)) => (FlushEvent::FlushRequested, Some(reply)),
                    None => (FlushEvent::ShutdownRequested, None),
                },
                _ = ticker.tick() => (FlushEvent::TimerFired, None),
            };

            let result = match self.scheduler.handle(event) {
                FlushAction::StartFlush => {
                    let result = self.pass().await;
                    ticker.reset();
                    result
                }
                FlushAction::FinalFlush => return self.final_flush().await,
                _ => Ok(()),
            };

            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
    }

    fn ticker(&self) -> Interval {
        let now = Instant::now();
        let start = now
            .checked_add(self.interval)
            .unwrap_or_else(|| now + MAX_FLUSH_INTERVAL);
        let mut ticker = interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn pass(&mut self) -> Result<()> {
        if self.scheduler.handle(FlushEvent::DrainStarted) != FlushAction::Drain {
            return Ok(());
        }

        let result = self.send_all(scheduler::drain_batches(&self.buffer)).await;

        // The select loop is idle during a pass, so a shutdown is never
        // pending here and completion always rearms.
        self.scheduler.handle(FlushEvent::FlushCompleted);
        result
    }

    async fn final_flush(&mut self) -> Result<()> {
        self.buffer.close();
        self.rx.close();
        let result = self.send_all(scheduler::drain_batches(&self.buffer)).await;
        debug!(
            "Async log handler for {} stopped ({} records rejected after close)",
            self.dataset,
            self.buffer.rejected()
        );
        result
    }

    async fn send_all(&self, batches: Vec<IngestBatch>) -> Result<()> {
        let mut last = Ok(());
        for batch in batches {
            let result = self.client.ingest_batch(&self.dataset, batch.records()).await;
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
    use crate::config::{ClientConfig, RetryPolicy};
    use crate::encoder;
    use serde_json::json;
    use std::collections::HashSet;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> Client {
        let config = ClientConfig::new("xaat-test")
            .with_url(server.uri())
            .with_retry(RetryPolicy {
                max_attempts: 1,
                backoff_base: Duration::from_millis(1),
                jitter: false,
            });
        Client::new(config).unwrap()
    }

    fn policy(max_batch_size: usize, interval: Duration) -> FlushPolicy {
        FlushPolicy {
            max_batch_size,
            flush_interval: interval,
        }
    }

    fn start(server: &MockServer, max_batch_size: usize, interval: Duration) -> AsyncAxiomHandler {
        AsyncAxiomHandler::spawn(client(server), "logs", policy(max_batch_size, interval)).unwrap()
    }

    async fn accepting_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/datasets/logs/ingest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ingested": 1})))
            .mount(&server)
            .await;
        server
    }

    /// `seq` values of every request body, one vec per request
    async fn delivered(server: &MockServer) -> Vec<Vec<i64>> {
        server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|request| {
                encoder::decode(&request.body)
                    .unwrap()
                    .iter()
                    .map(|event| event["seq"].as_i64().unwrap())
                    .collect()
            })
            .collect()
    }

    async fn wait_for_requests(server: &MockServer, count: usize) {
        for _ in 0..500 {
            if server.received_requests().await.unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} requests", count);
    }

    #[tokio::test]
    async fn test_nothing_sent_before_interval_then_close_flushes_once() {
        let server = accepting_server().await;
        let handler = start(&server, 10, Duration::from_secs(60));

        for i in 0..5 {
            handler.append(LogRecord::new().with_field("seq", i as i64));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(delivered(&server).await.is_empty());

        handler.close().await.unwrap();
        assert_eq!(delivered(&server).await, vec![vec![0, 1, 2, 3, 4]]);
    }

    #[tokio::test]
    async fn test_full_batch_flushes_first_records_in_order() {
        let server = accepting_server().await;
        let handler = start(&server, 3, Duration::from_secs(60));

        for i in 0..5 {
            handler.append(LogRecord::new().with_field("seq", i as i64));
        }
        wait_for_requests(&server, 1).await;
        handler.close().await.unwrap();

        let requests = delivered(&server).await;
        assert_eq!(requests[0], vec![0, 1, 2]);
        assert_eq!(requests.concat(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_timer_flush() {
        let server = accepting_server().await;
        let handler = start(&server, 100, Duration::from_millis(50));

        handler.append(LogRecord::new().with_field("seq", 1i64));
        wait_for_requests(&server, 1).await;
        handler.close().await.unwrap();
        assert_eq!(delivered(&server).await, vec![vec![1]]);
    }

    #[tokio::test]
    async fn test_failed_batch_is_dropped_and_flushing_continues() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(500).set_body_json(json!({"message": "unavailable"})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ingested": 1})))
            .mount(&server)
            .await;

        let handler = start(&server, 100, Duration::from_secs(60));

        handler.append(LogRecord::new().with_field("seq", 1i64));
        let err = handler.flush().await.unwrap_err();
        assert!(matches!(err, ClientError::Flush { records: 1, .. }));

        handler.append(LogRecord::new().with_field("seq", 2i64));
        handler.flush().await.unwrap();
        handler.close().await.unwrap();

        assert_eq!(delivered(&server).await, vec![vec![1], vec![2]]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_with_concurrent_appends_delivers_or_rejects_each_record() {
        let server = accepting_server().await;
        let handler = start(&server, 10_000, Duration::from_secs(60));

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

        handler.close().await.unwrap();
        let appender = tokio::task::spawn_blocking(move || producer.join().unwrap())
            .await
            .unwrap();

        let all = delivered(&server).await.concat();
        assert_eq!(&all[..5], &[0, 1, 2, 3, 4]);
        assert_eq!(all.len() as u64 + appender.rejected(), 1005);
        let unique: HashSet<i64> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());
    }

    #[tokio::test]
    async fn test_append_after_close_is_rejected() {
        let server = accepting_server().await;
        let handler = start(&server, 10, Duration::from_secs(60));
        let appender = handler.appender();
        handler.close().await.unwrap();

        appender.append(LogRecord::new().with_field("seq", 1i64));
        assert_eq!(appender.rejected(), 1);
        assert!(delivered(&server).await.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_interval_that_would_overflow_ticker() {
        let server = accepting_server().await;
        let huge = policy(10, Duration::from_secs(u64::MAX));
        let err = AsyncAxiomHandler::spawn(client(&server), "logs", huge).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[tokio::test]
    async fn test_longest_interval_still_flushes() {
        let server = accepting_server().await;
        let handler = start(&server, 10, MAX_FLUSH_INTERVAL);

        handler.append(LogRecord::new().with_field("seq", 1i64));
        handler.flush().await.unwrap();
        handler.append(LogRecord::new().with_field("seq", 2i64));
        handler.close().await.unwrap();

        assert_eq!(delivered(&server).await, vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_spawn_requires_runtime() {
        let client = Client::new(ClientConfig::new("xaat-test")).unwrap();
        let err = AsyncAxiomHandler::spawn(client, "logs", FlushPolicy::default()).unwrap_err();
        assert!(matches!(err, ClientError::Other(_)));
    }
}
