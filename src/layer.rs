//! Logging integration: feed `tracing` events into a flush handler.
//!
//! ```rust,no_run
//! use axiom_client::{AsyncAxiomHandler, Client, FlushPolicy};
//! use tracing_subscriber::layer::SubscriberExt;
//! use tracing_subscriber::util::SubscriberInitExt;
//!
//! # async fn run() -> axiom_client::Result<()> {
//! let client = Client::from_env()?;
//! let handler = AsyncAxiomHandler::spawn(client, "app-logs", FlushPolicy::default())?;
//!
//! tracing_subscriber::registry().with(handler.layer()).init();
//! tracing::info!(user = "alice", "logged in");
//!
//! handler.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::buffer::{AppendOutcome, EventBuffer};
use crate::record::{FieldValue, LogRecord};
use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Targets whose events are never shipped: this crate and its HTTP stack
/// log while flushing, and shipping those would feed every flush back into
/// the buffer.
pub const DEFAULT_IGNORED_TARGETS: &[&str] =
    &["axiom_client", "reqwest", "hyper", "hyper_util", "h2", "rustls"];

/// Wakes the flush driver when a batch fills up.
pub(crate) trait Wake: Send + Sync + fmt::Debug {
    fn wake(&self);
}

/// Cheap, cloneable producer handle onto a handler's buffer.
///
/// Appending never blocks on the network and never fails; once the handler
/// is closed records are counted as rejected.
#[derive(Clone, Debug)]
pub struct Appender {
    buffer: Arc<EventBuffer>,
    waker: Arc<dyn Wake>,
}

impl Appender {
    pub(crate) fn new(buffer: Arc<EventBuffer>, waker: Arc<dyn Wake>) -> Self {
        Self { buffer, waker }
    }

    pub fn append(&self, record: LogRecord) {
        if self.buffer.append(record) == AppendOutcome::BatchFull {
            self.waker.wake();
        }
    }

    /// Records currently waiting for the next flush
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Records discarded because the handler was already closed
    pub fn rejected(&self) -> u64 {
        self.buffer.rejected()
    }
}

/// A `tracing_subscriber` layer that turns events into [`LogRecord`]s.
#[derive(Clone, Debug)]
pub struct AxiomLayer {
    appender: Appender,
    ignored_targets: Vec<String>,
}

impl AxiomLayer {
    pub fn new(appender: Appender) -> Self {
        Self {
            appender,
            ignored_targets: DEFAULT_IGNORED_TARGETS.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Also skip events whose target starts with `prefix`
    pub fn ignore_target(mut self, prefix: impl Into<String>) -> Self {
        self.ignored_targets.push(prefix.into());
        self
    }

    fn is_ignored(&self, target: &str) -> bool {
        self.ignored_targets.iter().any(|prefix| {
            target == prefix
                || target
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with("::"))
        })
    }
}

impl<S: Subscriber> Layer<S> for AxiomLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if self.is_ignored(metadata.target()) {
            return;
        }

        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        let mut record = LogRecord::new()
            .with_field("level", metadata.level().as_str())
            .with_field("target", metadata.target());
        if let Some(file) = metadata.file() {
            record = record.with_field("file", file);
        }
        if let Some(line) = metadata.line() {
            record = record.with_field("line", u64::from(line));
        }
        for (name, value) in visitor.fields {
            record = record.with_field(name, value);
        }

        self.appender.append(record);
    }
}

#[derive(Default)]
struct FieldCollector {
    fields: Vec<(String, FieldValue)>,
}

impl FieldCollector {
    fn push(&mut self, field: &Field, value: FieldValue) {
        self.fields.push((field.name().to_string(), value));
    }
}

impl Visit for FieldCollector {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field, FieldValue::F64(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, FieldValue::I64(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, FieldValue::U64(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, FieldValue::Bool(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, FieldValue::Str(value.to_string()));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.push(field, FieldValue::Str(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, FieldValue::Str(format!("{:?}", value)));
    }
}
