//! Flush scheduling as a pure state machine.
//!
//! The blocking and async handlers drive the same [`transition`] function;
//! they differ only in how they wait (a thread with `recv_timeout`, or a tokio
//! task with `select!`) and how they perform the network call.
//!
//! ```text
//!   Idle ─trigger─▶ Scheduled ─DrainStarted─▶ Flushing ─FlushCompleted─▶ Idle
//!     │                 │                        │
//!     └─── Shutdown ────┴─▶ Stopped ◀─ Completed ┘ (shutdown deferred)
//! ```

use crate::buffer::EventBuffer;
use crate::errors::{ClientError, Result};
use crate::record::IngestBatch;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// Waiting for the next trigger; the timer is armed
    Idle,
    /// A flush was accepted and is about to drain the buffer
    Scheduled,
    /// A drained batch is being transmitted
    Flushing { stop_requested: bool },
    /// Final flush done or in progress; nothing else will run
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushEvent {
    TimerFired,
    BatchFull,
    FlushRequested,
    ShutdownRequested,
    DrainStarted,
    FlushCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushAction {
    /// Begin a pass: the driver should report `DrainStarted` and drain
    StartFlush,
    /// Drain the buffer and transmit
    Drain,
    /// Trigger absorbed by a pass that is pending or running
    Coalesce,
    /// Pass finished; rearm the timer
    Rearm,
    /// Shutdown noted; it runs when the current pass completes
    Defer,
    /// Close the buffer, drain everything and transmit, then release
    FinalFlush,
    /// Nothing to do
    Ignore,
}

/// Compute the next state and the action the driver must take.
pub fn transition(state: FlushState, event: FlushEvent) -> (FlushState, FlushAction) {
    use FlushAction as A;
    use FlushEvent as E;
    use FlushState as S;

    match (state, event) {
        (S::Stopped, _) => (S::Stopped, A::Ignore),

        (S::Idle, E::TimerFired | E::BatchFull | E::FlushRequested) => {
            (S::Scheduled, A::StartFlush)
        }
        (S::Idle, E::ShutdownRequested) => (S::Stopped, A::FinalFlush),
        (S::Idle, E::DrainStarted | E::FlushCompleted) => (S::Idle, A::Ignore),

        (S::Scheduled, E::DrainStarted) => (S::Flushing { stop_requested: false }, A::Drain),
        (S::Scheduled, E::TimerFired | E::BatchFull | E::FlushRequested) => {
            (S::Scheduled, A::Coalesce)
        }
        (S::Scheduled, E::ShutdownRequested) => (S::Stopped, A::FinalFlush),
        (S::Scheduled, E::FlushCompleted) => (S::Scheduled, A::Ignore),

        (S::Flushing { stop_requested }, E::TimerFired | E::BatchFull | E::FlushRequested) => {
            (S::Flushing { stop_requested }, A::Coalesce)
        }
        (S::Flushing { .. }, E::ShutdownRequested) => {
            (S::Flushing { stop_requested: true }, A::Defer)
        }
        (S::Flushing { stop_requested: false }, E::FlushCompleted) => (S::Idle, A::Rearm),
        (S::Flushing { stop_requested: true }, E::FlushCompleted) => (S::Stopped, A::FinalFlush),
        (S::Flushing { stop_requested }, E::DrainStarted) => {
            (S::Flushing { stop_requested }, A::Ignore)
        }
    }
}

/// Holds the current state for a driver.
#[derive(Debug)]
pub struct FlushScheduler {
    state: FlushState,
}

impl FlushScheduler {
    pub fn new() -> Self {
        Self {
            state: FlushState::Idle,
        }
    }

    pub fn state(&self) -> FlushState {
        self.state
    }

    pub fn handle(&mut self, event: FlushEvent) -> FlushAction {
        let (next, action) = transition(self.state, event);
        if next != self.state {
            debug!("Flush scheduler {:?} -> {:?} on {:?}", self.state, next, event);
        }
        self.state = next;
        action
    }

    pub fn is_stopped(&self) -> bool {
        self.state == FlushState::Stopped
    }
}

impl Default for FlushScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain the buffer into batches of at most the buffer's batch size.
///
/// An empty drain yields no batches; the driver skips the network call.
pub(crate) fn drain_batches(buffer: &EventBuffer) -> Vec<IngestBatch> {
    let batch = buffer.drain();
    if batch.is_empty() {
        return Vec::new();
    }
    batch.chunks(buffer.batch_size())
}

/// Log a batch outcome and turn a failure into a flush error.
///
/// The batch is dropped either way; failed batches are not re-buffered.
pub(crate) fn settle(dataset: &str, batch: &IngestBatch, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => {
            debug!(
                "Flushed batch {} with {} records to {}",
                batch.batch_id,
                batch.len(),
                dataset
            );
            Ok(())
        }
        Err(e) => {
            error!(
                "Dropping batch {} with {} records for {}: {}",
                batch.batch_id,
                batch.len(),
                dataset,
                e
            );
            Err(ClientError::Flush {
                records: batch.len(),
                source: Box::new(e),
            })
        }
    }
}
