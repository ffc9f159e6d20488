//! Axiom Client Library
//!
//! HTTP client for ingesting events, running APL queries and managing
//! datasets, plus buffered log handlers that batch records and ship them
//! to a dataset in the background.

pub mod async_handler;
pub mod blocking;
pub mod buffer;
pub mod client;
pub mod config;
pub mod datasets;
pub mod encoder;
pub mod errors;
pub mod handler;
pub mod layer;
pub mod query;
pub mod record;
pub mod scheduler;
pub mod transport;

pub use async_handler::{AsyncAxiomHandler, AsyncIngest};
pub use buffer::{AppendOutcome, EventBuffer};
pub use client::{Client, ContentEncoding, ContentType, IngestOptions};
pub use config::{ClientConfig, FlushPolicy, RetryPolicy};
pub use datasets::Dataset;
pub use errors::{ClientError, Result};
pub use handler::{AxiomHandler, Ingest};
pub use layer::{Appender, AxiomLayer};
pub use query::{AplOptions, AplResultFormat, QueryResult};
pub use record::{FieldValue, IngestBatch, IngestFailure, IngestStatus, LogRecord};
pub use scheduler::{FlushAction, FlushEvent, FlushScheduler, FlushState};
