//! Blocking client with the same surface as the async [`crate::Client`]

use crate::client::{ContentEncoding, ContentType, IngestOptions, Routes};
use crate::config::ClientConfig;
use crate::datasets::{self, Dataset};
use crate::encoder;
use crate::errors::{ClientError, Result};
use crate::query::{AplOptions, QUERY_ID_HEADER, QueryResult};
use crate::record::{IngestStatus, LogRecord};
use crate::transport::BlockingTransport;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Blocking API client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Client {
    transport: BlockingTransport,
    routes: Arc<Routes>,
}

impl Client {
    /// Validate `config` and build the HTTP transport
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate().map_err(ClientError::Config)?;

        Ok(Self {
            transport: BlockingTransport::new(&config)?,
            routes: Arc::new(Routes::new(config)),
        })
    }

    /// Create a client from `AXIOM_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env())
    }

    /// Configuration the client was built with
    pub fn config(&self) -> &ClientConfig {
        self.routes.config()
    }

    /// Whether ingest and query calls go to the edge URL
    pub fn is_edge_configured(&self) -> bool {
        self.routes.is_edge_configured()
    }

    /// Ingest a raw payload, blocking until the service answers
    pub fn ingest(
        &self,
        dataset: &str,
        payload: Vec<u8>,
        content_type: ContentType,
        encoding: ContentEncoding,
        opts: Option<&IngestOptions>,
    ) -> Result<IngestStatus> {
        let request = self.routes.ingest(dataset, payload, content_type, encoding, opts)?;
        let status: IngestStatus = self.transport.send_json(&request)?;
        debug!(
            "Ingested {} events into {} ({} failed)",
            status.ingested, dataset, status.failed
        );
        Ok(status)
    }

    /// Ingest JSON events, encoded as gzip NDJSON
    pub fn ingest_events(
        &self,
        dataset: &str,
        events: &[Map<String, Value>],
    ) -> Result<IngestStatus> {
        let payload = encoder::encode_events(events)?;
        self.ingest(dataset, payload, ContentType::NdJson, ContentEncoding::Gzip, None)
    }

    /// Ingest log records, encoded as gzip NDJSON
    pub fn ingest_records(&self, dataset: &str, records: &[LogRecord]) -> Result<IngestStatus> {
        let payload = encoder::encode(records)?;
        self.ingest(dataset, payload, ContentType::NdJson, ContentEncoding::Gzip, None)
    }

    /// Run an APL query
    pub fn query(&self, apl: &str, opts: Option<&AplOptions>) -> Result<QueryResult> {
        let request = self.routes.query(apl, opts)?;
        let response = self.transport.send(&request)?;
        let saved_query_id = response
            .headers()
            .get(QUERY_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes()?;
        let mut result: QueryResult = serde_json::from_slice(&bytes)?;
        result.saved_query_id = saved_query_id;
        Ok(result)
    }

    /// Dataset management calls
    pub fn datasets(&self) -> Datasets<'_> {
        Datasets { client: self }
    }
}

/// Dataset management through a blocking [`Client`]
#[derive(Debug, Clone, Copy)]
pub struct Datasets<'a> {
    client: &'a Client,
}

impl Datasets<'_> {
    /// Fetch one dataset by id
    pub fn get(&self, id: &str) -> Result<Dataset> {
        self.client.transport.send_json(&datasets::get(id))
    }

    /// All datasets visible to the token
    pub fn list(&self) -> Result<Vec<Dataset>> {
        self.client.transport.send_json(&datasets::list())
    }

    /// Create a dataset
    pub fn create(&self, name: &str, description: &str) -> Result<Dataset> {
        self.client.transport.send_json(&datasets::create(name, description)?)
    }

    /// Replace a dataset's description
    pub fn update(&self, id: &str, description: &str) -> Result<Dataset> {
        self.client.transport.send_json(&datasets::update(id, description)?)
    }

    /// Delete a dataset and its data
    pub fn delete(&self, id: &str) -> Result<()> {
        self.client.transport.send(&datasets::delete(id))?;
        Ok(())
    }

    /// Drop data older than `max_duration`
    pub fn trim(&self, id: &str, max_duration: Duration) -> Result<()> {
        self.client.transport.send(&datasets::trim(id, max_duration)?)?;
        Ok(())
    }
}
