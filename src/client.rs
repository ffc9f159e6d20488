//! Async client for ingesting events, running queries and managing datasets

use crate::config::ClientConfig;
use crate::datasets::{self, Dataset};
use crate::encoder;
use crate::errors::{ClientError, Result};
use crate::query::{AplOptions, AplRequest, QUERY_ID_HEADER, QueryResult};
use crate::record::{IngestStatus, LogRecord};
use crate::transport::{ApiRequest, HttpTransport};
use reqwest::Url;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Content type of the data to ingest
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    Json,
    NdJson,
    Csv,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::NdJson => encoder::CONTENT_TYPE,
            ContentType::Csv => "text/csv",
        }
    }
}

/// Content encoding of the data to ingest
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
}

impl ContentEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentEncoding::Identity => "identity",
            ContentEncoding::Gzip => encoder::CONTENT_ENCODING,
        }
    }
}

/// Optional parameters of an ingest call
#[derive(Clone, Debug, Default)]
pub struct IngestOptions {
    /// Field to read the event timestamp from, `_time` when unset
    pub timestamp_field: Option<String>,
    /// Format of the timestamp field
    pub timestamp_format: Option<String>,
    /// Field delimiter for CSV payloads
    pub csv_delimiter: Option<String>,
}

/// Request construction shared by the async and blocking clients.
#[derive(Debug)]
pub(crate) struct Routes {
    config: ClientConfig,
}

impl Routes {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Configuration the client was built with
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether ingest and query calls go to the edge URL
    pub fn is_edge_configured(&self) -> bool {
        self.config.edge_url.is_some()
    }

    fn edge_url(&self, default_path: &str) -> Result<Option<String>> {
        let Some(edge_url) = &self.config.edge_url else {
            return Ok(None);
        };

        if self.config.is_personal_token() {
            return Err(ClientError::PersonalTokenNotSupportedForEdge);
        }

        let mut url = Url::parse(edge_url.trim_end_matches('/'))
            .map_err(|e| ClientError::Config(format!("invalid edge_url {}: {}", edge_url, e)))?;

        // A custom path is used as-is.
        if url.path().is_empty() || url.path() == "/" {
            url.set_path(default_path);
        }

        Ok(Some(url.to_string().trim_end_matches('/').to_string()))
    }

    pub fn ingest(
        &self,
        dataset: &str,
        payload: Vec<u8>,
        content_type: ContentType,
        encoding: ContentEncoding,
        opts: Option<&IngestOptions>,
    ) -> Result<ApiRequest> {
        let target = match self.edge_url(&format!("/v1/ingest/{}", dataset))? {
            Some(url) => url,
            None => format!("/v1/datasets/{}/ingest", dataset),
        };

        let mut request = ApiRequest::post(target)
            .with_header(CONTENT_TYPE, content_type.as_str())?
            .with_header(CONTENT_ENCODING, encoding.as_str())?
            .with_body(payload);

        if let Some(opts) = opts {
            if let Some(field) = &opts.timestamp_field {
                request = request.with_query("timestamp-field", field);
            }
            if let Some(format) = &opts.timestamp_format {
                request = request.with_query("timestamp-format", format);
            }
            if let Some(delimiter) = &opts.csv_delimiter {
                request = request.with_query("csv-delimiter", delimiter);
            }
        }

        Ok(request)
    }

    pub fn query(&self, apl: &str, opts: Option<&AplOptions>) -> Result<ApiRequest> {
        let target = self
            .edge_url("/v1/query/_apl")?
            .unwrap_or_else(|| "/v1/datasets/_apl".to_string());
        let format = opts.map(|o| o.format).unwrap_or_default();

        ApiRequest::post(target)
            .with_query("format", format.as_str())
            .with_json(&AplRequest::new(apl, opts))
    }
}

/// Async API client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Client {
    transport: HttpTransport,
    routes: Arc<Routes>,
}

impl Client {
    /// Validate `config` and build the HTTP transport
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate().map_err(ClientError::Config)?;

        if let Some(org_id) = &config.org_id {
            info!("Using organization id: {}", org_id);
        }

        Ok(Self {
            transport: HttpTransport::new(&config)?,
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

    pub(crate) fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    /// Ingest a raw payload into the named dataset
    pub async fn ingest(
        &self,
        dataset: &str,
        payload: Vec<u8>,
        content_type: ContentType,
        encoding: ContentEncoding,
        opts: Option<&IngestOptions>,
    ) -> Result<IngestStatus> {
        let request = self.routes.ingest(dataset, payload, content_type, encoding, opts)?;
        let status: IngestStatus = self.transport.send_json(&request).await?;
        debug!(
            "Ingested {} events into {} ({} failed)",
            status.ingested, dataset, status.failed
        );
        Ok(status)
    }

    /// Ingest JSON events, encoded as gzip NDJSON
    pub async fn ingest_events(
        &self,
        dataset: &str,
        events: &[Map<String, Value>],
    ) -> Result<IngestStatus> {
        let payload = encoder::encode_events(events)?;
        self.ingest(dataset, payload, ContentType::NdJson, ContentEncoding::Gzip, None)
            .await
    }

    /// Ingest log records, encoded as gzip NDJSON
    pub async fn ingest_records(
        &self,
        dataset: &str,
        records: &[LogRecord],
    ) -> Result<IngestStatus> {
        let payload = encoder::encode(records)?;
        self.ingest(dataset, payload, ContentType::NdJson, ContentEncoding::Gzip, None)
            .await
    }

    /// Run an APL query
    pub async fn query(&self, apl: &str, opts: Option<&AplOptions>) -> Result<QueryResult> {
        let request = self.routes.query(apl, opts)?;
        debug!("Sending query {}", apl);

        let response = self.transport.send(&request).await?;
        let saved_query_id = response
            .headers()
            .get(QUERY_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await?;
        let mut result: QueryResult = serde_json::from_slice(&bytes)?;
        result.saved_query_id = saved_query_id;

        info!("Received query result with query_id: {:?}", result.saved_query_id);
        Ok(result)
    }

    /// Dataset management calls
    pub fn datasets(&self) -> Datasets<'_> {
        Datasets { client: self }
    }
}

/// Dataset management through an async [`Client`]
#[derive(Debug, Clone, Copy)]
pub struct Datasets<'a> {
    client: &'a Client,
}

impl Datasets<'_> {
    /// Fetch one dataset by id
    pub async fn get(&self, id: &str) -> Result<Dataset> {
        self.client.transport().send_json(&datasets::get(id)).await
    }

    /// All datasets visible to the token
    pub async fn list(&self) -> Result<Vec<Dataset>> {
        self.client.transport().send_json(&datasets::list()).await
    }

    /// Create a dataset
    pub async fn create(&self, name: &str, description: &str) -> Result<Dataset> {
        self.client
            .transport()
            .send_json(&datasets::create(name, description)?)
            .await
    }

    /// Replace a dataset's description
    pub async fn update(&self, id: &str, description: &str) -> Result<Dataset> {
        self.client
            .transport()
            .send_json(&datasets::update(id, description)?)
            .await
    }

    /// Delete a dataset and its data
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.client.transport().send(&datasets::delete(id)).await?;
        Ok(())
    }

    /// Drop data older than `max_duration`
    pub async fn trim(&self, id: &str, max_duration: Duration) -> Result<()> {
        self.client
            .transport()
            .send(&datasets::trim(id, max_duration)?)
            .await?;
        Ok(())
    }
}
