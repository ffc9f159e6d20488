//! HTTP transport with bearer auth, retry with backoff and typed errors.
//!
//! [`HttpTransport`] drives requests on the tokio runtime and
//! [`BlockingTransport`] on the calling thread. Both share header
//! construction, response classification and the retry contract:
//! server errors, timeouts and connection failures are retried up to
//! [`RetryPolicy::max_attempts`] total attempts, any other non-2xx status
//! fails immediately.

use crate::config::{ClientConfig, RetryPolicy};
use crate::errors::{ClientError, Result};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Header scoping requests to an organization
pub const ORG_ID_HEADER: &str = "x-axiom-org-id";

/// A request against the API, independent of the HTTP driver.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the base URL, or an absolute URL
    pub target: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl ApiRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    pub fn put(target: impl Into<String>) -> Self {
        Self::new(Method::PUT, target)
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(Method::DELETE, target)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value)
            .map_err(|e| ClientError::Other(format!("invalid header value for {}: {}", name, e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_json<T: Serialize>(self, payload: &T) -> Result<Self> {
        Ok(self.with_body(serde_json::to_vec(payload)?))
    }

    /// Resolve the request target against a base URL
    pub fn url(&self, base_url: &str) -> String {
        if self.target.starts_with("http://") || self.target.starts_with("https://") {
            self.target.clone()
        } else {
            format!("{}{}", base_url.trim_end_matches('/'), self.target)
        }
    }
}

/// Headers sent with every request
pub fn default_headers(token: &str, org_id: Option<&str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| ClientError::Config("token contains invalid header characters".to_string()))?;
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("axiom-rs/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|e| ClientError::Other(e.to_string()))?,
    );

    if let Some(org_id) = org_id {
        let value = HeaderValue::from_str(org_id)
            .map_err(|_| {
                ClientError::Config("org_id contains invalid header characters".to_string())
            })?;
        headers.insert(HeaderName::from_static(ORG_ID_HEADER), value);
    }

    Ok(headers)
}

/// Build the typed error for a non-2xx response
pub fn api_error(status: StatusCode, body: &str) -> ClientError {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        message: Option<String>,
        error: Option<String>,
    }

    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message.or(b.error))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("HTTP {} error", status.as_u16()));

    ClientError::Api {
        status: status.as_u16(),
        message,
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Attempt counter and backoff for one `send` call.
#[derive(Debug)]
struct RetryState<'a> {
    policy: &'a RetryPolicy,
    attempt: u32,
}

impl<'a> RetryState<'a> {
    fn new(policy: &'a RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    fn begin(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    /// Delay before the next attempt, or the error once attempts are exhausted.
    fn next_delay(&self, failure: ClientError, url: &str) -> Result<Duration> {
        if self.attempt >= self.policy.max_attempts.max(1) {
            error!(
                "Request to {} failed after {} attempts: {}",
                url, self.attempt, failure
            );
            return Err(failure);
        }

        let delay = self.policy.backoff(self.attempt);
        warn!(
            "Request to {} failed (attempt {}), retrying in {}ms: {}",
            url,
            self.attempt,
            delay.as_millis(),
            failure
        );
        Ok(delay)
    }
}

/// Outcome of a single attempt
enum Attempt<R> {
    Success(R),
    Retryable(ClientError),
    Fatal(ClientError),
}

/// Async HTTP transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(default_headers(&config.token, config.org_id.as_deref())?)
            .build()
            .map_err(ClientError::Http)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            retry: config.retry.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a request, retrying transient failures.
    ///
    /// Returns the response unmodified when its status is 2xx.
    pub async fn send(&self, request: &ApiRequest) -> Result<reqwest::Response> {
        let url = request.url(&self.base_url);
        let mut state = RetryState::new(&self.retry);

        loop {
            let attempt = state.begin();
            debug!("{} {} (attempt {})", request.method, url, attempt);

            let failure = match self.attempt(&url, request).await {
                Attempt::Success(response) => return Ok(response),
                Attempt::Fatal(err) => return Err(err),
                Attempt::Retryable(err) => err,
            };

            let delay = state.next_delay(failure, &url)?;
            tokio::time::sleep(delay).await;
        }
    }

    /// Send a request and deserialize the JSON response body.
    pub async fn send_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T> {
        let response = self.send(request).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn attempt(&self, url: &str, request: &ApiRequest) -> Attempt<reqwest::Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(request.headers.clone());

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        match builder.send().await {
            Ok(response) if response.status().is_success() => Attempt::Success(response),
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let err = api_error(status, &body);
                if is_retryable_status(status) {
                    Attempt::Retryable(err)
                } else {
                    Attempt::Fatal(err)
                }
            }
            Err(err) if is_retryable_error(&err) => Attempt::Retryable(ClientError::Http(err)),
            Err(err) => Attempt::Fatal(ClientError::Http(err)),
        }
    }
}

/// Blocking HTTP transport
///
/// Must not be used from within an async runtime worker; use
/// [`HttpTransport`] there.
#[derive(Debug, Clone)]
pub struct BlockingTransport {
    client: reqwest::blocking::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl BlockingTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .default_headers(default_headers(&config.token, config.org_id.as_deref())?)
            .build()
            .map_err(ClientError::Http)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            retry: config.retry.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn send(&self, request: &ApiRequest) -> Result<reqwest::blocking::Response> {
        let url = request.url(&self.base_url);
        let mut state = RetryState::new(&self.retry);

        loop {
            let attempt = state.begin();
            debug!("{} {} (attempt {})", request.method, url, attempt);

            let failure = match self.attempt(&url, request) {
                Attempt::Success(response) => return Ok(response),
                Attempt::Fatal(err) => return Err(err),
                Attempt::Retryable(err) => err,
            };

            let delay = state.next_delay(failure, &url)?;
            std::thread::sleep(delay);
        }
    }

    pub fn send_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T> {
        let response = self.send(request)?;
        let bytes = response.bytes()?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn attempt(&self, url: &str, request: &ApiRequest) -> Attempt<reqwest::blocking::Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(request.headers.clone());

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        match builder.send() {
            Ok(response) if response.status().is_success() => Attempt::Success(response),
            Ok(response) => {
                let status = response.status();
                let body = response.text().unwrap_or_default();
                let err = api_error(status, &body);
                if is_retryable_status(status) {
                    Attempt::Retryable(err)
                } else {
                    Attempt::Fatal(err)
                }
            }
            Err(err) if is_retryable_error(&err) => Attempt::Retryable(ClientError::Http(err)),
            Err(err) => Attempt::Fatal(ClientError::Http(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(url: &str) -> ClientConfig {
        ClientConfig::new("xaat-test-token")
            .with_url(url)
            .with_org_id("org-1")
            .with_timeout(Duration::from_secs(5))
            .with_retry(RetryPolicy {
                max_attempts: 3,
                backoff_base: Duration::from_millis(5),
                jitter: false,
            })
    }

    async fn request_count(server: &MockServer) -> usize {
        server.received_requests().await.unwrap_or_default().len()
    }

    #[test]
    fn test_request_url_resolution() {
        let relative = ApiRequest::get("/v1/datasets");
        assert_eq!(relative.url("https://api.example.com/"), "https://api.example.com/v1/datasets");

        let absolute = ApiRequest::post("https://edge.example.com/v1/ingest/logs");
        assert_eq!(
            absolute.url("https://api.example.com"),
            "https://edge.example.com/v1/ingest/logs"
        );
    }

    #[test]
    fn test_api_error_message() {
        let err = api_error(StatusCode::BAD_REQUEST, r#"{"message":"invalid dataset"}"#);
        assert!(matches!(
            err,
            ClientError::Api { status: 400, ref message } if message == "invalid dataset"
        ));

        let err = api_error(StatusCode::BAD_GATEWAY, "<html>oops</html>");
        assert!(matches!(
            err,
            ClientError::Api { status: 502, ref message } if message == "HTTP 502 error"
        ));
    }

    #[tokio::test]
    async fn test_sends_auth_and_org_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/datasets"))
            .and(header("authorization", "Bearer xaat-test-token"))
            .and(header("x-axiom-org-id", "org-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&test_config(&server.uri())).unwrap();
        let body: serde_json::Value =
            transport.send_json(&ApiRequest::get("/v1/datasets")).await.unwrap();
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&test_config(&server.uri())).unwrap();
        let response = transport.send(&ApiRequest::post("/v1/datasets/logs/ingest")).await;

        tokio_test::assert_ok!(response);
        assert_eq!(request_count(&server).await, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({"message": "boom"})))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&test_config(&server.uri())).unwrap();
        let err = transport
            .send(&ApiRequest::post("/v1/datasets/logs/ingest"))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Api { status: 500, ref message } if message == "boom"));
        assert_eq!(request_count(&server).await, 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "not found"})))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&test_config(&server.uri())).unwrap();
        let err = transport.send(&ApiRequest::get("/v1/datasets/missing")).await.unwrap_err();

        assert_eq!(err.status(), Some(404));
        assert_eq!(request_count(&server).await, 1);
    }

    #[tokio::test]
    async fn test_connection_failure_is_retried_then_http_error() {
        let config = test_config("http://127.0.0.1:1").with_retry(RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(50),
            jitter: false,
        });
        let transport = HttpTransport::new(&config).unwrap();

        let started = std::time::Instant::now();
        let err = transport.send(&ApiRequest::get("/v1/datasets")).await.unwrap_err();

        assert!(matches!(err, ClientError::Http(_)));
        // 50ms + 100ms of backoff only happen if all three attempts ran.
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_dropped_connections_use_the_attempt_cap() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                drop(socket);
            }
        });

        let transport = HttpTransport::new(&test_config(&format!("http://{}", addr))).unwrap();
        let err = transport.send(&ApiRequest::get("/v1/datasets")).await.unwrap_err();

        assert!(matches!(err, ClientError::Http(_)));
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blocking_transport_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ingested": 1})))
            .mount(&server)
            .await;

        let config = test_config(&server.uri());
        let body: serde_json::Value = tokio::task::spawn_blocking(move || {
            let transport = BlockingTransport::new(&config).unwrap();
            transport.send_json(&ApiRequest::post("/v1/datasets/logs/ingest"))
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(body["ingested"], json!(1));
        assert_eq!(request_count(&server).await, 3);
    }
}
