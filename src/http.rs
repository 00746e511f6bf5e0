use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Callback type for recording request metrics.
/// Receives (endpoint_name, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Failure of a JSON request.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("unexpected status {status} from {path}: {body}")]
    Status {
        status: StatusCode,
        path: String,
        body: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RequestError {
    /// Whether the server answered 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

/// Shared HTTP/JSON plumbing for the remote collaborators.
pub struct JsonClient {
    http: reqwest::Client,
    base: Url,
    metrics: Option<MetricsCallback>,
}

/// Appends path segments to `base`, percent-encoding each one so keys
/// containing `/`, `?` or `#` stay inside their segment.
pub fn join_segments<S: AsRef<str>>(base: &Url, segments: &[S]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| anyhow!("endpoint {base} cannot carry a path"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

impl JsonClient {
    /// Builds a client with the given timeout (10s when zero).
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let timeout = if timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            timeout
        };

        let base = Url::parse(endpoint).with_context(|| format!("parsing endpoint {endpoint}"))?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            base,
            metrics: None,
        })
    }

    /// The configured endpoint.
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, endpoint: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(endpoint, status, duration);
        }
    }

    /// Perform a GET request and deserialize the JSON response.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        url: Url,
    ) -> Result<T, RequestError> {
        let path = url.path().to_string();
        let request = self.http.get(url).header("Accept", "application/json");
        self.send(endpoint, &path, request).await
    }

    /// Perform a POST request with a JSON body and deserialize the response.
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, RequestError> {
        let request = self
            .http
            .post(self.base.clone())
            .header("Accept", "application/json")
            .json(body);
        self.send(endpoint, "/", request).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, RequestError> {
        let start = Instant::now();

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.record_request(endpoint, "error", start.elapsed());
                return Err(anyhow::Error::new(e)
                    .context(format!("requesting {path}"))
                    .into());
            }
        };

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let label = if status == StatusCode::NOT_FOUND {
                "not_found"
            } else {
                "error"
            };
            self.record_request(endpoint, label, start.elapsed());
            return Err(RequestError::Status {
                status,
                path: path.to_string(),
                body,
            });
        }

        let result: T = response
            .json()
            .await
            .with_context(|| format!("decoding response from {path}"))?;

        self.record_request(endpoint, "success", start.elapsed());

        Ok(result)
    }
}
