//! ABOUTME: HTTP client decorator that records latency, in-flight, and status metrics
//! ABOUTME: Responses and transport errors pass through to the caller unchanged

use eg_config::HttpClientConfig;
use eg_core::{Error, Result};
use eg_metrics::MetricsRegistry;
use reqwest::{
    header::{HeaderValue, CONTENT_TYPE},
    Body, Client, Method, Request, Response, Url,
};
use tracing::debug;

use crate::error::RequestError;
use crate::metrics::{HttpClientMetrics, RequestLabels};
use crate::transport::HttpTransport;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Wraps an [`HttpTransport`] and measures every request it executes
#[derive(Debug, Clone)]
pub struct InstrumentedClient<T = Client> {
    inner: T,
    metrics: HttpClientMetrics,
}

impl InstrumentedClient<Client> {
    /// Build a reqwest client from configuration and instrument it
    pub fn from_config(config: &HttpClientConfig, registry: &MetricsRegistry) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Self::new(client, registry)
    }
}

impl<T: HttpTransport> InstrumentedClient<T> {
    /// Instrument `inner`, registering the outbound HTTP families if needed
    pub fn new(inner: T, registry: &MetricsRegistry) -> Result<Self> {
        let metrics = HttpClientMetrics::register(registry)?;
        Ok(Self::with_metrics(inner, metrics))
    }

    /// Instrument `inner` with already registered families
    pub fn with_metrics(inner: T, metrics: HttpClientMetrics) -> Self {
        Self { inner, metrics }
    }

    /// The wrapped transport
    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn metrics(&self) -> &HttpClientMetrics {
        &self.metrics
    }

    /// Execute `request` through the wrapped transport
    ///
    /// The in-flight gauge is raised for the duration of the call and one
    /// latency observation is recorded however the call ends. Status counters
    /// are only touched when a response came back.
    pub async fn execute(&self, request: Request) -> std::result::Result<Response, T::Error> {
        let labels = RequestLabels::for_request(&request);
        let _guard = self.metrics.track(&labels);

        match self.inner.execute(request).await {
            Ok(response) => {
                self.metrics.record_response(&labels, response.status());
                Ok(response)
            }
            Err(e) => {
                debug!(
                    method = %labels.method,
                    host = %labels.host,
                    error = %e,
                    "Outbound HTTP request failed"
                );
                Err(e)
            }
        }
    }

    pub async fn get(&self, url: &str) -> std::result::Result<Response, RequestError<T::Error>> {
        let request = build_request(Method::GET, url)?;
        self.execute(request).await.map_err(RequestError::Transport)
    }

    pub async fn head(&self, url: &str) -> std::result::Result<Response, RequestError<T::Error>> {
        let request = build_request(Method::HEAD, url)?;
        self.execute(request).await.map_err(RequestError::Transport)
    }

    pub async fn post<B>(
        &self,
        url: &str,
        content_type: &str,
        body: B,
    ) -> std::result::Result<Response, RequestError<T::Error>>
    where
        B: Into<Body>,
    {
        let mut request = build_request(Method::POST, url)?;
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_str(content_type)?);
        *request.body_mut() = Some(body.into());
        self.execute(request).await.map_err(RequestError::Transport)
    }

    /// POST `form` URL-encoded, with pairs sorted by key
    pub async fn post_form<K, V>(
        &self,
        url: &str,
        form: &[(K, V)],
    ) -> std::result::Result<Response, RequestError<T::Error>>
    where
        K: AsRef<str> + Sync,
        V: AsRef<str> + Sync,
    {
        self.post(url, FORM_CONTENT_TYPE, encode_form(form)).await
    }
}

fn build_request(method: Method, url: &str) -> std::result::Result<Request, url::ParseError> {
    let url = Url::parse(url)?;
    Ok(Request::new(method, url))
}

fn encode_form<K: AsRef<str>, V: AsRef<str>>(form: &[(K, V)]) -> String {
    let mut pairs: Vec<(&str, &str)> = form
        .iter()
        .map(|(k, v)| (k.as_ref(), v.as_ref()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}
