//! ABOUTME: Scripted HTTP transport that answers from a closure instead of the network
//! ABOUTME: Counts calls and can hold each call open for a fixed delay

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eg_http::HttpTransport;
use reqwest::{Request, Response};

type Responder = dyn Fn(&Request) -> Result<u16, String> + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("mock transport error: {0}")]
pub struct MockTransportError(pub String);

/// Answers each request with the status code (or error) the responder returns
#[derive(Clone)]
pub struct MockTransport {
    responder: Arc<Responder>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("delay", &self.delay)
            .field("calls", &self.calls())
            .finish()
    }
}

impl MockTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&Request) -> Result<u16, String> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always answer with `status`
    pub fn status(status: u16) -> Self {
        Self::new(move |_| Ok(status))
    }

    /// Always fail before producing a response
    pub fn failing(message: &str) -> Self {
        let message = message.to_string();
        Self::new(move |_| Err(message.clone()))
    }

    /// Hold every call open for `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    type Error = MockTransportError;

    async fn execute(&self, request: Request) -> Result<Response, Self::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let status = (self.responder)(&request).map_err(MockTransportError)?;
        let response = http::Response::builder()
            .status(status)
            .body("")
            .map_err(|e| MockTransportError(e.to_string()))?;

        Ok(Response::from(response))
    }
}
