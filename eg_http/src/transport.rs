//! ABOUTME: The request-execution capability the instrumented client wraps
//! ABOUTME: Implemented for reqwest::Client; test doubles implement it directly

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Request, Response};

/// Executes a fully built request
#[async_trait]
pub trait HttpTransport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn execute(&self, request: Request) -> Result<Response, Self::Error>;
}

#[async_trait]
impl HttpTransport for Client {
    type Error = reqwest::Error;

    async fn execute(&self, request: Request) -> Result<Response, Self::Error> {
        Client::execute(self, request).await
    }
}

#[async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for Arc<T> {
    type Error = T::Error;

    async fn execute(&self, request: Request) -> Result<Response, Self::Error> {
        (**self).execute(request).await
    }
}
