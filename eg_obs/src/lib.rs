//! ABOUTME: Scrape endpoint for the shared metric registry
//! ABOUTME: Serves /metrics in OpenMetrics text and a /healthz liveness check

use std::sync::Arc;

use actix_web::{
    dev::{ServiceRequest, ServiceResponse},
    middleware::Logger,
    web, App, HttpResponse, HttpServer, Result as ActixResult,
};
use eg_config::ObsConfig;
use eg_core::{Error, Result};
use eg_metrics::MetricsRegistry;
use serde_json::json;

pub const OPENMETRICS_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Application state for the scrape endpoint
#[derive(Debug, Clone)]
pub struct ObsState {
    pub registry: Arc<MetricsRegistry>,
}

impl ObsState {
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }
}

impl Default for ObsState {
    /// Serve the process-wide registry
    fn default() -> Self {
        Self::new(MetricsRegistry::global())
    }
}

/// Health endpoint handler
async fn health() -> ActixResult<HttpResponse> {
    tracing::debug!("Health check requested");
    Ok(HttpResponse::Ok().json(json!({
        "status": "ok"
    })))
}

/// Metrics endpoint handler
async fn metrics(state: web::Data<ObsState>) -> ActixResult<HttpResponse> {
    tracing::debug!("Metrics scrape requested");

    match state.registry.encode() {
        Ok(metrics_text) => {
            tracing::debug!("Metrics encoded successfully, {} bytes", metrics_text.len());
            Ok(HttpResponse::Ok()
                .content_type(OPENMETRICS_CONTENT_TYPE)
                .body(metrics_text))
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            Ok(HttpResponse::InternalServerError().json(json!({
                "error": "Failed to encode metrics"
            })))
        }
    }
}

/// Create the scrape service factory
pub fn create_service(
    state: ObsState,
) -> App<
    impl actix_web::dev::ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl actix_web::body::MessageBody>,
        Error = actix_web::Error,
        InitError = (),
    >,
> {
    App::new()
        .app_data(web::Data::new(state))
        .wrap(Logger::default())
        .service(
            web::scope("")
                .route("/healthz", web::get().to(health))
                .route("/metrics", web::get().to(metrics)),
        )
}

/// Serve the scrape endpoint until the server stops
pub async fn start_server(bind_addr: &str, state: ObsState) -> Result<()> {
    tracing::info!("Starting metrics endpoint on {}", bind_addr);

    HttpServer::new(move || create_service(state.clone()))
        .bind(bind_addr)
        .map_err(|e| Error::Config(format!("Failed to bind server: {}", e)))?
        .run()
        .await
        .map_err(|e| Error::Config(format!("Server error: {}", e)))?;

    Ok(())
}

/// Serve the scrape endpoint on the configured address
pub async fn start_from_config(config: &ObsConfig, state: ObsState) -> Result<()> {
    start_server(&config.bind_addr(), state).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test;
    use eg_metrics::Descriptor;
    use eg_metrics::{MetricSource, Sample};

    #[derive(Debug)]
    struct QueueDepth;

    const DEPTH: Descriptor = Descriptor::gauge("queue_depth", "Jobs waiting.");

    impl MetricSource for QueueDepth {
        fn describe(&self) -> &[Descriptor] {
            std::slice::from_ref(&DEPTH)
        }

        fn collect(&self) -> Vec<Sample> {
            vec![DEPTH.sample(3.0)]
        }
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let state = ObsState::new(Arc::new(MetricsRegistry::new()));
        let app = test::init_service(create_service(state)).await;

        let req = test::TestRequest::get().uri("/healthz").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json"
        );

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_metrics_endpoint_includes_sources() {
        let registry = Arc::new(MetricsRegistry::new());
        let registration = registry
            .register_source(
                vec![("queue".to_string(), "mail".to_string())],
                Arc::new(QueueDepth),
            )
            .unwrap();
        let app = test::init_service(create_service(ObsState::new(registry.clone()))).await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            OPENMETRICS_CONTENT_TYPE
        );

        let body = test::read_body(resp).await;
        let body_str = std::str::from_utf8(&body).unwrap();
        assert!(body_str.contains("queue_depth{queue=\"mail\"} 3.0"));
        assert!(body_str.ends_with("# EOF\n"));

        registry.unregister(&registration);
        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body = test::call_and_read_body(&app, req).await;
        assert!(!std::str::from_utf8(&body).unwrap().contains("queue_depth{"));
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let state = ObsState::new(Arc::new(MetricsRegistry::new()));
        let app = test::init_service(create_service(state)).await;

        let req = test::TestRequest::get().uri("/readyz").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
    }
}
