use crate::model::{FilterRequest, FilterResponse};
use crate::service::FilterService;
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

/// Body returned once a request has been filtered and stored
pub const PROCESSING_MESSAGE: &str = "Your request is being processed.";

/// Body returned when the request JSON cannot be decoded
pub const UNMARSHAL_ERROR_MESSAGE: &str = "Error when attempting to unmarshal request body.";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<FilterService>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/filter", post(filter_csv))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "csv-filter"
    }))
}

/// Run the filter pipeline for the posted request
#[instrument(skip_all)]
async fn filter_csv(
    State(state): State<AppState>,
    payload: Result<Json<FilterRequest>, JsonRejection>,
) -> (StatusCode, Json<FilterResponse>) {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "Rejected filter request body");
            return (
                StatusCode::BAD_REQUEST,
                Json(FilterResponse::new(UNMARSHAL_ERROR_MESSAGE)),
            );
        }
    };

    info!(request = %request, "Received filter request");

    match state.service.handle(&request).await {
        Ok(_) => (StatusCode::OK, Json(FilterResponse::new(PROCESSING_MESSAGE))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(FilterResponse::new(e.to_string())),
        ),
    }
}

/// Serve the API until `shutdown` is cancelled, then drain open requests
pub async fn start_api_server(
    state: AppState,
    bind_addr: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state);

    info!(address = %bind_addr, "Starting filter API server");

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    info!("Filter API server stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::DimensionProcessor;
    use crate::producer::{DeliveryResult, MockNotificationPublisher};
    use crate::service::FilterSettings;
    use crate::storage::testing::MemoryStore;

    const INPUT_URL: &str = "s3://input-bucket/data.csv";

    fn state(store: MemoryStore, publishes: usize) -> AppState {
        let mut publisher = MockNotificationPublisher::new();
        publisher.expect_publish().times(publishes).returning(|_| {
            Ok(DeliveryResult {
                topic: "transform-request".to_string(),
                partition: 0,
                offset: 0,
            })
        });

        let service = FilterService::new(
            Arc::new(store),
            Arc::new(DimensionProcessor::new()),
            Arc::new(publisher),
            FilterSettings {
                file_extension: "csv".to_string(),
                intermediate_bucket: "filter-bucket".to_string(),
                scratch_dir: std::env::temp_dir(),
            },
        );

        AppState {
            service: Arc::new(service),
        }
    }

    fn body(json: &str) -> Result<Json<FilterRequest>, JsonRejection> {
        Json::from_bytes(json.as_bytes())
    }

    #[tokio::test]
    async fn test_filter_success() {
        let state = state(MemoryStore::new().with_object(INPUT_URL, "a,b\nc,d\n"), 1);

        let (status, Json(response)) = filter_csv(
            State(state),
            body(r#"{"requestId": "r1", "inputUrl": "s3://input-bucket/data.csv", "outputUrl": "s3://out/final.csv"}"#),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(response.message, PROCESSING_MESSAGE);
    }

    #[tokio::test]
    async fn test_filter_malformed_body() {
        let state = state(MemoryStore::new(), 0);

        let (status, Json(response)) = filter_csv(State(state), body("{not json")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response.message, UNMARSHAL_ERROR_MESSAGE);
    }

    #[tokio::test]
    async fn test_filter_invalid_location_is_unmarshal_error() {
        let state = state(MemoryStore::new(), 0);

        let (status, Json(response)) = filter_csv(
            State(state),
            body(r#"{"inputUrl": "not a url", "outputUrl": "s3://out/final.csv"}"#),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response.message, UNMARSHAL_ERROR_MESSAGE);
    }

    #[tokio::test]
    async fn test_filter_pipeline_failure() {
        let state = state(MemoryStore::new(), 0);

        let (status, Json(response)) = filter_csv(
            State(state),
            body(r#"{"inputUrl": "s3://input-bucket/data.json", "outputUrl": "s3://out/final.csv"}"#),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response.message, "Unsupported file type.");
    }
}
