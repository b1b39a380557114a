// src/server.rs
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::backfill::{BackfillRequest, Backfiller};
use crate::utils::error::{AppError, PortalError};

#[derive(Clone)]
pub struct AppState {
    pub backfiller: Arc<Backfiller>,
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Request(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Portal(PortalError::CompanyNotFound(_)) => StatusCode::NOT_FOUND,
            AppError::Portal(_) | AppError::Storage(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Config(_) | AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "status": "error", "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/backfill", post(backfill))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn backfill(
    State(state): State<AppState>,
    payload: Result<Json<BackfillRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, Response> {
    let Json(request) = payload.map_err(|rejection| {
        let body = Json(json!({ "status": "error", "error": rejection.body_text() }));
        (StatusCode::UNPROCESSABLE_ENTITY, body).into_response()
    })?;

    tracing::info!(
        "Backfill requested: {} {}{}..{}{}",
        request.ticker, request.start_q, request.start_year, request.end_q, request.end_year
    );
    let report = state
        .backfiller
        .execute(&request)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(Json(json!({ "status": "ok", "report": report })))
}

/// Binds `addr` and serves until Ctrl-C.
pub async fn serve(addr: &str, state: AppState) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::testing::*;
    use crate::quartr::models::{DocumentKind, Period, Quarter};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app_with(portal: ScriptedPortal) -> (Router, Arc<MemoryStore>) {
        app_with_timeout(portal, Duration::from_secs(30))
    }

    fn app_with_timeout(portal: ScriptedPortal, timeout: Duration) -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let backfiller = Backfiller::new(
            Arc::new(OneShotLauncher::new(portal)),
            store.clone(),
            credentials(),
            timeout,
            None,
        );
        (build_router(AppState { backfiller: Arc::new(backfiller) }), store)
    }

    async fn post_json(app: Router, body: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/backfill")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app_with(ScriptedPortal::default());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_backfill_ok_returns_report() {
        let portal = ScriptedPortal::default()
            .with_document(Period::new(2023, Quarter::Q2), DocumentKind::Transcript, SAMPLE_PDF)
            .with_quarter(Period::new(2023, Quarter::Q3));
        let (app, store) = app_with(portal);

        let (status, body) = post_json(
            app,
            r#"{"ticker":"nvda","start_year":2023,"end_year":2023,"start_q":"Q2","end_q":"Q3"}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["report"]["ticker"], "NVDA");
        assert_eq!(body["report"]["quarters_opened"], 2);
        assert_eq!(body["report"]["documents_stored"][0]["storage_path"], "pdfs/NVDA/2023-Q2/transcript.pdf");
        assert!(store.objects.lock().unwrap().contains_key("pdfs/NVDA/2023-Q2/transcript.pdf"));
    }

    #[tokio::test]
    async fn test_invalid_range_is_422() {
        let (app, _) = app_with(ScriptedPortal::default());
        let (status, body) = post_json(app, r#"{"ticker":"AAPL","start_year":2024,"end_year":2020}"#).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["status"], "error");
        assert!(body["error"].as_str().unwrap().contains("start_year 2024"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_422_json() {
        let (app, _) = app_with(ScriptedPortal::default());
        let (status, body) = post_json(app, r#"{"ticker":"AAPL"}"#).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_login_failure_is_502() {
        let (app, _) = app_with(ScriptedPortal::failing_login());
        let (status, body) = post_json(app, r#"{"ticker":"AAPL","start_year":2023,"end_year":2023}"#).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("Login failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_timeout_is_504() {
        let (app, _) = app_with_timeout(ScriptedPortal::hanging(), Duration::from_secs(5));
        let (status, body) = post_json(app, r#"{"ticker":"AAPL","start_year":2023,"end_year":2023}"#).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["status"], "error");
        assert!(body["error"].as_str().unwrap().contains("5s watchdog"));
    }

    #[tokio::test]
    async fn test_out_of_range_year_is_422() {
        let (app, _) = app_with(ScriptedPortal::default());
        let (status, body) =
            post_json(app, r#"{"ticker":"AAPL","start_year":-2147483648,"end_year":2147483647}"#).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("outside the supported range"));
    }
}
