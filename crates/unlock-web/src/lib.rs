//! Axum surface: completion acknowledgement and catalog listing.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use unlock_core::{Catalog, CatalogEntry, CatalogFilter, CompletionAck, CompletionNotice};
use unlock_session::{load_catalog, SessionConfig};

pub const CRATE_NAME: &str = "unlock-web";

pub const ACK_RECORDED: &str = "Offer completion recorded";
pub const ACK_NOT_COMPLETED: &str = "Offer not completed";
pub const ACK_FAILED: &str = "Failed to process completion";

#[derive(Debug, Clone)]
pub struct AppState {
    pub catalog: Catalog,
}

impl AppState {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(Catalog::builtin())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CatalogQuery {
    filter: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/offer-completed",
            get(offer_completed_info_handler).post(offer_completed_handler),
        )
        .route("/api/catalog", get(catalog_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("UNLOCK_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let catalog = load_catalog(&SessionConfig::from_env())?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "unlock web surface listening");
    axum::serve(listener, app(AppState::new(catalog))).await?;
    Ok(())
}

/// Acknowledges a completion report. Nothing is verified or persisted.
pub fn acknowledge(notice: &CompletionNotice) -> CompletionAck {
    if notice.is_completed() {
        info!(
            offer_id = %notice.offer_id,
            user_ip = %notice.user_ip,
            game_name = %notice.game_name,
            "offer completed"
        );
        CompletionAck {
            success: true,
            message: ACK_RECORDED.to_string(),
        }
    } else {
        CompletionAck {
            success: false,
            message: ACK_NOT_COMPLETED.to_string(),
        }
    }
}

async fn offer_completed_handler(body: Bytes) -> Response {
    match serde_json::from_slice::<CompletionNotice>(&body) {
        Ok(notice) => Json(acknowledge(&notice)).into_response(),
        Err(err) => {
            warn!(error = %err, "rejecting completion report");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": ACK_FAILED })),
            )
                .into_response()
        }
    }
}

async fn offer_completed_info_handler() -> Response {
    Json(json!({ "message": "Offer completion endpoint" })).into_response()
}

async fn catalog_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CatalogQuery>,
) -> Response {
    let filter = match query.filter.as_deref().unwrap_or_default().parse::<CatalogFilter>() {
        Ok(filter) => filter,
        Err(message) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response();
        }
    };
    let entries: Vec<CatalogEntry> = state.catalog.filtered(filter).into_iter().cloned().collect();
    Json(entries).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn body_json(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_completion(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/offer-completed")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn completed_status_is_recorded() {
        let resp = app(AppState::default())
            .oneshot(post_completion(
                r#"{"offer_id":"42","user_ip":"203.0.113.9","user_agent":"Mozilla/5.0","status":"completed","game_name":"Grow a Garden"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            json!({"success": true, "message": "Offer completion recorded"})
        );
    }

    #[tokio::test]
    async fn other_status_is_not_completed() {
        let resp = app(AppState::default())
            .oneshot(post_completion(r#"{"offer_id":"42","status":"pending"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            json!({"success": false, "message": "Offer not completed"})
        );
    }

    #[tokio::test]
    async fn numeric_status_is_not_completed() {
        let resp = app(AppState::default())
            .oneshot(post_completion(r#"{"offer_id":42,"status":5}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            json!({"success": false, "message": "Offer not completed"})
        );
    }

    #[tokio::test]
    async fn malformed_body_is_a_server_error() {
        let resp = app(AppState::default())
            .oneshot(post_completion("{not json"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(resp).await,
            json!({"error": "Failed to process completion"})
        );
    }

    #[tokio::test]
    async fn get_describes_the_endpoint() {
        let resp = app(AppState::default())
            .oneshot(
                Request::builder()
                    .uri("/api/offer-completed")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({"message": "Offer completion endpoint"}));
    }

    #[tokio::test]
    async fn catalog_filters_and_rejects_unknown_filter() {
        let app = app(AppState::default());

        let all = app
            .clone()
            .oneshot(Request::builder().uri("/api/catalog").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(all.status(), StatusCode::OK);
        assert_eq!(body_json(all).await.as_array().map(Vec::len), Some(4));

        let trending = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/catalog?filter=trending")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let ids: Vec<String> = body_json(trending)
            .await
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["99-nights-forest", "plants-vs-brainrots"]);

        let bad = app
            .oneshot(
                Request::builder()
                    .uri("/api/catalog?filter=popular")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }
}
