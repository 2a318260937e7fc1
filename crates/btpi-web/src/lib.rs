//! Axum HTTP surface: `/data`, the API proxy routes and static files.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    handler::HandlerWithoutStateExt,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use btpi_core::{http_date, ResponseFormat, StatusChange};
use btpi_net::ProxyTranslator;
use btpi_sync::ReportService;
use chrono::Utc;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "btpi-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ReportService>,
    pub proxy: ProxyTranslator,
    pub public_root: PathBuf,
}

impl AppState {
    pub fn new(service: Arc<ReportService>, proxy: ProxyTranslator, public_root: impl Into<PathBuf>) -> Self {
        Self {
            service,
            proxy,
            public_root: public_root.into(),
        }
    }
}

type Params = Query<Vec<(String, String)>>;

pub fn app(state: AppState) -> Router {
    let static_files = ServeDir::new(&state.public_root).not_found_service(not_found_handler.into_service());
    Router::new()
        .route("/data", get(get_data_handler).post(post_data_handler))
        .route("/proxy-xml", get(proxy_xml_handler))
        .route("/proxy-json", get(proxy_json_handler))
        .fallback_service(static_files)
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "server listening at http://localhost:{port}");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn post_data_handler(State(state): State<Arc<AppState>>) -> Response {
    let outcome = state.service.run_all().await;
    let registry = state.service.registry();
    if outcome.succeeded {
        let last_modified = registry
            .first_last_modified()
            .await
            .unwrap_or_else(|| http_date(Utc::now()));
        return (StatusCode::OK, [(header::LAST_MODIFIED, last_modified)], "OK").into_response();
    }

    let msg = match registry.first_error().await {
        Some(q) => format!("Failed to create file {} with error {}", q.file, q.error),
        None => "undefined error".to_string(),
    };
    error!(%msg, "run-all request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Internal server error in /data route: {msg}"),
    )
        .into_response()
}

/// Runs a single query by `Name` and answers with its output file.
/// The parameter name is case-insensitive, the query name is not.
async fn get_data_handler(State(state): State<Arc<AppState>>, Query(params): Params) -> Response {
    let Some(name) = params
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("name"))
        .map(|(_, value)| value.clone())
    else {
        return message(
            StatusCode::BAD_REQUEST,
            "No query name specified. Please provide a query name using the Name parameter.",
        );
    };
    info!(query = %name, "received request for query");

    let Some((outcome, query)) = state.service.run_one(&name).await else {
        warn!(query = %name, "query not found");
        return message(StatusCode::NOT_FOUND, &format!("Query '{name}' not found"));
    };

    let failure = match outcome.update_for(&name) {
        Some(StatusChange::Failed { error }) => Some(error.clone()),
        _ if !outcome.succeeded => Some("query run failed; check log for details".to_string()),
        _ => None,
    };
    if let Some(err) = failure {
        return server_error(&format!("Internal server error in the /data route: {err}"));
    }

    let last_modified = if query.last_modified.is_empty() {
        http_date(Utc::now())
    } else {
        query.last_modified.clone()
    };

    if !query.has_output() {
        return (
            [(header::LAST_MODIFIED, last_modified.clone())],
            Json(json!({ "Name": query.name, "LastModified": last_modified })),
        )
            .into_response();
    }

    match tokio::fs::read(&query.file).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "application/json".to_string()),
                (header::LAST_MODIFIED, last_modified),
            ],
            bytes,
        )
            .into_response(),
        Err(err) => {
            error!(query = %name, file = %query.file, error = %err, "reading query output failed");
            server_error(&format!(
                "Internal server error in the /data route: unable to read {}",
                query.file
            ))
        }
    }
}

async fn proxy_xml_handler(State(state): State<Arc<AppState>>, Query(params): Params) -> Response {
    proxy(&state, &params, ResponseFormat::Xml).await
}

async fn proxy_json_handler(State(state): State<Arc<AppState>>, Query(params): Params) -> Response {
    proxy(&state, &params, ResponseFormat::Json).await
}

async fn proxy(state: &AppState, params: &[(String, String)], format: ResponseFormat) -> Response {
    match state.proxy.fetch(params, format).await {
        Ok(Some(value)) => Json(value).into_response(),
        Ok(None) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "No api parameter specified" })),
        )
            .into_response(),
        Err(err) => {
            error!(%format, error = %err, "proxy error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn not_found_handler(uri: Uri) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "url": uri.to_string(),
            "message": "The page you are looking for does not exist."
        })),
    )
        .into_response()
}

fn message(status: StatusCode, text: &str) -> Response {
    (status, Json(json!({ "message": text }))).into_response()
}

fn server_error(text: &str) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!(text))).into_response()
}
