use crate::app::{ DashboardCard, DASHBOARD_CARDS };
use crate::gateway::Gateway;
use crate::llm::GatewayError;
use crate::models::diagnosis::{ DiagnosisResult, ImageUpload };
use crate::server::ServiceContext;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    routing::{ get, post },
    Router,
    Json,
    extract::State,
    response::{ IntoResponse, Response },
    http::StatusCode,
};
use serde::{ Deserialize, Serialize };
use tower_http::cors::{ Any, CorsLayer };
use log::{ info, warn, error };

#[derive(Deserialize)]
pub struct DiagnoseRequest {
    pub data_url: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    credential_configured: bool,
    model: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Clone)]
struct ApiState {
    gateway: Arc<Gateway>,
    max_image_bytes: usize,
}

pub fn router(context: &ServiceContext) -> Router {
    let state = ApiState {
        gateway: Arc::new(context.new_gateway()),
        max_image_bytes: context.options.max_image_bytes,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/dashboard", get(dashboard_handler))
        .route("/api/diagnose", post(diagnose_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn start_http_server(
    http_port: u16,
    context: Arc<ServiceContext>
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", http_port).parse::<SocketAddr>()?;
    info!("Starting HTTP API server on: http://{}", addr);

    let app = router(&context);

    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    error!("HTTP server error: {}", e);
                }
            }
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
            }
        }
    });

    info!("HTTP server started");
    Ok(())
}

async fn health_handler(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        credential_configured: state.gateway.check_credential().is_none(),
        model: state.gateway.model(),
    })
}

async fn dashboard_handler() -> Json<Vec<DashboardCard>> {
    Json(DASHBOARD_CARDS.to_vec())
}

async fn diagnose_handler(
    State(state): State<ApiState>,
    Json(req): Json<DiagnoseRequest>
) -> Result<Json<DiagnosisResult>, Response> {
    let image = ImageUpload::from_data_url(&req.data_url)
        .and_then(|image| image.ensure_within(state.max_image_bytes).map(|_| image))
        .map_err(|e| {
            warn!("Rejected diagnosis upload: {}", e);
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        })?;

    info!("HTTP diagnose → {} ({} bytes)", image.mime_type(), image.len());
    state.gateway
        .diagnose(&image).await
        .map(Json)
        .map_err(|e| {
            error!("HTTP diagnose failed: {}", e);
            error_response(status_for(&e), e.to_string())
        })
}

pub fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::MissingCredential => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Transport(_) | GatewayError::Decode(_) => StatusCode::BAD_GATEWAY,
        GatewayError::Shape(_) => StatusCode::UNPROCESSABLE_ENTITY,
        GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
    }
}

fn error_response(code: StatusCode, message: String) -> Response {
    (code, Json(ErrorResponse { error: message })).into_response()
}
