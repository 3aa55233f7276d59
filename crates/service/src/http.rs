use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tradetrace_core::error::{Result, TradeTraceError};
use tradetrace_core::ids::TraceId;
use tradetrace_core::model::span::{StoreStatus, TraceView};
use tradetrace_core::model::trade::NewTrade;
use tradetrace_core::traceparent::{TRACEPARENT_HEADER, TRACESTATE_HEADER};
use tradetrace_core::{SpanBuilder, SpanHandle, SpanKind, SpanStatus};
use tradetrace_store::Store;

use crate::propagation::{self, HeaderExtractor, HeaderInjector};
use crate::resolver::CausalityResolver;

#[derive(Clone)]
pub struct AppState {
    pub resolver: CausalityResolver<Store>,
    pub store: Store,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([
            axum::http::HeaderName::from_static(TRACEPARENT_HEADER),
            axum::http::HeaderName::from_static(TRACESTATE_HEADER),
        ]);
    Router::new()
        .route("/api/trades", get(list_trades).post(create_trade))
        .route("/api/trades/{id}", get(get_trade))
        .route("/api/settlement/{id}/status", get(settlement_status))
        .route("/api/traces/{trace_id}", get(get_trace))
        .route("/api/status", get(status))
        .route("/health", get(health))
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .on_request(tower_http::trace::DefaultOnRequest::new().level(Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

/// Error body `{"error": "..."}` with a status derived from the error kind.
#[derive(Debug)]
pub struct ApiError(pub TradeTraceError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            TradeTraceError::InvalidArgument(_) | TradeTraceError::Parse(_) => {
                StatusCode::BAD_REQUEST
            }
            TradeTraceError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<TradeTraceError> for ApiError {
    fn from(err: TradeTraceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Starts the request's server span, parented on inbound trace headers.
fn server_span(state: &AppState, headers: &HeaderMap, route: &str) -> SpanHandle {
    let parent = propagation::extract(&HeaderExtractor(headers));
    state.resolver.tracer().start(
        &parent,
        SpanBuilder::new(route)
            .with_kind(SpanKind::Server)
            .with_attribute("http.route", route),
    )
}

/// Ends `span` and renders `result`, stamping the span's traceparent on the
/// response.
fn finish<T: Serialize>(mut span: SpanHandle, result: Result<(StatusCode, T)>) -> Response {
    let mut response = match result {
        Ok((status, body)) => {
            span.set_status(SpanStatus::Ok);
            (status, Json(body)).into_response()
        }
        Err(err) => {
            let err = ApiError(err);
            if err.status().is_server_error() {
                span.record_error(&err.0);
            }
            err.into_response()
        }
    };
    span.set_attribute("http.response.status_code", response.status().as_u16());
    propagation::inject(&span.context(), &mut HeaderInjector(response.headers_mut()));
    span.end();
    response
}

async fn create_trade(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: std::result::Result<Json<NewTrade>, JsonRejection>,
) -> Response {
    let span = server_span(&state, &headers, "POST /api/trades");
    let result = match body {
        Ok(Json(request)) => state
            .resolver
            .create_trade(&span.context(), request)
            .await
            .map(|trade| (StatusCode::CREATED, trade)),
        Err(rejection) => Err(TradeTraceError::InvalidArgument(rejection.body_text())),
    };
    finish(span, result)
}

async fn list_trades(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let span = server_span(&state, &headers, "GET /api/trades");
    let result = state
        .resolver
        .list_trades()
        .await
        .map(|trades| (StatusCode::OK, trades));
    finish(span, result)
}

async fn get_trade(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mut span = server_span(&state, &headers, "GET /api/trades/{id}");
    span.set_attribute("trade.id", id.as_str());
    let result = match state.resolver.get_trade(&id).await {
        Ok(Some(trade)) => Ok((StatusCode::OK, trade)),
        Ok(None) => Err(TradeTraceError::NotFound(format!("trade {id}"))),
        Err(err) => Err(err),
    };
    finish(span, result)
}

async fn settlement_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mut span = server_span(&state, &headers, "GET /api/settlement/{id}/status");
    span.set_attribute("trade.id", id.as_str());
    let result = match state.resolver.settlement_status(&span.context(), &id).await {
        Ok(Some(view)) => Ok((StatusCode::OK, view)),
        Ok(None) => Err(TradeTraceError::NotFound(format!("trade {id}"))),
        Err(err) => Err(err),
    };
    finish(span, result)
}

async fn get_trace(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
) -> std::result::Result<Json<TraceView>, ApiError> {
    let trace_id = TraceId::parse(trace_id.trim())?;
    Ok(Json(state.store.get_trace(&trace_id.to_string())?))
}

#[derive(Debug, Serialize)]
struct ServiceStatus {
    #[serde(flatten)]
    store: StoreStatus,
    queue: String,
    queue_depth: usize,
    in_flight: usize,
    dead_letters: usize,
}

async fn status(
    State(state): State<AppState>,
) -> std::result::Result<Json<ServiceStatus>, ApiError> {
    let broker = state.resolver.broker();
    let queue = state.resolver.queue();
    Ok(Json(ServiceStatus {
        store: state.store.status()?,
        queue: queue.to_string(),
        queue_depth: broker.depth(queue),
        in_flight: broker.in_flight(queue),
        dead_letters: broker.dead_letter_count(queue),
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
