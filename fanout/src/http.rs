//! Signaling and monitoring HTTP API
//!
//! The signaling collaborator drives the registry through these routes;
//! monitoring reads `/stats`, `/metrics` and `/healthz`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fanout_sfu::{
    Candidate, ConnectivityError, ConnectivityParams, IceCredentials, KeyingMaterial,
    ParticipantId, ReceiverConstraints, RoomId, SessionId, Sfu, SfuError, SfuStats, SrtpKeys,
    StreamAnnouncement, StreamId, SubscriptionId, SubscriptionInfo,
};
use fanout_sfu::registry::RoomSummary;
use serde::{Deserialize, Serialize};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::error;

use crate::metrics::SfuMetrics;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

#[derive(Clone)]
pub struct AppState {
    pub sfu: Arc<Sfu>,
    pub metrics: Arc<SfuMetrics>,
}

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });
        (status, body).into_response()
    }
}

impl From<SfuError> for AppError {
    fn from(err: SfuError) -> Self {
        let status = match &err {
            SfuError::Connectivity(ConnectivityError::InvalidKeys(_) | ConnectivityError::NoCandidates)
            | SfuError::Protocol(_) => StatusCode::BAD_REQUEST,
            SfuError::Connectivity(ConnectivityError::ShuttingDown) | SfuError::Capacity(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SfuError::Connectivity(ConnectivityError::DeadlineExceeded(_)) | SfuError::Timeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            SfuError::Connectivity(_) => StatusCode::BAD_GATEWAY,
            SfuError::StaleState(_) => StatusCode::NOT_FOUND,
            SfuError::Io(_) | SfuError::Config(_) => {
                error!(error = %err, "Internal error");
                return Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
            }
        };
        Self::new(status, err.to_string())
    }
}

/// Hex-encoded key and salt of one direction
#[derive(Debug, Deserialize)]
pub struct HexKeys {
    pub key: String,
    pub salt: String,
}

impl HexKeys {
    fn decode(&self, direction: &str) -> AppResult<SrtpKeys> {
        let key = hex::decode(&self.key)
            .map_err(|e| AppError::bad_request(format!("{direction} key: {e}")))?;
        let salt = hex::decode(&self.salt)
            .map_err(|e| AppError::bad_request(format!("{direction} salt: {e}")))?;
        SrtpKeys::from_slices(&key, &salt)
            .map_err(|e| AppError::bad_request(format!("{direction}: {e}")))
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionKeys {
    pub inbound: HexKeys,
    pub outbound: HexKeys,
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub room_id: RoomId,
    pub participant_id: ParticipantId,
    pub candidates: Vec<Candidate>,
    pub credentials: IceCredentials,
    pub keys: SessionKeys,
}

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub session_id: SessionId,
    pub media_addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub session_id: SessionId,
    pub stream_id: StreamId,
    #[serde(default)]
    pub constraints: ReceiverConstraints,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub sfu: SfuStats,
    pub rooms: Vec<RoomSummary>,
}

pub fn router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/sessions", post(connect_session))
        .route("/sessions/{session_id}", axum::routing::delete(teardown_session))
        .route("/streams", post(announce_stream))
        .route("/subscriptions", post(join))
        .route(
            "/subscriptions/{subscription_id}",
            get(subscription).delete(leave),
        )
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .route("/healthz", get(health_check))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn connect_session(
    State(state): State<AppState>,
    Json(request): Json<ConnectRequest>,
) -> AppResult<impl IntoResponse> {
    let keys = KeyingMaterial {
        inbound: request.keys.inbound.decode("inbound")?,
        outbound: request.keys.outbound.decode("outbound")?,
    };
    let params = ConnectivityParams {
        candidates: request.candidates,
        credentials: request.credentials,
        keys,
    };
    let session_id = state
        .sfu
        .registry()
        .connect(request.room_id, request.participant_id, params)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ConnectResponse {
            session_id,
            media_addr: state.sfu.local_addr(),
        }),
    ))
}

async fn teardown_session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> AppResult<StatusCode> {
    state.sfu.registry().teardown_session(session_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn announce_stream(
    State(state): State<AppState>,
    Json(announcement): Json<StreamAnnouncement>,
) -> AppResult<StatusCode> {
    state.sfu.registry().announce_stream(announcement)?;
    Ok(StatusCode::CREATED)
}

async fn join(
    State(state): State<AppState>,
    Json(request): Json<JoinRequest>,
) -> AppResult<impl IntoResponse> {
    let info = state
        .sfu
        .registry()
        .join(request.session_id, request.stream_id, request.constraints)?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn subscription(
    State(state): State<AppState>,
    Path(subscription_id): Path<SubscriptionId>,
) -> AppResult<Json<SubscriptionInfo>> {
    state
        .sfu
        .registry()
        .subscription(subscription_id)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("subscription {subscription_id} not found")))
}

async fn leave(
    State(state): State<AppState>,
    Path(subscription_id): Path<SubscriptionId>,
) -> AppResult<StatusCode> {
    state.sfu.registry().leave(subscription_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        sfu: state.sfu.get_stats(),
        rooms: state.sfu.registry().rooms(),
    })
}

async fn metrics(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    state.metrics.observe_stats(&state.sfu.get_stats());
    let body = state.metrics.render().map_err(|e| {
        error!(error = %e, "Failed to encode metrics");
        AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
    })?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

async fn health_check() -> impl IntoResponse {
    "OK"
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request};
    use fanout_sfu::{SfuConfig, TelemetryFanout, TracingTelemetry};
    use http_body_util::BodyExt;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use super::*;

    async fn app() -> (Router, Arc<Sfu>) {
        let metrics = Arc::new(SfuMetrics::new().unwrap());
        let telemetry = TelemetryFanout::new()
            .with(Arc::new(TracingTelemetry))
            .with(metrics.clone());
        let mut config = SfuConfig::default();
        config.transport.bind_addr = "127.0.0.1:0".to_string();
        let sfu = Sfu::start(config, Arc::new(telemetry), CancellationToken::new())
            .await
            .unwrap();
        let state = AppState {
            sfu: sfu.clone(),
            metrics,
        };
        (router(state, Duration::from_secs(5)), sfu)
    }

    fn json(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let (app, sfu) = app().await;

        let response = app
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_string(response).await;
        assert!(text.contains("fanout_pipeline_packets{kind=\"media\"} 0"));
        sfu.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_keys() {
        let (app, sfu) = app().await;
        let request = json(
            Method::POST,
            "/sessions",
            serde_json::json!({
                "room_id": "r1",
                "participant_id": "p1",
                "candidates": [{"addr": "127.0.0.1:9", "kind": "host"}],
                "credentials": {
                    "local_ufrag": "a", "local_pwd": "aaaaaaaaaaaaaaaaaaaaaa",
                    "remote_ufrag": "b", "remote_pwd": "bbbbbbbbbbbbbbbbbbbbbb"
                },
                "keys": {
                    "inbound": {"key": "zz", "salt": "00"},
                    "outbound": {"key": "00", "salt": "00"}
                }
            }),
        );
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("inbound key"));
        sfu.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_session_maps_to_not_found() {
        let (app, sfu) = app().await;
        let session_id = SessionId::new();

        let request = json(
            Method::POST,
            "/subscriptions",
            serde_json::json!({ "session_id": session_id, "stream_id": 1 }),
        );
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Teardown is idempotent, even for sessions never seen
        let response = app
            .clone()
            .oneshot(
                Request::delete(format!("/sessions/{session_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(
                Request::get(format!("/subscriptions/{}", SubscriptionId::new()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        sfu.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_reports_engine_state() {
        let (app, sfu) = app().await;
        let response = app
            .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["sfu"]["registry"]["rooms"], 0);
        assert!(body["rooms"].as_array().unwrap().is_empty());
        sfu.shutdown().await;
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (SfuError::Protocol("x".into()), StatusCode::BAD_REQUEST),
            (SfuError::Capacity("full".into()), StatusCode::SERVICE_UNAVAILABLE),
            (
                SfuError::Connectivity(ConnectivityError::ChecksFailed { attempts: 2 }),
                StatusCode::BAD_GATEWAY,
            ),
            (
                SfuError::Timeout {
                    operation: "keyframe_wait",
                    elapsed: Duration::from_secs(2),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                SfuError::StaleState(fanout_sfu::StaleRef::Session(SessionId::new())),
                StatusCode::NOT_FOUND,
            ),
            (SfuError::Config("bad".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }
}
