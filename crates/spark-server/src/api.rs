use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, Method},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::TokenAuth;
use crate::config::ServerConfig;
use crate::connection::{serve_connection, ConnectionContext, ConnectionSettings};
use crate::error::ServerError;
use crate::rate_limit::{limit_by_client, CommandLimiter, Limiter};
use crate::scheduler::FlushRequest;
use crate::session::ChatServices;
use crate::signature::SignatureVerifier;

#[derive(Clone)]
pub struct AppState {
    pub services: ChatServices,
    pub config: Arc<ServerConfig>,
    pub verifier: Arc<SignatureVerifier>,
    pub auth: Arc<TokenAuth>,
    pub rate_limiter: Limiter<IpAddr>,
    pub command_limiter: CommandLimiter,
    pub connection: ConnectionSettings,
}

impl AppState {
    pub fn new(services: ChatServices, config: ServerConfig) -> Self {
        Self {
            services,
            verifier: Arc::new(SignatureVerifier::new(
                config.qstash_current_signing_key.clone(),
                config.qstash_next_signing_key.clone(),
            )),
            auth: Arc::new(TokenAuth::new(config.jwt_secret.clone())),
            rate_limiter: Limiter::default(),
            command_limiter: CommandLimiter::default(),
            connection: ConnectionSettings::from(&config),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/v1/chat/ws/:chat_id", get(chat_socket))
        .route("/v1/chat/flush", post(flush_webhook))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            limit_by_client,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct FlushResponse {
    success: bool,
}

#[derive(Deserialize)]
struct SocketQuery {
    #[serde(default)]
    token: Option<String>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Authenticate, then upgrade. Unauthenticated callers never get a socket.
async fn chat_socket(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Query(query): Query<SocketQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let user_id = match state.auth.authenticate(&headers, query.token.as_deref()) {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!(chat_id = %chat_id, error = %e, "Rejected chat socket");
            return ServerError::Unauthorized(e.to_string()).into_response();
        }
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let ctx = ConnectionContext {
        services: state.services.clone(),
        settings: state.connection,
        limiter: Some(state.command_limiter.clone()),
    };
    upgrade.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let reason = serve_connection(ctx, chat_id, user_id, sink, stream).await;
        debug!(?reason, "Chat socket finished");
    })
}

/// Signed drain trigger delivered by the scheduler.
async fn flush_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<FlushResponse>, ServerError> {
    let signature = headers
        .get("upstash-signature")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or(ServerError::InvalidSignature)?;

    state
        .verifier
        .verify(signature, &body, &state.config.flush_webhook_url())
        .map_err(|e| {
            warn!(error = %e, "Rejected flush webhook");
            ServerError::InvalidSignature
        })?;

    let req: FlushRequest = serde_json::from_slice(&body)
        .map_err(|e| ServerError::BadRequest(format!("invalid flush request: {e}")))?;
    if req.chat_id.is_empty() {
        return Err(ServerError::BadRequest("chatId is required".into()));
    }

    match state
        .services
        .flush
        .flush_messages(&req.chat_id, &req.flush_token)
        .await
    {
        Ok(outcome) => {
            debug!(chat_id = %req.chat_id, ?outcome, "Flush webhook handled");
            Ok(Json(FlushResponse { success: true }))
        }
        Err(e) => {
            error!(chat_id = %req.chat_id, error = %e, "Flush webhook failed");
            Err(ServerError::Unavailable(e.to_string()))
        }
    }
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ChatSession;
    use crate::signature::sign_for_test;
    use crate::testing::Fixture;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use spark_buffer::BufferStore;
    use spark_shared::Message;
    use spark_store::ChatRepository;
    use tower::ServiceExt;

    const SIGNING_KEY: &str = "current";
    const JWT_SECRET: &str = "jwt-secret";

    fn router(fx: &Fixture) -> Router {
        let config = ServerConfig {
            jwt_secret: Some(JWT_SECRET.into()),
            qstash_current_signing_key: Some(SIGNING_KEY.into()),
            ..ServerConfig::default()
        };
        build_router(AppState::new(fx.services.clone(), config))
    }

    fn webhook_url() -> String {
        ServerConfig::default().flush_webhook_url()
    }

    fn flush_request(body: &str, signature: Option<String>) -> Request<Body> {
        let mut req = Request::post("/v1/chat/flush").header("content-type", "application/json");
        if let Some(sig) = signature {
            req = req.header("Upstash-Signature", sig);
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    fn signed(body: &str) -> Request<Body> {
        let now = chrono::Utc::now().timestamp();
        let sig = sign_for_test(SIGNING_KEY, &webhook_url(), body.as_bytes(), now);
        flush_request(body, Some(sig))
    }

    async fn json_body(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Buffer one message and return the chat's live flush token.
    async fn buffer_one(fx: &Fixture) -> String {
        let he = ChatSession::open(fx.services.clone(), "c1", "he").await.unwrap();
        he.send_message(Message::text("he", "hi")).await.unwrap();
        fx.buffer.flush_token("c1").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let fx = Fixture::new();
        let resp = router(&fx)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_flush_webhook_commits_buffer() {
        let fx = Fixture::new();
        let token = buffer_one(&fx).await;
        let body = json!({"chatId": "c1", "flushToken": token}).to_string();

        let resp = router(&fx).oneshot(signed(&body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await, json!({"success": true}));

        assert_eq!(fx.repo.load_chat("c1").await.unwrap().messages.len(), 1);
        assert_eq!(fx.buffer.len("c1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_flush_webhook_stale_token_is_success() {
        let fx = Fixture::new();
        buffer_one(&fx).await;
        let body = json!({"chatId": "c1", "flushToken": "old"}).to_string();

        let resp = router(&fx).oneshot(signed(&body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(fx.buffer.len("c1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_flush_webhook_requires_signature() {
        let fx = Fixture::new();
        let body = json!({"chatId": "c1", "flushToken": "t"}).to_string();

        let resp = router(&fx)
            .oneshot(flush_request(&body, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let now = chrono::Utc::now().timestamp();
        let forged = sign_for_test("wrong-key", &webhook_url(), body.as_bytes(), now);
        let resp = router(&fx)
            .oneshot(flush_request(&body, Some(forged)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_flush_webhook_rejects_bad_body() {
        let fx = Fixture::new();
        for body in [r#"{"chatId": "", "flushToken": "t"}"#, "not json"] {
            let resp = router(&fx).oneshot(signed(body)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_flush_webhook_store_failure_is_unavailable() {
        let fx = Fixture::new();
        let token = buffer_one(&fx).await;
        fx.repo.fail_appends(true);
        let body = json!({"chatId": "c1", "flushToken": token}).to_string();

        let resp = router(&fx).oneshot(signed(&body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(fx.buffer.len("c1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_socket_requires_token_before_upgrade() {
        let fx = Fixture::new();
        let resp = router(&fx)
            .oneshot(Request::get("/v1/chat/ws/c1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = router(&fx)
            .oneshot(
                Request::get("/v1/chat/ws/c1?token=garbage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_socket_with_valid_token_reaches_upgrade() {
        let fx = Fixture::new();
        let exp = chrono::Utc::now().timestamp() + 60;
        let token = crate::jwt::sign_hs256(&json!({"uid": "he", "exp": exp}), JWT_SECRET.as_bytes());

        let resp = router(&fx)
            .oneshot(
                Request::get("/v1/chat/ws/c1")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        // Authenticated, but a plain GET is not an upgrade request.
        assert!(resp.status().is_client_error());
        assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
