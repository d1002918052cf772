//! HTTP gateway server.

use crate::error::GatewayError;
use crate::handlers::{admin, callback, health, messages};
use crate::Result;
use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use pushgate_core::config::ServerConfig;
use pushgate_dispatch::Dispatcher;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// State shared by every route.
pub struct GatewayState {
    pub dispatcher: Arc<Dispatcher>,
    pub started_at: Instant,
}

/// The HTTP gateway.
pub struct Gateway {
    config: ServerConfig,
    state: Arc<GatewayState>,
}

impl Gateway {
    pub fn new(config: ServerConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            state: Arc::new(GatewayState {
                dispatcher,
                started_at: Instant::now(),
            }),
        }
    }

    /// Build the router with every route and middleware layer.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health::health))
            .route("/api/v1/messages", post(messages::submit))
            .route("/api/v1/messages/batch", post(messages::submit_batch))
            .route("/api/v1/tasks/:task_id", get(messages::get_task))
            .route(
                "/api/v1/callback/:provider",
                post(callback::receive).get(callback::receive),
            )
            .route("/api/v1/admin/rules/refresh", post(admin::refresh_rules))
            .route("/api/v1/admin/selector/clear", post(admin::clear_selector))
            .with_state(self.state.clone())
            .layer(Self::create_cors_layer())
            .layer(TraceLayer::new_for_http())
    }

    fn create_cors_layer() -> CorsLayer {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .max_age(Duration::from_secs(3600))
    }

    /// Bind address from the server config.
    pub fn bind_address(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| GatewayError::InvalidParams(format!("invalid bind address: {}", e)))
    }

    /// Serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.bind_address()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %addr, "Starting gateway server");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        info!("Gateway server stopped");
        Ok(())
    }

    /// Serve until the process receives Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use pushgate_channels::{
        CallbackHandler, CallbackOutcome, CallbackRequest, Capabilities, ProviderRegistration,
        ProviderReply, SendRequest, SendResponse, Sender, SenderFactory,
    };
    use pushgate_core::types::{
        Application, ChannelBinding, MessageType, ProviderAccount, TaskStatus,
    };
    use pushgate_core::Config;
    use pushgate_dispatch::Stores;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct EchoProvider;

    #[async_trait]
    impl Sender for EchoProvider {
        fn provider_code(&self) -> &str {
            "echo"
        }

        async fn send(&self, _request: &SendRequest) -> pushgate_channels::Result<SendResponse> {
            Ok(SendResponse::accepted("echo-1", TaskStatus::Sent))
        }
    }

    #[async_trait]
    impl CallbackHandler for EchoProvider {
        fn provider_code(&self) -> &str {
            "echo"
        }

        async fn handle_callback(&self, request: &CallbackRequest) -> CallbackOutcome {
            let reply = ProviderReply {
                status_code: 200,
                content_type: "text/plain".to_string(),
                body: format!("got {}", request.query.get("n").cloned().unwrap_or_default()),
            };
            CallbackOutcome::parsed(reply, vec![])
        }
    }

    fn gateway() -> Gateway {
        let mut config = Config::default();
        config.applications.push(Application {
            app_id: "app1".into(),
            name: "demo".into(),
            app_secret: Default::default(),
            notify_url: None,
            active: true,
        });
        config.providers.push(ProviderAccount::new(5, "echo"));
        config
            .channels
            .push(ChannelBinding::new(1, 1, MessageType::Sms, 5));

        let stores = Stores::in_memory(&config);
        let factory = Arc::new(SenderFactory::new());
        let provider = Arc::new(EchoProvider);
        factory.register(
            ProviderRegistration::new(provider.clone())
                .with_capabilities(Capabilities::send_only().with_callback())
                .with_callback_handler(provider),
        );
        let dispatcher = Dispatcher::new(config.clone(), factory, stores).unwrap();
        Gateway::new(config.server, Arc::new(dispatcher))
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(
            gateway().router(),
            Request::get("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["providers"], json!(["echo"]));
    }

    #[tokio::test]
    async fn test_submit_and_lookup() {
        let gateway = gateway();
        let (status, body) = call(
            gateway.router(),
            post_json(
                "/api/v1/messages",
                json!({
                    "app_id": "app1",
                    "channel_id": 1,
                    "message_type": "sms",
                    "receiver": "13800000000",
                    "content": "hello"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"]["status"], "pending");
        let task_id = body["data"]["task_id"].as_str().unwrap().to_string();

        let (status, body) = call(
            gateway.router(),
            Request::get(format!("/api/v1/tasks/{}", task_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["data"]["receiver"], "13800000000");
    }

    #[tokio::test]
    async fn test_submit_errors() {
        let gateway = gateway();

        let (status, body) = call(
            gateway.router(),
            post_json(
                "/api/v1/messages",
                json!({"app_id": "app1", "channel_id": 1, "message_type": "sms", "receiver": ""}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["code"], 400);

        let (status, _) = call(
            gateway.router(),
            post_json("/api/v1/messages", json!({"receiver": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            gateway.router(),
            Request::get("/api/v1/tasks/missing").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_batch_submit() {
        let (status, body) = call(
            gateway().router(),
            post_json(
                "/api/v1/messages/batch",
                json!({
                    "app_id": "app1",
                    "channel_id": 1,
                    "message_type": "sms",
                    "receivers": ["a", "b", "c"]
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["data"]["success_count"], 3);
        assert_eq!(body["data"]["items"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_callback_reply_is_verbatim() {
        let gateway = gateway();
        let (status, body) = call(
            gateway.router(),
            Request::post("/api/v1/callback/echo?n=7")
                .body(Body::from("raw"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"got 7");

        // account 5 belongs to the echo provider
        let (_, body) = call(
            gateway.router(),
            Request::post("/api/v1/callback/5?n=8").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(body, b"got 8");

        let (status, body) = call(
            gateway.router(),
            Request::post("/api/v1/callback/unknown").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, br#"{"code":0,"message":"ok"}"#);
    }

    #[tokio::test]
    async fn test_admin_hooks() {
        let gateway = gateway();
        let (status, _) = call(
            gateway.router(),
            Request::post("/api/v1/admin/rules/refresh").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            gateway.router(),
            Request::post("/api/v1/admin/selector/clear?channel_id=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn test_bind_address() {
        let gateway = gateway();
        assert!(gateway.bind_address().is_ok());
    }
}
