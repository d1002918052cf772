//! End-to-end dispatch through the HTTP gateway.
//!
//! A task is submitted over HTTP, sent by the worker pool to an in-process
//! provider, confirmed by a provider callback, and reported to the client
//! application through a signed webhook.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use pushgate_core::types::{CallbackStatus, FailureRule, RuleAction, RuleScene, TaskStatus};
use pushgate_dispatch::notify::sign;
use pushgate_gateway::Gateway;
use pushgate_integration_tests::{config, dispatcher, sms, wait_for, LoopbackProvider, APP_SECRET};
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn call(router: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

fn post(uri: &str, body: String) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

async fn webhook_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

async fn wait_for_webhooks(server: &MockServer, count: usize) -> Vec<wiremock::Request> {
    for _ in 0..500 {
        let received = server.received_requests().await.unwrap_or_default();
        if received.len() >= count {
            return received;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} webhook deliveries", count);
}

#[tokio::test]
async fn test_submit_send_callback_notify() {
    let server = webhook_server().await;
    let provider = LoopbackProvider::new();
    let d = dispatcher(config(Some(format!("{}/hook", server.uri()))), &provider);
    let cfg = d.config().server.clone();
    let router = Gateway::new(cfg, d.clone()).router();
    d.start().await.unwrap();

    let (status, body) = call(
        router.clone(),
        post(
            "/api/v1/messages",
            json!({
                "app_id": "shop",
                "channel_id": 1,
                "message_type": "sms",
                "receiver": "13800000000",
                "content": "your code is 1234"
            })
            .to_string(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["code"], 0);
    let task_id = body["data"]["task_id"].as_str().unwrap().to_string();

    let task = wait_for(&d, &task_id, |t| t.status == TaskStatus::Sent).await;
    assert_eq!(task.provider_account_id, Some(1));
    assert_eq!(provider.sent(), 1);

    let report = json!([{ "msg_id": task.provider_msg_id, "status": "delivered" }]);
    let (status, reply) = call(
        router.clone(),
        post("/api/v1/callback/loopback", report.to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply, br#"{"result":"received"}"#);

    let task = wait_for(&d, &task_id, |t| t.status == TaskStatus::Success).await;
    assert_eq!(task.callback_status, CallbackStatus::Delivered);
    assert!(task.callback_time.is_some());
    let logs = d.stores().logs.push_logs(&task_id).await.unwrap();
    assert_eq!(logs.len(), 1);

    let hooks = wait_for_webhooks(&server, 1).await;
    let hook = &hooks[0];
    let body = String::from_utf8(hook.body.clone()).unwrap();
    let payload: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(payload["task_id"], task_id.as_str());
    assert_eq!(payload["event"], "delivered");
    assert_eq!(payload["status"], "success");

    let timestamp: i64 = hook.headers["x-webhook-timestamp"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(
        hook.headers["x-webhook-signature"].to_str().unwrap(),
        sign(APP_SECRET, timestamp, &body)
    );

    let (status, body) = call(
        router,
        Request::get(format!("/api/v1/tasks/{}", task_id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["data"]["status"], "success");

    d.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_callback_runs_fail_rule() {
    let server = webhook_server().await;
    let provider = LoopbackProvider::new();
    let mut cfg = config(Some(format!("{}/hook", server.uri())));
    cfg.rules.push(
        FailureRule::new(1, RuleScene::CallbackFailure, RuleAction::Fail)
            .with_priority(100)
            .with_error_codes("UNDELIV"),
    );
    let d = dispatcher(cfg, &provider);
    d.start().await.unwrap();

    let receipt = d.submit(sms("13800000001")).await.unwrap();
    let task = wait_for(&d, &receipt.task_id, |t| t.status == TaskStatus::Sent).await;

    let report = json!([{ "msg_id": task.provider_msg_id, "status": "failed", "code": "UNDELIV" }]);
    let router = Gateway::new(d.config().server.clone(), d.clone()).router();
    let (status, _) = call(router, post("/api/v1/callback/1", report.to_string())).await;
    assert_eq!(status, StatusCode::OK);

    let task = wait_for(&d, &receipt.task_id, |t| t.status == TaskStatus::Failed).await;
    assert_eq!(task.callback_status, CallbackStatus::Failed);
    assert_eq!(provider.sent(), 1);

    let hooks = wait_for_webhooks(&server, 1).await;
    let payload: Value = serde_json::from_slice(&hooks[0].body).unwrap();
    assert_eq!(payload["event"], "failed");
    assert_eq!(payload["error_code"], "UNDELIV");

    d.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_batch_submission_sends_every_receiver() {
    let provider = LoopbackProvider::new();
    let d = dispatcher(config(None), &provider);
    let router = Gateway::new(d.config().server.clone(), d.clone()).router();
    d.start().await.unwrap();

    let (status, body) = call(
        router,
        post(
            "/api/v1/messages/batch",
            json!({
                "app_id": "shop",
                "channel_id": 1,
                "message_type": "sms",
                "receivers": ["13800000001", "13800000002", " "],
                "content": "sale starts today"
            })
            .to_string(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["data"]["total_count"], 3);
    assert_eq!(body["data"]["success_count"], 2);
    assert_eq!(body["data"]["failed_count"], 1);

    let items = body["data"]["items"].as_array().unwrap();
    for item in items.iter().filter(|i| i["task_id"].is_string()) {
        let task_id = item["task_id"].as_str().unwrap();
        wait_for(&d, task_id, |t| t.status == TaskStatus::Sent).await;
    }
    assert_eq!(provider.sent(), 2);

    d.shutdown().await.unwrap();
}
