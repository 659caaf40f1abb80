// ABOUTME: HTTP-level tests for the broker routes using tower oneshot dispatch
// ABOUTME: Verifies the shared envelope, status codes, and conflict payloads end to end
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

mod common;

use anyhow::Result;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::create_test_resources;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn test_router() -> Result<Router> {
    let resources = create_test_resources().await?;
    Ok(session_broker::routes::router(resources))
}

async fn body_json(response: axum::response::Response) -> Result<Value> {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn create_body(external_task_id: &str) -> Value {
    json!({
        "account_id": "t-2217567810350-0",
        "shop_id": "shop-88",
        "shop_name": "精品浴缸店",
        "task_type": "auto_bargain",
        "external_task_id": external_task_id,
        "send_content": "您好，请问最快什么时候发货？",
        "platform": "taotian",
        "level": "level3",
        "max_inactive_minutes": 120
    })
}

#[tokio::test]
async fn liveness_endpoints_respond() -> Result<()> {
    let app = test_router().await?;

    let response = app.clone().oneshot(get("/")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert!(body["message"].as_str().unwrap().contains("running"));

    let response = app.oneshot(get("/health")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"].as_array().unwrap().len(), 2);
    Ok(())
}

#[tokio::test]
async fn create_returns_envelope_with_session_id() -> Result<()> {
    let app = test_router().await?;

    let response = app
        .oneshot(post_json("/api/sessions/create", &create_body("ext-1")))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await?;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["external_task_id"], "ext-1");
    assert_eq!(body["data"]["task_type"], "auto_bargain");
    assert!(body["data"]["session_id"]
        .as_str()
        .unwrap()
        .starts_with("sess_"));
    Ok(())
}

#[tokio::test]
async fn conflicting_create_maps_to_unavailable() -> Result<()> {
    let app = test_router().await?;

    let first = app
        .clone()
        .oneshot(post_json("/api/sessions/create", &create_body("ext-1")))
        .await?;
    let first_body = body_json(first).await?;
    let session_id = first_body["data"]["session_id"].as_str().unwrap().to_owned();

    let mut second_body = create_body("ext-2");
    second_body["task_type"] = json!("auto_follow_up");
    let second = app
        .oneshot(post_json("/api/sessions/create", &second_body))
        .await?;
    assert_eq!(second.status(), StatusCode::CONFLICT);

    let body = body_json(second).await?;
    assert_eq!(body["success"], false);
    assert_eq!(body["error_code"], "UNAVAILABLE");
    assert_eq!(body["data"]["conflict_session_id"], session_id.as_str());
    Ok(())
}

#[tokio::test]
async fn validation_failures_are_bad_requests() -> Result<()> {
    let app = test_router().await?;

    let mut body = create_body("ext-1");
    body["account_id"] = json!("   ");
    let response = app
        .oneshot(post_json("/api/sessions/create", &body))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await?;
    assert_eq!(body["error_code"], "VALIDATION");
    Ok(())
}

#[tokio::test]
async fn empty_queue_poll_is_a_soft_failure() -> Result<()> {
    let app = test_router().await?;

    let response = app.oneshot(get("/api/tasks/next_id")).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await?;
    assert_eq!(body["success"], false);
    assert_eq!(body["data"]["task_id"], Value::Null);
    assert!(body.get("error_code").is_none());
    Ok(())
}

#[tokio::test]
async fn worker_flow_end_to_end_over_http() -> Result<()> {
    let app = test_router().await?;

    let created = app
        .clone()
        .oneshot(post_json("/api/sessions/create", &create_body("ext-1")))
        .await?;
    let created = body_json(created).await?;
    let session_id = created["data"]["session_id"].as_str().unwrap().to_owned();

    let popped = app.clone().oneshot(get("/api/tasks/next_id")).await?;
    let popped = body_json(popped).await?;
    assert_eq!(popped["success"], true);
    let task_id = popped["data"]["task_id"].as_i64().unwrap();

    let info = app
        .clone()
        .oneshot(get(&format!("/api/tasks/{task_id}/send_info")))
        .await?;
    assert_eq!(info.status(), StatusCode::OK);
    let info = body_json(info).await?;
    assert_eq!(info["data"]["send_content"], "您好，请问最快什么时候发货？");
    assert!(info["data"]["send_url"]
        .as_str()
        .unwrap()
        .contains("shop-88"));

    let completed = app
        .clone()
        .oneshot(post_json(
            &format!("/api/sessions/{session_id}/complete"),
            &json!({ "success": true }),
        ))
        .await?;
    assert_eq!(completed.status(), StatusCode::OK);
    let completed = body_json(completed).await?;
    assert_eq!(completed["data"]["state"], "completed");

    let status = app
        .oneshot(get(&format!("/api/sessions/{session_id}/status")))
        .await?;
    let status = body_json(status).await?;
    assert_eq!(status["data"]["state"], "completed");
    assert_eq!(status["data"]["task"]["status"], "completed");
    Ok(())
}

#[tokio::test]
async fn unknown_task_send_info_is_not_found() -> Result<()> {
    let app = test_router().await?;

    let response = app.oneshot(get("/api/tasks/9999/send_info")).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = body_json(response).await?;
    assert_eq!(body["error_code"], "TASK_NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn message_batch_returns_ingest_summary() -> Result<()> {
    let app = test_router().await?;

    let batch = json!({
        "shop_name": "精品浴缸店",
        "shop_id": "shop-88",
        "platform": "taotian",
        "messages": [
            {
                "id": "3587452118761.PNM",
                "nick": "t-2217567810350-0",
                "time": "2025-07-03 10:45:16",
                "content": "您好，请问订单的发货时间能否确定？"
            },
            {
                "id": "3595269819313.PNM",
                "nick": "tb5637469_2011",
                "time": "2025-07-03 10:45:34",
                "content": "可以的，今天发"
            }
        ]
    });

    let response = app
        .clone()
        .oneshot(post_json("/api/messages/batch", &batch))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["data"]["processed"], 2);
    assert_eq!(body["data"]["skipped"], 0);

    // Replaying the same batch only skips
    let replay = app.oneshot(post_json("/api/messages/batch", &batch)).await?;
    let replay = body_json(replay).await?;
    assert_eq!(replay["data"]["processed"], 0);
    assert_eq!(replay["data"]["skipped"], 2);
    Ok(())
}
