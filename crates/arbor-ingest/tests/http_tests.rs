mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use arbor_ingest::db::image_repo;

use common::TestHarness;

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_as(uri: &str, roles: &str, body: Option<Value>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("x-user-id", "inspector-3")
        .header("x-user-roles", roles)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn healthz_and_preflight() {
    let h = TestHarness::new();
    let app = h.router();

    let (status, body) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));

    let preflight = Request::builder()
        .method(Method::OPTIONS)
        .uri("/functions/ocr-extract")
        .header(header::ORIGIN, "https://kb.example.org")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(preflight).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let headers = response.headers();
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    let allowed = headers[header::ACCESS_CONTROL_ALLOW_HEADERS].to_str().unwrap();
    assert!(allowed.contains("authorization"));
    assert!(allowed.contains("content-type"));
}

#[tokio::test]
async fn stage_endpoints_report_typed_errors() {
    let h = TestHarness::new();
    let upload = h.upload("plot-1", &["a.jpg"]).await;
    let batch_id = upload.detail.batch.id.clone();
    let uri = image_repo::find_by_slot(&h.db, "plot-1", 1).unwrap().unwrap().uri;
    let app = h.router();

    let malformed = Request::builder()
        .method(Method::POST)
        .uri("/functions/ocr-extract")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["type"], "validation_error");

    let (status, body) = send(
        &app,
        post(
            "/functions/ocr-extract",
            json!({"imageUrl": uri, "sourceId": "plot-1", "page": 1, "queueId": batch_id}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["chunkCreated"], true);
    let chunk_id = body["chunkId"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        post("/functions/extract-structured", json!({"chunkId": chunk_id})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], "out_of_order");

    let (status, body) = send(
        &app,
        post("/functions/translate-chunk", json!({"chunkId": chunk_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["skipped"], false);

    let (status, body) = send(
        &app,
        post("/functions/translate-chunk", json!({"chunkId": "missing"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "not_found");
}

#[tokio::test]
async fn queue_endpoints_drive_a_batch() {
    let h = TestHarness::new();
    let app = h.router();

    let (status, body) = send(
        &app,
        post("/queue/batches", json!({"sourceId": "plot-2", "pageCount": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let batch_id = body["batch"]["id"].as_str().unwrap().to_string();
    let page_id = body["pages"][0]["id"].as_str().unwrap().to_string();
    assert_eq!(body["pages"].as_array().unwrap().len(), 2);

    let (status, body) = send(
        &app,
        post("/queue/batches", json!({"sourceId": "plot-2", "pageCount": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "validation_error");

    let (status, body) = send(
        &app,
        post("/queue/batches", json!({"sourceId": "plot-2", "pageCount": i64::MAX})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "validation_error");

    let (status, body) = send(&app, get(&format!("/queue/batches/{batch_id}/stats"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stats"]["pending"], 2);

    let (status, body) = send(&app, get("/queue/batches/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "not_found");

    // Retrying a page that is already pending changes nothing.
    let (status, body) = send(&app, post(&format!("/queue/pages/{page_id}/retry"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changed"], false);

    let (status, body) = send(&app, post(&format!("/queue/pages/{page_id}/pause"), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], "conflict");

    // No images were uploaded, so both pages fail.
    for _ in 0..2 {
        let (status, body) = send(&app, post("/queue/process-next", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["processed"]["outcome"]["status"], "failed");
    }
    let (_, body) = send(&app, post("/queue/process-next", json!({}))).await;
    assert_eq!(body["processed"], Value::Null);

    let (status, body) = send(&app, get(&format!("/queue/batches/{batch_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["batch"]["status"], "error");

    let (status, body) = send(
        &app,
        post(&format!("/queue/batches/{batch_id}/retry-errors"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requeued"], 2);

    let (status, body) = send(&app, get("/queue/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stats"]["pages"]["pending"], 2);
}

#[tokio::test]
async fn destructive_endpoints_require_the_admin_role() {
    let h = TestHarness::new();
    let upload = h.upload("plot-3", &["a.jpg"]).await;
    let batch_id = upload.detail.batch.id.clone();
    let app = h.router();
    let restart = format!("/queue/batches/{batch_id}/restart");

    let (status, body) = send(&app, post(&restart, json!({"confirm": true}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["type"], "forbidden");

    let (status, body) = send(&app, post_as(&restart, "inspector", Some(json!({"confirm": true})))).await;
    assert_eq!(status, StatusCode::FORBIDDEN, "{body}");

    let (status, body) = send(&app, post_as(&restart, "inspector, Admin", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "validation_error");

    let (status, body) = send(&app, post_as(&restart, "admin", Some(json!({"confirm": true})))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["pagesReset"], 1);

    let cleanup = "/maintenance/orphans/cleanup";
    let (status, _) = send(&app, post(cleanup, json!({}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, post_as(cleanup, "admin", None)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["removed"], json!([]));
    assert_eq!(body["skipped"], false);

    let (status, body) = send(&app, get("/maintenance/orphans")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["orphans"], json!([]));
}
