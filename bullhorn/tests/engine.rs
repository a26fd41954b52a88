//! End-to-end tests through the HTTP surface, on the in-memory store with a
//! scripted provider.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

use bullhorn::api::{self, AppState};
use bullhorn::audit::AuditRecorder;
use bullhorn::dispatch::{DispatchConfig, Dispatcher};
use bullhorn::import::Importer;
use bullhorn::provider::MockSmsProvider;
use bullhorn::reconcile::Reconciler;
use bullhorn::store::memory::InMemoryStore;
use bullhorn::store::Store;
use bullhorn::types::DeliveryStatus;

const USER_ID: &str = "7d5a9cb1-3f64-4ac3-9d1b-5a8f0e2c4b6d";

fn test_app() -> (axum::Router, Arc<InMemoryStore>, Arc<MockSmsProvider>) {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(MockSmsProvider::new());
    let audit = AuditRecorder::new(store.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        provider.clone(),
        audit.clone(),
        DispatchConfig {
            batch_size: 2,
            batch_delay_ms: 0,
            max_in_flight: 2,
        },
    ));
    let state = AppState {
        store: store.clone(),
        dispatcher,
        reconciler: Reconciler::new(store.clone()),
        importer: Importer::new(store.clone(), audit.clone()),
        audit,
        shutdown: CancellationToken::new(),
    };
    (api::router(state), store, provider)
}

fn authed(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-user-id", USER_ID)
        .header("x-user-role", "admin")
        .header("x-forwarded-for", "203.0.113.7")
        .header(header::USER_AGENT, "engine-test")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn create_category(app: &axum::Router, name: &str) -> Uuid {
    let response = app
        .clone()
        .oneshot(authed("POST", "/api/categories", json!({ "name": name })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    body["id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn dispatch_and_reconcile_full_lifecycle() {
    let (app, store, provider) = test_app();
    let category_id = create_category(&app, "customers").await;

    // Bulk import three contacts; one number is a duplicate in another format.
    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/api/contacts",
            json!({ "contacts": [
                { "phone_number": "5551230000", "category_id": category_id },
                { "phone_number": "(555) 123-0000", "category_id": category_id },
                { "phone_number": "5551230001", "category_id": category_id },
                { "phone_number": "5551230002", "category_id": category_id },
            ]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["imported"], 3);
    assert_eq!(body["skipped"], 1);

    // One recipient is scripted to be rejected by the provider.
    provider.fail_number("+15551230001", "blocked by carrier");

    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/api/dispatch",
            json!({
                "message": "your order shipped",
                "selection": { "type": "category", "id": category_id },
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let result = body_json(response).await;
    assert_eq!(result["sent_count"], 2);
    assert_eq!(result["failed_count"], 1);
    assert_eq!(result["outcomes"].as_array().unwrap().len(), 3);
    assert_eq!(provider.call_count(), 3);

    // Deliver a callback for one sent message and check the record moves.
    let sent = result["outcomes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|o| o["status"] == "sent")
        .unwrap();
    let provider_id = sent["provider_message_id"].as_str().unwrap();

    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/api/webhooks/delivery",
            json!({
                "provider_message_id": provider_id,
                "status": "delivered",
                "timestamp": "2026-08-31T12:00:00Z",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let record = store.find_message_by_provider_id(provider_id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Delivered);
    let delivered_at = record.delivered_at.unwrap();

    // Retried callback with a different timestamp: idempotent, timestamp kept.
    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/api/webhooks/delivery",
            json!({
                "provider_message_id": provider_id,
                "status": "delivered",
                "timestamp": "2026-08-31T13:00:00Z",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let record = store.find_message_by_provider_id(provider_id).await.unwrap();
    assert_eq!(record.delivered_at.unwrap(), delivered_at);

    // A late "failed" callback must not regress the delivered record.
    app.clone()
        .oneshot(authed(
            "POST",
            "/api/webhooks/delivery",
            json!({
                "provider_message_id": provider_id,
                "status": "failed",
                "timestamp": "2026-08-31T14:00:00Z",
                "error_detail": "stale event",
            }),
        ))
        .await
        .unwrap();
    let record = store.find_message_by_provider_id(provider_id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Delivered);

    // The import and the dispatch were both audited with request metadata.
    let entries = store.list_activity().await.unwrap();
    let actions: Vec<&str> = entries.iter().map(|e| e.action.as_str()).collect();
    assert!(actions.contains(&"CREATE_CATEGORY"));
    assert!(actions.contains(&"BULK_IMPORT_CONTACTS"));
    assert!(actions.contains(&"SEND_SMS"));
    assert!(entries
        .iter()
        .all(|e| e.ip_address.as_deref() == Some("203.0.113.7")));
}

#[tokio::test]
async fn webhook_for_unknown_message_is_acknowledged_quietly() {
    let (app, _, _) = test_app();
    let response = app
        .oneshot(authed(
            "POST",
            "/api/webhooks/delivery",
            json!({
                "provider_message_id": "SM-nobody-knows",
                "status": "delivered",
                "timestamp": "2026-08-31T12:00:00Z",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn requests_without_identity_headers_are_unauthorized() {
    let (app, _, _) = test_app();
    let request = Request::builder()
        .method("POST")
        .uri("/api/categories")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "name": "x" }).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn single_contact_duplicate_is_a_conflict() {
    let (app, _, _) = test_app();
    let category_id = create_category(&app, "vips").await;

    let body = json!({ "phone_number": "5551234567", "category_id": category_id });
    let response = app
        .clone()
        .oneshot(authed("POST", "/api/contacts", body.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["phone_number"], "+15551234567");

    // Same pair again, different raw format.
    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/api/contacts",
            json!({ "phone_number": "(555) 123-4567", "category_id": category_id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn contact_into_unknown_category_is_not_found() {
    let (app, store, _) = test_app();
    let response = app
        .oneshot(authed(
            "POST",
            "/api/contacts",
            json!({ "phone_number": "5551234567", "category_id": Uuid::new_v4() }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(store.list_contacts().await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_phone_number_is_a_bad_request() {
    let (app, _, _) = test_app();
    let category_id = create_category(&app, "vips").await;
    let response = app
        .oneshot(authed(
            "POST",
            "/api/contacts",
            json!({ "phone_number": "hello", "category_id": category_id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn csv_upload_imports_into_one_category() {
    let (app, store, _) = test_app();
    let category_id = create_category(&app, "imported").await;

    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/api/contacts",
            json!({
                "csv": "\"5551230000\",5551230001\nnonsense\n5551230002\n",
                "category_id": category_id,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["imported"], 3);
    assert_eq!(body["invalid"].as_array().unwrap().len(), 1);
    assert_eq!(store.list_contacts().await.unwrap().len(), 3);
}

#[tokio::test]
async fn category_with_contacts_cannot_be_deleted() {
    let (app, _, _) = test_app();
    let category_id = create_category(&app, "sticky").await;

    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/api/contacts",
            json!({ "phone_number": "5551234567", "category_id": category_id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let contact = body_json(response).await;
    let contact_id = contact["id"].as_str().unwrap();

    let response = app
        .clone()
        .oneshot(authed(
            "DELETE",
            &format!("/api/categories/{category_id}"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Once the contact is gone the category deletes cleanly.
    let response = app
        .clone()
        .oneshot(authed(
            "DELETE",
            &format!("/api/contacts/{contact_id}"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(authed(
            "DELETE",
            &format!("/api/categories/{category_id}"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn explicit_dispatch_with_missing_ids_reports_them() {
    let (app, store, provider) = test_app();
    let category_id = create_category(&app, "few").await;
    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/api/contacts",
            json!({ "phone_number": "5551234567", "category_id": category_id }),
        ))
        .await
        .unwrap();
    let contact = body_json(response).await;
    let contact_id = contact["id"].as_str().unwrap();
    let ghost = Uuid::new_v4();

    let response = app
        .oneshot(authed(
            "POST",
            "/api/dispatch",
            json!({
                "message": "hi",
                "selection": { "type": "explicit", "ids": [contact_id, ghost] },
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["missing"][0], ghost.to_string());

    // All-or-nothing: nothing was sent or recorded.
    assert_eq!(provider.call_count(), 0);
    assert!(store.list_activity().await.unwrap().iter().all(|e| e.action.as_str() != "SEND_SMS"));
}
