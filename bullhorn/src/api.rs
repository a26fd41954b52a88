//! HTTP surface.
//!
//! Identity is handled by a fronting layer; requests arrive with
//! `x-user-id`/`x-user-role` headers already verified, and the handlers here
//! only parse them into a typed [`Actor`]. Client IP for the activity log is
//! taken from `x-forwarded-for` (first hop) or `x-real-ip`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use crate::audit::AuditRecorder;
use crate::dispatch::Dispatcher;
use crate::error::{EngineError, Result};
use crate::import::{rows_from_delimited, ImportRow, Importer};
use crate::phone::normalize;
use crate::reconcile::Reconciler;
use crate::resolver;
use crate::store::{Store, StoreError};
use crate::types::{
    Actor, AuditAction, CategoryId, ContactId, DeliveryCallback, DispatchJob, NewContact,
    RecipientSelection, RequestMeta,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub dispatcher: Arc<Dispatcher>,
    pub reconciler: Reconciler,
    pub importer: Importer,
    pub audit: AuditRecorder,
    /// Cancelled on shutdown; in-flight dispatches stop scheduling batches.
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/dispatch", post(dispatch))
        .route("/api/webhooks/delivery", post(delivery_webhook))
        .route("/api/contacts", post(create_contacts))
        .route(
            "/api/contacts/{id}",
            axum::routing::patch(update_contact).delete(delete_contact),
        )
        .route("/api/categories", post(create_category))
        .route("/api/categories/{id}", axum::routing::delete(delete_category))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Parse the identity headers asserted by the fronting auth layer.
fn actor_from_headers(headers: &HeaderMap) -> Result<Actor> {
    let id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or(EngineError::Unauthenticated)?;
    let role = headers
        .get("x-user-role")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or(EngineError::Unauthenticated)?;
    Ok(Actor { id, role })
}

fn request_meta(headers: &HeaderMap) -> RequestMeta {
    let ip_address = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    RequestMeta {
        ip_address,
        user_agent,
    }
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct DispatchRequest {
    message: String,
    selection: RecipientSelection,
}

async fn dispatch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DispatchRequest>,
) -> Result<impl IntoResponse> {
    let actor = actor_from_headers(&headers)?;
    let meta = request_meta(&headers);

    let recipients = resolver::resolve(state.store.as_ref(), &request.selection).await?;
    let job = DispatchJob {
        actor,
        body: request.message,
        selection: request.selection,
        meta,
    };
    let result = state
        .dispatcher
        .dispatch(&job, recipients, &state.shutdown)
        .await?;
    Ok(Json(result))
}

/// Provider delivery-status webhook.
///
/// Always answers 204 for events we can't use (unknown provider message IDs,
/// stale callbacks): the provider retries on error responses and an unrelated
/// callback must not generate retry storms.
async fn delivery_webhook(
    State(state): State<AppState>,
    Json(callback): Json<DeliveryCallback>,
) -> Result<StatusCode> {
    match state.reconciler.apply(&callback).await {
        Ok(_) => Ok(StatusCode::NO_CONTENT),
        Err(EngineError::UnknownMessageReference(id)) => {
            warn!(provider_message_id = %id, "callback for unknown message ignored");
            Ok(StatusCode::NO_CONTENT)
        }
        Err(e) => Err(e),
    }
}

/// `POST /api/contacts` accepts three shapes: a bulk list of rows, raw
/// delimited text targeting one category, or a single contact.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CreateContactsRequest {
    Bulk {
        contacts: Vec<ImportRow>,
    },
    Csv {
        csv: String,
        category_id: CategoryId,
    },
    Single(ImportRow),
}

async fn create_contacts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateContactsRequest>,
) -> Result<axum::response::Response> {
    let actor = actor_from_headers(&headers)?;
    let meta = request_meta(&headers);

    match request {
        CreateContactsRequest::Single(row) => {
            let phone_number = normalize(&row.phone_number)?;
            let contact = state
                .store
                .create_contact(NewContact {
                    phone_number: phone_number.clone(),
                    category_id: row.category_id,
                })
                .await
                .map_err(|e| match e {
                    StoreError::UniqueViolation { .. } => EngineError::Conflict(
                        "contact already exists in this category".to_string(),
                    ),
                    StoreError::ForeignKeyViolation { .. } => {
                        EngineError::CategoryNotFound(row.category_id)
                    }
                    other => other.into(),
                })?;
            state
                .audit
                .record(
                    actor,
                    AuditAction::CreateContact,
                    Some(format!("Added contact: {phone_number}")),
                    &meta,
                )
                .await;
            Ok((StatusCode::CREATED, Json(contact)).into_response())
        }
        CreateContactsRequest::Bulk { contacts } => {
            let outcome = state.importer.import(actor, contacts, &meta).await?;
            Ok((StatusCode::CREATED, Json(outcome)).into_response())
        }
        CreateContactsRequest::Csv { csv, category_id } => {
            let rows = rows_from_delimited(&csv, category_id);
            let outcome = state.importer.import(actor, rows, &meta).await?;
            Ok((StatusCode::CREATED, Json(outcome)).into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpdateContactRequest {
    phone_number: String,
    category_id: CategoryId,
}

async fn update_contact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ContactId>,
    Json(request): Json<UpdateContactRequest>,
) -> Result<impl IntoResponse> {
    let actor = actor_from_headers(&headers)?;
    let meta = request_meta(&headers);

    let phone_number = normalize(&request.phone_number)?;
    let contact = state
        .store
        .update_contact(
            id,
            NewContact {
                phone_number: phone_number.clone(),
                category_id: request.category_id,
            },
        )
        .await
        .map_err(|e| match e {
            StoreError::NotFound => EngineError::ContactNotFound(id),
            StoreError::UniqueViolation { .. } => {
                EngineError::Conflict("contact already exists in this category".to_string())
            }
            other => other.into(),
        })?;
    state
        .audit
        .record(
            actor,
            AuditAction::UpdateContact,
            Some(format!("Updated contact {id}: {phone_number}")),
            &meta,
        )
        .await;
    Ok(Json(contact))
}

async fn delete_contact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ContactId>,
) -> Result<StatusCode> {
    let actor = actor_from_headers(&headers)?;
    let meta = request_meta(&headers);

    let contact = state.store.get_contact(id).await.map_err(|e| match e {
        StoreError::NotFound => EngineError::ContactNotFound(id),
        other => other.into(),
    })?;
    state.store.delete_contact(id).await?;
    state
        .audit
        .record(
            actor,
            AuditAction::DeleteContact,
            Some(format!("Deleted contact: {}", contact.phone_number)),
            &meta,
        )
        .await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CreateCategoryRequest {
    name: String,
}

async fn create_category(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateCategoryRequest>,
) -> Result<impl IntoResponse> {
    let actor = actor_from_headers(&headers)?;
    let meta = request_meta(&headers);

    let name = request.name.trim();
    if name.is_empty() {
        return Err(EngineError::InvalidMessage(
            "category name must not be empty".to_string(),
        ));
    }
    let category = state.store.create_category(name, actor.id).await?;
    state
        .audit
        .record(
            actor,
            AuditAction::CreateCategory,
            Some(format!("Created category: {name}")),
            &meta,
        )
        .await;
    Ok((StatusCode::CREATED, Json(category)))
}

async fn delete_category(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<CategoryId>,
) -> Result<StatusCode> {
    let actor = actor_from_headers(&headers)?;
    let meta = request_meta(&headers);

    state.store.delete_category(id).await.map_err(|e| match e {
        StoreError::NotFound => EngineError::CategoryNotFound(id),
        StoreError::ForeignKeyViolation { .. } => EngineError::Conflict(
            "category still has contacts; delete or move them first".to_string(),
        ),
        other => other.into(),
    })?;
    state
        .audit
        .record(
            actor,
            AuditAction::DeleteCategory,
            Some(format!("Deleted category {id}")),
            &meta,
        )
        .await;
    Ok(StatusCode::NO_CONTENT)
}
