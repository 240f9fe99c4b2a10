//! HTTP surface over the exchange engine and its collaborators.

use crate::{
    activity,
    catalog::{self, ItemPatch, NewItem},
    directory,
    engine::ExchangeEngine,
    model::ProposeRequest,
    notify::{self, SubscriberHub},
    ExchangeError, ExchangeId, ItemId, NotificationId, UserId,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ExchangeEngine>,
    pub hub: Arc<SubscriberHub>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct BanRequest {
    pub banned: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ItemSearchQuery {
    pub q: Option<String>,
    #[serde(rename = "type")]
    pub item_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub owner_id: UserId,
    pub selected_item_id: ItemId,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub user_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub user_id: UserId,
    pub reason: String,
}

impl IntoResponse for ExchangeError {
    fn into_response(self) -> Response {
        let status = match &self {
            ExchangeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ExchangeError::NotFound(_) | ExchangeError::InvalidReference(_) => {
                StatusCode::NOT_FOUND
            }
            ExchangeError::Mismatch(_) | ExchangeError::Unauthorized(_) => StatusCode::FORBIDDEN,
            ExchangeError::ItemUnavailable(_) | ExchangeError::InvalidState(_) => {
                StatusCode::CONFLICT
            }
            err if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = Json(json!({
            "success": false,
            "message": self.to_string(),
            "retryable": self.is_retryable(),
        }));
        (status, body).into_response()
    }
}

type ApiResult = std::result::Result<Response, ExchangeError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/users", post(create_user))
        .route("/users/:user_id", get(get_user))
        .route("/users/:user_id/ban", post(set_ban))
        .route("/users/:user_id/items", get(list_items))
        .route("/users/:user_id/exchanges", get(list_exchanges))
        .route("/users/:user_id/credits", get(credit_summary))
        .route("/users/:user_id/discredits", get(discredit_summary))
        .route("/users/:user_id/reputation", get(reputation))
        .route("/users/:user_id/notifications", get(list_notifications))
        .route("/users/:user_id/notifications/stream", get(notification_stream))
        .route("/users/:user_id/activity", get(list_activity))
        .route("/notifications/:notification_id/read", post(mark_notification_read))
        .route("/items", post(create_item).get(search_items))
        .route("/items/:item_id", get(get_item).put(update_item).delete(delete_item))
        .route("/exchanges", post(propose))
        .route("/exchanges/:exchange_id", get(get_status))
        .route("/exchanges/:exchange_id/accept", post(accept))
        .route("/exchanges/:exchange_id/reject", post(reject))
        .route("/exchanges/:exchange_id/confirm", post(confirm_receipt))
        .route("/exchanges/:exchange_id/cancel", post(cancel))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy"}))
}

async fn create_user(
    State(state): State<AppState>,
    Json(request): Json<CreateUserRequest>,
) -> ApiResult {
    let mut conn = state.engine.database().pool().acquire().await?;
    let user = directory::create_user(&mut conn, &request.username, &request.email).await?;
    Ok((StatusCode::CREATED, Json(json!({"success": true, "user": user}))).into_response())
}

async fn get_user(State(state): State<AppState>, Path(user_id): Path<UserId>) -> ApiResult {
    let mut conn = state.engine.database().pool().acquire().await?;
    let user = directory::get_user(&mut conn, user_id)
        .await?
        .ok_or_else(|| ExchangeError::NotFound(format!("User {}", user_id)))?;
    Ok(Json(json!({"success": true, "user": user})).into_response())
}

async fn set_ban(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Json(request): Json<BanRequest>,
) -> ApiResult {
    state.engine.set_banned(user_id, request.banned).await?;
    Ok(Json(json!({"success": true, "banned": request.banned})).into_response())
}

async fn create_item(State(state): State<AppState>, Json(request): Json<NewItem>) -> ApiResult {
    let mut conn = state.engine.database().pool().acquire().await?;
    let item = catalog::create_item(&mut conn, &request).await?;
    Ok((StatusCode::CREATED, Json(json!({"success": true, "item": item}))).into_response())
}

async fn get_item(State(state): State<AppState>, Path(item_id): Path<ItemId>) -> ApiResult {
    let mut conn = state.engine.database().pool().acquire().await?;
    let item = catalog::get_item(&mut conn, item_id)
        .await?
        .ok_or_else(|| ExchangeError::NotFound(format!("Item {}", item_id)))?;
    Ok(Json(json!({"success": true, "item": item})).into_response())
}

async fn update_item(
    State(state): State<AppState>,
    Path(item_id): Path<ItemId>,
    Json(patch): Json<ItemPatch>,
) -> ApiResult {
    let mut conn = state.engine.database().pool().acquire().await?;
    let item = catalog::update_item(&mut conn, item_id, &patch).await?;
    Ok(Json(json!({"success": true, "item": item})).into_response())
}

async fn search_items(
    State(state): State<AppState>,
    Query(query): Query<ItemSearchQuery>,
) -> ApiResult {
    let mut conn = state.engine.database().pool().acquire().await?;
    let items = catalog::search(&mut conn, query.q.as_deref(), query.item_type.as_deref()).await?;
    Ok(Json(json!({"success": true, "items": items})).into_response())
}

async fn delete_item(State(state): State<AppState>, Path(item_id): Path<ItemId>) -> ApiResult {
    let mut conn = state.engine.database().pool().acquire().await?;
    catalog::soft_delete(&mut conn, item_id).await?;
    Ok(Json(json!({"success": true, "message": "Item deleted successfully"})).into_response())
}

async fn list_items(State(state): State<AppState>, Path(user_id): Path<UserId>) -> ApiResult {
    let mut conn = state.engine.database().pool().acquire().await?;
    let items = catalog::list_available(&mut conn, user_id).await?;
    Ok(Json(json!({"success": true, "items": items})).into_response())
}

async fn propose(State(state): State<AppState>, Json(request): Json<ProposeRequest>) -> ApiResult {
    let exchange_id = state.engine.propose(&request).await?;
    let body = json!({"success": true, "exchange_id": exchange_id});
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

async fn get_status(
    State(state): State<AppState>,
    Path(exchange_id): Path<ExchangeId>,
) -> ApiResult {
    let exchange = state.engine.get_status(exchange_id).await?;
    Ok(Json(json!({"success": true, "exchange": exchange})).into_response())
}

async fn accept(
    State(state): State<AppState>,
    Path(exchange_id): Path<ExchangeId>,
    Json(request): Json<DecisionRequest>,
) -> ApiResult {
    let exchange = state
        .engine
        .accept(exchange_id, request.owner_id, request.selected_item_id)
        .await?;
    Ok(Json(json!({"success": true, "exchange": exchange})).into_response())
}

async fn reject(
    State(state): State<AppState>,
    Path(exchange_id): Path<ExchangeId>,
    Json(request): Json<DecisionRequest>,
) -> ApiResult {
    state
        .engine
        .reject(exchange_id, request.owner_id, request.selected_item_id)
        .await?;
    Ok(Json(json!({"success": true, "message": "Exchange rejected"})).into_response())
}

async fn confirm_receipt(
    State(state): State<AppState>,
    Path(exchange_id): Path<ExchangeId>,
    Json(request): Json<ConfirmRequest>,
) -> ApiResult {
    let outcome = state.engine.confirm_receipt(exchange_id, request.user_id).await?;
    Ok(Json(json!({"success": true, "status": outcome})).into_response())
}

async fn cancel(
    State(state): State<AppState>,
    Path(exchange_id): Path<ExchangeId>,
    Json(request): Json<CancelRequest>,
) -> ApiResult {
    state
        .engine
        .cancel(exchange_id, request.user_id, &request.reason)
        .await?;
    Ok(Json(json!({"success": true, "message": "Exchange cancelled"})).into_response())
}

async fn list_exchanges(State(state): State<AppState>, Path(user_id): Path<UserId>) -> ApiResult {
    let exchanges = state.engine.list_for_user(user_id).await?;
    Ok(Json(json!({"success": true, "exchanges": exchanges})).into_response())
}

async fn credit_summary(State(state): State<AppState>, Path(user_id): Path<UserId>) -> ApiResult {
    let credits = state.engine.credit_summary(user_id).await?;
    Ok(Json(json!({"success": true, "credits": credits})).into_response())
}

async fn discredit_summary(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ApiResult {
    let discredits = state.engine.discredit_summary(user_id).await?;
    Ok(Json(json!({"success": true, "discredits": discredits})).into_response())
}

async fn reputation(State(state): State<AppState>, Path(user_id): Path<UserId>) -> ApiResult {
    let report = state.engine.reputation(user_id).await?;
    Ok(Json(json!({
        "success": true,
        "net_points": report.net_points(),
        "reputation": report,
    }))
    .into_response())
}

async fn list_notifications(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ApiResult {
    let notifications = state.engine.notifications(user_id).await?;
    Ok(Json(json!({"success": true, "notifications": notifications})).into_response())
}

async fn mark_notification_read(
    State(state): State<AppState>,
    Path(notification_id): Path<NotificationId>,
) -> ApiResult {
    let mut conn = state.engine.database().pool().acquire().await?;
    notify::mark_read(&mut conn, notification_id).await?;
    Ok(Json(json!({"success": true})).into_response())
}

async fn list_activity(State(state): State<AppState>, Path(user_id): Path<UserId>) -> ApiResult {
    let mut conn = state.engine.database().pool().acquire().await?;
    let entries = activity::list_for_user(&mut conn, user_id).await?;
    Ok(Json(json!({"success": true, "activity": entries})).into_response())
}

/// Live notifications as Server-Sent Events. Messages missed while the
/// client lagged are skipped; the stored rows remain readable.
async fn notification_stream(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let receiver = state.hub.subscribe(user_id);
    tracing::debug!(
        user_id,
        subscribers = state.hub.subscriber_count(user_id),
        "Notification stream opened"
    );
    let stream = BroadcastStream::new(receiver).filter_map(|message| {
        let notification = message.ok()?;
        Event::default().event("notification").json_data(&notification).ok().map(Ok)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
