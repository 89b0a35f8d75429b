//! Publish and message lookup.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    Json,
};
use pgbus_core::models::{DeliveryRecord, Message, MessageId, NewMessage};
use pgbus_delivery::PublishReceipt;
use tracing::instrument;

use crate::{error::ApiResult, AppState};

/// `POST /messages`: publishes and fans out a message.
///
/// Body: `{"type", "namespace", "payload", "tracking_id"?}`. Responds 201
/// with the receipt, 400 for a blank type or namespace.
///
/// # Errors
///
/// Returns `ApiError` for invalid bodies and store failures.
#[instrument(name = "publish_message", skip(state, body))]
pub async fn publish_message(
    State(state): State<AppState>,
    body: Result<Json<NewMessage>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<PublishReceipt>)> {
    let Json(message) = body?;
    let receipt = state.publisher.publish(&message).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// `GET /messages/{id}`.
///
/// # Errors
///
/// Returns 404 for an unknown id.
#[instrument(name = "get_message", skip(state))]
pub async fn get_message(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Message>> {
    let Path(id) = id?;
    Ok(Json(state.publisher.get(MessageId(id)).await?))
}

/// `GET /messages/{id}/deliveries`: every delivery record of a message.
///
/// # Errors
///
/// Returns 404 for an unknown id.
#[instrument(name = "list_deliveries", skip(state))]
pub async fn list_deliveries(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Vec<DeliveryRecord>>> {
    let Path(id) = id?;
    let message = state.publisher.get(MessageId(id)).await?;
    Ok(Json(state.storage.deliveries.find_by_message(message.id).await?))
}
