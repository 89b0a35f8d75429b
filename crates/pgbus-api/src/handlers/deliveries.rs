//! Operator actions on delivery records.

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use pgbus_core::{
    models::{ClientId, DeliveryKey, DeliveryMode, MessageId},
    CoreError,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{error::ApiResult, AppState};

/// Identifies one delivery record.
#[derive(Debug, Deserialize)]
pub struct RequeueRequest {
    /// Message the record belongs to.
    pub message_id: MessageId,
    /// Receiving client.
    pub client_id: String,
    /// Delivery mode of the record.
    pub mode: DeliveryMode,
}

/// Requeue outcome.
#[derive(Debug, Serialize, Deserialize)]
pub struct RequeueResponse {
    /// Always true; a missing record is a 404.
    pub requeued: bool,
}

/// `POST /deliveries/requeue`: moves a `failed` record back to `new` with a
/// fresh attempt budget.
///
/// # Errors
///
/// Returns 404 when no failed record matches the key.
#[instrument(name = "requeue_delivery", skip(state, body))]
pub async fn requeue_delivery(
    State(state): State<AppState>,
    body: Result<Json<RequeueRequest>, JsonRejection>,
) -> ApiResult<Json<RequeueResponse>> {
    let Json(request) = body?;
    let key = DeliveryKey {
        message_id: request.message_id,
        client_id: ClientId::parse(request.client_id)?,
        mode: request.mode,
    };

    if !state.storage.deliveries.requeue_failed(&key).await? {
        return Err(CoreError::not_found(format!(
            "no failed delivery record for message {} client {} mode {}",
            key.message_id, key.client_id, key.mode
        ))
        .into());
    }

    info!(
        message_id = %key.message_id,
        client_id = %key.client_id,
        mode = %key.mode,
        "delivery requeued"
    );
    Ok(Json(RequeueResponse { requeued: true }))
}
