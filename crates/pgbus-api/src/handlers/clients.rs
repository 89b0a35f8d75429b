//! Pull endpoints: dequeue, acknowledge and release.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    Json,
};
use pgbus_core::models::{ClientId, Delivery, MessageId};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{error::ApiResult, AppState};

/// Body of a dequeue request.
#[derive(Debug, Default, Deserialize)]
pub struct DequeueRequest {
    /// Records to lease; the configured default when absent.
    pub batch_size: Option<usize>,
}

/// Leased records.
#[derive(Debug, Serialize, Deserialize)]
pub struct DequeueResponse {
    /// Records in FIFO order.
    pub deliveries: Vec<Delivery>,
}

/// Body of ack and release requests.
#[derive(Debug, Deserialize)]
pub struct MessageIdsRequest {
    /// Messages to act on.
    pub message_ids: Vec<MessageId>,
}

/// Number of records updated.
#[derive(Debug, Serialize, Deserialize)]
pub struct UpdatedResponse {
    /// Records that changed state.
    pub updated: u64,
}

fn client_id(path: Result<Path<String>, PathRejection>) -> ApiResult<ClientId> {
    let Path(client_id) = path?;
    Ok(ClientId::parse(client_id)?)
}

/// `POST /clients/{client_id}/dequeue`: leases the client's next pull records.
///
/// An empty body uses the default batch size.
///
/// # Errors
///
/// Returns 400 for a blank client id or malformed body, 503 when the store
/// stays unavailable.
#[instrument(name = "dequeue", skip(state, body))]
pub async fn dequeue(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
    body: Option<Json<DequeueRequest>>,
) -> ApiResult<Json<DequeueResponse>> {
    let client_id = client_id(path)?;
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let batch_size = request.batch_size.unwrap_or(state.pull.config().default_batch_size);

    let deliveries = state.pull.dequeue(&client_id, batch_size).await?;
    Ok(Json(DequeueResponse { deliveries }))
}

/// `POST /clients/{client_id}/ack`: marks records delivered.
///
/// Ids the client does not hold are ignored.
///
/// # Errors
///
/// Returns 400 for a blank client id or malformed body.
#[instrument(name = "ack", skip(state, body))]
pub async fn ack(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
    body: Result<Json<MessageIdsRequest>, JsonRejection>,
) -> ApiResult<Json<UpdatedResponse>> {
    let client_id = client_id(path)?;
    let Json(request) = body?;
    let updated = state.pull.ack(&client_id, &request.message_ids).await?;
    Ok(Json(UpdatedResponse { updated }))
}

/// `POST /clients/{client_id}/release`: returns leased records to the queue.
///
/// # Errors
///
/// Returns 400 for a blank client id or malformed body.
#[instrument(name = "release", skip(state, body))]
pub async fn release(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
    body: Result<Json<MessageIdsRequest>, JsonRejection>,
) -> ApiResult<Json<UpdatedResponse>> {
    let client_id = client_id(path)?;
    let Json(request) = body?;
    let updated = state.pull.release(&client_id, &request.message_ids).await?;
    Ok(Json(UpdatedResponse { updated }))
}
