//! Submission and task lookup.

use super::{body, ok, ApiResponse};
use crate::server::GatewayState;
use crate::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use pushgate_core::types::{BatchReceipt, BatchSubmitRequest, SubmitReceipt, SubmitRequest, Task};
use std::sync::Arc;
use tracing::debug;

pub async fn submit(
    State(state): State<Arc<GatewayState>>,
    payload: std::result::Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<SubmitReceipt>>> {
    let request = body(payload)?;
    debug!(app_id = %request.app_id, channel_id = request.channel_id, "Submit request");
    let receipt = state.dispatcher.submit(request).await?;
    Ok(ok(receipt))
}

pub async fn submit_batch(
    State(state): State<Arc<GatewayState>>,
    payload: std::result::Result<Json<BatchSubmitRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<BatchReceipt>>> {
    let request = body(payload)?;
    debug!(
        app_id = %request.app_id,
        receivers = request.receivers.len(),
        "Batch submit request"
    );
    let receipt = state.dispatcher.submit_batch(request).await?;
    Ok(ok(receipt))
}

pub async fn get_task(
    State(state): State<Arc<GatewayState>>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<Task>>> {
    let task = state.dispatcher.task(&task_id).await?;
    Ok(ok(task))
}
