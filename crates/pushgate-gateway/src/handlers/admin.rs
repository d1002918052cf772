//! Cache invalidation hooks for the admin layer.

use super::{ok, ApiResponse};
use crate::server::GatewayState;
use crate::Result;
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

pub async fn refresh_rules(State(state): State<Arc<GatewayState>>) -> Result<Json<ApiResponse<()>>> {
    state.dispatcher.refresh_rules().await?;
    info!("Failure rules refreshed");
    Ok(ok(()))
}

#[derive(Debug, Deserialize)]
pub struct ClearSelectorParams {
    pub channel_id: Option<u64>,
}

pub async fn clear_selector(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<ClearSelectorParams>,
) -> Json<ApiResponse<()>> {
    state.dispatcher.clear_selector(params.channel_id);
    info!(channel_id = ?params.channel_id, "Selector cache cleared");
    ok(())
}
