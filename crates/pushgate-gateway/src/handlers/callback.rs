//! Provider callback ingress.

use crate::server::GatewayState;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use pushgate_channels::{CallbackRequest, ProviderReply};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hands the raw request to the provider's callback handler and returns its
/// reply verbatim.
///
/// The path segment is a provider code, or a numeric provider account ID
/// that resolves to one.
pub async fn receive(
    State(state): State<Arc<GatewayState>>,
    Path(provider): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    raw_body: Bytes,
) -> Response {
    let provider_code = resolve_provider(&state, &provider).await;
    debug!(provider = %provider_code, bytes = raw_body.len(), "Callback request");

    let request = CallbackRequest {
        provider_code: provider_code.clone(),
        raw_body: raw_body.to_vec(),
        headers: header_map(&headers),
        query,
    };
    let reply = state.dispatcher.handle_callback(&provider_code, request).await;
    reply_response(reply)
}

async fn resolve_provider(state: &GatewayState, segment: &str) -> String {
    let Ok(account_id) = segment.parse::<u64>() else {
        return segment.to_string();
    };
    match state.dispatcher.stores().channels.account(account_id).await {
        Ok(Some(account)) => account.provider_code,
        Ok(None) => segment.to_string(),
        Err(e) => {
            warn!(account_id, error = %e, "Failed to resolve callback account");
            segment.to_string()
        }
    }
}

/// First value of each header, lowercased names.
fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    map
}

fn reply_response(reply: ProviderReply) -> Response {
    let status = StatusCode::from_u16(reply.status_code).unwrap_or(StatusCode::OK);
    (status, [(header::CONTENT_TYPE, reply.content_type)], reply.body).into_response()
}
