//! Inbound webhook endpoint
//!
//! The body is taken as raw bytes and handed to the coordinator untouched;
//! signatures are computed over exactly what the provider sent.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

use hg_common::{InboundRequest, ProcessingOutcome};
use hg_config::ServerSettings;
use hg_coordinator::{IngestResponse, Processing};

use crate::error::ApiFailure;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    /// accepted | duplicate
    pub status: &'static str,
    pub event_id: String,
    /// immediate | queued, for accepted events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing: Option<&'static str>,
    /// First attempt for immediate events, recorded outcome for duplicates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ProcessingOutcome>,
}

impl WebhookResponse {
    /// Status code and body for a coordinator answer
    pub fn from_ingest(response: IngestResponse) -> (StatusCode, Self) {
        match response {
            IngestResponse::Accepted {
                event_id,
                processing: Processing::Immediate(outcome),
            } => (
                StatusCode::OK,
                WebhookResponse {
                    status: "accepted",
                    event_id,
                    processing: Some("immediate"),
                    outcome: Some(outcome),
                },
            ),
            IngestResponse::Accepted {
                event_id,
                processing: Processing::Queued,
            } => (
                StatusCode::ACCEPTED,
                WebhookResponse {
                    status: "accepted",
                    event_id,
                    processing: Some("queued"),
                    outcome: None,
                },
            ),
            IngestResponse::Duplicate { event_id, previous } => (
                StatusCode::OK,
                WebhookResponse {
                    status: "duplicate",
                    event_id,
                    processing: None,
                    outcome: previous,
                },
            ),
        }
    }
}

/// POST /webhooks/:provider_id
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiFailure> {
    let mut request = InboundRequest::new(provider_id, body);
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }
    let server = state.coordinator.config().current().server.clone();
    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    if let Some(source) = source_identifier(&headers, peer, &server) {
        request = request.with_source(source);
    }
    if let Some(url) = public_url(&headers, &uri) {
        request = request.with_request_url(url);
    }

    debug!(
        provider_id = %request.provider_id,
        bytes = request.raw_body.len(),
        source = ?request.source_identifier,
        "Webhook received"
    );

    let response = state.coordinator.ingest(request).await?;
    let (status, body) = WebhookResponse::from_ingest(response);
    Ok((status, Json(body)).into_response())
}

/// Client address for rate limiting.
///
/// `X-Forwarded-For` is only read when the peer is a trusted proxy. Hops are
/// walked right to left and the first one that is not itself a trusted proxy
/// is the client; anything left of it is caller-supplied.
fn source_identifier(headers: &HeaderMap, peer: Option<SocketAddr>, server: &ServerSettings) -> Option<String> {
    let peer = peer?.ip();
    if !server.is_trusted_proxy(&peer) {
        return Some(peer.to_string());
    }

    let hops: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();

    let client = hops
        .iter()
        .rev()
        .find(|hop| !hop.parse::<IpAddr>().is_ok_and(|ip| server.is_trusted_proxy(&ip)))
        .or_else(|| hops.first());

    match client {
        Some(hop) => Some(hop.to_string()),
        None => Some(peer.to_string()),
    }
}

/// URL the provider posted to, as it saw it. URL-signing schemes sign this.
fn public_url(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get("host"))
        .and_then(|v| v.to_str().ok())?;
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("https");
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Some(format!("{}://{}{}", scheme, host, path))
}
