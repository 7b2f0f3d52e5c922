//! Gateway discovery, capability fetch, worker health (C4, spec §4.3.5).

use std::time::Duration;

use serde::Deserialize;

use crate::cancel::CancellationToken;
use crate::config::CloudCapabilities;
use crate::error::{ExperimentError, ProtocolErrorKind};
use crate::transport::http::{classify_status, to_network_error, TransportClient};
use crate::transport::retry::with_backoff;

const GLOBAL_API: &str = "https://api.example.com";

fn is_retryable_network(err: &ExperimentError) -> bool {
    matches!(err, ExperimentError::Network { .. })
}

#[derive(Deserialize)]
struct GatewayResponse {
    gateway: Option<String>,
}

/// `GET <global>/gwbychannelregion` (§4.3.5). Callers cache the result on
/// `ResolvedConfig` for the process lifetime; this function itself is
/// uncached so tests can exercise it directly.
pub async fn discover_gateway(
    transport: &TransportClient,
    api_key: &str,
    channel: &str,
    region: &str,
    token: &CancellationToken,
) -> Result<String, ExperimentError> {
    let url = format!("{GLOBAL_API}/gwbychannelregion");
    with_backoff(3, Duration::from_secs(1), token, is_retryable_network, || async {
        let resp = transport
            .raw()
            .get(&url)
            .header("apikey", api_key)
            .header("channel", channel)
            .header("region", region)
            .send()
            .await
            .map_err(to_network_error)?;
        if let Some(err) = classify_status(resp.status()) {
            return Err(err);
        }
        let body: GatewayResponse = resp
            .json()
            .await
            .map_err(|e| ExperimentError::protocol(ProtocolErrorKind::MalformedResponse, format!("invalid JSON: {e}")))?;
        body.gateway
            .ok_or_else(|| ExperimentError::protocol(ProtocolErrorKind::MalformedResponse, "missing gateway"))
    })
    .await
}

/// `GET <gateway>/cloudcaps?version=<version>` (§4.3.5).
pub async fn fetch_capabilities(
    transport: &TransportClient,
    gateway: &str,
    api_key: &str,
    client_version: &str,
    tools_version: &str,
    token: &CancellationToken,
) -> Result<CloudCapabilities, ExperimentError> {
    let url = format!("{}/cloudcaps", gateway.trim_end_matches('/'));
    let caps: CloudCapabilities = with_backoff(3, Duration::from_secs(1), token, is_retryable_network, || async {
        let resp = transport
            .raw()
            .get(&url)
            .query(&[("version", tools_version)])
            .header("apikey", api_key)
            .header("extversion", client_version)
            .send()
            .await
            .map_err(to_network_error)?;
        if let Some(err) = classify_status(resp.status()) {
            return Err(err);
        }
        resp.json()
            .await
            .map_err(|e| ExperimentError::protocol(ProtocolErrorKind::MalformedResponse, format!("invalid JSON: {e}")))
    })
    .await?;

    if !caps.supports_version(tools_version) {
        return Err(ExperimentError::protocol(
            ProtocolErrorKind::VersionMismatch,
            format!("tools version {tools_version} not in {:?}", caps.tools_versions),
        ));
    }
    Ok(caps)
}

#[derive(Deserialize)]
struct WorkerStatusResponse {
    ok: bool,
}

/// `GET <gateway>/dataworkerstatus` (§4.3.5). Called once per `run()` before
/// packaging; a non-`ok` result is fatal before submission.
pub async fn check_workers(
    transport: &TransportClient,
    gateway: &str,
    api_key: &str,
    client_version: &str,
    token: &CancellationToken,
) -> Result<(), ExperimentError> {
    let url = format!("{}/dataworkerstatus", gateway.trim_end_matches('/'));
    let status: WorkerStatusResponse = with_backoff(3, Duration::from_secs(1), token, is_retryable_network, || async {
        let resp = transport
            .raw()
            .get(&url)
            .header("apikey", api_key)
            .header("extversion", client_version)
            .send()
            .await
            .map_err(to_network_error)?;
        if let Some(err) = classify_status(resp.status()) {
            return Err(err);
        }
        resp.json()
            .await
            .map_err(|e| ExperimentError::protocol(ProtocolErrorKind::MalformedResponse, format!("invalid JSON: {e}")))
    })
    .await?;

    if !status.ok {
        return Err(ExperimentError::ServiceUnavailable { message: "worker status check returned not-ok".to_string() });
    }
    Ok(())
}
