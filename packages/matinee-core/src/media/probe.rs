//! Stream availability probing.

use std::time::Duration;

use reqwest::Client;

use crate::protocol_constants::AVAILABILITY_PROBE_TIMEOUT_SECS;

/// Checks whether a stream URL answers at all, forwarding the headers the
/// origin expects. Used on video changes when `availability_check` is
/// enabled so a room is not pointed at a dead source.
///
/// Best-effort: any transport error counts as unavailable.
pub async fn check_stream_available(
    client: &Client,
    url: &str,
    user_agent: &str,
    referer: &str,
) -> bool {
    let mut request = client
        .head(url)
        .timeout(Duration::from_secs(AVAILABILITY_PROBE_TIMEOUT_SECS));
    if !user_agent.is_empty() {
        request = request.header(reqwest::header::USER_AGENT, user_agent);
    }
    if !referer.is_empty() {
        request = request.header(reqwest::header::REFERER, referer);
    }

    match request.send().await {
        Ok(response) => {
            let ok = response.status().is_success() || response.status().is_redirection();
            if !ok {
                log::warn!(
                    "[Probe] {} answered {} during availability check",
                    url,
                    response.status()
                );
            }
            ok
        }
        Err(e) => {
            log::warn!("[Probe] {} unreachable: {}", url, e);
            false
        }
    }
}
