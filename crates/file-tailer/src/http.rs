// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client construction shared by the stream writer and the token
//! fetcher.

use core::time::Duration;
use std::error::Error;

use tracing::error;

/// Environment variable consulted for an HTTPS proxy.
pub const HTTPS_PROXY_ENV: &str = "HTTPS_PROXY";

/// Builds a client with the given request timeout, routed through
/// `HTTPS_PROXY` when it is set. A malformed proxy falls back to a direct
/// connection.
#[must_use]
pub fn get_client(timeout: Duration) -> reqwest::Client {
    let proxy = std::env::var(HTTPS_PROXY_ENV)
        .ok()
        .filter(|p| !p.trim().is_empty());
    match build_client(proxy.as_deref(), timeout) {
        Ok(client) => client,
        Err(e) => {
            error!("Unable to parse proxy configuration: {e}, falling back to direct connection");
            match build_client(None, timeout) {
                Ok(client) => client,
                Err(inner) => {
                    error!("Failed to build HTTP client: {inner}, using reqwest defaults");
                    reqwest::Client::new()
                }
            }
        }
    }
}

pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    Ok(builder.build()?)
}
