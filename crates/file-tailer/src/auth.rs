// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bearer-token authentication for the stream writer.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

/// Authentication as written in the configuration file.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthSettings {
    #[default]
    Disabled,
    Static {
        token: String,
    },
    Basic {
        auth_uri: String,
        username: String,
        password: String,
    },
}

impl Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthSettings::Disabled => write!(f, "Disabled"),
            AuthSettings::Static { .. } => write!(f, "Static"),
            AuthSettings::Basic {
                auth_uri, username, ..
            } => write!(f, "Basic {{ auth_uri: {auth_uri}, username: {username} }}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token endpoint answered {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[allow(dead_code)]
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    refresh_at: Option<Instant>,
}

pub struct BasicAuth {
    client: reqwest::Client,
    auth_uri: String,
    username: String,
    password: String,
    token: Mutex<Option<CachedToken>>,
}

impl BasicAuth {
    async fn fetch_token(&self) -> Result<String, AuthError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.refresh_at.map_or(true, |at| Instant::now() < at) {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .client
            .get(&self.auth_uri)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Status(status));
        }
        let body: TokenResponse = response.json().await?;
        debug!(auth_uri = %self.auth_uri, "Fetched stream token");

        // Refresh once 90% of the lifetime has elapsed.
        let refresh_at = body
            .expires_in
            .map(|secs| Instant::now() + Duration::from_millis(secs.saturating_mul(900)));
        let value = body.access_token;
        *cached = Some(CachedToken {
            value: value.clone(),
            refresh_at,
        });
        Ok(value)
    }

    async fn invalidate(&self) {
        self.token.lock().await.take();
    }
}

/// Token source for the stream writer, resolved once from configuration.
#[derive(Clone, Default)]
pub enum AuthStrategy {
    #[default]
    Disabled,
    StaticToken(String),
    Basic(Arc<BasicAuth>),
}

impl AuthStrategy {
    #[must_use]
    pub fn from_settings(settings: &AuthSettings, client: reqwest::Client) -> Self {
        match settings {
            AuthSettings::Disabled => Self::Disabled,
            AuthSettings::Static { token } => Self::StaticToken(token.clone()),
            AuthSettings::Basic {
                auth_uri,
                username,
                password,
            } => Self::Basic(Arc::new(BasicAuth {
                client,
                auth_uri: auth_uri.clone(),
                username: username.clone(),
                password: password.clone(),
                token: Mutex::new(None),
            })),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Returns `None` when authentication is disabled.
    pub async fn fetch_token(&self) -> Result<Option<String>, AuthError> {
        match self {
            Self::Disabled => Ok(None),
            Self::StaticToken(token) => Ok(Some(token.clone())),
            Self::Basic(basic) => basic.fetch_token().await.map(Some),
        }
    }

    /// Drops a cached token so the next call fetches a fresh one.
    pub async fn invalidate(&self) {
        if let Self::Basic(basic) = self {
            basic.invalidate().await;
        }
    }
}

impl Debug for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "AuthStrategy::Disabled"),
            Self::StaticToken(_) => write!(f, "AuthStrategy::StaticToken"),
            Self::Basic(basic) => write!(f, "AuthStrategy::Basic({})", basic.auth_uri),
        }
    }
}
