// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of event payloads to the remote stream.
//!
//! The uploader only relies on [`StreamWriter`]: every call is independent
//! and may be retried freely. [`RestStreamWriter`] is the HTTP
//! implementation used by the daemon.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};

use crate::auth::{AuthError, AuthStrategy};
use crate::charset::Charset;
use crate::config::SinkConfiguration;
use crate::http::get_client;

pub const API_KEY_HEADER: &str = "X-ApiKey";

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("stream answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to authenticate: {0}")]
    Auth(#[from] AuthError),
    #[error("writer is closed")]
    Closed,
}

#[async_trait]
pub trait StreamWriter: Send + Sync {
    /// Delivers one payload, encoded with `charset`.
    async fn write(&self, payload: &str, charset: Charset) -> Result<(), WriteError>;

    /// Releases the writer. Later writes fail with [`WriteError::Closed`].
    async fn close(&self);
}

/// Posts each payload to `/{version}/streams/{stream}`.
#[derive(Debug)]
pub struct RestStreamWriter {
    client: reqwest::Client,
    stream_url: String,
    api_key: Option<String>,
    auth: AuthStrategy,
    closed: AtomicBool,
}

impl RestStreamWriter {
    #[must_use]
    pub fn new(sink: &SinkConfiguration) -> Self {
        let client = get_client(sink.request_timeout);
        let auth = AuthStrategy::from_settings(&sink.auth, client.clone());
        Self::with_client(client, sink, auth)
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client, sink: &SinkConfiguration, auth: AuthStrategy) -> Self {
        let scheme = if sink.ssl { "https" } else { "http" };
        let stream_url = format!(
            "{scheme}://{}:{}/{}/streams/{}",
            sink.host, sink.port, sink.version, sink.stream_name
        );
        Self {
            client,
            stream_url,
            api_key: sink.api_key.clone(),
            auth,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    /// Creates the stream if the sink does not know it yet. Sinks answer an
    /// existing stream with a success or a conflict, both are accepted.
    pub async fn create_stream(&self) -> Result<(), WriteError> {
        match self.send(Method::PUT, Vec::new()).await {
            Err(WriteError::Status { status, .. }) if status == StatusCode::CONFLICT => Ok(()),
            other => other,
        }
    }

    async fn send(&self, method: Method, body: Vec<u8>) -> Result<(), WriteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WriteError::Closed);
        }

        let mut request = self.client.request(method, &self.stream_url).body(body);
        if let Some(api_key) = &self.api_key {
            request = request.header(API_KEY_HEADER, api_key);
        }
        if let Some(token) = self.auth.fetch_token().await? {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED && self.auth.is_enabled() {
            debug!("Stream rejected token, invalidating it");
            self.auth.invalidate().await;
        }
        let body = response.text().await.unwrap_or_default();
        Err(WriteError::Status { status, body })
    }
}

#[async_trait]
impl StreamWriter for RestStreamWriter {
    async fn write(&self, payload: &str, charset: Charset) -> Result<(), WriteError> {
        let body = charset.encode(payload).into_owned();
        self.send(Method::POST, body).await
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(url = %self.stream_url, "Closed stream writer");
        }
    }
}

/// Logs instead of failing: the stream may already exist or be created out
/// of band.
pub async fn ensure_stream(writer: &RestStreamWriter) {
    if let Err(e) = writer.create_stream().await {
        warn!(url = %writer.stream_url(), "Could not create stream: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthSettings;
    use mockito::Matcher;

    fn sink(server: &mockito::Server) -> SinkConfiguration {
        let address = server.host_with_port();
        let (host, port) = address.rsplit_once(':').unwrap();
        let mut sink = SinkConfiguration::new("events", host, port.parse().unwrap());
        sink.request_timeout = Duration::from_secs(2);
        sink
    }

    #[tokio::test]
    async fn posts_payload_to_stream() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/streams/events")
            .match_body("hello")
            .match_header(API_KEY_HEADER, Matcher::Missing)
            .with_status(202)
            .expect(1)
            .create_async()
            .await;

        let writer = RestStreamWriter::new(&sink(&server));
        writer.write("hello", Charset::Utf8).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn sends_api_key_and_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/streams/events")
            .match_header(API_KEY_HEADER, "key-1")
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .create_async()
            .await;

        let mut config = sink(&server);
        config.version = "v1".to_string();
        config.api_key = Some("key-1".to_string());
        config.auth = AuthSettings::Static {
            token: "tok".to_string(),
        };
        let writer = RestStreamWriter::new(&config);
        writer.write("x", Charset::Utf8).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn encodes_body_with_event_charset() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/streams/events")
            .match_body("na?ve")
            .with_status(200)
            .create_async()
            .await;

        let writer = RestStreamWriter::new(&sink(&server));
        writer.write("naïve", Charset::UsAscii).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v2/streams/events")
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let writer = RestStreamWriter::new(&sink(&server));
        let err = writer.write("x", Charset::Utf8).await.unwrap_err();
        assert!(matches!(
            err,
            WriteError::Status { status, ref body } if status == StatusCode::SERVICE_UNAVAILABLE && body == "unavailable"
        ));
    }

    #[tokio::test]
    async fn create_stream_accepts_conflict() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/v2/streams/events")
            .with_status(409)
            .create_async()
            .await;

        let writer = RestStreamWriter::new(&sink(&server));
        assert!(writer.create_stream().await.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn closed_writer_rejects_writes() {
        let server = mockito::Server::new_async().await;
        let writer = RestStreamWriter::new(&sink(&server));
        writer.close().await;
        assert!(matches!(
            writer.write("x", Charset::Utf8).await,
            Err(WriteError::Closed)
        ));
    }

    #[test]
    fn builds_https_url() {
        let mut config = SinkConfiguration::new("s", "sink.example", 443);
        config.ssl = true;
        let writer = RestStreamWriter::new(&config);
        assert_eq!(writer.stream_url(), "https://sink.example:443/v2/streams/s");
    }
}
