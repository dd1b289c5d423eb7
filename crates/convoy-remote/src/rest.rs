//! HTTP/REST backend.
//!
//! Endpoint shapes:
//!   POST   /rest/{table}         — upsert one row
//!   DELETE /rest/{table}/{key}   — delete one row
//!   GET    /rest/{table}         — full table snapshot
//!   POST   /rpc/{name}           — server-side function call
//!   GET    /health               — connectivity probe
//!   GET    /changes?topics=a,b   — server-sent-events change feed
//!
//! Error classification: transport failures, timeouts, 408, 429 and 5xx are
//! transient; every other 4xx is permanent.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use convoy_core::config::RemoteConfig;
use convoy_core::types::{ChangeEvent, Record};
use convoy_core::{ConvoyError, ConvoyResult, RemoteError};

use crate::store::{ChangeSession, RecordMatch, RemoteStore};

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct RestRemote {
    /// Client with the fixed per-call timeout, for unary requests.
    client: reqwest::Client,
    /// Client without a total-request timeout; the SSE feed is long-lived
    /// and a whole-request deadline would sever it.
    stream_client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestRemote {
    pub fn new(config: &RemoteConfig) -> ConvoyResult<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConvoyError::Config(format!("building HTTP client: {e}")))?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ConvoyError::Config(format!("building stream client: {e}")))?;

        Ok(RestRemote {
            client,
            stream_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn check(response: Response) -> Result<Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }
}

fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let message = format!("HTTP {status}: {body}");
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        RemoteError::transient(message)
    } else {
        RemoteError::permanent(message)
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    RemoteError::transient(format!("transport: {err}"))
}

#[async_trait]
impl RemoteStore for RestRemote {
    async fn upsert(&self, table: &str, key: &str, payload: Value) -> Result<Record, RemoteError> {
        let body = serde_json::json!({ "key": key, "payload": payload });
        let response = self
            .request(Method::POST, &format!("/rest/{table}"))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = Self::check(response).await?;
        response
            .json::<Record>()
            .await
            .map_err(|e| RemoteError::permanent(format!("decoding upsert response: {e}")))
    }

    async fn delete(&self, table: &str, matcher: &RecordMatch) -> Result<(), RemoteError> {
        let response = self
            .request(Method::DELETE, &format!("/rest/{table}/{}", matcher.key))
            .send()
            .await
            .map_err(transport_error)?;
        // Deleting an absent row is not an error.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn fetch_all(&self, table: &str) -> Result<Vec<Record>, RemoteError> {
        let response = self
            .request(Method::GET, &format!("/rest/{table}"))
            .send()
            .await
            .map_err(transport_error)?;
        let response = Self::check(response).await?;
        response
            .json::<Vec<Record>>()
            .await
            .map_err(|e| RemoteError::permanent(format!("decoding table snapshot: {e}")))
    }

    async fn rpc(&self, name: &str, args: Value) -> Result<Value, RemoteError> {
        let response = self
            .request(Method::POST, &format!("/rpc/{name}"))
            .json(&args)
            .send()
            .await
            .map_err(transport_error)?;
        let response = Self::check(response).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| RemoteError::permanent(format!("decoding rpc response: {e}")))
    }

    async fn subscribe_changes(&self, tables: &[String]) -> Result<ChangeSession, RemoteError> {
        let url = format!("{}/changes?topics={}", self.base_url, tables.join(","));
        let mut builder = self
            .stream_client
            .get(&url)
            .header("accept", "text/event-stream");
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let response = Self::check(response).await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (close_tx, mut close_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::default();
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        debug!("change session closed by caller");
                        break;
                    }
                    chunk = stream.next() => {
                        match chunk {
                            Some(Ok(bytes)) => {
                                for data in parser.push(&bytes) {
                                    match serde_json::from_str::<ChangeEvent>(&data) {
                                        Ok(event) => {
                                            if tx.send(event).await.is_err() {
                                                return;
                                            }
                                        }
                                        Err(e) => {
                                            warn!("undecodable change event: {e}");
                                        }
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                warn!("change stream error: {e}");
                                break;
                            }
                            None => {
                                debug!("change stream ended by server");
                                break;
                            }
                        }
                    }
                }
            }
            // Dropping tx ends the session on the consumer side.
        });

        Ok(ChangeSession::new(rx, close_tx))
    }

    async fn health(&self) -> Result<(), RemoteError> {
        let response = self
            .request(Method::GET, "/health")
            .send()
            .await
            .map_err(transport_error)?;
        Self::check(response).await?;
        Ok(())
    }
}

// ── SSE framing ──────────────────────────────────────────────────────────────

/// Incremental server-sent-events parser. Accumulates `data:` lines and
/// yields one payload per blank-line-terminated event. Comment (`:`) and
/// `event:`/`id:` lines are ignored; the event type travels inside the JSON.
#[derive(Default)]
struct SseParser {
    buf: String,
    data: String,
}

impl SseParser {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
        let mut completed = Vec::new();

        while let Some(newline) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    completed.push(std::mem::take(&mut self.data));
                }
            } else if let Some(payload) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(payload.trim_start());
            }
            // ":" keep-alives and other fields fall through.
        }

        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_parser_single_event() {
        let mut parser = SseParser::default();
        let out = parser.push(b"data: {\"a\":1}\n\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn sse_parser_split_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"data: {\"a\"").is_empty());
        assert!(parser.push(b":1}\n").is_empty());
        let out = parser.push(b"\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn sse_parser_ignores_comments_and_ids() {
        let mut parser = SseParser::default();
        let out = parser.push(b": keep-alive\nid: 7\ndata: {\"b\":2}\n\n");
        assert_eq!(out, vec!["{\"b\":2}".to_string()]);
    }

    #[test]
    fn sse_parser_multiline_data_joined() {
        let mut parser = SseParser::default();
        let out = parser.push(b"data: line1\ndata: line2\n\n");
        assert_eq!(out, vec!["line1\nline2".to_string()]);
    }

    #[test]
    fn status_classification() {
        assert!(status_error(StatusCode::INTERNAL_SERVER_ERROR, "").is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(status_error(StatusCode::REQUEST_TIMEOUT, "").is_transient());
        assert!(!status_error(StatusCode::UNPROCESSABLE_ENTITY, "").is_transient());
        assert!(!status_error(StatusCode::UNAUTHORIZED, "").is_transient());
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let config = RemoteConfig {
            base_url: "http://localhost:8000/".into(),
            ..Default::default()
        };
        let remote = RestRemote::new(&config).unwrap();
        assert_eq!(remote.base_url, "http://localhost:8000");
    }
}
