//! Proxy to the in-cluster agent API. Synchronous sends wait for the full
//! agent response; streaming sends relay the agent's server-sent events to
//! the caller with framing preserved and a flush per event. The upstream
//! connection is torn down as soon as the caller goes away.

use std::convert::Infallible;

use axum::response::sse::Event;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ApiError;
use crate::models::{Project, SessionSummary};

/// SSE event names that end the stream.
const TERMINAL_EVENTS: &[&str] = &["done", "error"];

/// Budget for non-streaming agent calls. Streaming requests are unbounded;
/// their lifetime is the caller's.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// The endpoint a chat or session operation may dial. Anything but a
/// settled `active` project refuses.
pub fn require_endpoint(project: &Project) -> Result<String, ApiError> {
    if !project.status.is_active() {
        return Err(ApiError::ProjectNotActive(project.id.clone()));
    }
    project
        .endpoint
        .clone()
        .ok_or_else(|| ApiError::ProjectNotActive(project.id.clone()))
}

#[derive(Clone)]
pub struct AgentProxy {
    http: reqwest::Client,
}

impl Default for AgentProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentProxy {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    fn url(endpoint: &str, path: &str) -> String {
        format!("{}{}", endpoint.trim_end_matches('/'), path)
    }

    async fn expect_json(resp: reqwest::Response) -> Result<Value, ApiError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!(
                "agent returned {}: {}",
                status, body
            )));
        }
        resp.json::<Value>().await.map_err(ApiError::upstream)
    }

    /// Health snapshot as reported by the agent.
    pub async fn health(&self, endpoint: &str, health_path: &str) -> Result<Value, ApiError> {
        let resp = self
            .http
            .get(Self::url(endpoint, health_path))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(ApiError::upstream)?;
        Self::expect_json(resp).await
    }

    pub async fn create_session(
        &self,
        endpoint: &str,
        name: &str,
    ) -> Result<SessionSummary, ApiError> {
        let resp = self
            .http
            .post(Self::url(endpoint, "/sessions"))
            .json(&serde_json::json!({ "name": name }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(ApiError::upstream)?;
        let value = Self::expect_json(resp).await?;
        serde_json::from_value(value).map_err(ApiError::upstream)
    }

    pub async fn list_sessions(&self, endpoint: &str) -> Result<Vec<SessionSummary>, ApiError> {
        let resp = self
            .http
            .get(Self::url(endpoint, "/sessions"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(ApiError::upstream)?;
        let value = Self::expect_json(resp).await?;
        let sessions = value
            .get("sessions")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(sessions).map_err(ApiError::upstream)
    }

    pub async fn delete_session(&self, endpoint: &str, session_id: &str) -> Result<(), ApiError> {
        let resp = self
            .http
            .delete(Self::url(endpoint, &format!("/sessions/{}", session_id)))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(ApiError::upstream)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(format!(
                "session {} not found",
                session_id
            )));
        }
        Self::expect_json(resp).await?;
        Ok(())
    }

    /// Message history passthrough: `{session_id, messages, total_count}`.
    pub async fn session_messages(
        &self,
        endpoint: &str,
        session_id: &str,
    ) -> Result<Value, ApiError> {
        let resp = self
            .http
            .get(Self::url(
                endpoint,
                &format!("/sessions/{}/messages", session_id),
            ))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(ApiError::upstream)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(format!(
                "session {} not found",
                session_id
            )));
        }
        Self::expect_json(resp).await
    }

    /// Synchronous send: POST, wait for the whole result, no intermediate
    /// events observed.
    pub async fn send_message(
        &self,
        endpoint: &str,
        session_id: &str,
        content: &str,
    ) -> Result<Value, ApiError> {
        let resp = self
            .http
            .post(Self::url(endpoint, "/messages"))
            .json(&serde_json::json!({ "session_id": session_id, "content": content }))
            .send()
            .await
            .map_err(ApiError::upstream)?;
        Self::expect_json(resp).await
    }

    /// Streaming send: relays the agent's SSE stream event by event. The
    /// relay task exits when the upstream closes, when a terminal event has
    /// been forwarded, or when the caller disconnects (the send fails and
    /// dropping the upstream response cancels the agent request).
    pub async fn stream_message(
        &self,
        endpoint: &str,
        session_id: &str,
        content: &str,
    ) -> Result<ReceiverStream<Result<Event, Infallible>>, ApiError> {
        let resp = self
            .http
            .post(Self::url(endpoint, "/messages/stream"))
            .header(ACCEPT, "text/event-stream")
            .json(&serde_json::json!({ "session_id": session_id, "content": content }))
            .send()
            .await
            .map_err(ApiError::upstream)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!(
                "agent returned {}: {}",
                status, body
            )));
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(16);
        tokio::spawn(async move {
            let mut upstream = resp.bytes_stream();
            let mut buffer = String::new();
            loop {
                match upstream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        for frame in drain_frames(&mut buffer) {
                            let terminal = frame.is_terminal();
                            if tx.send(Ok(frame.into_event())).await.is_err() {
                                // Caller disconnected: dropping `upstream`
                                // cancels the agent request.
                                return;
                            }
                            if terminal {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let event = Event::default().event("error").data(
                            serde_json::json!({ "reason": e.to_string() }).to_string(),
                        );
                        let _ = tx.send(Ok(event)).await;
                        return;
                    }
                    // Clean upstream close ends the downstream stream.
                    None => return,
                }
            }
        });
        Ok(ReceiverStream::new(rx))
    }
}

/// One parsed SSE event block.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: Vec<String>,
}

impl SseFrame {
    pub fn is_terminal(&self) -> bool {
        self.event
            .as_deref()
            .map(|name| TERMINAL_EVENTS.contains(&name))
            .unwrap_or(false)
    }

    fn into_event(self) -> Event {
        let mut event = Event::default();
        if let Some(name) = self.event {
            event = event.event(name);
        }
        // axum re-splits embedded newlines into one `data:` line each,
        // which preserves the upstream framing.
        event.data(self.data.join("\n"))
    }
}

/// Drain complete `\n\n`-terminated event blocks from the buffer, leaving
/// any partial block for the next chunk.
pub fn drain_frames(buffer: &mut String) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    while let Some(block_end) = buffer.find("\n\n") {
        let block = buffer[..block_end].to_string();
        buffer.drain(..block_end + 2);
        if let Some(frame) = parse_block(&block) {
            frames.push(frame);
        }
    }
    frames
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data = Vec::new();
    for line in block.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with(':') {
            continue; // comment
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
    }
    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseFrame { event, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_block_is_drained() {
        let mut buffer = "event: message\ndata: {\"text\":\"hi\"}\n\n".to_string();
        let frames = drain_frames(&mut buffer);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message"));
        assert_eq!(frames[0].data, vec!["{\"text\":\"hi\"}"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_block_stays_buffered() {
        let mut buffer = "event: message\ndata: {\"par".to_string();
        assert!(drain_frames(&mut buffer).is_empty());
        buffer.push_str("tial\"}\n\nevent: done\ndata: {}\n\n");
        let frames = drain_frames(&mut buffer);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, vec!["{\"partial\"}"]);
        assert_eq!(frames[1].event.as_deref(), Some("done"));
    }

    #[test]
    fn multiple_data_lines_preserved() {
        let mut buffer = "event: tool_response\ndata: line1\ndata: line2\n\n".to_string();
        let frames = drain_frames(&mut buffer);
        assert_eq!(frames[0].data, vec!["line1", "line2"]);
    }

    #[test]
    fn crlf_and_comments_tolerated() {
        let mut buffer = ": keepalive\r\nevent: thinking\r\ndata: {}\r\n\n".to_string();
        let frames = drain_frames(&mut buffer);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("thinking"));
    }

    #[test]
    fn terminal_detection() {
        let done = SseFrame {
            event: Some("done".to_string()),
            data: vec!["{}".to_string()],
        };
        let error = SseFrame {
            event: Some("error".to_string()),
            data: vec![],
        };
        let message = SseFrame {
            event: Some("message".to_string()),
            data: vec![],
        };
        assert!(done.is_terminal());
        assert!(error.is_terminal());
        assert!(!message.is_terminal());
    }

    #[test]
    fn comment_only_block_is_skipped() {
        let mut buffer = ": ping\n\nevent: message\ndata: x\n\n".to_string();
        let frames = drain_frames(&mut buffer);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message"));
    }
}
