use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use turnstile_core::{Message, Profile};

use crate::error::{Result, UpstreamError};
use crate::sse::{parse_sse_line, SseParsed, StreamEvent};

/// One attemptable upstream slot: a profile bound to the client that speaks
/// for it. Lets a failover channel hold an ordered list of slots without
/// threading a `Profile` through every call.
#[async_trait]
pub trait UpstreamDispatch: Send + Sync {
    fn profile(&self) -> &Profile;
    async fn stream(&self, req: &ChatRequest, tx: mpsc::Sender<StreamEvent>) -> Result<()>;
}

/// Binds one [`Profile`] to a shared [`UpstreamClient`].
pub struct ProfileDispatcher {
    client: Arc<UpstreamClient>,
    profile: Profile,
}

impl ProfileDispatcher {
    pub fn new(client: Arc<UpstreamClient>, profile: Profile) -> Self {
        Self { client, profile }
    }
}

#[async_trait]
impl UpstreamDispatch for ProfileDispatcher {
    fn profile(&self) -> &Profile {
        &self.profile
    }

    async fn stream(&self, req: &ChatRequest, tx: mpsc::Sender<StreamEvent>) -> Result<()> {
        self.client.stream(&self.profile, req, tx).await
    }
}

/// A chat completion request bound to one [`Profile`]'s model, independent
/// of which channel/tier chose that profile.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
}

/// Speaks the OpenAI chat-completions wire format to one upstream profile.
/// Stateless beyond its HTTP client; every call carries its own auth and URL.
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Issue a streaming POST and forward `StreamEvent`s onto `tx`. The first
    /// non-empty `TextDelta` is the Pipeline's first-frame signal. Returns
    /// once the stream is exhausted or the connection fails before the first
    /// byte — mid-stream transport errors are surfaced as `StreamEvent::Error`
    /// on the channel instead of an `Err` here.
    pub async fn stream(&self, profile: &Profile, req: &ChatRequest, tx: mpsc::Sender<StreamEvent>) -> Result<()> {
        let body = build_request_body(profile, req, true);

        debug!(model = %profile.model, url = %profile.url, "sending upstream streaming request");

        let resp = self
            .client
            .post(&profile.url)
            .bearer_auth(&profile.key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            return Err(UpstreamError::RateLimited {
                retry_after_ms: retry_after_ms(&resp),
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "upstream streaming API error");
            return Err(UpstreamError::Api { status, message: text });
        }

        process_stream(resp, profile.model.clone(), tx).await;
        Ok(())
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

fn retry_after_ms(resp: &reqwest::Response) -> u64 {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|s| s * 1000)
        .unwrap_or(5000)
}

fn build_request_body(profile: &Profile, req: &ChatRequest, stream: bool) -> serde_json::Value {
    let mut messages = vec![serde_json::json!({
        "role": "system",
        "content": req.system,
    })];
    for m in &req.messages {
        messages.push(serde_json::json!({
            "role": m.role.to_string(),
            "content": m.content,
        }));
    }

    serde_json::json!({
        "model": profile.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": stream,
    })
}

/// Line-buffered SSE parse loop: accumulate bytes, split on `\n`, hold the
/// last (possibly partial) line back as the next chunk's prefix.
async fn process_stream(resp: reqwest::Response, model: String, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut tokens_in: u32 = 0;
    let mut tokens_out: u32 = 0;
    let mut stop_reason = String::new();
    let mut line_buf = String::new();

    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx.send(StreamEvent::Error { message: e.to_string() }).await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some(SseParsed::Data(data)) = parse_sse_line(line) else {
                continue;
            };
            if data.trim() == "[DONE]" {
                break;
            }

            let Ok(chunk_resp) = serde_json::from_str::<StreamChunk>(&data) else {
                continue;
            };
            if let Some(usage) = &chunk_resp.usage {
                tokens_in = usage.prompt_tokens;
                tokens_out = usage.completion_tokens;
            }
            for choice in &chunk_resp.choices {
                if let Some(reason) = &choice.finish_reason {
                    if !reason.is_empty() {
                        stop_reason = reason.clone();
                    }
                }
                if let Some(content) = &choice.delta.content {
                    if !content.is_empty() {
                        if tx.send(StreamEvent::TextDelta { text: content.clone() }).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }

        line_buf = remainder;
    }

    let _ = tx
        .send(StreamEvent::Done {
            model,
            tokens_in,
            tokens_out,
            stop_reason,
        })
        .await;
}

#[derive(serde::Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    usage: Option<StreamUsage>,
}

#[derive(serde::Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(serde::Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(serde::Deserialize)]
struct StreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile_core::Role;

    #[test]
    fn build_request_body_forces_profile_model_and_stream_flag() {
        let profile = Profile {
            id: "p1".into(),
            provider: "openai".into(),
            url: "https://example.invalid/v1/chat/completions".into(),
            key: "sk-test".into(),
            model: "gpt-test".into(),
            firstchunk_timeout_ms: 2000,
            total_timeout_ms: 30000,
        };
        let req = ChatRequest {
            system: "be terse".into(),
            messages: vec![Message::user("hi")],
            max_tokens: 512,
        };
        let body = build_request_body(&profile, &req, true);
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], Role::User.to_string());
    }
}
