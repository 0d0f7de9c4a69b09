//! OpenAI-compatible chat completions provider.
//!
//! # Retry Strategy
//!
//! Non-streaming calls use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Streaming calls are not retried: increments may already have reached
//! the reader, so a retry would duplicate text.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{parse_structured_reply, ChatStream, LlmPort, StructuredReply};
use crate::config::LlmConfig;

/// Capacity of the increment channel handed to the caller.
const STREAM_BUFFER: usize = 64;

pub struct OpenAiLlm {
    client: reqwest::Client,
    stream_client: reqwest::Client,
    model: String,
    endpoint: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAiLlm {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("llm.model required for OpenAI provider"))?;

        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow!("{} environment variable not set", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        // No total timeout: a long chapter can stream for minutes.
        let stream_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            stream_client,
            model,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            max_retries: config.max_retries,
        })
    }

    fn body(&self, system: &str, user: &str, json_mode: bool, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });
        if json_mode {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        if stream {
            body["stream"] = serde_json::json!(true);
        }
        body
    }

    async fn complete(
        &self,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<(String, Option<i64>)> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::select! {
                    _ = cancel.cancelled() => bail!("request cancelled"),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let request = self
                .client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(body)
                .send();

            let resp = tokio::select! {
                _ = cancel.cancelled() => bail!("request cancelled"),
                resp = request => resp,
            };

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_completion(&json);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        tracing::warn!(%status, attempt, "chat completion failed, retrying");
                        last_err = Some(anyhow!("LLM API error {}: {}", status, body_text));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("LLM API error {}: {}", status, body_text);
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "chat completion request failed, retrying");
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Chat completion failed after retries")))
    }
}

#[async_trait]
impl LlmPort for OpenAiLlm {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(
        &self,
        system: &str,
        user: &str,
        cancel: CancellationToken,
    ) -> Result<ChatStream> {
        let body = self.body(system, user, false, true);
        let request = self
            .stream_client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => bail!("request cancelled"),
            resp = request => resp?,
        };

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("LLM API error {}: {}", status, body_text);
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(forward_sse(response.bytes_stream(), tx, cancel));

        Ok(rx)
    }

    async fn structured_chat(
        &self,
        system: &str,
        user: &str,
        cancel: CancellationToken,
    ) -> Result<StructuredReply> {
        let body = self.body(system, user, true, false);
        let (text, tokens) = self.complete(&body, &cancel).await?;
        let mut reply = parse_structured_reply(&text)
            .ok_or_else(|| anyhow!("LLM returned an empty structured reply"))?;
        reply.tokens_used = tokens;
        Ok(reply)
    }

    async fn chat(&self, system: &str, user: &str, cancel: CancellationToken) -> Result<String> {
        let body = self.body(system, user, false, false);
        let (text, _) = self.complete(&body, &cancel).await?;
        Ok(text)
    }
}

/// Decode an SSE body into increments on `tx`.
///
/// A body that ends before `data: [DONE]` is a dropped connection and is
/// reported as an error, never as a clean end. Cancellation or a closed
/// receiver stops reading without sending anything.
async fn forward_sse<S, B, E>(body: S, tx: mpsc::Sender<Result<String>>, cancel: CancellationToken)
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<anyhow::Error>,
{
    tokio::pin!(body);
    let mut decoder = SseDecoder::default();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tx.closed() => return,
            chunk = body.next() => chunk,
        };

        let chunk = match chunk {
            Some(Ok(c)) => c,
            Some(Err(e)) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
            None => {
                if !cancel.is_cancelled() {
                    let _ = tx.send(Err(anyhow!("stream ended before [DONE]"))).await;
                }
                return;
            }
        };

        for event in decoder.push(chunk.as_ref()) {
            match event {
                SseEvent::Done => return,
                SseEvent::Data(data) => match parse_delta(&data) {
                    Ok(Some(text)) if !text.is_empty() => {
                        if tx.send(Ok(text)).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                },
            }
        }
    }
}

fn parse_completion(json: &serde_json::Value) -> Result<(String, Option<i64>)> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow!("Invalid chat completion response: missing message content"))?;
    let tokens = json.pointer("/usage/total_tokens").and_then(|t| t.as_i64());
    Ok((content.to_string(), tokens))
}

/// Text of one streamed chunk, if it carries any.
fn parse_delta(data: &str) -> Result<Option<String>> {
    let json: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| anyhow!("Invalid stream chunk: {}", e))?;
    if let Some(err) = json.get("error") {
        bail!("LLM stream error: {}", err);
    }
    Ok(json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .map(str::to_string))
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Incremental `text/event-stream` line splitter.
///
/// Buffers raw bytes so multi-byte characters split across network
/// chunks decode correctly.
#[derive(Default)]
struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                events.push(SseEvent::Done);
            } else if !data.is_empty() {
                events.push(SseEvent::Data(data.to_string()));
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_decoder_splits_lines_across_chunks() {
        let mut dec = SseDecoder::default();
        assert!(dec.push(b"data: {\"a\"").is_empty());
        let events = dec.push(b":1}\n\n: keep-alive\ndata: [DONE]\n");
        assert_eq!(
            events,
            vec![SseEvent::Data("{\"a\":1}".into()), SseEvent::Done]
        );
    }

    #[test]
    fn test_sse_decoder_multibyte_split() {
        let mut dec = SseDecoder::default();
        let line = "data: 山风\n".as_bytes();
        let (a, b) = line.split_at(8);
        assert!(dec.push(a).is_empty());
        assert_eq!(dec.push(b), vec![SseEvent::Data("山风".into())]);
    }

    fn sse_body(chunks: &[&str]) -> impl Stream<Item = std::result::Result<Vec<u8>, std::io::Error>> {
        let chunks: Vec<_> = chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect();
        futures_util::stream::iter(chunks)
    }

    async fn drain(mut rx: mpsc::Receiver<Result<String>>) -> Vec<Result<String>> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_forward_sse_clean_end() {
        let (tx, rx) = mpsc::channel(8);
        let body = sse_body(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Half \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"done\"}}]}\n\ndata: [DONE]\n\n",
        ]);
        forward_sse(body, tx, CancellationToken::new()).await;

        let items = drain(rx).await;
        let texts: Vec<&str> = items.iter().map(|i| i.as_ref().unwrap().as_str()).collect();
        assert_eq!(texts, vec!["Half ", "done"]);
    }

    #[tokio::test]
    async fn test_forward_sse_eof_without_done_is_error() {
        let (tx, rx) = mpsc::channel(8);
        let body = sse_body(&["data: {\"choices\":[{\"delta\":{\"content\":\"Half a tri\"}}]}\n\n"]);
        forward_sse(body, tx, CancellationToken::new()).await;

        let items = drain(rx).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "Half a tri");
        let err = items[1].as_ref().unwrap_err();
        assert!(err.to_string().contains("[DONE]"));
    }

    #[tokio::test]
    async fn test_forward_sse_cancelled_sends_nothing_more() {
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        forward_sse(sse_body(&["data: {}\n\n"]), tx, cancel).await;
        assert!(drain(rx).await.is_empty());
    }

    #[test]
    fn test_parse_delta() {
        let chunk = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_delta(chunk).unwrap().as_deref(), Some("Hel"));
        let role_only = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_delta(role_only).unwrap(), None);
        assert!(parse_delta(r#"{"error":{"message":"boom"}}"#).is_err());
        assert!(parse_delta("not json").is_err());
    }

    #[test]
    fn test_parse_completion() {
        let json = serde_json::json!({
            "choices": [{ "message": { "content": "done" } }],
            "usage": { "total_tokens": 42 }
        });
        assert_eq!(parse_completion(&json).unwrap(), ("done".to_string(), Some(42)));
        assert!(parse_completion(&serde_json::json!({})).is_err());
    }
}
