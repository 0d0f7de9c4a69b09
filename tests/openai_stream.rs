//! Streaming trims through the OpenAI provider against a local server.
//!
//! The server answers one request with a fixed `text/event-stream` body and
//! then closes the connection, which lets each test decide whether the
//! stream finishes with `data: [DONE]` or is cut short.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use story_trim::app::StoryTrim;
use story_trim::config::{Config, LlmConfig};
use story_trim::error::TrimError;
use story_trim::llm::create_llm;
use story_trim::migrate;
use story_trim_core::fingerprint::fingerprint;
use story_trim_core::store::memory::InMemoryStore;
use story_trim_core::store::Stores;

const API_KEY_ENV: &str = "STORYTRIM_STREAM_TEST_KEY";
const PASSAGE: &str = "A passage about a long walk through the rain.";

/// Read one HTTP request, headers and body.
async fn read_request(socket: &mut TcpStream) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let body_len = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                return Ok(());
            }
        }
    }
}

/// Serve `events` once as an SSE response, then close. Returns the base URL.
async fn serve_once(events: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await.unwrap();
        let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(events.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
    });
    format!("http://{addr}/v1")
}

async fn app_for(base_url: String) -> (StoryTrim, Stores, i64) {
    std::env::set_var(API_KEY_ENV, "test-key");
    let mut config = Config::default();
    config.trim.replay_interval_ms = 0;
    config.llm = LlmConfig {
        provider: "openai".to_string(),
        model: Some("test-model".to_string()),
        base_url,
        api_key_env: API_KEY_ENV.to_string(),
        timeout_secs: 5,
        max_retries: 0,
    };

    let stores = Stores::shared(Arc::new(InMemoryStore::new()));
    let prompts = migrate::seed_prompts(stores.prompts.as_ref()).await.unwrap();
    let prompt_id = prompts.iter().find(|p| p.name == "standard").unwrap().id;
    let llm = create_llm(&config.llm).unwrap();
    let app = StoryTrim::new(&config, stores.clone(), llm);
    (app, stores, prompt_id)
}

#[tokio::test]
async fn test_connection_dropped_before_done_is_not_cached() {
    let base_url = serve_once(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Half a tri\"}}]}\n\n",
    )
    .await;
    let (app, stores, prompt_id) = app_for(base_url).await;

    let stream = app
        .stream_trim_text(PASSAGE, prompt_id, CancellationToken::new())
        .await
        .unwrap();
    let err = stream.collect().await.err().unwrap();
    assert!(matches!(err, TrimError::Llm(_)));

    let entries = stores
        .cache
        .list_trim_results(&fingerprint(PASSAGE), prompt_id, 1)
        .await
        .unwrap();
    assert!(entries.is_empty());
    app.shutdown().await;
}

#[tokio::test]
async fn test_complete_stream_is_cached() {
    let base_url = serve_once(concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Half a tri\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"m.\"}}]}\n\n",
        "data: [DONE]\n\n",
    ))
    .await;
    let (app, stores, prompt_id) = app_for(base_url).await;

    let stream = app
        .stream_trim_text(PASSAGE, prompt_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.collect().await.unwrap(), "Half a trim.");

    let entries = stores
        .cache
        .list_trim_results(&fingerprint(PASSAGE), prompt_id, 1)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].trimmed_text, "Half a trim.");
    app.shutdown().await;
}
