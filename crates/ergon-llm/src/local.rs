use async_trait::async_trait;
use ergon_core::{ErgonError, Result};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::provider::*;

/// Ollama-compatible local model server (llama.cpp, Ollama, ...).
pub struct LocalBackend {
    client: reqwest::Client,
    /// Address of the local inference server (e.g. "http://127.0.0.1:11434")
    base_url: String,
}

impl LocalBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Default Ollama instance
    pub fn ollama() -> Self {
        Self::new("http://127.0.0.1:11434")
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build the `/api/chat` body. The provider prefix is stripped from the model.
    pub fn chat_body(request: &CompletionRequest, stream: bool) -> serde_json::Value {
        let (_, model) = split_model(&request.model);
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|msg| {
                serde_json::json!({
                    "role": msg.role.as_str(),
                    "content": msg.content,
                })
            })
            .collect();

        serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": stream,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            }
        })
    }

    async fn status_error(resp: reqwest::Response) -> ErgonError {
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            && let Some(retry_after_secs) = retry_after_secs(resp.headers())
        {
            return ErgonError::RateLimited { retry_after_secs };
        }
        let text = resp.text().await.unwrap_or_default();
        ErgonError::Backend(format!("HTTP {}: {}", status.as_u16(), text))
    }
}

/// `Retry-After` in whole seconds. The HTTP-date form is not honoured.
fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Map a reqwest send failure so connect and timeout failures read as transient.
fn transport_error(e: reqwest::Error) -> ErgonError {
    if e.is_timeout() {
        ErgonError::Backend(format!("local: request timed out: {e}"))
    } else if e.is_connect() {
        ErgonError::Backend(format!("local: connection failed: {e}"))
    } else {
        ErgonError::Backend(format!("local: {e}"))
    }
}

fn error_text(value: &serde_json::Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    }
}

/// Newline-delimited lines over a byte stream.
///
/// Bytes are held until their line is complete, so a multibyte character
/// split across network chunks is decoded whole.
#[derive(Default)]
struct NdjsonLines {
    buffer: Vec<u8>,
}

impl NdjsonLines {
    fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        let newline = self.buffer.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
        line.pop();
        Some(line)
    }

    /// Whatever trails the last newline once the body has ended.
    fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buffer);
        (!rest.iter().all(u8::is_ascii_whitespace)).then_some(rest)
    }
}

/// The chunks one `/api/chat` stream line stands for.
fn chat_line_chunks(line: &[u8]) -> Vec<StreamChunk> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Vec::new();
    }
    let event: serde_json::Value = match serde_json::from_slice(line) {
        Ok(event) => event,
        Err(e) => return vec![StreamChunk::Error(format!("local: malformed stream line: {e}"))],
    };
    if let Some(err) = event.get("error") {
        return vec![StreamChunk::Error(format!("local: {}", error_text(err)))];
    }

    let mut chunks = Vec::new();
    if let Some(content) = event["message"]["content"].as_str()
        && !content.is_empty()
    {
        chunks.push(StreamChunk::TextDelta(content.to_string()));
    }
    if event["done"].as_bool() == Some(true) {
        chunks.push(StreamChunk::Done);
    }
    chunks
}

/// Forward chunks until one ends the stream. Returns `true` once it has.
async fn forward(chunks: Vec<StreamChunk>, tx: &mpsc::Sender<StreamChunk>) -> bool {
    for chunk in chunks {
        let ends = !matches!(chunk, StreamChunk::TextDelta(_));
        if tx.send(chunk).await.is_err() || ends {
            return true;
        }
    }
    false
}

/// Decode an Ollama NDJSON body into `tx`.
///
/// Exactly one `Done` or `Error` is sent last. A body that ends before a
/// `done: true` line is an error.
async fn pump_ndjson<S, B, E>(body: S, tx: mpsc::Sender<StreamChunk>)
where
    S: futures::Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    use futures::StreamExt;
    let mut body = std::pin::pin!(body);
    let mut lines = NdjsonLines::default();

    while let Some(next) = body.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx.send(StreamChunk::Error(format!("local: {e}"))).await;
                return;
            }
        };
        lines.extend(bytes.as_ref());
        while let Some(line) = lines.next_line() {
            if forward(chat_line_chunks(&line), &tx).await {
                return;
            }
        }
    }

    if let Some(line) = lines.finish()
        && forward(chat_line_chunks(&line), &tx).await
    {
        return;
    }
    let _ = tx
        .send(StreamChunk::Error(
            "local: stream ended before the model finished".into(),
        ))
        .await;
}

#[async_trait]
impl ModelBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = Self::chat_body(request, false);
        debug!(model = %request.model, messages = request.messages.len(), "local completion");

        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            return Err(Self::status_error(resp).await);
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ErgonError::Backend(format!("local: invalid response: {e}")))?;

        if let Some(err) = data.get("error") {
            return Err(ErgonError::Backend(format!("local: {}", error_text(err))));
        }
        data["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ErgonError::Backend("local: response has no message content".into()))
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<mpsc::Receiver<StreamChunk>> {
        let body = Self::chat_body(request, true);

        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            return Err(Self::status_error(resp).await);
        }

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(pump_ndjson(resp.bytes_stream(), tx));
        Ok(rx)
    }

    async fn health_check(&self) -> Result<()> {
        info!(base_url = %self.base_url, "checking local model health");
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(transport_error)?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::status_error(resp).await)
        }
    }
}
