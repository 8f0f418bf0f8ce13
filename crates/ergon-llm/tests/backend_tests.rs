#[cfg(test)]
mod tests {
    use ergon_core::{ErgonError, Role};
    use ergon_llm::mock::{MockBackend, MockStep};
    use ergon_llm::provider::{ChatMessage, CompletionRequest, ModelBackend, StreamChunk};
    use ergon_llm::{LocalBackend, RetryingBackend};
    use std::sync::Arc;
    use std::time::Duration;

    fn make_request(model: &str) -> CompletionRequest {
        CompletionRequest::new(
            model,
            vec![
                ChatMessage::new(Role::System, "You are terse."),
                ChatMessage::new(Role::User, "Hello"),
            ],
        )
    }

    fn fast_retry(inner: Arc<dyn ModelBackend>, retries: u32) -> RetryingBackend {
        RetryingBackend::new(inner)
            .with_max_retries(retries)
            .with_base_delay(Duration::from_millis(1))
    }

    // ── Retry ──────────────────────────────────────────────────

    #[tokio::test]
    async fn test_retry_recovers_from_transient_error() {
        let mock = Arc::new(
            MockBackend::new("mock")
                .with_error("HTTP 503: Service Unavailable")
                .with_error("HTTP 502: Bad Gateway")
                .with_response("recovered"),
        );
        let backend = fast_retry(mock.clone(), 3);
        let text = backend.complete(&make_request("mock/x")).await.unwrap();
        assert_eq!(text, "recovered");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_unreachable() {
        let mock = Arc::new(
            MockBackend::new("mock")
                .with_error("HTTP 500: a")
                .with_error("HTTP 500: b")
                .with_error("HTTP 500: c"),
        );
        let backend = fast_retry(mock.clone(), 2);
        let err = backend.complete(&make_request("mock/x")).await.unwrap_err();
        match err {
            ErgonError::BackendUnreachable { attempts, reason } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("HTTP 500: c"));
            }
            other => panic!("expected BackendUnreachable, got {other:?}"),
        }
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_not_retried() {
        let mock = Arc::new(
            MockBackend::new("mock")
                .with_error("HTTP 400: bad request")
                .with_response("never reached"),
        );
        let backend = fast_retry(mock.clone(), 3);
        let err = backend.complete(&make_request("mock/x")).await.unwrap_err();
        assert!(matches!(err, ErgonError::Backend(_)));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_stream_through_retry() {
        let mock = Arc::new(MockBackend::new("mock").with_response("one two"));
        let backend = fast_retry(mock, 1);
        let mut rx = backend.stream(&make_request("mock/x")).await.unwrap();
        let mut text = String::new();
        while let Some(chunk) = rx.recv().await {
            match chunk {
                StreamChunk::TextDelta(t) => text.push_str(&t),
                StreamChunk::Done => break,
                StreamChunk::Error(e) => panic!("stream error: {e}"),
            }
        }
        assert_eq!(text, "one two");
    }

    // ── Mock behaviors ─────────────────────────────────────────

    #[tokio::test]
    async fn test_delayed_step_waits() {
        let mock = MockBackend::new("mock").with_step(MockStep::Delayed {
            delay: Duration::from_millis(30),
            then: Box::new(MockStep::Echo),
        });
        let start = std::time::Instant::now();
        let text = mock.complete(&make_request("mock/x")).await.unwrap();
        assert_eq!(text, "Hello");
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_hanging_backend_can_be_cancelled() {
        let mock = MockBackend::hanging();
        let result =
            tokio::time::timeout(Duration::from_millis(20), mock.complete(&make_request("m/x")))
                .await;
        assert!(result.is_err());
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_backend_is_stateless_between_calls() {
        let mock = MockBackend::echo();
        let first = make_request("mock/echo");
        let mut second = make_request("mock/echo");
        second.messages[1] = ChatMessage::new(Role::User, "Different");
        assert_eq!(mock.complete(&first).await.unwrap(), "Hello");
        assert_eq!(mock.complete(&second).await.unwrap(), "Different");
    }

    // ── Local backend ──────────────────────────────────────────

    #[tokio::test]
    async fn test_local_unreachable_after_retries() {
        // Nothing listens on port 1.
        let local: Arc<dyn ModelBackend> = Arc::new(LocalBackend::new("http://127.0.0.1:1"));
        let backend = fast_retry(local, 1);
        let err = backend
            .complete(&make_request("local/llama3"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ErgonError::BackendUnreachable { attempts: 2, .. }
        ));
    }

    // ── Local backend over HTTP ────────────────────────────────

    /// Serve one HTTP exchange on a loopback port: read the request, then
    /// write `head` followed by `body_parts`, each flushed separately.
    async fn serve_once(head: String, body_parts: Vec<Vec<u8>>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_lowercase();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            socket.write_all(head.as_bytes()).await.unwrap();
            for part in body_parts {
                socket.write_all(&part).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}")
    }

    /// A chunked NDJSON response; each element becomes one HTTP chunk.
    async fn serve_chunked(chunks: Vec<Vec<u8>>) -> String {
        let head = "HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\n\
                    transfer-encoding: chunked\r\nconnection: close\r\n\r\n"
            .to_string();
        let mut parts: Vec<Vec<u8>> = chunks
            .into_iter()
            .map(|chunk| {
                let mut part = format!("{:x}\r\n", chunk.len()).into_bytes();
                part.extend_from_slice(&chunk);
                part.extend_from_slice(b"\r\n");
                part
            })
            .collect();
        parts.push(b"0\r\n\r\n".to_vec());
        serve_once(head, parts).await
    }

    async fn serve_json(status: &str, extra_headers: &str, body: &str) -> String {
        let head = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\n{extra_headers}\
             content-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        serve_once(head, Vec::new()).await
    }

    async fn collect_stream(backend: &LocalBackend) -> Vec<StreamChunk> {
        let mut rx = backend.stream(&make_request("local/llama3")).await.unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    fn text_of(chunks: &[StreamChunk]) -> String {
        chunks
            .iter()
            .filter_map(|c| match c {
                StreamChunk::TextDelta(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_local_stream_keeps_split_multibyte_character() {
        let line = "{\"message\":{\"content\":\"café\"},\"done\":false}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let url = serve_chunked(vec![
            line[..split].to_vec(),
            line[split..].to_vec(),
            b"{\"message\":{\"content\":\"\"},\"done\":true}\n".to_vec(),
        ])
        .await;

        let chunks = collect_stream(&LocalBackend::new(url)).await;
        assert_eq!(text_of(&chunks), "café");
        assert_eq!(chunks.last(), Some(&StreamChunk::Done));
    }

    #[tokio::test]
    async fn test_local_stream_surfaces_error_line() {
        let url = serve_chunked(vec![
            b"{\"message\":{\"content\":\"partial \"},\"done\":false}\n".to_vec(),
            b"{\"error\":\"model runner has unexpectedly stopped\"}\n".to_vec(),
        ])
        .await;

        let chunks = collect_stream(&LocalBackend::new(url)).await;
        assert_eq!(text_of(&chunks), "partial ");
        assert!(!chunks.contains(&StreamChunk::Done));
        assert!(
            matches!(chunks.last(), Some(StreamChunk::Error(e)) if e.contains("unexpectedly stopped"))
        );
    }

    #[tokio::test]
    async fn test_local_stream_truncated_body_is_error() {
        let url = serve_chunked(vec![
            b"{\"message\":{\"content\":\"half an ans\"},\"done\":false}\n".to_vec(),
        ])
        .await;

        let chunks = collect_stream(&LocalBackend::new(url)).await;
        assert!(matches!(chunks.last(), Some(StreamChunk::Error(_))));
    }

    #[tokio::test]
    async fn test_local_complete_reads_message_content() {
        let url = serve_json(
            "200 OK",
            "",
            r#"{"message":{"role":"assistant","content":"Bonjour"},"done":true}"#,
        )
        .await;
        let text = LocalBackend::new(url)
            .complete(&make_request("local/llama3"))
            .await
            .unwrap();
        assert_eq!(text, "Bonjour");
    }

    #[tokio::test]
    async fn test_local_complete_without_content_is_error() {
        let url = serve_json("200 OK", "", r#"{"done":true}"#).await;
        let err = LocalBackend::new(url)
            .complete(&make_request("local/llama3"))
            .await
            .unwrap_err();
        assert!(matches!(err, ErgonError::Backend(ref m) if m.contains("no message content")));
    }

    #[tokio::test]
    async fn test_local_complete_error_field_is_error() {
        let url = serve_json("200 OK", "", r#"{"error":"model 'llama3' not found"}"#).await;
        let err = LocalBackend::new(url)
            .complete(&make_request("local/llama3"))
            .await
            .unwrap_err();
        assert!(matches!(err, ErgonError::Backend(ref m) if m.contains("not found")));
    }

    #[tokio::test]
    async fn test_local_429_with_retry_after_is_rate_limited() {
        let url = serve_json("429 Too Many Requests", "retry-after: 7\r\n", "slow down").await;
        let err = LocalBackend::new(url)
            .complete(&make_request("local/llama3"))
            .await
            .unwrap_err();
        assert!(matches!(err, ErgonError::RateLimited { retry_after_secs: 7 }));
    }

    #[tokio::test]
    async fn test_local_health_check() {
        let url = serve_json("200 OK", "", r#"{"models":[]}"#).await;
        LocalBackend::new(url).health_check().await.unwrap();

        let down: Arc<dyn ModelBackend> = Arc::new(LocalBackend::new("http://127.0.0.1:1"));
        assert!(down.health_check().await.is_err());
    }
}
