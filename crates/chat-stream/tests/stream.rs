use chat_stream::review::{CodeReview, Transcript};
use chat_stream::types::chat::{ChatCompletionParams, ChatMessage, Delta};
use chat_stream::{
    ChatClient, ClientOptions, DirectTransport, Error, FailureCause, ProxiedTransport,
    StreamFailure, StreamHandler, StreamOrchestrator, StreamOutcome, StreamRequest,
};
use reqwest::header::HeaderMap;
use serde_json::json;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Message(Delta),
    Error(StreamFailure),
    Finish(String),
}

#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Recorder {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl StreamHandler for Recorder {
    fn on_message(&mut self, delta: Delta) {
        self.calls.lock().unwrap().push(Call::Message(delta));
    }

    fn on_error(&mut self, failure: StreamFailure) {
        self.calls.lock().unwrap().push(Call::Error(failure));
    }

    fn on_finish(&mut self, reason: String) {
        self.calls.lock().unwrap().push(Call::Finish(reason));
    }
}

fn content(text: &str) -> Call {
    Call::Message(Delta {
        content: text.to_string(),
        role: None,
    })
}

fn sse(frames: &[&str]) -> String {
    frames.iter().map(|f| format!("data: {f}\n\n")).collect()
}

fn orchestrator(timeout: Duration) -> StreamOrchestrator {
    StreamOrchestrator::new(Arc::new(DirectTransport::new().unwrap())).with_timeout(timeout)
}

async fn mount_stream(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(response)
        .mount(server)
        .await;
}

fn event_stream(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body)
}

fn request_for(server: &MockServer) -> StreamRequest {
    StreamRequest::post(format!("{}/v1/chat/completions", server.uri()))
        .json(&json!({"model": "test-model", "messages": [], "stream": true}))
        .unwrap()
}

async fn drive(request: StreamRequest, timeout: Duration) -> (StreamOutcome, Vec<Call>) {
    let mut recorder = Recorder::default();
    let outcome = orchestrator(timeout).drive(request, &mut recorder).await;
    (outcome, recorder.calls())
}

fn client_for(server: &MockServer, api_key: &str) -> ChatClient {
    ChatClient::new(ClientOptions {
        entrypoint: Some(format!("{}/v1/chat/completions", server.uri())),
        api_key: Some(api_key.to_string()),
        model: Some("test-model".to_string()),
        proxy: None,
        timeout: Some(Duration::from_secs(5)),
        default_headers: HeaderMap::new(),
    })
    .unwrap()
}

/// Accepts one request, answers with 200 and chunked event-stream headers,
/// then holds the connection open without sending a body byte.
async fn spawn_stalled_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await;
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\n\
                  content-type: text/event-stream\r\n\
                  transfer-encoding: chunked\r\n\r\n",
            )
            .await
            .unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });
    format!("http://{addr}/v1/chat/completions")
}

/// Minimal no-auth SOCKS5 relay. Returns its URL and a connection counter.
async fn spawn_socks5_relay() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((client, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(relay_socks5(client));
        }
    });
    (format!("socks5://{addr}"), connections)
}

async fn relay_socks5(mut client: TcpStream) -> std::io::Result<()> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[0x05, 0x00]).await?;

    // VER CMD RSV ATYP
    let mut head = [0u8; 4];
    client.read_exact(&mut head).await?;
    let host = match head[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            format!("[{}]", Ipv6Addr::from(ip))
        }
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported address type {other}"),
            ))
        }
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    let mut upstream = TcpStream::connect(format!("{host}:{port}")).await?;
    client
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

#[tokio::test]
async fn role_delta_then_content_passes_through() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        event_stream(sse(&[
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"delta":{"content":"Hi"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        ])),
    )
    .await;

    let (outcome, calls) = drive(request_for(&server), Duration::from_secs(5)).await;

    assert_eq!(outcome, StreamOutcome::Completed("stop".to_string()));
    assert_eq!(
        calls,
        vec![
            Call::Message(Delta {
                content: String::new(),
                role: Some("assistant".to_string()),
            }),
            content("Hi"),
            Call::Finish("stop".to_string()),
        ]
    );
}

#[tokio::test]
async fn only_first_content_loses_leading_quote() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        event_stream(sse(&[
            r#"{"choices":[{"delta":{"content":"\"Hello"}}]}"#,
            r#"{"choices":[{"delta":{"content":"\" world"}}]}"#,
        ])),
    )
    .await;

    let (outcome, calls) = drive(request_for(&server), Duration::from_secs(5)).await;

    assert_eq!(outcome, StreamOutcome::Completed("end_of_stream".to_string()));
    assert_eq!(
        calls,
        vec![
            content("Hello"),
            content("\" world"),
            Call::Finish("end_of_stream".to_string()),
        ]
    );
}

#[tokio::test]
async fn finish_reason_ends_delivery() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        event_stream(sse(&[
            r#"{"choices":[{"delta":{"content":"a"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            r#"{"choices":[{"delta":{"content":"b"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"length"}]}"#,
        ])),
    )
    .await;

    let (_, calls) = drive(request_for(&server), Duration::from_secs(5)).await;

    assert_eq!(calls, vec![content("a"), Call::Finish("stop".to_string())]);
}

#[tokio::test]
async fn noise_frames_neither_report_nor_end_the_stream() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        event_stream(
            [
                ": ping\n\n".to_string(),
                sse(&[
                    "not-json",
                    r#"{"choices":[]}"#,
                    r#"{"id":"keep-alive"}"#,
                    r#"{"choices":[{"delta":{"content":"ok"}}]}"#,
                    r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
                    "[DONE]",
                ]),
            ]
            .concat(),
        ),
    )
    .await;

    let (_, calls) = drive(request_for(&server), Duration::from_secs(5)).await;

    assert_eq!(calls, vec![content("ok"), Call::Finish("stop".to_string())]);
}

#[tokio::test]
async fn non_200_delivers_server_body_once() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        ResponseTemplate::new(404).set_body_json(json!({"error": {"message": "not found"}})),
    )
    .await;

    let (outcome, calls) = drive(request_for(&server), Duration::from_secs(5)).await;

    let expected = StreamFailure {
        cause: FailureCause::Status(404),
        body: json!({"error": {"message": "not found"}}),
    };
    assert_eq!(outcome, StreamOutcome::Failed(expected.clone()));
    assert_eq!(calls, vec![Call::Error(expected)]);
}

#[tokio::test]
async fn non_json_error_body_is_wrapped() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        ResponseTemplate::new(502).set_body_string("upstream unavailable"),
    )
    .await;

    let (_, calls) = drive(request_for(&server), Duration::from_secs(5)).await;

    match calls.as_slice() {
        [Call::Error(failure)] => {
            assert_eq!(failure.cause, FailureCause::Status(502));
            assert_eq!(failure.message(), Some("upstream unavailable"));
        }
        other => panic!("expected one error, got {other:?}"),
    }
}

#[tokio::test]
async fn silent_server_times_out() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        event_stream(sse(&[r#"{"choices":[{"delta":{"content":"late"}}]}"#]))
            .set_delay(Duration::from_millis(800)),
    )
    .await;

    let started = Instant::now();
    let (outcome, calls) = drive(request_for(&server), Duration::from_millis(50)).await;

    assert!(started.elapsed() < Duration::from_millis(700));
    let expected = StreamFailure {
        cause: FailureCause::Timeout,
        body: json!({"error": {"message": "Connection Timeout"}}),
    };
    assert_eq!(outcome, StreamOutcome::Failed(expected.clone()));
    assert_eq!(calls, vec![Call::Error(expected)]);
}

#[tokio::test]
async fn silent_body_after_headers_times_out() {
    let url = spawn_stalled_server().await;
    let request = StreamRequest::post(url)
        .json(&json!({"model": "test-model", "messages": [], "stream": true}))
        .unwrap();

    let started = Instant::now();
    let (outcome, calls) = drive(request, Duration::from_millis(200)).await;

    assert!(started.elapsed() < Duration::from_secs(3));
    let expected = StreamFailure {
        cause: FailureCause::Timeout,
        body: json!({"error": {"message": "Connection Timeout"}}),
    };
    assert_eq!(outcome, StreamOutcome::Failed(expected.clone()));
    assert_eq!(calls, vec![Call::Error(expected)]);
}

#[tokio::test]
async fn external_cancellation_aborts_session() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        event_stream(sse(&[r#"{"choices":[{"delta":{"content":"late"}}]}"#]))
            .set_delay(Duration::from_millis(800)),
    )
    .await;

    let token = CancellationToken::new();
    let recorder = Recorder::default();
    let session = orchestrator(Duration::from_secs(5))
        .run(request_for(&server).cancel_on(token.clone()), recorder.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();
    let outcome = session.outcome().await.unwrap();

    let expected = StreamFailure {
        cause: FailureCause::Aborted,
        body: json!({"error": {"message": "aborted"}}),
    };
    assert_eq!(outcome, StreamOutcome::Failed(expected.clone()));
    assert_eq!(recorder.calls(), vec![Call::Error(expected)]);
}

#[tokio::test]
async fn session_abort_leaves_caller_token_alone() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        event_stream(String::new()).set_delay(Duration::from_millis(800)),
    )
    .await;

    let token = CancellationToken::new();
    let recorder = Recorder::default();
    let session = orchestrator(Duration::from_secs(5))
        .run(request_for(&server).cancel_on(token.clone()), recorder.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    session.abort();
    let outcome = session.outcome().await.unwrap();

    assert!(matches!(
        outcome,
        StreamOutcome::Failed(StreamFailure {
            cause: FailureCause::Aborted,
            ..
        })
    ));
    assert!(!token.is_cancelled());
    assert_eq!(recorder.calls().len(), 1);
}

#[tokio::test]
async fn client_sends_chat_body_and_bearer_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer secret"))
        .and(header("content-type", "application/json"))
        .and(body_partial_json(json!({
            "model": "test-model",
            "stream": true,
            "temperature": 0.5,
            "messages": [{"role": "user", "content": "hello"}]
        })))
        .respond_with(event_stream(sse(&[
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"delta":{"content":"\u201cHi"}}]}"#,
            r#"{"choices":[{"delta":{"content":" there"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        ])))
        .mount(&server)
        .await;

    let client = client_for(&server, "secret");
    let completion = client
        .complete(&ChatCompletionParams {
            messages: vec![ChatMessage::user("hello")],
            temperature: Some(0.5),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(completion.content, "Hi there");
    assert_eq!(completion.finish_reason, "stop");
}

#[tokio::test]
async fn none_key_sends_no_authorization() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        event_stream(sse(&[r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#])),
    )
    .await;

    let client = client_for(&server, "none");
    let completion = client
        .complete(&ChatCompletionParams::default())
        .await
        .unwrap();
    assert_eq!(completion.content, "");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].headers.contains_key("authorization"));
}

#[tokio::test]
async fn invisible_characters_in_entrypoint_are_ignored() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        event_stream(sse(&[r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#])),
    )
    .await;

    let request = StreamRequest::post(format!(
        "\u{200B} {}/v1/chat/completions\u{200B}\n",
        server.uri()
    ))
    .json(&json!({"stream": true}))
    .unwrap();
    let (outcome, _) = drive(request, Duration::from_secs(5)).await;

    assert_eq!(outcome, StreamOutcome::Completed("stop".to_string()));
}

#[tokio::test]
async fn code_review_streams_into_transcript() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"max_tokens": 2000, "model": "test-model"})))
        .respond_with(event_stream(sse(&[
            r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#,
            r#"{"choices":[{"delta":{"content":"\"- rename `x`"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        ])))
        .mount(&server)
        .await;

    let client = client_for(&server, "none");
    let review = CodeReview::new("let x = 1;").unwrap();
    let mut transcript = Transcript::default();
    let outcome = client
        .drive(&review.params(""), &mut transcript)
        .await
        .unwrap();

    assert_eq!(outcome, StreamOutcome::Completed("stop".to_string()));
    assert_eq!(transcript.text, "- rename `x`");
    assert_eq!(transcript.finish_reason.as_deref(), Some("stop"));
    assert_eq!(transcript.error, None);
}

#[tokio::test]
async fn socks5_proxy_streams_like_direct() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        event_stream(sse(&[
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"delta":{"content":"Hi"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        ])),
    )
    .await;
    let (proxy, connections) = spawn_socks5_relay().await;

    let client = ChatClient::new(ClientOptions {
        entrypoint: Some(format!("{}/v1/chat/completions", server.uri())),
        api_key: Some("none".to_string()),
        model: Some("test-model".to_string()),
        proxy: Some(proxy),
        timeout: Some(Duration::from_secs(5)),
        default_headers: HeaderMap::new(),
    })
    .unwrap();
    assert_eq!(client.orchestrator().transport_name(), "socks5");

    let recorder = Recorder::default();
    let outcome = client
        .stream(&ChatCompletionParams::default(), recorder.clone())
        .unwrap()
        .outcome()
        .await
        .unwrap();

    assert_eq!(outcome, StreamOutcome::Completed("stop".to_string()));
    assert_eq!(
        recorder.calls(),
        vec![
            Call::Message(Delta {
                content: String::new(),
                role: Some("assistant".to_string()),
            }),
            content("Hi"),
            Call::Finish("stop".to_string()),
        ]
    );
    assert!(connections.load(Ordering::SeqCst) >= 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unreachable_proxy_is_a_transport_failure() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = ChatClient::new(ClientOptions {
        entrypoint: Some("http://api.invalid/v1/chat/completions".to_string()),
        api_key: None,
        model: None,
        proxy: Some(format!("socks5h://127.0.0.1:{port}")),
        timeout: Some(Duration::from_secs(5)),
        default_headers: HeaderMap::new(),
    })
    .unwrap();
    assert_eq!(client.orchestrator().transport_name(), "socks5");

    let failure = client
        .complete(&ChatCompletionParams::default())
        .await
        .unwrap_err();
    assert_eq!(failure.cause, FailureCause::Transport);
    assert!(failure.message().is_some());
}

#[test]
fn proxy_must_be_socks5() {
    assert!(matches!(
        ProxiedTransport::new("http://127.0.0.1:8080"),
        Err(Error::Config(_))
    ));
    assert!(ProxiedTransport::new(" socks5://127.0.0.1:1080 ").is_ok());
}

#[test]
fn client_requires_entrypoint() {
    let err = ChatClient::new(ClientOptions {
        entrypoint: Some("\u{200B}  ".to_string()),
        api_key: None,
        model: None,
        proxy: None,
        timeout: None,
        default_headers: HeaderMap::new(),
    })
    .err()
    .unwrap();
    assert!(matches!(err, Error::Config(_)));
}
