use chat_stream::types::chat::{ChatCompletionParams, ChatMessage};
use chat_stream::{ChatClient, ClientOptions};
use reqwest::header::HeaderMap;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server = MockServer::start().await;
    let body = [
        r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
        r#"{"choices":[{"delta":{"content":"\"Hello"}}]}"#,
        r#"{"choices":[{"delta":{"content":" from the mock"}}]}"#,
        r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
    ]
    .iter()
    .map(|frame| format!("data: {frame}\n\n"))
    .collect::<String>();

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&server)
        .await;

    let client = ChatClient::new(ClientOptions {
        entrypoint: Some(format!("{}/v1/chat/completions", server.uri())),
        api_key: Some("none".to_string()),
        model: Some("mock-model".to_string()),
        proxy: None,
        timeout: Some(Duration::from_secs(2)),
        default_headers: HeaderMap::new(),
    })?;

    let completion = client
        .complete(&ChatCompletionParams {
            messages: vec![ChatMessage::user("hi")],
            ..Default::default()
        })
        .await
        .map_err(|failure| failure.to_string())?;
    println!(
        "content={:?} finish_reason={}",
        completion.content, completion.finish_reason
    );

    Ok(())
}
