use chat_stream::types::chat::{ChatCompletionParams, ChatMessage};
use chat_stream::{Callbacks, ChatClient, ClientOptions, StreamOutcome};
use std::io::Write;

#[tokio::main]
async fn main() -> Result<(), chat_stream::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let prompt = if prompt.trim().is_empty() {
        "Say hello in one short sentence.".to_string()
    } else {
        prompt
    };

    let client = ChatClient::new(ClientOptions::default())?;
    let session = client.stream(
        &ChatCompletionParams {
            messages: vec![ChatMessage::user(prompt)],
            temperature: Some(0.7),
            ..Default::default()
        },
        Callbacks::new(
            |delta| {
                if delta.role.is_none() {
                    print!("{}", delta.content);
                    std::io::stdout().flush().ok();
                }
            },
            |failure| eprintln!("\nerror: {failure}"),
            |reason| eprintln!("\n\nfinish_reason={reason}"),
        ),
    )?;

    if let StreamOutcome::Failed(_) = session.outcome().await? {
        std::process::exit(1);
    }
    Ok(())
}
