use chat_stream::review::{CodeReview, Transcript};
use chat_stream::{ChatClient, ClientOptions, StreamOutcome};
use tokio::io::AsyncReadExt;

#[tokio::main]
async fn main() -> Result<(), chat_stream::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut code = String::new();
    tokio::io::stdin()
        .read_to_string(&mut code)
        .await
        .map_err(|e| chat_stream::Error::Internal(format!("failed to read stdin: {e}")))?;

    let client = ChatClient::new(ClientOptions::default())?;
    let review = CodeReview::new(&code)?;
    let mut transcript = Transcript::default();

    println!("{}", review.heading());
    match client.drive(&review.params(""), &mut transcript).await? {
        StreamOutcome::Completed(_) => println!("{}", transcript.text),
        StreamOutcome::Failed(failure) => eprintln!("review failed: {failure}"),
    }
    Ok(())
}
