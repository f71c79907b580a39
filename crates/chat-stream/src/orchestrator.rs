use crate::error::Error;
use crate::streaming::{SseEvent, SseItem, SseParser};
use crate::transport::{StreamRequest, StreamTransport};
use crate::types::chat::{ChatCompletionChunk, Delta};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TIMEOUT_MESSAGE: &str = "Connection Timeout";
pub const ABORTED_MESSAGE: &str = "aborted";

/// Finish reason reported when the server closes the body without ever
/// sending a `finish_reason`.
pub const END_OF_STREAM: &str = "end_of_stream";

const LEADING_QUOTES: [char; 3] = ['"', '\u{201C}', '\u{300C}'];
const ZERO_WIDTH: [char; 5] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}'];

pub trait StreamHandler: Send {
    fn on_message(&mut self, delta: Delta);
    fn on_error(&mut self, failure: StreamFailure);
    fn on_finish(&mut self, reason: String);
}

impl<H: StreamHandler + ?Sized> StreamHandler for Box<H> {
    fn on_message(&mut self, delta: Delta) {
        (**self).on_message(delta)
    }

    fn on_error(&mut self, failure: StreamFailure) {
        (**self).on_error(failure)
    }

    fn on_finish(&mut self, reason: String) {
        (**self).on_finish(reason)
    }
}

/// Adapts three closures to [`StreamHandler`].
pub struct Callbacks<M, E, F> {
    on_message: M,
    on_error: E,
    on_finish: F,
}

impl<M, E, F> Callbacks<M, E, F>
where
    M: FnMut(Delta) + Send,
    E: FnMut(StreamFailure) + Send,
    F: FnMut(String) + Send,
{
    pub fn new(on_message: M, on_error: E, on_finish: F) -> Self {
        Self {
            on_message,
            on_error,
            on_finish,
        }
    }
}

impl<M, E, F> StreamHandler for Callbacks<M, E, F>
where
    M: FnMut(Delta) + Send,
    E: FnMut(StreamFailure) + Send,
    F: FnMut(String) + Send,
{
    fn on_message(&mut self, delta: Delta) {
        (self.on_message)(delta)
    }

    fn on_error(&mut self, failure: StreamFailure) {
        (self.on_error)(failure)
    }

    fn on_finish(&mut self, reason: String) {
        (self.on_finish)(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// The server answered with a non-200 status.
    Status(u16),
    Timeout,
    Aborted,
    Transport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamFailure {
    pub cause: FailureCause,
    /// Payload for the caller: the server's JSON error body, or
    /// `{"error":{"message": ...}}` for failures raised locally.
    pub body: Value,
}

impl StreamFailure {
    fn local(cause: FailureCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            body: json!({ "error": { "message": message.into() } }),
        }
    }

    pub(crate) fn timeout() -> Self {
        Self::local(FailureCause::Timeout, TIMEOUT_MESSAGE)
    }

    pub(crate) fn from_error(err: Error) -> Self {
        match err {
            Error::Status(api) => Self {
                cause: FailureCause::Status(api.status.as_u16()),
                body: api.body,
            },
            Error::Timeout => Self::timeout(),
            Error::Aborted => Self::local(FailureCause::Aborted, ABORTED_MESSAGE),
            other => Self::local(FailureCause::Transport, other.to_string()),
        }
    }

    pub fn message(&self) -> Option<&str> {
        self.body
            .get("error")
            .and_then(|e| e.get("message"))
            .or_else(|| self.body.get("message"))
            .and_then(|m| m.as_str())
    }
}

impl fmt::Display for StreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{msg}"),
            None => write!(f, "{}", self.body),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed(String),
    Failed(StreamFailure),
}

/// What one SSE event means for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Skip,
    Message(Delta),
    Finish(String),
}

/// Per-session decoding state. Never shared between sessions.
#[derive(Debug)]
pub(crate) struct Session {
    parser: SseParser,
    is_first: bool,
}

impl Session {
    pub(crate) fn new() -> Self {
        Self {
            parser: SseParser::new(),
            is_first: true,
        }
    }

    /// Parses one chunk and delivers its events in order. Returns the
    /// finish reason once a frame ends the session; remaining events of the
    /// chunk are not delivered.
    fn deliver(
        &mut self,
        items: Vec<SseItem>,
        handler: &mut dyn StreamHandler,
    ) -> Option<String> {
        for item in items {
            let SseItem::Event(event) = item else {
                continue;
            };
            match self.interpret(&event) {
                Dispatch::Skip => {}
                Dispatch::Message(delta) => handler.on_message(delta),
                Dispatch::Finish(reason) => return Some(reason),
            }
        }
        None
    }

    pub(crate) fn interpret(&mut self, event: &SseEvent) -> Dispatch {
        let chunk = match serde_json::from_str::<ChatCompletionChunk>(&event.data) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::trace!(data = %event.data, error = %err, "discarding non-JSON frame");
                return Dispatch::Skip;
            }
        };
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Dispatch::Skip;
        };
        // some gateways send "" on every non-final chunk
        if let Some(reason) = choice.finish_reason.filter(|r| !r.is_empty()) {
            return Dispatch::Finish(reason);
        }
        let Some(delta) = choice.delta else {
            return Dispatch::Skip;
        };

        let mut content = delta.content.unwrap_or_default();
        if self.is_first {
            if let Some(stripped) = content.strip_prefix(LEADING_QUOTES) {
                content = stripped.to_string();
            }
        }
        if delta.role.is_none() {
            self.is_first = false;
        }

        Dispatch::Message(Delta {
            content,
            role: delta.role,
        })
    }
}

pub fn normalize_url(url: &str) -> String {
    url.chars()
        .filter(|c| !ZERO_WIDTH.contains(c))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Drives streaming sessions over one transport.
#[derive(Clone)]
pub struct StreamOrchestrator {
    transport: Arc<dyn StreamTransport>,
    timeout: Option<Duration>,
}

impl StreamOrchestrator {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        Self {
            transport,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or_else(|| self.transport.default_timeout())
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Starts a session on the current tokio runtime. The handler receives
    /// every result; the returned [`StreamSession`] only allows aborting or
    /// waiting for the session.
    pub fn run<H>(&self, mut request: StreamRequest, mut handler: H) -> StreamSession
    where
        H: StreamHandler + 'static,
    {
        let cancel = request
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        request.cancel = Some(cancel.clone());

        let this = self.clone();
        let task = tokio::spawn(async move { this.drive(request, &mut handler).await });
        StreamSession { cancel, task }
    }

    /// Runs one session to its end on the calling task.
    pub async fn drive(
        &self,
        request: StreamRequest,
        handler: &mut dyn StreamHandler,
    ) -> StreamOutcome {
        let outcome = self.pump(request, handler).await;
        match &outcome {
            StreamOutcome::Completed(reason) => {
                tracing::debug!(reason = %reason, "stream finished");
                handler.on_finish(reason.clone());
            }
            StreamOutcome::Failed(failure) => {
                tracing::warn!(cause = ?failure.cause, error = %failure, "stream failed");
                handler.on_error(failure.clone());
            }
        }
        outcome
    }

    async fn pump(
        &self,
        mut request: StreamRequest,
        handler: &mut dyn StreamHandler,
    ) -> StreamOutcome {
        request.url = normalize_url(&request.url);
        let abort = request
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        request.cancel = Some(abort.clone());

        tracing::debug!(
            transport = self.transport.name(),
            url = %request.url,
            "opening stream"
        );

        // Armed until the first body byte; dropped with this frame on every
        // terminal path.
        let deadline = tokio::time::sleep(self.timeout());
        tokio::pin!(deadline);

        let open = self.transport.open(request);
        let opened = tokio::select! {
            biased;
            res = open => res,
            _ = &mut deadline => {
                abort.cancel();
                return StreamOutcome::Failed(StreamFailure::timeout());
            }
        };
        let mut chunks = match opened {
            Ok(chunks) => chunks,
            Err(err) => return StreamOutcome::Failed(StreamFailure::from_error(err)),
        };

        let mut session = Session::new();
        let mut armed = true;
        loop {
            let next = tokio::select! {
                biased;
                next = chunks.next() => next,
                _ = &mut deadline, if armed => {
                    abort.cancel();
                    return StreamOutcome::Failed(StreamFailure::timeout());
                }
            };

            match next {
                Some(Ok(bytes)) => {
                    armed = false;
                    let items = session.parser.push(&bytes);
                    if let Some(reason) = session.deliver(items, handler) {
                        return StreamOutcome::Completed(reason);
                    }
                }
                Some(Err(err)) => return StreamOutcome::Failed(StreamFailure::from_error(err)),
                None => {
                    let items = session.parser.finish();
                    let reason = session
                        .deliver(items, handler)
                        .unwrap_or_else(|| END_OF_STREAM.to_string());
                    return StreamOutcome::Completed(reason);
                }
            }
        }
    }
}

/// Handle to a spawned session.
pub struct StreamSession {
    cancel: CancellationToken,
    task: JoinHandle<StreamOutcome>,
}

impl StreamSession {
    /// Tears the connection down. The handler sees one `on_error` with the
    /// "aborted" message unless the session already ended.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn outcome(self) -> Result<StreamOutcome, Error> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("stream task failed: {e}")))
    }
}
