use crate::error::Error;
use crate::orchestrator::{
    StreamFailure, StreamHandler, StreamOrchestrator, StreamOutcome, StreamSession,
};
use crate::transport::{DirectTransport, ProxiedTransport, StreamRequest, StreamTransport};
use crate::types::chat::{ChatCompletionParams, Delta};
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Key value meaning "send no Authorization header".
const NO_API_KEY: &str = "none";

const ENV_ENTRYPOINT: &str = "CHAT_STREAM_ENTRYPOINT";
const ENV_API_KEY: &str = "CHAT_STREAM_API_KEY";
const ENV_MODEL: &str = "CHAT_STREAM_MODEL";
const ENV_PROXY: &str = "CHAT_STREAM_PROXY";

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Full URL of the chat completions endpoint.
    pub entrypoint: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    /// SOCKS5 proxy URL. When set, requests go through the proxied transport.
    pub proxy: Option<String>,
    pub timeout: Option<Duration>,
    pub default_headers: HeaderMap,
}

impl Default for ClientOptions {
    fn default() -> Self {
        let entrypoint = std::env::var(ENV_ENTRYPOINT).ok();
        let api_key = std::env::var(ENV_API_KEY).ok();
        let model = std::env::var(ENV_MODEL).ok();
        let proxy = std::env::var(ENV_PROXY).ok().filter(|p| !p.trim().is_empty());
        Self {
            entrypoint,
            api_key,
            model,
            proxy,
            timeout: None,
            default_headers: HeaderMap::new(),
        }
    }
}

/// Text gathered by [`ChatClient::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub finish_reason: String,
}

#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<Inner>,
}

impl ChatClient {
    pub fn new(options: ClientOptions) -> Result<Self, Error> {
        Ok(Self {
            inner: Arc::new(Inner::new(options)?),
        })
    }

    pub fn model(&self) -> &str {
        &self.inner.model
    }

    pub fn orchestrator(&self) -> &StreamOrchestrator {
        &self.inner.orchestrator
    }

    /// Builds the streaming POST for `params`. A blank model is replaced by
    /// the configured one and `stream` is always set.
    pub fn request(
        &self,
        params: &ChatCompletionParams,
        cancel: Option<CancellationToken>,
    ) -> Result<StreamRequest, Error> {
        let mut params = params.clone();
        if params.model.trim().is_empty() {
            params.model = self.inner.model.clone();
        }
        params.stream = Some(true);

        let mut request = StreamRequest::post(self.inner.entrypoint.as_str());
        for (name, value) in self.inner.default_headers.iter() {
            let value = value
                .to_str()
                .map_err(|e| Error::Config(format!("header {name} is not visible ASCII: {e}")))?;
            request = request.header(name.as_str(), value);
        }
        if let Some(key) = &self.inner.api_key {
            request = request.header(AUTHORIZATION.as_str(), format!("Bearer {key}"));
        }
        let mut request = request.json(&params)?;
        request.cancel = cancel;
        Ok(request)
    }

    pub fn stream<H>(
        &self,
        params: &ChatCompletionParams,
        handler: H,
    ) -> Result<StreamSession, Error>
    where
        H: StreamHandler + 'static,
    {
        let request = self.request(params, None)?;
        Ok(self.inner.orchestrator.run(request, handler))
    }

    /// Runs a session on the calling task, handing results to `handler`.
    pub async fn drive(
        &self,
        params: &ChatCompletionParams,
        handler: &mut dyn StreamHandler,
    ) -> Result<StreamOutcome, Error> {
        let request = self.request(params, None)?;
        Ok(self.inner.orchestrator.drive(request, handler).await)
    }

    /// Streams `params` to the end and returns the concatenated content.
    /// Role-bearing deltas are left out, matching how chat UIs render them.
    pub async fn complete(
        &self,
        params: &ChatCompletionParams,
    ) -> Result<Completion, StreamFailure> {
        let request = self
            .request(params, None)
            .map_err(StreamFailure::from_error)?;

        let mut collector = Collector::default();
        match self.inner.orchestrator.drive(request, &mut collector).await {
            StreamOutcome::Completed(finish_reason) => Ok(Completion {
                content: collector.content,
                finish_reason,
            }),
            StreamOutcome::Failed(failure) => Err(failure),
        }
    }
}

#[derive(Default)]
struct Collector {
    content: String,
}

impl StreamHandler for Collector {
    fn on_message(&mut self, delta: Delta) {
        if delta.role.is_none() {
            self.content.push_str(&delta.content);
        }
    }

    fn on_error(&mut self, _failure: StreamFailure) {}

    fn on_finish(&mut self, _reason: String) {}
}

pub(crate) struct Inner {
    entrypoint: Url,
    api_key: Option<String>,
    model: String,
    default_headers: HeaderMap,
    orchestrator: StreamOrchestrator,
}

impl Inner {
    fn new(options: ClientOptions) -> Result<Self, Error> {
        let entrypoint = options
            .entrypoint
            .as_deref()
            .map(crate::orchestrator::normalize_url)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                Error::Config(format!("entrypoint is missing; set {ENV_ENTRYPOINT}"))
            })?;
        let entrypoint = Url::parse(&entrypoint)?;

        let api_key = options
            .api_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty() && k != NO_API_KEY);
        let model = options
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let transport: Arc<dyn StreamTransport> = match options.proxy.as_deref() {
            Some(proxy) => Arc::new(ProxiedTransport::new(proxy)?),
            None => Arc::new(DirectTransport::new()?),
        };
        let mut orchestrator = StreamOrchestrator::new(transport);
        if let Some(timeout) = options.timeout {
            orchestrator = orchestrator.with_timeout(timeout);
        }
        tracing::debug!(
            entrypoint = %entrypoint,
            transport = orchestrator.transport_name(),
            model = %model,
            "chat client configured"
        );

        Ok(Self {
            entrypoint,
            api_key,
            model,
            default_headers: options.default_headers,
            orchestrator,
        })
    }
}
