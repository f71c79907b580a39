use crate::error::{ApiError, Error};
use crate::streaming::ChunkSource;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client as HttpClient, Method, Proxy, StatusCode, Url};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DIRECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const PROXIED_TIMEOUT: Duration = Duration::from_secs(60);

/// One outbound streaming call.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub url: String,
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub cancel: Option<CancellationToken>,
}

impl StreamRequest {
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::POST,
            headers: BTreeMap::new(),
            body: Bytes::new(),
            cancel: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<B>(self, body: &B) -> Result<Self, Error>
    where
        B: Serialize + ?Sized,
    {
        let bytes = serde_json::to_vec(body)?;
        Ok(self
            .header(CONTENT_TYPE.as_str(), "application/json")
            .body(bytes))
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// A way of reaching the server. Implementations differ only in how the
/// connection is made; status handling and chunk delivery are the same.
pub trait StreamTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deadline applied by the orchestrator when none is configured.
    fn default_timeout(&self) -> Duration;

    /// Sends the request. Resolves once response headers are in: with the
    /// body stream for a 200, with `Error::Status` for anything else.
    fn open(&self, request: StreamRequest) -> BoxFuture<'static, Result<ChunkSource, Error>>;
}

#[derive(Debug, Clone)]
pub struct DirectTransport {
    http: HttpClient,
}

impl DirectTransport {
    pub fn new() -> Result<Self, Error> {
        let http = HttpClient::builder()
            .user_agent(user_agent())
            .no_proxy()
            .build()?;
        Ok(Self { http })
    }
}

impl StreamTransport for DirectTransport {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn default_timeout(&self) -> Duration {
        DIRECT_TIMEOUT
    }

    fn open(&self, request: StreamRequest) -> BoxFuture<'static, Result<ChunkSource, Error>> {
        Box::pin(send_streaming(self.http.clone(), request))
    }
}

/// Tunnels every request through a SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct ProxiedTransport {
    http: HttpClient,
    proxy: Url,
}

impl ProxiedTransport {
    pub fn new(proxy: &str) -> Result<Self, Error> {
        let proxy = Url::parse(proxy.trim())?;
        if !matches!(proxy.scheme(), "socks5" | "socks5h") {
            return Err(Error::Config(format!(
                "proxy must be a socks5:// or socks5h:// URL, got {proxy}"
            )));
        }
        let http = HttpClient::builder()
            .user_agent(user_agent())
            .proxy(Proxy::all(proxy.as_str())?)
            .build()?;
        Ok(Self { http, proxy })
    }

    pub fn proxy(&self) -> &Url {
        &self.proxy
    }
}

impl StreamTransport for ProxiedTransport {
    fn name(&self) -> &'static str {
        "socks5"
    }

    fn default_timeout(&self) -> Duration {
        PROXIED_TIMEOUT
    }

    fn open(&self, request: StreamRequest) -> BoxFuture<'static, Result<ChunkSource, Error>> {
        Box::pin(send_streaming(self.http.clone(), request))
    }
}

fn user_agent() -> String {
    format!("chat-stream-rs/{}", env!("CARGO_PKG_VERSION"))
}

async fn send_streaming(http: HttpClient, request: StreamRequest) -> Result<ChunkSource, Error> {
    let cancel = request.cancel.clone().unwrap_or_default();
    let url = Url::parse(&request.url)?;

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    for (name, value) in &request.headers {
        headers.insert(
            HeaderName::from_bytes(name.as_bytes())?,
            HeaderValue::from_str(value)?,
        );
    }

    let req = http
        .request(request.method.clone(), url)
        .headers(headers)
        .body(request.body.clone());

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        response = req.send() => Some(response),
    };
    let response = response
        .ok_or(Error::Aborted)?
        .map_err(Error::from_reqwest)?;

    let status = response.status();
    if status != StatusCode::OK {
        let headers = response.headers().clone();
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            body = response.bytes() => Some(body),
        };
        let body = body.ok_or(Error::Aborted)?.unwrap_or_default();
        return Err(Error::Status(ApiError::from_body(status, &headers, &body)));
    }

    Ok(ChunkSource::from_response(response, cancel))
}
