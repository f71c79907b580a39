use crate::error::Error;
use bytes::Bytes;
use futures_core::Stream;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;

/// Body of an accepted streaming response, as raw byte chunks.
///
/// The source ends with `Err(Error::Aborted)` once its cancellation token
/// fires; the underlying body is dropped at that point, which closes the
/// connection. After the first error the source yields nothing more.
pub struct ChunkSource {
    inner: BoxStream<'static, Result<Bytes, Error>>,
    cancel: CancellationToken,
}

impl ChunkSource {
    pub fn new<S>(chunks: S, cancel: CancellationToken) -> Self
    where
        S: Stream<Item = Result<Bytes, Error>> + Send + 'static,
    {
        let chunks: BoxStream<'static, Result<Bytes, Error>> = Box::pin(chunks);
        let cancel_for_stream = cancel.clone();

        let stream = futures_util::stream::unfold(
            (Some(chunks), cancel_for_stream),
            |(chunks, cancel)| async move {
                let Some(mut chunks) = chunks else {
                    return None;
                };

                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    next = chunks.next() => Some(next),
                };

                match next {
                    None => {
                        drop(chunks);
                        Some((Err(Error::Aborted), (None, cancel)))
                    }
                    Some(Some(Ok(chunk))) => Some((Ok(chunk), (Some(chunks), cancel))),
                    Some(Some(Err(e))) => Some((Err(e), (None, cancel))),
                    Some(None) => None,
                }
            },
        );

        Self {
            inner: Box::pin(stream),
            cancel,
        }
    }

    pub(crate) fn from_response(response: reqwest::Response, cancel: CancellationToken) -> Self {
        let body = response
            .bytes_stream()
            .map(|item| item.map_err(Error::from_reqwest));
        Self::new(body, cancel)
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

impl Stream for ChunkSource {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}
