//! Cooperative cancellation for storage calls.
//!
//! Every storage future and stream is cancelled by dropping it: the in-flight
//! query is aborted and the pooled connection it holds goes back to the pool.
//! These helpers bind that to a [`CancellationToken`] so a caller can cancel
//! from elsewhere (a request handler, a shutdown hook) and receive
//! [`Error::Cancelled`] instead of a silently vanished future.

use crate::{Error, Result};
use futures::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Runs `future` until it completes or `token` fires.
///
/// # Errors
///
/// Returns [`Error::Cancelled`] if the token fired first, otherwise the
/// future's own result.
pub async fn cancellable<T, F>(token: &CancellationToken, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = token.cancelled() => Err(Error::Cancelled),
        result = future => result,
    }
}

/// Wraps a result stream so that it ends with [`Error::Cancelled`] once
/// `token` fires.
///
/// The inner stream is dropped as soon as cancellation is observed, so any
/// connection it holds is released before the error is yielded. Items already
/// produced are unaffected; partially consumed results are the caller's to
/// discard.
pub fn cancellable_stream<T>(
    token: CancellationToken,
    inner: Pin<Box<dyn Stream<Item = Result<T>> + Send>>,
) -> Pin<Box<dyn Stream<Item = Result<T>> + Send>>
where
    T: Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut inner = Some(inner);
        while let Some(stream) = inner.as_mut() {
            let next = tokio::select! {
                biased;
                () = token.cancelled() => None,
                item = stream.next() => Some(item),
            };
            match next {
                None => {
                    inner = None;
                    yield Err(Error::Cancelled);
                },
                Some(Some(item)) => yield item,
                Some(None) => inner = None,
            }
        }
    })
}
