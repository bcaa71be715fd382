// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Response-body duplication.
//!
//! A duplicator tees one underlying response body to any number of
//! independently consumable views. Chunks are pulled from the source lazily,
//! as the furthest-ahead reader demands them, and buffered so slower readers
//! can catch up. The buffer is capped: readers that force it past the cap
//! observe [`Error::ContentTooLarge`] and the source is aborted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::response::{HttpResponse, SourceAbortHandle};

pub(crate) struct DupShared {
    status: StatusCode,
    headers: HeaderMap,
    state: tokio::sync::Mutex<DupState>,
    aborted: Mutex<Option<Error>>,
    source_abort: SourceAbortHandle,
    closed: AtomicBool,
}

struct DupState {
    source: Option<HttpResponse>,
    buffer: Vec<Bytes>,
    buffered_len: usize,
    max_content_length: usize,
    trailers: Option<HeaderMap>,
    end: Option<Result<()>>,
}

impl DupShared {
    /// Pulls one step from the source and records the result.
    fn pull_once(state: &mut DupState) -> std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let Some(mut source) = state.source.take() else {
                return Ok(());
            };

            match source.next_chunk().await {
                Ok(Some(chunk)) => {
                    state.buffered_len += chunk.len();
                    if state.buffered_len > state.max_content_length {
                        let cause = Error::ContentTooLarge {
                            max_length: state.max_content_length,
                        };
                        source.abort(cause.clone());
                        state.end = Some(Err(cause.clone()));
                        return Err(cause);
                    }
                    state.buffer.push(chunk);
                    state.source = Some(source);
                    Ok(())
                }
                Ok(None) => {
                    state.trailers = source.trailers();
                    state.end = Some(Ok(()));
                    Ok(())
                }
                Err(cause) => {
                    state.end = Some(Err(cause.clone()));
                    Err(cause)
                }
            }
        })
    }

    pub(crate) async fn chunk_at(&self, cursor: &mut usize) -> Result<Option<Bytes>> {
        loop {
            if let Some(cause) = self.aborted.lock().clone() {
                return Err(cause);
            }

            let mut state = self.state.lock().await;
            if *cursor < state.buffer.len() {
                let chunk = state.buffer[*cursor].clone();
                *cursor += 1;
                return Ok(Some(chunk));
            }
            match &state.end {
                Some(Ok(())) => return Ok(None),
                Some(Err(cause)) => return Err(cause.clone()),
                None => {}
            }
            Self::pull_once(&mut state).await?;
        }
    }

    pub(crate) async fn when_complete(&self) -> Result<()> {
        loop {
            if let Some(cause) = self.aborted.lock().clone() {
                return Err(cause);
            }

            let mut state = self.state.lock().await;
            match &state.end {
                Some(Ok(())) => return Ok(()),
                Some(Err(cause)) => return Err(cause.clone()),
                None => {}
            }
            Self::pull_once(&mut state).await?;
        }
    }

    pub(crate) fn trailers(&self) -> Option<HeaderMap> {
        self.state
            .try_lock()
            .ok()
            .and_then(|state| state.trailers.clone())
    }

    pub(crate) fn abort(&self, cause: Error) {
        {
            let mut aborted = self.aborted.lock();
            if aborted.is_some() {
                return;
            }
            *aborted = Some(cause.clone());
        }
        self.source_abort.abort(cause);
    }
}

impl Drop for DupShared {
    fn drop(&mut self) {
        // Once every view is gone, release whatever is left of the source.
        let ended = self
            .state
            .try_lock()
            .map(|state| state.end.is_some())
            .unwrap_or(false);
        if !ended && self.aborted.lock().is_none() {
            self.source_abort.abort(Error::ResponseCancelled);
        }
    }
}

/// A tee over a streamed response body.
///
/// Every call to [`duplicate`](Self::duplicate) yields an [`HttpResponse`]
/// that reads the full body independently of its siblings. Once all desired
/// views exist, [`close`](Self::close) seals the duplicator; existing views
/// keep working. [`abort`](Self::abort) terminates the source and every view
/// with the given cause.
///
/// # Examples
///
/// ```
/// use http::StatusCode;
/// use hedgerow_transport::HttpResponse;
///
/// # futures::executor::block_on(async {
/// let res = HttpResponse::of_body(StatusCode::OK, "shared");
/// let duplicator = res.to_duplicator(1024);
/// let first = duplicator.duplicate();
/// let second = duplicator.duplicate();
/// duplicator.close();
///
/// assert_eq!(first.aggregate().await?.content_utf8(), "shared");
/// assert_eq!(second.aggregate().await?.content_utf8(), "shared");
/// # Ok::<(), hedgerow_transport::Error>(())
/// # });
/// ```
pub struct HttpResponseDuplicator {
    shared: Arc<DupShared>,
}

impl HttpResponseDuplicator {
    pub(crate) fn new(source: HttpResponse, max_content_length: usize) -> Self {
        let status = source.status();
        let headers = source.headers().clone();
        let source_abort = source.abort_handle();

        Self {
            shared: Arc::new(DupShared {
                status,
                headers,
                state: tokio::sync::Mutex::new(DupState {
                    source: Some(source),
                    buffer: Vec::new(),
                    buffered_len: 0,
                    max_content_length,
                    trailers: None,
                    end: None,
                }),
                aborted: Mutex::new(None),
                source_abort,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns a new independent view of the underlying body.
    ///
    /// # Panics
    ///
    /// Panics if the duplicator has been closed.
    #[must_use]
    pub fn duplicate(&self) -> HttpResponse {
        assert!(
            !self.shared.closed.load(Ordering::Acquire),
            "duplicate() called on a closed duplicator"
        );
        HttpResponse::duplicated(
            self.shared.status,
            self.shared.headers.clone(),
            Arc::clone(&self.shared),
        )
    }

    /// Seals the duplicator: no further views can be created, existing views
    /// keep reading.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }

    /// Aborts the source and every view with the given cause.
    pub fn abort(&self, cause: Error) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.abort(cause);
    }
}

impl std::fmt::Debug for HttpResponseDuplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponseDuplicator")
            .field("status", &self.shared.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(HttpResponseDuplicator: Send, Sync);
    }

    #[tokio::test]
    async fn views_read_the_full_body_independently() {
        let (res, writer) = HttpResponse::streaming(StatusCode::OK);
        let duplicator = res.to_duplicator(1024);
        let first = duplicator.duplicate();
        let mut second = duplicator.duplicate();
        duplicator.close();

        writer.write("a");
        writer.write("b");
        writer.close();

        assert_eq!(first.aggregate().await.expect("first view").content_utf8(), "ab");
        assert_eq!(
            second.next_chunk().await.expect("chunk"),
            Some(Bytes::from("a"))
        );
        assert_eq!(
            second.next_chunk().await.expect("chunk"),
            Some(Bytes::from("b"))
        );
        assert_eq!(second.next_chunk().await.expect("chunk"), None);
    }

    #[tokio::test]
    async fn abort_terminates_all_views() {
        let (res, writer) = HttpResponse::streaming(StatusCode::OK);
        let duplicator = res.to_duplicator(1024);
        let mut view = duplicator.duplicate();

        writer.write("partial");
        duplicator.abort(Error::ResponseCancelled);

        let err = view.next_chunk().await.expect_err("aborted view");
        assert!(err.is_response_cancelled());
        assert!(!writer.is_open());
    }

    #[tokio::test]
    async fn buffer_cap_aborts_readers() {
        let (res, writer) = HttpResponse::streaming(StatusCode::OK);
        let duplicator = res.to_duplicator(4);
        let mut view = duplicator.duplicate();

        writer.write("exceeds the cap");
        writer.close();

        let err = view.next_chunk().await.expect_err("content too large");
        assert!(matches!(err, Error::ContentTooLarge { max_length: 4 }));
    }

    #[tokio::test]
    async fn view_of_a_view_still_reads() {
        let res = HttpResponse::of_body(StatusCode::OK, "nested");
        let outer = res.to_duplicator(1024);
        let view = outer.duplicate();
        outer.close();

        let inner = view.to_duplicator(1024);
        let leaf = inner.duplicate();
        inner.close();

        assert_eq!(leaf.aggregate().await.expect("leaf").content_utf8(), "nested");
    }

    #[test]
    #[should_panic(expected = "closed duplicator")]
    fn duplicate_after_close_panics() {
        let res = HttpResponse::of(StatusCode::OK);
        let duplicator = res.to_duplicator(1024);
        duplicator.close();
        let _ = duplicator.duplicate();
    }

    #[tokio::test]
    async fn trailers_propagate_to_views() {
        let (res, writer) = HttpResponse::streaming(StatusCode::OK);
        let duplicator = res.to_duplicator(1024);
        let view = duplicator.duplicate();
        duplicator.close();

        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", http::HeaderValue::from_static("0"));
        writer.trailers(trailers);
        writer.close();

        view.when_complete().await.expect("completion");
        assert!(view.trailers().is_some());
    }
}
