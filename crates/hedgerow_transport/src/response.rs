// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Streamed HTTP response model.
//!
//! An [`HttpResponse`] exposes its status and headers immediately and its
//! body as a sequence of pulled chunks, optionally followed by trailers.
//! Completion is observable through [`HttpResponse::when_complete`] and a
//! response can be aborted from the consumer side at any point, which is how
//! losing hedged attempts are released.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::duplicator::{DupShared, HttpResponseDuplicator};
use crate::error::{Error, Result};

/// The class of an HTTP status code.
///
/// # Examples
///
/// ```
/// use http::StatusCode;
/// use hedgerow_transport::StatusClass;
///
/// assert_eq!(StatusClass::of(StatusCode::BAD_GATEWAY), StatusClass::ServerError);
/// assert!(StatusClass::ServerError.contains(StatusCode::INTERNAL_SERVER_ERROR));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    /// `1xx`
    Informational,
    /// `2xx`
    Success,
    /// `3xx`
    Redirection,
    /// `4xx`
    ClientError,
    /// `5xx`
    ServerError,
    /// Anything outside the five defined classes.
    Unknown,
}

impl StatusClass {
    /// Returns the class of the given status code.
    #[must_use]
    pub const fn of(status: StatusCode) -> Self {
        match status.as_u16() {
            100..=199 => Self::Informational,
            200..=299 => Self::Success,
            300..=399 => Self::Redirection,
            400..=499 => Self::ClientError,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    /// Returns `true` when the given status code belongs to this class.
    #[must_use]
    pub fn contains(self, status: StatusCode) -> bool {
        Self::of(status) == self
    }
}

/// Interior of a directly written response body.
pub(crate) struct Channel {
    state: Mutex<ChannelState>,
    version: watch::Sender<()>,
}

struct ChannelState {
    chunks: VecDeque<Bytes>,
    trailers: Option<HeaderMap>,
    end: Option<Result<()>>,
}

impl Channel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChannelState {
                chunks: VecDeque::new(),
                trailers: None,
                end: None,
            }),
            version: watch::Sender::new(()),
        })
    }

    fn bump(&self) {
        self.version.send_modify(|_| {});
    }

    pub(crate) fn abort(&self, cause: Error) {
        let mut state = self.state.lock();
        if state.end.is_none() {
            state.chunks.clear();
            state.end = Some(Err(cause));
            drop(state);
            self.bump();
        }
    }

    async fn next_chunk(&self) -> Result<Option<Bytes>> {
        let mut version = self.version.subscribe();
        loop {
            {
                let mut state = self.state.lock();
                if let Some(chunk) = state.chunks.pop_front() {
                    return Ok(Some(chunk));
                }
                match &state.end {
                    Some(Ok(())) => return Ok(None),
                    Some(Err(cause)) => return Err(cause.clone()),
                    None => {}
                }
            }
            let _ = version.changed().await;
        }
    }

    async fn when_complete(&self) -> Result<()> {
        let mut version = self.version.subscribe();
        loop {
            {
                let state = self.state.lock();
                match &state.end {
                    Some(Ok(())) => return Ok(()),
                    Some(Err(cause)) => return Err(cause.clone()),
                    None => {}
                }
            }
            let _ = version.changed().await;
        }
    }

    fn trailers(&self) -> Option<HeaderMap> {
        self.state.lock().trailers.clone()
    }
}

/// The writing side of a streamed response body.
///
/// Writes are rejected once the stream has ended or been aborted.
#[derive(Clone)]
pub struct ResponseWriter {
    channel: Arc<Channel>,
}

impl ResponseWriter {
    /// Appends a body chunk.
    ///
    /// Returns `false` when the stream is no longer open, for example
    /// because the consumer aborted it.
    pub fn write(&self, chunk: impl Into<Bytes>) -> bool {
        let mut state = self.channel.state.lock();
        if state.end.is_some() {
            return false;
        }
        state.chunks.push_back(chunk.into());
        drop(state);
        self.channel.bump();
        true
    }

    /// Sets the response trailers. Call before [`close`](Self::close).
    pub fn trailers(&self, trailers: HeaderMap) {
        let mut state = self.channel.state.lock();
        if state.end.is_none() {
            state.trailers = Some(trailers);
        }
    }

    /// Completes the stream normally.
    pub fn close(&self) {
        let mut state = self.channel.state.lock();
        if state.end.is_none() {
            state.end = Some(Ok(()));
            drop(state);
            self.channel.bump();
        }
    }

    /// Completes the stream with a failure.
    pub fn close_with_error(&self, cause: Error) {
        let mut state = self.channel.state.lock();
        if state.end.is_none() {
            state.end = Some(Err(cause));
            drop(state);
            self.channel.bump();
        }
    }

    /// Returns `true` while the stream accepts writes.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.channel.state.lock().end.is_none()
    }
}

impl std::fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseWriter").finish_non_exhaustive()
    }
}

pub(crate) enum BodySource {
    Direct(Arc<Channel>),
    Duplicated {
        shared: Arc<DupShared>,
        cursor: usize,
        // Aborting one view must not tear down its siblings, so each view
        // carries its own abort cell next to the shared state.
        aborted: Arc<std::sync::OnceLock<Error>>,
    },
}

/// A streamed HTTP response.
///
/// The status and headers are available immediately; the body is consumed
/// chunk by chunk with [`next_chunk`](Self::next_chunk) or all at once with
/// [`aggregate`](Self::aggregate). A response can be turned into a
/// [`HttpResponseDuplicator`] so multiple readers consume independent views
/// of the same underlying stream.
///
/// # Examples
///
/// ```
/// use http::StatusCode;
/// use hedgerow_transport::HttpResponse;
///
/// # futures::executor::block_on(async {
/// let res = HttpResponse::of_body(StatusCode::OK, "hello");
/// let aggregated = res.aggregate().await?;
/// assert_eq!(aggregated.content_utf8(), "hello");
/// # Ok::<(), hedgerow_transport::Error>(())
/// # });
/// ```
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    source: BodySource,
}

impl HttpResponse {
    /// Creates a completed response with an empty body.
    #[must_use]
    pub fn of(status: StatusCode) -> Self {
        Self::of_parts(status, HeaderMap::new(), Bytes::new())
    }

    /// Creates a completed response with the given body.
    #[must_use]
    pub fn of_body(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self::of_parts(status, HeaderMap::new(), body.into())
    }

    /// Creates a completed response from status, headers, and body.
    #[must_use]
    pub fn of_parts(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let (res, writer) = Self::streaming_with_headers(status, headers);
        if !body.is_empty() {
            writer.write(body);
        }
        writer.close();
        res
    }

    /// Creates a streaming response and the writer that feeds it.
    #[must_use]
    pub fn streaming(status: StatusCode) -> (Self, ResponseWriter) {
        Self::streaming_with_headers(status, HeaderMap::new())
    }

    /// Creates a streaming response with the given headers.
    #[must_use]
    pub fn streaming_with_headers(status: StatusCode, headers: HeaderMap) -> (Self, ResponseWriter) {
        let channel = Channel::new();
        let response = Self {
            status,
            headers,
            source: BodySource::Direct(Arc::clone(&channel)),
        };
        (response, ResponseWriter { channel })
    }

    pub(crate) fn duplicated(
        status: StatusCode,
        headers: HeaderMap,
        shared: Arc<DupShared>,
    ) -> Self {
        Self {
            status,
            headers,
            source: BodySource::Duplicated {
                shared,
                cursor: 0,
                aborted: Arc::new(std::sync::OnceLock::new()),
            },
        }
    }

    /// Returns the response status.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Pulls the next body chunk.
    ///
    /// Returns `Ok(None)` once the body has ended normally and an error when
    /// the stream failed or was aborted.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match &mut self.source {
            BodySource::Direct(channel) => channel.next_chunk().await,
            BodySource::Duplicated {
                shared,
                cursor,
                aborted,
            } => {
                if let Some(cause) = aborted.get() {
                    return Err(cause.clone());
                }
                shared.chunk_at(cursor).await
            }
        }
    }

    /// Returns the trailers, if the stream has delivered them.
    #[must_use]
    pub fn trailers(&self) -> Option<HeaderMap> {
        match &self.source {
            BodySource::Direct(channel) => channel.trailers(),
            BodySource::Duplicated { shared, .. } => shared.trailers(),
        }
    }

    /// Waits until the stream has ended, returning its completion result.
    pub async fn when_complete(&self) -> Result<()> {
        match &self.source {
            BodySource::Direct(channel) => channel.when_complete().await,
            BodySource::Duplicated { shared, aborted, .. } => {
                if let Some(cause) = aborted.get() {
                    return Err(cause.clone());
                }
                shared.when_complete().await
            }
        }
    }

    /// Aborts this response with the given cause.
    ///
    /// Pending and future reads observe the cause; the writer side of a
    /// direct stream stops accepting chunks. Aborting a duplicated view
    /// terminates only that view; sibling views and the duplicator keep
    /// working. Use [`HttpResponseDuplicator::abort`] to tear down a whole
    /// duplicator.
    pub fn abort(&self, cause: Error) {
        match &self.source {
            BodySource::Direct(channel) => channel.abort(cause),
            BodySource::Duplicated { aborted, .. } => {
                let _ = aborted.set(cause);
            }
        }
    }

    /// Reads the whole body and returns the aggregated response.
    pub async fn aggregate(mut self) -> Result<AggregatedHttpResponse> {
        let mut content = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            content.extend_from_slice(&chunk);
        }
        Ok(AggregatedHttpResponse {
            status: self.status,
            headers: self.headers.clone(),
            trailers: self.trailers().unwrap_or_default(),
            content: content.freeze(),
        })
    }

    /// Converts this response into a duplicator over its body.
    ///
    /// `max_content_length` caps how much of the body the duplicator may
    /// buffer; readers that force the buffer past the cap observe a
    /// [`Error::ContentTooLarge`] failure.
    #[must_use]
    pub fn to_duplicator(self, max_content_length: usize) -> HttpResponseDuplicator {
        HttpResponseDuplicator::new(self, max_content_length)
    }

    pub(crate) fn abort_handle(&self) -> SourceAbortHandle {
        match &self.source {
            BodySource::Direct(channel) => SourceAbortHandle::Direct(Arc::clone(channel)),
            BodySource::Duplicated { aborted, .. } => SourceAbortHandle::View(Arc::clone(aborted)),
        }
    }
}

/// A lock-free handle that can abort a response body from outside its
/// reader, even while a pull is in flight.
pub(crate) enum SourceAbortHandle {
    Direct(Arc<Channel>),
    View(Arc<std::sync::OnceLock<Error>>),
}

impl SourceAbortHandle {
    pub(crate) fn abort(&self, cause: Error) {
        match self {
            Self::Direct(channel) => channel.abort(cause),
            Self::View(aborted) => {
                let _ = aborted.set(cause);
            }
        }
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// A fully buffered response: status, headers, content, and trailers.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedHttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    trailers: HeaderMap,
    content: Bytes,
}

impl AggregatedHttpResponse {
    /// Returns the response status.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the response trailers.
    #[must_use]
    pub const fn trailers(&self) -> &HeaderMap {
        &self.trailers
    }

    /// Returns the response content.
    #[must_use]
    pub const fn content(&self) -> &Bytes {
        &self.content
    }

    /// Returns the response content decoded as UTF-8, lossily.
    #[must_use]
    pub fn content_utf8(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}
