// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-request observability logs.
//!
//! Every request context owns a [`RequestLog`]: a record of properties that
//! become available as the request progresses. Consumers can check
//! availability, wait for a property, or register a hook that fires the
//! moment a property is published. Logs form a tree: a decorator that issues
//! several attempts for one caller-visible request attaches each attempt's
//! log as a child of the parent log.

use std::sync::Arc;

use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::Error;

/// The serialization format of a request, recorded on its log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SerializationFormat(&'static str);

impl SerializationFormat {
    /// No serialization format: plain HTTP.
    pub const NONE: Self = Self("none");
    /// JSON-serialized RPC.
    pub const JSON: Self = Self("json");
    /// Binary-serialized RPC.
    pub const BINARY: Self = Self("binary");

    /// Returns the textual name of this format.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// A property of a [`RequestLog`] that becomes available over the lifetime
/// of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RequestLogProperty {
    /// The service name and/or request name.
    Name,
    /// The moment the first request bytes reached the wire.
    RequestFirstBytesTransferredTime,
    /// The high-level request content.
    RequestContent,
    /// A textual preview of the request content.
    RequestContentPreview,
    /// The response status and headers.
    ResponseHeaders,
    /// The response trailers.
    ResponseTrailers,
    /// The high-level response content.
    ResponseContent,
    /// A textual preview of the response content.
    ResponseContentPreview,
    /// The moment the response completed, successfully or not.
    ResponseEndTime,
}

impl RequestLogProperty {
    const fn bit(self) -> u16 {
        match self {
            Self::Name => 1 << 0,
            Self::RequestFirstBytesTransferredTime => 1 << 1,
            Self::RequestContent => 1 << 2,
            Self::RequestContentPreview => 1 << 3,
            Self::ResponseHeaders => 1 << 4,
            Self::ResponseTrailers => 1 << 5,
            Self::ResponseContent => 1 << 6,
            Self::ResponseContentPreview => 1 << 7,
            Self::ResponseEndTime => 1 << 8,
        }
    }
}

type Hook = Box<dyn FnOnce(&RequestLog) + Send>;

#[derive(Default)]
struct LogState {
    available: u16,
    deferred: u16,
    serialization_format: Option<SerializationFormat>,
    name: Option<String>,
    service_name: Option<String>,
    request_content: Option<Value>,
    request_content_preview: Option<String>,
    request_first_bytes_at: Option<Instant>,
    response_status: Option<StatusCode>,
    response_headers: Option<HeaderMap>,
    response_trailers: Option<HeaderMap>,
    response_content: Option<Value>,
    response_content_preview: Option<String>,
    request_cause: Option<Error>,
    response_cause: Option<Error>,
    request_ended: bool,
    response_ended: bool,
    response_end_at: Option<Instant>,
    children: Vec<RequestLog>,
    ends_with_last_child: bool,
    hooks: Vec<(RequestLogProperty, Hook)>,
}

struct LogInner {
    state: Mutex<LogState>,
    version: watch::Sender<()>,
}

/// The log of a single request.
///
/// Cloning yields another handle to the same log. Writes go through
/// [`RequestLogBuilder`], obtained from the owning context.
///
/// # Examples
///
/// ```
/// use hedgerow_transport::{RequestLog, RequestLogProperty};
///
/// let log = RequestLog::new();
/// assert!(!log.is_available(RequestLogProperty::Name));
///
/// log.builder().name("getItem");
/// assert!(log.is_available(RequestLogProperty::Name));
/// assert_eq!(log.name().as_deref(), Some("getItem"));
/// ```
#[derive(Clone)]
pub struct RequestLog {
    inner: Arc<LogInner>,
}

impl RequestLog {
    /// Creates a new, empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LogInner {
                state: Mutex::new(LogState::default()),
                version: watch::Sender::new(()),
            }),
        }
    }

    /// Returns the writing view of this log.
    #[must_use]
    pub fn builder(&self) -> RequestLogBuilder {
        RequestLogBuilder { log: self.clone() }
    }

    /// Returns `true` when the given property has been published.
    #[must_use]
    pub fn is_available(&self, property: RequestLogProperty) -> bool {
        self.inner.state.lock().available & property.bit() != 0
    }

    /// Returns `true` when the given property was marked deferred.
    #[must_use]
    pub fn is_deferred(&self, property: RequestLogProperty) -> bool {
        self.inner.state.lock().deferred & property.bit() != 0
    }

    /// Registers a hook that fires once the given property is published.
    ///
    /// Fires immediately when the property is already available.
    pub fn on_available(
        &self,
        property: RequestLogProperty,
        hook: impl FnOnce(&RequestLog) + Send + 'static,
    ) {
        {
            let mut state = self.inner.state.lock();
            if state.available & property.bit() == 0 {
                state.hooks.push((property, Box::new(hook)));
                return;
            }
        }
        hook(self);
    }

    /// Waits until the given property is published.
    pub async fn when_available(&self, property: RequestLogProperty) {
        let mut version = self.inner.version.subscribe();
        loop {
            if self.is_available(property) {
                return;
            }
            if version.changed().await.is_err() {
                return;
            }
        }
    }

    /// Returns the serialization format, defaulting to
    /// [`SerializationFormat::NONE`].
    #[must_use]
    pub fn serialization_format(&self) -> SerializationFormat {
        self.inner
            .state
            .lock()
            .serialization_format
            .unwrap_or(SerializationFormat::NONE)
    }

    /// Returns the request name, if published.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.inner.state.lock().name.clone()
    }

    /// Returns the service name, if published.
    #[must_use]
    pub fn service_name(&self) -> Option<String> {
        self.inner.state.lock().service_name.clone()
    }

    /// Returns the request content, if published.
    #[must_use]
    pub fn request_content(&self) -> Option<Value> {
        self.inner.state.lock().request_content.clone()
    }

    /// Returns the request content preview, if published.
    #[must_use]
    pub fn request_content_preview(&self) -> Option<String> {
        self.inner.state.lock().request_content_preview.clone()
    }

    /// Returns the response status, if published.
    #[must_use]
    pub fn response_status(&self) -> Option<StatusCode> {
        self.inner.state.lock().response_status
    }

    /// Returns the response headers, if published.
    #[must_use]
    pub fn response_headers(&self) -> Option<HeaderMap> {
        self.inner.state.lock().response_headers.clone()
    }

    /// Returns the response trailers, if published.
    #[must_use]
    pub fn response_trailers(&self) -> Option<HeaderMap> {
        self.inner.state.lock().response_trailers.clone()
    }

    /// Returns the response content, if published.
    #[must_use]
    pub fn response_content(&self) -> Option<Value> {
        self.inner.state.lock().response_content.clone()
    }

    /// Returns the response content preview, if published.
    #[must_use]
    pub fn response_content_preview(&self) -> Option<String> {
        self.inner.state.lock().response_content_preview.clone()
    }

    /// Returns when the first request bytes reached the wire, if published.
    #[must_use]
    pub fn request_first_bytes_transferred_time(&self) -> Option<Instant> {
        self.inner.state.lock().request_first_bytes_at
    }

    /// Returns when the response ended, if it has.
    #[must_use]
    pub fn response_end_time(&self) -> Option<Instant> {
        self.inner.state.lock().response_end_at
    }

    /// Returns the cause the request ended with, if any.
    #[must_use]
    pub fn request_cause(&self) -> Option<Error> {
        self.inner.state.lock().request_cause.clone()
    }

    /// Returns the cause the response ended with, if any.
    #[must_use]
    pub fn response_cause(&self) -> Option<Error> {
        self.inner.state.lock().response_cause.clone()
    }

    /// Returns `true` once the request side has ended.
    #[must_use]
    pub fn is_request_ended(&self) -> bool {
        self.inner.state.lock().request_ended
    }

    /// Returns `true` once the response has ended.
    #[must_use]
    pub fn is_response_ended(&self) -> bool {
        self.inner.state.lock().response_ended
    }

    /// Returns `true` when this log is set to end with its last child.
    #[must_use]
    pub fn ends_with_last_child(&self) -> bool {
        self.inner.state.lock().ends_with_last_child
    }

    /// Returns the logs of all attached children, in attachment order.
    #[must_use]
    pub fn children(&self) -> Vec<RequestLog> {
        self.inner.state.lock().children.clone()
    }

    /// Runs `mutate` on the state, publishes `property`, then fires hooks
    /// outside the lock.
    fn publish(&self, property: RequestLogProperty, mutate: impl FnOnce(&mut LogState)) {
        let fired = {
            let mut state = self.inner.state.lock();
            mutate(&mut state);
            state.available |= property.bit();

            let mut fired = Vec::new();
            let mut index = 0;
            while index < state.hooks.len() {
                if state.hooks[index].0 == property {
                    fired.push(state.hooks.swap_remove(index).1);
                } else {
                    index += 1;
                }
            }
            fired
        };

        self.inner.version.send_modify(|_| {});
        for hook in fired {
            hook(self);
        }
    }
}

impl Default for RequestLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequestLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RequestLog")
            .field("available", &state.available)
            .field("children", &state.children.len())
            .finish_non_exhaustive()
    }
}

/// The writing view of a [`RequestLog`].
#[derive(Debug, Clone)]
pub struct RequestLogBuilder {
    log: RequestLog,
}

impl RequestLogBuilder {
    /// Records the serialization format.
    pub fn serialization_format(&self, format: SerializationFormat) {
        self.log.inner.state.lock().serialization_format = Some(format);
    }

    /// Publishes the request name.
    pub fn name(&self, name: impl Into<String>) {
        let name = name.into();
        self.log
            .publish(RequestLogProperty::Name, |state| state.name = Some(name));
    }

    /// Publishes the request name together with its service name.
    pub fn name_with_service(&self, service_name: impl Into<String>, name: impl Into<String>) {
        let service_name = service_name.into();
        let name = name.into();
        self.log.publish(RequestLogProperty::Name, |state| {
            state.service_name = Some(service_name);
            state.name = Some(name);
        });
    }

    /// Marks a property as deferred: its value arrives later through
    /// another publisher.
    pub fn defer(&self, property: RequestLogProperty) {
        self.log.inner.state.lock().deferred |= property.bit();
    }

    /// Publishes the request content.
    pub fn request_content(&self, content: Value) {
        self.log.publish(RequestLogProperty::RequestContent, |state| {
            state.request_content = Some(content);
        });
    }

    /// Publishes the request content preview.
    pub fn request_content_preview(&self, preview: impl Into<String>) {
        let preview = preview.into();
        self.log
            .publish(RequestLogProperty::RequestContentPreview, |state| {
                state.request_content_preview = Some(preview);
            });
    }

    /// Records that the first request bytes reached the wire.
    pub fn request_first_bytes_transferred(&self) {
        let now = Instant::now();
        self.log.publish(
            RequestLogProperty::RequestFirstBytesTransferredTime,
            |state| state.request_first_bytes_at = Some(now),
        );
    }

    /// Publishes the response status and headers.
    pub fn response_headers(&self, status: StatusCode, headers: HeaderMap) {
        self.log.publish(RequestLogProperty::ResponseHeaders, |state| {
            state.response_status = Some(status);
            state.response_headers = Some(headers);
        });
    }

    /// Publishes the response trailers.
    pub fn response_trailers(&self, trailers: HeaderMap) {
        self.log
            .publish(RequestLogProperty::ResponseTrailers, |state| {
                state.response_trailers = Some(trailers);
            });
    }

    /// Publishes the response content.
    pub fn response_content(&self, content: Value) {
        self.log.publish(RequestLogProperty::ResponseContent, |state| {
            state.response_content = Some(content);
        });
    }

    /// Publishes the response content preview.
    pub fn response_content_preview(&self, preview: impl Into<String>) {
        let preview = preview.into();
        self.log
            .publish(RequestLogProperty::ResponseContentPreview, |state| {
                state.response_content_preview = Some(preview);
            });
    }

    /// Ends the request side.
    pub fn end_request(&self) {
        self.log.inner.state.lock().request_ended = true;
    }

    /// Ends the request side with a failure.
    pub fn end_request_with(&self, cause: Error) {
        let mut state = self.log.inner.state.lock();
        state.request_ended = true;
        state.request_cause = Some(cause);
    }

    /// Ends the response side.
    pub fn end_response(&self) {
        self.end_response_inner(None);
    }

    /// Ends the response side with a failure.
    pub fn end_response_with(&self, cause: Error) {
        self.end_response_inner(Some(cause));
    }

    fn end_response_inner(&self, cause: Option<Error>) {
        let now = Instant::now();
        self.log.publish(RequestLogProperty::ResponseEndTime, |state| {
            if state.response_ended {
                return;
            }
            state.response_ended = true;
            state.response_end_at = Some(now);
            if let Some(cause) = cause {
                state.response_cause = Some(cause);
            }
        });
    }

    /// Attaches a child log.
    pub fn add_child(&self, child: RequestLog) {
        self.log.inner.state.lock().children.push(child);
    }

    /// Ends the response side of this log with its last attached child.
    ///
    /// The last child's response status, trailers, and cause are mirrored
    /// onto this log once the child's response ends. With no children the
    /// response is ended directly.
    pub fn end_response_with_last_child(&self) {
        let last_child = {
            let mut state = self.log.inner.state.lock();
            state.ends_with_last_child = true;
            state.children.last().cloned()
        };

        match last_child {
            Some(child) => {
                let parent = self.log.clone();
                child.on_available(RequestLogProperty::ResponseEndTime, move |child| {
                    let builder = parent.builder();
                    if let Some(status) = child.response_status() {
                        builder
                            .response_headers(status, child.response_headers().unwrap_or_default());
                    }
                    if let Some(trailers) = child.response_trailers() {
                        builder.response_trailers(trailers);
                    }
                    match child.response_cause() {
                        Some(cause) => builder.end_response_with(cause),
                        None => builder.end_response(),
                    }
                });
            }
            None => self.end_response(),
        }
    }
}
