// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-request client context.
//!
//! A [`ClientRequestContext`] travels with one request through the client
//! decorator chain. It carries the selected endpoint, the request log, a
//! typed attribute store, the response timeout, and a cancellation cell.
//! Decorators that issue several attempts for one caller-visible request
//! derive child contexts with [`new_derived_context`][ClientRequestContext::new_derived_context].

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::endpoint::{Endpoint, EndpointGroup};
use crate::error::Error;
use crate::log::{RequestLog, RequestLogBuilder};
use crate::request::{HttpRequest, RequestHeaders};
use crate::rpc::RpcRequest;

/// The identifier of a single request.
///
/// # Examples
///
/// ```
/// use hedgerow_transport::RequestId;
///
/// let id = RequestId::of(0x2a);
/// assert_eq!(id.to_string(), "000000000000002a");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Creates a request id from a raw value.
    #[must_use]
    pub const fn of(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value of this id.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

type IdGenerator = Arc<dyn Fn() -> RequestId + Send + Sync>;

fn sequential_id_generator() -> IdGenerator {
    let counter = AtomicU64::new(1);
    Arc::new(move || RequestId::of(counter.fetch_add(1, Ordering::Relaxed)))
}

thread_local! {
    static CURRENT: RefCell<Vec<ClientRequestContext>> = const { RefCell::new(Vec::new()) };
}

struct CtxInner {
    id: RequestId,
    id_generator: IdGenerator,
    endpoint: Option<Endpoint>,
    endpoint_group: Option<Arc<EndpointGroup>>,
    runtime: tokio::runtime::Handle,
    http_request: Mutex<Option<HttpRequest>>,
    rpc_request: Mutex<Option<RpcRequest>>,
    additional_headers: Mutex<HeaderMap>,
    response_timeout: Mutex<Option<Duration>>,
    attrs: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    log: RequestLog,
    cancellation: Mutex<Option<Error>>,
    cancel_version: watch::Sender<()>,
}

/// The context of a single client request.
///
/// Cloning yields another handle to the same context.
///
/// # Examples
///
/// ```
/// use http::Method;
/// use hedgerow_transport::{ClientRequestContext, HttpRequest};
///
/// # let _rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
/// # let _guard = _rt.enter();
/// let ctx = ClientRequestContext::of(HttpRequest::of(Method::GET, "/"));
/// assert!(ctx.endpoint().is_none());
/// assert!(ctx.cancellation_cause().is_none());
/// ```
#[derive(Clone)]
pub struct ClientRequestContext {
    inner: Arc<CtxInner>,
}

impl ClientRequestContext {
    /// Creates a context for the given HTTP request with default options.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn of(request: HttpRequest) -> Self {
        Self::builder().http_request(request).build()
    }

    /// Creates a context for the given RPC request with default options.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn of_rpc(request: RpcRequest) -> Self {
        Self::builder().rpc_request(request).build()
    }

    /// Returns a builder for a customized context.
    #[must_use]
    pub fn builder() -> ClientRequestContextBuilder {
        ClientRequestContextBuilder::new()
    }

    /// Returns the context most recently pushed on this thread, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT.with(|stack| stack.borrow().last().cloned())
    }

    /// Makes this context the current one until the returned guard drops.
    #[must_use]
    pub fn push(&self) -> ContextGuard {
        CURRENT.with(|stack| stack.borrow_mut().push(self.clone()));
        ContextGuard { _private: () }
    }

    /// Returns the id of this request.
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    /// Generates a fresh request id from this context's generator.
    #[must_use]
    pub fn next_request_id(&self) -> RequestId {
        (self.inner.id_generator)()
    }

    /// Returns the endpoint this request is bound to.
    #[must_use]
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.endpoint.clone()
    }

    /// Returns the endpoint group this request selects endpoints from.
    #[must_use]
    pub fn endpoint_group(&self) -> Option<Arc<EndpointGroup>> {
        self.inner.endpoint_group.clone()
    }

    /// Returns the runtime handle request work is dispatched on.
    #[must_use]
    pub fn event_loop(&self) -> tokio::runtime::Handle {
        self.inner.runtime.clone()
    }

    /// Returns the HTTP request bound to this context, if any.
    #[must_use]
    pub fn http_request(&self) -> Option<HttpRequest> {
        self.inner.http_request.lock().clone()
    }

    /// Returns the RPC request bound to this context, if any.
    #[must_use]
    pub fn rpc_request(&self) -> Option<RpcRequest> {
        self.inner.rpc_request.lock().clone()
    }

    /// Returns the headers of the bound HTTP request, if any.
    #[must_use]
    pub fn request_headers(&self) -> Option<RequestHeaders> {
        self.inner
            .http_request
            .lock()
            .as_ref()
            .map(|req| req.headers().clone())
    }

    /// Adds a header sent with the request in addition to the request's own
    /// headers.
    pub fn add_additional_request_header(&self, name: HeaderName, value: HeaderValue) {
        self.inner.additional_headers.lock().insert(name, value);
    }

    /// Returns the additional request headers.
    #[must_use]
    pub fn additional_request_headers(&self) -> HeaderMap {
        self.inner.additional_headers.lock().clone()
    }

    /// Returns the response timeout, `None` meaning unlimited.
    #[must_use]
    pub fn response_timeout(&self) -> Option<Duration> {
        *self.inner.response_timeout.lock()
    }

    /// Sets the response timeout, measured from now.
    pub fn set_response_timeout(&self, timeout: Duration) {
        *self.inner.response_timeout.lock() = Some(timeout);
    }

    /// Clears the response timeout.
    pub fn clear_response_timeout(&self) {
        *self.inner.response_timeout.lock() = None;
    }

    /// Attaches a value to this context, keyed by its type, and returns the
    /// shared handle to it.
    ///
    /// A previous value of the same type is replaced.
    pub fn set_attr<T: Any + Send + Sync>(&self, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.inner
            .attrs
            .lock()
            .insert(TypeId::of::<T>(), Arc::clone(&value) as Arc<dyn Any + Send + Sync>);
        value
    }

    /// Returns the attached value of the given type, if any.
    #[must_use]
    pub fn attr<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let any = self.inner.attrs.lock().get(&TypeId::of::<T>()).cloned()?;
        Arc::downcast(any).ok()
    }

    /// Returns the log of this request.
    #[must_use]
    pub fn log(&self) -> RequestLog {
        self.inner.log.clone()
    }

    /// Returns the writing view of this request's log.
    #[must_use]
    pub fn log_builder(&self) -> RequestLogBuilder {
        self.inner.log.builder()
    }

    /// Cancels this request with the given cause.
    ///
    /// The first cause wins; later calls are ignored.
    pub fn cancel(&self, cause: Error) {
        {
            let mut cancellation = self.inner.cancellation.lock();
            if cancellation.is_some() {
                return;
            }
            tracing::debug!(id = %self.inner.id, %cause, "cancelling request");
            *cancellation = Some(cause);
        }
        self.inner.cancel_version.send_modify(|_| {});
    }

    /// Returns the cancellation cause, if this request has been cancelled.
    #[must_use]
    pub fn cancellation_cause(&self) -> Option<Error> {
        self.inner.cancellation.lock().clone()
    }

    /// Waits until this request is cancelled and returns the cause.
    pub async fn cancelled(&self) -> Error {
        let mut version = self.inner.cancel_version.subscribe();
        loop {
            if let Some(cause) = self.cancellation_cause() {
                return cause;
            }
            if version.changed().await.is_err() {
                // The context can't go away while `self` is borrowed; treat a
                // closed channel as cancellation anyway.
                return Error::ResponseCancelled;
            }
        }
    }

    /// Derives a child context for one attempt of this request.
    ///
    /// The child shares the id generator, endpoint group, runtime, and
    /// response timeout, and gets a fresh log, attribute store, and
    /// cancellation cell.
    #[must_use]
    pub fn new_derived_context(
        &self,
        id: RequestId,
        http_request: Option<HttpRequest>,
        rpc_request: Option<RpcRequest>,
        endpoint: Option<Endpoint>,
    ) -> Self {
        Self {
            inner: Arc::new(CtxInner {
                id,
                id_generator: Arc::clone(&self.inner.id_generator),
                endpoint,
                endpoint_group: self.inner.endpoint_group.clone(),
                runtime: self.inner.runtime.clone(),
                http_request: Mutex::new(http_request),
                rpc_request: Mutex::new(rpc_request),
                additional_headers: Mutex::new(HeaderMap::new()),
                response_timeout: Mutex::new(*self.inner.response_timeout.lock()),
                attrs: Mutex::new(HashMap::new()),
                log: RequestLog::new(),
                cancellation: Mutex::new(None),
                cancel_version: watch::Sender::new(()),
            }),
        }
    }
}

impl fmt::Debug for ClientRequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRequestContext")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .finish_non_exhaustive()
    }
}

/// Restores the previous current context when dropped.
#[derive(Debug)]
pub struct ContextGuard {
    _private: (),
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Builds a [`ClientRequestContext`].
pub struct ClientRequestContextBuilder {
    http_request: Option<HttpRequest>,
    rpc_request: Option<RpcRequest>,
    endpoint: Option<Endpoint>,
    endpoint_group: Option<Arc<EndpointGroup>>,
    response_timeout: Option<Duration>,
    id_generator: Option<IdGenerator>,
}

impl ClientRequestContextBuilder {
    fn new() -> Self {
        Self {
            http_request: None,
            rpc_request: None,
            endpoint: None,
            endpoint_group: None,
            response_timeout: None,
            id_generator: None,
        }
    }

    /// Binds an HTTP request to the context.
    #[must_use]
    pub fn http_request(mut self, request: HttpRequest) -> Self {
        self.http_request = Some(request);
        self
    }

    /// Binds an RPC request to the context.
    #[must_use]
    pub fn rpc_request(mut self, request: RpcRequest) -> Self {
        self.rpc_request = Some(request);
        self
    }

    /// Binds the request to a fixed endpoint.
    #[must_use]
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Binds the request to an endpoint group.
    ///
    /// When no fixed endpoint is set, the initial endpoint is selected from
    /// the group at build time.
    #[must_use]
    pub fn endpoint_group(mut self, group: Arc<EndpointGroup>) -> Self {
        self.endpoint_group = Some(group);
        self
    }

    /// Sets the whole-operation response timeout.
    #[must_use]
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    /// Replaces the request-id generator.
    #[must_use]
    pub fn id_generator(
        mut self,
        generator: impl Fn() -> RequestId + Send + Sync + 'static,
    ) -> Self {
        self.id_generator = Some(Arc::new(generator));
        self
    }

    /// Builds the context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn build(self) -> ClientRequestContext {
        let id_generator = self.id_generator.unwrap_or_else(sequential_id_generator);
        let endpoint = self
            .endpoint
            .or_else(|| self.endpoint_group.as_ref().map(|group| group.select_now()));

        ClientRequestContext {
            inner: Arc::new(CtxInner {
                id: id_generator(),
                id_generator,
                endpoint,
                endpoint_group: self.endpoint_group,
                runtime: tokio::runtime::Handle::current(),
                http_request: Mutex::new(self.http_request),
                rpc_request: Mutex::new(self.rpc_request),
                additional_headers: Mutex::new(HeaderMap::new()),
                response_timeout: Mutex::new(self.response_timeout),
                attrs: Mutex::new(HashMap::new()),
                log: RequestLog::new(),
                cancellation: Mutex::new(None),
                cancel_version: watch::Sender::new(()),
            }),
        }
    }
}

impl fmt::Debug for ClientRequestContextBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRequestContextBuilder")
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(ClientRequestContext: Send, Sync, Clone);
        static_assertions::assert_impl_all!(RequestId: Send, Sync, Copy);
    }

    fn ctx() -> ClientRequestContext {
        ClientRequestContext::of(HttpRequest::of(Method::GET, "/test"))
    }

    #[tokio::test]
    async fn attrs_roundtrip() {
        #[derive(Debug, PartialEq)]
        struct Marker(u32);

        let ctx = ctx();
        assert!(ctx.attr::<Marker>().is_none());

        ctx.set_attr(Marker(7));
        assert_eq!(ctx.attr::<Marker>().as_deref(), Some(&Marker(7)));

        ctx.set_attr(Marker(8));
        assert_eq!(ctx.attr::<Marker>().as_deref(), Some(&Marker(8)));
    }

    #[tokio::test]
    async fn push_makes_context_current() {
        let ctx = ctx();
        assert!(ClientRequestContext::current().is_none());
        {
            let _guard = ctx.push();
            let current = ClientRequestContext::current().expect("current context");
            assert_eq!(current.id(), ctx.id());
        }
        assert!(ClientRequestContext::current().is_none());
    }

    #[tokio::test]
    async fn cancel_records_first_cause() {
        let ctx = ctx();
        ctx.cancel(Error::ResponseCancelled);
        ctx.cancel(Error::SchedulerClosed);

        let cause = ctx.cancellation_cause().expect("cancelled");
        assert!(cause.is_response_cancelled());
        assert!(ctx.cancelled().await.is_response_cancelled());
    }

    #[tokio::test]
    async fn derived_context_inherits_options() {
        let group = Arc::new(EndpointGroup::of([
            Endpoint::of("s1", 80),
            Endpoint::of("s2", 80),
        ]));
        let parent = ClientRequestContext::builder()
            .http_request(HttpRequest::of(Method::GET, "/"))
            .endpoint_group(Arc::clone(&group))
            .response_timeout(Duration::from_millis(250))
            .build();
        assert_eq!(parent.endpoint().map(|e| e.host().to_owned()), Some("s1".to_owned()));

        let id = parent.next_request_id();
        let derived = parent.new_derived_context(
            id,
            parent.http_request(),
            None,
            Some(group.select_now()),
        );

        assert_ne!(derived.id(), parent.id());
        assert_eq!(derived.response_timeout(), Some(Duration::from_millis(250)));
        assert!(derived.endpoint_group().is_some());
        assert!(derived.cancellation_cause().is_none());
        assert!(derived.attr::<u32>().is_none());
    }

    #[tokio::test]
    async fn response_timeout_set_and_clear() {
        let ctx = ctx();
        assert_eq!(ctx.response_timeout(), None);
        ctx.set_response_timeout(Duration::from_millis(10));
        assert_eq!(ctx.response_timeout(), Some(Duration::from_millis(10)));
        ctx.clear_response_timeout();
        assert_eq!(ctx.response_timeout(), None);
    }

    #[tokio::test]
    async fn id_generator_is_inherited() {
        let parent = ClientRequestContext::builder()
            .http_request(HttpRequest::of(Method::GET, "/"))
            .id_generator(|| RequestId::of(99))
            .build();
        let derived = parent.new_derived_context(parent.next_request_id(), None, None, None);
        assert_eq!(derived.id(), RequestId::of(99));
        assert_eq!(derived.next_request_id(), RequestId::of(99));
    }
}
