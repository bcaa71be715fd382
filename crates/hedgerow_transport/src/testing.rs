// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scriptable mock clients for testing.
//!
//! [`MockClient`] and [`MockRpcClient`] play the role of the transport in
//! tests: each incoming call consumes the next scripted [`MockBehavior`] and
//! every call is recorded together with its context, so tests can assert
//! which endpoints were hit, which retry headers were stamped, and how
//! losing attempts were cancelled.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use serde_json::Value;

use crate::client::Client;
use crate::context::ClientRequestContext;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::request::{ARMERIA_RETRY_COUNT, HttpRequest};
use crate::response::HttpResponse;
use crate::rpc::{RpcRequest, RpcResponse};

/// One scripted behavior of a [`MockClient`].
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Respond after `delay` with the given status, body, and trailers.
    Respond {
        /// Time until the response is produced.
        delay: Duration,
        /// Response status.
        status: StatusCode,
        /// Response body.
        body: Bytes,
        /// Response trailers; empty means none.
        trailers: HeaderMap,
    },
    /// Accept the call and never respond.
    Hang,
    /// Fail after `delay` as if the request never reached a server.
    FailUnprocessed {
        /// Time until the failure is produced.
        delay: Duration,
    },
    /// Fail after `delay` with a transport error.
    Fail {
        /// Time until the failure is produced.
        delay: Duration,
        /// Failure message.
        message: String,
    },
}

impl MockBehavior {
    /// A `200 OK` response with the given body after `delay`.
    #[must_use]
    pub fn ok_after(delay: Duration, body: impl Into<Bytes>) -> Self {
        Self::status_after(delay, StatusCode::OK, body)
    }

    /// A response with the given status and body after `delay`.
    #[must_use]
    pub fn status_after(delay: Duration, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self::Respond {
            delay,
            status,
            body: body.into(),
            trailers: HeaderMap::new(),
        }
    }
}

/// One recorded call to a mock client.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// The endpoint of the calling context, if bound.
    pub endpoint: Option<Endpoint>,
    /// The parsed `armeria-retry-count` header, if present.
    pub retry_count: Option<u32>,
    /// The request as received.
    pub request: Option<HttpRequest>,
    /// The calling context.
    pub context: ClientRequestContext,
}

fn retry_count_of(ctx: &ClientRequestContext, request: Option<&HttpRequest>) -> Option<u32> {
    let from_request = request
        .and_then(|req| req.headers().get(&ARMERIA_RETRY_COUNT))
        .and_then(|value| value.parse().ok());
    from_request.or_else(|| {
        ctx.additional_request_headers()
            .get(&ARMERIA_RETRY_COUNT)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    })
}

struct MockState {
    behaviors: VecDeque<MockBehavior>,
    calls: Vec<RecordedCall>,
}

/// A scriptable HTTP delegate.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use hedgerow_transport::testing::{MockBehavior, MockClient};
///
/// let client = MockClient::new();
/// client.enqueue(MockBehavior::FailUnprocessed { delay: Duration::from_millis(5) });
/// client.enqueue(MockBehavior::ok_after(Duration::ZERO, "from s2"));
/// ```
#[derive(Clone)]
pub struct MockClient {
    state: Arc<Mutex<MockState>>,
}

impl MockClient {
    /// Creates a mock with an empty script.
    ///
    /// Calls beyond the script answer `200 OK` immediately.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                behaviors: VecDeque::new(),
                calls: Vec::new(),
            })),
        }
    }

    /// Appends a behavior to the script.
    pub fn enqueue(&self, behavior: MockBehavior) {
        self.state.lock().behaviors.push_back(behavior);
    }

    /// Returns all recorded calls so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    /// Returns the number of recorded calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    fn record(&self, ctx: &ClientRequestContext, request: Option<HttpRequest>) -> MockBehavior {
        let mut state = self.state.lock();
        state.calls.push(RecordedCall {
            endpoint: ctx.endpoint(),
            retry_count: retry_count_of(ctx, request.as_ref()),
            request,
            context: ctx.clone(),
        });
        state.behaviors.pop_front().unwrap_or(MockBehavior::Respond {
            delay: Duration::ZERO,
            status: StatusCode::OK,
            body: Bytes::new(),
            trailers: HeaderMap::new(),
        })
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Client<HttpRequest> for MockClient {
    type Response = HttpResponse;

    async fn execute(&self, ctx: &ClientRequestContext, req: HttpRequest) -> Result<HttpResponse> {
        let behavior = self.record(ctx, Some(req));
        match behavior {
            MockBehavior::Respond {
                delay,
                status,
                body,
                trailers,
            } => {
                tokio::time::sleep(delay).await;
                let (response, writer) = HttpResponse::streaming(status);
                if !body.is_empty() {
                    writer.write(body);
                }
                if !trailers.is_empty() {
                    writer.trailers(trailers);
                }
                writer.close();
                Ok(response)
            }
            MockBehavior::Hang => Err(ctx.cancelled().await),
            MockBehavior::FailUnprocessed { delay } => {
                tokio::time::sleep(delay).await;
                Err(Error::unprocessed(Error::transport("connection refused")))
            }
            MockBehavior::Fail { delay, message } => {
                tokio::time::sleep(delay).await;
                Err(Error::transport(message))
            }
        }
    }
}

impl std::fmt::Debug for MockClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClient")
            .field("calls", &self.call_count())
            .finish_non_exhaustive()
    }
}

/// One scripted behavior of a [`MockRpcClient`].
#[derive(Debug, Clone)]
pub enum MockRpcBehavior {
    /// Respond after `delay` with the given value.
    Respond {
        /// Time until the response is produced.
        delay: Duration,
        /// Response value.
        value: Value,
    },
    /// Accept the call and never respond.
    Hang,
    /// Fail after `delay` as if the request never reached a server.
    FailUnprocessed {
        /// Time until the failure is produced.
        delay: Duration,
    },
}

/// A scriptable unary RPC delegate.
#[derive(Clone)]
pub struct MockRpcClient {
    state: Arc<Mutex<RpcMockState>>,
}

struct RpcMockState {
    behaviors: VecDeque<MockRpcBehavior>,
    calls: Vec<RecordedCall>,
}

impl MockRpcClient {
    /// Creates a mock with an empty script.
    ///
    /// Calls beyond the script answer `null` immediately.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RpcMockState {
                behaviors: VecDeque::new(),
                calls: Vec::new(),
            })),
        }
    }

    /// Appends a behavior to the script.
    pub fn enqueue(&self, behavior: MockRpcBehavior) {
        self.state.lock().behaviors.push_back(behavior);
    }

    /// Returns all recorded calls so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    /// Returns the number of recorded calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }
}

impl Default for MockRpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Client<RpcRequest> for MockRpcClient {
    type Response = RpcResponse;

    async fn execute(&self, ctx: &ClientRequestContext, _req: RpcRequest) -> Result<RpcResponse> {
        let behavior = {
            let mut state = self.state.lock();
            state.calls.push(RecordedCall {
                endpoint: ctx.endpoint(),
                retry_count: retry_count_of(ctx, None),
                request: None,
                context: ctx.clone(),
            });
            state
                .behaviors
                .pop_front()
                .unwrap_or(MockRpcBehavior::Respond {
                    delay: Duration::ZERO,
                    value: Value::Null,
                })
        };

        match behavior {
            MockRpcBehavior::Respond { delay, value } => {
                tokio::time::sleep(delay).await;
                Ok(RpcResponse::of(value))
            }
            MockRpcBehavior::Hang => Err(ctx.cancelled().await),
            MockRpcBehavior::FailUnprocessed { delay } => {
                tokio::time::sleep(delay).await;
                Err(Error::unprocessed(Error::transport("connection refused")))
            }
        }
    }
}

impl std::fmt::Debug for MockRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRpcClient")
            .field("calls", &self.call_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderValue, Method};

    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(MockClient: Send, Sync, Clone);
        static_assertions::assert_impl_all!(MockRpcClient: Send, Sync, Clone);
    }

    #[tokio::test]
    async fn scripted_behaviors_run_in_order() {
        let client = MockClient::new();
        client.enqueue(MockBehavior::status_after(
            Duration::ZERO,
            StatusCode::INTERNAL_SERVER_ERROR,
            "oops",
        ));
        client.enqueue(MockBehavior::FailUnprocessed {
            delay: Duration::ZERO,
        });

        let ctx = ClientRequestContext::of(HttpRequest::of(Method::GET, "/"));
        let first = client
            .execute(&ctx, HttpRequest::of(Method::GET, "/"))
            .await
            .expect("first call succeeds");
        assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let second = client
            .execute(&ctx, HttpRequest::of(Method::GET, "/"))
            .await
            .expect_err("second call fails");
        assert!(second.is_unprocessed());

        // Beyond the script: 200 OK.
        let third = client
            .execute(&ctx, HttpRequest::of(Method::GET, "/"))
            .await
            .expect("default behavior");
        assert_eq!(third.status(), StatusCode::OK);
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn records_retry_count_header() {
        let client = MockClient::new();
        let mut req = HttpRequest::of(Method::GET, "/");
        req.headers_mut()
            .set(ARMERIA_RETRY_COUNT, HeaderValue::from_static("2"));

        let ctx = ClientRequestContext::of(req.clone());
        let _ = client.execute(&ctx, req).await;

        let calls = client.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].retry_count, Some(2));
    }

    #[tokio::test]
    async fn hang_resolves_on_cancellation() {
        let client = MockClient::new();
        client.enqueue(MockBehavior::Hang);

        let ctx = ClientRequestContext::of(HttpRequest::of(Method::GET, "/"));
        let pending = {
            let client = client.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { client.execute(&ctx, HttpRequest::of(Method::GET, "/")).await })
        };
        tokio::task::yield_now().await;

        ctx.cancel(Error::ResponseCancelled);
        let result = pending.await.expect("join");
        assert!(result.expect_err("cancelled").is_response_cancelled());
    }
}
