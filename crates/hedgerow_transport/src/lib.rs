// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(docsrs, feature(doc_cfg))]

//! Transport substrate for the `hedgerow` client.
//!
//! # Why
//!
//! Client decorators that issue speculative attempts (retries, hedges)
//! need a transport seam they can call more than once, a per-request context
//! they can derive children from, streamed responses they can duplicate and
//! abort, and request logs they can aggregate into a tree. This crate
//! provides exactly those interfaces; `hedgerow` builds the hedging engine
//! on top of them.
//!
//! # Core Types
//!
//! - [`Client`]: the delegate seam a decorator wraps.
//! - [`ClientRequestContext`]: per-request state, attributes, cancellation,
//!   and derivation of per-attempt child contexts.
//! - [`HttpRequest`] / [`HttpResponse`]: a replayable request and a streamed
//!   response with abort and duplication support.
//! - [`RpcRequest`] / [`RpcResponse`]: the unary RPC pair.
//! - [`RequestLog`]: the per-request observability record, organized as a
//!   tree across attempts.
//! - [`EndpointGroup`]: the destination pool attempts select endpoints from.
//!
//! # Examples
//!
//! ```
//! use http::{Method, StatusCode};
//! use hedgerow_transport::{Client, ClientRequestContext, HttpRequest, HttpResponse, Result};
//!
//! struct AlwaysOk;
//!
//! impl Client<HttpRequest> for AlwaysOk {
//!     type Response = HttpResponse;
//!
//!     async fn execute(
//!         &self,
//!         _ctx: &ClientRequestContext,
//!         _req: HttpRequest,
//!     ) -> Result<HttpResponse> {
//!         Ok(HttpResponse::of_body(StatusCode::OK, "hello"))
//!     }
//! }
//!
//! # fn main() {
//! # let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
//! # rt.block_on(async {
//! let ctx = ClientRequestContext::of(HttpRequest::of(Method::GET, "/hello"));
//! let response = AlwaysOk.execute(&ctx, HttpRequest::of(Method::GET, "/hello")).await?;
//! assert_eq!(response.aggregate().await?.content_utf8(), "hello");
//! # Ok::<(), hedgerow_transport::Error>(())
//! # }).unwrap();
//! # }
//! ```

mod client;
mod context;
mod duplicator;
mod endpoint;
mod error;
mod log;
mod request;
mod response;
mod rpc;

#[cfg(any(feature = "test-util", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod testing;

pub use client::Client;
pub use context::{ClientRequestContext, ClientRequestContextBuilder, ContextGuard, RequestId};
pub use duplicator::HttpResponseDuplicator;
pub use endpoint::{Endpoint, EndpointGroup};
pub use error::{Error, Result};
pub use log::{RequestLog, RequestLogBuilder, RequestLogProperty, SerializationFormat};
pub use request::{ARMERIA_RETRY_COUNT, HttpRequest, RequestHeaders};
pub use response::{AggregatedHttpResponse, HttpResponse, ResponseWriter, StatusClass};
pub use rpc::{RpcRequest, RpcResponse};
