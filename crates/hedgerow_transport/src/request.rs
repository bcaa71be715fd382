// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! HTTP request model.
//!
//! Requests hold a fully buffered body so speculative execution (retries,
//! hedging) can replay the same request any number of times by cloning it.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};

/// The outbound request header carrying the 0-based attempt number for
/// speculative attempts after the first. Attempt 0 carries no such header.
pub const ARMERIA_RETRY_COUNT: HeaderName = HeaderName::from_static("armeria-retry-count");

/// The initial headers of an HTTP request: method, path, and header fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHeaders {
    method: Method,
    path: String,
    headers: HeaderMap,
}

impl RequestHeaders {
    /// Creates new request headers for the given method and path.
    #[must_use]
    pub fn of(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Returns the request method.
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the header fields.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the value of the given header as a string, if present and
    /// valid UTF-8.
    #[must_use]
    pub fn get(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Sets a header field, replacing any previous value.
    pub fn set(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }
}

/// A complete, replayable HTTP request.
///
/// # Examples
///
/// ```
/// use http::Method;
/// use hedgerow_transport::HttpRequest;
///
/// let req = HttpRequest::of(Method::GET, "/items");
/// assert_eq!(req.headers().path(), "/items");
/// assert!(req.body().is_empty());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    headers: RequestHeaders,
    body: Bytes,
}

impl HttpRequest {
    /// Creates a new request with an empty body.
    #[must_use]
    pub fn of(method: Method, path: impl Into<String>) -> Self {
        Self {
            headers: RequestHeaders::of(method, path),
            body: Bytes::new(),
        }
    }

    /// Creates a new request with the given body.
    #[must_use]
    pub fn of_body(method: Method, path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            headers: RequestHeaders::of(method, path),
            body: body.into(),
        }
    }

    /// Returns the request headers.
    #[must_use]
    pub const fn headers(&self) -> &RequestHeaders {
        &self.headers
    }

    /// Returns a mutable reference to the request headers.
    pub fn headers_mut(&mut self) -> &mut RequestHeaders {
        &mut self.headers
    }

    /// Returns the request body.
    #[must_use]
    pub const fn body(&self) -> &Bytes {
        &self.body
    }
}
