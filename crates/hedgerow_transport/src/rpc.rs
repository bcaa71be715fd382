// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Unary RPC request and response model.

use serde_json::Value;

use crate::error::{Error, Result};

/// A unary RPC call: service, method, and serialized parameters.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use hedgerow_transport::RpcRequest;
///
/// let req = RpcRequest::of("HelloService", "hello", vec![json!("world")]);
/// assert_eq!(req.method(), "hello");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    service_name: String,
    method: String,
    params: Vec<Value>,
}

impl RpcRequest {
    /// Creates a new RPC request.
    #[must_use]
    pub fn of(
        service_name: impl Into<String>,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            method: method.into(),
            params,
        }
    }

    /// Returns the service name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the method name.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns the call parameters.
    #[must_use]
    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

/// The settled outcome of a unary RPC call.
///
/// Unlike a streamed HTTP response there is nothing left in flight by the
/// time a value exists, so the response is a plain completed result.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use hedgerow_transport::RpcResponse;
///
/// let res = RpcResponse::of(json!({"greeting": "hi"}));
/// assert!(res.is_success());
/// assert_eq!(res.value().unwrap()["greeting"], "hi");
/// ```
#[derive(Debug, Clone)]
pub struct RpcResponse {
    result: Result<Value>,
}

impl RpcResponse {
    /// Creates a successful response.
    #[must_use]
    pub const fn of(value: Value) -> Self {
        Self { result: Ok(value) }
    }

    /// Creates a failed response.
    #[must_use]
    pub const fn failed(cause: Error) -> Self {
        Self { result: Err(cause) }
    }

    /// Returns `true` when the call succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Returns the result value, if the call succeeded.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.result.as_ref().ok()
    }

    /// Returns the failure cause, if the call failed.
    #[must_use]
    pub fn cause(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }

    /// Converts this response into a plain result.
    pub fn into_result(self) -> Result<Value> {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(RpcRequest: Send, Sync, Clone);
        static_assertions::assert_impl_all!(RpcResponse: Send, Sync, Clone);
    }

    #[test]
    fn success_roundtrip() {
        let res = RpcResponse::of(json!(42));
        assert!(res.is_success());
        assert_eq!(res.into_result().expect("success"), json!(42));
    }

    #[test]
    fn failure_roundtrip() {
        let res = RpcResponse::failed(Error::unprocessed(Error::transport("down")));
        assert!(!res.is_success());
        assert!(res.cause().map(Error::is_unprocessed).unwrap_or(false));
    }
}
