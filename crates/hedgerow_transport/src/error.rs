// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types shared by the transport substrate and the hedging engine.

use std::sync::Arc;
use std::time::Duration;

/// A specialized `Result` for transport operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error surfaced by the transport or by a hedged call.
///
/// The variants classify failures the way rule predicates need to observe
/// them: whether the request ever reached a server, whether a deadline
/// elapsed, whether a stream was cancelled, and so on. The type is cheap to
/// clone so a single cause can be fanned out to every reader of an aborted
/// stream.
///
/// # Examples
///
/// ```
/// use hedgerow_transport::Error;
///
/// let cause = Error::transport("connection reset by peer");
/// let unprocessed = Error::unprocessed(cause);
/// assert!(unprocessed.is_unprocessed());
/// ```
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The request is known not to have been transmitted to any server.
    ///
    /// Safe to send again regardless of idempotency.
    #[error("request was not processed by any server")]
    Unprocessed(#[source] Arc<Error>),

    /// A response deadline elapsed before the response arrived.
    #[error("response did not arrive within {timeout:?}")]
    ResponseTimeout {
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The response was cancelled before completion.
    #[error("response has been cancelled")]
    ResponseCancelled,

    /// A stream reader demanded more content than its buffer limit allows.
    #[error("response content exceeded the maximum length of {max_length} bytes")]
    ContentTooLarge {
        /// The configured buffer limit in bytes.
        max_length: usize,
    },

    /// The task scheduler rejected further work because it has shut down.
    #[error("the client's task scheduler has been closed")]
    SchedulerClosed,

    /// A transport-level failure: connection failure, protocol error, or any
    /// other error raised below this layer.
    #[error("transport error: {message}")]
    Transport {
        /// Human-readable description of the failure.
        message: String,
    },
}

impl Error {
    /// Creates a transport-level failure with the given message.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Wraps a cause into an unprocessed-request failure.
    ///
    /// Use when the failure occurred before the request reached the wire,
    /// which makes retrying or hedging safe for any request.
    #[must_use]
    pub fn unprocessed(cause: Error) -> Self {
        Self::Unprocessed(Arc::new(cause))
    }

    /// Returns `true` when the request never reached a server.
    #[must_use]
    pub fn is_unprocessed(&self) -> bool {
        matches!(self, Self::Unprocessed(_))
    }

    /// Returns `true` when a response deadline elapsed.
    #[must_use]
    pub fn is_response_timeout(&self) -> bool {
        matches!(self, Self::ResponseTimeout { .. })
    }

    /// Returns `true` when the response was cancelled.
    #[must_use]
    pub fn is_response_cancelled(&self) -> bool {
        matches!(self, Self::ResponseCancelled)
    }
}
