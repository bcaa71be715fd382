// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Destination endpoints and endpoint groups.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A single destination a request can be sent to.
///
/// # Examples
///
/// ```
/// use hedgerow_transport::Endpoint;
///
/// let endpoint = Endpoint::of("10.0.0.1", 8080);
/// assert_eq!(endpoint.to_string(), "10.0.0.1:8080");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates a new endpoint from a host and port.
    #[must_use]
    pub fn of(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the host name of this endpoint.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port of this endpoint.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A pool of candidate endpoints for a logical service.
///
/// Selection via [`select_now`](Self::select_now) is synchronous and
/// non-blocking: each call returns the next endpoint in round-robin order.
/// Hedged attempts use this to land consecutive copies of a request on
/// different members of the pool.
///
/// # Examples
///
/// ```
/// use hedgerow_transport::{Endpoint, EndpointGroup};
///
/// let group = EndpointGroup::of([
///     Endpoint::of("s1", 80),
///     Endpoint::of("s2", 80),
/// ]);
/// assert_eq!(group.select_now().host(), "s1");
/// assert_eq!(group.select_now().host(), "s2");
/// assert_eq!(group.select_now().host(), "s1");
/// ```
#[derive(Debug)]
pub struct EndpointGroup {
    endpoints: Vec<Endpoint>,
    next: AtomicUsize,
}

impl EndpointGroup {
    /// Creates a new endpoint group from the given endpoints.
    ///
    /// # Panics
    ///
    /// Panics if `endpoints` is empty.
    #[must_use]
    pub fn of(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let endpoints: Vec<_> = endpoints.into_iter().collect();
        assert!(!endpoints.is_empty(), "endpoints can't be empty");

        Self {
            endpoints,
            next: AtomicUsize::new(0),
        }
    }

    /// Selects the next endpoint without blocking.
    #[must_use]
    pub fn select_now(&self) -> Endpoint {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.endpoints[index % self.endpoints.len()].clone()
    }

    /// Returns all endpoints in this group.
    #[must_use]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }
}
