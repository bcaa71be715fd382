// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The delegate client trait.

use crate::context::ClientRequestContext;
use crate::error::Result;

/// A client that sends one request and yields one response.
///
/// This is the seam decorators wrap: a decorator implements `Client` itself
/// and forwards, possibly more than once, to the delegate it was built
/// around. Implementations must be cheap to call concurrently; one client
/// instance serves many requests in flight at the same time.
///
/// # Examples
///
/// ```
/// use http::{Method, StatusCode};
/// use hedgerow_transport::{Client, ClientRequestContext, HttpRequest, HttpResponse, Result};
///
/// struct AlwaysOk;
///
/// impl Client<HttpRequest> for AlwaysOk {
///     type Response = HttpResponse;
///
///     async fn execute(
///         &self,
///         _ctx: &ClientRequestContext,
///         _req: HttpRequest,
///     ) -> Result<HttpResponse> {
///         Ok(HttpResponse::of(StatusCode::OK))
///     }
/// }
/// ```
pub trait Client<Req>: Send + Sync {
    /// The response type this client yields.
    type Response: Send + 'static;

    /// Executes the request in the given context.
    fn execute(
        &self,
        ctx: &ClientRequestContext,
        req: Req,
    ) -> impl Future<Output = Result<Self::Response>> + Send;
}

impl<Req, C> Client<Req> for std::sync::Arc<C>
where
    C: Client<Req> + ?Sized,
    Req: Send,
{
    type Response = C::Response;

    async fn execute(&self, ctx: &ClientRequestContext, req: Req) -> Result<Self::Response> {
        (**self).execute(ctx, req).await
    }
}
