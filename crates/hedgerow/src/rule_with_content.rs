// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Content-aware hedging rules.
//!
//! A [`HedgingRuleWithContent`] additionally receives the attempt's response
//! so it can decide based on the body. Composing two content-aware rules
//! over a streamed response forks the body through a duplicator so each side
//! reads an independent view; the duplication is released once the composed
//! decision is known.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use hedgerow_transport::{
    ClientRequestContext, Error, HttpResponse, RequestHeaders, RpcResponse, StatusClass,
};
use http::{Method, StatusCode};

use crate::builder::HedgingRuleWithContentBuilder;
use crate::decision::HedgingDecision;
use crate::rule::{HedgingRule, evaluate_guarded};

/// A response type hedging rules can be composed over.
///
/// Implementations provide the two hooks the engine and rule composition
/// need: forking a response into independent views, and aborting a losing
/// response.
pub trait HedgedResponse: Send + Sized + 'static {
    /// Splits this response into `views` independently consumable views.
    fn fork(self, views: usize) -> ForkedResponse<Self>;

    /// Aborts this response with the given cause.
    fn abort(&self, cause: Error);
}

/// The result of forking a response for composition.
pub struct ForkedResponse<O> {
    /// One view per requested reader.
    pub views: Vec<O>,
    /// Releases duplication resources; call once the composed decision is
    /// known.
    pub finisher: Option<Box<dyn FnOnce() + Send>>,
}

impl HedgedResponse for HttpResponse {
    fn fork(self, views: usize) -> ForkedResponse<Self> {
        let duplicator = self.to_duplicator(usize::MAX);
        let forked = (0..views).map(|_| duplicator.duplicate()).collect();
        duplicator.close();
        ForkedResponse {
            views: forked,
            finisher: Some(Box::new(move || {
                duplicator.abort(Error::ResponseCancelled);
            })),
        }
    }

    fn abort(&self, cause: Error) {
        HttpResponse::abort(self, cause);
    }
}

impl HedgedResponse for RpcResponse {
    fn fork(self, views: usize) -> ForkedResponse<Self> {
        ForkedResponse {
            views: std::iter::repeat_n(self, views).collect(),
            finisher: None,
        }
    }

    fn abort(&self, _cause: Error) {
        // A unary response is already settled; there is nothing to release.
    }
}

type ContentRuleEval<O> = Arc<
    dyn Fn(ClientRequestContext, Option<O>, Option<Error>) -> BoxFuture<'static, HedgingDecision>
        + Send
        + Sync,
>;

/// Decides, for one completed attempt, whether to keep hedging, with
/// access to the response content.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use hedgerow::HedgingRuleWithContent;
/// use hedgerow_transport::HttpResponse;
///
/// // Hedge when the body reports a degraded replica.
/// let rule = HedgingRuleWithContent::<HttpResponse>::on_response(
///     |_, response| async move {
///         match response.aggregate().await {
///             Ok(aggregated) => aggregated.content_utf8().contains("degraded"),
///             Err(_) => false,
///         }
///     },
///     Duration::from_millis(50),
/// );
/// assert!(!rule.requires_response_trailers());
/// ```
pub struct HedgingRuleWithContent<O> {
    eval: ContentRuleEval<O>,
    requires_response_trailers: bool,
}

impl<O> Clone for HedgingRuleWithContent<O> {
    fn clone(&self) -> Self {
        Self {
            eval: Arc::clone(&self.eval),
            requires_response_trailers: self.requires_response_trailers,
        }
    }
}

impl<O> HedgingRuleWithContent<O> {
    /// Returns `true` when this rule needs the response trailers before it
    /// can decide.
    #[must_use]
    pub const fn requires_response_trailers(&self) -> bool {
        self.requires_response_trailers
    }
}

impl<O: HedgedResponse> HedgingRuleWithContent<O> {
    /// Creates a rule from an evaluation function.
    pub fn new<F, Fut>(evaluate: F) -> Self
    where
        F: Fn(ClientRequestContext, Option<O>, Option<Error>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HedgingDecision> + Send + 'static,
    {
        Self::with_trailer_requirement(evaluate, false)
    }

    pub(crate) fn with_trailer_requirement<F, Fut>(
        evaluate: F,
        requires_response_trailers: bool,
    ) -> Self
    where
        F: Fn(ClientRequestContext, Option<O>, Option<Error>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HedgingDecision> + Send + 'static,
    {
        Self {
            eval: Arc::new(move |ctx, response, cause| {
                evaluate_guarded(|| evaluate(ctx, response, cause).boxed())
            }),
            requires_response_trailers,
        }
    }

    /// Evaluates this rule for one completed attempt.
    pub fn should_hedge(
        &self,
        ctx: &ClientRequestContext,
        response: Option<O>,
        cause: Option<&Error>,
    ) -> BoxFuture<'static, HedgingDecision> {
        (self.eval)(ctx.clone(), response, cause.cloned())
    }

    /// Composes this rule with a fallback: when this rule abstains, `other`
    /// decides.
    ///
    /// Over a streamed response both sides read independent views of the
    /// body; the duplication is released once the composed decision is
    /// known.
    #[must_use]
    pub fn or_else(self, other: HedgingRuleWithContent<O>) -> HedgingRuleWithContent<O> {
        let requires_response_trailers =
            self.requires_response_trailers || other.requires_response_trailers;
        let first = self.eval;
        let second = other.eval;

        HedgingRuleWithContent {
            eval: Arc::new(move |ctx, response, cause| {
                let second = Arc::clone(&second);
                match response {
                    Some(response) => {
                        let ForkedResponse {
                            mut views,
                            finisher,
                        } = response.fork(2);
                        let second_view = views.pop();
                        let first_view = views.pop();
                        let first_decision = first(ctx.clone(), first_view, cause.clone());
                        async move {
                            let decision = first_decision.await;
                            let decision = if decision.is_next() {
                                second(ctx, second_view, cause).await
                            } else {
                                decision
                            };
                            if let Some(finish) = finisher {
                                finish();
                            }
                            decision
                        }
                        .boxed()
                    }
                    None => {
                        let first_decision = first(ctx.clone(), None, cause.clone());
                        async move {
                            let decision = first_decision.await;
                            if decision.is_next() {
                                second(ctx, None, cause).await
                            } else {
                                decision
                            }
                        }
                        .boxed()
                    }
                }
            }),
            requires_response_trailers,
        }
    }

    /// Composes this rule with a content-free fallback.
    #[must_use]
    pub fn or_else_rule(self, other: HedgingRule) -> HedgingRuleWithContent<O> {
        self.or_else(Self::from_rule(other))
    }

    /// Lifts a content-free rule into content-aware form; the response is
    /// ignored.
    #[must_use]
    pub fn from_rule(rule: HedgingRule) -> HedgingRuleWithContent<O> {
        let requires_response_trailers = rule.requires_response_trailers();
        HedgingRuleWithContent {
            eval: Arc::new(move |ctx, _response, cause| rule.should_hedge(&ctx, cause.as_ref())),
            requires_response_trailers,
        }
    }

    /// Lowers this rule into content-free form; it is evaluated without a
    /// response.
    #[must_use]
    pub fn into_rule(self) -> HedgingRule {
        let requires_response_trailers = self.requires_response_trailers;
        let eval = self.eval;
        HedgingRule::with_trailer_requirement(
            move |ctx, cause| eval(ctx, None, cause),
            requires_response_trailers,
        )
    }

    /// Composes the given rules with [`or_else`](Self::or_else), first to
    /// last.
    ///
    /// # Panics
    ///
    /// Panics if `rules` is empty.
    #[must_use]
    pub fn of(rules: impl IntoIterator<Item = HedgingRuleWithContent<O>>) -> HedgingRuleWithContent<O> {
        let mut rules = rules.into_iter();
        let first = rules.next().expect("rules can't be empty");
        rules.fold(first, HedgingRuleWithContent::or_else)
    }

    /// Returns a builder matching every request.
    #[must_use]
    pub fn builder() -> HedgingRuleWithContentBuilder<O> {
        HedgingRuleWithContentBuilder::new(Arc::new(
            |_: &ClientRequestContext, _: &RequestHeaders| true,
        ))
    }

    /// Returns a builder matching only requests with one of the given
    /// methods.
    ///
    /// # Panics
    ///
    /// Panics if `methods` is empty.
    #[must_use]
    pub fn builder_for_methods(
        methods: impl IntoIterator<Item = Method>,
    ) -> HedgingRuleWithContentBuilder<O> {
        let methods: Vec<Method> = methods.into_iter().collect();
        assert!(!methods.is_empty(), "methods can't be empty");
        HedgingRuleWithContentBuilder::new(Arc::new(
            move |_: &ClientRequestContext, headers: &RequestHeaders| {
                methods.contains(headers.method())
            },
        ))
    }

    /// Returns a builder gated on the given request-headers predicate.
    #[must_use]
    pub fn builder_with(
        request_headers_filter: impl Fn(&ClientRequestContext, &RequestHeaders) -> bool
        + Send
        + Sync
        + 'static,
    ) -> HedgingRuleWithContentBuilder<O> {
        HedgingRuleWithContentBuilder::new(Arc::new(request_headers_filter))
    }

    /// Hedges when the response matches the given asynchronous predicate.
    #[must_use]
    pub fn on_response<F, Fut>(hedging_function: F, hedging_delay: Duration) -> Self
    where
        F: Fn(ClientRequestContext, O) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self::builder()
            .on_response(hedging_function)
            .then_hedge(hedging_delay)
    }

    /// Hedges when the response status belongs to the given class.
    #[must_use]
    pub fn on_status_class(status_class: StatusClass, hedging_delay: Duration) -> Self {
        Self::builder()
            .on_status_class(status_class)
            .then_hedge(hedging_delay)
    }

    /// Hedges on `5xx` responses.
    #[must_use]
    pub fn on_server_error_status(hedging_delay: Duration) -> Self {
        Self::builder().on_server_error_status().then_hedge(hedging_delay)
    }

    /// Hedges when the response status matches the given predicate.
    #[must_use]
    pub fn on_status(
        status_filter: impl Fn(&ClientRequestContext, StatusCode) -> bool + Send + Sync + 'static,
        hedging_delay: Duration,
    ) -> Self {
        Self::builder().on_status(status_filter).then_hedge(hedging_delay)
    }

    /// Hedges when the attempt failed and the cause matches the given
    /// predicate.
    #[must_use]
    pub fn on_exception(
        exception_filter: impl Fn(&ClientRequestContext, &Error) -> bool + Send + Sync + 'static,
        hedging_delay: Duration,
    ) -> Self {
        Self::builder()
            .on_exception(exception_filter)
            .then_hedge(hedging_delay)
    }

    /// Hedges when the request never reached a server.
    #[must_use]
    pub fn on_unprocessed(hedging_delay: Duration) -> Self {
        Self::builder().on_unprocessed().then_hedge(hedging_delay)
    }
}

impl<O> std::fmt::Debug for HedgingRuleWithContent<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HedgingRuleWithContent")
            .field("requires_response_trailers", &self.requires_response_trailers)
            .finish_non_exhaustive()
    }
}
