// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hedging rules over attempt outcomes.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use hedgerow_transport::{ClientRequestContext, Error, RequestHeaders, StatusClass};
use http::{Method, StatusCode};

use crate::builder::HedgingRuleBuilder;
use crate::decision::HedgingDecision;

pub(crate) type RuleEval =
    Arc<dyn Fn(ClientRequestContext, Option<Error>) -> BoxFuture<'static, HedgingDecision> + Send + Sync>;

/// Contains a panicking rule evaluation, degrading it to `NEXT` so rule
/// composition can continue.
pub(crate) fn evaluate_guarded(
    make: impl FnOnce() -> BoxFuture<'static, HedgingDecision>,
) -> BoxFuture<'static, HedgingDecision> {
    match std::panic::catch_unwind(AssertUnwindSafe(make)) {
        Ok(future) => async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(decision) => decision,
                Err(_) => {
                    tracing::warn!("a hedging rule panicked while deciding; treating as NEXT");
                    HedgingDecision::next()
                }
            }
        }
        .boxed(),
        Err(_) => {
            tracing::warn!("a hedging rule panicked while deciding; treating as NEXT");
            futures::future::ready(HedgingDecision::next()).boxed()
        }
    }
}

/// Decides, for one completed attempt, whether to keep hedging.
///
/// A rule maps `(context, cause)` to a lazy [`HedgingDecision`]. The cause
/// is `None` when the attempt produced a response; status-based conditions
/// read the response headers from the attempt's request log.
///
/// Rules compose with [`or_else`](Self::or_else): the first rule that does
/// not abstain decides. Rules must be free of side effects and must not
/// modify the context.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use hedgerow::HedgingRule;
///
/// // Hedge 50ms after any unprocessed failure, otherwise give a 503 one
/// // more chance 100ms later.
/// let rule = HedgingRule::on_unprocessed(Duration::from_millis(50)).or_else(
///     HedgingRule::builder()
///         .on_status(|_, status| status.as_u16() == 503)
///         .then_hedge(Duration::from_millis(100)),
/// );
/// assert!(!rule.requires_response_trailers());
/// ```
#[derive(Clone)]
pub struct HedgingRule {
    eval: RuleEval,
    requires_response_trailers: bool,
}

impl HedgingRule {
    /// Creates a rule from an evaluation function.
    pub fn new<F, Fut>(evaluate: F) -> Self
    where
        F: Fn(ClientRequestContext, Option<Error>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HedgingDecision> + Send + 'static,
    {
        Self::with_trailer_requirement(evaluate, false)
    }

    pub(crate) fn with_trailer_requirement<F, Fut>(
        evaluate: F,
        requires_response_trailers: bool,
    ) -> Self
    where
        F: Fn(ClientRequestContext, Option<Error>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HedgingDecision> + Send + 'static,
    {
        Self {
            eval: Arc::new(move |ctx, cause| {
                evaluate_guarded(|| evaluate(ctx, cause).boxed())
            }),
            requires_response_trailers,
        }
    }

    /// Evaluates this rule for one completed attempt.
    pub fn should_hedge(
        &self,
        ctx: &ClientRequestContext,
        cause: Option<&Error>,
    ) -> BoxFuture<'static, HedgingDecision> {
        (self.eval)(ctx.clone(), cause.cloned())
    }

    /// Returns `true` when this rule needs the response trailers before it
    /// can decide.
    #[must_use]
    pub const fn requires_response_trailers(&self) -> bool {
        self.requires_response_trailers
    }

    /// Composes this rule with a fallback: when this rule abstains, `other`
    /// decides.
    #[must_use]
    pub fn or_else(self, other: HedgingRule) -> HedgingRule {
        let requires_response_trailers =
            self.requires_response_trailers || other.requires_response_trailers;
        let first = self.eval;
        let second = other.eval;

        HedgingRule {
            eval: Arc::new(move |ctx, cause| {
                let first_decision = first(ctx.clone(), cause.clone());
                let second = Arc::clone(&second);
                async move {
                    let decision = first_decision.await;
                    if decision.is_next() {
                        second(ctx, cause).await
                    } else {
                        decision
                    }
                }
                .boxed()
            }),
            requires_response_trailers,
        }
    }

    /// Composes the given rules with [`or_else`](Self::or_else), first to
    /// last.
    ///
    /// # Panics
    ///
    /// Panics if `rules` is empty.
    #[must_use]
    pub fn of(rules: impl IntoIterator<Item = HedgingRule>) -> HedgingRule {
        let mut rules = rules.into_iter();
        let first = rules.next().expect("rules can't be empty");
        rules.fold(first, HedgingRule::or_else)
    }

    /// Returns a builder matching every request.
    #[must_use]
    pub fn builder() -> HedgingRuleBuilder {
        HedgingRuleBuilder::new(Arc::new(
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
    pub fn builder_for_methods(methods: impl IntoIterator<Item = Method>) -> HedgingRuleBuilder {
        let methods: Vec<Method> = methods.into_iter().collect();
        assert!(!methods.is_empty(), "methods can't be empty");
        HedgingRuleBuilder::new(Arc::new(
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
    ) -> HedgingRuleBuilder {
        HedgingRuleBuilder::new(Arc::new(request_headers_filter))
    }

    /// The preset used when nothing better is known: hedge idempotent
    /// methods on server errors or exceptions, and any method on an
    /// unprocessed request; otherwise do not hedge.
    #[must_use]
    pub fn failsafe(hedging_delay: Duration) -> HedgingRule {
        HedgingRule::of([
            HedgingRule::builder_for_methods(idempotent_methods())
                .on_server_error_status()
                .on_any_exception()
                .then_hedge(hedging_delay),
            HedgingRule::on_unprocessed(hedging_delay),
        ])
    }

    /// Hedges when the response status belongs to the given class.
    #[must_use]
    pub fn on_status_class(status_class: StatusClass, hedging_delay: Duration) -> HedgingRule {
        Self::builder()
            .on_status_class(status_class)
            .then_hedge(hedging_delay)
    }

    /// Hedges on `5xx` responses.
    #[must_use]
    pub fn on_server_error_status(hedging_delay: Duration) -> HedgingRule {
        Self::builder().on_server_error_status().then_hedge(hedging_delay)
    }

    /// Hedges when the response status matches the given predicate.
    #[must_use]
    pub fn on_status(
        status_filter: impl Fn(&ClientRequestContext, StatusCode) -> bool + Send + Sync + 'static,
        hedging_delay: Duration,
    ) -> HedgingRule {
        Self::builder().on_status(status_filter).then_hedge(hedging_delay)
    }

    /// Hedges when the attempt failed and the cause matches the given
    /// predicate.
    #[must_use]
    pub fn on_exception(
        exception_filter: impl Fn(&ClientRequestContext, &Error) -> bool + Send + Sync + 'static,
        hedging_delay: Duration,
    ) -> HedgingRule {
        Self::builder()
            .on_exception(exception_filter)
            .then_hedge(hedging_delay)
    }

    /// Hedges when the attempt failed, whatever the cause.
    #[must_use]
    pub fn on_any_exception(hedging_delay: Duration) -> HedgingRule {
        Self::builder().on_any_exception().then_hedge(hedging_delay)
    }

    /// Hedges when the request never reached a server.
    #[must_use]
    pub fn on_unprocessed(hedging_delay: Duration) -> HedgingRule {
        Self::builder().on_unprocessed().then_hedge(hedging_delay)
    }

    /// Hedges when the attempt timed out.
    #[must_use]
    pub fn on_timeout_exception(hedging_delay: Duration) -> HedgingRule {
        Self::builder().on_timeout_exception().then_hedge(hedging_delay)
    }
}

impl std::fmt::Debug for HedgingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HedgingRule")
            .field("requires_response_trailers", &self.requires_response_trailers)
            .finish_non_exhaustive()
    }
}

/// The methods a request can safely be issued more than once for.
pub(crate) fn idempotent_methods() -> [Method; 6] {
    [
        Method::GET,
        Method::HEAD,
        Method::OPTIONS,
        Method::TRACE,
        Method::PUT,
        Method::DELETE,
    ]
}
