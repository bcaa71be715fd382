// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builders for hedging rules.
//!
//! A builder collects conditions (status classes, status predicates,
//! exception classes and predicates, a response predicate for content-aware
//! rules) gated on a request-headers predicate, and produces a rule with
//! one of the terminal calls [`then_hedge`][HedgingRuleBuilder::then_hedge]
//! or [`then_no_hedge`][HedgingRuleBuilder::then_no_hedge].

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use hedgerow_transport::{ClientRequestContext, Error, RequestHeaders, StatusClass};
use http::StatusCode;

use crate::decision::HedgingDecision;
use crate::rule::HedgingRule;
use crate::rule_with_content::{HedgedResponse, HedgingRuleWithContent};

pub(crate) type RequestHeadersFilter =
    Arc<dyn Fn(&ClientRequestContext, &RequestHeaders) -> bool + Send + Sync>;
type StatusFilter = Arc<dyn Fn(&ClientRequestContext, StatusCode) -> bool + Send + Sync>;
type ExceptionFilter = Arc<dyn Fn(&ClientRequestContext, &Error) -> bool + Send + Sync>;
type ResponseFilter<O> =
    Arc<dyn Fn(ClientRequestContext, O) -> BoxFuture<'static, bool> + Send + Sync>;

/// The conditions shared by both builder flavors.
struct RuleFilter {
    request_headers_filter: RequestHeadersFilter,
    status_filters: Vec<StatusFilter>,
    exception_filters: Vec<ExceptionFilter>,
    on_unprocessed: bool,
    on_timeout: bool,
    on_any_exception: bool,
}

impl RuleFilter {
    fn new(request_headers_filter: RequestHeadersFilter) -> Self {
        Self {
            request_headers_filter,
            status_filters: Vec::new(),
            exception_filters: Vec::new(),
            on_unprocessed: false,
            on_timeout: false,
            on_any_exception: false,
        }
    }

    fn has_condition(&self) -> bool {
        !self.status_filters.is_empty()
            || !self.exception_filters.is_empty()
            || self.on_unprocessed
            || self.on_timeout
            || self.on_any_exception
    }

    /// The request-headers gate. Requests without HTTP headers (pure RPC
    /// contexts) pass.
    fn gate(&self, ctx: &ClientRequestContext) -> bool {
        match ctx.request_headers() {
            Some(headers) => (self.request_headers_filter)(ctx, &headers),
            None => true,
        }
    }

    fn matches_cause(&self, ctx: &ClientRequestContext, cause: &Error) -> bool {
        self.on_any_exception
            || (self.on_unprocessed && cause.is_unprocessed())
            || (self.on_timeout && cause.is_response_timeout())
            || self.exception_filters.iter().any(|filter| filter(ctx, cause))
    }

    /// Status conditions read the response headers from the attempt's log.
    fn matches_response(&self, ctx: &ClientRequestContext) -> bool {
        let Some(status) = ctx.log().response_status() else {
            return false;
        };
        self.status_filters.iter().any(|filter| filter(ctx, status))
    }
}

/// Builds a [`HedgingRule`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use hedgerow::HedgingRule;
///
/// let rule = HedgingRule::builder()
///     .on_server_error_status()
///     .on_unprocessed()
///     .then_hedge(Duration::from_millis(50));
/// # let _ = rule;
/// ```
pub struct HedgingRuleBuilder {
    filter: RuleFilter,
    requires_response_trailers: bool,
}

impl HedgingRuleBuilder {
    pub(crate) fn new(request_headers_filter: RequestHeadersFilter) -> Self {
        Self {
            filter: RuleFilter::new(request_headers_filter),
            requires_response_trailers: false,
        }
    }

    /// Adds a condition on the response status class.
    #[must_use]
    pub fn on_status_class(mut self, status_class: StatusClass) -> Self {
        self.filter
            .status_filters
            .push(Arc::new(move |_, status| status_class.contains(status)));
        self
    }

    /// Adds a condition on any of the given response status classes.
    #[must_use]
    pub fn on_status_classes(mut self, status_classes: impl IntoIterator<Item = StatusClass>) -> Self {
        let status_classes: Vec<_> = status_classes.into_iter().collect();
        self.filter
            .status_filters
            .push(Arc::new(move |_, status| {
                status_classes.iter().any(|class| class.contains(status))
            }));
        self
    }

    /// Adds a condition on `5xx` response statuses.
    #[must_use]
    pub fn on_server_error_status(self) -> Self {
        self.on_status_class(StatusClass::ServerError)
    }

    /// Adds a condition on the response status.
    #[must_use]
    pub fn on_status(
        mut self,
        status_filter: impl Fn(&ClientRequestContext, StatusCode) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter.status_filters.push(Arc::new(status_filter));
        self
    }

    /// Adds a condition on any of the given response statuses.
    #[must_use]
    pub fn on_statuses(mut self, statuses: impl IntoIterator<Item = StatusCode>) -> Self {
        let statuses: Vec<_> = statuses.into_iter().collect();
        self.filter
            .status_filters
            .push(Arc::new(move |_, status| statuses.contains(&status)));
        self
    }

    /// Adds a condition on the failure cause.
    #[must_use]
    pub fn on_exception(
        mut self,
        exception_filter: impl Fn(&ClientRequestContext, &Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter.exception_filters.push(Arc::new(exception_filter));
        self
    }

    /// Adds a condition matching any failure cause.
    #[must_use]
    pub fn on_any_exception(mut self) -> Self {
        self.filter.on_any_exception = true;
        self
    }

    /// Adds a condition matching unprocessed requests.
    #[must_use]
    pub fn on_unprocessed(mut self) -> Self {
        self.filter.on_unprocessed = true;
        self
    }

    /// Adds a condition matching attempt timeouts.
    #[must_use]
    pub fn on_timeout_exception(mut self) -> Self {
        self.filter.on_timeout = true;
        self
    }

    /// Marks the built rule as needing the response trailers before it
    /// decides.
    #[must_use]
    pub fn requires_response_trailers(mut self) -> Self {
        self.requires_response_trailers = true;
        self
    }

    /// Builds a rule that hedges after `hedging_delay` when the conditions
    /// match.
    ///
    /// # Panics
    ///
    /// Panics if no condition has been set.
    #[must_use]
    pub fn then_hedge(self, hedging_delay: Duration) -> HedgingRule {
        assert!(
            self.filter.has_condition(),
            "should set at least one condition if hedging should continue"
        );
        self.build(HedgingDecision::hedge(hedging_delay))
    }

    /// Builds a rule that stops hedging when the conditions match.
    #[must_use]
    pub fn then_no_hedge(self) -> HedgingRule {
        self.build(HedgingDecision::no_hedge())
    }

    fn build(self, decision: HedgingDecision) -> HedgingRule {
        let filter = Arc::new(self.filter);
        HedgingRule::with_trailer_requirement(
            move |ctx, cause| {
                let matched = filter.gate(&ctx)
                    && match &cause {
                        Some(cause) => filter.matches_cause(&ctx, cause),
                        None => filter.matches_response(&ctx),
                    };
                std::future::ready(if matched {
                    decision
                } else {
                    HedgingDecision::next()
                })
            },
            self.requires_response_trailers,
        )
    }
}

impl std::fmt::Debug for HedgingRuleBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HedgingRuleBuilder").finish_non_exhaustive()
    }
}

/// Builds a [`HedgingRuleWithContent`].
pub struct HedgingRuleWithContentBuilder<O> {
    filter: RuleFilter,
    response_filter: Option<ResponseFilter<O>>,
    requires_response_trailers: bool,
}

impl<O: HedgedResponse> HedgingRuleWithContentBuilder<O> {
    pub(crate) fn new(request_headers_filter: RequestHeadersFilter) -> Self {
        Self {
            filter: RuleFilter::new(request_headers_filter),
            response_filter: None,
            requires_response_trailers: false,
        }
    }

    /// Adds a condition on the response content.
    ///
    /// The predicate receives its own view of the response and may consume
    /// the body.
    #[must_use]
    pub fn on_response<F, Fut>(mut self, hedging_function: F) -> Self
    where
        F: Fn(ClientRequestContext, O) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.response_filter = Some(Arc::new(move |ctx, response| {
            hedging_function(ctx, response).boxed()
        }));
        self
    }

    /// Adds a condition on the response status class.
    #[must_use]
    pub fn on_status_class(mut self, status_class: StatusClass) -> Self {
        self.filter
            .status_filters
            .push(Arc::new(move |_, status| status_class.contains(status)));
        self
    }

    /// Adds a condition on `5xx` response statuses.
    #[must_use]
    pub fn on_server_error_status(self) -> Self {
        self.on_status_class(StatusClass::ServerError)
    }

    /// Adds a condition on the response status.
    #[must_use]
    pub fn on_status(
        mut self,
        status_filter: impl Fn(&ClientRequestContext, StatusCode) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter.status_filters.push(Arc::new(status_filter));
        self
    }

    /// Adds a condition on the failure cause.
    #[must_use]
    pub fn on_exception(
        mut self,
        exception_filter: impl Fn(&ClientRequestContext, &Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter.exception_filters.push(Arc::new(exception_filter));
        self
    }

    /// Adds a condition matching any failure cause.
    #[must_use]
    pub fn on_any_exception(mut self) -> Self {
        self.filter.on_any_exception = true;
        self
    }

    /// Adds a condition matching unprocessed requests.
    #[must_use]
    pub fn on_unprocessed(mut self) -> Self {
        self.filter.on_unprocessed = true;
        self
    }

    /// Adds a condition matching attempt timeouts.
    #[must_use]
    pub fn on_timeout_exception(mut self) -> Self {
        self.filter.on_timeout = true;
        self
    }

    /// Marks the built rule as needing the response trailers before it
    /// decides.
    #[must_use]
    pub fn requires_response_trailers(mut self) -> Self {
        self.requires_response_trailers = true;
        self
    }

    /// Builds a rule that hedges after `hedging_delay` when the conditions
    /// match.
    ///
    /// # Panics
    ///
    /// Panics if no condition has been set.
    #[must_use]
    pub fn then_hedge(self, hedging_delay: Duration) -> HedgingRuleWithContent<O> {
        assert!(
            self.filter.has_condition() || self.response_filter.is_some(),
            "should set at least one condition if hedging should continue"
        );
        self.build(HedgingDecision::hedge(hedging_delay))
    }

    /// Builds a rule that stops hedging when the conditions match.
    #[must_use]
    pub fn then_no_hedge(self) -> HedgingRuleWithContent<O> {
        self.build(HedgingDecision::no_hedge())
    }

    fn build(self, decision: HedgingDecision) -> HedgingRuleWithContent<O> {
        let filter = Arc::new(self.filter);
        let response_filter = self.response_filter;

        HedgingRuleWithContent::with_trailer_requirement(
            move |ctx, response: Option<O>, cause| {
                let filter = Arc::clone(&filter);
                let response_filter = response_filter.clone();
                async move {
                    if !filter.gate(&ctx) {
                        return HedgingDecision::next();
                    }
                    if let Some(cause) = &cause {
                        return if filter.matches_cause(&ctx, cause) {
                            decision
                        } else {
                            HedgingDecision::next()
                        };
                    }
                    if filter.matches_response(&ctx) {
                        return decision;
                    }
                    if let (Some(response_filter), Some(response)) = (response_filter, response) {
                        if response_filter(ctx, response).await {
                            return decision;
                        }
                    }
                    HedgingDecision::next()
                }
            },
            self.requires_response_trailers,
        )
    }
}

impl<O> std::fmt::Debug for HedgingRuleWithContentBuilder<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HedgingRuleWithContentBuilder")
            .finish_non_exhaustive()
    }
}
