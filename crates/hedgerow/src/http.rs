// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The hedging decorator for streamed HTTP clients.

use std::sync::Arc;

use hedgerow_transport::{
    ARMERIA_RETRY_COUNT, Client, ClientRequestContext, HttpRequest, HttpResponse, Result,
};
use http::HeaderValue;

use crate::config::HedgingConfig;
use crate::decision::HedgingDecision;
use crate::derive::derive_context;
use crate::engine::{HedgeDriver, execute_with_timeout, prepare_state, run_race};
use crate::mapping::HedgingConfigMapping;
use crate::state::{HedgingState, TimeoutDirective};

/// A decorator that hedges streamed HTTP requests.
///
/// Given an outbound request, the client races up to
/// `max_total_attempts` speculative copies against (typically) different
/// endpoints of the same group, returns the first acceptable response, and
/// cancels the rest.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use hedgerow::{HedgingConfig, HedgingHttpClient, HedgingRule};
/// use hedgerow_transport::testing::MockClient;
///
/// let config = HedgingConfig::builder(
///     HedgingRule::on_unprocessed(Duration::from_millis(50)),
///     Duration::from_millis(50),
/// )
/// .max_total_attempts(3)
/// .build();
///
/// let client = HedgingHttpClient::new(MockClient::new(), config);
/// # let _ = client;
/// ```
pub struct HedgingHttpClient<C> {
    delegate: Arc<C>,
    mapping: Arc<HedgingConfigMapping<HttpRequest, HttpResponse>>,
    hedging_config: Option<HedgingConfig<HttpResponse>>,
}

impl<C> HedgingHttpClient<C>
where
    C: Client<HttpRequest, Response = HttpResponse> + 'static,
{
    /// Creates a hedging client applying the same config to every request.
    #[must_use]
    pub fn new(delegate: C, config: HedgingConfig<HttpResponse>) -> Self {
        Self {
            delegate: Arc::new(delegate),
            mapping: Arc::new(HedgingConfigMapping::of(config.clone())),
            hedging_config: Some(config),
        }
    }

    /// Creates a hedging client resolving a config per request.
    #[must_use]
    pub fn with_mapping(
        delegate: C,
        mapping: HedgingConfigMapping<HttpRequest, HttpResponse>,
    ) -> Self {
        Self {
            delegate: Arc::new(delegate),
            mapping: Arc::new(mapping),
            hedging_config: None,
        }
    }

    /// Returns a decorator function applying the given config.
    #[must_use]
    pub fn new_decorator(
        config: HedgingConfig<HttpResponse>,
    ) -> impl Fn(C) -> HedgingHttpClient<C> {
        move |delegate| HedgingHttpClient::new(delegate, config.clone())
    }

    /// Returns a decorator function applying the given mapping.
    #[must_use]
    pub fn new_decorator_with_mapping(
        mapping: HedgingConfigMapping<HttpRequest, HttpResponse>,
    ) -> impl Fn(C) -> HedgingHttpClient<C> {
        let mapping = Arc::new(mapping);
        move |delegate| HedgingHttpClient {
            delegate: Arc::new(delegate),
            mapping: Arc::clone(&mapping),
            hedging_config: None,
        }
    }

    /// Returns the singleton config, when this client was built around one.
    #[must_use]
    pub fn hedging_config(&self) -> Option<&HedgingConfig<HttpResponse>> {
        self.hedging_config.as_ref()
    }
}

impl<C> Client<HttpRequest> for HedgingHttpClient<C>
where
    C: Client<HttpRequest, Response = HttpResponse> + 'static,
{
    type Response = HttpResponse;

    async fn execute(&self, ctx: &ClientRequestContext, req: HttpRequest) -> Result<HttpResponse> {
        let config = self.mapping.get(ctx, &req)?;
        let state = prepare_state(ctx, config);
        let driver = Arc::new(HttpHedgeDriver {
            delegate: Arc::clone(&self.delegate),
            state: Arc::clone(&state),
            request: req,
        });
        run_race(ctx, state, driver).await
    }
}

impl<C> std::fmt::Debug for HedgingHttpClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HedgingHttpClient").finish_non_exhaustive()
    }
}

struct HttpHedgeDriver<C> {
    delegate: Arc<C>,
    state: Arc<HedgingState<HttpResponse>>,
    request: HttpRequest,
}

impl<C> HttpHedgeDriver<C>
where
    C: Client<HttpRequest, Response = HttpResponse> + 'static,
{
    async fn evaluate(
        &self,
        derived: &ClientRequestContext,
        outcome: Result<HttpResponse>,
    ) -> (Result<HttpResponse>, HedgingDecision) {
        let config = self.state.config();
        match outcome {
            Ok(response) => {
                let log = derived.log_builder();
                log.request_first_bytes_transferred();
                log.end_request();
                log.response_headers(response.status(), response.headers().clone());

                if config.requires_response_trailers() {
                    // The rule cannot decide before the trailers exist.
                    let _ = response.when_complete().await;
                    if let Some(trailers) = response.trailers() {
                        log.response_trailers(trailers);
                    }
                }

                if let Some(rule) = config.hedging_rule_with_content() {
                    let duplicator = response.to_duplicator(config.max_content_length());
                    let rule_view = duplicator.duplicate();
                    let kept = duplicator.duplicate();
                    duplicator.close();

                    let decision = rule.should_hedge(derived, Some(rule_view), None).await;
                    log.end_response();
                    (Ok(kept), decision)
                } else {
                    let rule = config.content_rule_lowered();
                    let decision = rule.should_hedge(derived, None).await;
                    log.end_response();
                    (Ok(response), decision)
                }
            }
            Err(cause) => {
                let log = derived.log_builder();
                log.end_request_with(cause.clone());
                log.end_response_with(cause.clone());

                let decision = match config.hedging_rule_with_content() {
                    Some(rule) => rule.should_hedge(derived, None, Some(&cause)).await,
                    None => {
                        config
                            .content_rule_lowered()
                            .should_hedge(derived, Some(&cause))
                            .await
                    }
                };
                (Err(cause), decision)
            }
        }
    }
}

impl<C> HedgeDriver for HttpHedgeDriver<C>
where
    C: Client<HttpRequest, Response = HttpResponse> + 'static,
{
    type Response = HttpResponse;

    fn derive(&self, parent: &ClientRequestContext, index: u32) -> ClientRequestContext {
        let mut request = self.request.clone();
        if index > 0 {
            request
                .headers_mut()
                .set(ARMERIA_RETRY_COUNT, HeaderValue::from(index));
        }
        derive_context(parent, Some(request), None, index == 0)
    }

    async fn run(
        &self,
        derived: ClientRequestContext,
        _index: u32,
        timeout: TimeoutDirective,
    ) -> (Result<HttpResponse>, HedgingDecision) {
        let request = derived
            .http_request()
            .unwrap_or_else(|| self.request.clone());

        let execution = {
            let _entered = derived.push();
            self.delegate.execute(&derived, request)
        };
        let outcome = execute_with_timeout(timeout, execution).await;
        self.evaluate(&derived, outcome).await
    }
}
