// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The hedging decorator for unary RPC clients.

use std::sync::Arc;

use hedgerow_transport::{
    ARMERIA_RETRY_COUNT, Client, ClientRequestContext, Result, RpcRequest, RpcResponse,
};
use http::HeaderValue;

use crate::config::HedgingConfig;
use crate::decision::HedgingDecision;
use crate::derive::derive_context;
use crate::engine::{HedgeDriver, execute_with_timeout, prepare_state, run_race};
use crate::mapping::HedgingConfigMapping;
use crate::state::{HedgingState, TimeoutDirective};

/// A decorator that hedges unary RPC requests.
///
/// The RPC flavor evaluates content-aware rules directly against the
/// settled response; no body duplication is involved. A content-free rule
/// used with this client is lifted into content-aware form, with a one-time
/// warning, since the response is then ignored by the rule.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use hedgerow::{HedgingConfig, HedgingRpcClient, HedgingRule};
/// use hedgerow_transport::testing::MockRpcClient;
///
/// let config = HedgingConfig::builder(
///     HedgingRule::on_unprocessed(Duration::from_millis(100)),
///     Duration::from_millis(50),
/// )
/// .build();
///
/// let client = HedgingRpcClient::new(MockRpcClient::new(), config);
/// # let _ = client;
/// ```
pub struct HedgingRpcClient<C> {
    delegate: Arc<C>,
    mapping: Arc<HedgingConfigMapping<RpcRequest, RpcResponse>>,
    hedging_config: Option<HedgingConfig<RpcResponse>>,
}

impl<C> HedgingRpcClient<C>
where
    C: Client<RpcRequest, Response = RpcResponse> + 'static,
{
    /// Creates a hedging client applying the same config to every request.
    #[must_use]
    pub fn new(delegate: C, config: HedgingConfig<RpcResponse>) -> Self {
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
        mapping: HedgingConfigMapping<RpcRequest, RpcResponse>,
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
        config: HedgingConfig<RpcResponse>,
    ) -> impl Fn(C) -> HedgingRpcClient<C> {
        move |delegate| HedgingRpcClient::new(delegate, config.clone())
    }

    /// Returns the singleton config, when this client was built around one.
    #[must_use]
    pub fn hedging_config(&self) -> Option<&HedgingConfig<RpcResponse>> {
        self.hedging_config.as_ref()
    }
}

impl<C> Client<RpcRequest> for HedgingRpcClient<C>
where
    C: Client<RpcRequest, Response = RpcResponse> + 'static,
{
    type Response = RpcResponse;

    async fn execute(&self, ctx: &ClientRequestContext, req: RpcRequest) -> Result<RpcResponse> {
        let config = self.mapping.get(ctx, &req)?;
        let state = prepare_state(ctx, config);
        let driver = Arc::new(RpcHedgeDriver {
            delegate: Arc::clone(&self.delegate),
            state: Arc::clone(&state),
            request: req,
        });
        run_race(ctx, state, driver).await
    }
}

impl<C> std::fmt::Debug for HedgingRpcClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HedgingRpcClient").finish_non_exhaustive()
    }
}

struct RpcHedgeDriver<C> {
    delegate: Arc<C>,
    state: Arc<HedgingState<RpcResponse>>,
    request: RpcRequest,
}

impl<C> HedgeDriver for RpcHedgeDriver<C>
where
    C: Client<RpcRequest, Response = RpcResponse> + 'static,
{
    type Response = RpcResponse;

    fn derive(&self, parent: &ClientRequestContext, index: u32) -> ClientRequestContext {
        let derived = derive_context(parent, None, Some(self.request.clone()), index == 0);
        if index > 0 {
            derived.add_additional_request_header(ARMERIA_RETRY_COUNT, HeaderValue::from(index));
        }
        derived
    }

    async fn run(
        &self,
        derived: ClientRequestContext,
        _index: u32,
        timeout: TimeoutDirective,
    ) -> (Result<RpcResponse>, HedgingDecision) {
        let request = derived.rpc_request().unwrap_or_else(|| self.request.clone());

        let execution = {
            let _entered = derived.push();
            self.delegate.execute(&derived, request)
        };
        let outcome = execute_with_timeout(timeout, execution).await;

        let config = self.state.config();
        let rule = config.rule_lifted_to_content();
        match outcome {
            Ok(response) => {
                let log = derived.log_builder();
                log.end_request();
                if let Some(value) = response.value() {
                    log.response_content(value.clone());
                }

                let decision = rule.should_hedge(&derived, Some(response.clone()), None).await;
                log.end_response();
                (Ok(response), decision)
            }
            Err(cause) => {
                let log = derived.log_builder();
                log.end_request_with(cause.clone());
                log.end_response_with(cause.clone());

                let decision = rule.should_hedge(&derived, None, Some(&cause)).await;
                (Err(cause), decision)
            }
        }
    }
}
