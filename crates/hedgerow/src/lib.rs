// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(docsrs, feature(doc_cfg))]

//! Rule-driven request hedging for RPC/HTTP clients.
//!
//! # Why
//!
//! Tail latency is dominated by the slowest replica a request happens to
//! hit. Hedging reduces it by speculatively issuing duplicate copies of an
//! in-flight request against different endpoints of the same logical
//! service: the first acceptable response wins, and the remaining copies
//! are cancelled.
//!
//! # Core Types
//!
//! - [`HedgingRule`] / [`HedgingRuleWithContent`]: composable predicates
//!   deciding, per completed attempt, whether to hedge again
//!   ([`HedgingDecision`]).
//! - [`HedgingConfig`]: the immutable policy bundle: rule, attempt cap,
//!   per-attempt timeout, initial hedging delay.
//! - [`HedgingConfigMapping`]: per-request config resolution, singleton or
//!   keyed.
//! - [`HedgingHttpClient`] / [`HedgingRpcClient`]: the decorators that run
//!   the attempt race over a delegate
//!   [`Client`][hedgerow_transport::Client].
//!
//! # Examples
//!
//! ```no_run
//! use std::time::Duration;
//! use hedgerow::{HedgingConfig, HedgingHttpClient, HedgingRule};
//! use hedgerow_transport::testing::MockClient;
//!
//! // Hedge unprocessed requests after 50ms, at most three attempts total.
//! let config = HedgingConfig::builder(
//!     HedgingRule::on_unprocessed(Duration::from_millis(50)),
//!     Duration::from_millis(50),
//! )
//! .max_total_attempts(3)
//! .response_timeout_for_each_attempt(Duration::from_millis(500))
//! .build();
//!
//! let client = HedgingHttpClient::new(MockClient::new(), config);
//! # let _ = client;
//! ```
//!
//! The engine guarantees that exactly one response reaches the caller, that
//! no more than the configured number of attempts is started, that losing
//! attempts are cancelled and their streamed bodies aborted, and that each
//! attempt's request log is attached as a child of the caller's log.

mod builder;
mod config;
mod decision;
mod derive;
mod engine;
mod http;
mod mapping;
mod rpc;
mod rule;
mod rule_with_content;
mod state;

pub use builder::{HedgingRuleBuilder, HedgingRuleWithContentBuilder};
pub use config::{
    DEFAULT_MAX_TOTAL_ATTEMPTS, DEFAULT_RESPONSE_TIMEOUT_FOR_EACH_ATTEMPT, HedgingConfig,
    HedgingConfigBuilder,
};
pub use decision::HedgingDecision;
pub use engine::total_attempts;
pub use self::http::HedgingHttpClient;
pub use mapping::HedgingConfigMapping;
pub use rpc::HedgingRpcClient;
pub use rule::HedgingRule;
pub use rule_with_content::{ForkedResponse, HedgedResponse, HedgingRuleWithContent};

pub use hedgerow_transport::{ARMERIA_RETRY_COUNT, StatusClass};
