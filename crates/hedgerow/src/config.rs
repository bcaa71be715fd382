// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The immutable hedging policy bundle.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::rule::HedgingRule;
use crate::rule_with_content::{HedgedResponse, HedgingRuleWithContent};

/// The default cap on total attempts per outer request.
pub const DEFAULT_MAX_TOTAL_ATTEMPTS: u32 = 10;

/// The default response timeout applied to each attempt.
pub const DEFAULT_RESPONSE_TIMEOUT_FOR_EACH_ATTEMPT: Duration = Duration::from_secs(15);

enum RuleKind<O> {
    Plain(HedgingRule),
    WithContent(HedgingRuleWithContent<O>),
}

impl<O> Clone for RuleKind<O> {
    fn clone(&self) -> Self {
        match self {
            Self::Plain(rule) => Self::Plain(rule.clone()),
            Self::WithContent(rule) => Self::WithContent(rule.clone()),
        }
    }
}

/// Bridges between the two rule flavors, memoized per config so the lift
/// warning fires once.
struct Bridges<O> {
    lifted: OnceLock<HedgingRuleWithContent<O>>,
}

/// An immutable hedging policy: the rule, the attempt cap, the per-attempt
/// response timeout, the initial hedging delay, and, for content-aware
/// rules, the buffer cap for response duplication.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use hedgerow::{HedgingConfig, HedgingRule};
/// use hedgerow_transport::HttpResponse;
///
/// let config: HedgingConfig<HttpResponse> = HedgingConfig::builder(
///     HedgingRule::on_unprocessed(Duration::from_millis(50)),
///     Duration::from_millis(50),
/// )
/// .max_total_attempts(3)
/// .response_timeout_for_each_attempt(Duration::from_millis(500))
/// .build();
///
/// assert_eq!(config.max_total_attempts(), 3);
/// assert!(!config.needs_content_in_rule());
/// ```
pub struct HedgingConfig<O> {
    rule: RuleKind<O>,
    max_total_attempts: u32,
    response_timeout_for_each_attempt: Duration,
    initial_hedging_delay: Duration,
    max_content_length: usize,
    bridges: Arc<Bridges<O>>,
}

impl<O> Clone for HedgingConfig<O> {
    fn clone(&self) -> Self {
        Self {
            rule: self.rule.clone(),
            max_total_attempts: self.max_total_attempts,
            response_timeout_for_each_attempt: self.response_timeout_for_each_attempt,
            initial_hedging_delay: self.initial_hedging_delay,
            max_content_length: self.max_content_length,
            bridges: Arc::clone(&self.bridges),
        }
    }
}

impl<O> HedgingConfig<O> {
    /// Returns the cap on total attempts per outer request.
    #[must_use]
    pub const fn max_total_attempts(&self) -> u32 {
        self.max_total_attempts
    }

    /// Returns the response timeout applied to each attempt;
    /// [`Duration::ZERO`] means unlimited.
    #[must_use]
    pub const fn response_timeout_for_each_attempt(&self) -> Duration {
        self.response_timeout_for_each_attempt
    }

    /// Returns the delay before the first hedge.
    #[must_use]
    pub const fn initial_hedging_delay(&self) -> Duration {
        self.initial_hedging_delay
    }

    /// Returns the duplication buffer cap; meaningful only with a
    /// content-aware rule.
    #[must_use]
    pub const fn max_content_length(&self) -> usize {
        self.max_content_length
    }

    /// Returns `true` when this config carries a content-aware rule.
    #[must_use]
    pub const fn needs_content_in_rule(&self) -> bool {
        matches!(self.rule, RuleKind::WithContent(_))
    }

    /// Returns `true` when the rule needs the response trailers before it
    /// can decide.
    #[must_use]
    pub fn requires_response_trailers(&self) -> bool {
        match &self.rule {
            RuleKind::Plain(rule) => rule.requires_response_trailers(),
            RuleKind::WithContent(rule) => rule.requires_response_trailers(),
        }
    }

    /// Returns the content-free rule, if this config carries one.
    #[must_use]
    pub fn hedging_rule(&self) -> Option<&HedgingRule> {
        match &self.rule {
            RuleKind::Plain(rule) => Some(rule),
            RuleKind::WithContent(_) => None,
        }
    }

    /// Returns the content-aware rule, if this config carries one.
    #[must_use]
    pub fn hedging_rule_with_content(&self) -> Option<&HedgingRuleWithContent<O>> {
        match &self.rule {
            RuleKind::Plain(_) => None,
            RuleKind::WithContent(rule) => Some(rule),
        }
    }
}

impl<O: HedgedResponse> HedgingConfig<O> {
    /// Returns a builder around a content-free rule.
    #[must_use]
    pub fn builder(
        hedging_rule: HedgingRule,
        initial_hedging_delay: Duration,
    ) -> HedgingConfigBuilder<O> {
        HedgingConfigBuilder {
            rule: RuleKind::Plain(hedging_rule),
            max_total_attempts: DEFAULT_MAX_TOTAL_ATTEMPTS,
            response_timeout_for_each_attempt: DEFAULT_RESPONSE_TIMEOUT_FOR_EACH_ATTEMPT,
            initial_hedging_delay,
            max_content_length: 0,
        }
    }

    /// Returns a builder around a content-aware rule.
    #[must_use]
    pub fn builder_with_content(
        hedging_rule_with_content: HedgingRuleWithContent<O>,
        initial_hedging_delay: Duration,
    ) -> HedgingConfigBuilder<O> {
        HedgingConfigBuilder {
            rule: RuleKind::WithContent(hedging_rule_with_content),
            max_total_attempts: DEFAULT_MAX_TOTAL_ATTEMPTS,
            response_timeout_for_each_attempt: DEFAULT_RESPONSE_TIMEOUT_FOR_EACH_ATTEMPT,
            initial_hedging_delay,
            max_content_length: usize::MAX,
        }
    }

    /// Returns a builder reproducing this config.
    #[must_use]
    pub fn to_builder(&self) -> HedgingConfigBuilder<O> {
        HedgingConfigBuilder {
            rule: self.rule.clone(),
            max_total_attempts: self.max_total_attempts,
            response_timeout_for_each_attempt: self.response_timeout_for_each_attempt,
            initial_hedging_delay: self.initial_hedging_delay,
            max_content_length: self.max_content_length,
        }
    }

    /// Returns the rule in content-aware form, lifting a content-free rule
    /// on first use.
    ///
    /// Lifting happens when a content-free rule is used with a client that
    /// evaluates content-aware rules (the RPC client); the first lift per
    /// config logs a warning since that is usually unintentional.
    #[must_use]
    pub(crate) fn rule_lifted_to_content(&self) -> &HedgingRuleWithContent<O> {
        match &self.rule {
            RuleKind::WithContent(rule) => rule,
            RuleKind::Plain(rule) => self.bridges.lifted.get_or_init(|| {
                tracing::warn!(
                    "a HedgingRuleWithContent is being generated from a HedgingRule; \
                     you are probably using a HedgingRule with an RPC hedging client"
                );
                HedgingRuleWithContent::from_rule(rule.clone())
            }),
        }
    }

    /// Returns the rule in content-free form, lowering a content-aware rule
    /// by evaluating it without a response.
    #[must_use]
    pub(crate) fn content_rule_lowered(&self) -> HedgingRule {
        match &self.rule {
            RuleKind::Plain(rule) => rule.clone(),
            RuleKind::WithContent(rule) => rule.clone().into_rule(),
        }
    }
}

impl<O> std::fmt::Debug for HedgingConfig<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HedgingConfig")
            .field("max_total_attempts", &self.max_total_attempts)
            .field(
                "response_timeout_for_each_attempt",
                &self.response_timeout_for_each_attempt,
            )
            .field("initial_hedging_delay", &self.initial_hedging_delay)
            .field("needs_content_in_rule", &matches!(self.rule, RuleKind::WithContent(_)))
            .finish_non_exhaustive()
    }
}

/// Builds a [`HedgingConfig`].
pub struct HedgingConfigBuilder<O> {
    rule: RuleKind<O>,
    max_total_attempts: u32,
    response_timeout_for_each_attempt: Duration,
    initial_hedging_delay: Duration,
    max_content_length: usize,
}

impl<O: HedgedResponse> HedgingConfigBuilder<O> {
    /// Sets the cap on total attempts per outer request.
    ///
    /// # Panics
    ///
    /// Panics if `max_total_attempts` is zero.
    #[must_use]
    pub fn max_total_attempts(mut self, max_total_attempts: u32) -> Self {
        assert!(
            max_total_attempts > 0,
            "max_total_attempts: {max_total_attempts} (expected: > 0)"
        );
        self.max_total_attempts = max_total_attempts;
        self
    }

    /// Sets the response timeout applied to each attempt;
    /// [`Duration::ZERO`] means unlimited.
    #[must_use]
    pub fn response_timeout_for_each_attempt(mut self, timeout: Duration) -> Self {
        self.response_timeout_for_each_attempt = timeout;
        self
    }

    /// Sets the delay before the first hedge.
    #[must_use]
    pub fn initial_hedging_delay(mut self, initial_hedging_delay: Duration) -> Self {
        self.initial_hedging_delay = initial_hedging_delay;
        self
    }

    /// Sets the duplication buffer cap for content-aware rules.
    ///
    /// # Panics
    ///
    /// Panics if this builder carries a content-free rule or if
    /// `max_content_length` is zero.
    #[must_use]
    pub fn max_content_length(mut self, max_content_length: usize) -> Self {
        assert!(
            matches!(self.rule, RuleKind::WithContent(_)),
            "max_content_length is only meaningful with a content-aware rule"
        );
        assert!(
            max_content_length > 0,
            "max_content_length: {max_content_length} (expected: > 0)"
        );
        self.max_content_length = max_content_length;
        self
    }

    /// Builds the config.
    #[must_use]
    pub fn build(self) -> HedgingConfig<O> {
        HedgingConfig {
            rule: self.rule,
            max_total_attempts: self.max_total_attempts,
            response_timeout_for_each_attempt: self.response_timeout_for_each_attempt,
            initial_hedging_delay: self.initial_hedging_delay,
            max_content_length: self.max_content_length,
            bridges: Arc::new(Bridges {
                lifted: OnceLock::new(),
            }),
        }
    }
}

impl<O> std::fmt::Debug for HedgingConfigBuilder<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HedgingConfigBuilder")
            .field("max_total_attempts", &self.max_total_attempts)
            .finish_non_exhaustive()
    }
}
