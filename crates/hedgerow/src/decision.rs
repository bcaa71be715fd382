// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The verdict a hedging rule renders for one completed attempt.

use std::fmt;
use std::time::Duration;

/// The decision a [`HedgingRule`][crate::HedgingRule] renders for one
/// completed attempt.
///
/// - [`hedge(delay)`][Self::hedge]: this outcome is worth hedging more on;
///   launch another attempt after `delay` if the budget allows. Accepting
///   does **not** make the completed attempt the winner.
/// - [`no_hedge()`][Self::no_hedge]: stop hedging; the completed attempt's
///   outcome is the answer.
/// - [`next()`][Self::next]: this rule abstains; the next composed rule
///   decides. At the top level, abstaining means the outcome stands.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use hedgerow::HedgingDecision;
///
/// let decision = HedgingDecision::hedge(Duration::from_millis(50));
/// assert_eq!(decision.hedging_delay(), Some(Duration::from_millis(50)));
/// assert_eq!(HedgingDecision::no_hedge().hedging_delay(), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HedgingDecision(Inner);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inner {
    Hedge(Duration),
    NoHedge,
    Next,
}

impl HedgingDecision {
    /// Hedge again after the given delay.
    #[must_use]
    pub const fn hedge(delay: Duration) -> Self {
        Self(Inner::Hedge(delay))
    }

    /// Stop hedging; the completed attempt's outcome is surfaced.
    #[must_use]
    pub const fn no_hedge() -> Self {
        Self(Inner::NoHedge)
    }

    /// Abstain; the next composed rule decides.
    #[must_use]
    pub const fn next() -> Self {
        Self(Inner::Next)
    }

    /// Returns the delay to the next hedge, when this decision hedges.
    #[must_use]
    pub const fn hedging_delay(&self) -> Option<Duration> {
        match self.0 {
            Inner::Hedge(delay) => Some(delay),
            Inner::NoHedge | Inner::Next => None,
        }
    }

    /// Returns `true` when this decision abstains.
    #[must_use]
    pub const fn is_next(&self) -> bool {
        matches!(self.0, Inner::Next)
    }
}

impl fmt::Display for HedgingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Inner::Hedge(delay) => write!(f, "HedgingDecision(HEDGE({delay:?}))"),
            Inner::NoHedge => f.write_str("HedgingDecision(NO_HEDGE)"),
            Inner::Next => f.write_str("HedgingDecision(NEXT)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(HedgingDecision: Send, Sync, Copy, PartialEq);
    }

    #[test]
    fn constructors() {
        assert_eq!(
            HedgingDecision::hedge(Duration::ZERO).hedging_delay(),
            Some(Duration::ZERO)
        );
        assert_eq!(HedgingDecision::no_hedge().hedging_delay(), None);
        assert!(HedgingDecision::next().is_next());
        assert!(!HedgingDecision::no_hedge().is_next());
    }

    #[test]
    fn display_ok() {
        assert_eq!(
            HedgingDecision::no_hedge().to_string(),
            "HedgingDecision(NO_HEDGE)"
        );
        assert_eq!(HedgingDecision::next().to_string(), "HedgingDecision(NEXT)");
        assert!(
            HedgingDecision::hedge(Duration::from_millis(50))
                .to_string()
                .starts_with("HedgingDecision(HEDGE(")
        );
    }
}
