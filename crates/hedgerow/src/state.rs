// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-request hedging state.
//!
//! One [`HedgingState`] lives in the context attribute store of each outer
//! request. It captures the whole-operation deadline at engine entry, tracks
//! attempt reservations against the configured cap, and computes the
//! effective per-attempt response timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::HedgingConfig;

/// The observable number of attempts started for an outer request, attached
/// to the context so it can be read without knowing the response type.
pub(crate) struct TotalAttempts(pub(crate) Arc<AtomicU32>);

/// What response timeout to apply to the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutDirective {
    /// No timeout.
    Unlimited,
    /// Time out after the given duration.
    After(Duration),
    /// The whole-operation budget is already exhausted; the attempt should
    /// fail fast.
    Expired,
}

pub(crate) struct HedgingState<O> {
    config: HedgingConfig<O>,
    deadline: Option<Instant>,
    reservations: AtomicU32,
    exhausted: AtomicBool,
    started: Arc<AtomicU32>,
    current_hedging_delay: Mutex<Duration>,
}

impl<O> HedgingState<O> {
    /// Captures the state at engine entry.
    ///
    /// `outer_timeout` is the outer request's response timeout; `None` or
    /// zero means the whole operation has no deadline.
    pub(crate) fn new(config: HedgingConfig<O>, outer_timeout: Option<Duration>) -> Self {
        let deadline = outer_timeout
            .filter(|timeout| !timeout.is_zero())
            .map(|timeout| Instant::now() + timeout);
        let initial_delay = config.initial_hedging_delay();

        Self {
            config,
            deadline,
            reservations: AtomicU32::new(0),
            exhausted: AtomicBool::new(false),
            started: Arc::new(AtomicU32::new(0)),
            current_hedging_delay: Mutex::new(initial_delay),
        }
    }

    pub(crate) fn config(&self) -> &HedgingConfig<O> {
        &self.config
    }

    /// The remaining whole-operation budget, clamped at zero; `None` when no
    /// deadline is set.
    pub(crate) fn remaining_budget(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Reserves the next attempt slot and validates the proposed delay.
    ///
    /// Returns the delay to schedule the next attempt with, or `None` when
    /// no further attempt may be scheduled: the cap is reached, the proposal
    /// was withdrawn, or the delay exceeds the remaining budget.
    pub(crate) fn next_delay(&self, proposed: Option<Duration>) -> Option<Duration> {
        if self.exhausted.load(Ordering::Relaxed) {
            return None;
        }

        let reservation = self.reservations.fetch_add(1, Ordering::Relaxed) + 1;
        if reservation > self.config.max_total_attempts() {
            tracing::debug!(
                max_total_attempts = self.config.max_total_attempts(),
                "exceeded the maximum number of total attempts"
            );
            self.exhausted.store(true, Ordering::Relaxed);
            return None;
        }

        self.validate_delay(proposed)
    }

    /// Validates a proposed delay for the already-reserved pending attempt,
    /// without consuming a reservation.
    pub(crate) fn reschedule_delay(&self, proposed: Option<Duration>) -> Option<Duration> {
        self.validate_delay(proposed)
    }

    fn validate_delay(&self, proposed: Option<Duration>) -> Option<Duration> {
        let Some(proposed) = proposed else {
            tracing::debug!("the hedging delay proposal was withdrawn");
            return None;
        };

        if let Some(remaining) = self.remaining_budget() {
            // A delay past the deadline would schedule an attempt that can
            // never run; a zero delay still may, even at the deadline.
            if proposed > remaining {
                tracing::debug!(
                    ?proposed,
                    ?remaining,
                    "the next hedging delay exceeds the remaining budget"
                );
                return None;
            }
        }

        Some(proposed)
    }

    /// The response timeout to apply to the next attempt.
    pub(crate) fn effective_response_timeout(&self) -> TimeoutDirective {
        let per_attempt = self.config.response_timeout_for_each_attempt();

        let Some(remaining) = self.remaining_budget() else {
            return if per_attempt.is_zero() {
                TimeoutDirective::Unlimited
            } else {
                TimeoutDirective::After(per_attempt)
            };
        };

        if remaining.is_zero() {
            return TimeoutDirective::Expired;
        }
        if per_attempt.is_zero() {
            TimeoutDirective::After(remaining)
        } else {
            TimeoutDirective::After(per_attempt.min(remaining))
        }
    }

    pub(crate) fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn started_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.started)
    }

    pub(crate) fn current_hedging_delay(&self) -> Duration {
        *self.current_hedging_delay.lock()
    }

    pub(crate) fn set_current_hedging_delay(&self, delay: Duration) {
        *self.current_hedging_delay.lock() = delay;
    }
}

impl<O> std::fmt::Debug for HedgingState<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HedgingState")
            .field("reservations", &self.reservations.load(Ordering::Relaxed))
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use hedgerow_transport::HttpResponse;

    use super::*;
    use crate::rule::HedgingRule;

    fn config(max_attempts: u32, per_attempt: Duration) -> HedgingConfig<HttpResponse> {
        HedgingConfig::builder(
            HedgingRule::on_unprocessed(Duration::from_millis(50)),
            Duration::from_millis(50),
        )
        .max_total_attempts(max_attempts)
        .response_timeout_for_each_attempt(per_attempt)
        .build()
    }

    #[tokio::test(start_paused = true)]
    async fn cap_limits_reservations() {
        let state = HedgingState::new(config(3, Duration::ZERO), None);

        assert_eq!(state.next_delay(Some(Duration::ZERO)), Some(Duration::ZERO));
        assert_eq!(state.next_delay(Some(Duration::ZERO)), Some(Duration::ZERO));
        assert_eq!(state.next_delay(Some(Duration::ZERO)), Some(Duration::ZERO));
        assert_eq!(state.next_delay(Some(Duration::ZERO)), None);
        // Exhaustion is sticky.
        assert_eq!(state.next_delay(Some(Duration::ZERO)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn withdrawn_proposal_is_refused() {
        let state = HedgingState::new(config(3, Duration::ZERO), None);
        assert_eq!(state.next_delay(None), None);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_beyond_budget_is_refused() {
        let state = HedgingState::new(config(10, Duration::ZERO), Some(Duration::from_millis(80)));

        assert_eq!(
            state.next_delay(Some(Duration::from_millis(50))),
            Some(Duration::from_millis(50))
        );

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(state.next_delay(Some(Duration::from_millis(50))), None);
        // A delay within the remaining 20ms is still accepted.
        assert_eq!(
            state.reschedule_delay(Some(Duration::from_millis(10))),
            Some(Duration::from_millis(10))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_accepted_at_elapsed_deadline() {
        let state = HedgingState::new(config(3, Duration::ZERO), Some(Duration::from_millis(10)));
        tokio::time::advance(Duration::from_millis(20)).await;

        assert_eq!(state.next_delay(Some(Duration::ZERO)), Some(Duration::ZERO));
        assert_eq!(state.reschedule_delay(Some(Duration::from_millis(1))), None);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_does_not_reserve() {
        let state = HedgingState::new(config(1, Duration::ZERO), None);
        assert_eq!(
            state.reschedule_delay(Some(Duration::ZERO)),
            Some(Duration::ZERO)
        );
        // The single reservation is still available.
        assert_eq!(state.next_delay(Some(Duration::ZERO)), Some(Duration::ZERO));
        assert_eq!(state.next_delay(Some(Duration::ZERO)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn effective_timeout_without_deadline() {
        let unlimited = HedgingState::new(config(3, Duration::ZERO), None);
        assert_eq!(
            unlimited.effective_response_timeout(),
            TimeoutDirective::Unlimited
        );

        let bounded = HedgingState::new(config(3, Duration::from_millis(500)), None);
        assert_eq!(
            bounded.effective_response_timeout(),
            TimeoutDirective::After(Duration::from_millis(500))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn effective_timeout_clamps_to_remaining_budget() {
        let state = HedgingState::new(
            config(3, Duration::from_millis(500)),
            Some(Duration::from_millis(80)),
        );
        assert_eq!(
            state.effective_response_timeout(),
            TimeoutDirective::After(Duration::from_millis(80))
        );

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(
            state.effective_response_timeout(),
            TimeoutDirective::After(Duration::from_millis(30))
        );

        tokio::time::advance(Duration::from_millis(30)).await;
        assert_eq!(state.effective_response_timeout(), TimeoutDirective::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_per_attempt_uses_remaining_budget() {
        let state = HedgingState::new(config(3, Duration::ZERO), Some(Duration::from_millis(120)));
        assert_eq!(
            state.effective_response_timeout(),
            TimeoutDirective::After(Duration::from_millis(120))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn current_delay_tracks_accepted_decisions() {
        let state = HedgingState::new(config(3, Duration::ZERO), None);
        assert_eq!(state.current_hedging_delay(), Duration::from_millis(50));

        state.set_current_hedging_delay(Duration::from_millis(75));
        assert_eq!(state.current_hedging_delay(), Duration::from_millis(75));
    }

    #[tokio::test(start_paused = true)]
    async fn started_counter_is_observable() {
        let state = HedgingState::new(config(3, Duration::ZERO), None);
        let handle = state.started_handle();
        state.record_started();
        state.record_started();
        assert_eq!(handle.load(Ordering::Relaxed), 2);
    }
}
