// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The attempt-race coordinator.
//!
//! One race runs per outer request, inside the caller's `execute` future.
//! Attempts run as tasks on the context's runtime and report back over a
//! channel; the coordinator owns the in-flight set, the single pending
//! hedge timer, and all state transitions. Events that are ready in the
//! same coordinator turn are processed in ascending attempt order, so the
//! lowest-index terminal attempt wins a simultaneous finish.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use hedgerow_transport::{ClientRequestContext, Error, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};

use crate::config::HedgingConfig;
use crate::decision::HedgingDecision;
use crate::rule_with_content::HedgedResponse;
use crate::state::{HedgingState, TimeoutDirective, TotalAttempts};

/// Returns the number of attempts started so far for the request of the
/// given context, or zero when the context never entered a hedging client.
///
/// # Examples
///
/// ```no_run
/// use hedgerow_transport::ClientRequestContext;
///
/// fn report(ctx: &ClientRequestContext) {
///     println!("attempts: {}", hedgerow::total_attempts(ctx));
/// }
/// ```
#[must_use]
pub fn total_attempts(ctx: &ClientRequestContext) -> u32 {
    ctx.attr::<TotalAttempts>()
        .map(|counter| counter.0.load(std::sync::atomic::Ordering::Relaxed))
        .unwrap_or(0)
}

/// One variant of the hedging client: how to derive an attempt context and
/// how to run one attempt to its rule decision.
pub(crate) trait HedgeDriver: Send + Sync + 'static {
    type Response: HedgedResponse;

    /// Derives the per-attempt context, stamping the retry-count header for
    /// attempts after the first.
    fn derive(&self, parent: &ClientRequestContext, index: u32) -> ClientRequestContext;

    /// Runs one attempt to completion and evaluates the rule against its
    /// outcome.
    fn run(
        &self,
        derived: ClientRequestContext,
        index: u32,
        timeout: TimeoutDirective,
    ) -> impl Future<Output = (Result<Self::Response>, HedgingDecision)> + Send;
}

/// Resolves the per-request state and attaches it, together with the
/// observable attempt counter, to the context.
pub(crate) fn prepare_state<O: HedgedResponse>(
    ctx: &ClientRequestContext,
    config: HedgingConfig<O>,
) -> Arc<HedgingState<O>> {
    let state = ctx.set_attr(HedgingState::new(config, ctx.response_timeout()));
    ctx.set_attr(TotalAttempts(state.started_handle()));
    state
}

/// Applies the per-attempt timeout around a delegate invocation.
pub(crate) async fn execute_with_timeout<O>(
    timeout: TimeoutDirective,
    execution: impl Future<Output = Result<O>>,
) -> Result<O> {
    let deadline = match timeout {
        TimeoutDirective::Unlimited => return execution.await,
        TimeoutDirective::After(deadline) => deadline,
        TimeoutDirective::Expired => Duration::ZERO,
    };
    match tokio::time::timeout(deadline, execution).await {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::ResponseTimeout { timeout: deadline }),
    }
}

struct AttemptEvent<O> {
    index: u32,
    outcome: Result<O>,
    decision: HedgingDecision,
}

/// Sends a synthetic terminal event when an attempt task dies without
/// reporting, which happens when the runtime is shutting down.
struct EventGuard<O> {
    tx: mpsc::UnboundedSender<AttemptEvent<O>>,
    index: u32,
    armed: bool,
}

impl<O> Drop for EventGuard<O> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.tx.send(AttemptEvent {
                index: self.index,
                outcome: Err(Error::SchedulerClosed),
                decision: HedgingDecision::no_hedge(),
            });
        }
    }
}

struct InFlightAttempt {
    index: u32,
    ctx: ClientRequestContext,
    handle: JoinHandle<()>,
}

/// The in-flight attempts of one race. Dropping the set cancels whatever is
/// still running, so an abandoned race cleans up after itself.
struct AttemptSet {
    attempts: Vec<InFlightAttempt>,
}

impl AttemptSet {
    fn new() -> Self {
        Self {
            attempts: Vec::new(),
        }
    }

    fn insert(&mut self, index: u32, ctx: ClientRequestContext, handle: JoinHandle<()>) {
        self.attempts.push(InFlightAttempt { index, ctx, handle });
    }

    fn remove(&mut self, index: u32) {
        self.attempts.retain(|attempt| attempt.index != index);
    }

    fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    fn cancel_all(&mut self) {
        for attempt in self.attempts.drain(..) {
            attempt.ctx.cancel(Error::ResponseCancelled);
            attempt.handle.abort();
            attempt.ctx.log_builder().end_request_with(Error::ResponseCancelled);
            attempt.ctx.log_builder().end_response_with(Error::ResponseCancelled);
        }
    }
}

impl Drop for AttemptSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn abort_loser<O: HedgedResponse>(outcome: &Result<O>) {
    if let Ok(response) = outcome {
        response.abort(Error::ResponseCancelled);
    }
}

fn spawn_attempt<D: HedgeDriver>(
    driver: &Arc<D>,
    parent: &ClientRequestContext,
    state: &Arc<HedgingState<D::Response>>,
    tx: &mpsc::UnboundedSender<AttemptEvent<D::Response>>,
    attempts: &mut AttemptSet,
    index: u32,
) {
    let timeout = state.effective_response_timeout();
    let derived = driver.derive(parent, index);
    match timeout {
        TimeoutDirective::Unlimited => derived.clear_response_timeout(),
        TimeoutDirective::After(deadline) => derived.set_response_timeout(deadline),
        TimeoutDirective::Expired => derived.set_response_timeout(Duration::ZERO),
    }
    state.record_started();

    let driver = Arc::clone(driver);
    let task_ctx = derived.clone();
    let tx = tx.clone();
    let handle = parent.event_loop().spawn(async move {
        let mut guard = EventGuard {
            tx,
            index,
            armed: true,
        };
        let (outcome, decision) = driver.run(task_ctx, index, timeout).await;
        guard.armed = false;
        let _ = guard.tx.send(AttemptEvent {
            index,
            outcome,
            decision,
        });
    });
    attempts.insert(index, derived, handle);
}

/// Runs the attempt race for one outer request.
///
/// Exactly one outcome is returned: the first attempt whose rule decision
/// is not "hedge again". When the cap or the deadline exhausts the budget,
/// the last completed attempt's outcome stands. Every other attempt is cancelled
/// and its response aborted before this returns.
pub(crate) async fn run_race<D: HedgeDriver>(
    parent: &ClientRequestContext,
    state: Arc<HedgingState<D::Response>>,
    driver: Arc<D>,
) -> Result<D::Response> {
    let (tx, mut rx) = mpsc::unbounded_channel::<AttemptEvent<D::Response>>();

    let mut attempts = AttemptSet::new();
    let mut pending_hedge: Option<Pin<Box<Sleep>>> = None;
    let mut latest: Option<Result<D::Response>> = None;
    let mut next_index: u32 = 0;

    // The initial attempt always fits: the cap is at least one and a zero
    // delay passes the budget check even at an elapsed deadline.
    let _initial_reservation = state.next_delay(Some(Duration::ZERO));
    debug_assert!(
        _initial_reservation.is_some(),
        "initial attempt must be schedulable"
    );
    spawn_attempt(&driver, parent, &state, &tx, &mut attempts, next_index);
    next_index += 1;

    if let Some(delay) = state.next_delay(Some(state.current_hedging_delay())) {
        pending_hedge = Some(Box::pin(tokio::time::sleep(delay)));
    }

    loop {
        tokio::select! {
            biased;

            cause = parent.cancelled() => {
                if let Some(outcome) = latest.take() {
                    abort_loser(&outcome);
                }
                attempts.cancel_all();
                parent.log_builder().end_response_with_last_child();
                return Err(cause);
            }

            Some(event) = rx.recv() => {
                let mut batch = vec![event];
                while let Ok(more) = rx.try_recv() {
                    batch.push(more);
                }
                batch.sort_by_key(|event| event.index);

                let mut batch = batch.into_iter();
                while let Some(event) = batch.next() {
                    attempts.remove(event.index);

                    match event.decision.hedging_delay() {
                        Some(delay) => {
                            state.set_current_hedging_delay(delay);
                            if let Some(previous) = latest.replace(event.outcome) {
                                abort_loser(&previous);
                            }

                            if let Some(pending) = pending_hedge.as_mut() {
                                // Re-time the already-reserved hedge to run
                                // `delay` after this completion.
                                match state.reschedule_delay(Some(delay)) {
                                    Some(delay) => {
                                        pending.as_mut().reset(Instant::now() + delay);
                                    }
                                    None => pending_hedge = None,
                                }
                            } else if let Some(delay) = state.next_delay(Some(delay)) {
                                pending_hedge = Some(Box::pin(tokio::time::sleep(delay)));
                            }
                        }
                        None => {
                            // Terminal: this attempt wins the race.
                            if let Some(previous) = latest.take() {
                                abort_loser(&previous);
                            }
                            for remaining in batch {
                                abort_loser(&remaining.outcome);
                            }
                            attempts.cancel_all();
                            pending_hedge = None;
                            parent.log_builder().end_response_with_last_child();
                            return event.outcome;
                        }
                    }
                }

                if attempts.is_empty() && pending_hedge.is_none() {
                    // Budget exhausted with every completion accepted: the
                    // last outcome stands.
                    parent.log_builder().end_response_with_last_child();
                    return latest.take().unwrap_or(Err(Error::SchedulerClosed));
                }
            }

            () = async {
                match pending_hedge.as_mut() {
                    Some(sleep) => sleep.as_mut().await,
                    None => std::future::pending().await,
                }
            }, if pending_hedge.is_some() => {
                pending_hedge = None;
                spawn_attempt(&driver, parent, &state, &tx, &mut attempts, next_index);
                next_index += 1;

                if let Some(delay) = state.next_delay(Some(state.current_hedging_delay())) {
                    pending_hedge = Some(Box::pin(tokio::time::sleep(delay)));
                }
            }
        }
    }
}
