// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end races of the HTTP hedging client against a scripted
//! transport, on the paused test clock.

use std::sync::Arc;
use std::time::Duration;

use hedgerow::{HedgingConfig, HedgingConfigMapping, HedgingHttpClient, HedgingRule, total_attempts};
use hedgerow_transport::testing::{MockBehavior, MockClient};
use hedgerow_transport::{
    Client, ClientRequestContext, Endpoint, EndpointGroup, Error, HttpRequest, HttpResponse,
};
use http::{Method, StatusCode};
use tokio::time::Instant;

fn three_servers() -> Arc<EndpointGroup> {
    Arc::new(EndpointGroup::of([
        Endpoint::of("s1", 80),
        Endpoint::of("s2", 80),
        Endpoint::of("s3", 80),
    ]))
}

fn ctx_with_group(group: Arc<EndpointGroup>) -> ClientRequestContext {
    ClientRequestContext::builder()
        .http_request(HttpRequest::of(Method::GET, "/race"))
        .endpoint_group(group)
        .build()
}

/// `maxTotalAttempts = 3`, `perAttempt = 500ms`, `initialHedgingDelay = 50ms`,
/// rule: hedge unprocessed requests after 50ms.
fn on_unprocessed_config() -> HedgingConfig<HttpResponse> {
    HedgingConfig::builder(
        HedgingRule::on_unprocessed(Duration::from_millis(50)),
        Duration::from_millis(50),
    )
    .max_total_attempts(3)
    .response_timeout_for_each_attempt(Duration::from_millis(500))
    .build()
}

#[tokio::test(start_paused = true)]
async fn first_succeeds_fast_no_hedge_fires() {
    let mock = MockClient::new();
    mock.enqueue(MockBehavior::ok_after(Duration::from_millis(10), "from s1"));

    let client = HedgingHttpClient::new(mock.clone(), on_unprocessed_config());
    let ctx = ctx_with_group(three_servers());

    let response = client
        .execute(&ctx, HttpRequest::of(Method::GET, "/race"))
        .await
        .expect("s1 responds");
    assert_eq!(
        response.aggregate().await.expect("body").content_utf8(),
        "from s1"
    );
    assert_eq!(total_attempts(&ctx), 1);
    assert_eq!(mock.call_count(), 1);

    // The 50ms hedge timer must not fire after completion.
    tokio::time::advance(Duration::from_millis(500)).await;
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn first_hangs_second_wins() {
    let mock = MockClient::new();
    mock.enqueue(MockBehavior::Hang);
    mock.enqueue(MockBehavior::ok_after(Duration::from_millis(10), "from s2"));

    let client = HedgingHttpClient::new(mock.clone(), on_unprocessed_config());
    let ctx = ctx_with_group(three_servers());

    let started = Instant::now();
    let response = client
        .execute(&ctx, HttpRequest::of(Method::GET, "/race"))
        .await
        .expect("s2 responds");
    assert_eq!(started.elapsed(), Duration::from_millis(60));
    assert_eq!(
        response.aggregate().await.expect("body").content_utf8(),
        "from s2"
    );
    assert_eq!(total_attempts(&ctx), 2);

    let calls = mock.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].retry_count, None);
    assert_eq!(calls[1].retry_count, Some(1));
    assert_eq!(calls[0].endpoint.as_ref().map(|e| e.host()), Some("s1"));
    assert_eq!(calls[1].endpoint.as_ref().map(|e| e.host()), Some("s2"));

    // The hanging attempt was cancelled as a loser.
    let cancelled = calls[0]
        .context
        .cancellation_cause()
        .expect("loser cancelled");
    assert!(cancelled.is_response_cancelled());
}

#[tokio::test(start_paused = true)]
async fn unprocessed_failure_reschedules_the_hedge() {
    let mock = MockClient::new();
    mock.enqueue(MockBehavior::FailUnprocessed {
        delay: Duration::from_millis(5),
    });
    mock.enqueue(MockBehavior::ok_after(Duration::ZERO, "from s2"));

    let client = HedgingHttpClient::new(mock.clone(), on_unprocessed_config());
    let ctx = ctx_with_group(three_servers());

    let started = Instant::now();
    let response = client
        .execute(&ctx, HttpRequest::of(Method::GET, "/race"))
        .await
        .expect("s2 responds");

    // The failure at t=5 re-timed the pending hedge to t=55.
    assert_eq!(started.elapsed(), Duration::from_millis(55));
    assert_eq!(
        response.aggregate().await.expect("body").content_utf8(),
        "from s2"
    );
    assert_eq!(total_attempts(&ctx), 2);
    assert_eq!(mock.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn all_unprocessed_cap_reached() {
    let mock = MockClient::new();
    for _ in 0..3 {
        mock.enqueue(MockBehavior::FailUnprocessed {
            delay: Duration::ZERO,
        });
    }

    let client = HedgingHttpClient::new(mock.clone(), on_unprocessed_config());
    let ctx = ctx_with_group(three_servers());

    let err = client
        .execute(&ctx, HttpRequest::of(Method::GET, "/race"))
        .await
        .expect_err("every server failed");
    assert!(err.is_unprocessed());
    assert_eq!(total_attempts(&ctx), 3);

    let calls = mock.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].retry_count, None);
    assert_eq!(calls[1].retry_count, Some(1));
    assert_eq!(calls[2].retry_count, Some(2));
    let hosts: Vec<_> = calls
        .iter()
        .map(|call| call.endpoint.as_ref().map(|e| e.host().to_owned()))
        .collect();
    assert_eq!(
        hosts,
        [Some("s1".to_owned()), Some("s2".to_owned()), Some("s3".to_owned())]
    );

    // The cap stops further hedging for good.
    tokio::time::advance(Duration::from_millis(500)).await;
    assert_eq!(mock.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn deadline_shorter_than_next_hedge_delay() {
    let mock = MockClient::new();
    mock.enqueue(MockBehavior::Hang);
    mock.enqueue(MockBehavior::Hang);

    let client = HedgingHttpClient::new(mock.clone(), on_unprocessed_config());
    let ctx = ClientRequestContext::builder()
        .http_request(HttpRequest::of(Method::GET, "/race"))
        .endpoint_group(three_servers())
        .response_timeout(Duration::from_millis(80))
        .build();

    let started = Instant::now();
    let err = client
        .execute(&ctx, HttpRequest::of(Method::GET, "/race"))
        .await
        .expect_err("deadline elapsed");

    assert_eq!(started.elapsed(), Duration::from_millis(80));
    assert!(matches!(
        err,
        Error::ResponseTimeout {
            timeout
        } if timeout == Duration::from_millis(80)
    ));
    // The second attempt was clamped to the remaining 30ms and no third was
    // scheduled.
    assert_eq!(total_attempts(&ctx), 2);
    assert_eq!(mock.call_count(), 2);

    let second = &mock.calls()[1];
    assert_eq!(
        second.context.response_timeout(),
        Some(Duration::from_millis(30))
    );
    let cancelled = second
        .context
        .cancellation_cause()
        .expect("loser cancelled");
    assert!(cancelled.is_response_cancelled());
}

#[tokio::test(start_paused = true)]
async fn rule_rejects_server_error_without_hedging() {
    let mock = MockClient::new();
    mock.enqueue(MockBehavior::status_after(
        Duration::from_millis(20),
        StatusCode::INTERNAL_SERVER_ERROR,
        "oops",
    ));

    let config = HedgingConfig::builder(
        HedgingRule::builder().on_server_error_status().then_no_hedge(),
        Duration::from_millis(50),
    )
    .max_total_attempts(3)
    .build();
    let client = HedgingHttpClient::new(mock.clone(), config);
    let ctx = ctx_with_group(three_servers());

    let response = client
        .execute(&ctx, HttpRequest::of(Method::GET, "/race"))
        .await
        .expect("the 500 is surfaced as a response");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(total_attempts(&ctx), 1);
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn single_attempt_cap_behaves_as_no_hedging() {
    let mock = MockClient::new();
    mock.enqueue(MockBehavior::FailUnprocessed {
        delay: Duration::ZERO,
    });

    let config = HedgingConfig::builder(
        HedgingRule::on_unprocessed(Duration::ZERO),
        Duration::ZERO,
    )
    .max_total_attempts(1)
    .build();
    let client = HedgingHttpClient::new(mock.clone(), config);
    let ctx = ctx_with_group(three_servers());

    let err = client
        .execute(&ctx, HttpRequest::of(Method::GET, "/race"))
        .await
        .expect_err("no hedge allowed");
    assert!(err.is_unprocessed());
    assert_eq!(total_attempts(&ctx), 1);
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn zero_delay_hedges_fire_back_to_back() {
    let mock = MockClient::new();
    for _ in 0..3 {
        mock.enqueue(MockBehavior::FailUnprocessed {
            delay: Duration::ZERO,
        });
    }

    let config = HedgingConfig::builder(
        HedgingRule::on_unprocessed(Duration::ZERO),
        Duration::ZERO,
    )
    .max_total_attempts(3)
    .build();
    let client = HedgingHttpClient::new(mock.clone(), config);
    let ctx = ctx_with_group(three_servers());

    let started = Instant::now();
    let err = client
        .execute(&ctx, HttpRequest::of(Method::GET, "/race"))
        .await
        .expect_err("every attempt failed");
    assert!(err.is_unprocessed());
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(mock.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn tiny_deadline_fails_fast_without_hedges() {
    let mock = MockClient::new();
    mock.enqueue(MockBehavior::Hang);

    let client = HedgingHttpClient::new(mock.clone(), on_unprocessed_config());
    let ctx = ClientRequestContext::builder()
        .http_request(HttpRequest::of(Method::GET, "/race"))
        .endpoint_group(three_servers())
        .response_timeout(Duration::from_millis(1))
        .build();

    let started = Instant::now();
    let err = client
        .execute(&ctx, HttpRequest::of(Method::GET, "/race"))
        .await
        .expect_err("timed out");
    assert!(err.is_response_timeout());
    assert_eq!(started.elapsed(), Duration::from_millis(1));
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn winning_attempt_ends_the_parent_log() {
    let mock = MockClient::new();
    mock.enqueue(MockBehavior::Hang);
    mock.enqueue(MockBehavior::ok_after(Duration::from_millis(10), "late win"));

    let client = HedgingHttpClient::new(mock.clone(), on_unprocessed_config());
    let ctx = ctx_with_group(three_servers());

    let _response = client
        .execute(&ctx, HttpRequest::of(Method::GET, "/race"))
        .await
        .expect("s2 responds");

    let parent_log = ctx.log();
    assert_eq!(parent_log.children().len(), 2);
    assert!(parent_log.is_response_ended());
    // The parent mirrors its last child, which is the winning attempt.
    assert_eq!(parent_log.response_status(), Some(StatusCode::OK));
}

#[tokio::test(start_paused = true)]
async fn outer_cancellation_stops_the_race() {
    let mock = MockClient::new();
    mock.enqueue(MockBehavior::Hang);
    mock.enqueue(MockBehavior::Hang);

    let client = HedgingHttpClient::new(mock.clone(), on_unprocessed_config());
    let ctx = ctx_with_group(three_servers());

    let race = {
        let client = client;
        let ctx = ctx.clone();
        tokio::spawn(async move { client.execute(&ctx, HttpRequest::of(Method::GET, "/race")).await })
    };
    // Let the initial attempt and the first hedge start, then abort the
    // outer request.
    tokio::time::sleep(Duration::from_millis(55)).await;
    assert_eq!(mock.call_count(), 2);
    ctx.cancel(Error::ResponseCancelled);

    let err = race
        .await
        .expect("join")
        .expect_err("outer request cancelled");
    assert!(err.is_response_cancelled());

    // Both in-flight attempts were cancelled with it.
    for call in mock.calls() {
        let cause = call.context.cancellation_cause().expect("attempt cancelled");
        assert!(cause.is_response_cancelled());
    }

    tokio::time::advance(Duration::from_millis(500)).await;
    assert_eq!(mock.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn config_factory_failure_is_surfaced() {
    let mock = MockClient::new();
    let mapping: HedgingConfigMapping<HttpRequest, HttpResponse> =
        HedgingConfigMapping::<HttpRequest, HttpResponse>::by_key(
            |_, req| req.headers().path().to_owned(),
            |_, _| Err(Error::transport("config store unavailable")),
        );
    let client = HedgingHttpClient::with_mapping(mock.clone(), mapping);
    let ctx = ctx_with_group(three_servers());

    let err = client
        .execute(&ctx, HttpRequest::of(Method::GET, "/race"))
        .await
        .expect_err("factory failed");
    assert_eq!(err.to_string(), "transport error: config store unavailable");
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn keyed_mapping_applies_per_path_budgets() {
    let mock = MockClient::new();
    mock.enqueue(MockBehavior::FailUnprocessed {
        delay: Duration::ZERO,
    });

    let mapping: HedgingConfigMapping<HttpRequest, HttpResponse> =
        HedgingConfigMapping::<HttpRequest, HttpResponse>::by_key(
        |_, req| req.headers().path().to_owned(),
        |_, req| {
            let attempts = if req.headers().path() == "/critical" { 3 } else { 1 };
            Ok(HedgingConfig::builder(
                HedgingRule::on_unprocessed(Duration::from_millis(50)),
                Duration::from_millis(50),
            )
            .max_total_attempts(attempts)
            .build())
        },
    );
    let client = HedgingHttpClient::with_mapping(mock.clone(), mapping);

    let ctx = ClientRequestContext::builder()
        .http_request(HttpRequest::of(Method::GET, "/critical"))
        .endpoint_group(three_servers())
        .build();
    let response = client
        .execute(&ctx, HttpRequest::of(Method::GET, "/critical"))
        .await
        .expect("second attempt succeeds");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(total_attempts(&ctx), 2);
}
