// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end races of the unary RPC hedging client.

use std::sync::Arc;
use std::time::Duration;

use hedgerow::{HedgingConfig, HedgingRpcClient, HedgingRule, HedgingRuleWithContent, total_attempts};
use hedgerow_transport::testing::{MockRpcBehavior, MockRpcClient};
use hedgerow_transport::{
    Client, ClientRequestContext, Endpoint, EndpointGroup, RpcRequest, RpcResponse,
};
use serde_json::json;

fn servers() -> Arc<EndpointGroup> {
    Arc::new(EndpointGroup::of([
        Endpoint::of("s1", 8080),
        Endpoint::of("s2", 8080),
        Endpoint::of("s3", 8080),
    ]))
}

fn hello_request() -> RpcRequest {
    RpcRequest::of("HelloService", "hello", vec![json!("armeria")])
}

fn ctx() -> ClientRequestContext {
    ClientRequestContext::builder()
        .rpc_request(hello_request())
        .endpoint_group(servers())
        .build()
}

#[tokio::test(start_paused = true)]
async fn unprocessed_rpc_hedges_to_the_next_server() {
    let mock = MockRpcClient::new();
    mock.enqueue(MockRpcBehavior::FailUnprocessed {
        delay: Duration::ZERO,
    });
    mock.enqueue(MockRpcBehavior::Respond {
        delay: Duration::ZERO,
        value: json!("hello from s2"),
    });

    let config = HedgingConfig::builder(
        HedgingRule::on_unprocessed(Duration::from_millis(100)),
        Duration::from_millis(50),
    )
    .max_total_attempts(3)
    .build();
    let client = HedgingRpcClient::new(mock.clone(), config);
    let ctx = ctx();

    let response = client
        .execute(&ctx, hello_request())
        .await
        .expect("s2 responds");
    assert_eq!(response.value(), Some(&json!("hello from s2")));
    assert_eq!(total_attempts(&ctx), 2);

    let calls = mock.calls();
    assert_eq!(calls.len(), 2);
    // RPC attempts carry the retry count as an additional request header.
    assert_eq!(calls[0].retry_count, None);
    assert_eq!(calls[1].retry_count, Some(1));
    assert_eq!(calls[1].endpoint.as_ref().map(|e| e.host()), Some("s2"));
}

#[tokio::test(start_paused = true)]
async fn content_rule_inspects_the_rpc_value() {
    let mock = MockRpcClient::new();
    mock.enqueue(MockRpcBehavior::Respond {
        delay: Duration::ZERO,
        value: json!({"status": "degraded"}),
    });
    mock.enqueue(MockRpcBehavior::Respond {
        delay: Duration::ZERO,
        value: json!({"status": "healthy"}),
    });

    let rule = HedgingRuleWithContent::<RpcResponse>::on_response(
        |_, response| {
            let degraded = response
                .value()
                .map(|value| value["status"] == "degraded")
                .unwrap_or(false);
            async move { degraded }
        },
        Duration::from_millis(50),
    );
    let config = HedgingConfig::builder_with_content(rule, Duration::from_millis(50))
        .max_total_attempts(3)
        .build();
    let client = HedgingRpcClient::new(mock.clone(), config);
    let ctx = ctx();

    let response = client
        .execute(&ctx, hello_request())
        .await
        .expect("healthy replica wins");
    assert_eq!(response.value(), Some(&json!({"status": "healthy"})));
    assert_eq!(total_attempts(&ctx), 2);
}

#[tokio::test(start_paused = true)]
async fn rpc_failure_after_cap_surfaces_last_cause() {
    let mock = MockRpcClient::new();
    for _ in 0..2 {
        mock.enqueue(MockRpcBehavior::FailUnprocessed {
            delay: Duration::ZERO,
        });
    }

    let config = HedgingConfig::builder(
        HedgingRule::on_unprocessed(Duration::ZERO),
        Duration::ZERO,
    )
    .max_total_attempts(2)
    .build();
    let client = HedgingRpcClient::new(mock.clone(), config);
    let ctx = ctx();

    let err = client
        .execute(&ctx, hello_request())
        .await
        .expect_err("every attempt failed");
    assert!(err.is_unprocessed());
    assert_eq!(total_attempts(&ctx), 2);
    assert_eq!(mock.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn hanging_rpc_loses_to_a_hedge() {
    let mock = MockRpcClient::new();
    mock.enqueue(MockRpcBehavior::Hang);
    mock.enqueue(MockRpcBehavior::Respond {
        delay: Duration::from_millis(5),
        value: json!("late but first"),
    });

    let config = HedgingConfig::builder(
        HedgingRule::on_unprocessed(Duration::from_millis(100)),
        Duration::from_millis(20),
    )
    .max_total_attempts(2)
    .response_timeout_for_each_attempt(Duration::from_millis(500))
    .build();
    let client = HedgingRpcClient::new(mock.clone(), config);
    let ctx = ctx();

    let started = tokio::time::Instant::now();
    let response = client
        .execute(&ctx, hello_request())
        .await
        .expect("hedge wins");
    assert_eq!(started.elapsed(), Duration::from_millis(25));
    assert_eq!(response.value(), Some(&json!("late but first")));

    let first = &mock.calls()[0];
    assert!(
        first
            .context
            .cancellation_cause()
            .map(|cause| cause.is_response_cancelled())
            .unwrap_or(false)
    );
}
