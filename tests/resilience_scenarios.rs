//! Retry and circuit-breaker behavior observed from the gateway surface.

mod support;

use fieldgate_core::{GatewayError, OpContext, Value};
use fieldgate_gateway::Gateway;
use fieldgate_pool::PoolConfig;
use fieldgate_scheduler::SchedulerConfig;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use support::{test_device, uint_tag, FieldDeviceHandler};

#[tokio::test]
async fn transport_failures_retry_to_a_single_success() {
    let (handler, state) = FieldDeviceHandler::new();
    let gateway = Gateway::builder()
        .handler(Arc::new(handler))
        .scheduler(
            SchedulerConfig::builder()
                .batch_timeout(Duration::from_millis(5))
                .retries(3, Duration::from_millis(20), Duration::from_millis(200))
                .retry_jitter(0.2)
                .build(),
        )
        .start();
    gateway.register_device(test_device("plc-1")).unwrap();
    gateway.add_tag("plc-1", uint_tag("t", "HR:1")).unwrap();
    state.set_register("HR:1", Value::UInt16(7));

    // First two wire calls fail, the third succeeds.
    state.fail_reads.store(2, Ordering::Release);

    let started = Instant::now();
    let ctx = OpContext::background().with_timeout(Duration::from_secs(10));
    let results = gateway
        .read_tags(&ctx, "plc-1", &["t".into()])
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(results["t"].as_ref().unwrap().value, Value::UInt16(7));
    assert_eq!(state.read_batches.load(Ordering::Acquire), 3);

    // Two backoff sleeps happened: with 20ms initial, jitter 0.2, and the
    // clamp at the initial delay, delay_0 ≥ 20ms and delay_1 ≥ 32ms.
    assert!(
        elapsed >= Duration::from_millis(50),
        "expected two backoff delays, got {elapsed:?}"
    );
    gateway.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn sustained_failures_open_the_circuit_and_a_probe_closes_it() {
    let (handler, state) = FieldDeviceHandler::new();
    let gateway = Gateway::builder()
        .handler(Arc::new(handler))
        .pool(
            PoolConfig::builder()
                .breaker(5, Duration::from_millis(200))
                .build(),
        )
        .scheduler(
            SchedulerConfig::builder()
                .batch_timeout(Duration::from_millis(5))
                // No dispatch-level retries: each read is one wire call.
                .retries(0, Duration::from_millis(5), Duration::from_millis(5))
                .build(),
        )
        .start();
    gateway.register_device(test_device("plc-1")).unwrap();
    gateway.add_tag("plc-1", uint_tag("t", "HR:1")).unwrap();
    state.set_register("HR:1", Value::UInt16(9));

    let ctx = OpContext::background().with_timeout(Duration::from_secs(10));

    // Five consecutive failures trip the breaker.
    state.always_fail.store(true, Ordering::Release);
    for _ in 0..5 {
        let results = gateway
            .read_tags(&ctx, "plc-1", &["t".into()])
            .await
            .unwrap();
        assert!(results["t"].is_err());
    }
    let wire_calls = state.read_batches.load(Ordering::Acquire);
    assert_eq!(wire_calls, 5);

    // The sixth read is rejected without touching the handler.
    let results = gateway
        .read_tags(&ctx, "plc-1", &["t".into()])
        .await
        .unwrap();
    assert_eq!(results["t"], Err(GatewayError::CircuitOpen));
    assert_eq!(state.read_batches.load(Ordering::Acquire), wire_calls);

    // After the reset timeout a probe is admitted and recovery closes the
    // breaker again.
    state.always_fail.store(false, Ordering::Release);
    tokio::time::sleep(Duration::from_millis(250)).await;
    let results = gateway
        .read_tags(&ctx, "plc-1", &["t".into()])
        .await
        .unwrap();
    assert_eq!(results["t"].as_ref().unwrap().value, Value::UInt16(9));

    // Breaker closed: the next read flows normally too.
    let results = gateway
        .read_tags(&ctx, "plc-1", &["t".into()])
        .await
        .unwrap();
    assert!(results["t"].is_ok());
    gateway.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn cancelled_context_yields_cancelled_not_silence() {
    let (handler, _state) = FieldDeviceHandler::new();
    let gateway = Gateway::builder()
        .handler(Arc::new(handler))
        .scheduler(
            SchedulerConfig::builder()
                // Nothing flushes on its own: the request stays queued until
                // the caller gives up.
                .batch_timeout(Duration::from_secs(120))
                .flush_interval(Duration::from_secs(120))
                .batch_sizes(1, 64, 128)
                .build(),
        )
        .start();
    gateway.register_device(test_device("plc-1")).unwrap();
    gateway.add_tag("plc-1", uint_tag("t", "HR:1")).unwrap();

    let ctx = OpContext::background();
    let read_ctx = ctx.child();
    let read_gateway = gateway.clone();
    let reader = tokio::spawn(async move {
        read_gateway
            .read_tags(&read_ctx, "plc-1", &["t".into()])
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.cancel();

    let results = reader.await.unwrap().unwrap();
    assert_eq!(results["t"], Err(GatewayError::Cancelled));
    gateway.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn expired_deadline_times_out_without_wire_traffic() {
    let (handler, state) = FieldDeviceHandler::new();
    let gateway = Gateway::builder().handler(Arc::new(handler)).start();
    gateway.register_device(test_device("plc-1")).unwrap();
    gateway.add_tag("plc-1", uint_tag("t", "HR:1")).unwrap();

    let ctx = OpContext::background().with_timeout(Duration::from_nanos(1));
    tokio::time::sleep(Duration::from_millis(5)).await;
    let outcome = gateway.read_tags(&ctx, "plc-1", &["t".into()]).await;
    assert_eq!(outcome.err(), Some(GatewayError::Timeout));
    assert_eq!(state.read_batches.load(Ordering::Acquire), 0);
    gateway.shutdown(Duration::from_secs(1)).await;
}
