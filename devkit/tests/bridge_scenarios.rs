//! End-to-end bridge scenarios against the devkit broker and endpoint stubs.

use gateway_devkit::test_utils::{pub_metric, pubsub_metric, sub_metric, value_payload, wait_until};
use gateway_devkit::TestHarness;
use opcua_mqtt_gateway::{FatalError, LifecycleState, Value};
use rumqttc::QoS;
use serde_json::json;
use std::time::Duration;

const TEMP: &str = "ns=1;s=Temp";
const SETPOINT: &str = "ns=1;s=Setpoint";

#[tokio::test]
async fn test_pub_metric_publishes_each_tick() {
    let harness = TestHarness::new();
    harness.endpoint.set_node_f64(TEMP, 21.5);

    let gateway = harness
        .start(vec![pub_metric(TEMP, "plant/temp", 50)])
        .await
        .unwrap();
    assert_eq!(gateway.state().get(), LifecycleState::Running);
    assert!(harness.wait_for_publishes("plant/temp", 3, 2_000).await);

    let report = gateway.shutdown().await;
    assert!(report.is_clean());

    let messages = harness.broker.find_messages_by_topic("plant/temp");
    assert_eq!(messages.len(), harness.endpoint.read_count(TEMP));
    for message in &messages {
        assert_eq!(message.payload_str(), r#"{"value":21.5}"#);
        assert_eq!(message.qos, QoS::AtMostOnce);
        assert!(!message.retain);
    }
    assert_eq!(report.stats.publishes as usize, messages.len());
}

#[tokio::test]
async fn test_integer_values_stay_integers() {
    let harness = TestHarness::new();
    harness.endpoint.set_node(TEMP, 42i64);

    let gateway = harness
        .start(vec![pub_metric(TEMP, "plant/count", 50)])
        .await
        .unwrap();
    assert!(harness.wait_for_publishes("plant/count", 1, 2_000).await);
    gateway.shutdown().await;

    let last: serde_json::Value = harness
        .broker
        .get_last_json_message("plant/count")
        .unwrap()
        .unwrap();
    assert_eq!(last, json!({ "value": 42 }));
}

#[tokio::test]
async fn test_sub_metric_writes_once_per_message() {
    let harness = TestHarness::new();
    harness.endpoint.set_node(SETPOINT, 0i64);

    let gateway = harness
        .start(vec![sub_metric(SETPOINT, "plant/setpoint/cmd")])
        .await
        .unwrap();
    assert_eq!(harness.broker.get_subscriptions(), vec!["plant/setpoint/cmd"]);

    assert!(harness
        .broker
        .simulate_incoming("plant/setpoint/cmd", value_payload(json!(30)))
        .await
        .unwrap());
    assert!(harness.wait_for_writes(SETPOINT, 1, 2_000).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let writes = harness.endpoint.writes_to(SETPOINT);
    assert_eq!(writes, vec![Value::from(30i64)]);
    assert_eq!(harness.endpoint.node(SETPOINT).unwrap().as_f64(), 30.0);
    // sub-only metrics are never polled
    assert_eq!(harness.endpoint.read_count(SETPOINT), 0);
    assert!(harness.broker.get_published_messages().is_empty());

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_malformed_payload_is_dropped() {
    let harness = TestHarness::new();

    let gateway = harness
        .start(vec![sub_metric(SETPOINT, "plant/setpoint/cmd")])
        .await
        .unwrap();

    for bad in [&b"not json"[..], &br#"{"val":1}"#[..], &br#"{"value":"high"}"#[..]] {
        harness
            .broker
            .simulate_incoming("plant/setpoint/cmd", bad.to_vec())
            .await
            .unwrap();
    }
    harness
        .broker
        .simulate_incoming("plant/setpoint/cmd", value_payload(json!(5)))
        .await
        .unwrap();

    assert!(harness.wait_for_writes(SETPOINT, 1, 2_000).await);
    assert!(wait_until(1_000, || gateway.stats().snapshot().decode_errors == 3).await);
    assert_eq!(harness.endpoint.writes_to(SETPOINT), vec![Value::from(5i64)]);
    assert_eq!(gateway.state().get(), LifecycleState::Running);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_read_failure_does_not_block_other_metrics() {
    let harness = TestHarness::new();
    harness.endpoint.set_node_f64("ns=1;s=A", 1.0);
    harness.endpoint.set_node_f64("ns=1;s=B", 2.5);
    harness.endpoint.fail_reads("ns=1;s=A");

    let gateway = harness
        .start(vec![
            pub_metric("ns=1;s=A", "plant/a", 50),
            pub_metric("ns=1;s=B", "plant/b", 50),
        ])
        .await
        .unwrap();

    assert!(harness.wait_for_publishes("plant/b", 3, 2_000).await);
    assert!(harness.endpoint.read_count("ns=1;s=A") >= 2);
    assert_eq!(harness.broker.count_on("plant/a"), 0);

    let report = gateway.shutdown().await;
    assert!(report.stats.read_errors >= 2);
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_publish_failure_keeps_polling() {
    let harness = TestHarness::new();
    harness.endpoint.set_node_f64("ns=1;s=A", 1.0);
    harness.endpoint.set_node_f64("ns=1;s=B", 2.0);
    harness.broker.fail_publish("plant/a");

    let gateway = harness
        .start(vec![
            pub_metric("ns=1;s=A", "plant/a", 50),
            pub_metric("ns=1;s=B", "plant/b", 50),
        ])
        .await
        .unwrap();

    assert!(wait_until(2_000, || harness.endpoint.read_count("ns=1;s=A") >= 2).await);
    let reads_after_failures = harness.endpoint.read_count("ns=1;s=A");
    assert!(wait_until(2_000, || gateway.stats().snapshot().publish_errors >= 2).await);

    // A keeps ticking after its publishes failed; B is unaffected.
    assert!(wait_until(2_000, || {
        harness.endpoint.read_count("ns=1;s=A") > reads_after_failures
    })
    .await);
    assert!(harness.wait_for_publishes("plant/b", 3, 2_000).await);
    assert_eq!(harness.broker.count_on("plant/a"), 0);
    assert_eq!(gateway.state().get(), LifecycleState::Running);

    let report = gateway.shutdown().await;
    assert!(report.stats.publish_errors >= 2);
    assert_eq!(report.stats.publish_errors, report.stats.reads - report.stats.publishes);
}

#[tokio::test]
async fn test_hung_read_times_out_without_stalling_others() {
    let harness = TestHarness::new().with_operation_timeout(Duration::from_millis(100));
    harness.endpoint.set_node_f64("ns=1;s=Slow", 1.0);
    harness.endpoint.set_node_f64("ns=1;s=Fast", 2.0);
    harness
        .endpoint
        .delay_reads("ns=1;s=Slow", Duration::from_secs(30));

    let gateway = harness
        .start(vec![
            pub_metric("ns=1;s=Slow", "plant/slow", 50),
            pub_metric("ns=1;s=Fast", "plant/fast", 50),
        ])
        .await
        .unwrap();

    assert!(harness.wait_for_publishes("plant/fast", 4, 2_000).await);
    assert!(wait_until(1_000, || gateway.stats().snapshot().read_errors >= 1).await);
    assert_eq!(harness.broker.count_on("plant/slow"), 0);

    let report = tokio::time::timeout(Duration::from_secs(3), gateway.shutdown())
        .await
        .expect("shutdown should not wait on the hung read");
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_write_failure_is_isolated() {
    let harness = TestHarness::new();
    harness.endpoint.fail_writes("ns=1;s=Locked");

    let gateway = harness
        .start(vec![
            sub_metric("ns=1;s=Locked", "plant/locked/cmd"),
            sub_metric("ns=1;s=Open", "plant/open/cmd"),
        ])
        .await
        .unwrap();

    harness
        .broker
        .simulate_incoming("plant/locked/cmd", value_payload(json!(1)))
        .await
        .unwrap();
    harness
        .broker
        .simulate_incoming("plant/open/cmd", value_payload(json!(2)))
        .await
        .unwrap();

    assert!(harness.wait_for_writes("ns=1;s=Open", 1, 2_000).await);
    assert!(wait_until(1_000, || gateway.stats().snapshot().write_errors == 1).await);
    assert!(harness.endpoint.writes_to("ns=1;s=Locked").is_empty());

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_shared_topic_writes_every_metric() {
    let harness = TestHarness::new();

    let gateway = harness
        .start(vec![
            sub_metric("ns=1;s=Left", "plant/valves/cmd"),
            sub_metric("ns=1;s=Right", "plant/valves/cmd"),
        ])
        .await
        .unwrap();

    harness
        .broker
        .simulate_incoming("plant/valves/cmd", value_payload(json!(0.75)))
        .await
        .unwrap();

    assert!(harness.wait_for_writes("ns=1;s=Left", 1, 2_000).await);
    assert!(harness.wait_for_writes("ns=1;s=Right", 1, 2_000).await);
    assert_eq!(harness.endpoint.writes().len(), 2);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_failure_is_not_fatal() {
    let harness = TestHarness::new();
    harness.endpoint.set_node_f64("ns=1;s=Level", 3.0);
    harness.broker.fail_subscribe("plant/level");

    let gateway = harness
        .start(vec![pubsub_metric("ns=1;s=Level", "plant/level", 50)])
        .await
        .unwrap();

    let registration = gateway.registration();
    assert_eq!(registration.polling(), 1);
    assert_eq!(registration.subscribed(), 0);
    assert_eq!(registration.failed_subscriptions().count(), 1);
    assert_eq!(gateway.state().get(), LifecycleState::Running);

    assert!(harness.wait_for_publishes("plant/level", 2, 2_000).await);
    let report = gateway.shutdown().await;
    assert_eq!(report.stats.subscribe_errors, 1);
}

#[tokio::test]
async fn test_pubsub_echo_is_bounded() {
    let harness = TestHarness::new();
    harness.broker.enable_loopback();
    harness.endpoint.set_node(TEMP, 7i64);

    let gateway = harness
        .start(vec![pubsub_metric(TEMP, "plant/level", 50)])
        .await
        .unwrap();

    assert!(harness.wait_for_publishes("plant/level", 4, 2_000).await);
    assert!(harness.wait_for_writes(TEMP, 1, 2_000).await);
    gateway.shutdown().await;

    // One echoed write per publish at most; no feedback amplification.
    let publishes = harness.broker.count_on("plant/level");
    let writes = harness.endpoint.writes_to(TEMP);
    assert!(writes.len() <= publishes);
    assert!(writes.iter().all(|v| *v == Value::from(7i64)));
}

#[tokio::test]
async fn test_cancel_polling_stops_one_metric() {
    let harness = TestHarness::new();
    harness.endpoint.set_node_f64("ns=1;s=A", 1.0);
    harness.endpoint.set_node_f64("ns=1;s=B", 2.0);

    let mut gateway = harness
        .start(vec![
            pub_metric("ns=1;s=A", "plant/a", 50),
            pub_metric("ns=1;s=B", "plant/b", 50),
        ])
        .await
        .unwrap();

    assert!(harness.wait_for_publishes("plant/a", 1, 2_000).await);
    assert!(gateway.cancel_polling(0));
    assert!(!gateway.cancel_polling(0));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let frozen = harness.broker.count_on("plant/a");
    let before = harness.broker.count_on("plant/b");
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(harness.broker.count_on("plant/a"), frozen);
    assert!(harness.broker.count_on("plant/b") > before);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let harness = TestHarness::new();
    for node in ["ns=1;s=A", "ns=1;s=B", "ns=1;s=C"] {
        harness.endpoint.set_node_f64(node, 1.0);
    }

    let gateway = harness
        .start(vec![
            pub_metric("ns=1;s=A", "plant/a", 20),
            pub_metric("ns=1;s=B", "plant/b", 20),
            sub_metric("ns=1;s=C", "plant/c/cmd"),
        ])
        .await
        .unwrap();
    let state = gateway.state();
    assert!(harness.wait_for_publishes("plant/b", 2, 2_000).await);

    let report = tokio::time::timeout(Duration::from_secs(3), gateway.shutdown())
        .await
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(state.get(), LifecycleState::Terminated);
    assert!(harness.endpoint.is_session_closed());
    assert!(harness.endpoint.is_disconnected());
    assert!(harness.broker.is_closed());

    // Nothing moves after shutdown.
    let published = harness.broker.get_published_messages().len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.broker.get_published_messages().len(), published);
}

#[tokio::test]
async fn test_shutdown_reports_close_errors_and_continues() {
    let harness = TestHarness::new();
    harness.endpoint.fail_close();

    let gateway = harness
        .start(vec![sub_metric(SETPOINT, "plant/setpoint/cmd")])
        .await
        .unwrap();
    let state = gateway.state();

    let report = gateway.shutdown().await;
    let steps: Vec<&str> = report.issues.iter().map(|i| i.step).collect();
    assert_eq!(steps, vec!["close session", "disconnect endpoint"]);
    assert!(harness.broker.is_closed());
    assert_eq!(state.get(), LifecycleState::Terminated);
}

#[tokio::test]
async fn test_run_until_signal() {
    let harness = TestHarness::new();
    harness.endpoint.set_node_f64(TEMP, 1.0);

    let gateway = harness
        .start(vec![pub_metric(TEMP, "plant/temp", 50)])
        .await
        .unwrap();
    let state = gateway.state();

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let run = tokio::spawn(gateway.run_until(async {
        let _ = rx.await;
    }));

    assert!(harness.wait_for_publishes("plant/temp", 1, 2_000).await);
    assert_eq!(state.get(), LifecycleState::Running);
    tx.send(()).unwrap();

    let report = run.await.unwrap();
    assert!(report.is_clean());
    assert_eq!(state.get(), LifecycleState::Terminated);
}

#[tokio::test]
async fn test_broker_connect_failure_is_fatal() {
    let harness = TestHarness::new();
    harness.broker.fail_connect();

    let gateway = harness.gateway(vec![pub_metric(TEMP, "plant/temp", 50)]).unwrap();
    let state = gateway.state();

    let Err(err) = gateway.start().await else {
        panic!("startup should fail");
    };
    assert!(matches!(err, FatalError::BrokerConnect(_)));
    assert_eq!(err.exit_code(), 1);
    assert_eq!(state.get(), LifecycleState::Failed);
    assert_eq!(harness.endpoint.connect_count(), 0);
}

#[tokio::test]
async fn test_endpoint_connect_failure_closes_broker() {
    let harness = TestHarness::new();
    harness.endpoint.fail_connect();

    let gateway = harness.gateway(vec![pub_metric(TEMP, "plant/temp", 50)]).unwrap();
    let state = gateway.state();

    let Err(err) = gateway.start().await else {
        panic!("startup should fail");
    };
    assert!(matches!(err, FatalError::EndpointConnect(_)));
    assert_eq!(state.get(), LifecycleState::Failed);
    assert!(harness.broker.is_closed());
    assert_eq!(harness.endpoint.read_count(TEMP), 0);
}

#[tokio::test]
async fn test_session_failure_disconnects_endpoint() {
    let harness = TestHarness::new();
    harness.endpoint.fail_session();

    let gateway = harness.gateway(vec![sub_metric(SETPOINT, "plant/setpoint/cmd")]).unwrap();
    let state = gateway.state();

    let Err(err) = gateway.start().await else {
        panic!("startup should fail");
    };
    assert!(matches!(err, FatalError::SessionOpen(_)));
    assert_eq!(state.get(), LifecycleState::Failed);
    assert!(harness.endpoint.is_disconnected());
    assert!(harness.broker.is_closed());
    assert!(harness.broker.get_subscriptions().is_empty());
}

#[tokio::test]
async fn test_gateways_run_side_by_side() {
    let first = TestHarness::new();
    let second = TestHarness::new();
    first.endpoint.set_node_f64(TEMP, 1.0);
    second.endpoint.set_node_f64(TEMP, 2.0);

    let a = first.start(vec![pub_metric(TEMP, "plant/temp", 50)]).await.unwrap();
    let b = second.start(vec![pub_metric(TEMP, "plant/temp", 50)]).await.unwrap();

    assert!(first.wait_for_publishes("plant/temp", 2, 2_000).await);
    assert!(second.wait_for_publishes("plant/temp", 2, 2_000).await);
    a.shutdown().await;
    b.shutdown().await;

    assert!(first
        .broker
        .get_published_messages()
        .iter()
        .all(|m| m.payload_str() == r#"{"value":1.0}"#));
    assert!(second
        .broker
        .get_published_messages()
        .iter()
        .all(|m| m.payload_str() == r#"{"value":2.0}"#));
}
