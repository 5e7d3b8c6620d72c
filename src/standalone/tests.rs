use super::*;
use crate::bus::outbox::OutboxStatus;
use crate::config::{RouteConfig, RouteType, SagaConfig};
use crate::orchestration::{SagaContext, SagaStatus, SagaStep};
use crate::observer::BoxError;
use crate::storage::EventStoreError;
use crate::test_utils::{payload, wait_for, RecordingHandler};
use serde_json::json;
use std::time::Duration;

fn created(amount: i64) -> NewEvent {
    NewEvent::new("PolicyCreated", payload(json!({ "premium": amount })))
}

#[tokio::test]
async fn test_record_event_stages_outbox_entry() {
    let runtime = IntegrationRuntime::new(Config::for_test());

    let (event, entry) = runtime
        .record_event("Policy", "POL-1", created(100), Some(0))
        .await
        .unwrap();

    assert_eq!(event.version, 1);
    assert_eq!(entry.event_type, "PolicyCreated");
    assert_eq!(entry.aggregate_type, "Policy");
    assert_eq!(entry.payload["premium"], 100);
    assert_eq!(runtime.outbox().get_pending_entries().await.len(), 1);
}

#[tokio::test]
async fn test_rejected_append_stages_nothing() {
    let runtime = IntegrationRuntime::new(Config::for_test());
    runtime
        .record_event("Policy", "POL-1", created(100), None)
        .await
        .unwrap();

    let err = runtime
        .record_event("Policy", "POL-1", created(200), Some(5))
        .await
        .unwrap_err();

    assert!(matches!(err, EventStoreError::Concurrency { expected: 5, actual: 1, .. }));
    assert_eq!(runtime.outbox().get_all_entries().await.len(), 1);
    assert_eq!(runtime.event_store().get_current_version("POL-1").await, 1);
}

#[tokio::test]
async fn test_polling_forwards_to_broker_subscribers() {
    let runtime = IntegrationRuntime::new(Config::for_test());
    let handler = RecordingHandler::new();
    runtime
        .broker()
        .subscribe_default("Policy", handler.clone())
        .await
        .unwrap();

    runtime.start().await;
    runtime
        .record_event("Policy", "POL-1", created(100), None)
        .await
        .unwrap();

    assert!(wait_for(Duration::from_secs(2), || handler.calls() == 1).await);
    runtime.shutdown().await;

    assert!(!runtime.outbox().is_polling());
    let entries = runtime.outbox().get_all_entries().await;
    assert_eq!(entries[0].status, OutboxStatus::Published);
    assert_eq!(handler.received()[0].payload["type"], "PolicyCreated");
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let runtime = IntegrationRuntime::new(Config::for_test());
    runtime.start().await;
    runtime.start().await;
    assert!(runtime.outbox().is_polling());
    runtime.shutdown().await;
    assert!(!runtime.outbox().is_polling());
}

#[tokio::test]
async fn test_polling_disabled() {
    let mut config = Config::for_test();
    config.outbox.polling_enabled = false;
    let runtime = IntegrationRuntime::new(config);

    runtime.start().await;
    assert!(!runtime.outbox().is_polling());
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_configured_queue_route() {
    let mut config = Config::for_test();
    config.outbox.route = RouteConfig {
        route_type: RouteType::Queue,
        name: "integration-events".to_string(),
    };
    let runtime = IntegrationRuntime::new(config);
    runtime
        .record_event("Policy", "POL-1", created(100), None)
        .await
        .unwrap();

    assert_eq!(runtime.outbox().process_pending().await.published, 1);
    assert_eq!(runtime.broker().get_queue_size("integration-events").await, 1);
}

#[tokio::test]
async fn test_purge_outbox_keeps_recent_entries() {
    let runtime = IntegrationRuntime::new(Config::for_test());
    runtime
        .record_event("Policy", "POL-1", created(100), None)
        .await
        .unwrap();
    runtime.outbox().process_pending().await;

    // default retention is 24h
    assert_eq!(runtime.purge_outbox().await, 0);
    assert_eq!(runtime.outbox().get_all_entries().await.len(), 1);
}

#[tokio::test]
async fn test_saga_uses_configured_step_timeout() {
    let mut config = Config::for_test();
    config.saga = SagaConfig {
        step_timeout_ms: Some(20),
    };
    let runtime = IntegrationRuntime::new(config);

    let mut saga = runtime.saga("slow");
    saga.add_step(SagaStep::new("hang", |_ctx: SagaContext| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok::<_, BoxError>(SagaContext::new())
    }));

    let execution = saga.execute(SagaContext::new()).await.unwrap();
    assert_eq!(saga.name(), "slow");
    assert_eq!(execution.status, SagaStatus::Compensated);
}
