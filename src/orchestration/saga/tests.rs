use super::*;
use crate::test_utils::{payload, NotificationSink};
use std::sync::Mutex;

type Trail = Arc<Mutex<Vec<String>>>;

fn ok_step(name: &str, key: &'static str) -> SagaStep {
    SagaStep::new(name, move |_ctx: SagaContext| async move {
        Ok::<_, BoxError>(payload(json!({ key: "done" })))
    })
}

fn recording_step(name: &'static str, trail: &Trail) -> SagaStep {
    let compensations = trail.clone();
    ok_step(name, name).with_compensation(move |_ctx: SagaContext| {
        let compensations = compensations.clone();
        async move {
            compensations.lock().unwrap().push(format!("c_{name}"));
            Ok::<(), BoxError>(())
        }
    })
}

fn failing_step(name: &str) -> SagaStep {
    SagaStep::new(name, |_ctx: SagaContext| async {
        Err::<SagaContext, BoxError>("step exploded".into())
    })
}

#[tokio::test]
async fn test_all_steps_succeed() {
    let mut saga = SagaOrchestrator::new("checkout");
    saga.add_step(ok_step("reserve", "reserved"))
        .add_step(ok_step("charge", "charged"));

    let execution = saga.execute(payload(json!({ "order": "O-1" }))).await.unwrap();

    assert_eq!(execution.status, SagaStatus::Completed);
    assert!(execution.is_completed());
    assert_eq!(execution.context["order"], "O-1");
    assert_eq!(execution.context["reserved"], "done");
    assert_eq!(execution.context["charged"], "done");
    assert_eq!(execution.log, vec!["reserve", "charge"]);
    assert!(execution.failed_step.is_none());
    assert!(execution.saga_id.starts_with("SAGA-"));
    assert!(execution.finished_at.is_some());
    assert_eq!(serde_json::to_value(&execution).unwrap()["status"], "COMPLETED");
}

#[tokio::test]
async fn test_steps_see_accumulated_context() {
    let mut saga = SagaOrchestrator::new("chain");
    saga.add_step(SagaStep::new("first", |_ctx: SagaContext| async {
        Ok::<_, BoxError>(payload(json!({ "count": 1 })))
    }))
    .add_step(SagaStep::new("second", |ctx: SagaContext| async move {
        let count = ctx["count"].as_i64().unwrap_or(0);
        Ok::<_, BoxError>(payload(json!({ "count": count + 1 })))
    }));

    let execution = saga.execute(SagaContext::new()).await.unwrap();
    assert_eq!(execution.context["count"], 2);
}

#[tokio::test]
async fn test_third_step_failure_compensates_in_reverse() {
    let trail: Trail = Arc::new(Mutex::new(Vec::new()));
    let mut saga = SagaOrchestrator::new("booking");
    saga.add_step(recording_step("s1", &trail))
        .add_step(recording_step("s2", &trail))
        .add_step(failing_step("s3").with_compensation({
            let trail = trail.clone();
            move |_ctx: SagaContext| {
                let trail = trail.clone();
                async move {
                    trail.lock().unwrap().push("c_s3".to_string());
                    Ok::<(), BoxError>(())
                }
            }
        }));

    let execution = saga.execute(SagaContext::new()).await.unwrap();

    assert_eq!(execution.status, SagaStatus::Compensated);
    assert_eq!(*trail.lock().unwrap(), vec!["c_s2", "c_s1"]);
    assert_eq!(execution.compensated, vec!["s2", "s1"]);
    assert_eq!(execution.failed_step.as_deref(), Some("s3"));
    assert_eq!(execution.error.as_deref(), Some("step exploded"));
    assert_eq!(execution.log, vec!["s1", "s2"]);
    assert_eq!(serde_json::to_value(&execution).unwrap()["status"], "COMPENSATED");
}

#[tokio::test]
async fn test_compensation_sees_context_at_failure() {
    let seen: Arc<Mutex<Option<SagaContext>>> = Arc::new(Mutex::new(None));
    let sink = seen.clone();

    let mut saga = SagaOrchestrator::new("ctx");
    saga.add_step(ok_step("a", "a_done").with_compensation(move |ctx: SagaContext| {
        let sink = sink.clone();
        async move {
            *sink.lock().unwrap() = Some(ctx);
            Ok::<(), BoxError>(())
        }
    }))
    .add_step(ok_step("b", "b_done"))
    .add_step(failing_step("c"));

    saga.execute(SagaContext::new()).await.unwrap();

    let ctx = seen.lock().unwrap().clone().unwrap();
    assert_eq!(ctx["a_done"], "done");
    assert_eq!(ctx["b_done"], "done");
}

#[tokio::test]
async fn test_steps_without_compensation_are_skipped() {
    let trail: Trail = Arc::new(Mutex::new(Vec::new()));
    let mut saga = SagaOrchestrator::new("partial");
    saga.add_step(recording_step("s1", &trail))
        .add_step(ok_step("s2", "s2"))
        .add_step(failing_step("s3"));

    let execution = saga.execute(SagaContext::new()).await.unwrap();
    assert_eq!(execution.status, SagaStatus::Compensated);
    assert_eq!(execution.compensated, vec!["s1"]);
    assert_eq!(*trail.lock().unwrap(), vec!["c_s1"]);
}

#[tokio::test]
async fn test_failing_compensation_does_not_stop_rollback() {
    let trail: Trail = Arc::new(Mutex::new(Vec::new()));
    let mut saga = SagaOrchestrator::new("stubborn");
    saga.add_step(recording_step("s1", &trail))
        .add_step(ok_step("s2", "s2").with_compensation(|_ctx: SagaContext| async {
            Err::<(), BoxError>("refund service down".into())
        }))
        .add_step(failing_step("s3"));

    let execution = saga.execute(SagaContext::new()).await.unwrap();

    assert_eq!(execution.status, SagaStatus::Compensated);
    assert_eq!(*trail.lock().unwrap(), vec!["c_s1"]);
    assert_eq!(
        execution.compensation_failures,
        vec![CompensationFailure {
            step: "s2".to_string(),
            error: "refund service down".to_string()
        }]
    );
}

#[tokio::test]
async fn test_first_step_failure_compensates_nothing() {
    let mut saga = SagaOrchestrator::new("early");
    saga.add_step(failing_step("s1"));

    let execution = saga.execute(SagaContext::new()).await.unwrap();
    assert_eq!(execution.status, SagaStatus::Compensated);
    assert!(execution.compensated.is_empty());
    assert!(execution.log.is_empty());
}

#[tokio::test]
async fn test_empty_saga_completes() {
    let saga = SagaOrchestrator::new("noop");
    let execution = saga.execute(payload(json!({ "x": 1 }))).await.unwrap();
    assert_eq!(execution.status, SagaStatus::Completed);
    assert_eq!(execution.context["x"], 1);
}

#[tokio::test]
async fn test_step_timeout_triggers_compensation() {
    let trail: Trail = Arc::new(Mutex::new(Vec::new()));
    let mut saga = SagaOrchestrator::new("slow").with_step_timeout(Duration::from_millis(20));
    saga.add_step(recording_step("s1", &trail))
        .add_step(SagaStep::new("hang", |_ctx: SagaContext| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, BoxError>(SagaContext::new())
        }));

    let execution = saga.execute(SagaContext::new()).await.unwrap();
    assert_eq!(execution.status, SagaStatus::Compensated);
    assert_eq!(execution.failed_step.as_deref(), Some("hang"));
    assert!(execution.error.unwrap().contains("timed out"));
    assert_eq!(*trail.lock().unwrap(), vec!["c_s1"]);
}

#[tokio::test]
async fn test_lifecycle_notifications() {
    let sink = NotificationSink::new();
    let mut saga = SagaOrchestrator::new("observed");
    saga.on_event(sink.observer());
    saga.on_event(|_: &Notification| Err("observer down".into()));
    saga.add_step(ok_step("s1", "s1"));

    saga.execute(SagaContext::new()).await.unwrap();

    assert_eq!(
        sink.kinds(),
        vec![
            NotificationKind::SagaStarted,
            NotificationKind::StepStarted,
            NotificationKind::StepCompleted,
            NotificationKind::SagaCompleted,
        ]
    );
}

#[tokio::test]
async fn test_compensation_notifications() {
    let sink = NotificationSink::new();
    let trail: Trail = Arc::new(Mutex::new(Vec::new()));
    let mut saga = SagaOrchestrator::new("observed");
    saga.on_event(sink.observer());
    saga.add_step(recording_step("s1", &trail))
        .add_step(failing_step("s2"));

    saga.execute(SagaContext::new()).await.unwrap();

    assert_eq!(
        sink.kinds(),
        vec![
            NotificationKind::SagaStarted,
            NotificationKind::StepStarted,
            NotificationKind::StepCompleted,
            NotificationKind::StepStarted,
            NotificationKind::StepFailed,
            NotificationKind::CompensationStarted,
            NotificationKind::StepCompensated,
            NotificationKind::SagaCompensated,
        ]
    );
}

#[tokio::test]
async fn test_orchestrator_is_reusable() {
    let mut saga = SagaOrchestrator::new("again");
    saga.add_step(ok_step("s1", "s1"));

    let first = saga.execute(SagaContext::new()).await.unwrap();
    let second = saga.execute(SagaContext::new()).await.unwrap();
    assert_ne!(first.saga_id, second.saga_id);
    assert!(second.is_completed());
}

#[test]
fn test_status_transitions() {
    assert!(SagaStatus::Running.can_transition_to(SagaStatus::Completed));
    assert!(SagaStatus::Running.can_transition_to(SagaStatus::Compensated));
    assert!(!SagaStatus::Completed.can_transition_to(SagaStatus::Compensated));
    assert!(!SagaStatus::Compensated.can_transition_to(SagaStatus::Running));
}

#[tokio::test]
async fn test_panicking_step_is_compensated() {
    let trail: Trail = Arc::new(Mutex::new(Vec::new()));
    let mut saga = SagaOrchestrator::new("panicky");
    saga.add_step(recording_step("s1", &trail))
        .add_step(SagaStep::new("boom", |ctx: SagaContext| async move {
            if !ctx.contains_key("safe_mode") {
                panic!("step blew up");
            }
            Ok::<_, BoxError>(ctx)
        }));

    let execution = saga.execute(SagaContext::new()).await.unwrap();
    assert_eq!(execution.status, SagaStatus::Compensated);
    assert_eq!(execution.failed_step.as_deref(), Some("boom"));
    assert_eq!(execution.error.as_deref(), Some(STEP_PANICKED));
    assert_eq!(*trail.lock().unwrap(), vec!["c_s1"]);
}
