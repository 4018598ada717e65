mod common;

use bpm_event_core::domain::entities::{TimerEventTriggerInstance, Trigger, TriggerState};
use chrono::Duration;
use common::*;

fn timer(process_instance_id: i64, event_instance_id: i64) -> TimerEventTriggerInstance {
    TimerEventTriggerInstance::new(TENANT, process_instance_id, event_instance_id, "Wait5Minutes")
}

#[tokio::test]
async fn test_one_shot_timer_fires_and_removes_its_row() {
    let node = TestNode::new();
    let timers = node.services.timers.as_ref();
    let engine = node.services.engine.as_ref();
    let scheduler = node.services.scheduler.as_ref();

    let armed = node
        .run(|tx| async move {
            timers
                .arm_timer(&tx, timer(100, 7), Trigger::one_shot("ignored", t0() + Duration::minutes(5)))
                .await
        })
        .await
        .unwrap();
    assert_eq!(armed.execution_date, Some(t0() + Duration::minutes(5)));
    let armed = &armed;

    let (by_event, trigger) = node
        .run(|tx| async move {
            let by_event = engine.get_timer_trigger_instance_of_event_instance(&tx, 7).await?;
            let trigger = scheduler.get_trigger(&tx, &armed.group, &armed.trigger_name).await?;
            Ok((by_event, trigger))
        })
        .await
        .unwrap();
    assert_eq!(by_event.unwrap().id, armed.id);
    assert_eq!(trigger.unwrap().next_fire_time, armed.execution_date);

    node.advance_minutes(5);
    assert_eq!(scheduler.run_due_jobs().await.unwrap().executed, 1);

    let fired = node.timers.fired.lock().await.clone();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].event_instance_id, 7);

    let (row, trigger) = node
        .run(|tx| async move {
            let row = engine.get_timer_trigger_instance(&tx, &armed.id).await?;
            let trigger = scheduler.get_trigger(&tx, &armed.group, &armed.trigger_name).await?;
            Ok((row, trigger))
        })
        .await
        .unwrap();
    assert!(row.is_none());
    assert_eq!(trigger.unwrap().state, TriggerState::Done);
}

#[tokio::test]
async fn test_cancel_is_idempotent_and_stops_the_firing() {
    let node = TestNode::new();
    let timers = node.services.timers.as_ref();
    let scheduler = node.services.scheduler.as_ref();

    let armed = node
        .run(|tx| async move {
            timers
                .arm_timer(&tx, timer(100, 7), Trigger::one_shot("ignored", t0() + Duration::minutes(1)))
                .await
        })
        .await
        .unwrap();
    let armed = &armed;

    node.run(|tx| async move {
        timers.cancel_timer(&tx, armed).await?;
        timers.cancel_timer(&tx, armed).await
    })
    .await
    .unwrap();

    let exists = node
        .run(|tx| async move { scheduler.is_existing_job(&tx, TENANT, &armed.job_name).await })
        .await
        .unwrap();
    assert!(!exists);

    node.advance_minutes(1);
    assert_eq!(scheduler.run_due_jobs().await.unwrap().claimed, 0);
    assert!(node.timers.fired.lock().await.is_empty());
}

#[tokio::test]
async fn test_firing_without_row_is_ignored() {
    let node = TestNode::new();
    let timers = node.services.timers.as_ref();
    let engine = node.services.engine.as_ref();
    let scheduler = node.services.scheduler.as_ref();

    let armed = node
        .run(|tx| async move {
            timers
                .arm_timer(&tx, timer(100, 7), Trigger::one_shot("ignored", t0()))
                .await
        })
        .await
        .unwrap();
    let armed = &armed;

    // Only the second step of a cancellation went through
    node.run(|tx| async move { engine.delete_timer_trigger_instance(&tx, &armed.id).await })
        .await
        .unwrap();

    let report = scheduler.run_due_jobs().await.unwrap();
    assert_eq!((report.executed, report.failed), (1, 0));
    assert!(node.timers.fired.lock().await.is_empty());
}

#[tokio::test]
async fn test_cycle_timer_keeps_its_row() {
    let node = TestNode::new();
    let timers = node.services.timers.as_ref();
    let engine = node.services.engine.as_ref();
    let scheduler = node.services.scheduler.as_ref();

    let armed = node
        .run(|tx| async move {
            timers
                .arm_timer(&tx, timer(100, 8), Trigger::interval("ignored", Duration::minutes(1), None))
                .await
        })
        .await
        .unwrap();
    let armed = &armed;

    for _ in 0..3 {
        assert_eq!(scheduler.run_due_jobs().await.unwrap().executed, 1);
        node.advance_minutes(1);
    }
    assert_eq!(node.timers.fired.lock().await.len(), 3);

    let row = node
        .run(|tx| async move { engine.get_timer_trigger_instance(&tx, &armed.id).await })
        .await
        .unwrap();
    assert!(row.is_some());
}

#[tokio::test]
async fn test_cancel_timers_of_process_instance() {
    let node = TestNode::new();
    let timers = node.services.timers.as_ref();
    let engine = node.services.engine.as_ref();

    let cancelled = node
        .run(|tx| async move {
            let at = t0() + Duration::hours(1);
            timers.arm_timer(&tx, timer(100, 1), Trigger::one_shot("t", at)).await?;
            timers.arm_timer(&tx, timer(100, 2), Trigger::one_shot("t", at)).await?;
            timers.arm_timer(&tx, timer(200, 3), Trigger::one_shot("t", at)).await?;
            timers.cancel_timers_of_process_instance(&tx, 100).await
        })
        .await
        .unwrap();
    assert_eq!(cancelled, 2);

    let (gone, kept) = node
        .run(|tx| async move {
            let gone = engine.get_timer_trigger_instances_of_process_instance(&tx, 100).await?;
            let kept = engine.get_timer_trigger_instances_of_process_instance(&tx, 200).await?;
            Ok((gone, kept))
        })
        .await
        .unwrap();
    assert!(gone.is_empty());
    assert_eq!(kept.len(), 1);
}
