mod common;

use bpm_event_core::core::jobs::{MessageCorrelationJob, MessageRetentionJob};
use bpm_event_core::domain::entities::{CatchEventKind, MessageInstance, WaitingEvent};
use bpm_event_core::ServiceStatus;
use common::*;

#[tokio::test]
async fn test_start_hands_back_claimed_rows_before_scheduling() {
    let node = TestNode::new();
    let engine = node.services.engine.as_ref();

    // Claimed by a run that died before delivering
    let couples = node
        .run(|tx| async move {
            engine
                .create_waiting_event(
                    &tx,
                    WaitingEvent::message("ping", vec![], CatchEventKind::Intermediate, "Echo", "WaitPing")
                        .in_process_instance(1, 1, 10),
                )
                .await?;
            engine.create_message_instance(&tx, MessageInstance::new("ping", "Echo")).await?;
            engine.get_message_event_couples(&tx, 10).await
        })
        .await
        .unwrap();
    assert_eq!(couples.len(), 1);
    let couple = &couples[0];

    assert_eq!(node.services.status().await, ServiceStatus::Stopped);
    node.services.start().await.unwrap();
    assert_eq!(node.services.status().await, ServiceStatus::Running);
    assert!(node.services.scheduler.is_started());
    assert!(node.services.start().await.is_err());

    let (message, event) = node
        .run(|tx| async move {
            let message = engine.get_message_instance(&tx, &couple.message.id).await?;
            let event = engine.get_waiting_event(&tx, &couple.waiting_event.id).await?;
            Ok((message, event))
        })
        .await
        .unwrap();
    assert!(!message.unwrap().handled);
    assert!(event.unwrap().is_matchable());

    node.services.stop().await.unwrap();
    assert_eq!(node.services.status().await, ServiceStatus::Stopped);
    assert!(node.services.scheduler.is_stopped());
}

#[tokio::test]
async fn test_platform_jobs_are_registered_once() {
    let node = TestNode::new();
    let scheduler = node.services.scheduler.as_ref();

    node.services.register_platform_jobs(TENANT).await.unwrap();
    node.services.register_platform_jobs(TENANT).await.unwrap();

    let jobs = node
        .run(|tx| async move { scheduler.get_jobs(&tx, TENANT).await })
        .await
        .unwrap();
    let mut classes: Vec<_> = jobs.iter().map(|job| job.job_class_name.clone()).collect();
    classes.sort();
    assert_eq!(classes, vec![MessageCorrelationJob::CLASS_NAME, MessageRetentionJob::CLASS_NAME]);
}
