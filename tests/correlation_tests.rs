mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bpm_event_core::core::jobs::{MessageRetentionJob, StatelessJob};
use bpm_event_core::domain::entities::{
    CatchEventKind, Correlation, JobParameters, MessageEventCouple, MessageInstance, WaitingEvent,
};
use bpm_event_core::AppError;
use common::*;
use serde_json::json;

fn order_catch(instance: i64, order_id: &str) -> WaitingEvent {
    WaitingEvent::message(
        "order-placed",
        vec![Correlation::new("orderId", order_id)],
        CatchEventKind::Intermediate,
        "Shop",
        "WaitForOrder",
    )
    .in_process_instance(instance, instance, instance * 10)
}

fn order_message(order_id: &str) -> MessageInstance {
    MessageInstance::new("order-placed", "Shop").with_correlation("orderId", order_id)
}

#[tokio::test]
async fn test_message_matches_when_it_carries_every_declared_correlation() {
    let node = TestNode::new();
    let engine = node.services.engine.as_ref();

    let couples = node
        .run(|tx| async move {
            let event = engine.create_waiting_event(&tx, order_catch(1, "42")).await?;
            engine.create_message_instance(&tx, order_message("43")).await?;
            let matching = engine
                .create_message_instance(&tx, order_message("42").with_correlation("customer", "7"))
                .await?;
            let couples = engine.get_message_event_couples(&tx, 10).await?;
            assert_eq!(couples.len(), 1);
            assert_eq!(couples[0].message.id, matching.id);
            assert_eq!(couples[0].waiting_event.id, event.id);
            Ok(couples)
        })
        .await
        .unwrap();

    let couple = &couples[0];
    assert!(couple.message.handled);
    assert!(couple.waiting_event.in_progress);

    // Claimed rows are not offered again
    let again = node
        .run(|tx| async move { engine.get_message_event_couples(&tx, 10).await })
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_ties_within_one_millisecond_follow_creation_order() {
    for _ in 0..20 {
        let node = TestNode::new();
        let engine = node.services.engine.as_ref();

        let (first_event, first_message, couples) = node
            .run(|tx| async move {
                let first_event = engine.create_waiting_event(&tx, order_catch(1, "42")).await?;
                engine.create_waiting_event(&tx, order_catch(2, "42")).await?;
                let first_message = engine.create_message_instance(&tx, order_message("42")).await?;
                engine.create_message_instance(&tx, order_message("42")).await?;
                let couples = engine.get_message_event_couples(&tx, 1).await?;
                Ok((first_event, first_message, couples))
            })
            .await
            .unwrap();

        assert_eq!(first_event.created_at, t0());
        assert_eq!(couples.len(), 1);
        assert_eq!(couples[0].waiting_event.id, first_event.id);
        assert_eq!(couples[0].message.id, first_message.id);
    }
}

#[tokio::test]
async fn test_message_to_named_flow_node_only_matches_that_node() {
    let node = TestNode::new();
    let engine = node.services.engine.as_ref();

    let couples = node
        .run(|tx| async move {
            engine.create_waiting_event(&tx, order_catch(1, "42")).await?;
            engine
                .create_message_instance(&tx, order_message("42").to_flow_node("SomewhereElse"))
                .await?;
            engine.get_message_event_couples(&tx, 10).await
        })
        .await
        .unwrap();
    assert!(couples.is_empty());
}

#[tokio::test]
async fn test_creation_validation() {
    let node = TestNode::new();
    let engine = node.services.engine.as_ref();

    let too_many = (0..6).fold(MessageInstance::new("order-placed", "Shop"), |message, i| {
        message.with_correlation(format!("key{}", i), "v")
    });
    let result = node
        .run(|tx| {
            let message = too_many.clone();
            async move { engine.create_message_instance(&tx, message).await }
        })
        .await;
    assert!(matches!(result, Err(AppError::CreationError { .. })));

    let result = node
        .run(|tx| async move {
            engine.create_waiting_event(&tx, order_catch(1, "42")).await?;
            engine.create_waiting_event(&tx, order_catch(1, "42")).await
        })
        .await;
    assert!(matches!(result, Err(AppError::CreationError { .. })));

    // The failed unit of work left nothing behind
    let couples = node
        .run(|tx| async move {
            engine.create_message_instance(&tx, order_message("42")).await?;
            engine.get_message_event_couples(&tx, 10).await
        })
        .await
        .unwrap();
    assert!(couples.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_passes_claim_each_message_at_most_once() {
    let node = TestNode::new();
    let engine = node.services.engine.as_ref();
    let pairs = 6;

    node.run(|tx| async move {
        for i in 0..pairs {
            engine
                .create_waiting_event(&tx, order_catch(i + 1, &format!("o{}", i)))
                .await?;
            engine.create_message_instance(&tx, order_message(&format!("o{}", i))).await?;
        }
        Ok(())
    })
    .await
    .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&node.services.engine);
        let executor = node.services.executor.clone();
        handles.push(tokio::spawn(async move {
            executor
                .execute(|tx| {
                    let engine = Arc::clone(&engine);
                    async move { engine.get_message_event_couples(&tx, 10).await }
                })
                .await
        }));
    }

    let mut claimed: Vec<MessageEventCouple> = Vec::new();
    for handle in handles {
        claimed.extend(handle.await.unwrap().unwrap());
    }
    // A pass that lost a race may have left a pair behind
    claimed.extend(
        node.run(|tx| async move { engine.get_message_event_couples(&tx, 10).await })
            .await
            .unwrap(),
    );

    let messages: HashSet<_> = claimed.iter().map(|c| c.message.id.clone()).collect();
    let events: HashSet<_> = claimed.iter().map(|c| c.waiting_event.id.clone()).collect();
    assert_eq!(claimed.len(), pairs as usize);
    assert_eq!(messages.len(), pairs as usize);
    assert_eq!(events.len(), pairs as usize);
    for couple in &claimed {
        assert_eq!(
            couple.message.correlation_value("orderId"),
            Some(couple.waiting_event.trigger.correlation_keys().unwrap()[0].value.as_str())
        );
    }
}

#[tokio::test]
async fn test_reset_sweeps_are_idempotent() {
    let node = TestNode::new();
    let engine = node.services.engine.as_ref();

    node.run(|tx| async move {
        for i in 0..2 {
            engine.create_waiting_event(&tx, order_catch(i + 1, "same")).await?;
            engine.create_message_instance(&tx, order_message("same")).await?;
        }
        let couples = engine.get_message_event_couples(&tx, 10).await?;
        assert_eq!(couples.len(), 2);
        Ok(())
    })
    .await
    .unwrap();

    let first = node
        .run(|tx| async move {
            let events = engine.reset_in_progress_waiting_events(&tx).await?;
            let messages = engine.reset_progress_message_instances(&tx).await?;
            Ok((events, messages))
        })
        .await
        .unwrap();
    assert_eq!(first, (2, 2));

    let second = node
        .run(|tx| async move {
            let events = engine.reset_in_progress_waiting_events(&tx).await?;
            let messages = engine.reset_progress_message_instances(&tx).await?;
            Ok((events, messages))
        })
        .await
        .unwrap();
    assert_eq!(second, (0, 0));

    let couples = node
        .run(|tx| async move { engine.get_message_event_couples(&tx, 10).await })
        .await
        .unwrap();
    assert_eq!(couples.len(), 2);
}

#[tokio::test]
async fn test_consume_keeps_start_events_and_release_gives_rows_back() {
    let node = TestNode::new();
    let engine = node.services.engine.as_ref();

    let start = WaitingEvent::message("order-placed", vec![], CatchEventKind::Start, "Shop", "OrderStart");
    let couples = node
        .run(|tx| {
            let start = start.clone();
            async move {
                engine.create_waiting_event(&tx, start).await?;
                engine.create_message_instance(&tx, order_message("1")).await?;
                engine.get_message_event_couples(&tx, 10).await
            }
        })
        .await
        .unwrap();
    let couple = couples[0].clone();

    let (message, event) = node
        .run(|tx| {
            let couple = couple.clone();
            async move {
                engine.consume_couple(&tx, &couple).await?;
                let message = engine.get_message_instance(&tx, &couple.message.id).await?;
                let event = engine.get_waiting_event(&tx, &couple.waiting_event.id).await?;
                Ok((message, event))
            }
        })
        .await
        .unwrap();
    assert!(message.is_none());
    let event = event.unwrap();
    assert!(event.is_matchable());

    let couples = node
        .run(|tx| async move {
            engine.create_message_instance(&tx, order_message("2")).await?;
            let couples = engine.get_message_event_couples(&tx, 10).await?;
            engine.release_couple(&tx, &couples[0]).await?;
            Ok(couples)
        })
        .await
        .unwrap();
    let released = &couples[0];

    let (message, event) = node
        .run(|tx| async move {
            let message = engine.get_message_instance(&tx, &released.message.id).await?;
            let event = engine.get_waiting_event(&tx, &released.waiting_event.id).await?;
            Ok((message, event))
        })
        .await
        .unwrap();
    assert!(!message.unwrap().handled);
    assert!(!event.unwrap().in_progress);
}

#[tokio::test]
async fn test_signals_and_boundary_errors() {
    let node = TestNode::new();
    let engine = node.services.engine.as_ref();

    node.run(|tx| async move {
        engine
            .create_waiting_event(&tx, WaitingEvent::signal("go", CatchEventKind::Start, "Shop", "SignalStart"))
            .await?;
        engine
            .create_waiting_event(
                &tx,
                WaitingEvent::signal("go", CatchEventKind::Intermediate, "Shop", "WaitGo").in_process_instance(1, 1, 10),
            )
            .await?;
        engine
            .create_waiting_event(&tx, WaitingEvent::boundary_error(None, 77, "Shop", "CatchAll"))
            .await?;
        engine
            .create_waiting_event(
                &tx,
                WaitingEvent::boundary_error(Some("E42".to_string()), 77, "Shop", "CatchE42"),
            )
            .await?;
        Ok(())
    })
    .await
    .unwrap();

    let (first, second) = node
        .run(|tx| async move {
            let first = engine.match_signal(&tx, "go", 10).await?;
            let second = engine.match_signal(&tx, "go", 10).await?;
            Ok((first, second))
        })
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    // The intermediate event is claimed, the start event stays
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].event_kind, CatchEventKind::Start);

    let (exact, fallback, none) = node
        .run(|tx| async move {
            let exact = engine.get_boundary_error_event(&tx, 77, Some("E42")).await?;
            let fallback = engine.get_boundary_error_event(&tx, 77, Some("E99")).await?;
            let none = engine.get_boundary_error_event(&tx, 78, Some("E42")).await?;
            Ok((exact, fallback, none))
        })
        .await
        .unwrap();
    assert_eq!(exact.unwrap().flow_node_name, "CatchE42");
    assert_eq!(fallback.unwrap().flow_node_name, "CatchAll");
    assert!(none.is_none());
}

#[tokio::test]
async fn test_owner_cleanup() {
    let node = TestNode::new();
    let engine = node.services.engine.as_ref();

    let deleted = node
        .run(|tx| async move {
            engine.create_waiting_event(&tx, order_catch(5, "a")).await?;
            engine
                .create_waiting_event(
                    &tx,
                    WaitingEvent::signal("go", CatchEventKind::Boundary, "Shop", "Cancel").in_process_instance(5, 5, 50),
                )
                .await?;
            engine.create_waiting_event(&tx, order_catch(6, "b")).await?;

            let of_node = engine.get_waiting_events_of_flow_node(&tx, 50).await?;
            assert_eq!(of_node.len(), 2);
            engine.delete_waiting_events_of_process_instance(&tx, 5).await
        })
        .await
        .unwrap();
    assert_eq!(deleted, 2);

    let remaining = node
        .run(|tx| async move { engine.get_waiting_events_of_flow_node(&tx, 60).await })
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
}

#[tokio::test]
async fn test_correlation_job_delivers_after_commit_and_releases_failed_deliveries() {
    let node = TestNode::new();
    let engine = node.services.engine.as_ref();
    node.services.register_platform_jobs(TENANT).await.unwrap();

    let (event, message) = node
        .run(|tx| async move {
            let event = engine.create_waiting_event(&tx, order_catch(1, "42")).await?;
            let message = engine.create_message_instance(&tx, order_message("42")).await?;
            Ok((event, message))
        })
        .await
        .unwrap();
    let (event, message) = (&event, &message);

    let report = node.services.scheduler.run_due_jobs().await.unwrap();
    assert_eq!(report.executed, 1);
    assert_eq!(node.couples.delivered_count().await, 1);

    let (gone_message, gone_event) = node
        .run(|tx| async move {
            let message = engine.get_message_instance(&tx, &message.id).await?;
            let event = engine.get_waiting_event(&tx, &event.id).await?;
            Ok((message, event))
        })
        .await
        .unwrap();
    assert!(gone_message.is_none());
    assert!(gone_event.is_none());

    node.couples.fail.store(true, Ordering::SeqCst);
    let (event, message) = node
        .run(|tx| async move {
            let event = engine.create_waiting_event(&tx, order_catch(2, "43")).await?;
            let message = engine.create_message_instance(&tx, order_message("43")).await?;
            Ok((event, message))
        })
        .await
        .unwrap();
    let (event, message) = (&event, &message);

    node.clock.advance(chrono::Duration::seconds(5));
    let report = node.services.scheduler.run_due_jobs().await.unwrap();
    assert_eq!(report.executed, 1);
    assert_eq!(node.couples.delivered_count().await, 1);

    let (message, event) = node
        .run(|tx| async move {
            let message = engine.get_message_instance(&tx, &message.id).await?;
            let event = engine.get_waiting_event(&tx, &event.id).await?;
            Ok((message, event))
        })
        .await
        .unwrap();
    assert!(!message.unwrap().handled);
    assert!(event.unwrap().is_matchable());
}

#[tokio::test]
async fn test_retention_job_deletes_only_expired_messages() {
    let node = TestNode::new();
    let engine = node.services.engine.as_ref();
    let old = node
        .run(|tx| async move { engine.create_message_instance(&tx, order_message("old")).await })
        .await
        .unwrap();

    node.advance_minutes(2);
    let fresh = node
        .run(|tx| async move { engine.create_message_instance(&tx, order_message("fresh")).await })
        .await
        .unwrap();

    let mut job = MessageRetentionJob::new(Arc::clone(&node.services.engine), node.clock.clone());
    assert!(matches!(
        job.set_attributes(&JobParameters::new()),
        Err(AppError::ConfigurationError(_))
    ));
    let mut attributes = JobParameters::new();
    attributes.insert("retention_millis".to_string(), json!(60_000));
    job.set_attributes(&attributes).unwrap();

    let (job, old, fresh) = (&job, &old, &fresh);
    node.run(|tx| async move { job.execute(&tx).await }).await.unwrap();

    let (old, fresh) = node
        .run(|tx| async move {
            let old = engine.get_message_instance(&tx, &old.id).await?;
            let fresh = engine.get_message_instance(&tx, &fresh.id).await?;
            Ok((old, fresh))
        })
        .await
        .unwrap();
    assert!(old.is_none());
    assert!(fresh.is_some());
}
