use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::watch;

use courier_relay::channel::DurableChannel;
use courier_relay::domain::repository::OutboxStore;
use courier_relay::infra::memory::InMemoryOutboxStore;
use courier_relay::relay::{InterruptReason, RelayScheduler, TickOutcome};
use courier_relay::usecase::produce::{CreateAndEnqueueUseCase, CreateMessageInput};

use crate::helpers::{
    FlakyStore, LosingLock, MockPublisher, PublishMode, content_of, envelope_at, local_locks,
    settings,
};

fn memory_channel() -> Arc<DurableChannel<InMemoryOutboxStore>> {
    Arc::new(DurableChannel::new(InMemoryOutboxStore::new(), 1000))
}

// ── Delivery ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn should_publish_and_remove_enqueued_message() {
    let channel = memory_channel();
    let publisher = MockPublisher::succeeding();
    let producer = CreateAndEnqueueUseCase {
        channel: Arc::clone(&channel),
    };
    let m1 = producer
        .execute(CreateMessageInput {
            content: "hello".to_owned(),
            partition_key: Some("eu".to_owned()),
        })
        .await
        .unwrap();

    let scheduler = RelayScheduler::new(
        Arc::clone(&channel),
        local_locks(),
        publisher.clone(),
        settings(),
    );
    let outcome = scheduler.tick().await;

    assert_eq!(outcome, TickOutcome::Drained { delivered: 1 });
    assert_eq!(channel.pending().await.unwrap(), 0);
    let published = publisher.published.lock().unwrap().clone();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, m1.id.to_string());
    assert_eq!(content_of(&published[0].1), "hello");
}

#[tokio::test(start_paused = true)]
async fn should_keep_message_when_publish_fails_and_deliver_it_later() {
    let channel = memory_channel();
    let publisher = MockPublisher::new(PublishMode::Fail);
    let m2 = envelope_at("second", "eu", 10);
    channel.enqueue(&m2).await.unwrap();
    let scheduler = RelayScheduler::new(
        Arc::clone(&channel),
        local_locks(),
        publisher.clone(),
        settings(),
    );

    let failed = scheduler.tick().await;
    assert_eq!(
        failed,
        TickOutcome::Interrupted {
            delivered: 0,
            reason: InterruptReason::PublishFailed,
        }
    );
    assert_eq!(channel.store().find_by_id(m2.id).await.unwrap(), Some(m2.clone()));

    publisher.set_mode(PublishMode::Succeed);
    let delivered = scheduler.tick().await;
    assert_eq!(delivered, TickOutcome::Drained { delivered: 1 });
    assert_eq!(channel.store().find_by_id(m2.id).await.unwrap(), None);
    assert_eq!(publisher.published_keys(), vec![m2.id.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn should_treat_publish_timeout_as_failure() {
    let channel = memory_channel();
    let publisher = MockPublisher::new(PublishMode::Hang);
    channel.enqueue(&envelope_at("slow", "eu", 10)).await.unwrap();
    let scheduler = RelayScheduler::new(
        Arc::clone(&channel),
        local_locks(),
        publisher.clone(),
        settings(),
    );

    let outcome = scheduler.tick().await;

    assert_eq!(
        outcome,
        TickOutcome::Interrupted {
            delivered: 0,
            reason: InterruptReason::PublishTimedOut,
        }
    );
    assert_eq!(channel.pending().await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn should_report_idle_when_outbox_is_empty() {
    let publisher = MockPublisher::succeeding();
    let scheduler = RelayScheduler::new(memory_channel(), local_locks(), publisher.clone(), settings());

    assert_eq!(scheduler.tick().await, TickOutcome::Idle);
    assert_eq!(publisher.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn should_publish_in_creation_order() {
    let channel = memory_channel();
    let (a, b, c) = (
        envelope_at("a", "eu", 1),
        envelope_at("b", "us", 2),
        envelope_at("c", "eu", 3),
    );
    for envelope in [&c, &a, &b] {
        channel.enqueue(envelope).await.unwrap();
    }
    let publisher = MockPublisher::succeeding();
    let scheduler = RelayScheduler::new(
        Arc::clone(&channel),
        local_locks(),
        publisher.clone(),
        settings(),
    );

    assert_eq!(scheduler.tick().await, TickOutcome::Drained { delivered: 3 });
    assert_eq!(
        publisher.published_keys(),
        vec![a.id.to_string(), b.id.to_string(), c.id.to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn should_stop_tick_at_first_failure() {
    let channel = memory_channel();
    for secs in 1..=3 {
        channel
            .enqueue(&envelope_at("queued", "eu", secs))
            .await
            .unwrap();
    }
    let publisher = MockPublisher::new(PublishMode::Fail);
    let scheduler = RelayScheduler::new(
        Arc::clone(&channel),
        local_locks(),
        publisher.clone(),
        settings(),
    );

    scheduler.tick().await;

    assert_eq!(publisher.attempts(), 1);
    assert_eq!(channel.pending().await.unwrap(), 3);
}

// ── Crash recovery ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn should_redeliver_message_claimed_by_crashed_relay() {
    let store = InMemoryOutboxStore::with_visibility_timeout(Duration::from_secs(30));
    let channel = Arc::new(DurableChannel::new(store, 1000));
    let envelope = envelope_at("survivor", "eu", 10);
    channel.enqueue(&envelope).await.unwrap();

    // A relay claims the envelope and dies before publishing.
    let mut crashed = channel.begin().await.unwrap();
    let claimed = channel.poll(&mut crashed, Duration::ZERO).await.unwrap();
    assert_eq!(claimed.as_ref(), Some(&envelope));
    crashed.abandon();

    let publisher = MockPublisher::succeeding();
    let scheduler = RelayScheduler::new(
        Arc::clone(&channel),
        local_locks(),
        publisher.clone(),
        settings(),
    );
    assert_eq!(scheduler.tick().await, TickOutcome::Idle);
    assert_eq!(channel.pending().await.unwrap(), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(scheduler.tick().await, TickOutcome::Drained { delivered: 1 });
    assert_eq!(publisher.published_keys(), vec![envelope.id.to_string()]);
    assert_eq!(channel.pending().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn should_roll_back_tick_when_store_fails() {
    let store = FlakyStore::new();
    let channel = Arc::new(DurableChannel::new(store.clone(), 1000));
    let envelope = envelope_at("retry-me", "eu", 10);
    channel.enqueue(&envelope).await.unwrap();
    let publisher = MockPublisher::succeeding();
    let scheduler = RelayScheduler::new(
        Arc::clone(&channel),
        local_locks(),
        publisher.clone(),
        settings(),
    );

    store.fail_deletes.store(true, Ordering::SeqCst);
    assert_eq!(
        scheduler.tick().await,
        TickOutcome::Interrupted {
            delivered: 0,
            reason: InterruptReason::StoreFailed,
        }
    );
    assert_eq!(channel.pending().await.unwrap(), 1);

    // The lock was released and the claim rolled back, so the next tick
    // delivers again; the duplicate is left to the idempotent consumer.
    store.fail_deletes.store(false, Ordering::SeqCst);
    assert_eq!(scheduler.tick().await, TickOutcome::Drained { delivered: 1 });
    assert_eq!(channel.pending().await.unwrap(), 0);
    assert_eq!(
        publisher.published_keys(),
        vec![envelope.id.to_string(), envelope.id.to_string()]
    );
}

// ── Failure tracking ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn should_count_consecutive_failures_until_delivery() {
    let channel = memory_channel();
    let envelope = envelope_at("poison", "eu", 10);
    channel.enqueue(&envelope).await.unwrap();
    let publisher = MockPublisher::new(PublishMode::Fail);
    let scheduler = RelayScheduler::new(
        Arc::clone(&channel),
        local_locks(),
        publisher.clone(),
        settings(),
    );

    for _ in 0..4 {
        scheduler.tick().await;
    }
    assert_eq!(scheduler.failure_count(envelope.id), 4);
    assert_eq!(channel.pending().await.unwrap(), 1);

    publisher.set_mode(PublishMode::Succeed);
    scheduler.tick().await;
    assert_eq!(scheduler.failure_count(envelope.id), 0);
    assert_eq!(channel.pending().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn should_forget_failures_of_messages_removed_elsewhere() {
    let channel = memory_channel();
    let envelope = envelope_at("abandoned", "eu", 10);
    channel.enqueue(&envelope).await.unwrap();
    let publisher = MockPublisher::new(PublishMode::Fail);
    let scheduler = RelayScheduler::new(
        Arc::clone(&channel),
        local_locks(),
        publisher.clone(),
        settings(),
    );

    scheduler.tick().await;
    scheduler.tick().await;
    assert_eq!(scheduler.failure_count(envelope.id), 2);

    // An operator deletes the record by hand.
    assert!(channel.store().delete_by_id(envelope.id).await.unwrap());
    assert_eq!(scheduler.tick().await, TickOutcome::Idle);
    assert_eq!(scheduler.failure_count(envelope.id), 0);
}

// ── Mutual exclusion ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn should_let_only_one_scheduler_drain_at_a_time() {
    let store = InMemoryOutboxStore::new();
    let locks = local_locks();
    let publisher = MockPublisher::new(PublishMode::Delay(Duration::from_millis(50)));
    for secs in 1..=3 {
        store
            .insert(&envelope_at("shared", "eu", secs))
            .await
            .unwrap();
    }

    let first = RelayScheduler::new(
        Arc::new(DurableChannel::new(store.clone(), 1000)),
        locks.clone(),
        publisher.clone(),
        settings(),
    );
    let second = RelayScheduler::new(
        Arc::new(DurableChannel::new(store.clone(), 1000)),
        locks.clone(),
        publisher.clone(),
        settings(),
    );

    let (a, b) = tokio::join!(first.tick(), second.tick());

    let outcomes = [a, b];
    assert!(outcomes.contains(&TickOutcome::Busy), "got {outcomes:?}");
    assert!(
        outcomes.contains(&TickOutcome::Drained { delivered: 3 }),
        "got {outcomes:?}"
    );
    let keys = publisher.published_keys();
    let unique: HashSet<_> = keys.iter().collect();
    assert_eq!(keys.len(), 3);
    assert_eq!(unique.len(), 3);
    assert_eq!(store.count_pending().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn should_end_tick_when_lock_is_lost() {
    let channel = memory_channel();
    for secs in 1..=2 {
        channel
            .enqueue(&envelope_at("leased", "eu", secs))
            .await
            .unwrap();
    }
    let publisher = MockPublisher::succeeding();
    let scheduler = RelayScheduler::new(
        Arc::clone(&channel),
        LosingLock {
            inner: local_locks(),
        },
        publisher.clone(),
        settings(),
    );

    let outcome = scheduler.tick().await;

    assert_eq!(
        outcome,
        TickOutcome::Interrupted {
            delivered: 1,
            reason: InterruptReason::LockLost,
        }
    );
    assert_eq!(channel.pending().await.unwrap(), 1);
}

// ── Run loop ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn should_deliver_on_schedule_until_shutdown() {
    let channel = memory_channel();
    let publisher = MockPublisher::succeeding();
    let scheduler = RelayScheduler::new(
        Arc::clone(&channel),
        local_locks(),
        publisher.clone(),
        settings(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let producer = async {
        channel.enqueue(&envelope_at("first", "eu", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        channel.enqueue(&envelope_at("second", "eu", 2)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        shutdown_tx.send(true).unwrap();
    };
    tokio::join!(scheduler.run(shutdown_rx), producer);

    assert_eq!(publisher.published_keys().len(), 2);
    assert_eq!(channel.pending().await.unwrap(), 0);
}
