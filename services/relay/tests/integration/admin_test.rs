use std::sync::Arc;

use courier_domain::id::MessageId;
use courier_relay::channel::DurableChannel;
use courier_relay::domain::types::PendingFilter;
use courier_relay::error::OutboxError;
use courier_relay::infra::memory::InMemoryOutboxStore;
use courier_relay::usecase::admin::{
    DeleteMessageUseCase, GetMessageUseCase, ListPendingUseCase, OutboxStats, OutboxStatsUseCase,
};

use crate::helpers::envelope_at;

async fn seeded() -> (InMemoryOutboxStore, Vec<courier_domain::envelope::Envelope>) {
    let store = InMemoryOutboxStore::new();
    let envelopes = vec![
        envelope_at("a", "eu", 1),
        envelope_at("b", "us", 2),
        envelope_at("c", "eu", 3),
    ];
    let channel = DurableChannel::new(store.clone(), 10);
    for envelope in &envelopes {
        channel.enqueue(envelope).await.unwrap();
    }
    (store, envelopes)
}

// ── ListPending ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn should_list_pending_by_partition_key() {
    let (store, envelopes) = seeded().await;
    let usecase = ListPendingUseCase { store };

    let found = usecase
        .execute(PendingFilter {
            partition_key: Some("eu".to_owned()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(found, vec![envelopes[0].clone(), envelopes[2].clone()]);
}

#[tokio::test]
async fn should_list_pending_older_than_cutoff() {
    let (store, envelopes) = seeded().await;
    let usecase = ListPendingUseCase { store };

    let found = usecase
        .execute(PendingFilter {
            created_before: Some(envelopes[1].created_at),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(found, vec![envelopes[0].clone(), envelopes[1].clone()]);
}

#[tokio::test]
async fn should_clamp_zero_limit_to_one() {
    let (store, envelopes) = seeded().await;
    let usecase = ListPendingUseCase { store };

    let found = usecase
        .execute(PendingFilter {
            limit: 0,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(found, vec![envelopes[0].clone()]);
}

// ── GetMessage ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn should_get_pending_message() {
    let (store, envelopes) = seeded().await;
    let usecase = GetMessageUseCase { store };

    let found = usecase.execute(envelopes[1].id).await.unwrap();

    assert_eq!(found, envelopes[1]);
}

#[tokio::test]
async fn should_return_not_found_for_unknown_id() {
    let (store, _) = seeded().await;
    let usecase = GetMessageUseCase { store };

    let result = usecase.execute(MessageId::generate()).await;

    assert!(
        matches!(result, Err(OutboxError::NotFound)),
        "expected NotFound, got {result:?}"
    );
}

// ── DeleteMessage ────────────────────────────────────────────────────────────

#[tokio::test]
async fn should_delete_idempotently() {
    let (store, envelopes) = seeded().await;
    let usecase = DeleteMessageUseCase {
        store: store.clone(),
    };

    assert!(usecase.execute(envelopes[0].id).await.unwrap());
    assert!(!usecase.execute(envelopes[0].id).await.unwrap());
    assert!(!usecase.execute(MessageId::generate()).await.unwrap());
    assert_eq!(store.snapshot().len(), 2);
}

// ── Stats ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn should_report_pending_and_capacity() {
    let (store, _) = seeded().await;
    let usecase = OutboxStatsUseCase {
        channel: Arc::new(DurableChannel::new(store, 50)),
    };

    let stats = usecase.execute().await.unwrap();

    assert_eq!(
        stats,
        OutboxStats {
            pending: 3,
            capacity: 50,
        }
    );
}
