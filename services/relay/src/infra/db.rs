use anyhow::Context as _;
use sea_orm::sea_query::{LockBehavior, LockType};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    DatabaseTransaction, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
    Select, TransactionTrait,
};
use uuid::Uuid;

use courier_domain::envelope::Envelope;
use courier_domain::id::MessageId;
use courier_relay_schema::outbox_messages;

use crate::domain::repository::{ClaimScope, OutboxStore};
use crate::domain::types::PendingFilter;
use crate::error::OutboxError;

// ── Outbox store ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct DbOutboxStore {
    pub db: DatabaseConnection,
}

impl OutboxStore for DbOutboxStore {
    type Claim = DbClaimScope;

    async fn insert(&self, envelope: &Envelope) -> Result<(), OutboxError> {
        insert_envelope(&self.db, envelope)
            .await
            .context("insert outbox message")?;
        Ok(())
    }

    async fn delete_by_id(&self, id: MessageId) -> Result<bool, OutboxError> {
        let result = outbox_messages::Entity::delete_by_id(id.as_uuid())
            .exec(&self.db)
            .await
            .context("delete outbox message")?;
        Ok(result.rows_affected > 0)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Envelope>, OutboxError> {
        let model = outbox_messages::Entity::find_by_id(id.as_uuid())
            .one(&self.db)
            .await
            .context("find outbox message by id")?;
        Ok(model.map(envelope_from_model))
    }

    async fn find_pending(&self, filter: &PendingFilter) -> Result<Vec<Envelope>, OutboxError> {
        let models = pending_query(filter)
            .all(&self.db)
            .await
            .context("find pending outbox messages")?;
        Ok(models.into_iter().map(envelope_from_model).collect())
    }

    async fn count_pending(&self) -> Result<u64, OutboxError> {
        let count = outbox_messages::Entity::find()
            .count(&self.db)
            .await
            .context("count pending outbox messages")?;
        Ok(count)
    }

    async fn begin_claim(&self) -> Result<DbClaimScope, OutboxError> {
        let txn = self.db.begin().await.context("begin claim transaction")?;
        Ok(DbClaimScope {
            txn,
            claimed: Vec::new(),
        })
    }
}

/// Write an envelope on any connection, including a caller's open
/// transaction so the envelope commits atomically with business rows.
///
/// Bypasses the channel's capacity ceiling.
pub async fn insert_envelope<C: ConnectionTrait>(
    conn: &C,
    envelope: &Envelope,
) -> Result<(), sea_orm::DbErr> {
    outbox_messages::ActiveModel {
        id: Set(envelope.id.as_uuid()),
        partition_key: Set(envelope.partition_key.clone()),
        created_at: Set(envelope.created_at),
        payload_bytes: Set(envelope.payload.clone()),
    }
    .insert(conn)
    .await?;
    Ok(())
}

fn envelope_from_model(model: outbox_messages::Model) -> Envelope {
    Envelope {
        id: MessageId(model.id),
        partition_key: model.partition_key,
        created_at: model.created_at,
        payload: model.payload_bytes,
    }
}

fn oldest_first(query: Select<outbox_messages::Entity>) -> Select<outbox_messages::Entity> {
    query
        .order_by_asc(outbox_messages::Column::CreatedAt)
        .order_by_asc(outbox_messages::Column::Id)
}

fn pending_query(filter: &PendingFilter) -> Select<outbox_messages::Entity> {
    let mut query = outbox_messages::Entity::find();
    if let Some(partition_key) = &filter.partition_key {
        query = query.filter(outbox_messages::Column::PartitionKey.eq(partition_key.clone()));
    }
    if let Some(after) = filter.created_after {
        query = query.filter(outbox_messages::Column::CreatedAt.gt(after));
    }
    if let Some(before) = filter.created_before {
        query = query.filter(outbox_messages::Column::CreatedAt.lte(before));
    }
    oldest_first(query).limit(filter.limit)
}

/// Oldest row not locked by another transaction and not already claimed in
/// this scope.
fn claim_query(claimed: &[Uuid]) -> Select<outbox_messages::Entity> {
    let mut query = oldest_first(outbox_messages::Entity::find())
        .limit(1)
        .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked);
    if !claimed.is_empty() {
        query = query.filter(outbox_messages::Column::Id.is_not_in(claimed.iter().copied()));
    }
    query
}

// ── Claim scope ───────────────────────────────────────────────────────────────

/// One relay tick's transaction. Claims are `FOR UPDATE SKIP LOCKED` row
/// locks, so they end with the transaction, or with the connection if the
/// process dies. Dropping the scope rolls back.
pub struct DbClaimScope {
    txn: DatabaseTransaction,
    claimed: Vec<Uuid>,
}

impl ClaimScope for DbClaimScope {
    async fn claim_next(&mut self) -> Result<Option<Envelope>, OutboxError> {
        let query = claim_query(&self.claimed);
        let model = query
            .one(&self.txn)
            .await
            .context("claim next outbox message")?;
        if let Some(model) = &model {
            self.claimed.push(model.id);
        }
        Ok(model.map(envelope_from_model))
    }

    async fn delete(&mut self, id: MessageId) -> Result<bool, OutboxError> {
        let result = outbox_messages::Entity::delete_by_id(id.as_uuid())
            .exec(&self.txn)
            .await
            .context("delete claimed outbox message")?;
        Ok(result.rows_affected > 0)
    }

    async fn release(&mut self, id: MessageId) -> Result<(), OutboxError> {
        // Row locks can't be dropped individually; the row unlocks at the end
        // of the transaction and stays excluded from this scope until then.
        tracing::debug!(message_id = %id, "claim released at end of tick");
        Ok(())
    }

    async fn commit(self) -> Result<(), OutboxError> {
        self.txn
            .commit()
            .await
            .context("commit claim transaction")?;
        Ok(())
    }
}
