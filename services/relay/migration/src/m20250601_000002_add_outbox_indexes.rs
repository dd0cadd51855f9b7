use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Relay claim order and the created-after inspection query.
        manager
            .create_index(
                Index::create()
                    .table(OutboxMessages::Table)
                    .col(OutboxMessages::CreatedAt)
                    .col(OutboxMessages::Id)
                    .name("idx_outbox_messages_created_at_id")
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(OutboxMessages::Table)
                    .col(OutboxMessages::PartitionKey)
                    .col(OutboxMessages::CreatedAt)
                    .name("idx_outbox_messages_partition_key_created_at")
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_outbox_messages_partition_key_created_at")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_outbox_messages_created_at_id")
                    .to_owned(),
            )
            .await
    }
}

#[derive(Iden)]
enum OutboxMessages {
    Table,
    Id,
    PartitionKey,
    CreatedAt,
}
