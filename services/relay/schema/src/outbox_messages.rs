use sea_orm::entity::prelude::*;

/// Pending outbox envelope. Rows are inserted by producers and deleted by the
/// relay once the broker confirms delivery; they are never updated.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "outbox_messages")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub partition_key: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Serialized message exactly as it is published to the broker.
    pub payload_bytes: Vec<u8>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
