use sea_orm_migration::prelude::*;

mod m20250601_000001_create_outbox_messages;
mod m20250601_000002_add_outbox_indexes;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250601_000001_create_outbox_messages::Migration),
            Box::new(m20250601_000002_add_outbox_indexes::Migration),
        ]
    }
}
