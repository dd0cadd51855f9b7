use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::channel::DurableChannel;
use crate::infra::db::DbOutboxStore;

/// Shared application state passed to every handler via axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    /// The same channel the relay scheduler drains.
    pub channel: Arc<DurableChannel<DbOutboxStore>>,
}

impl AppState {
    pub fn outbox_store(&self) -> DbOutboxStore {
        DbOutboxStore {
            db: self.db.clone(),
        }
    }
}
