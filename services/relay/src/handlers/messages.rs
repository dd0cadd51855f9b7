use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_core::serde::{opt_rfc3339, to_rfc3339_ms};
use courier_domain::envelope::Envelope;
use courier_domain::id::MessageId;

use crate::domain::types::{DEFAULT_PENDING_LIMIT, PendingFilter};
use crate::error::OutboxError;
use crate::state::AppState;
use crate::usecase::admin::{
    DeleteMessageUseCase, GetMessageUseCase, ListPendingUseCase, OutboxStatsUseCase,
};
use crate::usecase::produce::{CreateAndEnqueueUseCase, CreateMessageInput};

// ── DTOs ─────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateMessageRequest {
    pub content: String,
    #[serde(default, alias = "region")]
    pub partition_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListPendingQuery {
    pub partition_key: Option<String>,
    #[serde(default, deserialize_with = "opt_rfc3339")]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "opt_rfc3339")]
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct EnvelopeResponse {
    pub id: MessageId,
    pub partition_key: String,
    #[serde(serialize_with = "to_rfc3339_ms")]
    pub created_at: DateTime<Utc>,
    pub content: String,
    pub payload_size: usize,
}

impl From<Envelope> for EnvelopeResponse {
    fn from(envelope: Envelope) -> Self {
        Self {
            id: envelope.id,
            partition_key: envelope.partition_key,
            created_at: envelope.created_at,
            content: String::from_utf8_lossy(&envelope.payload).into_owned(),
            payload_size: envelope.payload.len(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub pending: u64,
    pub capacity: u64,
}

// ── Handlers ─────────────────────────────────────────────────────────────────

pub async fn create_message(
    State(state): State<AppState>,
    Json(body): Json<CreateMessageRequest>,
) -> Result<(StatusCode, Json<EnvelopeResponse>), OutboxError> {
    let usecase = CreateAndEnqueueUseCase {
        channel: state.channel.clone(),
    };
    let envelope = usecase
        .execute(CreateMessageInput {
            content: body.content,
            partition_key: body.partition_key,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(envelope.into())))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<ListPendingQuery>,
) -> Result<Json<Vec<EnvelopeResponse>>, OutboxError> {
    let usecase = ListPendingUseCase {
        store: state.outbox_store(),
    };
    let filter = PendingFilter {
        partition_key: query.partition_key.filter(|k| !k.is_empty()),
        created_after: query.created_after,
        created_before: query.created_before,
        limit: query.limit.unwrap_or(DEFAULT_PENDING_LIMIT),
    };
    let envelopes = usecase.execute(filter).await?;
    Ok(Json(envelopes.into_iter().map(Into::into).collect()))
}

pub async fn get_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<EnvelopeResponse>, OutboxError> {
    let usecase = GetMessageUseCase {
        store: state.outbox_store(),
    };
    let envelope = usecase.execute(MessageId(id)).await?;
    Ok(Json(envelope.into()))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, OutboxError> {
    let usecase = DeleteMessageUseCase {
        store: state.outbox_store(),
    };
    usecase.execute(MessageId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, OutboxError> {
    let usecase = OutboxStatsUseCase {
        channel: state.channel.clone(),
    };
    let stats = usecase.execute().await?;
    Ok(Json(StatsResponse {
        pending: stats.pending,
        capacity: stats.capacity,
    }))
}
