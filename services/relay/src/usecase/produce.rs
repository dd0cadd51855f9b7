use std::sync::Arc;

use courier_domain::envelope::Envelope;
use courier_domain::message::OutboxMessage;

use crate::channel::DurableChannel;
use crate::domain::repository::OutboxStore;
use crate::domain::types::DEFAULT_PARTITION_KEY;
use crate::error::OutboxError;

pub struct CreateMessageInput {
    pub content: String,
    /// Missing or blank falls back to [`DEFAULT_PARTITION_KEY`].
    pub partition_key: Option<String>,
}

/// Wrap new content in an envelope and store it in the outbox.
pub struct CreateAndEnqueueUseCase<S: OutboxStore> {
    pub channel: Arc<DurableChannel<S>>,
}

impl<S: OutboxStore> CreateAndEnqueueUseCase<S> {
    pub async fn execute(&self, input: CreateMessageInput) -> Result<Envelope, OutboxError> {
        if input.content.is_empty() {
            return Err(OutboxError::InvalidInput(
                "content must not be empty".to_owned(),
            ));
        }

        let partition_key = input
            .partition_key
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PARTITION_KEY.to_owned());
        let message = OutboxMessage::new(input.content, partition_key);
        let envelope = Envelope::seal(&message)?;
        self.channel.enqueue(&envelope).await?;

        tracing::info!(
            message_id = %envelope.id,
            partition_key = %envelope.partition_key,
            "message stored in outbox"
        );
        Ok(envelope)
    }
}
