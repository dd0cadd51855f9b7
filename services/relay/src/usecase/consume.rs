use courier_domain::id::MessageId;
use courier_domain::message::OutboxMessage;

use crate::domain::repository::{MessageHandler, ProcessedLog};
use crate::domain::types::{Delivery, Disposition, ProcessingClaim};

/// Handle one broker delivery at most once per message id.
pub struct ConsumeUseCase<H, D>
where
    H: MessageHandler,
    D: ProcessedLog,
{
    pub handler: H,
    pub processed: D,
}

impl<H, D> ConsumeUseCase<H, D>
where
    H: MessageHandler,
    D: ProcessedLog,
{
    pub async fn execute(&self, delivery: &Delivery) -> Disposition {
        let id: MessageId = match delivery.key.parse() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(
                    entry_id = %delivery.entry_id,
                    key = %delivery.key,
                    error = %e,
                    "delivery key is not a message id"
                );
                return Disposition::Retry;
            }
        };

        let message = match OutboxMessage::from_bytes(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(message_id = %id, error = %e, "undecodable delivery payload");
                return Disposition::Retry;
            }
        };

        match self.processed.try_claim(id).await {
            Ok(ProcessingClaim::Acquired) => {}
            Ok(ProcessingClaim::AlreadyProcessed) => {
                tracing::debug!(message_id = %id, "duplicate delivery skipped");
                return Disposition::Ack;
            }
            Ok(ProcessingClaim::InFlight) => {
                tracing::debug!(message_id = %id, "same message in flight elsewhere, deferring");
                return Disposition::Retry;
            }
            Err(e) => {
                tracing::warn!(message_id = %id, error = %e.detail(), "processing claim failed");
                return Disposition::Retry;
            }
        }

        if let Err(e) = self.handler.handle(&message).await {
            tracing::error!(message_id = %id, error = format!("{e:#}"), "message handler failed");
            if let Err(e) = self.processed.release_claim(id).await {
                tracing::warn!(message_id = %id, error = %e.detail(), "failed to release processing claim");
            }
            return Disposition::Retry;
        }

        // Already handled. If the mark is lost, the lease still blocks
        // redeliveries until it expires.
        if let Err(e) = self.processed.mark_processed(id).await {
            tracing::warn!(message_id = %id, error = %e.detail(), "failed to record processed message");
        }
        Disposition::Ack
    }
}

/// Default handler: logs each message.
pub struct LoggingHandler;

impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: &OutboxMessage) -> anyhow::Result<()> {
        tracing::info!(
            message_id = %message.id,
            partition_key = %message.partition_key,
            content = %message.content,
            "message consumed"
        );
        Ok(())
    }
}
