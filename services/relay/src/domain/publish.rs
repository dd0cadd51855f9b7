use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::OutboxError;

/// Broker acknowledgement of a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Broker-assigned position of the message (a stream entry id for Redis).
    pub entry_id: String,
}

/// Completion of one publish call.
///
/// Resolves once the broker adapter reports success or failure. It carries no
/// deadline; callers wrap it in `tokio::time::timeout`. Dropping the handle
/// abandons the wait but not the send.
#[derive(Debug)]
pub struct PublishHandle {
    rx: oneshot::Receiver<Result<PublishReceipt, OutboxError>>,
}

/// Adapter side of a [`PublishHandle`].
#[derive(Debug)]
pub struct PublishCompleter {
    tx: oneshot::Sender<Result<PublishReceipt, OutboxError>>,
}

impl PublishHandle {
    pub fn pending() -> (PublishCompleter, PublishHandle) {
        let (tx, rx) = oneshot::channel();
        (PublishCompleter { tx }, PublishHandle { rx })
    }

    /// A handle that is already resolved.
    pub fn ready(result: Result<PublishReceipt, OutboxError>) -> Self {
        let (completer, handle) = Self::pending();
        completer.complete(result);
        handle
    }
}

impl PublishCompleter {
    pub fn complete(self, result: Result<PublishReceipt, OutboxError>) {
        // The waiter may have timed out and gone away.
        let _ = self.tx.send(result);
    }
}

impl Future for PublishHandle {
    type Output = Result<PublishReceipt, OutboxError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(outcome) => outcome,
            Err(_) => Err(OutboxError::PublishFailed(
                "publisher dropped the completion".to_owned(),
            )),
        })
    }
}
