//! Connection handles and the per-connection writer task

use crate::protocol::{write_frame, Message};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Outgoing queue depth per connection
pub const OUTBOUND_QUEUE: usize = 256;

/// Cloneable handle to a live socket owned by the relay
///
/// Messages are queued to the connection's writer task; `close` asks the
/// connection's read loop to shut the socket down.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    sender: mpsc::Sender<Message>,
    closer: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            closer: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a message for this connection
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| anyhow!("Connection {} is closed", self.id))
    }

    /// Request the connection to close
    ///
    /// The permit is stored, so a read loop that is not currently waiting
    /// still observes it on its next turn.
    pub fn close(&self) {
        self.closer.notify_one();
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        self.closer.notified().await;
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Drain queued messages onto the socket until the queue or socket closes
pub async fn connection_writer_task<W>(mut writer: W, mut receiver: mpsc::Receiver<Message>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = receiver.recv().await {
        if let Err(e) = write_frame(&mut writer, &msg).await {
            tracing::error!("Failed to write {} frame: {}", msg.kind(), e);
            break;
        }
    }

    tracing::debug!("Connection writer task finished");
}
