//! Pending-request correlation between clients and instances

use crate::error::RelayError;
use crate::protocol::ResponseMessage;
use std::collections::HashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

pub type PendingResult = Result<ResponseMessage, RelayError>;

struct PendingEntry {
    connection_id: Uuid,
    instance_id: String,
    reply: oneshot::Sender<PendingResult>,
}

/// Requests forwarded to an instance and still awaiting their response
///
/// Keys are relay-assigned correlation ids, so two clients reusing the same
/// request id never collide.
#[derive(Default)]
pub struct PendingRequests {
    entries: HashMap<String, PendingEntry>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a forwarded request; the receiver yields its outcome
    pub fn insert(
        &mut self,
        relay_id: impl Into<String>,
        connection_id: Uuid,
        instance_id: impl Into<String>,
    ) -> oneshot::Receiver<PendingResult> {
        let (reply, rx) = oneshot::channel();
        self.entries.insert(
            relay_id.into(),
            PendingEntry {
                connection_id,
                instance_id: instance_id.into(),
                reply,
            },
        );
        rx
    }

    /// Deliver a response; false if nobody is waiting for it any more
    pub fn complete(&mut self, response: ResponseMessage) -> bool {
        match self.entries.remove(&response.id) {
            Some(entry) => entry.reply.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Forget a request, e.g. after its timer fired
    pub fn cancel(&mut self, relay_id: &str) -> bool {
        self.entries.remove(relay_id).is_some()
    }

    /// Fail every request routed over a connection that went away
    pub fn fail_connection(&mut self, connection_id: Uuid) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.connection_id == connection_id)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &ids {
            if let Some(entry) = self.entries.remove(id) {
                let _ = entry.reply.send(Err(RelayError::reloading(format!(
                    "Instance '{}' disconnected while handling the request (domain reload?)",
                    entry.instance_id
                ))));
            }
        }
        ids.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
