//! Per-connection session state

use super::connection::ConnectionHandle;
use crate::protocol::{ResponseMessage, RELAY_VERSION};
use std::sync::atomic::{AtomicBool, Ordering};

/// What a connection turned out to be after its first envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Nothing received yet
    Unknown,
    /// Registered application instance
    Instance { instance_id: String },
    /// Command-issuing client
    Client,
}

impl ConnectionRole {
    pub fn label(&self) -> &str {
        match self {
            ConnectionRole::Unknown => "unknown",
            ConnectionRole::Instance { .. } => "instance",
            ConnectionRole::Client => "client",
        }
    }
}

/// State of one client connection shared with its in-flight request tasks
#[derive(Debug)]
pub struct ClientSession {
    connection: ConnectionHandle,
    versions_sent: AtomicBool,
}

impl ClientSession {
    pub fn new(connection: ConnectionHandle) -> Self {
        Self {
            connection,
            versions_sent: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Fill version fields on the first response of this connection only
    ///
    /// Later responses go out with empty fields.
    pub fn stamp_versions(&self, response: &mut ResponseMessage) {
        if self.versions_sent.swap(true, Ordering::SeqCst) {
            response.relay_version.clear();
            response.bridge_version.clear();
        } else {
            response.relay_version = RELAY_VERSION.to_string();
        }
    }
}
