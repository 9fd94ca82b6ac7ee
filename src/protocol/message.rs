//! Message types for the relay protocol

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Opaque command parameters / result data
pub type Params = Map<String, Value>;

/// Envelope exchanged on every relay socket, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Instance -> relay: announce an application instance
    Register(RegisterMessage),

    /// Relay -> instance: registration outcome
    Registered(RegisteredMessage),

    /// Instance -> relay: in-band status change
    Status(StatusMessage),

    /// Client -> relay -> instance: command invocation
    Request(RequestMessage),

    /// Instance -> relay -> client: command outcome
    Response(ResponseMessage),

    /// Client -> relay: query registered instances
    ListInstances(ListInstancesMessage),

    /// Relay -> client: registered instances
    Instances(InstancesMessage),

    /// Liveness probe
    Ping(PingMessage),

    /// Liveness probe answer
    Pong(PingMessage),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Register(_) => "REGISTER",
            Message::Registered(_) => "REGISTERED",
            Message::Status(_) => "STATUS",
            Message::Request(_) => "REQUEST",
            Message::Response(_) => "RESPONSE",
            Message::ListInstances(_) => "LIST_INSTANCES",
            Message::Instances(_) => "INSTANCES",
            Message::Ping(_) => "PING",
            Message::Pong(_) => "PONG",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterMessage {
    pub instance_id: String,

    #[serde(default)]
    pub project_name: String,

    /// Version of the application (the Unity editor version)
    #[serde(default, rename = "unity_version", alias = "application_version")]
    pub application_version: String,

    /// Version of the in-process agent that registered; older agents omit it
    #[serde(default)]
    pub bridge_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisteredMessage {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<u32>,

    #[serde(default)]
    pub relay_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: InstanceStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Correlation token, unique per client connection
    pub id: String,

    pub command: String,

    #[serde(default)]
    pub params: Params,

    /// Instance selector; absent means "the only registered instance"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl RequestMessage {
    pub fn new(id: impl Into<String>, command: impl Into<String>, params: Params) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            params,
            instance: None,
            timeout_ms: None,
        }
    }

    pub fn with_instance(mut self, instance: Option<String>) -> Self {
        self.instance = instance;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: String,

    #[serde(default)]
    pub success: bool,

    /// Present iff `success`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Params>,

    /// Present iff not `success`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,

    #[serde(default)]
    pub relay_version: String,

    #[serde(default)]
    pub bridge_version: String,
}

impl ResponseMessage {
    pub fn ok(id: impl Into<String>, data: Params) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn failure(id: impl Into<String>, error: ErrorBody) -> Self {
        Self {
            id: id.into(),
            success: false,
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Error field of a RESPONSE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,

    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListInstancesMessage {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstancesMessage {
    pub id: String,
    pub instances: Vec<InstanceInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingMessage {
    /// Sender timestamp in milliseconds, echoed back
    #[serde(default)]
    pub ts: i64,
}

/// Runtime status of a registered instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Ready,
    Busy,
    Reloading,
    Disconnected,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Ready => "ready",
            InstanceStatus::Busy => "busy",
            InstanceStatus::Reloading => "reloading",
            InstanceStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public view of a registered instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub project_name: String,

    #[serde(rename = "unity_version", alias = "application_version")]
    pub application_version: String,

    #[serde(default)]
    pub bridge_version: String,

    pub status: InstanceStatus,
    pub ref_id: u32,
    pub is_default: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
