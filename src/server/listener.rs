//! TCP listener and relay routing loop

use super::connection::{connection_writer_task, ConnectionHandle, OUTBOUND_QUEUE};
use super::pending::{PendingRequests, PendingResult};
use super::session::{ClientSession, ConnectionRole};
use crate::config::ServerConfig;
use crate::error::RelayError;
use crate::protocol::{
    read_frame, ErrorBody, InstanceStatus, InstancesMessage, ListInstancesMessage, Message,
    PingMessage, RegisterMessage, RegisteredMessage, RequestMessage, ResponseMessage,
    StatusMessage, RELAY_VERSION,
};
use crate::registry::{sanitize_detail, Instance, InstanceRegistry};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use uuid::Uuid;

/// State shared by every connection task
///
/// Built once at startup; the registry and the pending map are the only
/// cross-connection resources.
pub struct RelayState {
    pub registry: RwLock<InstanceRegistry>,
    pub pending: Mutex<PendingRequests>,
    pub config: ServerConfig,
}

impl RelayState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: RwLock::new(InstanceRegistry::new()),
            pending: Mutex::new(PendingRequests::new()),
            config,
        }
    }
}

/// Relay server bound to a TCP address
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Bind the listening socket
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind relay server on {}", addr))?;
        Ok(Self {
            listener,
            state: Arc::new(RelayState::new(config)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared state handle, e.g. for inspecting the registry
    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Accept connections until a shutdown signal arrives
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        tracing::info!("Relay server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }

                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, state).await {
                                    tracing::error!("Connection {} error: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        let registry = self.state.registry.read().await;
        tracing::info!("Closing {} instance connection(s)", registry.len());
        for info in registry.list() {
            if let Some(instance) = registry.get(&info.instance_id) {
                instance.connection.close();
            }
        }
    }
}

/// Handle a single accepted socket until it closes
async fn handle_connection(stream: TcpStream, state: Arc<RelayState>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();

    let (tx, rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let connection = ConnectionHandle::new(tx);
    let connection_id = connection.id();
    let writer_handle = tokio::spawn(connection_writer_task(writer, rx));

    tracing::debug!("Connection {} accepted from {:?}", connection_id, peer);

    let mut role = ConnectionRole::Unknown;
    let mut client_session: Option<Arc<ClientSession>> = None;

    loop {
        let frame = tokio::select! {
            _ = connection.closed() => {
                tracing::info!("Connection {} closed by relay", connection_id);
                break;
            }
            frame = read_frame(&mut reader) => frame,
        };

        let msg = match frame {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                tracing::debug!("Connection {} ({}) disconnected", connection_id, role.label());
                break;
            }
            Err(e) => {
                tracing::warn!(
                    "Protocol error on connection {} ({}): {}",
                    connection_id,
                    role.label(),
                    e
                );
                break;
            }
        };

        match msg {
            Message::Register(register) => {
                match &role {
                    ConnectionRole::Client => {
                        tracing::warn!("Client connection {} tried to REGISTER", connection_id);
                        break;
                    }
                    ConnectionRole::Instance { instance_id } => {
                        tracing::warn!(
                            "Connection {} is already registered as {}; ignoring REGISTER",
                            connection_id,
                            instance_id
                        );
                        continue;
                    }
                    ConnectionRole::Unknown => {}
                }
                match handle_register(&state, &connection, &register).await {
                    Ok(instance_id) => role = ConnectionRole::Instance { instance_id },
                    Err(e) => {
                        tracing::warn!("Rejected registration on {}: {}", connection_id, e);
                        let _ = connection
                            .send(Message::Registered(RegisteredMessage {
                                success: false,
                                ref_id: None,
                                relay_version: RELAY_VERSION.to_string(),
                                error: Some(e.to_body()),
                            }))
                            .await;
                        break;
                    }
                }
            }

            Message::Status(status) => match &role {
                ConnectionRole::Instance { instance_id } => {
                    handle_status(&state, instance_id, status).await;
                }
                _ => tracing::warn!("Ignoring STATUS from non-instance {}", connection_id),
            },

            Message::Response(response) => match &role {
                ConnectionRole::Instance { instance_id } => {
                    let id = response.id.clone();
                    if !state.pending.lock().await.complete(response) {
                        tracing::debug!(
                            "Dropping late or unknown response {} from {}",
                            id,
                            instance_id
                        );
                    }
                }
                _ => tracing::warn!("Ignoring RESPONSE from non-instance {}", connection_id),
            },

            Message::Request(request) => {
                if let ConnectionRole::Instance { .. } = role {
                    tracing::warn!("Instance connection {} sent a REQUEST", connection_id);
                    break;
                }
                role = ConnectionRole::Client;
                let session = client_session
                    .get_or_insert_with(|| Arc::new(ClientSession::new(connection.clone())))
                    .clone();
                tokio::spawn(route_request(Arc::clone(&state), session, request));
            }

            Message::ListInstances(ListInstancesMessage { id }) => {
                let instances = state.registry.read().await.list();
                let _ = connection
                    .send(Message::Instances(InstancesMessage { id, instances }))
                    .await;
            }

            Message::Ping(PingMessage { ts }) => {
                let _ = connection.send(Message::Pong(PingMessage { ts })).await;
            }

            other @ (Message::Registered(_) | Message::Instances(_) | Message::Pong(_)) => {
                tracing::warn!(
                    "Unexpected {} frame on connection {}",
                    other.kind(),
                    connection_id
                );
            }
        }
    }

    if let ConnectionRole::Instance { instance_id } = &role {
        handle_instance_disconnect(&state, instance_id, connection_id).await;
    }

    drop(client_session);
    drop(connection);
    // Let queued frames flush; a registry entry in its grace period still
    // holds a sender, so the writer may never finish on its own
    let mut writer_handle = writer_handle;
    if tokio::time::timeout(Duration::from_secs(1), &mut writer_handle)
        .await
        .is_err()
    {
        writer_handle.abort();
    }

    tracing::debug!("Connection handler finished: {}", connection_id);
    Ok(())
}

async fn handle_register(
    state: &Arc<RelayState>,
    connection: &ConnectionHandle,
    register: &RegisterMessage,
) -> Result<String, RelayError> {
    let registration = {
        let mut registry = state.registry.write().await;
        registry.register(register, connection.clone())?
    };

    if let Some(old) = registration.replaced {
        tracing::info!(
            "Instance {} re-registered; closing previous connection {}",
            register.instance_id,
            old.id()
        );
        old.close();
    }

    tracing::info!(
        "Instance registered: {} ({} {}) ref_id={}",
        register.instance_id,
        register.project_name,
        register.application_version,
        registration.ref_id
    );

    let _ = connection
        .send(Message::Registered(RegisteredMessage {
            success: true,
            ref_id: Some(registration.ref_id),
            relay_version: RELAY_VERSION.to_string(),
            error: None,
        }))
        .await;

    Ok(register.instance_id.trim().to_string())
}

async fn handle_status(state: &Arc<RelayState>, instance_id: &str, status: StatusMessage) {
    let detail = sanitize_detail(status.detail.as_deref());
    let updated = state
        .registry
        .write()
        .await
        .mark_status(instance_id, status.status, detail.clone());
    if updated {
        tracing::info!(
            "Instance {} status -> {}{}",
            instance_id,
            status.status,
            detail.map(|d| format!(" ({})", d)).unwrap_or_default()
        );
    }
}

/// An instance socket went away: fail its in-flight requests and schedule removal
///
/// The registry is updated before pending requests are failed. Requests are
/// dispatched under the registry read lock, so each one either sees the
/// instance as gone or is already pending when the failures go out.
async fn handle_instance_disconnect(state: &Arc<RelayState>, instance_id: &str, connection_id: Uuid) {
    let grace = state.config.disconnect_grace();
    let marked = {
        let mut registry = state.registry.write().await;
        if grace.is_zero() {
            registry.remove_connection(instance_id, connection_id).is_some()
        } else {
            registry.mark_disconnected(instance_id, connection_id)
        }
    };

    let failed = state.pending.lock().await.fail_connection(connection_id);
    if failed > 0 {
        tracing::info!(
            "Instance {} dropped with {} request(s) in flight",
            instance_id,
            failed
        );
    }

    if !marked {
        return;
    }
    if grace.is_zero() {
        tracing::info!("Instance unregistered: {}", instance_id);
        return;
    }
    tracing::info!("Instance {} disconnected; removing in {:?}", instance_id, grace);

    let state = Arc::clone(state);
    let instance_id = instance_id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        let removed = state
            .registry
            .write()
            .await
            .remove_connection(&instance_id, connection_id);
        if removed.is_some() {
            tracing::info!("Instance unregistered after grace period: {}", instance_id);
        }
    });
}

/// Route one client request and deliver exactly one response for it
async fn route_request(state: Arc<RelayState>, session: Arc<ClientSession>, request: RequestMessage) {
    let client_request_id = request.id.clone();
    let command = request.command.clone();

    let mut response = match forward_request(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!("Request {} ({}) failed: {}", client_request_id, command, e);
            ResponseMessage::failure(String::new(), e.to_body())
        }
    };
    response.id = client_request_id;
    session.stamp_versions(&mut response);

    if session
        .connection()
        .send(Message::Response(response))
        .await
        .is_err()
    {
        tracing::debug!("Client went away before its {} response", command);
    }
}

/// Resolve the target and register the pending entry in one registry snapshot
async fn dispatch(
    state: &Arc<RelayState>,
    selector: Option<&str>,
    relay_id: &str,
) -> Result<(Instance, oneshot::Receiver<PendingResult>), RelayError> {
    let registry = state.registry.read().await;
    let target = registry.resolve(selector)?;
    ensure_ready(&target)?;
    let reply = state.pending.lock().await.insert(
        relay_id,
        target.connection_id(),
        target.instance_id(),
    );
    Ok((target, reply))
}

fn ensure_ready(target: &Instance) -> Result<(), RelayError> {
    match target.status() {
        InstanceStatus::Ready => Ok(()),
        InstanceStatus::Reloading | InstanceStatus::Disconnected => Err(RelayError::reloading(
            format!("Instance '{}' is reloading", target.instance_id()),
        )),
        InstanceStatus::Busy => {
            let detail = target
                .info
                .detail
                .as_deref()
                .map(|d| format!(" ({})", d))
                .unwrap_or_default();
            Err(RelayError::busy(format!(
                "Instance '{}' is busy{}",
                target.instance_id(),
                detail
            )))
        }
    }
}

async fn forward_request(
    state: &Arc<RelayState>,
    request: RequestMessage,
) -> Result<ResponseMessage, RelayError> {
    let timeout = request
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.config.request_timeout());
    let relay_id = Uuid::new_v4().to_string();
    let (target, reply) = dispatch(state, request.instance.as_deref(), &relay_id).await?;

    let forwarded = RequestMessage {
        id: relay_id.clone(),
        command: request.command,
        params: request.params,
        instance: None,
        timeout_ms: Some(timeout.as_millis() as u64),
    };

    tracing::debug!(
        "Forwarding {} to {} as {}",
        forwarded.command,
        target.instance_id(),
        relay_id
    );

    if target.connection.send(Message::Request(forwarded)).await.is_err() {
        state.pending.lock().await.cancel(&relay_id);
        return Err(RelayError::reloading(format!(
            "Instance '{}' connection is closing",
            target.instance_id()
        )));
    }

    match tokio::time::timeout(timeout, reply).await {
        Ok(Ok(Ok(mut response))) => {
            normalize_response(&mut response);
            if response.bridge_version.is_empty() {
                response.bridge_version = target.info.bridge_version.clone();
            }
            Ok(response)
        }
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(_)) => Err(RelayError::reloading(format!(
            "Instance '{}' went away before responding",
            target.instance_id()
        ))),
        Err(_) => {
            state.pending.lock().await.cancel(&relay_id);
            Err(RelayError::timeout(format!(
                "No response from '{}' within {}ms",
                target.instance_id(),
                timeout.as_millis()
            )))
        }
    }
}

/// Keep `data` present iff success and `error` present iff failure
fn normalize_response(response: &mut ResponseMessage) {
    if response.success {
        response.error = None;
        response.data.get_or_insert_with(Default::default);
    } else {
        response.data = None;
        response.error.get_or_insert_with(|| ErrorBody {
            code: "UNKNOWN_ERROR".to_string(),
            message: "Instance reported a failure without details".to_string(),
        });
    }
}
