//! Client - talks to the relay server on behalf of the CLI
//!
//! A [`RelayClient`] is one logical connection: it keeps a TCP stream open
//! across requests, reconnects when the stream breaks, and wraps every
//! command in the retry engine from [`retry`].

pub mod retry;
pub mod verbose;

pub use retry::{RetryDecision, RetryEvent, RetryLoop, RetryPolicy};
pub use verbose::Direction;

use crate::config::ClientConfig;
use crate::error::{InstanceErrorCode, RelayError};
use crate::protocol::{
    read_frame, write_frame, ErrorBody, InstanceInfo, ListInstancesMessage, Message, Params,
    PingMessage, RequestMessage, ResponseMessage,
};
use crate::status_file::{StatusDir, DEFAULT_MAX_AGE};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

/// Extra wait on top of a request's own timeout before giving up on the relay
const RESPONSE_SLACK: Duration = Duration::from_secs(2);

pub type RetryHook = Arc<dyn Fn(&RetryEvent) + Send + Sync>;
pub type TrafficHook = Arc<dyn Fn(Direction, &Message) + Send + Sync>;
pub type VersionHook = Arc<dyn Fn(&VersionInfo) + Send + Sync>;

/// Versions reported by the relay and the instance's bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub relay_version: String,
    pub bridge_version: String,
}

pub struct RelayClient {
    config: ClientConfig,
    policy: RetryPolicy,
    status_dir: StatusDir,
    stream: Option<TcpStream>,
    next_id: u64,
    versions_reported: bool,
    on_retry: Option<RetryHook>,
    on_traffic: Option<TrafficHook>,
    on_version: Option<VersionHook>,
}

impl RelayClient {
    pub fn new(config: ClientConfig) -> Self {
        let status_dir = match &config.status_dir {
            Some(dir) => StatusDir::new(dir),
            None => StatusDir::from_env(),
        };
        Self {
            policy: RetryPolicy::from_config(&config),
            config,
            status_dir,
            stream: None,
            next_id: 0,
            versions_reported: false,
            on_retry: None,
            on_traffic: None,
            on_version: None,
        }
    }

    pub fn with_status_dir(mut self, status_dir: StatusDir) -> Self {
        self.status_dir = status_dir;
        self
    }

    /// Called before each backoff sleep
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Called after every frame sent and every frame received
    pub fn on_traffic<F>(mut self, hook: F) -> Self
    where
        F: Fn(Direction, &Message) + Send + Sync + 'static,
    {
        self.on_traffic = Some(Arc::new(hook));
        self
    }

    /// Called once, on the first response that carries version info
    pub fn on_version_info<F>(mut self, hook: F) -> Self
    where
        F: Fn(&VersionInfo) + Send + Sync + 'static,
    {
        self.on_version = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Drop the connection; the next call reconnects
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("Closed relay connection");
        }
    }

    /// Send a command to the selected instance, retrying transient failures
    ///
    /// Returns the instance's `data` on success. Fatal errors come back as
    /// they are; a retry budget that runs out yields `RETRY_TIMEOUT`.
    pub async fn send_request(
        &mut self,
        command: &str,
        params: Params,
        timeout_ms: Option<u64>,
    ) -> Result<Params, RelayError> {
        let timeout_ms = timeout_ms.unwrap_or(self.config.timeout_ms);
        let started = Instant::now();
        let mut retry = RetryLoop::new(self.policy);
        let mut last_error: Option<RelayError> = None;

        loop {
            // Retries only get whatever is left of the retry budget
            let (attempt_ms, wait) = match &last_error {
                None => (
                    timeout_ms,
                    Duration::from_millis(timeout_ms).saturating_add(RESPONSE_SLACK),
                ),
                Some(last) => match retry.remaining(started.elapsed()) {
                    Some(left) => {
                        let left_ms = (left.as_millis() as u64).max(1);
                        (
                            timeout_ms.min(left_ms),
                            Duration::from_millis(timeout_ms)
                                .saturating_add(RESPONSE_SLACK)
                                .min(left),
                        )
                    }
                    None => return Err(retry.exhausted(last, started.elapsed())),
                },
            };

            let error = match self.request_once(command, &params, attempt_ms, wait).await {
                Ok(data) => return Ok(data),
                Err(error) => error,
            };

            let retryable = error.is_retryable() || self.reload_in_progress(&error);
            last_error = Some(error.clone());
            match retry.decide(error, started.elapsed(), retryable) {
                RetryDecision::Retry(event) => {
                    tracing::debug!(
                        "Retrying {} after {}: attempt {}, waiting {}ms",
                        command,
                        event.code,
                        event.attempt,
                        event.backoff_ms
                    );
                    if let Some(hook) = &self.on_retry {
                        hook(&event);
                    }
                    sleep(event.backoff()).await;
                }
                RetryDecision::GiveUp(error) => return Err(error),
            }
        }
    }

    /// Ask the relay which instances are registered
    pub async fn list_instances(&mut self) -> Result<Vec<InstanceInfo>, RelayError> {
        let id = self.next_request_id();
        let request = Message::ListInstances(ListInstancesMessage { id: id.clone() });
        match self.exchange(request, self.control_wait()).await? {
            Message::Instances(reply) if reply.id == id => Ok(reply.instances),
            other => Err(self.unexpected("INSTANCES", &other)),
        }
    }

    /// Round-trip a PING through the relay
    pub async fn ping(&mut self) -> Result<Duration, RelayError> {
        let started = Instant::now();
        let ts = chrono::Utc::now().timestamp_millis();
        match self
            .exchange(Message::Ping(PingMessage { ts }), self.control_wait())
            .await?
        {
            Message::Pong(pong) if pong.ts == ts => Ok(started.elapsed()),
            other => Err(self.unexpected("PONG", &other)),
        }
    }

    async fn request_once(
        &mut self,
        command: &str,
        params: &Params,
        timeout_ms: u64,
        wait: Duration,
    ) -> Result<Params, RelayError> {
        let id = self.next_request_id();
        let request = RequestMessage::new(id.clone(), command, params.clone())
            .with_instance(self.config.instance.clone())
            .with_timeout_ms(Some(timeout_ms));

        let response = match self.exchange(Message::Request(request), wait).await? {
            Message::Response(response) if response.id == id => response,
            other => return Err(self.unexpected("RESPONSE", &other)),
        };
        self.report_versions(&response);

        if response.success {
            return Ok(response.data.unwrap_or_default());
        }
        let body = response.error.unwrap_or_else(|| ErrorBody {
            code: "UNKNOWN_ERROR".to_string(),
            message: "Request failed without an error description".to_string(),
        });
        Err(RelayError::from_body(body))
    }

    /// `INSTANCE_NOT_FOUND` is worth retrying while the status file says a reload is underway
    fn reload_in_progress(&self, error: &RelayError) -> bool {
        if !matches!(
            error,
            RelayError::Instance {
                code: InstanceErrorCode::InstanceNotFound,
                ..
            }
        ) {
            return false;
        }

        let reloading = match self.config.instance.as_deref() {
            Some(selector) => self
                .status_dir
                .is_any_instance_reloading(selector, DEFAULT_MAX_AGE),
            None => self.status_dir.is_any_reloading(DEFAULT_MAX_AGE),
        };
        if reloading {
            tracing::debug!("Instance not registered but status file reports a reload");
        }
        reloading
    }

    fn report_versions(&mut self, response: &ResponseMessage) {
        if self.versions_reported {
            return;
        }
        if response.relay_version.is_empty() && response.bridge_version.is_empty() {
            return;
        }
        self.versions_reported = true;

        let info = VersionInfo {
            relay_version: response.relay_version.clone(),
            bridge_version: response.bridge_version.clone(),
        };
        tracing::debug!(
            "Relay version {:?}, bridge version {:?}",
            info.relay_version,
            info.bridge_version
        );
        if let Some(hook) = &self.on_version {
            hook(&info);
        }
    }

    async fn connect(&mut self) -> Result<&mut TcpStream, RelayError> {
        if self.stream.is_none() {
            let addr = self.config.relay_addr();
            let stream = match timeout(self.config.connect_timeout(), TcpStream::connect(&addr)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(RelayError::connection(format!(
                        "Cannot connect to relay server at {}: {}",
                        addr, e
                    )))
                }
                Err(_) => {
                    return Err(RelayError::connection(format!(
                        "Timed out connecting to relay server at {}",
                        addr
                    )))
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("Failed to set TCP_NODELAY: {}", e);
            }
            tracing::debug!("Connected to relay server at {}", addr);
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| RelayError::connection("Not connected to relay server"))
    }

    /// Send one frame and wait for the next frame back
    ///
    /// Any transport or framing failure drops the stream so the next call
    /// starts from a fresh connection.
    async fn exchange(&mut self, message: Message, wait: Duration) -> Result<Message, RelayError> {
        self.notify_traffic(Direction::Sent, &message);

        let result = {
            let stream = self.connect().await?;
            match timeout(wait, round_trip(stream, &message)).await {
                Ok(result) => result,
                Err(_) => Err(RelayError::timeout(format!(
                    "No answer from relay server within {}ms",
                    wait.as_millis()
                ))),
            }
        };

        match &result {
            Ok(reply) => self.notify_traffic(Direction::Received, reply),
            Err(e) => {
                tracing::debug!("Relay exchange failed: {}", e);
                self.stream = None;
            }
        }
        result
    }

    fn notify_traffic(&self, direction: Direction, message: &Message) {
        if let Some(hook) = &self.on_traffic {
            hook(direction, message);
        }
    }

    fn unexpected(&mut self, expected: &str, got: &Message) -> RelayError {
        self.stream = None;
        RelayError::protocol(format!("Expected {}, got {}", expected, got.kind()))
    }

    fn control_wait(&self) -> Duration {
        self.config.connect_timeout().saturating_add(RESPONSE_SLACK)
    }

    fn next_request_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }
}

async fn round_trip(stream: &mut TcpStream, message: &Message) -> Result<Message, RelayError> {
    write_frame(stream, message).await?;
    match read_frame(stream).await? {
        Some(reply) => Ok(reply),
        None => Err(RelayError::connection("Connection closed by relay server")),
    }
}
