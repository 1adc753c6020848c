//! Container-runtime adapter interface.
//!
//! The engine drives a container runtime exclusively through
//! [`ContainerRuntime`]. Every failure is a value; the step runner
//! translates errors into failure events, never unwinding.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use stevedore_config::{PortMapping, VolumeMount};

/// Opaque identifier of a container created by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeContainer(String);

impl RuntimeContainer {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RuntimeContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier or tag of an image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeImage(String);

impl RuntimeImage {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RuntimeImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of the per-run task network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeNetwork(String);

impl RuntimeNetwork {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RuntimeNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Runtime adapter errors.
///
/// `Command` carries the underlying CLI output so failure events can show
/// the user what the runtime actually said.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("'{command}' failed: {message}")]
    Command { command: String, message: String },
    #[error("could not parse runtime output: {0}")]
    Malformed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
        }
    }
}

/// Everything the runtime needs to create a container.
#[derive(Debug, Clone)]
pub struct CreateContainerRequest {
    /// Runtime-visible container name, unique per run.
    pub name: String,
    /// Name other containers on the task network resolve this one by.
    pub network_alias: String,
    pub image: RuntimeImage,
    pub network: RuntimeNetwork,
    pub command: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<VolumeMount>,
    /// Health-check timing overrides; `None` values keep the image's own.
    pub health_interval: Option<Duration>,
    pub health_retries: Option<u32>,
    pub health_start_period: Option<Duration>,
    /// `uid:gid` override when running as the invoking user.
    pub user: Option<String>,
    /// Keep stdin open (set for the task container so `run` can attach).
    pub attach_stdin: bool,
    pub allocate_tty: bool,
}

/// Outcome of a remove call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    Removed,
    /// The container was already gone; treated as success by the engine.
    DidNotExist,
}

/// The most recent health-check probe result for a container.
#[derive(Debug, Clone)]
pub struct HealthCheckLogEntry {
    pub exit_code: i64,
    pub output: String,
}

/// Flow control for line-streamed runtime output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineControl {
    Continue,
    /// Stop streaming; the caller has seen what it needed.
    Stop,
}

/// Capability set the engine calls on the container runtime.
///
/// All calls are blocking from the caller's perspective; the dispatcher
/// runs them inside worker futures. Implementations must be safe to call
/// concurrently (the runtime daemon is shared, external state).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build an image from a directory, tagging it `tag`. Progress lines
    /// are forwarded verbatim to `on_line` as they are produced.
    async fn build_image(
        &self,
        dir: &std::path::Path,
        build_args: &BTreeMap<String, String>,
        tag: &str,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<RuntimeImage, RuntimeError>;

    /// Pull an image unless a matching tag is already present locally.
    async fn pull_if_missing(&self, reference: &str) -> Result<RuntimeImage, RuntimeError>;

    async fn create(&self, request: CreateContainerRequest)
        -> Result<RuntimeContainer, RuntimeError>;

    /// Start the container and attach stdio; returns its exit code.
    /// Interactive when the caller's stdin is a TTY.
    async fn run(&self, container: &RuntimeContainer, interactive: bool)
        -> Result<i64, RuntimeError>;

    async fn start(&self, container: &RuntimeContainer) -> Result<(), RuntimeError>;

    async fn stop(&self, container: &RuntimeContainer) -> Result<(), RuntimeError>;

    async fn remove(
        &self,
        container: &RuntimeContainer,
        force: bool,
    ) -> Result<RemovalOutcome, RuntimeError>;

    /// Whether the container has a health check configured at all.
    async fn has_health_check(&self, container: &RuntimeContainer) -> Result<bool, RuntimeError>;

    /// Stream the container's runtime events (`die` and `health_status`
    /// transitions), one literal status line per callback invocation.
    /// Returns when the stream ends or the callback asks to stop.
    async fn stream_events(
        &self,
        container: &RuntimeContainer,
        on_line: &mut (dyn for<'a> FnMut(&'a str) -> LineControl + Send),
    ) -> Result<(), RuntimeError>;

    /// The most recent health-check probe for the container.
    async fn last_health_check(
        &self,
        container: &RuntimeContainer,
    ) -> Result<HealthCheckLogEntry, RuntimeError>;

    async fn create_network(&self, name: &str) -> Result<RuntimeNetwork, RuntimeError>;

    async fn delete_network(&self, network: &RuntimeNetwork) -> Result<(), RuntimeError>;

    /// Remove a temporary file generated to support the run.
    ///
    /// Lives on the adapter so engine tests can observe deletions; the
    /// default implementation hits the local filesystem.
    async fn delete_temporary_file(&self, path: &PathBuf) -> Result<(), RuntimeError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RuntimeError::Io(e)),
        }
    }
}
