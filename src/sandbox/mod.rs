//! Isolated, resource-bounded execution of untrusted code.
//!
//! # Lifecycle
//!
//! 1. [`Sandbox::start`] creates a container with every limit applied in one call
//! 2. [`Container::run_command`] executes inside it, bounded by a deadline and a
//!    [`CancellationToken`]
//! 3. [`Container::stop`] removes the container and its anonymous volumes
//!
//! A [`Container`] that is dropped without `stop` (early return, panic, a
//! cancelled future) still removes itself, via [`SandboxRuntime::remove_detached`].
//! Cancelling a build never relies on interrupting host code: the container is
//! what gets killed.

pub mod docker;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxConfig;

pub use docker::DockerRuntime;

/// Label attached to every container we create; `clean` only touches these.
pub const SANDBOX_LABEL: &str = "gradebox.sandbox";

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command cancelled")]
    Cancelled,

    #[error("docker {op} failed: {message}")]
    Docker { op: &'static str, message: String },

    #[error("failed to run docker: {0}")]
    Io(#[from] std::io::Error),
}

pub type SandboxFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, SandboxError>> + Send + 'a>>;

/// Ceilings applied when a container is created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceLimits {
    pub memory: Option<String>,
    pub memory_swap: Option<String>,
    pub network_disabled: bool,
    pub max_procs: u32,
    pub max_files: u32,
    pub nice: i32,
    pub cpus: Option<String>,
    pub apparmor_profile: Option<String>,
}

impl From<&SandboxConfig> for ResourceLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            memory: config.memory_limit.clone(),
            memory_swap: config.memory_swap_limit.clone(),
            network_disabled: config.network_disabled,
            max_procs: config.max_procs,
            max_files: config.max_files,
            nice: config.nice_limit,
            cpus: config.cpu_limit.clone(),
            apparmor_profile: config.apparmor_profile.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub limits: ResourceLimits,
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, the way a terminal would show them.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanReport {
    pub containers: usize,
    pub images: usize,
}

/// Container engine operations. Implemented by [`DockerRuntime`]; tests plug in fakes.
pub trait SandboxRuntime: Send + Sync {
    /// Create and start a container; returns its id.
    fn create<'a>(&'a self, spec: &'a ContainerSpec) -> SandboxFuture<'a, String>;

    fn exec<'a>(
        &'a self,
        id: &'a str,
        argv: &'a [String],
        timeout: Duration,
        cancel: &'a CancellationToken,
    ) -> SandboxFuture<'a, CommandOutput>;

    /// Kill the container and delete its anonymous volumes.
    fn remove<'a>(&'a self, id: &'a str) -> SandboxFuture<'a, ()>;

    /// Fire-and-forget variant of `remove`, callable from `Drop`.
    fn remove_detached(&self, id: &str);

    /// Remove every labelled container and all dangling images.
    fn clean(&self) -> SandboxFuture<'_, CleanReport>;
}

/// Entry point for starting sandboxed containers with the configured limits.
#[derive(Clone)]
pub struct Sandbox {
    runtime: Arc<dyn SandboxRuntime>,
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: SandboxConfig) -> Self {
        Self { runtime, config }
    }

    pub fn docker(config: SandboxConfig) -> Self {
        let runtime = Arc::new(DockerRuntime::new(config.docker_bin.clone()));
        Self::new(runtime, config)
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }

    pub fn spec(&self, image: Option<&str>, mounts: Vec<Mount>) -> ContainerSpec {
        ContainerSpec {
            image: image.unwrap_or(&self.config.image).to_string(),
            limits: ResourceLimits::from(&self.config),
            mounts,
        }
    }

    pub async fn start(
        &self,
        image: Option<&str>,
        mounts: Vec<Mount>,
    ) -> Result<Container, SandboxError> {
        let spec = self.spec(image, mounts);
        let id = self.runtime.create(&spec).await?;
        tracing::debug!(container = %id, image = %spec.image, "Container started");
        Ok(Container {
            id,
            runtime: self.runtime.clone(),
            released: false,
        })
    }

    pub async fn clean(&self) -> Result<CleanReport, SandboxError> {
        let report = self.runtime.clean().await?;
        tracing::info!(
            containers = report.containers,
            images = report.images,
            "Removed leftover sandbox containers and dangling images"
        );
        Ok(report)
    }
}

/// A running container. Removed on `stop`, or on drop as a fallback.
pub struct Container {
    id: String,
    runtime: Arc<dyn SandboxRuntime>,
    released: bool,
}

impl Container {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn run_command(
        &self,
        argv: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SandboxError> {
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        self.runtime.exec(&self.id, argv, timeout, cancel).await
    }

    /// Run `payload` with bash as `user`. Quote interpolated values with [`bash_quote`].
    pub async fn bash(
        &self,
        payload: &str,
        user: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SandboxError> {
        let argv = [
            "su".to_string(),
            "-c".to_string(),
            payload.to_string(),
            "-s".to_string(),
            "/bin/bash".to_string(),
            user.to_string(),
        ];
        self.run_command(&argv, timeout, cancel).await
    }

    pub async fn stop(mut self) -> Result<(), SandboxError> {
        self.released = true;
        let result = self.runtime.remove(&self.id).await;
        if let Err(ref e) = result {
            tracing::warn!(container = %self.id, error = %e, "Failed to remove container");
        }
        result
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(container = %self.id, "Container dropped without stop, removing");
            self.runtime.remove_detached(&self.id);
        }
    }
}

/// POSIX single-quote escaping for values interpolated into a bash payload.
pub fn bash_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
