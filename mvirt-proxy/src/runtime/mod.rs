//! Runtime client interface.
//!
//! The supervisor never talks to an OCI runtime directly. It goes through the
//! traits in this module, which mirror what a container runtime control plane
//! offers: persisted container records, one task per container, and images.
//! [`youki`] provides the production implementation.

pub mod image;
pub mod spec;
pub mod youki;

use crate::config::SCOPE_LABEL;
use crate::error::RuntimeError;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use spec::{ExecSpec, SpecOptions};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Establishes fresh client connections to the runtime.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> RuntimeResult<Arc<dyn RuntimeClient>>;
}

/// A connection to the runtime control plane.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Load a persisted container. Fails with `NotFound` when absent.
    async fn load_container(&self, id: &str) -> RuntimeResult<Box<dyn Container>>;

    /// Create a container record.
    async fn new_container(
        &self,
        id: &str,
        opts: Vec<ContainerOpt>,
    ) -> RuntimeResult<Box<dyn Container>>;

    /// Look up a local image by reference. Fails with `NotFound` when absent.
    async fn get_image(&self, reference: &str) -> RuntimeResult<Image>;

    /// Pull an image from its registry and unpack it.
    async fn pull_image(&self, reference: &str) -> RuntimeResult<Image>;

    /// Import every image contained in a local OCI archive. Nothing is unpacked.
    async fn import_image(&self, reference: &str, bundle: &Path) -> RuntimeResult<Vec<Image>>;

    /// Unpack an image so it can back a container snapshot.
    async fn unpack(&self, image: &Image) -> RuntimeResult<Image>;

    /// Generate the execution spec for container `id`.
    async fn generate_spec(&self, id: &str, opts: &SpecOptions) -> RuntimeResult<ExecSpec>;
}

/// A persisted container record.
#[async_trait]
pub trait Container: Send + Sync {
    fn id(&self) -> &str;

    async fn info(&self) -> RuntimeResult<ContainerInfo>;

    async fn update(&self, opts: Vec<ContainerOpt>) -> RuntimeResult<()>;

    /// The existing task of this container. Fails with `NotFound` when none.
    async fn task(&self, io: TaskIo) -> RuntimeResult<Arc<dyn Task>>;

    /// Create a new task. The process exists but is not started.
    async fn new_task(&self, io: TaskIo) -> RuntimeResult<Arc<dyn Task>>;
}

/// The live process bound to a container.
#[async_trait]
pub trait Task: Send + Sync {
    fn id(&self) -> &str;

    fn pid(&self) -> u32;

    async fn start(&self) -> RuntimeResult<()>;

    /// Subscribe to the exit of this task.
    ///
    /// A dropped sender means the runtime lost track of the task and is
    /// treated like an unavailable control plane.
    async fn wait(&self) -> RuntimeResult<oneshot::Receiver<ExitStatus>>;

    async fn kill(&self, signal: Signal) -> RuntimeResult<()>;

    /// Delete the task record, killing the process first when `kill` is set.
    async fn delete(&self, kill: bool) -> RuntimeResult<()>;

    async fn status(&self) -> RuntimeResult<TaskStatus>;
}

/// Modifications applied when creating or updating a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerOpt {
    Spec(ExecSpec),
    /// Switch the container to this image and a snapshot of it.
    Image(Image),
    Label { key: String, value: String },
}

impl ContainerOpt {
    pub fn scope(scope: &str) -> Self {
        ContainerOpt::Label {
            key: SCOPE_LABEL.to_string(),
            value: scope.to_string(),
        }
    }
}

/// Stdio binding of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskIo {
    /// No stdio, for inspecting a task.
    None,
    /// New task inheriting the proxy's stdin, stdout and stderr.
    Inherit,
    /// Re-attach to an existing task started with `Inherit`.
    Attach,
}

/// Snapshot of a container record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
}

impl ContainerInfo {
    /// Scope the container was deployed with, empty when unscoped.
    pub fn scope(&self) -> &str {
        self.labels.get(SCOPE_LABEL).map(String::as_str).unwrap_or("")
    }
}

/// An image known to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub name: String,
    pub digest: String,
    /// Unpacked root filesystem, `None` until unpacked.
    pub rootfs: Option<PathBuf>,
}

impl Image {
    pub fn is_unpacked(&self) -> bool {
        self.rootfs.is_some()
    }
}

/// State of a task as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Creating,
    Created,
    Running,
    Paused,
    Stopped,
    Unknown,
}

/// Outcome delivered on a task's exit subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// The task exited with this code.
    Code(i32),
    /// No exit code; the error tells whether the control plane went away.
    Error(RuntimeError),
}
