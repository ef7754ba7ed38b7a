//! youki-backed runtime.
//!
//! Container records are JSON files below the state directory:
//!
//! ```text
//! <state_dir>/
//!   containers/<id>/container.json   record: image, snapshot, labels, spec
//!   containers/<id>/bundle/          bundle handed to `youki create`
//!   images/                          image store
//! ```
//!
//! Tasks are youki containers of the same id. A "connection" is a probe of
//! the youki binary; when it cannot be executed the runtime is unavailable.

mod command;
mod reaper;

pub use command::{Youki, YoukiState};
pub use reaper::Reaper;

use super::image::ImageStore;
use super::spec::{self, ExecSpec, SpecOptions};
use super::{
    Connector, Container, ContainerInfo, ContainerOpt, ExitStatus, Image, RuntimeClient,
    RuntimeResult, Task, TaskIo, TaskStatus,
};
use crate::error::RuntimeError;
use async_trait::async_trait;
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::oneshot;

const RECORD_FILE: &str = "container.json";

/// Connects to the youki runtime of one namespace.
pub struct YoukiConnector {
    youki: Youki,
    state_dir: PathBuf,
    reaper: Arc<Reaper>,
}

impl YoukiConnector {
    pub fn new(youki: Youki, state_dir: PathBuf) -> Self {
        Self {
            youki,
            state_dir,
            reaper: Arc::new(Reaper::new()),
        }
    }
}

#[async_trait]
impl Connector for YoukiConnector {
    async fn connect(&self) -> RuntimeResult<Arc<dyn RuntimeClient>> {
        self.youki.probe().await?;
        fs::create_dir_all(self.state_dir.join("containers"))
            .await
            .map_err(storage_error)?;

        debug!("Connected to youki, state in {}", self.state_dir.display());
        Ok(Arc::new(YoukiClient {
            backend: Arc::new(Backend {
                youki: self.youki.clone(),
                containers_dir: self.state_dir.join("containers"),
                images: ImageStore::new(self.state_dir.join("images")),
                reaper: self.reaper.clone(),
            }),
        }))
    }
}

struct Backend {
    youki: Youki,
    containers_dir: PathBuf,
    images: ImageStore,
    reaper: Arc<Reaper>,
}

impl Backend {
    fn container_dir(&self, id: &str) -> PathBuf {
        self.containers_dir.join(id)
    }

    async fn read_record(&self, id: &str) -> RuntimeResult<ContainerRecord> {
        let path = self.container_dir(id).join(RECORD_FILE);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RuntimeError::NotFound(format!("container {id}")));
            }
            Err(e) => return Err(storage_error(e)),
        };
        serde_json::from_str(&content).map_err(|e| {
            RuntimeError::Storage(format!("corrupt record {}: {e}", path.display()))
        })
    }

    async fn write_record(&self, record: &ContainerRecord) -> RuntimeResult<()> {
        let dir = self.container_dir(&record.id);
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| RuntimeError::Storage(e.to_string()))?;
        let tmp = dir.join(format!("{RECORD_FILE}.tmp"));
        fs::write(&tmp, json).await.map_err(storage_error)?;
        fs::rename(&tmp, dir.join(RECORD_FILE))
            .await
            .map_err(storage_error)
    }

    fn task(self: &Arc<Self>, id: &str, pid: i32) -> Arc<dyn Task> {
        Arc::new(YoukiTask {
            backend: self.clone(),
            id: id.to_string(),
            pid,
        })
    }
}

fn storage_error(e: io::Error) -> RuntimeError {
    RuntimeError::Storage(e.to_string())
}

/// Persisted container record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ContainerRecord {
    id: String,
    image: String,
    /// Root filesystem the task runs from.
    snapshot: Option<PathBuf>,
    labels: BTreeMap<String, String>,
    spec: Option<ExecSpec>,
}

impl ContainerRecord {
    fn apply(&mut self, opt: ContainerOpt) {
        match opt {
            ContainerOpt::Spec(spec) => self.spec = Some(spec),
            ContainerOpt::Image(image) => {
                self.image = image.name;
                self.snapshot = image.rootfs;
            }
            ContainerOpt::Label { key, value } => {
                self.labels.insert(key, value);
            }
        }
    }
}

pub struct YoukiClient {
    backend: Arc<Backend>,
}

#[async_trait]
impl RuntimeClient for YoukiClient {
    async fn load_container(&self, id: &str) -> RuntimeResult<Box<dyn Container>> {
        self.backend.read_record(id).await?;
        Ok(Box::new(YoukiContainer {
            backend: self.backend.clone(),
            id: id.to_string(),
        }))
    }

    async fn new_container(
        &self,
        id: &str,
        opts: Vec<ContainerOpt>,
    ) -> RuntimeResult<Box<dyn Container>> {
        fs::create_dir_all(&self.backend.containers_dir)
            .await
            .map_err(storage_error)?;
        // Creating the directory claims the id.
        match fs::create_dir(self.backend.container_dir(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(RuntimeError::AlreadyExists(format!("container {id}")));
            }
            Err(e) => return Err(storage_error(e)),
        }

        let mut record = ContainerRecord {
            id: id.to_string(),
            ..Default::default()
        };
        for opt in opts {
            record.apply(opt);
        }
        self.backend.write_record(&record).await?;
        info!("Created container {} from {}", id, record.image);

        Ok(Box::new(YoukiContainer {
            backend: self.backend.clone(),
            id: id.to_string(),
        }))
    }

    async fn get_image(&self, reference: &str) -> RuntimeResult<Image> {
        self.backend
            .images
            .find(reference)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(format!("image {reference}")))
    }

    async fn pull_image(&self, reference: &str) -> RuntimeResult<Image> {
        Ok(self.backend.images.pull(reference).await?)
    }

    async fn import_image(&self, reference: &str, bundle: &Path) -> RuntimeResult<Vec<Image>> {
        Ok(self.backend.images.import(reference, bundle).await?)
    }

    async fn unpack(&self, image: &Image) -> RuntimeResult<Image> {
        Ok(self.backend.images.unpack(image).await?)
    }

    async fn generate_spec(&self, id: &str, opts: &SpecOptions) -> RuntimeResult<ExecSpec> {
        Ok(spec::generate(id, opts))
    }
}

pub struct YoukiContainer {
    backend: Arc<Backend>,
    id: String,
}

#[async_trait]
impl Container for YoukiContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn info(&self) -> RuntimeResult<ContainerInfo> {
        let record = self.backend.read_record(&self.id).await?;
        Ok(ContainerInfo {
            id: record.id,
            image: record.image,
            labels: record.labels,
        })
    }

    async fn update(&self, opts: Vec<ContainerOpt>) -> RuntimeResult<()> {
        let mut record = self.backend.read_record(&self.id).await?;
        for opt in opts {
            record.apply(opt);
        }
        self.backend.write_record(&record).await
    }

    async fn task(&self, _io: TaskIo) -> RuntimeResult<Arc<dyn Task>> {
        // Stdio was bound by `youki create`; attaching keeps it.
        let state = self.backend.youki.state(&self.id).await?;
        Ok(self.backend.task(&self.id, state.pid.unwrap_or(0)))
    }

    async fn new_task(&self, io: TaskIo) -> RuntimeResult<Arc<dyn Task>> {
        let record = self.backend.read_record(&self.id).await?;
        let spec = record.spec.ok_or_else(|| {
            RuntimeError::FailedPrecondition(format!("container {} has no spec", self.id))
        })?;
        let snapshot = record.snapshot.ok_or_else(|| {
            RuntimeError::FailedPrecondition(format!("container {} has no snapshot", self.id))
        })?;

        let bundle = self.backend.container_dir(&self.id).join("bundle");
        spec::write_bundle(&spec, &snapshot, &bundle)
            .await
            .map_err(storage_error)?;

        let pid = self
            .backend
            .youki
            .create(&self.id, &bundle, io == TaskIo::Inherit)
            .await?;
        info!("Created task {} with PID {}", self.id, pid);
        Ok(self.backend.task(&self.id, pid))
    }
}

pub struct YoukiTask {
    backend: Arc<Backend>,
    id: String,
    pid: i32,
}

#[async_trait]
impl Task for YoukiTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn pid(&self) -> u32 {
        self.pid.max(0) as u32
    }

    async fn start(&self) -> RuntimeResult<()> {
        self.backend.youki.run(&["start", &self.id]).await?;
        info!("Started task {}", self.id);
        Ok(())
    }

    async fn wait(&self) -> RuntimeResult<oneshot::Receiver<ExitStatus>> {
        if self.pid <= 0 {
            return Err(RuntimeError::FailedPrecondition(format!(
                "task {} has no process",
                self.id
            )));
        }

        let mut exit = self.backend.reaper.watch(self.pid);
        let (tx, rx) = oneshot::channel();
        let id = self.id.clone();
        tokio::spawn(async move {
            let status = match exit.wait_for(Option::is_some).await {
                Ok(code) => ExitStatus::Code((*code).unwrap_or(255)),
                Err(_) => {
                    warn!("Exit watcher for task {} went away", id);
                    ExitStatus::Error(RuntimeError::Command(format!(
                        "lost exit status of task {id}"
                    )))
                }
            };
            let _ = tx.send(status);
        });
        Ok(rx)
    }

    async fn kill(&self, signal: Signal) -> RuntimeResult<()> {
        let signal = (signal as i32).to_string();
        self.backend
            .youki
            .run(&["kill", &self.id, &signal])
            .await
            .map(|_| ())
    }

    async fn delete(&self, kill: bool) -> RuntimeResult<()> {
        let id = self.id.as_str();
        let args: &[&str] = if kill {
            &["delete", "--force", id]
        } else {
            &["delete", id]
        };
        self.backend.youki.run(args).await?;
        debug!("Deleted task {}", self.id);
        Ok(())
    }

    async fn status(&self) -> RuntimeResult<TaskStatus> {
        Ok(self.backend.youki.state(&self.id).await?.task_status())
    }
}
