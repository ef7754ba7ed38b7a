//! Test helpers for mvirt-proxy integration tests.
//!
//! [`FakeRuntime`] is an in-memory runtime implementing every runtime trait.
//! Failures are scripted up front and task exits are triggered by the test.

#![allow(dead_code)]

use async_trait::async_trait;
use mvirt_proxy::config::SCOPE_LABEL;
use mvirt_proxy::error::RuntimeError;
use mvirt_proxy::runtime::spec::{self, ExecSpec, SpecOptions};
use mvirt_proxy::runtime::{
    Connector, Container, ContainerInfo, ContainerOpt, ExitStatus, Image, RuntimeClient,
    RuntimeResult, Task, TaskIo, TaskStatus,
};
use nix::sys::signal::Signal;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};

#[derive(Default)]
pub struct State {
    pub containers: HashMap<String, ContainerEntry>,
    pub tasks: HashMap<String, TaskEntry>,
    /// Images already present locally.
    pub images: HashMap<String, Image>,
    /// Images that can be pulled.
    pub registry: HashMap<String, Image>,
    /// What importing a local bundle yields.
    pub import_result: Vec<Image>,

    /// Number of upcoming connects failing as unavailable.
    pub connect_failures: u32,
    /// Error returned by every connect.
    pub connect_error: Option<RuntimeError>,
    /// Number of upcoming kills failing as unavailable.
    pub unavailable_kills: u32,
    /// Error returned by every kill.
    pub kill_error: Option<RuntimeError>,
    /// Number of upcoming task re-attaches failing as unavailable.
    pub unavailable_attaches: u32,
    pub start_error: Option<RuntimeError>,

    pub connects: u32,
    pub new_tasks: u32,
    pub reacquires: u32,
    pub kill_attempts: u32,
    pub kills: Vec<Signal>,
    pub deletes: Vec<(String, bool)>,
    pub pulls: Vec<String>,
    pub imports: Vec<PathBuf>,
    pub unpacks: u32,
    next_pid: u32,
}

pub struct ContainerEntry {
    pub info: ContainerInfo,
    pub spec: Option<ExecSpec>,
}

pub struct TaskEntry {
    pub pid: u32,
    pub status: TaskStatus,
    pub waiters: Vec<oneshot::Sender<ExitStatus>>,
}

impl State {
    fn insert_task(&mut self, id: &str, status: TaskStatus) -> u32 {
        self.next_pid += 1;
        let pid = self.next_pid;
        self.tasks.insert(
            id.to_string(),
            TaskEntry {
                pid,
                status,
                waiters: Vec::new(),
            },
        );
        pid
    }

    fn live_waiters(&self, id: &str) -> usize {
        self.tasks
            .get(id)
            .map(|t| t.waiters.iter().filter(|w| !w.is_closed()).count())
            .unwrap_or(0)
    }
}

struct Inner {
    state: Mutex<State>,
    started: Notify,
}

/// In-memory runtime. Clones share state.
#[derive(Clone)]
pub struct FakeRuntime {
    inner: Arc<Inner>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    next_pid: 1000,
                    ..Default::default()
                }),
                started: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// Add a container record running `image` under `scope`.
    pub fn add_container(&self, id: &str, image: &str, scope: &str) {
        let mut labels = BTreeMap::new();
        if !scope.is_empty() {
            labels.insert(SCOPE_LABEL.to_string(), scope.to_string());
        }
        self.state().containers.insert(
            id.to_string(),
            ContainerEntry {
                info: ContainerInfo {
                    id: id.to_string(),
                    image: image.to_string(),
                    labels,
                },
                spec: None,
            },
        );
    }

    /// Add a task for container `id` with `status`, returning its pid.
    pub fn add_task(&self, id: &str, status: TaskStatus) -> u32 {
        self.state().insert_task(id, status)
    }

    /// Make `reference` pullable.
    pub fn add_registry_image(&self, reference: &str) {
        self.state()
            .registry
            .insert(reference.to_string(), image(reference, true));
    }

    /// Make `reference` present locally.
    pub fn add_local_image(&self, reference: &str, unpacked: bool) {
        self.state()
            .images
            .insert(reference.to_string(), image(reference, unpacked));
    }

    /// Create a container with a fresh task, as the lifecycle would.
    pub async fn spawn_task(&self, id: &str) -> Arc<dyn Task> {
        self.add_container(id, "redis:7", "");
        self.load_container(id)
            .await
            .unwrap()
            .new_task(TaskIo::Inherit)
            .await
            .unwrap()
    }

    /// Create a container whose task is the real process `pid`.
    pub fn adopt_process(&self, id: &str, pid: u32) -> Arc<dyn Task> {
        self.add_container(id, "redis:7", "");
        self.state().tasks.insert(
            id.to_string(),
            TaskEntry {
                pid,
                status: TaskStatus::Created,
                waiters: Vec::new(),
            },
        );
        self.task_handle(id, pid)
    }

    /// Deliver `status` to every exit subscriber of task `id`.
    pub fn exit_with(&self, id: &str, status: ExitStatus) {
        let mut state = self.state();
        let task = state.tasks.get_mut(id).expect("no such task");
        if let ExitStatus::Code(_) = status {
            task.status = TaskStatus::Stopped;
        }
        for waiter in task.waiters.drain(..) {
            let _ = waiter.send(status.clone());
        }
    }

    /// Drop every exit subscription of task `id` without a status.
    pub fn drop_waiters(&self, id: &str) {
        if let Some(task) = self.state().tasks.get_mut(id) {
            task.waiters.clear();
        }
    }

    pub fn waiters(&self, id: &str) -> usize {
        self.state().live_waiters(id)
    }

    /// Resolves once a task has been started.
    pub async fn started(&self) {
        self.inner.started.notified().await;
    }

    /// Poll until `cond` holds.
    pub async fn wait_until(&self, cond: impl Fn(&State) -> bool) {
        for _ in 0..5000 {
            if cond(&*self.state()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    fn task_handle(&self, id: &str, pid: u32) -> Arc<dyn Task> {
        Arc::new(FakeTask {
            rt: self.clone(),
            id: id.to_string(),
            pid,
        })
    }
}

pub fn image(reference: &str, unpacked: bool) -> Image {
    Image {
        name: reference.to_string(),
        digest: format!("sha256:{}", reference.len()),
        rootfs: unpacked.then(|| PathBuf::from(format!("/images/{reference}/rootfs"))),
    }
}

pub fn spec_options(args: &[&str]) -> SpecOptions {
    SpecOptions {
        args: args.iter().map(|a| a.to_string()).collect(),
        env: vec!["PATH=/usr/bin".to_string()],
        cwd: None,
        inherit_devices: true,
    }
}

#[async_trait]
impl Connector for FakeRuntime {
    async fn connect(&self) -> RuntimeResult<Arc<dyn RuntimeClient>> {
        let mut state = self.state();
        state.connects += 1;
        if let Some(e) = &state.connect_error {
            return Err(e.clone());
        }
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(RuntimeError::Unavailable("runtime restarting".to_string()));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn load_container(&self, id: &str) -> RuntimeResult<Box<dyn Container>> {
        if !self.state().containers.contains_key(id) {
            return Err(RuntimeError::NotFound(format!("container {id}")));
        }
        Ok(Box::new(FakeContainer {
            rt: self.clone(),
            id: id.to_string(),
        }))
    }

    async fn new_container(
        &self,
        id: &str,
        opts: Vec<ContainerOpt>,
    ) -> RuntimeResult<Box<dyn Container>> {
        let mut state = self.state();
        if state.containers.contains_key(id) {
            return Err(RuntimeError::AlreadyExists(format!("container {id}")));
        }
        let mut entry = ContainerEntry {
            info: ContainerInfo {
                id: id.to_string(),
                ..Default::default()
            },
            spec: None,
        };
        for opt in opts {
            apply(&mut entry, opt);
        }
        state.containers.insert(id.to_string(), entry);
        Ok(Box::new(FakeContainer {
            rt: self.clone(),
            id: id.to_string(),
        }))
    }

    async fn get_image(&self, reference: &str) -> RuntimeResult<Image> {
        self.state()
            .images
            .get(reference)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("image {reference}")))
    }

    async fn pull_image(&self, reference: &str) -> RuntimeResult<Image> {
        let mut state = self.state();
        state.pulls.push(reference.to_string());
        let image = state
            .registry
            .get(reference)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("no such image {reference}")))?;
        state.images.insert(reference.to_string(), image.clone());
        Ok(image)
    }

    async fn import_image(&self, _reference: &str, bundle: &Path) -> RuntimeResult<Vec<Image>> {
        let mut state = self.state();
        state.imports.push(bundle.to_path_buf());
        Ok(state.import_result.clone())
    }

    async fn unpack(&self, image: &Image) -> RuntimeResult<Image> {
        let mut state = self.state();
        state.unpacks += 1;
        let unpacked = Image {
            rootfs: Some(PathBuf::from(format!("/images/{}/rootfs", image.name))),
            ..image.clone()
        };
        state.images.insert(image.name.clone(), unpacked.clone());
        Ok(unpacked)
    }

    async fn generate_spec(&self, id: &str, opts: &SpecOptions) -> RuntimeResult<ExecSpec> {
        Ok(spec::generate(id, opts))
    }
}

fn apply(entry: &mut ContainerEntry, opt: ContainerOpt) {
    match opt {
        ContainerOpt::Spec(spec) => entry.spec = Some(spec),
        ContainerOpt::Image(image) => entry.info.image = image.name,
        ContainerOpt::Label { key, value } => {
            entry.info.labels.insert(key, value);
        }
    }
}

pub struct FakeContainer {
    rt: FakeRuntime,
    id: String,
}

#[async_trait]
impl Container for FakeContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn info(&self) -> RuntimeResult<ContainerInfo> {
        self.rt
            .state()
            .containers
            .get(&self.id)
            .map(|c| c.info.clone())
            .ok_or_else(|| RuntimeError::NotFound(format!("container {}", self.id)))
    }

    async fn update(&self, opts: Vec<ContainerOpt>) -> RuntimeResult<()> {
        let mut state = self.rt.state();
        let entry = state
            .containers
            .get_mut(&self.id)
            .ok_or_else(|| RuntimeError::NotFound(format!("container {}", self.id)))?;
        for opt in opts {
            apply(entry, opt);
        }
        Ok(())
    }

    async fn task(&self, io: TaskIo) -> RuntimeResult<Arc<dyn Task>> {
        let pid = {
            let mut state = self.rt.state();
            if io == TaskIo::Attach && state.unavailable_attaches > 0 {
                state.unavailable_attaches -= 1;
                return Err(RuntimeError::Unavailable("runtime restarting".to_string()));
            }
            let pid = state
                .tasks
                .get(&self.id)
                .map(|t| t.pid)
                .ok_or_else(|| RuntimeError::NotFound(format!("task {}", self.id)))?;
            if io == TaskIo::Attach {
                state.reacquires += 1;
            }
            pid
        };
        Ok(self.rt.task_handle(&self.id, pid))
    }

    async fn new_task(&self, _io: TaskIo) -> RuntimeResult<Arc<dyn Task>> {
        let pid = {
            let mut state = self.rt.state();
            if state.tasks.contains_key(&self.id) {
                return Err(RuntimeError::AlreadyExists(format!("task {}", self.id)));
            }
            state.new_tasks += 1;
            state.insert_task(&self.id, TaskStatus::Created)
        };
        Ok(self.rt.task_handle(&self.id, pid))
    }
}

pub struct FakeTask {
    rt: FakeRuntime,
    id: String,
    pid: u32,
}

#[async_trait]
impl Task for FakeTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    async fn start(&self) -> RuntimeResult<()> {
        {
            let mut state = self.rt.state();
            if let Some(e) = &state.start_error {
                return Err(e.clone());
            }
            if let Some(task) = state.tasks.get_mut(&self.id) {
                task.status = TaskStatus::Running;
            }
        }
        self.rt.inner.started.notify_one();
        Ok(())
    }

    async fn wait(&self) -> RuntimeResult<oneshot::Receiver<ExitStatus>> {
        let mut state = self.rt.state();
        let task = state
            .tasks
            .get_mut(&self.id)
            .ok_or_else(|| RuntimeError::NotFound(format!("task {}", self.id)))?;
        let (tx, rx) = oneshot::channel();
        task.waiters.push(tx);
        Ok(rx)
    }

    async fn kill(&self, signal: Signal) -> RuntimeResult<()> {
        let mut state = self.rt.state();
        state.kill_attempts += 1;
        if state.unavailable_kills > 0 {
            state.unavailable_kills -= 1;
            return Err(RuntimeError::Unavailable("runtime restarting".to_string()));
        }
        if let Some(e) = &state.kill_error {
            return Err(e.clone());
        }
        state.kills.push(signal);
        Ok(())
    }

    async fn delete(&self, kill: bool) -> RuntimeResult<()> {
        let mut state = self.rt.state();
        state.deletes.push((self.id.clone(), kill));
        state
            .tasks
            .remove(&self.id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(format!("task {}", self.id)))
    }

    async fn status(&self) -> RuntimeResult<TaskStatus> {
        self.rt
            .state()
            .tasks
            .get(&self.id)
            .map(|t| t.status)
            .ok_or_else(|| RuntimeError::NotFound(format!("task {}", self.id)))
    }
}
