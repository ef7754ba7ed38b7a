//! Supervision of a single container task.
//!
//! The [`Supervisor`] owns the task from start to exit. It multiplexes three
//! event sources in a fixed priority:
//!
//! 1. completion of `start`, which runs on its own tokio task,
//! 2. the exit notification of the task,
//! 3. OS signals, which are forwarded to the task.
//!
//! An exit notification carrying an `Unavailable` error is not an exit: the
//! runtime went away. The supervisor reconnects, re-attaches to the same task
//! and keeps waiting.

pub mod connection;
pub mod forward;
pub mod lifecycle;
pub mod retry;
pub mod upgrade;

pub use connection::Connection;
pub use forward::{Delivery, SignalForwarder};
pub use retry::RetryPolicy;

use crate::error::{Error, Result, RuntimeError};
use crate::runtime::{ExitStatus, RuntimeResult, Task};
use crate::utils::signals::Signals;
use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Starting,
    Running,
    Reconnecting,
    Exited(i32),
    Failed,
}

enum Event {
    Started(std::result::Result<RuntimeResult<()>, JoinError>),
    Exit(ExitStatus),
    Signal(Signal),
}

pub struct Supervisor {
    conn: Connection,
    id: String,
    signals: Signals,
    forwarder: SignalForwarder,
    state: State,
}

impl Supervisor {
    pub fn new(
        conn: Connection,
        id: impl Into<String>,
        signals: Signals,
        forwarder: SignalForwarder,
    ) -> Self {
        Self {
            conn,
            id: id.into(),
            signals,
            forwarder,
            state: State::Starting,
        }
    }

    /// Start `task` and supervise it until it exits.
    ///
    /// Returns the exit code of the task. Any error means the task could not
    /// be started or its fate is unknown.
    pub async fn run(mut self, task: Arc<dyn Task>) -> Result<i32> {
        let mut task = task;

        // Subscribe before starting so a fast exit is not missed.
        let mut exit = match task.wait().await {
            Ok(exit) => exit,
            Err(e) => {
                abort(&self.id, task.as_ref()).await;
                return Err(e.into());
            }
        };

        let starting = task.clone();
        let mut start = tokio::spawn(async move { starting.start().await });
        let mut start_pending = true;

        let result = loop {
            let event = tokio::select! {
                biased;
                joined = &mut start, if start_pending => Event::Started(joined),
                status = &mut exit => Event::Exit(status.unwrap_or_else(|_| {
                    ExitStatus::Error(RuntimeError::Unavailable(
                        "exit notification dropped".to_string(),
                    ))
                })),
                Some(signal) = self.signals.recv() => Event::Signal(signal),
            };

            match event {
                Event::Started(joined) => {
                    start_pending = false;
                    let started = joined
                        .unwrap_or_else(|e| Err(RuntimeError::Command(e.to_string())));
                    if let Err(e) = started {
                        error!("Failed to start task {}: {}", self.id, e);
                        self.transition(State::Failed);
                        abort(&self.id, task.as_ref()).await;
                        break Err(Error::Start(e));
                    }
                    if self.state == State::Starting {
                        self.transition(State::Running);
                    }
                }
                Event::Exit(ExitStatus::Code(code)) => {
                    self.transition(State::Exited(code));
                    if let Err(e) = task.delete(false).await {
                        warn!("Failed to delete task {}: {}", self.id, e);
                    }
                    break Ok(code);
                }
                Event::Exit(ExitStatus::Error(e)) if Connection::is_transient(&e) => {
                    warn!("Lost runtime while waiting for task {}: {}", self.id, e);
                    self.transition(State::Reconnecting);
                    match self.resubscribe().await {
                        Ok((reacquired, rx)) => {
                            task = reacquired;
                            exit = rx;
                            self.transition(State::Running);
                        }
                        Err(e) => {
                            error!("Could not reattach to task {}: {}", self.id, e);
                            self.transition(State::Failed);
                            abort(&self.id, task.as_ref()).await;
                            break Err(e);
                        }
                    }
                }
                Event::Exit(ExitStatus::Error(e)) => {
                    error!("Task {} failed: {}", self.id, e);
                    self.transition(State::Failed);
                    abort(&self.id, task.as_ref()).await;
                    break Err(Error::TaskFailed {
                        id: self.id.clone(),
                        source: e,
                    });
                }
                Event::Signal(Signal::SIGCONT) => {
                    debug!("Ignoring SIGCONT");
                }
                Event::Signal(signal) => {
                    if let Some((reacquired, rx)) = self.forward(&task, signal).await {
                        task = reacquired;
                        exit = rx;
                    }
                }
            }
        };

        if start_pending {
            start.abort();
        }
        result
    }

    /// Forward `signal`, returning the new task handle and exit subscription
    /// when the task had to be re-acquired.
    async fn forward(
        &mut self,
        task: &Arc<dyn Task>,
        signal: Signal,
    ) -> Option<(Arc<dyn Task>, oneshot::Receiver<ExitStatus>)> {
        match self
            .forwarder
            .forward(&mut self.conn, &self.id, task, signal)
            .await
        {
            Ok(Delivery::Runtime) | Ok(Delivery::Direct) => None,
            Ok(Delivery::Reacquired(reacquired)) => match reacquired.wait().await {
                Ok(rx) => Some((reacquired, rx)),
                Err(e) => {
                    warn!("Could not resubscribe to task {}: {}", self.id, e);
                    None
                }
            },
            Err(e) => {
                error!("Signal {} lost for task {}: {}", signal, self.id, e);
                None
            }
        }
    }

    /// Reconnect and subscribe to the exit of the same task again.
    async fn resubscribe(&mut self) -> Result<(Arc<dyn Task>, oneshot::Receiver<ExitStatus>)> {
        let policy = self.conn.policy();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_resubscribe().await {
                Ok(subscription) => return Ok(subscription),
                Err(Error::Runtime(e))
                    if Connection::is_transient(&e) && attempt < policy.max_attempts =>
                {
                    warn!(
                        "Reattaching to task {} failed (attempt {}/{}): {}",
                        self.id, attempt, policy.max_attempts, e
                    );
                    policy.pause().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_resubscribe(&mut self) -> Result<(Arc<dyn Task>, oneshot::Receiver<ExitStatus>)> {
        self.conn.reconnect().await?;
        let task = self.conn.reacquire_task(&self.id).await?;
        let exit = task.wait().await?;
        Ok((task, exit))
    }

    fn transition(&mut self, next: State) {
        info!("Task {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }
}

/// Best-effort forced removal of the task.
async fn abort(id: &str, task: &dyn Task) {
    if let Err(e) = task.delete(true).await {
        warn!("Failed to delete task {}: {}", id, e);
    }
}
