//! Relaying OS signals to the supervised task.

use super::connection::Connection;
use super::retry::RetryPolicy;
use crate::error::{Error, Result};
use crate::runtime::Task;
use log::{debug, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::sync::Arc;

/// How a signal reached the task.
pub enum Delivery {
    /// Through the runtime with the current task handle.
    Runtime,
    /// Through the runtime after reconnecting. The caller must adopt the new
    /// handle and subscribe to its exit again.
    Reacquired(Arc<dyn Task>),
    /// With kill(2) on the task's pid, bypassing the runtime.
    Direct,
}

pub struct SignalForwarder {
    policy: RetryPolicy,
}

impl SignalForwarder {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Deliver `signal` to the task of container `id`.
    ///
    /// Transient failures reconnect and retry. Once retries run out, or the
    /// reconnect itself fails, the signal is sent straight to the pid.
    pub async fn forward(
        &self,
        conn: &mut Connection,
        id: &str,
        task: &Arc<dyn Task>,
        signal: Signal,
    ) -> Result<Delivery> {
        let mut current = task.clone();
        let mut reacquired = false;

        for attempt in 1..=self.policy.max_attempts {
            match current.kill(signal).await {
                Ok(()) => {
                    debug!("Forwarded {} to task {}", signal, id);
                    return Ok(if reacquired {
                        Delivery::Reacquired(current)
                    } else {
                        Delivery::Runtime
                    });
                }
                Err(e) if Connection::is_transient(&e) => {
                    warn!(
                        "Forwarding {} to task {} failed (attempt {}/{}): {}",
                        signal, id, attempt, self.policy.max_attempts, e
                    );
                }
                Err(e) => return Err(e.into()),
            }

            if attempt == self.policy.max_attempts {
                break;
            }
            self.policy.pause().await;
            match recover(conn, id).await {
                Ok(task) => {
                    current = task;
                    reacquired = true;
                }
                Err(e) => {
                    warn!("Could not reach runtime to forward {}: {}", signal, e);
                    break;
                }
            }
        }

        kill_direct(current.as_ref(), signal)?;
        Ok(Delivery::Direct)
    }
}

async fn recover(conn: &mut Connection, id: &str) -> Result<Arc<dyn Task>> {
    conn.reconnect().await?;
    conn.reacquire_task(id).await
}

fn kill_direct(task: &dyn Task, signal: Signal) -> Result<()> {
    let pid = i32::try_from(task.pid()).unwrap_or(0);
    if pid <= 0 {
        return Err(Error::Nix(nix::errno::Errno::ESRCH));
    }
    warn!("Sending {} directly to PID {}", signal, pid);
    kill(Pid::from_raw(pid), signal)?;
    Ok(())
}
