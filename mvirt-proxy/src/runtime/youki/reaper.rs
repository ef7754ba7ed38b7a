//! Exit tracking for container processes.
//!
//! The proxy is a child subreaper, so container init processes created by
//! youki end up as our children and can be waited on directly. Only one
//! `waitpid` per pid may be outstanding; every task handle for the same pid
//! shares it through a watch channel. The reaper outlives runtime
//! connections, so a re-acquired task still sees its exit.

use log::{error, info, warn};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;

/// Exit code of a pid once it has been reaped.
pub type ExitWatch = watch::Receiver<Option<i32>>;

#[derive(Default)]
pub struct Reaper {
    watchers: Mutex<HashMap<i32, ExitWatch>>,
}

impl Reaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `pid`, spawning its waiter on first use.
    pub fn watch(&self, pid: i32) -> ExitWatch {
        let mut watchers = self
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        watchers
            .entry(pid)
            .or_insert_with(|| {
                let (tx, rx) = watch::channel(None);
                tokio::task::spawn_blocking(move || {
                    let code = wait_for_exit(pid);
                    let _ = tx.send(Some(code));
                });
                rx
            })
            .clone()
    }
}

/// Block until `pid` exits and map its status to an exit code.
fn wait_for_exit(pid: i32) -> i32 {
    info!("Reaper: Waiting for PID {} to exit", pid);
    match waitpid(Pid::from_raw(pid), None) {
        Ok(WaitStatus::Exited(_, code)) => {
            info!("Reaper: PID {} exited with code {}", pid, code);
            code
        }
        Ok(WaitStatus::Signaled(_, signal, _)) => {
            info!("Reaper: PID {} was terminated by signal {:?}", pid, signal);
            128 + (signal as i32)
        }
        Ok(status) => {
            warn!("Reaper: PID {} ended with unexpected status: {:?}", pid, status);
            255
        }
        Err(e) => {
            error!("Reaper: waitpid failed for PID {}: {}", pid, e);
            255
        }
    }
}
