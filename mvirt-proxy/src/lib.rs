//! mvirt-proxy - Container supervisor standing in for a program.
//!
//! The binary is installed once and symlinked under the name of each
//! containerised program. Invoked as that program, it loads
//! `<config_dir>/<name>.json`, makes sure the container exists with the
//! right image, runs it as a task with the caller's stdio, arguments,
//! environment and signals, and exits with the task's exit code.
//! [`cleanup`] clears a task left behind by a supervisor that crashed.
//!
//! ## Architecture
//!
//! - **Runtime**: traits for the container runtime plus a youki backend
//! - **Lifecycle**: create or load the container, apply spec and upgrades
//! - **Supervisor**: start, forward signals, survive runtime restarts, exit
//!
//! The proxy keeps running when the runtime becomes unavailable: exits are
//! observed again after reconnecting, and signals fall back to kill(2).

pub mod config;
pub mod error;
pub mod runtime;
pub mod supervisor;
pub mod utils;

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::runtime::Connector;
use crate::runtime::spec::SpecOptions;
use crate::runtime::youki::{Youki, YoukiConnector};
use crate::supervisor::{Connection, RetryPolicy, SignalForwarder, Supervisor, lifecycle};
use crate::utils::signals::{self, Signals};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

/// Process-level settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the per-container JSON configurations.
    pub config_dir: PathBuf,
    /// Base directory for container records and images, one subdirectory
    /// per namespace.
    pub state_dir: PathBuf,
    /// Path to youki binary.
    pub youki_path: PathBuf,
    /// Base directory for youki container state, one subdirectory per
    /// namespace.
    pub youki_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        if nix::unistd::geteuid().is_root() {
            Self {
                config_dir: PathBuf::from("/etc/mvirt-proxy"),
                state_dir: PathBuf::from("/run/mvirt-proxy"),
                youki_path: PathBuf::from("/usr/bin/youki"),
                youki_root: PathBuf::from("/run/mvirt-proxy/youki"),
            }
        } else {
            // Running locally for development
            Self {
                config_dir: PathBuf::from("/etc/mvirt-proxy"),
                state_dir: PathBuf::from("/tmp/mvirt-proxy"),
                youki_path: PathBuf::from("youki"),
                youki_root: PathBuf::from("/tmp/mvirt-proxy/youki"),
            }
        }
    }
}

/// Run the container `id` as if it were `program` invoked with `forwarded`.
///
/// Returns the task's exit code.
pub async fn run(config: &Config, id: &str, program: &str, forwarded: &[String]) -> Result<i32> {
    let proxy = ProxyConfig::load(&config.config_dir, id)?;
    info!(
        "Proxying {} to container {} ({}) in namespace {}",
        program, proxy.id, proxy.image, proxy.namespace
    );

    // Subscribe first so nothing sent during setup is lost.
    let signals = Signals::subscribe(signals::FORWARDED)?;
    let opts = SpecOptions::current(program, &proxy, forwarded)?;

    let conn = Connection::establish(connector(config, &proxy), RetryPolicy::RECONNECT).await?;

    let task = lifecycle::ensure_running(conn.client().as_ref(), &proxy, &opts).await?;

    Supervisor::new(
        conn,
        proxy.id.clone(),
        signals,
        SignalForwarder::new(RetryPolicy::SIGNAL),
    )
    .run(task)
    .await
}

/// Kill and remove a task of container `id` left behind by a previous run.
///
/// Returns whether there was a task to remove.
pub async fn cleanup(config: &Config, id: &str) -> Result<bool> {
    let proxy = ProxyConfig::load(&config.config_dir, id)?;
    let conn = Connection::establish(connector(config, &proxy), RetryPolicy::RECONNECT).await?;
    lifecycle::remove_task(&conn, &proxy.id).await
}

/// youki backend for the namespace of `proxy`.
fn connector(config: &Config, proxy: &ProxyConfig) -> Arc<dyn Connector> {
    let youki = Youki::new(
        config.youki_path.clone(),
        Some(config.youki_root.join(&proxy.namespace)),
    );
    Arc::new(YoukiConnector::new(
        youki,
        config.state_dir.join(&proxy.namespace),
    ))
}

/// Process exit code for the outcome of [`run`]: the task's code truncated to
/// 8 bits, or 1 for any failure.
pub fn exit_code(result: &Result<i32>) -> u8 {
    match result {
        Ok(code) => (*code & 0xff) as u8,
        Err(_) => 1,
    }
}
