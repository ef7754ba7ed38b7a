//! OCI runtime spec generation for the supervised task.

use crate::config::ProxyConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Inputs for generating the execution spec of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecOptions {
    /// Full argv of the task process.
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE` pairs.
    pub env: Vec<String>,
    /// Working directory inside the container, `/` when unset.
    pub cwd: Option<String>,
    /// Leave device access unrestricted instead of denying all devices.
    pub inherit_devices: bool,
}

impl SpecOptions {
    /// Build the options for the current run of the proxy.
    ///
    /// argv is `program` followed by the configured args and then `forwarded`.
    /// The environment of this process is passed through as-is.
    pub fn current(
        program: &str,
        config: &ProxyConfig,
        forwarded: &[String],
    ) -> std::io::Result<Self> {
        let mut args = Vec::with_capacity(1 + config.args.len() + forwarded.len());
        args.push(program.to_string());
        args.extend(config.args.iter().cloned());
        args.extend(forwarded.iter().cloned());

        let env = std::env::vars_os()
            .map(|(k, v)| format!("{}={}", k.to_string_lossy(), v.to_string_lossy()))
            .collect();

        let cwd = if config.inherit_cwd {
            Some(std::env::current_dir()?.to_string_lossy().into_owned())
        } else {
            None
        };

        Ok(Self {
            args,
            env,
            cwd,
            inherit_devices: config.inherit_devices,
        })
    }
}

/// Minimal OCI Runtime Spec (config.json of a bundle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecSpec {
    pub oci_version: String,
    pub root: Root,
    pub process: Process,
    pub hostname: String,
    pub mounts: Vec<Mount>,
    pub linux: Linux,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub terminal: bool,
    pub user: User,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    pub namespaces: Vec<Namespace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub devices: Vec<DeviceRule>,
}

/// Device cgroup rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRule {
    pub allow: bool,
    pub access: String,
}

/// Generate the execution spec for container `id`.
///
/// The root path is left as `rootfs`; the runtime points it at the
/// container's snapshot when the task bundle is written.
pub fn generate(id: &str, opts: &SpecOptions) -> ExecSpec {
    // No device rules at all means the task sees the same devices we do.
    let resources = if opts.inherit_devices {
        None
    } else {
        Some(Resources {
            devices: vec![DeviceRule {
                allow: false,
                access: "rwm".to_string(),
            }],
        })
    };

    ExecSpec {
        oci_version: "1.0.0".to_string(),
        root: Root {
            path: "rootfs".to_string(),
            readonly: false,
        },
        process: Process {
            terminal: false,
            user: User { uid: 0, gid: 0 },
            args: opts.args.clone(),
            env: opts.env.clone(),
            cwd: opts.cwd.clone().unwrap_or_else(|| "/".to_string()),
        },
        hostname: id.to_string(),
        mounts: vec![
            mount("/proc", "proc", "proc", &[]),
            mount(
                "/dev",
                "tmpfs",
                "tmpfs",
                &["nosuid", "strictatime", "mode=755", "size=65536k"],
            ),
            mount(
                "/dev/pts",
                "devpts",
                "devpts",
                &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
            ),
            mount("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
            mount("/tmp", "tmpfs", "tmpfs", &["nosuid", "nodev", "mode=1777"]),
            mount("/run", "tmpfs", "tmpfs", &["nosuid", "nodev", "mode=755"]),
        ],
        linux: Linux {
            // pid and mount only; the task shares the host network namespace.
            namespaces: vec![
                Namespace {
                    ns_type: "pid".to_string(),
                    path: None,
                },
                Namespace {
                    ns_type: "mount".to_string(),
                    path: None,
                },
            ],
            resources,
        },
    }
}

fn mount(destination: &str, mount_type: &str, source: &str, options: &[&str]) -> Mount {
    Mount {
        destination: destination.to_string(),
        mount_type: mount_type.to_string(),
        source: source.to_string(),
        options: options.iter().map(|o| o.to_string()).collect(),
    }
}

/// Write `spec` as `config.json` into `bundle_path`, rooted at `rootfs`.
pub async fn write_bundle(
    spec: &ExecSpec,
    rootfs: &Path,
    bundle_path: &Path,
) -> Result<(), std::io::Error> {
    let mut spec = spec.clone();
    spec.root.path = rootfs.to_string_lossy().into_owned();
    let spec_json = serde_json::to_string_pretty(&spec)?;

    tokio::fs::create_dir_all(bundle_path).await?;
    tokio::fs::write(bundle_path.join("config.json"), &spec_json).await?;

    log::debug!(
        "Wrote OCI spec for {} at {} (args {:?})",
        spec.hostname,
        bundle_path.display(),
        spec.process.args
    );
    Ok(())
}
