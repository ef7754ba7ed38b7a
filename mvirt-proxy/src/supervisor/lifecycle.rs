//! Bringing the container into shape and creating its task.

use super::connection::Connection;
use super::upgrade::should_upgrade;
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::runtime::spec::SpecOptions;
use crate::runtime::{Container, ContainerOpt, Image, RuntimeClient, Task, TaskIo, TaskStatus};
use log::{debug, info};
use std::sync::Arc;

/// Make sure the container for `config` exists with the current spec and the
/// right image, then create a new, not yet started task for it.
///
/// Fails with [`Error::TaskRunning`] if the container already has a task that
/// has not stopped.
pub async fn ensure_running(
    client: &dyn RuntimeClient,
    config: &ProxyConfig,
    opts: &SpecOptions,
) -> Result<Arc<dyn Task>> {
    let spec = client.generate_spec(&config.id, opts).await?;

    let container = match client.load_container(&config.id).await {
        Ok(container) => container,
        Err(e) if e.is_not_found() => {
            info!("Container {} not found, creating it", config.id);
            let image = resolve_image(client, config).await?;
            client
                .new_container(
                    &config.id,
                    vec![
                        ContainerOpt::Spec(spec.clone()),
                        ContainerOpt::Image(image),
                        ContainerOpt::scope(&config.scope),
                    ],
                )
                .await?
        }
        Err(e) => return Err(e.into()),
    };

    cleanup(container.as_ref()).await?;

    container.update(vec![ContainerOpt::Spec(spec)]).await?;

    let current = container.info().await?;
    if should_upgrade(
        &config.image,
        &current.image,
        &config.scope,
        current.scope(),
    ) {
        info!(
            "Upgrading container {} from {} to {}",
            config.id, current.image, config.image
        );
        let image = resolve_image(client, config).await?;
        container
            .update(vec![
                ContainerOpt::Image(image),
                ContainerOpt::scope(&config.scope),
            ])
            .await?;
    }

    Ok(container.new_task(TaskIo::Inherit).await?)
}

/// Forcibly remove whatever task container `id` has, killing it first.
///
/// Meant to run before the supervisor is started, to clear a task left
/// behind by a supervisor that crashed. A missing container or task counts
/// as clean. Returns whether a task was removed.
pub async fn remove_task(conn: &Connection, id: &str) -> Result<bool> {
    let task = match conn.reacquire_task(id).await {
        Ok(task) => task,
        Err(Error::Runtime(e)) if e.is_not_found() => {
            debug!("No task for {}, nothing to clean up", id);
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    info!("Removing leftover task of {} (PID {})", id, task.pid());
    match task.delete(true).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Delete a leftover stopped task so a new one can be created.
async fn cleanup(container: &dyn Container) -> Result<()> {
    let task = match container.task(TaskIo::None).await {
        Ok(task) => task,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let status = match task.status().await {
        Ok(status) => status,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if status != TaskStatus::Stopped {
        return Err(Error::TaskRunning(container.id().to_string()));
    }

    debug!("Deleting stopped task of {}", container.id());
    match task.delete(false).await {
        Err(e) if !e.is_not_found() => Err(e.into()),
        _ => Ok(()),
    }
}

/// Find the configured image locally, importing or pulling it when absent.
/// The result is always unpacked.
async fn resolve_image(client: &dyn RuntimeClient, config: &ProxyConfig) -> Result<Image> {
    match client.get_image(&config.image).await {
        Ok(image) if image.is_unpacked() => return Ok(image),
        Ok(image) => {
            debug!("Unpacking local image {}", image.name);
            return Ok(client.unpack(&image).await?);
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    match &config.image_path {
        Some(path) => {
            info!("Importing {} from {}", config.image, path.display());
            let mut images = client.import_image(&config.image, path).await?;
            if images.len() != 1 {
                return Err(Error::ImportCount {
                    path: path.clone(),
                    count: images.len(),
                });
            }
            let image = images.remove(0);
            Ok(client.unpack(&image).await?)
        }
        None => {
            info!("Pulling {}", config.image);
            Ok(client.pull_image(&config.image).await?)
        }
    }
}
