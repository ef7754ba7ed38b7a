//! Ownership of the runtime client and recovery from lost connections.

use super::retry::RetryPolicy;
use crate::error::{Error, Result, RuntimeError};
use crate::runtime::{Connector, RuntimeClient, Task, TaskIo};
use log::{debug, info, warn};
use std::sync::Arc;

/// The live client handle plus the means to replace it.
pub struct Connection {
    connector: Arc<dyn Connector>,
    client: Arc<dyn RuntimeClient>,
    policy: RetryPolicy,
    generation: u64,
}

impl Connection {
    /// Connect, retrying transient failures with `policy`.
    pub async fn establish(connector: Arc<dyn Connector>, policy: RetryPolicy) -> Result<Self> {
        let client = connect_with_retry(connector.as_ref(), policy).await?;
        Ok(Self {
            connector,
            client,
            policy,
            generation: 0,
        })
    }

    pub fn client(&self) -> Arc<dyn RuntimeClient> {
        self.client.clone()
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Number of successful reconnects so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `err` means the control plane is temporarily out of reach.
    pub fn is_transient(err: &RuntimeError) -> bool {
        err.is_unavailable()
    }

    /// Replace the client with a fresh connection.
    pub async fn reconnect(&mut self) -> Result<()> {
        info!("Reconnecting to runtime");
        self.client = connect_with_retry(self.connector.as_ref(), self.policy).await?;
        self.generation += 1;
        debug!("Runtime connection {} established", self.generation);
        Ok(())
    }

    /// Attach to the existing task of container `id`. Never creates a task.
    pub async fn reacquire_task(&self, id: &str) -> Result<Arc<dyn Task>> {
        let container = self.client.load_container(id).await?;
        Ok(container.task(TaskIo::Attach).await?)
    }
}

async fn connect_with_retry(
    connector: &dyn Connector,
    policy: RetryPolicy,
) -> Result<Arc<dyn RuntimeClient>> {
    let mut last = None;
    for attempt in 1..=policy.max_attempts {
        match connector.connect().await {
            Ok(client) => return Ok(client),
            Err(e) if Connection::is_transient(&e) => {
                warn!(
                    "Runtime unavailable (attempt {}/{}): {}",
                    attempt, policy.max_attempts, e
                );
                last = Some(e);
                if attempt < policy.max_attempts {
                    policy.pause().await;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    match last {
        Some(source) => Err(Error::ReconnectExhausted {
            attempts: policy.max_attempts,
            source,
        }),
        None => Err(RuntimeError::Unavailable("no connection attempts allowed".to_string()).into()),
    }
}
