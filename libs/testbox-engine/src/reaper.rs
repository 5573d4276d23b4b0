// Periodic sweep for run containers whose cleanup never completed,
// e.g. the process died between start and removal.

use crate::error::Result;
use crate::runtime::ContainerRuntime;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Extra age beyond the run timeout before a container counts as abandoned
pub const REAP_GRACE: Duration = Duration::from_secs(60);

pub struct Reaper {
    runtime: Arc<dyn ContainerRuntime>,
    max_age: Duration,
}

impl Reaper {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, run_timeout: Duration) -> Self {
        Self {
            runtime,
            max_age: run_timeout + REAP_GRACE,
        }
    }

    /// Remove abandoned managed containers, returning their ids
    pub async fn reap_once(&self) -> Result<Vec<String>> {
        self.reap_at(Utc::now().timestamp()).await
    }

    async fn reap_at(&self, now: i64) -> Result<Vec<String>> {
        let cutoff = now - self.max_age.as_secs() as i64;
        let mut reaped = Vec::new();

        for container in self.runtime.list_managed_containers().await? {
            if container.created_at > cutoff {
                continue;
            }
            match self.runtime.remove_container(&container.id).await {
                Ok(()) => {
                    info!(container_id = %container.id, created_at = container.created_at, "Reaped abandoned container");
                    reaped.push(container.id);
                }
                Err(e) => warn!(container_id = %container.id, error = %e, "Failed to reap container"),
            }
        }

        Ok(reaped)
    }

    /// Sweep every `interval` until the task is dropped
    pub async fn run_periodic(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match self.reap_once().await {
                Ok(reaped) if reaped.is_empty() => debug!("Reaper pass: nothing to remove"),
                Ok(reaped) => info!(count = reaped.len(), "Reaper pass complete"),
                Err(e) => warn!(error = %e, "Reaper pass failed"),
            }
        }
    }
}
