//! Scheduling of package messages
//!
//! A scheduler carries [`PackageMessage`]s from whoever moved a package (the HTTP
//! surface, the queue task) to the processor. Three backends are available: a
//! directory of message files, a poller over the default feed and an in-memory channel.

pub mod file_scheduler;
pub mod memory_scheduler;
pub mod polling_scheduler;

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::Result;
use crate::model::PackageMessage;
use crate::processor::MessageProcessor;
use crate::storage::StorageService;

pub use file_scheduler::FileScheduler;
pub use memory_scheduler::MemoryScheduler;
pub use polling_scheduler::PollingScheduler;

#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn signal(&self, message: PackageMessage) -> Result<()>;

    /// Feeds messages to `processor` until `shutdown` turns true
    async fn listen_and_process(
        &self,
        processor: Arc<dyn MessageProcessor>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>;
}

/// Resolves when the shutdown flag is raised or its sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Available scheduler backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerBackend {
    #[default]
    File,
    Polling,
    Memory,
}

impl std::str::FromStr for SchedulerBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" | "queue" => Ok(SchedulerBackend::File),
            "polling" | "console" => Ok(SchedulerBackend::Polling),
            "memory" | "mock" => Ok(SchedulerBackend::Memory),
            _ => Err(format!("Unknown scheduler backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub backend: SchedulerBackend,
    /// Directory of message files for the file scheduler
    pub queue_path: String,
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backend: SchedulerBackend::default(),
            queue_path: "./data/queue".to_string(),
            poll_interval_ms: 1000,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Overrides the backend from `SCHEDULER_BACKEND` when it is set and valid
    pub fn apply_env(&mut self) {
        match env::var("SCHEDULER_BACKEND") {
            Ok(backend_str) => match backend_str.parse::<SchedulerBackend>() {
                Ok(backend) => {
                    info!("Using scheduler backend from environment: {:?}", backend);
                    self.backend = backend;
                }
                Err(e) => {
                    warn!(
                        "Invalid scheduler backend in environment: {}. Keeping {:?}.",
                        e, self.backend
                    );
                }
            },
            Err(_) => {
                info!("No scheduler backend specified in environment, using {:?}", self.backend);
            }
        }
    }

    pub fn create_scheduler(&self, storage: Arc<dyn StorageService>) -> Result<Arc<dyn Scheduler>> {
        match self.backend {
            SchedulerBackend::File => {
                info!("Using file scheduler in {}", self.queue_path);
                Ok(Arc::new(FileScheduler::new(&self.queue_path, self.poll_interval())?))
            }
            SchedulerBackend::Polling => {
                info!("Using polling scheduler every {:?}", self.poll_interval());
                Ok(Arc::new(PollingScheduler::new(storage, self.poll_interval())))
            }
            SchedulerBackend::Memory => {
                info!("Using in-memory scheduler");
                Ok(Arc::new(MemoryScheduler::new()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local_store::LocalStorageService;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_scheduler_backend_from_str() {
        assert_eq!("file".parse::<SchedulerBackend>().unwrap(), SchedulerBackend::File);
        assert_eq!("Console".parse::<SchedulerBackend>().unwrap(), SchedulerBackend::Polling);
        assert_eq!("MEMORY".parse::<SchedulerBackend>().unwrap(), SchedulerBackend::Memory);
        assert!("carrier-pigeon".parse::<SchedulerBackend>().is_err());
    }

    #[test]
    #[serial]
    fn test_scheduler_backend_from_env() {
        let mut config = SchedulerConfig::default();
        env::set_var("SCHEDULER_BACKEND", "polling");
        config.apply_env();
        assert_eq!(config.backend, SchedulerBackend::Polling);

        env::set_var("SCHEDULER_BACKEND", "bogus");
        config.apply_env();
        assert_eq!(config.backend, SchedulerBackend::Polling);

        env::remove_var("SCHEDULER_BACKEND");
    }

    #[test]
    fn test_create_every_scheduler() {
        let root = TempDir::new().unwrap();
        let storage: Arc<dyn StorageService> =
            Arc::new(LocalStorageService::new(root.path().join("storage")).unwrap());

        for backend in [
            SchedulerBackend::File,
            SchedulerBackend::Polling,
            SchedulerBackend::Memory,
        ] {
            let config = SchedulerConfig {
                backend,
                queue_path: root.path().join("queue").to_string_lossy().to_string(),
                poll_interval_ms: 10,
            };
            assert!(config.create_scheduler(storage.clone()).is_ok());
        }
    }

    #[tokio::test]
    async fn test_shutdown_requested() {
        let (sender, mut receiver) = watch::channel(false);
        let waiter = tokio::spawn(async move { shutdown_requested(&mut receiver).await });
        sender.send(true).unwrap();
        waiter.await.unwrap();

        let (sender, mut receiver) = watch::channel(false);
        drop(sender);
        shutdown_requested(&mut receiver).await;
    }
}
