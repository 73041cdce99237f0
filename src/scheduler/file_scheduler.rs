//! Message files in a queue directory.
//!
//! `signal` writes `<uuid>.tmp` and renames it to `<uuid>.run`, so a listener never
//! sees a half-written message. The listener claims a file by renaming it to
//! `.lock`, processes it on its own task and removes it afterwards.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::{shutdown_requested, Scheduler};
use crate::error::Result;
use crate::model::PackageMessage;
use crate::processor::MessageProcessor;

const PENDING_EXTENSION: &str = "tmp";
const READY_EXTENSION: &str = "run";
const CLAIMED_EXTENSION: &str = "lock";

pub struct FileScheduler {
    queue_path: PathBuf,
    poll_interval: Duration,
}

impl FileScheduler {
    pub fn new(queue_path: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self> {
        let queue_path = queue_path.into();
        std::fs::create_dir_all(&queue_path)?;
        Ok(Self {
            queue_path,
            poll_interval,
        })
    }

    async fn files_with_extension(&self, extension: &str) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.queue_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(extension) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Puts messages claimed by a listener that stopped midway back in the queue
    async fn recover_claimed(&self) -> Result<()> {
        for path in self.files_with_extension(CLAIMED_EXTENSION).await? {
            warn!("Requeueing interrupted message {}", path.display());
            fs::rename(&path, path.with_extension(READY_EXTENSION)).await?;
        }
        Ok(())
    }

    async fn process_file(processor: Arc<dyn MessageProcessor>, path: PathBuf) {
        match Self::read_message(&path).await {
            Ok(message) => {
                debug!("Processing message {} from {}", message, path.display());
                if let Err(e) = processor.process(message).await {
                    error!("Failed to process message {}: {}", path.display(), e);
                }
            }
            Err(e) => error!("Dropping unreadable message {}: {}", path.display(), e),
        }

        if let Err(e) = fs::remove_file(&path).await {
            warn!("Failed to remove message file {}: {}", path.display(), e);
        }
    }

    async fn read_message(path: &Path) -> Result<PackageMessage> {
        let content = fs::read(path).await?;
        Ok(serde_json::from_slice(&content)?)
    }
}

#[async_trait]
impl Scheduler for FileScheduler {
    async fn signal(&self, message: PackageMessage) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let pending = self.queue_path.join(format!("{}.{}", id, PENDING_EXTENSION));
        let ready = pending.with_extension(READY_EXTENSION);

        fs::write(&pending, serde_json::to_vec(&message)?).await?;
        fs::rename(&pending, &ready).await?;

        debug!("Signalled {} as {}", message, ready.display());
        Ok(())
    }

    async fn listen_and_process(
        &self,
        processor: Arc<dyn MessageProcessor>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("Listening for messages in {}", self.queue_path.display());
        self.recover_claimed().await?;

        let mut running = JoinSet::new();
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = interval.tick() => {}
            }

            while running.try_join_next().is_some() {}

            let ready = match self.files_with_extension(READY_EXTENSION).await {
                Ok(ready) => ready,
                Err(e) => {
                    error!("Failed to list queue {}: {}", self.queue_path.display(), e);
                    continue;
                }
            };

            for path in ready {
                let claimed = path.with_extension(CLAIMED_EXTENSION);
                if let Err(e) = fs::rename(&path, &claimed).await {
                    warn!("Failed to claim message {}: {}", path.display(), e);
                    continue;
                }
                running.spawn(Self::process_file(processor.clone(), claimed));
            }
        }

        info!("Waiting for {} running messages", running.len());
        while running.join_next().await.is_some() {}
        info!("Stopped listening in {}", self.queue_path.display());
        Ok(())
    }
}
