//! Console-style scheduler: finds work by querying the default feed.

use async_trait::async_trait;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::{shutdown_requested, Scheduler};
use crate::error::Result;
use crate::model::{PackageMessage, PackageState, UserInfo};
use crate::processor::MessageProcessor;
use crate::storage::StorageService;

/// States picked up on every poll, in processing order
const POLLED_STATES: [PackageState; 3] = [
    PackageState::New,
    PackageState::IndexingQueued,
    PackageState::DeletingQueued,
];

pub struct PollingScheduler {
    storage: Arc<dyn StorageService>,
    poll_interval: Duration,
}

impl PollingScheduler {
    pub fn new(storage: Arc<dyn StorageService>, poll_interval: Duration) -> Self {
        Self {
            storage,
            poll_interval,
        }
    }

    /// One pass over the polled states. Returns how many messages were processed.
    pub async fn poll_once(
        &self,
        processor: &dyn MessageProcessor,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<usize> {
        let feed = self.storage.get_feed(None);
        let mut count = 0;

        for state in POLLED_STATES {
            for package_name in feed.query_packages(None, state).await? {
                if *shutdown.borrow() {
                    return Ok(count);
                }

                let user_name = feed.get_package(None, state, &package_name).user_name().await?;
                let message = PackageMessage::new(
                    UserInfo {
                        user_name,
                        user_handle: None,
                    },
                    None,
                    state,
                    package_name,
                );

                debug!("Processing polled message {}", message);
                if let Err(e) = processor.process(message).await {
                    error!("Failed to process polled package: {}", e);
                }
                count += 1;
            }
        }

        Ok(count)
    }
}

#[async_trait]
impl Scheduler for PollingScheduler {
    async fn signal(&self, message: PackageMessage) -> Result<()> {
        debug!("Polling scheduler will find {} on its next pass", message);
        Ok(())
    }

    async fn listen_and_process(
        &self,
        processor: Arc<dyn MessageProcessor>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("Polling the default feed every {:?}", self.poll_interval);
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = interval.tick() => {}
            }

            if let Err(e) = self.poll_once(processor.as_ref(), &shutdown).await {
                error!("Polling the default feed failed: {}", e);
            }
        }

        info!("Stopped polling");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PackageName;
    use crate::storage::local_store::LocalStorageService;
    use bytes::Bytes;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Collecting {
        messages: Mutex<Vec<PackageMessage>>,
    }

    #[async_trait]
    impl MessageProcessor for Collecting {
        async fn process(&self, message: PackageMessage) -> Result<()> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_poll_once_visits_queued_states_only() {
        let root = TempDir::new().unwrap();
        let storage: Arc<dyn StorageService> = Arc::new(LocalStorageService::new(root.path()).unwrap());
        let feed = storage.get_feed(None);

        for (state, id) in [
            (PackageState::New, "A"),
            (PackageState::IndexingQueued, "B"),
            (PackageState::DeletingQueued, "C"),
            (PackageState::Partial, "D"),
            (PackageState::Succeeded, "E"),
        ] {
            feed.get_package(Some("alice"), state, &PackageName::new(id, "1.0"))
                .put(Bytes::from_static(b"pkg"))
                .await
                .unwrap();
        }

        let scheduler = PollingScheduler::new(storage, Duration::from_millis(10));
        let processor = Collecting::default();
        let (_stop, shutdown) = watch::channel(false);
        assert_eq!(scheduler.poll_once(&processor, &shutdown).await.unwrap(), 3);

        let messages = processor.messages.lock().unwrap();
        let seen: Vec<(PackageState, String)> = messages
            .iter()
            .map(|m| (m.package_state, m.package_name.id.clone()))
            .collect();
        assert_eq!(
            seen,
            vec![
                (PackageState::New, "A".to_string()),
                (PackageState::IndexingQueued, "B".to_string()),
                (PackageState::DeletingQueued, "C".to_string()),
            ]
        );
        assert_eq!(messages[0].user_info.user_name.as_deref(), Some("alice"));
    }
}
