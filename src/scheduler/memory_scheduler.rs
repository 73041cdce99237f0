//! In-process channel scheduler for single-process deployments and tests.

use async_trait::async_trait;
use log::{debug, error, info};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

use super::{shutdown_requested, Scheduler};
use crate::error::{Error, Result};
use crate::model::PackageMessage;
use crate::processor::MessageProcessor;

pub struct MemoryScheduler {
    sender: mpsc::UnboundedSender<PackageMessage>,
    receiver: Mutex<mpsc::UnboundedReceiver<PackageMessage>>,
}

impl Default for MemoryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryScheduler {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Processes queued messages, including ones signalled meanwhile, until none is
    /// left. Returns how many were processed.
    pub async fn process_pending(&self, processor: &dyn MessageProcessor) -> Result<usize> {
        let mut receiver = self.receiver.lock().await;
        let mut count = 0;

        while let Ok(message) = receiver.try_recv() {
            debug!("Processing message {}", message);
            processor.process(message).await?;
            count += 1;
        }

        Ok(count)
    }
}

#[async_trait]
impl Scheduler for MemoryScheduler {
    async fn signal(&self, message: PackageMessage) -> Result<()> {
        debug!("Signalled {}", message);
        self.sender
            .send(message)
            .map_err(|e| Error::invalid_operation(format!("scheduler closed: {}", e)))
    }

    async fn listen_and_process(
        &self,
        processor: Arc<dyn MessageProcessor>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("Listening for in-memory messages");
        let mut receiver = self.receiver.lock().await;

        loop {
            let message = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                message = receiver.recv() => message,
            };

            match message {
                Some(message) => {
                    if let Err(e) = processor.process(message).await {
                        error!("Failed to process message: {}", e);
                    }
                }
                None => break,
            }
        }

        info!("Stopped listening for in-memory messages");
        Ok(())
    }
}
