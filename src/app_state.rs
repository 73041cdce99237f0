//! Application State Management
//!
//! This module provides the application state that contains all services
//! and their dependencies, following the dependency injection pattern.

use log::info;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::Result;
use crate::processor::introspection::Introspection;
use crate::processor::notifier::{LogNotifier, Notifier};
use crate::processor::PackageProcessor;
use crate::scheduler::Scheduler;
use crate::storage::StorageService;
use crate::support::{LogSupportService, SupportService};

/// Application state containing all services and their dependencies
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn StorageService>,
    pub scheduler: Arc<dyn Scheduler>,
    pub processor: Arc<PackageProcessor>,
    pub support: Arc<dyn SupportService>,
    pub config: AppConfig,
}

impl AppState {
    /// Create application state with backends selected by the configuration
    pub fn from_config(config: AppConfig) -> Result<Self> {
        info!("Initializing application state with configuration");

        let support: Arc<dyn SupportService> = Arc::new(LogSupportService::new());
        let storage = config.storage.create_storage(Some(support.clone()))?;
        let scheduler = config.scheduler.create_scheduler(storage.clone())?;

        let state = Self::with_services(config, storage, scheduler, Arc::new(LogNotifier), support);
        info!("Application state initialized successfully");
        Ok(state)
    }

    /// Wire the processor on top of already created services
    pub fn with_services(
        config: AppConfig,
        storage: Arc<dyn StorageService>,
        scheduler: Arc<dyn Scheduler>,
        notifier: Arc<dyn Notifier>,
        support: Arc<dyn SupportService>,
    ) -> Self {
        let processor = Arc::new(PackageProcessor::new(
            storage.clone(),
            scheduler.clone(),
            notifier,
            support.clone(),
            Introspection::default(),
            config.server.public_url.clone(),
        ));

        Self {
            storage,
            scheduler,
            processor,
            support,
            config,
        }
    }
}
