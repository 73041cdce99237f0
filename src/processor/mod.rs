//! Package processing pipeline
//!
//! A [`PackageMessage`] says "this package reached this state". The processor claims
//! the package by moving it into a working state, runs the matching task and removes
//! the claimed copy when the task finishes. A task that fails leaves its package in
//! the corresponding damaged state so it can be retried.

pub mod delete_task;
pub mod index_task;
pub mod introspection;
pub mod notifier;
pub mod package;
pub mod queue_task;
pub mod status;
pub mod task;

use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::model::{PackageMessage, PackageState, UserInfo};
use crate::scheduler::Scheduler;
use crate::storage::{PackageStorageItem, StorageFeed, StorageService};
use crate::support::SupportService;
use introspection::Introspection;
use notifier::Notifier;
use package::Package;

/// Suffix of the per-binary status files inside a status package
pub const STATUS_SUFFIX: &str = ".status";
pub const ERROR_FILE: &str = "error.txt";
pub const EMPTY_FILE: &str = "empty.txt";

#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: PackageMessage) -> Result<()>;
}

/// Everything a task needs for one message.
pub struct TaskContext {
    pub feed: Arc<dyn StorageFeed>,
    pub feed_name: Option<String>,
    pub user_info: UserInfo,
    pub scheduler: Arc<dyn Scheduler>,
    pub notifier: Arc<dyn Notifier>,
    pub support: Arc<dyn SupportService>,
    pub introspection: Introspection,
    pub public_url: String,
}

/// How the processor takes hold of the package before working on it.
#[derive(Debug, Clone, Copy)]
enum Claim {
    Keep,
    Move(PackageState),
    Copy(PackageState),
}

#[derive(Debug, Clone, Copy)]
enum Work {
    Queue,
    Index,
    Delete,
}

pub struct PackageProcessor {
    storage: Arc<dyn StorageService>,
    scheduler: Arc<dyn Scheduler>,
    notifier: Arc<dyn Notifier>,
    support: Arc<dyn SupportService>,
    introspection: Introspection,
    public_url: String,
}

impl PackageProcessor {
    pub fn new(
        storage: Arc<dyn StorageService>,
        scheduler: Arc<dyn Scheduler>,
        notifier: Arc<dyn Notifier>,
        support: Arc<dyn SupportService>,
        introspection: Introspection,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            scheduler,
            notifier,
            support,
            introspection,
            public_url: public_url.into(),
        }
    }

    fn context(&self, message: &PackageMessage) -> TaskContext {
        TaskContext {
            feed: self.storage.get_feed(message.feed_name.as_deref()),
            feed_name: message.feed_name.clone(),
            user_info: message.user_info.clone(),
            scheduler: self.scheduler.clone(),
            notifier: self.notifier.clone(),
            support: self.support.clone(),
            introspection: self.introspection.clone(),
            public_url: self.public_url.clone(),
        }
    }

    async fn dispatch(&self, message: &PackageMessage) -> Result<()> {
        use PackageState::*;

        match message.package_state {
            New => {
                self.process_package(message, New, Claim::Keep, Work::Queue, DamagedNew)
                    .await?;
            }
            IndexingQueued => {
                self.process_package(
                    message,
                    IndexingQueued,
                    Claim::Move(Indexing),
                    Work::Index,
                    DamagedIndexing,
                )
                .await?;
            }
            DeletingQueued => {
                self.process_package(
                    message,
                    DeletingQueued,
                    Claim::Move(Deleting),
                    Work::Delete,
                    DamagedDeleting,
                )
                .await?;
            }
            Partial => {
                let outcome = self
                    .process_package(
                        message,
                        Partial,
                        Claim::Move(Deleting),
                        Work::Delete,
                        DamagedDeleting,
                    )
                    .await?;

                if outcome == Some(Deleted) {
                    info!("Reindexing package {}", message.package_name);
                    self.process_package(
                        message,
                        Original,
                        Claim::Copy(Indexing),
                        Work::Index,
                        DamagedIndexing,
                    )
                    .await?;
                }
            }
            other => {
                return Err(Error::NotSupported(format!(
                    "processing packages in state {}",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Returns the state the work left the package in, `None` when it failed.
    async fn process_package(
        &self,
        message: &PackageMessage,
        state: PackageState,
        claim: Claim,
        work: Work,
        damaged_state: PackageState,
    ) -> Result<Option<PackageState>> {
        let ctx = self.context(message);
        let package_name = &message.package_name;
        let source = ctx.feed.get_package(None, state, package_name);
        info!("Processing package {} ({:?})", source, work);

        let claimed = match claim {
            Claim::Keep => Ok(Some(ctx.feed.get_package(None, state, package_name))),
            Claim::Move(to) => source.move_to(to, package_name).await,
            Claim::Copy(to) => source.copy_to(to, package_name).await,
        };

        let claimed = match claimed {
            Ok(Some(item)) => item,
            Ok(None) => {
                let e = Error::MissingPackage(source.to_string());
                self.support
                    .track_exception(&e, json!({ "package_name": package_name.to_string() }));
                warn!("Nothing to process: {}", e);
                return Ok(None);
            }
            Err(e) => {
                self.fail(&ctx, source.as_ref(), damaged_state, e).await;
                return Ok(None);
            }
        };

        match self.run_work(&ctx, claimed.as_ref(), work).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                self.fail(&ctx, claimed.as_ref(), damaged_state, e).await;
                Ok(None)
            }
        }
    }

    async fn run_work(
        &self,
        ctx: &TaskContext,
        item: &dyn PackageStorageItem,
        work: Work,
    ) -> Result<PackageState> {
        let content = item
            .get()
            .await?
            .ok_or_else(|| Error::MissingPackage(item.to_string()))?;
        let package = Package::read(&content)?;

        let outcome = match work {
            Work::Queue => queue_task::run(ctx, item, &package).await?,
            Work::Index => index_task::run(ctx, item, &package).await?,
            Work::Delete => delete_task::run(ctx, item, &package).await?,
        };

        if !matches!(work, Work::Queue) {
            item.delete().await?;
        }

        Ok(outcome)
    }

    async fn fail(
        &self,
        ctx: &TaskContext,
        item: &dyn PackageStorageItem,
        damaged_state: PackageState,
        e: Error,
    ) {
        let package_name = item.name();
        self.support
            .track_exception(&e, json!({ "package_name": package_name.to_string() }));
        error!("Failed to process package {}: {}", item, e);

        if let Err(e) = self.notifier.damaged(&ctx.user_info, package_name).await {
            warn!("Failed to notify damage of {}: {}", package_name, e);
        }

        match item.move_to(damaged_state, package_name).await {
            Ok(Some(damaged)) => warn!("Moved package to {}", damaged),
            Ok(None) => warn!("Damaged package {} no longer exists", item),
            Err(e) => error!("Failed to move package {} to {}: {}", item, damaged_state, e),
        }
    }
}

#[async_trait]
impl MessageProcessor for PackageProcessor {
    async fn process(&self, message: PackageMessage) -> Result<()> {
        let start = Utc::now();
        let timer = Instant::now();

        let result = self.dispatch(&message).await;

        self.support.track_request(
            &message.package_state.to_string(),
            start,
            timer.elapsed(),
            result.is_ok(),
        );
        if let Err(e) = &result {
            self.support
                .track_exception(e, json!({ "message": message.to_string() }));
        }

        result
    }
}
