//! Delete task: releases what a status package says was stored.

use bytes::Bytes;
use log::{debug, error, info, warn};
use serde_json::json;

use super::package::{Package, PackageBuilder};
use super::status::{ExceptionStatus, ImageStatus, SourceStatus, SymbolStatus};
use super::task::{process_throttled, RequestMap, IMAGE_CONCURRENCY, SOURCE_CONCURRENCY};
use super::{TaskContext, EMPTY_FILE, ERROR_FILE, STATUS_SUFFIX};
use crate::error::{Error, Result};
use crate::model::{PackageName, PackageState};
use crate::storage::PackageStorageItem;

struct DeleteRun<'a> {
    ctx: &'a TaskContext,
    package_name: &'a PackageName,
    requests: RequestMap,
}

pub async fn run(
    ctx: &TaskContext,
    item: &dyn PackageStorageItem,
    package: &Package,
) -> Result<PackageState> {
    let package_name = item.name();
    let mut builder = PackageBuilder::new(package_name);
    let mut state = PackageState::Partial;

    let run = DeleteRun {
        ctx,
        package_name,
        requests: RequestMap::new(),
    };

    match run.delete_package(&mut builder, package).await {
        Ok(true) => state = PackageState::Deleted,
        Ok(false) => {}
        Err(e) => {
            ctx.support
                .track_exception(&e, json!({ "package_name": package_name.to_string() }));
            error!("Error while deleting package {}: {}", package_name, e);
            builder.add_file(ERROR_FILE, format!("{:?}", e));
        }
    }
    info!("Marking package {} as {}", package_name, state);

    if builder.is_empty() {
        builder.add_file(EMPTY_FILE, Vec::new());
    }

    debug!("Saving package processing status {}", package_name);
    let user_name = item.user_name().await?;
    ctx.feed
        .get_package(user_name.as_deref(), state, package_name)
        .put(builder.build()?)
        .await?;

    let notified = match state {
        PackageState::Deleted => ctx.notifier.deleted(&ctx.user_info, package_name).await,
        _ => {
            ctx.notifier
                .partially_deleted(&ctx.user_info, package_name)
                .await
        }
    };
    if let Err(e) = notified {
        warn!("Failed to notify deletion of {}: {}", package_name, e);
    }

    Ok(state)
}

impl<'a> DeleteRun<'a> {
    fn track(&self, error: &Error) -> ExceptionStatus {
        self.ctx.support.track_exception(
            error,
            json!({ "package_name": self.package_name.to_string() }),
        );
        ExceptionStatus::from(error)
    }

    /// Returns whether every status file was read and everything it lists is gone
    async fn delete_package(&self, builder: &mut PackageBuilder, package: &Package) -> Result<bool> {
        let mut all_read = true;
        let mut status_files = Vec::new();

        for entry in package.entries() {
            if !entry.path.ends_with(STATUS_SUFFIX) {
                continue;
            }
            match serde_json::from_slice::<ImageStatus>(&entry.content) {
                Ok(status) => status_files.push((entry.path.clone(), status)),
                Err(e) => {
                    let e = Error::from(e);
                    self.track(&e);
                    error!("Error while deserializing status {}: {}", entry.path, e);
                    all_read = false;
                    builder.add_file(entry.path.clone(), Bytes::clone(&entry.content));
                }
            }
        }

        let statuses = process_throttled(IMAGE_CONCURRENCY, status_files, |(path, status)| async move {
            (path, self.delete_image(status).await)
        })
        .await;

        for (path, status) in &statuses {
            builder.add_json(path.clone(), status)?;
        }

        Ok(all_read && statuses.iter().all(|(_, status)| status.check(false)))
    }

    async fn delete_image(&self, status: ImageStatus) -> ImageStatus {
        let mut new_status = ImageStatus::new(status.image_name);
        if let Some(symbol) = status.symbol_status {
            new_status.symbol_status = Some(self.delete_symbol(symbol).await);
        }
        new_status
    }

    async fn delete_symbol(&self, status: SymbolStatus) -> SymbolStatus {
        let mut new_status = SymbolStatus::new(status.symbol_name.clone());

        if status.stored {
            debug!("Deleting symbol {}", status.symbol_name);
            new_status.stored = true;

            let item = self
                .ctx
                .feed
                .get_symbol(Some(self.package_name), &status.symbol_name);
            let deleted = self
                .requests
                .request_or_skip(&format!("pdb/{}", status.symbol_name), move || async move {
                    item.delete().await.map(|_| ())
                })
                .await;

            match deleted {
                Ok(_) => {
                    new_status.stored = false;
                    debug!("Deleted symbol {}", status.symbol_name);
                }
                Err(e) => new_status.exception = Some(self.track(&e)),
            }
        }

        if let Some(sources) = status.source_statuses {
            new_status.source_statuses = Some(
                process_throttled(SOURCE_CONCURRENCY, sources, |source| {
                    self.delete_source(source)
                })
                .await,
            );
        }

        new_status
    }

    async fn delete_source(&self, status: SourceStatus) -> SourceStatus {
        let mut new_status = SourceStatus::new(status.source_name.clone());

        if status.stored {
            debug!("Deleting source {}", status.source_name);
            new_status.stored = true;

            let item = self
                .ctx
                .feed
                .get_source(Some(self.package_name), &status.source_name);
            let deleted = self
                .requests
                .request_or_skip(&format!("src/{}", status.source_name), move || async move {
                    item.delete().await.map(|_| ())
                })
                .await;

            match deleted {
                Ok(_) => {
                    new_status.stored = false;
                    debug!("Deleted source {}", status.source_name);
                }
                Err(e) => new_status.exception = Some(self.track(&e)),
            }
        }

        new_status
    }
}
