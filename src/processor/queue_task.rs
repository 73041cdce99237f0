//! Queue task: gives a freshly pushed package its final name and hands it to indexing.

use chrono::{DateTime, Utc};
use log::{info, warn};

use super::package::{Package, MAX_VERSION_LENGTH};
use super::task::{add_suffix, encode_seconds};
use super::TaskContext;
use crate::error::{Error, Result};
use crate::model::{PackageMessage, PackageName, PackageState};
use crate::storage::PackageStorageItem;

/// Final name of a pushed package: its id plus a version made unique by push time.
pub fn read_name(package: &Package, now: DateTime<Utc>) -> PackageName {
    let suffix = format!("-at-{}", encode_seconds(now));
    let version = add_suffix(&package.version, &suffix, MAX_VERSION_LENGTH, '.');
    PackageName::new(package.id.clone(), version)
}

pub async fn run(
    ctx: &TaskContext,
    item: &dyn PackageStorageItem,
    package: &Package,
) -> Result<PackageState> {
    let package_name = read_name(package, Utc::now());

    if let Err(e) = ctx.notifier.submitted(&ctx.user_info, &package_name).await {
        warn!("Failed to notify submission of {}: {}", package_name, e);
    }

    item.copy_to(PackageState::Original, &package_name)
        .await?
        .ok_or_else(|| Error::MissingPackage(item.to_string()))?;
    item.move_to(PackageState::IndexingQueued, &package_name)
        .await?
        .ok_or_else(|| Error::MissingPackage(item.to_string()))?;

    info!("Queued package {} for indexing", package_name);
    ctx.scheduler
        .signal(PackageMessage::new(
            ctx.user_info.clone(),
            ctx.feed_name.clone(),
            PackageState::IndexingQueued,
            package_name,
        ))
        .await?;

    Ok(PackageState::IndexingQueued)
}
