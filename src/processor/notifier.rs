//! Pipeline milestone notifications.

use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;

use crate::error::Result;
use crate::model::{PackageName, UserInfo};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn submitted(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()>;
    async fn damaged(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()>;
    async fn indexed(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()>;
    async fn partially_indexed(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()>;
    async fn deleted(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()>;
    async fn partially_deleted(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn submitted(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()> {
        info!("Package {} submitted by {}", package_name, user_info);
        Ok(())
    }

    async fn damaged(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()> {
        warn!("Package {} of {} is damaged", package_name, user_info);
        Ok(())
    }

    async fn indexed(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()> {
        info!("Package {} of {} indexed", package_name, user_info);
        Ok(())
    }

    async fn partially_indexed(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()> {
        warn!("Package {} of {} partially indexed", package_name, user_info);
        Ok(())
    }

    async fn deleted(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()> {
        info!("Package {} of {} deleted", package_name, user_info);
        Ok(())
    }

    async fn partially_deleted(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()> {
        warn!("Package {} of {} partially deleted", package_name, user_info);
        Ok(())
    }
}

/// Forwards every milestone to each inner notifier in turn. The first failure is
/// returned after all of them were called.
#[derive(Clone, Default)]
pub struct CompositeNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl CompositeNotifier {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }
}

macro_rules! fan_out {
    ($self:ident, $method:ident, $user_info:ident, $package_name:ident) => {{
        let mut first_error = None;
        for notifier in &$self.notifiers {
            if let Err(e) = notifier.$method($user_info, $package_name).await {
                warn!("Notifier failed on {} for {}: {}", stringify!($method), $package_name, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }};
}

#[async_trait]
impl Notifier for CompositeNotifier {
    async fn submitted(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()> {
        fan_out!(self, submitted, user_info, package_name)
    }

    async fn damaged(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()> {
        fan_out!(self, damaged, user_info, package_name)
    }

    async fn indexed(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()> {
        fan_out!(self, indexed, user_info, package_name)
    }

    async fn partially_indexed(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()> {
        fan_out!(self, partially_indexed, user_info, package_name)
    }

    async fn deleted(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()> {
        fan_out!(self, deleted, user_info, package_name)
    }

    async fn partially_deleted(&self, user_info: &UserInfo, package_name: &PackageName) -> Result<()> {
        fan_out!(self, partially_deleted, user_info, package_name)
    }
}
