//! Telemetry contract.
//!
//! Calls are fire-and-forget: implementations swallow their own failures so the
//! pipeline never fails because of telemetry.

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use serde_json::Value;
use std::time::Duration;

use crate::error::Error;
use crate::model::UserInfo;

pub trait SupportService: Send + Sync {
    fn track_event(&self, user_info: &UserInfo, event_name: &str, metadata: Value);
    fn track_exception(&self, error: &Error, metadata: Value);
    fn track_request(&self, name: &str, start: DateTime<Utc>, duration: Duration, success: bool);
    fn track_metric(&self, name: &str, value: f64, metadata: Value);
}

/// Writes every tracked item to the log.
#[derive(Debug, Default, Clone)]
pub struct LogSupportService;

impl LogSupportService {
    pub fn new() -> Self {
        Self
    }
}

impl SupportService for LogSupportService {
    fn track_event(&self, user_info: &UserInfo, event_name: &str, metadata: Value) {
        info!("Event {} by {}: {}", event_name, user_info, metadata);
    }

    fn track_exception(&self, error: &Error, metadata: Value) {
        error!("Exception {} ({})", error, metadata);
    }

    fn track_request(&self, name: &str, start: DateTime<Utc>, duration: Duration, success: bool) {
        info!(
            "Request {} started {} took {} ms, success = {}",
            name,
            start.to_rfc3339(),
            duration.as_millis(),
            success
        );
    }

    fn track_metric(&self, name: &str, value: f64, metadata: Value) {
        debug!("Metric {} = {} ({})", name, value, metadata);
    }
}
