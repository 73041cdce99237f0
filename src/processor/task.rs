//! Building blocks shared by the pipeline tasks.

use chrono::{DateTime, TimeZone, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use log::debug;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Fan-out width over the binaries of a package
pub const IMAGE_CONCURRENCY: usize = 2;
/// Fan-out width over the sources of one symbol file
pub const SOURCE_CONCURRENCY: usize = 5;

const ENCODED_SECONDS_WIDTH: usize = 6;
const ENCODED_SECONDS_BASE: u64 = 26 + 10;

/// Runs `task` over `items` with at most `count` in flight, keeping input order.
pub async fn process_throttled<I, F, Fut, T>(count: usize, items: I, task: F) -> Vec<T>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = T>,
{
    stream::iter(items)
        .map(task)
        .buffered(count.max(1))
        .collect()
        .await
}

type SharedRequest = Shared<BoxFuture<'static, std::result::Result<(), Arc<Error>>>>;

/// Single-flight map scoped to one package run.
///
/// The first request for a key runs its action. Later requests for the same key await
/// that action and see its outcome.
#[derive(Default)]
pub struct RequestMap {
    requests: Mutex<HashMap<String, SharedRequest>>,
}

impl RequestMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the key had already been requested in this run
    pub async fn request_or_skip<F, Fut>(&self, key: &str, action: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (request, existed) = {
            let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            match requests.get(key) {
                Some(request) => (request.clone(), true),
                None => {
                    let request = action().map(|result| result.map_err(Arc::new)).boxed().shared();
                    requests.insert(key.to_string(), request.clone());
                    (request, false)
                }
            }
        };

        if existed {
            debug!("Request {} already made in this run", key);
        }

        request.await.map_err(Error::Shared)?;
        Ok(existed)
    }
}

/// Seconds since 2015-01-01 UTC as six base-36 digits, most significant first.
///
/// Digits run 0-9 then A-Z (then a-z, unreachable in base 36). Values that need more
/// than six digits keep their six least significant ones.
pub fn encode_seconds(time: DateTime<Utc>) -> String {
    let epoch = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).single();
    let mut value = epoch
        .map(|epoch| (time - epoch).num_seconds().max(0) as u64)
        .unwrap_or(0);

    let mut digits = ['0'; ENCODED_SECONDS_WIDTH];
    let mut position = 0;
    while value > 0 && position < ENCODED_SECONDS_WIDTH {
        digits[ENCODED_SECONDS_WIDTH - position - 1] =
            encode_digit((value % ENCODED_SECONDS_BASE) as u8);
        value /= ENCODED_SECONDS_BASE;
        position += 1;
    }

    digits.iter().collect()
}

fn encode_digit(digit: u8) -> char {
    match digit {
        0..=9 => (b'0' + digit) as char,
        10..=35 => (b'A' + digit - 10) as char,
        _ => (b'a' + digit - 36) as char,
    }
}

/// Truncates `text` so that `text + suffix` fits in `max` characters, trimming
/// `trim` characters left dangling at the cut.
pub fn add_suffix(text: &str, suffix: &str, max: usize, trim: char) -> String {
    let keep = max.saturating_sub(suffix.chars().count());
    let truncated: String = text.chars().take(keep).collect();
    format!("{}{}", truncated.trim_end_matches(trim), suffix)
}
