//! HTTP `Date` header value management.
//!
//! Formatting an HTTP date for every response is wasteful under load, so the formatted value is
//! cached and swapped atomically once it is older than the refresh interval. Refreshing happens
//! lazily on read, which keeps the service usable without a running async runtime.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::HeaderValue;
use once_cell::sync::Lazy;

const UPDATE_INTERVAL: Duration = Duration::from_millis(800);

struct CachedDate {
    value: HeaderValue,
    created: Instant,
}

/// Maintains the current HTTP date string.
pub struct DateService {
    current: ArcSwap<CachedDate>,
    update_interval: Duration,
}

static DATE_SERVICE: Lazy<DateService> = Lazy::new(|| DateService::new_with_update_interval(UPDATE_INTERVAL));

impl DateService {
    /// Returns the process-wide instance.
    pub fn get_global_instance() -> &'static DateService {
        &DATE_SERVICE
    }

    fn new_with_update_interval(update_interval: Duration) -> Self {
        Self { current: ArcSwap::from_pointee(format_now()), update_interval }
    }

    /// The current date as a header value, at most one update interval old.
    pub fn http_date(&self) -> HeaderValue {
        let cached = self.current.load();
        if cached.created.elapsed() < self.update_interval {
            return cached.value.clone();
        }

        let fresh = Arc::new(format_now());
        let value = fresh.value.clone();
        self.current.store(fresh);
        value
    }
}

impl fmt::Debug for DateService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DateService").field("update_interval", &self.update_interval).finish()
    }
}

fn format_now() -> CachedDate {
    let mut buf = faf_http_date::get_date_buff_no_key();
    faf_http_date::get_date_no_key(&mut buf);
    let bytes = Bytes::from_owner(buf);
    // the formatter only emits visible ASCII, the fallback is never expected to be used
    let value = HeaderValue::from_maybe_shared(bytes).unwrap_or_else(|_| HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"));
    CachedDate { value, created: Instant::now() }
}
