//! Application state

use std::sync::Arc;

use chrono::TimeDelta;
use tokio::sync::Mutex;

use crate::calendar::EventSink;
use crate::tracker::UrlHistory;

/// State shared by every connection.
///
/// Each connection runs its own tracker, so the per-URL running totals are
/// the only cross-connection resource and sit behind a lock.
pub struct AppState {
    history: Mutex<UrlHistory>,
    sink: Option<Arc<dyn EventSink>>,
}

impl AppState {
    pub fn new(sink: Option<Arc<dyn EventSink>>) -> Self {
        Self {
            history: Mutex::new(UrlHistory::new()),
            sink,
        }
    }

    /// The calendar sink, if startup authentication produced one.
    pub fn sink(&self) -> Option<&Arc<dyn EventSink>> {
        self.sink.as_ref()
    }

    /// Add a closed session's duration to the running total for `url`.
    /// Returns the new total.
    pub async fn record_history(&self, url: String, duration: TimeDelta) -> TimeDelta {
        let mut history = self.history.lock().await;
        let entry = history.entry(url).or_insert_with(TimeDelta::zero);
        *entry = *entry + duration;
        *entry
    }

    /// Total recorded time for one URL.
    pub async fn history_for(&self, url: &str) -> Option<TimeDelta> {
        self.history.lock().await.get(url).copied()
    }
}
