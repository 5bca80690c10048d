//! Centralized log aggregation with WebSocket fan-out.
//!
//! Collects log lines from all sources (supervisor, workers, API handlers)
//! and fans them out to subscribers with a bounded replay ring. `emit` is
//! callable from any thread and never blocks on a slow subscriber: each
//! subscriber owns an unbounded channel drained by its WebSocket task on
//! the event loop, and a subscriber whose channel is gone is dropped during
//! the next emit.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::process::LogSink;

pub const MAX_HISTORY: usize = 2000;

/// Seconds since the Unix epoch, fractional.
pub fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: f64,
    pub tag: String,
    pub message: String,
}

struct Subscriber {
    id: u64,
    tx: UnboundedSender<LogEntry>,
}

#[derive(Default)]
struct HubInner {
    history: VecDeque<LogEntry>,
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

/// Thread-safe log collector with bounded history.
///
/// One lock guards history and the subscriber set together, which gives a
/// total order across emitters and lets a late subscriber split replay from
/// live with no gap and no overlap.
pub struct LogHub {
    inner: Mutex<HubInner>,
}

impl LogHub {
    pub fn new() -> Self {
        LogHub {
            inner: Mutex::new(HubInner::default()),
        }
    }

    /// Append to history (evicting the oldest entry when full) and push to
    /// every live subscriber.
    pub fn emit(&self, message: impl Into<String>, tag: &str) {
        let entry = LogEntry {
            timestamp: unix_time(),
            tag: tag.to_string(),
            message: message.into(),
        };

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.history.len() == MAX_HISTORY {
            inner.history.pop_front();
        }
        inner.history.push_back(entry.clone());
        inner
            .subscribers
            .retain(|s| s.tx.send(entry.clone()).is_ok());
    }

    /// Register a live subscriber. The returned id is the unsubscribe key.
    pub fn subscribe(&self) -> (u64, UnboundedReceiver<LogEntry>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Self::subscribe_locked(&mut inner)
    }

    /// Atomically snapshot up to `limit` recent entries (tag-filtered) and
    /// register a subscriber: replay and the live stream partition exactly.
    pub fn subscribe_with_history(
        &self,
        limit: usize,
        tag: Option<&str>,
    ) -> (u64, Vec<LogEntry>, UnboundedReceiver<LogEntry>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let replay = Self::recent_locked(&inner.history, limit, tag);
        let (id, rx) = Self::subscribe_locked(&mut inner);
        (id, replay, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.subscribers.retain(|s| s.id != id);
    }

    /// Drop every subscriber; each WebSocket task observes its channel
    /// closing and shuts the connection down.
    pub fn close_all(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.subscribers.clear();
    }

    /// Up to `limit` most recent entries, oldest first, optionally filtered
    /// by tag.
    pub fn recent(&self, limit: usize, tag: Option<&str>) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Self::recent_locked(&inner.history, limit, tag)
    }

    /// A `LogSink` that emits every line under `tag`.
    pub fn sink(self: &Arc<Self>, tag: &'static str) -> LogSink {
        let hub = Arc::clone(self);
        Arc::new(move |line: &str| hub.emit(line, tag))
    }

    fn subscribe_locked(inner: &mut HubInner) -> (u64, UnboundedReceiver<LogEntry>) {
        let id = inner.next_id;
        inner.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscribers.push(Subscriber { id, tx });
        (id, rx)
    }

    fn recent_locked(history: &VecDeque<LogEntry>, limit: usize, tag: Option<&str>) -> Vec<LogEntry> {
        let matching = history
            .iter()
            .filter(|e| tag.is_none_or(|t| e.tag == t));
        let count = matching.clone().count();
        matching.skip(count.saturating_sub(limit)).cloned().collect()
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

// ---------- Unit tests ----------
