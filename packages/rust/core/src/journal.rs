//! Domain journal: headed, typed log entries serialized to sinks.
//!
//! Writing never blocks and never fails back into the caller. Entries travel
//! through a [`TaskQueue`] so sinks see them one at a time, in order.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use newsdesk_shared::LogKind;
use newsdesk_sync::TaskQueue;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One journal record.
#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Component that wrote the entry, e.g. `Conductor`.
    pub header: String,
    pub message: String,
    pub kind: LogKind,
    /// Free-form detail such as an error chain.
    pub metadata: Option<String>,
}

/// Destination for journal entries.
pub trait JournalSink: Send + Sync {
    fn record(&self, entry: &JournalEntry);
}

/// Forwards entries to `tracing` at a level matching their kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl JournalSink for TracingSink {
    fn record(&self, entry: &JournalEntry) {
        let metadata = entry.metadata.as_deref().unwrap_or("");
        match entry.kind {
            LogKind::Message => info!(header = %entry.header, metadata, "{}", entry.message),
            LogKind::Warning => warn!(header = %entry.header, metadata, "{}", entry.message),
            LogKind::Exception => error!(header = %entry.header, metadata, "{}", entry.message),
        }
    }
}

/// Keeps every entry in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the entries recorded so far.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl JournalSink for MemorySink {
    fn record(&self, entry: &JournalEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
    }
}

struct JournalInner {
    queue: TaskQueue,
    sinks: Arc<Vec<Arc<dyn JournalSink>>>,
}

/// Cheaply cloneable handle to the journal.
#[derive(Clone)]
pub struct Journal {
    inner: Arc<JournalInner>,
}

impl Journal {
    pub fn new(sinks: Vec<Arc<dyn JournalSink>>) -> Self {
        Self {
            inner: Arc::new(JournalInner {
                queue: TaskQueue::new("journal"),
                sinks: Arc::new(sinks),
            }),
        }
    }

    /// A journal that only forwards to `tracing`.
    pub fn tracing() -> Self {
        Self::new(vec![Arc::new(TracingSink)])
    }

    /// Queue an entry for the sinks.
    pub fn write(
        &self,
        header: impl Into<String>,
        message: impl Into<String>,
        kind: LogKind,
        metadata: Option<String>,
    ) {
        let entry = JournalEntry {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            header: header.into(),
            message: message.into(),
            kind,
            metadata,
        };
        let sinks = self.inner.sinks.clone();
        let submitted = self.inner.queue.submit(move || {
            for sink in sinks.iter() {
                sink.record(&entry);
            }
        });
        // The task handle is not needed; dropping it leaves the job queued.
        if let Err(e) = submitted {
            debug!(error = %e, "journal closed, entry dropped");
        }
    }

    pub fn message(&self, header: impl Into<String>, message: impl Into<String>) {
        self.write(header, message, LogKind::Message, None);
    }

    pub fn warning(&self, header: impl Into<String>, message: impl Into<String>) {
        self.write(header, message, LogKind::Warning, None);
    }

    pub fn exception(&self, header: impl Into<String>, message: impl Into<String>, detail: impl Into<String>) {
        self.write(header, message, LogKind::Exception, Some(detail.into()));
    }

    /// Wait until every entry written before this call reached the sinks.
    pub async fn sync(&self) {
        if let Ok(task) = self.inner.queue.submit(|| ()) {
            let _ = task.await;
        }
    }

    /// Guard that writes `<function> exited after X ms` when dropped.
    pub fn stopwatch(&self, header: impl Into<String>, function: impl Into<String>) -> Stopwatch {
        Stopwatch {
            journal: self.clone(),
            header: header.into(),
            function: function.into(),
            started: Instant::now(),
        }
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::tracing()
    }
}

/// Timing guard returned by [`Journal::stopwatch`].
pub struct Stopwatch {
    journal: Journal,
    header: String,
    function: String,
    started: Instant,
}

impl Drop for Stopwatch {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed().as_millis();
        self.journal.message(
            std::mem::take(&mut self.header),
            format!("{} exited after {elapsed} ms", self.function),
        );
    }
}
