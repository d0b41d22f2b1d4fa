//! Bounded in-memory log of recent sort outcomes, served by `/debug/recent`.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::analyze::ClassificationSource;

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    /// Short fingerprint only; raw text is never kept here.
    pub fingerprint: String,
    pub category: String,
    pub source: ClassificationSource,
    pub confidence: f32,
    pub folder: Option<String>,
    pub degraded: Option<&'static str>,
}

#[derive(Debug)]
pub struct History {
    inner: Mutex<Vec<HistoryEntry>>,
    cap: usize,
}

impl History {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.clamp(1, 10_000);
        Self {
            inner: Mutex::new(Vec::with_capacity(cap)),
            cap,
        }
    }

    pub fn push(&self, entry: HistoryEntry) {
        let mut v = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        v.push(entry);
        if v.len() > self.cap {
            let excess = v.len() - self.cap;
            v.drain(0..excess);
        }
    }

    /// Newest last.
    pub fn snapshot_last_n(&self, n: usize) -> Vec<HistoryEntry> {
        let v = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let start = v.len().saturating_sub(n);
        v[start..].to_vec()
    }
}
