//! Periodic mirror of the sorted tree to a versioned remote.
//!
//! A cycle scans the tree, diffs it against the snapshot of the last
//! successful cycle and hands a non-empty change set to a [`BackupSink`]. The
//! baseline only moves on success, so a failed push is simply retried with
//! the same (or a larger) change set next time. Cycles are single-flight: a
//! cycle that finds another one running is skipped, not queued.

pub mod git;
pub mod snapshot;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::BackupConfig;
use crate::error::SortError;

pub use git::GitSink;
pub use snapshot::{ChangeSet, Snapshot};

#[async_trait]
pub trait BackupSink: Send + Sync {
    fn name(&self) -> &'static str;
    /// Persist the current state of `root`; `changes` describes what moved.
    async fn push_changes(&self, root: &Path, changes: &ChangeSet) -> Result<()>;
}

/// Scheduling state: when the last good sync happened and how often to run.
#[derive(Debug, Clone, Serialize)]
pub struct BackupCycle {
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(with = "secs")]
    pub interval: Duration,
}

mod secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

impl BackupCycle {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_sync_at: None,
            interval: interval.max(Duration::from_secs(1)),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_sync_at {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(last);
                elapsed.to_std().map(|e| e >= self.interval).unwrap_or(false)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Another cycle was running.
    Skipped,
    NoChanges,
    Synced { added: usize, modified: usize, removed: usize },
    Failed { error: String },
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Skipped => "skipped",
            CycleOutcome::NoChanges => "no_changes",
            CycleOutcome::Synced { .. } => "synced",
            CycleOutcome::Failed { .. } => "failed",
        }
    }
}

pub struct BackupSynchronizer {
    root: PathBuf,
    sink: Arc<dyn BackupSink>,
    /// Baseline snapshot; holding the lock is what makes a cycle "running".
    baseline: tokio::sync::Mutex<Snapshot>,
    cycle: Mutex<BackupCycle>,
}

impl BackupSynchronizer {
    pub fn new(root: impl Into<PathBuf>, sink: Arc<dyn BackupSink>, interval: Duration) -> Self {
        Self {
            root: root.into(),
            sink,
            baseline: tokio::sync::Mutex::new(Snapshot::default()),
            cycle: Mutex::new(BackupCycle::new(interval)),
        }
    }

    /// `None` when backups are disabled.
    pub fn from_config(cfg: &BackupConfig, root: &Path) -> Option<Self> {
        if !cfg.enabled {
            return None;
        }
        let sink = GitSink::new(cfg.remote.clone(), cfg.branch.clone(), cfg.token.clone());
        if cfg.remote.is_none() {
            tracing::warn!(target: "backup", "no backup remote configured, committing locally only");
        }
        Some(Self::new(root, Arc::new(sink), Duration::from_secs(cfg.interval_secs)))
    }

    pub fn cycle(&self) -> BackupCycle {
        self.cycle.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Run one scan-and-sync pass now, unless one is already running.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Ok(mut baseline) = self.baseline.try_lock() else {
            tracing::info!(target: "backup", "cycle already running, skipping");
            counter!("sorter_backup_cycles_total", "outcome" => "skipped").increment(1);
            return CycleOutcome::Skipped;
        };

        let outcome = match self.sync_once(&mut baseline).await {
            Ok(o) => o,
            Err(e) => {
                let err = SortError::BackupSyncFailed(format!("{e:#}"));
                tracing::warn!(target: "backup", sink = self.sink.name(), error = %err, "backup cycle failed, will retry next cycle");
                CycleOutcome::Failed {
                    error: err.to_string(),
                }
            }
        };
        counter!("sorter_backup_cycles_total", "outcome" => outcome.as_str()).increment(1);
        outcome
    }

    async fn sync_once(&self, baseline: &mut Snapshot) -> Result<CycleOutcome> {
        let root = self.root.clone();
        let current = tokio::task::spawn_blocking(move || Snapshot::scan(&root)).await??;
        let changes = baseline.diff(&current);
        if changes.is_empty() {
            self.mark_synced();
            return Ok(CycleOutcome::NoChanges);
        }

        self.sink.push_changes(&self.root, &changes).await?;
        *baseline = current;
        self.mark_synced();
        tracing::info!(target: "backup", sink = self.sink.name(), summary = %changes.summary(), "backup cycle synced");
        Ok(CycleOutcome::Synced {
            added: changes.added.len(),
            modified: changes.modified.len(),
            removed: changes.removed.len(),
        })
    }

    fn mark_synced(&self) {
        let now = Utc::now();
        self.cycle.lock().unwrap_or_else(|p| p.into_inner()).last_sync_at = Some(now);
        gauge!("sorter_backup_last_success_ts").set(now.timestamp() as f64);
    }
}

/// Background ticker. Missed ticks are dropped; a tick is also skipped when a
/// manual run already synced within the interval.
pub fn spawn_backup_task(sync: Arc<BackupSynchronizer>) -> JoinHandle<()> {
    let interval = sync.cycle().interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if !sync.cycle().is_due(Utc::now()) {
                continue;
            }
            let outcome = sync.run_cycle().await;
            tracing::debug!(target: "backup", outcome = outcome.as_str(), "scheduled cycle finished");
        }
    })
}

// --- Test helper ---
pub struct MockSink {
    pub calls: Mutex<Vec<ChangeSet>>,
    fail: AtomicBool,
    delay: Option<Duration>,
}

impl MockSink {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(vec![]),
            fail: AtomicBool::new(false),
            delay: None,
        }
    }

    /// Hold each call open for `d` (overlap tests).
    pub fn delayed(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackupSink for MockSink {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn push_changes(&self, _root: &Path, changes: &ChangeSet) -> Result<()> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(changes.clone());
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("remote rejected push");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_due_after_interval() {
        let mut c = BackupCycle::new(Duration::from_secs(60));
        let t0 = Utc::now();
        assert!(c.is_due(t0));
        c.last_sync_at = Some(t0);
        assert!(!c.is_due(t0 + chrono::Duration::seconds(59)));
        assert!(c.is_due(t0 + chrono::Duration::seconds(60)));
        // Clock going backwards is not "due".
        assert!(!c.is_due(t0 - chrono::Duration::seconds(5)));
    }

    #[tokio::test]
    async fn first_cycle_syncs_everything_then_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Learning/Tutorials")).unwrap();
        let sink = Arc::new(MockSink::new());
        let sync = BackupSynchronizer::new(dir.path(), sink.clone(), Duration::from_secs(3600));

        assert_eq!(
            sync.run_cycle().await,
            CycleOutcome::Synced {
                added: 2,
                modified: 0,
                removed: 0
            }
        );
        assert_eq!(sync.run_cycle().await, CycleOutcome::NoChanges);
        assert_eq!(sink.call_count(), 1);
        assert!(sync.cycle().last_sync_at.is_some());
    }
}
