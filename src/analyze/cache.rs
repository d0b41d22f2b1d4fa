//! TTL-bounded memo of fingerprint → classification.
//!
//! Expiry is checked on every read, so an entry is never served at or after
//! `expires_at` even though nothing sweeps the map in the background. A `put`
//! replaces the whole entry. With a cache directory configured, each entry is
//! also mirrored to `<dir>/<fingerprint>.json` (temp file + rename) and read
//! back on a memory miss, so warm entries survive restarts.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analyze::CategoryResult;
use crate::content::Fingerprint;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub result: CategoryResult,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub capacity: usize,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<Fingerprint, CacheEntry>,
    hits: u64,
    misses: u64,
}

#[derive(Debug)]
pub struct ClassificationCache {
    inner: Mutex<Inner>,
    capacity: usize,
    dir: Option<PathBuf>,
}

impl ClassificationCache {
    /// In-memory cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            dir: None,
        }
    }

    /// Also persist entries under `dir` (created best-effort).
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            tracing::warn!(target: "sorter", dir = %dir.display(), error = %e, "cache dir unavailable, memory only");
            return self;
        }
        self.dir = Some(dir);
        self
    }

    pub fn get(&self, fp: &Fingerprint) -> Option<CategoryResult> {
        self.get_at(fp, Utc::now())
    }

    pub fn put(&self, fp: &Fingerprint, result: CategoryResult, ttl: Duration) {
        self.put_at(fp, result, ttl, Utc::now())
    }

    /// Lookup as of `now`. Expired entries are dropped on sight.
    pub fn get_at(&self, fp: &Fingerprint, now: DateTime<Utc>) -> Option<CategoryResult> {
        {
            let mut g = self.lock();
            let found = g
                .entries
                .get(fp)
                .map(|e| (e.is_live(now), e.result.clone()));
            match found {
                Some((true, out)) => {
                    g.hits += 1;
                    return Some(out);
                }
                Some((false, _)) => {
                    g.entries.remove(fp);
                }
                None => {}
            }
        }

        // Memory miss: try the on-disk copy without holding the lock.
        let from_disk = self.dir.as_deref().and_then(|d| read_entry(d, fp));
        let mut g = self.lock();
        match from_disk {
            Some(e) if e.is_live(now) && e.fingerprint == *fp => {
                let out = e.result.clone();
                g.hits += 1;
                insert_bounded(&mut g, e, self.capacity, now);
                Some(out)
            }
            Some(_) => {
                g.misses += 1;
                drop(g);
                if let Some(d) = self.dir.as_deref() {
                    let _ = fs::remove_file(entry_path(d, fp));
                }
                None
            }
            None => {
                g.misses += 1;
                None
            }
        }
    }

    /// Store `result` for `fp`, replacing any previous entry wholesale.
    pub fn put_at(&self, fp: &Fingerprint, result: CategoryResult, ttl: Duration, now: DateTime<Utc>) {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let entry = CacheEntry {
            fingerprint: fp.clone(),
            result,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        if let Some(d) = self.dir.as_deref() {
            if let Err(e) = write_entry(d, &entry) {
                tracing::warn!(target: "sorter", fingerprint = fp.short(), error = %e, "cache file write failed");
            }
        }

        let mut g = self.lock();
        insert_bounded(&mut g, entry, self.capacity, now);
    }

    pub fn stats(&self) -> CacheStats {
        let g = self.lock();
        CacheStats {
            entries: g.entries.len(),
            hits: g.hits,
            misses: g.misses,
            capacity: self.capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic elsewhere must not take classification down with it.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Insert, evicting expired entries first and then the oldest one.
fn insert_bounded(g: &mut Inner, entry: CacheEntry, capacity: usize, now: DateTime<Utc>) {
    if !g.entries.contains_key(&entry.fingerprint) && g.entries.len() >= capacity {
        g.entries.retain(|_, e| e.is_live(now));
        if g.entries.len() >= capacity {
            let oldest = g
                .entries
                .values()
                .min_by_key(|e| e.created_at)
                .map(|e| e.fingerprint.clone());
            if let Some(k) = oldest {
                g.entries.remove(&k);
            }
        }
    }
    g.entries.insert(entry.fingerprint.clone(), entry);
}

// --- file helpers ---

fn entry_path(dir: &Path, fp: &Fingerprint) -> PathBuf {
    dir.join(format!("{}.json", fp.as_str()))
}

fn read_entry(dir: &Path, fp: &Fingerprint) -> Option<CacheEntry> {
    let s = fs::read_to_string(entry_path(dir, fp)).ok()?;
    serde_json::from_str(&s).ok()
}

fn write_entry(dir: &Path, entry: &CacheEntry) -> io::Result<()> {
    let path = entry_path(dir, &entry.fingerprint);
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec(entry).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut f = fs::File::create(&tmp)?;
    f.write_all(&json)?;
    fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::ClassificationSource;

    fn result(cat: &str) -> CategoryResult {
        CategoryResult::new(cat, 0.6, ClassificationSource::Inference)
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn live_before_ttl_and_gone_at_boundary() {
        let cache = ClassificationCache::new(16);
        let fp = Fingerprint::of_text("jwt refresh token rotation");
        let ttl = Duration::from_secs(60);
        cache.put_at(&fp, result("security"), ttl, t0());

        let just_before = t0() + chrono::Duration::milliseconds(59_999);
        assert_eq!(cache.get_at(&fp, t0()), Some(result("security")));
        assert_eq!(cache.get_at(&fp, just_before), Some(result("security")));

        let at = t0() + chrono::Duration::seconds(60);
        assert_eq!(cache.get_at(&fp, at), None);
        // Physically gone too, so an earlier instant no longer sees it.
        assert_eq!(cache.get_at(&fp, t0()), None);
    }

    #[test]
    fn put_overwrites_instead_of_merging() {
        let cache = ClassificationCache::new(16);
        let fp = Fingerprint::of_text("x");
        cache.put_at(&fp, result("security").technology(Some("Rust".into())), Duration::from_secs(60), t0());
        cache.put_at(&fp, result("backend"), Duration::from_secs(60), t0());
        let got = cache.get_at(&fp, t0()).unwrap();
        assert_eq!(got.category, "backend");
        assert!(got.technology.is_none());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = ClassificationCache::new(2);
        let a = Fingerprint::of_text("a");
        let b = Fingerprint::of_text("b");
        let c = Fingerprint::of_text("c");
        let ttl = Duration::from_secs(600);
        cache.put_at(&a, result("a"), ttl, t0());
        cache.put_at(&b, result("b"), ttl, t0() + chrono::Duration::seconds(1));
        cache.put_at(&c, result("c"), ttl, t0() + chrono::Duration::seconds(2));
        let now = t0() + chrono::Duration::seconds(3);
        assert!(cache.get_at(&a, now).is_none());
        assert!(cache.get_at(&b, now).is_some());
        assert!(cache.get_at(&c, now).is_some());
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn disk_copy_survives_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let fp = Fingerprint::of_text("zero trust posture checklist");
        {
            let cache = ClassificationCache::new(8).with_dir(dir.path());
            cache.put_at(&fp, result("security"), Duration::from_secs(60), t0());
        }
        let fresh = ClassificationCache::new(8).with_dir(dir.path());
        assert_eq!(fresh.get_at(&fp, t0()), Some(result("security")));
        let late = t0() + chrono::Duration::seconds(61);
        let other = ClassificationCache::new(8).with_dir(dir.path());
        assert_eq!(other.get_at(&fp, late), None);
        assert!(!dir.path().join(format!("{}.json", fp.as_str())).exists());
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let cache = ClassificationCache::new(4);
        let fp = Fingerprint::of_text("k");
        assert!(cache.get_at(&fp, t0()).is_none());
        cache.put_at(&fp, result("x"), Duration::from_secs(5), t0());
        assert!(cache.get_at(&fp, t0()).is_some());
        let s = cache.stats();
        assert_eq!((s.hits, s.misses, s.entries), (1, 1, 1));
    }
}
