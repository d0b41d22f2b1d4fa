//! # Sorting Engine
//! Composes rule matching, the fingerprint cache, the inference budget and the
//! inference adapter into one pipeline, then hands the result to foldering and
//! (optionally) item storage.
//!
//! Order: rule → cache → rate limit → inference → cache put → folder → store.
//! Every degraded path ends in the uncategorized bucket; only
//! `InvalidCategory` escapes `sort` as an error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::analyze::cache::CacheStats;
use crate::analyze::{
    CategoryResult, ClassificationCache, ClassificationSource, InferenceAdapter, RateLimiter,
    RuleClassifier, RuleSet,
};
use crate::config::SorterConfig;
use crate::content::{ContentItem, Fingerprint};
use crate::error::SortError;
use crate::folders::{CategoryMap, CategoryStat, FolderTree, PathBuilder};
use crate::history::{History, HistoryEntry};
use crate::storage::ItemStore;

/// Why a result is the uncategorized fallback instead of a real answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    EmptyContent,
    InferenceDisabled,
    RateLimited,
    BackendUnavailable,
    BackendTimeout,
}

impl Degradation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Degradation::EmptyContent => "empty_content",
            Degradation::InferenceDisabled => "inference_disabled",
            Degradation::RateLimited => "rate_limited",
            Degradation::BackendUnavailable => "backend_unavailable",
            Degradation::BackendTimeout => "backend_timeout",
        }
    }
}

impl TryFrom<&SortError> for Degradation {
    type Error = ();

    /// Only the locally recovered errors have a degradation reason.
    fn try_from(e: &SortError) -> Result<Self, ()> {
        match e {
            SortError::RateLimited => Ok(Degradation::RateLimited),
            SortError::BackendUnavailable(_) => Ok(Degradation::BackendUnavailable),
            SortError::BackendTimeout(_) => Ok(Degradation::BackendTimeout),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SortOptions {
    pub create_folder: bool,
    /// `None` uses the engine default.
    pub persist: Option<bool>,
}

impl Default for SortOptions {
    fn default() -> Self {
        Self {
            create_folder: true,
            persist: None,
        }
    }
}

#[derive(Debug)]
pub struct SortOutcome {
    pub fingerprint: Fingerprint,
    pub result: CategoryResult,
    /// Absolute folder path; `None` when creation failed or was not requested.
    pub folder_path: Option<PathBuf>,
    /// Base-relative path the result maps to.
    pub relative_path: PathBuf,
    pub folder_created: bool,
    pub stored_at: Option<PathBuf>,
    pub degraded: Option<Degradation>,
    pub folder_error: Option<SortError>,
    pub store_error: Option<SortError>,
}

pub struct SortingEngine {
    rules: RuleClassifier,
    cache: ClassificationCache,
    limiter: RateLimiter,
    inference: Option<InferenceAdapter>,
    folders: PathBuilder,
    store: ItemStore,
    history: History,
    cache_ttl: Duration,
    persist_default: bool,
}

impl SortingEngine {
    /// Engine with no inference backend, an in-memory cache and a 10/min budget.
    pub fn new(rules: RuleClassifier, folders: PathBuilder) -> Self {
        Self {
            rules,
            cache: ClassificationCache::new(10_000),
            limiter: RateLimiter::per_minute(10),
            inference: None,
            folders,
            store: ItemStore::new(),
            history: History::with_capacity(200),
            cache_ttl: Duration::from_secs(3600),
            persist_default: false,
        }
    }

    pub fn with_cache(mut self, cache: ClassificationCache, ttl: Duration) -> Self {
        self.cache = cache;
        self.cache_ttl = ttl;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Attach an inference adapter. Its technology labels are spelled the way
    /// the rule vocabulary spells them.
    pub fn with_inference(mut self, adapter: InferenceAdapter) -> Self {
        self.inference = Some(adapter.with_vocabulary(self.rules.vocabulary()));
        self
    }

    pub fn with_history(mut self, cap: usize) -> Self {
        self.history = History::with_capacity(cap);
        self
    }

    pub fn persist_by_default(mut self, on: bool) -> Self {
        self.persist_default = on;
        self
    }

    /// Wire every component from an already-validated config.
    pub fn from_config(cfg: &SorterConfig) -> anyhow::Result<Self> {
        let map = if cfg.categories.is_empty() {
            CategoryMap::default_seed()
        } else {
            CategoryMap::from_specs(cfg.categories.clone())?
        };

        let rules = RuleClassifier::new(&RuleSet::load_or_seed(cfg.rules.path.as_deref())?);
        for cat in rules.categories() {
            if !map.contains(cat) {
                tracing::warn!(target: "sorter", category = cat, "rule category missing from category map");
            }
        }

        let mut cache = ClassificationCache::new(cfg.cache.max_entries);
        if let Some(dir) = &cfg.cache.dir {
            cache = cache.with_dir(dir);
        }
        let limiter = RateLimiter::new(
            cfg.rate_limit.limit,
            Duration::from_secs(cfg.rate_limit.window_secs),
        );
        let inference = InferenceAdapter::from_config(&cfg.inference, map.taxonomy())?;
        match &inference {
            Some(a) => tracing::info!(target: "sorter", backends = ?a.backend_names(), "inference enabled"),
            None => tracing::info!(target: "sorter", "inference disabled, rules and cache only"),
        }

        let folders = PathBuilder::new(&cfg.storage.base_path, Arc::new(map));
        let mut engine = Self::new(rules, folders)
            .with_cache(cache, Duration::from_secs(cfg.cache.ttl_secs))
            .with_rate_limiter(limiter)
            .with_history(cfg.server.history_size)
            .persist_by_default(cfg.storage.persist_items);
        if let Some(a) = inference {
            engine = engine.with_inference(a);
        }
        Ok(engine)
    }

    /// Classify one item and materialize its folder.
    ///
    /// Dropping the future before the inference answer arrives leaves no
    /// partial state: everything after the `.await` is synchronous.
    pub async fn sort(&self, item: &ContentItem, opts: SortOptions) -> Result<SortOutcome, SortError> {
        let started = Instant::now();
        let normalized = item.normalized();
        let fingerprint = Fingerprint::of_normalized(&normalized);

        let (result, degraded) = self.classify(&normalized, &fingerprint).await;

        let (relative_path, folder_path, folder_created, folder_error) = if opts.create_folder {
            match self.folders.ensure(&result) {
                Ok(f) => (f.relative, Some(f.absolute), f.created, None),
                Err(SortError::InvalidCategory(c)) => return Err(SortError::InvalidCategory(c)),
                Err(e) => {
                    tracing::warn!(target: "sorter", fingerprint = fingerprint.short(), error = %e, "folder creation failed");
                    (self.folders.resolve(&result)?, None, false, Some(e))
                }
            }
        } else {
            (self.folders.resolve(&result)?, None, false, None)
        };

        let persist = opts.persist.unwrap_or(self.persist_default);
        let (stored_at, store_error) = match (&folder_path, persist) {
            (Some(dir), true) => match self.store.store(dir, item, &result, &fingerprint) {
                Ok(p) => (Some(p), None),
                Err(e) => {
                    tracing::warn!(target: "sorter", fingerprint = fingerprint.short(), error = %e, "item write failed");
                    (None, Some(e))
                }
            },
            _ => (None, None),
        };

        counter!("sorter_classifications_total", "source" => result.source.as_str()).increment(1);
        tracing::info!(
            target: "sorter",
            fingerprint = fingerprint.short(),
            category = %result.category,
            source = result.source.as_str(),
            confidence = result.confidence,
            degraded = degraded.map(|d| d.as_str()),
            folder = %relative_path.display(),
            created = folder_created,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "item sorted"
        );
        self.history.push(HistoryEntry {
            at: Utc::now(),
            fingerprint: fingerprint.short().to_string(),
            category: result.category.clone(),
            source: result.source,
            confidence: result.confidence,
            folder: folder_path
                .as_ref()
                .map(|_| relative_path.to_string_lossy().into_owned()),
            degraded: degraded.map(|d| d.as_str()),
        });

        Ok(SortOutcome {
            fingerprint,
            result,
            folder_path,
            relative_path,
            folder_created,
            stored_at,
            degraded,
            folder_error,
            store_error,
        })
    }

    async fn classify(&self, normalized: &str, fp: &Fingerprint) -> (CategoryResult, Option<Degradation>) {
        if normalized.is_empty() {
            return (CategoryResult::uncategorized(), Some(Degradation::EmptyContent));
        }
        if let Some(hit) = self.rules.classify(normalized) {
            return (hit, None);
        }
        if let Some(hit) = self.cache.get(fp) {
            counter!("sorter_cache_hits_total").increment(1);
            return (hit.served_by(ClassificationSource::Cache), None);
        }
        let Some(adapter) = &self.inference else {
            return (CategoryResult::uncategorized(), Some(Degradation::InferenceDisabled));
        };
        // The limiter lock is released before the call below.
        if !self.limiter.try_acquire() {
            counter!("sorter_rate_limited_total").increment(1);
            return recover(fp, SortError::RateLimited);
        }

        match adapter.classify(normalized).await {
            Ok(r) => {
                self.cache.put(fp, r.clone(), self.cache_ttl);
                (r, None)
            }
            Err(e) => recover(fp, SortError::from(e)),
        }
    }

    pub fn base_path(&self) -> &Path {
        self.folders.base()
    }

    pub fn categories(&self) -> &CategoryMap {
        self.folders.categories()
    }

    pub fn folder_tree(&self) -> FolderTree {
        self.folders.folder_tree()
    }

    pub fn category_stats(&self) -> BTreeMap<String, CategoryStat> {
        self.folders.category_stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn inference_backends(&self) -> Vec<&'static str> {
        self.inference
            .as_ref()
            .map(|a| a.backend_names())
            .unwrap_or_default()
    }

    pub fn recent(&self, n: usize) -> Vec<HistoryEntry> {
        self.history.snapshot_last_n(n)
    }
}

/// Fold a locally recoverable error into the uncategorized bucket.
fn recover(fp: &Fingerprint, err: SortError) -> (CategoryResult, Option<Degradation>) {
    tracing::warn!(
        target: "sorter",
        fingerprint = fp.short(),
        kind = err.kind(),
        error = %err,
        "recovered locally, using uncategorized bucket"
    );
    (CategoryResult::uncategorized(), Degradation::try_from(&err).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::ai_adapter::{BackendError, MockBackend};

    #[test]
    fn degradation_mirrors_recoverable_errors() {
        let cases = [
            (SortError::RateLimited, Some(Degradation::RateLimited)),
            (SortError::from(BackendError::Unavailable("down".into())), Some(Degradation::BackendUnavailable)),
            (SortError::from(BackendError::Timeout(5)), Some(Degradation::BackendTimeout)),
            (SortError::InvalidCategory("x".into()), None),
            (SortError::BackupSyncFailed("x".into()), None),
        ];
        for (err, want) in cases {
            let got = Degradation::try_from(&err).ok();
            assert_eq!(got, want, "{err}");
            if let Some(d) = got {
                assert_eq!(d.as_str(), err.kind());
            }
        }
    }

    fn engine(base: &Path) -> SortingEngine {
        SortingEngine::new(
            RuleClassifier::new(&RuleSet::default_seed()),
            PathBuilder::new(base, Arc::new(CategoryMap::default_seed())),
        )
    }

    #[tokio::test]
    async fn empty_content_is_uncategorized_without_calls() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::answering("security", 0.9));
        let e = engine(dir.path()).with_inference(InferenceAdapter::new(
            backend.clone(),
            CategoryMap::default_seed().taxonomy(),
        ));
        let out = e.sort(&ContentItem::text("   \n "), SortOptions::default()).await.unwrap();
        assert_eq!(out.result, CategoryResult::uncategorized());
        assert_eq!(out.degraded, Some(Degradation::EmptyContent));
        assert_eq!(out.relative_path, PathBuf::from("General/Other"));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn no_backend_means_uncategorized() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        let out = e
            .sort(&ContentItem::text("zero trust posture checklist for small teams"), SortOptions::default())
            .await
            .unwrap();
        assert_eq!(out.result.category, "other");
        assert_eq!(out.degraded, Some(Degradation::InferenceDisabled));
        assert!(out.folder_created);
    }

    #[tokio::test]
    async fn backend_failure_degrades_and_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::failing(BackendError::Timeout(5)));
        let e = engine(dir.path()).with_inference(InferenceAdapter::new(
            backend.clone(),
            CategoryMap::default_seed().taxonomy(),
        ));
        let item = ContentItem::text("zero trust posture checklist for small teams");
        let out = e.sort(&item, SortOptions::default()).await.unwrap();
        assert_eq!(out.degraded, Some(Degradation::BackendTimeout));
        assert_eq!(out.result.source, ClassificationSource::Fallback);
        let again = e.sort(&item, SortOptions::default()).await.unwrap();
        assert_eq!(again.result.source, ClassificationSource::Fallback);
        assert_eq!(backend.calls(), 2);
        assert_eq!(e.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn rule_and_inference_tags_share_one_technology_folder() {
        use crate::analyze::ai_adapter::BackendAnswer;

        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::with_answer(BackendAnswer {
            category: "react_ecosystem".into(),
            technology: Some("typescript".into()),
            confidence: Some(0.8),
            ..Default::default()
        }));
        let e = engine(dir.path()).with_inference(InferenceAdapter::new(
            backend.clone(),
            CategoryMap::default_seed().taxonomy(),
        ));

        let by_rule = e
            .sort(&ContentItem::text("React hooks with TypeScript"), SortOptions::default())
            .await
            .unwrap();
        assert_eq!(by_rule.result.source, ClassificationSource::Rule);

        let by_inference = e
            .sort(&ContentItem::text("strongly typed props for components"), SortOptions::default())
            .await
            .unwrap();
        assert_eq!(by_inference.result.source, ClassificationSource::Inference);
        assert_eq!(backend.calls(), 1);

        assert_eq!(by_rule.relative_path, PathBuf::from("Frontend/React/TypeScript"));
        assert_eq!(by_inference.relative_path, by_rule.relative_path);
        assert!(!by_inference.folder_created);
        let siblings: Vec<_> = std::fs::read_dir(dir.path().join("Frontend/React"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(siblings.len(), 1);
    }

    #[tokio::test]
    async fn unknown_rule_category_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = RuleSet::default_seed();
        set.rules[0].category = "astrology".into();
        let e = SortingEngine::new(
            RuleClassifier::new(&set),
            PathBuilder::new(dir.path(), Arc::new(CategoryMap::default_seed())),
        );
        let err = e
            .sort(&ContentItem::text("react hooks"), SortOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SortError::InvalidCategory(c) if c == "astrology"));
    }

    #[tokio::test]
    async fn persist_writes_item_into_its_folder() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path()).persist_by_default(true);
        let out = e
            .sort(&ContentItem::text("CSS Grid layout tutorial"), SortOptions::default())
            .await
            .unwrap();
        let stored = out.stored_at.expect("stored");
        assert_eq!(stored.parent(), out.folder_path.as_deref());

        let skip = e
            .sort(
                &ContentItem::text("CSS Grid layout tutorial"),
                SortOptions {
                    create_folder: true,
                    persist: Some(false),
                },
            )
            .await
            .unwrap();
        assert!(skip.stored_at.is_none());
        assert_eq!(e.recent(10).len(), 2);
    }
}
