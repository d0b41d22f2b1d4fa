//! Classification stage: rules, cache, rate limit and the inference adapter.
//!
//! Everything here produces or stores a [`CategoryResult`]; nothing here
//! touches the sorted tree.

pub mod ai_adapter;
pub mod cache;
pub mod rate_limit;
pub mod rules;

use serde::{Deserialize, Serialize};

pub use crate::analyze::ai_adapter::{BackendError, InferenceAdapter};
pub use crate::analyze::cache::ClassificationCache;
pub use crate::analyze::rate_limit::RateLimiter;
pub use crate::analyze::rules::{RuleClassifier, RuleSet, TechVocabulary};

/// Category id of the bucket every degraded path ends in.
pub const UNCATEGORIZED: &str = "other";

/// Which stage produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationSource {
    Rule,
    Cache,
    Inference,
    /// Guaranteed uncategorized bucket used when nothing better is available.
    Fallback,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationSource::Rule => "rule",
            ClassificationSource::Cache => "cache",
            ClassificationSource::Inference => "inference",
            ClassificationSource::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryResult {
    pub category: String,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub technology: Option<String>,
    pub confidence: f32,
    pub source: ClassificationSource,
}

impl CategoryResult {
    pub fn new(category: impl Into<String>, confidence: f32, source: ClassificationSource) -> Self {
        Self {
            category: category.into(),
            subcategory: None,
            technology: None,
            confidence: clamp01(confidence),
            source,
        }
    }

    pub fn subcategory(mut self, sub: Option<String>) -> Self {
        self.subcategory = sub.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn technology(mut self, tech: Option<String>) -> Self {
        self.technology = tech.filter(|s| !s.trim().is_empty());
        self
    }

    /// The low-confidence uncategorized answer.
    pub fn uncategorized() -> Self {
        Self::new(UNCATEGORIZED, 0.0, ClassificationSource::Fallback)
    }

    /// Same classification, relabelled with the stage that served it.
    pub fn served_by(&self, source: ClassificationSource) -> Self {
        Self {
            source,
            ..self.clone()
        }
    }
}

pub(crate) fn clamp01(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(CategoryResult::new("x", 1.7, ClassificationSource::Rule).confidence, 1.0);
        assert_eq!(CategoryResult::new("x", -0.2, ClassificationSource::Rule).confidence, 0.0);
        assert_eq!(CategoryResult::new("x", f32::NAN, ClassificationSource::Rule).confidence, 0.0);
    }

    #[test]
    fn blank_refinements_are_dropped() {
        let r = CategoryResult::new("frontend", 1.0, ClassificationSource::Rule)
            .subcategory(Some("  ".into()))
            .technology(Some("Svelte".into()));
        assert!(r.subcategory.is_none());
        assert_eq!(r.technology.as_deref(), Some("Svelte"));
    }

    #[test]
    fn source_serializes_lowercase() {
        let s = serde_json::to_string(&ClassificationSource::Inference).unwrap();
        assert_eq!(s, "\"inference\"");
    }
}
