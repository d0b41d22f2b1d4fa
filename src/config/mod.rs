// src/config/mod.rs
//! Runtime configuration: one TOML file, serde defaults for every field, a
//! handful of env overrides, then a validation pass that repairs out-of-range
//! values instead of refusing to start.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::folders::CategorySpec;

const ENV_CONFIG_PATH: &str = "SORTER_CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "config/sorter.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub inference: InferenceConfig,
    pub backup: BackupConfig,
    pub rules: RulesConfig,
    /// Empty means "use the built-in category map".
    pub categories: BTreeMap<String, CategorySpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub history_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
            history_size: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub base_path: PathBuf,
    /// Default for `SortOptions::persist` when a request does not say.
    pub persist_items: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("sorted"),
            persist_items: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_entries: 10_000,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Groq,
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
    Mock,
}

impl BackendKind {
    fn key_env_var(&self) -> Option<&'static str> {
        match self {
            BackendKind::Groq => Some("GROQ_API_KEY"),
            BackendKind::OpenAi => Some("OPENAI_API_KEY"),
            BackendKind::Ollama | BackendKind::Mock => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// "ENV" means: read from GROQ_API_KEY / OPENAI_API_KEY (by kind)
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl BackendConfig {
    fn of(kind: BackendKind) -> Self {
        Self {
            kind,
            endpoint: None,
            api_key: kind.key_env_var().map(|_| "ENV".to_string()),
            model: None,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub default_confidence: f32,
    pub primary: BackendConfig,
    pub fallback: Option<BackendConfig>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 30,
            default_confidence: crate::analyze::ai_adapter::DEFAULT_INFERENCE_CONFIDENCE,
            primary: BackendConfig::of(BackendKind::Groq),
            fallback: Some(BackendConfig::of(BackendKind::Ollama)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub remote: Option<String>,
    pub branch: String,
    /// "ENV" means: read from GITHUB_TOKEN
    pub token: Option<String>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 3600,
            remote: None,
            branch: "main".into(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub path: Option<PathBuf>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("config/rules.json")),
        }
    }
}

impl SorterConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: SorterConfig = toml::from_str(s).context("parsing sorter config")?;
        cfg.resolve_secrets();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_toml_str(&data)
    }

    /// Resolution order:
    /// 1) $SORTER_CONFIG_PATH (must exist)
    /// 2) config/sorter.toml
    /// 3) built-in defaults
    ///
    /// Env overrides are applied last, in every case.
    pub fn load_default() -> Result<Self> {
        let mut cfg = if let Ok(p) = env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                bail!("{ENV_CONFIG_PATH} points to non-existent path {}", pb.display());
            }
            Self::load_from_file(&pb)?
        } else if Path::new(DEFAULT_CONFIG_PATH).exists() {
            Self::load_from_file(Path::new(DEFAULT_CONFIG_PATH))?
        } else {
            let mut cfg = Self::default();
            cfg.resolve_secrets();
            cfg
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = env::var("SORTER_BASE_PATH") {
            self.storage.base_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SORTER_RATE_LIMIT") {
            self.rate_limit.limit = v
                .trim()
                .parse()
                .with_context(|| format!("SORTER_RATE_LIMIT is not a number: {v:?}"))?;
        }
        if let Ok(v) = env::var("SORTER_CACHE_TTL_SECS") {
            self.cache.ttl_secs = v
                .trim()
                .parse()
                .with_context(|| format!("SORTER_CACHE_TTL_SECS is not a number: {v:?}"))?;
        }
        if let Ok(v) = env::var("SORTER_BIND") {
            self.server.bind = v;
        }
        Ok(())
    }

    /// Replace "ENV" placeholders with the matching env var. A missing var
    /// leaves the key unset; that backend then reports itself unavailable.
    fn resolve_secrets(&mut self) {
        let backends = std::iter::once(&mut self.inference.primary).chain(self.inference.fallback.as_mut());
        for b in backends {
            let wants_env = b
                .api_key
                .as_deref()
                .is_some_and(|k| k.trim().eq_ignore_ascii_case("env"));
            if wants_env {
                b.api_key = b.kind.key_env_var().and_then(|var| env::var(var).ok());
                if b.api_key.is_none() {
                    tracing::warn!(target: "sorter", kind = ?b.kind, "API key placeholder set but env var missing");
                }
            }
        }
        if self
            .backup
            .token
            .as_deref()
            .is_some_and(|t| t.trim().eq_ignore_ascii_case("env"))
        {
            self.backup.token = env::var("GITHUB_TOKEN").ok();
        }
    }

    /// Clamp numeric ranges; reject category paths that could escape the base.
    fn validate(&mut self) -> Result<()> {
        self.rate_limit.limit = self.rate_limit.limit.max(1);
        self.rate_limit.window_secs = self.rate_limit.window_secs.max(1);
        self.cache.max_entries = self.cache.max_entries.max(1);
        self.inference.timeout_secs = self.inference.timeout_secs.max(1);
        let c = self.inference.default_confidence;
        self.inference.default_confidence = if c.is_finite() { c.clamp(0.0, 1.0) } else { 0.6 };
        self.backup.interval_secs = self.backup.interval_secs.max(1);
        self.server.history_size = self.server.history_size.max(1);

        for (id, spec) in &self.categories {
            crate::folders::validate_relative(&spec.path)
                .with_context(|| format!("category {id:?} has an unusable path"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = SorterConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.rate_limit.limit, 10);
        assert_eq!(cfg.rate_limit.window_secs, 60);
        assert_eq!(cfg.cache.ttl_secs, 3600);
        assert!(cfg.inference.enabled);
        assert_eq!(cfg.inference.primary.kind, BackendKind::Groq);
        assert_eq!(cfg.inference.fallback.as_ref().map(|b| b.kind), Some(BackendKind::Ollama));
        assert!(!cfg.backup.enabled);
        assert!(cfg.categories.is_empty());
    }

    #[test]
    fn out_of_range_values_are_repaired() {
        let cfg = SorterConfig::from_toml_str(
            r#"
            [rate_limit]
            limit = 0
            window_secs = 0

            [inference]
            default_confidence = 4.0
            primary = { kind = "mock" }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.rate_limit.limit, 1);
        assert_eq!(cfg.rate_limit.window_secs, 1);
        assert_eq!(cfg.inference.default_confidence, 1.0);
        assert_eq!(cfg.inference.primary.kind, BackendKind::Mock);
    }

    #[test]
    fn escaping_category_paths_are_rejected() {
        let bad = r#"
            [categories.evil]
            path = "../outside"
        "#;
        assert!(SorterConfig::from_toml_str(bad).is_err());

        let abs = r#"
            [categories.evil]
            path = "/etc"
        "#;
        assert!(SorterConfig::from_toml_str(abs).is_err());

        let ok = r#"
            [categories.rust_lang]
            path = "Backend/Rust"
            description = "Rust crates and tooling"
        "#;
        let cfg = SorterConfig::from_toml_str(ok).unwrap();
        assert_eq!(cfg.categories["rust_lang"].path, "Backend/Rust");
    }

    #[serial_test::serial]
    #[test]
    fn env_key_placeholder_and_overrides() {
        env::set_var("GROQ_API_KEY", "gsk-test");
        env::set_var("SORTER_RATE_LIMIT", "25");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sorter.toml");
        fs::write(
            &path,
            r#"
            [inference]
            primary = { kind = "groq", api_key = "ENV" }
            "#,
        )
        .unwrap();
        env::set_var(ENV_CONFIG_PATH, path.display().to_string());

        let cfg = SorterConfig::load_default().unwrap();
        assert_eq!(cfg.inference.primary.api_key.as_deref(), Some("gsk-test"));
        assert_eq!(cfg.rate_limit.limit, 25);

        env::set_var(ENV_CONFIG_PATH, dir.path().join("missing.toml").display().to_string());
        assert!(SorterConfig::load_default().is_err());

        env::remove_var(ENV_CONFIG_PATH);
        env::remove_var("SORTER_RATE_LIMIT");
        env::remove_var("GROQ_API_KEY");
    }
}
