//! Inference adapter: one capability trait over remote classification
//! backends, tried in a fixed order (primary, then optional fallback).
//!
//! Each backend gets exactly one attempt per call, bounded by a timeout.
//! Transport failures are folded into [`BackendError`] before they leave this
//! module. This is the only module in the crate that performs network I/O.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::analyze::rules::TechVocabulary;
use crate::analyze::{clamp01, CategoryResult, ClassificationSource, UNCATEGORIZED};
use crate::config::{BackendConfig, BackendKind, InferenceConfig};

/// Confidence assumed when a backend does not report one.
pub const DEFAULT_INFERENCE_CONFIDENCE: f32 = 0.6;

const USER_AGENT: &str = "content-sorter/0.1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Unavailable(String),
    #[error("timed out after {0} ms")]
    Timeout(u64),
}

/// One category offered to the backend.
#[derive(Debug, Clone, Serialize)]
pub struct TaxonomyEntry {
    pub id: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy)]
pub struct InferenceRequest<'a> {
    pub text: &'a str,
    pub taxonomy: &'a [TaxonomyEntry],
}

/// What a backend said, before validation against the taxonomy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendAnswer {
    pub category: String,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub technology: Option<String>,
    #[serde(default)]
    pub technology_stack: Vec<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

#[async_trait]
pub trait ClassifierBackend: Send + Sync {
    /// Stable name for logs and metric labels.
    fn name(&self) -> &'static str;
    async fn classify(&self, req: &InferenceRequest<'_>) -> Result<BackendAnswer, BackendError>;
}

// ------------------------------------------------------------
// Adapter
// ------------------------------------------------------------

pub struct InferenceAdapter {
    primary: Arc<dyn ClassifierBackend>,
    fallback: Option<Arc<dyn ClassifierBackend>>,
    taxonomy: Vec<TaxonomyEntry>,
    timeout: Duration,
    default_confidence: f32,
    vocabulary: Option<Arc<TechVocabulary>>,
}

impl InferenceAdapter {
    pub fn new(primary: Arc<dyn ClassifierBackend>, taxonomy: Vec<TaxonomyEntry>) -> Self {
        Self {
            primary,
            fallback: None,
            taxonomy,
            timeout: Duration::from_secs(30),
            default_confidence: DEFAULT_INFERENCE_CONFIDENCE,
            vocabulary: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn ClassifierBackend>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_default_confidence(mut self, c: f32) -> Self {
        self.default_confidence = clamp01(c);
        self
    }

    /// Technology labels from backends are mapped onto these canonical names.
    pub fn with_vocabulary(mut self, vocabulary: Arc<TechVocabulary>) -> Self {
        self.vocabulary = Some(vocabulary);
        self
    }

    /// Build from config. `Ok(None)` when inference is disabled.
    ///
    /// `AI_TEST_MODE=mock` swaps in a deterministic mock regardless of config.
    pub fn from_config(cfg: &InferenceConfig, taxonomy: Vec<TaxonomyEntry>) -> anyhow::Result<Option<Self>> {
        let mock_mode = std::env::var("AI_TEST_MODE")
            .map(|v| v == "mock")
            .unwrap_or(false);
        let primary: Arc<dyn ClassifierBackend> = if mock_mode {
            Arc::new(MockBackend::answering(UNCATEGORIZED, 0.5))
        } else if !cfg.enabled {
            return Ok(None);
        } else {
            build_backend(&cfg.primary)?
        };

        let timeout = Duration::from_secs(cfg.timeout_secs.max(1));
        let mut adapter = Self::new(primary, taxonomy)
            .with_timeout(timeout)
            .with_default_confidence(cfg.default_confidence);
        if !mock_mode {
            if let Some(fb) = &cfg.fallback {
                adapter = adapter.with_fallback(build_backend(fb)?);
            }
        }
        Ok(Some(adapter))
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        let mut v = vec![self.primary.name()];
        if let Some(fb) = &self.fallback {
            v.push(fb.name());
        }
        v
    }

    /// Classify normalized text. Primary first; the fallback only runs when
    /// the primary failed. The error returned is the last backend's.
    pub async fn classify(&self, normalized: &str) -> Result<CategoryResult, BackendError> {
        let req = InferenceRequest {
            text: normalized,
            taxonomy: &self.taxonomy,
        };

        let answer = match self.call(self.primary.as_ref(), &req).await {
            Ok(a) => a,
            Err(primary_err) => match &self.fallback {
                Some(fb) => {
                    tracing::warn!(
                        target: "inference",
                        backend = self.primary.name(),
                        fallback = fb.name(),
                        error = %primary_err,
                        "primary backend failed, trying fallback"
                    );
                    self.call(fb.as_ref(), &req).await?
                }
                None => return Err(primary_err),
            },
        };
        Ok(self.to_result(answer))
    }

    async fn call(
        &self,
        backend: &dyn ClassifierBackend,
        req: &InferenceRequest<'_>,
    ) -> Result<BackendAnswer, BackendError> {
        let started = Instant::now();
        let res = match tokio::time::timeout(self.timeout, backend.classify(req)).await {
            Ok(r) => r,
            Err(_) => Err(BackendError::Timeout(self.timeout.as_millis() as u64)),
        };
        let outcome = match &res {
            Ok(_) => "ok",
            Err(BackendError::Timeout(_)) => "timeout",
            Err(BackendError::Unavailable(_)) => "unavailable",
        };
        counter!("sorter_inference_calls_total", "backend" => backend.name(), "outcome" => outcome)
            .increment(1);
        tracing::debug!(
            target: "inference",
            backend = backend.name(),
            outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "backend call finished"
        );
        res
    }

    /// Validate an answer against the taxonomy and shape it into a result.
    fn to_result(&self, a: BackendAnswer) -> CategoryResult {
        let label = normalize_label(&a.category);
        let category = if self.taxonomy.iter().any(|t| t.id == label) {
            label
        } else {
            tracing::warn!(target: "inference", label = %a.category, "label outside taxonomy, using uncategorized bucket");
            UNCATEGORIZED.to_string()
        };

        let confidence = a
            .confidence
            .filter(|c| c.is_finite())
            .map(clamp01)
            .unwrap_or(self.default_confidence);

        // Only an unambiguous single technology becomes a tag.
        let technology = match a.technology.filter(|t| !t.trim().is_empty()) {
            Some(t) => Some(self.canonical_technology(&t)),
            None => {
                let mut stack: Vec<String> = a
                    .technology_stack
                    .iter()
                    .filter(|t| !t.trim().is_empty())
                    .map(|t| self.canonical_technology(t))
                    .collect();
                stack.sort();
                stack.dedup();
                match stack.len() {
                    1 => stack.pop(),
                    _ => None,
                }
            }
        };

        CategoryResult::new(category, confidence, ClassificationSource::Inference)
            .subcategory(a.subcategory.map(|s| truncate_chars(s.trim(), 50)))
            .technology(technology.map(|s| truncate_chars(&s, 50)))
    }

    /// Vocabulary spelling when the label is known, the trimmed label otherwise.
    fn canonical_technology(&self, label: &str) -> String {
        let label = label.trim();
        self.vocabulary
            .as_ref()
            .and_then(|v| v.canonical(label))
            .unwrap_or(label)
            .to_string()
    }
}

fn normalize_label(s: &str) -> String {
    s.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Instantiate one configured backend.
pub fn build_backend(cfg: &BackendConfig) -> anyhow::Result<Arc<dyn ClassifierBackend>> {
    let timeout = Duration::from_secs(cfg.timeout_secs.unwrap_or(30).max(1));
    Ok(match cfg.kind {
        BackendKind::Groq | BackendKind::OpenAi => Arc::new(RemoteChatBackend::new(
            cfg.kind,
            cfg.endpoint.clone(),
            cfg.api_key.clone().unwrap_or_default(),
            cfg.model.clone(),
            timeout,
        )?),
        BackendKind::Ollama => Arc::new(OllamaBackend::new(
            cfg.endpoint.clone(),
            cfg.model.clone(),
            timeout,
        )?),
        BackendKind::Mock => Arc::new(MockBackend::answering(UNCATEGORIZED, 0.5)),
    })
}

// ------------------------------------------------------------
// Prompt + answer parsing
// ------------------------------------------------------------

const SYSTEM_PROMPT: &str = "You are an expert classifier for developer resources. \
Pick exactly one category id from the list you are given. Respond with a single JSON object and nothing else.";

fn build_prompt(req: &InferenceRequest<'_>) -> String {
    let mut out = String::with_capacity(256 + req.text.len() + req.taxonomy.len() * 64);
    out.push_str("Categories:\n");
    for t in req.taxonomy {
        out.push_str("- ");
        out.push_str(&t.id);
        if !t.description.is_empty() {
            out.push_str(": ");
            out.push_str(&t.description);
        }
        out.push('\n');
    }
    out.push_str(
        "\nPrefer the most specific technology category (\"react hooks tutorial\" is react_ecosystem, not tutorials).\n\
Reply with JSON: {\"category\": id, \"subcategory\": optional short label, \
\"technology_stack\": [technologies named in the content], \"confidence\": 0.0-1.0}.\n\nContent:\n",
    );
    out.push_str(req.text);
    out
}

/// Parse the first JSON object in `content`, tolerating code fences or prose
/// around it.
pub fn parse_answer(content: &str) -> Result<BackendAnswer, BackendError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let body = match (start, end) {
        (Some(s), Some(e)) if e > s => &content[s..=e],
        _ => return Err(BackendError::Unavailable("answer contained no JSON object".into())),
    };
    let answer: BackendAnswer = serde_json::from_str(body)
        .map_err(|e| BackendError::Unavailable(format!("malformed answer: {e}")))?;
    if answer.category.trim().is_empty() {
        return Err(BackendError::Unavailable("answer has empty category".into()));
    }
    Ok(answer)
}

fn map_transport(e: reqwest::Error, timeout: Duration) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout(timeout.as_millis() as u64)
    } else {
        BackendError::Unavailable(e.to_string())
    }
}

fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(4).min(timeout))
        .timeout(timeout)
        .build()
        .context("building HTTP client")
}

// ------------------------------------------------------------
// Concrete backends
// ------------------------------------------------------------

/// OpenAI-compatible chat completions (Groq, OpenAI). Requires a bearer key.
pub struct RemoteChatBackend {
    kind: BackendKind,
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl RemoteChatBackend {
    pub fn new(
        kind: BackendKind,
        endpoint: Option<String>,
        api_key: String,
        model: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let (default_endpoint, default_model) = match kind {
            BackendKind::Groq => ("https://api.groq.com/openai/v1", "llama-3.1-8b-instant"),
            _ => ("https://api.openai.com/v1", "gpt-4o-mini"),
        };
        Ok(Self {
            kind,
            http: http_client(timeout)?,
            endpoint: endpoint
                .unwrap_or_else(|| default_endpoint.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.unwrap_or_else(|| default_model.to_string()),
            timeout,
        })
    }
}

#[async_trait]
impl ClassifierBackend for RemoteChatBackend {
    fn name(&self) -> &'static str {
        match self.kind {
            BackendKind::Groq => "groq",
            _ => "openai",
        }
    }

    async fn classify(&self, req: &InferenceRequest<'_>) -> Result<BackendAnswer, BackendError> {
        if self.api_key.is_empty() {
            return Err(BackendError::Unavailable("missing API key".into()));
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Fmt {
            #[serde(rename = "type")]
            kind: &'static str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
            response_format: Fmt,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: Option<String>,
        }

        let prompt = build_prompt(req);
        let body = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Msg {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.1,
            max_tokens: 300,
            response_format: Fmt {
                kind: "json_object",
            },
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport(e, self.timeout))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::Unavailable(format!("HTTP {status}")));
        }
        let parsed: Resp = resp
            .json()
            .await
            .map_err(|e| map_transport(e, self.timeout))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        parse_answer(&content)
    }
}

/// Local Ollama server (`/api/generate`). No credentials.
pub struct OllamaBackend {
    http: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaBackend {
    pub fn new(base_url: Option<String>, model: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            base_url: base_url
                .unwrap_or_else(|| "http://localhost:11434".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: model.unwrap_or_else(|| "llama3.2:1b".to_string()),
            timeout,
        })
    }
}

#[async_trait]
impl ClassifierBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn classify(&self, req: &InferenceRequest<'_>) -> Result<BackendAnswer, BackendError> {
        #[derive(Serialize)]
        struct Opts {
            temperature: f32,
            top_p: f32,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            prompt: String,
            stream: bool,
            format: &'static str,
            options: Opts,
        }
        #[derive(Deserialize)]
        struct Resp {
            #[serde(default)]
            response: String,
        }

        let body = Req {
            model: &self.model,
            prompt: format!("{SYSTEM_PROMPT}\n\n{}", build_prompt(req)),
            stream: false,
            format: "json",
            options: Opts {
                temperature: 0.1,
                top_p: 0.9,
            },
        };

        let resp = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport(e, self.timeout))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::Unavailable(format!("HTTP {status}")));
        }
        let parsed: Resp = resp
            .json()
            .await
            .map_err(|e| map_transport(e, self.timeout))?;
        parse_answer(&parsed.response)
    }
}

/// Scripted backend for tests and `AI_TEST_MODE=mock`. Counts its calls.
pub struct MockBackend {
    reply: Mutex<Result<BackendAnswer, BackendError>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockBackend {
    pub fn answering(category: &str, confidence: f32) -> Self {
        Self::with_answer(BackendAnswer {
            category: category.to_string(),
            confidence: Some(confidence),
            ..Default::default()
        })
    }

    pub fn with_answer(answer: BackendAnswer) -> Self {
        Self {
            reply: Mutex::new(Ok(answer)),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: BackendError) -> Self {
        Self {
            reply: Mutex::new(Err(err)),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep before answering (timeouts, cancellation).
    pub fn delayed(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }

    /// Replace the scripted reply.
    pub fn set_reply(&self, reply: Result<BackendAnswer, BackendError>) {
        *self.reply.lock().unwrap_or_else(|p| p.into_inner()) = reply;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassifierBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn classify(&self, _req: &InferenceRequest<'_>) -> Result<BackendAnswer, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.reply.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taxonomy() -> Vec<TaxonomyEntry> {
        ["security", "react_ecosystem", "other"]
            .iter()
            .map(|id| TaxonomyEntry {
                id: id.to_string(),
                description: String::new(),
            })
            .collect()
    }

    #[test]
    fn parse_tolerates_fences_and_prose() {
        let raw = "Sure!\n```json\n{\"category\": \"security\", \"confidence\": 0.82}\n```";
        let a = parse_answer(raw).unwrap();
        assert_eq!(a.category, "security");
        assert_eq!(a.confidence, Some(0.82));
        assert!(parse_answer("no json here").is_err());
        assert!(parse_answer("{\"category\": \"\"}").is_err());
    }

    #[tokio::test]
    async fn fallback_runs_only_after_primary_failure() {
        let primary = Arc::new(MockBackend::failing(BackendError::Unavailable("down".into())));
        let local = Arc::new(MockBackend::answering("security", 0.7));
        let adapter = InferenceAdapter::new(primary.clone(), taxonomy()).with_fallback(local.clone());

        let r = adapter.classify("rotate signing keys").await.unwrap();
        assert_eq!(r.category, "security");
        assert_eq!(r.source, ClassificationSource::Inference);
        assert_eq!((primary.calls(), local.calls()), (1, 1));

        primary.set_reply(Ok(BackendAnswer {
            category: "react_ecosystem".into(),
            ..Default::default()
        }));
        let r = adapter.classify("jsx").await.unwrap();
        assert_eq!(r.category, "react_ecosystem");
        assert_eq!(r.confidence, DEFAULT_INFERENCE_CONFIDENCE);
        assert_eq!((primary.calls(), local.calls()), (2, 1));
    }

    #[tokio::test]
    async fn both_failing_reports_last_error_once_each() {
        let primary = Arc::new(MockBackend::failing(BackendError::Unavailable("down".into())));
        let local = Arc::new(MockBackend::answering("security", 0.7).delayed(Duration::from_millis(200)));
        let adapter = InferenceAdapter::new(primary.clone(), taxonomy())
            .with_fallback(local.clone())
            .with_timeout(Duration::from_millis(20));
        let err = adapter.classify("anything").await.unwrap_err();
        assert_eq!(err, BackendError::Timeout(20));
        assert_eq!((primary.calls(), local.calls()), (1, 1));
    }

    #[tokio::test]
    async fn answers_are_validated_against_taxonomy() {
        let backend = Arc::new(MockBackend::with_answer(BackendAnswer {
            category: "Quantum Computing".into(),
            confidence: Some(3.0),
            technology_stack: vec!["Qiskit".into(), "Python".into()],
            ..Default::default()
        }));
        let adapter = InferenceAdapter::new(backend.clone(), taxonomy());
        let r = adapter.classify("qubits").await.unwrap();
        assert_eq!(r.category, UNCATEGORIZED);
        assert_eq!(r.confidence, 1.0);
        assert!(r.technology.is_none(), "two technologies are ambiguous");

        backend.set_reply(Ok(BackendAnswer {
            category: "React Ecosystem".into(),
            subcategory: Some("state management".into()),
            technology_stack: vec!["Zustand".into()],
            ..Default::default()
        }));
        let r = adapter.classify("zustand store").await.unwrap();
        assert_eq!(r.category, "react_ecosystem");
        assert_eq!(r.subcategory.as_deref(), Some("state management"));
        assert_eq!(r.technology.as_deref(), Some("Zustand"));
    }

    #[tokio::test]
    async fn technology_labels_follow_vocabulary_spelling() {
        use crate::analyze::RuleSet;

        let vocabulary = Arc::new(TechVocabulary::new(&RuleSet::default_seed().technologies));
        let backend = Arc::new(MockBackend::with_answer(BackendAnswer {
            category: "react_ecosystem".into(),
            technology: Some("TYPESCRIPT".into()),
            ..Default::default()
        }));
        let adapter = InferenceAdapter::new(backend.clone(), taxonomy()).with_vocabulary(vocabulary);
        let r = adapter.classify("typed props").await.unwrap();
        assert_eq!(r.technology.as_deref(), Some("TypeScript"));

        // Two spellings of one technology are not ambiguous.
        backend.set_reply(Ok(BackendAnswer {
            category: "react_ecosystem".into(),
            technology_stack: vec!["typescript".into(), "TypeScript".into()],
            ..Default::default()
        }));
        let r = adapter.classify("typed props").await.unwrap();
        assert_eq!(r.technology.as_deref(), Some("TypeScript"));

        // Unknown labels pass through as given.
        backend.set_reply(Ok(BackendAnswer {
            category: "react_ecosystem".into(),
            technology: Some(" Zustand ".into()),
            ..Default::default()
        }));
        let r = adapter.classify("store").await.unwrap();
        assert_eq!(r.technology.as_deref(), Some("Zustand"));
    }

    #[tokio::test]
    async fn remote_backend_without_key_is_unavailable() {
        let b = RemoteChatBackend::new(BackendKind::Groq, None, String::new(), None, Duration::from_secs(1)).unwrap();
        let tax = taxonomy();
        let err = b
            .classify(&InferenceRequest {
                text: "x",
                taxonomy: &tax,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[test]
    fn prompt_lists_taxonomy_and_content() {
        let tax = taxonomy();
        let p = build_prompt(&InferenceRequest {
            text: "oauth pkce flow",
            taxonomy: &tax,
        });
        assert!(p.contains("- security"));
        assert!(p.ends_with("oauth pkce flow"));
    }
}
