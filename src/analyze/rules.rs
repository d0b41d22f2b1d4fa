//! Deterministic keyword classifier (loaded once from `config/rules.json`).
//!
//! Minimal JSON DSL, one entry per category:
//! - `category`:    category id (must exist in the category map)
//! - `tier`:        `"technology"` | `"topic"` | `"general"`, most specific first
//! - `keywords`:    words or phrases, matched against whole tokens of the
//!                  normalized text (`"next.js"`, `"step by step"`)
//! - `subcategory`: optional fixed subcategory reported on match
//! - `implies`:     technology names the category already stands for; these are
//!                  never reported as the technology tag
//!
//! Selection: the most specific tier with any hit wins; inside it the rule with
//! more distinct keyword hits wins; remaining ties go to the earlier rule.
//!
//! A top-level `technologies` list is the vocabulary for the single dominant
//! technology tag. The tag is the technology with the most mentions; a tie
//! between technologies yields no tag.
//!
//! Links are matched by host and path: `https://www.youtube.com/watch` yields
//! `youtube.com`, `youtube`, `com` and `watch`, so host keywords such as
//! `github` or `docs` act as domain hints.

use std::{fs, path::Path, sync::Arc};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::analyze::{CategoryResult, ClassificationSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Technology,
    Topic,
    #[default]
    General,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub category: String,
    #[serde(default)]
    pub tier: Tier,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub implies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Technology {
    /// Display name, used verbatim as the folder segment source.
    pub name: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    #[serde(default = "default_technologies")]
    pub technologies: Vec<Technology>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::default_seed()
    }
}

impl RuleSet {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("reading rules from {}", path.display()))?;
        let rules: RuleSet = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing rules in {}", path.display()))?;
        Ok(rules)
    }

    /// Load `path` if it exists, otherwise the built-in seed.
    pub fn load_or_seed(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) if p.exists() => Self::load_from_file(p),
            Some(p) => {
                tracing::info!(target: "sorter", path = %p.display(), "rules file absent, using built-in seed");
                Ok(Self::default_seed())
            }
            None => Ok(Self::default_seed()),
        }
    }

    /// Web-development taxonomy: frameworks and languages first, then topics,
    /// then generic resource kinds.
    pub fn default_seed() -> Self {
        use Tier::*;
        let rule = |category: &str, tier: Tier, keywords: &[&str], implies: &[&str]| Rule {
            category: category.to_string(),
            tier,
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            subcategory: None,
            implies: implies.iter().map(|s| s.to_string()).collect(),
        };

        let rules = vec![
            rule(
                "react_ecosystem",
                Technology,
                &["react", "jsx", "next.js", "nextjs", "gatsby", "redux", "mobx", "react-router", "hooks", "usestate", "useeffect"],
                &["React", "Next.js"],
            ),
            rule(
                "vue_ecosystem",
                Technology,
                &["vue", "vue.js", "vuex", "nuxt", "vue-router", "composition-api", "pinia", "quasar"],
                &["Vue"],
            ),
            rule(
                "angular_ecosystem",
                Technology,
                &["angular", "rxjs", "ngrx", "angular-cli", "ionic"],
                &["Angular"],
            ),
            rule(
                "css_styling",
                Technology,
                &["css", "sass", "scss", "less", "tailwind", "tailwindcss", "bootstrap", "styled-components", "flexbox", "grid"],
                &["CSS", "Sass", "Tailwind"],
            ),
            rule(
                "javascript",
                Technology,
                &["javascript", "js", "typescript", "es6", "es2015", "jquery", "lodash"],
                &["JavaScript", "TypeScript"],
            ),
            rule(
                "nodejs",
                Technology,
                &["node.js", "nodejs", "node", "npm", "yarn", "express", "koa", "fastify", "nest.js", "nestjs", "socket.io"],
                &["Node.js"],
            ),
            rule(
                "python_web",
                Technology,
                &["django", "flask", "fastapi", "pyramid", "tornado", "python", "wsgi", "asgi"],
                &["Python", "Django", "Flask", "FastAPI"],
            ),
            rule(
                "php_web",
                Technology,
                &["php", "laravel", "symfony", "codeigniter", "wordpress", "drupal", "composer"],
                &["PHP", "Laravel"],
            ),
            rule(
                "database",
                Technology,
                &["database", "sql", "mysql", "postgresql", "postgres", "mongodb", "redis", "elasticsearch", "prisma", "sequelize", "mongoose"],
                &["PostgreSQL", "MySQL", "MongoDB", "Redis"],
            ),
            rule(
                "build_tools",
                Technology,
                &["webpack", "vite", "rollup", "parcel", "gulp", "grunt", "babel", "esbuild", "swc"],
                &["Webpack", "Vite"],
            ),
            rule(
                "testing",
                Technology,
                &["jest", "mocha", "chai", "cypress", "playwright", "testing-library", "vitest", "unit-test", "e2e"],
                &["Jest", "Cypress", "Playwright"],
            ),
            rule(
                "devops_web",
                Technology,
                &["docker", "kubernetes", "k8s", "ci/cd", "github-actions", "jenkins", "vercel", "netlify", "heroku"],
                &["Docker", "Kubernetes"],
            ),
            rule(
                "animation",
                Technology,
                &["gsap", "framer-motion", "lottie", "three.js", "webgl", "canvas"],
                &[],
            ),
            rule(
                "frontend",
                Topic,
                &["frontend", "front-end", "client-side", "browser", "dom", "responsive", "mobile-first", "html", "svelte"],
                &["HTML"],
            ),
            rule(
                "backend",
                Topic,
                &["backend", "back-end", "server", "api", "rest", "graphql", "microservices", "serverless"],
                &["GraphQL"],
            ),
            rule(
                "ui_design",
                Topic,
                &["ui", "ux", "design-system", "design system", "figma", "sketch", "adobe-xd", "adobe", "dribbble", "behance", "wireframe", "prototype", "mockup"],
                &["Figma"],
            ),
            rule(
                "icons_assets",
                Topic,
                &["icons", "svg", "fonts", "illustrations", "graphics", "logo"],
                &[],
            ),
            rule(
                "performance",
                Topic,
                &["performance", "optimization", "lighthouse", "web-vitals", "lazy-loading", "caching", "compression"],
                &[],
            ),
            rule(
                "security",
                Topic,
                &["security", "authentication", "authorization", "jwt", "oauth", "csrf", "xss"],
                &[],
            ),
            rule(
                "code_snippets",
                Topic,
                &["snippet", "gist", "codepen", "jsfiddle", "sandbox", "playground"],
                &[],
            ),
            rule(
                "templates",
                Topic,
                &["template", "boilerplate", "starter", "scaffold", "theme", "layout"],
                &[],
            ),
            rule(
                "libraries",
                Topic,
                &["library", "package", "cdn", "plugin", "module", "github", "gitlab", "bitbucket"],
                &[],
            ),
            rule(
                "tutorials",
                General,
                &["tutorial", "guide", "how-to", "how to", "walkthrough", "step by step", "step-by-step", "lesson", "course", "coursera", "udemy", "edx", "codecademy", "freecodecamp"],
                &[],
            ),
            rule(
                "videos",
                General,
                &["video", "youtube", "youtube.com", "youtu.be", "vimeo", "twitch", "webinar", "conference"],
                &[],
            ),
            rule(
                "documentation",
                General,
                &["docs", "documentation", "readme", "manual", "wiki", "reference", "specification"],
                &[],
            ),
            rule(
                "articles",
                General,
                &["article", "blog", "post", "news", "opinion", "review"],
                &[],
            ),
            rule(
                "tools",
                General,
                &["tool", "utility", "software", "application", "extension", "addon"],
                &[],
            ),
        ];

        Self {
            rules,
            technologies: default_technologies(),
        }
    }
}

fn default_technologies() -> Vec<Technology> {
    let t = |name: &str, aliases: &[&str]| Technology {
        name: name.to_string(),
        aliases: aliases.iter().map(|s| s.to_string()).collect(),
    };
    vec![
        t("React", &["react", "reactjs"]),
        t("Next.js", &["next.js", "nextjs"]),
        t("Vue", &["vue", "vue.js", "vuejs"]),
        t("Angular", &["angular"]),
        t("Svelte", &["svelte", "sveltekit"]),
        t("TypeScript", &["typescript"]),
        t("JavaScript", &["javascript", "js"]),
        t("Node.js", &["node.js", "nodejs"]),
        t("Python", &["python"]),
        t("Django", &["django"]),
        t("Flask", &["flask"]),
        t("FastAPI", &["fastapi"]),
        t("PHP", &["php"]),
        t("Laravel", &["laravel"]),
        t("Rust", &["rust"]),
        t("Go", &["golang"]),
        t("Java", &["java"]),
        t("Docker", &["docker"]),
        t("Kubernetes", &["kubernetes", "k8s"]),
        t("PostgreSQL", &["postgresql", "postgres"]),
        t("MySQL", &["mysql"]),
        t("MongoDB", &["mongodb", "mongo"]),
        t("Redis", &["redis"]),
        t("GraphQL", &["graphql"]),
        t("CSS", &["css"]),
        t("Sass", &["sass", "scss"]),
        t("Tailwind", &["tailwind", "tailwindcss"]),
        t("HTML", &["html", "html5"]),
        t("Webpack", &["webpack"]),
        t("Vite", &["vite"]),
        t("Jest", &["jest"]),
        t("Cypress", &["cypress"]),
        t("Playwright", &["playwright"]),
        t("Figma", &["figma"]),
    ]
}

// --- compiled form ---

/// Keyword phrase split into tokens with the same tokenizer as the input.
type Phrase = Vec<String>;

#[derive(Debug, Clone)]
struct CompiledRule {
    category: String,
    tier: Tier,
    phrases: Vec<Phrase>,
    subcategory: Option<String>,
    implies: Vec<String>,
}

#[derive(Debug, Clone)]
struct CompiledTechnology {
    name: String,
    /// The display name in token form, so `"TYPESCRIPT"` finds `TypeScript`.
    name_key: Phrase,
    phrases: Vec<Phrase>,
}

/// Canonical technology names and their aliases. Shared with the inference
/// adapter so a technology gets one folder spelling whichever stage tagged it.
#[derive(Debug, Clone, Default)]
pub struct TechVocabulary {
    entries: Vec<CompiledTechnology>,
}

impl TechVocabulary {
    pub fn new(technologies: &[Technology]) -> Self {
        let entries = technologies
            .iter()
            .map(|t| CompiledTechnology {
                name: t.name.trim().to_string(),
                name_key: tokenize(&t.name),
                phrases: compile_phrases(&t.aliases),
            })
            .collect();
        Self { entries }
    }

    /// Canonical name for a free-form label, matched case-insensitively
    /// against display names and aliases. `None` when the label is unknown.
    pub fn canonical(&self, label: &str) -> Option<&str> {
        let key = tokenize(label);
        if key.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|t| t.name_key == key || t.phrases.contains(&key))
            .map(|t| t.name.as_str())
    }
}

/// Immutable, precompiled rule table. Cheap to share behind an `Arc`.
#[derive(Debug, Clone)]
pub struct RuleClassifier {
    rules: Vec<CompiledRule>,
    technologies: Arc<TechVocabulary>,
}

impl RuleClassifier {
    pub fn new(set: &RuleSet) -> Self {
        let rules = set
            .rules
            .iter()
            .map(|r| CompiledRule {
                category: r.category.trim().to_ascii_lowercase(),
                tier: r.tier,
                phrases: compile_phrases(&r.keywords),
                subcategory: r.subcategory.clone(),
                implies: r.implies.iter().map(|s| s.to_lowercase()).collect(),
            })
            .collect();
        Self {
            rules,
            technologies: Arc::new(TechVocabulary::new(&set.technologies)),
        }
    }

    /// The technology vocabulary behind the dominant-technology tag.
    pub fn vocabulary(&self) -> Arc<TechVocabulary> {
        Arc::clone(&self.technologies)
    }

    /// Category ids referenced by the rule table, in priority order.
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.category.as_str())
    }

    /// Classify already-normalized text. `None` means no rule matched and the
    /// caller should fall through to cache and inference.
    pub fn classify(&self, normalized: &str) -> Option<CategoryResult> {
        let tokens = tokenize(normalized);
        if tokens.is_empty() {
            return None;
        }

        // (tier, hits, index) of the best rule so far
        let mut best: Option<(Tier, usize, usize)> = None;
        for (idx, rule) in self.rules.iter().enumerate() {
            let hits = rule
                .phrases
                .iter()
                .filter(|p| count_occurrences(&tokens, p) > 0)
                .count();
            if hits == 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((tier, best_hits, _)) => {
                    rule.tier < tier || (rule.tier == tier && hits > best_hits)
                }
            };
            if better {
                best = Some((rule.tier, hits, idx));
            }
        }

        let (_, _, idx) = best?;
        let rule = &self.rules[idx];
        Some(
            CategoryResult::new(rule.category.clone(), 1.0, ClassificationSource::Rule)
                .subcategory(rule.subcategory.clone())
                .technology(self.dominant_technology(&tokens, &rule.implies)),
        )
    }

    fn dominant_technology(&self, tokens: &[String], implied: &[String]) -> Option<String> {
        let mut best: Option<(usize, &str)> = None;
        let mut tied = false;
        for tech in &self.technologies.entries {
            if implied.iter().any(|i| i == &tech.name.to_lowercase()) {
                continue;
            }
            let mentions: usize = tech
                .phrases
                .iter()
                .map(|p| count_occurrences(tokens, p))
                .sum();
            if mentions == 0 {
                continue;
            }
            match best {
                Some((n, _)) if mentions < n => {}
                Some((n, _)) if mentions == n => tied = true,
                _ => {
                    best = Some((mentions, tech.name.as_str()));
                    tied = false;
                }
            }
        }
        if tied {
            return None;
        }
        best.map(|(_, name)| name.to_string())
    }
}

// --- tokenizer ---

/// Characters kept inside a token besides alphanumerics (`node.js`, `c++`,
/// `c#`, `ci/cd`, `react-router`).
fn is_token_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '.' | '+' | '#' | '/' | '-' | '_')
}

/// Tokens of `text`. Links expand into host and path tokens, every other
/// whitespace-separated word goes through [`word_tokens`].
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for word in text.split_whitespace() {
        match split_link(word) {
            Some((host, path)) => push_link_tokens(&mut out, host, path),
            None => word_tokens(word, &mut out),
        }
    }
    out
}

/// Split on anything that cannot be part of a token, then trim punctuation
/// that only makes sense between word characters.
fn word_tokens(text: &str, out: &mut Vec<String>) {
    out.extend(
        text.split(|c: char| !is_token_char(c))
            .map(|t| t.trim_matches(|c: char| matches!(c, '.' | '/' | '-' | '_')))
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase()),
    );
}

/// `(host, path)` of a link word (`http://`, `https://` or a bare `www.`
/// host). The host loses `www.`, credentials and port; the path loses its
/// query and fragment.
fn split_link(word: &str) -> Option<(&str, &str)> {
    let word = word.trim_matches(|c: char| matches!(c, '(' | ')' | '<' | '>' | '[' | ']' | '"' | '\'' | ','));
    let rest = strip_prefix_ci(word, "https://")
        .or_else(|| strip_prefix_ci(word, "http://"))
        .or_else(|| strip_prefix_ci(word, "www.").map(|_| word))?;

    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(end);
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host);
    let host = strip_prefix_ci(host, "www.").unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    let path = tail.split(['?', '#']).next().unwrap_or("");
    Some((host, path))
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

/// The whole host, each of its labels, then the path words with `-` and `_`
/// treated as separators (`design-system` reads as `design system`).
fn push_link_tokens(out: &mut Vec<String>, host: &str, path: &str) {
    let host = host.to_lowercase();
    let labels: Vec<String> = host
        .split('.')
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    out.push(host);
    out.extend(labels);
    for segment in path.split(['/', '-', '_']) {
        word_tokens(segment, out);
    }
}

fn compile_phrases(keywords: &[String]) -> Vec<Phrase> {
    let mut out: Vec<Phrase> = Vec::with_capacity(keywords.len());
    for k in keywords {
        let p = tokenize(k);
        if !p.is_empty() && !out.contains(&p) {
            out.push(p);
        }
    }
    out
}

/// Occurrences of `phrase` in `tokens`. A one-word phrase also matches a part
/// of a hyphenated or slashed token (`react` in `react-router`).
fn count_occurrences(tokens: &[String], phrase: &[String]) -> usize {
    match phrase {
        [] => 0,
        [word] => tokens
            .iter()
            .filter(|t| {
                *t == word
                    || (t.contains(['-', '/']) && t.split(['-', '/']).any(|part| part == word))
            })
            .count(),
        _ => tokens
            .windows(phrase.len())
            .filter(|w| w.iter().zip(phrase).all(|(a, b)| a == b))
            .count(),
    }
}
