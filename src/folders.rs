//! Category → directory mapping.
//!
//! [`CategoryMap`] is the static taxonomy. [`PathBuilder`] turns a
//! [`CategoryResult`] into a base-relative path and creates it. Path
//! computation is pure; only [`PathBuilder::ensure`] touches the disk, and it
//! only ever creates directories.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::bail;
use metrics::counter;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::analyze::ai_adapter::TaxonomyEntry;
use crate::analyze::{CategoryResult, UNCATEGORIZED};
use crate::error::SortError;

const UNCATEGORIZED_PATH: &str = "General/Other";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySpec {
    /// Base-relative path, `/`-separated.
    pub path: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct CategoryMap {
    entries: BTreeMap<String, CategorySpec>,
}

impl CategoryMap {
    /// Validate custom entries; the uncategorized bucket is added if absent.
    pub fn from_specs(specs: BTreeMap<String, CategorySpec>) -> anyhow::Result<Self> {
        let mut entries = BTreeMap::new();
        for (id, spec) in specs {
            let id = id.trim().to_ascii_lowercase();
            if id.is_empty() {
                bail!("category id must not be empty");
            }
            validate_relative(&spec.path)?;
            entries.insert(id, spec);
        }
        entries.entry(UNCATEGORIZED.to_string()).or_insert_with(|| CategorySpec {
            path: UNCATEGORIZED_PATH.into(),
            description: "Miscellaneous content that fits no other category".into(),
        });
        Ok(Self { entries })
    }

    /// The built-in web-development taxonomy.
    pub fn default_seed() -> Self {
        let seed: &[(&str, &str, &str)] = &[
            ("frontend", "Frontend/General", "Frontend technologies, frameworks, and client-side development"),
            ("css_styling", "Frontend/CSS-Styling", "CSS frameworks, styling libraries, and design systems"),
            ("javascript", "Frontend/JavaScript", "JavaScript libraries, utilities, and vanilla JS solutions"),
            ("react_ecosystem", "Frontend/React", "React framework, libraries, and ecosystem tools"),
            ("vue_ecosystem", "Frontend/Vue", "Vue.js framework, libraries, and ecosystem tools"),
            ("angular_ecosystem", "Frontend/Angular", "Angular framework, libraries, and ecosystem tools"),
            ("backend", "Backend/General", "Backend technologies, APIs, and server-side development"),
            ("nodejs", "Backend/NodeJS", "Node.js runtime, frameworks, and server-side JavaScript"),
            ("python_web", "Backend/Python", "Python web frameworks and server-side development"),
            ("php_web", "Backend/PHP", "PHP frameworks and content management systems"),
            ("database", "Database", "Database systems, ORMs, and data storage solutions"),
            ("build_tools", "DevTools/Build-Tools", "Build tools, bundlers, and development workflow"),
            ("testing", "DevTools/Testing", "Testing frameworks, tools, and methodologies"),
            ("devops_web", "DevTools/DevOps", "DevOps tools, deployment, and infrastructure for web development"),
            ("ui_design", "Design/UI-UX", "UI/UX design, design systems, and prototyping tools"),
            ("icons_assets", "Design/Assets", "Icons, fonts, images, and visual assets"),
            ("tutorials", "Learning/Tutorials", "Educational content, tutorials, and learning materials"),
            ("videos", "Learning/Videos", "Video content, tutorials, and educational streams"),
            ("documentation", "Learning/Documentation", "Documentation, API references, and technical guides"),
            ("code_snippets", "Code/Snippets", "Code snippets, examples, and interactive demos"),
            ("templates", "Code/Templates", "Project templates, boilerplates, and starter kits"),
            ("libraries", "Code/Libraries", "Third-party libraries, packages, and plugins"),
            ("animation", "Specialized/Animation", "Animation libraries, WebGL, and interactive graphics"),
            ("performance", "Specialized/Performance", "Performance optimization, monitoring, and best practices"),
            ("security", "Specialized/Security", "Web security, authentication, and security best practices"),
            ("articles", "General/Articles", "Articles, blog posts, and technical writing"),
            ("tools", "General/Tools", "Development tools, utilities, and productivity software"),
            (UNCATEGORIZED, UNCATEGORIZED_PATH, "Miscellaneous content that fits no other category"),
        ];
        let entries = seed
            .iter()
            .map(|(id, path, desc)| {
                (
                    id.to_string(),
                    CategorySpec {
                        path: path.to_string(),
                        description: desc.to_string(),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, id: &str) -> Option<&CategorySpec> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CategorySpec)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids and descriptions, in the shape the inference prompt wants.
    pub fn taxonomy(&self) -> Vec<TaxonomyEntry> {
        self.iter()
            .map(|(id, spec)| TaxonomyEntry {
                id: id.to_string(),
                description: spec.description.clone(),
            })
            .collect()
    }
}

impl Default for CategoryMap {
    fn default() -> Self {
        Self::default_seed()
    }
}

/// A category path must stay below the storage root.
pub fn validate_relative(path: &str) -> anyhow::Result<()> {
    if path.trim().is_empty() {
        bail!("category path is empty");
    }
    for c in Path::new(path).components() {
        match c {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => bail!("category path {path:?} contains '..'"),
            Component::RootDir | Component::Prefix(_) => bail!("category path {path:?} is absolute"),
        }
    }
    Ok(())
}

/// Turn free text into one safe folder-name segment.
///
/// `_`, `-` and whitespace separate words; every other character outside
/// ASCII `[A-Za-z0-9]` is dropped. Words are joined with `-` and title-cased.
/// Returns "" when nothing usable is left.
pub fn sanitize_segment(input: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut cur = String::new();
    for ch in input.chars() {
        if ch == '_' || ch == '-' || ch.is_whitespace() {
            if !cur.is_empty() {
                words.push(std::mem::take(&mut cur));
            }
        } else if ch.is_ascii_alphanumeric() {
            cur.push(ch);
        }
    }
    if !cur.is_empty() {
        words.push(cur);
    }

    let titled: Vec<String> = words.iter().map(|w| title_word(w)).collect();
    titled.join("-")
}

fn title_word(w: &str) -> String {
    let has_lower = w.bytes().any(|b| b.is_ascii_lowercase());
    let has_upper = w.bytes().any(|b| b.is_ascii_uppercase());
    let mut chars = w.chars();
    let Some(first) = chars.next() else {
        return String::new();
    };
    let mut out = String::with_capacity(w.len());
    out.push(first.to_ascii_uppercase());
    if has_lower && has_upper {
        // Mixed case (TypeScript, GraphQL) is intentional; keep it.
        out.extend(chars);
    } else {
        out.extend(chars.map(|c| c.to_ascii_lowercase()));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderOutcome {
    pub relative: PathBuf,
    pub absolute: PathBuf,
    /// False when the leaf directory already existed.
    pub created: bool,
}

/// Nested directory listing: name → children.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FolderTree(pub BTreeMap<String, FolderTree>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryStat {
    pub folder_path: String,
    pub exists: bool,
    pub subfolders_count: usize,
    pub subfolders: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PathBuilder {
    base: PathBuf,
    map: Arc<CategoryMap>,
}

impl PathBuilder {
    pub fn new(base: impl Into<PathBuf>, map: Arc<CategoryMap>) -> Self {
        Self {
            base: base.into(),
            map,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn categories(&self) -> &CategoryMap {
        &self.map
    }

    /// Base-relative path for a result. No I/O.
    pub fn resolve(&self, result: &CategoryResult) -> Result<PathBuf, SortError> {
        let spec = self
            .map
            .get(&result.category)
            .ok_or_else(|| SortError::InvalidCategory(result.category.clone()))?;

        let mut rel: PathBuf = spec.path.split('/').filter(|s| !s.is_empty()).collect();
        for extra in [&result.subcategory, &result.technology].into_iter().flatten() {
            let seg = sanitize_segment(extra);
            if !seg.is_empty() {
                rel.push(seg);
            }
        }
        Ok(rel)
    }

    /// Resolve and create. An existing directory is a successful no-op.
    pub fn ensure(&self, result: &CategoryResult) -> Result<FolderOutcome, SortError> {
        let relative = self.resolve(result)?;
        let absolute = self.base.join(&relative);
        let fail = |source: io::Error| SortError::FolderCreationFailed {
            path: absolute.clone(),
            source,
        };

        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).map_err(fail)?;
        }
        // create_dir on the leaf decides `created` atomically between racing callers.
        let created = match fs::create_dir(&absolute) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && absolute.is_dir() => false,
            Err(e) => return Err(fail(e)),
        };

        if created {
            counter!("sorter_folders_created_total").increment(1);
            tracing::info!(target: "sorter", path = %relative.display(), "folder created");
        }
        Ok(FolderOutcome {
            relative,
            absolute,
            created,
        })
    }

    /// Every directory under the base, nested. Hidden directories are skipped.
    pub fn folder_tree(&self) -> FolderTree {
        let mut root = FolderTree::default();
        let walker = WalkDir::new(&self.base)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e.file_name()));
        for entry in walker.filter_map(Result::ok) {
            if !entry.file_type().is_dir() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.base) else {
                continue;
            };
            let mut node = &mut root;
            for part in rel.components() {
                let name = part.as_os_str().to_string_lossy().into_owned();
                node = node.0.entry(name).or_default();
            }
        }
        root
    }

    /// Per category: whether its folder exists and which subfolders it has.
    pub fn category_stats(&self) -> BTreeMap<String, CategoryStat> {
        self.map
            .iter()
            .map(|(id, spec)| {
                let full = self.base.join(&spec.path);
                let mut subfolders: Vec<String> = match fs::read_dir(&full) {
                    Ok(rd) => rd
                        .filter_map(Result::ok)
                        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
                        .map(|e| e.file_name().to_string_lossy().into_owned())
                        .filter(|n| !n.starts_with('.'))
                        .collect(),
                    Err(_) => Vec::new(),
                };
                subfolders.sort();
                let stat = CategoryStat {
                    folder_path: spec.path.clone(),
                    exists: full.is_dir(),
                    subfolders_count: subfolders.len(),
                    subfolders,
                };
                (id.to_string(), stat)
            })
            .collect()
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}
