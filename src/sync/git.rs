//! Git-backed [`BackupSink`]: commit the sorted tree and push it to a remote.
//!
//! The repository lives inside the storage root. History is append-only from
//! here: no force pushes, no resets. A rejected push fails the cycle and is
//! retried on the next one.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use tokio::process::Command;
use walkdir::WalkDir;

use crate::sync::{BackupSink, ChangeSet};

pub const AUTHOR_NAME: &str = "content-sorter";
pub const AUTHOR_EMAIL: &str = "content-sorter@localhost";

#[derive(Clone)]
pub struct GitSink {
    remote: Option<String>,
    branch: String,
    token: Option<String>,
}

impl std::fmt::Debug for GitSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitSink")
            .field("remote", &self.remote)
            .field("branch", &self.branch)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl GitSink {
    pub fn new(remote: Option<String>, branch: impl Into<String>, token: Option<String>) -> Self {
        Self {
            remote: remote.filter(|r| !r.trim().is_empty()),
            branch: branch.into(),
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    /// Local commits only.
    pub fn local(branch: impl Into<String>) -> Self {
        Self::new(None, branch, None)
    }

    async fn git(&self, root: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(root)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await
            .with_context(|| "Failed to execute git. Is git installed?")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.first().copied().unwrap_or(""), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// `git init` on first use and keep `origin` pointing at the configured remote.
    async fn ensure_repo(&self, root: &Path) -> Result<()> {
        tokio::fs::create_dir_all(root)
            .await
            .with_context(|| format!("creating backup root {}", root.display()))?;
        if !root.join(".git").exists() {
            self.git(root, &["init", "-q"]).await?;
            let head = format!("refs/heads/{}", self.branch);
            self.git(root, &["symbolic-ref", "HEAD", &head]).await?;
            tracing::info!(target: "backup", root = %root.display(), "initialized backup repository");
        }
        if let Some(remote) = &self.remote {
            match self.git(root, &["remote", "get-url", "origin"]).await {
                Ok(url) if &url == remote => {}
                Ok(_) => {
                    self.git(root, &["remote", "set-url", "origin", remote]).await?;
                }
                Err(_) => {
                    self.git(root, &["remote", "add", "origin", remote]).await?;
                }
            }
        }
        Ok(())
    }

    /// True when the index differs from HEAD (or there is no HEAD yet and the
    /// index is non-empty).
    async fn has_staged_changes(&self, root: &Path) -> Result<bool> {
        let status = self.git(root, &["status", "--porcelain"]).await?;
        Ok(!status.is_empty())
    }

    async fn push(&self, root: &Path) -> Result<()> {
        let refspec = format!("HEAD:refs/heads/{}", self.branch);
        let mut args: Vec<String> = Vec::new();
        if let Some(token) = &self.token {
            // Credential lives only in this process's argv, never in .git/config.
            let basic = base64::engine::general_purpose::STANDARD.encode(format!("x-access-token:{token}"));
            args.push("-c".into());
            args.push(format!("http.extraHeader=Authorization: Basic {basic}"));
        }
        args.extend(["push".into(), "-q".into(), "origin".into(), refspec]);
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        self.git(root, &argv).await.map(|_| ())
    }
}

/// Drop a `.gitkeep` into every empty visible directory so git tracks it.
/// Never overwrites.
fn place_gitkeeps(root: &Path) -> Result<usize> {
    let mut placed = 0;
    let dirs: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect();
    for dir in dirs {
        let empty = std::fs::read_dir(&dir)
            .with_context(|| format!("listing {}", dir.display()))?
            .next()
            .is_none();
        if !empty {
            continue;
        }
        match OpenOptions::new().write(true).create_new(true).open(dir.join(".gitkeep")) {
            Ok(_) => placed += 1,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e).with_context(|| format!("placing .gitkeep in {}", dir.display())),
        }
    }
    Ok(placed)
}

#[async_trait]
impl BackupSink for GitSink {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn push_changes(&self, root: &Path, changes: &ChangeSet) -> Result<()> {
        self.ensure_repo(root).await?;

        let owned = root.to_path_buf();
        tokio::task::spawn_blocking(move || place_gitkeeps(&owned))
            .await
            .context("gitkeep task panicked")??;

        self.git(root, &["add", "-A"]).await?;
        if self.has_staged_changes(root).await? {
            let message = format!(
                "backup: {} ({})",
                Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
                changes.summary()
            );
            let name = format!("user.name={AUTHOR_NAME}");
            let email = format!("user.email={AUTHOR_EMAIL}");
            self.git(root, &["-c", &name, "-c", &email, "commit", "-q", "-m", &message])
                .await?;
            tracing::info!(target: "backup", summary = %changes.summary(), "committed backup");
        }

        // Push even without a new commit: the previous push may have failed.
        if self.remote.is_some() {
            self.push(root).await?;
            tracing::info!(target: "backup", branch = %self.branch, "pushed backup");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gitkeep_only_in_empty_dirs_and_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("General/Other")).unwrap();
        std::fs::create_dir_all(root.join("Database")).unwrap();
        std::fs::write(root.join("Database/item.json"), b"{}").unwrap();
        std::fs::create_dir_all(root.join(".git/refs")).unwrap();

        assert_eq!(place_gitkeeps(root).unwrap(), 1);
        assert!(root.join("General/Other/.gitkeep").exists());
        assert!(!root.join("Database/.gitkeep").exists());
        assert!(!root.join(".git/refs/.gitkeep").exists());

        std::fs::write(root.join("General/Other/.gitkeep"), b"mine").unwrap();
        assert_eq!(place_gitkeeps(root).unwrap(), 0);
        assert_eq!(std::fs::read(root.join("General/Other/.gitkeep")).unwrap(), b"mine");
    }

    #[test]
    fn debug_redacts_token() {
        let sink = GitSink::new(Some("https://example.invalid/r.git".into()), "main", Some("s3cret".into()));
        let dbg = format!("{sink:?}");
        assert!(!dbg.contains("s3cret"));
        assert!(dbg.contains("redacted"));
    }
}
