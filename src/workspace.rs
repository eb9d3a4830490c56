//! Repository references and scoped working copies.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::InputError;

/// Opaque per-run settings handed to collaborators untouched.
pub type Knobs = Map<String, Value>;

/// A validated repository reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoSource {
    /// `https://`, `http://`, `ssh://`, `git://` or scp-style `git@host:owner/repo`
    Remote(String),
    /// `file://` URL or an existing local directory
    Local(PathBuf),
}

impl RepoSource {
    pub fn parse(raw: &str) -> Result<Self, InputError> {
        let url = raw.trim();
        if url.is_empty() {
            return Err(InputError::MissingRepoUrl);
        }
        let invalid = |reason: &str| InputError::InvalidRepoUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };
        if url.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }

        if let Some(path) = url.strip_prefix("file://") {
            if path.is_empty() {
                return Err(invalid("file:// URL has no path"));
            }
            return Ok(Self::Local(PathBuf::from(path)));
        }

        for scheme in ["https://", "http://", "ssh://", "git://"] {
            if let Some(rest) = url.strip_prefix(scheme) {
                let rest = rest.trim_end_matches('/');
                let (host, path) = rest.split_once('/').ok_or_else(|| invalid("missing repository path"))?;
                // Strip credentials if present.
                let host = host.rsplit('@').next().unwrap_or(host);
                if host.is_empty() {
                    return Err(invalid("missing host"));
                }
                if path.trim_end_matches(".git").is_empty() {
                    return Err(invalid("missing repository path"));
                }
                return Ok(Self::Remote(url.to_string()));
            }
        }

        // scp-style: user@host:owner/repo
        if let Some((user_host, path)) = url.split_once(':')
            && let Some((user, host)) = user_host.split_once('@')
        {
            if user.is_empty() || host.is_empty() || path.trim_end_matches(".git").is_empty() {
                return Err(invalid("malformed scp-style reference"));
            }
            return Ok(Self::Remote(url.to_string()));
        }

        if url.contains("://") {
            return Err(invalid("unsupported URL scheme"));
        }

        let path = Path::new(url);
        if path.is_dir() {
            return Ok(Self::Local(path.to_path_buf()));
        }
        Err(invalid("not a repository URL or existing directory"))
    }

    /// Argument to hand to `git clone`.
    pub fn clone_arg(&self) -> String {
        match self {
            Self::Remote(url) => url.clone(),
            Self::Local(path) => path.to_string_lossy().to_string(),
        }
    }

    /// Repository name from the last path segment, e.g. `owner/repo.git` → `repo`.
    pub fn name(&self) -> String {
        let raw = self.clone_arg();
        raw.trim_end_matches('/')
            .trim_end_matches(".git")
            .rsplit(['/', ':'])
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("repo")
            .to_string()
    }
}

/// What collaborators see of a run's working copy.
#[derive(Debug, Clone)]
pub struct WorkspaceRef {
    pub run_id: Uuid,
    pub path: PathBuf,
    pub repo_url: String,
    pub knobs: Knobs,
}

/// A working copy owned by one run. Its root directory is removed on drop.
#[derive(Debug)]
pub struct Workspace {
    reference: WorkspaceRef,
    cleanup_root: Option<PathBuf>,
}

impl Workspace {
    /// Guard `reference`, deleting `root` (which contains the working copy) on drop.
    pub fn new(reference: WorkspaceRef, root: PathBuf) -> Self {
        Self {
            reference,
            cleanup_root: Some(root),
        }
    }

    /// A workspace whose directory outlives the guard.
    pub fn borrowed(reference: WorkspaceRef) -> Self {
        Self {
            reference,
            cleanup_root: None,
        }
    }

    pub fn reference(&self) -> &WorkspaceRef {
        &self.reference
    }

    pub fn path(&self) -> &Path {
        &self.reference.path
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let Some(root) = self.cleanup_root.take() else {
            return;
        };
        if !root.exists() {
            return;
        }
        match std::fs::remove_dir_all(&root) {
            Ok(()) => debug!(
                run_id = %self.reference.run_id,
                path = %root.display(),
                "workspace released"
            ),
            Err(e) => warn!(
                run_id = %self.reference.run_id,
                path = %root.display(),
                error = %e,
                "failed to remove workspace"
            ),
        }
    }
}

/// Acquires a working copy of the target repository for a run.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    async fn acquire(&self, source: &RepoSource, run_id: Uuid, knobs: &Knobs) -> Result<Workspace>;
}

/// Clones the repository into `<work_dir>/<run_id>/<repo_name>` with `git clone`.
pub struct GitCloneProvisioner {
    work_dir: PathBuf,
    depth: u32,
    github_token: Option<String>,
}

impl GitCloneProvisioner {
    pub fn new(work_dir: PathBuf, depth: u32) -> Self {
        Self {
            work_dir,
            depth,
            github_token: std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()),
        }
    }

    /// Inject the token into GitHub HTTPS URLs so private repos clone and push.
    fn authenticated_url(&self, source: &RepoSource) -> String {
        let url = source.clone_arg();
        match (&self.github_token, source) {
            (Some(token), RepoSource::Remote(_)) if url.starts_with("https://github.com/") => url
                .replacen(
                    "https://github.com/",
                    &format!("https://x-access-token:{}@github.com/", token),
                    1,
                ),
            _ => url,
        }
    }
}

#[async_trait]
impl WorkspaceProvisioner for GitCloneProvisioner {
    async fn acquire(&self, source: &RepoSource, run_id: Uuid, knobs: &Knobs) -> Result<Workspace> {
        let run_dir = self.work_dir.join(run_id.to_string());
        tokio::fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create {}", run_dir.display()))?;
        let clone_path = run_dir.join(source.name());

        // Guard before cloning so a failed clone is cleaned up too.
        let workspace = Workspace::new(
            WorkspaceRef {
                run_id,
                path: clone_path.clone(),
                repo_url: source.clone_arg(),
                knobs: knobs.clone(),
            },
            run_dir,
        );

        let mut cmd = tokio::process::Command::new("git");
        cmd.arg("clone");
        if self.depth > 0 && matches!(source, RepoSource::Remote(_)) {
            cmd.args(["--depth", &self.depth.to_string()]);
        }
        cmd.arg(self.authenticated_url(source)).arg(&clone_path);
        cmd.env("GIT_TERMINAL_PROMPT", "0");

        info!(run_id = %run_id, repo = %source.clone_arg(), "cloning repository");
        let output = cmd.output().await.context("Failed to run git clone")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "git clone failed: {}",
                redact(stderr.trim(), self.github_token.as_deref())
            );
        }

        Ok(workspace)
    }
}

/// Hide a secret in text that may reach logs or clients.
pub fn redact(text: &str, secret: Option<&str>) -> String {
    match secret {
        Some(secret) if !secret.is_empty() => text.replace(secret, "***"),
        _ => text.to_string(),
    }
}
