//! GitOps committer: writes patches to the working copy, commits them on the
//! healing branch and pushes it.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use git2::{BranchType, Repository, Signature};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::GitSection;
use crate::solver::{COMMIT_PREFIX, Patch};
use crate::workspace::{WorkspaceRef, redact};

/// Result of one apply-and-push call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub commit_sha: String,
    pub pushed: bool,
}

/// Committer faults. Push and auth failures are kept apart from local ones.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("{0}")]
    Commit(#[source] anyhow::Error),

    #[error("{0}")]
    Push(#[source] anyhow::Error),
}

#[async_trait]
pub trait GitOpsCommitter: Send + Sync {
    async fn apply_and_push(
        &self,
        patches: &[Patch],
        workspace: &WorkspaceRef,
        branch_name: &str,
    ) -> Result<CommitOutcome, CommitError>;
}

/// Commits with git2 and pushes with the `git` CLI so credential helpers apply.
pub struct GitCommitter {
    settings: GitSection,
    push: bool,
}

impl GitCommitter {
    pub fn new(settings: GitSection, push: bool) -> Self {
        Self { settings, push }
    }

    async fn push_branch(&self, path: &Path, branch_name: &str) -> Result<()> {
        let output = tokio::process::Command::new("git")
            .args(["push", "-u", &self.settings.remote, branch_name])
            .current_dir(path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run git push")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let token = std::env::var("GITHUB_TOKEN").ok();
            bail!(
                "git push {} {} failed: {}",
                self.settings.remote,
                branch_name,
                redact(stderr.trim(), token.as_deref())
            );
        }
        Ok(())
    }
}

#[async_trait]
impl GitOpsCommitter for GitCommitter {
    async fn apply_and_push(
        &self,
        patches: &[Patch],
        workspace: &WorkspaceRef,
        branch_name: &str,
    ) -> Result<CommitOutcome, CommitError> {
        let path = workspace.path.clone();
        let branch = branch_name.to_string();
        let owned: Vec<Patch> = patches.to_vec();
        let (name, email) = (
            self.settings.author_name.clone(),
            self.settings.author_email.clone(),
        );

        let commit_sha = tokio::task::spawn_blocking(move || {
            commit_patches(&path, &branch, &owned, &name, &email)
        })
        .await
        .map_err(|e| CommitError::Commit(anyhow::anyhow!("commit task failed: {}", e)))?
        .map_err(CommitError::Commit)?;

        info!(
            run_id = %workspace.run_id,
            branch = branch_name,
            sha = %commit_sha,
            files = patches.len(),
            "patches committed"
        );

        if !self.push {
            return Ok(CommitOutcome {
                commit_sha,
                pushed: false,
            });
        }

        self.push_branch(&workspace.path, branch_name)
            .await
            .map_err(CommitError::Push)?;
        Ok(CommitOutcome {
            commit_sha,
            pushed: true,
        })
    }
}

/// Check out `branch_name` (creating it from HEAD), write every patch, and
/// commit. Returns the new commit sha.
pub fn commit_patches(
    repo_path: &Path,
    branch_name: &str,
    patches: &[Patch],
    author_name: &str,
    author_email: &str,
) -> Result<String> {
    if patches.is_empty() {
        bail!("No patches to commit");
    }
    let repo = Repository::open(repo_path).context("Failed to open git repository")?;
    checkout_branch(&repo, branch_name)?;

    let mut index = repo.index()?;
    for patch in patches {
        let relative = resolve_in_workspace(repo_path, &patch.file)?;
        let target = repo_path.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&target, &patch.contents)
            .with_context(|| format!("Failed to write {}", target.display()))?;
        index
            .add_path(&relative)
            .with_context(|| format!("Failed to stage {}", relative.display()))?;
    }
    index.write()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let sig = Signature::now(author_name, author_email)?;
    let message = commit_message(patches);

    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    if let Some(ref p) = parent
        && p.tree_id() == tree_id
    {
        warn!(branch = branch_name, "patches leave the tree unchanged");
    }
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let oid = repo
        .commit(Some("HEAD"), &sig, &sig, &message, &tree, &parents)
        .context("Failed to create commit")?;
    Ok(oid.to_string())
}

fn checkout_branch(repo: &Repository, branch_name: &str) -> Result<()> {
    let refname = format!("refs/heads/{}", branch_name);
    if repo.find_branch(branch_name, BranchType::Local).is_err() {
        // Unborn HEAD: pointing HEAD at the new ref is enough.
        if let Ok(head) = repo.head().and_then(|h| h.peel_to_commit()) {
            repo.branch(branch_name, &head, false)
                .with_context(|| format!("Failed to create branch {}", branch_name))?;
        }
    }
    let on_branch = repo
        .head()
        .ok()
        .and_then(|h| h.name().map(|n| n == refname))
        .unwrap_or(false);
    if !on_branch {
        if repo.find_branch(branch_name, BranchType::Local).is_ok() {
            let obj = repo.revparse_single(&refname)?;
            repo.checkout_tree(&obj, None)
                .with_context(|| format!("Failed to check out {}", branch_name))?;
        }
        repo.set_head(&refname)?;
    }
    Ok(())
}

/// Validate `file` as a path inside `root` and return it relative to `root`.
fn resolve_in_workspace(root: &Path, file: &str) -> Result<PathBuf> {
    if !crate::solver::is_contained(file) {
        bail!("Refusing to write outside the workspace: {}", file);
    }
    let relative: PathBuf = Path::new(file)
        .components()
        .filter(|c| matches!(c, std::path::Component::Normal(_)))
        .collect();
    if relative.starts_with(".git") {
        bail!("Refusing to write into .git: {}", file);
    }
    // Reject symlinked parents that point out of the workspace.
    if let Some(parent) = root.join(&relative).parent()
        && parent.exists()
    {
        let canonical_root = root.canonicalize()?;
        let canonical_parent = parent.canonicalize()?;
        if !canonical_parent.starts_with(&canonical_root) {
            bail!("Refusing to write through a link outside the workspace: {}", file);
        }
    }
    Ok(relative)
}

fn commit_message(patches: &[Patch]) -> String {
    match patches {
        [single] => single.commit_message(),
        many => {
            let mut message = format!("{} Apply {} fixes\n\n", COMMIT_PREFIX, many.len());
            for p in many {
                message.push_str(&format!("- {}\n", p.commit_message()));
            }
            message
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::Knobs;
    use uuid::Uuid;
    use velo_common::BugType;

    fn init_repo(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        std::fs::write(dir.join("app.py"), "def add(a, b):\n    return a - b\n").unwrap();
        {
            let mut index = repo.index().unwrap();
            index
                .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
                .unwrap();
            index.write().unwrap();
            let tree_id = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            let sig = Signature::now("test", "test@localhost").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
                .unwrap();
        }
        repo
    }

    fn patch(file: &str, contents: &str) -> Patch {
        Patch {
            file: file.into(),
            bug_type: BugType::Logic,
            line_number: Some(2),
            summary: "add instead of subtract".into(),
            contents: contents.into(),
        }
    }

    fn workspace(path: &Path) -> WorkspaceRef {
        WorkspaceRef {
            run_id: Uuid::new_v4(),
            path: path.to_path_buf(),
            repo_url: "file:///fixture".into(),
            knobs: Knobs::new(),
        }
    }

    #[test]
    fn test_commit_patches_creates_branch_and_commit() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());

        let sha = commit_patches(
            dir.path(),
            "TEAM_LEAD_AI_Fix",
            &[patch("app.py", "def add(a, b):\n    return a + b\n")],
            "velo-agent",
            "velo-agent@localhost",
        )
        .unwrap();

        let head = repo.head().unwrap();
        assert_eq!(head.name(), Some("refs/heads/TEAM_LEAD_AI_Fix"));
        let commit = head.peel_to_commit().unwrap();
        assert_eq!(commit.id().to_string(), sha);
        assert!(commit.message().unwrap().starts_with("[AI-AGENT] Fix LOGIC error in app.py line 2"));
        assert_eq!(commit.parent_count(), 1);
        let written = std::fs::read_to_string(dir.path().join("app.py")).unwrap();
        assert!(written.contains("a + b"));
    }

    #[test]
    fn test_commit_patches_twice_stays_on_branch() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());

        let first = commit_patches(dir.path(), "B_AI_Fix", &[patch("app.py", "v1\n")], "a", "a@x").unwrap();
        let second = commit_patches(
            dir.path(),
            "B_AI_Fix",
            &[patch("app.py", "v2\n"), patch("lib/new.py", "x = 1\n")],
            "a",
            "a@x",
        )
        .unwrap();

        let commit = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(commit.id().to_string(), second);
        assert_eq!(commit.parent(0).unwrap().id().to_string(), first);
        assert!(commit.message().unwrap().starts_with("[AI-AGENT] Apply 2 fixes"));
        assert!(dir.path().join("lib/new.py").exists());
    }

    #[test]
    fn test_commit_patches_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        for file in ["../evil.py", "/etc/passwd", ".git/config"] {
            let err = commit_patches(dir.path(), "X_AI_Fix", &[patch(file, "x")], "a", "a@x")
                .unwrap_err();
            assert!(err.to_string().contains("Refusing"), "{}: {}", file, err);
        }
    }

    #[test]
    fn test_commit_patches_requires_patches() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        assert!(commit_patches(dir.path(), "X_AI_Fix", &[], "a", "a@x").is_err());
    }

    #[tokio::test]
    async fn test_apply_without_push() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let committer = GitCommitter::new(GitSection::default(), false);
        let outcome = committer
            .apply_and_push(&[patch("app.py", "fixed\n")], &workspace(dir.path()), "T_L_AI_Fix")
            .await
            .unwrap();
        assert!(!outcome.pushed);
        assert_eq!(outcome.commit_sha.len(), 40);
    }

    #[tokio::test]
    async fn test_apply_push_to_bare_remote() {
        let remote = tempfile::tempdir().unwrap();
        Repository::init_bare(remote.path()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        repo.remote("origin", &remote.path().to_string_lossy()).unwrap();

        let committer = GitCommitter::new(GitSection::default(), true);
        let outcome = committer
            .apply_and_push(&[patch("app.py", "fixed\n")], &workspace(dir.path()), "T_L_AI_Fix")
            .await
            .unwrap();
        assert!(outcome.pushed);

        let bare = Repository::open_bare(remote.path()).unwrap();
        let pushed = bare.find_branch("T_L_AI_Fix", BranchType::Local).unwrap();
        assert_eq!(
            pushed.get().peel_to_commit().unwrap().id().to_string(),
            outcome.commit_sha
        );
    }

    #[tokio::test]
    async fn test_push_failure_is_push_error() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        repo.remote("origin", "/nonexistent/velo/remote.git").unwrap();

        let committer = GitCommitter::new(GitSection::default(), true);
        let err = committer
            .apply_and_push(&[patch("app.py", "fixed\n")], &workspace(dir.path()), "T_L_AI_Fix")
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::Push(_)));
    }
}
