//! LLM patch proposer.
//!
//! [`PatchProposer`] is the seam the orchestrator calls.
//! [`CommandPatchProposer`] shells out to an LLM CLI (`claude --print` by
//! default) with the failure diagnostics and source excerpts on stdin, and
//! parses a JSON list of whole-file patches from its reply.

mod prompt;

use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use velo_common::{BugType, FailureDetail, Fix, FixStatus};

use crate::config::SolverSection;
use crate::workspace::WorkspaceRef;

pub(crate) use self::prompt::is_contained;
use self::prompt::{SOLVER_SYSTEM_PROMPT, build_prompt, gather_excerpts, parse_response};

/// Tag every agent commit message starts with.
pub const COMMIT_PREFIX: &str = "[AI-AGENT]";

/// A proposed fix plus the full replacement contents of its file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub file: String,
    pub bug_type: BugType,
    pub line_number: Option<u32>,
    pub summary: String,
    pub contents: String,
}

impl Patch {
    /// e.g. `[AI-AGENT] Fix LOGIC error in src/app.py line 12: return the sum`
    pub fn commit_message(&self) -> String {
        let location = match self.line_number {
            Some(line) => format!("{} line {}", self.file, line),
            None => self.file.clone(),
        };
        format!(
            "{} Fix {} error in {}: {}",
            COMMIT_PREFIX,
            self.bug_type.as_str(),
            location,
            self.summary
        )
    }

    /// The Fix record for this patch, resolved as `status`.
    pub fn to_fix(&self, status: FixStatus) -> Fix {
        Fix {
            file: self.file.clone(),
            bug_type: self.bug_type,
            line_number: self.line_number,
            commit_message: self.commit_message(),
            status,
        }
    }
}

/// Proposes file-level patches for a set of test failures. An empty result
/// means the proposer has nothing to offer.
#[async_trait]
pub trait PatchProposer: Send + Sync {
    async fn propose_fixes(
        &self,
        failures: &[FailureDetail],
        workspace: &WorkspaceRef,
    ) -> Result<Vec<Patch>>;
}

pub struct CommandPatchProposer {
    cmd: String,
    args: Vec<String>,
    context_lines: usize,
    max_file_bytes: u64,
}

impl CommandPatchProposer {
    pub fn new(cmd: impl Into<String>, section: &SolverSection) -> Self {
        Self {
            cmd: cmd.into(),
            args: section.args.clone(),
            context_lines: section.context_lines,
            max_file_bytes: section.max_file_bytes,
        }
    }

    async fn call_llm(&self, workspace: &WorkspaceRef, prompt: &str) -> Result<String> {
        let mut args = self.args.clone();
        if let Some(extra) = workspace.knobs.get("solver_args").and_then(|v| v.as_array()) {
            args.extend(extra.iter().filter_map(|v| v.as_str().map(str::to_string)));
        }
        args.push("--append-system-prompt".to_string());
        args.push(SOLVER_SYSTEM_PROMPT.to_string());

        let mut child = Command::new(&self.cmd)
            .args(&args)
            .current_dir(&workspace.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to run solver command '{}'", self.cmd))?;

        // Feed stdin from its own task while stdout and stderr drain, so a
        // CLI that talks before it has read the whole prompt cannot stall us.
        let writer = child.stdin.take().map(|mut stdin| {
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                stdin.write_all(prompt.as_bytes()).await?;
                stdin.shutdown().await
            })
        });

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for solver command")?;
        if let Some(writer) = writer {
            match writer.await.context("Solver stdin writer panicked")? {
                Ok(()) => {}
                // The CLI may exit without reading everything.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!("solver closed stdin early");
                }
                Err(e) => return Err(e).context("Failed to write prompt to solver"),
            }
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Solver command failed ({}): {}", output.status, stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl PatchProposer for CommandPatchProposer {
    async fn propose_fixes(
        &self,
        failures: &[FailureDetail],
        workspace: &WorkspaceRef,
    ) -> Result<Vec<Patch>> {
        let excerpts = gather_excerpts(
            &workspace.path,
            failures,
            self.context_lines,
            self.max_file_bytes,
        );
        let prompt = build_prompt(failures, &excerpts);
        info!(
            run_id = %workspace.run_id,
            failures = failures.len(),
            files = excerpts.len(),
            "requesting patches"
        );

        let response = self.call_llm(workspace, &prompt).await?;
        match parse_response(&response, failures) {
            Ok(patches) => {
                debug!(run_id = %workspace.run_id, patches = patches.len(), "solver replied");
                Ok(patches)
            }
            Err(e) => {
                warn!(
                    run_id = %workspace.run_id,
                    raw = %response.chars().take(500).collect::<String>(),
                    "malformed solver response"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::Knobs;
    use std::path::Path;
    use uuid::Uuid;

    fn workspace(path: &Path) -> WorkspaceRef {
        WorkspaceRef {
            run_id: Uuid::new_v4(),
            path: path.to_path_buf(),
            repo_url: "file:///fixture".into(),
            knobs: Knobs::new(),
        }
    }

    fn patch() -> Patch {
        Patch {
            file: "src/app.py".into(),
            bug_type: BugType::Logic,
            line_number: Some(12),
            summary: "return the sum".into(),
            contents: String::new(),
        }
    }

    #[test]
    fn test_commit_message_format() {
        assert_eq!(
            patch().commit_message(),
            "[AI-AGENT] Fix LOGIC error in src/app.py line 12: return the sum"
        );
        let mut p = patch();
        p.line_number = None;
        p.bug_type = BugType::TypeError;
        assert_eq!(
            p.commit_message(),
            "[AI-AGENT] Fix TYPE_ERROR error in src/app.py: return the sum"
        );
    }

    #[test]
    fn test_to_fix() {
        let fix = patch().to_fix(FixStatus::Failed);
        assert_eq!(fix.file, "src/app.py");
        assert_eq!(fix.status, FixStatus::Failed);
        assert!(fix.commit_message.starts_with(COMMIT_PREFIX));
    }

    /// A stand-in LLM CLI run through `sh`: prints a canned reply.
    fn fake_cli(dir: &Path, reply: &str) -> CommandPatchProposer {
        let script = dir.join("fake-llm.sh");
        std::fs::write(
            &script,
            format!("cat > /dev/null\ncat <<'JSON'\n{}\nJSON\n", reply),
        )
        .unwrap();
        CommandPatchProposer::new(
            "sh",
            &SolverSection {
                args: vec![script.to_string_lossy().to_string()],
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_command_proposer_parses_cli_reply() {
        let dir = tempfile::tempdir().unwrap();
        let proposer = fake_cli(
            dir.path(),
            r#"{"patches": [{"file": "app.py", "bug_type": "SYNTAX", "summary": "close paren", "contents": "print(1)\n"}]}"#,
        );
        let failures = vec![FailureDetail::new("app.py", "SyntaxError", Some(1))];
        let patches = proposer
            .propose_fixes(&failures, &workspace(dir.path()))
            .await
            .unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].bug_type, BugType::Syntax);
        assert_eq!(patches[0].line_number, Some(1));
    }

    #[tokio::test]
    async fn test_command_proposer_malformed_reply_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let proposer = fake_cli(dir.path(), "sorry, no idea");
        let failures = vec![FailureDetail::new("app.py", "boom", None)];
        assert!(
            proposer
                .propose_fixes(&failures, &workspace(dir.path()))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_call_llm_large_prompt_with_chatty_cli() {
        let dir = tempfile::tempdir().unwrap();
        // Fills the stderr pipe before reading stdin.
        let script = dir.path().join("chatty-llm.sh");
        std::fs::write(
            &script,
            "head -c 262144 /dev/zero | tr '\\0' 'x' >&2\nwc -c\n",
        )
        .unwrap();
        let proposer = CommandPatchProposer::new(
            "sh",
            &SolverSection {
                args: vec![script.to_string_lossy().to_string()],
                ..Default::default()
            },
        );
        let prompt = "p".repeat(512 * 1024);

        let reply = tokio::time::timeout(
            std::time::Duration::from_secs(20),
            proposer.call_llm(&workspace(dir.path()), &prompt),
        )
        .await
        .expect("solver call stalled")
        .unwrap();
        assert_eq!(reply.trim(), (512 * 1024).to_string());
    }

    #[tokio::test]
    async fn test_command_proposer_missing_cli_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let proposer = CommandPatchProposer::new("velo-no-such-llm", &SolverSection::default());
        let err = proposer
            .propose_fixes(&[], &workspace(dir.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("velo-no-such-llm"));
    }
}
