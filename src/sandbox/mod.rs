//! Sandbox test runner.
//!
//! [`TestRunner`] is the seam the orchestrator calls; [`CommandTestRunner`]
//! runs the project's test command on the host or inside a throwaway
//! `docker run` container and parses its output.

pub mod parser;

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{debug, info};
use velo_common::{FailureDetail, TestResult};

use crate::config::SandboxSection;
use crate::workspace::WorkspaceRef;

use self::parser::parse_output;

/// Exit code shells use for "command not found".
const EXIT_NOT_FOUND: i32 = 127;

/// Lines of raw output kept when a failing run prints nothing parseable.
const TAIL_LINES: usize = 20;

/// Runs a workspace's test suite and reports structured results.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_tests(&self, workspace: &WorkspaceRef) -> Result<TestResult>;
}

/// Container and command settings for [`CommandTestRunner`].
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub test_cmd: Option<String>,
    pub image: Option<String>,
    pub memory: String,
    pub cpus: f64,
    pub no_network: bool,
    pub volumes: HashMap<String, String>,
    pub env: HashMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::from_section(&SandboxSection::default(), None)
    }
}

impl SandboxConfig {
    /// Build from the `[sandbox]` section; `test_cmd` overrides the file value.
    pub fn from_section(section: &SandboxSection, test_cmd: Option<String>) -> Self {
        Self {
            test_cmd: test_cmd.or_else(|| section.test_cmd.clone()),
            image: section.image.clone(),
            memory: section.memory.clone(),
            cpus: section.cpus,
            no_network: section.no_network,
            volumes: section.volumes.clone(),
            env: section.env.clone(),
        }
    }
}

/// Pick a test command from the files present in the project root.
pub fn detect_test_command(project: &Path) -> Option<String> {
    let has = |name: &str| project.join(name).exists();
    if has("Cargo.toml") {
        Some("cargo test --color never".to_string())
    } else if has("package.json") {
        Some("CI=true npm test --silent".to_string())
    } else if has("pyproject.toml")
        || has("setup.py")
        || has("setup.cfg")
        || has("pytest.ini")
        || has("tox.ini")
        || has("requirements.txt")
    {
        Some("python -m pytest -q -rfE --color=no".to_string())
    } else if has("go.mod") {
        Some("go test ./...".to_string())
    } else if has("Makefile") {
        Some("make test".to_string())
    } else {
        None
    }
}

pub struct CommandTestRunner {
    config: SandboxConfig,
}

impl CommandTestRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn test_command(&self, workspace: &WorkspaceRef) -> Result<String> {
        let knob = workspace
            .knobs
            .get("test_cmd")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        knob.or_else(|| self.config.test_cmd.clone())
            .or_else(|| detect_test_command(&workspace.path))
            .context("No test command configured and none could be detected")
    }

    /// The program and arguments to execute for `test_cmd`.
    fn build_command(&self, workspace: &WorkspaceRef, test_cmd: &str) -> (String, Vec<String>) {
        let Some(ref image) = self.config.image else {
            return (
                "sh".to_string(),
                vec!["-c".to_string(), test_cmd.to_string()],
            );
        };

        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:/workspace", workspace.path.display()),
            "-w".to_string(),
            "/workspace".to_string(),
            "--memory".to_string(),
            self.config.memory.clone(),
            "--cpus".to_string(),
            self.config.cpus.to_string(),
        ];
        if self.config.no_network {
            args.extend(["--network".to_string(), "none".to_string()]);
        }
        let mut volumes: Vec<_> = self.config.volumes.iter().collect();
        volumes.sort();
        for (target, source) in volumes {
            args.push("-v".to_string());
            args.push(format!("{}:{}", source, target));
        }
        let mut env: Vec<_> = self.config.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(image.clone());
        args.extend(["sh".to_string(), "-c".to_string(), test_cmd.to_string()]);
        ("docker".to_string(), args)
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run_tests(&self, workspace: &WorkspaceRef) -> Result<TestResult> {
        let test_cmd = self.test_command(workspace)?;
        let (program, args) = self.build_command(workspace, &test_cmd);
        info!(run_id = %workspace.run_id, cmd = %test_cmd, sandboxed = self.config.image.is_some(), "running tests");

        let started = Instant::now();
        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args)
            .current_dir(&workspace.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.config.image.is_none() {
            cmd.envs(&self.config.env);
        }
        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", program))?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{}\n{}", stdout, stderr);
        let code = output.status.code();

        if code == Some(EXIT_NOT_FOUND) {
            bail!("Test command not found: {}", stderr.trim());
        }
        if code.is_none() {
            bail!("Test process terminated by signal");
        }

        let parsed = parse_output(&combined);
        debug!(
            run_id = %workspace.run_id,
            exit_code = ?code,
            failures = parsed.failures.len(),
            tests_run = ?parsed.tests_run,
            "test output parsed"
        );

        // The exit status decides the verdict; `file:line:` lines in a green
        // run are warnings.
        let mut result = if output.status.success() {
            if !parsed.failures.is_empty() {
                debug!(
                    run_id = %workspace.run_id,
                    diagnostics = parsed.failures.len(),
                    "ignoring diagnostics from a passing run"
                );
            }
            TestResult::pass(parsed.tests_run)
        } else {
            let mut failures = parsed.failures;
            if failures.is_empty() {
                failures.push(FailureDetail::new("<unknown>", tail(&combined, TAIL_LINES), None));
            }
            let mut result = TestResult::fail(failures);
            result.tests_run = parsed.tests_run;
            result
        };
        result.duration_ms = duration_ms;
        Ok(result)
    }
}

fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    let joined = lines[start..].join("\n");
    if joined.is_empty() {
        "test command failed without output".to_string()
    } else {
        joined
    }
}
