//! Layered configuration for Velo.
//!
//! Settings are read from `.velo/velo.toml`, then overridden by environment
//! variables, then by CLI flags.
//!
//! ```toml
//! [run]
//! max_iterations = 5
//! call_timeout_secs = 1800
//! work_dir = "/var/tmp/velo"
//!
//! [scoring]
//! max_speed_bonus = 10.0
//! fast_threshold_secs = 300.0
//!
//! [sandbox]
//! test_cmd = "python -m pytest -q"
//! image = "python:3.12-slim"
//! memory = "4g"
//!
//! [solver]
//! cmd = "claude"
//! args = ["--print"]
//!
//! [git]
//! push = true
//! remote = "origin"
//!
//! [server]
//! port = 3141
//! keepalive_secs = 15
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use velo_common::ScoringConfig;

/// Hard upper bound on the retry budget a run may request.
pub const MAX_ITERATIONS_CEILING: u32 = 20;

pub const ENV_MAX_ITERATIONS: &str = "VELO_MAX_ITERATIONS";
pub const ENV_SOLVER_CMD: &str = "VELO_SOLVER_CMD";
pub const ENV_TEST_CMD: &str = "VELO_TEST_CMD";
pub const ENV_GIT_PUSH: &str = "VELO_GIT_PUSH";

/// Retry loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSection {
    /// Default retry budget (fix cycles) per run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Timeout applied to every collaborator call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Where workspaces are cloned (default: system temp dir)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    /// Capacity of each run's event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Clone depth for remote repositories (0 = full history)
    #[serde(default = "default_clone_depth")]
    pub clone_depth: u32,
    /// Finished runs kept in the registry; older ones are evicted
    #[serde(default = "default_retain_finished")]
    pub retain_finished: usize,
}

fn default_max_iterations() -> u32 {
    5
}

fn default_call_timeout_secs() -> u64 {
    1800
}

fn default_event_buffer() -> usize {
    256
}

fn default_clone_depth() -> u32 {
    50
}

fn default_retain_finished() -> usize {
    100
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            call_timeout_secs: default_call_timeout_secs(),
            work_dir: None,
            event_buffer: default_event_buffer(),
            clone_depth: default_clone_depth(),
            retain_finished: default_retain_finished(),
        }
    }
}

/// Test runner settings. Container knobs apply only when `image` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    /// Explicit test command; autodetected from the workspace when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// Disable container networking
    #[serde(default)]
    pub no_network: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub volumes: HashMap<String, String>,
}

fn default_memory() -> String {
    "4g".to_string()
}

fn default_cpus() -> f64 {
    2.0
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            test_cmd: None,
            image: None,
            memory: default_memory(),
            cpus: default_cpus(),
            no_network: false,
            env: HashMap::new(),
            volumes: HashMap::new(),
        }
    }
}

/// LLM CLI settings for the patch proposer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverSection {
    #[serde(default = "default_solver_cmd")]
    pub cmd: String,
    #[serde(default = "default_solver_args")]
    pub args: Vec<String>,
    /// Lines of source shown on each side of a failing line
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,
    /// Files larger than this are excerpted rather than sent whole
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_solver_cmd() -> String {
    "claude".to_string()
}

fn default_solver_args() -> Vec<String> {
    vec!["--print".to_string()]
}

fn default_context_lines() -> usize {
    20
}

fn default_max_file_bytes() -> u64 {
    64 * 1024
}

impl Default for SolverSection {
    fn default() -> Self {
        Self {
            cmd: default_solver_cmd(),
            args: default_solver_args(),
            context_lines: default_context_lines(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

/// GitOps committer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSection {
    #[serde(default = "default_push")]
    pub push: bool,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_push() -> bool {
    true
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_author_name() -> String {
    "velo-agent".to_string()
}

fn default_author_email() -> String {
    "velo-agent@localhost".to_string()
}

impl Default for GitSection {
    fn default() -> Self {
        Self {
            push: default_push(),
            remote: default_remote(),
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds between SSE keepalive frames
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

fn default_keepalive_secs() -> u64 {
    15
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

/// The complete velo.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VeloToml {
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub solver: SolverSection,
    #[serde(default)]
    pub git: GitSection,
    #[serde(default)]
    pub server: ServerSection,
}

impl VeloToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse velo.toml")
    }

    /// Load `velo.toml` from `velo_dir`, or defaults if it doesn't exist.
    pub fn load_or_default(velo_dir: &Path) -> Result<Self> {
        let config_path = velo_dir.join("velo.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize velo.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.run.max_iterations == 0 || self.run.max_iterations > MAX_ITERATIONS_CEILING {
            warnings.push(format!(
                "run.max_iterations = {} is outside 1..={}; it will be clamped",
                self.run.max_iterations, MAX_ITERATIONS_CEILING
            ));
        }
        if self.run.call_timeout_secs == 0 {
            warnings.push("run.call_timeout_secs = 0 makes every collaborator call time out".into());
        }
        if self.run.event_buffer < 16 {
            warnings.push(format!(
                "run.event_buffer = {} is small; slow stream clients will miss events",
                self.run.event_buffer
            ));
        }
        if self.run.retain_finished == 0 {
            warnings.push(
                "run.retain_finished = 0 drops each report once another run starts".into(),
            );
        }
        if self.sandbox.image.is_some() && self.sandbox.cpus <= 0.0 {
            warnings.push(format!("sandbox.cpus = {} must be positive", self.sandbox.cpus));
        }
        if self.solver.cmd.trim().is_empty() {
            warnings.push("solver.cmd is empty".into());
        }
        if self.server.keepalive_secs == 0 {
            warnings.push("server.keepalive_secs = 0 is treated as 1".into());
        }
        warnings.extend(self.scoring.validate());

        warnings
    }
}

/// Runtime configuration merged from file, environment and CLI.
#[derive(Debug, Clone)]
pub struct VeloConfig {
    pub project_dir: PathBuf,
    pub velo_dir: PathBuf,
    pub toml: VeloToml,
    /// CLI override for the retry budget
    pub cli_max_iterations: Option<u32>,
    /// CLI override for the push toggle
    pub cli_no_push: bool,
}

impl VeloConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let velo_dir = project_dir.join(".velo");
        let toml = VeloToml::load_or_default(&velo_dir)?;

        Ok(Self {
            project_dir,
            velo_dir,
            toml,
            cli_max_iterations: None,
            cli_no_push: false,
        })
    }

    pub fn with_cli_args(
        project_dir: PathBuf,
        max_iterations: Option<u32>,
        no_push: bool,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.cli_max_iterations = max_iterations;
        config.cli_no_push = no_push;
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.velo_dir.join("velo.toml")
    }

    /// Default retry budget (CLI → env → file), clamped to the ceiling.
    pub fn max_iterations(&self) -> u32 {
        let raw = self
            .cli_max_iterations
            .or_else(|| env_parse(ENV_MAX_ITERATIONS))
            .unwrap_or(self.toml.run.max_iterations);
        raw.clamp(1, MAX_ITERATIONS_CEILING)
    }

    /// LLM CLI command (env → file).
    pub fn solver_cmd(&self) -> String {
        std::env::var(ENV_SOLVER_CMD)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.toml.solver.cmd.clone())
    }

    /// Explicit test command (env → file), `None` means autodetect.
    pub fn test_cmd(&self) -> Option<String> {
        std::env::var(ENV_TEST_CMD)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.toml.sandbox.test_cmd.clone())
    }

    /// Whether the committer pushes (CLI → env → file).
    pub fn git_push(&self) -> bool {
        if self.cli_no_push {
            return false;
        }
        if let Ok(val) = std::env::var(ENV_GIT_PUSH) {
            return !matches!(val.to_lowercase().as_str(), "0" | "false" | "no" | "off");
        }
        self.toml.git.push
    }

    pub fn work_dir(&self) -> PathBuf {
        self.toml
            .run
            .work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("velo"))
    }

    pub fn call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.toml.run.call_timeout_secs)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
