//! HTTP server command: `velo serve`.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use velo::config::VeloConfig;
use velo::gitops::GitCommitter;
use velo::orchestrator::{Collaborators, Healer, HealerSettings};
use velo::sandbox::{CommandTestRunner, SandboxConfig};
use velo::server::{ServerConfig, start_server};
use velo::solver::CommandPatchProposer;
use velo::workspace::GitCloneProvisioner;

/// Wire the default adapters from configuration.
pub fn build_healer(config: &VeloConfig) -> Healer {
    let toml = &config.toml;
    let collaborators = Collaborators {
        provisioner: Arc::new(GitCloneProvisioner::new(
            config.work_dir(),
            toml.run.clone_depth,
        )),
        runner: Arc::new(CommandTestRunner::new(SandboxConfig::from_section(
            &toml.sandbox,
            config.test_cmd(),
        ))),
        proposer: Arc::new(CommandPatchProposer::new(config.solver_cmd(), &toml.solver)),
        committer: Arc::new(GitCommitter::new(toml.git.clone(), config.git_push())),
    };
    Healer::new(collaborators, HealerSettings::from_config(config))
}

pub async fn cmd_serve(
    project_dir: &Path,
    port: Option<u16>,
    host: Option<String>,
    dev: bool,
) -> Result<()> {
    let config = VeloConfig::new(project_dir.to_path_buf())?;
    for warning in config.validate() {
        warn!(%warning, "configuration warning");
    }

    let mut server = ServerConfig::from_config(&config);
    if let Some(port) = port {
        server.port = port;
    }
    if let Some(host) = host {
        server.host = host;
    }
    server.dev_mode = dev;

    let healer = Arc::new(build_healer(&config));
    info!(
        solver = %config.solver_cmd(),
        push = config.git_push(),
        max_iterations = config.max_iterations(),
        "healer ready"
    );
    start_server(server, healer).await
}
