//! Configuration view and validation commands: `velo config`.

use std::path::Path;

use anyhow::{Context, Result};
use velo::config::{VeloConfig, VeloToml};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let velo_dir = project_dir.join(".velo");
    let config_path = velo_dir.join("velo.toml");

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Velo Configuration");
            println!("==================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                VeloToml::load(&config_path)?
            } else {
                println!("No velo.toml found at {}", config_path.display());
                println!("Using default configuration.");
                VeloToml::default()
            };
            println!();
            let rendered =
                toml::to_string_pretty(&toml).context("Failed to render configuration")?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();

            println!("Effective values (with env/CLI overrides):");
            let config = VeloConfig::new(project_dir.to_path_buf())?;
            println!("  max_iterations = {}", config.max_iterations());
            println!("  solver_cmd = \"{}\"", config.solver_cmd());
            match config.test_cmd() {
                Some(cmd) => println!("  test_cmd = \"{}\"", cmd),
                None => println!("  test_cmd = (autodetect)"),
            }
            println!("  git_push = {}", config.git_push());
            println!("  work_dir = {}", config.work_dir().display());
            println!();

            if !config_path.exists() {
                println!("Run 'velo config init' to create a velo.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No velo.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = VeloToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("velo.toml already exists at {}", config_path.display());
                println!("Remove it first to re-initialize.");
                return Ok(());
            }

            std::fs::create_dir_all(&velo_dir)
                .with_context(|| format!("Failed to create {}", velo_dir.display()))?;
            VeloToml::default().save(&config_path)?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
