//! Integration tests for the velo binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn velo() -> Command {
    let mut cmd = cargo_bin_cmd!("velo");
    for key in [
        "VELO_MAX_ITERATIONS",
        "VELO_SOLVER_CMD",
        "VELO_TEST_CMD",
        "VELO_GIT_PUSH",
        "VELO_SERVER",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

fn git(dir: &Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {:?} failed", args);
}

/// A one-commit repository to heal.
fn create_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("app.py"), "def add(a, b):\n    return a + b\n").unwrap();
    git(dir.path(), &["init", "-q"]);
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "-q", "-m", "initial"]);
    dir
}

/// A project directory whose runs clone into its own work dir.
fn create_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let velo_dir = dir.path().join(".velo");
    fs::create_dir_all(&velo_dir).unwrap();
    let work_dir = dir.path().join("work");
    fs::write(
        velo_dir.join("velo.toml"),
        format!(
            "[run]\nwork_dir = \"{}\"\ncall_timeout_secs = 60\n\n[git]\npush = false\n",
            work_dir.display()
        ),
    )
    .unwrap();
    dir
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_velo_help() {
        velo()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("heal"))
            .stdout(predicate::str::contains("serve"));
    }

    #[test]
    fn test_velo_version() {
        velo().arg("--version").assert().success();
    }

    #[test]
    fn test_heal_requires_team_and_leader() {
        velo()
            .args(["heal", "https://github.com/acme/app"])
            .assert()
            .failure();
    }
}

mod config_commands {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        velo()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No velo.toml found"))
            .stdout(predicate::str::contains("max_iterations = 5"));
    }

    #[test]
    fn test_config_init_then_validate() {
        let dir = TempDir::new().unwrap();
        velo()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));
        assert!(dir.path().join(".velo/velo.toml").exists());

        velo()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".velo")).unwrap();
        fs::write(
            dir.path().join(".velo/velo.toml"),
            "[run]\nmax_iterations = 99\n",
        )
        .unwrap();

        velo()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("run.max_iterations = 99"));
    }

    #[test]
    fn test_config_rejects_malformed_file() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".velo")).unwrap();
        fs::write(dir.path().join(".velo/velo.toml"), "[run\n").unwrap();

        velo()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .failure();
    }
}

mod heal_command {
    use super::*;

    #[test]
    fn test_heal_rejects_invalid_url() {
        let project = create_project();
        velo()
            .current_dir(project.path())
            .args([
                "heal",
                "ftp://example.com/repo",
                "--team",
                "Rift",
                "--leader",
                "Grace",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unsupported URL scheme"));
    }

    #[test]
    fn test_heal_rejects_budget_over_ceiling() {
        let project = create_project();
        let repo = create_repo();
        velo()
            .current_dir(project.path())
            .args(["heal", repo.path().to_str().unwrap()])
            .args(["--team", "Rift", "--leader", "Grace", "--max-iterations", "21"])
            .assert()
            .failure();
    }

    #[test]
    fn test_heal_passing_suite_reports_passed() {
        let project = create_project();
        let repo = create_repo();
        velo()
            .current_dir(project.path())
            .env("VELO_TEST_CMD", "true")
            .args(["heal", repo.path().to_str().unwrap()])
            .args(["--team", "Rift", "--leader", "Grace Hopper"])
            .assert()
            .success()
            .stdout(predicate::str::contains("RIFT_GRACE_HOPPER_AI_Fix"))
            .stdout(predicate::str::contains("[PASS]"))
            .stdout(predicate::str::contains("Run Report"));
    }

    #[test]
    fn test_heal_json_report() {
        let project = create_project();
        let repo = create_repo();
        let output = velo()
            .current_dir(project.path())
            .env("VELO_TEST_CMD", "true")
            .args(["heal", repo.path().to_str().unwrap()])
            .args(["--team", "Rift", "--leader", "Grace", "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());

        let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(report["run_status"], "PASSED");
        assert_eq!(report["branch_name"], "RIFT_GRACE_AI_Fix");
        assert_eq!(report["iteration_count"], 0);
    }

    #[test]
    fn test_heal_broken_solver_exits_nonzero() {
        let project = create_project();
        let repo = create_repo();
        // The solver binary does not exist, so the run errors after the first test pass.
        velo()
            .current_dir(project.path())
            .env("VELO_TEST_CMD", "echo 'app.py:2: assertion failed' && false")
            .env("VELO_SOLVER_CMD", "cat-nothing-velo-missing")
            .args(["heal", repo.path().to_str().unwrap()])
            .args(["--team", "Rift", "--leader", "Grace"])
            .assert()
            .failure();
    }
}
