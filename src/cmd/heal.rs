//! Batch healing command: `velo heal`.
//!
//! Runs in-process by default, or against a `velo serve` instance with
//! `--server`. Live log lines go to stdout as they arrive, followed by the
//! report (human-readable or `--json`).

use std::path::Path;

use anyhow::Result;
use velo::client::{RemoteClient, RemoteOutcome};
use velo::config::VeloConfig;
use velo::events::StreamEvent;
use velo::orchestrator::RunRequest;
use velo_common::{LogEvent, RunReport, RunStatus, short_sha};

use super::serve::build_healer;

pub struct HealArgs {
    pub repo_url: String,
    pub team: String,
    pub leader: String,
    pub max_iterations: Option<u32>,
    pub json: bool,
    pub no_push: bool,
    pub server: Option<String>,
}

/// Returns whether the run ended PASSED.
pub async fn cmd_heal(project_dir: &Path, args: HealArgs) -> Result<bool> {
    let request = RunRequest {
        repo_url: args.repo_url.clone(),
        team_name: args.team.clone(),
        leader_name: args.leader.clone(),
        max_iterations: args.max_iterations,
        knobs: Default::default(),
    };

    if let Some(server) = &args.server {
        return heal_remote(server, &request, args.json).await;
    }

    let config =
        VeloConfig::with_cli_args(project_dir.to_path_buf(), args.max_iterations, args.no_push)?;
    let healer = build_healer(&config);
    let mut handle = healer.start_run(request)?;

    if !args.json {
        println!();
        println!("Healing {} on branch {}", args.repo_url, handle.branch_name);
        println!();
    }

    let mut interrupted = false;
    loop {
        tokio::select! {
            event = handle.events.recv() => match event {
                Some(StreamEvent::Log(log)) if !args.json => print_log(&log),
                Some(event) if event.is_terminal() => break,
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("Interrupted, cancelling run...");
                healer.cancel(handle.run_id);
            }
        }
    }

    let report = match healer.wait(handle.run_id).await {
        Some(report) => report,
        None => anyhow::bail!("Run {} disappeared from the registry", handle.run_id),
    };
    emit_report(&report, args.json)?;
    Ok(report.run_status == RunStatus::Passed)
}

async fn heal_remote(server: &str, request: &RunRequest, json: bool) -> Result<bool> {
    let client = RemoteClient::new(server);
    let outcome = client
        .stream_run(request, |event| {
            if !json && let Some(log) = event.as_log() {
                print_log(log);
            }
        })
        .await?;

    match outcome {
        RemoteOutcome::Finished(report) => {
            emit_report(&report, json)?;
            Ok(report.run_status == RunStatus::Passed)
        }
        RemoteOutcome::Errored { message } => {
            if json {
                println!("{}", serde_json::json!({ "error": message }));
            } else {
                println!();
                println!("Run errored: {}", message);
            }
            Ok(false)
        }
    }
}

fn print_log(log: &LogEvent) {
    println!(
        "{} [{}] {}",
        log.timestamp.format("%H:%M:%S"),
        log.tag.as_str(),
        log.message
    );
}

fn emit_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print_report(report);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    let score = &report.score_breakdown;
    println!();
    println!("Run Report");
    println!("==========");
    println!();
    println!("  Repository:  {}", report.repo_url);
    println!("  Team:        {} ({})", report.team_name, report.leader_name);
    println!("  Branch:      {}", report.branch_name);
    println!("  Status:      {}", report.run_status);
    println!("  CI:          {}", report.ci_status.as_str());
    println!(
        "  Iterations:  {}/{}",
        report.iteration_count, report.max_iterations
    );
    println!("  Failures:    {}", report.total_failures);
    println!("  Fixes:       {}", report.total_fixes);
    println!("  Time:        {}", report.execution_time);
    if let Some(error) = &report.error {
        println!("  Error:       {}", error);
    }
    println!();

    if !report.fixes.is_empty() {
        println!("Fixes:");
        for fix in &report.fixes {
            let line = fix
                .line_number
                .map(|n| format!(":{}", n))
                .unwrap_or_default();
            println!(
                "  {:?} {}{} {}: {}",
                fix.status, fix.file, line, fix.bug_type, fix.commit_message
            );
        }
        println!();
    }

    if !report.timeline.is_empty() {
        println!("Timeline:");
        for entry in &report.timeline {
            let sha = entry.commit_sha.as_deref().map(short_sha).unwrap_or("-");
            println!(
                "  #{} {} {} failure(s), {} fix(es) {}",
                entry.iteration,
                entry.status.as_str(),
                entry.failures_in_run,
                entry.fixes_in_run,
                sha
            );
        }
        println!();
    }

    println!(
        "Score: {:.2} ({}) = base {:.2} + speed {:.2} - penalty {:.2}",
        score.final_score, score.grade, score.base, score.speed_bonus, score.efficiency_penalty
    );
    println!();
}
