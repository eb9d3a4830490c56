use serde::{Deserialize, Serialize};

use crate::models::CiStatus;

/// Tunables for the scoring model. Loaded from the `[scoring]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub base_score: f64,
    pub max_speed_bonus: f64,
    /// Elapsed seconds at or below which the full speed bonus is awarded.
    pub fast_threshold_secs: f64,
    /// Elapsed seconds at which the speed bonus reaches zero.
    pub slow_threshold_secs: f64,
    pub penalty_per_iteration: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base_score: 100.0,
            max_speed_bonus: 10.0,
            fast_threshold_secs: 300.0,
            slow_threshold_secs: 600.0,
            penalty_per_iteration: 2.0,
        }
    }
}

impl ScoringConfig {
    /// Return a list of warnings about suspicious values.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.slow_threshold_secs < self.fast_threshold_secs {
            warnings.push(format!(
                "scoring.slow_threshold_secs ({}) is below fast_threshold_secs ({}); the speed bonus drops to zero past the fast threshold",
                self.slow_threshold_secs, self.fast_threshold_secs
            ));
        }
        if self.max_speed_bonus < 0.0 || self.penalty_per_iteration < 0.0 || self.base_score < 0.0 {
            warnings.push("scoring values should not be negative".to_string());
        }
        warnings
    }
}

/// The stored report fields the score is a function of.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreInputs {
    pub ci_status: CiStatus,
    pub total_failures: u32,
    pub total_fixes: u32,
    pub iteration_count: u32,
    pub execution_time_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub base: f64,
    pub speed_bonus: f64,
    pub efficiency_penalty: f64,
    pub final_score: f64,
    pub grade: String,
}

impl ScoreBreakdown {
    pub fn compute(inputs: &ScoreInputs, config: &ScoringConfig) -> Self {
        let base = round2(base_score(inputs, config));
        let speed_bonus = round2(speed_bonus(inputs.execution_time_secs, config));
        let efficiency_penalty = round2(
            config.penalty_per_iteration * inputs.iteration_count.saturating_sub(1) as f64,
        );
        let final_score = round2((base + speed_bonus - efficiency_penalty).max(0.0));
        Self {
            base,
            speed_bonus,
            efficiency_penalty,
            final_score,
            grade: grade(final_score).to_string(),
        }
    }
}

fn base_score(inputs: &ScoreInputs, config: &ScoringConfig) -> f64 {
    if inputs.ci_status == CiStatus::Passed {
        return config.base_score;
    }
    if inputs.total_failures == 0 {
        return 0.0;
    }
    let ratio = inputs.total_fixes as f64 / inputs.total_failures as f64;
    (config.base_score * ratio).min(config.base_score)
}

/// Full bonus up to the fast threshold, linear decay to zero at the slow one.
fn speed_bonus(elapsed_secs: f64, config: &ScoringConfig) -> f64 {
    let elapsed = elapsed_secs.max(0.0);
    if elapsed <= config.fast_threshold_secs {
        return config.max_speed_bonus.max(0.0);
    }
    let window = config.slow_threshold_secs - config.fast_threshold_secs;
    if window <= 0.0 || elapsed >= config.slow_threshold_secs {
        return 0.0;
    }
    let remaining = (config.slow_threshold_secs - elapsed) / window;
    (config.max_speed_bonus * remaining).max(0.0)
}

/// Letter grade shown next to the score ring.
pub fn grade(final_score: f64) -> &'static str {
    if final_score >= 180.0 {
        "S"
    } else if final_score >= 150.0 {
        "A+"
    } else if final_score >= 120.0 {
        "A"
    } else if final_score >= 90.0 {
        "B"
    } else {
        "C"
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
