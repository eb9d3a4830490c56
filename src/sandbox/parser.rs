//! Test-runner output parsing.
//!
//! Recognizes pytest, cargo/rustc and jest output, and falls back to generic
//! `file:line: message` diagnostics (flake8, eslint --format unix, gcc, tsc).

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use velo_common::FailureDetail;

// pytest
static PYTEST_FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^FAILED (?P<file>[^\s:]+)(?:::(?P<test>\S+))?(?: - (?P<msg>.*))?$").unwrap());
static PYTEST_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ERROR (?:collecting )?(?P<file>[^\s:]+)(?:::\S+)?(?: - (?P<msg>.*))?$").unwrap());
static PYTEST_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<file>[^\s:]+\.py):(?P<line>\d+): (?P<msg>\w*(?:Error|Exception)\b.*)$").unwrap());
static PYTEST_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^=+ (?P<body>.*\b(?:passed|failed|error|errors|skipped|no tests ran)\b.*) =+$").unwrap());
static COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?P<n>\d+) (?P<kind>passed|failed|errors?|skipped|total)").unwrap());

// cargo / rustc
static CARGO_RESULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^test result: \w+\. (?P<passed>\d+) passed; (?P<failed>\d+) failed").unwrap()
});
static CARGO_PANIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"panicked at (?:'(?P<old_msg>.*)', )?(?P<file>[^\s:]+\.rs):(?P<line>\d+):\d+:?$").unwrap()
});
static CARGO_TEST_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^---- (?P<test>\S+) stdout ----$").unwrap());
static RUSTC_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^error(?:\[E\d+\])?: (?P<msg>.+)$").unwrap());
static RUSTC_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*--> (?P<file>[^\s:]+):(?P<line>\d+):\d+$").unwrap());

// jest
static JEST_TITLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*● (?P<title>.+)$").unwrap());
static JEST_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\((?P<file>[^\s():]+\.[jt]sx?):(?P<line>\d+):\d+\)").unwrap()
});
static JEST_SUMMARY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^Tests:\s+(?P<body>.+)$").unwrap());

// generic
static GENERIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[\w./\\-]+\.[A-Za-z0-9]{1,5}):(?P<line>\d+)(?::\d+)?:?\s+(?P<msg>\S.*)$").unwrap()
});

/// Failures and counts recovered from runner output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub failures: Vec<FailureDetail>,
    /// Total tests executed, when the runner printed a summary.
    pub tests_run: Option<u32>,
}

pub fn parse_output(output: &str) -> ParsedOutput {
    let lines: Vec<&str> = output.lines().map(|l| l.trim_end()).collect();

    let mut failures = Vec::new();
    failures.extend(parse_pytest(&lines));
    failures.extend(parse_cargo(&lines));
    failures.extend(parse_jest(&lines));
    if failures.is_empty() {
        failures.extend(parse_generic(&lines));
    }

    ParsedOutput {
        failures: dedup(failures),
        tests_run: parse_tests_run(&lines),
    }
}

fn parse_pytest(lines: &[&str]) -> Vec<FailureDetail> {
    // First traceback location per file gives the line number.
    let mut locations: HashMap<&str, (u32, &str)> = HashMap::new();
    for line in lines {
        if let Some(c) = PYTEST_LOCATION.captures(line) {
            let file = c.name("file").map_or("", |m| m.as_str());
            let lineno = c["line"].parse().unwrap_or(0);
            let msg = c.name("msg").map_or("", |m| m.as_str());
            locations.entry(file).or_insert((lineno, msg));
        }
    }

    let mut failures = Vec::new();
    for line in lines {
        let captures = PYTEST_FAILED
            .captures(line)
            .or_else(|| PYTEST_ERROR.captures(line));
        let Some(c) = captures else { continue };
        let file = c["file"].to_string();
        let location = locations.get(file.as_str());
        let message = match (c.name("test"), c.name("msg")) {
            (Some(test), Some(msg)) => format!("{}: {}", test.as_str(), msg.as_str()),
            (None, Some(msg)) => msg.as_str().to_string(),
            (Some(test), None) => match location {
                Some((_, msg)) => format!("{}: {}", test.as_str(), msg),
                None => format!("{} failed", test.as_str()),
            },
            (None, None) => location
                .map(|(_, msg)| msg.to_string())
                .unwrap_or_else(|| "collection error".to_string()),
        };
        failures.push(FailureDetail::new(file, message, location.map(|(l, _)| *l)));
    }
    failures
}

fn parse_cargo(lines: &[&str]) -> Vec<FailureDetail> {
    let mut failures = Vec::new();
    let mut current_test: Option<&str> = None;

    for (i, line) in lines.iter().enumerate() {
        if let Some(c) = CARGO_TEST_HEADER.captures(line) {
            current_test = c.name("test").map(|m| m.as_str());
            continue;
        }
        if let Some(c) = CARGO_PANIC.captures(line) {
            let message = match c.name("old_msg") {
                Some(m) => m.as_str().to_string(),
                // Since Rust 1.73 the message follows on the next line.
                None => lines.get(i + 1).map(|l| l.trim().to_string()).unwrap_or_default(),
            };
            let message = match current_test {
                Some(test) => format!("{}: {}", test, message),
                None => message,
            };
            failures.push(FailureDetail::new(
                &c["file"],
                message,
                c["line"].parse().ok(),
            ));
            continue;
        }
        if let Some(c) = RUSTC_ERROR.captures(line) {
            let msg = &c["msg"];
            if msg.starts_with("could not compile") || msg.starts_with("aborting due to") {
                continue;
            }
            let location = lines[i + 1..]
                .iter()
                .take(4)
                .find_map(|l| RUSTC_LOCATION.captures(l));
            if let Some(loc) = location {
                failures.push(FailureDetail::new(
                    &loc["file"],
                    msg.to_string(),
                    loc["line"].parse().ok(),
                ));
            }
        }
    }
    failures
}

fn parse_jest(lines: &[&str]) -> Vec<FailureDetail> {
    let mut failures = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let Some(c) = JEST_TITLE.captures(line) else { continue };
        let title = c["title"].trim();
        // Location is the first stack frame below the title, before the next title.
        let mut message = None;
        let mut location = None;
        for next in lines[i + 1..].iter().take(40) {
            if JEST_TITLE.is_match(next) {
                break;
            }
            let trimmed = next.trim();
            if message.is_none() && !trimmed.is_empty() && !trimmed.starts_with("at ") {
                message = Some(trimmed.to_string());
            }
            if let Some(loc) = JEST_LOCATION.captures(next)
                && !loc["file"].contains("node_modules")
            {
                location = Some((loc["file"].to_string(), loc["line"].parse().ok()));
                break;
            }
        }
        if let Some((file, line)) = location {
            let message = match message {
                Some(m) => format!("{}: {}", title, m),
                None => title.to_string(),
            };
            failures.push(FailureDetail::new(file, message, line));
        }
    }
    failures
}

fn parse_generic(lines: &[&str]) -> Vec<FailureDetail> {
    lines
        .iter()
        .filter_map(|line| GENERIC.captures(line.trim_start()))
        .map(|c| {
            FailureDetail::new(
                c["file"].trim_start_matches("./"),
                c["msg"].trim().to_string(),
                c["line"].parse().ok(),
            )
        })
        .collect()
}

fn parse_tests_run(lines: &[&str]) -> Option<u32> {
    let mut cargo_total: Option<u32> = None;
    for line in lines {
        if let Some(c) = CARGO_RESULT.captures(line) {
            let passed: u32 = c["passed"].parse().unwrap_or(0);
            let failed: u32 = c["failed"].parse().unwrap_or(0);
            *cargo_total.get_or_insert(0) += passed + failed;
        }
    }
    if cargo_total.is_some() {
        return cargo_total;
    }

    for line in lines.iter().rev() {
        if let Some(c) = JEST_SUMMARY.captures(line) {
            return sum_counts(&c["body"], true);
        }
        if let Some(c) = PYTEST_SUMMARY.captures(line) {
            let body = &c["body"];
            if body.contains("no tests ran") {
                return Some(0);
            }
            return sum_counts(body, false);
        }
    }
    None
}

/// Sum `N passed`, `N failed`, `N error(s)`; a `N total` wins when present.
fn sum_counts(body: &str, prefer_total: bool) -> Option<u32> {
    let mut sum = 0;
    let mut seen = false;
    for c in COUNT.captures_iter(body) {
        let n: u32 = c["n"].parse().unwrap_or(0);
        match &c["kind"] {
            "total" if prefer_total => return Some(n),
            "passed" | "failed" | "error" | "errors" => {
                sum += n;
                seen = true;
            }
            _ => {}
        }
    }
    seen.then_some(sum)
}

fn dedup(failures: Vec<FailureDetail>) -> Vec<FailureDetail> {
    let mut seen = HashSet::new();
    failures
        .into_iter()
        .filter(|f| seen.insert((f.file.clone(), f.line, f.message.clone())))
        .collect()
}
