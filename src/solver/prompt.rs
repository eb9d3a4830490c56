use std::collections::BTreeMap;
use std::path::{Component, Path};

use anyhow::{Context, Result};
use serde::Deserialize;
use velo_common::{BugType, FailureDetail};

use super::Patch;

pub(crate) const SOLVER_SYSTEM_PROMPT: &str = r#"You are an autonomous CI repair agent. Failing test diagnostics and the relevant source files follow. Propose the smallest set of file edits that makes the tests pass.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "patches": [
    {
      "file": "relative/path/from/repo/root.py",
      "bug_type": "SYNTAX" | "LINTING" | "TYPE_ERROR" | "IMPORT" | "LOGIC" | "INDENTATION",
      "line_number": 12,
      "summary": "One line describing the fix",
      "contents": "The COMPLETE new contents of the file"
    }
  ]
}

Rules:
- One patch per file. `contents` replaces the whole file, so include every unchanged line.
- Fix the code under test; never weaken or delete tests to make them pass.
- Paths are relative to the repository root and must not leave it.
- If you cannot determine a fix, return {"patches": []}.
"#;

/// Source shown to the model for one file.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Excerpt {
    Whole(String),
    /// `(first_line, text)` windows around failing lines, 1-based.
    Windows(Vec<(usize, String)>),
}

/// Read each failing file once, whole if small enough, otherwise the
/// windows around its failing lines. Paths outside `root` or missing on disk
/// are skipped.
pub(crate) fn gather_excerpts(
    root: &Path,
    failures: &[FailureDetail],
    context_lines: usize,
    max_file_bytes: u64,
) -> BTreeMap<String, Excerpt> {
    let mut lines_by_file: BTreeMap<&str, Vec<u32>> = BTreeMap::new();
    for f in failures {
        let entry = lines_by_file.entry(f.file.as_str()).or_default();
        if let Some(line) = f.line {
            entry.push(line);
        }
    }

    let mut excerpts = BTreeMap::new();
    for (file, lines) in lines_by_file {
        if !is_contained(file) {
            continue;
        }
        let path = root.join(file);
        let Ok(meta) = std::fs::metadata(&path) else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let excerpt = if meta.len() <= max_file_bytes || lines.is_empty() {
            Excerpt::Whole(truncate_bytes(&content, max_file_bytes as usize))
        } else {
            Excerpt::Windows(windows(&content, &lines, context_lines))
        };
        excerpts.insert(file.to_string(), excerpt);
    }
    excerpts
}

/// True when `file` is a relative path that stays inside its root.
pub(crate) fn is_contained(file: &str) -> bool {
    let path = Path::new(file);
    !file.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn windows(content: &str, lines: &[u32], context: usize) -> Vec<(usize, String)> {
    let all: Vec<&str> = content.lines().collect();
    let mut ranges: Vec<(usize, usize)> = lines
        .iter()
        .map(|&l| {
            let l = (l as usize).clamp(1, all.len().max(1));
            (l.saturating_sub(context).max(1), (l + context).min(all.len()))
        })
        .collect();
    ranges.sort();

    // Merge overlapping windows.
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start <= last.1 + 1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }

    merged
        .into_iter()
        .filter(|(start, end)| start <= end)
        .map(|(start, end)| (start, all[start - 1..end].join("\n")))
        .collect()
}

fn truncate_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (truncated)", &s[..end])
}

pub(crate) fn build_prompt(failures: &[FailureDetail], excerpts: &BTreeMap<String, Excerpt>) -> String {
    let mut prompt = String::from("## Failing tests\n");
    for (i, f) in failures.iter().enumerate() {
        match f.line {
            Some(line) => prompt.push_str(&format!("{}. {}:{}: {}\n", i + 1, f.file, line, f.message)),
            None => prompt.push_str(&format!("{}. {}: {}\n", i + 1, f.file, f.message)),
        }
    }

    prompt.push_str("\n## Source\n");
    if excerpts.is_empty() {
        prompt.push_str("(no source files could be located for these failures)\n");
    }
    for (file, excerpt) in excerpts {
        match excerpt {
            Excerpt::Whole(content) => {
                prompt.push_str(&format!("\n### {}\n```\n{}\n```\n", file, content));
            }
            Excerpt::Windows(windows) => {
                prompt.push_str(&format!("\n### {} (excerpts)\n", file));
                for (start, text) in windows {
                    prompt.push_str(&format!("From line {}:\n```\n{}\n```\n", start, text));
                }
            }
        }
    }
    prompt.push_str("\nRespond with JSON only.");
    prompt
}

#[derive(Debug, Deserialize)]
struct SolverResponse {
    patches: Vec<RawPatch>,
}

#[derive(Debug, Deserialize)]
struct RawPatch {
    file: String,
    #[serde(default)]
    bug_type: Option<String>,
    #[serde(default)]
    line_number: Option<u32>,
    #[serde(default)]
    summary: Option<String>,
    contents: String,
}

/// Parse the model's reply into patches, tolerating prose or code fences
/// around the JSON object. A missing bug type is classified from the
/// matching failure message.
pub(crate) fn parse_response(raw: &str, failures: &[FailureDetail]) -> Result<Vec<Patch>> {
    let cleaned = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => raw,
    };
    let response: SolverResponse =
        serde_json::from_str(cleaned).context("Failed to parse solver response as JSON")?;

    response
        .patches
        .into_iter()
        .map(|p| {
            let file = p.file.trim().trim_start_matches("./").to_string();
            if !is_contained(&file) {
                anyhow::bail!("Solver proposed a path outside the repository: {}", p.file);
            }
            let failure = failures.iter().find(|f| f.file == file);
            let bug_type = match p.bug_type {
                Some(ref t) => BugType::parse_lenient(t),
                None => failure
                    .map(|f| BugType::classify(&f.message))
                    .unwrap_or(BugType::Unknown),
            };
            let line_number = p.line_number.or_else(|| failure.and_then(|f| f.line));
            let summary = p
                .summary
                .map(|s| s.lines().next().unwrap_or("").trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("repair {}", file));
            Ok(Patch {
                file,
                bug_type,
                line_number,
                summary,
                contents: p.contents,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(file: &str, message: &str, line: Option<u32>) -> FailureDetail {
        FailureDetail::new(file, message, line)
    }

    #[test]
    fn test_is_contained() {
        assert!(is_contained("src/app.py"));
        assert!(is_contained("./src/app.py"));
        assert!(!is_contained("../etc/passwd"));
        assert!(!is_contained("src/../../x"));
        assert!(!is_contained("/etc/passwd"));
        assert!(!is_contained(""));
    }

    #[test]
    fn test_gather_excerpts_small_file_whole() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/app.py"), "def f():\n    return 1\n").unwrap();

        let failures = vec![
            failure("src/app.py", "AssertionError", Some(2)),
            failure("src/missing.py", "x", None),
            failure("../outside.py", "x", None),
        ];
        let excerpts = gather_excerpts(dir.path(), &failures, 5, 1024);
        assert_eq!(excerpts.len(), 1);
        assert_eq!(
            excerpts["src/app.py"],
            Excerpt::Whole("def f():\n    return 1\n".to_string())
        );
    }

    #[test]
    fn test_gather_excerpts_large_file_windows() {
        let dir = tempfile::tempdir().unwrap();
        let content: String = (1..=100).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(dir.path().join("big.py"), &content).unwrap();

        let failures = vec![
            failure("big.py", "a", Some(10)),
            failure("big.py", "b", Some(12)),
            failure("big.py", "c", Some(90)),
        ];
        let excerpts = gather_excerpts(dir.path(), &failures, 2, 64);
        let Excerpt::Windows(windows) = &excerpts["big.py"] else {
            panic!("expected windows");
        };
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].0, 8);
        assert!(windows[0].1.starts_with("line 8"));
        assert!(windows[0].1.ends_with("line 14"));
        assert_eq!(windows[1].0, 88);
    }

    #[test]
    fn test_build_prompt_lists_failures_and_sources() {
        let failures = vec![failure("src/app.py", "AssertionError", Some(3))];
        let mut excerpts = BTreeMap::new();
        excerpts.insert("src/app.py".to_string(), Excerpt::Whole("x = 1".to_string()));
        let prompt = build_prompt(&failures, &excerpts);
        assert!(prompt.contains("1. src/app.py:3: AssertionError"));
        assert!(prompt.contains("### src/app.py"));
        assert!(prompt.contains("x = 1"));
    }

    #[test]
    fn test_parse_response_with_prose_and_fences() {
        let raw = "Here is the fix:\n```json\n{\"patches\": [{\"file\": \"./src/app.py\", \"bug_type\": \"logic\", \"line_number\": 3, \"summary\": \"return the sum\\nmore\", \"contents\": \"x = 2\\n\"}]}\n```\n";
        let patches = parse_response(raw, &[]).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].file, "src/app.py");
        assert_eq!(patches[0].bug_type, BugType::Logic);
        assert_eq!(patches[0].line_number, Some(3));
        assert_eq!(patches[0].summary, "return the sum");
        assert_eq!(patches[0].contents, "x = 2\n");
    }

    #[test]
    fn test_parse_response_classifies_missing_bug_type() {
        let failures = vec![failure("src/app.py", "IndentationError: unexpected indent", Some(7))];
        let raw = r#"{"patches": [{"file": "src/app.py", "contents": "pass\n"}]}"#;
        let patches = parse_response(raw, &failures).unwrap();
        assert_eq!(patches[0].bug_type, BugType::Indentation);
        assert_eq!(patches[0].line_number, Some(7));
        assert_eq!(patches[0].summary, "repair src/app.py");
    }

    #[test]
    fn test_parse_response_unknown_bug_type() {
        let raw = r#"{"patches": [{"file": "a.py", "bug_type": "COSMIC_RAY", "contents": ""}]}"#;
        assert_eq!(parse_response(raw, &[]).unwrap()[0].bug_type, BugType::Unknown);
    }

    #[test]
    fn test_parse_response_empty_patches() {
        assert!(parse_response(r#"{"patches": []}"#, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_response_malformed() {
        assert!(parse_response("I could not fix it.", &[]).is_err());
        assert!(parse_response(r#"{"patches": [{"file": "a.py"}]}"#, &[]).is_err());
    }

    #[test]
    fn test_parse_response_rejects_escaping_path() {
        let raw = r#"{"patches": [{"file": "../../etc/hosts", "contents": ""}]}"#;
        let err = parse_response(raw, &[]).unwrap_err();
        assert!(err.to_string().contains("outside the repository"));
    }
}
