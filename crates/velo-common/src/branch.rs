use thiserror::Error;

/// Suffix every healing branch carries.
pub const BRANCH_SUFFIX: &str = "_AI_Fix";

/// Longest segment kept from a team or leader name after sanitization.
const MAX_SEGMENT_LEN: usize = 48;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BranchNameError {
    #[error("team_name must contain at least one letter or digit")]
    EmptyTeam,

    #[error("leader_name must contain at least one letter or digit")]
    EmptyLeader,
}

/// Reduce free text to the branch-token alphabet `[A-Z0-9_]`.
///
/// Runs of anything outside ASCII alphanumerics collapse to one underscore and
/// leading/trailing underscores are dropped.
pub fn sanitize_segment(raw: &str) -> String {
    let upper: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();

    let mut segment = upper
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");

    if segment.len() > MAX_SEGMENT_LEN {
        // ASCII only at this point, so byte slicing is safe.
        segment.truncate(MAX_SEGMENT_LEN);
        segment = segment.trim_end_matches('_').to_string();
    }
    segment
}

/// Derive the healing branch name, e.g. `("Rift Org", "Saiyam Kumar")` →
/// `RIFT_ORG_SAIYAM_KUMAR_AI_Fix`.
pub fn branch_name(team_name: &str, leader_name: &str) -> Result<String, BranchNameError> {
    let team = sanitize_segment(team_name);
    if team.is_empty() {
        return Err(BranchNameError::EmptyTeam);
    }
    let leader = sanitize_segment(leader_name);
    if leader.is_empty() {
        return Err(BranchNameError::EmptyLeader);
    }
    Ok(format!("{}_{}{}", team, leader, BRANCH_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_name_basic() {
        assert_eq!(
            branch_name("Rift Org", "Saiyam Kumar").unwrap(),
            "RIFT_ORG_SAIYAM_KUMAR_AI_Fix"
        );
    }

    #[test]
    fn test_branch_name_is_deterministic() {
        let a = branch_name("  code  warriors ", "jane-doe").unwrap();
        let b = branch_name("  code  warriors ", "jane-doe").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "CODE_WARRIORS_JANE_DOE_AI_Fix");
    }

    #[test]
    fn test_branch_name_strips_unsafe_characters() {
        let name = branch_name("team/../~^:?*[", "lead\ter @{x}").unwrap();
        assert!(!name.chars().any(char::is_whitespace));
        assert!(name.ends_with(BRANCH_SUFFIX));
        let body = name.trim_end_matches(BRANCH_SUFFIX);
        assert!(
            body.chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        );
        assert_eq!(name, "TEAM_LEAD_ER_X_AI_Fix");
    }

    #[test]
    fn test_branch_name_non_ascii_collapses() {
        assert_eq!(branch_name("Équipe 7", "Zoë").unwrap(), "QUIPE_7_ZO_AI_Fix");
    }

    #[test]
    fn test_branch_name_rejects_empty_segments() {
        assert_eq!(branch_name("   ", "lead"), Err(BranchNameError::EmptyTeam));
        assert_eq!(branch_name("team", "!!!"), Err(BranchNameError::EmptyLeader));
    }

    #[test]
    fn test_sanitize_segment_truncates_long_names() {
        let long = "a".repeat(200);
        let seg = sanitize_segment(&long);
        assert_eq!(seg.len(), MAX_SEGMENT_LEN);
    }

    #[test]
    fn test_sanitize_segment_truncation_drops_trailing_underscore() {
        let raw = format!("{} b", "a".repeat(MAX_SEGMENT_LEN - 1));
        let seg = sanitize_segment(&raw);
        assert!(!seg.ends_with('_'));
        assert_eq!(seg.len(), MAX_SEGMENT_LEN - 1);
    }
}
