//! Follow-up detection against a fixed cue list.
//!
//! Deliberately heuristic and isolated here so a stricter signal can
//! replace it without touching the orchestrator's state machine.

const FOLLOW_UP_CUES: &[&str] = &[
    "tell me more",
    "more about",
    "more detail",
    "drill into",
    "dig into",
    "what about",
    "how about",
    "expand on",
    "go deeper",
    "and the",
    "same ones",
    "those conversations",
];

pub fn is_follow_up(query: &str) -> bool {
    let lower = query.to_lowercase();
    FOLLOW_UP_CUES.iter().any(|cue| lower.contains(cue))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_cues() {
        assert!(is_follow_up("tell me more about the billing issue"));
        assert!(is_follow_up("Drill into the login failures"));
        assert!(is_follow_up("what about enterprise customers?"));
        assert!(is_follow_up("expand on the second insight"));
    }

    #[test]
    fn plain_queries_are_not_follow_ups() {
        assert!(!is_follow_up("show me issues from the last week"));
        assert!(!is_follow_up("top complaints this month"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert!(is_follow_up("TELL ME MORE"));
    }
}
