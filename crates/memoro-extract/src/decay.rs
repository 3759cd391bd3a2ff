// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decay classification and expiry calculation.
//!
//! Pure functions mapping a candidate's identity and text to a
//! [`DecayClass`], and a class plus the current time to an absolute expiry.
//! Rule precedence is fixed: first match wins.

use std::sync::LazyLock;

use memoro_core::DecayClass;
use regex::Regex;

/// Key substrings that mark a fact as permanent identity data.
const PERMANENT_KEY_HINTS: &[&str] = &[
    "birthday",
    "born",
    "email",
    "phone",
    "name",
    "real_name",
    "full_name",
    "api_key",
    "architecture",
    "language",
    "location",
    "stack",
];

/// Key substrings for throwaway session state.
const SESSION_KEY_HINTS: &[&str] = &["current_file", "temp", "debug", "working_on_right_now"];

/// Key substrings for in-flight work items.
const ACTIVE_KEY_HINTS: &[&str] = &[
    "current_task",
    "active_branch",
    "sprint",
    "milestone",
    "task",
    "todo",
    "wip",
    "branch",
    "blocker",
];

static PERMANENT_FACT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)born on|birthday is|email is|phone number").unwrap()
});

// Bare `always`/`never` anywhere in English text classifies as permanent.
// The French rule matcher narrows with utiliser/faire/mettre; the English one
// does not, and that asymmetry is load-bearing for existing stores.
static PERMANENT_RULE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)decided|architecture|always use|never use|always\b|never\b").unwrap()
});

static SESSION_TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)currently debugging|right now|this session").unwrap());

static ACTIVE_TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)working on|need to fix|todo:?|wip").unwrap());

fn key_contains_any(key: &str, hints: &[&str]) -> bool {
    let key = key.to_lowercase();
    hints.iter().any(|hint| key.contains(hint))
}

/// Classify a candidate into a decay class. First matching rule wins.
pub fn classify_decay(entity: Option<&str>, key: Option<&str>, text: &str) -> DecayClass {
    let entity_lower = entity.map(str::to_lowercase);
    let key = key.unwrap_or("");

    if key_contains_any(key, PERMANENT_KEY_HINTS) {
        return DecayClass::Permanent;
    }
    if PERMANENT_FACT_RE.is_match(text) {
        return DecayClass::Permanent;
    }
    if PERMANENT_RULE_RE.is_match(text) {
        return DecayClass::Permanent;
    }
    if matches!(entity_lower.as_deref(), Some("decision") | Some("convention")) {
        return DecayClass::Permanent;
    }

    if key_contains_any(key, SESSION_KEY_HINTS) || SESSION_TEXT_RE.is_match(text) {
        return DecayClass::Session;
    }

    if key_contains_any(key, ACTIVE_KEY_HINTS)
        || matches!(entity_lower.as_deref(), Some("project") | Some("sprint"))
        || ACTIVE_TEXT_RE.is_match(text)
    {
        return DecayClass::Active;
    }

    let key_lower = key.to_lowercase();
    if key_lower.starts_with("checkpoint:") || key_lower.contains("preflight") {
        return DecayClass::Checkpoint;
    }

    DecayClass::Stable
}

/// Absolute expiry for a class at `now`, or `None` for permanent.
pub fn expiry_for(class: DecayClass, now: i64) -> Option<i64> {
    class.ttl_seconds().map(|ttl| now + ttl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_key_hints_win() {
        assert_eq!(
            classify_decay(None, Some("email"), "whatever"),
            DecayClass::Permanent
        );
        assert_eq!(
            classify_decay(None, Some("real_name"), ""),
            DecayClass::Permanent
        );
        assert_eq!(
            classify_decay(None, Some("preferred_language"), ""),
            DecayClass::Permanent
        );
    }

    #[test]
    fn permanent_fact_text() {
        assert_eq!(
            classify_decay(None, None, "Fred was born on March 3rd"),
            DecayClass::Permanent
        );
        assert_eq!(
            classify_decay(None, None, "her email is a@b.co"),
            DecayClass::Permanent
        );
    }

    #[test]
    fn bare_always_is_permanent() {
        // Intentional breadth: bare `always` matches anywhere in English text.
        assert_eq!(
            classify_decay(None, None, "I always forget my umbrella"),
            DecayClass::Permanent
        );
        assert_eq!(
            classify_decay(None, None, "never deploy on Fridays"),
            DecayClass::Permanent
        );
    }

    #[test]
    fn decision_entity_is_permanent() {
        assert_eq!(
            classify_decay(Some("Decision"), None, "we will revisit"),
            DecayClass::Permanent
        );
        assert_eq!(
            classify_decay(Some("convention"), None, ""),
            DecayClass::Permanent
        );
    }

    #[test]
    fn session_key_and_text() {
        assert_eq!(
            classify_decay(None, Some("current_file"), ""),
            DecayClass::Session
        );
        assert_eq!(
            classify_decay(None, None, "Currently debugging auth"),
            DecayClass::Session
        );
        assert_eq!(
            classify_decay(None, None, "doing this right now"),
            DecayClass::Session
        );
    }

    #[test]
    fn active_key_entity_and_text() {
        assert_eq!(
            classify_decay(None, Some("active_branch"), ""),
            DecayClass::Active
        );
        assert_eq!(
            classify_decay(Some("project"), None, "shipping the dashboard"),
            DecayClass::Active
        );
        assert_eq!(
            classify_decay(None, None, "working on the importer"),
            DecayClass::Active
        );
    }

    #[test]
    fn session_beats_active_on_order() {
        // "debug" (session hint) checked before "task" (active hint).
        assert_eq!(
            classify_decay(None, Some("debug_task"), ""),
            DecayClass::Session
        );
    }

    #[test]
    fn checkpoint_keys() {
        assert_eq!(
            classify_decay(None, Some("checkpoint:1700000000"), "{}"),
            DecayClass::Checkpoint
        );
        assert_eq!(
            classify_decay(None, Some("preflight_state"), "{}"),
            DecayClass::Checkpoint
        );
    }

    #[test]
    fn default_is_stable() {
        assert_eq!(
            classify_decay(Some("Fred"), Some("editor"), "Fred uses VSCode"),
            DecayClass::Stable
        );
        assert_eq!(classify_decay(None, None, "the sky was clear"), DecayClass::Stable);
    }

    #[test]
    fn classification_is_idempotent_on_reclassification() {
        // Re-running the classifier on the same inputs is a fixed point.
        let inputs = [
            (Some("Fred"), Some("editor"), "Fred uses VSCode"),
            (None, Some("current_task"), "ship it"),
            (None, None, "always use tabs"),
        ];
        for (entity, key, text) in inputs {
            let first = classify_decay(entity, key, text);
            let second = classify_decay(entity, key, text);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn expiry_offsets_match_ttls() {
        let now = 1_700_000_000;
        assert_eq!(expiry_for(DecayClass::Permanent, now), None);
        assert_eq!(expiry_for(DecayClass::Stable, now), Some(now + 90 * 86_400));
        assert_eq!(expiry_for(DecayClass::Active, now), Some(now + 14 * 86_400));
        assert_eq!(expiry_for(DecayClass::Session, now), Some(now + 86_400));
        assert_eq!(expiry_for(DecayClass::Checkpoint, now), Some(now + 4 * 3_600));
    }
}
