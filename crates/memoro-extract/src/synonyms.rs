// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Static synonym expansion for lexical recall.
//!
//! Each term whose lowercased form appears as a substring of the candidate's
//! combined text/entity/key/value contributes its synonyms to a flat tag
//! string that is indexed alongside the text. Deterministic, idempotent, and
//! empty-safe.

use std::collections::BTreeSet;

/// Term -> synonyms table. Matching is substring-based on lowercased input.
const SYNONYMS: &[(&str, &[&str])] = &[
    ("typescript", &["ts", "javascript", "node", "frontend"]),
    ("javascript", &["js", "node", "ecmascript", "frontend"]),
    ("python", &["py", "python3", "scripting"]),
    ("rust", &["rustlang", "cargo", "systems"]),
    ("golang", &["go", "backend"]),
    ("database", &["db", "storage", "sql", "persistence"]),
    ("postgres", &["postgresql", "pg", "database", "sql"]),
    ("sqlite", &["sql", "database", "embedded"]),
    ("editor", &["ide", "vscode", "vim", "emacs"]),
    ("vscode", &["editor", "ide", "visual studio code"]),
    ("vim", &["neovim", "editor", "nvim"]),
    ("email", &["mail", "e-mail", "address", "courriel"]),
    ("phone", &["telephone", "mobile", "number", "téléphone"]),
    ("birthday", &["born", "birthdate", "anniversaire"]),
    ("deploy", &["deployment", "release", "ship", "déploiement"]),
    ("server", &["backend", "host", "serveur"]),
    ("frontend", &["ui", "client", "interface"]),
    ("backend", &["server", "api", "service"]),
    ("api", &["endpoint", "rest", "interface", "service"]),
    ("docker", &["container", "image", "compose"]),
    ("kubernetes", &["k8s", "cluster", "orchestration"]),
    ("git", &["repo", "repository", "version control"]),
    ("branch", &["git", "feature", "branche"]),
    ("bug", &["defect", "issue", "error", "bogue"]),
    ("test", &["spec", "unit test", "testing"]),
    ("meeting", &["call", "sync", "standup", "réunion"]),
    ("project", &["repo", "codebase", "projet"]),
    ("password", &["credential", "login", "mot de passe"]),
    ("config", &["configuration", "settings", "setup"]),
    ("architecture", &["design", "structure", "stack"]),
];

/// Expand the concatenation of a candidate's fields into a tag string.
///
/// Output terms are deduplicated and sorted, so expansion is idempotent.
pub fn expand_tags(
    text: &str,
    entity: Option<&str>,
    key: Option<&str>,
    value: Option<&str>,
) -> String {
    let haystack = format!(
        "{}|{}|{}|{}",
        text,
        entity.unwrap_or(""),
        key.unwrap_or(""),
        value.unwrap_or("")
    )
    .to_lowercase();

    let mut tags: BTreeSet<&str> = BTreeSet::new();
    for (term, synonyms) in SYNONYMS {
        if haystack.contains(term) {
            tags.extend(synonyms.iter());
        }
    }

    tags.into_iter().collect::<Vec<_>>().join(" ")
}
