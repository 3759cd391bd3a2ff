// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Query tokenization and FTS match-string compilation.
//!
//! Queries are split on Unicode whitespace, stripped to the allowed alphabet
//! (ASCII word characters plus the Latin-1 accented range), filtered through
//! a bilingual English/French stopword set, and recompiled into an FTS5
//! disjunction. User tokens never reach the match string unfiltered.

use std::collections::HashSet;
use std::sync::LazyLock;

/// Bilingual stopword set. Tokens are lowercased before comparison.
static STOPWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        // English
        "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "can", "could", "did",
        "do", "does", "for", "from", "had", "has", "have", "he", "her", "here", "him", "his",
        "how", "i", "if", "in", "into", "is", "it", "its", "just", "me", "my", "no", "not", "of",
        "on", "or", "our", "out", "she", "should", "so", "some", "than", "that", "the", "their",
        "them", "then", "there", "these", "they", "this", "to", "up", "us", "was", "we", "were",
        "what", "when", "where", "which", "who", "why", "will", "with", "would", "you", "your",
        // French
        "au", "aux", "avec", "ce", "ces", "cette", "dans", "de", "des", "du", "elle", "en",
        "est", "et", "eux", "il", "ils", "je", "la", "le", "les", "leur", "lui", "ma", "mais",
        "mes", "moi", "mon", "ne", "nos", "notre", "nous", "ont", "ou", "par", "pas", "pour",
        "qu", "que", "qui", "sa", "se", "ses", "son", "sont", "sur", "ta", "te", "tes", "toi",
        "ton", "tu", "un", "une", "vos", "votre", "vous", "etre", "être", "avoir", "fait",
        "faire", "plus", "tout", "tous", "toute", "comme", "aussi", "bien", "dont", "si",
    ]
    .into_iter()
    .collect()
});

/// Tokens at or below this length become exact phrases instead of prefixes.
const PREFIX_MIN_LEN: usize = 3;

/// True for characters kept inside a token: ASCII word characters, dash, and
/// the Latin-1 accented letters.
fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || c == '_'
        || c == '-'
        || (('\u{00C0}'..='\u{00FF}').contains(&c) && c != '\u{00D7}' && c != '\u{00F7}')
}

/// Split a query into lowercased, stopword-filtered tokens.
///
/// Tokens of length <= 1 are dropped along with stopwords.
pub fn tokenize(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|raw| {
            raw.chars()
                .filter(|c| is_token_char(*c))
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|tok| tok.chars().count() > 1 && !STOPWORDS.contains(tok.as_str()))
        .collect()
}

/// Compile a query into an FTS5 match disjunction.
///
/// Tokens of length >= 3 become quoted prefix terms (`"tok"*`); shorter
/// tokens become exact quoted phrases. Returns `None` when nothing survives
/// tokenization, in which case the caller must return an empty result set
/// without touching storage.
pub fn compile_match_query(query: &str) -> Option<String> {
    let tokens = tokenize(query);
    if tokens.is_empty() {
        return None;
    }

    let terms: Vec<String> = tokens
        .iter()
        .map(|tok| {
            if tok.chars().count() >= PREFIX_MIN_LEN {
                format!("\"{tok}\"*")
            } else {
                format!("\"{tok}\"")
            }
        })
        .collect();

    Some(terms.join(" OR "))
}
