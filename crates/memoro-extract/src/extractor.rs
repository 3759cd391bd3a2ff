// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured extraction from free-text statements.
//!
//! The grammar is an ordered list of named matchers, each returning an
//! optional `(entity, key, value)` triple. The first non-empty triple wins,
//! so declaration order is part of the contract. English and French forms are
//! recognized; bare email/phone extraction runs last, with email taking
//! precedence over phone.

use std::sync::LazyLock;

use memoro_core::Category;
use regex::Regex;

/// Keys are trimmed and truncated to this many characters.
const MAX_KEY_LEN: usize = 100;

/// Rationale placeholder when a decision carries no "because" clause.
const NO_RATIONALE_EN: &str = "no rationale recorded";
const NO_RATIONALE_FR: &str = "aucune justification enregistrée";

/// A structured identity triple extracted from text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extraction {
    pub entity: Option<String>,
    pub key: Option<String>,
    pub value: Option<String>,
}

impl Extraction {
    fn is_empty(&self) -> bool {
        self.entity.is_none() && self.key.is_none() && self.value.is_none()
    }
}

fn truncate_key(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed.chars().take(MAX_KEY_LEN).collect()
}

/// `always ...` / `never ...` rules normalize to a convention entry.
fn rule_extraction(rest: &str, text: &str) -> Extraction {
    let lower = text.to_lowercase();
    let value = if lower.contains("never") || lower.contains("jamais") {
        "never"
    } else {
        "always"
    };
    Extraction {
        entity: Some("convention".to_string()),
        key: Some(truncate_key(rest)),
        value: Some(value.to_string()),
    }
}

macro_rules! matcher_regex {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| Regex::new($pattern).unwrap());
    };
}

matcher_regex!(
    DECISION_EN,
    r"(?i)\b(?:decided(?:\s+(?:to|on))?|chose|picked|went\s+with|selected)\s+(.+?)(?:\s+because\s+(.+))?\.?\s*$"
);
matcher_regex!(
    DECISION_FR,
    r"(?i)\b(?:décidé(?:\s+(?:de|d'))?|choisi|opté\s+pour)\s+(.+?)(?:\s+(?:parce\s+que|car)\s+(.+))?\.?\s*$"
);
matcher_regex!(
    CHOICE_EN,
    r"(?i)\buse\s+(\S+)\s+over\s+(\S+)(?:\s+because\s+(.+))?\.?\s*$"
);
matcher_regex!(
    CHOICE_FR,
    r"(?i)\butiliser\s+(\S+)\s+plutôt\s+que\s+(\S+)(?:\s+(?:parce\s+que|car)\s+(.+))?\.?\s*$"
);
matcher_regex!(RULE_EN, r"(?i)\b(?:always|never)\s+(.+?)\.?\s*$");
matcher_regex!(
    RULE_FR,
    r"(?i)\b(?:toujours|jamais)\s+((?:utiliser|faire|mettre)\s+.+?)\.?\s*$"
);
matcher_regex!(
    POSSESSIVE_EN,
    r"(?:^|\s)([A-Z][A-Za-z0-9_-]*)['\u{2019}]s\s+([A-Za-z0-9_ -]+?)\s+is\s+(.+?)\.?\s*$"
);
matcher_regex!(
    MY_EN,
    r"(?i)\bmy\s+([A-Za-z0-9_ -]+?)\s+is\s+(.+?)\.?\s*$"
);
matcher_regex!(
    POSSESSIVE_FR,
    r"(?i)\ble\s+([\w àâäçéèêëîïôöûùüÿ-]+?)\s+de\s+([A-Z][\w-]*)\s+est\s+(.+?)\.?\s*$"
);
matcher_regex!(
    MY_FR,
    r"(?i)\b(?:mon|ma|mes)\s+([\w àâäçéèêëîïôöûùüÿ-]+?)\s+est\s+(.+?)\.?\s*$"
);
matcher_regex!(
    PREFERENCE_EN,
    r"(?i)\bi\s+(prefer|like|love|hate|want|need|use)\s+(.+?)\.?\s*$"
);
matcher_regex!(
    PREFERENCE_FR,
    r"(?i)\bje\s+(préfère|aime|adore|déteste|veux|utilise)\s+(.+?)\.?\s*$"
);
matcher_regex!(
    EMAIL,
    r"([A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,})"
);
matcher_regex!(PHONE, r"(\+?[0-9][0-9()\. -]{6,}[0-9])");

fn match_decision_en(text: &str) -> Option<Extraction> {
    let caps = DECISION_EN.captures(text)?;
    Some(Extraction {
        entity: Some("decision".to_string()),
        key: Some(truncate_key(&caps[1])),
        value: Some(
            caps.get(2)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_else(|| NO_RATIONALE_EN.to_string()),
        ),
    })
}

fn match_decision_fr(text: &str) -> Option<Extraction> {
    let caps = DECISION_FR.captures(text)?;
    Some(Extraction {
        entity: Some("decision".to_string()),
        key: Some(truncate_key(&caps[1])),
        value: Some(
            caps.get(2)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_else(|| NO_RATIONALE_FR.to_string()),
        ),
    })
}

fn match_choice_en(text: &str) -> Option<Extraction> {
    let caps = CHOICE_EN.captures(text)?;
    Some(Extraction {
        entity: Some("decision".to_string()),
        key: Some(truncate_key(&format!("{} over {}", &caps[1], &caps[2]))),
        value: Some(
            caps.get(3)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_else(|| NO_RATIONALE_EN.to_string()),
        ),
    })
}

fn match_choice_fr(text: &str) -> Option<Extraction> {
    let caps = CHOICE_FR.captures(text)?;
    Some(Extraction {
        entity: Some("decision".to_string()),
        key: Some(truncate_key(&format!("{} plutôt que {}", &caps[1], &caps[2]))),
        value: Some(
            caps.get(3)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_else(|| NO_RATIONALE_FR.to_string()),
        ),
    })
}

fn match_rule_en(text: &str) -> Option<Extraction> {
    let caps = RULE_EN.captures(text)?;
    Some(rule_extraction(&caps[1], text))
}

fn match_rule_fr(text: &str) -> Option<Extraction> {
    let caps = RULE_FR.captures(text)?;
    Some(rule_extraction(&caps[1], text))
}

fn match_possessive_en(text: &str) -> Option<Extraction> {
    let caps = POSSESSIVE_EN.captures(text)?;
    Some(Extraction {
        entity: Some(caps[1].to_string()),
        key: Some(truncate_key(&caps[2].to_lowercase())),
        value: Some(caps[3].trim().to_string()),
    })
}

fn match_my_en(text: &str) -> Option<Extraction> {
    let caps = MY_EN.captures(text)?;
    Some(Extraction {
        entity: Some("user".to_string()),
        key: Some(truncate_key(&caps[1].to_lowercase())),
        value: Some(caps[2].trim().to_string()),
    })
}

fn match_possessive_fr(text: &str) -> Option<Extraction> {
    let caps = POSSESSIVE_FR.captures(text)?;
    Some(Extraction {
        entity: Some(caps[2].to_string()),
        key: Some(truncate_key(&caps[1].to_lowercase())),
        value: Some(caps[3].trim().to_string()),
    })
}

fn match_my_fr(text: &str) -> Option<Extraction> {
    let caps = MY_FR.captures(text)?;
    Some(Extraction {
        entity: Some("user".to_string()),
        key: Some(truncate_key(&caps[1].to_lowercase())),
        value: Some(caps[2].trim().to_string()),
    })
}

fn normalize_preference_verb(verb: &str) -> &'static str {
    match verb.to_lowercase().as_str() {
        "prefer" | "préfère" => "prefers",
        "like" | "aime" => "likes",
        "love" | "adore" => "loves",
        "hate" | "déteste" => "hates",
        "want" | "veux" => "wants",
        "need" => "needs",
        _ => "uses",
    }
}

fn match_preference_en(text: &str) -> Option<Extraction> {
    let caps = PREFERENCE_EN.captures(text)?;
    Some(Extraction {
        entity: Some("user".to_string()),
        key: Some(truncate_key(&caps[2].to_lowercase())),
        value: Some(normalize_preference_verb(&caps[1]).to_string()),
    })
}

fn match_preference_fr(text: &str) -> Option<Extraction> {
    let caps = PREFERENCE_FR.captures(text)?;
    Some(Extraction {
        entity: Some("user".to_string()),
        key: Some(truncate_key(&caps[2].to_lowercase())),
        value: Some(normalize_preference_verb(&caps[1]).to_string()),
    })
}

fn match_email(text: &str) -> Option<Extraction> {
    let caps = EMAIL.captures(text)?;
    Some(Extraction {
        entity: Some("user".to_string()),
        key: Some("email".to_string()),
        value: Some(caps[1].to_string()),
    })
}

fn match_phone(text: &str) -> Option<Extraction> {
    let caps = PHONE.captures(text)?;
    Some(Extraction {
        entity: Some("user".to_string()),
        key: Some("phone".to_string()),
        value: Some(caps[1].trim().to_string()),
    })
}

type MatchFn = fn(&str) -> Option<Extraction>;

/// Declared order is first-match-wins. Email precedes phone.
static MATCHERS: &[(&str, MatchFn)] = &[
    ("decision_en", match_decision_en),
    ("decision_fr", match_decision_fr),
    ("choice_en", match_choice_en),
    ("choice_fr", match_choice_fr),
    ("rule_en", match_rule_en),
    ("rule_fr", match_rule_fr),
    ("possessive_en", match_possessive_en),
    ("possessive_fr", match_possessive_fr),
    ("my_en", match_my_en),
    ("my_fr", match_my_fr),
    ("preference_en", match_preference_en),
    ("preference_fr", match_preference_fr),
    ("email", match_email),
    ("phone", match_phone),
];

/// Run the matchers in order and return the first non-empty triple.
pub fn extract(text: &str) -> Option<Extraction> {
    for (_name, matcher) in MATCHERS {
        if let Some(extraction) = matcher(text) {
            if !extraction.is_empty() {
                return Some(extraction);
            }
        }
    }
    None
}

matcher_regex!(CAPITALIZED_WORD, r"\b([A-Z][A-Za-z0-9_-]+)");

/// Extraction with the entity-category fallback: when the category is
/// `entity` and no matcher fired, the first capitalized word becomes the
/// entity with empty key and value.
pub fn extract_for_category(text: &str, category: Category) -> Option<Extraction> {
    if let Some(extraction) = extract(text) {
        return Some(extraction);
    }
    if category == Category::Entity {
        if let Some(caps) = CAPITALIZED_WORD.captures(text) {
            return Some(Extraction {
                entity: Some(caps[1].to_string()),
                key: None,
                value: None,
            });
        }
    }
    None
}

// --- Capture eligibility -----------------------------------------------------

matcher_regex!(HTML_BLOCK, r"(?s)<([A-Za-z][A-Za-z0-9]*)[^>]*>.*</[A-Za-z][A-Za-z0-9]*>");
matcher_regex!(MARKDOWN_HEADER, r"(?m)^#{1,6}\s");
matcher_regex!(
    SENSITIVE,
    r"(?i)password|api[\s_-]?key|secret|token\s+is|\bssn\b|credit\s*card"
);

/// Bilingual trigger patterns; at least one must match for capture.
static TRIGGERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bi\s+(?:prefer|like|love|hate|want|need|use)\b",
        r"(?i)\bmy\s+\w+\s+is\b",
        r"['\u{2019}]s\s+\w+\s+is\b",
        r"(?i)\b(?:decided|chose|picked|went\s+with|selected)\b",
        r"(?i)\balways\b",
        r"(?i)\bnever\b",
        r"(?i)\bremember\b",
        r"(?i)\bworking\s+on\b",
        r"(?i)\bneed\s+to\b",
        r"(?i)\btodo\b",
        r"(?i)\bemail\b",
        r"(?i)\bphone\b",
        r"(?i)\bborn\b|\bbirthday\b",
        r"(?i)\bname\s+is\b|\bcall\s+me\b",
        r"(?i)\buse\s+\S+\s+over\b",
        r"(?i)\bje\s+(?:préfère|aime|adore|déteste|veux|utilise)\b",
        r"(?i)\b(?:mon|ma|mes)\s+\w+\s+est\b",
        r"(?i)\b(?:décidé|choisi|opté)\b",
        r"(?i)\btoujours\b",
        r"(?i)\bjamais\b",
        r"(?i)\bsouviens\b|\brappelle\b",
        r"(?i)\bje\s+travaille\s+sur\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

fn is_emoji(c: char) -> bool {
    matches!(c,
        '\u{1F000}'..='\u{1FAFF}'
        | '\u{2600}'..='\u{27BF}'
        | '\u{FE0F}'
        | '\u{1F1E6}'..='\u{1F1FF}'
    )
}

/// Whether a free-text statement is eligible for automatic capture.
///
/// All conditions must hold: length in [10, 500], no recall-injection
/// marker, no HTML block, no markdown header, at most 3 emoji, no sensitive
/// pattern, and at least one bilingual trigger.
pub fn should_capture(text: &str) -> bool {
    let len = text.chars().count();
    if !(10..=500).contains(&len) {
        return false;
    }
    if text.contains("<relevant-memories>") {
        return false;
    }
    if HTML_BLOCK.is_match(text) {
        return false;
    }
    if MARKDOWN_HEADER.is_match(text) {
        return false;
    }
    if text.chars().filter(|c| is_emoji(*c)).count() > 3 {
        return false;
    }
    if SENSITIVE.is_match(text) {
        return false;
    }
    TRIGGERS.iter().any(|re| re.is_match(text))
}

// --- Category detection ------------------------------------------------------

matcher_regex!(
    CAT_DECISION,
    r"(?i)\b(?:decided|chose|picked|went\s+with|selected|décidé|choisi|opté)\b"
);
matcher_regex!(
    CAT_PREFERENCE,
    r"(?i)\b(?:prefer|like|love|hate|favorite|préfère|aime|adore|déteste)\b"
);
matcher_regex!(
    CAT_ENTITY,
    r"(?i)['\u{2019}]s\s+\w+\s+is\b|\bmy\s+\w+\s+is\b|\b(?:mon|ma|mes)\s+\w+\s+est\b|\bname\s+is\b"
);
matcher_regex!(CAT_FACT, r"(?i)\b(?:is|are|was|were|has|have|est|sont|ont)\b");

/// Detect the content category, applying bilingual pattern groups in the
/// order decision -> preference -> entity -> fact -> other.
pub fn detect_category(text: &str) -> Category {
    if CAT_DECISION.is_match(text) {
        Category::Decision
    } else if CAT_PREFERENCE.is_match(text) {
        Category::Preference
    } else if CAT_ENTITY.is_match(text) {
        Category::Entity
    } else if CAT_FACT.is_match(text) {
        Category::Fact
    } else {
        Category::Other
    }
}
