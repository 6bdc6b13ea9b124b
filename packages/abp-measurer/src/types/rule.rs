//! Pure helpers over filter-rule text.

use sha2::{Digest, Sha256};

/// Leading characters that mark comments, section headers or blank-ish lines.
const IGNORED_LEADING_CHARS: [char; 6] = ['\n', ' ', '!', '[', '\r', '\t'];

/// Script-injection rule syntax the matcher does not understand.
const SCRIPT_INJECTION_PREFIXES: [&str; 2] = ["#%#", "#@%#"];

/// SHA-256 of the text, hex encoded.
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Cosmetic rules hide page elements rather than block requests.
pub fn is_style_rule(text: &str) -> bool {
    text.contains("##")
}

/// Exception rules override a blocking match.
pub fn is_exception_rule(text: &str) -> bool {
    text.starts_with("@@")
}

/// Split filter-list text into the rule lines that get registered and fed to
/// the matcher.
///
/// Drops blank lines, comment/markup lines and script-injection rules.
/// Order is preserved and duplicates are kept; callers that need a set
/// dedupe themselves.
pub fn prepare_rule_lines(text: &str) -> Vec<String> {
    text.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.trim().is_empty())
        .filter(|line| {
            !line
                .chars()
                .next()
                .map(|c| IGNORED_LEADING_CHARS.contains(&c))
                .unwrap_or(true)
        })
        .filter(|line| {
            !SCRIPT_INJECTION_PREFIXES
                .iter()
                .any(|prefix| line.starts_with(prefix))
        })
        .map(str::to_string)
        .collect()
}

/// A rule ready to be registered, with its derived attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRule {
    pub text: String,
    pub text_hash: String,
    pub is_style_rule: bool,
    pub is_exception: bool,
}

impl NewRule {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            text_hash: text_hash(&text),
            is_style_rule: is_style_rule(&text),
            is_exception: is_exception_rule(&text),
            text,
        }
    }
}
