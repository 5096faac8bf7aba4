//! Keyword intent classification.
//!
//! Classification is a replaceable policy: the dispatcher only depends on
//! [`IntentClassifier`], and the shipped keyword rules are constructor
//! arguments, not a contract.

use crate::tools::registry::Capability;

/// Maps request text to capabilities, ordered by where each intent appears
/// in the text. An empty result means no confident match.
pub trait IntentClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Vec<Capability>;
}

/// One capability and the phrases that signal it.
#[derive(Debug, Clone)]
pub struct IntentRule {
    pub capability: Capability,
    pub phrases: Vec<&'static str>,
}

/// Ordered phrase matcher.
///
/// Each rule's earliest phrase position in the text decides chain order;
/// ties fall back to rule declaration order, so classification is
/// deterministic.
pub struct KeywordClassifier {
    rules: Vec<IntentRule>,
}

impl KeywordClassifier {
    pub fn new(rules: Vec<IntentRule>) -> Self {
        Self { rules }
    }

    pub fn default_rules() -> Vec<IntentRule> {
        vec![
            IntentRule {
                capability: Capability::DataQuery,
                phrases: vec![
                    "query", "sql", "database", "table", "select", "rows", "records", "list",
                    "count", "show",
                ],
            },
            IntentRule {
                capability: Capability::ExternalCall,
                phrases: vec![
                    "api", "http", "endpoint", "call", "webhook", "fetch", "request",
                ],
            },
            IntentRule {
                capability: Capability::Completion,
                phrases: vec!["explain", "summarize", "write", "tell me", "what is"],
            },
        ]
    }

    /// Earliest word-boundary occurrence of `phrase` in `text`.
    fn find_phrase(text: &str, phrase: &str) -> Option<usize> {
        let mut from = 0;
        while let Some(offset) = text[from..].find(phrase) {
            let pos = from + offset;
            let before_ok = pos == 0
                || !text[..pos]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_ascii_alphanumeric());
            let end = pos + phrase.len();
            let after_ok = end == text.len()
                || !text[end..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphanumeric());
            if before_ok && after_ok {
                return Some(pos);
            }
            from = pos + 1;
        }
        None
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(Self::default_rules())
    }
}

impl IntentClassifier for KeywordClassifier {
    fn classify(&self, text: &str) -> Vec<Capability> {
        let lowered = text.to_lowercase();

        let mut matched: Vec<(usize, usize, Capability)> = self
            .rules
            .iter()
            .enumerate()
            .filter_map(|(rule_index, rule)| {
                rule.phrases
                    .iter()
                    .filter_map(|phrase| Self::find_phrase(&lowered, phrase))
                    .min()
                    .map(|pos| (pos, rule_index, rule.capability))
            })
            .collect();

        matched.sort_by_key(|&(pos, rule_index, _)| (pos, rule_index));
        matched.into_iter().map(|(_, _, cap)| cap).collect()
    }
}
