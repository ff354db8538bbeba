//! Replacement-rule preprocessing.
//! Every ingested string is trimmed and rewritten by the user's ordered regex
//! rules before it is used as a cache key or displayed. A rule that fails to
//! compile is skipped; it never aborts the ingestion event.

use std::sync::Arc;

use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A user-authored pattern → replacement rule.
///
/// `flags` is a string of single-character switches: `g` replaces every
/// match (otherwise only the first), `i` case-insensitive, `m` multi-line,
/// `s` dot matches newline, `x` verbose pattern, `U` swap greediness.
/// Unknown characters are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementRule {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
    #[serde(default)]
    pub flags: String,
}

impl ReplacementRule {
    pub fn new(pattern: &str, replacement: &str, flags: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
            flags: flags.to_string(),
        }
    }
}

struct CompiledRule {
    regex: Regex,
    replacement: String,
    global: bool,
}

/// A rule list with every valid pattern compiled.
pub struct CompiledRules {
    rules: Vec<CompiledRule>,
}

impl CompiledRules {
    pub fn compile(rules: &[ReplacementRule]) -> Self {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.pattern.trim().is_empty() {
                continue;
            }
            match build_regex(&rule.pattern, &rule.flags) {
                Ok(regex) => compiled.push(CompiledRule {
                    regex,
                    replacement: rule.replacement.clone(),
                    global: rule.flags.contains('g'),
                }),
                Err(e) => {
                    warn!(pattern = %rule.pattern, error = %e, "skipping replacement rule");
                }
            }
        }
        Self { rules: compiled }
    }

    /// Number of rules that compiled.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Trim, then apply each rule in order.
    pub fn apply(&self, raw: &str) -> String {
        let mut output = raw.trim().to_string();
        for rule in &self.rules {
            let replaced = if rule.global {
                rule.regex.replace_all(&output, rule.replacement.as_str())
            } else {
                rule.regex.replace(&output, rule.replacement.as_str())
            };
            output = replaced.into_owned();
        }
        output
    }
}

fn build_regex(pattern: &str, flags: &str) -> Result<Regex, regex::Error> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.chars() {
        match flag {
            'i' | 'I' => {
                builder.case_insensitive(true);
            }
            'm' | 'M' => {
                builder.multi_line(true);
            }
            's' | 'S' => {
                builder.dot_matches_new_line(true);
            }
            'x' | 'X' => {
                builder.ignore_whitespace(true);
            }
            'U' => {
                builder.swap_greed(true);
            }
            _ => {}
        }
    }
    builder.build()
}

/// Normalize `raw` with `rules`. Pure: compiles the rules on every call.
pub fn normalize(raw: &str, rules: &[ReplacementRule]) -> String {
    CompiledRules::compile(rules).apply(raw)
}

/// Normalizer that keeps the last compiled rule set and only recompiles
/// when the configured rules change.
pub struct Normalizer {
    compiled: RwLock<(Vec<ReplacementRule>, Arc<CompiledRules>)>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self {
            compiled: RwLock::new((Vec::new(), Arc::new(CompiledRules { rules: Vec::new() }))),
        }
    }

    pub fn normalize(&self, raw: &str, rules: &[ReplacementRule]) -> String {
        self.rules_for(rules).apply(raw)
    }

    fn rules_for(&self, rules: &[ReplacementRule]) -> Arc<CompiledRules> {
        {
            let cached = self.compiled.read();
            if cached.0.as_slice() == rules {
                return Arc::clone(&cached.1);
            }
        }
        let fresh = Arc::new(CompiledRules::compile(rules));
        *self.compiled.write() = (rules.to_vec(), Arc::clone(&fresh));
        fresh
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_without_rules() {
        assert_eq!(normalize("  こんにちは。\n", &[]), "こんにちは。");
    }

    #[test]
    fn rules_apply_in_order() {
        let rules = vec![
            ReplacementRule::new("a", "b", "g"),
            ReplacementRule::new("b", "c", "g"),
        ];
        assert_eq!(normalize("aab", &rules), "ccc");
    }

    #[test]
    fn without_g_only_first_match_is_replaced() {
        let first = vec![ReplacementRule::new("o", "0", "")];
        let all = vec![ReplacementRule::new("o", "0", "g")];
        assert_eq!(normalize("foo boo", &first), "f0o boo");
        assert_eq!(normalize("foo boo", &all), "f00 b00");
    }

    #[test]
    fn case_flag_controls_matching() {
        let sensitive = vec![ReplacementRule::new("name", "X", "g")];
        let insensitive = vec![ReplacementRule::new("name", "X", "gi")];
        assert_eq!(normalize("Name name", &sensitive), "Name X");
        assert_eq!(normalize("Name name", &insensitive), "X X");
    }

    #[test]
    fn capture_groups_expand() {
        let rules = vec![ReplacementRule::new(r"【(.+?)】", "[$1] ", "g")];
        assert_eq!(normalize("【アリス】やあ", &rules), "[アリス] やあ");
    }

    #[test]
    fn invalid_and_empty_patterns_are_skipped() {
        let rules = vec![
            ReplacementRule::new("(unclosed", "x", "g"),
            ReplacementRule::new("   ", "x", "g"),
            ReplacementRule::new(r"\s+", " ", "g"),
        ];
        let compiled = CompiledRules::compile(&rules);
        assert_eq!(compiled.len(), 1);
        assert_eq!(compiled.apply("a \n\t b"), "a b");
    }

    #[test]
    fn deterministic_and_idempotent_for_idempotent_rules() {
        let rules = vec![ReplacementRule::new(r"\s+", " ", "g")];
        let once = normalize("  a   b  c ", &rules);
        assert_eq!(once, normalize("  a   b  c ", &rules));
        assert_eq!(normalize(&once, &rules), once);
    }

    #[test]
    fn normalizer_recompiles_when_rules_change() {
        let normalizer = Normalizer::new();
        let first = vec![ReplacementRule::new("a", "1", "g")];
        let second = vec![ReplacementRule::new("a", "2", "g")];
        assert_eq!(normalizer.normalize("aa", &first), "11");
        assert_eq!(normalizer.normalize("aa", &first), "11");
        assert_eq!(normalizer.normalize("aa", &second), "22");
        assert_eq!(normalizer.normalize(" aa ", &[]), "aa");
    }
}
