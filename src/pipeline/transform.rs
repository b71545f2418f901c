//! Rule-based message filtering and rewriting.
//!
//! Rules run in a fixed order regardless of how they were listed:
//! 1. Whitelist gate (if any whitelist rule exists, one must match)
//! 2. Blacklist gate (first match blocks)
//! 3. Strip rules (links, mentions, Telegram links) in listed order
//! 4. Replacements, applied to the already-stripped text
//! 5. Prefixes, then suffixes
//! 6. Whitespace collapse
//!
//! Malformed regex patterns never raise: as filters they do not match,
//! as replacements they leave the text unchanged.

use std::sync::LazyLock;

use regex::{NoExpand, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s<>"{}|\\^`\[\]]+"#).expect("static url regex")
});

static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@\w+").expect("static mention regex"));

static TELEGRAM_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://(?:t\.me|telegram\.me)/[^\s<>"{}|\\^`\[\]]+"#)
        .expect("static telegram link regex")
});

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("static whitespace regex"));

/// What a rule does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Whitelist,
    Blacklist,
    Replace,
    Prefix,
    Suffix,
    StripLinks,
    StripMentions,
    /// Provider-specific stripper for `t.me` / `telegram.me` links.
    StripTelegramLinks,
}

impl RuleKind {
    /// Short label used in decision traces.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Whitelist => "whitelist",
            Self::Blacklist => "blacklist",
            Self::Replace => "replace",
            Self::Prefix => "prefix",
            Self::Suffix => "suffix",
            Self::StripLinks => "strip_links",
            Self::StripMentions => "strip_mentions",
            Self::StripTelegramLinks => "strip_telegram_links",
        }
    }

    /// Parse the `transform_type` column of the rule store.
    ///
    /// Unknown types return `None` and are skipped by the resolver.
    pub fn from_store(s: &str) -> Option<Self> {
        match s {
            "keyword_whitelist" | "whitelist" => Some(Self::Whitelist),
            "keyword_blacklist" | "blacklist" => Some(Self::Blacklist),
            "text_replace" | "replace" => Some(Self::Replace),
            "add_prefix" | "prefix" => Some(Self::Prefix),
            "add_suffix" | "suffix" => Some(Self::Suffix),
            "strip_links" => Some(Self::StripLinks),
            "strip_mentions" => Some(Self::StripMentions),
            "strip_telegram_links" => Some(Self::StripTelegramLinks),
            _ => None,
        }
    }

    /// The store's name for this kind.
    pub fn store_name(self) -> &'static str {
        match self {
            Self::Whitelist => "keyword_whitelist",
            Self::Blacklist => "keyword_blacklist",
            Self::Replace => "text_replace",
            Self::Prefix => "add_prefix",
            Self::Suffix => "add_suffix",
            Self::StripLinks => "strip_links",
            Self::StripMentions => "strip_mentions",
            Self::StripTelegramLinks => "strip_telegram_links",
        }
    }

    fn is_strip(self) -> bool {
        matches!(
            self,
            Self::StripLinks | Self::StripMentions | Self::StripTelegramLinks
        )
    }
}

/// A single filtering or rewriting rule.
///
/// Prefix and suffix rules carry their text in `replacement`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformRule {
    pub kind: RuleKind,
    pub pattern: String,
    pub replacement: String,
    pub is_regex: bool,
    pub enabled: bool,
}

impl TransformRule {
    pub fn new(kind: RuleKind, pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            kind,
            pattern: pattern.into(),
            replacement: replacement.into(),
            is_regex: false,
            enabled: true,
        }
    }

    pub fn whitelist(pattern: impl Into<String>) -> Self {
        Self::new(RuleKind::Whitelist, pattern, "")
    }

    pub fn blacklist(pattern: impl Into<String>) -> Self {
        Self::new(RuleKind::Blacklist, pattern, "")
    }

    pub fn replace(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self::new(RuleKind::Replace, pattern, replacement)
    }

    pub fn prefix(text: impl Into<String>) -> Self {
        Self::new(RuleKind::Prefix, "", text)
    }

    pub fn suffix(text: impl Into<String>) -> Self {
        Self::new(RuleKind::Suffix, "", text)
    }

    pub fn strip(kind: RuleKind) -> Self {
        Self::new(kind, "", "")
    }

    /// Treat `pattern` as a regular expression.
    pub fn regex(mut self) -> Self {
        self.is_regex = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Outcome of running a message through a rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransformResult {
    pub should_forward: bool,
    pub original_text: String,
    pub transformed_text: String,
    /// Decision trace, in the order rules fired.
    pub matched_rules: Vec<String>,
    pub blocked_by: Option<String>,
}

impl TransformResult {
    fn passthrough(text: &str) -> Self {
        Self {
            should_forward: true,
            original_text: text.to_string(),
            transformed_text: text.to_string(),
            matched_rules: Vec::new(),
            blocked_by: None,
        }
    }
}

/// A rule with its case-insensitive matcher compiled once up front.
///
/// Literal patterns compile to an escaped regex (used for substitution);
/// a malformed regex leaves `matcher` empty.
#[derive(Debug, Clone)]
struct CompiledRule {
    rule: TransformRule,
    matcher: Option<Regex>,
}

impl CompiledRule {
    fn compile(rule: TransformRule) -> Self {
        let matcher = if rule.pattern.is_empty() {
            None
        } else {
            let source = if rule.is_regex {
                rule.pattern.clone()
            } else {
                regex::escape(&rule.pattern)
            };
            match RegexBuilder::new(&source).case_insensitive(true).build() {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(
                        kind = rule.kind.as_str(),
                        pattern = %rule.pattern,
                        "Ignoring malformed rule pattern: {e}"
                    );
                    None
                }
            }
        };
        Self { rule, matcher }
    }

    fn matches(&self, text: &str) -> bool {
        if self.rule.pattern.is_empty() {
            return false;
        }
        if self.rule.is_regex {
            self.matcher.as_ref().is_some_and(|re| re.is_match(text))
        } else {
            text.to_lowercase().contains(&self.rule.pattern.to_lowercase())
        }
    }

    fn apply_replacement(&self, text: &str) -> String {
        let Some(re) = &self.matcher else {
            return text.to_string();
        };
        if self.rule.is_regex {
            re.replace_all(text, self.rule.replacement.as_str()).into_owned()
        } else {
            re.replace_all(text, NoExpand(&self.rule.replacement))
                .into_owned()
        }
    }
}

/// An immutable, ordered rule set.
#[derive(Debug, Clone, Default)]
pub struct MessageTransformer {
    rules: Vec<CompiledRule>,
}

impl MessageTransformer {
    pub fn new(rules: Vec<TransformRule>) -> Self {
        Self {
            rules: rules.into_iter().map(CompiledRule::compile).collect(),
        }
    }

    /// A transformer that forwards everything unchanged.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn rules(&self) -> impl Iterator<Item = &TransformRule> {
        self.rules.iter().map(|c| &c.rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run `text` through the rule set.
    pub fn transform(&self, text: &str) -> TransformResult {
        let mut result = TransformResult::passthrough(text);
        if text.is_empty() {
            return result;
        }

        let enabled: Vec<&CompiledRule> = self.rules.iter().filter(|c| c.rule.enabled).collect();
        let of_kind = |kind: RuleKind| enabled.iter().copied().filter(move |c| c.rule.kind == kind);

        let whitelist: Vec<&CompiledRule> = of_kind(RuleKind::Whitelist).collect();
        if !whitelist.is_empty() {
            match whitelist.iter().find(|c| c.matches(text)) {
                Some(hit) => result
                    .matched_rules
                    .push(format!("whitelist:{}", hit.rule.pattern)),
                None => {
                    result.should_forward = false;
                    result.blocked_by = Some("No whitelist pattern matched".to_string());
                    return result;
                }
            }
        }

        if let Some(hit) = of_kind(RuleKind::Blacklist).find(|c| c.matches(text)) {
            result.should_forward = false;
            result.blocked_by = Some(format!("Blacklist matched: {}", hit.rule.pattern));
            result
                .matched_rules
                .push(format!("blacklist:{}", hit.rule.pattern));
            return result;
        }

        let mut current = text.to_string();

        for strip in enabled.iter().filter(|c| c.rule.kind.is_strip()) {
            current = match strip.rule.kind {
                RuleKind::StripLinks => strip_links(&current),
                RuleKind::StripMentions => strip_mentions(&current),
                _ => strip_telegram_links(&current),
            };
            result.matched_rules.push(strip.rule.kind.as_str().to_string());
        }

        for replace in of_kind(RuleKind::Replace) {
            if replace.matches(&current) {
                current = replace.apply_replacement(&current);
                result.matched_rules.push(format!(
                    "replace:{}->{}",
                    replace.rule.pattern, replace.rule.replacement
                ));
            }
        }

        for prefix in of_kind(RuleKind::Prefix) {
            if !prefix.rule.replacement.is_empty() {
                current = format!("{}{}", prefix.rule.replacement, current);
                result
                    .matched_rules
                    .push(format!("prefix:{}", prefix.rule.replacement));
            }
        }

        for suffix in of_kind(RuleKind::Suffix) {
            if !suffix.rule.replacement.is_empty() {
                current.push_str(&suffix.rule.replacement);
                result
                    .matched_rules
                    .push(format!("suffix:{}", suffix.rule.replacement));
            }
        }

        result.transformed_text = collapse_whitespace(&current);
        result
    }
}

/// Run `text` through `rules` without keeping a compiled transformer around.
pub fn transform(text: &str, rules: &[TransformRule]) -> TransformResult {
    MessageTransformer::new(rules.to_vec()).transform(text)
}

/// Remove http(s) URLs.
pub fn strip_links(text: &str) -> String {
    URL_RE.replace_all(text, "").trim().to_string()
}

/// Remove `@mentions`.
pub fn strip_mentions(text: &str) -> String {
    MENTION_RE.replace_all(text, "").trim().to_string()
}

/// Remove `t.me` / `telegram.me` links, leaving other URLs alone.
pub fn strip_telegram_links(text: &str) -> String {
    TELEGRAM_LINK_RE.replace_all(text, "").trim().to_string()
}

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE_RE.replace_all(text, " ").trim().to_string()
}
