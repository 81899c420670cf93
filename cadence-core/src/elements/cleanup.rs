//! `text_cleanup`: deterministic text normalisation.
//!
//! Applied in order: trim and collapse whitespace, word-boundary
//! replacements (case of the matched word is carried over), first-letter
//! capitalisation, terminal punctuation.

use std::any::Any;

use async_trait::async_trait;
use tracing::debug;

use crate::context::PipelineContext;
use crate::element::descriptor::{ConnectionRules, ConstraintSet, DataType};
use crate::element::{Element, ElementMetadata, ElementSettings};

use super::TEXT_CLEANUP;

pub struct TextCleanupElement {
    settings: ElementSettings,
}

impl TextCleanupElement {
    pub fn new() -> Self {
        Self {
            settings: ElementSettings::default(),
        }
    }

    /// Run the configured cleanup over `text`. Returns the new text and the
    /// number of replacements made.
    pub fn clean(&self, text: &str) -> (String, usize) {
        let mut out = collapse_whitespace(text);
        if out.is_empty() {
            return (out, 0);
        }

        let mut replaced = 0;
        if let Some(replacements) = self.settings.config_object("replacements") {
            for (needle, replacement) in replacements {
                let Some(replacement) = replacement.as_str() else {
                    continue;
                };
                let (next, count) = replace_word_case_aware(&out, needle.trim(), replacement.trim());
                out = next;
                replaced += count;
            }
            // Empty replacements leave double spaces behind.
            out = collapse_whitespace(&out);
        }

        if self.settings.config_bool("capitalize").unwrap_or(true) {
            out = capitalize_first(&out);
        }
        if self.settings.config_bool("terminalPunctuation").unwrap_or(false) {
            out = ensure_terminal_punctuation(&out);
        }
        (out, replaced)
    }
}

impl Default for TextCleanupElement {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Element for TextCleanupElement {
    fn element_type(&self) -> &str {
        TEXT_CLEANUP
    }

    fn metadata(&self) -> ElementMetadata {
        ElementMetadata::new(
            "Clean Up Text",
            "Normalises whitespace, applies replacements and capitalisation",
            "text.badge.checkmark",
        )
    }

    fn constraints(&self) -> ConstraintSet {
        ConstraintSet::CANNOT_BE_FIRST | ConstraintSet::OPTIONAL
    }

    fn connection_rules(&self) -> ConnectionRules {
        ConnectionRules::new([DataType::Text, DataType::RichText], DataType::Text)
    }

    fn settings(&self) -> &ElementSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut ElementSettings {
        &mut self.settings
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    async fn process(&mut self, ctx: &PipelineContext) -> anyhow::Result<()> {
        let (cleaned, replacements) = self.clean(&ctx.text());
        debug!(replacements, "text cleaned");
        ctx.set_text(cleaned);
        ctx.set_custom_data("cleanupReplacements", &replacements)?;
        Ok(())
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '\''
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Replace whole-word, case-insensitive occurrences of `needle`.
fn replace_word_case_aware(text: &str, needle: &str, replacement: &str) -> (String, usize) {
    let needle: Vec<char> = needle.chars().collect();
    if needle.is_empty() || text.is_empty() {
        return (text.to_string(), 0);
    }

    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut count = 0;
    let mut i = 0;
    while i < chars.len() {
        let end = i + needle.len();
        let is_match = end <= chars.len()
            && chars[i..end]
                .iter()
                .zip(&needle)
                .all(|(a, b)| a.to_lowercase().eq(b.to_lowercase()))
            && (i == 0 || !is_word_char(chars[i - 1]))
            && (end == chars.len() || !is_word_char(chars[end]));
        if is_match {
            let source: String = chars[i..end].iter().collect();
            out.push_str(&match_case(&source, replacement));
            count += 1;
            i = end;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    (out, count)
}

/// Carry the case pattern of `source` (ALL CAPS or Capitalised) over.
fn match_case(source: &str, replacement: &str) -> String {
    let letters: Vec<char> = source.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() > 1 && letters.iter().all(|c| c.is_uppercase()) {
        replacement.to_uppercase()
    } else if source.chars().next().is_some_and(char::is_uppercase) {
        capitalize_first(replacement)
    } else {
        replacement.to_string()
    }
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn ensure_terminal_punctuation(text: &str) -> String {
    match text.chars().last() {
        None => String::new(),
        Some(c) if matches!(c, '.' | '!' | '?' | '…' | ':' | ';') => text.to_string(),
        Some(_) => format!("{text}."),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn element(config: serde_json::Value) -> TextCleanupElement {
        let mut element = TextCleanupElement::new();
        element.set_configuration(config.as_object().cloned().expect("object"));
        element
    }

    #[test]
    fn collapses_whitespace_and_capitalizes_by_default() {
        let (out, n) = element(json!({})).clean("  hello \n  world\t ");
        assert_eq!(out, "Hello world");
        assert_eq!(n, 0);
    }

    #[test]
    fn replacements_respect_word_boundaries_and_case() {
        let cleanup = element(json!({
            "replacements": {"gonna": "going to", "api": "API"},
            "capitalize": false
        }));
        let (out, n) = cleanup.clean("Gonna call the api, not the rapid apis. GONNA");
        assert_eq!(out, "Going to call the API, not the rapid apis. GOING TO");
        assert_eq!(n, 3);
    }

    #[test]
    fn non_string_replacements_are_ignored() {
        let (out, n) = element(json!({"replacements": {"one": 1}})).clean("one two");
        assert_eq!(out, "One two");
        assert_eq!(n, 0);
    }

    #[test]
    fn terminal_punctuation_is_opt_in() {
        let cleanup = element(json!({"terminalPunctuation": true}));
        assert_eq!(cleanup.clean("done").0, "Done.");
        assert_eq!(cleanup.clean("really?").0, "Really?");
        assert_eq!(cleanup.clean("   ").0, "");
    }

    #[test]
    fn match_case_handles_single_letters() {
        assert_eq!(match_case("I", "me"), "Me");
        assert_eq!(match_case("OK", "okay"), "OKAY");
        assert_eq!(match_case("ok", "okay"), "okay");
    }

    #[tokio::test]
    async fn process_rewrites_context_text() {
        let ctx = PipelineContext::new().with_text("  so   um yes ");
        let mut cleanup = element(json!({"replacements": {"um": ""}}));
        cleanup.process(&ctx).await.expect("process");
        assert_eq!(ctx.text(), "So yes");
        assert_eq!(ctx.custom_data::<usize>("cleanupReplacements"), Some(1));
        assert_eq!(ctx.original_text(), "  so   um yes ");
    }
}
