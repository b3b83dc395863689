//! Model-hint extraction.
//!
//! Users can steer provider/model selection inline: "a todo list using
//! opus", "a clock, haiku", "a timer (ollama)". The matched hint is stripped
//! from the prompt before sanitation and scoring.

use once_cell::sync::Lazy;
use regex::Regex;

/// A parsed model hint: a provider and optionally an exact model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelHint {
    /// Provider name (`claude`, `openai`, `ollama`).
    pub provider: &'static str,
    /// Exact model, when the alias pins one.
    pub model: Option<&'static str>,
}

/// Alias table. Longer aliases come first so "gpt-4" wins over "gpt".
const ALIASES: &[(&str, &str, Option<&str>)] = &[
    ("opus", "claude", Some("claude-opus-4-6")),
    ("sonnet", "claude", Some("claude-sonnet-4-5")),
    ("haiku", "claude", Some("claude-haiku")),
    ("claude", "claude", None),
    ("gpt-4", "openai", Some("gpt-4o")),
    ("gpt", "openai", None),
    ("openai", "openai", None),
    ("ollama", "ollama", None),
    ("local", "ollama", None),
];

fn alias_group() -> String {
    ALIASES
        .iter()
        .map(|(alias, _, _)| regex::escape(alias))
        .collect::<Vec<_>>()
        .join("|")
}

static LEADING_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:use|using|with|via|by)\s+({})\b",
        alias_group()
    ))
    .unwrap()
});

static TRAILING_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?i),\s*({})\s*$", alias_group())).unwrap());

static PAREN_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?i)\(\s*({})\s*\)", alias_group())).unwrap());

fn lookup(alias: &str) -> Option<ModelHint> {
    let lower = alias.to_lowercase();
    ALIASES
        .iter()
        .find(|(a, _, _)| *a == lower)
        .map(|(_, provider, model)| ModelHint { provider, model: *model })
}

/// Extract a model hint, returning the stripped prompt and the hint.
pub fn extract_model_hint(prompt: &str) -> (String, Option<ModelHint>) {
    for pattern in [&*LEADING_HINT, &*TRAILING_HINT, &*PAREN_HINT] {
        if let Some(captures) = pattern.captures(prompt) {
            if let Some(hint) = lookup(&captures[1]) {
                let stripped = pattern.replace(prompt, "").to_string();
                let stripped = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
                return (stripped, Some(hint));
            }
        }
    }
    (prompt.to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn using_alias_is_extracted_and_stripped() {
        let (prompt, hint) = extract_model_hint("a todo list using opus");
        assert_eq!(prompt, "a todo list");
        let hint = hint.unwrap();
        assert_eq!(hint.provider, "claude");
        assert_eq!(hint.model, Some("claude-opus-4-6"));
    }

    #[test]
    fn trailing_comma_alias() {
        let (prompt, hint) = extract_model_hint("a clock, haiku");
        assert_eq!(prompt, "a clock");
        assert_eq!(hint.unwrap().provider, "claude");
    }

    #[test]
    fn parenthesized_alias() {
        let (prompt, hint) = extract_model_hint("a timer (ollama) with sounds");
        assert_eq!(prompt, "a timer with sounds");
        assert_eq!(hint.unwrap().provider, "ollama");
    }

    #[test]
    fn local_maps_to_ollama() {
        let (_, hint) = extract_model_hint("a notes app via local");
        let hint = hint.unwrap();
        assert_eq!(hint.provider, "ollama");
        assert_eq!(hint.model, None);
    }

    #[test]
    fn no_hint_leaves_prompt_untouched() {
        let (prompt, hint) = extract_model_hint("a drawing app with layers");
        assert_eq!(prompt, "a drawing app with layers");
        assert!(hint.is_none());
    }

    #[test]
    fn ordinary_words_are_not_hints() {
        let (_, hint) = extract_model_hint("a recipe book with photos");
        assert!(hint.is_none());
    }
}
