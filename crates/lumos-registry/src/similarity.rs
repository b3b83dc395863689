//! Prompt normalization and trigram similarity.
//!
//! Similarity is the Dice coefficient over space-padded character trigrams of
//! the normalized prompt. Normalization drops the words that carry no signal
//! in generation prompts ("please make me a…") so that "build a todo list"
//! and "please create a todo list app" land close together.

use std::collections::HashSet;

/// Articles and demonstratives dropped during normalization.
const ARTICLES: &[&str] = &["a", "an", "the", "this", "that", "some"];

/// Filler words common in generation prompts.
const FILLERS: &[&str] = &[
    "please", "make", "build", "create", "can", "you", "me", "my", "i", "want",
    "need", "would", "like", "app", "application", "simple",
];

/// Lowercase, strip punctuation, collapse whitespace, drop articles and
/// filler words.
pub fn normalize(prompt: &str) -> String {
    let lower = prompt.to_lowercase();
    let cleaned: String = lower
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    cleaned
        .split_whitespace()
        .filter(|w| !ARTICLES.contains(w) && !FILLERS.contains(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Space-padded trigram set of a normalized string.
fn trigrams(text: &str) -> HashSet<[char; 3]> {
    let padded: Vec<char> = std::iter::once(' ')
        .chain(text.chars())
        .chain(std::iter::once(' '))
        .collect();
    padded.windows(3).map(|w| [w[0], w[1], w[2]]).collect()
}

/// Dice coefficient over trigram sets, in `[0.0, 1.0]`.
pub fn dice(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return if a == b { 1.0 } else { 0.0 };
    }
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    (2.0 * shared as f64) / (ta.len() + tb.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_drops_fillers() {
        assert_eq!(normalize("Please make me a Todo List!"), "todo list");
        assert_eq!(normalize("build THE pomodoro timer"), "pomodoro timer");
    }

    #[test]
    fn identical_prompts_score_one() {
        let n = normalize("a pomodoro timer");
        assert!((dice(&n, &n) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn related_prompts_score_above_threshold() {
        let a = normalize("a pomodoro timer with breaks");
        let b = normalize("please build a pomodoro timer");
        assert!(dice(&a, &b) >= 0.25, "got {}", dice(&a, &b));
    }

    #[test]
    fn unrelated_prompts_score_low() {
        let a = normalize("a pomodoro timer");
        let b = normalize("markdown notes editor");
        assert!(dice(&a, &b) < 0.25);
    }

    #[test]
    fn empty_inputs_do_not_panic() {
        assert_eq!(dice("", ""), 1.0);
        assert_eq!(dice("abc", ""), 0.0);
    }
}
