//! Confidence scoring and clarification questions.
//!
//! Before spending tokens on a vague prompt, the gateway scores it across
//! four 0–1 components. Below the threshold the caller gets clarification
//! questions instead of a generation; the LLM is never invoked.

use once_cell::sync::Lazy;
use regex::Regex;

/// Score below which a generation turns into a clarification request.
pub const CONFIDENCE_THRESHOLD: f64 = 0.45;

/// Maximum clarification questions returned.
pub const MAX_QUESTIONS: usize = 3;

static UI_TERMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(buttons?|lists?|display|show|inputs?|forms?|fields?|colors?|timers?|charts?|tables?|grids?|menus?|tabs?|cards?|panels?)\b").unwrap()
});
static ACTION_TERMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(add|delete|remove|track|save|edit|click|drag|sort|filter|search|count|start|stop|reset)s?\b").unwrap()
});
static DATA_TERMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(numbers?|text|dates?|times?|items?|scores?|notes?|tasks?|names?|prices?|amounts?|minutes?|seconds?)\b").unwrap()
});
static LAYOUT_TERMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(grid|column|row|sidebar|header|footer|section|layout|split|top|bottom|left|right)\b").unwrap()
});
static VAGUE_TERMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(something|anything|stuff|things?|cool|nice|awesome|whatever|maybe|somehow|etc|some kind)\b").unwrap()
});
static CAPABILITY_TERMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(saved?|stores?|remember|timers?|reminds?|reminders?|clipboard|fetch|weather|news|offline|persists?)\b").unwrap()
});

/// Per-component breakdown of a confidence score.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceReport {
    /// Weighted mean of the four components.
    pub score: f64,
    /// Word-count component.
    pub length: f64,
    /// UI/action/data/layout specificity component.
    pub specificity: f64,
    /// Vagueness-penalized clarity component.
    pub clarity: f64,
    /// Capability-keyword clarity component.
    pub capability: f64,
}

impl ConfidenceReport {
    /// Whether the prompt clears the generation threshold.
    pub fn passes(&self) -> bool {
        self.score >= CONFIDENCE_THRESHOLD
    }
}

/// Score a prompt. Deterministic and cheap: four regex families plus word
/// counting.
pub fn score(prompt: &str) -> ConfidenceReport {
    let words = prompt.split_whitespace().count();

    // Very short prompts can't carry much intent; saturates at 12 words.
    let length = (words as f64 / 12.0).min(1.0);

    let specificity = [&*UI_TERMS, &*ACTION_TERMS, &*DATA_TERMS, &*LAYOUT_TERMS]
        .iter()
        .filter(|re| re.is_match(prompt))
        .count() as f64
        / 4.0;

    let vague_hits = VAGUE_TERMS.find_iter(prompt).count();
    let clarity = (1.0 - 0.25 * vague_hits as f64).max(0.0);

    let cap_hits = CAPABILITY_TERMS.find_iter(prompt).count();
    let capability = if cap_hits == 0 { 0.5 } else { (0.5 + 0.25 * cap_hits as f64).min(1.0) };

    let score = 0.2 * length + 0.3 * specificity + 0.3 * clarity + 0.2 * capability;
    ConfidenceReport { score, length, specificity, clarity, capability }
}

/// Generate up to [`MAX_QUESTIONS`] clarification questions for a low-scoring
/// prompt, targeting its weakest components.
pub fn questions(report: &ConfidenceReport) -> Vec<String> {
    let mut ranked: Vec<(f64, &str)> = vec![
        (report.length, "Can you describe the app in a bit more detail?"),
        (
            report.specificity,
            "What should the app show, and what actions should be possible?",
        ),
        (
            report.clarity,
            "Some of the wording is open-ended. What specifically should it do?",
        ),
        (
            report.capability,
            "Should the app save data, use timers, or reach the network?",
        ),
    ];
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
    ranked
        .into_iter()
        .filter(|(component, _)| *component < 0.75)
        .take(MAX_QUESTIONS)
        .map(|(_, q)| q.to_string())
        .collect()
}
