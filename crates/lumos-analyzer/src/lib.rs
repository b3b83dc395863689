#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lumos-analyzer** – Deterministic pattern engine over generated code.
//!
//! Every artifact the gateway produces passes through this crate before it is
//! published or launched: HTML/JS app bodies go through the code rules,
//! container build recipes through the recipe rules. There is no LLM in the
//! loop; the engine is a fixed table of pre-compiled regexes, so repeated
//! runs over the same input always produce the same findings.
//!
//! A run *passes* iff no CRITICAL rule matched. WARNING findings are
//! surfaced to the caller but never block.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use lumos_types::{AnalysisReport, Finding, Severity};

mod rules;
use rules::{Rule, CODE_RULES, RECIPE_RULES};

/// Marker comment the gateway injects around the in-app SDK. Lines carrying
/// it are exempt from analysis, as is the first-line capabilities comment.
pub const SDK_MARKER: &str = "lumos-sdk";

/// Maximum characters of the offending line kept in a finding snippet.
const SNIPPET_LIMIT: usize = 120;

static CAPABILITY_COMMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*(<!--|//|#)\s*capabilities\s*:"#).unwrap()
});

/// Analyze an HTML/JS app body against the code rule set.
pub fn analyze(code: &str) -> AnalysisReport {
    let report = run_rules(code, &CODE_RULES, false);
    debug!(
        passed = report.passed,
        critical = report.critical_count,
        warnings = report.warning_count,
        "code analysis complete"
    );
    report
}

/// Analyze a container build recipe against the recipe rule set.
///
/// Comment lines (starting with `#`) are ignored.
pub fn analyze_recipe(recipe: &str) -> AnalysisReport {
    let report = run_rules(recipe, &RECIPE_RULES, true);
    debug!(
        passed = report.passed,
        critical = report.critical_count,
        warnings = report.warning_count,
        "recipe analysis complete"
    );
    report
}

fn run_rules(text: &str, rules: &[Rule], skip_hash_comments: bool) -> AnalysisReport {
    let mut findings = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        if is_exempt(line) {
            continue;
        }
        if skip_hash_comments && line.trim_start().starts_with('#') {
            continue;
        }
        for rule in rules {
            if rule.pattern.is_match(line) {
                findings.push(Finding {
                    rule: rule.id.to_string(),
                    severity: rule.severity,
                    line: idx + 1,
                    snippet: snippet_of(line),
                    description: rule.description.to_string(),
                });
            }
        }
    }

    AnalysisReport::from_findings(findings)
}

/// Capability comments and the injected SDK marker are the kernel's own
/// lines; flagging them would block every legitimate artifact.
fn is_exempt(line: &str) -> bool {
    CAPABILITY_COMMENT.is_match(line) || line.contains(SDK_MARKER)
}

fn snippet_of(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.len() <= SNIPPET_LIMIT {
        trimmed.to_string()
    } else {
        let mut end = SNIPPET_LIMIT;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}

/// Convenience predicate: does the code pass the code rule set?
pub fn passes(code: &str) -> bool {
    analyze(code).passed
}
