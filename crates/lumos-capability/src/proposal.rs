//! Keyword heuristics that pre-propose capabilities and route prompts to an
//! execution backend before any model is consulted.

use lumos_types::{AppType, Capability};

/// Keyword groups mapped to the capability they suggest.
const KEYWORD_CAPS: &[(&[&str], Capability)] = &[
    (
        &["save", "store", "remember", "note", "todo", "list", "track", "journal"],
        Capability::StorageLocal,
    ),
    (
        &["timer", "clock", "pomodoro", "remind", "countdown", "stopwatch", "alarm"],
        Capability::TimerBasic,
    ),
    (&["clipboard", "copy", "paste"], Capability::ClipboardRw),
    (
        &["fetch", "weather", "news", "stock", "api", "http", "download", "search the web"],
        Capability::NetworkHttp,
    ),
    (
        &["server", "daemon", "service", "background", "bot", "scraper", "cron"],
        Capability::ProcessBackground,
    ),
];

/// Keywords that route a prompt to a container process rather than an iframe.
const PROCESS_KEYWORDS: &[&str] = &[
    "server", "daemon", "service", "api endpoint", "webhook", "bot", "scraper",
    "scrape", "cron", "database", "backend", "long-running", "background process",
];

/// Propose capabilities from prompt keywords.
///
/// The proposal always includes `ui:window`; everything else is a hint the
/// user confirms at grant time.
pub fn propose_capabilities(prompt: &str) -> Vec<Capability> {
    let lower = prompt.to_lowercase();
    let mut caps = vec![Capability::UiWindow];
    for (keywords, cap) in KEYWORD_CAPS {
        if keywords.iter().any(|k| lower.contains(k)) && !caps.contains(cap) {
            caps.push(*cap);
        }
    }
    caps
}

/// Static routing hint: does this prompt describe a container process or a
/// shell-rendered document?
///
/// The LLM router's `type` field wins over this when a router model is
/// reachable.
pub fn infer_app_type(prompt: &str) -> AppType {
    let lower = prompt.to_lowercase();
    if PROCESS_KEYWORDS.iter().any(|k| lower.contains(k)) {
        AppType::Process
    } else {
        AppType::Iframe
    }
}
