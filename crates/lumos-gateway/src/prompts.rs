//! System prompts and output post-processing.
//!
//! The generation system prompt pins the model to the in-app SDK: no eval,
//! no direct fetch, no parent access, and a machine-readable capabilities
//! comment on line one. Post-processing strips the fences and chatter models
//! wrap around documents.

use once_cell::sync::Lazy;
use regex::Regex;

use lumos_types::Capability;

/// System prompt for iframe (HTML document) generation.
pub const IFRAME_SYSTEM_PROMPT: &str = "\
You generate complete, self-contained HTML applications for a sandboxed \
shell. Rules, all mandatory:
1. Output ONE full HTML document and nothing else. No markdown, no prose.
2. The FIRST line must be a capabilities comment: \
<!-- capabilities: cap1, cap2 --> choosing only from: ui:window, \
storage:local, timer:basic, clipboard:rw, network:http.
3. Never use eval, new Function, dynamic import, document.write, \
innerHTML with user data, Blob URLs, or service workers.
4. Never access window.parent, window.top, frames, or cookies.
5. Never call fetch or open sockets directly; use the injected lumos SDK \
(window.lumos.storage, window.lumos.http, window.lumos.notify).
6. Inline all CSS and JS. No external resources.";

/// System prompt for process (container) generation.
pub const PROCESS_SYSTEM_PROMPT: &str = "\
You generate containerized server applications. Output exactly three \
sections delimited by these markers, nothing before or after:
---DOCKERFILE---
<the container build recipe; its FIRST line must be a capabilities \
comment: # capabilities: cap1, cap2 choosing only from: process:background, \
process:network, process:volume, api:anthropic, network:http>
---CODE---
<the complete application source>
---END---
Pin base images to exact versions. The app must listen on the PORT \
environment variable.";

static FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```[a-zA-Z]*\n(.*?)\n?```\s*$").unwrap());

static CAPABILITY_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:<!--|//|#)\s*capabilities\s*:\s*([a-z:,\s-]+?)\s*(?:-->)?\s*$").unwrap()
});

/// Strip a wrapping markdown fence, then truncate leading chatter so the
/// result starts at the document proper.
pub fn post_process(raw: &str) -> String {
    let unfenced = match FENCE.captures(raw) {
        Some(captures) => captures[1].to_string(),
        None => raw.to_string(),
    };

    // Models sometimes preface the document; cut to the first thing that
    // can plausibly start one.
    let starts = ["<!DOCTYPE", "<!doctype", "<html", "<!--"];
    let cut = starts
        .iter()
        .filter_map(|s| unfenced.find(s))
        .min()
        .unwrap_or(0);
    unfenced[cut..].trim().to_string()
}

/// Extract declared capabilities from the first-line comment.
///
/// Unknown names are dropped; an absent or empty comment defaults to
/// `[ui:window]`.
pub fn extract_capabilities(code: &str) -> Vec<Capability> {
    let first_line = code.lines().next().unwrap_or("");
    let caps: Vec<Capability> = CAPABILITY_LINE
        .captures(first_line)
        .map(|captures| {
            captures[1]
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default();
    if caps.is_empty() {
        vec![Capability::UiWindow]
    } else {
        caps
    }
}

/// The two sections of a process generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSections {
    /// Container build recipe, capabilities comment on line 1.
    pub dockerfile: String,
    /// Application source.
    pub code: String,
}

/// Parse the marker-delimited process output.
pub fn parse_process_output(raw: &str) -> Option<ProcessSections> {
    let dockerfile_at = raw.find("---DOCKERFILE---")?;
    let code_at = raw.find("---CODE---")?;
    let end_at = raw.find("---END---")?;
    if !(dockerfile_at < code_at && code_at < end_at) {
        return None;
    }
    let dockerfile = raw[dockerfile_at + "---DOCKERFILE---".len()..code_at]
        .trim()
        .to_string();
    let code = raw[code_at + "---CODE---".len()..end_at].trim().to_string();
    if dockerfile.is_empty() || code.is_empty() {
        return None;
    }
    Some(ProcessSections { dockerfile, code })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_are_stripped() {
        let raw = "```html\n<!DOCTYPE html>\n<html></html>\n```";
        assert_eq!(post_process(raw), "<!DOCTYPE html>\n<html></html>");
    }

    #[test]
    fn leading_chatter_is_truncated() {
        let raw = "Sure! Here's your app:\n<!DOCTYPE html>\n<html></html>";
        assert!(post_process(raw).starts_with("<!DOCTYPE"));
    }

    #[test]
    fn capability_comment_start_survives() {
        let raw = "Here you go:\n<!-- capabilities: ui:window -->\n<html></html>";
        assert!(post_process(raw).starts_with("<!-- capabilities"));
    }

    #[test]
    fn declared_capabilities_are_extracted() {
        let code = "<!-- capabilities: ui:window, timer:basic, storage:local -->\n<html></html>";
        let caps = extract_capabilities(code);
        assert_eq!(
            caps,
            vec![Capability::UiWindow, Capability::TimerBasic, Capability::StorageLocal]
        );
    }

    #[test]
    fn hash_comment_works_for_recipes() {
        let recipe = "# capabilities: process:background, process:network\nFROM alpine:3.19";
        let caps = extract_capabilities(recipe);
        assert_eq!(
            caps,
            vec![Capability::ProcessBackground, Capability::ProcessNetwork]
        );
    }

    #[test]
    fn missing_comment_defaults_to_ui_window() {
        assert_eq!(extract_capabilities("<html></html>"), vec![Capability::UiWindow]);
    }

    #[test]
    fn unknown_capability_names_are_dropped() {
        let code = "<!-- capabilities: ui:window, root:everything -->\n<html></html>";
        assert_eq!(extract_capabilities(code), vec![Capability::UiWindow]);
    }

    #[test]
    fn process_sections_parse() {
        let raw = "---DOCKERFILE---\n# capabilities: process:background\nFROM alpine:3.19\n---CODE---\nprint('hi')\n---END---";
        let sections = parse_process_output(raw).unwrap();
        assert!(sections.dockerfile.starts_with("# capabilities"));
        assert_eq!(sections.code, "print('hi')");
    }

    #[test]
    fn missing_markers_are_rejected() {
        assert!(parse_process_output("FROM alpine").is_none());
        assert!(parse_process_output("---DOCKERFILE---\nx\n---CODE---\ny").is_none());
    }
}
