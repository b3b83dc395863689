//! The rule tables. Compiled once on first use; the engine treats them as
//! immutable, which keeps every run independent of call order.

use once_cell::sync::Lazy;
use regex::Regex;

use lumos_types::Severity;

/// One deterministic rule: a stable id, a pre-compiled pattern, a severity
/// and a human-readable description.
pub struct Rule {
    pub id: &'static str,
    pub pattern: Regex,
    pub severity: Severity,
    pub description: &'static str,
}

fn rule(id: &'static str, pattern: &str, severity: Severity, description: &'static str) -> Rule {
    Rule {
        id,
        // Patterns are fixed at compile time; a failure here is a programming
        // error caught by the rule-table test below.
        pattern: Regex::new(pattern).unwrap(),
        severity,
        description,
    }
}

/// Rules applied to HTML/JS app bodies.
pub static CODE_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    use Severity::{Critical, Warning};
    vec![
        rule(
            "eval_call",
            r"\beval\s*\(",
            Critical,
            "direct eval() executes arbitrary strings",
        ),
        rule(
            "function_constructor",
            r#"\bnew\s+Function\s*\(|\bFunction\s*\(\s*["']"#,
            Critical,
            "Function constructor is eval in disguise",
        ),
        rule(
            "indirect_eval",
            r#"\(\s*0\s*,\s*eval\s*\)|(window|globalThis|self)\s*\[\s*["']eval["']\s*\]|["']ev["']\s*\+\s*["']al["']"#,
            Critical,
            "indirect or string-built eval access",
        ),
        rule(
            "dynamic_import",
            r"\bimport\s*\(",
            Critical,
            "dynamic import() loads code at runtime",
        ),
        rule(
            "parent_frame_access",
            r"window\s*\.\s*(parent|top)\b|\b(parent|top)\s*\.\s*(window|document|location|postMessage)",
            Critical,
            "reaches out of the sandbox frame",
        ),
        rule(
            "frame_internals",
            r"\bcontentWindow\b|\bframeElement\b",
            Critical,
            "touches embedding frame internals",
        ),
        rule(
            "cookie_access",
            r"document\s*\.\s*cookie",
            Critical,
            "cookie access can leak shell state",
        ),
        rule(
            "net_primitive",
            r"\bfetch\s*\(|\bnew\s+(XMLHttpRequest|WebSocket|EventSource)\b|\bnavigator\s*\.\s*sendBeacon\b",
            Warning,
            "direct network primitive; use the kernel http capability",
        ),
        rule(
            "string_timer",
            r#"\bset(Timeout|Interval)\s*\(\s*["'`]"#,
            Critical,
            "string-argument timer is eval",
        ),
        rule(
            "encoded_payload",
            r"\batob\s*\(|String\s*\.\s*fromCharCode",
            Warning,
            "decodes an obfuscated payload",
        ),
        rule(
            "prototype_pollution",
            r"__proto__|Object\s*\.\s*prototype\s*\[|\bconstructor\s*\[",
            Critical,
            "prototype pollution vector",
        ),
        rule(
            "global_override",
            r#"(window|globalThis|self)\s*\.\s*(eval|fetch|XMLHttpRequest|postMessage)\s*=|(window|globalThis)\s*\[\s*["'][^"']+["']\s*\]\s*="#,
            Critical,
            "overrides a global the sandbox relies on",
        ),
        rule(
            "inline_handler_dangerous",
            r#"\bon(click|load|error|mouseover|focus)\s*=\s*["'][^"']*(eval|atob|fetch|Function)\s*\("#,
            Critical,
            "inline event handler invoking a dangerous API",
        ),
        rule(
            "document_write",
            r"document\s*\.\s*write(ln)?\s*\(",
            Warning,
            "document.write can rewrite the document",
        ),
        rule(
            "innerhtml_assign",
            r"\.\s*(innerHTML|outerHTML)\s*=",
            Warning,
            "raw innerHTML assignment; prefer textContent",
        ),
        rule(
            "blob_url",
            r"URL\s*\.\s*createObjectURL\s*\(|\bnew\s+Blob\s*\(",
            Critical,
            "Blob URLs smuggle executable content",
        ),
        rule(
            "shared_array_buffer",
            r"\bSharedArrayBuffer\b",
            Critical,
            "SharedArrayBuffer enables timing attacks",
        ),
        rule(
            "webrtc",
            r"\bRTC(PeerConnection|DataChannel)\b",
            Critical,
            "WebRTC bypasses the kernel network gate",
        ),
        rule(
            "import_scripts",
            r"\bimportScripts\s*\(",
            Critical,
            "importScripts loads remote code into a worker",
        ),
        rule(
            "location_redirect",
            r"(window|document|top|self)\s*\.\s*location\s*=|location\s*\.\s*(href\s*=|replace\s*\(|assign\s*\()",
            Critical,
            "navigates the frame away from the app",
        ),
        rule(
            "wildcard_postmessage",
            r#"postMessage\s*\([^)]*,\s*["']\*["']"#,
            Critical,
            "wildcard-origin postMessage leaks to any listener",
        ),
        rule(
            "mutation_observer",
            r"\bnew\s+MutationObserver\s*\(",
            Warning,
            "MutationObserver watching the document",
        ),
        rule(
            "image_exfil",
            r#"\bnew\s+Image\s*\(\s*\)|createElement\s*\(\s*["']img["']\s*\)\s*\.\s*src"#,
            Critical,
            "constructed image requests exfiltrate data",
        ),
        rule(
            "dns_prefetch",
            r#"rel\s*=\s*["'](dns-prefetch|preconnect)["']"#,
            Warning,
            "DNS prefetch hints leak visited origins",
        ),
        rule(
            "service_worker",
            r"serviceWorker\s*\.\s*register|navigator\s*\.\s*serviceWorker",
            Critical,
            "service workers outlive the sandbox",
        ),
        rule(
            "iframe_injection",
            r#"createElement\s*\(\s*["']iframe["']|<iframe[^>]*srcdoc"#,
            Critical,
            "injects a nested frame",
        ),
        rule(
            "svg_inline_script",
            r"<svg[^>]*\bonload\s*=|<svg[^>]*>\s*<script",
            Critical,
            "SVG carrying inline script",
        ),
        rule(
            "css_remote_import",
            r#"@import\s+(url\s*\(\s*)?["']?https?://"#,
            Critical,
            "remote CSS import pulls foreign styles",
        ),
        rule(
            "css_remote_url",
            r#"url\s*\(\s*["']?https?://"#,
            Warning,
            "remote url() in CSS can beacon out",
        ),
    ]
});

/// Rules applied to container build recipes. Comment lines never reach them.
pub static RECIPE_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    use Severity::{Critical, Warning};
    vec![
        rule(
            "privileged_flag",
            r"--privileged\b",
            Critical,
            "privileged containers own the host",
        ),
        rule(
            "host_network",
            r"--net(work)?[=\s]+host\b",
            Critical,
            "host networking escapes isolation",
        ),
        rule(
            "root_volume_mount",
            r"(^|\s)(-v|--volume)[=\s]+/\s*:",
            Critical,
            "binds the host root filesystem",
        ),
        rule(
            "unpinned_base_tag",
            r"^\s*FROM\s+\S+:latest\b",
            Warning,
            "unpinned :latest base image",
        ),
    ]
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_patterns_compile_and_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for rule in CODE_RULES.iter().chain(RECIPE_RULES.iter()) {
            assert!(seen.insert(rule.id), "duplicate rule id {}", rule.id);
        }
        assert!(CODE_RULES.len() >= 25);
        assert_eq!(RECIPE_RULES.len(), 4);
    }
}
