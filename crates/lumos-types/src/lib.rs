#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lumos-types** – Shared primitive data structures for the Lumos kernel.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, cryptography, or storage.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Security constants
//─────────────────────────────

/// Maximum allowed prompt length to prevent memory exhaustion attacks.
pub const MAX_PROMPT_LEN: usize = 32_768;

/// Maximum allowed size for generated app code.
pub const MAX_CODE_LEN: usize = 1_048_576; // 1MB

/// Maximum allowed size for capability tokens.
pub const MAX_TOKEN_LEN: usize = 8_192;

/// Default capability token lifetime in seconds (4 hours).
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 4 * 3600;

/// Length of the registry content address: the first 16 hex characters of
/// SHA-256(code). Kept short for URL compatibility; a collision across two
/// distinct 64-bit prefixes is theoretically possible but has never been the
/// deciding factor for a local, single-user registry.
pub const HASH_PREFIX_LEN: usize = 16;

//─────────────────────────────
//  Capabilities
//─────────────────────────────

/// A named permission granted per app.
///
/// The set is closed: generated code may only declare capabilities from this
/// list, and grants intersect requests against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// Render a window in the shell.
    #[serde(rename = "ui:window")]
    UiWindow,
    /// Read/write the app's persistent key-value store.
    #[serde(rename = "storage:local")]
    StorageLocal,
    /// Use timers.
    #[serde(rename = "timer:basic")]
    TimerBasic,
    /// Read and write the clipboard.
    #[serde(rename = "clipboard:rw")]
    ClipboardRw,
    /// Make outbound HTTP requests through the kernel.
    #[serde(rename = "network:http")]
    NetworkHttp,
    /// Run as a background container process.
    #[serde(rename = "process:background")]
    ProcessBackground,
    /// Container gets a network namespace (otherwise `none`).
    #[serde(rename = "process:network")]
    ProcessNetwork,
    /// Container gets a persistent volume bind.
    #[serde(rename = "process:volume")]
    ProcessVolume,
    /// Container receives the Anthropic API key.
    #[serde(rename = "api:anthropic")]
    ApiAnthropic,
}

impl Capability {
    /// All members of the closed capability set.
    pub const ALL: [Capability; 9] = [
        Capability::UiWindow,
        Capability::StorageLocal,
        Capability::TimerBasic,
        Capability::ClipboardRw,
        Capability::NetworkHttp,
        Capability::ProcessBackground,
        Capability::ProcessNetwork,
        Capability::ProcessVolume,
        Capability::ApiAnthropic,
    ];

    /// Canonical wire spelling of the capability.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::UiWindow => "ui:window",
            Capability::StorageLocal => "storage:local",
            Capability::TimerBasic => "timer:basic",
            Capability::ClipboardRw => "clipboard:rw",
            Capability::NetworkHttp => "network:http",
            Capability::ProcessBackground => "process:background",
            Capability::ProcessNetwork => "process:network",
            Capability::ProcessVolume => "process:volume",
            Capability::ApiAnthropic => "api:anthropic",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCapability(s.to_string()))
    }
}

/// Error returned when parsing a string outside the closed capability set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown capability: {0}")]
pub struct UnknownCapability(pub String);

//─────────────────────────────
//  Apps
//─────────────────────────────

/// Execution backend of a generated app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    /// Sandboxed HTML document rendered by the shell.
    Iframe,
    /// External container process.
    Process,
    /// WebAssembly module in the in-process sandbox.
    Wasm,
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppType::Iframe => "iframe",
            AppType::Process => "process",
            AppType::Wasm => "wasm",
        };
        f.write_str(s)
    }
}

/// A registry record describing one generated app.
///
/// `hash` is the content address: the first [`HASH_PREFIX_LEN`] hex characters
/// of SHA-256 over `code`. Identical code deduplicates to the same entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppEntry {
    /// Content address and primary key.
    pub hash: String,
    /// The prompt the app was generated from.
    pub prompt: String,
    /// Normalized form of the prompt used for similarity search.
    pub normalized_prompt: String,
    /// Human-readable title.
    pub title: String,
    /// Execution backend.
    pub app_type: AppType,
    /// The generated artifact (HTML document, process code, or WASM source).
    pub code: String,
    /// Container build recipe, present for process apps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    /// Capabilities the code declares.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Model that produced the artifact.
    pub model: String,
    /// Provider that produced the artifact.
    pub provider: String,
    /// Number of launches recorded, including dedup hits on publish.
    #[serde(default)]
    pub launches: u64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Free-form tags, including `source: community` for imported entries.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Optional markdown specification attached after generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    /// Accumulated up/down votes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<i64>,
}

//─────────────────────────────
//  Static analysis
//─────────────────────────────

/// Severity of an analyzer finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Blocks the operation.
    Critical,
    /// Surfaced to the caller, does not block.
    Warning,
}

/// One rule match produced by the static analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Stable identifier of the rule that fired.
    pub rule: String,
    /// Whether the finding blocks execution.
    pub severity: Severity,
    /// 1-based line number of the match.
    pub line: usize,
    /// The offending source excerpt, truncated.
    pub snippet: String,
    /// Human-readable description of what the rule detects.
    pub description: String,
}

/// Aggregate result of one analyzer run.
///
/// `passed` holds iff `critical_count == 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Whether the input may proceed to execution.
    pub passed: bool,
    /// Number of critical findings.
    pub critical_count: usize,
    /// Number of warning findings.
    pub warning_count: usize,
    /// All findings in source order.
    pub findings: Vec<Finding>,
}

impl AnalysisReport {
    /// Build a report from findings, deriving the counters.
    pub fn from_findings(findings: Vec<Finding>) -> Self {
        let critical_count = findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .count();
        let warning_count = findings.len() - critical_count;
        Self {
            passed: critical_count == 0,
            critical_count,
            warning_count,
            findings,
        }
    }
}

//─────────────────────────────
//  Scheduler state
//─────────────────────────────

/// Outcome of one scheduled task run, kept in the bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunRecord {
    /// When the run started.
    pub at: DateTime<Utc>,
    /// Whether the handler reported success.
    pub success: bool,
    /// Handler-provided summary or error text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Persisted per-task scheduler state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    /// Whether the timer may fire.
    pub enabled: bool,
    /// Configured interval in milliseconds. The effective interval is never
    /// below the scheduler's 60 s floor.
    pub interval_ms: u64,
    /// Last time the handler ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    /// Next scheduled fire time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    /// Total runs attempted.
    #[serde(default)]
    pub run_count: u64,
    /// Runs that returned success.
    #[serde(default)]
    pub success_count: u64,
    /// Runs that returned an error.
    #[serde(default)]
    pub error_count: u64,
    /// Errors since the last success; three trips the circuit breaker.
    #[serde(default)]
    pub consecutive_errors: u32,
    /// Reason the task was auto-disabled, e.g. `circuit-breaker`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    /// LLM calls charged against today's budget.
    #[serde(default)]
    pub llm_calls_today: u32,
    /// Budget day in `YYYY-MM-DD`; counters reset when the date rolls.
    #[serde(default)]
    pub llm_calls_date: String,
    /// Summary of the last successful run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<String>,
    /// Message of the last failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Bounded run history, newest last.
    #[serde(default)]
    pub history: Vec<TaskRunRecord>,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 0,
            last_run: None,
            next_run: None,
            run_count: 0,
            success_count: 0,
            error_count: 0,
            consecutive_errors: 0,
            disabled_reason: None,
            llm_calls_today: 0,
            llm_calls_date: String::new(),
            last_result: None,
            last_error: None,
            history: Vec::new(),
        }
    }
}

/// Maximum entries retained in [`TaskState::history`].
pub const TASK_HISTORY_LIMIT: usize = 20;

//─────────────────────────────
//  Models and routing
//─────────────────────────────

/// A model known to the resource monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model name as reported by the provider.
    pub name: String,
    /// Owning provider (`ollama`, `claude`, `openai`).
    pub provider: String,
    /// Approximate size in bytes, zero when unknown.
    #[serde(default)]
    pub size: u64,
    /// Capability ordinal, 1 (weakest) to 9 (strongest).
    pub tier: u8,
    /// Whether this model is a configured default rather than override-only.
    #[serde(default)]
    pub is_default: bool,
}

/// Prompt complexity classification used for model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Short, single-widget prompts.
    Simple,
    /// Prompts with one complex keyword or moderate length.
    Medium,
    /// Prompts with several complex keywords or substantial length.
    Complex,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Complexity::Simple => "simple",
            Complexity::Medium => "medium",
            Complexity::Complex => "complex",
        };
        f.write_str(s)
    }
}

/// Task categories the monitor maps to minimum model tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTask {
    /// Fast prompt classification; the *smallest* adequate model wins.
    Route,
    /// Simple generation.
    GenerateSimple,
    /// Medium generation.
    GenerateMedium,
    /// Complex generation.
    GenerateComplex,
    /// Background self-improvement work.
    Background,
}

//─────────────────────────────
//  Error taxonomy
//─────────────────────────────

/// Kind of failure surfaced by outward-facing operations.
///
/// The HTTP collaborator maps kinds onto status codes; inside the kernel they
/// ride on typed per-crate errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input.
    Validation,
    /// Critical analyzer findings halted the operation.
    AnalysisBlocked,
    /// The app lacks the required capability.
    CapabilityDenied,
    /// Storage quota exceeded.
    QuotaExceeded,
    /// CPU or wall-clock deadline exceeded.
    Timeout,
    /// No provider is configured or reachable.
    ProviderUnavailable,
    /// The provider returned an error.
    ProviderFailed,
    /// Ports or container slots exhausted.
    ResourceExhausted,
    /// Unknown path, hash, or app.
    NotFound,
    /// Duplicate app or conflicting operation.
    Conflict,
    /// Uncategorized internal failure.
    Internal,
}

impl ErrorKind {
    /// HTTP status code the thin API surface reports for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::QuotaExceeded => 413,
            ErrorKind::Internal => 500,
            _ => 400,
        }
    }
}

/// Structured result envelope for outward-facing operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpError {
    /// Failure category.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl OpError {
    /// Build an error envelope.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for OpError {}

//─────────────────────────────
//  Shared helpers
//─────────────────────────────

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
///
/// Storage paths and container volume binds are derived exclusively from the
/// sanitized form, which makes path traversal structurally impossible.
pub fn sanitize_app_id(app_id: &str) -> String {
    app_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// A generic string-keyed JSON object, used for app stores and task stats.
pub type JsonMap = BTreeMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_round_trip() {
        for cap in Capability::ALL {
            let parsed: Capability = cap.as_str().parse().unwrap();
            assert_eq!(parsed, cap);
            let json = serde_json::to_string(&cap).unwrap();
            assert_eq!(json, format!("\"{}\"", cap.as_str()));
        }
    }

    #[test]
    fn unknown_capability_rejected() {
        assert!("fs:root".parse::<Capability>().is_err());
    }

    #[test]
    fn sanitizer_neutralizes_traversal() {
        assert_eq!(sanitize_app_id("../../../etc"), "______etc");
        assert_eq!(sanitize_app_id("my-app_01"), "my-app_01");
        assert_eq!(sanitize_app_id("a/b\\c"), "a_b_c");
    }

    #[test]
    fn report_passes_without_criticals() {
        let report = AnalysisReport::from_findings(vec![Finding {
            rule: "net_fetch".into(),
            severity: Severity::Warning,
            line: 3,
            snippet: "fetch(".into(),
            description: "direct network primitive".into(),
        }]);
        assert!(report.passed);
        assert_eq!(report.warning_count, 1);
        assert_eq!(report.critical_count, 0);
    }

    #[test]
    fn error_kind_status_mapping() {
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::QuotaExceeded.http_status(), 413);
        assert_eq!(ErrorKind::Internal.http_status(), 500);
        assert_eq!(ErrorKind::AnalysisBlocked.http_status(), 400);
    }
}
