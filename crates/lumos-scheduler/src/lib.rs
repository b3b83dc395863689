#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lumos-scheduler** – Background self-improvement task scheduler.
//!
//! Tasks run on independent timers but serialize through one process-wide
//! lock: at most one handler is ever active. Every timer fire passes a
//! guard chain of global pause, task enablement, user-activity defer, the
//! concurrency lock, the circuit breaker, and (for LLM tasks) the daily
//! call budget. Three consecutive handler errors auto-disable a task with
//! reason `circuit-breaker`.
//!
//! State persists to `scheduler.json` with an atomic full-file rewrite on
//! every significant change.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lumos_types::{JsonMap, TaskRunRecord, TaskState, TASK_HISTORY_LIMIT};

/// Minimum effective interval regardless of configuration.
pub const MIN_INTERVAL_MS: u64 = 60_000;

/// Consecutive errors that trip the circuit breaker.
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 3;

/// Disabled-reason recorded when the breaker trips.
pub const CIRCUIT_BREAKER_REASON: &str = "circuit-breaker";

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// No task registered under that id.
    #[error("not_found: {0}")]
    UnknownTask(String),
    /// The task's circuit breaker is tripped.
    #[error("circuit breaker tripped for {0}")]
    CircuitBreakerTripped(String),
}

/// What a handler reports on success.
#[derive(Debug, Clone, Default)]
pub struct TaskReport {
    /// One-line summary recorded as the last result.
    pub summary: Option<String>,
    /// Structured stats for the API surface.
    pub stats: JsonMap,
}

/// A background task body. Errors are captured and counted; they never
/// crash the process.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task once.
    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<TaskReport>;
}

/// Static definition of a registered task.
#[derive(Clone)]
pub struct TaskDef {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// What the task does.
    pub description: String,
    /// Grouping label for the API surface.
    pub category: String,
    /// Whether runs consume the daily LLM budget.
    pub requires_llm: bool,
    /// Interval applied by `enable` when none is given.
    pub default_interval_ms: u64,
    /// The body.
    pub handler: Arc<dyn TaskHandler>,
}

/// Handler-side view of the scheduler: budget tracking plus scheduler
/// policy knobs.
pub struct TaskContext {
    inner: Arc<Inner>,
    task_id: String,
}

impl TaskContext {
    /// Charge one LLM call against today's budget.
    pub fn track_llm_call(&self) {
        let mut states = self.inner.states.write();
        if let Some(state) = states.get_mut(&self.task_id) {
            roll_budget_day(state);
            state.llm_calls_today += 1;
        }
    }

    /// Remaining LLM calls in today's budget.
    pub fn get_budget_remaining(&self) -> u32 {
        let mut states = self.inner.states.write();
        match states.get_mut(&self.task_id) {
            Some(state) => {
                roll_budget_day(state);
                self.inner.config.daily_budget.saturating_sub(state.llm_calls_today)
            }
            None => 0,
        }
    }

    /// Registry-size policy knob for curation tasks.
    pub fn max_registry(&self) -> usize {
        self.inner.config.max_registry
    }
}

/// Why a timer fire did not run the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The scheduler is globally paused.
    Paused,
    /// The task is disabled.
    Disabled,
    /// The user was active too recently.
    ActivityDefer,
    /// Another handler holds the concurrency lock.
    Busy,
    /// The circuit breaker is tripped.
    CircuitBreaker,
    /// Today's LLM budget is spent.
    BudgetExhausted,
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickResult {
    /// The handler ran; the flag is whether it succeeded.
    Ran(bool),
    /// A guard stopped the tick.
    Skipped(SkipReason),
}

/// Scheduler policy, environment-driven.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Where `scheduler.json` lives.
    pub state_path: PathBuf,
    /// How long after user activity before background work may run.
    pub defer: Duration,
    /// Daily LLM call budget per task.
    pub daily_budget: u32,
    /// Registry-size policy knob handed to curation tasks.
    pub max_registry: usize,
}

impl SchedulerConfig {
    /// Defaults rooted at `data_root`, overridden by environment variables.
    pub fn from_env(data_root: &std::path::Path) -> Self {
        let defer_minutes = std::env::var("SCHEDULER_DEFER_MINUTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5u64);
        Self {
            state_path: data_root.join("scheduler.json"),
            defer: Duration::from_secs(defer_minutes * 60),
            daily_budget: std::env::var("SCHEDULER_DAILY_BUDGET")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),
            max_registry: std::env::var("SCHEDULER_MAX_REGISTRY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(500),
        }
    }
}

/// Everything persisted to `scheduler.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    tasks: HashMap<String, TaskState>,
    paused: bool,
}

struct Inner {
    config: SchedulerConfig,
    defs: RwLock<HashMap<String, TaskDef>>,
    states: RwLock<HashMap<String, TaskState>>,
    paused: RwLock<bool>,
    // Milliseconds since epoch of the last user activity.
    last_activity: RwLock<i64>,
    run_lock: tokio::sync::Mutex<()>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// The task scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/// API snapshot of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    /// Task id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Category.
    pub category: String,
    /// Whether runs consume LLM budget.
    pub requires_llm: bool,
    /// Current persisted state.
    pub state: TaskState,
}

/// Aggregate counters across all tasks.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateStats {
    /// Registered tasks.
    pub tasks: usize,
    /// Currently enabled tasks.
    pub enabled: usize,
    /// Total runs across all tasks.
    pub total_runs: u64,
    /// Total successes.
    pub total_successes: u64,
    /// Total errors.
    pub total_errors: u64,
    /// Whether the scheduler is paused.
    pub paused: bool,
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

fn roll_budget_day(state: &mut TaskState) {
    let today = today();
    if state.llm_calls_date != today {
        state.llm_calls_date = today;
        state.llm_calls_today = 0;
    }
}

impl Scheduler {
    /// Create a scheduler, loading persisted state if present. Corrupted
    /// state produces a warning and a clean start.
    pub async fn open(config: SchedulerConfig) -> Self {
        let persisted: PersistedState = match tokio::fs::read(&config.state_path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = %e, "corrupted scheduler.json, starting clean");
                    PersistedState::default()
                }
            },
            Err(_) => PersistedState::default(),
        };
        info!(tasks = persisted.tasks.len(), "scheduler state loaded");
        Self {
            inner: Arc::new(Inner {
                config,
                defs: RwLock::new(HashMap::new()),
                states: RwLock::new(persisted.tasks),
                paused: RwLock::new(persisted.paused),
                last_activity: RwLock::new(0),
                run_lock: tokio::sync::Mutex::new(()),
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a task definition. Persisted state for the id is adopted;
    /// otherwise a disabled default state is created.
    pub fn register(&self, def: TaskDef) {
        let id = def.id.clone();
        {
            let mut states = self.inner.states.write();
            states.entry(id.clone()).or_insert_with(|| TaskState {
                interval_ms: def.default_interval_ms,
                ..TaskState::default()
            });
        }
        self.inner.defs.write().insert(id.clone(), def);
        debug!(task = %id, "task registered");
    }

    /// Enable a task, optionally overriding its interval, and start its
    /// timer. Clears any disabled reason.
    pub async fn enable(&self, id: &str, interval_ms: Option<u64>) -> Result<(), SchedulerError> {
        if !self.inner.defs.read().contains_key(id) {
            return Err(SchedulerError::UnknownTask(id.to_string()));
        }
        let effective = {
            let mut states = self.inner.states.write();
            let state = states.get_mut(id).expect("state exists for registered task");
            if let Some(interval) = interval_ms {
                state.interval_ms = interval;
            }
            state.enabled = true;
            state.disabled_reason = None;
            state.interval_ms.max(MIN_INTERVAL_MS)
        };
        self.persist().await;
        self.start_timer(id.to_string(), effective);
        info!(task = id, interval_ms = effective, "task enabled");
        Ok(())
    }

    /// Disable a task and cancel its timer.
    pub async fn disable(&self, id: &str) -> Result<(), SchedulerError> {
        if !self.inner.defs.read().contains_key(id) {
            return Err(SchedulerError::UnknownTask(id.to_string()));
        }
        {
            let mut states = self.inner.states.write();
            if let Some(state) = states.get_mut(id) {
                state.enabled = false;
            }
        }
        self.cancel_timer(id);
        self.persist().await;
        info!(task = id, "task disabled");
        Ok(())
    }

    /// Run a task immediately, bypassing the pause and defer guards but
    /// honoring the circuit breaker and the concurrency lock.
    pub async fn run_now(&self, id: &str) -> Result<TickResult, SchedulerError> {
        if !self.inner.defs.read().contains_key(id) {
            return Err(SchedulerError::UnknownTask(id.to_string()));
        }
        {
            let states = self.inner.states.read();
            let state = states.get(id).expect("state exists for registered task");
            if state.consecutive_errors >= CIRCUIT_BREAKER_THRESHOLD {
                return Err(SchedulerError::CircuitBreakerTripped(id.to_string()));
            }
        }
        Ok(self.execute(id).await)
    }

    /// One timer fire: apply the guard chain, then execute.
    pub async fn tick_once(&self, id: &str) -> Result<TickResult, SchedulerError> {
        let def = {
            let defs = self.inner.defs.read();
            defs.get(id).cloned().ok_or_else(|| SchedulerError::UnknownTask(id.to_string()))?
        };

        if *self.inner.paused.read() {
            return Ok(TickResult::Skipped(SkipReason::Paused));
        }
        {
            let states = self.inner.states.read();
            let state = states.get(id).expect("state exists for registered task");
            if !state.enabled {
                return Ok(TickResult::Skipped(SkipReason::Disabled));
            }
        }
        let idle_ms = Utc::now().timestamp_millis() - *self.inner.last_activity.read();
        if (idle_ms as u128) < self.inner.config.defer.as_millis() {
            return Ok(TickResult::Skipped(SkipReason::ActivityDefer));
        }
        if self.inner.run_lock.try_lock().is_err() {
            return Ok(TickResult::Skipped(SkipReason::Busy));
        }
        {
            let mut states = self.inner.states.write();
            let state = states.get_mut(id).expect("state exists for registered task");
            if state.consecutive_errors >= CIRCUIT_BREAKER_THRESHOLD {
                return Ok(TickResult::Skipped(SkipReason::CircuitBreaker));
            }
            if def.requires_llm {
                roll_budget_day(state);
                if state.llm_calls_today >= self.inner.config.daily_budget {
                    return Ok(TickResult::Skipped(SkipReason::BudgetExhausted));
                }
            }
        }

        Ok(self.execute(id).await)
    }

    /// Run the handler under the process-wide lock and account the result.
    async fn execute(&self, id: &str) -> TickResult {
        let _guard = self.inner.run_lock.lock().await;

        let def = {
            let defs = self.inner.defs.read();
            defs.get(id).cloned()
        };
        let Some(def) = def else {
            return TickResult::Skipped(SkipReason::Disabled);
        };

        let started = Utc::now();
        {
            let mut states = self.inner.states.write();
            if let Some(state) = states.get_mut(id) {
                state.last_run = Some(started);
                state.run_count += 1;
            }
        }

        let ctx = TaskContext { inner: self.inner.clone(), task_id: id.to_string() };
        let result = def.handler.run(&ctx).await;

        let success = result.is_ok();
        let mut tripped = false;
        {
            let mut states = self.inner.states.write();
            if let Some(state) = states.get_mut(id) {
                match &result {
                    Ok(report) => {
                        state.success_count += 1;
                        state.consecutive_errors = 0;
                        state.last_result = report.summary.clone();
                    }
                    Err(e) => {
                        state.error_count += 1;
                        state.consecutive_errors += 1;
                        state.last_error = Some(e.to_string());
                        if state.consecutive_errors >= CIRCUIT_BREAKER_THRESHOLD {
                            state.enabled = false;
                            state.disabled_reason = Some(CIRCUIT_BREAKER_REASON.to_string());
                            tripped = true;
                        }
                    }
                }
                state.history.push(TaskRunRecord {
                    at: started,
                    success,
                    detail: match &result {
                        Ok(report) => report.summary.clone(),
                        Err(e) => Some(e.to_string()),
                    },
                });
                if state.history.len() > TASK_HISTORY_LIMIT {
                    let excess = state.history.len() - TASK_HISTORY_LIMIT;
                    state.history.drain(..excess);
                }
                let interval = state.interval_ms.max(MIN_INTERVAL_MS);
                state.next_run =
                    Some(Utc::now() + chrono::Duration::milliseconds(interval as i64));
            }
        }

        if tripped {
            warn!(task = id, "circuit breaker tripped, task disabled");
            self.cancel_timer(id);
        }
        match &result {
            Ok(_) => debug!(task = id, "task run succeeded"),
            Err(e) => warn!(task = id, error = %e, "task run failed"),
        }
        self.persist().await;
        TickResult::Ran(success)
    }

    /// Pause all timer fires. A running handler completes normally.
    pub async fn pause(&self) {
        *self.inner.paused.write() = true;
        self.persist().await;
        info!("scheduler paused");
    }

    /// Resume timer fires.
    pub async fn resume(&self) {
        *self.inner.paused.write() = false;
        self.persist().await;
        info!("scheduler resumed");
    }

    /// Clear a task's breaker state so it may be re-enabled.
    pub async fn reset_circuit_breaker(&self, id: &str) -> Result<(), SchedulerError> {
        {
            let mut states = self.inner.states.write();
            let state = states
                .get_mut(id)
                .ok_or_else(|| SchedulerError::UnknownTask(id.to_string()))?;
            state.consecutive_errors = 0;
            state.disabled_reason = None;
        }
        self.persist().await;
        info!(task = id, "circuit breaker reset");
        Ok(())
    }

    /// Record user activity; background work defers from this moment.
    pub fn record_activity(&self) {
        *self.inner.last_activity.write() = Utc::now().timestamp_millis();
    }

    /// Remaining budget for a task today.
    pub fn check_budget(&self, id: &str) -> Result<u32, SchedulerError> {
        let mut states = self.inner.states.write();
        let state = states
            .get_mut(id)
            .ok_or_else(|| SchedulerError::UnknownTask(id.to_string()))?;
        roll_budget_day(state);
        Ok(self.inner.config.daily_budget.saturating_sub(state.llm_calls_today))
    }

    /// Snapshot of every registered task.
    pub fn get_all(&self) -> Vec<TaskSnapshot> {
        let defs = self.inner.defs.read();
        let states = self.inner.states.read();
        let mut tasks: Vec<TaskSnapshot> = defs
            .values()
            .map(|def| TaskSnapshot {
                id: def.id.clone(),
                name: def.name.clone(),
                description: def.description.clone(),
                category: def.category.clone(),
                requires_llm: def.requires_llm,
                state: states.get(&def.id).cloned().unwrap_or_default(),
            })
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Run history of one task, oldest first.
    pub fn history(&self, id: &str) -> Result<Vec<TaskRunRecord>, SchedulerError> {
        let states = self.inner.states.read();
        states
            .get(id)
            .map(|state| state.history.clone())
            .ok_or_else(|| SchedulerError::UnknownTask(id.to_string()))
    }

    /// Counters across all tasks.
    pub fn aggregate_stats(&self) -> AggregateStats {
        let states = self.inner.states.read();
        let mut stats = AggregateStats {
            tasks: states.len(),
            enabled: 0,
            total_runs: 0,
            total_successes: 0,
            total_errors: 0,
            paused: *self.inner.paused.read(),
        };
        for state in states.values() {
            if state.enabled {
                stats.enabled += 1;
            }
            stats.total_runs += state.run_count;
            stats.total_successes += state.success_count;
            stats.total_errors += state.error_count;
        }
        stats
    }

    /// Start enabled tasks' timers after a restart.
    pub fn resume_persisted_timers(&self) {
        let enabled: Vec<(String, u64)> = {
            let states = self.inner.states.read();
            let defs = self.inner.defs.read();
            states
                .iter()
                .filter(|(id, state)| state.enabled && defs.contains_key(*id))
                .map(|(id, state)| (id.clone(), state.interval_ms.max(MIN_INTERVAL_MS)))
                .collect()
        };
        for (id, interval) in enabled {
            self.start_timer(id, interval);
        }
    }

    /// Persist the full state atomically: write aside, then rename over.
    pub async fn persist(&self) {
        let snapshot = PersistedState {
            tasks: self.inner.states.read().clone(),
            paused: *self.inner.paused.read(),
        };
        let path = &self.inner.config.state_path;
        let tmp = path.with_extension("json.tmp");
        let bytes = match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "scheduler state serialization failed");
                return;
            }
        };
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            warn!(error = %e, "scheduler state write failed");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            warn!(error = %e, "scheduler state rename failed");
        }
    }

    fn start_timer(&self, id: String, interval_ms: u64) {
        self.cancel_timer(&id);
        let scheduler = self.clone();
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(interval_ms.max(MIN_INTERVAL_MS)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match scheduler.tick_once(&timer_id).await {
                    Ok(TickResult::Skipped(reason)) => {
                        debug!(task = %timer_id, ?reason, "tick skipped")
                    }
                    Ok(TickResult::Ran(_)) => {}
                    Err(_) => break,
                }
            }
        });
        self.inner.timers.lock().insert(id, handle);
    }

    fn cancel_timer(&self, id: &str) {
        if let Some(handle) = self.inner.timers.lock().remove(id) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedHandler {
        fail: bool,
        running: Arc<AtomicU32>,
        max_seen: Arc<AtomicU32>,
        llm_calls: u32,
    }

    impl ScriptedHandler {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                fail: false,
                running: Arc::new(AtomicU32::new(0)),
                max_seen: Arc::new(AtomicU32::new(0)),
                llm_calls: 0,
            })
        }
        fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail: true,
                running: Arc::new(AtomicU32::new(0)),
                max_seen: Arc::new(AtomicU32::new(0)),
                llm_calls: 0,
            })
        }
        fn with_llm_calls(calls: u32) -> Arc<Self> {
            Arc::new(Self {
                fail: false,
                running: Arc::new(AtomicU32::new(0)),
                max_seen: Arc::new(AtomicU32::new(0)),
                llm_calls: calls,
            })
        }
    }

    #[async_trait]
    impl TaskHandler for ScriptedHandler {
        async fn run(&self, ctx: &TaskContext) -> anyhow::Result<TaskReport> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            for _ in 0..self.llm_calls {
                ctx.track_llm_call();
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("scripted failure");
            }
            Ok(TaskReport { summary: Some("ok".into()), stats: JsonMap::new() })
        }
    }

    fn def(id: &str, requires_llm: bool, handler: Arc<dyn TaskHandler>) -> TaskDef {
        TaskDef {
            id: id.to_string(),
            name: id.to_string(),
            description: "test task".to_string(),
            category: "test".to_string(),
            requires_llm,
            default_interval_ms: MIN_INTERVAL_MS,
            handler,
        }
    }

    async fn scheduler_in(dir: &std::path::Path) -> Scheduler {
        scheduler_with_budget(dir, 50).await
    }

    async fn scheduler_with_budget(dir: &std::path::Path, budget: u32) -> Scheduler {
        Scheduler::open(SchedulerConfig {
            state_path: dir.join("scheduler.json"),
            defer: Duration::from_secs(300),
            daily_budget: budget,
            max_registry: 500,
        })
        .await
    }

    #[tokio::test]
    async fn circuit_breaker_trips_after_three_failures() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path()).await;
        scheduler.register(def("breaker", false, ScriptedHandler::failing()));
        scheduler.enable("breaker", None).await.unwrap();

        for _ in 0..3 {
            let result = scheduler.run_now("breaker").await.unwrap();
            assert_eq!(result, TickResult::Ran(false));
        }

        let snapshot = &scheduler.get_all()[0];
        assert_eq!(snapshot.state.consecutive_errors, 3);
        assert!(!snapshot.state.enabled);
        assert_eq!(snapshot.state.disabled_reason.as_deref(), Some(CIRCUIT_BREAKER_REASON));

        // A fourth manual run is refused until the breaker is reset.
        assert!(matches!(
            scheduler.run_now("breaker").await,
            Err(SchedulerError::CircuitBreakerTripped(_))
        ));

        scheduler.reset_circuit_breaker("breaker").await.unwrap();
        scheduler.enable("breaker", None).await.unwrap();
        let result = scheduler.run_now("breaker").await.unwrap();
        assert_eq!(result, TickResult::Ran(false));
    }

    #[tokio::test]
    async fn success_clears_consecutive_errors() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path()).await;
        scheduler.register(def("flaky", false, ScriptedHandler::failing()));
        scheduler.register(def("steady", false, ScriptedHandler::ok()));
        scheduler.enable("flaky", None).await.unwrap();

        scheduler.run_now("flaky").await.unwrap();
        scheduler.run_now("flaky").await.unwrap();
        // Swap in a succeeding handler under the same id.
        scheduler.register(def("flaky", false, ScriptedHandler::ok()));
        scheduler.run_now("flaky").await.unwrap();

        let flaky = scheduler
            .get_all()
            .into_iter()
            .find(|t| t.id == "flaky")
            .unwrap();
        assert_eq!(flaky.state.consecutive_errors, 0);
        assert_eq!(flaky.state.error_count, 2);
        assert_eq!(flaky.state.success_count, 1);
    }

    #[tokio::test]
    async fn handlers_serialize_through_the_run_lock() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path()).await;
        let handler = ScriptedHandler::ok();
        let max_seen = handler.max_seen.clone();
        scheduler.register(def("a", false, handler.clone()));
        scheduler.register(def("b", false, handler));

        let s1 = scheduler.clone();
        let s2 = scheduler.clone();
        let (r1, r2) = tokio::join!(s1.run_now("a"), s2.run_now("b"));
        r1.unwrap();
        r2.unwrap();
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn paused_scheduler_skips_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path()).await;
        scheduler.register(def("t", false, ScriptedHandler::ok()));
        scheduler.enable("t", None).await.unwrap();
        scheduler.pause().await;

        let result = scheduler.tick_once("t").await.unwrap();
        assert_eq!(result, TickResult::Skipped(SkipReason::Paused));

        scheduler.resume().await;
        let result = scheduler.tick_once("t").await.unwrap();
        assert_eq!(result, TickResult::Ran(true));
    }

    #[tokio::test]
    async fn recent_activity_defers_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path()).await;
        scheduler.register(def("t", false, ScriptedHandler::ok()));
        scheduler.enable("t", None).await.unwrap();

        scheduler.record_activity();
        let result = scheduler.tick_once("t").await.unwrap();
        assert_eq!(result, TickResult::Skipped(SkipReason::ActivityDefer));
    }

    #[tokio::test]
    async fn llm_budget_gates_ticks_and_rolls_daily() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_with_budget(dir.path(), 2).await;
        scheduler.register(def("llm", true, ScriptedHandler::with_llm_calls(1)));
        scheduler.enable("llm", None).await.unwrap();

        assert_eq!(scheduler.tick_once("llm").await.unwrap(), TickResult::Ran(true));
        assert_eq!(scheduler.tick_once("llm").await.unwrap(), TickResult::Ran(true));
        assert_eq!(scheduler.check_budget("llm").unwrap(), 0);
        assert_eq!(
            scheduler.tick_once("llm").await.unwrap(),
            TickResult::Skipped(SkipReason::BudgetExhausted)
        );

        // Date rollover resets the counter.
        {
            let mut states = scheduler.inner.states.write();
            states.get_mut("llm").unwrap().llm_calls_date = "2000-01-01".to_string();
        }
        assert_eq!(scheduler.check_budget("llm").unwrap(), 2);
        assert_eq!(scheduler.tick_once("llm").await.unwrap(), TickResult::Ran(true));
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path()).await;
        scheduler.register(def("t", false, ScriptedHandler::ok()));
        for _ in 0..25 {
            scheduler.run_now("t").await.unwrap();
        }
        let history = scheduler.history("t").unwrap();
        assert_eq!(history.len(), TASK_HISTORY_LIMIT);
        assert!(history.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn state_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let scheduler = scheduler_in(dir.path()).await;
            scheduler.register(def("t", false, ScriptedHandler::ok()));
            scheduler.enable("t", Some(120_000)).await.unwrap();
            scheduler.run_now("t").await.unwrap();
        }
        let scheduler = scheduler_in(dir.path()).await;
        scheduler.register(def("t", false, ScriptedHandler::ok()));
        let snapshot = &scheduler.get_all()[0];
        assert!(snapshot.state.enabled);
        assert_eq!(snapshot.state.interval_ms, 120_000);
        assert_eq!(snapshot.state.run_count, 1);
    }

    #[tokio::test]
    async fn unknown_task_errors() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path()).await;
        assert!(matches!(
            scheduler.run_now("ghost").await,
            Err(SchedulerError::UnknownTask(_))
        ));
        assert!(matches!(
            scheduler.enable("ghost", None).await,
            Err(SchedulerError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn aggregate_stats_roll_up() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path()).await;
        scheduler.register(def("a", false, ScriptedHandler::ok()));
        scheduler.register(def("b", false, ScriptedHandler::failing()));
        scheduler.run_now("a").await.unwrap();
        scheduler.run_now("b").await.unwrap();

        let stats = scheduler.aggregate_stats();
        assert_eq!(stats.tasks, 2);
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.total_errors, 1);
    }
}
