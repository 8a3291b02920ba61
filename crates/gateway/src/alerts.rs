//! Alert Engine (§4.7): declarative threshold/rate-of-change/missing-data
//! rules, per-(device, rule) sliding-window state, deduplication, and
//! dispatch to a pluggable alert sink with retry + dead-letter counting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::time::{delay_queue::Key, DelayQueue};
use tracing::{error, warn};
use uuid::Uuid;

use crate::codec::{Reading, SensorKind};
use crate::error::AlertError;
use crate::state::SharedState;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn parse(s: &str) -> Self {
        match s {
            "critical" => Self::Critical,
            "warning" => Self::Warning,
            _ => Self::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Predicate {
    ThresholdAbove { kind: SensorKind, value: f64 },
    ThresholdBelow { kind: SensorKind, value: f64 },
    RateOfChange { kind: SensorKind, delta_per_min: f64 },
    MissingData { kind: SensorKind, for_duration: Duration },
}

#[derive(Debug, Clone)]
pub struct Scope {
    devices: Option<Vec<String>>, // None == "*"
}

impl Scope {
    pub fn wildcard() -> Self {
        Scope { devices: None }
    }

    pub fn matches(&self, device_id: &str) -> bool {
        match &self.devices {
            None => true,
            Some(ids) => ids.iter().any(|d| d == device_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub rule_id: String,
    pub predicate: Predicate,
    pub hold_down: Duration,
    pub severity: Severity,
    pub scope: Scope,
    pub max_reminder_interval: Duration,
}

const DEFAULT_MAX_REMINDER_INTERVAL: Duration = Duration::from_secs(3600);

impl Rule {
    /// Builds a rule from a config-file entry, parsing the predicate DSL
    /// (`threshold_below(pressure, 200.0)` and friends, §4.7). `scope` of
    /// `"*"` matches every device; anything else is treated as a single
    /// device id (v1 has no list syntax — see Open Questions in DESIGN.md).
    pub fn from_entry(entry: &crate::config::AlertRuleEntry) -> Result<Self, AlertError> {
        let predicate = parse_predicate(&entry.predicate)
            .ok_or_else(|| AlertError::InvalidRule(entry.rule_id.clone()))?;
        let scope = if entry.scope == "*" {
            Scope::wildcard()
        } else {
            Scope {
                devices: Some(vec![entry.scope.clone()]),
            }
        };
        Ok(Rule {
            rule_id: entry.rule_id.clone(),
            predicate,
            hold_down: Duration::from_secs(entry.hold_down_secs),
            severity: Severity::parse(&entry.severity),
            scope,
            max_reminder_interval: DEFAULT_MAX_REMINDER_INTERVAL,
        })
    }
}

/// Parses `name(arg1, arg2)` predicate expressions. Returns `None` on any
/// malformed input; the caller turns that into `AlertError::InvalidRule`.
fn parse_predicate(s: &str) -> Option<Predicate> {
    let s = s.trim();
    let open = s.find('(')?;
    let name = &s[..open];
    let close = s.rfind(')')?;
    if close < open {
        return None;
    }
    let args: Vec<&str> = s[open + 1..close].split(',').map(|a| a.trim()).collect();

    match name {
        "threshold_above" | "threshold_below" if args.len() == 2 => {
            let kind = SensorKind::parse(args[0]);
            let value: f64 = args[1].parse().ok()?;
            Some(if name == "threshold_above" {
                Predicate::ThresholdAbove { kind, value }
            } else {
                Predicate::ThresholdBelow { kind, value }
            })
        }
        "rate_of_change" if args.len() == 2 => {
            let kind = SensorKind::parse(args[0]);
            let delta_per_min: f64 = args[1].parse().ok()?;
            Some(Predicate::RateOfChange { kind, delta_per_min })
        }
        "missing_data" if args.len() == 2 => {
            let kind = SensorKind::parse(args[0]);
            let secs: u64 = args[1].parse().ok()?;
            Some(Predicate::MissingData {
                kind,
                for_duration: Duration::from_secs(secs),
            })
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertState {
    Firing,
    Resolved,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub alert_id: String,
    pub device_id: String,
    pub rule_id: String,
    pub severity: Severity,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
    pub last_value: f64,
    pub threshold: f64,
    pub state: AlertState,
}

/// Per-(device, rule) evaluation state: whether the predicate is currently
/// true, since when, and the last value observed for the relevant kind.
struct RuleState {
    alert: Option<Alert>,
    predicate_true_since: Option<i64>,
    predicate_false_since: Option<i64>,
    last_reminder_at: Option<i64>,
    last_value: Option<f64>,
    last_value_at: Option<i64>,
}

impl RuleState {
    fn new() -> Self {
        RuleState {
            alert: None,
            predicate_true_since: None,
            predicate_false_since: None,
            last_reminder_at: None,
            last_value: None,
            last_value_at: None,
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, alert: &Alert) -> Result<(), AlertError>;
}

pub struct LoggingAlertSink;

#[async_trait]
impl AlertSink for LoggingAlertSink {
    async fn emit(&self, alert: &Alert) -> Result<(), AlertError> {
        warn!(
            alert_id = %alert.alert_id,
            device_id = %alert.device_id,
            rule_id = %alert.rule_id,
            severity = alert.severity.as_str(),
            state = ?alert.state,
            "alert"
        );
        Ok(())
    }
}

/// Persists alert state to the `alerts`/`alert_events` tables so open alerts
/// survive a gateway restart (§4.7, §4.8), logging the same line
/// `LoggingAlertSink` does so an operator tailing logs sees the identical
/// signal as one querying the DB.
pub struct DbAlertSink {
    db: Arc<crate::db::Db>,
}

impl DbAlertSink {
    pub fn new(db: Arc<crate::db::Db>) -> Self {
        DbAlertSink { db }
    }
}

#[async_trait]
impl AlertSink for DbAlertSink {
    async fn emit(&self, alert: &Alert) -> Result<(), AlertError> {
        warn!(
            alert_id = %alert.alert_id,
            device_id = %alert.device_id,
            rule_id = %alert.rule_id,
            severity = alert.severity.as_str(),
            state = ?alert.state,
            "alert"
        );
        let state = match alert.state {
            AlertState::Firing => "firing",
            AlertState::Resolved => "resolved",
        };
        let row = crate::db::AlertRow {
            alert_id: alert.alert_id.clone(),
            device_id: alert.device_id.clone(),
            rule_id: alert.rule_id.clone(),
            severity: alert.severity.as_str().to_owned(),
            opened_at: alert.opened_at,
            closed_at: alert.closed_at,
            last_value: alert.last_value,
            threshold: alert.threshold,
            state: state.to_owned(),
        };
        self.db
            .upsert_alert(&row)
            .await
            .map_err(|e| AlertError::DispatchFailed(e.to_string()))?;
        self.db
            .insert_alert_event(&alert.alert_id, state, alert.opened_at)
            .await
            .map_err(|e| AlertError::DispatchFailed(e.to_string()))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct AlertMetrics {
    pub open_critical: AtomicU64,
    pub open_warning: AtomicU64,
    pub open_info: AtomicU64,
    pub dead_letter_total: AtomicU64,
}

type ResetMsg = (String, String, Duration);

pub struct AlertEngine {
    rules: Vec<Rule>,
    state: RwLock<HashMap<(String, String), RuleState>>,
    sink: Arc<dyn AlertSink>,
    pub metrics: Arc<AlertMetrics>,
    shared_state: Option<SharedState>,
    reset_tx: mpsc::UnboundedSender<ResetMsg>,
    // Taken by whichever task calls `run_missing_data_wheel` first; a second
    // call is a no-op rather than a panic, since nothing prevents a caller
    // from accidentally spawning it twice.
    reset_rx: Mutex<Option<mpsc::UnboundedReceiver<ResetMsg>>>,
}

impl AlertEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self::build(rules, Arc::new(LoggingAlertSink), None)
    }

    pub fn with_sink(rules: Vec<Rule>, sink: Arc<dyn AlertSink>) -> Self {
        Self::build(rules, sink, None)
    }

    pub fn with_sink_and_state(
        rules: Vec<Rule>,
        sink: Arc<dyn AlertSink>,
        shared_state: SharedState,
    ) -> Self {
        Self::build(rules, sink, Some(shared_state))
    }

    fn build(rules: Vec<Rule>, sink: Arc<dyn AlertSink>, shared_state: Option<SharedState>) -> Self {
        // The missing-data timer wheel lives in its own task (run_missing_data_wheel),
        // driven by a DelayQueue; rule evaluation only ever sends reset
        // requests into this unbounded channel, never touches the wheel
        // itself, so a pending DelayQueue wait can never block a Reading.
        let (reset_tx, reset_rx) = mpsc::unbounded_channel();
        AlertEngine {
            rules,
            state: RwLock::new(HashMap::new()),
            sink,
            metrics: Arc::new(AlertMetrics::default()),
            shared_state,
            reset_tx,
            reset_rx: Mutex::new(Some(reset_rx)),
        }
    }

    fn kind_of(p: &Predicate) -> SensorKind {
        match p {
            Predicate::ThresholdAbove { kind, .. }
            | Predicate::ThresholdBelow { kind, .. }
            | Predicate::RateOfChange { kind, .. }
            | Predicate::MissingData { kind, .. } => *kind,
        }
    }

    /// Evaluate every rule whose scope matches this reading's device against
    /// the reading's value (§4.7).
    pub async fn evaluate(&self, reading: &Reading) {
        for rule in &self.rules {
            if !rule.scope.matches(&reading.device_id) {
                continue;
            }
            if Self::kind_of(&rule.predicate) != reading.sensor_kind {
                continue;
            }
            self.evaluate_rule(rule, reading).await;
        }
    }

    async fn evaluate_rule(&self, rule: &Rule, reading: &Reading) {
        let key = (reading.device_id.clone(), rule.rule_id.clone());
        let now = reading.ingest_timestamp.max(now_unix());

        let predicate_true = match &rule.predicate {
            Predicate::ThresholdAbove { value, .. } => reading.value > *value,
            Predicate::ThresholdBelow { value, .. } => reading.value < *value,
            Predicate::RateOfChange { delta_per_min, .. } => {
                let mut st = self.state.write().await;
                let entry = st.entry(key.clone()).or_insert_with(RuleState::new);
                let rate_fired = match (entry.last_value, entry.last_value_at) {
                    (Some(prev_v), Some(prev_t)) if now > prev_t => {
                        let minutes = (now - prev_t) as f64 / 60.0;
                        let rate = (reading.value - prev_v).abs() / minutes.max(1.0 / 60.0);
                        rate > *delta_per_min
                    }
                    _ => false,
                };
                entry.last_value = Some(reading.value);
                entry.last_value_at = Some(now);
                drop(st);
                rate_fired
            }
            Predicate::MissingData { for_duration, .. } => {
                // A reading arriving at all means the device isn't silent;
                // schedule (or push back) the wheel entry that fires if
                // nothing further arrives within `for_duration`.
                let _ = self
                    .reset_tx
                    .send((reading.device_id.clone(), rule.rule_id.clone(), *for_duration));
                false
            }
        };

        let mut st = self.state.write().await;
        let entry = st.entry(key.clone()).or_insert_with(RuleState::new);
        entry.last_value = Some(reading.value);
        entry.last_value_at = Some(now);

        if predicate_true {
            entry.predicate_false_since = None;
            if entry.predicate_true_since.is_none() {
                entry.predicate_true_since = Some(now);
            }
        } else {
            entry.predicate_true_since = None;
            if entry.predicate_false_since.is_none() {
                entry.predicate_false_since = Some(now);
            }
        }

        let threshold = match &rule.predicate {
            Predicate::ThresholdAbove { value, .. } | Predicate::ThresholdBelow { value, .. } => {
                *value
            }
            _ => 0.0,
        };

        let already_firing = matches!(entry.alert.as_ref(), Some(a) if a.state == AlertState::Firing);

        if predicate_true && !already_firing {
            let alert = Alert {
                alert_id: Uuid::new_v4().to_string(),
                device_id: reading.device_id.clone(),
                rule_id: rule.rule_id.clone(),
                severity: rule.severity,
                opened_at: now,
                closed_at: None,
                last_value: reading.value,
                threshold,
                state: AlertState::Firing,
            };
            self.bump_open_metric(rule.severity, 1);
            entry.alert = Some(alert.clone());
            entry.last_reminder_at = Some(now);
            drop(st);
            self.dispatch(&alert).await;
            return;
        }

        if predicate_true && already_firing {
            // Resend reminder if max_reminder_interval elapsed; otherwise
            // deduplicated (§3 invariant, §4.7 dedup rule).
            if let Some(alert) = entry.alert.as_mut() {
                alert.last_value = reading.value;
                let due = entry
                    .last_reminder_at
                    .map(|t| now - t >= rule.max_reminder_interval.as_secs() as i64)
                    .unwrap_or(false);
                if due {
                    entry.last_reminder_at = Some(now);
                    let snapshot = alert.clone();
                    drop(st);
                    self.dispatch(&snapshot).await;
                }
            }
            return;
        }

        if !predicate_true && already_firing {
            let hold_down = rule.hold_down.as_secs() as i64;
            let false_since = entry.predicate_false_since.unwrap_or(now);
            if now - false_since >= hold_down {
                if let Some(alert) = entry.alert.as_mut() {
                    alert.state = AlertState::Resolved;
                    alert.closed_at = Some(now);
                    alert.last_value = reading.value;
                    let snapshot = alert.clone();
                    self.bump_open_metric(rule.severity, -1);
                    drop(st);
                    self.dispatch(&snapshot).await;
                }
            }
        }
    }

    fn bump_open_metric(&self, severity: Severity, delta: i64) {
        let counter = match severity {
            Severity::Critical => &self.metrics.open_critical,
            Severity::Warning => &self.metrics.open_warning,
            Severity::Info => &self.metrics.open_info,
        };
        let updated = if delta >= 0 {
            counter.fetch_add(delta as u64, Ordering::Relaxed) + delta as u64
        } else {
            counter.fetch_sub((-delta) as u64, Ordering::Relaxed) - (-delta) as u64
        };
        crate::metrics::set_alerts_open(severity.as_str(), updated);
    }

    async fn dispatch(&self, alert: &Alert) {
        if let Some(shared) = &self.shared_state {
            shared
                .write()
                .await
                .record_alert(&alert.device_id, &alert.rule_id, alert.state == AlertState::Firing);
        }

        let mut backoff = Duration::from_millis(100);
        for attempt in 0..5 {
            match self.sink.emit(alert).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(alert_id = %alert.alert_id, attempt, error = %e, "alert dispatch failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
        error!(alert_id = %alert.alert_id, "alert dispatch exhausted retries, dead-lettering");
        self.metrics.dead_letter_total.fetch_add(1, Ordering::Relaxed);
        if let Some(shared) = &self.shared_state {
            shared
                .write()
                .await
                .record_error(format!("alert {} dead-lettered after exhausting retries", alert.alert_id));
        }
    }

    pub async fn open_alert_count(&self) -> usize {
        self.state
            .read()
            .await
            .values()
            .filter(|s| matches!(s.alert.as_ref(), Some(a) if a.state == AlertState::Firing))
            .count()
    }

    /// Opens (or leaves alone, if already firing) a missing-data alert for
    /// `(device_id, rule_id)`. Called back into from [`Self::run_missing_data_wheel`]
    /// when that rule's wheel entry expires with no intervening reading.
    /// Resolution happens naturally: the next Reading that does arrive takes
    /// the ordinary `evaluate_rule` path, where `MissingData`'s predicate is
    /// always false, driving the existing hold-down-gated resolve branch.
    async fn fire_missing_data(&self, device_id: String, rule_id: String) {
        let Some(rule) = self.rules.iter().find(|r| r.rule_id == rule_id) else {
            return;
        };
        let now = now_unix();
        let key = (device_id.clone(), rule_id.clone());

        let mut st = self.state.write().await;
        let entry = st.entry(key).or_insert_with(RuleState::new);
        let already_firing = matches!(entry.alert.as_ref(), Some(a) if a.state == AlertState::Firing);
        if already_firing {
            return;
        }

        let threshold = match &rule.predicate {
            Predicate::MissingData { for_duration, .. } => for_duration.as_secs_f64(),
            _ => 0.0,
        };
        let alert = Alert {
            alert_id: Uuid::new_v4().to_string(),
            device_id,
            rule_id,
            severity: rule.severity,
            opened_at: now,
            closed_at: None,
            last_value: entry.last_value.unwrap_or(0.0),
            threshold,
            state: AlertState::Firing,
        };
        self.bump_open_metric(rule.severity, 1);
        entry.alert = Some(alert.clone());
        entry.last_reminder_at = Some(now);
        entry.predicate_true_since = Some(now);
        drop(st);
        self.dispatch(&alert).await;
    }

    /// Drives the `missing_data` timer wheel: owns it exclusively (no shared
    /// lock with `evaluate_rule`, which only ever sends on `reset_tx`) and
    /// alternates between waiting for reset requests and waiting for the
    /// next expiry. While the wheel is empty, `DelayQueue::next()` resolves
    /// to `Ready(None)` immediately, so this only polls it once at least one
    /// entry is scheduled — otherwise it would busy-loop.
    ///
    /// A no-op if called more than once on the same engine (the receiver can
    /// only be taken once); callers should spawn this exactly once per
    /// `AlertEngine`, typically from `main`.
    pub async fn run_missing_data_wheel(self: Arc<Self>) {
        let mut reset_rx = match self.reset_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("missing-data wheel driver already running, ignoring duplicate spawn");
                return;
            }
        };

        let mut wheel = MissingDataWheel::new();
        let mut wheel_has_entries = false;

        loop {
            if !wheel_has_entries {
                match reset_rx.recv().await {
                    Some((device_id, rule_id, for_duration)) => {
                        wheel.reset(&device_id, &rule_id, for_duration);
                        wheel_has_entries = true;
                    }
                    None => return, // engine (and every reset_tx clone) dropped
                }
                continue;
            }

            tokio::select! {
                reset = reset_rx.recv() => {
                    match reset {
                        Some((device_id, rule_id, for_duration)) => {
                            wheel.reset(&device_id, &rule_id, for_duration);
                        }
                        None => return,
                    }
                }
                expired = wheel.next_expired() => {
                    match expired {
                        Some((device_id, rule_id)) => {
                            self.fire_missing_data(device_id, rule_id).await;
                        }
                        None => {
                            wheel_has_entries = false;
                        }
                    }
                }
            }
        }
    }
}

/// Runs the `missing_data` timer wheel: schedules a tick per active rule at
/// `for_duration` after the last observed frame; resets on every fresh
/// Reading for that key (§4.7).
pub struct MissingDataWheel {
    queue: DelayQueue<(String, String)>,
    keys: HashMap<(String, String), Key>,
}

impl MissingDataWheel {
    pub fn new() -> Self {
        MissingDataWheel {
            queue: DelayQueue::new(),
            keys: HashMap::new(),
        }
    }

    pub fn reset(&mut self, device_id: &str, rule_id: &str, for_duration: Duration) {
        let key = (device_id.to_owned(), rule_id.to_owned());
        if let Some(existing) = self.keys.get(&key) {
            self.queue.reset(existing, for_duration);
        } else {
            let k = self.queue.insert(key.clone(), for_duration);
            self.keys.insert(key, k);
        }
    }

    pub async fn next_expired(&mut self) -> Option<(String, String)> {
        use futures_util::StreamExt;
        let expired = self.queue.next().await?;
        let item = expired.into_inner();
        self.keys.remove(&item);
        Some(item)
    }
}

impl Default for MissingDataWheel {
    fn default() -> Self {
        Self::new()
    }
}
