//! In-memory system state for the `/api/status` operator dashboard: MQTT
//! connectivity, a capped event ring buffer, and shutdown phase — mirrors the
//! teacher's `SystemState`, adapted from node/zone telemetry to the gateway's
//! device/alert domain.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub shutting_down: bool,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Alert,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub shutting_down: bool,
    pub devices_known: usize,
    pub alerts_open: usize,
    pub subscribers_connected: u64,
    pub durable_wab_depth: i64,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            shutting_down: false,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a summary event for a batch of readings from one device.
    pub fn record_reading(&mut self, device_id: &str, count: usize) {
        self.push_event(
            EventKind::Reading,
            format!("{device_id}: {count} reading(s)"),
        );
    }

    /// Record an alert state transition.
    pub fn record_alert(&mut self, device_id: &str, rule_id: &str, firing: bool) {
        let verb = if firing { "opened" } else { "resolved" };
        self.push_event(EventKind::Alert, format!("{device_id}/{rule_id} {verb}"));
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event (startup, shutdown phases, reconnects).
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot. Counts that come from
    /// other components (registry size, alert count, sink depth, subscriber
    /// count) are supplied by the caller since `SystemState` itself doesn't
    /// own them — it only owns the ephemeral event log and connectivity flag.
    pub fn to_status(
        &self,
        devices_known: usize,
        alerts_open: usize,
        subscribers_connected: u64,
        durable_wab_depth: i64,
    ) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            shutting_down: self.shutting_down,
            devices_known,
            alerts_open,
            subscribers_connected,
            durable_wab_depth,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_starts_with_empty_events() {
        let st = SystemState::new();
        assert!(st.events.is_empty());
    }

    #[test]
    fn new_mqtt_disconnected_by_default() {
        let st = SystemState::new();
        assert!(!st.mqtt_connected);
        assert!(!st.shutting_down);
    }

    #[test]
    fn record_reading_creates_event() {
        let mut st = SystemState::new();
        st.record_reading("HK_000001", 3);

        assert_eq!(st.events.len(), 1);
        assert!(matches!(st.events[0].kind, EventKind::Reading));
        assert_eq!(st.events[0].detail, "HK_000001: 3 reading(s)");
    }

    #[test]
    fn record_alert_open_and_resolve() {
        let mut st = SystemState::new();
        st.record_alert("HK_000001", "tpms_low", true);
        st.record_alert("HK_000001", "tpms_low", false);

        assert_eq!(st.events.len(), 2);
        assert_eq!(st.events[0].detail, "HK_000001/tpms_low opened");
        assert_eq!(st.events[1].detail, "HK_000001/tpms_low resolved");
    }

    #[test]
    fn record_error_and_system_events() {
        let mut st = SystemState::new();
        st.record_error("something broke".to_string());
        st.record_system("gateway started".to_string());

        assert!(matches!(st.events[0].kind, EventKind::Error));
        assert!(matches!(st.events[1].kind, EventKind::System));
    }

    #[test]
    fn event_ring_buffer_caps_at_max() {
        let mut st = SystemState::new();
        for i in 0..MAX_EVENTS + 50 {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
    }

    #[test]
    fn event_ring_buffer_evicts_oldest() {
        let mut st = SystemState::new();
        for i in 0..MAX_EVENTS + 10 {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.front().unwrap().detail, "event 10");
        assert_eq!(
            st.events.back().unwrap().detail,
            format!("event {}", MAX_EVENTS + 9)
        );
    }

    #[test]
    fn to_status_returns_events_in_reverse_order() {
        let mut st = SystemState::new();
        st.record_system("first".to_string());
        st.record_system("second".to_string());
        st.record_system("third".to_string());

        let status = st.to_status(0, 0, 0, 0);
        assert_eq!(status.events[0].detail, "third");
        assert_eq!(status.events[1].detail, "second");
        assert_eq!(status.events[2].detail, "first");
    }

    #[test]
    fn to_status_reflects_mqtt_connected() {
        let mut st = SystemState::new();
        assert!(!st.to_status(0, 0, 0, 0).mqtt_connected);

        st.mqtt_connected = true;
        assert!(st.to_status(0, 0, 0, 0).mqtt_connected);
    }

    #[test]
    fn to_status_uptime_is_non_negative() {
        let st = SystemState::new();
        assert!(st.to_status(0, 0, 0, 0).uptime_secs < 2);
    }

    #[test]
    fn to_status_carries_supplied_counts() {
        let st = SystemState::new();
        let status = st.to_status(42, 3, 7, 1000);
        assert_eq!(status.devices_known, 42);
        assert_eq!(status.alerts_open, 3);
        assert_eq!(status.subscribers_connected, 7);
        assert_eq!(status.durable_wab_depth, 1000);
    }

    #[test]
    fn to_status_serializes_to_json() {
        let mut st = SystemState::new();
        st.record_reading("HK_000001", 2);

        let status = st.to_status(1, 0, 0, 0);
        let json = serde_json::to_value(&status).expect("should serialize");

        assert!(json["uptime_secs"].is_u64());
        assert!(json["mqtt_connected"].is_boolean());
        assert!(json["devices_known"].is_u64());
        assert!(json["events"].is_array());
    }
}
