//! Subscriber Hub (§4.6): WebSocket endpoint with topic-based fan-out and
//! per-subscriber bounded outboxes. Modeled on the `groblegark-coop` mux's
//! `ws.rs`/`bridge.rs` split-socket + per-client-slot idiom, since the
//! teacher repo never needed WebSockets.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};

use crate::codec::{render_reading_frame, Reading, SensorKind};
use crate::error::HubError;

#[derive(Debug, Clone)]
pub enum DropPolicy {
    SlowDrop,
    Disconnect,
}

impl DropPolicy {
    pub fn parse(s: &str) -> Self {
        match s {
            "disconnect" => Self::Disconnect,
            _ => Self::SlowDrop,
        }
    }
}

/// `{"type":"subscribe","filter":{"devices":["*"],"kinds":["pressure","temperature"]}}`
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe { filter: FilterSpec },
    Pong,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub kinds: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Filter {
    devices: Option<Vec<String>>, // None == wildcard "*"
    kinds: Option<Vec<SensorKind>>,
}

impl Filter {
    /// Matches every device and sensor kind. Exposed crate-wide so other
    /// modules (the Pipeline's own test harness) can register a scenario
    /// subscriber without going through a WebSocket handshake.
    pub(crate) fn wildcard() -> Self {
        Filter {
            devices: None,
            kinds: None,
        }
    }
}

fn parse_kind(s: &str) -> Option<SensorKind> {
    Some(match s {
        "pressure" => SensorKind::Pressure,
        "temperature" => SensorKind::Temperature,
        "humidity" => SensorKind::Humidity,
        "battery" => SensorKind::Battery,
        "accel" => SensorKind::Accel,
        "light" => SensorKind::Light,
        "composite" => SensorKind::Composite,
        _ => return None,
    })
}

impl Filter {
    fn from_spec(spec: &FilterSpec) -> Self {
        let devices = if spec.devices.iter().any(|d| d == "*") || spec.devices.is_empty() {
            None
        } else {
            Some(spec.devices.clone())
        };
        let kinds = if spec.kinds.is_empty() {
            None
        } else {
            Some(spec.kinds.iter().filter_map(|k| parse_kind(k)).collect())
        };
        Filter { devices, kinds }
    }

    fn matches(&self, reading: &Reading) -> bool {
        let device_ok = match &self.devices {
            None => true,
            Some(ids) => ids.iter().any(|d| d == &reading.device_id),
        };
        let kind_ok = match &self.kinds {
            None => true,
            Some(kinds) => kinds.contains(&reading.sensor_kind),
        };
        device_ok && kind_ok
    }
}

struct RingInner {
    buf: VecDeque<Arc<str>>,
    closed: bool,
}

/// Bounded per-subscriber outbox that evicts the oldest buffered frame on
/// overflow instead of rejecting the newest one — a slow subscriber catches
/// up to the latest state instead of falling permanently behind it
/// (`drop_policy=slow_drop`, §4.6). A plain `mpsc::Sender` can only reject an
/// over-capacity push, never evict, so the ring is hand-rolled over a
/// `Mutex`-guarded deque plus a `Notify` for the waiting receiver.
pub(crate) struct RingOutbox {
    capacity: usize,
    inner: std::sync::Mutex<RingInner>,
    notify: Notify,
}

impl RingOutbox {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RingOutbox {
            capacity,
            inner: std::sync::Mutex::new(RingInner {
                buf: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Push a frame, evicting the oldest one if the ring is full. Returns
    /// whether an eviction happened, so the caller can count it as a drop.
    fn push(&self, frame: Arc<str>) -> bool {
        let evicted = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return false;
            }
            let evicted = inner.buf.len() >= self.capacity;
            if evicted {
                inner.buf.pop_front();
            }
            inner.buf.push_back(frame);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    /// Non-blocking pop, for callers (and tests) that don't want to await.
    pub(crate) fn try_recv(&self) -> Option<Arc<str>> {
        self.inner.lock().unwrap().buf.pop_front()
    }

    /// Awaits the next frame, or `None` once the outbox has been closed and
    /// drained. `notify.notified()` is created and `enable()`d before the
    /// buffer check so a `push`/`close` racing in after that point is never
    /// missed (the classic `Notify` missed-wakeup pitfall).
    pub(crate) async fn recv(&self) -> Option<Arc<str>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(frame) = inner.buf.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }
}

struct Subscriber {
    outbox: Arc<RingOutbox>,
    filter: Filter,
    dropped: Arc<AtomicU64>,
}

/// Fan-out registry of connected WebSocket subscribers plus the configured
/// drop policy and outbox capacity applied to every new connection.
pub struct SubscriberHub {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    outbox_capacity: usize,
    drop_policy: DropPolicy,
    connected: AtomicU64,
}

impl SubscriberHub {
    pub fn new(outbox_capacity: usize, drop_policy: &str) -> Self {
        SubscriberHub {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            outbox_capacity,
            drop_policy: DropPolicy::parse(drop_policy),
            connected: AtomicU64::new(0),
        }
    }

    pub fn connected_count(&self) -> u64 {
        self.connected.load(Ordering::Relaxed)
    }

    /// Serialize once, then iterate matching subscriptions and push into
    /// each outbox, evicting that subscriber's oldest frame on overflow
    /// (§4.6).
    pub async fn broadcast(&self, reading: &Reading) {
        let subs = self.subscribers.read().await;
        if subs.is_empty() {
            return;
        }
        let frame: Arc<str> = Arc::from(render_reading_frame(reading).into_boxed_str());
        for (id, sub) in subs.iter() {
            if !sub.filter.matches(reading) {
                continue;
            }
            if sub.outbox.push(Arc::clone(&frame)) {
                sub.dropped.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_subscriber_dropped(*id);
            }
        }
    }

    pub(crate) async fn register(&self, filter: Filter) -> (u64, Arc<RingOutbox>, Arc<AtomicU64>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let outbox = Arc::new(RingOutbox::new(self.outbox_capacity));
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers.write().await.insert(
            id,
            Subscriber {
                outbox: Arc::clone(&outbox),
                filter,
                dropped: Arc::clone(&dropped),
            },
        );
        let connected = self.connected.fetch_add(1, Ordering::Relaxed) + 1;
        crate::metrics::set_subscribers_connected(connected);
        (id, outbox, dropped)
    }

    async fn unregister(&self, id: u64) {
        if let Some(sub) = self.subscribers.write().await.remove(&id) {
            sub.outbox.close();
            let connected = self.connected.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
            crate::metrics::set_subscribers_connected(connected);
        }
    }

    /// Current per-subscriber dropped-frame counts, for `subscriber_dropped_frames_total`.
    pub async fn dropped_counts(&self) -> HashMap<u64, u64> {
        self.subscribers
            .read()
            .await
            .iter()
            .map(|(id, s)| (*id, s.dropped.load(Ordering::Relaxed)))
            .collect()
    }

    /// Close all subscriber outboxes so `handle_socket`'s receive loop
    /// observes a closed outbox and sends a close frame (§4.8 step 4).
    pub async fn close_all(&self) {
        let mut subs = self.subscribers.write().await;
        for sub in subs.values() {
            sub.outbox.close();
        }
        subs.clear();
        self.connected.store(0, Ordering::Relaxed);
        crate::metrics::set_subscribers_connected(0);
    }
}

pub async fn ws_handler(
    State(hub): State<Arc<SubscriberHub>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.protocols(["smartsensor.v1"])
        .on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<SubscriberHub>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Handshake: wait for the one-time `subscribe` frame.
    let filter = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Subscribe { filter }) => break Filter::from_spec(&filter),
                Ok(ClientFrame::Pong) => continue,
                Err(e) => {
                    warn!(error = %e, "invalid subscribe frame");
                    return;
                }
            },
            Some(Ok(Message::Close(_))) | None => return,
            Some(Err(_)) => return,
            _ => continue,
        }
    };

    let (id, outbox, dropped) = hub.register(filter).await;
    if ws_tx
        .send(Message::Text(r#"{"type":"subscribed"}"#.into()))
        .await
        .is_err()
    {
        hub.unregister(id).await;
        return;
    }

    let mut heartbeat = tokio::time::interval(Duration::from_secs(15));
    let mut missed_pongs = 0u32;

    loop {
        tokio::select! {
            msg = outbox.recv() => {
                match msg {
                    Some(frame) => {
                        if ws_tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = heartbeat.tick() => {
                missed_pongs += 1;
                if missed_pongs > 2 {
                    debug!(subscriber_id = id, "missed pong timeout, closing");
                    break;
                }
                if ws_tx.send(Message::Text(r#"{"type":"ping"}"#.into())).await.is_err() {
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ClientFrame::Pong) = serde_json::from_str::<ClientFrame>(&text) {
                            missed_pongs = 0;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => missed_pongs = 0,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    let _ = dropped; // already surfaced via hub.dropped_counts()
    hub.unregister(id).await;
}

pub fn validate_scope(_filter: &FilterSpec, _auth_principal: &str) -> Result<(), HubError> {
    // Non-admin tenant scoping is out of scope for v1 (single-tenant
    // deployment assumed); this hook exists for the multi-tenant extension
    // point the spec's auth_principal field implies.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Quality, TirePosition};

    fn sample_reading(device_id: &str, kind: SensorKind) -> Reading {
        Reading {
            device_id: device_id.into(),
            sensor_kind: kind,
            unknown_key: None,
            position: TirePosition::FrontLeft,
            value: 1.0,
            unit: "kPa",
            device_timestamp: 1,
            ingest_timestamp: 1,
            quality: Quality::Good,
        }
    }

    #[tokio::test]
    async fn wildcard_filter_matches_everything() {
        let hub = SubscriberHub::new(4, "slow_drop");
        let (_id, outbox, _) = hub
            .register(Filter::from_spec(&FilterSpec {
                devices: vec!["*".into()],
                kinds: vec![],
            }))
            .await;
        hub.broadcast(&sample_reading("d1", SensorKind::Pressure)).await;
        assert!(outbox.recv().await.is_some());
    }

    #[tokio::test]
    async fn kind_filter_excludes_non_matching_reading() {
        let hub = SubscriberHub::new(4, "slow_drop");
        let (_id, outbox, _) = hub
            .register(Filter::from_spec(&FilterSpec {
                devices: vec!["*".into()],
                kinds: vec!["pressure".into()],
            }))
            .await;
        hub.broadcast(&sample_reading("d1", SensorKind::Humidity)).await;
        assert!(outbox.try_recv().is_none());
    }

    #[tokio::test]
    async fn full_outbox_counts_a_drop_not_a_panic() {
        let hub = SubscriberHub::new(1, "slow_drop");
        let (id, _outbox, _) = hub
            .register(Filter::from_spec(&FilterSpec {
                devices: vec!["*".into()],
                kinds: vec![],
            }))
            .await;
        for _ in 0..10 {
            hub.broadcast(&sample_reading("d1", SensorKind::Pressure)).await;
        }
        let counts = hub.dropped_counts().await;
        assert!(counts[&id] > 0);
    }

    #[tokio::test]
    async fn full_outbox_keeps_the_newest_frame_not_the_oldest() {
        let hub = SubscriberHub::new(1, "slow_drop");
        let (_id, outbox, _) = hub
            .register(Filter::from_spec(&FilterSpec {
                devices: vec!["*".into()],
                kinds: vec![],
            }))
            .await;
        for i in 0..5 {
            let mut r = sample_reading("d1", SensorKind::Pressure);
            r.value = i as f64;
            hub.broadcast(&r).await;
        }
        let frame = outbox.recv().await.unwrap();
        assert!(frame.contains("\"value\":4.0") || frame.contains("4"));
        assert!(!frame.contains("\"value\":0.0"));
    }

    #[tokio::test]
    async fn disconnected_subscriber_not_seen_by_others() {
        let hub = SubscriberHub::new(4, "slow_drop");
        let (id_a, _outbox_a, _) = hub
            .register(Filter::from_spec(&FilterSpec {
                devices: vec!["*".into()],
                kinds: vec![],
            }))
            .await;
        let (_id_b, outbox_b, _) = hub
            .register(Filter::from_spec(&FilterSpec {
                devices: vec!["*".into()],
                kinds: vec![],
            }))
            .await;
        hub.unregister(id_a).await;
        hub.broadcast(&sample_reading("d1", SensorKind::Pressure)).await;
        assert!(outbox_b.recv().await.is_some());
        assert_eq!(hub.connected_count(), 1);
    }
}
