//! Authoritative in-memory map of known devices: credentials, last-seen,
//! health score. Sharded by hash of `device_id` to bound lock contention;
//! each shard's map lives behind an `ArcSwap` snapshot pointer, so every read
//! is a single lock-free `load()` and writers never block readers (§4.2).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::codec::Quality;
use crate::error::AuthError;

pub const DEFAULT_SHARDS: usize = 16;
const HEALTH_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Tpms,
    Environmental,
    Gateway,
    Unknown,
}

impl DeviceKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "tpms" => Self::Tpms,
            "environmental" => Self::Environmental,
            "gateway" => Self::Gateway,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub device_id: String,
    pub kind: DeviceKind,
    pub credentials_fingerprint: Option<String>,
    pub known_since: i64,
    pub last_seen_at: i64,
    pub firmware_version: Option<String>,
    pub health_score: u8,
    /// Ring of the last [`HEALTH_WINDOW`] quality samples, most recent last.
    quality_window: Vec<Quality>,
    pub expected_cadence_secs: i64,
    pub last_battery_v: Option<f64>,
}

/// Immutable copy handed to other components — never mutated in place.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub device_id: String,
    pub kind: DeviceKind,
    pub last_seen_at: i64,
    pub health_score: u8,
}

impl From<&DeviceRecord> for DeviceView {
    fn from(r: &DeviceRecord) -> Self {
        DeviceView {
            device_id: r.device_id.clone(),
            kind: r.kind,
            last_seen_at: r.last_seen_at,
            health_score: r.health_score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownDevicePolicy {
    Reject,
    AutoProvision,
    Quarantine,
}

impl UnknownDevicePolicy {
    pub fn parse(s: &str) -> Self {
        match s {
            "auto_provision" => Self::AutoProvision,
            "quarantine" => Self::Quarantine,
            _ => Self::Reject,
        }
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Pure, deterministic: same inputs always yield the same score (§3 invariant,
/// §8 testable property 4).
pub fn compute_health_score(
    quality_window: &[Quality],
    now: i64,
    last_seen_at: i64,
    expected_cadence_secs: i64,
    battery_v: Option<f64>,
) -> u8 {
    let quality_fraction = if quality_window.is_empty() {
        1.0
    } else {
        let good = quality_window.iter().filter(|q| **q == Quality::Good).count();
        good as f64 / quality_window.len() as f64
    };

    let staleness_ratio = if expected_cadence_secs <= 0 {
        0.0
    } else {
        let age = (now - last_seen_at).max(0) as f64;
        (age / expected_cadence_secs as f64).min(4.0) / 4.0
    };
    let freshness_fraction = 1.0 - staleness_ratio;

    let battery_fraction = match battery_v {
        Some(v) if v >= 3.3 => 1.0,
        Some(v) if v >= 3.0 => 0.7,
        Some(v) if v >= 2.7 => 0.3,
        Some(_) => 0.0,
        None => 1.0,
    };

    let score = 0.5 * quality_fraction + 0.3 * freshness_fraction + 0.2 * battery_fraction;
    (score.clamp(0.0, 1.0) * 100.0).round() as u8
}

/// Partitions the key space for both the Registry and the Pipeline (§4.2,
/// §4.4) so the two sharding schemes share this one helper.
pub fn shard_index(key: &str, shard_count: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count.max(1)
}

type DeviceMap = HashMap<String, Arc<DeviceRecord>>;

struct Shard {
    // Readers call `.load()` and never block. Writers serialize through
    // `write_lock`, clone the current generation, mutate the clone, and swap
    // it in — a classic read-copy-update so a write in shard N can never
    // stall a read in shard N.
    map: ArcSwap<DeviceMap>,
    write_lock: Mutex<()>,
}

pub struct Registry {
    shards: Vec<Shard>,
    unknown_policy: UnknownDevicePolicy,
    default_cadence_secs: i64,
}

pub enum ResolveOutcome {
    Known(Arc<DeviceRecord>),
    Unknown,
    AuthFailed,
}

fn new_record(
    device_id: &str,
    kind: DeviceKind,
    fingerprint: Option<String>,
    default_cadence_secs: i64,
) -> Arc<DeviceRecord> {
    Arc::new(DeviceRecord {
        device_id: device_id.to_owned(),
        kind,
        credentials_fingerprint: fingerprint,
        known_since: now_unix(),
        last_seen_at: now_unix(),
        firmware_version: None,
        health_score: 100,
        quality_window: Vec::new(),
        expected_cadence_secs: default_cadence_secs,
        last_battery_v: None,
    })
}

impl Registry {
    pub fn new(shard_count: usize, unknown_policy: UnknownDevicePolicy) -> Self {
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(Shard {
                map: ArcSwap::new(Arc::new(HashMap::new())),
                write_lock: Mutex::new(()),
            });
        }
        Registry {
            shards,
            unknown_policy,
            default_cadence_secs: 300,
        }
    }

    fn shard_for(&self, device_id: &str) -> &Shard {
        &self.shards[shard_index(device_id, self.shards.len())]
    }

    /// Seed a device at startup (from config or a durable store reload). Does
    /// not go through the resolve/auth path.
    pub async fn seed(&self, device_id: &str, kind: DeviceKind, fingerprint: Option<String>) {
        let shard = self.shard_for(device_id);
        let _guard = shard.write_lock.lock().await;
        let current = shard.map.load();
        if current.contains_key(device_id) {
            return;
        }
        let mut next = (**current).clone();
        next.insert(
            device_id.to_owned(),
            new_record(device_id, kind, fingerprint, self.default_cadence_secs),
        );
        shard.map.store(Arc::new(next));
    }

    /// `resolve(device_id, credentials) → Device | Unknown | AuthFailed` (§4.2).
    pub async fn resolve(&self, device_id: &str, credentials: Option<&str>) -> ResolveOutcome {
        let shard = self.shard_for(device_id);
        // Lock-free fast path: the vast majority of resolves hit a device
        // that's already known.
        let existing = shard.map.load().get(device_id).cloned();

        match existing {
            Some(record) => {
                if let Some(expected) = &record.credentials_fingerprint {
                    if credentials != Some(expected.as_str()) {
                        return ResolveOutcome::AuthFailed;
                    }
                }
                ResolveOutcome::Known(record)
            }
            None => match self.unknown_policy {
                UnknownDevicePolicy::Reject => ResolveOutcome::Unknown,
                UnknownDevicePolicy::AutoProvision | UnknownDevicePolicy::Quarantine => {
                    let _guard = shard.write_lock.lock().await;
                    // Re-check under the write lock: another writer may have
                    // auto-provisioned this device between the lock-free read
                    // above and acquiring the lock.
                    let current = shard.map.load();
                    if let Some(record) = current.get(device_id) {
                        return ResolveOutcome::Known(Arc::clone(record));
                    }
                    let record = new_record(
                        device_id,
                        DeviceKind::Unknown,
                        None,
                        self.default_cadence_secs,
                    );
                    let mut next = (**current).clone();
                    next.insert(device_id.to_owned(), Arc::clone(&record));
                    shard.map.store(Arc::new(next));
                    ResolveOutcome::Known(record)
                }
            },
        }
    }

    /// Resolve a device by id and return an [`AuthError`] in the shape the
    /// Ingest Front-End expects.
    pub async fn resolve_or_err(
        &self,
        device_id: &str,
        credentials: Option<&str>,
    ) -> Result<Arc<DeviceRecord>, AuthError> {
        match self.resolve(device_id, credentials).await {
            ResolveOutcome::Known(d) => Ok(d),
            ResolveOutcome::Unknown => Err(AuthError::UnknownDevice(device_id.to_owned())),
            ResolveOutcome::AuthFailed => Err(AuthError::BadCredentials(device_id.to_owned())),
        }
    }

    /// `touch(device_id, ingest_timestamp, quality_sample)` — updates
    /// last-seen and rolls the health-score window (§4.2).
    pub async fn touch(
        &self,
        device_id: &str,
        ingest_timestamp: i64,
        quality_sample: Quality,
        battery_v: Option<f64>,
    ) {
        let shard = self.shard_for(device_id);
        let _guard = shard.write_lock.lock().await;
        let current = shard.map.load();
        let Some(existing) = current.get(device_id) else {
            return;
        };
        let mut record = (**existing).clone();
        record.last_seen_at = ingest_timestamp.max(record.last_seen_at);
        record.quality_window.push(quality_sample);
        if record.quality_window.len() > HEALTH_WINDOW {
            record.quality_window.remove(0);
        }
        if battery_v.is_some() {
            record.last_battery_v = battery_v;
        }
        record.health_score = compute_health_score(
            &record.quality_window,
            now_unix(),
            record.last_seen_at,
            record.expected_cadence_secs,
            record.last_battery_v,
        );
        let mut next = (**current).clone();
        next.insert(device_id.to_owned(), Arc::new(record));
        shard.map.store(Arc::new(next));
    }

    /// `snapshot(device_id) → DeviceView` (§4.2). Lock-free.
    pub async fn snapshot(&self, device_id: &str) -> Option<DeviceView> {
        let shard = self.shard_for(device_id);
        shard.map.load().get(device_id).map(|r| DeviceView::from(r.as_ref()))
    }

    /// `evict(device_id)` — admin path (§4.2).
    pub async fn evict(&self, device_id: &str) -> bool {
        let shard = self.shard_for(device_id);
        let _guard = shard.write_lock.lock().await;
        let current = shard.map.load();
        if !current.contains_key(device_id) {
            return false;
        }
        let mut next = (**current).clone();
        next.remove(device_id);
        shard.map.store(Arc::new(next));
        true
    }

    /// Evict devices idle longer than `max_idle_secs`, for the TTL-eviction
    /// sweep the Supervisor drives periodically.
    pub async fn evict_idle(&self, max_idle_secs: i64) -> usize {
        let now = now_unix();
        let mut evicted = 0;
        for shard in &self.shards {
            let _guard = shard.write_lock.lock().await;
            let current = shard.map.load();
            let stale: Vec<String> = current
                .iter()
                .filter(|(_, r)| now - r.last_seen_at > max_idle_secs)
                .map(|(id, _)| id.clone())
                .collect();
            if stale.is_empty() {
                continue;
            }
            let mut next = (**current).clone();
            for id in &stale {
                next.remove(id);
            }
            evicted += stale.len();
            shard.map.store(Arc::new(next));
        }
        evicted
    }

    pub async fn list(&self) -> Vec<DeviceView> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.map.load().values().map(|r| DeviceView::from(r.as_ref())));
        }
        out
    }

    pub async fn len(&self) -> usize {
        self.shards.iter().map(|s| s.map.load().len()).sum()
    }
}
