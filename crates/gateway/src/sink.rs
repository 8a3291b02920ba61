//! Durable Sink Adapter (§4.5): presents a single `append` contract to the
//! Pipeline; internally batches into a bounded write-ahead buffer (WAB) and
//! flushes to the real store on a timer/size trigger, retrying with
//! exponential backoff on failure. Two implementations ship, mirroring the
//! teacher's real-vs-mock `ValveBoard` split behind one method surface:
//! [`SqliteSink`] and [`NullSink`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

use crate::codec::Reading;
use crate::db::Db;
use crate::error::SinkError;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
pub trait DurableSink: Send + Sync {
    /// Accept one Reading into the write-ahead buffer. Returns
    /// `Err(SinkError::WouldBlock)` when the WAB is full (backpressure);
    /// never drops silently.
    async fn append(&self, reading: &Reading) -> Result<(), SinkError>;

    /// Current WAB depth, for `durable_wab_depth` (§6 metrics).
    fn wab_depth(&self) -> i64;

    /// Seconds since the last successful flush, for `/readyz` (§4.8).
    fn last_write_age_secs(&self) -> i64;

    /// Drain the WAB to the underlying store with a deadline; used at
    /// shutdown (§4.8 step 3). Returns the count of entries that could not
    /// be flushed before the deadline (counted as lost).
    async fn drain(&self, deadline: Duration) -> usize;
}

// ---------------------------------------------------------------------------
// SqliteSink
// ---------------------------------------------------------------------------

struct WabEntry {
    reading: Reading,
}

/// Batches into SQLite via the `db` module. A single background flusher task
/// owns the in-memory `VecDeque`; the WAB is a bounded mpsc channel feeding
/// it, so pushes from pipeline shards never contend with each other.
pub struct SqliteSink {
    tx: mpsc::Sender<WabEntry>,
    depth: Arc<AtomicI64>,
    last_write_unix: Arc<AtomicI64>,
    capacity: usize,
    dropped_for_shutdown: Arc<AtomicU64>,
    flusher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SqliteSink {
    pub fn spawn(
        db: Arc<Db>,
        capacity: usize,
        batch_size: usize,
        batch_age: Duration,
        retry_backoff_min: Duration,
        retry_backoff_max: Duration,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity);
        let depth = Arc::new(AtomicI64::new(0));
        let last_write_unix = Arc::new(AtomicI64::new(now_unix()));
        let dropped_for_shutdown = Arc::new(AtomicU64::new(0));

        let flusher = tokio::spawn(flush_loop(
            rx,
            db,
            Arc::clone(&depth),
            Arc::clone(&last_write_unix),
            batch_size,
            batch_age,
            retry_backoff_min,
            retry_backoff_max,
        ));

        Arc::new(SqliteSink {
            tx,
            depth,
            last_write_unix,
            capacity,
            dropped_for_shutdown,
            flusher: Mutex::new(Some(flusher)),
        })
    }
}

#[async_trait]
impl DurableSink for SqliteSink {
    async fn append(&self, reading: &Reading) -> Result<(), SinkError> {
        match self.tx.try_send(WabEntry {
            reading: reading.clone(),
        }) {
            Ok(()) => {
                let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
                crate::metrics::set_durable_wab_depth(depth);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(SinkError::WouldBlock),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::ShuttingDown),
        }
    }

    fn wab_depth(&self) -> i64 {
        self.depth.load(Ordering::Relaxed)
    }

    fn last_write_age_secs(&self) -> i64 {
        now_unix() - self.last_write_unix.load(Ordering::Relaxed)
    }

    async fn drain(&self, deadline: Duration) -> usize {
        let start = tokio::time::Instant::now();
        while self.depth.load(Ordering::Relaxed) > 0 {
            if start.elapsed() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let lost = self.depth.load(Ordering::Relaxed).max(0) as usize;
        self.dropped_for_shutdown
            .fetch_add(lost as u64, Ordering::Relaxed);
        if let Some(handle) = self.flusher.lock().await.take() {
            handle.abort();
        }
        lost
    }
}

#[allow(clippy::too_many_arguments)]
async fn flush_loop(
    mut rx: mpsc::Receiver<WabEntry>,
    db: Arc<Db>,
    depth: Arc<AtomicI64>,
    last_write_unix: Arc<AtomicI64>,
    batch_size: usize,
    batch_age: Duration,
    backoff_min: Duration,
    backoff_max: Duration,
) {
    let mut buf: Vec<Reading> = Vec::with_capacity(batch_size);
    let mut deadline = tokio::time::Instant::now() + batch_age;

    loop {
        let recv = tokio::time::timeout_at(deadline, rx.recv()).await;
        match recv {
            Ok(Some(entry)) => {
                buf.push(entry.reading);
                if buf.len() >= batch_size {
                    flush_batch(&db, &mut buf, &depth, &last_write_unix, backoff_min, backoff_max)
                        .await;
                    deadline = tokio::time::Instant::now() + batch_age;
                }
            }
            Ok(None) => {
                if !buf.is_empty() {
                    flush_batch(&db, &mut buf, &depth, &last_write_unix, backoff_min, backoff_max)
                        .await;
                }
                break;
            }
            Err(_elapsed) => {
                if !buf.is_empty() {
                    flush_batch(&db, &mut buf, &depth, &last_write_unix, backoff_min, backoff_max)
                        .await;
                }
                deadline = tokio::time::Instant::now() + batch_age;
            }
        }
    }
}

async fn flush_batch(
    db: &Arc<Db>,
    buf: &mut Vec<Reading>,
    depth: &Arc<AtomicI64>,
    last_write_unix: &Arc<AtomicI64>,
    backoff_min: Duration,
    backoff_max: Duration,
) {
    let mut backoff = backoff_min;
    loop {
        let start = tokio::time::Instant::now();
        match db.insert_readings(buf).await {
            Ok(()) => {
                let remaining = depth.fetch_sub(buf.len() as i64, Ordering::Relaxed) - buf.len() as i64;
                crate::metrics::set_durable_wab_depth(remaining);
                crate::metrics::record_flush_latency_seconds(start.elapsed().as_secs_f64());
                last_write_unix.store(now_unix(), Ordering::Relaxed);
                buf.clear();
                return;
            }
            Err(e) => {
                error!(error = %e, batch_len = buf.len(), "durable write failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(backoff_max);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// NullSink — no-op adapter for tests
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct NullSink {
    depth: AtomicI64,
    last_write_unix: AtomicI64,
}

impl NullSink {
    pub fn new() -> Self {
        NullSink {
            depth: AtomicI64::new(0),
            last_write_unix: AtomicI64::new(now_unix()),
        }
    }
}

#[async_trait]
impl DurableSink for NullSink {
    async fn append(&self, _reading: &Reading) -> Result<(), SinkError> {
        self.last_write_unix.store(now_unix(), Ordering::Relaxed);
        Ok(())
    }

    fn wab_depth(&self) -> i64 {
        self.depth.load(Ordering::Relaxed)
    }

    fn last_write_age_secs(&self) -> i64 {
        now_unix() - self.last_write_unix.load(Ordering::Relaxed)
    }

    async fn drain(&self, _deadline: Duration) -> usize {
        0
    }
}

/// A sink that always reports backpressure or failure, for exercising the
/// "storage outage" scenario (S5) without a real broken store.
pub struct FailingSink {
    depth: AtomicI64,
    capacity: i64,
}

impl FailingSink {
    pub fn new(capacity: i64) -> Self {
        FailingSink {
            depth: AtomicI64::new(0),
            capacity,
        }
    }
}

#[async_trait]
impl DurableSink for FailingSink {
    async fn append(&self, _reading: &Reading) -> Result<(), SinkError> {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if depth > self.capacity {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            warn!("FailingSink WAB at capacity");
            return Err(SinkError::WouldBlock);
        }
        Err(SinkError::StoreUnavailable("simulated outage".into()))
    }

    fn wab_depth(&self) -> i64 {
        self.depth.load(Ordering::Relaxed)
    }

    fn last_write_age_secs(&self) -> i64 {
        i64::MAX
    }

    async fn drain(&self, _deadline: Duration) -> usize {
        self.depth.load(Ordering::Relaxed) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Quality, SensorKind, TirePosition};

    fn sample_reading() -> Reading {
        Reading {
            device_id: "d1".into(),
            sensor_kind: SensorKind::Pressure,
            unknown_key: None,
            position: TirePosition::FrontLeft,
            value: 220.0,
            unit: "kPa",
            device_timestamp: 1,
            ingest_timestamp: 1,
            quality: Quality::Good,
        }
    }

    #[tokio::test]
    async fn null_sink_always_accepts() {
        let sink = NullSink::new();
        assert!(sink.append(&sample_reading()).await.is_ok());
        assert_eq!(sink.wab_depth(), 0);
    }

    #[tokio::test]
    async fn failing_sink_blocks_once_full() {
        let sink = FailingSink::new(2);
        assert!(matches!(
            sink.append(&sample_reading()).await,
            Err(SinkError::StoreUnavailable(_))
        ));
        assert!(matches!(
            sink.append(&sample_reading()).await,
            Err(SinkError::StoreUnavailable(_))
        ));
        assert!(matches!(
            sink.append(&sample_reading()).await,
            Err(SinkError::WouldBlock)
        ));
    }

    #[tokio::test]
    async fn sqlite_sink_round_trips_a_reading() {
        let db = Arc::new(Db::connect("sqlite::memory:").await.unwrap());
        db.migrate().await.unwrap();
        let sink = SqliteSink::spawn(
            Arc::clone(&db),
            64,
            1,
            Duration::from_millis(50),
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        sink.append(&sample_reading()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let rows = db.list_readings("d1", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
