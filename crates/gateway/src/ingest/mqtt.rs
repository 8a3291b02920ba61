//! MQTT ingest: maintains a durable session to the configured broker,
//! subscribes to `<root>/devices/+/data`, decodes and authenticates each
//! message, and hands it to the Pipeline. Built on `rumqttc`'s
//! `AsyncClient`/`EventLoop` split, following the teacher's reconnect-and-
//! resubscribe-on-ConnAck pattern in `main.rs`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::codec::decode_frame;
use crate::config::MqttConfig;
use crate::ingest::KeyedRateLimiter;
use crate::pipeline::PipelineHandle;
use crate::registry::Registry;
use crate::state::SharedState;

const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(60);
const DEFAULT_MAX_CLOCK_SKEW_SECS: i64 = 24 * 3600;

fn qos_from(q: u8) -> QoS {
    match q {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

pub fn build_client(cfg: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    options.set_keep_alive(Duration::from_secs(cfg.keepalive_secs));
    // QoS >= 1 is load-bearing for the backpressure policy (§5): acks are
    // only sent once a Reading has been accepted into the write-ahead
    // buffer, so the broker holds undelivered messages under backpressure.
    options.set_manual_acks(true);
    AsyncClient::new(options, 64)
}

/// Drives the MQTT event loop until `connected.load()` observes shutdown
/// (the caller drops this task's `JoinHandle` to stop it). Reconnects with
/// exponential backoff capped at 60s and resubscribes on every successful
/// reconnect, matching the teacher's `main.rs` handling of broker drops.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    client: AsyncClient,
    mut eventloop: EventLoop,
    cfg: MqttConfig,
    registry: Arc<Registry>,
    pipeline: PipelineHandle,
    limiter: Arc<KeyedRateLimiter>,
    mqtt_connected: Arc<AtomicBool>,
    state: SharedState,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let topic = format!("{}/devices/+/data", cfg.topic_root);
    let qos = qos_from(cfg.qos);
    let mut backoff = Duration::from_millis(100);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("mqtt ingest stopping: shutdown requested");
                mqtt_connected.store(false, Ordering::Relaxed);
                return;
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(topic = %topic, "mqtt connected, subscribing");
                        mqtt_connected.store(true, Ordering::Relaxed);
                        backoff = Duration::from_millis(100);
                        if let Err(e) = client.subscribe(&topic, qos).await {
                            error!(error = %e, "mqtt subscribe failed");
                        }
                        let mut st = state.write().await;
                        st.mqtt_connected = true;
                        st.record_system("mqtt connected".to_string());
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_publish(&publish, &client, &registry, &pipeline, &limiter, &state).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, backoff_ms = backoff.as_millis(), "mqtt connection error, backing off");
                        mqtt_connected.store(false, Ordering::Relaxed);
                        let mut st = state.write().await;
                        st.mqtt_connected = false;
                        st.record_system(format!("mqtt connection error: {e}"));
                        drop(st);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
                    }
                }
            }
        }
    }
}

async fn handle_publish(
    publish: &rumqttc::Publish,
    client: &AsyncClient,
    registry: &Arc<Registry>,
    pipeline: &PipelineHandle,
    limiter: &Arc<KeyedRateLimiter>,
    state: &SharedState,
) {
    crate::metrics::record_ingest_frame("mqtt");

    let decoded = match decode_frame(
        &publish.payload,
        OffsetDateTime::now_utc(),
        DEFAULT_MAX_CLOCK_SKEW_SECS,
    ) {
        Ok(d) => d,
        Err(e) => {
            debug!(error = %e, "mqtt frame decode failed");
            crate::metrics::record_ingest_rejected("decode");
            state
                .write()
                .await
                .record_error(format!("mqtt frame decode failed: {e}"));
            // Ack anyway: a malformed frame will never decode on redelivery.
            let _ = client.ack(publish).await;
            return;
        }
    };

    if !limiter.admit(&decoded.device_id).await {
        crate::metrics::record_ingest_rejected("rate_limited");
        return;
    }

    match registry.resolve_or_err(&decoded.device_id, None).await {
        Ok(_device) => {
            let reading_count = decoded.readings.len();
            for reading in decoded.readings {
                // enqueue resolves only once C5 durably appends the reading,
                // so the ack below never races ahead of the write-ahead buffer.
                pipeline.enqueue(reading).await;
            }
            // Manual ack only after the readings have been handed to the
            // pipeline (which itself blocks until C5 accepts them) — this is
            // the "only ack once in the WAB" contract from §5.
            let _ = client.ack(publish).await;
            state
                .write()
                .await
                .record_reading(&decoded.device_id, reading_count);
        }
        Err(e) => {
            debug!(device_id = %decoded.device_id, error = %e, "mqtt auth rejected");
            crate::metrics::record_ingest_rejected("auth");
            state.write().await.record_error(format!(
                "mqtt auth rejected for {}: {e}",
                decoded.device_id
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_mapping_matches_config_values() {
        assert_eq!(qos_from(0), QoS::AtMostOnce);
        assert_eq!(qos_from(1), QoS::AtLeastOnce);
        assert_eq!(qos_from(2), QoS::ExactlyOnce);
        assert_eq!(qos_from(9), QoS::AtLeastOnce);
    }
}
