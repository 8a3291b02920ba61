//! Typed error enums, one family per layer, per the error-kind table in the
//! design doc. Each layer decides its own policy (retry, drop, fail) on these
//! before anything crosses a module boundary as `anyhow::Error`.

use thiserror::Error;

/// Errors raised while decoding an inbound device frame (Codec, §4.1).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("missing device_id")]
    MissingDeviceId,

    #[error("malformed json at byte offset {offset:?}: {source}")]
    MalformedJson {
        offset: Option<usize>,
        #[source]
        source: serde_json::Error,
    },

    #[error("timestamp skew {skew_secs}s exceeds max_clock_skew {max_skew_secs}s")]
    ClockSkew { skew_secs: i64, max_skew_secs: i64 },

    #[error("unparseable timestamp: {0}")]
    BadTimestamp(String),
}

/// Errors raised while resolving or authenticating a device (Registry, §4.2).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("device {0} is unknown")]
    UnknownDevice(String),

    #[error("credentials rejected for device {0}")]
    BadCredentials(String),
}

/// Errors raised by the durable sink adapter (§4.5).
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("write-ahead buffer is full")]
    WouldBlock,

    #[error("durable store write failed: {0}")]
    StoreUnavailable(String),

    #[error("sink is shutting down")]
    ShuttingDown,
}

/// Errors raised by the Subscriber Hub (§4.6).
#[derive(Debug, Error)]
pub enum HubError {
    #[error("subscription filter rejected: {0}")]
    InvalidFilter(String),

    #[error("auth token rejected")]
    Unauthorized,

    #[error("subscriber outbox closed")]
    OutboxClosed,
}

/// Errors raised by the Alert Engine (§4.7).
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("rule {0} has an invalid predicate configuration")]
    InvalidRule(String),

    #[error("alert sink dispatch failed after retries: {0}")]
    DispatchFailed(String),
}

/// Fatal startup errors — these fail the process before it begins serving,
/// never mid-run (§7 Fatal policy).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
