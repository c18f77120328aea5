// Typed, builder-style configuration, in the style of the connection-level
// config structs this crate's design is adapted from: a struct with sensible
// `Default`s and `with_*` methods for the options worth overriding.

use serde::Serialize;
use std::time::Duration;

/// Options sent in the `IDENTIFY` command during connection handshake.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyOptions {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub feature_negotiation: bool,
    pub heartbeat_interval: i64,
    pub tls_v1: bool,
    pub snappy: bool,
    pub deflate: bool,
    pub deflate_level: i32,
    pub sample_rate: i32,
    pub msg_timeout: Option<i64>,
    /// Shared secret sent via a separate `AUTH` command once `IDENTIFY`
    /// completes; never part of the `IDENTIFY` body itself.
    #[serde(skip)]
    pub auth_secret: Option<Vec<u8>>,
}

impl Default for IdentifyOptions {
    fn default() -> Self {
        let hostname = hostname_or_unknown();
        IdentifyOptions {
            client_id: hostname.clone(),
            hostname,
            user_agent: format!("nsq-client/{}", env!("CARGO_PKG_VERSION")),
            feature_negotiation: true,
            heartbeat_interval: 30_000,
            tls_v1: false,
            snappy: false,
            deflate: false,
            deflate_level: 6,
            sample_rate: 0,
            msg_timeout: None,
            auth_secret: None,
        }
    }
}

impl IdentifyOptions {
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.as_millis() as i64;
        self
    }

    pub fn with_deflate(mut self, level: i32) -> Self {
        self.deflate = true;
        self.deflate_level = level;
        self.snappy = false;
        self
    }

    pub fn with_snappy(mut self) -> Self {
        self.snappy = true;
        self.deflate = false;
        self
    }

    pub fn with_tls_v1(mut self) -> Self {
        self.tls_v1 = true;
        self
    }

    pub fn with_sample_rate(mut self, rate: i32) -> Self {
        self.sample_rate = rate.clamp(0, 99);
        self
    }

    pub fn with_msg_timeout(mut self, timeout: Duration) -> Self {
        self.msg_timeout = Some(timeout.as_millis() as i64);
        self
    }

    pub fn with_auth_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.auth_secret = Some(secret.into());
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.snappy && self.deflate {
            return Err("snappy and deflate are mutually exclusive".to_string());
        }
        Ok(())
    }
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

/// Configuration for a `Consumer`: discovery addresses, flow-control
/// parameters, and the timers governing redistribution, reconnection, and
/// lookupd polling.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub nsqd_tcp_addresses: Vec<String>,
    pub lookupd_http_addresses: Vec<String>,
    pub max_in_flight: u32,
    pub identify: IdentifyOptions,
    pub idle_timeout: Duration,
    pub redistribute_timeout: Duration,
    pub lookupd_poll_time: Duration,
    pub dial_timeout: Duration,
    pub lookupd_connect_timeout: Duration,
    pub lookupd_read_timeout: Duration,
    pub message_queue_capacity: Option<usize>,
    pub stop_grace_period: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            nsqd_tcp_addresses: Vec::new(),
            lookupd_http_addresses: Vec::new(),
            max_in_flight: 42,
            identify: IdentifyOptions::default(),
            idle_timeout: Duration::from_secs(10),
            redistribute_timeout: Duration::from_secs(5),
            lookupd_poll_time: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(5),
            lookupd_connect_timeout: Duration::from_secs(5),
            lookupd_read_timeout: Duration::from_secs(10),
            message_queue_capacity: None,
            stop_grace_period: Duration::from_secs(5),
        }
    }
}

impl ConsumerConfig {
    pub fn with_nsqd_addresses(mut self, addrs: impl IntoIterator<Item = String>) -> Self {
        self.nsqd_tcp_addresses = addrs.into_iter().collect();
        self
    }

    pub fn with_lookupd_addresses(mut self, addrs: impl IntoIterator<Item = String>) -> Self {
        self.lookupd_http_addresses = addrs.into_iter().collect();
        self
    }

    pub fn with_max_in_flight(mut self, n: u32) -> Self {
        self.max_in_flight = n;
        self
    }

    pub fn with_identify(mut self, identify: IdentifyOptions) -> Self {
        self.identify = identify;
        self
    }

    /// Capacity of the bounded message queue; defaults to `max_in_flight * 2`.
    pub fn queue_capacity(&self) -> usize {
        self.message_queue_capacity
            .unwrap_or_else(|| (self.max_in_flight as usize) * 2)
    }

    pub fn uses_lookupd(&self) -> bool {
        !self.lookupd_http_addresses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_defaults_are_conservative() {
        let opts = IdentifyOptions::default();
        assert_eq!(opts.heartbeat_interval, 30_000);
        assert!(opts.feature_negotiation);
        assert!(!opts.snappy && !opts.deflate);
    }

    #[test]
    fn snappy_and_deflate_are_mutually_exclusive() {
        let opts = IdentifyOptions::default().with_deflate(6).with_snappy();
        assert!(opts.snappy && !opts.deflate);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn queue_capacity_defaults_to_double_max_in_flight() {
        let cfg = ConsumerConfig::default().with_max_in_flight(10);
        assert_eq!(cfg.queue_capacity(), 20);
    }

    #[test]
    fn auth_secret_is_unset_by_default_and_settable() {
        let opts = IdentifyOptions::default();
        assert!(opts.auth_secret.is_none());
        let opts = opts.with_auth_secret(b"sekrit".to_vec());
        assert_eq!(opts.auth_secret.as_deref(), Some(&b"sekrit"[..]));
    }
}
