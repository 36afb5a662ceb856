//! Server-side configuration types.
//!
//! These structs are deserialized from the operator's config file and handed
//! to the service factories through `service_async::Param` impls. Defaults
//! follow common reverse-proxy practice: 75s keep-alive timeout, one hour
//! connection age, 1000 requests per connection.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use service_async::Param;

pub const DEFAULT_KEEPALIVE_TIME_SECS: u64 = 3600;
pub const DEFAULT_KEEPALIVE_TIMEOUT_SECS: u64 = 75;
pub const DEFAULT_KEEPALIVE_REQUESTS: usize = 1000;

pub const DEFAULT_MAX_REQUEST_LENGTH: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_URI_LENGTH: usize = 8192;
pub const DEFAULT_MAX_HEADER_BYTES: usize = 16 * 1024;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

fn default_keepalive_requests() -> usize {
    DEFAULT_KEEPALIVE_REQUESTS
}

fn default_keepalive_time() -> u64 {
    DEFAULT_KEEPALIVE_TIME_SECS
}

fn default_keepalive_timeout() -> u64 {
    DEFAULT_KEEPALIVE_TIMEOUT_SECS
}

fn default_max_request_length() -> usize {
    DEFAULT_MAX_REQUEST_LENGTH
}

fn default_max_uri_length() -> usize {
    DEFAULT_MAX_URI_LENGTH
}

fn default_max_header_bytes() -> usize {
    DEFAULT_MAX_HEADER_BYTES
}

/// Keep-alive budget for a single downstream connection.
///
/// `keepalive_time` caps the connection age, `keepalive_timeout` is the idle
/// timeout, `keepalive_requests` caps the number of requests served before
/// the connection is drained. `ping_interval` enables protocol-level
/// heartbeats (HTTP/2 PING; for HTTP/1 an idle connection is simply closed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    #[serde(default = "default_keepalive_requests")]
    pub keepalive_requests: usize,
    #[serde(default = "default_keepalive_time")]
    pub keepalive_time: u64,
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout: u64,
    #[serde(default)]
    pub ping_interval: Option<u64>,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            keepalive_requests: DEFAULT_KEEPALIVE_REQUESTS,
            keepalive_time: DEFAULT_KEEPALIVE_TIME_SECS,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT_SECS,
            ping_interval: None,
        }
    }
}

impl KeepaliveConfig {
    pub fn keepalive_time(&self) -> Duration {
        Duration::from_secs(self.keepalive_time)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval.map(Duration::from_secs)
    }
}

/// Wire-level request limits enforced by the decoders.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct RequestLimits {
    #[serde(default = "default_max_request_length")]
    pub max_request_length: usize,
    #[serde(default = "default_max_uri_length")]
    pub max_uri_length: usize,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_request_length: DEFAULT_MAX_REQUEST_LENGTH,
            max_uri_length: DEFAULT_MAX_URI_LENGTH,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
        }
    }
}

/// Graceful-shutdown tuning: how long phase one of the HTTP/2 GOAWAY
/// sequence lasts before the connection is closed abruptly. Zero means
/// "wait only for in-flight streams".
#[derive(Debug, Copy, Clone, Serialize, Deserialize, Default)]
pub struct ShutdownConfig {
    #[serde(default)]
    pub grace_period_secs: u64,
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Per-server assembly parameters consumed by the connection service stack.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub limits: RequestLimits,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl Param<KeepaliveConfig> for ServerConfig {
    fn param(&self) -> KeepaliveConfig {
        self.keepalive.clone()
    }
}

impl Param<RequestLimits> for ServerConfig {
    fn param(&self) -> RequestLimits {
        self.limits
    }
}

impl Param<ShutdownConfig> for ServerConfig {
    fn param(&self) -> ShutdownConfig {
        self.shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_defaults() {
        let cfg: KeepaliveConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.keepalive_requests, DEFAULT_KEEPALIVE_REQUESTS);
        assert_eq!(cfg.keepalive_timeout(), Duration::from_secs(75));
        assert!(cfg.ping_interval().is_none());
    }

    #[test]
    fn test_limits_defaults() {
        let limits = RequestLimits::default();
        assert_eq!(limits.max_uri_length, DEFAULT_MAX_URI_LENGTH);
        assert_eq!(limits.max_header_bytes, DEFAULT_MAX_HEADER_BYTES);
    }
}
