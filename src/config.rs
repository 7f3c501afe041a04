use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::coordinator::DEFAULT_HOLD_TTL_MINUTES;
use crate::limits::{MAX_HOLD_TTL_MINUTES, MIN_HOLD_TTL_MINUTES};

/// Server settings, read from `RIDEHOLD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub hold_ttl_minutes: u32,
    pub reap_interval: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "ridehold".into(),
            max_connections: 256,
            compact_threshold: 1000,
            hold_ttl_minutes: DEFAULT_HOLD_TTL_MINUTES,
            reap_interval: Duration::from_secs(5),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let hold_ttl_minutes = parsed(&lookup, "RIDEHOLD_HOLD_TTL_MINUTES")
            .unwrap_or(defaults.hold_ttl_minutes)
            .clamp(MIN_HOLD_TTL_MINUTES, MAX_HOLD_TTL_MINUTES);
        let reap_interval = parsed(&lookup, "RIDEHOLD_REAP_INTERVAL_SECS")
            .filter(|secs: &u64| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.reap_interval);

        Self {
            port: parsed(&lookup, "RIDEHOLD_PORT").unwrap_or(defaults.port),
            bind: lookup("RIDEHOLD_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("RIDEHOLD_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: lookup("RIDEHOLD_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "RIDEHOLD_MAX_CONNECTIONS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "RIDEHOLD_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            hold_ttl_minutes,
            reap_interval,
            metrics_port: parsed(&lookup, "RIDEHOLD_METRICS_PORT"),
            tls_cert: lookup("RIDEHOLD_TLS_CERT"),
            tls_key: lookup("RIDEHOLD_TLS_KEY"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ridehold.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
