//! Server configuration, read once from `SLOTLEDGER_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone)]
pub struct Config {
    /// Bind address for the SQL listener.
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction before the compactor rewrites it.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Prometheus exporter port; unset disables the exporter.
    pub metrics_port: Option<u16>,
    pub webhook_port: u16,
    /// Upper bound on one payout provider dispatch.
    pub dispatch_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            bind: lookup("SLOTLEDGER_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "SLOTLEDGER_PORT").unwrap_or(5433),
            data_dir: PathBuf::from(
                lookup("SLOTLEDGER_DATA_DIR").unwrap_or_else(|| "./data".into()),
            ),
            password: lookup("SLOTLEDGER_PASSWORD").unwrap_or_else(|| "slotledger".into()),
            max_connections: parsed(&lookup, "SLOTLEDGER_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed(&lookup, "SLOTLEDGER_COMPACT_THRESHOLD").unwrap_or(1000),
            tls_cert: lookup("SLOTLEDGER_TLS_CERT"),
            tls_key: lookup("SLOTLEDGER_TLS_KEY"),
            metrics_port: parsed(&lookup, "SLOTLEDGER_METRICS_PORT"),
            webhook_port: parsed(&lookup, "SLOTLEDGER_WEBHOOK_PORT").unwrap_or(8088),
            dispatch_timeout: Duration::from_millis(
                parsed(&lookup, "SLOTLEDGER_DISPATCH_TIMEOUT_MS").unwrap_or(5000),
            ),
        }
    }

    pub fn sql_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn webhook_addr(&self) -> String {
        format!("{}:{}", self.bind, self.webhook_port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|raw| raw.trim().parse().ok())
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("data_dir", &self.data_dir)
            .field("password", &"[redacted]")
            .field("max_connections", &self.max_connections)
            .field("compact_threshold", &self.compact_threshold)
            .field("tls", &self.tls_cert.is_some())
            .field("metrics_port", &self.metrics_port)
            .field("webhook_port", &self.webhook_port)
            .field("dispatch_timeout", &self.dispatch_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config_from(&[]);
        assert_eq!(cfg.sql_addr(), "0.0.0.0:5433");
        assert_eq!(cfg.webhook_addr(), "0.0.0.0:8088");
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.password, "slotledger");
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.dispatch_timeout, Duration::from_secs(5));
        assert!(cfg.tls_cert.is_none() && cfg.tls_key.is_none());
    }

    #[test]
    fn overrides() {
        let cfg = config_from(&[
            ("SLOTLEDGER_PORT", "6543"),
            ("SLOTLEDGER_BIND", "127.0.0.1"),
            ("SLOTLEDGER_METRICS_PORT", " 9100 "),
            ("SLOTLEDGER_DISPATCH_TIMEOUT_MS", "250"),
            ("SLOTLEDGER_DATA_DIR", "/var/lib/slotledger"),
        ]);
        assert_eq!(cfg.sql_addr(), "127.0.0.1:6543");
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.dispatch_timeout, Duration::from_millis(250));
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/slotledger"));
    }

    #[test]
    fn unparseable_numbers_fall_back() {
        let cfg = config_from(&[
            ("SLOTLEDGER_PORT", "eighty"),
            ("SLOTLEDGER_MAX_CONNECTIONS", "-3"),
            ("SLOTLEDGER_METRICS_PORT", "99999"),
        ]);
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.metrics_port, None);
    }

    #[test]
    fn numeric_fields_parse_to_their_own_types() {
        let cfg = config_from(&[
            ("SLOTLEDGER_PORT", "6000"),
            ("SLOTLEDGER_MAX_CONNECTIONS", "100000"),
            ("SLOTLEDGER_COMPACT_THRESHOLD", "5000000000"),
            ("SLOTLEDGER_DISPATCH_TIMEOUT_MS", "90000"),
            ("SLOTLEDGER_WEBHOOK_PORT", "9090"),
        ]);
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.max_connections, 100_000);
        assert_eq!(cfg.compact_threshold, 5_000_000_000);
        assert_eq!(cfg.dispatch_timeout, Duration::from_secs(90));
        assert_eq!(cfg.webhook_addr(), "0.0.0.0:9090");
    }

    #[test]
    fn debug_hides_password() {
        let cfg = config_from(&[("SLOTLEDGER_PASSWORD", "s3cret")]);
        assert!(!format!("{cfg:?}").contains("s3cret"));
    }
}
