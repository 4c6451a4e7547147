use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server settings, read once from `TRIPLINE_*` environment variables.
/// Unset or unparseable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub reconcile_interval: Duration,
    /// Prometheus exporter port; `None` leaves the exporter off.
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            reconcile_interval: Duration::from_secs(300),
            metrics_port: None,
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

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            bind: lookup("TRIPLINE_BIND").unwrap_or(d.bind),
            port: parsed(&lookup, "TRIPLINE_PORT").unwrap_or(d.port),
            data_dir: lookup("TRIPLINE_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            max_connections: parsed(&lookup, "TRIPLINE_MAX_CONNECTIONS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "TRIPLINE_COMPACT_THRESHOLD")
                .unwrap_or(d.compact_threshold),
            reconcile_interval: parsed(&lookup, "TRIPLINE_RECONCILE_INTERVAL_SECS")
                .filter(|s: &u64| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.reconcile_interval),
            metrics_port: parsed(&lookup, "TRIPLINE_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("tripline.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = config(&[]);
        assert_eq!(c, Config::default());
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert_eq!(c.wal_path(), PathBuf::from("./data/tripline.wal"));
    }

    #[test]
    fn reads_overrides() {
        let c = config(&[
            ("TRIPLINE_BIND", "127.0.0.1"),
            ("TRIPLINE_PORT", "6543"),
            ("TRIPLINE_DATA_DIR", "/var/lib/tripline"),
            ("TRIPLINE_MAX_CONNECTIONS", "8"),
            ("TRIPLINE_COMPACT_THRESHOLD", "50"),
            ("TRIPLINE_RECONCILE_INTERVAL_SECS", "60"),
            ("TRIPLINE_METRICS_PORT", "9000"),
        ]);
        assert_eq!(c.listen_addr(), "127.0.0.1:6543");
        assert_eq!(c.data_dir, PathBuf::from("/var/lib/tripline"));
        assert_eq!(c.max_connections, 8);
        assert_eq!(c.compact_threshold, 50);
        assert_eq!(c.reconcile_interval, Duration::from_secs(60));
        assert_eq!(c.metrics_port, Some(9000));
    }

    #[test]
    fn garbage_falls_back() {
        let c = config(&[
            ("TRIPLINE_PORT", "not-a-port"),
            ("TRIPLINE_MAX_CONNECTIONS", "0"),
            ("TRIPLINE_RECONCILE_INTERVAL_SECS", "0"),
            ("TRIPLINE_METRICS_PORT", "99999"),
        ]);
        assert_eq!(c.port, 5433);
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.reconcile_interval, Duration::from_secs(300));
        assert_eq!(c.metrics_port, None);
    }
}
