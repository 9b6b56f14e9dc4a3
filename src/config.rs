use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Daemon settings, read from `STAYD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL commits between compactions.
    pub compact_threshold: u64,
    /// Per-operation deadline; none means operations never time out.
    pub op_timeout: Option<Duration>,
    /// Listings to generate at startup; zero disables seeding.
    pub seed_listings: usize,
    pub seed_bookings_per_listing: usize,
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            op_timeout: None,
            seed_listings: 0,
            seed_bookings_per_listing: 8,
            seed: 42,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or unparsable values fall back to
    /// the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse().ok())
        }

        let defaults = Self::default();
        Self {
            data_dir: lookup("STAYD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: parsed(&lookup, "STAYD_METRICS_PORT"),
            compact_threshold: parsed(&lookup, "STAYD_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            op_timeout: parsed(&lookup, "STAYD_OP_TIMEOUT_MS").map(Duration::from_millis),
            seed_listings: parsed(&lookup, "STAYD_SEED_LISTINGS").unwrap_or(defaults.seed_listings),
            seed_bookings_per_listing: parsed(&lookup, "STAYD_SEED_BOOKINGS_PER_LISTING")
                .unwrap_or(defaults.seed_bookings_per_listing),
            seed: parsed(&lookup, "STAYD_SEED").unwrap_or(defaults.seed),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("stayd.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config, Config::default());
        assert_eq!(config.wal_path(), PathBuf::from("./data/stayd.wal"));
    }

    #[test]
    fn reads_every_variable() {
        let config = Config::from_lookup(lookup(&[
            ("STAYD_DATA_DIR", "/var/lib/stayd"),
            ("STAYD_METRICS_PORT", "9100"),
            ("STAYD_COMPACT_THRESHOLD", "50"),
            ("STAYD_OP_TIMEOUT_MS", "2500"),
            ("STAYD_SEED_LISTINGS", "12"),
            ("STAYD_SEED_BOOKINGS_PER_LISTING", "3"),
            ("STAYD_SEED", "7"),
        ]));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/stayd"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.op_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.seed_listings, 12);
        assert_eq!(config.seed_bookings_per_listing, 3);
        assert_eq!(config.seed, 7);
    }

    #[test]
    fn unparsable_values_fall_back() {
        let config = Config::from_lookup(lookup(&[
            ("STAYD_METRICS_PORT", "not-a-port"),
            ("STAYD_COMPACT_THRESHOLD", "-1"),
            ("STAYD_OP_TIMEOUT_MS", ""),
        ]));
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.op_timeout, None);
    }
}
