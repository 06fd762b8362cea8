use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server settings. Every field has a default and an `INNKEEP_*` override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub user: String,
    pub password: String,
    pub max_connections: usize,
    /// Appends since the last compaction that trigger a rewrite of the WAL.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
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
            user: "innkeep".into(),
            password: "innkeep".into(),
            max_connections: 256,
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(60),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&lookup, "INNKEEP_PORT").unwrap_or(defaults.port),
            bind: lookup("INNKEEP_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("INNKEEP_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            user: lookup("INNKEEP_USER").unwrap_or(defaults.user),
            password: lookup("INNKEEP_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "INNKEEP_MAX_CONNECTIONS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "INNKEEP_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            compact_interval: parsed(&lookup, "INNKEEP_COMPACT_INTERVAL_SECS")
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.compact_interval),
            metrics_port: parsed(&lookup, "INNKEEP_METRICS_PORT"),
            tls_cert: lookup("INNKEEP_TLS_CERT"),
            tls_key: lookup("INNKEEP_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|raw| raw.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn empty_env_gives_defaults() {
        assert_eq!(from_pairs(&[]), Config::default());
        assert_eq!(Config::default().listen_addr(), "0.0.0.0:5433");
    }

    #[test]
    fn overrides_apply() {
        let config = from_pairs(&[
            ("INNKEEP_PORT", "6543"),
            ("INNKEEP_BIND", "127.0.0.1"),
            ("INNKEEP_DATA_DIR", "/var/lib/innkeep"),
            ("INNKEEP_USER", "frontdesk"),
            ("INNKEEP_PASSWORD", "s3cret"),
            ("INNKEEP_MAX_CONNECTIONS", "8"),
            ("INNKEEP_COMPACT_THRESHOLD", "50"),
            ("INNKEEP_COMPACT_INTERVAL_SECS", "5"),
            ("INNKEEP_METRICS_PORT", "9100"),
            ("INNKEEP_TLS_CERT", "cert.pem"),
            ("INNKEEP_TLS_KEY", "key.pem"),
        ]);
        assert_eq!(config.listen_addr(), "127.0.0.1:6543");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/innkeep"));
        assert_eq!(config.user, "frontdesk");
        assert_eq!(config.password, "s3cret");
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.compact_interval, Duration::from_secs(5));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.tls_cert.as_deref(), Some("cert.pem"));
        assert_eq!(config.tls_key.as_deref(), Some("key.pem"));
    }

    #[test]
    fn bad_numbers_fall_back() {
        let config = from_pairs(&[
            ("INNKEEP_PORT", "not-a-port"),
            ("INNKEEP_MAX_CONNECTIONS", "0"),
            ("INNKEEP_COMPACT_INTERVAL_SECS", "0"),
            ("INNKEEP_METRICS_PORT", "99999"),
        ]);
        assert_eq!(config.port, 5433);
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.compact_interval, Duration::from_secs(60));
        assert_eq!(config.metrics_port, None);
    }
}
