// src/config.rs
use std::collections::HashSet;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ETF_SYMBOLS: &[&str] = &[
    "NIFTYBEES",
    "BANKBEES",
    "GOLDSHARE",
    "ITBEES",
    "PSUBNKBEES",
    "JUNIORBEES",
    "LIQUIDBEES",
    "CPSE ETF",
    "KOTAKPSU",
    "ICICIB22",
    "HDFCNIFTY",
    "KOTAKNV20",
    "ICICINXT50",
    "RELGOLD",
    "AXISGOLD",
    "HDFCGOLD",
    "ICICIPRUH",
    "KOTAKSILV",
    "ICICINIFTY",
    "AXISBNK",
];

const MAX_SESSION_HOURS: i64 = 24 * 366;
const MAX_RETENTION_DAYS: i64 = 3650;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Scylla,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteSourceKind {
    Simulated,
    Neo,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub scylla_node: String,
    pub scylla_keyspace: String,
    pub store_backend: StoreBackend,
    pub session_secret: String,
    pub session_lifetime: chrono::Duration,
    pub neo_base_url: String,
    pub neo_consumer_key: String,
    pub neo_feed_url: Option<String>,
    pub quote_source: QuoteSourceKind,
    pub refresh_interval: Duration,
    pub api_timeout: Duration,
    pub max_api_retries: u32,
    pub retry_backoff: Duration,
    pub breaker_threshold: u32,
    pub quote_retention_days: i64,
    pub cleanup_hour_ist: u32,
    pub tracked_symbols: Vec<String>,
    pub admin_uccs: HashSet<String>,
}

impl Config {
    /// Reads the process environment, after loading `.env` when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let session_secret = lookup("SESSION_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("SESSION_SECRET"))?;

        let store_backend = match lookup("STORE_BACKEND").as_deref() {
            None | Some("scylla") => StoreBackend::Scylla,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "STORE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let quote_source = match lookup("QUOTE_SOURCE").as_deref() {
            None | Some("simulated") => QuoteSourceKind::Simulated,
            Some("neo") => QuoteSourceKind::Neo,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "QUOTE_SOURCE",
                    value: other.to_string(),
                })
            }
        };

        let tracked_symbols = match lookup("TRACKED_SYMBOLS") {
            Some(raw) => split_list(&raw),
            None => DEFAULT_ETF_SYMBOLS.iter().map(|s| s.to_string()).collect(),
        };

        let cleanup_hour_ist: u32 = parse_in(&lookup, "CLEANUP_HOUR_IST", 2, 0..=23)?;
        let session_hours: i64 = parse_in(&lookup, "SESSION_LIFETIME_HOURS", 24, 1..=MAX_SESSION_HOURS)?;
        let quote_retention_days: i64 =
            parse_in(&lookup, "QUOTE_RETENTION_DAYS", 7, 1..=MAX_RETENTION_DAYS)?;

        Ok(Config {
            bind_addr: parse_or(&lookup, "BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3030)))?,
            scylla_node: lookup("SCYLLA_NODE").unwrap_or_else(|| "127.0.0.1:9042".to_string()),
            scylla_keyspace: lookup("SCYLLA_KEYSPACE").unwrap_or_else(|| "neo_signals".to_string()),
            store_backend,
            session_secret,
            session_lifetime: chrono::Duration::hours(session_hours),
            neo_base_url: lookup("NEO_BASE_URL")
                .unwrap_or_else(|| "https://gw-napi.kotaksecurities.com".to_string()),
            neo_consumer_key: lookup("NEO_CONSUMER_KEY").unwrap_or_default(),
            neo_feed_url: lookup("NEO_FEED_URL").filter(|s| !s.is_empty()),
            quote_source,
            refresh_interval: Duration::from_secs(parse_or(&lookup, "REFRESH_INTERVAL_SECS", 300)?),
            api_timeout: Duration::from_secs(parse_or(&lookup, "API_TIMEOUT_SECS", 30)?),
            max_api_retries: parse_or(&lookup, "MAX_API_RETRIES", 3)?,
            retry_backoff: Duration::from_millis(parse_or(&lookup, "RETRY_BACKOFF_MS", 500)?),
            breaker_threshold: parse_or(&lookup, "BREAKER_THRESHOLD", 5)?,
            quote_retention_days,
            cleanup_hour_ist,
            tracked_symbols,
            admin_uccs: lookup("ADMIN_UCCS")
                .map(|raw| split_list(&raw).into_iter().collect())
                .unwrap_or_default(),
        })
    }

    /// An empty admin list lets every user send signals.
    pub fn is_admin(&self, ucc: &str) -> bool {
        self.admin_uccs.is_empty() || self.admin_uccs.contains(&ucc.to_uppercase())
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn parse_in<F, T>(
    lookup: &F,
    key: &'static str,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + ToString,
{
    let value = parse_or(lookup, key, default)?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config::from_lookup(|key| match key {
        "SESSION_SECRET" => Some("test-secret".to_string()),
        "STORE_BACKEND" => Some("memory".to_string()),
        "TRACKED_SYMBOLS" => Some("NIFTYBEES,BANKBEES".to_string()),
        "MAX_API_RETRIES" => Some("1".to_string()),
        "RETRY_BACKOFF_MS" => Some("0".to_string()),
        "BREAKER_THRESHOLD" => Some("3".to_string()),
        _ => None,
    })
    .expect("test config")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_secret_is_set() {
        let config = Config::from_lookup(lookup_from(&[("SESSION_SECRET", "s")])).unwrap();
        assert_eq!(config.bind_addr.port(), 3030);
        assert_eq!(config.refresh_interval, Duration::from_secs(300));
        assert_eq!(config.max_api_retries, 3);
        assert_eq!(config.quote_retention_days, 7);
        assert_eq!(config.store_backend, StoreBackend::Scylla);
        assert_eq!(config.quote_source, QuoteSourceKind::Simulated);
        assert_eq!(config.tracked_symbols.len(), DEFAULT_ETF_SYMBOLS.len());
        assert!(config.neo_feed_url.is_none());
    }

    #[test]
    fn missing_secret_is_an_error() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SESSION_SECRET")));
    }

    #[test]
    fn bad_number_names_the_key() {
        let err = Config::from_lookup(lookup_from(&[
            ("SESSION_SECRET", "s"),
            ("REFRESH_INTERVAL_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "REFRESH_INTERVAL_SECS", .. }
        ));
    }

    #[test]
    fn out_of_range_numbers_are_rejected() {
        for (key, value) in [
            ("QUOTE_RETENTION_DAYS", "0"),
            ("QUOTE_RETENTION_DAYS", "9000000000000000"),
            ("SESSION_LIFETIME_HOURS", "-1"),
            ("SESSION_LIFETIME_HOURS", "9000000000000000"),
            ("CLEANUP_HOUR_IST", "24"),
        ] {
            let err = Config::from_lookup(lookup_from(&[("SESSION_SECRET", "s"), (key, value)]))
                .unwrap_err();
            match err {
                ConfigError::Invalid { key: bad, .. } => assert_eq!(bad, key),
                other => panic!("{} = {} gave {:?}", key, value, other),
            }
        }
        let config = Config::from_lookup(lookup_from(&[
            ("SESSION_SECRET", "s"),
            ("QUOTE_RETENTION_DAYS", "3650"),
            ("SESSION_LIFETIME_HOURS", "1"),
        ]))
        .unwrap();
        assert_eq!(config.quote_retention_days, 3650);
        assert_eq!(config.session_lifetime, chrono::Duration::hours(1));
    }

    #[test]
    fn symbol_lists_are_trimmed_and_upper_cased() {
        let config = Config::from_lookup(lookup_from(&[
            ("SESSION_SECRET", "s"),
            ("TRACKED_SYMBOLS", " niftybees , ,bankbees"),
            ("ADMIN_UCCS", "ab12c"),
        ]))
        .unwrap();
        assert_eq!(config.tracked_symbols, vec!["NIFTYBEES", "BANKBEES"]);
        assert!(config.is_admin("AB12C"));
        assert!(!config.is_admin("ZZ99Z"));
    }

    #[test]
    fn empty_admin_list_allows_everyone() {
        let config = Config::from_lookup(lookup_from(&[("SESSION_SECRET", "s")])).unwrap();
        assert!(config.is_admin("ANYONE"));
    }
}
