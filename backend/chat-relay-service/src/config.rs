use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: usize,
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// A session with no ping/pong traffic for this long is closed.
    pub client_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// `None` runs the relay against the in-memory store.
    pub database: Option<DatabaseConfig>,
    pub call_ring_timeout: Duration,
    pub ws: WsConfig,
    pub history_page_limit_max: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database: None,
            call_ring_timeout: Duration::from_secs(30),
            ws: WsConfig {
                heartbeat_interval: Duration::from_secs(5),
                client_timeout: Duration::from_secs(30),
            },
            history_page_limit_max: 200,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so parsing can be tested without
    /// touching the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host = lookup("BIND_HOST")
            .filter(|h| !h.trim().is_empty())
            .unwrap_or(defaults.host);
        let port = parse_or(&lookup, "PORT", defaults.port)?;

        let database = match lookup("DATABASE_URL").filter(|u| !u.trim().is_empty()) {
            Some(url) => Some(DatabaseConfig {
                url,
                max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 16usize)?,
            }),
            None => None,
        };

        let ring_secs: u64 = parse_or(
            &lookup,
            "CALL_RING_TIMEOUT_SECS",
            defaults.call_ring_timeout.as_secs(),
        )?;
        let heartbeat_secs: u64 = parse_or(
            &lookup,
            "WS_HEARTBEAT_INTERVAL_SECS",
            defaults.ws.heartbeat_interval.as_secs(),
        )?;
        let client_timeout_secs: u64 = parse_or(
            &lookup,
            "WS_CLIENT_TIMEOUT_SECS",
            defaults.ws.client_timeout.as_secs(),
        )?;

        if ring_secs == 0 {
            return Err(AppError::Config("CALL_RING_TIMEOUT_SECS must be > 0".into()));
        }
        if heartbeat_secs == 0 || client_timeout_secs <= heartbeat_secs {
            return Err(AppError::Config(
                "WS_CLIENT_TIMEOUT_SECS must exceed WS_HEARTBEAT_INTERVAL_SECS (> 0)".into(),
            ));
        }

        let history_page_limit_max: i64 =
            parse_or(&lookup, "HISTORY_PAGE_LIMIT_MAX", defaults.history_page_limit_max)?;
        if history_page_limit_max <= 0 {
            return Err(AppError::Config("HISTORY_PAGE_LIMIT_MAX must be > 0".into()));
        }

        Ok(Self {
            host,
            port,
            database,
            call_ring_timeout: Duration::from_secs(ring_secs),
            ws: WsConfig {
                heartbeat_interval: Duration::from_secs(heartbeat_secs),
                client_timeout: Duration::from_secs(client_timeout_secs),
            },
            history_page_limit_max,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{key}={raw}: {e}"))),
        None => Ok(default),
    }
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
    fn defaults_without_environment() {
        let cfg = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(cfg.bind_addr(), "0.0.0.0:3000");
        assert!(cfg.database.is_none());
        assert_eq!(cfg.call_ring_timeout, Duration::from_secs(30));
        assert_eq!(cfg.ws.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.history_page_limit_max, 200);
    }

    #[test]
    fn database_section_only_when_url_present() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://relay@localhost/relay"),
            ("DB_MAX_CONNECTIONS", "4"),
        ]))
        .unwrap();
        let db = cfg.database.unwrap();
        assert_eq!(db.max_connections, 4);
        assert!(db.url.starts_with("postgres://"));
    }

    #[test]
    fn rejects_garbage_numbers() {
        let err = Config::from_lookup(lookup_from(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("PORT")));
    }

    #[test]
    fn rejects_timeout_shorter_than_heartbeat() {
        let err = Config::from_lookup(lookup_from(&[
            ("WS_HEARTBEAT_INTERVAL_SECS", "10"),
            ("WS_CLIENT_TIMEOUT_SECS", "10"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
