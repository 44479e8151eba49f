use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use classhub_gateway::RetryPolicy;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub jwt_secret: String,
    pub db_path: PathBuf,
    /// When false, room history only lives as long as the process
    pub persist_history: bool,
    pub store_retry: RetryPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let jwt_secret = lookup("CLASSHUB_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("CLASSHUB_JWT_SECRET is unset or still a placeholder; it must match the login service's secret");
        }

        let host = lookup("CLASSHUB_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = lookup("CLASSHUB_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("CLASSHUB_PORT")?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .context("CLASSHUB_HOST")?;

        let db_path: PathBuf = lookup("CLASSHUB_DB_PATH")
            .unwrap_or_else(|| "classhub.db".into())
            .into();
        let persist_history = lookup("CLASSHUB_PERSIST_HISTORY")
            .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
            .unwrap_or(true);

        let defaults = RetryPolicy::default();
        let attempts = match lookup("CLASSHUB_STORE_RETRY_ATTEMPTS") {
            Some(v) => v.parse().context("CLASSHUB_STORE_RETRY_ATTEMPTS")?,
            None => defaults.attempts,
        };
        let backoff = match lookup("CLASSHUB_STORE_RETRY_BACKOFF_MS") {
            Some(v) => Duration::from_millis(v.parse().context("CLASSHUB_STORE_RETRY_BACKOFF_MS")?),
            None => defaults.backoff,
        };

        Ok(Self {
            addr,
            jwt_secret,
            db_path,
            persist_history,
            store_retry: RetryPolicy { attempts, backoff },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("CLASSHUB_JWT_SECRET", "s3cr3t")]).unwrap();
        assert_eq!(config.addr, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.db_path, PathBuf::from("classhub.db"));
        assert!(config.persist_history);
        assert_eq!(config.store_retry.attempts, 3);
        assert_eq!(config.store_retry.backoff, Duration::from_millis(50));
    }

    #[test]
    fn test_placeholder_secret_is_refused() {
        assert!(load(&[]).is_err());
        assert!(load(&[("CLASSHUB_JWT_SECRET", "dev-secret-change-me")]).is_err());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("CLASSHUB_JWT_SECRET", "s3cr3t"),
            ("CLASSHUB_HOST", "127.0.0.1"),
            ("CLASSHUB_PORT", "8080"),
            ("CLASSHUB_PERSIST_HISTORY", "false"),
            ("CLASSHUB_STORE_RETRY_ATTEMPTS", "5"),
            ("CLASSHUB_STORE_RETRY_BACKOFF_MS", "10"),
        ])
        .unwrap();
        assert_eq!(config.addr, "127.0.0.1:8080".parse().unwrap());
        assert!(!config.persist_history);
        assert_eq!(config.store_retry.attempts, 5);
        assert_eq!(config.store_retry.backoff, Duration::from_millis(10));
    }

    #[test]
    fn test_bad_port_is_an_error() {
        assert!(load(&[("CLASSHUB_JWT_SECRET", "s3cr3t"), ("CLASSHUB_PORT", "http")]).is_err());
    }
}
