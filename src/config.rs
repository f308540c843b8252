use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::money::MAX_DECIMALS;
use crate::transfer::{LockOrdering, RetryPolicy};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    pub environment: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "account_ledger".to_string(),
            environment: "dev".to_string(),
        }
    }
}

/// PostgreSQL connection settings
///
/// `url` wins over the individual host/port/user/password/name fields.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Initial connect attempts before giving up
    pub connect_attempts: u32,
    pub connect_retry_delay_ms: u64,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    /// Row lock wait limit per transaction, 0 = no limit (deadlocks are
    /// still detected)
    pub lock_timeout_ms: u64,
    /// Log pool acquire/release and new connections at debug level
    pub debug_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            name: "account_ledger".to_string(),
            max_connections: 10,
            min_connections: 1,
            connect_attempts: 10,
            connect_retry_delay_ms: 1000,
            acquire_timeout_ms: 5000,
            idle_timeout_secs: 600,
            lock_timeout_ms: 0,
            debug_queries: false,
        }
    }
}

impl DatabaseConfig {
    /// Accept `host` given as `host:port` or `[v6addr]:port`, moving the
    /// port into `port`. A bare IPv6 address such as `::1` is left intact.
    fn split_host_port(&mut self) -> anyhow::Result<()> {
        if let Some(rest) = self.host.strip_prefix('[') {
            let (addr, tail) = rest
                .split_once(']')
                .with_context(|| format!("Unclosed '[' in database host '{}'", self.host))?;
            let port = match tail {
                "" => None,
                _ => {
                    let port = tail.strip_prefix(':').unwrap_or(tail);
                    let port = port.parse::<u16>().with_context(|| {
                        format!("Invalid port in database host '{}'", self.host)
                    })?;
                    Some(port)
                }
            };
            self.host = addr.to_string();
            if let Some(port) = port {
                self.port = port;
            }
            return Ok(());
        }

        let Some((host, port)) = self.host.rsplit_once(':') else {
            return Ok(());
        };
        if host.contains(':') {
            return Ok(());
        }
        let port = port
            .parse::<u16>()
            .with_context(|| format!("Invalid port in database host '{}'", self.host))?;
        self.host = host.to_string();
        self.port = port;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TransferConfig {
    pub lock_ordering: LockOrdering,
    /// Decimal places of the currency's minor unit (2 = cents)
    pub currency_decimals: u32,
    pub retry: RetryPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            lock_ordering: LockOrdering::default(),
            currency_decimals: 2,
            retry: RetryPolicy::default(),
        }
    }
}

impl AppConfig {
    /// Load `config/{env}.yaml` and apply environment overrides
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let mut config = Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path))?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> anyhow::Result<Self> {
        let mut config: AppConfig = serde_yaml::from_str(content)?;
        config.database.split_host_port()?;
        Ok(config)
    }

    /// Override file values from environment variables looked up via `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("APP_NAME") {
            self.app.name = v;
        }
        if let Some(v) = lookup("ENV_NAME") {
            self.app.environment = v;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log_level = v;
        }

        let db = &mut self.database;
        if let Some(v) = lookup("DATABASE_URL") {
            db.url = Some(v);
        }
        if let Some(v) = lookup("DB_HOST") {
            db.host = v;
        }
        if let Some(v) = lookup("DB_PORT") {
            db.port = v
                .parse()
                .with_context(|| format!("Invalid DB_PORT '{}'", v))?;
        }
        if let Some(v) = lookup("DB_USER") {
            db.user = v;
        }
        if let Some(v) = lookup("DB_PASSWORD") {
            db.password = v;
        }
        if let Some(v) = lookup("DB_NAME") {
            db.name = v;
        }
        if let Some(v) = lookup("PG_POOL_MAX") {
            db.max_connections = v
                .parse()
                .with_context(|| format!("Invalid PG_POOL_MAX '{}'", v))?;
        }
        db.split_host_port()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let db = &self.database;
        if db.max_connections == 0 {
            bail!("database.max_connections must be at least 1");
        }
        if db.min_connections > db.max_connections {
            bail!(
                "database.min_connections ({}) exceeds max_connections ({})",
                db.min_connections,
                db.max_connections
            );
        }
        if self.transfer.currency_decimals > MAX_DECIMALS {
            bail!(
                "transfer.currency_decimals ({}) exceeds {}",
                self.transfer.currency_decimals,
                MAX_DECIMALS
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const BASE: &str = r#"
log_level: info
log_dir: ./logs
log_file: ledger.log
use_json: false
rotation: daily
"#;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = AppConfig::from_yaml_str(BASE).unwrap();
        assert_eq!(config.app.environment, "dev");
        assert_eq!(config.database.connect_attempts, 10);
        assert_eq!(config.database.min_connections, 1);
        assert_eq!(config.transfer.currency_decimals, 2);
        assert_eq!(config.transfer.lock_ordering, LockOrdering::SourceOnly);
        assert_eq!(config.transfer.retry, RetryPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_sections() {
        let yaml = format!(
            "{BASE}{}",
            r#"
database:
  host: "db.internal:6543"
  user: ledger
  max_connections: 20
  lock_timeout_ms: 250
transfer:
  lock_ordering: canonical
  currency_decimals: 3
  retry:
    max_attempts: 5
"#
        );
        let config = AppConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.port, 6543);
        assert_eq!(config.database.user, "ledger");
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.database.lock_timeout_ms, 250);
        assert_eq!(config.transfer.lock_ordering, LockOrdering::Canonical);
        assert_eq!(config.transfer.currency_decimals, 3);
        assert_eq!(config.transfer.retry.max_attempts, 5);
        assert_eq!(config.transfer.retry.base_delay_ms, 50);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("APP_NAME", "test-app"),
            ("DB_HOST", "localhost"),
            ("DB_PORT", "5433"),
            ("DB_USER", "testuser"),
            ("DB_PASSWORD", "testpass"),
            ("DB_NAME", "testdb"),
            ("PG_POOL_MAX", "4"),
            ("LOG_LEVEL", "debug"),
        ]);
        let mut config = AppConfig::from_yaml_str(BASE).unwrap();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.app.name, "test-app");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.database.host, "localhost");
        assert_eq!(config.database.port, 5433);
        assert_eq!(config.database.user, "testuser");
        assert_eq!(config.database.password, "testpass");
        assert_eq!(config.database.name, "testdb");
        assert_eq!(config.database.max_connections, 4);
        assert!(config.database.url.is_none());
    }

    #[test]
    fn test_env_host_with_port() {
        let mut config = AppConfig::from_yaml_str(BASE).unwrap();
        config
            .apply_env_overrides(|k| (k == "DB_HOST").then(|| "pg:15432".to_string()))
            .unwrap();
        assert_eq!(config.database.host, "pg");
        assert_eq!(config.database.port, 15432);
    }

    #[test]
    fn test_env_host_ipv6() {
        let mut config = AppConfig::from_yaml_str(BASE).unwrap();
        config
            .apply_env_overrides(|k| (k == "DB_HOST").then(|| "::1".to_string()))
            .unwrap();
        assert_eq!(config.database.host, "::1");
        assert_eq!(config.database.port, 5432);

        config
            .apply_env_overrides(|k| (k == "DB_HOST").then(|| "[fe80::2]:6543".to_string()))
            .unwrap();
        assert_eq!(config.database.host, "fe80::2");
        assert_eq!(config.database.port, 6543);

        let err = config
            .apply_env_overrides(|k| (k == "DB_HOST").then(|| "[::1]:x".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("Invalid port"));
    }

    #[test]
    fn test_invalid_env_number_rejected() {
        let mut config = AppConfig::from_yaml_str(BASE).unwrap();
        let err = config
            .apply_env_overrides(|k| (k == "PG_POOL_MAX").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PG_POOL_MAX"));
    }

    #[test]
    fn test_validate_pool_bounds() {
        let mut config = AppConfig::from_yaml_str(BASE).unwrap();
        config.database.min_connections = 5;
        config.database.max_connections = 2;
        assert!(config.validate().is_err());

        config.database.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_currency_decimals() {
        let mut config = AppConfig::from_yaml_str(BASE).unwrap();
        config.transfer.currency_decimals = MAX_DECIMALS + 1;
        assert!(config.validate().is_err());
    }
}
