//! Application configuration loaded from environment variables.
//!
//! Required:
//! - `REGION`: deployment region, reported in logs
//! - `SAGA_ORCHESTRATOR_GROUP`: consumer group of the orchestrator
//! - `INVENTORY_SERVICE_GROUP`, `PAYMENT_SERVICE_GROUP`, `NOTIFICATION_SERVICE_GROUP`:
//!   consumer groups of the participant services
//! - `ORDERS_TOPIC`, `ORDERS_DLQ_TOPIC`
//! - `INVENTORY_COMMANDS_TOPIC`, `PAYMENT_COMMANDS_TOPIC`, `NOTIFICATION_COMMANDS_TOPIC`
//! - `INVENTORY_REPLIES_TOPIC`, `PAYMENT_REPLIES_TOPIC`, `NOTIFICATION_REPLIES_TOPIC`
//! - `DATABASE_URL`, unless `STORE_BACKEND=memory`
//!
//! Optional:
//! - `HOST` (default `0.0.0.0`), `PORT` (default `3000`)
//! - `RUST_LOG` tracing filter (default `info`)
//! - `STORE_BACKEND`: `postgres` (default) or `memory`
//! - `KAFKA_BROKERS`: comma-separated broker addresses, reported at start-up
//! - `BROKER_PARTITIONS` (default `3`)
//! - `MAX_RECORD_RETRIES` (default `10`; `0` also selects the default)
//! - `MAX_REQ_RETRIES`: commit request retries (default `10`; `0` also selects the default)
//! - `PUBLISH_BACKOFF_MS` (default `100`), `PUBLISH_MAX_BACKOFF_MS` (default `5000`)
//! - `RECONCILE_INTERVAL_SECS` (default `30`), `RECONCILE_TIMEOUT_SECS` (default `60`)
//! - `RECONCILE_BATCH_SIZE` (default `100`)
//! - `SHUTDOWN_GRACE_SECS` (default `5`)

use std::str::FromStr;
use std::time::Duration;

use messaging::{Acks, PublishPolicy};
use saga::{ReconcilerConfig, Service, Topics};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

const DEFAULT_MAX_RECORD_RETRIES: u32 = 10;
const DEFAULT_MAX_REQUEST_RETRIES: u32 = 10;

/// A configuration value that is missing or malformed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Where saga state is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres { url: String },
    Memory,
}

/// Consumer groups of the participant services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceGroups {
    pub inventory: String,
    pub payment: String,
    pub notification: String,
}

impl ServiceGroups {
    pub fn for_service(&self, service: Service) -> &str {
        match service {
            Service::Inventory => &self.inventory,
            Service::Payment => &self.payment,
            Service::Notification => &self.notification,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub region: String,
    pub orchestrator_group: String,
    pub service_groups: ServiceGroups,
    pub topics: Topics,
    pub store: StoreBackend,
    pub brokers: Vec<String>,
    pub broker_partitions: u32,
    pub max_record_retries: u32,
    pub max_request_retries: u32,
    pub publish_backoff: Duration,
    pub publish_max_backoff: Duration,
    pub reconcile_interval: Duration,
    pub reconcile_timeout: Duration,
    pub reconcile_batch_size: usize,
    pub shutdown_grace: Duration,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let store = match get("STORE_BACKEND").as_deref() {
            None | Some("postgres") => StoreBackend::Postgres {
                url: required("DATABASE_URL")?,
            },
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "STORE_BACKEND",
                    value: other.to_string(),
                    reason: "expected postgres or memory".to_string(),
                });
            }
        };

        let topics = Topics {
            orders: required("ORDERS_TOPIC")?,
            inventory_commands: required("INVENTORY_COMMANDS_TOPIC")?,
            payment_commands: required("PAYMENT_COMMANDS_TOPIC")?,
            notification_commands: required("NOTIFICATION_COMMANDS_TOPIC")?,
            inventory_replies: required("INVENTORY_REPLIES_TOPIC")?,
            payment_replies: required("PAYMENT_REPLIES_TOPIC")?,
            notification_replies: required("NOTIFICATION_REPLIES_TOPIC")?,
            dead_letter: required("ORDERS_DLQ_TOPIC")?,
        };

        let broker_partitions: u32 = parse(&get, "BROKER_PARTITIONS", 3)?;
        if broker_partitions == 0 {
            return Err(ConfigError::Invalid {
                key: "BROKER_PARTITIONS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let max_record_retries =
            match parse(&get, "MAX_RECORD_RETRIES", DEFAULT_MAX_RECORD_RETRIES)? {
                0 => DEFAULT_MAX_RECORD_RETRIES,
                n => n,
            };

        let max_request_retries =
            match parse(&get, "MAX_REQ_RETRIES", DEFAULT_MAX_REQUEST_RETRIES)? {
                0 => DEFAULT_MAX_REQUEST_RETRIES,
                n => n,
            };

        let service_groups = ServiceGroups {
            inventory: required("INVENTORY_SERVICE_GROUP")?,
            payment: required("PAYMENT_SERVICE_GROUP")?,
            notification: required("NOTIFICATION_SERVICE_GROUP")?,
        };

        let brokers: Vec<String> = get("KAFKA_BROKERS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|b| !b.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse(&get, "PORT", 3000)?,
            log_level: get("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            region: required("REGION")?,
            orchestrator_group: required("SAGA_ORCHESTRATOR_GROUP")?,
            service_groups,
            topics,
            store,
            brokers,
            broker_partitions,
            max_record_retries,
            max_request_retries,
            publish_backoff: Duration::from_millis(parse(&get, "PUBLISH_BACKOFF_MS", 100)?),
            publish_max_backoff: Duration::from_millis(parse(
                &get,
                "PUBLISH_MAX_BACKOFF_MS",
                5000,
            )?),
            reconcile_interval: Duration::from_secs(parse(&get, "RECONCILE_INTERVAL_SECS", 30)?),
            reconcile_timeout: Duration::from_secs(parse(&get, "RECONCILE_TIMEOUT_SECS", 60)?),
            reconcile_batch_size: parse(&get, "RECONCILE_BATCH_SIZE", 100)?,
            shutdown_grace: Duration::from_secs(parse(&get, "SHUTDOWN_GRACE_SECS", 5)?),
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Tracing filter for the configured log level. An unparsable level
    /// falls back to `info`.
    pub fn log_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    }

    pub fn publish_policy(&self) -> PublishPolicy {
        PublishPolicy {
            max_retries: self.max_record_retries,
            initial_backoff: self.publish_backoff,
            max_backoff: self.publish_max_backoff,
            acks: Acks::All,
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: self.reconcile_interval,
            stall_timeout: self.reconcile_timeout,
            batch_size: self.reconcile_batch_size,
        }
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(parsed),
            Err(e) => Err(ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tracing_subscriber::filter::LevelFilter;

    fn base() -> HashMap<&'static str, String> {
        [
            ("REGION", "eu-west-1"),
            ("SAGA_ORCHESTRATOR_GROUP", "saga-orchestrator"),
            ("INVENTORY_SERVICE_GROUP", "inventory-service"),
            ("PAYMENT_SERVICE_GROUP", "payment-service"),
            ("NOTIFICATION_SERVICE_GROUP", "notification-service"),
            ("ORDERS_TOPIC", "orders"),
            ("INVENTORY_COMMANDS_TOPIC", "inventory-commands"),
            ("PAYMENT_COMMANDS_TOPIC", "payment-commands"),
            ("NOTIFICATION_COMMANDS_TOPIC", "notification-commands"),
            ("INVENTORY_REPLIES_TOPIC", "inventory-replies"),
            ("PAYMENT_REPLIES_TOPIC", "payment-replies"),
            ("NOTIFICATION_REPLIES_TOPIC", "notification-replies"),
            ("ORDERS_DLQ_TOPIC", "orders-dlq"),
            ("DATABASE_URL", "postgres://saga@localhost/saga"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect()
    }

    fn load(vars: &HashMap<&'static str, String>) -> Result<Config, ConfigError> {
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = load(&base()).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.topics, Topics::default());
        assert_eq!(
            config.store,
            StoreBackend::Postgres {
                url: "postgres://saga@localhost/saga".into()
            }
        );
        assert_eq!(config.broker_partitions, 3);
        assert_eq!(config.max_record_retries, 10);
        assert_eq!(config.max_request_retries, 10);
        assert!(config.brokers.is_empty());
        assert_eq!(config.service_groups.for_service(Service::Payment), "payment-service");
        assert_eq!(config.reconciler_config().stall_timeout, Duration::from_secs(60));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_addr_formatting() {
        let mut vars = base();
        vars.insert("HOST", "127.0.0.1".into());
        vars.insert("PORT", "8080".into());
        assert_eq!(load(&vars).unwrap().addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_missing_required_value() {
        let mut vars = base();
        vars.remove("PAYMENT_REPLIES_TOPIC");
        assert_eq!(
            load(&vars).unwrap_err(),
            ConfigError::Missing("PAYMENT_REPLIES_TOPIC")
        );

        let mut vars = base();
        vars.insert("REGION", "  ".into());
        assert_eq!(load(&vars).unwrap_err(), ConfigError::Missing("REGION"));
    }

    #[test]
    fn test_memory_backend_needs_no_database() {
        let mut vars = base();
        vars.remove("DATABASE_URL");
        assert_eq!(
            load(&vars).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );

        vars.insert("STORE_BACKEND", "memory".into());
        assert_eq!(load(&vars).unwrap().store, StoreBackend::Memory);

        vars.insert("STORE_BACKEND", "redis".into());
        assert!(matches!(
            load(&vars).unwrap_err(),
            ConfigError::Invalid {
                key: "STORE_BACKEND",
                ..
            }
        ));
    }

    #[test]
    fn test_unparsable_number() {
        let mut vars = base();
        vars.insert("PORT", "eighty".into());
        assert!(matches!(
            load(&vars).unwrap_err(),
            ConfigError::Invalid { key: "PORT", .. }
        ));

        let mut vars = base();
        vars.insert("BROKER_PARTITIONS", "0".into());
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_service_groups_are_required() {
        let mut vars = base();
        vars.remove("NOTIFICATION_SERVICE_GROUP");
        assert_eq!(
            load(&vars).unwrap_err(),
            ConfigError::Missing("NOTIFICATION_SERVICE_GROUP")
        );

        let mut vars = base();
        vars.insert("INVENTORY_SERVICE_GROUP", "stock-eu".into());
        let config = load(&vars).unwrap();
        assert_eq!(config.service_groups.for_service(Service::Inventory), "stock-eu");
    }

    #[test]
    fn test_broker_list_is_split_and_trimmed() {
        let mut vars = base();
        vars.insert("KAFKA_BROKERS", "kafka-1:9092, kafka-2:9092,,".into());
        assert_eq!(
            load(&vars).unwrap().brokers,
            vec!["kafka-1:9092".to_string(), "kafka-2:9092".to_string()]
        );
    }

    #[test]
    fn test_log_filter_uses_configured_level() {
        let mut vars = base();
        vars.insert("RUST_LOG", "saga=debug,warn".into());
        let config = load(&vars).unwrap();
        assert_eq!(config.log_filter().max_level_hint(), Some(LevelFilter::DEBUG));

        vars.insert("RUST_LOG", "saga=loud[".into());
        let config = load(&vars).unwrap();
        assert_eq!(config.log_filter().max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn test_zero_retries_means_default() {
        let mut vars = base();
        vars.insert("MAX_RECORD_RETRIES", "0".into());
        assert_eq!(load(&vars).unwrap().max_record_retries, 10);

        vars.insert("MAX_RECORD_RETRIES", "4".into());
        let config = load(&vars).unwrap();
        assert_eq!(config.publish_policy().max_retries, 4);

        vars.insert("MAX_REQ_RETRIES", "0".into());
        assert_eq!(load(&vars).unwrap().max_request_retries, 10);
        vars.insert("MAX_REQ_RETRIES", "3".into());
        assert_eq!(load(&vars).unwrap().max_request_retries, 3);
    }
}
