use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tracing::trace;

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./checks.db")
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    /// Address this daemon announces in its heartbeats (format: "host:port")
    pub address: String,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub peers: PeersConfig,

    #[serde(default)]
    pub checks: ChecksConfig,

    /// SMTP settings for email and SMS triggers
    pub email: Option<EmailConfig>,

    #[serde(default)]
    pub pagerduty: PagerDutyConfig,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PeersConfig {
    #[serde(default = "default_heartbeat_interval", with = "human_duration")]
    pub heartbeat_interval: Duration,

    #[serde(default = "default_peer_ttl", with = "human_duration")]
    pub peer_ttl: Duration,
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            peer_ttl: default_peer_ttl(),
        }
    }
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_peer_ttl() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ChecksConfig {
    /// How often check definitions are re-listed and re-partitioned
    #[serde(default = "default_list_fetch_interval", with = "human_duration")]
    pub list_fetch_interval: Duration,

    /// Hosts that have not reported within this window are ignored by host queries
    #[serde(default = "default_hosts_freshness", with = "human_duration")]
    pub hosts_freshness: Duration,

    /// Upper bound for one ping/SSH/HTTP probe
    #[serde(default = "default_probe_timeout", with = "human_duration")]
    pub probe_timeout: Duration,

    /// Retention for violation records when the cluster has none configured
    #[serde(default = "default_retention_days")]
    pub default_retention_days: u32,

    /// Carrier name -> email-to-SMS gateway domain
    #[serde(default = "default_sms_email_gateway")]
    pub sms_email_gateway: HashMap<String, String>,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            list_fetch_interval: default_list_fetch_interval(),
            hosts_freshness: default_hosts_freshness(),
            probe_timeout: default_probe_timeout(),
            default_retention_days: default_retention_days(),
            sms_email_gateway: default_sms_email_gateway(),
        }
    }
}

fn default_list_fetch_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_hosts_freshness() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retention_days() -> u32 {
    1
}

fn default_sms_email_gateway() -> HashMap<String, String> {
    [
        ("att", "txt.att.net"),
        ("alltel", "message.alltel.com"),
        ("sprint", "messaging.sprintpcs.com"),
        ("tmobile", "tmomail.com"),
        ("verizon", "vtext.com"),
        ("virgin", "vmobl.com"),
    ]
    .into_iter()
    .map(|(carrier, gateway)| (carrier.to_string(), gateway.to_string()))
    .collect()
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct EmailConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    #[serde(default)]
    pub subject_prefix: Option<String>,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PagerDutyConfig {
    #[serde(default = "default_pagerduty_events_url")]
    pub events_url: String,
}

impl Default for PagerDutyConfig {
    fn default() -> Self {
        Self {
            events_url: default_pagerduty_events_url(),
        }
    }
}

fn default_pagerduty_events_url() -> String {
    "https://events.pagerduty.com/generic/2010-04-15/create_event.json".to_string()
}

const SMTP_PASSWORD: &str = "FLEET_CHECKS_SMTP_PASSWORD";

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config file {path}"))?;
    let mut config = parse_config(&file_content)?;

    if let (Some(email), Ok(password)) = (config.email.as_mut(), std::env::var(SMTP_PASSWORD)) {
        email.password = Some(password);
    }

    Ok(config)
}

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    serde_json::from_str(content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config: &Config| trace!("loaded config: {config:?}"))
}

/// Human readable durations ("30s", "5m", "1h 30m") in config files.
mod human_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config(r#"{"address": "10.0.0.1:55655"}"#).unwrap();

        assert_eq!(config.address, "10.0.0.1:55655");
        assert_eq!(config.peers.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.peers.peer_ttl, Duration::from_secs(60));
        assert_eq!(config.checks.hosts_freshness, Duration::from_secs(300));
        assert_eq!(config.checks.sms_email_gateway["verizon"], "vtext.com");
        assert!(config.email.is_none());
        assert!(matches!(config.storage, StorageConfig::Sqlite { .. }));
    }

    #[test]
    fn test_durations_and_storage_parse() {
        let config = parse_config(
            r#"{
                "address": "checkd-1:55655",
                "storage": {"backend": "none"},
                "peers": {"heartbeat_interval": "10s", "peer_ttl": "1m"},
                "checks": {"list_fetch_interval": "2m", "probe_timeout": "3s"},
                "email": {"host": "smtp.example.com", "from": "alerts@example.com"}
            }"#,
        )
        .unwrap();

        assert!(matches!(config.storage, StorageConfig::None));
        assert_eq!(config.peers.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.peers.peer_ttl, Duration::from_secs(60));
        assert_eq!(config.checks.list_fetch_interval, Duration::from_secs(120));
        assert_eq!(config.checks.probe_timeout, Duration::from_secs(3));
        assert_eq!(config.email.unwrap().port, 587);
    }

    #[test]
    fn test_invalid_duration_is_rejected() {
        let result = parse_config(r#"{"address": "a:1", "peers": {"peer_ttl": "soon"}}"#);
        assert!(result.is_err());
    }
}
