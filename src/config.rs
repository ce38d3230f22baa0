//! Server configuration, read from `APPOINTD_*` environment variables.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use thiserror::Error;

use crate::engine::{CompletionPolicy, EngineConfig};
use crate::model::HOUR;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("APPOINTD_TENANT_PASSWORDS: expected tenant=password pairs, got {0:?}")]
    TenantPasswords(String),
    #[error("both APPOINTD_TLS_CERT and APPOINTD_TLS_KEY must be set, or neither")]
    PartialTls,
    #[error("TLS setup: {0}")]
    Tls(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Password for tenants without their own entry.
    pub password: String,
    pub tenant_passwords: HashMap<String, String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub sweep_interval: Duration,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let auto_complete_after = parse_opt::<u64>(&lookup, "APPOINTD_AUTO_COMPLETE_AFTER_HOURS")?
            .map(|hours| {
                i64::try_from(hours)
                    .ok()
                    .and_then(|h| h.checked_mul(HOUR))
                    .ok_or(ConfigError::Invalid {
                        var: "APPOINTD_AUTO_COMPLETE_AFTER_HOURS",
                        value: hours.to_string(),
                    })
            })
            .transpose()?;
        let tls_cert = lookup("APPOINTD_TLS_CERT").map(PathBuf::from);
        let tls_key = lookup("APPOINTD_TLS_KEY").map(PathBuf::from);
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        Ok(Self {
            port: parse_opt(&lookup, "APPOINTD_PORT")?.unwrap_or(5433),
            bind: lookup("APPOINTD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("APPOINTD_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: lookup("APPOINTD_PASSWORD").unwrap_or_else(|| "appointd".into()),
            tenant_passwords: lookup("APPOINTD_TENANT_PASSWORDS")
                .map(|raw| parse_tenant_passwords(&raw))
                .transpose()?
                .unwrap_or_default(),
            max_connections: parse_opt(&lookup, "APPOINTD_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parse_opt(&lookup, "APPOINTD_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: parse_opt(&lookup, "APPOINTD_METRICS_PORT")?,
            tls_cert,
            tls_key,
            sweep_interval: Duration::from_secs(
                parse_opt(&lookup, "APPOINTD_SWEEP_INTERVAL_SECS")?.unwrap_or(60),
            ),
            engine: EngineConfig {
                lock_timeout: Duration::from_millis(
                    parse_opt(&lookup, "APPOINTD_LOCK_TIMEOUT_MS")?.unwrap_or(5000),
                ),
                completion: CompletionPolicy {
                    auto_complete_after,
                },
            },
        })
    }

    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ConfigError> {
        let (Some(cert_path), Some(key_path)) = (&self.tls_cert, &self.tls_key) else {
            return Ok(None);
        };
        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];
        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

fn parse_opt<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(var)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { var, value })
        })
        .transpose()
}

/// `tenant_a=secret,tenant_b=other`.
fn parse_tenant_passwords(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((tenant, password)) if !tenant.trim().is_empty() => {
                Ok((tenant.trim().to_string(), password.to_string()))
            }
            _ => Err(ConfigError::TenantPasswords(pair.to_string())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.port, 5433);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.password, "appointd");
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.engine.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.engine.completion.auto_complete_after, None);
        assert!(config.metrics_port.is_none());
        assert!(config.tls_acceptor().unwrap().is_none());
    }

    #[test]
    fn overrides() {
        let config = from_pairs(&[
            ("APPOINTD_PORT", "6543"),
            ("APPOINTD_AUTO_COMPLETE_AFTER_HOURS", "72"),
            ("APPOINTD_LOCK_TIMEOUT_MS", "250"),
            ("APPOINTD_TENANT_PASSWORDS", "salon=one, spa=two=three"),
        ])
        .unwrap();
        assert_eq!(config.port, 6543);
        assert_eq!(config.engine.completion.auto_complete_after, Some(72 * HOUR));
        assert_eq!(config.engine.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.tenant_passwords.get("salon").map(String::as_str), Some("one"));
        assert_eq!(config.tenant_passwords.get("spa").map(String::as_str), Some("two=three"));
    }

    #[test]
    fn bad_values_are_reported() {
        let err = from_pairs(&[("APPOINTD_PORT", "http")]).unwrap_err();
        assert!(err.to_string().contains("APPOINTD_PORT"));
        assert!(matches!(
            from_pairs(&[("APPOINTD_TENANT_PASSWORDS", "nopassword")]),
            Err(ConfigError::TenantPasswords(_))
        ));
        assert!(matches!(
            from_pairs(&[("APPOINTD_TLS_CERT", "cert.pem")]),
            Err(ConfigError::PartialTls)
        ));
    }

    #[test]
    fn auto_complete_hours_that_overflow_are_rejected() {
        let huge = u64::MAX.to_string();
        assert!(matches!(
            from_pairs(&[("APPOINTD_AUTO_COMPLETE_AFTER_HOURS", huge.as_str())]),
            Err(ConfigError::Invalid { var: "APPOINTD_AUTO_COMPLETE_AFTER_HOURS", .. })
        ));
        let config = from_pairs(&[("APPOINTD_AUTO_COMPLETE_AFTER_HOURS", "48")]).unwrap();
        assert_eq!(config.engine.completion.auto_complete_after, Some(48 * HOUR));
    }

    #[test]
    fn missing_tls_files_fail() {
        let config = from_pairs(&[
            ("APPOINTD_TLS_CERT", "/nonexistent/cert.pem"),
            ("APPOINTD_TLS_KEY", "/nonexistent/key.pem"),
        ])
        .unwrap();
        assert!(matches!(config.tls_acceptor(), Err(ConfigError::Tls(_))));
    }
}
