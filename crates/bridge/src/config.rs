//! Configuration schema for the sensor bridge.
//!
//! Values are normally populated from environment variables by the binary's
//! command line layer; this module only holds the typed settings, their
//! defaults and validation.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;

/// Default MQTT broker port.
pub const DEFAULT_BROKER_PORT: u16 = 1883;
/// Default gateway request timeout.
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);
/// Default identity provider request timeout.
pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(30);
/// Default bound on concurrently relayed messages.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;

/// Root configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub broker: BrokerConfig,
    pub gateway: GatewayConfig,
    pub certificate: CertificateConfig,
    pub identity: IdentityProviderConfig,
    pub dispatcher: DispatcherConfig,
}

/// MQTT broker connection.
#[derive(Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Topic (or filter) carrying sensor readings.
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Wait before reconnecting after a dropped session.
    pub retry_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_BROKER_PORT,
            topic: String::new(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("topic", &self.topic)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("keep_alive", &self.keep_alive)
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}

/// Ingestion gateway endpoint.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub timeout: Duration,
    /// Skip validation of the gateway's server certificate.
    ///
    /// The client still authenticates with its own certificate; only the
    /// server side goes unverified. Intended for self-signed gateways.
    pub insecure_tls: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: DEFAULT_GATEWAY_TIMEOUT,
            insecure_tls: false,
        }
    }
}

/// Client certificate archive (PKCS#12).
#[derive(Clone)]
pub struct CertificateConfig {
    pub archive_path: PathBuf,
    pub passphrase: String,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            archive_path: PathBuf::from("certs/client.p12"),
            passphrase: String::new(),
        }
    }
}

impl fmt::Debug for CertificateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateConfig")
            .field("archive_path", &self.archive_path)
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

/// OAuth2 identity provider (Keycloak).
#[derive(Clone)]
pub struct IdentityProviderConfig {
    /// Base URL, e.g. `https://auth.example.com`.
    pub url: String,
    pub realm: String,
    pub client_id: String,
    pub client_secret: String,
    pub timeout: Duration,
    /// Skip validation of the identity provider's server certificate.
    pub insecure_tls: bool,
}

impl IdentityProviderConfig {
    /// Client-credentials token endpoint for the configured realm.
    pub fn token_url(&self) -> String {
        format!(
            "{}/realms/{}/protocol/openid-connect/token",
            self.url.trim_end_matches('/'),
            self.realm
        )
    }
}

impl Default for IdentityProviderConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            realm: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            timeout: DEFAULT_TOKEN_TIMEOUT,
            insecure_tls: false,
        }
    }
}

impl fmt::Debug for IdentityProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityProviderConfig")
            .field("url", &self.url)
            .field("realm", &self.realm)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("insecure_tls", &self.insecure_tls)
            .finish()
    }
}

/// Message fan-out.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum relays running at once; further messages are dropped.
    pub max_in_flight: usize,
    /// How long shutdown waits for in-flight relays.
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Validate configuration before anything connects.
pub fn validate_config(config: &BridgeConfig) -> Result<(), ConfigError> {
    // Broker
    require("broker host", &config.broker.host)?;
    require("broker topic", &config.broker.topic)?;
    if config.broker.port == 0 {
        return Err(ConfigError::OutOfRange {
            field: "broker port",
            reason: "must be greater than zero".to_string(),
        });
    }
    if !config.broker.keep_alive.is_zero() && config.broker.keep_alive < Duration::from_secs(1) {
        return Err(ConfigError::OutOfRange {
            field: "broker keep-alive",
            reason: "must be zero or at least one second".to_string(),
        });
    }
    if config.broker.password.is_some() && config.broker.username.is_none() {
        return Err(ConfigError::Missing("broker username"));
    }

    // Gateway
    require_http_url("gateway url", &config.gateway.url)?;
    require_timeout("gateway timeout", config.gateway.timeout)?;

    // Certificate
    if config.certificate.archive_path.as_os_str().is_empty() {
        return Err(ConfigError::Missing("certificate archive path"));
    }
    require("certificate passphrase", &config.certificate.passphrase)?;

    // Identity provider
    require_http_url("identity provider url", &config.identity.url)?;
    require("identity provider realm", &config.identity.realm)?;
    require("identity provider client id", &config.identity.client_id)?;
    require("identity provider client secret", &config.identity.client_secret)?;
    require_timeout("identity provider timeout", config.identity.timeout)?;

    // Dispatcher
    if config.dispatcher.max_in_flight == 0 {
        return Err(ConfigError::OutOfRange {
            field: "max in-flight relays",
            reason: "must be greater than zero".to_string(),
        });
    }

    Ok(())
}

fn require(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Missing(field));
    }
    Ok(())
}

fn require_timeout(field: &'static str, timeout: Duration) -> Result<(), ConfigError> {
    if timeout.is_zero() {
        return Err(ConfigError::OutOfRange {
            field,
            reason: "timeout must be greater than zero".to_string(),
        });
    }
    Ok(())
}

fn require_http_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    require(field, value)?;
    let url = url::Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        field,
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(ConfigError::InvalidUrl {
            field,
            reason: format!("unsupported scheme '{}'", scheme),
        }),
    }
}
