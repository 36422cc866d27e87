//! Sensor Bridge - Main entry point
//!
//! Subscribes to an MQTT topic and relays every sensor reading to the
//! ingestion gateway over mutual TLS.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sensor_bridge::certificate;
use sensor_bridge::{
    run_subscriber, validate_config, BridgeConfig, BrokerConfig, CertificateConfig,
    CertificateExtractor, CredentialStore, DispatcherConfig, GatewayConfig,
    IdentityProviderConfig, KeycloakTokenProvider, MessageDispatcher, RelayClient,
};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human readable
    Pretty,
    /// One JSON object per line
    Json,
}

/// Sensor Bridge - relays MQTT sensor readings to an HTTPS ingestion gateway
#[derive(Parser, Debug)]
#[command(name = "sensor-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// MQTT broker host
    #[arg(long, env = "BROKER_HOST", default_value = "localhost")]
    broker_host: String,

    /// MQTT broker port
    #[arg(long, env = "BROKER_PORT", default_value_t = sensor_bridge::config::DEFAULT_BROKER_PORT)]
    broker_port: u16,

    /// Topic carrying sensor readings
    #[arg(long, env = "BROKER_TOPIC")]
    broker_topic: String,

    /// MQTT username
    #[arg(long, env = "BROKER_USERNAME")]
    broker_username: Option<String>,

    /// MQTT password
    #[arg(long, env = "BROKER_PASSWORD", hide_env_values = true)]
    broker_password: Option<String>,

    /// MQTT keep-alive interval in seconds
    #[arg(long, env = "BROKER_KEEP_ALIVE_SECS", default_value_t = 60)]
    broker_keep_alive_secs: u64,

    /// Delay before reconnecting to the broker, in seconds
    #[arg(long, env = "BROKER_RETRY_DELAY_SECS", default_value_t = 5)]
    broker_retry_delay_secs: u64,

    /// Gateway ingestion URL
    #[arg(long, env = "APIGATEWAY_URL")]
    gateway_url: String,

    /// Gateway request timeout in seconds
    #[arg(long, env = "GATEWAY_TIMEOUT_SECS", default_value_t = 10)]
    gateway_timeout_secs: u64,

    /// Skip validation of the gateway's server certificate
    #[arg(long, env = "GATEWAY_INSECURE_TLS")]
    gateway_insecure_tls: bool,

    /// PKCS#12 archive holding the client certificate and key
    #[arg(long, env = "CERT_ARCHIVE_PATH", default_value = "certs/client.p12")]
    cert_archive_path: PathBuf,

    /// Passphrase of the PKCS#12 archive
    #[arg(long, env = "CERT_PASSPHRASE", hide_env_values = true)]
    cert_passphrase: String,

    /// Identity provider base URL
    #[arg(long, env = "KEYCLOAK_URL")]
    keycloak_url: String,

    /// Identity provider realm
    #[arg(long, env = "KEYCLOAK_REALM")]
    keycloak_realm: String,

    /// OAuth2 client id
    #[arg(long, env = "KEYCLOAK_CLIENT")]
    keycloak_client: String,

    /// OAuth2 client secret
    #[arg(long, env = "KEYCLOAK_SECRET", hide_env_values = true)]
    keycloak_secret: String,

    /// Token request timeout in seconds
    #[arg(long, env = "KEYCLOAK_TIMEOUT_SECS", default_value_t = 30)]
    keycloak_timeout_secs: u64,

    /// Skip validation of the identity provider's server certificate
    #[arg(long, env = "KEYCLOAK_INSECURE_TLS")]
    keycloak_insecure_tls: bool,

    /// Maximum relays running at once
    #[arg(long, env = "RELAY_MAX_IN_FLIGHT", default_value_t = sensor_bridge::config::DEFAULT_MAX_IN_FLIGHT)]
    relay_max_in_flight: usize,

    /// Seconds to wait for in-flight relays on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    shutdown_grace_secs: u64,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "pretty")]
    log_format: LogFormat,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    /// Validate configuration and certificate archive, then exit
    #[arg(long = "check")]
    check: bool,
}

impl Cli {
    fn into_config(self) -> BridgeConfig {
        BridgeConfig {
            broker: BrokerConfig {
                host: self.broker_host,
                port: self.broker_port,
                topic: self.broker_topic,
                username: self.broker_username,
                password: self.broker_password,
                keep_alive: Duration::from_secs(self.broker_keep_alive_secs),
                retry_delay: Duration::from_secs(self.broker_retry_delay_secs),
            },
            gateway: GatewayConfig {
                url: self.gateway_url,
                timeout: Duration::from_secs(self.gateway_timeout_secs),
                insecure_tls: self.gateway_insecure_tls,
            },
            certificate: CertificateConfig {
                archive_path: self.cert_archive_path,
                passphrase: self.cert_passphrase,
            },
            identity: IdentityProviderConfig {
                url: self.keycloak_url,
                realm: self.keycloak_realm,
                client_id: self.keycloak_client,
                client_secret: self.keycloak_secret,
                timeout: Duration::from_secs(self.keycloak_timeout_secs),
                insecure_tls: self.keycloak_insecure_tls,
            },
            dispatcher: DispatcherConfig {
                max_in_flight: self.relay_max_in_flight,
                shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            },
        }
    }
}

fn main() -> Result<()> {
    // Values from .env fill in anything the environment does not set
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let check = cli.check;
    let config = cli.into_config();
    validate_config(&config).context("Configuration validation failed")?;

    if check {
        return check_config(&config);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(run_bridge(config))
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    match format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_current_span(true)
            .with_env_filter(filter)
            .init(),
    }
}

/// Verify the certificate archive opens with the configured passphrase
fn check_config(config: &BridgeConfig) -> Result<()> {
    let archive_path = &config.certificate.archive_path;
    info!(archive = %archive_path.display(), "Testing certificate archive");

    certificate::extract(archive_path, &config.certificate.passphrase)
        .context("Failed to extract client certificate")?;

    info!("Configuration test successful:");
    info!("  - broker {}:{} topic '{}'", config.broker.host, config.broker.port, config.broker.topic);
    info!("  - gateway {}", config.gateway.url);
    info!("  - token endpoint {}", config.identity.token_url());

    println!("sensor-bridge: configuration test is successful");
    Ok(())
}

async fn run_bridge(config: BridgeConfig) -> Result<()> {
    if config.gateway.insecure_tls {
        warn!("Gateway server certificate validation is DISABLED");
    }
    if config.identity.insecure_tls {
        warn!("Identity provider server certificate validation is DISABLED");
    }

    let provider = KeycloakTokenProvider::new(&config.identity)
        .context("Failed to create identity provider client")?;
    info!(token_url = %provider.token_url(), "Using identity provider");

    let credentials = Arc::new(CredentialStore::new(Arc::new(provider)));
    let certificates = CertificateExtractor::new(
        config.certificate.archive_path.clone(),
        config.certificate.passphrase.clone(),
    );
    info!(archive = %certificates.archive_path().display(), "Using client certificate archive");
    let relay = RelayClient::new(&config.gateway, credentials, certificates);
    let dispatcher = Arc::new(MessageDispatcher::new(
        Arc::new(relay),
        config.dispatcher.max_in_flight,
    ));

    info!(
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        topic = %config.broker.topic,
        gateway = %config.gateway.url,
        max_in_flight = config.dispatcher.max_in_flight,
        "Starting sensor bridge"
    );

    let shutdown = CancellationToken::new();
    let subscriber = tokio::spawn(run_subscriber(
        config.broker.clone(),
        Arc::clone(&dispatcher),
        shutdown.clone(),
    ));

    shutdown_signal().await;
    shutdown.cancel();

    if let Err(e) = subscriber.await {
        error!(error = %e, "MQTT subscriber task failed");
    }

    let abandoned = dispatcher.shutdown(config.dispatcher.shutdown_grace).await;
    info!(
        abandoned = abandoned,
        dropped = dispatcher.dropped(),
        "Sensor bridge stopped"
    );

    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT"),
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
