//! Sensor Bridge Library
//!
//! Relays sensor readings published on an MQTT broker to an HTTPS ingestion
//! gateway. Every reading is posted over mutual TLS, using a client
//! certificate taken from a PKCS#12 archive, and carries an OAuth2 bearer
//! token obtained through the client-credentials grant.
//!
//! - **Payloads**: [`payload::parse`] turns a raw message into a [`Reading`]
//! - **Credentials**: [`CredentialStore`] caches one token per process
//! - **Certificates**: [`CertificateExtractor`] decodes the archive per attempt
//! - **Relay**: [`RelayClient`] posts a reading to the gateway
//! - **Dispatch**: [`MessageDispatcher`] runs each message in its own task
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sensor_bridge::{
//!     CertificateExtractor, CredentialStore, KeycloakTokenProvider, MessageDispatcher, RelayClient,
//! };
//!
//! let provider = KeycloakTokenProvider::new(&config.identity)?;
//! let credentials = Arc::new(CredentialStore::new(Arc::new(provider)));
//! let certificates = CertificateExtractor::new(&config.certificate.archive_path, passphrase);
//! let relay = RelayClient::new(&config.gateway, credentials, certificates);
//! let dispatcher = MessageDispatcher::new(Arc::new(relay), config.dispatcher.max_in_flight);
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod certificate;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod errors;
pub mod mqtt;
pub mod payload;
pub mod relay;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Configuration
pub use config::{
    validate_config, BridgeConfig, BrokerConfig, CertificateConfig, DispatcherConfig,
    GatewayConfig, IdentityProviderConfig,
};

// Errors
pub use errors::{
    CertificateError, ConfigError, CredentialError, MalformedPayload, PipelineError, RelayError,
    TransportError,
};

// Payloads
pub use payload::Reading;

// Credentials
pub use credentials::{CredentialStore, IssuedToken, KeycloakTokenProvider, Token, TokenProvider};

// Certificates
pub use certificate::{CertificateExtractor, CertificatePair};

// Relay
pub use relay::{Relay, RelayClient};

// Dispatch
pub use dispatcher::{process_message, MessageDispatcher};

// Transport
pub use mqtt::run_subscriber;
