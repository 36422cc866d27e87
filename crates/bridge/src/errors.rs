//! Error types for the sensor bridge.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A message body that does not follow the reading grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedPayload {
    /// Payload is not valid UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Fewer comma-separated fields than a reading needs.
    #[error("expected at least {expected} comma-separated fields, found {found}")]
    MissingField { expected: usize, found: usize },

    /// A field without a `key:value` separator.
    #[error("field has no ':' separator: {0:?}")]
    MissingSeparator(String),

    /// The sensor name is not enclosed in double quotes.
    #[error("sensor name is not quoted: {0:?}")]
    UnquotedSensorName(String),

    /// The sensor name is an empty quoted string.
    #[error("sensor name is empty")]
    EmptySensorName,

    /// The value cannot be read as a number.
    #[error("value is not a number: {0:?}")]
    InvalidValue(String),

    /// The value parsed to infinity or NaN.
    #[error("value is not finite: {0:?}")]
    NonFiniteValue(String),
}

/// Errors obtaining a bearer token from the identity provider.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The token request could not be sent or its response not read.
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The identity provider answered with a non-success status.
    #[error("identity provider rejected token request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The response body is not a usable token response.
    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    /// The issued token expires before the safety margin allows any use.
    #[error("token lifetime of {expires_in:?} is shorter than the {margin:?} expiry margin")]
    LifetimeTooShort { expires_in: Duration, margin: Duration },

    /// A refresh started by another caller while this one was waiting failed.
    #[error("concurrent token refresh failed: {0}")]
    ConcurrentRefreshFailed(String),
}

/// Errors extracting the client certificate from its archive.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// Archive file does not exist.
    #[error("certificate archive not found: {0}")]
    NotFound(PathBuf),

    /// Archive file exists but could not be read.
    #[error("failed to read certificate archive {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Archive is corrupt or the passphrase was rejected.
    #[error("failed to decode certificate archive {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    /// Archive holds no private key entry.
    #[error("certificate archive {0} contains no private key")]
    MissingPrivateKey(PathBuf),

    /// Private key entry has no certificate attached.
    #[error("certificate archive {0} contains no certificate for its private key")]
    MissingCertificate(PathBuf),

    /// The blocking extraction task did not complete.
    #[error("certificate extraction task failed: {0}")]
    Task(String),
}

/// Errors relaying a reading to the gateway.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No usable bearer token.
    #[error("credential acquisition failed: {0}")]
    Credential(#[from] CredentialError),

    /// Client certificate unavailable.
    #[error("client certificate unavailable: {0}")]
    Certificate(#[from] CertificateError),

    /// Extracted material was not accepted as a TLS client identity.
    #[error("invalid client identity: {0}")]
    Identity(#[source] reqwest::Error),

    /// HTTPS client could not be built.
    #[error("failed to build HTTPS client: {0}")]
    Client(#[source] reqwest::Error),

    /// Gateway did not answer within the request timeout.
    #[error("gateway request timed out after {0:?}")]
    Timeout(Duration),

    /// Network or protocol failure talking to the gateway.
    #[error("gateway request failed: {0}")]
    Transport(#[source] reqwest::Error),
}

/// Failure of one message's parse-and-relay pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Payload(#[from] MalformedPayload),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Invalid bridge configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting is empty.
    #[error("{0} must not be empty")]
    Missing(&'static str),

    /// A setting that must be an http(s) URL is not one.
    #[error("{field} is not a valid http(s) URL: {reason}")]
    InvalidUrl { field: &'static str, reason: String },

    /// A setting holds a value outside its allowed range.
    #[error("{field}: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

/// Errors from the MQTT transport session.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Subscribe request could not be queued.
    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },

    /// Connection to the broker failed or dropped.
    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
}
