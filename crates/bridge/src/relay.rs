//! Authenticated submission of readings to the ingestion gateway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::certificate::{CertificateExtractor, CertificatePair};
use crate::config::GatewayConfig;
use crate::credentials::CredentialStore;
use crate::errors::RelayError;
use crate::payload::Reading;

/// Delivers one reading and returns the gateway's response body.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn relay(&self, reading: &Reading) -> Result<String, RelayError>;
}

/// JSON body accepted by the gateway.
#[derive(Debug, Serialize)]
struct IngestRequest<'a> {
    sensorname: &'a str,
    lectura: f64,
}

/// Relays readings over mutual TLS with a bearer token.
///
/// Every call obtains a token, extracts a fresh client certificate and builds
/// a dedicated HTTPS client around it, so key material never outlives the
/// call. The gateway's body is returned whatever the HTTP status; rejections
/// are logged rather than raised so their diagnostics reach the caller.
pub struct RelayClient {
    gateway_url: String,
    timeout: Duration,
    insecure_tls: bool,
    credentials: Arc<CredentialStore>,
    certificates: CertificateExtractor,
}

impl RelayClient {
    pub fn new(
        config: &GatewayConfig,
        credentials: Arc<CredentialStore>,
        certificates: CertificateExtractor,
    ) -> Self {
        Self {
            gateway_url: config.url.clone(),
            timeout: config.timeout,
            insecure_tls: config.insecure_tls,
            credentials,
            certificates,
        }
    }

    fn https_client(&self, certificate: &CertificatePair) -> Result<reqwest::Client, RelayError> {
        let mut bundle = Zeroizing::new(Vec::with_capacity(
            certificate.private_key_pem().len() + certificate.certificate_pem().len(),
        ));
        bundle.extend_from_slice(certificate.private_key_pem());
        bundle.extend_from_slice(certificate.certificate_pem());

        let identity = reqwest::Identity::from_pem(&bundle).map_err(RelayError::Identity)?;

        reqwest::Client::builder()
            .identity(identity)
            .danger_accept_invalid_certs(self.insecure_tls)
            .timeout(self.timeout)
            .build()
            .map_err(RelayError::Client)
    }

    fn transport_error(&self, error: reqwest::Error) -> RelayError {
        if error.is_timeout() {
            RelayError::Timeout(self.timeout)
        } else {
            RelayError::Transport(error)
        }
    }
}

#[async_trait]
impl Relay for RelayClient {
    async fn relay(&self, reading: &Reading) -> Result<String, RelayError> {
        let token = self.credentials.get_token().await?;

        let client = {
            let certificate = self.certificates.extract().await?;
            self.https_client(&certificate)?
        };

        let body = IngestRequest {
            sensorname: reading.sensor_name(),
            lectura: reading.value(),
        };

        let response = client
            .post(&self.gateway_url)
            .bearer_auth(token.value())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport_error(e))?;

        if status.is_success() {
            debug!(status = %status, sensor = %reading.sensor_name(), "Gateway accepted reading");
        } else {
            warn!(
                status = %status,
                sensor = %reading.sensor_name(),
                "Gateway answered with non-success status"
            );
        }

        Ok(text)
    }
}
