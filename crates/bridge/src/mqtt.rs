//! MQTT subscription feeding the dispatcher.

use std::sync::Arc;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::BrokerConfig;
use crate::dispatcher::MessageDispatcher;
use crate::errors::TransportError;

/// Capacity of the request channel between client and event loop.
const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// Build connection options with a unique client id.
pub fn mqtt_options(config: &BrokerConfig) -> MqttOptions {
    let client_id = format!("sensor-bridge-{}", uuid::Uuid::new_v4());
    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(true);

    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }

    options
}

/// Subscribe to the configured topic and dispatch every message until
/// `shutdown` is cancelled, reconnecting after connection errors.
#[instrument(
    name = "mqtt_subscriber",
    skip_all,
    fields(host = %config.host, port = config.port, topic = %config.topic)
)]
pub async fn run_subscriber(
    config: BrokerConfig,
    dispatcher: Arc<MessageDispatcher>,
    shutdown: CancellationToken,
) {
    info!("Starting MQTT subscriber");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match run_session(&config, &dispatcher, &shutdown).await {
            Ok(()) => break,
            Err(e) => {
                error!(error = %e, "MQTT session ended");
                warn!(
                    retry_in_secs = config.retry_delay.as_secs_f64(),
                    "Reconnecting to broker"
                );

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.retry_delay) => {}
                }
            }
        }
    }

    info!("MQTT subscriber stopped");
}

/// One connection: subscribe, then poll until cancelled or the connection fails.
async fn run_session(
    config: &BrokerConfig,
    dispatcher: &MessageDispatcher,
    shutdown: &CancellationToken,
) -> Result<(), TransportError> {
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CHANNEL_CAPACITY);

    client
        .subscribe(config.topic.as_str(), QoS::AtLeastOnce)
        .await
        .map_err(|source| TransportError::Subscribe {
            topic: config.topic.clone(),
            source,
        })?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Shutdown requested, disconnecting from broker");
                let _ = client.disconnect().await;
                return Ok(());
            }
            event = eventloop.poll() => {
                match event? {
                    Event::Incoming(Packet::Publish(publish)) => {
                        dispatcher.on_message(&publish.topic, publish.payload);
                    }
                    Event::Incoming(Packet::ConnAck(_)) => {
                        info!("Connected to MQTT broker");
                    }
                    Event::Incoming(Packet::SubAck(_)) => {
                        info!(topic = %config.topic, "Subscribed to topic");
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_mqtt_options_from_config() {
        let config = BrokerConfig {
            host: "broker.local".to_string(),
            port: 8883,
            topic: "sensors/#".to_string(),
            keep_alive: Duration::from_secs(45),
            ..Default::default()
        };
        let options = mqtt_options(&config);

        assert_eq!(options.broker_address(), ("broker.local".to_string(), 8883));
        assert_eq!(options.keep_alive(), Duration::from_secs(45));
        assert!(options.clean_session());
        assert!(options.client_id().starts_with("sensor-bridge-"));
        assert!(options.credentials().is_none());
    }

    #[test]
    fn test_client_ids_are_unique() {
        let config = BrokerConfig::default();
        assert_ne!(
            mqtt_options(&config).client_id(),
            mqtt_options(&config).client_id()
        );
    }

    #[test]
    fn test_credentials_applied() {
        let config = BrokerConfig {
            username: Some("bridge".to_string()),
            password: Some("pw".to_string()),
            ..Default::default()
        };
        assert_eq!(
            mqtt_options(&config).credentials(),
            Some(("bridge".to_string(), "pw".to_string()))
        );
    }

    #[tokio::test]
    async fn test_subscriber_exits_when_cancelled() {
        struct NeverRelay;

        #[async_trait::async_trait]
        impl crate::relay::Relay for NeverRelay {
            async fn relay(
                &self,
                _reading: &crate::payload::Reading,
            ) -> Result<String, crate::errors::RelayError> {
                unreachable!("no broker, no messages")
            }
        }

        let config = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            topic: "sensors".to_string(),
            retry_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let dispatcher = Arc::new(MessageDispatcher::new(Arc::new(NeverRelay), 1));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_subscriber(config, dispatcher, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("subscriber did not stop")
            .unwrap();
    }
}
