//! rumqttc-backed connector and session (impure I/O)

use super::connection::configure_mqtt_options;
use super::event_router::{classify_connection_error, route_mqtt_event};
use crate::transport::{
    BrokerSession, ConnectRequest, Connector, QoS, SessionEvent, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Outgoing, Packet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Grace period for flushing DISCONNECT on shutdown
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Opens TLS sessions through rumqttc
#[derive(Debug, Clone, Copy, Default)]
pub struct RumqttConnector;

#[async_trait]
impl Connector for RumqttConnector {
    async fn connect(
        &self,
        request: ConnectRequest,
    ) -> Result<Box<dyn BrokerSession>, TransportError> {
        let options = configure_mqtt_options(&request);
        let (client, mut event_loop) = AsyncClient::new(options, request.request_capacity);

        debug!(host = %request.host, port = request.port, "Opening MQTT session");

        // Poll until the broker answers the CONNECT
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    info!(
                        session_present = connack.session_present,
                        "MQTT session established"
                    );
                    break;
                }
                Ok(event) => debug!(?event, "Pre-ConnAck event"),
                Err(e) => return Err(classify_connection_error(e)),
            }
        }

        Ok(Box::new(RumqttSession { client, event_loop }))
    }
}

/// One connected rumqttc client and its event loop
pub struct RumqttSession {
    client: AsyncClient,
    event_loop: EventLoop,
}

fn map_client_error(error: ClientError) -> TransportError {
    match error {
        ClientError::TryRequest(_) => TransportError::Backpressure,
        ClientError::Request(_) => TransportError::SessionClosed("request channel closed".to_string()),
    }
}

#[async_trait]
impl BrokerSession for RumqttSession {
    fn publish(&mut self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, qos.into(), false, payload.to_vec())
            .map_err(map_client_error)
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.client
            .try_subscribe(topic, qos.into())
            .map_err(map_client_error)
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client.try_unsubscribe(topic).map_err(map_client_error)
    }

    async fn next_event(&mut self) -> Result<SessionEvent, TransportError> {
        match self.event_loop.poll().await {
            Ok(event) => Ok(route_mqtt_event(event)),
            Err(e) => Err(classify_connection_error(e)),
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!(error = %e, "Failed to queue DISCONNECT");
            return;
        }

        let event_loop = &mut self.event_loop;
        let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;

        if flushed.is_err() {
            debug!("DISCONNECT flush timed out");
        }
    }
}
