//! Pure option building for rumqttc sessions

use crate::transport::ConnectRequest;
use rumqttc::{MqttOptions, TlsConfiguration, Transport};

/// Largest packet accepted or sent, in bytes
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Translate a connect request into rumqttc options
///
/// Sessions are always clean: subscriptions are replayed by the manager, never
/// resumed by the broker.
pub fn configure_mqtt_options(request: &ConnectRequest) -> MqttOptions {
    let mut options = MqttOptions::new(&request.client_id, &request.host, request.port);

    options.set_credentials(&request.username, &request.password);
    options.set_keep_alive(request.keep_alive);
    options.set_clean_session(true);
    options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
        request.tls.client_config(),
    )));

    options
}
