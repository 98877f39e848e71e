//! Pure mapping from rumqttc events to session events

use crate::transport::{AckOutcome, InboundMessage, RequestKind, SessionEvent, TransportError};
use rumqttc::{ConnectionError, Event, Outgoing, Packet, SubscribeReasonCode};
use tracing::debug;

/// Route a polled rumqttc event (pure routing decision)
pub fn route_mqtt_event(event: Event) -> SessionEvent {
    match event {
        Event::Incoming(packet) => route_incoming(packet),
        Event::Outgoing(outgoing) => route_outgoing(outgoing),
    }
}

fn route_incoming(packet: Packet) -> SessionEvent {
    match packet {
        Packet::Publish(publish) => SessionEvent::Message(InboundMessage {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos.into(),
            retain: publish.retain,
        }),
        Packet::PubAck(ack) => accepted(RequestKind::Publish, ack.pkid),
        Packet::PubComp(comp) => accepted(RequestKind::Publish, comp.pkid),
        Packet::SubAck(suback) => SessionEvent::Acknowledged {
            kind: RequestKind::Subscribe,
            packet_id: suback.pkid,
            outcome: validate_subscription_success(&suback.return_codes),
        },
        Packet::UnsubAck(unsuback) => accepted(RequestKind::Unsubscribe, unsuback.pkid),
        Packet::Disconnect => SessionEvent::Disconnected("broker sent DISCONNECT".to_string()),
        other => {
            debug!(packet = ?other, "Infrastructure packet");
            SessionEvent::Idle
        }
    }
}

fn route_outgoing(outgoing: Outgoing) -> SessionEvent {
    match outgoing {
        Outgoing::Publish(pkid) => SessionEvent::Sent {
            kind: RequestKind::Publish,
            packet_id: pkid,
        },
        Outgoing::Subscribe(pkid) => SessionEvent::Sent {
            kind: RequestKind::Subscribe,
            packet_id: pkid,
        },
        Outgoing::Unsubscribe(pkid) => SessionEvent::Sent {
            kind: RequestKind::Unsubscribe,
            packet_id: pkid,
        },
        _ => SessionEvent::Idle,
    }
}

fn accepted(kind: RequestKind, packet_id: u16) -> SessionEvent {
    SessionEvent::Acknowledged {
        kind,
        packet_id,
        outcome: AckOutcome::Accepted,
    }
}

/// Validate SubAck return codes; any failure rejects the subscription
pub fn validate_subscription_success(return_codes: &[SubscribeReasonCode]) -> AckOutcome {
    if return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
    {
        AckOutcome::Rejected(format!("broker returned {return_codes:?}"))
    } else {
        AckOutcome::Accepted
    }
}

/// Classify an event loop failure
pub fn classify_connection_error(error: ConnectionError) -> TransportError {
    match error {
        ConnectionError::ConnectionRefused(code) => TransportError::Rejected {
            code: format!("{code:?}"),
        },
        ConnectionError::Tls(e) => TransportError::Tls(e.to_string()),
        ConnectionError::Io(e) => TransportError::Io(e),
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                error.to_string(),
            ))
        }
        ConnectionError::RequestsDone => TransportError::SessionClosed(error.to_string()),
        other => TransportError::Protocol(other.to_string()),
    }
}
