//! Mock implementations for testing
//!
//! [`MockBroker`] is an in-memory broker behind the [`Connector`] seam. Tests
//! script its behavior (refused connects, withheld acknowledgments, rejected
//! subscriptions, dropped sessions) and inspect what the manager sent.

use crate::clock::Clock;
use crate::topics::topic_matches;
use crate::transport::{
    AckOutcome, BrokerSession, ConnectRequest, Connector, InboundMessage, QoS, RequestKind,
    SessionEvent, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

type EventSender = mpsc::UnboundedSender<Result<SessionEvent, TransportError>>;

/// A publish the broker received
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    /// Index of the session it arrived on
    pub session: usize,
}

struct SessionSlot {
    events: Option<EventSender>,
    subscriptions: Vec<(String, QoS)>,
    subscribe_log: Vec<String>,
    next_packet_id: u16,
}

impl SessionSlot {
    fn is_alive(&self) -> bool {
        self.events.is_some()
    }

    fn send(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(Ok(event));
        }
    }

    fn next_packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        self.next_packet_id
    }
}

struct BrokerState {
    connect_requests: Vec<ConnectRequest>,
    failing_connects: usize,
    refuse_credentials: bool,
    hang_connects: bool,
    sessions: Vec<SessionSlot>,
    auto_ack_publishes: bool,
    withheld_publish_acks: Vec<(usize, u16)>,
    withhold_subacks: bool,
    delay_sent: bool,
    held_events: Vec<(usize, SessionEvent)>,
    rejected_topics: HashSet<String>,
    published: Vec<PublishedMessage>,
    graceful_disconnects: usize,
}

impl BrokerState {
    /// Send request events to session `index`, or hold them while `Sent` is delayed
    fn emit(&mut self, index: usize, events: Vec<SessionEvent>) {
        if self.delay_sent {
            self.held_events
                .extend(events.into_iter().map(|event| (index, event)));
            return;
        }
        if let Some(slot) = self.sessions.get(index) {
            for event in events {
                slot.send(event);
            }
        }
    }
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            connect_requests: Vec::new(),
            failing_connects: 0,
            refuse_credentials: false,
            hang_connects: false,
            sessions: Vec::new(),
            auto_ack_publishes: true,
            withheld_publish_acks: Vec::new(),
            withhold_subacks: false,
            delay_sent: false,
            held_events: Vec::new(),
            rejected_topics: HashSet::new(),
            published: Vec::new(),
            graceful_disconnects: 0,
        }
    }
}

/// In-memory broker shared by a connector and the test driving it
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            broker: self.clone(),
        })
    }

    /// Refuse the next `count` connection attempts as unavailable
    pub fn fail_next_connects(&self, count: usize) {
        self.state().failing_connects = count;
    }

    /// Refuse every connection attempt as not authorized until reset
    pub fn refuse_credentials(&self, refuse: bool) {
        self.state().refuse_credentials = refuse;
    }

    /// Never answer connection attempts
    pub fn hang_connects(&self, hang: bool) {
        self.state().hang_connects = hang;
    }

    /// Acknowledge QoS 1+ publishes immediately (default) or hold them
    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.state().auto_ack_publishes = auto_ack;
    }

    /// Acknowledge every held publish still on a live session; returns how many
    pub fn ack_pending_publishes(&self) -> usize {
        let mut state = self.state();
        let held: Vec<_> = state.withheld_publish_acks.drain(..).collect();
        let mut acked = 0;
        for (session, packet_id) in held {
            if let Some(slot) = state.sessions.get(session).filter(|slot| slot.is_alive()) {
                slot.send(SessionEvent::Acknowledged {
                    kind: RequestKind::Publish,
                    packet_id,
                    outcome: AckOutcome::Accepted,
                });
                acked += 1;
            }
        }
        acked
    }

    /// Acknowledge one held publish by packet id; false if it is not held
    pub fn ack_publish(&self, packet_id: u16) -> bool {
        let mut state = self.state();
        let Some(position) = state
            .withheld_publish_acks
            .iter()
            .position(|(_, held)| *held == packet_id)
        else {
            return false;
        };
        let (session, _) = state.withheld_publish_acks.remove(position);
        match state.sessions.get(session).filter(|slot| slot.is_alive()) {
            Some(slot) => {
                slot.send(SessionEvent::Acknowledged {
                    kind: RequestKind::Publish,
                    packet_id,
                    outcome: AckOutcome::Accepted,
                });
                true
            }
            None => false,
        }
    }

    /// Hold `Sent` events and the acknowledgments that follow them, as a
    /// transport does while its write queue is backed up
    pub fn delay_sent(&self, delay: bool) {
        self.state().delay_sent = delay;
    }

    /// Release every held event, in order, to sessions still alive; returns how many
    pub fn flush_sent(&self) -> usize {
        let mut state = self.state();
        let held: Vec<_> = state.held_events.drain(..).collect();
        let mut released = 0;
        for (session, event) in held {
            if let Some(slot) = state.sessions.get(session).filter(|slot| slot.is_alive()) {
                slot.send(event);
                released += 1;
            }
        }
        released
    }

    /// Never answer SUBSCRIBE packets
    pub fn withhold_subacks(&self, withhold: bool) {
        self.state().withhold_subacks = withhold;
    }

    /// Answer SUBSCRIBE for `topic` with a failure return code
    pub fn reject_subscription(&self, topic: &str) {
        self.state().rejected_topics.insert(topic.to_string());
    }

    /// Drop every live session as if the network failed
    pub fn drop_session(&self, reason: &str) {
        let mut state = self.state();
        for slot in state.sessions.iter_mut().filter(|slot| slot.is_alive()) {
            slot.send(SessionEvent::Disconnected(reason.to_string()));
            slot.events = None;
        }
    }

    /// Publish to every live session subscribed to a matching filter
    ///
    /// Returns whether any session received it; nothing is queued for later.
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>, qos: QoS) -> bool {
        let payload = payload.into();
        let state = self.state();
        let mut delivered = false;

        for slot in state.sessions.iter().filter(|slot| slot.is_alive()) {
            if slot
                .subscriptions
                .iter()
                .any(|(filter, _)| topic_matches(topic, filter))
            {
                slot.send(SessionEvent::Message(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    qos,
                    retain: false,
                }));
                delivered = true;
            }
        }

        delivered
    }

    pub fn connect_requests(&self) -> Vec<ConnectRequest> {
        self.state().connect_requests.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state().connect_requests.len()
    }

    /// Sessions opened so far, live or not
    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }

    pub fn live_sessions(&self) -> usize {
        self.state()
            .sessions
            .iter()
            .filter(|slot| slot.is_alive())
            .count()
    }

    /// Topics subscribed on session `index`, in the order they were requested
    pub fn subscribe_log(&self, index: usize) -> Vec<String> {
        self.state()
            .sessions
            .get(index)
            .map(|slot| slot.subscribe_log.clone())
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn graceful_disconnects(&self) -> usize {
        self.state().graceful_disconnects
    }
}

struct MockConnector {
    broker: MockBroker,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        request: ConnectRequest,
    ) -> Result<Box<dyn BrokerSession>, TransportError> {
        let hang = {
            let mut state = self.broker.state();
            state.connect_requests.push(request);

            if state.refuse_credentials {
                return Err(TransportError::Rejected {
                    code: "NotAuthorized".to_string(),
                });
            }
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(TransportError::Rejected {
                    code: "ServiceUnavailable".to_string(),
                });
            }
            state.hang_connects
        };

        if hang {
            std::future::pending::<()>().await;
        }

        let (events, receiver) = mpsc::unbounded_channel();
        let mut state = self.broker.state();
        state.sessions.push(SessionSlot {
            events: Some(events),
            subscriptions: Vec::new(),
            subscribe_log: Vec::new(),
            next_packet_id: 0,
        });

        Ok(Box::new(MockSession {
            index: state.sessions.len() - 1,
            broker: self.broker.clone(),
            events: receiver,
        }))
    }
}

struct MockSession {
    index: usize,
    broker: MockBroker,
    events: mpsc::UnboundedReceiver<Result<SessionEvent, TransportError>>,
}

impl MockSession {
    fn with_slot<T>(
        &self,
        f: impl FnOnce(&mut BrokerState, usize) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut state = self.broker.state();
        let alive = state
            .sessions
            .get(self.index)
            .map(SessionSlot::is_alive)
            .unwrap_or(false);
        if !alive {
            return Err(TransportError::SessionClosed("connection reset".to_string()));
        }
        f(&mut *state, self.index)
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    fn publish(&mut self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), TransportError> {
        self.with_slot(|state, index| {
            state.published.push(PublishedMessage {
                topic: topic.to_string(),
                payload,
                qos,
                session: index,
            });

            if !qos.is_acknowledged() {
                let sent = SessionEvent::Sent {
                    kind: RequestKind::Publish,
                    packet_id: 0,
                };
                state.emit(index, vec![sent]);
                return Ok(());
            }

            let packet_id = state.sessions[index].next_packet_id();
            let mut events = vec![SessionEvent::Sent {
                kind: RequestKind::Publish,
                packet_id,
            }];
            if state.auto_ack_publishes {
                events.push(SessionEvent::Acknowledged {
                    kind: RequestKind::Publish,
                    packet_id,
                    outcome: AckOutcome::Accepted,
                });
            } else {
                state.withheld_publish_acks.push((index, packet_id));
            }
            state.emit(index, events);
            Ok(())
        })
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.with_slot(|state, index| {
            let rejected = state.rejected_topics.contains(topic);
            let withhold = state.withhold_subacks;
            let slot = &mut state.sessions[index];

            slot.subscribe_log.push(topic.to_string());
            let packet_id = slot.next_packet_id();
            let mut events = vec![SessionEvent::Sent {
                kind: RequestKind::Subscribe,
                packet_id,
            }];

            if !withhold {
                let outcome = if rejected {
                    AckOutcome::Rejected("Failure".to_string())
                } else {
                    slot.subscriptions.retain(|(filter, _)| filter != topic);
                    slot.subscriptions.push((topic.to_string(), qos));
                    AckOutcome::Accepted
                };
                events.push(SessionEvent::Acknowledged {
                    kind: RequestKind::Subscribe,
                    packet_id,
                    outcome,
                });
            }
            state.emit(index, events);
            Ok(())
        })
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.with_slot(|state, index| {
            let slot = &mut state.sessions[index];
            slot.subscriptions.retain(|(filter, _)| filter != topic);

            let packet_id = slot.next_packet_id();
            let events = vec![
                SessionEvent::Sent {
                    kind: RequestKind::Unsubscribe,
                    packet_id,
                },
                SessionEvent::Acknowledged {
                    kind: RequestKind::Unsubscribe,
                    packet_id,
                    outcome: AckOutcome::Accepted,
                },
            ];
            state.emit(index, events);
            Ok(())
        })
    }

    async fn next_event(&mut self) -> Result<SessionEvent, TransportError> {
        match self.events.recv().await {
            Some(event) => event,
            None => Err(TransportError::SessionClosed("connection reset".to_string())),
        }
    }

    async fn shutdown(&mut self) {
        let mut state = self.broker.state();
        if let Some(slot) = state.sessions.get_mut(self.index) {
            if slot.events.take().is_some() {
                state.graceful_disconnects += 1;
            }
        }
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        if let Some(slot) = self.broker.state().sessions.get_mut(self.index) {
            slot.events = None;
        }
    }
}

/// Wall clock moved only by the test
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut current) = self.now.lock() {
            *current = now;
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut current) = self.now.lock() {
            *current += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
