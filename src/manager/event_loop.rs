//! Connection event loop (impure I/O)
//!
//! One task owns the connection: lifecycle state, active credential, registry,
//! the live session and every in-flight request. `tokio::select!` serializes
//! caller commands, session events, the renewal deadline, the backoff deadline
//! and the earliest acknowledgment deadline.

use super::connection::{ConnectionState, ManagerError, ManagerSettings};
use super::dispatch::{Dispatcher, MessageHandler};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::inflight::{Completion, InflightTracker, Pending, Reply};
use super::registry::{SubscriptionHandle, SubscriptionRegistry};
use crate::clock::Clock;
use crate::credentials::{SignedCredential, TokenSigner, TransportConfig};
use crate::error::redact_secrets;
use crate::identity::DeviceIdentity;
use crate::transport::{
    AckOutcome, BrokerSession, ConnectRequest, Connector, InboundMessage, QoS, RequestKind,
    SessionEvent, TransportError,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Placeholder username; the broker authenticates by the password token only
const USERNAME_PLACEHOLDER: &str = "unused";

pub(crate) enum Command {
    Connect {
        reply: Reply<()>,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        reply: Reply<()>,
    },
    Subscribe {
        topic: String,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
        reply: Reply<SubscriptionHandle>,
    },
    Unsubscribe {
        handle: SubscriptionHandle,
        reply: Reply<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

impl Command {
    /// Answer a command that arrived after close
    fn reject_closed(self) {
        match self {
            Command::Connect { reply }
            | Command::Publish { reply, .. }
            | Command::Unsubscribe { reply, .. } => {
                let _ = reply.send(Err(ManagerError::Closed));
            }
            Command::Subscribe { reply, .. } => {
                let _ = reply.send(Err(ManagerError::Closed));
            }
            Command::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

/// Counters behind `ConnectionManager::health`
#[derive(Debug, Default)]
pub(crate) struct ConnectionStats {
    pub connect_time: Option<Instant>,
    pub last_message_time: Option<Instant>,
    pub reconnect_count: u32,
    pub credential_renewals: u32,
}

pub(crate) fn lock_stats(stats: &Mutex<ConnectionStats>) -> MutexGuard<'_, ConnectionStats> {
    match stats.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

enum Flow {
    Continue,
    Stop,
}

/// `connect()` caller waiting for the session to become ready
struct ReadyWaiter {
    reply: Reply<()>,
    deadline: Instant,
}

enum Attempt {
    Opened {
        session: Box<dyn BrokerSession>,
        credential: SignedCredential,
    },
    Failed(ManagerError),
    /// Close arrived while connecting
    Cancelled(Option<oneshot::Sender<()>>),
}

/// Collaborators and channels handed to the loop at spawn time
pub(crate) struct LoopParts {
    pub identity: Arc<DeviceIdentity>,
    pub signer: TokenSigner,
    pub tls: TransportConfig,
    pub settings: ManagerSettings,
    pub connector: Arc<dyn Connector>,
    pub clock: Arc<dyn Clock>,
    pub commands: mpsc::Receiver<Command>,
    pub state_tx: watch::Sender<ConnectionState>,
    pub credential_tx: watch::Sender<Option<Arc<SignedCredential>>>,
    pub stats: Arc<Mutex<ConnectionStats>>,
}

pub(crate) struct ConnectionLoop {
    identity: Arc<DeviceIdentity>,
    signer: TokenSigner,
    tls: TransportConfig,
    settings: ManagerSettings,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    commands: mpsc::Receiver<Command>,
    deferred: VecDeque<Command>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    credential: Option<Arc<SignedCredential>>,
    credential_tx: watch::Sender<Option<Arc<SignedCredential>>>,
    stats: Arc<Mutex<ConnectionStats>>,
    session: Option<Box<dyn BrokerSession>>,
    registry: SubscriptionRegistry,
    dispatcher: Dispatcher,
    inflight: InflightTracker,
    ready_waiters: Vec<ReadyWaiter>,
    renew_at: Option<Instant>,
    backoff_until: Option<Instant>,
    failed_attempts: u32,
}

async fn next_session_event(
    session: &mut Option<Box<dyn BrokerSession>>,
) -> Result<SessionEvent, TransportError> {
    match session {
        Some(session) => session.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ConnectionLoop {
    pub fn new(parts: LoopParts) -> Self {
        let dispatcher = Dispatcher::new(parts.settings.dispatch_queue_capacity);
        Self {
            identity: parts.identity,
            signer: parts.signer,
            tls: parts.tls,
            settings: parts.settings,
            connector: parts.connector,
            clock: parts.clock,
            commands: parts.commands,
            deferred: VecDeque::new(),
            state: ConnectionState::Disconnected,
            state_tx: parts.state_tx,
            credential: None,
            credential_tx: parts.credential_tx,
            stats: parts.stats,
            session: None,
            registry: SubscriptionRegistry::new(),
            dispatcher,
            inflight: InflightTracker::new(),
            ready_waiters: Vec::new(),
            renew_at: None,
            backoff_until: None,
            failed_attempts: 0,
        }
    }

    pub async fn run(mut self) {
        debug!(client_id = %self.identity.client_id(), "Connection event loop started");

        loop {
            let flow = if let Some(command) = self.deferred.pop_front() {
                self.handle_command(command).await
            } else {
                let renew_at = self.renew_at;
                let backoff_until = self.backoff_until;
                let ack_deadline = self.inflight.next_deadline();
                let ready_deadline = self.ready_waiters.iter().map(|w| w.deadline).min();

                tokio::select! {
                    command = self.commands.recv() => match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            debug!("All manager handles dropped, closing");
                            self.close(None).await;
                            Flow::Stop
                        }
                    },
                    event = next_session_event(&mut self.session) => {
                        self.on_session_event(event);
                        Flow::Continue
                    }
                    _ = sleep_until_opt(renew_at) => {
                        self.renew_credential("renewal deadline reached").await
                    }
                    _ = sleep_until_opt(backoff_until) => {
                        self.backoff_until = None;
                        self.reconnect_now().await
                    }
                    _ = sleep_until_opt(ack_deadline) => {
                        self.on_ack_deadline();
                        Flow::Continue
                    }
                    _ = sleep_until_opt(ready_deadline) => {
                        self.on_ready_deadline();
                        Flow::Continue
                    }
                }
            };

            if let Flow::Stop = flow {
                break;
            }
        }

        debug!("Connection event loop stopped");
    }

    fn transition(&mut self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(&self.state, event);
        if next == self.state {
            return;
        }
        HealthMonitor::log_state_transition(&self.state, &next);
        self.state = next.clone();
        self.state_tx.send_replace(next);
    }

    fn stats(&self) -> MutexGuard<'_, ConnectionStats> {
        lock_stats(&self.stats)
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Connect { reply } => self.on_connect(reply).await,
            Command::Publish {
                topic,
                payload,
                qos,
                reply,
            } => self.on_publish(topic, payload, qos, reply).await,
            Command::Subscribe {
                topic,
                qos,
                handler,
                reply,
            } => self.on_subscribe(topic, qos, handler, reply).await,
            Command::Unsubscribe { handle, reply } => {
                self.on_unsubscribe(handle, reply);
                Flow::Continue
            }
            Command::Close { reply } => {
                self.close(Some(reply)).await;
                Flow::Stop
            }
        }
    }

    async fn on_connect(&mut self, reply: Reply<()>) -> Flow {
        match self.state {
            ConnectionState::Connected => {
                let _ = reply.send(Ok(()));
                Flow::Continue
            }
            ConnectionState::Closed => {
                let _ = reply.send(Err(ManagerError::Closed));
                Flow::Continue
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                self.wait_until_ready(reply);
                Flow::Continue
            }
            ConnectionState::Disconnected => {
                self.transition(ConnectionEvent::ConnectRequested);
                match self.attempt_session().await {
                    Attempt::Opened {
                        session,
                        credential,
                    } => {
                        self.wait_until_ready(reply);
                        self.on_session_opened(session, credential);
                        Flow::Continue
                    }
                    Attempt::Failed(e) => {
                        warn!(error = %e, "Initial connection attempt failed");
                        self.transition(ConnectionEvent::InitialConnectFailed);
                        let _ = reply.send(Err(e));
                        Flow::Continue
                    }
                    Attempt::Cancelled(close_reply) => {
                        let _ = reply.send(Err(ManagerError::Closed));
                        self.close(close_reply).await;
                        Flow::Stop
                    }
                }
            }
        }
    }

    fn credential_expired(&self) -> bool {
        self.credential
            .as_ref()
            .map(|credential| credential.is_expired_at(self.clock.now()))
            .unwrap_or(false)
    }

    fn connect_request(&self, credential: &SignedCredential) -> ConnectRequest {
        ConnectRequest {
            host: self.settings.host.clone(),
            port: self.settings.port,
            client_id: self.identity.client_id(),
            username: USERNAME_PLACEHOLDER.to_string(),
            password: credential.token().to_string(),
            keep_alive: self.settings.keep_alive,
            tls: self.tls.clone(),
            request_capacity: self.settings.request_capacity,
        }
    }

    /// Mint a fresh credential and open one session
    ///
    /// Close cancels the attempt; every other command waits until it resolves.
    async fn attempt_session(&mut self) -> Attempt {
        let credential =
            match self
                .signer
                .sign(&self.identity, self.clock.now(), self.settings.token_lifetime)
            {
                Ok(credential) => credential,
                Err(e) => return Attempt::Failed(e.into()),
            };
        debug!(
            issued_at = %credential.issued_at(),
            expires_at = %credential.expires_at(),
            "Minted credential for connection attempt"
        );

        let request = self.connect_request(&credential);
        let connector = Arc::clone(&self.connector);
        let timeout = self.settings.connect_timeout;
        let connect = tokio::time::timeout(timeout, async move { connector.connect(request).await });
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(Ok(session)) => Attempt::Opened { session, credential },
                        Ok(Err(e)) => Attempt::Failed(ManagerError::Connect(e)),
                        Err(_) => Attempt::Failed(ManagerError::ConnectTimeout(timeout)),
                    };
                }
                command = self.commands.recv() => match command {
                    Some(Command::Close { reply }) => return Attempt::Cancelled(Some(reply)),
                    Some(other) => self.deferred.push_back(other),
                    None => return Attempt::Cancelled(None),
                }
            }
        }
    }

    fn on_session_opened(&mut self, mut session: Box<dyn BrokerSession>, credential: SignedCredential) {
        let credential = Arc::new(credential);
        let renewed = self.credential.is_some();
        let delay =
            HealthMonitor::renewal_delay(&credential, self.settings.renew_at_fraction, self.clock.now());

        info!(
            issued_at = %credential.issued_at(),
            expires_at = %credential.expires_at(),
            renew_in_secs = delay.as_secs(),
            renewed,
            "Broker session opened"
        );

        self.renew_at = Some(Instant::now() + delay);
        self.backoff_until = None;
        self.credential = Some(Arc::clone(&credential));
        self.credential_tx.send_replace(Some(credential));
        if renewed {
            self.stats().credential_renewals += 1;
        }

        // Subscriptions are session scoped; re-issue all of them in order
        let now = Instant::now();
        let ack_timeout = self.settings.ack_timeout;
        let mut replay_error = None;
        let mut replayed = 0usize;
        for subscription in self.registry.iter() {
            if let Err(e) = session.subscribe(&subscription.topic, subscription.qos) {
                replay_error = Some(e);
                break;
            }
            self.inflight.enqueue(Pending {
                kind: RequestKind::Subscribe,
                topic: subscription.topic.clone(),
                deadline: now + ack_timeout,
                timeout: ack_timeout,
                completion: Completion::Replay,
            });
            replayed += 1;
        }

        self.session = Some(session);

        if let Some(e) = replay_error {
            self.on_session_lost(format!("subscription replay failed: {e}"));
            return;
        }
        if replayed > 0 {
            info!(count = replayed, "Replaying subscriptions");
        }

        self.check_ready();
    }

    /// Park a `connect()` caller until ready, for at most the connect timeout
    fn wait_until_ready(&mut self, reply: Reply<()>) {
        self.ready_waiters.push(ReadyWaiter {
            reply,
            deadline: Instant::now() + self.settings.connect_timeout,
        });
    }

    /// Answer callers still waiting when their deadline passes; the lifecycle carries on
    fn on_ready_deadline(&mut self) {
        let now = Instant::now();
        let timeout = self.settings.connect_timeout;
        let (expired, waiting): (Vec<_>, Vec<_>) = self
            .ready_waiters
            .drain(..)
            .partition(|waiter| waiter.deadline <= now);
        self.ready_waiters = waiting;

        if !expired.is_empty() {
            warn!(state = %self.state, waiters = expired.len(), "Connection not ready within connect timeout");
        }
        for waiter in expired {
            let _ = waiter.reply.send(Err(ManagerError::ConnectTimeout(timeout)));
        }
    }

    /// Publish `Connected` once the session is open and every replay is acknowledged
    fn check_ready(&mut self) {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        ) {
            return;
        }
        if self.session.is_none() || self.inflight.replays_pending() > 0 {
            return;
        }

        self.failed_attempts = 0;
        self.transition(ConnectionEvent::Ready);
        self.stats().connect_time = Some(Instant::now());
        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.reply.send(Ok(()));
        }
    }

    fn on_session_event(&mut self, event: Result<SessionEvent, TransportError>) {
        match event {
            Ok(SessionEvent::Message(message)) => self.dispatch(message),
            Ok(SessionEvent::Sent { kind, packet_id }) => self.inflight.on_sent(kind, packet_id),
            Ok(SessionEvent::Acknowledged {
                kind,
                packet_id,
                outcome,
            }) => self.on_acknowledged(kind, packet_id, outcome),
            Ok(SessionEvent::Disconnected(reason)) => self.on_session_lost(reason),
            Ok(SessionEvent::Idle) => {}
            Err(e) => self.on_session_lost(redact_secrets(&e.to_string())),
        }
    }

    fn dispatch(&mut self, message: InboundMessage) {
        self.stats().last_message_time = Some(Instant::now());

        let mut matched = 0usize;
        for subscription in self.registry.matching(&message.topic) {
            matched += 1;
            self.dispatcher.deliver(subscription.id, message.clone());
        }

        if matched == 0 {
            debug!(topic = %message.topic, "No subscription matches inbound message");
        }
    }

    fn on_acknowledged(&mut self, kind: RequestKind, packet_id: u16, outcome: AckOutcome) {
        let Some(pending) = self.inflight.take_acknowledged(kind, packet_id) else {
            debug!(?kind, packet_id, "Acknowledgment for unknown packet");
            return;
        };

        let topic = pending.topic.clone();
        match outcome {
            AckOutcome::Accepted if pending.is_replay() => {
                debug!(topic = %topic, "Replayed subscription acknowledged");
            }
            AckOutcome::Rejected(reason) if pending.is_replay() => {
                warn!(topic = %topic, reason = %reason, "Broker rejected replayed subscription");
            }
            AckOutcome::Accepted => pending.resolve(Ok(())),
            AckOutcome::Rejected(reason) => {
                let error = match kind {
                    RequestKind::Subscribe => ManagerError::Subscribe { topic, reason },
                    _ => ManagerError::Transport(TransportError::Protocol(reason)),
                };
                pending.resolve(Err(error));
            }
        }

        self.check_ready();
    }

    fn on_ack_deadline(&mut self) {
        let mut replay_timed_out = false;

        for pending in self.inflight.take_expired(Instant::now()) {
            if pending.is_replay() {
                warn!(topic = %pending.topic, "Replayed subscription not acknowledged");
                replay_timed_out = true;
            } else {
                warn!(
                    operation = pending.operation(),
                    topic = %pending.topic,
                    "Acknowledgment timed out"
                );
                pending.timed_out();
            }
        }

        // The session cannot become ready without every replay
        if replay_timed_out {
            self.on_session_lost("subscription replay not acknowledged".to_string());
        }
    }

    fn fail_inflight(&mut self, error: fn() -> ManagerError) {
        for pending in self.inflight.drain_all() {
            pending.resolve(Err(error()));
        }
    }

    fn on_session_lost(&mut self, reason: String) {
        if self.session.take().is_none() {
            return;
        }
        warn!(reason = %reason, state = %self.state, "Broker session lost");

        self.renew_at = None;
        self.fail_inflight(|| ManagerError::ConnectionLost);
        self.stats().connect_time = None;

        // No internal retry for the initial connect
        if self.state == ConnectionState::Connecting {
            self.transition(ConnectionEvent::InitialConnectFailed);
            for waiter in self.ready_waiters.drain(..) {
                let _ = waiter.reply.send(Err(ManagerError::ConnectionLost));
            }
            return;
        }

        if self.state != ConnectionState::Connected {
            self.failed_attempts += 1;
        }
        self.stats().reconnect_count += 1;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.failed_attempts,
            &self.settings.reconnect,
            self.state == ConnectionState::Closed,
        );
        let ReconnectionDecision::Proceed {
            attempt,
            delay,
            budget_exhausted,
        } = decision
        else {
            return;
        };

        let delay = self
            .settings
            .reconnect
            .jittered_delay(delay, rand::random::<f64>());
        info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

        self.backoff_until = Some(Instant::now() + delay);
        self.transition(ConnectionEvent::ReconnectionScheduled {
            attempt,
            budget_exhausted,
        });
    }

    async fn reconnect_now(&mut self) -> Flow {
        match self.attempt_session().await {
            Attempt::Opened {
                session,
                credential,
            } => {
                self.on_session_opened(session, credential);
                Flow::Continue
            }
            Attempt::Failed(e) => {
                self.failed_attempts += 1;
                warn!(
                    error = %redact_secrets(&e.to_string()),
                    failed_attempts = self.failed_attempts,
                    "Reconnect attempt failed"
                );
                self.schedule_reconnect();
                Flow::Continue
            }
            Attempt::Cancelled(close_reply) => {
                self.close(close_reply).await;
                Flow::Stop
            }
        }
    }

    /// Gracefully replace the session with one using a fresh credential
    async fn renew_credential(&mut self, reason: &str) -> Flow {
        self.renew_at = None;
        info!(reason, "Renewing credential");

        self.drain_inflight(self.settings.close_drain_timeout).await;
        if let Some(mut session) = self.session.take() {
            session.shutdown().await;
        }
        self.fail_inflight(|| ManagerError::ConnectionLost);
        {
            let mut stats = self.stats();
            stats.connect_time = None;
            stats.reconnect_count += 1;
        }

        self.transition(ConnectionEvent::ReconnectionScheduled {
            attempt: self.failed_attempts + 1,
            budget_exhausted: false,
        });
        self.reconnect_now().await
    }

    /// Process session events until nothing awaits an acknowledgment or `timeout` elapses
    async fn drain_inflight(&mut self, timeout: Duration) {
        if self.session.is_none() || self.inflight.awaiting_ack() == 0 {
            return;
        }

        let deadline = Instant::now() + timeout;
        debug!(pending = self.inflight.awaiting_ack(), "Draining in-flight acknowledgments");

        while self.session.is_some() && self.inflight.awaiting_ack() > 0 {
            tokio::select! {
                event = next_session_event(&mut self.session) => match event {
                    Ok(SessionEvent::Message(message)) => self.dispatch(message),
                    Ok(SessionEvent::Sent { kind, packet_id }) => self.inflight.on_sent(kind, packet_id),
                    Ok(SessionEvent::Acknowledged { kind, packet_id, outcome }) => {
                        self.on_acknowledged(kind, packet_id, outcome)
                    }
                    Ok(SessionEvent::Idle) => {}
                    Ok(SessionEvent::Disconnected(reason)) => {
                        debug!(reason = %reason, "Session ended while draining");
                        self.session = None;
                    }
                    Err(e) => {
                        debug!(error = %e, "Session failed while draining");
                        self.session = None;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(pending = self.inflight.awaiting_ack(), "Drain timeout elapsed");
                    break;
                }
            }
        }
    }

    async fn on_publish(&mut self, topic: String, payload: Bytes, qos: QoS, reply: Reply<()>) -> Flow {
        if !HealthMonitor::can_publish(&self.state) || self.session.is_none() {
            let _ = reply.send(Err(ManagerError::NotConnected {
                state: self.state.clone(),
            }));
            return Flow::Continue;
        }

        if self.credential_expired() {
            let _ = reply.send(Err(ManagerError::CredentialExpired));
            return self.renew_credential("credential expired").await;
        }

        let Some(session) = self.session.as_mut() else {
            return Flow::Continue;
        };

        match session.publish(&topic, qos, payload) {
            Ok(()) => {
                let timeout = self.settings.ack_timeout;
                let completion = if qos.is_acknowledged() {
                    Completion::Publish(reply)
                } else {
                    let _ = reply.send(Ok(()));
                    Completion::Untracked
                };
                self.inflight.enqueue(Pending {
                    kind: RequestKind::Publish,
                    topic,
                    deadline: Instant::now() + timeout,
                    timeout,
                    completion,
                });
            }
            Err(TransportError::Backpressure) => {
                let _ = reply.send(Err(TransportError::Backpressure.into()));
            }
            Err(e) => {
                let reason = e.to_string();
                let _ = reply.send(Err(e.into()));
                self.on_session_lost(reason);
            }
        }

        Flow::Continue
    }

    async fn on_subscribe(
        &mut self,
        topic: String,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
        reply: Reply<SubscriptionHandle>,
    ) -> Flow {
        let (handle, replaced) = self.registry.insert(&topic, qos, Arc::clone(&handler));
        if let Some(previous) = replaced {
            debug!(topic = %topic, previous = previous.id, "Replacing subscription handler");
            self.dispatcher.stop(previous.id);
        }
        self.dispatcher.start(handle.id(), &topic, handler);

        if self.session.is_none() {
            debug!(topic = %topic, state = %self.state, "Subscription deferred until connected");
            let _ = reply.send(Ok(handle));
            return Flow::Continue;
        }

        // Registration stands; the renewed session replays it
        if self.credential_expired() {
            let _ = reply.send(Ok(handle));
            return self.renew_credential("credential expired").await;
        }

        let Some(session) = self.session.as_mut() else {
            return Flow::Continue;
        };

        match session.subscribe(&topic, qos) {
            Ok(()) => {
                let timeout = self.settings.ack_timeout;
                self.inflight.enqueue(Pending {
                    kind: RequestKind::Subscribe,
                    topic,
                    deadline: Instant::now() + timeout,
                    timeout,
                    completion: Completion::Subscribe { handle, reply },
                });
            }
            Err(TransportError::Backpressure) => {
                let _ = reply.send(Err(TransportError::Backpressure.into()));
            }
            Err(e) => {
                let reason = e.to_string();
                let _ = reply.send(Err(e.into()));
                self.on_session_lost(reason);
            }
        }

        Flow::Continue
    }

    fn on_unsubscribe(&mut self, handle: SubscriptionHandle, reply: Reply<()>) {
        let Some(removed) = self.registry.remove(&handle) else {
            debug!(topic = %handle.topic(), "Ignoring stale subscription handle");
            let _ = reply.send(Ok(()));
            return;
        };
        self.dispatcher.stop(removed.id);

        let Some(session) = self.session.as_mut() else {
            let _ = reply.send(Ok(()));
            return;
        };

        match session.unsubscribe(&removed.topic) {
            Ok(()) => {
                let timeout = self.settings.ack_timeout;
                self.inflight.enqueue(Pending {
                    kind: RequestKind::Unsubscribe,
                    topic: removed.topic,
                    deadline: Instant::now() + timeout,
                    timeout,
                    completion: Completion::Unsubscribe(reply),
                });
            }
            Err(TransportError::Backpressure) => {
                let _ = reply.send(Err(TransportError::Backpressure.into()));
            }
            Err(e) => {
                // A dead session holds no subscriptions; nothing is replayed for this topic
                let _ = reply.send(Ok(()));
                self.on_session_lost(e.to_string());
            }
        }
    }

    async fn close(&mut self, reply: Option<oneshot::Sender<()>>) {
        self.transition(ConnectionEvent::CloseRequested);
        self.renew_at = None;
        self.backoff_until = None;

        self.drain_inflight(self.settings.close_drain_timeout).await;
        if let Some(mut session) = self.session.take() {
            session.shutdown().await;
        }
        self.fail_inflight(|| ManagerError::Closed);

        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.reply.send(Err(ManagerError::Closed));
        }
        for command in self.deferred.drain(..) {
            command.reject_closed();
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.reject_closed();
        }

        self.dispatcher.shutdown(self.settings.close_drain_timeout).await;
        self.stats().connect_time = None;

        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }
}
