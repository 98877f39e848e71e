//! In-flight request tracking
//!
//! A request is enqueued when handed to the session. The session reports the
//! packet id it was written with (`Sent`, in request order per kind) and the
//! broker later acknowledges that packet id.

use super::connection::ManagerError;
use super::registry::SubscriptionHandle;
use crate::transport::RequestKind;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, ManagerError>>;

/// What to do when a request completes
pub(crate) enum Completion {
    /// Fire-and-forget publish kept only to preserve `Sent` ordering
    Untracked,
    Publish(Reply<()>),
    Subscribe {
        handle: SubscriptionHandle,
        reply: Reply<SubscriptionHandle>,
    },
    /// Subscription re-issued after (re)connect
    Replay,
    Unsubscribe(Reply<()>),
    /// Timed out before the session wrote it; holds its place in the `Sent` order
    Expired,
}

pub(crate) struct Pending {
    pub kind: RequestKind,
    pub topic: String,
    pub deadline: Instant,
    pub timeout: Duration,
    pub completion: Completion,
}

impl Pending {
    pub fn operation(&self) -> &'static str {
        match self.kind {
            RequestKind::Publish => "publish",
            RequestKind::Subscribe => "subscribe",
            RequestKind::Unsubscribe => "unsubscribe",
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self.completion, Completion::Replay)
    }

    fn awaits_ack(&self) -> bool {
        !matches!(self.completion, Completion::Untracked | Completion::Expired)
    }

    /// Placeholder left in the unassigned queue when this request expires
    fn tombstone(&self) -> Pending {
        Pending {
            kind: self.kind,
            topic: self.topic.clone(),
            deadline: self.deadline,
            timeout: self.timeout,
            completion: Completion::Expired,
        }
    }

    /// Answer the waiting caller; replays, untracked publishes and tombstones have none
    pub fn resolve(self, result: Result<(), ManagerError>) {
        match self.completion {
            Completion::Untracked | Completion::Replay | Completion::Expired => {}
            Completion::Publish(reply) | Completion::Unsubscribe(reply) => {
                let _ = reply.send(result);
            }
            Completion::Subscribe { handle, reply } => {
                let _ = reply.send(result.map(|()| handle));
            }
        }
    }

    pub fn timed_out(self) {
        let error = ManagerError::AckTimeout {
            operation: self.operation(),
            topic: self.topic.clone(),
            timeout: self.timeout,
        };
        self.resolve(Err(error));
    }
}

#[derive(Default)]
pub(crate) struct InflightTracker {
    unassigned: HashMap<RequestKind, VecDeque<Pending>>,
    assigned: HashMap<(RequestKind, u16), Pending>,
}

impl InflightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, pending: Pending) {
        self.unassigned
            .entry(pending.kind)
            .or_default()
            .push_back(pending);
    }

    /// Bind the oldest unassigned request of `kind` to its packet id
    ///
    /// A tombstone is consumed without binding, so the late acknowledgment of
    /// an expired request is treated as unknown.
    pub fn on_sent(&mut self, kind: RequestKind, packet_id: u16) {
        let Some(pending) = self.unassigned.get_mut(&kind).and_then(VecDeque::pop_front) else {
            return;
        };
        if matches!(pending.completion, Completion::Expired) {
            return;
        }

        // Packet id 0 carries no acknowledgment
        if packet_id == 0 {
            pending.resolve(Ok(()));
            return;
        }

        self.assigned.insert((kind, packet_id), pending);
    }

    pub fn take_acknowledged(&mut self, kind: RequestKind, packet_id: u16) -> Option<Pending> {
        self.assigned.remove(&(kind, packet_id))
    }

    fn iter(&self) -> impl Iterator<Item = &Pending> {
        self.unassigned
            .values()
            .flat_map(|queue| queue.iter())
            .chain(self.assigned.values())
    }

    /// Earliest acknowledgment deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.iter()
            .filter(|p| p.awaits_ack())
            .map(|p| p.deadline)
            .min()
    }

    /// Remove every request past its deadline
    ///
    /// Unsent requests are still queued in the session and will report `Sent`
    /// later, so each leaves a tombstone in its queue position.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Pending> {
        let mut expired = Vec::new();

        for queue in self.unassigned.values_mut() {
            for slot in queue.iter_mut() {
                if slot.deadline <= now && slot.awaits_ack() {
                    let tombstone = slot.tombstone();
                    expired.push(std::mem::replace(slot, tombstone));
                }
            }
        }

        let keys: Vec<_> = self
            .assigned
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            if let Some(pending) = self.assigned.remove(&key) {
                expired.push(pending);
            }
        }

        expired
    }

    pub fn drain_all(&mut self) -> Vec<Pending> {
        let mut drained: Vec<Pending> = self
            .unassigned
            .drain()
            .flat_map(|(_, queue)| queue.into_iter())
            .collect();
        drained.extend(self.assigned.drain().map(|(_, pending)| pending));
        drained
    }

    /// Requests still awaiting an acknowledgment
    pub fn awaiting_ack(&self) -> usize {
        self.iter().filter(|p| p.awaits_ack()).count()
    }

    pub fn replays_pending(&self) -> usize {
        self.iter().filter(|p| p.is_replay()).count()
    }
}
