use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use actix::prelude::*;
use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::redis_bridge::{Envelope, NodeId, Publisher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Produced by a session of this process; republished on the pub/sub channel.
    Local,
    /// Received from another process through the bridge; fanned out only.
    Bridge,
}

/// An encrypted payload on its way to every registered session.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct Broadcast {
    pub payload: Bytes,
    /// Position of the payload in the shared history, when the append succeeded.
    pub seq: Option<u64>,
    pub origin: Origin,
}

impl Broadcast {
    pub fn local(payload: Bytes, seq: Option<u64>) -> Self {
        Self {
            payload,
            seq,
            origin: Origin::Local,
        }
    }

    pub fn bridged(payload: Bytes, seq: Option<u64>) -> Self {
        Self {
            payload,
            seq,
            origin: Origin::Bridge,
        }
    }
}

#[derive(Debug, Message)]
#[rtype(result = "()")]
pub enum HubCommand {
    /// Add a session in the joining state. Broadcasts are held back until `Ready`.
    Register {
        id: SessionId,
        queue: mpsc::Sender<Bytes>,
    },
    /// The session has queued its replay window, which covers history up to `replayed_through`.
    Ready {
        id: SessionId,
        replayed_through: u64,
    },
    /// Remove the session and close its queue. No-op if it is already gone.
    Unregister(SessionId),
}

/// Ids of every session currently in the registry, joining or live.
#[derive(Debug, Message)]
#[rtype(result = "Vec<SessionId>")]
pub struct ListSessions;

enum Phase {
    Joining { pending: Vec<Broadcast> },
    Live { replayed_through: u64 },
}

struct Member {
    queue: mpsc::Sender<Bytes>,
    phase: Phase,
}

impl Member {
    /// Hand `msg` to the session. `false` means the session must be dropped.
    fn offer(&mut self, msg: &Broadcast) -> bool {
        match &mut self.phase {
            Phase::Joining { pending } => {
                if pending.len() >= self.queue.max_capacity() {
                    return false;
                }
                pending.push(msg.clone());
                true
            }
            Phase::Live { replayed_through } => {
                if matches!(msg.seq, Some(seq) if seq <= *replayed_through) {
                    return true;
                }
                match self.queue.try_send(msg.payload.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
                }
            }
        }
    }
}

/// Single owner of the live-session registry. Every registry change and every fan-out is
/// processed one message at a time in the actor's mailbox order.
pub struct Hub {
    node: NodeId,
    publisher: Arc<dyn Publisher>,
    sessions: HashMap<SessionId, Member>,
}

impl Hub {
    pub fn new(node: NodeId, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            node,
            publisher,
            sessions: HashMap::new(),
        }
    }

    fn publish(&self, msg: &Broadcast) {
        let payload = String::from_utf8_lossy(&msg.payload).into_owned();
        let envelope = Envelope {
            origin: self.node.to_string(),
            seq: msg.seq,
            payload,
        };
        let res = envelope
            .to_bytes()
            .and_then(|bytes| self.publisher.publish(bytes));
        if let Err(e) = res {
            warn!("pubsub publish failed: {}", e);
        }
    }

    /// Removing the member drops the hub's sender, which closes the session's queue.
    fn drop_session(&mut self, id: SessionId) {
        if self.sessions.remove(&id).is_some() {
            warn!("session {} outbound queue full or closed, dropped from hub", id);
        }
    }
}

impl Actor for Hub {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        info!("hub {} started", self.node);
    }
}

impl Handler<HubCommand> for Hub {
    type Result = ();

    fn handle(&mut self, msg: HubCommand, _ctx: &mut Self::Context) -> Self::Result {
        match msg {
            HubCommand::Register { id, queue } => {
                let member = Member {
                    queue,
                    phase: Phase::Joining {
                        pending: Vec::new(),
                    },
                };
                if self.sessions.insert(id, member).is_some() {
                    warn!("session {} registered twice", id);
                }
                debug!("session {} joining, {} registered", id, self.sessions.len());
            }
            HubCommand::Ready {
                id,
                replayed_through,
            } => {
                let Some(member) = self.sessions.get_mut(&id) else {
                    return;
                };
                if matches!(member.phase, Phase::Live { .. }) {
                    warn!("session {} sent ready twice, ignoring", id);
                    return;
                }
                let pending = match std::mem::replace(
                    &mut member.phase,
                    Phase::Live { replayed_through },
                ) {
                    Phase::Joining { pending } => pending,
                    Phase::Live { .. } => Vec::new(),
                };
                if !pending.iter().all(|msg| member.offer(msg)) {
                    self.drop_session(id);
                    return;
                }
                debug!("session {} live after replay through {}", id, replayed_through);
            }
            HubCommand::Unregister(id) => {
                if self.sessions.remove(&id).is_some() {
                    debug!("session {} left, {} registered", id, self.sessions.len());
                }
            }
        }
    }
}

impl Handler<Broadcast> for Hub {
    type Result = ();

    fn handle(&mut self, msg: Broadcast, _ctx: &mut Self::Context) -> Self::Result {
        if msg.origin == Origin::Local {
            self.publish(&msg);
        }

        let dropped: Vec<SessionId> = self
            .sessions
            .iter_mut()
            .filter_map(|(id, member)| (!member.offer(&msg)).then_some(*id))
            .collect();
        for id in dropped {
            self.drop_session(id);
        }
    }
}

impl Handler<ListSessions> for Hub {
    type Result = MessageResult<ListSessions>;

    fn handle(&mut self, _msg: ListSessions, _ctx: &mut Self::Context) -> Self::Result {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort();
        MessageResult(ids)
    }
}
