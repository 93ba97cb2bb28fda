//! One connected peer: an ingress loop and an egress loop coupled by a bounded queue.
//!
//! The physical connection is split into an [`Inbound`] half, owned by ingress, and an
//! [`Outbound`] half, shared by both loops so either side can close it. Ciphertext flows
//! through the queue and is decrypted only by egress, right before it is written out.

use std::sync::Arc;
use std::time::Duration;

use actix::Addr;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::config::Config;
use crate::crypto::Codec;
use crate::error::{CryptoError, TransportError};
use crate::hub::{Broadcast, Hub, HubCommand, SessionId};
use crate::store::MessageStore;

/// Why a session closed its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    /// Peer went away or the read side failed.
    ReadDone,
    /// Writing to the peer failed.
    WriteDone,
    /// The hub dropped the session; distinct from a normal closure.
    HubClosed,
    /// The absolute session deadline passed.
    Expired,
}

pub trait Inbound: Send + 'static {
    /// Next complete text message, or `None` once the connection is closed.
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<String, TransportError>>>;
}

pub trait Outbound: Clone + Send + Sync + 'static {
    fn send(&self, text: String) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Close the connection. Closing an already closed connection is a no-op.
    fn close(&self, status: CloseStatus) -> BoxFuture<'_, ()>;
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub history_key: String,
    pub replay_depth: usize,
    pub outbound_capacity: usize,
    pub deadline: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            history_key: "chat:messages".to_string(),
            replay_depth: 50,
            outbound_capacity: 256,
            deadline: Duration::from_secs(10 * 60),
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            history_key: cfg.history_key.clone(),
            replay_depth: cfg.replay_depth,
            outbound_capacity: cfg.outbound_capacity,
            deadline: cfg.session_deadline,
        }
    }
}

/// Everything a session shares with the rest of the process.
#[derive(Clone)]
pub struct SessionContext {
    pub hub: Addr<Hub>,
    pub codec: Arc<Codec>,
    pub store: Arc<dyn MessageStore>,
    pub settings: SessionSettings,
}

impl SessionContext {
    /// Encrypt `plaintext`, append it to the history and broadcast it.
    ///
    /// Store failures are logged and the message is still broadcast, without a sequence
    /// number. Returns the sequence number when the append succeeded.
    pub async fn submit(&self, plaintext: &str) -> Result<Option<u64>, CryptoError> {
        let ciphertext = self.codec.encrypt(plaintext)?;

        let seq = match self
            .store
            .append(&self.settings.history_key, &ciphertext)
            .await
        {
            Ok(seq) => Some(seq),
            Err(e) => {
                warn!("failed to persist message: {}", e);
                None
            }
        };

        self.hub.do_send(Broadcast::local(Bytes::from(ciphertext), seq));
        Ok(seq)
    }
}

pub struct Session<I, O> {
    id: SessionId,
    ctx: SessionContext,
    inbound: I,
    outbound: O,
}

impl<I: Inbound, O: Outbound> Session<I, O> {
    pub fn new(ctx: SessionContext, inbound: I, outbound: O) -> Self {
        Self {
            id: SessionId::next(),
            ctx,
            inbound,
            outbound,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Join the hub, queue the replay window, then run both loops until they have exited.
    pub async fn run(self) {
        let Session {
            id,
            ctx,
            inbound,
            outbound,
        } = self;
        let deadline = Instant::now() + ctx.settings.deadline;

        let queue = join(id, &ctx).await;

        let egress = tokio::spawn(egress(
            id,
            queue,
            outbound.clone(),
            ctx.codec.clone(),
            deadline,
        ));
        ingress(id, inbound, outbound, &ctx).await;

        if let Err(e) = egress.await {
            error!("session {} egress task failed: {}", id, e);
        }
        debug!("session {} finished", id);
    }
}

/// Register with the hub and fill the new queue with the replay window.
///
/// The hub holds back broadcasts between `Register` and `Ready`, and skips any whose
/// sequence number is covered by the window, so replayed history always comes first and
/// nothing is delivered twice.
async fn join(id: SessionId, ctx: &SessionContext) -> mpsc::Receiver<Bytes> {
    let (queue, rx) = mpsc::channel(ctx.settings.outbound_capacity.max(1));
    ctx.hub.do_send(HubCommand::Register {
        id,
        queue: queue.clone(),
    });

    let replayed_through = match ctx
        .store
        .recent_range(&ctx.settings.history_key, ctx.settings.replay_depth)
        .await
    {
        Ok(window) => {
            let surplus = window.entries.len().saturating_sub(queue.max_capacity());
            if surplus > 0 {
                warn!(
                    "session {} replay window exceeds queue capacity, skipping {} oldest",
                    id, surplus
                );
            }
            for entry in window.entries.into_iter().skip(surplus) {
                if queue.try_send(Bytes::from(entry)).is_err() {
                    warn!("session {} could not queue replay entry", id);
                    break;
                }
            }
            window.cursor
        }
        Err(e) => {
            warn!("session {} replay unavailable: {}", id, e);
            0
        }
    };

    // The hub must hold the only sender so that dropping it closes the queue.
    drop(queue);
    ctx.hub.do_send(HubCommand::Ready {
        id,
        replayed_through,
    });
    info!("session {} joined, replay through {}", id, replayed_through);
    rx
}

async fn ingress<I: Inbound, O: Outbound>(
    id: SessionId,
    mut inbound: I,
    outbound: O,
    ctx: &SessionContext,
) {
    while let Some(frame) = inbound.recv().await {
        let text = match frame {
            Ok(text) => text,
            Err(e) => {
                debug!("session {} receive failed: {}", id, e);
                break;
            }
        };

        if let Err(e) = ctx.submit(&text).await {
            warn!("session {} dropped message, encryption error: {}", id, e);
        }
    }

    // Closed before the hub drops the queue, otherwise egress reports HubClosed.
    outbound.close(CloseStatus::ReadDone).await;
    ctx.hub.do_send(HubCommand::Unregister(id));
}

async fn egress<O: Outbound>(
    id: SessionId,
    mut queue: mpsc::Receiver<Bytes>,
    outbound: O,
    codec: Arc<Codec>,
    deadline: Instant,
) {
    let expiry = sleep_until(deadline);
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            _ = &mut expiry => {
                info!("session {} reached its deadline", id);
                outbound.close(CloseStatus::Expired).await;
                return;
            }
            item = queue.recv() => {
                let Some(ciphertext) = item else {
                    outbound.close(CloseStatus::HubClosed).await;
                    return;
                };

                let text = match codec.decrypt_bytes(&ciphertext) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("session {} skipped message, decryption error: {}", id, e);
                        continue;
                    }
                };

                if let Err(e) = outbound.send(text).await {
                    debug!("session {} write failed: {}", id, e);
                    outbound.close(CloseStatus::WriteDone).await;
                    return;
                }
            }
        }
    }
}
