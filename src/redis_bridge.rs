//! Cross-process fan-out over a pub/sub channel.
//!
//! Every locally originated broadcast is published as an [`Envelope`] tagged with this
//! process' [`NodeId`]. The bridge loop feeds envelopes from other processes into the hub
//! and drops its own, so a message crosses the channel exactly once.

use std::fmt;

use actix::Addr;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use prost::Message;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::PubSubError;
use crate::hub::{Broadcast, Hub};

/// Random per-process identity used to recognise our own publishes on the channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(String);

impl NodeId {
    pub fn random() -> Self {
        Self(format!("{:016x}", rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wire format on the pub/sub channel.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(string, tag = "1")]
    pub origin: String,
    #[prost(uint64, optional, tag = "2")]
    pub seq: Option<u64>,
    #[prost(string, tag = "3")]
    pub payload: String,
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Bytes, PubSubError> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// Outbound side of the channel. Publishing is fire-and-forget and must not block the
/// caller; delivery failures are the implementation's to log.
pub trait Publisher: Send + Sync + 'static {
    fn publish(&self, payload: Bytes) -> Result<(), PubSubError>;
}

/// In-process channel that loops back to its own subscribers, like a Redis channel does.
#[derive(Debug, Clone)]
pub struct MemoryPubSub {
    tx: broadcast::Sender<Bytes>,
}

impl MemoryPubSub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> BoxStream<'static, Bytes> {
        stream::unfold(self.tx.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("pubsub subscriber lagged, skipped {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Publisher for MemoryPubSub {
    fn publish(&self, payload: Bytes) -> Result<(), PubSubError> {
        // No subscribers just means nobody else is listening.
        let _ = self.tx.send(payload);
        Ok(())
    }
}

/// Envelopes waiting for the background publisher before new ones are dropped.
pub const PUBLISH_BACKLOG: usize = 1024;

/// Bounded hand-off from the hub to a single background publishing task, so envelopes
/// leave in hub order. When the task falls behind, new envelopes are refused rather than
/// queued without limit.
#[derive(Debug, Clone)]
pub struct PublishQueue {
    tx: mpsc::Sender<Bytes>,
}

impl PublishQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Publisher for PublishQueue {
    fn publish(&self, payload: Bytes) -> Result<(), PubSubError> {
        self.tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => PubSubError::Backlog,
            TrySendError::Closed(_) => PubSubError::Closed,
        })
    }
}

/// Forward every foreign envelope on `feed` into the hub until the feed ends.
pub async fn run_bridge<S>(feed: S, hub: Addr<Hub>, node: NodeId)
where
    S: Stream<Item = Bytes>,
{
    futures_util::pin_mut!(feed);
    while let Some(raw) = feed.next().await {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("dropping undecodable pubsub envelope: {}", e);
                continue;
            }
        };

        if envelope.origin == node.as_str() {
            continue;
        }

        debug!("bridging message from node {}", envelope.origin);
        hub.do_send(Broadcast::bridged(
            Bytes::from(envelope.payload),
            envelope.seq,
        ));
    }
    info!("pubsub feed ended, bridge stopped");
}

pub fn spawn_bridge<S>(feed: S, hub: Addr<Hub>, node: NodeId) -> tokio::task::JoinHandle<()>
where
    S: Stream<Item = Bytes> + Send + 'static,
{
    tokio::spawn(run_bridge(feed, hub, node))
}

#[cfg(feature = "redis")]
pub use self::redis_pubsub::{
    connect, spawn_redis_publisher, spawn_redis_subscriber, RedisBridgeConfig,
};

#[cfg(feature = "redis")]
mod redis_pubsub {
    use actix::Addr;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use redis::aio::ConnectionManager;

    use super::{run_bridge, NodeId, PublishQueue, PUBLISH_BACKLOG};
    use crate::hub::Hub;

    #[derive(Debug, Clone)]
    pub struct RedisBridgeConfig {
        pub url: String,
        pub channel: String,
    }

    pub async fn connect(cfg: &RedisBridgeConfig) -> redis::RedisResult<ConnectionManager> {
        let client = redis::Client::open(cfg.url.as_str())?;
        ConnectionManager::new(client).await
    }

    /// PUBLISH everything handed to the returned queue on `channel`.
    pub fn spawn_redis_publisher(mut conn: ConnectionManager, channel: String) -> PublishQueue {
        let (queue, mut rx) = PublishQueue::new(PUBLISH_BACKLOG);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let res = redis::cmd("PUBLISH")
                    .arg(&channel)
                    .arg(payload.as_ref())
                    .query_async::<_, ()>(&mut conn)
                    .await;
                if let Err(e) = res {
                    warn!("publish to {} failed: {}", channel, e);
                }
            }
        });
        queue
    }

    pub async fn spawn_redis_subscriber(
        cfg: RedisBridgeConfig,
        hub: Addr<Hub>,
        node: NodeId,
    ) -> redis::RedisResult<tokio::task::JoinHandle<()>> {
        let client = redis::Client::open(cfg.url)?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(cfg.channel.clone()).await?;

        Ok(tokio::spawn(async move {
            let feed = pubsub.on_message().filter_map(|msg| {
                let payload = match msg.get_payload::<Vec<u8>>() {
                    Ok(p) => Some(Bytes::from(p)),
                    Err(e) => {
                        warn!("unreadable pubsub payload: {}", e);
                        None
                    }
                };
                futures_util::future::ready(payload)
            });
            run_bridge(feed, hub, node).await;
        }))
    }
}
