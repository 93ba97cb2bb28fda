#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix::{Actor, Addr};
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use encrypted_broadcast_hub::error::{StoreError, TransportError};
use encrypted_broadcast_hub::{
    CloseStatus, Codec, Hub, Inbound, ListSessions, MemoryPubSub, MemoryStore, MessageStore,
    NodeId, Outbound, ReplayWindow, Session, SessionContext, SessionSettings,
};

type Frame = Result<String, TransportError>;

/// What the session wrote to the fake peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Written {
    Text(String),
    Closed(CloseStatus),
}

pub struct FakeInbound(mpsc::UnboundedReceiver<Frame>);

impl Inbound for FakeInbound {
    fn recv(&mut self) -> BoxFuture<'_, Option<Frame>> {
        Box::pin(self.0.recv())
    }
}

#[derive(Clone)]
pub struct FakeOutbound {
    to_session: Arc<Mutex<Option<mpsc::UnboundedSender<Frame>>>>,
    written: mpsc::UnboundedSender<Written>,
    gate: Arc<tokio::sync::Mutex<()>>,
    close_delay: Duration,
}

impl Outbound for FakeOutbound {
    fn send(&self, text: String) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let _open = self.gate.lock().await;
            if self.to_session.lock().unwrap().is_none() {
                return Err(TransportError::Closed);
            }
            self.written
                .send(Written::Text(text))
                .map_err(|_| TransportError::Closed)
        })
    }

    fn close(&self, status: CloseStatus) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.close_delay.is_zero() {
                tokio::time::sleep(self.close_delay).await;
            }
            // dropping the sender ends the session's inbound stream
            if self.to_session.lock().unwrap().take().is_some() {
                let _ = self.written.send(Written::Closed(status));
            }
        })
    }
}

/// The far end of a fake connection, driven by the test.
pub struct Peer {
    to_session: Arc<Mutex<Option<mpsc::UnboundedSender<Frame>>>>,
    written: mpsc::UnboundedReceiver<Written>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Peer {
    pub fn say(&self, text: &str) {
        if let Some(tx) = self.to_session.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(text.to_string()));
        }
    }

    pub fn fail(&self) {
        if let Some(tx) = self.to_session.lock().unwrap().as_ref() {
            let _ = tx.send(Err(TransportError::Protocol("reset".to_string())));
        }
    }

    pub fn hang_up(&self) {
        self.to_session.lock().unwrap().take();
    }

    /// Stop reading: every write from the session blocks until the guard is dropped.
    pub async fn stall(&self) -> tokio::sync::OwnedMutexGuard<()> {
        self.gate.clone().lock_owned().await
    }

    pub async fn next(&mut self) -> Option<Written> {
        tokio::time::timeout(Duration::from_secs(2), self.written.recv())
            .await
            .expect("timed out waiting for the session to write")
    }

    pub async fn expect_text(&mut self, expected: &str) {
        assert_eq!(self.next().await, Some(Written::Text(expected.to_string())));
    }

    /// Whatever the session has written so far, without waiting.
    pub fn written_now(&mut self) -> Option<Written> {
        self.written.try_recv().ok()
    }

    /// `true` if nothing is written for `ms` milliseconds.
    pub async fn quiet(&mut self, ms: u64) -> bool {
        tokio::time::timeout(Duration::from_millis(ms), self.written.recv())
            .await
            .is_err()
    }
}

pub fn connection() -> (FakeInbound, FakeOutbound, Peer) {
    connection_with_close_delay(Duration::ZERO)
}

/// Like [`connection`], but every close takes `close_delay` to reach the peer.
pub fn connection_with_close_delay(close_delay: Duration) -> (FakeInbound, FakeOutbound, Peer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let to_session = Arc::new(Mutex::new(Some(tx)));
    let gate = Arc::new(tokio::sync::Mutex::new(()));

    let outbound = FakeOutbound {
        to_session: to_session.clone(),
        written: written_tx,
        gate: gate.clone(),
        close_delay,
    };
    let peer = Peer {
        to_session,
        written: written_rx,
        gate,
    };
    (FakeInbound(rx), outbound, peer)
}

pub const NODE: &str = "local-node";

/// A store whose operations can be made to fail or held up, backed by a [`MemoryStore`].
#[derive(Default)]
pub struct FailingStore {
    pub inner: MemoryStore,
    pub fail_append: bool,
    pub fail_range: bool,
    /// Appends wait while this lock is held by the test.
    pub hold: Arc<tokio::sync::Mutex<()>>,
}

impl FailingStore {
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

impl MessageStore for FailingStore {
    fn append<'a>(
        &'a self,
        topic: &'a str,
        ciphertext: &'a str,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let _held = self.hold.lock().await;
            if self.fail_append {
                return Err(StoreError::Unavailable("append refused".to_string()));
            }
            self.inner.append(topic, ciphertext).await
        })
    }

    fn recent_range<'a>(
        &'a self,
        topic: &'a str,
        count: usize,
    ) -> BoxFuture<'a, Result<ReplayWindow, StoreError>> {
        Box::pin(async move {
            if self.fail_range {
                return Err(StoreError::Unavailable("range refused".to_string()));
            }
            self.inner.recent_range(topic, count).await
        })
    }
}

pub struct Harness {
    pub hub: Addr<Hub>,
    pub store: Arc<dyn MessageStore>,
    pub pubsub: MemoryPubSub,
    pub codec: Arc<Codec>,
    pub ctx: SessionContext,
}

impl Harness {
    pub fn new(settings: SessionSettings) -> Self {
        Self::with_store(settings, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(settings: SessionSettings, store: Arc<dyn MessageStore>) -> Self {
        let pubsub = MemoryPubSub::default();
        let hub = Hub::new(NodeId::from(NODE), Arc::new(pubsub.clone())).start();
        let codec = Arc::new(Codec::new(&Codec::generate_key()).unwrap());
        let ctx = SessionContext {
            hub: hub.clone(),
            codec: codec.clone(),
            store: store.clone(),
            settings,
        };
        Self {
            hub,
            store,
            pubsub,
            codec,
            ctx,
        }
    }

    pub fn connect(&self) -> Peer {
        self.connect_with_close_delay(Duration::ZERO)
    }

    pub fn connect_with_close_delay(&self, close_delay: Duration) -> Peer {
        let (inbound, outbound, peer) = connection_with_close_delay(close_delay);
        actix_rt::spawn(Session::new(self.ctx.clone(), inbound, outbound).run());
        peer
    }

    pub async fn session_count(&self) -> usize {
        self.hub.send(ListSessions).await.unwrap().len()
    }

    /// Poll the hub until exactly `n` sessions are registered.
    pub async fn wait_for_sessions(&self, n: usize) {
        for _ in 0..200 {
            if self.session_count().await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} registered sessions, found {}", n, self.session_count().await);
    }
}
