//! Actix Web websocket broadcast hub with encrypted history and cross-process fan-out.
//!
//! Start a [`Hub`], build a [`SessionContext`] around it and hand every upgraded websocket
//! to [`ws::start`]. Payloads are AES-GCM sealed while stored and while crossing the
//! pub/sub channel, and decrypted only when written to a peer.
#[macro_use]
extern crate log;

pub mod config;
pub mod crypto;
pub mod error;
pub mod hub;
pub mod redis_bridge;
pub mod routes;
pub mod session;
pub mod store;
pub mod ws;

pub use config::Config;
pub use crypto::Codec;
pub use hub::{Broadcast, Hub, HubCommand, ListSessions, Origin, SessionId};
pub use redis_bridge::{MemoryPubSub, NodeId, PublishQueue, Publisher};
pub use session::{CloseStatus, Inbound, Outbound, Session, SessionContext, SessionSettings};
pub use store::{MemoryStore, MessageStore, ReplayWindow};
