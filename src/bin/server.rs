use std::io;
use std::sync::Arc;

use actix::{Actor, Addr};
use actix_web::{web, App, HttpServer};
use log::info;

use encrypted_broadcast_hub::redis_bridge::spawn_bridge;
use encrypted_broadcast_hub::{
    routes, Config, Hub, MemoryPubSub, MemoryStore, MessageStore, NodeId, Publisher,
    SessionContext, SessionSettings,
};

fn invalid(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
}

#[cfg(feature = "redis")]
async fn redis_backends(
    url: String,
    cfg: &Config,
    node: &NodeId,
) -> io::Result<(Arc<dyn MessageStore>, Addr<Hub>)> {
    use encrypted_broadcast_hub::redis_bridge::{
        connect, spawn_redis_publisher, spawn_redis_subscriber, RedisBridgeConfig,
    };
    use encrypted_broadcast_hub::store::RedisStore;

    let bridge = RedisBridgeConfig {
        url,
        channel: cfg.channel.clone(),
    };
    let conn = connect(&bridge).await.map_err(io::Error::other)?;
    let store: Arc<dyn MessageStore> = Arc::new(RedisStore::new(conn.clone()));
    let publisher: Arc<dyn Publisher> =
        Arc::new(spawn_redis_publisher(conn, bridge.channel.clone()));

    let hub = Hub::new(node.clone(), publisher).start();
    spawn_redis_subscriber(bridge, hub.clone(), node.clone())
        .await
        .map_err(io::Error::other)?;
    Ok((store, hub))
}

#[cfg(not(feature = "redis"))]
async fn redis_backends(
    _url: String,
    _cfg: &Config,
    _node: &NodeId,
) -> io::Result<(Arc<dyn MessageStore>, Addr<Hub>)> {
    Err(invalid("REDIS_URL is set but the redis feature is disabled"))
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    std::env::set_var(
        "RUST_LOG",
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
    );
    env_logger::init();

    let cfg = Config::from_env().map_err(invalid)?;
    let codec = Arc::new(cfg.codec().map_err(invalid)?);
    let node = NodeId::random();

    let (store, hub) = match cfg.redis_url.clone() {
        Some(url) => {
            info!("using redis for history and pubsub");
            redis_backends(url, &cfg, &node).await?
        }
        None => {
            info!("REDIS_URL not set, history and pubsub are process-local");
            let pubsub = MemoryPubSub::default();
            let publisher: Arc<dyn Publisher> = Arc::new(pubsub.clone());
            let hub = Hub::new(node.clone(), publisher).start();
            spawn_bridge(pubsub.subscribe(), hub.clone(), node.clone());
            let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
            (store, hub)
        }
    };

    let ctx = SessionContext {
        hub,
        codec,
        store,
        settings: SessionSettings::from(&cfg),
    };

    info!("hub node {} listening on {}", node, cfg.bind);
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(ctx.clone()))
            .app_data(web::Data::new(node.clone()))
            .configure(routes::configure)
    })
    .bind(cfg.bind.as_str())?
    .run()
    .await
}
