//! Hub binary: loads configuration, wires the cache, translator, subscription
//! manager, and the two TCP front doors, then runs until signaled to stop.
//!
//! The RTU link itself is wired against [`mtu_hub::translator::InMemoryRtuLink`]
//! pending integration with a real IEC-60870-5-104 client library — the hub
//! consumes that library only through the narrow [`mtu_hub::translator::RtuLink`]
//! trait, so swapping it in at this call site is the only change a real
//! deployment needs to make.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use mtu_hub::server::{bind_with_retries, CommandServer, PublishServer};
use mtu_hub::subscription::{periodic_aggregator, CommandHandler, SubscriberRegistry, SubscriptionManager};
use mtu_hub::translator::{InMemoryRtuLink, ProtocolTranslator, RtuLink};
use mtu_shared::cache::MessageCache;
use mtu_shared::config::{init_tracing, HubConfig};
use mtu_shared::model::{IecMsg, SubscriptionPolicy};
use mtu_shared::resilience::MtuReferenceAllocator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = HubConfig::load().context("loading hub configuration")?;
    info!(?config, "starting mtu-hub");

    let cache = Arc::new(MessageCache::new());
    let allocator = Arc::new(MtuReferenceAllocator::new());
    let translator = ProtocolTranslator::new(cache.clone(), allocator.clone());
    let subscribers = SubscriberRegistry::new();
    let link: Arc<dyn RtuLink> = Arc::new(InMemoryRtuLink::new());

    let (periodic_tx, periodic_rx) = mpsc::unbounded_channel();
    let (publish_tx, mut publish_rx) = mpsc::unbounded_channel::<IecMsg>();

    let manager = SubscriptionManager::new(
        cache.clone(),
        link.clone(),
        translator,
        SubscriptionPolicy::default(),
        subscribers.clone(),
        periodic_tx,
    );

    let stop = CancellationToken::new();
    let ctrl_c_stop = stop.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c, shutting down");
        ctrl_c_stop.cancel();
    });

    tokio::spawn(periodic_aggregator::run(
        periodic_rx,
        publish_tx,
        allocator.clone(),
        config.aggregation_window(),
    ));

    // Forwards the periodic aggregator's batched output into the same
    // publish fan-out every other message travels through.
    let forward_subscribers = subscribers.clone();
    tokio::spawn(async move {
        while let Some(msg) = publish_rx.recv().await {
            forward_subscribers.broadcast(&msg, |_, _| true);
        }
    });

    let command_handler = CommandHandler::with_breaker_config(
        cache.clone(),
        link.clone(),
        config.circuit_breaker_failure_threshold,
        std::time::Duration::from_secs(config.circuit_breaker_recovery_seconds),
    );
    let command_server = Arc::new(CommandServer::new(
        command_handler,
        config.command_worker_pool_size,
        config.command_reply_timeout(),
    ));
    let command_listener = bind_with_retries(&config.command_server_addr(), config.bind_max_attempts)
        .await
        .context("binding command server")?;

    let publish_server = Arc::new(PublishServer::new(subscribers.clone()));
    let publish_listener = bind_with_retries(&config.publish_server_addr(), config.bind_max_attempts)
        .await
        .context("binding publish server")?;

    let command_stop = stop.clone();
    let command_task = tokio::spawn(async move { command_server.run(command_listener, command_stop).await });
    let publish_stop = stop.clone();
    let publish_task = tokio::spawn(async move { publish_server.run(publish_listener, publish_stop).await });

    // `manager` is retained only to keep its Arc-backed collaborators alive
    // for the process lifetime; every callback into it happens from the
    // (not-yet-integrated) IEC-104 client library's own event loop.
    let _manager = manager;

    let _ = tokio::join!(command_task, publish_task);
    info!("mtu-hub stopped");
    Ok(())
}
