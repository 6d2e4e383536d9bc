use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voxchannel::application::metrics::init_metrics;
use voxchannel::application::{CallLifecycleCoordinator, IncomingCall, LoggingCallbacks};
use voxchannel::config::{Config, StorageBackend};
use voxchannel::domain::call::{CallSession, CallStateStore, KeyValueStore};
use voxchannel::domain::shared::events::DomainEvent;
use voxchannel::domain::shared::value_objects::{ChannelId, Uid};
use voxchannel::domain::transport::OfflineReason;
use voxchannel::infrastructure::persistence::{FileKeyValueStore, MemoryKeyValueStore};
use voxchannel::infrastructure::transport::SimulatedTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting VoxChannel presence demo");
    info!("Configuration loaded: {:?}", config);

    let prometheus_handle = init_metrics()?;

    let kv: Arc<dyn KeyValueStore> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryKeyValueStore::new()),
        StorageBackend::File => {
            let store = FileKeyValueStore::open(&config.storage.path)?;
            info!("Call state file: {}", store.path().display());
            Arc::new(store)
        }
    };
    info!("Call state backend: {:?}", config.storage.backend);

    let transport = Arc::new(SimulatedTransport::new());
    let coordinator = CallLifecycleCoordinator::spawn(
        transport.clone(),
        CallStateStore::new(kv.clone()),
        Arc::new(LoggingCallbacks),
        &config.presence,
    );

    let mut events = coordinator.subscribe();
    let event_logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(
                    seq = event.metadata().sequence,
                    channel = ?event.channel_id(),
                    "Call event {}: {:?}",
                    event.event_type(),
                    event
                ),
                Err(RecvError::Lagged(missed)) => warn!(missed, "Call event logger fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let settle = config.presence.discovery_delay() + Duration::from_millis(200);

    demo_occupied_call(&coordinator, &transport, settle).await?;
    demo_empty_channel(&coordinator, settle).await?;
    demo_stale_recovery(&coordinator, &kv).await?;

    coordinator.shutdown().await;
    event_logger.abort();

    info!("Metrics:\n{}", prometheus_handle.render());
    info!("VoxChannel demo finished");
    Ok(())
}

fn call(channel: &str, uid: u32, caller: &str) -> anyhow::Result<IncomingCall> {
    Ok(IncomingCall {
        channel_id: ChannelId::parse(channel)?,
        token: format!("{}-token", channel),
        local_uid: Uid::new(uid),
        caller_display_name: caller.to_string(),
        caller_photo_url: None,
    })
}

/// A peer joins during the discovery window, then leaves mid-call
async fn demo_occupied_call(
    coordinator: &CallLifecycleCoordinator,
    transport: &SimulatedTransport,
    settle: Duration,
) -> anyhow::Result<()> {
    info!("=== Occupied Channel Demo ===");

    let incoming = call("room-2", 7, "Bob")?;
    let channel_id = incoming.channel_id.clone();
    coordinator.incoming_call(incoming).await;
    coordinator.accept().await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    transport.add_peer(&channel_id, Uid::new(99));
    tokio::time::sleep(settle).await;
    info!("Snapshot: {:?}", coordinator.snapshot().await);

    transport.remove_peer(&channel_id, Uid::new(99), OfflineReason::Quit);
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("Snapshot after last peer left: {:?}", coordinator.snapshot().await);
    Ok(())
}

/// Nobody else shows up, so the channel is left without surfacing a call
async fn demo_empty_channel(
    coordinator: &CallLifecycleCoordinator,
    settle: Duration,
) -> anyhow::Result<()> {
    info!("=== Empty Channel Demo ===");

    coordinator.join_channel(call("room-1", 5, "Carol")?).await;
    tokio::time::sleep(settle).await;
    info!("Snapshot: {:?}", coordinator.snapshot().await);

    let outcome = coordinator.hang_up().await;
    info!("Hang up after auto-leave: {:?}", outcome);
    Ok(())
}

/// A call persisted as active before a crash is probed and discarded
async fn demo_stale_recovery(
    coordinator: &CallLifecycleCoordinator,
    kv: &Arc<dyn KeyValueStore>,
) -> anyhow::Result<()> {
    info!("=== Stale Recovery Demo ===");

    let store = CallStateStore::new(kv.clone());
    let session = CallSession::incoming(
        ChannelId::parse("room-3")?,
        "room-3-token".to_string(),
        Uid::new(11),
        "Dave".to_string(),
        None,
    );
    store.save_incoming(&session)?;
    store.mark_active(Uid::new(11));

    let outcome = coordinator.resume_from_background(false).await;
    info!("Recovery outcome: {:?}", outcome);
    info!("Persisted call after recovery: {:?}", store.current().is_some());
    Ok(())
}
