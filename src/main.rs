use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use media_bus::logging::{initialize_tracing, log_runtime_environment};
use media_bus::{
    AppResult, AsyncMessageQueue, BusConfig, Message, MessageBroker, MessageWatcher, SystemState,
    SystemStateService, SYSTEM_CHANNEL,
};

const LOG_TARGET: &str = "media_bus::demo";

const SERVER_CONNECTION_CHANNEL: &str = "ServerConnection";
const DEVICE_CHANNEL: &str = "DeviceDiscovery";
const DEVICE_NAME: &str = "FriendlyName";
const SYSTEM_ID: &str = "SystemId";

/// Composition root: wires a few stand-in subsystems to one broker and runs
/// the application lifecycle from start to exit.
fn main() -> AppResult<()> {
    let config = BusConfig::load().unwrap_or_else(|e| {
        eprintln!("Warning: {}; using default configuration", e);
        BusConfig::default()
    });
    initialize_tracing(&config);
    log_runtime_environment();

    let broker = Arc::new(MessageBroker::new());
    let system = SystemStateService::new(Arc::clone(&broker));

    // Server connectivity follows both the lifecycle and connection news
    let connections = AsyncMessageQueue::with_options(
        "ServerConnectionManager",
        Arc::clone(&broker),
        [SYSTEM_CHANNEL, SERVER_CONNECTION_CHANNEL],
        config.queue_options("server-connection"),
    );
    connections.on_message_received(|message| {
        if let Some(state) = SystemState::from_message(message) {
            tracing::info!(target: LOG_TARGET, "Connection manager sees state {}", state.description());
        } else if let Some(system_id) = message.get::<String>(SYSTEM_ID) {
            tracing::info!(target: LOG_TARGET, "Home server {} attached", system_id);
        }
        Ok(())
    });
    connections.start()?;

    // Wait for the first renderer found by device discovery
    let (found_tx, found_rx) = crossbeam_channel::bounded(1);
    let renderer_watcher = MessageWatcher::new(
        "RendererWatcher",
        Arc::clone(&broker),
        DEVICE_CHANNEL,
        true,
        move |message| match message.get::<String>(DEVICE_NAME) {
            Some(name) => {
                let _ = found_tx.try_send(name.clone());
                true
            }
            None => false,
        },
    );
    renderer_watcher.start()?;

    system.switch_to(SystemState::Running);

    let discovery = {
        let broker = Arc::clone(&broker);
        thread::Builder::new()
            .name("device-discovery".to_string())
            .spawn(move || {
                for name in ["Living Room TV", "Kitchen Speaker"] {
                    broker.send(
                        DEVICE_CHANNEL,
                        Message::new(DEVICE_CHANNEL, 1u32).with(DEVICE_NAME, name.to_string()),
                    );
                    thread::sleep(Duration::from_millis(20));
                }
            })?
    };

    broker.send(
        SERVER_CONNECTION_CHANNEL,
        Message::new(SERVER_CONNECTION_CHANNEL, 1u32).with(SYSTEM_ID, "home-server".to_string()),
    );

    match found_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(name) => tracing::info!(target: LOG_TARGET, "First renderer: {}", name),
        Err(_) => tracing::warn!(target: LOG_TARGET, "No renderer announced"),
    }

    discovery
        .join()
        .map_err(|_| anyhow!("device discovery thread panicked"))?;

    system.switch_to(SystemState::ShuttingDown);
    system.switch_to(SystemState::Ending);

    let stats = broker.stats();
    tracing::info!(
        target: LOG_TARGET,
        "Broker stats: {} sent, {} delivered, {} faults",
        stats.sent,
        stats.delivered,
        stats.faults
    );
    broker.shutdown();
    Ok(())
}
