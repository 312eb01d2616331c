/// Messaging core
///
/// In-process publish/subscribe bus connecting otherwise independent
/// subsystems.
///
/// ## Architecture
///
/// ```text
/// ┌───────────┐  send(channel, msg)  ┌───────────────┐  receive()  ┌──────────────────┐
/// │ Publisher │ ───────────────────> │ MessageBroker │ ──────────> │ AsyncMessageQueue│
/// │ (any      │                      │ (weak         │  publisher  │   FIFO           │
/// │  thread)  │                      │  registry)    │  thread     └──────────────────┘
/// └───────────┘                      └───────────────┘                      │
///                                                                           │ delivery thread
///                                                                           ▼
///                                                                     ┌──────────┐
///                                                                     │ Handlers │
///                                                                     └──────────┘
/// ```
///
/// Every queue also owns a shutdown watcher on [`SYSTEM_CHANNEL`] that stops
/// it once the application announces `ShuttingDown` or `Ending`.
///
/// ## Usage
///
/// ```rust,ignore
/// let broker = Arc::new(MessageBroker::new());
///
/// let queue = AsyncMessageQueue::new("ServerConnectionManager", Arc::clone(&broker), [SYSTEM_CHANNEL]);
/// queue.on_message_received(|message| {
///     if let Some(state) = SystemState::from_message(message) {
///         tracing::info!("New state: {}", state.description());
///     }
///     Ok(())
/// });
/// queue.start()?;
///
/// broker.send(SYSTEM_CHANNEL, SystemState::Running.message());
/// ```
use std::any::Any;

pub mod broker;
pub mod message;
pub mod queue;
mod shutdown_watcher;
pub mod system;
pub mod watcher;

// Re-export commonly used types
pub use broker::{BrokerStats, MessageBroker, MessageReceiver, ReceiverId};
pub use message::{Message, PayloadValue};
pub use queue::{AsyncMessageQueue, CallbackId, HandlerResult, QueueOptions, ShutdownOutcome};
pub use system::{SystemMessageType, SystemState, SystemStateService, NEW_STATE, SYSTEM_CHANNEL};
pub use watcher::MessageWatcher;

/// Priority type accepted by [`QueueOptions::priority`]
pub use thread_priority::ThreadPriority;

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
