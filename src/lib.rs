//! In-process publish/subscribe message bus for a desktop media center.
//!
//! Subsystems talk to each other through a [`MessageBroker`] instead of
//! holding references to one another. Subscribers that must not slow
//! publishers down use an [`AsyncMessageQueue`], which delivers on its own
//! thread and stops itself when the application shuts down.

pub mod config;
pub mod error;
pub mod logging;
pub mod messaging;

pub use config::BusConfig;
pub use error::{AppResult, ConfigError, MessagingError};
pub use messaging::{
    AsyncMessageQueue, BrokerStats, CallbackId, HandlerResult, Message, MessageBroker,
    MessageReceiver, MessageWatcher, QueueOptions, ReceiverId, ShutdownOutcome, SystemMessageType,
    SystemState, SystemStateService, NEW_STATE, SYSTEM_CHANNEL,
};
