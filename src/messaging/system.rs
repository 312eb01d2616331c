/// Application lifecycle channel
///
/// Any component can subscribe to [`SYSTEM_CHANNEL`] to follow the process
/// lifecycle without depending on the application's entry point.
use std::sync::Arc;

use parking_lot::RwLock;

use super::broker::MessageBroker;
use super::message::Message;

const LOG_TARGET: &str = "media_bus::system";

/// Reserved lifecycle channel
pub const SYSTEM_CHANNEL: &str = "SystemMessaging";

/// Payload key holding the new [`SystemState`]
pub const NEW_STATE: &str = "NewState";

/// Message types sent on [`SYSTEM_CHANNEL`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SystemMessageType {
    SystemStateChanged = 1,
}

impl From<SystemMessageType> for u32 {
    fn from(value: SystemMessageType) -> Self {
        value as u32
    }
}

/// Application state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SystemState {
    #[default]
    Initializing,
    Running,
    Suspending,
    Resuming,
    Hibernating,
    /// Application exit has begun
    ShuttingDown,
    /// Last state before the process ends
    Ending,
}

impl SystemState {
    /// States after which lifecycle-subscribed queues stop delivering
    pub fn is_terminal(&self) -> bool {
        matches!(self, SystemState::ShuttingDown | SystemState::Ending)
    }

    pub fn description(&self) -> &'static str {
        match self {
            SystemState::Initializing => "Initializing",
            SystemState::Running => "Running",
            SystemState::Suspending => "Suspending",
            SystemState::Resuming => "Resuming",
            SystemState::Hibernating => "Hibernating",
            SystemState::ShuttingDown => "Shutting down",
            SystemState::Ending => "Ending",
        }
    }

    /// Build the `SystemStateChanged` message announcing this state
    pub fn message(self) -> Message {
        Message::new(SYSTEM_CHANNEL, SystemMessageType::SystemStateChanged).with(NEW_STATE, self)
    }

    /// Extract the announced state from a lifecycle message
    pub fn from_message(message: &Message) -> Option<Self> {
        if message.channel_name() != SYSTEM_CHANNEL
            || message.message_type() != u32::from(SystemMessageType::SystemStateChanged)
        {
            return None;
        }
        message.get::<SystemState>(NEW_STATE).copied()
    }
}

/// Tracks the current application state and announces every change
pub struct SystemStateService {
    broker: Arc<MessageBroker>,
    current: RwLock<SystemState>,
}

impl SystemStateService {
    /// Create the service in the `Initializing` state
    pub fn new(broker: Arc<MessageBroker>) -> Self {
        Self {
            broker,
            current: RwLock::new(SystemState::Initializing),
        }
    }

    pub fn current(&self) -> SystemState {
        *self.current.read()
    }

    /// Switch to `state` and send the change on [`SYSTEM_CHANNEL`]
    ///
    /// Terminal states block until every lifecycle-watching queue has shut
    /// down, so this must be called from the main thread without holding
    /// locks other components need.
    pub fn switch_to(&self, state: SystemState) {
        let previous = std::mem::replace(&mut *self.current.write(), state);
        tracing::info!(
            target: LOG_TARGET,
            "System state: {} -> {}",
            previous.description(),
            state.description()
        );
        self.broker.send(SYSTEM_CHANNEL, state.message());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::broker::MessageReceiver;
    use parking_lot::Mutex;

    struct StateRecorder {
        states: Mutex<Vec<SystemState>>,
    }

    impl MessageReceiver for StateRecorder {
        fn receive(&self, message: &Arc<Message>) {
            if let Some(state) = SystemState::from_message(message) {
                self.states.lock().push(state);
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(SystemState::ShuttingDown.is_terminal());
        assert!(SystemState::Ending.is_terminal());
        assert!(!SystemState::Running.is_terminal());
        assert!(!SystemState::Suspending.is_terminal());
        assert_eq!(SystemState::default(), SystemState::Initializing);
    }

    #[test]
    fn test_state_message_parsing() {
        let message = SystemState::Hibernating.message();
        assert_eq!(message.channel_name(), SYSTEM_CHANNEL);
        assert_eq!(
            SystemState::from_message(&message),
            Some(SystemState::Hibernating)
        );

        let other = Message::new("Workflow", 1u32).with(NEW_STATE, SystemState::Ending);
        assert_eq!(SystemState::from_message(&other), None);
    }

    #[test]
    fn test_state_service_announces_changes() {
        let broker = Arc::new(MessageBroker::new());
        let service = SystemStateService::new(Arc::clone(&broker));
        let recorder = Arc::new(StateRecorder {
            states: Mutex::new(Vec::new()),
        });
        broker.register_receiver(SYSTEM_CHANNEL, &recorder);

        assert_eq!(service.current(), SystemState::Initializing);
        service.switch_to(SystemState::Running);
        service.switch_to(SystemState::Suspending);

        assert_eq!(service.current(), SystemState::Suspending);
        assert_eq!(
            *recorder.states.lock(),
            vec![SystemState::Running, SystemState::Suspending]
        );
    }
}
