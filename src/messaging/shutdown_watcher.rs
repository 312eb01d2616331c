/// Lifecycle watcher owned by every [`AsyncMessageQueue`]
///
/// Shuts its queue down when the application announces `ShuttingDown` or
/// `Ending`. This runs inside the broker's fan-out and blocks until the
/// queue's delivery thread exits, which is only acceptable because lifecycle
/// changes are sent from the main thread while it holds no other locks.
///
/// [`AsyncMessageQueue`]: super::queue::AsyncMessageQueue
use std::sync::{Arc, Weak};

use super::broker::MessageReceiver;
use super::message::Message;
use super::queue::{QueueCore, ShutdownOutcome};
use super::system::SystemState;

const LOG_TARGET: &str = "media_bus::shutdown";

pub(crate) struct ShutdownWatcher {
    owner: String,
    queue: Weak<QueueCore>,
}

impl ShutdownWatcher {
    pub(super) fn new(owner: String, queue: Weak<QueueCore>) -> Self {
        Self { owner, queue }
    }
}

impl MessageReceiver for ShutdownWatcher {
    fn receive(&self, message: &Arc<Message>) {
        let Some(state) = SystemState::from_message(message) else {
            return;
        };
        if !state.is_terminal() {
            return;
        }
        let Some(queue) = self.queue.upgrade() else {
            return;
        };

        match queue.shutdown_after(message) {
            ShutdownOutcome::Completed => {
                tracing::debug!(
                    target: LOG_TARGET,
                    owner = %self.owner,
                    "Queue shut down on {}",
                    state.description()
                );
            }
            ShutdownOutcome::Deferred => {
                tracing::debug!(
                    target: LOG_TARGET,
                    owner = %self.owner,
                    "Queue shutdown on {} deferred to its delivery thread",
                    state.description()
                );
            }
        }
    }
}
