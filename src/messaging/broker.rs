use parking_lot::Mutex;
/// Message broker for in-process pub/sub
///
/// Maps channel names to weakly held receivers and fans every sent message
/// out to them on the sender's thread.
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::message::Message;
use super::panic_message;

const LOG_TARGET: &str = "media_bus::broker";

/// Anything that can be registered on a channel
///
/// `receive` runs on the publisher's thread and must return quickly.
pub trait MessageReceiver: Send + Sync {
    fn receive(&self, message: &Arc<Message>);
}

/// Identity of a registered receiver (the address of its allocation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId(usize);

impl ReceiverId {
    pub fn of<T: ?Sized>(receiver: &T) -> Self {
        Self(receiver as *const T as *const () as usize)
    }

    fn of_weak(receiver: &Weak<dyn MessageReceiver>) -> Self {
        Self(receiver.as_ptr() as *const () as usize)
    }
}

/// Counters collected by the broker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Number of `send` calls
    pub sent: usize,
    /// Number of `receive` invocations that returned normally
    pub delivered: usize,
    /// Number of `receive` invocations that panicked
    pub faults: usize,
}

type Registry = HashMap<Arc<str>, Vec<Weak<dyn MessageReceiver>>>;

/// Broker for sending messages to channel receivers
pub struct MessageBroker {
    registry: Mutex<Registry>,
    sent: AtomicUsize,
    delivered: AtomicUsize,
    faults: AtomicUsize,
}

impl MessageBroker {
    /// Create a new broker with no registrations
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            sent: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
            faults: AtomicUsize::new(0),
        }
    }

    /// Register a receiver on a channel
    ///
    /// The broker only keeps a weak reference. Registering the same receiver
    /// twice on one channel has no effect.
    pub fn register_receiver<R>(&self, channel: &str, receiver: &Arc<R>)
    where
        R: MessageReceiver + 'static,
    {
        let weak: Weak<R> = Arc::downgrade(receiver);
        self.register_weak(channel, weak);
    }

    /// Register an already downgraded receiver on a channel
    pub fn register_weak(&self, channel: &str, receiver: Weak<dyn MessageReceiver>) {
        let id = ReceiverId::of_weak(&receiver);
        let mut registry = self.registry.lock();

        let entries = registry.entry(Arc::from(channel)).or_default();

        if entries.iter().any(|entry| ReceiverId::of_weak(entry) == id) {
            return;
        }
        entries.push(receiver);
        tracing::trace!(target: LOG_TARGET, channel, "Receiver registered");
    }

    /// Remove a receiver from a channel, if it is registered there
    pub fn unregister_receiver<R>(&self, channel: &str, receiver: &Arc<R>)
    where
        R: ?Sized,
    {
        self.unregister_id(channel, ReceiverId::of(&**receiver));
    }

    /// Remove a receiver by identity
    ///
    /// Used on teardown paths where only `&self` of the receiver is at hand.
    pub fn unregister_id(&self, channel: &str, id: ReceiverId) {
        let mut registry = self.registry.lock();
        let Some(entries) = registry.get_mut(channel) else {
            return;
        };

        entries.retain(|entry| ReceiverId::of_weak(entry) != id);
        if entries.is_empty() {
            registry.remove(channel);
        }
    }

    /// Send a message to every live receiver of `channel`
    ///
    /// Receivers run on the calling thread, in no particular order. The
    /// registry lock is only held while the receiver list is copied, so a
    /// receiver may register or unregister receivers from inside `receive`.
    /// Such changes apply to the next `send`, never to the one in progress.
    pub fn send(&self, channel: &str, message: impl Into<Arc<Message>>) {
        let message = message.into();
        self.sent.fetch_add(1, Ordering::Relaxed);

        let (receivers, has_stale) = {
            let registry = self.registry.lock();
            let Some(entries) = registry.get(channel) else {
                tracing::trace!(
                    target: LOG_TARGET,
                    channel,
                    message_type = message.message_type(),
                    "No receivers registered"
                );
                return;
            };

            let receivers: Vec<Arc<dyn MessageReceiver>> =
                entries.iter().filter_map(Weak::upgrade).collect();
            let has_stale = receivers.len() != entries.len();
            (receivers, has_stale)
        };

        for (index, receiver) in receivers.iter().enumerate() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| receiver.receive(&message)));
            match result {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(payload) => {
                    self.faults.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        target: LOG_TARGET,
                        channel,
                        message_type = message.message_type(),
                        receiver = index,
                        "Receiver panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
        }

        // Release the snapshot before pruning so receivers dropped during
        // the fan-out are seen as dead.
        drop(receivers);
        if has_stale {
            self.prune(channel);
        }
    }

    fn prune(&self, channel: &str) {
        let mut registry = self.registry.lock();
        let Some(entries) = registry.get_mut(channel) else {
            return;
        };

        let before = entries.len();
        entries.retain(|entry| entry.strong_count() > 0);
        tracing::trace!(
            target: LOG_TARGET,
            channel,
            pruned = before - entries.len(),
            "Pruned dead receivers"
        );

        if entries.is_empty() {
            registry.remove(channel);
        }
    }

    /// Number of live receivers registered on a channel
    pub fn receiver_count(&self, channel: &str) -> usize {
        self.registry
            .lock()
            .get(channel)
            .map(|entries| entries.iter().filter(|e| e.strong_count() > 0).count())
            .unwrap_or(0)
    }

    /// Channels that currently have at least one registration
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .registry
            .lock()
            .keys()
            .map(|key| key.to_string())
            .collect();
        channels.sort_unstable();
        channels
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }

    /// Drop every registration (process teardown)
    pub fn shutdown(&self) {
        let mut registry = self.registry.lock();
        let channels = registry.len();
        registry.clear();
        tracing::debug!(target: LOG_TARGET, channels, "Message broker shut down");
    }
}

impl Default for MessageBroker {
    fn default() -> Self {
        Self::new()
    }
}
