/// Asynchronous subscriber queue
///
/// Decouples publishers from message handlers: the broker pushes messages
/// into the queue on the publisher's thread and a dedicated delivery thread
/// runs the handlers later.
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use thread_priority::{set_current_thread_priority, ThreadPriority};

use super::broker::{MessageBroker, MessageReceiver, ReceiverId};
use super::message::Message;
use super::panic_message;
use super::shutdown_watcher::ShutdownWatcher;
use super::system::{SystemState, SYSTEM_CHANNEL};
use crate::error::MessagingError;

const LOG_TARGET: &str = "media_bus::queue";

/// Result returned by message handlers
pub type HandlerResult = anyhow::Result<()>;

type ReceivedHandler = Arc<dyn Fn(&Message) -> HandlerResult + Send + Sync>;
type PreviewCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Handle returned when a callback is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Delivery thread settings
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Thread name; defaults to `msgq-<owner>`
    pub thread_name: Option<String>,
    /// Stack size in bytes; the platform default when unset
    pub stack_size: Option<usize>,
    /// OS priority applied by the delivery thread when it starts
    pub priority: Option<ThreadPriority>,
}

/// How a call to [`AsyncMessageQueue::shutdown`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The delivery thread has exited
    Completed,
    /// Called on the delivery thread itself; it exits once the current
    /// handler returns, and messages still queued may be undelivered
    Deferred,
}

impl ShutdownOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ShutdownOutcome::Completed)
    }
}

/// One started generation of the delivery thread
struct DeliveryRun {
    /// Dropped on terminate or seal, which wakes and releases the thread
    inbox: Option<Sender<Arc<Message>>>,
    terminated: Arc<AtomicBool>,
    /// Disconnects when the delivery thread exits
    exited: Receiver<()>,
    worker: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl DeliveryRun {
    fn is_running(&self) -> bool {
        matches!(self.exited.try_recv(), Err(TryRecvError::Empty))
    }
}

struct QueueState {
    channels: Vec<String>,
    received: Vec<(CallbackId, ReceivedHandler)>,
    previews: Vec<(CallbackId, PreviewCallback)>,
    next_callback: u64,
    started: bool,
    terminated: bool,
    /// Set by `shutdown_after`; later messages are dropped
    sealed: bool,
    run: Option<DeliveryRun>,
    /// Earlier generations still finishing a handler after a restart issued
    /// from their own thread
    retired: Vec<DeliveryRun>,
}

pub(super) struct QueueCore {
    owner: String,
    broker: Arc<MessageBroker>,
    options: QueueOptions,
    state: Mutex<QueueState>,
    watcher: Arc<ShutdownWatcher>,
    this: Weak<QueueCore>,
}

/// Message queue with its own delivery thread
///
/// Nothing is delivered before [`start`](Self::start): the queue registers
/// on its channels only then. Dropping the queue shuts it down.
pub struct AsyncMessageQueue {
    core: Arc<QueueCore>,
}

impl AsyncMessageQueue {
    /// Create a queue for `owner` subscribed to `channels`
    pub fn new<I, S>(owner: impl Into<String>, broker: Arc<MessageBroker>, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_options(owner, broker, channels, QueueOptions::default())
    }

    pub fn with_options<I, S>(
        owner: impl Into<String>,
        broker: Arc<MessageBroker>,
        channels: I,
        options: QueueOptions,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let owner = owner.into();
        let mut unique: Vec<String> = Vec::new();
        for channel in channels.into_iter().map(Into::into) {
            if !unique.contains(&channel) {
                unique.push(channel);
            }
        }

        let core = Arc::new_cyclic(|this: &Weak<QueueCore>| QueueCore {
            watcher: Arc::new(ShutdownWatcher::new(owner.clone(), this.clone())),
            owner,
            broker,
            options,
            state: Mutex::new(QueueState {
                channels: unique,
                received: Vec::new(),
                previews: Vec::new(),
                next_callback: 0,
                started: false,
                terminated: false,
                sealed: false,
                run: None,
                retired: Vec::new(),
            }),
            this: this.clone(),
        });

        Self { core }
    }

    /// Register on the broker and spawn the delivery thread
    ///
    /// Does nothing when already started. A terminated queue can be started
    /// again.
    pub fn start(&self) -> Result<(), MessagingError> {
        self.core.start()
    }

    /// Stop delivering and unregister from the broker without waiting
    pub fn terminate(&self) {
        self.core.terminate();
    }

    /// Terminate and wait for the delivery thread to exit
    ///
    /// When called from a handler running on the delivery thread this cannot
    /// wait for itself and returns [`ShutdownOutcome::Deferred`].
    pub fn shutdown(&self) -> ShutdownOutcome {
        self.core.terminate();
        self.core.join_delivery_thread()
    }

    /// Add a handler invoked on the delivery thread for every message
    ///
    /// Errors and panics are logged and do not stop delivery.
    pub fn on_message_received<F>(&self, handler: F) -> CallbackId
    where
        F: Fn(&Message) -> HandlerResult + Send + Sync + 'static,
    {
        let handler: ReceivedHandler = Arc::new(handler);
        let mut state = self.core.state.lock();
        let id = state.next_callback_id();
        state.received.push((id, handler));
        id
    }

    /// Add a callback invoked on the publisher's thread as messages arrive
    ///
    /// Preview callbacks run inside the broker's fan-out and must not block.
    pub fn on_preview<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let callback: PreviewCallback = Arc::new(callback);
        let mut state = self.core.state.lock();
        let id = state.next_callback_id();
        state.previews.push((id, callback));
        id
    }

    /// Remove a handler or preview callback; returns whether it was found
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut state = self.core.state.lock();
        let before = state.received.len() + state.previews.len();
        state.received.retain(|(entry, _)| *entry != id);
        state.previews.retain(|(entry, _)| *entry != id);
        before != state.received.len() + state.previews.len()
    }

    /// Subscribe to another channel; takes effect immediately when started
    pub fn subscribe_to_channel(&self, channel: &str) {
        let register = {
            let mut state = self.core.state.lock();
            if state.channels.iter().any(|c| c == channel) {
                return;
            }
            state.channels.push(channel.to_string());
            state.started
        };

        if register {
            self.core.broker.register_weak(channel, self.core.receiver());
        }
    }

    pub fn unsubscribe_from_channel(&self, channel: &str) {
        let unregister = {
            let mut state = self.core.state.lock();
            let before = state.channels.len();
            state.channels.retain(|c| c != channel);
            before != state.channels.len() && state.started
        };

        if unregister {
            self.core.broker.unregister_id(channel, self.core.id());
        }
    }

    /// Messages waiting for the delivery thread
    pub fn pending_count(&self) -> usize {
        self.core
            .state
            .lock()
            .run
            .as_ref()
            .and_then(|run| run.inbox.as_ref())
            .map(Sender::len)
            .unwrap_or(0)
    }

    pub fn is_started(&self) -> bool {
        self.core.state.lock().started
    }

    pub fn is_terminated(&self) -> bool {
        self.core.state.lock().terminated
    }

    pub fn owner(&self) -> &str {
        &self.core.owner
    }

    pub fn channels(&self) -> Vec<String> {
        self.core.state.lock().channels.clone()
    }
}

impl Drop for AsyncMessageQueue {
    fn drop(&mut self) {
        let outcome = self.shutdown();
        tracing::trace!(target: LOG_TARGET, owner = %self.core.owner, ?outcome, "Queue dropped");
    }
}

impl QueueState {
    fn next_callback_id(&mut self) -> CallbackId {
        self.next_callback += 1;
        CallbackId(self.next_callback)
    }
}

impl QueueCore {
    fn id(&self) -> ReceiverId {
        ReceiverId::of(self)
    }

    fn receiver(&self) -> Weak<dyn MessageReceiver> {
        self.this.clone()
    }

    fn start(&self) -> Result<(), MessagingError> {
        if self.state.lock().started {
            return Ok(());
        }
        // At most one generation runs handlers. A restart issued from the
        // previous delivery thread cannot wait for itself.
        self.join_delivery_thread();

        let channels = {
            let mut state = self.state.lock();
            if state.started {
                return Ok(());
            }

            let (inbox, messages) = unbounded();
            let (exited_tx, exited) = unbounded::<()>();
            let terminated = Arc::new(AtomicBool::new(false));

            let worker = DeliveryWorker {
                owner: self.owner.clone(),
                queue: self.this.clone(),
                messages,
                terminated: Arc::clone(&terminated),
                priority: self.options.priority,
                _exited: exited_tx,
            };

            let name = self
                .options
                .thread_name
                .clone()
                .unwrap_or_else(|| format!("msgq-{}", self.owner));
            let mut builder = thread::Builder::new().name(name);
            if let Some(stack_size) = self.options.stack_size {
                builder = builder.stack_size(stack_size);
            }

            let handle = builder
                .spawn(move || worker.run())
                .map_err(|source| MessagingError::ThreadSpawn {
                    owner: self.owner.clone(),
                    source,
                })?;

            if let Some(previous) = state.run.take() {
                if previous.is_running() {
                    state.retired.push(previous);
                }
            }
            state.run = Some(DeliveryRun {
                inbox: Some(inbox),
                terminated,
                exited,
                thread_id: handle.thread().id(),
                worker: Some(handle),
            });
            state.started = true;
            state.terminated = false;
            state.sealed = false;
            state.channels.clone()
        };

        for channel in &channels {
            self.broker.register_weak(channel, self.receiver());
        }
        self.broker.register_receiver(SYSTEM_CHANNEL, &self.watcher);

        tracing::debug!(
            target: LOG_TARGET,
            owner = %self.owner,
            ?channels,
            "Message queue started"
        );
        Ok(())
    }

    fn terminate(&self) {
        let channels = {
            let mut state = self.state.lock();
            if !state.started {
                return;
            }
            state.started = false;
            state.terminated = true;
            if let Some(run) = state.run.as_mut() {
                run.terminated.store(true, Ordering::Release);
                run.inbox = None;
            }
            state.channels.clone()
        };

        self.unregister_all(&channels);
        tracing::debug!(target: LOG_TARGET, owner = %self.owner, "Message queue terminated");
    }

    /// Stop accepting messages but let the delivery thread drain what is
    /// already queued, ending with `terminal` when this queue listens on the
    /// lifecycle channel.
    pub(super) fn shutdown_after(&self, terminal: &Arc<Message>) -> ShutdownOutcome {
        let channels = {
            let mut state = self.state.lock();
            if state.started {
                let listens = state.channels.iter().any(|c| c == SYSTEM_CHANNEL);
                let inbox = state.run.as_mut().and_then(|run| run.inbox.take());
                if let Some(inbox) = inbox {
                    if listens {
                        let _ = inbox.send(Arc::clone(terminal));
                    }
                }
                state.sealed = true;
                state.started = false;
                state.terminated = true;
                Some(state.channels.clone())
            } else {
                None
            }
        };

        if let Some(channels) = channels {
            self.unregister_all(&channels);
            tracing::debug!(
                target: LOG_TARGET,
                owner = %self.owner,
                "Message queue sealed by {}",
                terminal.description()
            );
        }
        self.join_delivery_thread()
    }

    fn unregister_all(&self, channels: &[String]) {
        let id = self.id();
        for channel in channels {
            self.broker.unregister_id(channel, id);
        }
        self.broker.unregister_receiver(SYSTEM_CHANNEL, &self.watcher);
    }

    /// Wait for every delivery thread generation except the caller's own
    fn join_delivery_thread(&self) -> ShutdownOutcome {
        let current = thread::current().id();
        let mut outcome = ShutdownOutcome::Completed;
        let waits = {
            let mut state = self.state.lock();
            let QueueState { run, retired, .. } = &mut *state;
            let mut waits = Vec::new();
            for run in retired.iter_mut().chain(run.as_mut()) {
                if run.thread_id == current {
                    outcome = ShutdownOutcome::Deferred;
                } else {
                    waits.push((run.exited.clone(), run.worker.take()));
                }
            }
            waits
        };

        if outcome == ShutdownOutcome::Deferred {
            tracing::debug!(
                target: LOG_TARGET,
                owner = %self.owner,
                "Called on the delivery thread, not waiting for it"
            );
        }

        // Every waiter blocks until the thread drops its end of `exited`;
        // only the first one also reaps the thread.
        for (exited, worker) in waits {
            let _ = exited.recv();
            if let Some(worker) = worker {
                if worker.join().is_err() {
                    tracing::error!(target: LOG_TARGET, owner = %self.owner, "Delivery thread panicked");
                }
            }
        }

        self.state.lock().retired.retain(DeliveryRun::is_running);
        outcome
    }

    fn dispatch(&self, message: &Message) {
        let handlers: Vec<ReceivedHandler> = self
            .state
            .lock()
            .received
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        owner = %self.owner,
                        channel = message.channel_name(),
                        message_type = message.message_type(),
                        "Message handler failed: {:#}",
                        err
                    );
                }
                Err(payload) => {
                    tracing::error!(
                        target: LOG_TARGET,
                        owner = %self.owner,
                        channel = message.channel_name(),
                        message_type = message.message_type(),
                        "Message handler panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
    }
}

impl MessageReceiver for QueueCore {
    fn receive(&self, message: &Arc<Message>) {
        let (previews, terminal) = {
            let state = self.state.lock();
            if state.sealed {
                tracing::trace!(target: LOG_TARGET, owner = %self.owner, "Dropped message after shutdown");
                return;
            }
            let Some(inbox) = state.run.as_ref().and_then(|run| run.inbox.as_ref()) else {
                tracing::trace!(target: LOG_TARGET, owner = %self.owner, "Dropped message, queue not running");
                return;
            };
            // A terminal lifecycle message is queued by `shutdown_after`,
            // which also seals the inbox behind it.
            let terminal = state.channels.iter().any(|c| c == SYSTEM_CHANNEL)
                && SystemState::from_message(message).is_some_and(|s| s.is_terminal());
            if !terminal && inbox.send(Arc::clone(message)).is_err() {
                return;
            }
            let previews: Vec<PreviewCallback> =
                state.previews.iter().map(|(_, cb)| Arc::clone(cb)).collect();
            (previews, terminal)
        };

        for preview in previews {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| preview(message))) {
                tracing::error!(
                    target: LOG_TARGET,
                    owner = %self.owner,
                    channel = message.channel_name(),
                    message_type = message.message_type(),
                    "Preview callback panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }

        if terminal {
            let outcome = self.shutdown_after(message);
            tracing::trace!(target: LOG_TARGET, owner = %self.owner, ?outcome, "Queue shut down by lifecycle message");
        }
    }
}

/// State moved onto the delivery thread
struct DeliveryWorker {
    owner: String,
    queue: Weak<QueueCore>,
    messages: Receiver<Arc<Message>>,
    terminated: Arc<AtomicBool>,
    priority: Option<ThreadPriority>,
    _exited: Sender<()>,
}

impl DeliveryWorker {
    fn run(self) {
        tracing::debug!(target: LOG_TARGET, owner = %self.owner, "Delivery thread started");

        if let Some(priority) = self.priority {
            if let Err(err) = set_current_thread_priority(priority) {
                tracing::warn!(
                    target: LOG_TARGET,
                    owner = %self.owner,
                    "Could not set delivery thread priority {:?}: {:?}",
                    priority,
                    err
                );
            }
        }

        // `recv` wakes for a new message or when the inbox sender is
        // dropped; queued messages are still handed out after the drop.
        while let Ok(message) = self.messages.recv() {
            if self.terminated.load(Ordering::Acquire) {
                break;
            }
            let Some(queue) = self.queue.upgrade() else {
                break;
            };
            queue.dispatch(&message);
        }

        tracing::debug!(target: LOG_TARGET, owner = %self.owner, "Delivery thread stopped");
    }
}
