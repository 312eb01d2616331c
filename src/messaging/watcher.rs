/// One-shot message watcher
///
/// Waits on a single channel for the message a predicate accepts, typically
/// "the server with this id connected" or "the device appeared".
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::broker::MessageBroker;
use super::message::Message;
use super::queue::{AsyncMessageQueue, ShutdownOutcome};
use crate::error::MessagingError;

const LOG_TARGET: &str = "media_bus::watcher";

struct WatcherInner {
    queue: AsyncMessageQueue,
    auto_dispose: bool,
    disposed: AtomicBool,
}

/// Watches one channel with one predicate
///
/// The predicate runs on the watcher's delivery thread. When it returns
/// `true` and `auto_dispose` is set, the watcher disposes itself; the
/// predicate is not called again after that.
pub struct MessageWatcher {
    inner: Arc<WatcherInner>,
}

impl MessageWatcher {
    pub fn new<F>(
        owner: impl Into<String>,
        broker: Arc<MessageBroker>,
        channel: &str,
        auto_dispose: bool,
        handler: F,
    ) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        let queue = AsyncMessageQueue::new(owner, broker, [channel]);
        let inner = Arc::new(WatcherInner {
            queue,
            auto_dispose,
            disposed: AtomicBool::new(false),
        });

        let watcher: Weak<WatcherInner> = Arc::downgrade(&inner);
        inner.queue.on_message_received(move |message| {
            if let Some(inner) = watcher.upgrade() {
                inner.handle(message, &handler);
            }
            Ok(())
        });

        Self { inner }
    }

    /// Start watching
    pub fn start(&self) -> Result<(), MessagingError> {
        self.inner.ensure_alive("start")?;
        self.inner.queue.start()
    }

    /// Stop watching without disposing; the watcher can be started again
    pub fn shutdown(&self) -> Result<ShutdownOutcome, MessagingError> {
        self.inner.ensure_alive("shutdown")?;
        Ok(self.inner.queue.shutdown())
    }

    /// Stop watching for good. Calling it again has no effect.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub fn owner(&self) -> &str {
        self.inner.queue.owner()
    }
}

impl Drop for MessageWatcher {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl WatcherInner {
    fn ensure_alive(&self, operation: &'static str) -> Result<(), MessagingError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(MessagingError::IllegalCall {
                operation,
                owner: self.queue.owner().to_string(),
            });
        }
        Ok(())
    }

    fn handle<F>(&self, message: &Message, handler: &F)
    where
        F: Fn(&Message) -> bool,
    {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        if handler(message) && self.auto_dispose {
            tracing::debug!(
                target: LOG_TARGET,
                owner = self.queue.owner(),
                "Watched message {} handled, disposing",
                message.description()
            );
            self.dispose();
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn counting_watcher(
        broker: &Arc<MessageBroker>,
        auto_dispose: bool,
        accept: bool,
    ) -> (MessageWatcher, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let watcher = MessageWatcher::new("watcher", Arc::clone(broker), "Z", auto_dispose, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            accept
        });
        (watcher, calls)
    }

    #[test]
    fn test_auto_dispose_after_first_accepted_message() {
        let broker = Arc::new(MessageBroker::new());
        let (watcher, calls) = counting_watcher(&broker, true, true);
        watcher.start().unwrap();

        broker.send("Z", Message::new("Z", 1u32));
        assert!(wait_until(|| watcher.is_disposed()));

        broker.send("Z", Message::new("Z", 2u32));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.receiver_count("Z"), 0);
    }

    #[test]
    fn test_rejected_messages_keep_watching() {
        let broker = Arc::new(MessageBroker::new());
        let (watcher, calls) = counting_watcher(&broker, true, false);
        watcher.start().unwrap();

        broker.send("Z", Message::new("Z", 1u32));
        broker.send("Z", Message::new("Z", 2u32));

        assert!(wait_until(|| calls.load(Ordering::SeqCst) == 2));
        assert!(!watcher.is_disposed());
    }

    #[test]
    fn test_without_auto_dispose_keeps_watching() {
        let broker = Arc::new(MessageBroker::new());
        let (watcher, calls) = counting_watcher(&broker, false, true);
        watcher.start().unwrap();

        broker.send("Z", Message::new("Z", 1u32));
        broker.send("Z", Message::new("Z", 2u32));

        assert!(wait_until(|| calls.load(Ordering::SeqCst) == 2));
        assert!(!watcher.is_disposed());
        assert!(watcher.shutdown().unwrap().is_completed());
    }

    #[test]
    fn test_calls_after_dispose_are_illegal() {
        let broker = Arc::new(MessageBroker::new());
        let (watcher, _calls) = counting_watcher(&broker, true, true);
        watcher.start().unwrap();

        watcher.dispose();
        watcher.dispose();
        assert!(watcher.is_disposed());

        assert!(matches!(
            watcher.start(),
            Err(MessagingError::IllegalCall { operation: "start", .. })
        ));
        assert!(matches!(
            watcher.shutdown(),
            Err(MessagingError::IllegalCall { operation: "shutdown", .. })
        ));
    }

    #[test]
    fn test_watcher_payload_predicate() {
        let broker = Arc::new(MessageBroker::new());
        let (found_tx, found_rx) = crossbeam_channel::unbounded();
        let watcher = MessageWatcher::new("server-wait", Arc::clone(&broker), "ServerConnection", true, move |message| {
            let matched = message.get::<String>("SystemId").map(String::as_str) == Some("server-2");
            if matched {
                let _ = found_tx.send(message.message_type());
            }
            matched
        });
        watcher.start().unwrap();

        broker.send(
            "ServerConnection",
            Message::new("ServerConnection", 1u32).with("SystemId", "server-1".to_string()),
        );
        broker.send(
            "ServerConnection",
            Message::new("ServerConnection", 2u32).with("SystemId", "server-2".to_string()),
        );

        assert_eq!(found_rx.recv_timeout(TIMEOUT).unwrap(), 2);
        assert!(wait_until(|| watcher.is_disposed()));
        assert_eq!(watcher.owner(), "server-wait");
    }
}
