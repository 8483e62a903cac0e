use crate::Shared;
use crate::handler::MessageHandler;

use std::any::Any;
use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace};

/// Handle to a live subscription on a [`SubPub`](crate::SubPub) bus.
///
/// Dropping the handle does not unsubscribe; the subscription stays
/// registered until [`Subscription::unsubscribe`] is called or the bus is
/// closed.
pub struct Subscription<T = Bytes> {
    inner: Arc<SubscriptionInner<T>>,
}

impl<T> Subscription<T> {
    pub(crate) const fn new(inner: Arc<SubscriptionInner<T>>) -> Self {
        Self { inner }
    }

    /// Removes the subscription from the bus and stops its delivery worker.
    ///
    /// Messages that were already accepted for this subscription are still
    /// delivered; nothing published after this call returns is. Calling it
    /// again has no effect.
    pub fn unsubscribe(&self) {
        self.inner.unsubscribe();
    }

    /// The subject this subscription listens on.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    /// Returns `false` once the subscription has been unsubscribed, either
    /// explicitly or by closing the bus.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.inner.unsubscribed.load(Ordering::Acquire)
    }
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.inner.subject)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Enqueue state guarded by the per-subscription ordering lock.
struct Outbox<T> {
    /// `None` once the queue has been closed.
    sender: Option<mpsc::Sender<T>>,

    /// Messages waiting behind a full queue, oldest first.
    backlog: VecDeque<T>,

    /// Set while an overflow task owns delivery into the queue.
    overflowing: bool,
}

pub(crate) struct SubscriptionInner<T> {
    subject: String,
    outbox: Mutex<Outbox<T>>,
    unsubscribed: AtomicBool,
    bus: Weak<Shared<T>>,
    task_tracker: TaskTracker,
}

impl<T> SubscriptionInner<T> {
    pub(crate) fn new(
        subject: String,
        sender: mpsc::Sender<T>,
        bus: Weak<Shared<T>>,
        task_tracker: TaskTracker,
    ) -> Self {
        Self {
            subject,
            outbox: Mutex::new(Outbox {
                sender: Some(sender),
                backlog: VecDeque::new(),
                overflowing: false,
            }),
            unsubscribed: AtomicBool::new(false),
            bus,
            task_tracker,
        }
    }

    pub(crate) fn subject(&self) -> &str {
        &self.subject
    }

    pub(crate) fn unsubscribe(self: &Arc<Self>) {
        if self.unsubscribed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self);
        }

        // Dropping the outbox sender closes the queue once any overflow task
        // has handed over its backlog.
        self.outbox.lock().sender = None;

        debug!(subject = %self.subject, "unsubscribed");
    }
}

impl<T> SubscriptionInner<T>
where
    T: Send + 'static,
{
    /// Places a message in the queue without ever waiting on the consumer.
    ///
    /// A full queue hands the message to an overflow task. Until that task has
    /// moved its backlog into the queue, later messages join the backlog
    /// rather than the queue, so they cannot overtake it.
    pub(crate) fn enqueue(self: &Arc<Self>, message: T) {
        let mut outbox = self.outbox.lock();

        if outbox.overflowing {
            if outbox.sender.is_some() {
                outbox.backlog.push_back(message);
            }
            return;
        }

        let result = match &outbox.sender {
            Some(sender) => sender.try_send(message),
            None => return,
        };

        match result {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                let Some(sender) = outbox.sender.clone() else {
                    return;
                };

                trace!(subject = %self.subject, "queue full, handing off to overflow task");

                outbox.backlog.push_back(message);
                outbox.overflowing = true;
                drop(outbox);

                self.task_tracker.spawn(Arc::clone(self).run_overflow(sender));
            }
            // Worker is gone; nothing left to deliver to.
            Err(TrySendError::Closed(_)) => {}
        }
    }

    async fn run_overflow(self: Arc<Self>, sender: mpsc::Sender<T>) {
        loop {
            let next = {
                let mut outbox = self.outbox.lock();
                let next = outbox.backlog.pop_front();
                if next.is_none() {
                    outbox.overflowing = false;
                }
                next
            };

            let Some(message) = next else {
                break;
            };

            if sender.send(message).await.is_err() {
                let mut outbox = self.outbox.lock();
                outbox.backlog.clear();
                outbox.overflowing = false;
                break;
            }
        }
    }
}

/// Delivery worker: feeds queued messages to the handler one at a time until
/// the queue is closed and empty.
pub(crate) async fn deliver<T, H>(subject: String, mut receiver: mpsc::Receiver<T>, handler: H)
where
    T: Send + 'static,
    H: MessageHandler<T>,
{
    while let Some(message) = receiver.recv().await {
        if let Err(panic) = AssertUnwindSafe(handler.handle(message))
            .catch_unwind()
            .await
        {
            error!(
                subject = %subject,
                panic = %panic_message(&*panic),
                "subscription handler panicked"
            );
        }
    }

    debug!(subject = %subject, "delivery worker exited");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use crate::SubPub;

    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_unsubscribe_with_pending_backlog() {
        let bus = SubPub::<usize>::with_queue_capacity(1);
        let gate = CancellationToken::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let handler_gate = gate.clone();
        let sink = Arc::clone(&received);
        let subscription = bus
            .subscribe("topic", move |message: usize| {
                let gate = handler_gate.clone();
                let sink = Arc::clone(&sink);
                async move {
                    gate.cancelled().await;
                    sink.lock().push(message);
                }
            })
            .unwrap();

        // A publisher that took its snapshot before the unsubscribe.
        let inner = Arc::clone(&subscription.inner);

        for i in 0..10 {
            bus.publish("topic", i).unwrap();
        }
        assert!(inner.outbox.lock().overflowing);

        subscription.unsubscribe();

        for i in 100..110 {
            bus.publish("topic", i).unwrap();
            inner.enqueue(i);
        }
        {
            let outbox = inner.outbox.lock();
            assert!(outbox.sender.is_none());
            assert!(outbox.backlog.iter().all(|&message| message < 100));
        }

        gate.cancel();
        bus.close_timeout(Duration::from_secs(5)).await.unwrap();

        assert_eq!(*received.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_enqueue_after_close_is_dropped() {
        let bus = SubPub::<usize>::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&received);
        let subscription = bus
            .subscribe("topic", move |message: usize| {
                sink.lock().push(message);
                std::future::ready(())
            })
            .unwrap();
        let inner = Arc::clone(&subscription.inner);

        bus.publish("topic", 1).unwrap();
        bus.close_timeout(Duration::from_secs(1)).await.unwrap();

        inner.enqueue(2);
        bus.join().await;

        assert_eq!(*received.lock(), vec![1]);
        assert!(inner.outbox.lock().backlog.is_empty());
    }
}
