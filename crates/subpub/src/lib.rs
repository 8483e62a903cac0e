//! In-process publish/subscribe bus with ordered per-subscriber delivery.
//!
//! Every subscription owns a bounded queue and a dedicated delivery worker, so
//! a slow handler only ever delays its own subscription. Publishing never
//! waits for handlers: a full queue is drained by a short-lived overflow task
//! that keeps the subscriber's FIFO order intact.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod error;
mod handler;
mod subscription;

pub use error::Error;
pub use handler::MessageHandler;
pub use subscription::Subscription;

use subscription::SubscriptionInner;

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Number of messages buffered per subscription before overflow hand-off.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

struct Registry<T> {
    closed: bool,
    subjects: HashMap<String, Vec<Arc<SubscriptionInner<T>>>>,
}

pub(crate) struct Shared<T> {
    registry: RwLock<Registry<T>>,
    task_tracker: TaskTracker,
    queue_capacity: usize,
}

impl<T> Shared<T> {
    pub(crate) fn remove(&self, subscription: &Arc<SubscriptionInner<T>>) {
        let mut registry = self.registry.write();
        let subject = subscription.subject();

        let Some(subscriptions) = registry.subjects.get_mut(subject) else {
            return;
        };

        if let Some(index) = subscriptions
            .iter()
            .position(|s| Arc::ptr_eq(s, subscription))
        {
            subscriptions.swap_remove(index);
        }

        if subscriptions.is_empty() {
            registry.subjects.remove(subject);
        }
    }
}

/// Subject-addressed publish/subscribe bus.
///
/// Cloning is cheap and yields another handle to the same bus.
pub struct SubPub<T = Bytes> {
    shared: Arc<Shared<T>>,
}

impl<T> SubPub<T>
where
    T: Clone + Send + 'static,
{
    /// Creates an open bus using [`DEFAULT_QUEUE_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates an open bus whose subscriptions buffer up to `queue_capacity`
    /// messages (at least one) before handing off to an overflow task.
    ///
    /// The capacity bounds the queue, not memory: messages beyond it wait in
    /// an unbounded per-subscription backlog. A handler that never returns
    /// makes its backlog grow with every publish until the subscription is
    /// unsubscribed or the bus is closed.
    #[must_use]
    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: RwLock::new(Registry {
                    closed: false,
                    subjects: HashMap::new(),
                }),
                task_tracker: TaskTracker::new(),
                queue_capacity: queue_capacity.max(1),
            }),
        }
    }

    /// Registers `handler` for every message published to `subject` from now
    /// on, and starts the subscription's delivery worker.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns [`Error::Closed`] if the bus has been closed.
    pub fn subscribe<S, H>(&self, subject: S, handler: H) -> Result<Subscription<T>, Error>
    where
        S: Into<String>,
        H: MessageHandler<T>,
    {
        let subject = subject.into();
        let mut registry = self.shared.registry.write();

        if registry.closed {
            return Err(Error::Closed);
        }

        let (sender, receiver) = mpsc::channel(self.shared.queue_capacity);
        let inner = Arc::new(SubscriptionInner::new(
            subject.clone(),
            sender,
            Arc::downgrade(&self.shared),
            self.shared.task_tracker.clone(),
        ));

        registry
            .subjects
            .entry(subject.clone())
            .or_default()
            .push(Arc::clone(&inner));

        // Spawned under the write lock so close can never miss a worker.
        self.shared
            .task_tracker
            .spawn(subscription::deliver(subject, receiver, handler));
        drop(registry);

        debug!(subject = %inner.subject(), "subscribed");

        Ok(Subscription::new(inner))
    }

    /// Fans `message` out to the subscriptions registered on `subject` at the
    /// time of the call. Returns without waiting for any handler.
    ///
    /// Messages for a subject without subscribers are dropped. When a
    /// subscriber's queue is full the message is handed to a background task,
    /// so this must be called from within a Tokio runtime. That backlog is
    /// unbounded; see [`Self::with_queue_capacity`].
    ///
    /// # Errors
    /// Returns [`Error::Closed`] if the bus has been closed.
    pub fn publish(&self, subject: &str, message: T) -> Result<(), Error> {
        let subscriptions = {
            let registry = self.shared.registry.read();

            if registry.closed {
                return Err(Error::Closed);
            }

            registry.subjects.get(subject).cloned().unwrap_or_default()
        };

        if let Some((last, rest)) = subscriptions.split_last() {
            for subscription in rest {
                subscription.enqueue(message.clone());
            }
            last.enqueue(message);
        }

        Ok(())
    }

    /// Closes the bus and waits for every delivery worker to drain, giving up
    /// when `cancellation_token` fires.
    ///
    /// # Errors
    /// - [`Error::Closed`] if the bus was already closed.
    /// - [`Error::Cancelled`] if the token fired first. The bus is closed
    ///   regardless and the remaining workers keep draining; see [`Self::join`].
    pub async fn close(&self, cancellation_token: CancellationToken) -> Result<(), Error> {
        self.close_until(cancellation_token.cancelled_owned(), Error::Cancelled)
            .await
    }

    /// Closes the bus and waits up to `timeout` for every delivery worker to
    /// drain.
    ///
    /// # Errors
    /// - [`Error::Closed`] if the bus was already closed.
    /// - [`Error::DeadlineExceeded`] if the timeout elapsed first. The bus is
    ///   closed regardless and the remaining workers keep draining; see
    ///   [`Self::join`].
    pub async fn close_timeout(&self, timeout: Duration) -> Result<(), Error> {
        self.close_until(tokio::time::sleep(timeout), Error::DeadlineExceeded)
            .await
    }

    async fn close_until<F>(&self, signal: F, aborted: Error) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let subscriptions: Vec<_> = {
            let mut registry = self.shared.registry.write();

            if registry.closed {
                return Err(Error::Closed);
            }
            registry.closed = true;

            registry
                .subjects
                .drain()
                .flat_map(|(_, subscriptions)| subscriptions)
                .collect()
        };

        debug!(subscriptions = subscriptions.len(), "closing bus");

        // Outside the registry lock: unsubscribe takes it again.
        for subscription in &subscriptions {
            subscription.unsubscribe();
        }
        drop(subscriptions);

        self.shared.task_tracker.close();

        tokio::select! {
            biased;
            () = signal => Err(aborted),
            () = self.shared.task_tracker.wait() => Ok(()),
        }
    }

    /// Waits until every delivery worker has exited.
    ///
    /// Only resolves after the bus has been closed. Useful after a close that
    /// gave up early, to wait for the handlers that were still running.
    pub async fn join(&self) {
        self.shared.task_tracker.wait().await;
    }

    /// Whether the bus has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.registry.read().closed
    }

    /// Number of live subscriptions on `subject`.
    #[must_use]
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.shared
            .registry
            .read()
            .subjects
            .get(subject)
            .map_or(0, Vec::len)
    }
}

impl<T> Clone for SubPub<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for SubPub<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for SubPub<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.shared.registry.read();
        f.debug_struct("SubPub")
            .field("closed", &registry.closed)
            .field("subjects", &registry.subjects.len())
            .field("queue_capacity", &self.shared.queue_capacity)
            .finish_non_exhaustive()
    }
}
