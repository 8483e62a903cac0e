use std::future::Future;

use async_trait::async_trait;

/// Processes messages delivered to a subscription.
///
/// A handler is only ever driven by its subscription's delivery worker, so
/// calls for one subscription never overlap. Handlers of different
/// subscriptions run concurrently.
#[async_trait]
pub trait MessageHandler<T>
where
    Self: Send + Sync + 'static,
    T: Send + 'static,
{
    /// Handles one delivered message.
    async fn handle(&self, message: T);
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: T) {
        (self)(message).await;
    }
}
