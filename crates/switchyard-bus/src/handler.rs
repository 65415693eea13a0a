use crate::message::{MessageContent, Priority};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use switchyard_core::SwitchyardResult;

/// Receives the messages of one subscription.
///
/// An `Err` (or a panic) marks the delivery as failed; what happens next
/// depends on the subscription's acknowledgement mode.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: MessageContent) -> SwitchyardResult<()>;
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(MessageContent) -> Fut + Send + Sync,
    Fut: Future<Output = SwitchyardResult<()>> + Send,
{
    async fn handle(&self, message: MessageContent) -> SwitchyardResult<()> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(MessageContent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SwitchyardResult<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Per-subscription delivery settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Auto mode acks every delivery, failed or not. Manual mode naks
    /// failures for redelivery until the message's retries run out.
    pub auto_ack: bool,
    pub priority: Priority,
    /// Handler invocations allowed to run at once for this subscription.
    pub max_concurrent: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            auto_ack: true,
            priority: Priority::Normal,
            max_concurrent: 10,
        }
    }
}

impl SubscribeOptions {
    pub fn manual_ack(mut self) -> Self {
        self.auto_ack = false;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }
}
