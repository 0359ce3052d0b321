use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use super::{ReleaseToken, Resource};
use crate::effect::{BoxError, BoxFuture};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("topic `{0}` is closed")]
pub struct TopicClosed(pub &'static str);

/// In-process fan-out channel.
///
/// Every subscriber sees every message published after it subscribed. A slow
/// subscriber that falls `capacity` messages behind skips ahead. Release
/// closes the topic: receivers drain what is buffered and then see the end of
/// the stream.
pub struct Topic<T> {
    name: &'static str,
    sender: Mutex<Option<broadcast::Sender<T>>>,
}

impl<T: Clone + Send + 'static> Topic<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { name, sender: Mutex::new(Some(sender)) }
    }

    /// Sends `message` to every current subscriber; returns how many there were.
    pub fn publish(&self, message: T) -> Result<usize, TopicClosed> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(TopicClosed(self.name))?;
        // No subscribers is not a failure for a fan-out topic.
        Ok(sender.send(message).unwrap_or(0))
    }

    pub fn subscribe(&self) -> Result<broadcast::Receiver<T>, TopicClosed> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(broadcast::Sender::subscribe).ok_or(TopicClosed(self.name))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: Send + 'static> Resource for Topic<T> {
    fn release(&self, _token: ReleaseToken) -> BoxFuture<'_, Result<(), BoxError>> {
        let dropped = self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sender) = dropped {
            debug!(topic = self.name, receivers = sender.receiver_count(), "topic closed");
        }
        Box::pin(std::future::ready(Ok(())))
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast::error::RecvError;

    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_messages_then_close() {
        let topic = Topic::new("events", 8);
        let mut rx = topic.subscribe().unwrap();

        assert_eq!(topic.publish("a".to_owned()), Ok(1));
        topic.release(ReleaseToken(())).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "a");
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn test_publish_after_release_fails() {
        let topic = Topic::<u32>::new("events", 8);
        assert_eq!(topic.publish(1), Ok(0));

        topic.release(ReleaseToken(())).await.unwrap();
        assert_eq!(topic.publish(2), Err(TopicClosed("events")));
        assert!(topic.subscribe().is_err());
    }
}
