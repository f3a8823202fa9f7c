//! # Save Notifications
//!
//! Saves from child contexts finish asynchronously on the primary context's
//! worker, so their outcome cannot be returned to the caller. The [`Notifier`]
//! broadcasts it instead, on two topics:
//!
//! | Topic | Name | Payload |
//! |-------|------|---------|
//! | [`SaveTopic::Succeeded`] | `layerdb.save-succeeded` | generation, context id |
//! | [`SaveTopic::Failed`] | `layerdb.save-error` | generation, context id, [`ErrorInfo`] |
//!
//! A second, internal channel carries [`CommitNotice`]s: one per store commit,
//! naming the entities it touched. Observation handles listen there.
//!
//! ## Rust Concepts
//!
//! - **`tokio::sync::broadcast`**: every current receiver gets its own clone of
//!   each event, exactly once. Subscribing is just creating a receiver and
//!   unsubscribing is dropping it.
//! - Receivers that fall behind the buffer get `RecvError::Lagged(n)`, surfaced
//!   here as `Error::Lagged(n)` so the subscriber can decide how to recover.
//!
//! ```text
//!  primary worker ──publish──► broadcast::Sender<SaveEvent>
//!                                 │        │        │
//!                                 ▼        ▼        ▼
//!                              sub A    sub B    sub C   (each sees every event)
//! ```

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

use crate::error::{Error, ErrorInfo, Result};
use crate::types::{ContextId, Generation};

/// Default capacity of each broadcast buffer.
pub const DEFAULT_NOTIFY_CAPACITY: usize = 1024;

// =============================================================================
// Events
// =============================================================================

/// The two save topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SaveTopic {
    Succeeded,
    Failed,
}

impl SaveTopic {
    /// The published notification name.
    pub fn name(&self) -> &'static str {
        match self {
            SaveTopic::Succeeded => "layerdb.save-succeeded",
            SaveTopic::Failed => "layerdb.save-error",
        }
    }
}

/// Outcome of one `save()` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveEvent {
    pub generation: Generation,
    pub context_id: ContextId,
    /// Present exactly when the save failed.
    pub error: Option<ErrorInfo>,
}

impl SaveEvent {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn topic(&self) -> SaveTopic {
        if self.is_success() {
            SaveTopic::Succeeded
        } else {
            SaveTopic::Failed
        }
    }

    /// True if this event reports the save identified by `ticket`.
    pub fn concerns(&self, ticket: &SaveTicket) -> bool {
        self.context_id == ticket.context_id && self.generation == ticket.generation
    }
}

/// Identifies one save, returned by `Context::save` so the caller can wait for
/// its event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SaveTicket {
    pub context_id: ContextId,
    pub generation: Generation,
}

/// A store commit, as seen by observation handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitNotice {
    pub generation: Generation,
    pub entities: BTreeSet<String>,
}

// =============================================================================
// Notifier
// =============================================================================

/// Process-wide publish/subscribe hub for save and commit events.
///
/// Cloning a `Notifier` yields another handle onto the same channels.
#[derive(Debug, Clone)]
pub struct Notifier {
    saves: broadcast::Sender<SaveEvent>,
    commits: broadcast::Sender<CommitNotice>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFY_CAPACITY)
    }
}

impl Notifier {
    /// Creates a notifier whose buffers hold `capacity` events each.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (saves, _) = broadcast::channel(capacity);
        let (commits, _) = broadcast::channel(capacity);
        Self { saves, commits }
    }

    /// Subscribes to both save topics.
    pub fn subscribe(&self) -> SaveSubscription {
        SaveSubscription {
            receiver: self.saves.subscribe(),
            topic: None,
        }
    }

    /// Subscribes to one save topic.
    pub fn subscribe_topic(&self, topic: SaveTopic) -> SaveSubscription {
        SaveSubscription {
            receiver: self.saves.subscribe(),
            topic: Some(topic),
        }
    }

    /// Number of live save subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.saves.receiver_count()
    }

    pub(crate) fn subscribe_commits(&self) -> broadcast::Receiver<CommitNotice> {
        self.commits.subscribe()
    }

    pub(crate) fn publish_succeeded(&self, context_id: ContextId, generation: Generation) {
        debug!(%context_id, %generation, topic = SaveTopic::Succeeded.name(), "save event");
        // An error here only means nobody is listening.
        let _ = self.saves.send(SaveEvent {
            generation,
            context_id,
            error: None,
        });
    }

    pub(crate) fn publish_failed(&self, context_id: ContextId, generation: Generation, err: &Error) {
        warn!(%context_id, %generation, code = err.code(), error = %err, "save failed");
        let _ = self.saves.send(SaveEvent {
            generation,
            context_id,
            error: Some(ErrorInfo::from(err)),
        });
    }

    pub(crate) fn publish_commit(&self, notice: CommitNotice) {
        let _ = self.commits.send(notice);
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// A receiver of save events, optionally restricted to one topic.
///
/// Dropping the subscription unsubscribes.
pub struct SaveSubscription {
    receiver: broadcast::Receiver<SaveEvent>,
    topic: Option<SaveTopic>,
}

impl SaveSubscription {
    fn wants(&self, event: &SaveEvent) -> bool {
        self.topic.map_or(true, |t| t == event.topic())
    }

    /// Receives the next event.
    ///
    /// # Returns
    ///
    /// - `Some(Ok(event))` - Next event
    /// - `Some(Err(Error::Lagged(n)))` - `n` events were missed
    /// - `None` - The notifier is gone
    pub async fn next(&mut self) -> Option<Result<SaveEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.wants(&event) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => return Some(Err(Error::Lagged(n))),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Receives the next event without waiting. `None` means nothing is ready.
    pub fn try_next(&mut self) -> Option<Result<SaveEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.wants(&event) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => return Some(Err(Error::Lagged(n))),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Blocks the current thread until the next event.
    ///
    /// Must not be called from inside an async runtime.
    pub fn next_blocking(&mut self) -> Option<Result<SaveEvent>> {
        loop {
            match self.receiver.blocking_recv() {
                Ok(event) if self.wants(&event) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => return Some(Err(Error::Lagged(n))),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Blocks until the event for `ticket` arrives, whichever topic it is on.
    ///
    /// Events for other saves are consumed and discarded.
    ///
    /// # Errors
    ///
    /// - `Error::Timeout` if nothing matching arrives in time
    /// - `Error::Lagged` if the ticket's event may have been missed
    /// - `Error::Closed` if the notifier is gone
    pub fn wait_for(&mut self, ticket: &SaveTicket, timeout: Duration) -> Result<SaveEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.concerns(ticket) => return Ok(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => return Err(Error::Lagged(n)),
                Err(TryRecvError::Closed) => {
                    return Err(Error::Closed("notifier closed".to_string()))
                }
                Err(TryRecvError::Empty) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout(timeout));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    /// Converts the subscription into a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<SaveEvent>> {
        futures::stream::unfold(self, |mut sub| async move {
            let item = sub.next().await?;
            Some((item, sub))
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn ctx(n: u64) -> ContextId {
        ContextId::from_raw(n)
    }

    #[test]
    fn test_every_subscriber_sees_each_event_once() {
        let notifier = Notifier::new(16);
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        notifier.publish_succeeded(ctx(1), Generation::from_raw(1));

        assert!(a.try_next().unwrap().unwrap().is_success());
        assert!(b.try_next().unwrap().unwrap().is_success());
        assert!(a.try_next().is_none());
        assert!(b.try_next().is_none());
    }

    #[test]
    fn test_topic_filter() {
        let notifier = Notifier::new(16);
        let mut failures = notifier.subscribe_topic(SaveTopic::Failed);

        notifier.publish_succeeded(ctx(1), Generation::from_raw(1));
        notifier.publish_failed(
            ctx(1),
            Generation::from_raw(2),
            &Error::Closed("worker stopped".into()),
        );

        let event = failures.try_next().unwrap().unwrap();
        assert_eq!(event.generation.as_raw(), 2);
        assert_eq!(event.topic().name(), "layerdb.save-error");
        assert_eq!(event.error.unwrap().code, 402);
        assert!(failures.try_next().is_none());
    }

    #[test]
    fn test_subscribe_and_drop() {
        let notifier = Notifier::new(4);
        let sub = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 1);
        drop(sub);
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn test_lagged_subscriber() {
        let notifier = Notifier::new(2);
        let mut sub = notifier.subscribe();
        for g in 1..=5 {
            notifier.publish_succeeded(ctx(1), Generation::from_raw(g));
        }
        assert!(matches!(sub.try_next(), Some(Err(Error::Lagged(_)))));
    }

    #[test]
    fn test_wait_for_ticket() {
        let notifier = Notifier::new(16);
        let mut sub = notifier.subscribe();
        let ticket = SaveTicket {
            context_id: ctx(2),
            generation: Generation::from_raw(1),
        };

        notifier.publish_succeeded(ctx(3), Generation::from_raw(1));
        notifier.publish_succeeded(ctx(2), Generation::from_raw(1));

        let event = sub.wait_for(&ticket, Duration::from_secs(1)).unwrap();
        assert!(event.concerns(&ticket));

        let missing = SaveTicket {
            context_id: ctx(9),
            generation: Generation::from_raw(1),
        };
        let err = sub.wait_for(&missing, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_stream_delivery() {
        let notifier = Notifier::new(16);
        let mut stream = Box::pin(notifier.subscribe().into_stream());

        notifier.publish_succeeded(ctx(1), Generation::from_raw(7));

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.generation.as_raw(), 7);
    }
}
