//! Event dispatch for the user aggregate.
//!
//! A single [`EventPublisher`] is built at process start and handed to the
//! use-case layer. Aggregates never own a sink; they drain into whichever
//! publisher the caller passes, so tests can swap in a [`CapturingSink`].

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use super::aggregates::User;
use super::events::UserEvent;
use crate::error::IdentityError;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Sink closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<PublishError> for IdentityError {
    fn from(err: PublishError) -> Self {
        IdentityError::Publish(err.to_string())
    }
}

/// Transport for encoded events.
///
/// `publish` hands the message off without waiting for downstream
/// durability; delivery failures after the hand-off are the sink's concern.
pub trait EventSink: Send + Sync {
    fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), PublishError>;
}

/// Process-wide publication handle
#[derive(Clone, Default)]
pub struct EventPublisher {
    sink: Option<Arc<dyn EventSink>>,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Publisher that drops every event
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Publish one event. Failures are logged, never returned.
    pub fn publish(&self, event: &UserEvent) {
        let Some(sink) = &self.sink else {
            return;
        };

        let subject = event.subject();
        let payload = match event.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(subject = %subject, error = %e, "Failed to encode user event");
                return;
            }
        };

        match sink.publish(&subject, &payload) {
            Ok(()) => debug!(subject = %subject, "Published user event"),
            Err(e) => warn!(subject = %subject, error = %e, "Failed to publish user event"),
        }
    }

    /// Publish events in order, returning how many were drained
    pub fn publish_all(&self, events: Vec<UserEvent>) -> usize {
        let count = events.len();
        for event in &events {
            self.publish(event);
        }
        count
    }

    /// Open a flush scope around a user
    pub fn track<'p>(&'p self, user: &'p mut User) -> Pending<'p> {
        Pending {
            user,
            publisher: self,
        }
    }
}

/// Scope guard that flushes a user's buffered events exactly once.
///
/// The flush happens when the guard is dropped, so events recorded before an
/// early `?` return are still published.
pub struct Pending<'p> {
    user: &'p mut User,
    publisher: &'p EventPublisher,
}

impl Pending<'_> {
    /// Flush now and close the scope
    pub fn commit(self) -> usize {
        let mut this = std::mem::ManuallyDrop::new(self);
        let publisher = this.publisher;
        this.user.notify(publisher)
    }
}

impl Deref for Pending<'_> {
    type Target = User;

    fn deref(&self) -> &User {
        self.user
    }
}

impl DerefMut for Pending<'_> {
    fn deref_mut(&mut self) -> &mut User {
        self.user
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.user.notify(self.publisher);
    }
}

/// In-memory sink recording every published message
#[derive(Debug, Default)]
pub struct CapturingSink {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.lock()
            .iter()
            .map(|(subject, _)| subject.clone())
            .collect()
    }

    /// Decode everything captured so far
    pub fn events(&self) -> crate::error::Result<Vec<UserEvent>> {
        self.lock()
            .iter()
            .map(|(subject, payload)| UserEvent::decode(subject, payload))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, Vec<u8>)>> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EventSink for CapturingSink {
    fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.lock().push((subject.to_string(), payload.to_vec()));
        Ok(())
    }
}
