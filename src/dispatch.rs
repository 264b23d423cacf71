//! Event dispatcher with a statically built handler table.
//!
//! Handlers are registered once at startup against an [`EventFilter`]. A
//! filter is a membership test over [`AgentEvent`] variants, so a single event
//! may match several registered filters (e.g. [`EventFilter::Presence`] and
//! [`EventFilter::UserJoined`]).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::error::Result;
use crate::events::AgentEvent;

/// Which events a handler is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFilter {
    Any,
    UserJoined,
    UserLeft,
    /// Either [`AgentEvent::UserJoined`] or [`AgentEvent::UserLeft`].
    Presence,
    ToolRegister,
    SpeechResult,
    ModelResponse,
}

impl EventFilter {
    /// Whether `event` belongs to this filter.
    pub fn matches(self, event: &AgentEvent) -> bool {
        match self {
            Self::Any => true,
            Self::UserJoined => matches!(event, AgentEvent::UserJoined),
            Self::UserLeft => matches!(event, AgentEvent::UserLeft),
            Self::Presence => matches!(event, AgentEvent::UserJoined | AgentEvent::UserLeft),
            Self::ToolRegister => matches!(event, AgentEvent::ToolRegister { .. }),
            Self::SpeechResult => matches!(event, AgentEvent::SpeechResult(_)),
            Self::ModelResponse => matches!(event, AgentEvent::ModelResponse(_)),
        }
    }
}

/// A registered event handler.
///
/// Returning [`AgentError::Cancelled`](crate::error::AgentError::Cancelled)
/// aborts the whole dispatch; any other error is logged and swallowed.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &AgentEvent) -> Result<()>;
}

#[async_trait]
impl<T: EventHandler + ?Sized> EventHandler for Arc<T> {
    async fn handle(&self, event: &AgentEvent) -> Result<()> {
        (**self).handle(event).await
    }
}

/// Collects registrations before the table is frozen.
#[derive(Default)]
pub struct DispatcherBuilder {
    entries: Vec<(EventFilter, Vec<Arc<dyn EventHandler>>)>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the list for `filter`.
    ///
    /// Filters keep the order in which they were first registered.
    pub fn on(mut self, filter: EventFilter, handler: Arc<dyn EventHandler>) -> Self {
        if let Some((_, handlers)) = self.entries.iter_mut().find(|(f, _)| *f == filter) {
            handlers.push(handler);
        } else {
            self.entries.push((filter, vec![handler]));
        }
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            entries: Arc::from(self.entries),
        }
    }
}

/// Immutable filter → handlers table. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    entries: Arc<[(EventFilter, Vec<Arc<dyn EventHandler>>)]>,
}

impl Dispatcher {
    /// Deliver `event` to every matching handler, sequentially.
    ///
    /// # Errors
    ///
    /// Only [`AgentError::Cancelled`](crate::error::AgentError::Cancelled)
    /// escapes; other handler failures are logged.
    pub async fn dispatch(&self, event: &AgentEvent) -> Result<()> {
        for (filter, handlers) in self.entries.iter() {
            if !filter.matches(event) {
                continue;
            }
            for handler in handlers {
                match handler.handle(event).await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => {
                        debug!(event = event.name(), "dispatch cancelled");
                        return Err(e);
                    }
                    Err(e) => {
                        error!(event = event.name(), ?filter, error = %e, "event handler failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Number of registered handlers across all filters.
    pub fn handler_count(&self) -> usize {
        self.entries.iter().map(|(_, h)| h.len()).sum()
    }
}
