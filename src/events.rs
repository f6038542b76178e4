//! Synchronous in-process event bus.
//!
//! Observers are registered once at startup, per event kind, and run in
//! registration order. A failing observer is logged and skipped; it never
//! reverts the change that produced the event and never stops the others.
//! Observers must not block on I/O: long-running work is handed to a
//! background task (see `analytics_client::AnalyticsQueue`).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    CheckResource, DeclineReason, ReportResource, Transition, User, UserState,
    VerificationResponse,
};
use crate::state_machine::StateMachine;
use crate::store::Store;

/// Kinds observers subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    UserTransitioned,
    ResponseReceived,
    ResourceUpdated,
    UserStatusUpdated,
}

/// Mirrored document provider resource.
#[derive(Debug, Clone)]
pub enum Resource {
    Check(CheckResource),
    Report(ReportResource),
}

impl Resource {
    pub fn id(&self) -> &str {
        match self {
            Resource::Check(c) => &c.id,
            Resource::Report(r) => &r.id,
        }
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Resource::Check(c) => c.user_id,
            Resource::Report(r) => r.user_id,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    /// Published after the new state is durable. `user` is the committed snapshot.
    UserTransitioned { user: User, transition: Transition },
    /// Published once per stored identity provider response, correlated or not.
    ResponseReceived(VerificationResponse),
    /// Published on every upsert of a check or report.
    ResourceUpdated(Resource),
    /// Published once per check completion after the result is copied onto the user.
    UserStatusUpdated { user_id: Uuid, status: Option<String> },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::UserTransitioned { .. } => EventKind::UserTransitioned,
            Event::ResponseReceived(_) => EventKind::ResponseReceived,
            Event::ResourceUpdated(_) => EventKind::ResourceUpdated,
            Event::UserStatusUpdated { .. } => EventKind::UserStatusUpdated,
        }
    }
}

/// Handle given to observers while an event is being dispatched.
pub struct EventContext<'a> {
    machine: &'a StateMachine,
    depth: usize,
}

impl<'a> EventContext<'a> {
    pub(crate) fn new(machine: &'a StateMachine, depth: usize) -> Self {
        Self { machine, depth }
    }

    pub fn store(&self) -> &dyn Store {
        self.machine.store()
    }

    /// Nesting level of the dispatch this observer runs in.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Re-enters the state machine for a nested transition of the same user.
    pub async fn transition(
        &self,
        user_id: Uuid,
        target: UserState,
        reason: Option<DeclineReason>,
        detail: Option<String>,
    ) -> Result<UserState, AppError> {
        self.machine
            .transition_at_depth(user_id, None, target, reason, detail, self.depth)
            .await
            .map(|outcome| outcome.settled)
    }
}

#[async_trait]
pub trait Observer: Send + Sync {
    /// Used in logs when the observer fails.
    fn name(&self) -> &'static str;

    async fn notify(&self, event: &Event, ctx: &EventContext<'_>) -> anyhow::Result<()>;
}

/// Ordered subscriber lists keyed by event kind.
#[derive(Default)]
pub struct EventDispatcher {
    subscribers: HashMap<EventKind, Vec<Arc<dyn Observer>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, kind: EventKind, observer: Arc<dyn Observer>) -> &mut Self {
        tracing::debug!("Subscribing {} to {:?}", observer.name(), kind);
        self.subscribers.entry(kind).or_default().push(observer);
        self
    }

    /// Names of the observers for `kind`, in dispatch order.
    pub fn subscribers(&self, kind: EventKind) -> Vec<&'static str> {
        self.subscribers
            .get(&kind)
            .map(|list| list.iter().map(|o| o.name()).collect())
            .unwrap_or_default()
    }

    pub async fn publish(&self, event: &Event, ctx: &EventContext<'_>) {
        let Some(observers) = self.subscribers.get(&event.kind()) else {
            return;
        };

        for observer in observers {
            if let Err(e) = observer.notify(event, ctx).await {
                tracing::error!(
                    "Observer {} failed on {:?}: {:#}",
                    observer.name(),
                    event.kind(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl Observer for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn notify(&self, _event: &Event, _ctx: &EventContext<'_>) -> anyhow::Result<()> {
            self.seen.lock().push(self.name);
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_in_order_and_isolates_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        for (name, fail) in [("first", false), ("failing", true), ("last", false)] {
            dispatcher.subscribe(
                EventKind::ResponseReceived,
                Arc::new(Recorder {
                    name,
                    seen: seen.clone(),
                    fail,
                }),
            );
        }
        assert_eq!(
            dispatcher.subscribers(EventKind::ResponseReceived),
            vec!["first", "failing", "last"]
        );
        assert!(dispatcher.subscribers(EventKind::ResourceUpdated).is_empty());

        let machine = StateMachine::new(Arc::new(MemoryStore::new()), dispatcher, 4);
        machine
            .publish(Event::ResponseReceived(VerificationResponse::empty("R")))
            .await;

        assert_eq!(*seen.lock(), vec!["first", "failing", "last"]);
    }

    #[tokio::test]
    async fn test_other_kinds_not_delivered() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        dispatcher.subscribe(
            EventKind::ResourceUpdated,
            Arc::new(Recorder {
                name: "resources",
                seen: seen.clone(),
                fail: false,
            }),
        );

        let machine = StateMachine::new(Arc::new(MemoryStore::new()), dispatcher, 4);
        machine
            .publish(Event::UserStatusUpdated {
                user_id: Uuid::new_v4(),
                status: None,
            })
            .await;
        assert!(seen.lock().is_empty());
    }
}
