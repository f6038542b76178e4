//! User lifecycle state machine.
//!
//! `transition` persists the new state with a conditional write, dispatches
//! `UserTransitioned` to every observer, then re-reads the user and returns
//! the settled state. Observers may transition the same user again from
//! inside their callback, so callers must branch on the returned state, not
//! on the one they asked for. No table of legal edges is enforced here.

use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::events::{Event, EventContext, EventDispatcher};
use crate::models::{DeclineReason, Transition, UserState};
use crate::store::{StateUpdate, Store};

/// What happened to a transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOutcome {
    /// State read just before the write.
    pub previous: UserState,
    pub requested: UserState,
    /// State read after dispatch completed.
    pub settled: UserState,
    /// False when a concurrent writer moved the user first or the depth limit was hit.
    pub committed: bool,
}

impl TransitionOutcome {
    /// The write happened and nothing diverted the user afterwards.
    pub fn reached_target(&self) -> bool {
        self.committed && self.settled == self.requested
    }
}

pub struct StateMachine {
    store: Arc<dyn Store>,
    events: EventDispatcher,
    max_depth: usize,
}

impl StateMachine {
    pub fn new(store: Arc<dyn Store>, events: EventDispatcher, max_depth: usize) -> Self {
        Self {
            store,
            events,
            max_depth,
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn store_handle(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Moves the user to `target` and returns the settled state.
    pub async fn transition(
        &self,
        user_id: Uuid,
        target: UserState,
        reason: Option<DeclineReason>,
        detail: Option<String>,
    ) -> Result<UserState, AppError> {
        self.try_transition(user_id, target, reason, detail)
            .await
            .map(|outcome| outcome.settled)
    }

    /// Same as [`transition`](Self::transition) but reports whether the write won.
    pub async fn try_transition(
        &self,
        user_id: Uuid,
        target: UserState,
        reason: Option<DeclineReason>,
        detail: Option<String>,
    ) -> Result<TransitionOutcome, AppError> {
        self.transition_at_depth(user_id, None, target, reason, detail, 0)
            .await
    }

    /// Moves the user to `target` only if it is currently in `expected`.
    /// Any other current state is reported uncommitted, without a write or an event.
    pub async fn try_transition_from(
        &self,
        user_id: Uuid,
        expected: UserState,
        target: UserState,
        reason: Option<DeclineReason>,
        detail: Option<String>,
    ) -> Result<TransitionOutcome, AppError> {
        self.transition_at_depth(user_id, Some(expected), target, reason, detail, 0)
            .await
    }

    /// Publishes a non-transition event outside of any dispatch.
    pub async fn publish(&self, event: Event) {
        let ctx = EventContext::new(self, 0);
        self.events.publish(&event, &ctx).await;
    }

    pub(crate) async fn transition_at_depth(
        &self,
        user_id: Uuid,
        expected: Option<UserState>,
        target: UserState,
        reason: Option<DeclineReason>,
        detail: Option<String>,
        depth: usize,
    ) -> Result<TransitionOutcome, AppError> {
        let user = self.store.get_user(user_id).await?;
        let previous = user.state;

        if depth >= self.max_depth {
            tracing::error!(
                "Transition depth limit reached for user {}: {} -> {} refused",
                user_id,
                previous,
                target
            );
            return Ok(TransitionOutcome {
                previous,
                requested: target,
                settled: previous,
                committed: false,
            });
        }

        if let Some(expected) = expected.filter(|e| *e != previous) {
            tracing::info!(
                "User {} is {}, not {}; {} refused",
                user_id,
                previous,
                expected,
                target
            );
            return Ok(TransitionOutcome {
                previous,
                requested: target,
                settled: previous,
                committed: false,
            });
        }

        let committed = self
            .store
            .compare_and_set_state(
                user_id,
                StateUpdate {
                    expected: expected.unwrap_or(previous),
                    target,
                    decline_reason: reason,
                    detail,
                },
            )
            .await?;

        if !committed {
            let current = self.store.get_user(user_id).await?.state;
            tracing::warn!(
                "Lost transition race for user {}: wanted {} -> {}, now {}",
                user_id,
                previous,
                target,
                current
            );
            return Ok(TransitionOutcome {
                previous,
                requested: target,
                settled: current,
                committed: false,
            });
        }

        tracing::info!("User {} transitioned {} -> {}", user_id, previous, target);

        let snapshot = self.store.get_user(user_id).await?;
        let event = Event::UserTransitioned {
            user: snapshot,
            transition: Transition {
                from: previous,
                to: target,
            },
        };
        let ctx = EventContext::new(self, depth + 1);
        self.events.publish(&event, &ctx).await;

        let settled = self.store.get_user(user_id).await?.state;
        if settled != target {
            tracing::info!(
                "User {} settled in {} after requesting {}",
                user_id,
                settled,
                target
            );
        }

        Ok(TransitionOutcome {
            previous,
            requested: target,
            settled,
            committed: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, Observer};
    use crate::models::{NewUser, SocialHandles};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn sample_user() -> NewUser {
        NewUser {
            email: "user@example.com".into(),
            eth_address: None,
            eth_amount: None,
            telegram: None,
            first_name: "Homer".into(),
            last_name: "Simpson".into(),
            dob: None,
            phone: "+61412345678".into(),
            address: "742 Evergreen".into(),
            city: "Springfield".into(),
            state_code: None,
            zip_code: "12345".into(),
            country_code: Some("AU".into()),
            ip: None,
            ip_country: None,
            dfp: None,
            confirmed_location: true,
            socials: SocialHandles::default(),
        }
    }

    /// Declines anyone who reaches `trigger`.
    struct AutoDecline {
        trigger: UserState,
    }

    #[async_trait]
    impl Observer for AutoDecline {
        fn name(&self) -> &'static str {
            "auto_decline"
        }

        async fn notify(&self, event: &Event, ctx: &EventContext<'_>) -> anyhow::Result<()> {
            if let Event::UserTransitioned { user, transition } = event {
                if transition.to == self.trigger {
                    ctx.transition(user.id, UserState::Declined, Some(DeclineReason::DeclineAdmin), None)
                        .await?;
                }
            }
            Ok(())
        }
    }

    /// Bounces between two states forever.
    struct PingPong;

    #[async_trait]
    impl Observer for PingPong {
        fn name(&self) -> &'static str {
            "ping_pong"
        }

        async fn notify(&self, event: &Event, ctx: &EventContext<'_>) -> anyhow::Result<()> {
            if let Event::UserTransitioned { user, transition } = event {
                let next = if transition.to == UserState::ApprovedCap {
                    UserState::ApprovedNoCap
                } else {
                    UserState::ApprovedCap
                };
                ctx.transition(user.id, next, None, None).await?;
            }
            Ok(())
        }
    }

    struct SeenTransitions(Arc<Mutex<Vec<Transition>>>);

    #[async_trait]
    impl Observer for SeenTransitions {
        fn name(&self) -> &'static str {
            "seen"
        }

        async fn notify(&self, event: &Event, _ctx: &EventContext<'_>) -> anyhow::Result<()> {
            if let Event::UserTransitioned { user, transition } = event {
                assert_eq!(user.state, transition.to);
                self.0.lock().push(*transition);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_transition_returns_settled_state() {
        let store = Arc::new(MemoryStore::new());
        let user = store.insert_user(sample_user()).await.unwrap();

        let mut events = EventDispatcher::new();
        events.subscribe(
            EventKind::UserTransitioned,
            Arc::new(AutoDecline {
                trigger: UserState::InfoPendingVerification,
            }),
        );
        let machine = StateMachine::new(store.clone(), events, 8);

        let outcome = machine
            .try_transition(user.id, UserState::InfoPendingVerification, None, None)
            .await
            .unwrap();
        assert!(outcome.committed);
        assert!(!outcome.reached_target());
        assert_eq!(outcome.settled, UserState::Declined);

        let stored = store.get_user(user.id).await.unwrap();
        assert_eq!(stored.decline_reason, Some(DeclineReason::DeclineAdmin));
    }

    #[tokio::test]
    async fn test_observers_see_committed_state_in_order() {
        let store = Arc::new(MemoryStore::new());
        let user = store.insert_user(sample_user()).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut events = EventDispatcher::new();
        events.subscribe(EventKind::UserTransitioned, Arc::new(SeenTransitions(seen.clone())));
        let machine = StateMachine::new(store.clone(), events, 8);

        machine
            .transition(user.id, UserState::InfoNotVerified, None, None)
            .await
            .unwrap();
        machine
            .transition(user.id, UserState::InfoPendingVerification, None, None)
            .await
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].from, UserState::NewUser);
        assert_eq!(seen[1].from, UserState::InfoNotVerified);
        assert_eq!(seen[1].to, UserState::InfoPendingVerification);
    }

    #[tokio::test]
    async fn test_cycles_stop_at_depth_limit() {
        let store = Arc::new(MemoryStore::new());
        let user = store.insert_user(sample_user()).await.unwrap();

        let mut events = EventDispatcher::new();
        events.subscribe(EventKind::UserTransitioned, Arc::new(PingPong));
        let machine = StateMachine::new(store.clone(), events, 4);

        let settled = machine
            .transition(user.id, UserState::ApprovedCap, None, None)
            .await
            .unwrap();

        // depths 0..=3 commit, alternating starting at approved_cap
        assert_eq!(settled, UserState::ApprovedNoCap);
    }

    #[tokio::test]
    async fn test_lost_race_is_not_committed() {
        let store = Arc::new(MemoryStore::new());
        let user = store.insert_user(sample_user()).await.unwrap();
        let machine = StateMachine::new(store.clone(), EventDispatcher::new(), 8);

        let outcome = machine
            .try_transition(Uuid::new_v4(), UserState::InfoVerified, None, None)
            .await;
        assert!(matches!(outcome, Err(AppError::NotFound(_))));

        let outcome = machine
            .try_transition(user.id, UserState::InfoNotVerified, None, None)
            .await
            .unwrap();
        assert!(outcome.reached_target());
    }

    #[tokio::test]
    async fn test_transition_from_wrong_predecessor_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let user = store.insert_user(sample_user()).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut events = EventDispatcher::new();
        events.subscribe(EventKind::UserTransitioned, Arc::new(SeenTransitions(seen.clone())));
        let machine = StateMachine::new(store.clone(), events, 8);
        store.force_state(user.id, UserState::IdVerified);

        let outcome = machine
            .try_transition_from(
                user.id,
                UserState::IdNotVerified,
                UserState::IdPendingVerification,
                None,
                None,
            )
            .await
            .unwrap();
        assert!(!outcome.committed);
        assert_eq!(outcome.settled, UserState::IdVerified);
        assert_eq!(store.get_user(user.id).await.unwrap().state, UserState::IdVerified);
        assert!(seen.lock().is_empty());

        let outcome = machine
            .try_transition_from(
                user.id,
                UserState::IdVerified,
                UserState::ApprovedNoCap,
                None,
                None,
            )
            .await
            .unwrap();
        assert!(outcome.reached_target());
        assert_eq!(seen.lock().len(), 1);
    }
}
