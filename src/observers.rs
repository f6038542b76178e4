//! Observers registered at startup.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

use crate::analytics_client::{
    AnalyticsQueue, EVENT_CHECK_UPDATE, EVENT_IDM_RESPONSE, EVENT_TRANSITION,
};
use crate::events::{Event, EventContext, EventDispatcher, EventKind, Observer, Resource};
use crate::models::{DeclineReason, UserState};

/// Declines users entering info verification from a missing or banned country.
pub struct CountryBanObserver {
    banned: HashSet<String>,
}

impl CountryBanObserver {
    pub fn new(banned: HashSet<String>) -> Self {
        Self { banned }
    }

    fn is_allowed(&self, country_code: Option<&str>) -> bool {
        country_code
            .map(|c| c.trim().to_ascii_uppercase())
            .is_some_and(|c| !c.is_empty() && !self.banned.contains(&c))
    }
}

#[async_trait]
impl Observer for CountryBanObserver {
    fn name(&self) -> &'static str {
        "country_ban"
    }

    async fn notify(&self, event: &Event, ctx: &EventContext<'_>) -> anyhow::Result<()> {
        let Event::UserTransitioned { user, transition } = event else {
            return Ok(());
        };
        if transition.to != UserState::InfoPendingVerification
            || self.is_allowed(user.country_code.as_deref())
        {
            return Ok(());
        }

        tracing::info!(
            "Declining user {} for country {:?}",
            user.id,
            user.country_code
        );
        ctx.transition(
            user.id,
            UserState::InfoDeclined,
            Some(DeclineReason::DeclineCountry),
            None,
        )
        .await?;
        Ok(())
    }
}

/// Forwards lifecycle activity to the analytics queue.
pub struct AnalyticsObserver {
    queue: AnalyticsQueue,
}

impl AnalyticsObserver {
    pub fn new(queue: AnalyticsQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Observer for AnalyticsObserver {
    fn name(&self) -> &'static str {
        "analytics"
    }

    async fn notify(&self, event: &Event, ctx: &EventContext<'_>) -> anyhow::Result<()> {
        match event {
            Event::UserTransitioned { user, transition } => {
                self.queue.event(
                    user.id,
                    EVENT_TRANSITION,
                    json!({
                        "state_before": transition.from.as_str(),
                        "state_now": transition.to.as_str(),
                    }),
                )?;
                self.queue.identify(user)?;
            }
            Event::ResponseReceived(response) => {
                if let Some(user_id) = response.user_id {
                    self.queue.event(
                        user_id,
                        EVENT_IDM_RESPONSE,
                        json!({
                            "transaction_id": response.transaction_id,
                            "status": response.raw_status(),
                            "user_reputation": response.user_reputation,
                        }),
                    )?;
                }
            }
            Event::ResourceUpdated(Resource::Check(check)) => {
                if let Some(user_id) = check.user_id {
                    self.queue.event(user_id, EVENT_CHECK_UPDATE, check.raw.clone())?;
                }
            }
            Event::ResourceUpdated(Resource::Report(_)) => {}
            Event::UserStatusUpdated { user_id, .. } => {
                let user = ctx.store().get_user(*user_id).await?;
                self.queue.identify(&user)?;
            }
        }
        Ok(())
    }
}

/// Logs conditions an operator should look at.
pub struct AdminAlertObserver;

#[async_trait]
impl Observer for AdminAlertObserver {
    fn name(&self) -> &'static str {
        "admin_alerts"
    }

    async fn notify(&self, event: &Event, _ctx: &EventContext<'_>) -> anyhow::Result<()> {
        match event {
            Event::ResponseReceived(response) if response.user_id.is_none() => {
                tracing::warn!(
                    "ALERT: identity provider response {} matches no user",
                    response.transaction_id
                );
            }
            Event::UserTransitioned { user, transition }
                if matches!(
                    transition.to,
                    UserState::InfoFailed | UserState::IdFailed | UserState::IdDeclined
                ) =>
            {
                tracing::warn!(
                    "ALERT: user {} moved {} -> {} ({:?})",
                    user.id,
                    transition.from,
                    transition.to,
                    user.info
                );
            }
            Event::ResourceUpdated(Resource::Check(check)) if check.user_id.is_none() => {
                tracing::warn!("ALERT: check {} has no user", check.id);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Wires the standard observers. Country bans run first so later observers
/// see the settled decline.
pub fn register_default_observers(
    dispatcher: &mut EventDispatcher,
    banned_countries: HashSet<String>,
    analytics: AnalyticsQueue,
) {
    let country: Arc<dyn Observer> = Arc::new(CountryBanObserver::new(banned_countries));
    let analytics: Arc<dyn Observer> = Arc::new(AnalyticsObserver::new(analytics));
    let alerts: Arc<dyn Observer> = Arc::new(AdminAlertObserver);

    dispatcher
        .subscribe(EventKind::UserTransitioned, country)
        .subscribe(EventKind::UserTransitioned, analytics.clone())
        .subscribe(EventKind::UserTransitioned, alerts.clone())
        .subscribe(EventKind::ResponseReceived, analytics.clone())
        .subscribe(EventKind::ResponseReceived, alerts.clone())
        .subscribe(EventKind::ResourceUpdated, analytics.clone())
        .subscribe(EventKind::ResourceUpdated, alerts)
        .subscribe(EventKind::UserStatusUpdated, analytics);
}
