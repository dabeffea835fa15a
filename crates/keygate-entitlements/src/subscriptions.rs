//! Subscription lifecycle: create, plan changes, cancel, reactivate.

use std::sync::Arc;

use chrono::{Duration, Utc};
use keygate_audit::{AuditAction, AuditEvent, AuditLog};
use keygate_storage::{
    CreateSubscriptionParams, MemberRole, MemberStatus, Store, StoreError, Subscription,
    SubscriptionId, SubscriptionOwner, SubscriptionStatus, Tier, UserId,
};

use crate::{record_audit, EntitlementError};

/// Length of one billing period.
pub const BILLING_PERIOD_DAYS: i64 = 30;

/// How a subscription is cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelMode {
    /// Cancel now; all associated licenses expire immediately.
    Immediate,
    /// Flag the subscription; service continues until the period ends.
    AtPeriodEnd,
}

/// What the next billing period would look like.
#[derive(Clone, Debug)]
pub struct RenewalPreview {
    pub subscription_id: SubscriptionId,
    pub tier: Tier,
    pub seats: i32,
    pub next_period_start: chrono::DateTime<Utc>,
    pub next_period_end: chrono::DateTime<Utc>,
}

pub struct SubscriptionManager<S> {
    store: Arc<S>,
    audit: Arc<dyn AuditLog>,
}

/// The status a subscription reads as right now.
///
/// Period-end cancellation is applied lazily: a subscription flagged
/// cancel-at-period-end stays effectively ACTIVE until its period end
/// passes, then reads as CANCELLED. Every enforcement point goes through
/// this one function so the expiry logic cannot drift between call sites.
pub fn effective_status(
    sub: &Subscription,
    now: chrono::DateTime<Utc>,
) -> SubscriptionStatus {
    if sub.status == SubscriptionStatus::Cancelled
        && sub.cancel_at_period_end
        && now < sub.current_period_end
    {
        return SubscriptionStatus::Active;
    }
    sub.status
}

impl<S: Store> SubscriptionManager<S> {
    pub fn new(store: Arc<S>, audit: Arc<dyn AuditLog>) -> Self {
        Self { store, audit }
    }

    /// Caller must be the owning user, or an Owner/Admin member of the
    /// owning organization.
    async fn authorize(
        &self,
        caller: &UserId,
        sub: &Subscription,
    ) -> Result<(), EntitlementError> {
        match &sub.owner {
            SubscriptionOwner::User(user_id) => {
                if user_id == caller {
                    return Ok(());
                }
            }
            SubscriptionOwner::Organization(org_id) => {
                let org = self.store.get_organization(org_id).await?;
                if org.owner_user_id == *caller {
                    return Ok(());
                }
                if let Ok(member) = self.store.get_member_for_user(org_id, caller).await {
                    if member.status == MemberStatus::Active
                        && member.role.includes(&MemberRole::Admin)
                    {
                        return Ok(());
                    }
                }
            }
        }
        Err(EntitlementError::Forbidden(
            "caller does not own this subscription".into(),
        ))
    }

    pub async fn create(
        &self,
        caller: &UserId,
        owner: SubscriptionOwner,
        tier: Tier,
        seats: i32,
        billing_ref: Option<String>,
    ) -> Result<Subscription, EntitlementError> {
        tier.validate_seats(seats)
            .map_err(EntitlementError::Validation)?;

        if let SubscriptionOwner::Organization(org_id) = &owner {
            let org = self.store.get_organization(org_id).await.map_err(|_| {
                EntitlementError::NotFound("organization not found".into())
            })?;
            if org.owner_user_id != *caller {
                return Err(EntitlementError::Forbidden(
                    "only the organization owner may create its subscription".into(),
                ));
            }
        }

        let now = Utc::now();
        let sub_id = self
            .store
            .create_subscription(&CreateSubscriptionParams {
                owner,
                tier,
                seats,
                billing_ref,
                current_period_start: now,
                current_period_end: now + Duration::days(BILLING_PERIOD_DAYS),
            })
            .await?;
        let sub = self.store.get_subscription(&sub_id).await?;

        tracing::info!(subscription_id = %sub_id, tier = tier.as_str(), seats, "subscription created");
        record_audit(
            self.audit.as_ref(),
            AuditEvent::builder(AuditAction::SubscriptionCreate)
                .actor(Some(caller))
                .resource("subscription", sub_id.to_string())
                .subscription_id(Some(&sub_id))
                .details(serde_json::json!({ "tier": tier.as_str(), "seats": seats }))
                .build(),
        )
        .await;

        Ok(sub)
    }

    /// Change tier and/or seat count. Tier downgrades are rejected here
    /// (they require a separate explicit flow); the seat floor and the
    /// assigned-seat check are re-validated, the latter atomically in the
    /// store.
    pub async fn update_seats_or_tier(
        &self,
        caller: &UserId,
        sub_id: &SubscriptionId,
        new_tier: Option<Tier>,
        new_seats: Option<i32>,
    ) -> Result<Subscription, EntitlementError> {
        let sub = self.store.get_subscription(sub_id).await.map_err(|_| {
            EntitlementError::NotFound("subscription not found".into())
        })?;
        self.authorize(caller, &sub).await?;

        let tier = new_tier.unwrap_or(sub.tier);
        if tier < sub.tier {
            return Err(EntitlementError::Conflict(
                "tier downgrade not permitted".into(),
            ));
        }
        let seats = new_seats.unwrap_or(sub.seats);
        tier.validate_seats(seats)
            .map_err(EntitlementError::Validation)?;

        self.store
            .update_subscription_plan(sub_id, tier, seats)
            .await
            .map_err(|err| match err {
                StoreError::Conflict => EntitlementError::Conflict(
                    "seat count below currently assigned licenses or active members".into(),
                ),
                other => other.into(),
            })?;

        record_audit(
            self.audit.as_ref(),
            AuditEvent::builder(AuditAction::SubscriptionUpdate)
                .actor(Some(caller))
                .resource("subscription", sub_id.to_string())
                .subscription_id(Some(sub_id))
                .details(serde_json::json!({
                    "from_tier": sub.tier.as_str(),
                    "to_tier": tier.as_str(),
                    "from_seats": sub.seats,
                    "to_seats": seats,
                }))
                .build(),
        )
        .await;

        Ok(self.store.get_subscription(sub_id).await?)
    }

    pub async fn cancel(
        &self,
        caller: &UserId,
        sub_id: &SubscriptionId,
        mode: CancelMode,
    ) -> Result<Subscription, EntitlementError> {
        let sub = self.store.get_subscription(sub_id).await.map_err(|_| {
            EntitlementError::NotFound("subscription not found".into())
        })?;
        self.authorize(caller, &sub).await?;

        match mode {
            CancelMode::Immediate => {
                self.store
                    .set_cancellation(sub_id, SubscriptionStatus::Cancelled, false)
                    .await?;
                for license in self.store.list_licenses_for_subscription(sub_id).await? {
                    if license.is_non_terminal() {
                        self.store
                            .set_license_status(
                                &license.id,
                                keygate_storage::LicenseStatus::Expired,
                            )
                            .await?;
                    }
                }
            }
            CancelMode::AtPeriodEnd => {
                self.store
                    .set_cancellation(sub_id, SubscriptionStatus::Cancelled, true)
                    .await?;
            }
        }

        tracing::info!(subscription_id = %sub_id, immediate = (mode == CancelMode::Immediate), "subscription cancelled");
        record_audit(
            self.audit.as_ref(),
            AuditEvent::builder(AuditAction::SubscriptionCancel)
                .actor(Some(caller))
                .resource("subscription", sub_id.to_string())
                .subscription_id(Some(sub_id))
                .details(serde_json::json!({
                    "mode": match mode {
                        CancelMode::Immediate => "immediate",
                        CancelMode::AtPeriodEnd => "at_period_end",
                    }
                }))
                .build(),
        )
        .await;

        Ok(self.store.get_subscription(sub_id).await?)
    }

    /// Undo a pending period-end cancellation. Only valid while the
    /// subscription is cancelled with the flag set and the period has not
    /// yet ended.
    pub async fn reactivate(
        &self,
        caller: &UserId,
        sub_id: &SubscriptionId,
    ) -> Result<Subscription, EntitlementError> {
        let sub = self.store.get_subscription(sub_id).await.map_err(|_| {
            EntitlementError::NotFound("subscription not found".into())
        })?;
        self.authorize(caller, &sub).await?;

        let now = Utc::now();
        if sub.status != SubscriptionStatus::Cancelled
            || !sub.cancel_at_period_end
            || now >= sub.current_period_end
        {
            return Err(EntitlementError::Conflict(
                "subscription is not pending a period-end cancellation".into(),
            ));
        }

        self.store
            .set_cancellation(sub_id, SubscriptionStatus::Active, false)
            .await?;

        record_audit(
            self.audit.as_ref(),
            AuditEvent::builder(AuditAction::SubscriptionReactivate)
                .actor(Some(caller))
                .resource("subscription", sub_id.to_string())
                .subscription_id(Some(sub_id))
                .build(),
        )
        .await;

        Ok(self.store.get_subscription(sub_id).await?)
    }

    /// What renewal would look like, without committing anything.
    pub async fn renewal_preview(
        &self,
        caller: &UserId,
        sub_id: &SubscriptionId,
    ) -> Result<RenewalPreview, EntitlementError> {
        let sub = self.store.get_subscription(sub_id).await.map_err(|_| {
            EntitlementError::NotFound("subscription not found".into())
        })?;
        self.authorize(caller, &sub).await?;

        Ok(RenewalPreview {
            subscription_id: sub.id,
            tier: sub.tier,
            seats: sub.seats,
            next_period_start: sub.current_period_end,
            next_period_end: sub.current_period_end + Duration::days(BILLING_PERIOD_DAYS),
        })
    }
}
