//! Subscription records.

use chrono::{DateTime, Utc};

use super::{OrganizationId, SubscriptionId, SubscriptionStatus, Tier, UserId};

/// Who a subscription bills against: an individual user or an organization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionOwner {
    User(UserId),
    Organization(OrganizationId),
}

impl SubscriptionOwner {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            SubscriptionOwner::User(id) => Some(*id),
            SubscriptionOwner::Organization(_) => None,
        }
    }

    pub fn organization_id(&self) -> Option<OrganizationId> {
        match self {
            SubscriptionOwner::User(_) => None,
            SubscriptionOwner::Organization(id) => Some(*id),
        }
    }
}

/// Subscription record
#[derive(Clone, Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub owner: SubscriptionOwner,
    pub tier: Tier,
    pub seats: i32,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    /// Payment gateway subscription reference, if the subscription was
    /// created through checkout.
    pub billing_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating a subscription
#[derive(Clone, Debug)]
pub struct CreateSubscriptionParams {
    pub owner: SubscriptionOwner,
    pub tier: Tier,
    pub seats: i32,
    pub billing_ref: Option<String>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
}
