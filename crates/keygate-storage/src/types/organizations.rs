//! Organization records.

use chrono::{DateTime, Utc};

use super::{OrganizationId, UserId};

/// Organization record. Seats are carried by the organization's active
/// subscription, not by the organization itself.
#[derive(Clone, Debug)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
    pub owner_user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating an organization
#[derive(Clone, Debug)]
pub struct CreateOrganizationParams {
    pub name: String,
    pub owner_user_id: UserId,
}
