//! Organization membership records and roles.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{OrgMemberId, OrganizationId, UserId};

/// Role within an organization
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Admin,
    Manager,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Admin => "admin",
            MemberRole::Manager => "manager",
            MemberRole::Member => "member",
        }
    }

    /// Check if this role has at least the permissions of another role
    pub fn includes(&self, other: &MemberRole) -> bool {
        match self {
            MemberRole::Owner => true,
            MemberRole::Admin => !matches!(other, MemberRole::Owner),
            MemberRole::Manager => matches!(other, MemberRole::Manager | MemberRole::Member),
            MemberRole::Member => matches!(other, MemberRole::Member),
        }
    }
}

impl FromStr for MemberRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(MemberRole::Owner),
            "admin" => Ok(MemberRole::Admin),
            "manager" => Ok(MemberRole::Manager),
            "member" => Ok(MemberRole::Member),
            _ => Err(format!("invalid member role: {}", s)),
        }
    }
}

/// Membership status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Invited,
    Active,
    Suspended,
    Removed,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Invited => "invited",
            MemberStatus::Active => "active",
            MemberStatus::Suspended => "suspended",
            MemberStatus::Removed => "removed",
        }
    }
}

impl FromStr for MemberStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invited" => Ok(MemberStatus::Invited),
            "active" => Ok(MemberStatus::Active),
            "suspended" => Ok(MemberStatus::Suspended),
            "removed" => Ok(MemberStatus::Removed),
            _ => Err(format!("invalid member status: {}", s)),
        }
    }
}

/// Organization member record
#[derive(Clone, Debug)]
pub struct OrgMember {
    pub id: OrgMemberId,
    pub organization_id: OrganizationId,
    pub email: String,
    /// Linked once the invited person accepts and has an account.
    pub user_id: Option<UserId>,
    pub role: MemberRole,
    pub status: MemberStatus,
    /// A reserved seat counts against the ceiling even before acceptance.
    pub seat_reserved: bool,
    pub invited_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrgMember {
    /// Whether this member consumes a seat right now.
    pub fn holds_seat(&self) -> bool {
        self.status == MemberStatus::Active || self.seat_reserved
    }
}

/// Parameters for creating an org member (seat is reserved atomically).
#[derive(Clone, Debug)]
pub struct CreateOrgMemberParams {
    pub organization_id: OrganizationId,
    pub email: String,
    pub role: MemberRole,
    pub invited_by: Option<UserId>,
}

/// Field changes for an org member update.
#[derive(Clone, Debug, Default)]
pub struct OrgMemberChanges {
    pub email: Option<String>,
    pub role: Option<MemberRole>,
    pub status: Option<MemberStatus>,
}
