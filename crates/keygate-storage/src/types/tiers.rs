//! Entitlement tiers and the status enums shared across entities.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Entitlement tier. The derived `Ord` gives Basic < Pro < Enterprise,
/// which is what the no-downgrade rule on the subscription update path
/// compares against.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Basic,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Basic => "basic",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Seat floor/ceiling rules: Basic is single-seat, Enterprise starts
    /// at 10 seats, Pro takes any positive count.
    pub fn validate_seats(&self, seats: i32) -> Result<(), String> {
        match self {
            Tier::Basic if seats != 1 => {
                Err(format!("basic tier requires exactly 1 seat, got {}", seats))
            }
            Tier::Enterprise if seats < 10 => Err(format!(
                "enterprise tier requires at least 10 seats, got {}",
                seats
            )),
            _ if seats < 1 => Err(format!("seat count must be positive, got {}", seats)),
            _ => Ok(()),
        }
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(Tier::Basic),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            _ => Err(format!("invalid tier: {}", s)),
        }
    }
}

/// Subscription status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            _ => Err(format!("invalid subscription status: {}", s)),
        }
    }
}

/// License status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    Pending,
    Active,
    Revoked,
    Expired,
}

impl LicenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseStatus::Pending => "pending",
            LicenseStatus::Active => "active",
            LicenseStatus::Revoked => "revoked",
            LicenseStatus::Expired => "expired",
        }
    }

    /// Revoked and Expired licenses never come back; Pending/Active count
    /// against the subscription's seat ceiling.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LicenseStatus::Revoked | LicenseStatus::Expired)
    }
}

impl FromStr for LicenseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LicenseStatus::Pending),
            "active" => Ok(LicenseStatus::Active),
            "revoked" => Ok(LicenseStatus::Revoked),
            "expired" => Ok(LicenseStatus::Expired),
            _ => Err(format!("invalid license status: {}", s)),
        }
    }
}
