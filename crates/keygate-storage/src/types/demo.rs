//! Demo trial session records.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DemoSessionId, SubscriptionId, Tier, UserId};

/// Demo session status as stored. The effective status is always derived
/// from `expires_at` at read time; the stored field lags behind until the
/// next mutating call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemoStatus {
    Active,
    Expired,
    Converted,
}

impl DemoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DemoStatus::Active => "active",
            DemoStatus::Expired => "expired",
            DemoStatus::Converted => "converted",
        }
    }
}

impl FromStr for DemoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(DemoStatus::Active),
            "expired" => Ok(DemoStatus::Expired),
            "converted" => Ok(DemoStatus::Converted),
            _ => Err(format!("invalid demo status: {}", s)),
        }
    }
}

/// A feature-gate denial recorded against a demo session.
#[derive(Clone, Debug)]
pub struct RestrictionHit {
    pub feature: String,
    pub at: DateTime<Utc>,
}

/// Demo session record
#[derive(Clone, Debug)]
pub struct DemoSession {
    pub id: DemoSessionId,
    pub user_id: UserId,
    pub tier: Tier,
    pub status: DemoStatus,
    pub expires_at: DateTime<Utc>,
    /// Distinct feature names the trial user has touched.
    pub features_accessed: Vec<String>,
    pub restrictions_hit: Vec<RestrictionHit>,
    pub converted_to: Option<SubscriptionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating a demo session
#[derive(Clone, Debug)]
pub struct CreateDemoSessionParams {
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
}
