//! User account records.

use chrono::{DateTime, Utc};

use super::UserId;

/// User record. Demo users are created by the trial engine and flagged so
/// the paid path can tell them apart from regular accounts.
#[derive(Clone, Debug)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub display_name: Option<String>,
    pub is_demo: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating a user
#[derive(Clone, Debug)]
pub struct CreateUserParams {
    pub email: String,
    pub display_name: Option<String>,
    pub is_demo: bool,
}
