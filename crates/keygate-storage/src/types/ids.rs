//! Strongly-typed identifiers (avoid mixing strings/UUIDs arbitrarily).

use uuid::Uuid;

/// User identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserId(pub Uuid);

/// Organization identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OrganizationId(pub Uuid);

/// Subscription identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

/// License identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LicenseId(pub Uuid);

/// Organization member identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OrgMemberId(pub Uuid);

/// Invitation identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InvitationId(pub Uuid);

/// Demo session identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DemoSessionId(pub Uuid);

/// Payment identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PaymentId(pub Uuid);

/// License transfer intent identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransferIntentId(pub Uuid);

macro_rules! display_as_uuid {
    ($($t:ty),* $(,)?) => {
        $(impl std::fmt::Display for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_as_uuid!(
    UserId,
    OrganizationId,
    SubscriptionId,
    LicenseId,
    OrgMemberId,
    InvitationId,
    DemoSessionId,
    PaymentId,
    TransferIntentId,
);
