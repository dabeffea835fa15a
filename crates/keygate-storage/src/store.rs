//! The Store trait that backends implement.

use chrono::{DateTime, Utc};

use crate::types::*;
use crate::StoreError;

/// The storage trait the entitlement services depend on.
///
/// Methods whose doc comment says **atomic** carry an invariant check and a
/// write that must happen in one transaction. Backends that cannot do the
/// check-and-write atomically (read, then compare, then write in separate
/// steps) will oversubscribe seats under concurrent callers and must not be
/// used.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    // ───────────────────────────────────── Users ──────────────────────────────────────────

    /// Create a new user (returns generated ID). Fails with `AlreadyExists`
    /// when the email is taken.
    async fn create_user(&self, params: &CreateUserParams) -> Result<UserId, StoreError>;

    /// Get user by email.
    async fn get_user_by_email(&self, email: &str) -> Result<User, StoreError>;

    /// Get user by ID.
    async fn get_user_by_id(&self, user_id: &UserId) -> Result<User, StoreError>;

    // ───────────────────────────────────── Organizations ──────────────────────────────────

    /// Create a new organization (returns generated ID).
    async fn create_organization(
        &self,
        params: &CreateOrganizationParams,
    ) -> Result<OrganizationId, StoreError>;

    /// Get organization by ID.
    async fn get_organization(&self, org_id: &OrganizationId) -> Result<Organization, StoreError>;

    /// Get the organization's active (or past-due) subscription, if any.
    async fn get_active_subscription_for_org(
        &self,
        org_id: &OrganizationId,
    ) -> Result<Subscription, StoreError>;

    // ───────────────────────────────────── Subscriptions ──────────────────────────────────

    /// Create a subscription (returns generated ID).
    async fn create_subscription(
        &self,
        params: &CreateSubscriptionParams,
    ) -> Result<SubscriptionId, StoreError>;

    /// Get subscription by ID.
    async fn get_subscription(&self, sub_id: &SubscriptionId) -> Result<Subscription, StoreError>;

    /// Get subscription by the payment gateway's reference.
    async fn get_subscription_by_billing_ref(
        &self,
        billing_ref: &str,
    ) -> Result<Subscription, StoreError>;

    /// List subscriptions owned directly by a user.
    async fn list_subscriptions_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Subscription>, StoreError>;

    /// Update tier and seat count. **Atomic**: fails with `Conflict` when the
    /// new seat count is below the current non-terminal license count or the
    /// organization's held-seat count.
    async fn update_subscription_plan(
        &self,
        sub_id: &SubscriptionId,
        tier: Tier,
        seats: i32,
    ) -> Result<(), StoreError>;

    /// Set subscription status.
    async fn set_subscription_status(
        &self,
        sub_id: &SubscriptionId,
        status: SubscriptionStatus,
    ) -> Result<(), StoreError>;

    /// Set the cancel-at-period-end flag.
    async fn set_cancel_at_period_end(
        &self,
        sub_id: &SubscriptionId,
        cancel: bool,
    ) -> Result<(), StoreError>;

    /// Set status and the cancel-at-period-end flag together. **Atomic**:
    /// the two fields are one cancellation state, and a reader must never
    /// observe a cancelled status with the flag half-applied.
    async fn set_cancellation(
        &self,
        sub_id: &SubscriptionId,
        status: SubscriptionStatus,
        cancel_at_period_end: bool,
    ) -> Result<(), StoreError>;

    /// Set the current billing period window.
    async fn set_subscription_period(
        &self,
        sub_id: &SubscriptionId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // ───────────────────────────────────── Licenses ───────────────────────────────────────

    /// Create a license. **Atomic**: fails with `SeatsExhausted` when the
    /// subscription's non-terminal license count has reached its seat count,
    /// and with `DuplicateLicense` when the user already holds a non-terminal
    /// license on the same subscription.
    async fn create_license_checked(
        &self,
        params: &CreateLicenseParams,
    ) -> Result<License, StoreError>;

    /// Get license by ID.
    async fn get_license(&self, license_id: &LicenseId) -> Result<License, StoreError>;

    /// Get license by its opaque key.
    async fn get_license_by_key(&self, key: &str) -> Result<License, StoreError>;

    /// List all licenses minted against a subscription.
    async fn list_licenses_for_subscription(
        &self,
        sub_id: &SubscriptionId,
    ) -> Result<Vec<License>, StoreError>;

    /// List all licenses held by a user, across subscriptions.
    async fn list_licenses_for_user(&self, user_id: &UserId) -> Result<Vec<License>, StoreError>;

    /// Set license status.
    async fn set_license_status(
        &self,
        license_id: &LicenseId,
        status: LicenseStatus,
    ) -> Result<(), StoreError>;

    /// Set (or clear) the license expiry timestamp.
    async fn set_license_expiry(
        &self,
        license_id: &LicenseId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Bind a device to a license. **Atomic**: idempotent when the device id
    /// is already bound; fails with `Conflict` when the binding would exceed
    /// `max_devices`. Returns the license after the write.
    async fn bind_device(
        &self,
        license_id: &LicenseId,
        device: &DeviceBinding,
        max_devices: usize,
    ) -> Result<License, StoreError>;

    /// Update last-seen bookkeeping for a bound device. A no-op when the
    /// device is not bound.
    async fn touch_device(
        &self,
        license_id: &LicenseId,
        device_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Hard-delete a license (duplicate-cleanup repair tool only).
    async fn delete_license(&self, license_id: &LicenseId) -> Result<(), StoreError>;

    // ───────────────────────────────────── Transfer intents ───────────────────────────────

    /// Record a license transfer intent.
    async fn create_transfer_intent(
        &self,
        params: &CreateTransferIntentParams,
    ) -> Result<TransferIntent, StoreError>;

    /// List transfer intents recorded against a license.
    async fn list_transfer_intents_for_license(
        &self,
        license_id: &LicenseId,
    ) -> Result<Vec<TransferIntent>, StoreError>;

    // ───────────────────────────────────── Org members ────────────────────────────────────

    /// Create an INVITED member with a reserved seat. **Atomic**: fails with
    /// `SeatsExhausted` when held seats have reached the organization's
    /// active subscription seat count, with `NotFound` when the organization
    /// has no active subscription, and with `AlreadyExists` when the email
    /// already belongs to a non-removed member.
    async fn reserve_seat(&self, params: &CreateOrgMemberParams) -> Result<OrgMember, StoreError>;

    /// Get member by ID within an organization.
    async fn get_org_member(
        &self,
        org_id: &OrganizationId,
        member_id: &OrgMemberId,
    ) -> Result<OrgMember, StoreError>;

    /// Get a non-removed member by email within an organization.
    async fn get_member_by_email(
        &self,
        org_id: &OrganizationId,
        email: &str,
    ) -> Result<OrgMember, StoreError>;

    /// Get a member by linked user within an organization.
    async fn get_member_for_user(
        &self,
        org_id: &OrganizationId,
        user_id: &UserId,
    ) -> Result<OrgMember, StoreError>;

    /// List all members of an organization.
    async fn list_org_members(
        &self,
        org_id: &OrganizationId,
    ) -> Result<Vec<OrgMember>, StoreError>;

    /// Count members currently holding a seat (ACTIVE or seat-reserved).
    async fn count_seats_held(&self, org_id: &OrganizationId) -> Result<i32, StoreError>;

    /// Apply non-seat-affecting field changes to a member. Status changes to
    /// ACTIVE must go through [`Store::activate_member_seat`] instead; this
    /// method fails with `Conflict` when asked to set ACTIVE on a member that
    /// does not already hold a seat.
    async fn update_member(
        &self,
        org_id: &OrganizationId,
        member_id: &OrgMemberId,
        changes: &OrgMemberChanges,
    ) -> Result<OrgMember, StoreError>;

    /// Transition a member to ACTIVE with a held seat. **Atomic**: re-checks
    /// the seat ceiling exactly like [`Store::reserve_seat`] when the member
    /// does not already hold one.
    async fn activate_member_seat(
        &self,
        org_id: &OrganizationId,
        member_id: &OrgMemberId,
    ) -> Result<OrgMember, StoreError>;

    /// Link a member row to an accepting user's account.
    async fn link_member_user(
        &self,
        org_id: &OrganizationId,
        member_id: &OrgMemberId,
        user_id: &UserId,
    ) -> Result<(), StoreError>;

    /// Transition a member to REMOVED and release their seat.
    async fn release_member_seat(
        &self,
        org_id: &OrganizationId,
        member_id: &OrgMemberId,
    ) -> Result<OrgMember, StoreError>;

    // ───────────────────────────────────── Invitations ────────────────────────────────────

    /// Create an invitation (token hash only; the secret never reaches the
    /// store).
    async fn create_invitation(
        &self,
        params: &CreateInvitationParams,
    ) -> Result<Invitation, StoreError>;

    /// Get invitation by token hash.
    async fn get_invitation_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Invitation, StoreError>;

    /// List invitations for an organization.
    async fn list_invitations(
        &self,
        org_id: &OrganizationId,
    ) -> Result<Vec<Invitation>, StoreError>;

    /// Consume an invitation. **Atomic** single-use: the invitation must be
    /// PENDING and unexpired as of `now`; otherwise fails with `Conflict`
    /// (an expired invitation is also marked EXPIRED). Marks the invitation
    /// ACCEPTED and returns it.
    async fn consume_invitation(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Invitation, StoreError>;

    // ───────────────────────────────────── Demo sessions ──────────────────────────────────

    /// Create a demo session. **Atomic**: fails with `Conflict` when the
    /// user already has a session that is ACTIVE and unexpired as of `now`.
    async fn create_demo_session(
        &self,
        params: &CreateDemoSessionParams,
        now: DateTime<Utc>,
    ) -> Result<DemoSession, StoreError>;

    /// Get the user's most recent demo session.
    async fn get_demo_session_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<DemoSession, StoreError>;

    /// Record that the trial user accessed a feature (set semantics).
    async fn record_feature_access(
        &self,
        session_id: &DemoSessionId,
        feature: &str,
    ) -> Result<(), StoreError>;

    /// Record a feature-gate denial.
    async fn record_restriction_hit(
        &self,
        session_id: &DemoSessionId,
        feature: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Set the stored demo status.
    async fn set_demo_status(
        &self,
        session_id: &DemoSessionId,
        status: DemoStatus,
    ) -> Result<(), StoreError>;

    /// Mark the session converted into a paid subscription.
    async fn set_demo_conversion(
        &self,
        session_id: &DemoSessionId,
        sub_id: &SubscriptionId,
    ) -> Result<(), StoreError>;

    /// Set the session expiry (trial extension path).
    async fn set_demo_expiry(
        &self,
        session_id: &DemoSessionId,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // ───────────────────────────────────── Payments ───────────────────────────────────────

    /// Create a payment record (reconciler only).
    async fn create_payment(&self, params: &CreatePaymentParams) -> Result<PaymentId, StoreError>;

    /// Get payment by the gateway's reference.
    async fn get_payment_by_gateway_ref(&self, gateway_ref: &str)
        -> Result<Payment, StoreError>;

    /// Set payment status.
    async fn set_payment_status(
        &self,
        payment_id: &PaymentId,
        status: PaymentStatus,
    ) -> Result<(), StoreError>;

    /// List payments recorded against a subscription.
    async fn list_payments_for_subscription(
        &self,
        sub_id: &SubscriptionId,
    ) -> Result<Vec<Payment>, StoreError>;

    // ───────────────────────────────────── Processed events ───────────────────────────────

    /// Claim a gateway event id for processing. **Atomic** conditional
    /// create: fails with `AlreadyExists` when the id was ever claimed,
    /// which is the at-most-once guarantee under concurrent redelivery.
    async fn claim_event(&self, event_id: &str, event_type: &str) -> Result<(), StoreError>;

    /// Record the outcome of processing a claimed event.
    async fn mark_event_outcome(
        &self,
        event_id: &str,
        attempts: i32,
        last_error: Option<&str>,
        succeeded: bool,
    ) -> Result<(), StoreError>;

    /// Get a processed-event record.
    async fn get_processed_event(&self, event_id: &str) -> Result<ProcessedEvent, StoreError>;
}
