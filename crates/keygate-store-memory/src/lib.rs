//! In-memory [`Store`] backend.
//!
//! This implementation is suitable for:
//! - Tests (all invariant and concurrency tests run against it)
//! - Development and single-node deployments
//!
//! All state sits behind one mutex, so every `Store` method is a
//! serializable transaction: the seat-ceiling, license-ceiling, and
//! processed-event checks can never interleave with the write they guard.
//! A SQL backend would use serializable transactions or conditional writes
//! to get the same guarantee.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use keygate_storage::*;

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    organizations: HashMap<Uuid, Organization>,
    subscriptions: HashMap<Uuid, Subscription>,
    licenses: HashMap<Uuid, License>,
    members: HashMap<Uuid, OrgMember>,
    invitations: HashMap<Uuid, Invitation>,
    demo_sessions: HashMap<Uuid, DemoSession>,
    payments: HashMap<Uuid, Payment>,
    transfer_intents: HashMap<Uuid, TransferIntent>,
    processed_events: HashMap<String, ProcessedEvent>,
}

/// In-memory store. Cheap to create per test; clone the `Arc` you wrap it
/// in, not the store itself.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The subscription that currently backs an organization's seats:
/// anything not Cancelled.
fn active_sub_for_org(state: &State, org_id: &OrganizationId) -> Option<Subscription> {
    state
        .subscriptions
        .values()
        .filter(|s| {
            s.owner.organization_id() == Some(*org_id)
                && s.status != SubscriptionStatus::Cancelled
        })
        .max_by_key(|s| s.created_at)
        .cloned()
}

fn seats_held(state: &State, org_id: &OrganizationId) -> i32 {
    state
        .members
        .values()
        .filter(|m| m.organization_id == *org_id && m.holds_seat())
        .count() as i32
}

fn non_terminal_licenses(state: &State, sub_id: &SubscriptionId) -> i32 {
    state
        .licenses
        .values()
        .filter(|l| l.subscription_id == *sub_id && l.is_non_terminal())
        .count() as i32
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    // ───────────────────────────────────── Users ──────────────────────────────────────────

    async fn create_user(&self, params: &CreateUserParams) -> Result<UserId, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state
            .users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&params.email))
        {
            return Err(StoreError::AlreadyExists);
        }
        let id = UserId(Uuid::new_v4());
        let now = Utc::now();
        state.users.insert(
            id.0,
            User {
                id,
                email: params.email.clone(),
                display_name: params.display_name.clone(),
                is_demo: params.is_demo,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<User, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_user_by_id(&self, user_id: &UserId) -> Result<User, StoreError> {
        let state = self.state.lock().unwrap();
        state.users.get(&user_id.0).cloned().ok_or(StoreError::NotFound)
    }

    // ───────────────────────────────────── Organizations ──────────────────────────────────

    async fn create_organization(
        &self,
        params: &CreateOrganizationParams,
    ) -> Result<OrganizationId, StoreError> {
        let mut state = self.state.lock().unwrap();
        let id = OrganizationId(Uuid::new_v4());
        let now = Utc::now();
        state.organizations.insert(
            id.0,
            Organization {
                id,
                name: params.name.clone(),
                owner_user_id: params.owner_user_id,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get_organization(&self, org_id: &OrganizationId) -> Result<Organization, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .organizations
            .get(&org_id.0)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_active_subscription_for_org(
        &self,
        org_id: &OrganizationId,
    ) -> Result<Subscription, StoreError> {
        let state = self.state.lock().unwrap();
        active_sub_for_org(&state, org_id).ok_or(StoreError::NotFound)
    }

    // ───────────────────────────────────── Subscriptions ──────────────────────────────────

    async fn create_subscription(
        &self,
        params: &CreateSubscriptionParams,
    ) -> Result<SubscriptionId, StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(billing_ref) = &params.billing_ref {
            if state
                .subscriptions
                .values()
                .any(|s| s.billing_ref.as_deref() == Some(billing_ref))
            {
                return Err(StoreError::AlreadyExists);
            }
        }
        let id = SubscriptionId(Uuid::new_v4());
        let now = Utc::now();
        state.subscriptions.insert(
            id.0,
            Subscription {
                id,
                owner: params.owner,
                tier: params.tier,
                seats: params.seats,
                status: SubscriptionStatus::Active,
                current_period_start: params.current_period_start,
                current_period_end: params.current_period_end,
                cancel_at_period_end: false,
                billing_ref: params.billing_ref.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get_subscription(&self, sub_id: &SubscriptionId) -> Result<Subscription, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .subscriptions
            .get(&sub_id.0)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_subscription_by_billing_ref(
        &self,
        billing_ref: &str,
    ) -> Result<Subscription, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .subscriptions
            .values()
            .find(|s| s.billing_ref.as_deref() == Some(billing_ref))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_subscriptions_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Subscription>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut subs: Vec<_> = state
            .subscriptions
            .values()
            .filter(|s| s.owner.user_id() == Some(*user_id))
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        Ok(subs)
    }

    async fn update_subscription_plan(
        &self,
        sub_id: &SubscriptionId,
        tier: Tier,
        seats: i32,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let sub = state
            .subscriptions
            .get(&sub_id.0)
            .cloned()
            .ok_or(StoreError::NotFound)?;

        // Never shrink below what is already assigned.
        if non_terminal_licenses(&state, sub_id) > seats {
            return Err(StoreError::Conflict);
        }
        if let Some(org_id) = sub.owner.organization_id() {
            if seats_held(&state, &org_id) > seats {
                return Err(StoreError::Conflict);
            }
        }

        let sub = state.subscriptions.get_mut(&sub_id.0).unwrap();
        sub.tier = tier;
        sub.seats = seats;
        sub.updated_at = Utc::now();
        Ok(())
    }

    async fn set_subscription_status(
        &self,
        sub_id: &SubscriptionId,
        status: SubscriptionStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let sub = state
            .subscriptions
            .get_mut(&sub_id.0)
            .ok_or(StoreError::NotFound)?;
        sub.status = status;
        sub.updated_at = Utc::now();
        Ok(())
    }

    async fn set_cancel_at_period_end(
        &self,
        sub_id: &SubscriptionId,
        cancel: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let sub = state
            .subscriptions
            .get_mut(&sub_id.0)
            .ok_or(StoreError::NotFound)?;
        sub.cancel_at_period_end = cancel;
        sub.updated_at = Utc::now();
        Ok(())
    }

    async fn set_cancellation(
        &self,
        sub_id: &SubscriptionId,
        status: SubscriptionStatus,
        cancel_at_period_end: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let sub = state
            .subscriptions
            .get_mut(&sub_id.0)
            .ok_or(StoreError::NotFound)?;
        sub.status = status;
        sub.cancel_at_period_end = cancel_at_period_end;
        sub.updated_at = Utc::now();
        Ok(())
    }

    async fn set_subscription_period(
        &self,
        sub_id: &SubscriptionId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let sub = state
            .subscriptions
            .get_mut(&sub_id.0)
            .ok_or(StoreError::NotFound)?;
        sub.current_period_start = start;
        sub.current_period_end = end;
        sub.updated_at = Utc::now();
        Ok(())
    }

    // ───────────────────────────────────── Licenses ───────────────────────────────────────

    async fn create_license_checked(
        &self,
        params: &CreateLicenseParams,
    ) -> Result<License, StoreError> {
        let mut state = self.state.lock().unwrap();
        let sub = state
            .subscriptions
            .get(&params.subscription_id.0)
            .cloned()
            .ok_or(StoreError::NotFound)?;

        if state.licenses.values().any(|l| l.key == params.key) {
            return Err(StoreError::AlreadyExists);
        }
        if state.licenses.values().any(|l| {
            l.subscription_id == params.subscription_id
                && l.user_id == params.user_id
                && l.is_non_terminal()
        }) {
            return Err(StoreError::DuplicateLicense);
        }
        if params.status.is_terminal() {
            return Err(StoreError::Conflict);
        }
        if non_terminal_licenses(&state, &params.subscription_id) >= sub.seats {
            return Err(StoreError::SeatsExhausted);
        }

        let now = Utc::now();
        let license = License {
            id: LicenseId(Uuid::new_v4()),
            key: params.key.clone(),
            subscription_id: params.subscription_id,
            user_id: params.user_id,
            tier: params.tier,
            status: params.status,
            expires_at: params.expires_at,
            devices: vec![],
            created_at: now,
            updated_at: now,
        };
        state.licenses.insert(license.id.0, license.clone());
        Ok(license)
    }

    async fn get_license(&self, license_id: &LicenseId) -> Result<License, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .licenses
            .get(&license_id.0)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_license_by_key(&self, key: &str) -> Result<License, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .licenses
            .values()
            .find(|l| l.key == key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_licenses_for_subscription(
        &self,
        sub_id: &SubscriptionId,
    ) -> Result<Vec<License>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<_> = state
            .licenses
            .values()
            .filter(|l| l.subscription_id == *sub_id)
            .cloned()
            .collect();
        out.sort_by_key(|l| l.created_at);
        Ok(out)
    }

    async fn list_licenses_for_user(&self, user_id: &UserId) -> Result<Vec<License>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<_> = state
            .licenses
            .values()
            .filter(|l| l.user_id == *user_id)
            .cloned()
            .collect();
        out.sort_by_key(|l| l.created_at);
        Ok(out)
    }

    async fn set_license_status(
        &self,
        license_id: &LicenseId,
        status: LicenseStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let license = state
            .licenses
            .get_mut(&license_id.0)
            .ok_or(StoreError::NotFound)?;
        license.status = status;
        license.updated_at = Utc::now();
        Ok(())
    }

    async fn set_license_expiry(
        &self,
        license_id: &LicenseId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let license = state
            .licenses
            .get_mut(&license_id.0)
            .ok_or(StoreError::NotFound)?;
        license.expires_at = expires_at;
        license.updated_at = Utc::now();
        Ok(())
    }

    async fn bind_device(
        &self,
        license_id: &LicenseId,
        device: &DeviceBinding,
        max_devices: usize,
    ) -> Result<License, StoreError> {
        let mut state = self.state.lock().unwrap();
        let license = state
            .licenses
            .get_mut(&license_id.0)
            .ok_or(StoreError::NotFound)?;
        if license
            .devices
            .iter()
            .any(|d| d.device_id == device.device_id)
        {
            return Ok(license.clone());
        }
        if license.devices.len() >= max_devices {
            return Err(StoreError::Conflict);
        }
        license.devices.push(device.clone());
        license.updated_at = Utc::now();
        Ok(license.clone())
    }

    async fn touch_device(
        &self,
        license_id: &LicenseId,
        device_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let license = state
            .licenses
            .get_mut(&license_id.0)
            .ok_or(StoreError::NotFound)?;
        if let Some(device) = license
            .devices
            .iter_mut()
            .find(|d| d.device_id == device_id)
        {
            device.last_seen_at = Some(at);
        }
        Ok(())
    }

    async fn delete_license(&self, license_id: &LicenseId) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state
            .licenses
            .remove(&license_id.0)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    // ───────────────────────────────────── Transfer intents ───────────────────────────────

    async fn create_transfer_intent(
        &self,
        params: &CreateTransferIntentParams,
    ) -> Result<TransferIntent, StoreError> {
        let mut state = self.state.lock().unwrap();
        let intent = TransferIntent {
            id: TransferIntentId(Uuid::new_v4()),
            license_id: params.license_id,
            from_user_id: params.from_user_id,
            to_email: params.to_email.clone(),
            reason: params.reason.clone(),
            created_at: Utc::now(),
        };
        state.transfer_intents.insert(intent.id.0, intent.clone());
        Ok(intent)
    }

    async fn list_transfer_intents_for_license(
        &self,
        license_id: &LicenseId,
    ) -> Result<Vec<TransferIntent>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<_> = state
            .transfer_intents
            .values()
            .filter(|t| t.license_id == *license_id)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }

    // ───────────────────────────────────── Org members ────────────────────────────────────

    async fn reserve_seat(&self, params: &CreateOrgMemberParams) -> Result<OrgMember, StoreError> {
        let mut state = self.state.lock().unwrap();
        if !state
            .organizations
            .contains_key(&params.organization_id.0)
        {
            return Err(StoreError::NotFound);
        }
        if state.members.values().any(|m| {
            m.organization_id == params.organization_id
                && m.status != MemberStatus::Removed
                && m.email.eq_ignore_ascii_case(&params.email)
        }) {
            return Err(StoreError::AlreadyExists);
        }
        let sub =
            active_sub_for_org(&state, &params.organization_id).ok_or(StoreError::NotFound)?;
        if seats_held(&state, &params.organization_id) >= sub.seats {
            return Err(StoreError::SeatsExhausted);
        }

        let now = Utc::now();
        let member = OrgMember {
            id: OrgMemberId(Uuid::new_v4()),
            organization_id: params.organization_id,
            email: params.email.clone(),
            user_id: None,
            role: params.role,
            status: MemberStatus::Invited,
            seat_reserved: true,
            invited_by: params.invited_by,
            created_at: now,
            updated_at: now,
        };
        state.members.insert(member.id.0, member.clone());
        Ok(member)
    }

    async fn get_org_member(
        &self,
        org_id: &OrganizationId,
        member_id: &OrgMemberId,
    ) -> Result<OrgMember, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .members
            .get(&member_id.0)
            .filter(|m| m.organization_id == *org_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_member_by_email(
        &self,
        org_id: &OrganizationId,
        email: &str,
    ) -> Result<OrgMember, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .members
            .values()
            .find(|m| {
                m.organization_id == *org_id
                    && m.status != MemberStatus::Removed
                    && m.email.eq_ignore_ascii_case(email)
            })
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_member_for_user(
        &self,
        org_id: &OrganizationId,
        user_id: &UserId,
    ) -> Result<OrgMember, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .members
            .values()
            .find(|m| {
                m.organization_id == *org_id
                    && m.status != MemberStatus::Removed
                    && m.user_id == Some(*user_id)
            })
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_org_members(
        &self,
        org_id: &OrganizationId,
    ) -> Result<Vec<OrgMember>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<_> = state
            .members
            .values()
            .filter(|m| m.organization_id == *org_id)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.created_at);
        Ok(out)
    }

    async fn count_seats_held(&self, org_id: &OrganizationId) -> Result<i32, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(seats_held(&state, org_id))
    }

    async fn update_member(
        &self,
        org_id: &OrganizationId,
        member_id: &OrgMemberId,
        changes: &OrgMemberChanges,
    ) -> Result<OrgMember, StoreError> {
        let mut state = self.state.lock().unwrap();
        let member = state
            .members
            .get_mut(&member_id.0)
            .filter(|m| m.organization_id == *org_id)
            .ok_or(StoreError::NotFound)?;

        if let Some(status) = changes.status {
            // Becoming ACTIVE without a held seat must go through
            // activate_member_seat so the ceiling is re-checked.
            if status == MemberStatus::Active && !member.holds_seat() {
                return Err(StoreError::Conflict);
            }
            member.status = status;
            if status == MemberStatus::Removed {
                member.seat_reserved = false;
            }
        }
        if let Some(email) = &changes.email {
            member.email = email.clone();
        }
        if let Some(role) = changes.role {
            member.role = role;
        }
        member.updated_at = Utc::now();
        Ok(member.clone())
    }

    async fn activate_member_seat(
        &self,
        org_id: &OrganizationId,
        member_id: &OrgMemberId,
    ) -> Result<OrgMember, StoreError> {
        let mut state = self.state.lock().unwrap();
        let member = state
            .members
            .get(&member_id.0)
            .filter(|m| m.organization_id == *org_id)
            .cloned()
            .ok_or(StoreError::NotFound)?;

        if !member.holds_seat() {
            let sub = active_sub_for_org(&state, org_id).ok_or(StoreError::NotFound)?;
            if seats_held(&state, org_id) >= sub.seats {
                return Err(StoreError::SeatsExhausted);
            }
        }

        let member = state.members.get_mut(&member_id.0).unwrap();
        member.status = MemberStatus::Active;
        member.seat_reserved = true;
        member.updated_at = Utc::now();
        Ok(member.clone())
    }

    async fn link_member_user(
        &self,
        org_id: &OrganizationId,
        member_id: &OrgMemberId,
        user_id: &UserId,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let member = state
            .members
            .get_mut(&member_id.0)
            .filter(|m| m.organization_id == *org_id)
            .ok_or(StoreError::NotFound)?;
        member.user_id = Some(*user_id);
        member.updated_at = Utc::now();
        Ok(())
    }

    async fn release_member_seat(
        &self,
        org_id: &OrganizationId,
        member_id: &OrgMemberId,
    ) -> Result<OrgMember, StoreError> {
        let mut state = self.state.lock().unwrap();
        let member = state
            .members
            .get_mut(&member_id.0)
            .filter(|m| m.organization_id == *org_id)
            .ok_or(StoreError::NotFound)?;
        member.status = MemberStatus::Removed;
        member.seat_reserved = false;
        member.updated_at = Utc::now();
        Ok(member.clone())
    }

    // ───────────────────────────────────── Invitations ────────────────────────────────────

    async fn create_invitation(
        &self,
        params: &CreateInvitationParams,
    ) -> Result<Invitation, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state
            .invitations
            .values()
            .any(|i| i.token_hash == params.token_hash)
        {
            return Err(StoreError::AlreadyExists);
        }
        let now = Utc::now();
        let invitation = Invitation {
            id: InvitationId(Uuid::new_v4()),
            organization_id: params.organization_id,
            member_id: params.member_id,
            email: params.email.clone(),
            role: params.role,
            token_hash: params.token_hash.clone(),
            invited_by: params.invited_by,
            status: InvitationStatus::Pending,
            expires_at: params.expires_at,
            created_at: now,
            updated_at: now,
        };
        state.invitations.insert(invitation.id.0, invitation.clone());
        Ok(invitation)
    }

    async fn get_invitation_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Invitation, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .invitations
            .values()
            .find(|i| i.token_hash == token_hash)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_invitations(
        &self,
        org_id: &OrganizationId,
    ) -> Result<Vec<Invitation>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<_> = state
            .invitations
            .values()
            .filter(|i| i.organization_id == *org_id)
            .cloned()
            .collect();
        out.sort_by_key(|i| i.created_at);
        Ok(out)
    }

    async fn consume_invitation(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Invitation, StoreError> {
        let mut state = self.state.lock().unwrap();
        let invitation = state
            .invitations
            .values_mut()
            .find(|i| i.token_hash == token_hash)
            .ok_or(StoreError::NotFound)?;

        if invitation.status != InvitationStatus::Pending {
            return Err(StoreError::Conflict);
        }
        if invitation.expires_at <= now {
            invitation.status = InvitationStatus::Expired;
            invitation.updated_at = now;
            return Err(StoreError::Conflict);
        }
        invitation.status = InvitationStatus::Accepted;
        invitation.updated_at = now;
        Ok(invitation.clone())
    }

    // ───────────────────────────────────── Demo sessions ──────────────────────────────────

    async fn create_demo_session(
        &self,
        params: &CreateDemoSessionParams,
        now: DateTime<Utc>,
    ) -> Result<DemoSession, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.demo_sessions.values().any(|s| {
            s.user_id == params.user_id
                && s.status == DemoStatus::Active
                && s.expires_at > now
        }) {
            return Err(StoreError::Conflict);
        }
        let session = DemoSession {
            id: DemoSessionId(Uuid::new_v4()),
            user_id: params.user_id,
            tier: Tier::Basic,
            status: DemoStatus::Active,
            expires_at: params.expires_at,
            features_accessed: vec![],
            restrictions_hit: vec![],
            converted_to: None,
            created_at: now,
            updated_at: now,
        };
        state.demo_sessions.insert(session.id.0, session.clone());
        Ok(session)
    }

    async fn get_demo_session_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<DemoSession, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .demo_sessions
            .values()
            .filter(|s| s.user_id == *user_id)
            .max_by_key(|s| s.created_at)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn record_feature_access(
        &self,
        session_id: &DemoSessionId,
        feature: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .demo_sessions
            .get_mut(&session_id.0)
            .ok_or(StoreError::NotFound)?;
        if !session.features_accessed.iter().any(|f| f == feature) {
            session.features_accessed.push(feature.to_string());
        }
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn record_restriction_hit(
        &self,
        session_id: &DemoSessionId,
        feature: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .demo_sessions
            .get_mut(&session_id.0)
            .ok_or(StoreError::NotFound)?;
        session.restrictions_hit.push(RestrictionHit {
            feature: feature.to_string(),
            at,
        });
        session.updated_at = at;
        Ok(())
    }

    async fn set_demo_status(
        &self,
        session_id: &DemoSessionId,
        status: DemoStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .demo_sessions
            .get_mut(&session_id.0)
            .ok_or(StoreError::NotFound)?;
        session.status = status;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn set_demo_conversion(
        &self,
        session_id: &DemoSessionId,
        sub_id: &SubscriptionId,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .demo_sessions
            .get_mut(&session_id.0)
            .ok_or(StoreError::NotFound)?;
        session.status = DemoStatus::Converted;
        session.converted_to = Some(*sub_id);
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn set_demo_expiry(
        &self,
        session_id: &DemoSessionId,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .demo_sessions
            .get_mut(&session_id.0)
            .ok_or(StoreError::NotFound)?;
        session.expires_at = expires_at;
        session.updated_at = Utc::now();
        Ok(())
    }

    // ───────────────────────────────────── Payments ───────────────────────────────────────

    async fn create_payment(&self, params: &CreatePaymentParams) -> Result<PaymentId, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state
            .payments
            .values()
            .any(|p| p.gateway_ref == params.gateway_ref)
        {
            return Err(StoreError::AlreadyExists);
        }
        let id = PaymentId(Uuid::new_v4());
        let now = Utc::now();
        state.payments.insert(
            id.0,
            Payment {
                id,
                subscription_id: params.subscription_id,
                amount_cents: params.amount_cents,
                currency: params.currency.clone(),
                status: params.status,
                gateway_ref: params.gateway_ref.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get_payment_by_gateway_ref(
        &self,
        gateway_ref: &str,
    ) -> Result<Payment, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .payments
            .values()
            .find(|p| p.gateway_ref == gateway_ref)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn set_payment_status(
        &self,
        payment_id: &PaymentId,
        status: PaymentStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let payment = state
            .payments
            .get_mut(&payment_id.0)
            .ok_or(StoreError::NotFound)?;
        payment.status = status;
        payment.updated_at = Utc::now();
        Ok(())
    }

    async fn list_payments_for_subscription(
        &self,
        sub_id: &SubscriptionId,
    ) -> Result<Vec<Payment>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<_> = state
            .payments
            .values()
            .filter(|p| p.subscription_id == *sub_id)
            .cloned()
            .collect();
        out.sort_by_key(|p| p.created_at);
        Ok(out)
    }

    // ───────────────────────────────────── Processed events ───────────────────────────────

    async fn claim_event(&self, event_id: &str, event_type: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.processed_events.contains_key(event_id) {
            return Err(StoreError::AlreadyExists);
        }
        let now = Utc::now();
        state.processed_events.insert(
            event_id.to_string(),
            ProcessedEvent {
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                attempts: 0,
                last_error: None,
                succeeded: false,
                received_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn mark_event_outcome(
        &self,
        event_id: &str,
        attempts: i32,
        last_error: Option<&str>,
        succeeded: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let event = state
            .processed_events
            .get_mut(event_id)
            .ok_or(StoreError::NotFound)?;
        event.attempts = attempts;
        event.last_error = last_error.map(|s| s.to_string());
        event.succeeded = succeeded;
        event.updated_at = Utc::now();
        Ok(())
    }

    async fn get_processed_event(&self, event_id: &str) -> Result<ProcessedEvent, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .processed_events
            .get(event_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    async fn org_with_subscription(
        store: &MemoryStore,
        seats: i32,
    ) -> (OrganizationId, SubscriptionId) {
        let owner = store
            .create_user(&CreateUserParams {
                email: format!("owner-{}@example.com", Uuid::new_v4()),
                display_name: None,
                is_demo: false,
            })
            .await
            .unwrap();
        let org_id = store
            .create_organization(&CreateOrganizationParams {
                name: "acme".into(),
                owner_user_id: owner,
            })
            .await
            .unwrap();
        let now = Utc::now();
        let sub_id = store
            .create_subscription(&CreateSubscriptionParams {
                owner: SubscriptionOwner::Organization(org_id),
                tier: Tier::Enterprise,
                seats,
                billing_ref: None,
                current_period_start: now,
                current_period_end: now + Duration::days(30),
            })
            .await
            .unwrap();
        (org_id, sub_id)
    }

    #[tokio::test]
    async fn reserve_seat_enforces_ceiling() {
        let store = MemoryStore::new();
        let (org_id, _) = org_with_subscription(&store, 10).await;

        for i in 0..10 {
            store
                .reserve_seat(&CreateOrgMemberParams {
                    organization_id: org_id,
                    email: format!("m{}@example.com", i),
                    role: MemberRole::Member,
                    invited_by: None,
                })
                .await
                .unwrap();
        }

        let err = store
            .reserve_seat(&CreateOrgMemberParams {
                organization_id: org_id,
                email: "m10@example.com".into(),
                role: MemberRole::Member,
                invited_by: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SeatsExhausted));
    }

    #[tokio::test]
    async fn concurrent_reservations_grant_exactly_available_seats() {
        let store = Arc::new(MemoryStore::new());
        let owner = store
            .create_user(&CreateUserParams {
                email: "solo-owner@example.com".into(),
                display_name: None,
                is_demo: false,
            })
            .await
            .unwrap();
        let org_id = store
            .create_organization(&CreateOrganizationParams {
                name: "solo".into(),
                owner_user_id: owner,
            })
            .await
            .unwrap();
        let now = Utc::now();
        store
            .create_subscription(&CreateSubscriptionParams {
                owner: SubscriptionOwner::Organization(org_id),
                tier: Tier::Basic,
                seats: 1,
                billing_ref: None,
                current_period_start: now,
                current_period_end: now + Duration::days(30),
            })
            .await
            .unwrap();

        let mut handles = vec![];
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .reserve_seat(&CreateOrgMemberParams {
                        organization_id: org_id,
                        email: format!("racer{}@example.com", i),
                        role: MemberRole::Member,
                        invited_by: None,
                    })
                    .await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(store.count_seats_held(&org_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancellation_sets_status_and_flag_in_one_write() {
        let store = MemoryStore::new();
        let (_, sub_id) = org_with_subscription(&store, 10).await;

        store
            .set_cancellation(&sub_id, SubscriptionStatus::Cancelled, true)
            .await
            .unwrap();
        let sub = store.get_subscription(&sub_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Cancelled);
        assert!(sub.cancel_at_period_end);

        store
            .set_cancellation(&sub_id, SubscriptionStatus::Active, false)
            .await
            .unwrap();
        let sub = store.get_subscription(&sub_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(!sub.cancel_at_period_end);

        let missing = SubscriptionId(Uuid::new_v4());
        let err = store
            .set_cancellation(&missing, SubscriptionStatus::Cancelled, true)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn license_uniqueness_per_user_and_subscription() {
        let store = MemoryStore::new();
        let (_, sub_id) = org_with_subscription(&store, 10).await;
        let user = UserId(Uuid::new_v4());

        store
            .create_license_checked(&CreateLicenseParams {
                key: "KG-AAAA-BBBB-CCCC-DDDD-EEEE".into(),
                subscription_id: sub_id,
                user_id: user,
                tier: Tier::Enterprise,
                status: LicenseStatus::Pending,
                expires_at: None,
            })
            .await
            .unwrap();

        let err = store
            .create_license_checked(&CreateLicenseParams {
                key: "KG-FFFF-GGGG-HHHH-JJJJ-KKKK".into(),
                subscription_id: sub_id,
                user_id: user,
                tier: Tier::Enterprise,
                status: LicenseStatus::Pending,
                expires_at: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateLicense));
    }

    #[tokio::test]
    async fn license_ceiling_tracks_seat_count() {
        let store = MemoryStore::new();
        let (_, sub_id) = org_with_subscription(&store, 10).await;

        for i in 0..10 {
            store
                .create_license_checked(&CreateLicenseParams {
                    key: format!("KG-SEAT-{:04}-AAAA-BBBB-CCCC", i),
                    subscription_id: sub_id,
                    user_id: UserId(Uuid::new_v4()),
                    tier: Tier::Enterprise,
                    status: LicenseStatus::Pending,
                    expires_at: None,
                })
                .await
                .unwrap();
        }

        let err = store
            .create_license_checked(&CreateLicenseParams {
                key: "KG-OVER-0000-AAAA-BBBB-CCCC".into(),
                subscription_id: sub_id,
                user_id: UserId(Uuid::new_v4()),
                tier: Tier::Enterprise,
                status: LicenseStatus::Pending,
                expires_at: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SeatsExhausted));
    }

    #[tokio::test]
    async fn revoked_license_frees_a_seat() {
        let store = MemoryStore::new();
        let (_, sub_id) = org_with_subscription(&store, 10).await;

        let mut last = None;
        for i in 0..10 {
            last = Some(
                store
                    .create_license_checked(&CreateLicenseParams {
                        key: format!("KG-FREE-{:04}-AAAA-BBBB-CCCC", i),
                        subscription_id: sub_id,
                        user_id: UserId(Uuid::new_v4()),
                        tier: Tier::Enterprise,
                        status: LicenseStatus::Active,
                        expires_at: None,
                    })
                    .await
                    .unwrap(),
            );
        }

        store
            .set_license_status(&last.unwrap().id, LicenseStatus::Revoked)
            .await
            .unwrap();

        store
            .create_license_checked(&CreateLicenseParams {
                key: "KG-REUS-0000-AAAA-BBBB-CCCC".into(),
                subscription_id: sub_id,
                user_id: UserId(Uuid::new_v4()),
                tier: Tier::Enterprise,
                status: LicenseStatus::Pending,
                expires_at: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn invitation_is_single_use() {
        let store = MemoryStore::new();
        let (org_id, _) = org_with_subscription(&store, 10).await;
        let member = store
            .reserve_seat(&CreateOrgMemberParams {
                organization_id: org_id,
                email: "invitee@example.com".into(),
                role: MemberRole::Member,
                invited_by: None,
            })
            .await
            .unwrap();

        let now = Utc::now();
        store
            .create_invitation(&CreateInvitationParams {
                organization_id: org_id,
                member_id: member.id,
                email: "invitee@example.com".into(),
                role: MemberRole::Member,
                token_hash: "hash-1".into(),
                invited_by: UserId(Uuid::new_v4()),
                expires_at: now + Duration::days(7),
            })
            .await
            .unwrap();

        store.consume_invitation("hash-1", now).await.unwrap();
        let err = store.consume_invitation("hash-1", now).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
    }

    #[tokio::test]
    async fn expired_invitation_is_rejected_and_marked() {
        let store = MemoryStore::new();
        let (org_id, _) = org_with_subscription(&store, 10).await;
        let member = store
            .reserve_seat(&CreateOrgMemberParams {
                organization_id: org_id,
                email: "late@example.com".into(),
                role: MemberRole::Member,
                invited_by: None,
            })
            .await
            .unwrap();

        let now = Utc::now();
        store
            .create_invitation(&CreateInvitationParams {
                organization_id: org_id,
                member_id: member.id,
                email: "late@example.com".into(),
                role: MemberRole::Member,
                token_hash: "hash-2".into(),
                invited_by: UserId(Uuid::new_v4()),
                expires_at: now - Duration::seconds(1),
            })
            .await
            .unwrap();

        let err = store.consume_invitation("hash-2", now).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
        let invitation = store.get_invitation_by_token_hash("hash-2").await.unwrap();
        assert_eq!(invitation.status, InvitationStatus::Expired);
    }

    #[tokio::test]
    async fn event_claim_is_exclusive() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = vec![];
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(
                async move { store.claim_event("evt_1", "payment.succeeded").await },
            ));
        }
        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn device_binding_is_idempotent_and_capped() {
        let store = MemoryStore::new();
        let (_, sub_id) = org_with_subscription(&store, 10).await;
        let license = store
            .create_license_checked(&CreateLicenseParams {
                key: "KG-DEVC-0000-AAAA-BBBB-CCCC".into(),
                subscription_id: sub_id,
                user_id: UserId(Uuid::new_v4()),
                tier: Tier::Enterprise,
                status: LicenseStatus::Active,
                expires_at: None,
            })
            .await
            .unwrap();

        let device = |id: &str| DeviceBinding {
            device_id: id.to_string(),
            platform: "macos".into(),
            app_version: "3.1.0".into(),
            activated_at: Utc::now(),
            last_seen_at: None,
        };

        for i in 0..2 {
            store
                .bind_device(&license.id, &device(&format!("dev-{}", i)), 2)
                .await
                .unwrap();
        }
        // Re-binding an existing device is a no-op, not a cap violation.
        let bound = store.bind_device(&license.id, &device("dev-0"), 2).await.unwrap();
        assert_eq!(bound.devices.len(), 2);

        let err = store
            .bind_device(&license.id, &device("dev-2"), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
    }

    #[tokio::test]
    async fn seat_decrease_below_held_seats_conflicts() {
        let store = MemoryStore::new();
        let (org_id, sub_id) = org_with_subscription(&store, 10).await;
        for i in 0..3 {
            store
                .reserve_seat(&CreateOrgMemberParams {
                    organization_id: org_id,
                    email: format!("held{}@example.com", i),
                    role: MemberRole::Member,
                    invited_by: None,
                })
                .await
                .unwrap();
        }
        // 3 seats held; shrinking to 10 seats is fine, to 2 is not.
        store
            .update_subscription_plan(&sub_id, Tier::Enterprise, 10)
            .await
            .unwrap();
        let err = store
            .update_subscription_plan(&sub_id, Tier::Enterprise, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
    }

    #[tokio::test]
    async fn only_one_active_demo_session_per_user() {
        let store = MemoryStore::new();
        let user = UserId(Uuid::new_v4());
        let now = Utc::now();

        store
            .create_demo_session(
                &CreateDemoSessionParams {
                    user_id: user,
                    expires_at: now + Duration::days(14),
                },
                now,
            )
            .await
            .unwrap();

        let err = store
            .create_demo_session(
                &CreateDemoSessionParams {
                    user_id: user,
                    expires_at: now + Duration::days(14),
                },
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
    }
}
