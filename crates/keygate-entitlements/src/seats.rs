//! Organization seat allocation: invitations, membership state, and
//! just-in-time license issuance on acceptance.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use keygate_audit::{AuditAction, AuditEvent, AuditLog};
use keygate_storage::{
    CreateInvitationParams, CreateLicenseParams, CreateOrgMemberParams, Invitation, License,
    LicenseStatus, MemberRole, MemberStatus, OrgMember, OrgMemberChanges, OrgMemberId,
    OrganizationId, Store, StoreError, UserId,
};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::licenses::{generate_license_key, JIT_LICENSE_MONTHS};
use crate::{record_audit, EntitlementError};

/// Invitation validity window.
pub const INVITATION_TTL_DAYS: i64 = 7;

const TOKEN_LEN: usize = 32;
const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Opaque seam to the identity/account provider: create or update a
/// login-capable account keyed by email.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn create_or_update_account(
        &self,
        email: &str,
    ) -> Result<UserId, IdentityProviderError>;
}

#[derive(Debug, Error)]
#[error("identity provider error: {0}")]
pub struct IdentityProviderError(pub String);

/// Result of a successful invite. `token` is the invitation secret,
/// handed out exactly once; only its hash is stored.
#[derive(Clone, Debug)]
pub struct SeatInvite {
    pub member: OrgMember,
    pub invitation: Invitation,
    pub token: String,
}

/// Result of accepting an invitation. `license` is Some when a
/// just-in-time license was minted for the accepting user.
#[derive(Clone, Debug)]
pub struct AcceptedInvitation {
    pub member: OrgMember,
    pub license: Option<License>,
}

pub struct SeatAllocator<S> {
    store: Arc<S>,
    audit: Arc<dyn AuditLog>,
    identity: Arc<dyn IdentityProvider>,
}

fn generate_invite_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
        .collect()
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl<S: Store> SeatAllocator<S> {
    pub fn new(store: Arc<S>, audit: Arc<dyn AuditLog>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            store,
            audit,
            identity,
        }
    }

    async fn require_admin(
        &self,
        org_id: &OrganizationId,
        caller: &UserId,
    ) -> Result<(), EntitlementError> {
        let org = self.store.get_organization(org_id).await.map_err(|_| {
            EntitlementError::NotFound("organization not found".into())
        })?;
        if org.owner_user_id == *caller {
            return Ok(());
        }
        if let Ok(member) = self.store.get_member_for_user(org_id, caller).await {
            if member.status == MemberStatus::Active && member.role.includes(&MemberRole::Admin) {
                return Ok(());
            }
        }
        Err(EntitlementError::Forbidden(
            "caller is not an organization owner or admin".into(),
        ))
    }

    /// Invite an email into the organization. The seat reservation and the
    /// ceiling check happen in one store transaction, so concurrent
    /// invites can never oversubscribe the organization.
    pub async fn invite(
        &self,
        caller: &UserId,
        org_id: &OrganizationId,
        email: &str,
        role: MemberRole,
    ) -> Result<SeatInvite, EntitlementError> {
        if !email.contains('@') {
            return Err(EntitlementError::Validation("email is not valid".into()));
        }
        if role == MemberRole::Owner {
            return Err(EntitlementError::Validation(
                "cannot invite a member as owner".into(),
            ));
        }
        self.require_admin(org_id, caller).await?;

        let member = self
            .store
            .reserve_seat(&CreateOrgMemberParams {
                organization_id: *org_id,
                email: email.to_string(),
                role,
                invited_by: Some(*caller),
            })
            .await
            .map_err(|err| match err {
                StoreError::SeatsExhausted => {
                    EntitlementError::Conflict("no seats available".into())
                }
                StoreError::AlreadyExists => {
                    EntitlementError::Conflict("email is already a member".into())
                }
                StoreError::NotFound => EntitlementError::Conflict(
                    "organization has no active subscription".into(),
                ),
                other => other.into(),
            })?;

        let token = generate_invite_token();
        let invitation = self
            .store
            .create_invitation(&CreateInvitationParams {
                organization_id: *org_id,
                member_id: member.id,
                email: email.to_string(),
                role,
                token_hash: hash_token(&token),
                invited_by: *caller,
                expires_at: Utc::now() + Duration::days(INVITATION_TTL_DAYS),
            })
            .await?;

        tracing::info!(organization_id = %org_id, member_id = %member.id, "seat reserved and invitation issued");
        record_audit(
            self.audit.as_ref(),
            AuditEvent::builder(AuditAction::MemberInvite)
                .actor(Some(caller))
                .resource("member", member.id.to_string())
                .organization_id(Some(org_id))
                .details(serde_json::json!({ "email": email, "role": role.as_str() }))
                .build(),
        )
        .await;

        Ok(SeatInvite {
            member,
            invitation,
            token,
        })
    }

    /// Accept an invitation by its secret token. Consumption is a single
    /// atomic store op (single-use); links the member to the accepting
    /// user and mints exactly one just-in-time PENDING license when the
    /// user holds none on the organization's active subscription.
    pub async fn accept_invitation(
        &self,
        token: &str,
        accepting_user: &UserId,
    ) -> Result<AcceptedInvitation, EntitlementError> {
        let now = Utc::now();
        let invitation = self
            .store
            .consume_invitation(&hash_token(token), now)
            .await
            .map_err(|err| match err {
                StoreError::NotFound => EntitlementError::NotFound("invitation not found".into()),
                StoreError::Conflict => EntitlementError::Conflict(
                    "invitation already used or expired".into(),
                ),
                other => other.into(),
            })?;

        let org_id = invitation.organization_id;
        self.store
            .link_member_user(&org_id, &invitation.member_id, accepting_user)
            .await?;
        // The seat was reserved at invite time, so activation cannot hit
        // the ceiling here.
        let member = self
            .store
            .activate_member_seat(&org_id, &invitation.member_id)
            .await?;

        let sub = self.store.get_active_subscription_for_org(&org_id).await?;
        let holds_license = self
            .store
            .list_licenses_for_user(accepting_user)
            .await?
            .iter()
            .any(|l| l.subscription_id == sub.id && l.is_non_terminal());
        let license = if holds_license {
            None
        } else {
            match self
                .store
                .create_license_checked(&CreateLicenseParams {
                    key: generate_license_key(),
                    subscription_id: sub.id,
                    user_id: *accepting_user,
                    tier: sub.tier,
                    status: LicenseStatus::Pending,
                    expires_at: Some(now + chrono::Months::new(JIT_LICENSE_MONTHS)),
                })
                .await
            {
                Ok(license) => Some(license),
                // A concurrent issuance path won the race; the user holds a
                // license either way.
                Err(StoreError::DuplicateLicense) => None,
                Err(err) => return Err(err.into()),
            }
        };

        record_audit(
            self.audit.as_ref(),
            AuditEvent::builder(AuditAction::InviteConsume)
                .actor(Some(accepting_user))
                .resource("invitation", invitation.id.to_string())
                .organization_id(Some(&org_id))
                .subscription_id(Some(&sub.id))
                .details(serde_json::json!({
                    "member_id": member.id.to_string(),
                    "license_minted": license.is_some(),
                }))
                .build(),
        )
        .await;

        Ok(AcceptedInvitation { member, license })
    }

    /// Remove a member: releases the seat and revokes the member's
    /// non-terminal licenses under the organization's subscriptions.
    pub async fn remove_member(
        &self,
        caller: &UserId,
        org_id: &OrganizationId,
        member_id: &OrgMemberId,
    ) -> Result<OrgMember, EntitlementError> {
        self.require_admin(org_id, caller).await?;
        let member = self
            .store
            .get_org_member(org_id, member_id)
            .await
            .map_err(|_| EntitlementError::NotFound("member not found".into()))?;
        if member.status == MemberStatus::Removed {
            return Ok(member);
        }

        let member = self.store.release_member_seat(org_id, member_id).await?;

        let mut revoked = 0;
        if let Some(user_id) = member.user_id {
            for license in self.store.list_licenses_for_user(&user_id).await? {
                if !license.is_non_terminal() {
                    continue;
                }
                let sub = self.store.get_subscription(&license.subscription_id).await?;
                if sub.owner.organization_id() == Some(*org_id) {
                    self.store
                        .set_license_status(&license.id, LicenseStatus::Revoked)
                        .await?;
                    revoked += 1;
                }
            }
        }

        tracing::info!(organization_id = %org_id, member_id = %member_id, revoked, "member removed");
        record_audit(
            self.audit.as_ref(),
            AuditEvent::builder(AuditAction::MemberRemove)
                .actor(Some(caller))
                .resource("member", member_id.to_string())
                .organization_id(Some(org_id))
                .details(serde_json::json!({ "licenses_revoked": revoked }))
                .build(),
        )
        .await;

        Ok(member)
    }

    /// Update member fields. Re-activating a previously non-ACTIVE member
    /// re-checks the seat ceiling exactly like `invite`.
    pub async fn update_member(
        &self,
        caller: &UserId,
        org_id: &OrganizationId,
        member_id: &OrgMemberId,
        changes: OrgMemberChanges,
    ) -> Result<OrgMember, EntitlementError> {
        self.require_admin(org_id, caller).await?;

        let member = if changes.status == Some(MemberStatus::Active) {
            self.store
                .activate_member_seat(org_id, member_id)
                .await
                .map_err(|err| match err {
                    StoreError::SeatsExhausted => {
                        EntitlementError::Conflict("no seats available".into())
                    }
                    StoreError::NotFound => {
                        EntitlementError::NotFound("member not found".into())
                    }
                    other => other.into(),
                })?;
            let rest = OrgMemberChanges {
                status: None,
                ..changes
            };
            if rest.email.is_some() || rest.role.is_some() {
                self.store.update_member(org_id, member_id, &rest).await?
            } else {
                self.store.get_org_member(org_id, member_id).await?
            }
        } else {
            self.store
                .update_member(org_id, member_id, &changes)
                .await
                .map_err(|err| match err {
                    StoreError::NotFound => {
                        EntitlementError::NotFound("member not found".into())
                    }
                    other => other.into(),
                })?
        };

        record_audit(
            self.audit.as_ref(),
            AuditEvent::builder(AuditAction::MemberUpdate)
                .actor(Some(caller))
                .resource("member", member_id.to_string())
                .organization_id(Some(org_id))
                .build(),
        )
        .await;

        Ok(member)
    }

    /// Read-only check: does this email belong to an ACTIVE member of the
    /// organization? Used by other subsystems to gate org-scoped actions.
    pub async fn authorize_member(
        &self,
        org_id: &OrganizationId,
        email: &str,
    ) -> Result<bool, EntitlementError> {
        match self.store.get_member_by_email(org_id, email).await {
            Ok(member) => Ok(member.status == MemberStatus::Active),
            Err(StoreError::NotFound) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Admin-initiated provisioning: create or update a login-capable
    /// account for the member via the identity provider, then link it.
    pub async fn provision_member_account(
        &self,
        caller: &UserId,
        org_id: &OrganizationId,
        member_id: &OrgMemberId,
    ) -> Result<UserId, EntitlementError> {
        self.require_admin(org_id, caller).await?;
        let member = self
            .store
            .get_org_member(org_id, member_id)
            .await
            .map_err(|_| EntitlementError::NotFound("member not found".into()))?;

        let user_id = self
            .identity
            .create_or_update_account(&member.email)
            .await
            .map_err(|err| EntitlementError::External(err.to_string()))?;
        self.store
            .link_member_user(org_id, member_id, &user_id)
            .await?;

        record_audit(
            self.audit.as_ref(),
            AuditEvent::builder(AuditAction::MemberProvision)
                .actor(Some(caller))
                .resource("member", member_id.to_string())
                .organization_id(Some(org_id))
                .build(),
        )
        .await;

        Ok(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygate_audit::MemoryAuditLog;
    use keygate_store_memory::MemoryStore;
    use keygate_storage::{
        CreateOrganizationParams, CreateSubscriptionParams, CreateUserParams, SubscriptionOwner,
        Tier,
    };
    use uuid::Uuid;

    struct StubIdentity;

    #[async_trait]
    impl IdentityProvider for StubIdentity {
        async fn create_or_update_account(
            &self,
            _email: &str,
        ) -> Result<UserId, IdentityProviderError> {
            Ok(UserId(Uuid::new_v4()))
        }
    }

    fn allocator() -> (Arc<MemoryStore>, SeatAllocator<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditLog::new());
        let allocator = SeatAllocator::new(Arc::clone(&store), audit, Arc::new(StubIdentity));
        (store, allocator)
    }

    async fn user(store: &MemoryStore) -> UserId {
        store
            .create_user(&CreateUserParams {
                email: format!("{}@example.com", Uuid::new_v4()),
                display_name: None,
                is_demo: false,
            })
            .await
            .unwrap()
    }

    async fn org_with_seats(
        store: &MemoryStore,
        owner: UserId,
        seats: i32,
    ) -> OrganizationId {
        let org_id = store
            .create_organization(&CreateOrganizationParams {
                name: "acme".into(),
                owner_user_id: owner,
            })
            .await
            .unwrap();
        let now = Utc::now();
        store
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
        org_id
    }

    #[tokio::test]
    async fn invite_requires_admin() {
        let (store, allocator) = allocator();
        let owner = user(&store).await;
        let stranger = user(&store).await;
        let org_id = org_with_seats(&store, owner, 10).await;

        let err = allocator
            .invite(&stranger, &org_id, "new@example.com", MemberRole::Member)
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::Forbidden(_)));

        let invite = allocator
            .invite(&owner, &org_id, "new@example.com", MemberRole::Member)
            .await
            .unwrap();
        assert_eq!(invite.member.status, MemberStatus::Invited);
        assert!(invite.member.seat_reserved);
        // The stored hash is not the secret.
        assert_ne!(invite.invitation.token_hash, invite.token);
    }

    #[tokio::test]
    async fn accept_links_and_mints_one_pending_license() {
        let (store, allocator) = allocator();
        let owner = user(&store).await;
        let org_id = org_with_seats(&store, owner, 10).await;

        let invite = allocator
            .invite(&owner, &org_id, "new@example.com", MemberRole::Member)
            .await
            .unwrap();
        let accepting = user(&store).await;
        let accepted = allocator
            .accept_invitation(&invite.token, &accepting)
            .await
            .unwrap();

        assert_eq!(accepted.member.status, MemberStatus::Active);
        assert_eq!(accepted.member.user_id, Some(accepting));
        let license = accepted.license.expect("just-in-time license");
        assert_eq!(license.status, LicenseStatus::Pending);
        assert!(license.expires_at.is_some());

        // Same token a second time fails.
        let another = user(&store).await;
        let err = allocator
            .accept_invitation(&invite.token, &another)
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::Conflict(_)));
    }

    #[tokio::test]
    async fn accept_does_not_mint_a_second_license() {
        let (store, allocator) = allocator();
        let owner = user(&store).await;
        let org_id = org_with_seats(&store, owner, 10).await;
        let sub = store.get_active_subscription_for_org(&org_id).await.unwrap();

        let accepting = user(&store).await;
        store
            .create_license_checked(&CreateLicenseParams {
                key: "KG-HELD-0000-AAAA-BBBB-CCCC".into(),
                subscription_id: sub.id,
                user_id: accepting,
                tier: Tier::Enterprise,
                status: LicenseStatus::Active,
                expires_at: None,
            })
            .await
            .unwrap();

        let invite = allocator
            .invite(&owner, &org_id, "holder@example.com", MemberRole::Member)
            .await
            .unwrap();
        let accepted = allocator
            .accept_invitation(&invite.token, &accepting)
            .await
            .unwrap();
        assert!(accepted.license.is_none());
    }

    #[tokio::test]
    async fn invite_ceiling_yields_no_seats_available() {
        let (store, allocator) = allocator();
        let owner = user(&store).await;
        let org_id = org_with_seats(&store, owner, 10).await;

        for i in 0..10 {
            allocator
                .invite(&owner, &org_id, &format!("m{}@example.com", i), MemberRole::Member)
                .await
                .unwrap();
        }
        let err = allocator
            .invite(&owner, &org_id, "m10@example.com", MemberRole::Member)
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::Conflict(_)));
        assert!(err.to_string().contains("no seats available"));
    }

    #[tokio::test]
    async fn remove_member_revokes_licenses_and_frees_the_seat() {
        let (store, allocator) = allocator();
        let owner = user(&store).await;
        let org_id = org_with_seats(&store, owner, 10).await;

        let invite = allocator
            .invite(&owner, &org_id, "leaver@example.com", MemberRole::Member)
            .await
            .unwrap();
        let leaver = user(&store).await;
        let accepted = allocator
            .accept_invitation(&invite.token, &leaver)
            .await
            .unwrap();
        let license_id = accepted.license.unwrap().id;
        let seats_before = store.count_seats_held(&org_id).await.unwrap();

        let removed = allocator
            .remove_member(&owner, &org_id, &accepted.member.id)
            .await
            .unwrap();
        assert_eq!(removed.status, MemberStatus::Removed);
        assert!(!removed.seat_reserved);
        assert_eq!(
            store.count_seats_held(&org_id).await.unwrap(),
            seats_before - 1
        );
        assert_eq!(
            store.get_license(&license_id).await.unwrap().status,
            LicenseStatus::Revoked
        );
    }

    #[tokio::test]
    async fn reactivation_rechecks_the_ceiling() {
        let (store, allocator) = allocator();
        let owner = user(&store).await;
        let org_id = org_with_seats(&store, owner, 10).await;

        // Fill all seats, then suspend-and-release one.
        let mut first_member = None;
        for i in 0..10 {
            let invite = allocator
                .invite(&owner, &org_id, &format!("m{}@example.com", i), MemberRole::Member)
                .await
                .unwrap();
            if first_member.is_none() {
                first_member = Some(invite.member.id);
            }
        }
        let suspended = first_member.unwrap();
        allocator
            .remove_member(&owner, &org_id, &suspended)
            .await
            .unwrap();

        // The freed seat goes to a new invite.
        let invite = allocator
            .invite(&owner, &org_id, "replacement@example.com", MemberRole::Member)
            .await
            .unwrap();
        assert!(invite.member.seat_reserved);

        // Re-activating the removed member must now fail the ceiling.
        let err = allocator
            .update_member(
                &owner,
                &org_id,
                &suspended,
                OrgMemberChanges {
                    status: Some(MemberStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::Conflict(_)));
    }

    #[tokio::test]
    async fn authorize_member_checks_active_status() {
        let (store, allocator) = allocator();
        let owner = user(&store).await;
        let org_id = org_with_seats(&store, owner, 10).await;

        assert!(!allocator
            .authorize_member(&org_id, "ghost@example.com")
            .await
            .unwrap());

        let invite = allocator
            .invite(&owner, &org_id, "pending@example.com", MemberRole::Member)
            .await
            .unwrap();
        // Invited but not yet accepted: not authorized.
        assert!(!allocator
            .authorize_member(&org_id, "pending@example.com")
            .await
            .unwrap());

        let accepting = user(&store).await;
        allocator
            .accept_invitation(&invite.token, &accepting)
            .await
            .unwrap();
        assert!(allocator
            .authorize_member(&org_id, "pending@example.com")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn provision_links_an_account() {
        let (store, allocator) = allocator();
        let owner = user(&store).await;
        let org_id = org_with_seats(&store, owner, 10).await;
        let invite = allocator
            .invite(&owner, &org_id, "prov@example.com", MemberRole::Member)
            .await
            .unwrap();

        let user_id = allocator
            .provision_member_account(&owner, &org_id, &invite.member.id)
            .await
            .unwrap();
        let member = store
            .get_org_member(&org_id, &invite.member.id)
            .await
            .unwrap();
        assert_eq!(member.user_id, Some(user_id));
    }
}
