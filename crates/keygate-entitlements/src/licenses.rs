//! License pool: minting, device activation, validation, transfer, and
//! the duplicate-repair tool.

use std::sync::Arc;

use chrono::{Months, Utc};
use keygate_audit::{AuditAction, AuditEvent, AuditLog};
use keygate_storage::{
    CreateLicenseParams, CreateTransferIntentParams, DeviceBinding, License, LicenseStatus,
    MemberRole, MemberStatus, Store, StoreError, SubscriptionId, SubscriptionOwner, Tier,
    TransferIntent, UserId,
};
use rand::Rng;
use serde::Serialize;

use crate::{record_audit, EntitlementError};

/// Device cap per license.
pub const MAX_DEVICES: usize = 5;

/// Duration of licenses minted just-in-time on invitation acceptance.
pub const JIT_LICENSE_MONTHS: u32 = 12;

const KEY_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const KEY_GROUPS: usize = 5;
const KEY_GROUP_LEN: usize = 4;

/// Generate an opaque license key: `KG-` followed by 20 random uppercase
/// alphanumerics in groups of 4. Treated as a secret; log only the
/// redacted form.
pub fn generate_license_key() -> String {
    let mut rng = rand::thread_rng();
    let mut key = String::with_capacity(3 + KEY_GROUPS * (KEY_GROUP_LEN + 1));
    key.push_str("KG");
    for _ in 0..KEY_GROUPS {
        key.push('-');
        for _ in 0..KEY_GROUP_LEN {
            let idx = rng.gen_range(0..KEY_CHARSET.len());
            key.push(KEY_CHARSET[idx] as char);
        }
    }
    key
}

/// Options for minting licenses.
#[derive(Clone, Debug)]
pub struct MintOptions {
    pub initial_status: LicenseStatus,
    pub duration_months: Option<u32>,
}

impl Default for MintOptions {
    fn default() -> Self {
        Self {
            initial_status: LicenseStatus::Pending,
            duration_months: Some(JIT_LICENSE_MONTHS),
        }
    }
}

/// Device info supplied by the product client at activation time.
#[derive(Clone, Debug)]
pub struct DeviceRequest {
    pub device_id: String,
    pub platform: String,
    pub app_version: String,
}

/// Per-tier client configuration returned from activation.
#[derive(Clone, Debug, Serialize)]
pub struct ClientConfig {
    pub tier: Tier,
    pub features: Vec<&'static str>,
    pub max_devices: usize,
}

impl ClientConfig {
    pub fn for_tier(tier: Tier) -> Self {
        let features = match tier {
            Tier::Basic => vec![
                "callsheets.basic",
                "sessions.core",
                "files.basic",
                "reports.basic",
            ],
            Tier::Pro => vec![
                "callsheets.basic",
                "callsheets.advanced",
                "sessions.core",
                "files.basic",
                "files.sync",
                "reports.basic",
                "reports.advanced",
            ],
            Tier::Enterprise => vec![
                "callsheets.basic",
                "callsheets.advanced",
                "sessions.core",
                "files.basic",
                "files.sync",
                "reports.basic",
                "reports.advanced",
                "org.seats",
                "org.sso",
            ],
        };
        Self {
            tier,
            features,
            max_devices: MAX_DEVICES,
        }
    }
}

/// Result of a successful activation.
#[derive(Clone, Debug)]
pub struct Activation {
    pub license: License,
    pub config: ClientConfig,
}

/// Result of a validation query.
#[derive(Clone, Debug)]
pub struct LicenseValidation {
    pub valid: bool,
    pub license: Option<License>,
}

pub struct LicensePool<S> {
    store: Arc<S>,
    audit: Arc<dyn AuditLog>,
}

impl<S: Store> LicensePool<S> {
    pub fn new(store: Arc<S>, audit: Arc<dyn AuditLog>) -> Self {
        Self { store, audit }
    }

    /// Mint one license per recipient against a subscription. Each create
    /// is checked atomically in the store: the seat ceiling and the
    /// per-(user, subscription) uniqueness cannot be violated even under
    /// concurrent mints.
    pub async fn mint(
        &self,
        sub_id: &SubscriptionId,
        recipients: &[UserId],
        opts: MintOptions,
    ) -> Result<Vec<License>, EntitlementError> {
        if recipients.is_empty() {
            return Err(EntitlementError::Validation(
                "at least one recipient is required".into(),
            ));
        }
        if opts.initial_status.is_terminal() {
            return Err(EntitlementError::Validation(
                "initial status must be pending or active".into(),
            ));
        }
        let sub = self.store.get_subscription(sub_id).await.map_err(|_| {
            EntitlementError::NotFound("subscription not found".into())
        })?;

        let now = Utc::now();
        let expires_at = opts
            .duration_months
            .map(|months| now + Months::new(months));

        let mut minted = Vec::with_capacity(recipients.len());
        for user_id in recipients {
            let license = self
                .store
                .create_license_checked(&CreateLicenseParams {
                    key: generate_license_key(),
                    subscription_id: *sub_id,
                    user_id: *user_id,
                    tier: sub.tier,
                    status: opts.initial_status,
                    expires_at,
                })
                .await
                .map_err(|err| match err {
                    StoreError::SeatsExhausted => EntitlementError::Conflict(
                        "no seats available".into(),
                    ),
                    other => other.into(),
                })?;

            tracing::info!(
                license_id = %license.id,
                key = license.redacted_key(),
                subscription_id = %sub_id,
                "license minted"
            );
            record_audit(
                self.audit.as_ref(),
                AuditEvent::builder(AuditAction::LicenseMint)
                    .resource("license", license.id.to_string())
                    .subscription_id(Some(sub_id))
                    .license_id(Some(&license.id))
                    .details(serde_json::json!({
                        "key": license.redacted_key(),
                        "user_id": user_id.to_string(),
                    }))
                    .build(),
            )
            .await;
            minted.push(license);
        }
        Ok(minted)
    }

    /// Activate a license on a device. Idempotent per (key, device id):
    /// re-activating an already-bound device returns the same result. A
    /// PENDING license transitions to ACTIVE on first activation.
    pub async fn activate(
        &self,
        key: &str,
        device: &DeviceRequest,
    ) -> Result<Activation, EntitlementError> {
        let license = self.store.get_license_by_key(key).await.map_err(|_| {
            EntitlementError::NotFound("license key not found".into())
        })?;

        let now = Utc::now();
        if license.status.is_terminal() {
            return Err(EntitlementError::Forbidden(
                "license is revoked or expired".into(),
            ));
        }
        if let Some(expires_at) = license.expires_at {
            if now >= expires_at {
                // Lazily settle the stored status before rejecting.
                self.store
                    .set_license_status(&license.id, LicenseStatus::Expired)
                    .await?;
                return Err(EntitlementError::Forbidden("license has expired".into()));
            }
        }

        let binding = DeviceBinding {
            device_id: device.device_id.clone(),
            platform: device.platform.clone(),
            app_version: device.app_version.clone(),
            activated_at: now,
            last_seen_at: Some(now),
        };
        let license = self
            .store
            .bind_device(&license.id, &binding, MAX_DEVICES)
            .await
            .map_err(|err| match err {
                StoreError::Conflict => EntitlementError::Conflict(
                    format!("device limit of {} reached", MAX_DEVICES),
                ),
                other => other.into(),
            })?;

        let license = if license.status == LicenseStatus::Pending {
            self.store
                .set_license_status(&license.id, LicenseStatus::Active)
                .await?;
            self.store.get_license(&license.id).await?
        } else {
            license
        };

        record_audit(
            self.audit.as_ref(),
            AuditEvent::builder(AuditAction::LicenseActivate)
                .actor(Some(&license.user_id))
                .resource("license", license.id.to_string())
                .subscription_id(Some(&license.subscription_id))
                .license_id(Some(&license.id))
                .details(serde_json::json!({
                    "device_id": device.device_id,
                    "platform": device.platform,
                }))
                .build(),
        )
        .await;

        let config = ClientConfig::for_tier(license.tier);
        Ok(Activation { license, config })
    }

    /// Deactivate (revoke) a license. Only the owning user or an
    /// Owner/Admin of the owning organization may do this. A no-op when
    /// the license is already inactive.
    pub async fn deactivate(
        &self,
        key: &str,
        caller: &UserId,
        reason: &str,
    ) -> Result<License, EntitlementError> {
        let license = self.store.get_license_by_key(key).await.map_err(|_| {
            EntitlementError::NotFound("license key not found".into())
        })?;

        if license.user_id != *caller {
            self.require_org_admin(&license.subscription_id, caller)
                .await?;
        }

        if license.status.is_terminal() {
            return Ok(license);
        }

        self.store
            .set_license_status(&license.id, LicenseStatus::Revoked)
            .await?;
        let license = self.store.get_license(&license.id).await?;

        tracing::info!(license_id = %license.id, key = license.redacted_key(), "license deactivated");
        record_audit(
            self.audit.as_ref(),
            AuditEvent::builder(AuditAction::LicenseDeactivate)
                .actor(Some(caller))
                .resource("license", license.id.to_string())
                .subscription_id(Some(&license.subscription_id))
                .license_id(Some(&license.id))
                .reason(reason)
                .build(),
        )
        .await;

        Ok(license)
    }

    /// Read-only validity check used by the product client at runtime.
    /// When device info is supplied, the device must be bound; the only
    /// mutation is last-seen bookkeeping on a successful check.
    pub async fn validate(
        &self,
        key: &str,
        device_id: Option<&str>,
    ) -> Result<LicenseValidation, EntitlementError> {
        let license = match self.store.get_license_by_key(key).await {
            Ok(license) => license,
            Err(StoreError::NotFound) => {
                return Ok(LicenseValidation {
                    valid: false,
                    license: None,
                })
            }
            Err(err) => return Err(err.into()),
        };

        let now = Utc::now();
        let expired = license
            .expires_at
            .map(|expires_at| now >= expires_at)
            .unwrap_or(false);
        let mut valid = license.status == LicenseStatus::Active && !expired;

        if let Some(device_id) = device_id {
            let bound = license.devices.iter().any(|d| d.device_id == device_id);
            valid = valid && bound;
            if valid {
                self.store.touch_device(&license.id, device_id, now).await?;
            }
        }

        Ok(LicenseValidation {
            valid,
            license: Some(license),
        })
    }

    /// Record the intent to transfer a license to another user. Enterprise
    /// admin only; step one of a two-step flow, nothing is reassigned here.
    pub async fn transfer(
        &self,
        key: &str,
        caller: &UserId,
        from: &UserId,
        to_email: &str,
        reason: &str,
    ) -> Result<TransferIntent, EntitlementError> {
        if !to_email.contains('@') {
            return Err(EntitlementError::Validation(
                "target email is not valid".into(),
            ));
        }
        let license = self.store.get_license_by_key(key).await.map_err(|_| {
            EntitlementError::NotFound("license key not found".into())
        })?;
        if license.user_id != *from {
            return Err(EntitlementError::Conflict(
                "license does not belong to the named owner".into(),
            ));
        }

        let sub = self.store.get_subscription(&license.subscription_id).await?;
        if sub.tier != Tier::Enterprise {
            return Err(EntitlementError::Forbidden(
                "license transfer requires an enterprise subscription".into(),
            ));
        }
        self.require_org_admin(&license.subscription_id, caller)
            .await?;

        let intent = self
            .store
            .create_transfer_intent(&CreateTransferIntentParams {
                license_id: license.id,
                from_user_id: *from,
                to_email: to_email.to_string(),
                reason: reason.to_string(),
            })
            .await?;

        record_audit(
            self.audit.as_ref(),
            AuditEvent::builder(AuditAction::LicenseTransfer)
                .actor(Some(caller))
                .resource("transfer_intent", intent.id.to_string())
                .subscription_id(Some(&license.subscription_id))
                .license_id(Some(&license.id))
                .reason(reason)
                .details(serde_json::json!({ "to_email": to_email }))
                .build(),
        )
        .await;

        Ok(intent)
    }

    /// Repair tool for legacy duplicate licenses. Mint-time uniqueness is
    /// the hard contract; this only cleans up data issued before it was
    /// enforced. Per subscription: keeps the most recently updated active
    /// unexpired license (newest created as fallback), force-extends its
    /// expiry when missing or past, and deletes the rest.
    pub async fn cleanup_duplicates(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<License>, EntitlementError> {
        let licenses = self.store.list_licenses_for_user(user_id).await?;
        let now = Utc::now();

        let mut by_subscription: std::collections::HashMap<SubscriptionId, Vec<License>> =
            std::collections::HashMap::new();
        for license in licenses {
            by_subscription
                .entry(license.subscription_id)
                .or_default()
                .push(license);
        }

        let mut kept = Vec::new();
        for (sub_id, group) in by_subscription {
            if group.len() < 2 {
                kept.extend(group);
                continue;
            }

            let unexpired = |l: &License| l.expires_at.map(|e| e > now).unwrap_or(true);
            let keeper = group
                .iter()
                .filter(|l| l.status == LicenseStatus::Active && unexpired(l))
                .max_by_key(|l| l.updated_at)
                .or_else(|| group.iter().max_by_key(|l| l.created_at))
                .cloned()
                .ok_or_else(|| EntitlementError::Storage("empty license group".into()))?;

            if keeper.expires_at.map(|e| e <= now).unwrap_or(true) {
                self.store
                    .set_license_expiry(&keeper.id, Some(now + Months::new(JIT_LICENSE_MONTHS)))
                    .await?;
            }

            let mut deleted = 0;
            for license in &group {
                if license.id != keeper.id {
                    self.store.delete_license(&license.id).await?;
                    deleted += 1;
                }
            }

            tracing::warn!(
                user_id = %user_id,
                subscription_id = %sub_id,
                deleted,
                "removed duplicate licenses"
            );
            record_audit(
                self.audit.as_ref(),
                AuditEvent::builder(AuditAction::LicenseCleanup)
                    .resource("license", keeper.id.to_string())
                    .subscription_id(Some(&sub_id))
                    .license_id(Some(&keeper.id))
                    .details(serde_json::json!({ "deleted": deleted }))
                    .build(),
            )
            .await;

            kept.push(self.store.get_license(&keeper.id).await?);
        }
        Ok(kept)
    }

    async fn require_org_admin(
        &self,
        sub_id: &SubscriptionId,
        caller: &UserId,
    ) -> Result<(), EntitlementError> {
        let sub = self.store.get_subscription(sub_id).await?;
        let org_id = match sub.owner {
            SubscriptionOwner::Organization(org_id) => org_id,
            SubscriptionOwner::User(user_id) => {
                if user_id == *caller {
                    return Ok(());
                }
                return Err(EntitlementError::Forbidden(
                    "caller does not own this license".into(),
                ));
            }
        };
        let org = self.store.get_organization(&org_id).await?;
        if org.owner_user_id == *caller {
            return Ok(());
        }
        if let Ok(member) = self.store.get_member_for_user(&org_id, caller).await {
            if member.status == MemberStatus::Active && member.role.includes(&MemberRole::Admin) {
                return Ok(());
            }
        }
        Err(EntitlementError::Forbidden(
            "caller is not an organization admin".into(),
        ))
    }
}
