//! License and device-binding records.

use chrono::{DateTime, Utc};

use super::{LicenseId, LicenseStatus, SubscriptionId, Tier, TransferIntentId, UserId};

/// A device bound to a license at activation time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceBinding {
    pub device_id: String,
    pub platform: String,
    pub app_version: String,
    pub activated_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// License record. The key is an opaque secret token; use
/// [`License::redacted_key`] anywhere it could end up in a log line.
#[derive(Clone, Debug)]
pub struct License {
    pub id: LicenseId,
    pub key: String,
    pub subscription_id: SubscriptionId,
    pub user_id: UserId,
    pub tier: Tier,
    pub status: LicenseStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub devices: Vec<DeviceBinding>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl License {
    /// Whether the license counts against the subscription's seat ceiling.
    pub fn is_non_terminal(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Key form safe to log: everything but the last group masked.
    pub fn redacted_key(&self) -> String {
        match self.key.rsplit_once('-') {
            Some((_, tail)) => format!("KG-****-****-****-****-{}", tail),
            None => "****".to_string(),
        }
    }
}

/// Parameters for creating a license
#[derive(Clone, Debug)]
pub struct CreateLicenseParams {
    pub key: String,
    pub subscription_id: SubscriptionId,
    pub user_id: UserId,
    pub tier: Tier,
    pub status: LicenseStatus,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Auditable record of a requested license transfer. Transfer is a
/// two-step flow; this is the intent emitted by step one.
#[derive(Clone, Debug)]
pub struct TransferIntent {
    pub id: TransferIntentId,
    pub license_id: LicenseId,
    pub from_user_id: UserId,
    pub to_email: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating a transfer intent
#[derive(Clone, Debug)]
pub struct CreateTransferIntentParams {
    pub license_id: LicenseId,
    pub from_user_id: UserId,
    pub to_email: String,
    pub reason: String,
}
