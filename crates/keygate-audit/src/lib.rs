//! Audit logging abstraction for keygate.
//!
//! This crate defines the `AuditLog` trait for persisting audit events
//! and the types representing auditable actions in the system.

mod memory;

pub use memory::MemoryAuditLog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keygate_storage::{LicenseId, OrganizationId, SubscriptionId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for an audit log entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuditLogId(pub Uuid);

impl AuditLogId {
    /// Generate a new audit log ID using UUID v7 (time-ordered)
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for AuditLogId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AuditLogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AuditLogId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Categories of auditable actions
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    // Subscription lifecycle
    SubscriptionCreate,
    SubscriptionUpdate,
    SubscriptionCancel,
    SubscriptionReactivate,

    // License lifecycle
    LicenseMint,
    LicenseActivate,
    LicenseDeactivate,
    LicenseTransfer,
    LicenseCleanup,

    // Organization membership
    MemberInvite,
    MemberUpdate,
    MemberRemove,
    MemberProvision,

    // Invitation operations
    InviteConsume,

    // Demo trials
    DemoRegister,
    DemoConvert,
    DemoExtend,

    // Payment reconciliation
    PaymentRecord,
    ReconcileIncident,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditAction::SubscriptionCreate => "subscription.create",
            AuditAction::SubscriptionUpdate => "subscription.update",
            AuditAction::SubscriptionCancel => "subscription.cancel",
            AuditAction::SubscriptionReactivate => "subscription.reactivate",
            AuditAction::LicenseMint => "license.mint",
            AuditAction::LicenseActivate => "license.activate",
            AuditAction::LicenseDeactivate => "license.deactivate",
            AuditAction::LicenseTransfer => "license.transfer",
            AuditAction::LicenseCleanup => "license.cleanup",
            AuditAction::MemberInvite => "member.invite",
            AuditAction::MemberUpdate => "member.update",
            AuditAction::MemberRemove => "member.remove",
            AuditAction::MemberProvision => "member.provision",
            AuditAction::InviteConsume => "invite.consume",
            AuditAction::DemoRegister => "demo.register",
            AuditAction::DemoConvert => "demo.convert",
            AuditAction::DemoExtend => "demo.extend",
            AuditAction::PaymentRecord => "payment.record",
            AuditAction::ReconcileIncident => "reconcile.incident",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscription.create" => Ok(AuditAction::SubscriptionCreate),
            "subscription.update" => Ok(AuditAction::SubscriptionUpdate),
            "subscription.cancel" => Ok(AuditAction::SubscriptionCancel),
            "subscription.reactivate" => Ok(AuditAction::SubscriptionReactivate),
            "license.mint" => Ok(AuditAction::LicenseMint),
            "license.activate" => Ok(AuditAction::LicenseActivate),
            "license.deactivate" => Ok(AuditAction::LicenseDeactivate),
            "license.transfer" => Ok(AuditAction::LicenseTransfer),
            "license.cleanup" => Ok(AuditAction::LicenseCleanup),
            "member.invite" => Ok(AuditAction::MemberInvite),
            "member.update" => Ok(AuditAction::MemberUpdate),
            "member.remove" => Ok(AuditAction::MemberRemove),
            "member.provision" => Ok(AuditAction::MemberProvision),
            "invite.consume" => Ok(AuditAction::InviteConsume),
            "demo.register" => Ok(AuditAction::DemoRegister),
            "demo.convert" => Ok(AuditAction::DemoConvert),
            "demo.extend" => Ok(AuditAction::DemoExtend),
            "payment.record" => Ok(AuditAction::PaymentRecord),
            "reconcile.incident" => Ok(AuditAction::ReconcileIncident),
            _ => Err(format!("Unknown audit action: {}", s)),
        }
    }
}

/// Result of an audited operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    PermissionDenied,
    NotFound,
    InvalidRequest,
    Error,
}

impl std::fmt::Display for AuditResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditResult::Success => "success",
            AuditResult::PermissionDenied => "permission_denied",
            AuditResult::NotFound => "not_found",
            AuditResult::InvalidRequest => "invalid_request",
            AuditResult::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for AuditResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AuditResult::Success),
            "permission_denied" => Ok(AuditResult::PermissionDenied),
            "not_found" => Ok(AuditResult::NotFound),
            "invalid_request" => Ok(AuditResult::InvalidRequest),
            "error" => Ok(AuditResult::Error),
            _ => Err(format!("Unknown audit result: {}", s)),
        }
    }
}

/// An audit log entry representing a single auditable action.
///
/// Uses raw UUIDs for serialization compatibility. Use the builder
/// to construct events from typed IDs. `actor_id` is None for actions
/// taken by the reconciler rather than a user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique identifier for this audit entry
    pub id: AuditLogId,
    /// When the action occurred
    pub timestamp: DateTime<Utc>,
    /// User that performed the action (None for the reconciler)
    pub actor_id: Option<Uuid>,
    /// The action that was performed
    pub action: AuditAction,
    /// Type of resource affected (e.g., "license", "subscription", "member")
    pub resource_type: String,
    /// Identifier of the affected resource
    pub resource_id: String,
    /// Organization context (if applicable)
    pub organization_id: Option<Uuid>,
    /// Subscription context (if applicable)
    pub subscription_id: Option<Uuid>,
    /// License context (if applicable)
    pub license_id: Option<Uuid>,
    /// Result of the operation
    pub result: AuditResult,
    /// Error message or additional context
    pub reason: Option<String>,
    /// Additional details as JSON (e.g., old/new tier, seat counts)
    pub details: Option<serde_json::Value>,
}

impl AuditEvent {
    /// Create a new audit event builder
    pub fn builder(action: AuditAction) -> AuditEventBuilder {
        AuditEventBuilder::new(action)
    }

    /// Get the actor as a typed ID (if present)
    pub fn get_actor_id(&self) -> Option<UserId> {
        self.actor_id.map(UserId)
    }

    /// Get the organization ID as a typed ID (if present)
    pub fn get_organization_id(&self) -> Option<OrganizationId> {
        self.organization_id.map(OrganizationId)
    }

    /// Get the subscription ID as a typed ID (if present)
    pub fn get_subscription_id(&self) -> Option<SubscriptionId> {
        self.subscription_id.map(SubscriptionId)
    }

    /// Get the license ID as a typed ID (if present)
    pub fn get_license_id(&self) -> Option<LicenseId> {
        self.license_id.map(LicenseId)
    }
}

/// Builder for constructing audit events
pub struct AuditEventBuilder {
    action: AuditAction,
    actor_id: Option<Uuid>,
    resource_type: String,
    resource_id: String,
    organization_id: Option<Uuid>,
    subscription_id: Option<Uuid>,
    license_id: Option<Uuid>,
    result: AuditResult,
    reason: Option<String>,
    details: Option<serde_json::Value>,
}

impl AuditEventBuilder {
    pub fn new(action: AuditAction) -> Self {
        Self {
            action,
            actor_id: None,
            resource_type: String::new(),
            resource_id: String::new(),
            organization_id: None,
            subscription_id: None,
            license_id: None,
            result: AuditResult::Success,
            reason: None,
            details: None,
        }
    }

    pub fn actor(mut self, actor_id: Option<&UserId>) -> Self {
        self.actor_id = actor_id.map(|u| u.0);
        self
    }

    pub fn resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.resource_type = resource_type.into();
        self.resource_id = resource_id.into();
        self
    }

    pub fn organization_id(mut self, organization_id: Option<&OrganizationId>) -> Self {
        self.organization_id = organization_id.map(|o| o.0);
        self
    }

    pub fn subscription_id(mut self, subscription_id: Option<&SubscriptionId>) -> Self {
        self.subscription_id = subscription_id.map(|s| s.0);
        self
    }

    pub fn license_id(mut self, license_id: Option<&LicenseId>) -> Self {
        self.license_id = license_id.map(|l| l.0);
        self
    }

    pub fn result(mut self, result: AuditResult) -> Self {
        self.result = result;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn build(self) -> AuditEvent {
        AuditEvent {
            id: AuditLogId::new(),
            timestamp: Utc::now(),
            actor_id: self.actor_id,
            action: self.action,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            organization_id: self.organization_id,
            subscription_id: self.subscription_id,
            license_id: self.license_id,
            result: self.result,
            reason: self.reason,
            details: self.details,
        }
    }
}

/// Filter for querying audit logs
#[derive(Clone, Debug, Default)]
pub struct AuditLogFilter {
    /// Filter by acting user
    pub actor_id: Option<UserId>,
    /// Filter by organization ID
    pub organization_id: Option<OrganizationId>,
    /// Filter by subscription ID
    pub subscription_id: Option<SubscriptionId>,
    /// Filter by license ID
    pub license_id: Option<LicenseId>,
    /// Filter by action
    pub action: Option<AuditAction>,
    /// Filter by result
    pub result: Option<AuditResult>,
    /// Filter by start timestamp (inclusive)
    pub from: Option<DateTime<Utc>>,
    /// Filter by end timestamp (exclusive)
    pub to: Option<DateTime<Utc>>,
    /// Maximum number of results to return
    pub limit: Option<u32>,
    /// Number of results to skip (for pagination)
    pub offset: Option<u32>,
}

impl AuditLogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actor_id(mut self, actor_id: UserId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn organization_id(mut self, organization_id: OrganizationId) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    pub fn subscription_id(mut self, subscription_id: SubscriptionId) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }

    pub fn license_id(mut self, license_id: LicenseId) -> Self {
        self.license_id = Some(license_id);
        self
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn result(mut self, result: AuditResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn from(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    pub fn to(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Error type for audit log operations
#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("database error: {0}")]
    Database(String),

    #[error("audit log not found: {0}")]
    NotFound(AuditLogId),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),
}

/// Trait for audit log persistence.
///
/// Implementations store audit events and provide query capabilities
/// for compliance and security monitoring.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Record an audit event.
    ///
    /// This should be called after each auditable operation completes.
    /// Failures to record audit events should be logged but should not
    /// fail the main operation.
    async fn record(&self, event: AuditEvent) -> Result<(), AuditLogError>;

    /// Query audit logs with optional filters.
    ///
    /// Returns events matching the filter criteria, ordered by timestamp descending.
    async fn query(&self, filter: AuditLogFilter) -> Result<Vec<AuditEvent>, AuditLogError>;

    /// Get a specific audit log entry by ID.
    async fn get(&self, id: AuditLogId) -> Result<AuditEvent, AuditLogError>;

    /// Count audit logs matching the filter criteria.
    async fn count(&self, filter: AuditLogFilter) -> Result<u64, AuditLogError>;
}
