//! Entitlement services for keygate.
//!
//! Each service is a plain struct constructed with its store and audit
//! dependencies injected; there is no module-level state. The services
//! enforce the seat/license ceilings by delegating the check-and-write to
//! atomic `Store` operations, never by reading, checking, and writing in
//! separate calls.

mod demo;
mod error;
mod licenses;
mod seats;
mod subscriptions;

pub use demo::{
    DemoEngine, DemoProfile, DemoRegistration, DemoStatusReport, FeatureDecision, DEMO_FEATURES,
    DEMO_TRIAL_DAYS,
};
pub use error::EntitlementError;
pub use licenses::{
    generate_license_key, Activation, ClientConfig, DeviceRequest, LicensePool, LicenseValidation,
    MintOptions, JIT_LICENSE_MONTHS, MAX_DEVICES,
};
pub use seats::{
    AcceptedInvitation, IdentityProvider, IdentityProviderError, SeatAllocator, SeatInvite,
    INVITATION_TTL_DAYS,
};
pub use subscriptions::{
    CancelMode, RenewalPreview, SubscriptionManager, BILLING_PERIOD_DAYS,
};

use keygate_audit::{AuditEvent, AuditLog};

/// Audit writes are best-effort: a failed write is logged and never rolls
/// back the mutation it describes.
pub(crate) async fn record_audit(audit: &dyn AuditLog, event: AuditEvent) {
    let action = event.action.clone();
    if let Err(err) = audit.record(event).await {
        tracing::warn!(action = %action, error = %err, "failed to record audit event");
    }
}
