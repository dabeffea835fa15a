//! Demo trial engine: registration, lazy expiry, feature gating, and
//! conversion into paid entitlement.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use keygate_audit::{AuditAction, AuditEvent, AuditLog};
use keygate_storage::{
    CreateDemoSessionParams, CreateUserParams, DemoSession, DemoStatus, RestrictionHit, Store,
    StoreError, SubscriptionId, User, UserId,
};

use crate::{record_audit, EntitlementError};

/// Trial duration.
pub const DEMO_TRIAL_DAYS: i64 = 14;

/// Features a demo session may use while ACTIVE. Everything else is
/// denied and logged as a restriction hit.
pub const DEMO_FEATURES: [&str; 4] = [
    "callsheets.basic",
    "sessions.core",
    "files.basic",
    "reports.basic",
];

const MAX_EXTENSION_DAYS: i64 = 30;

/// Profile supplied at registration.
#[derive(Clone, Debug, Default)]
pub struct DemoProfile {
    pub display_name: Option<String>,
}

/// Result of a successful registration.
#[derive(Clone, Debug)]
pub struct DemoRegistration {
    pub user: User,
    pub session: DemoSession,
}

/// Lazily computed trial status.
#[derive(Clone, Debug)]
pub struct DemoStatusReport {
    pub status: DemoStatus,
    pub seconds_remaining: i64,
    pub days_remaining: i64,
    pub features_accessed: Vec<String>,
    pub restrictions_hit: Vec<RestrictionHit>,
}

/// Outcome of a feature-gate check.
#[derive(Clone, Debug)]
pub struct FeatureDecision {
    pub allowed: bool,
    pub restriction: Option<String>,
}

pub struct DemoEngine<S> {
    store: Arc<S>,
    audit: Arc<dyn AuditLog>,
}

/// The status a demo session reads as right now.
///
/// Trials have no scheduler; expiry exists only at read time. Every
/// enforcement point goes through this one function.
pub(crate) fn effective_demo_status(session: &DemoSession, now: DateTime<Utc>) -> DemoStatus {
    if session.status == DemoStatus::Converted {
        return DemoStatus::Converted;
    }
    if now >= session.expires_at {
        return DemoStatus::Expired;
    }
    session.status
}

impl<S: Store> DemoEngine<S> {
    pub fn new(store: Arc<S>, audit: Arc<dyn AuditLog>) -> Self {
        Self { store, audit }
    }

    /// Register a demo user. Rejects emails already owned by a paid
    /// account and users with an active trial (conditional create in the
    /// store, so concurrent registrations cannot double-issue).
    pub async fn register(
        &self,
        email: &str,
        profile: DemoProfile,
    ) -> Result<DemoRegistration, EntitlementError> {
        if !email.contains('@') {
            return Err(EntitlementError::Validation("email is not valid".into()));
        }

        let user = match self.store.get_user_by_email(email).await {
            Ok(user) if !user.is_demo => {
                return Err(EntitlementError::Conflict(
                    "email already belongs to a registered account".into(),
                ))
            }
            Ok(user) => user,
            Err(StoreError::NotFound) => {
                let user_id = self
                    .store
                    .create_user(&CreateUserParams {
                        email: email.to_string(),
                        display_name: profile.display_name.clone(),
                        is_demo: true,
                    })
                    .await?;
                self.store.get_user_by_id(&user_id).await?
            }
            Err(err) => return Err(err.into()),
        };

        let now = Utc::now();
        let session = self
            .store
            .create_demo_session(
                &CreateDemoSessionParams {
                    user_id: user.id,
                    expires_at: now + Duration::days(DEMO_TRIAL_DAYS),
                },
                now,
            )
            .await
            .map_err(|err| match err {
                StoreError::Conflict => EntitlementError::Conflict(
                    "user already has an active trial".into(),
                ),
                other => other.into(),
            })?;

        tracing::info!(user_id = %user.id, session_id = %session.id, "demo trial registered");
        record_audit(
            self.audit.as_ref(),
            AuditEvent::builder(AuditAction::DemoRegister)
                .actor(Some(&user.id))
                .resource("demo_session", session.id.to_string())
                .details(serde_json::json!({ "consent": true, "trial_days": DEMO_TRIAL_DAYS }))
                .build(),
        )
        .await;

        Ok(DemoRegistration { user, session })
    }

    /// Current trial status, computed lazily from the expiry timestamp.
    pub async fn status(&self, user_id: &UserId) -> Result<DemoStatusReport, EntitlementError> {
        let session = self
            .store
            .get_demo_session_for_user(user_id)
            .await
            .map_err(|_| EntitlementError::NotFound("no demo session for user".into()))?;

        let now = Utc::now();
        let status = effective_demo_status(&session, now);
        let seconds_remaining = match status {
            DemoStatus::Active => (session.expires_at - now).num_seconds().max(0),
            _ => 0,
        };

        Ok(DemoStatusReport {
            status,
            seconds_remaining,
            days_remaining: seconds_remaining / 86_400,
            features_accessed: session.features_accessed,
            restrictions_hit: session.restrictions_hit,
        })
    }

    /// Gate a feature behind the demo allow-list. Once the session is
    /// EXPIRED everything is denied, allow-list membership included.
    pub async fn check_feature_access(
        &self,
        user_id: &UserId,
        feature: &str,
    ) -> Result<FeatureDecision, EntitlementError> {
        let session = self
            .store
            .get_demo_session_for_user(user_id)
            .await
            .map_err(|_| EntitlementError::NotFound("no demo session for user".into()))?;

        let now = Utc::now();
        match effective_demo_status(&session, now) {
            DemoStatus::Active => {}
            DemoStatus::Expired => {
                self.store
                    .record_restriction_hit(&session.id, feature, now)
                    .await?;
                return Ok(FeatureDecision {
                    allowed: false,
                    restriction: Some("trial expired".into()),
                });
            }
            DemoStatus::Converted => {
                return Ok(FeatureDecision {
                    allowed: false,
                    restriction: Some("trial converted to a paid subscription".into()),
                });
            }
        }

        if DEMO_FEATURES.contains(&feature) {
            self.store.record_feature_access(&session.id, feature).await?;
            Ok(FeatureDecision {
                allowed: true,
                restriction: None,
            })
        } else {
            self.store
                .record_restriction_hit(&session.id, feature, now)
                .await?;
            Ok(FeatureDecision {
                allowed: false,
                restriction: Some("feature not available in demo".into()),
            })
        }
    }

    /// Convert the trial into paid entitlement. The target subscription
    /// must belong to the user; all further entitlement flows through the
    /// normal paid path.
    pub async fn convert(
        &self,
        user_id: &UserId,
        sub_id: &SubscriptionId,
        source: &str,
    ) -> Result<DemoSession, EntitlementError> {
        let sub = self.store.get_subscription(sub_id).await.map_err(|_| {
            EntitlementError::NotFound("subscription not found".into())
        })?;
        if sub.owner.user_id() != Some(*user_id) {
            return Err(EntitlementError::Forbidden(
                "subscription does not belong to this user".into(),
            ));
        }

        let session = self
            .store
            .get_demo_session_for_user(user_id)
            .await
            .map_err(|_| EntitlementError::NotFound("no demo session for user".into()))?;
        if session.status == DemoStatus::Converted {
            if session.converted_to == Some(*sub_id) {
                return Ok(session);
            }
            return Err(EntitlementError::Conflict(
                "trial was already converted".into(),
            ));
        }

        self.store.set_demo_conversion(&session.id, sub_id).await?;
        let session = self.store.get_demo_session_for_user(user_id).await?;

        tracing::info!(user_id = %user_id, subscription_id = %sub_id, source, "demo trial converted");
        record_audit(
            self.audit.as_ref(),
            AuditEvent::builder(AuditAction::DemoConvert)
                .actor(Some(user_id))
                .resource("demo_session", session.id.to_string())
                .subscription_id(Some(sub_id))
                .details(serde_json::json!({ "source": source }))
                .build(),
        )
        .await;

        Ok(session)
    }

    /// Administrative trial extension, bounded to 1..=30 days, with a
    /// mandatory audit reason. Admin gating is the API layer's concern;
    /// the acting admin is recorded here.
    pub async fn extend_trial(
        &self,
        admin: &UserId,
        user_id: &UserId,
        days: i64,
        reason: &str,
    ) -> Result<DemoSession, EntitlementError> {
        if !(1..=MAX_EXTENSION_DAYS).contains(&days) {
            return Err(EntitlementError::Validation(format!(
                "extension must be between 1 and {} days",
                MAX_EXTENSION_DAYS
            )));
        }
        if reason.trim().is_empty() {
            return Err(EntitlementError::Validation(
                "an audit reason is required".into(),
            ));
        }

        let session = self
            .store
            .get_demo_session_for_user(user_id)
            .await
            .map_err(|_| EntitlementError::NotFound("no demo session for user".into()))?;
        if session.status == DemoStatus::Converted {
            return Err(EntitlementError::Conflict(
                "trial was already converted".into(),
            ));
        }

        let now = Utc::now();
        let new_expiry = session.expires_at + Duration::days(days);
        self.store.set_demo_expiry(&session.id, new_expiry).await?;
        // Extending past an already-lapsed expiry revives the trial.
        if session.status == DemoStatus::Expired && new_expiry > now {
            self.store
                .set_demo_status(&session.id, DemoStatus::Active)
                .await?;
        }
        let session = self.store.get_demo_session_for_user(user_id).await?;

        record_audit(
            self.audit.as_ref(),
            AuditEvent::builder(AuditAction::DemoExtend)
                .actor(Some(admin))
                .resource("demo_session", session.id.to_string())
                .reason(reason)
                .details(serde_json::json!({ "days": days, "user_id": user_id.to_string() }))
                .build(),
        )
        .await;

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygate_audit::MemoryAuditLog;
    use keygate_store_memory::MemoryStore;
    use keygate_storage::{CreateSubscriptionParams, SubscriptionOwner, Tier};
    use uuid::Uuid;

    fn engine() -> (Arc<MemoryStore>, DemoEngine<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditLog::new());
        let engine = DemoEngine::new(Arc::clone(&store), audit);
        (store, engine)
    }

    fn session(now: DateTime<Utc>, expires_at: DateTime<Utc>, status: DemoStatus) -> DemoSession {
        DemoSession {
            id: keygate_storage::DemoSessionId(Uuid::new_v4()),
            user_id: UserId(Uuid::new_v4()),
            tier: Tier::Basic,
            status,
            expires_at,
            features_accessed: vec![],
            restrictions_hit: vec![],
            converted_to: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn expiry_boundary() {
        let t0 = Utc::now();
        let expires = t0 + Duration::days(DEMO_TRIAL_DAYS);
        let s = session(t0, expires, DemoStatus::Active);

        // 13 days 23 hours in: still active.
        assert_eq!(
            effective_demo_status(&s, t0 + Duration::days(13) + Duration::hours(23)),
            DemoStatus::Active
        );
        // One second past expiry: expired, regardless of stored status.
        assert_eq!(
            effective_demo_status(&s, expires + Duration::seconds(1)),
            DemoStatus::Expired
        );
    }

    #[tokio::test]
    async fn register_rejects_paid_emails_and_double_trials() {
        let (store, engine) = engine();
        store
            .create_user(&keygate_storage::CreateUserParams {
                email: "paid@example.com".into(),
                display_name: None,
                is_demo: false,
            })
            .await
            .unwrap();

        let err = engine
            .register("paid@example.com", DemoProfile::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::Conflict(_)));

        let registration = engine
            .register("trial@example.com", DemoProfile::default())
            .await
            .unwrap();
        assert!(registration.user.is_demo);
        assert_eq!(registration.session.status, DemoStatus::Active);

        let err = engine
            .register("trial@example.com", DemoProfile::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::Conflict(_)));
        assert!(err.to_string().contains("active trial"));
    }

    #[tokio::test]
    async fn allow_list_gating_and_expiry_denial() {
        let (store, engine) = engine();
        let registration = engine
            .register("gate@example.com", DemoProfile::default())
            .await
            .unwrap();
        let user_id = registration.user.id;

        let decision = engine
            .check_feature_access(&user_id, "callsheets.basic")
            .await
            .unwrap();
        assert!(decision.allowed);

        let decision = engine
            .check_feature_access(&user_id, "reports.advanced")
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert!(decision.restriction.is_some());

        // Force expiry; even allow-listed features are denied now.
        store
            .set_demo_expiry(&registration.session.id, Utc::now() - Duration::seconds(1))
            .await
            .unwrap();
        let decision = engine
            .check_feature_access(&user_id, "callsheets.basic")
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.restriction.as_deref(), Some("trial expired"));

        let report = engine.status(&user_id).await.unwrap();
        assert_eq!(report.status, DemoStatus::Expired);
        assert_eq!(report.seconds_remaining, 0);
        assert!(report.features_accessed.contains(&"callsheets.basic".to_string()));
        assert_eq!(report.restrictions_hit.len(), 2);
    }

    #[tokio::test]
    async fn convert_requires_owning_subscription() {
        let (store, engine) = engine();
        let registration = engine
            .register("convert@example.com", DemoProfile::default())
            .await
            .unwrap();
        let user_id = registration.user.id;

        let now = Utc::now();
        let other_user = UserId(Uuid::new_v4());
        let foreign_sub = store
            .create_subscription(&CreateSubscriptionParams {
                owner: SubscriptionOwner::User(other_user),
                tier: Tier::Basic,
                seats: 1,
                billing_ref: None,
                current_period_start: now,
                current_period_end: now + Duration::days(30),
            })
            .await
            .unwrap();
        let err = engine
            .convert(&user_id, &foreign_sub, "checkout")
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::Forbidden(_)));

        let own_sub = store
            .create_subscription(&CreateSubscriptionParams {
                owner: SubscriptionOwner::User(user_id),
                tier: Tier::Basic,
                seats: 1,
                billing_ref: None,
                current_period_start: now,
                current_period_end: now + Duration::days(30),
            })
            .await
            .unwrap();
        let session = engine.convert(&user_id, &own_sub, "checkout").await.unwrap();
        assert_eq!(session.status, DemoStatus::Converted);
        assert_eq!(session.converted_to, Some(own_sub));

        // Converting again to the same subscription is idempotent.
        engine.convert(&user_id, &own_sub, "checkout").await.unwrap();
        // Everything is denied after conversion.
        let decision = engine
            .check_feature_access(&user_id, "callsheets.basic")
            .await
            .unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn extension_is_bounded_and_needs_a_reason() {
        let (_store, engine) = engine();
        let registration = engine
            .register("extend@example.com", DemoProfile::default())
            .await
            .unwrap();
        let user_id = registration.user.id;
        let admin = UserId(Uuid::new_v4());

        let err = engine
            .extend_trial(&admin, &user_id, 0, "why not")
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::Validation(_)));
        let err = engine
            .extend_trial(&admin, &user_id, 31, "why not")
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::Validation(_)));
        let err = engine
            .extend_trial(&admin, &user_id, 7, "  ")
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::Validation(_)));

        let before = registration.session.expires_at;
        let session = engine
            .extend_trial(&admin, &user_id, 7, "sales follow-up")
            .await
            .unwrap();
        assert_eq!(session.expires_at, before + Duration::days(7));
    }
}
