//! Gateway event parsing and the at-most-once reconciler.
//!
//! Event processing is claim-before-act: the gateway event id is claimed
//! with a conditional create before any handler runs, so a redelivered or
//! concurrently delivered event mutates state exactly once.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{Duration, Months, Utc};
use serde_json::json;
use tracing::{info, warn};

use keygate_audit::{AuditAction, AuditEvent, AuditLog, AuditResult};
use keygate_entitlements::{generate_license_key, BILLING_PERIOD_DAYS, JIT_LICENSE_MONTHS};
use keygate_storage::{
    CreateLicenseParams, CreatePaymentParams, CreateSubscriptionParams, CreateUserParams,
    LicenseStatus, PaymentStatus, Store, StoreError, Subscription, SubscriptionOwner,
    SubscriptionStatus, Tier, UserId,
};

use crate::{BillingConfig, BillingError, SignatureVerifier};

/// Maximum handler attempts per claimed event.
pub const RETRY_LIMIT: i32 = 3;

/// Parsed payment gateway event
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Checkout completed: a new purchase to provision
    CheckoutCompleted {
        event_id: String,
        /// Purchaser email, the gateway's customer reference.
        customer_ref: String,
        /// Gateway's subscription reference, stored as `billing_ref`.
        subscription_ref: String,
        tier: Tier,
        seats: i32,
        amount_cents: i64,
        currency: String,
    },

    /// A recurring payment cleared
    PaymentSucceeded {
        event_id: String,
        subscription_ref: String,
        amount_cents: i64,
        currency: String,
    },

    /// A recurring payment failed
    PaymentFailed {
        event_id: String,
        subscription_ref: String,
        amount_cents: i64,
        currency: String,
    },

    /// Gateway-side subscription change (status, cancel flag)
    SubscriptionUpdated {
        event_id: String,
        subscription_ref: String,
        status: SubscriptionStatus,
        cancel_at_period_end: bool,
    },

    /// Gateway-side cancellation, applied at period end
    SubscriptionCancelled {
        event_id: String,
        subscription_ref: String,
    },

    /// Unknown or unhandled event
    Unknown { event_id: String, event_type: String },
}

impl GatewayEvent {
    pub fn event_id(&self) -> &str {
        match self {
            GatewayEvent::CheckoutCompleted { event_id, .. }
            | GatewayEvent::PaymentSucceeded { event_id, .. }
            | GatewayEvent::PaymentFailed { event_id, .. }
            | GatewayEvent::SubscriptionUpdated { event_id, .. }
            | GatewayEvent::SubscriptionCancelled { event_id, .. }
            | GatewayEvent::Unknown { event_id, .. } => event_id,
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            GatewayEvent::CheckoutCompleted { .. } => "checkout.completed",
            GatewayEvent::PaymentSucceeded { .. } => "payment.succeeded",
            GatewayEvent::PaymentFailed { .. } => "payment.failed",
            GatewayEvent::SubscriptionUpdated { .. } => "subscription.updated",
            GatewayEvent::SubscriptionCancelled { .. } => "subscription.cancelled",
            GatewayEvent::Unknown { event_type, .. } => event_type,
        }
    }
}

/// Parse a raw gateway payload into an event.
///
/// The payload shape is `{eventId, type, amount, currency, subscriptionRef,
/// customerRef, status, ...}`. `eventId` and `type` are mandatory; missing
/// value fields fall back to conservative defaults rather than failing the
/// whole delivery.
pub fn parse_gateway_event(payload: &str) -> Result<GatewayEvent, BillingError> {
    let value: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| BillingError::Payload(e.to_string()))?;

    let event_id = value["eventId"]
        .as_str()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| BillingError::Payload("missing eventId".into()))?
        .to_string();
    let event_type = value["type"]
        .as_str()
        .ok_or_else(|| BillingError::Payload("missing event type".into()))?;

    let subscription_ref = value["subscriptionRef"].as_str().unwrap_or("").to_string();

    match event_type {
        "checkout.completed" => Ok(GatewayEvent::CheckoutCompleted {
            event_id,
            customer_ref: value["customerRef"].as_str().unwrap_or("").to_string(),
            subscription_ref,
            tier: parse_tier(value["tier"].as_str().unwrap_or("")),
            seats: value["seats"].as_i64().unwrap_or(1) as i32,
            amount_cents: value["amount"].as_i64().unwrap_or(0),
            currency: value["currency"].as_str().unwrap_or("usd").to_string(),
        }),

        "payment.succeeded" => Ok(GatewayEvent::PaymentSucceeded {
            event_id,
            subscription_ref,
            amount_cents: value["amount"].as_i64().unwrap_or(0),
            currency: value["currency"].as_str().unwrap_or("usd").to_string(),
        }),

        "payment.failed" => Ok(GatewayEvent::PaymentFailed {
            event_id,
            subscription_ref,
            amount_cents: value["amount"].as_i64().unwrap_or(0),
            currency: value["currency"].as_str().unwrap_or("usd").to_string(),
        }),

        "subscription.updated" => Ok(GatewayEvent::SubscriptionUpdated {
            event_id,
            subscription_ref,
            status: parse_status(value["status"].as_str().unwrap_or("")),
            cancel_at_period_end: value["cancelAtPeriodEnd"].as_bool().unwrap_or(false),
        }),

        "subscription.cancelled" => Ok(GatewayEvent::SubscriptionCancelled {
            event_id,
            subscription_ref,
        }),

        _ => Ok(GatewayEvent::Unknown {
            event_id,
            event_type: event_type.to_string(),
        }),
    }
}

fn parse_status(status: &str) -> SubscriptionStatus {
    match SubscriptionStatus::from_str(status) {
        Ok(s) => s,
        // Unknown statuses default to PastDue to avoid granting access
        Err(_) => {
            warn!(%status, "unknown gateway subscription status, defaulting to past_due");
            SubscriptionStatus::PastDue
        }
    }
}

fn parse_tier(tier: &str) -> Tier {
    match Tier::from_str(tier) {
        Ok(t) => t,
        Err(_) => {
            warn!(%tier, "unknown gateway tier, defaulting to basic");
            Tier::Basic
        }
    }
}

/// The payment reconciler: verifies, claims, and dispatches gateway events.
pub struct Reconciler<S> {
    store: Arc<S>,
    audit: Arc<dyn AuditLog>,
    verifier: Arc<dyn SignatureVerifier>,
    max_attempts: i32,
}

impl<S: Store> Reconciler<S> {
    pub fn new(
        config: &BillingConfig,
        store: Arc<S>,
        audit: Arc<dyn AuditLog>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            store,
            audit,
            verifier,
            max_attempts: config.max_attempts,
        }
    }

    /// Handle one raw webhook delivery.
    ///
    /// Verifies the signature, parses the payload, claims the event id, and
    /// dispatches. Redelivered events and unknown event types are
    /// acknowledged with `Ok(())` and no side effect. Retryable handler
    /// failures get up to `max_attempts` tries; exhaustion records a
    /// compliance incident in the audit log before surfacing the error.
    pub async fn handle_event(&self, payload: &str, signature: &str) -> Result<(), BillingError> {
        self.verifier.verify(payload, signature).await?;
        let event = parse_gateway_event(payload)?;

        if let GatewayEvent::Unknown {
            event_id,
            event_type,
        } = &event
        {
            info!(%event_id, %event_type, "unhandled gateway event type, acknowledging");
            return Ok(());
        }

        match self
            .store
            .claim_event(event.event_id(), event.event_type())
            .await
        {
            Ok(()) => {}
            Err(StoreError::AlreadyExists) => {
                info!(
                    event_id = event.event_id(),
                    event_type = event.event_type(),
                    "duplicate gateway delivery, acknowledging"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.dispatch(&event).await {
                Ok(()) => {
                    self.store
                        .mark_event_outcome(event.event_id(), attempts, None, true)
                        .await?;
                    return Ok(());
                }
                Err(err) if err.is_retryable() && attempts < self.max_attempts => {
                    warn!(
                        event_id = event.event_id(),
                        event_type = event.event_type(),
                        attempts,
                        error = %err,
                        "gateway event handler failed, retrying"
                    );
                }
                Err(err) => {
                    let reason = err.to_string();
                    self.store
                        .mark_event_outcome(event.event_id(), attempts, Some(&reason), false)
                        .await?;
                    warn!(
                        event_id = event.event_id(),
                        event_type = event.event_type(),
                        attempts,
                        error = %reason,
                        "gateway event processing failed, recording incident"
                    );
                    self.record_audit(
                        AuditEvent::builder(AuditAction::ReconcileIncident)
                            .actor(None)
                            .resource("gateway_event", event.event_id())
                            .result(AuditResult::Error)
                            .reason(reason)
                            .details(json!({
                                "event_type": event.event_type(),
                                "attempts": attempts,
                            }))
                            .build(),
                    )
                    .await;
                    return Err(err);
                }
            }
        }
    }

    async fn dispatch(&self, event: &GatewayEvent) -> Result<(), BillingError> {
        match event {
            GatewayEvent::CheckoutCompleted {
                event_id,
                customer_ref,
                subscription_ref,
                tier,
                seats,
                amount_cents,
                currency,
            } => {
                self.checkout_completed(
                    event_id,
                    customer_ref,
                    subscription_ref,
                    *tier,
                    *seats,
                    *amount_cents,
                    currency,
                )
                .await
            }
            GatewayEvent::PaymentSucceeded {
                event_id,
                subscription_ref,
                amount_cents,
                currency,
            } => {
                self.payment_outcome(event_id, subscription_ref, *amount_cents, currency, true)
                    .await
            }
            GatewayEvent::PaymentFailed {
                event_id,
                subscription_ref,
                amount_cents,
                currency,
            } => {
                self.payment_outcome(event_id, subscription_ref, *amount_cents, currency, false)
                    .await
            }
            GatewayEvent::SubscriptionUpdated {
                subscription_ref,
                status,
                cancel_at_period_end,
                ..
            } => {
                self.subscription_updated(subscription_ref, *status, *cancel_at_period_end)
                    .await
            }
            GatewayEvent::SubscriptionCancelled {
                subscription_ref, ..
            } => self.subscription_cancelled(subscription_ref).await,
            GatewayEvent::Unknown { .. } => Ok(()),
        }
    }

    /// Provision a purchase: subscription, first payment, and the
    /// purchaser's license. Idempotent on the gateway subscription
    /// reference.
    #[allow(clippy::too_many_arguments)]
    async fn checkout_completed(
        &self,
        event_id: &str,
        customer_ref: &str,
        subscription_ref: &str,
        tier: Tier,
        seats: i32,
        amount_cents: i64,
        currency: &str,
    ) -> Result<(), BillingError> {
        if subscription_ref.is_empty() {
            return Err(BillingError::Payload("missing subscriptionRef".into()));
        }
        if customer_ref.is_empty() {
            return Err(BillingError::Payload("missing customerRef".into()));
        }
        tier.validate_seats(seats).map_err(BillingError::Payload)?;

        match self
            .store
            .get_subscription_by_billing_ref(subscription_ref)
            .await
        {
            Ok(existing) => {
                info!(
                    subscription_id = %existing.id.0,
                    %subscription_ref,
                    "subscription already provisioned for checkout, acknowledging"
                );
                return Ok(());
            }
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let user_id = self.lookup_or_create_purchaser(customer_ref).await?;

        let now = Utc::now();
        let sub_id = self
            .store
            .create_subscription(&CreateSubscriptionParams {
                owner: SubscriptionOwner::User(user_id),
                tier,
                seats,
                billing_ref: Some(subscription_ref.to_string()),
                current_period_start: now,
                current_period_end: now + Duration::days(BILLING_PERIOD_DAYS),
            })
            .await?;

        self.store
            .create_payment(&CreatePaymentParams {
                subscription_id: sub_id,
                amount_cents,
                currency: currency.to_string(),
                status: PaymentStatus::Succeeded,
                gateway_ref: event_id.to_string(),
            })
            .await?;

        // One license to the purchaser; the remaining seats are assigned
        // through the seat allocator later.
        let minted = match self
            .store
            .create_license_checked(&CreateLicenseParams {
                key: generate_license_key(),
                subscription_id: sub_id,
                user_id,
                tier,
                status: LicenseStatus::Pending,
                expires_at: Some(now + Months::new(JIT_LICENSE_MONTHS)),
            })
            .await
        {
            Ok(license) => Some(license),
            // A concurrent issuance path may have minted first.
            Err(StoreError::DuplicateLicense) => None,
            Err(e) => return Err(e.into()),
        };

        info!(
            subscription_id = %sub_id.0,
            %subscription_ref,
            tier = tier.as_str(),
            seats,
            "checkout provisioned"
        );
        self.record_audit(
            AuditEvent::builder(AuditAction::SubscriptionCreate)
                .actor(None)
                .resource("subscription", sub_id.0.to_string())
                .subscription_id(Some(&sub_id))
                .result(AuditResult::Success)
                .details(json!({
                    "source": "checkout.completed",
                    "tier": tier.as_str(),
                    "seats": seats,
                    "license_minted": minted.is_some(),
                }))
                .build(),
        )
        .await;
        Ok(())
    }

    /// Record a payment outcome and drive the subscription's status and
    /// billing period accordingly.
    async fn payment_outcome(
        &self,
        event_id: &str,
        subscription_ref: &str,
        amount_cents: i64,
        currency: &str,
        succeeded: bool,
    ) -> Result<(), BillingError> {
        let sub = self.subscription_by_ref(subscription_ref).await?;

        let status = if succeeded {
            PaymentStatus::Succeeded
        } else {
            PaymentStatus::Failed
        };
        self.store
            .create_payment(&CreatePaymentParams {
                subscription_id: sub.id,
                amount_cents,
                currency: currency.to_string(),
                status,
                gateway_ref: event_id.to_string(),
            })
            .await?;

        if succeeded {
            if sub.status == SubscriptionStatus::PastDue {
                self.store
                    .set_subscription_status(&sub.id, SubscriptionStatus::Active)
                    .await?;
            }
            // Roll the billing period forward from the old end.
            let start = sub.current_period_end;
            self.store
                .set_subscription_period(&sub.id, start, start + Duration::days(BILLING_PERIOD_DAYS))
                .await?;
            info!(subscription_id = %sub.id.0, amount_cents, "payment recorded, period rolled");
        } else {
            self.store
                .set_subscription_status(&sub.id, SubscriptionStatus::PastDue)
                .await?;
            warn!(subscription_id = %sub.id.0, amount_cents, "payment failed, subscription past due");
        }

        self.record_audit(
            AuditEvent::builder(AuditAction::PaymentRecord)
                .actor(None)
                .resource("payment", event_id)
                .subscription_id(Some(&sub.id))
                .result(AuditResult::Success)
                .details(json!({
                    "status": status.as_str(),
                    "amount_cents": amount_cents,
                    "currency": currency,
                }))
                .build(),
        )
        .await;
        Ok(())
    }

    /// Sync a gateway-side status or cancel-flag change into the store.
    async fn subscription_updated(
        &self,
        subscription_ref: &str,
        status: SubscriptionStatus,
        cancel_at_period_end: bool,
    ) -> Result<(), BillingError> {
        let sub = self.subscription_by_ref(subscription_ref).await?;

        if sub.status != status || sub.cancel_at_period_end != cancel_at_period_end {
            self.store
                .set_cancellation(&sub.id, status, cancel_at_period_end)
                .await?;
        }

        info!(
            subscription_id = %sub.id.0,
            status = status.as_str(),
            cancel_at_period_end,
            "subscription synced from gateway"
        );
        self.record_audit(
            AuditEvent::builder(AuditAction::SubscriptionUpdate)
                .actor(None)
                .resource("subscription", sub.id.0.to_string())
                .subscription_id(Some(&sub.id))
                .result(AuditResult::Success)
                .details(json!({
                    "source": "subscription.updated",
                    "status": status.as_str(),
                    "cancel_at_period_end": cancel_at_period_end,
                }))
                .build(),
        )
        .await;
        Ok(())
    }

    /// Gateway-side cancellation lands as cancel-at-period-end: the
    /// subscription keeps its entitlements until the paid period runs out.
    async fn subscription_cancelled(&self, subscription_ref: &str) -> Result<(), BillingError> {
        let sub = self.subscription_by_ref(subscription_ref).await?;

        self.store
            .set_cancellation(&sub.id, SubscriptionStatus::Cancelled, true)
            .await?;

        info!(subscription_id = %sub.id.0, "subscription cancelled by gateway");
        self.record_audit(
            AuditEvent::builder(AuditAction::SubscriptionCancel)
                .actor(None)
                .resource("subscription", sub.id.0.to_string())
                .subscription_id(Some(&sub.id))
                .result(AuditResult::Success)
                .details(json!({"source": "subscription.cancelled"}))
                .build(),
        )
        .await;
        Ok(())
    }

    async fn subscription_by_ref(
        &self,
        subscription_ref: &str,
    ) -> Result<Subscription, BillingError> {
        if subscription_ref.is_empty() {
            return Err(BillingError::Payload("missing subscriptionRef".into()));
        }
        Ok(self
            .store
            .get_subscription_by_billing_ref(subscription_ref)
            .await?)
    }

    async fn lookup_or_create_purchaser(&self, email: &str) -> Result<UserId, BillingError> {
        match self.store.get_user_by_email(email).await {
            Ok(user) => Ok(user.id),
            Err(StoreError::NotFound) => {
                let params = CreateUserParams {
                    email: email.to_string(),
                    display_name: None,
                    is_demo: false,
                };
                match self.store.create_user(&params).await {
                    Ok(id) => Ok(id),
                    // Lost a race with a concurrent signup for the same email.
                    Err(StoreError::AlreadyExists) => {
                        Ok(self.store.get_user_by_email(email).await?.id)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Audit writes are best-effort and never roll back the mutation they
    /// describe.
    async fn record_audit(&self, event: AuditEvent) {
        let action = event.action.clone();
        if let Err(err) = self.audit.record(event).await {
            warn!(action = %action, error = %err, "failed to record audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygate_audit::{AuditLogFilter, MemoryAuditLog};
    use keygate_store_memory::MemoryStore;

    fn reconciler() -> (Arc<MemoryStore>, Arc<MemoryAuditLog>, Reconciler<MemoryStore>) {
        let config = BillingConfig::test();
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditLog::new());
        let verifier = Arc::new(crate::NoopVerifier::new(&config));
        let reconciler = Reconciler::new(&config, store.clone(), audit.clone(), verifier);
        (store, audit, reconciler)
    }

    fn checkout_payload(event_id: &str, sub_ref: &str) -> String {
        format!(
            r#"{{
                "eventId": "{event_id}",
                "type": "checkout.completed",
                "amount": 9900,
                "currency": "usd",
                "subscriptionRef": "{sub_ref}",
                "customerRef": "buyer@example.com",
                "status": "active",
                "tier": "pro",
                "seats": 5
            }}"#
        )
    }

    #[test]
    fn parse_checkout_event() {
        let event = parse_gateway_event(&checkout_payload("evt_1", "gw_sub_1")).unwrap();
        match event {
            GatewayEvent::CheckoutCompleted {
                event_id,
                customer_ref,
                subscription_ref,
                tier,
                seats,
                amount_cents,
                currency,
            } => {
                assert_eq!(event_id, "evt_1");
                assert_eq!(customer_ref, "buyer@example.com");
                assert_eq!(subscription_ref, "gw_sub_1");
                assert_eq!(tier, Tier::Pro);
                assert_eq!(seats, 5);
                assert_eq!(amount_cents, 9900);
                assert_eq!(currency, "usd");
            }
            other => panic!("expected CheckoutCompleted, got {:?}", other),
        }
    }

    #[test]
    fn parse_rejects_missing_event_id() {
        let err = parse_gateway_event(r#"{"type": "payment.succeeded"}"#).unwrap_err();
        assert!(matches!(err, BillingError::Payload(_)));
    }

    #[test]
    fn parse_unknown_event_type() {
        let event =
            parse_gateway_event(r#"{"eventId": "evt_x", "type": "refund.issued"}"#).unwrap();
        match event {
            GatewayEvent::Unknown { event_type, .. } => assert_eq!(event_type, "refund.issued"),
            other => panic!("expected Unknown, got {:?}", other),
        }
    }

    #[test]
    fn unknown_status_defaults_conservatively() {
        let payload = r#"{
            "eventId": "evt_s",
            "type": "subscription.updated",
            "subscriptionRef": "gw_sub_1",
            "status": "incomplete_expired"
        }"#;
        match parse_gateway_event(payload).unwrap() {
            GatewayEvent::SubscriptionUpdated { status, .. } => {
                assert_eq!(status, SubscriptionStatus::PastDue);
            }
            other => panic!("expected SubscriptionUpdated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn checkout_provisions_subscription_payment_and_license() {
        let (store, _audit, reconciler) = reconciler();

        reconciler
            .handle_event(&checkout_payload("evt_1", "gw_sub_1"), "")
            .await
            .unwrap();

        let sub = store
            .get_subscription_by_billing_ref("gw_sub_1")
            .await
            .unwrap();
        assert_eq!(sub.tier, Tier::Pro);
        assert_eq!(sub.seats, 5);
        assert_eq!(sub.status, SubscriptionStatus::Active);

        let buyer = store.get_user_by_email("buyer@example.com").await.unwrap();
        assert!(!buyer.is_demo);

        let licenses = store.list_licenses_for_subscription(&sub.id).await.unwrap();
        assert_eq!(licenses.len(), 1);
        assert_eq!(licenses[0].user_id, buyer.id);
        assert_eq!(licenses[0].status, LicenseStatus::Pending);

        let payments = store.list_payments_for_subscription(&sub.id).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Succeeded);
        assert_eq!(payments[0].amount_cents, 9900);

        let processed = store.get_processed_event("evt_1").await.unwrap();
        assert!(processed.succeeded);
        assert_eq!(processed.attempts, 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_acknowledged_without_a_second_mutation() {
        let (store, _audit, reconciler) = reconciler();
        let payload = checkout_payload("evt_dup", "gw_sub_dup");

        reconciler.handle_event(&payload, "").await.unwrap();
        reconciler.handle_event(&payload, "").await.unwrap();

        let sub = store
            .get_subscription_by_billing_ref("gw_sub_dup")
            .await
            .unwrap();
        let payments = store.list_payments_for_subscription(&sub.id).await.unwrap();
        assert_eq!(payments.len(), 1);
        let licenses = store.list_licenses_for_subscription(&sub.id).await.unwrap();
        assert_eq!(licenses.len(), 1);
    }

    #[tokio::test]
    async fn payment_success_clears_past_due_and_rolls_the_period() {
        let (store, _audit, reconciler) = reconciler();
        reconciler
            .handle_event(&checkout_payload("evt_1", "gw_sub_1"), "")
            .await
            .unwrap();
        let sub = store
            .get_subscription_by_billing_ref("gw_sub_1")
            .await
            .unwrap();
        store
            .set_subscription_status(&sub.id, SubscriptionStatus::PastDue)
            .await
            .unwrap();

        let payload = r#"{
            "eventId": "evt_pay",
            "type": "payment.succeeded",
            "amount": 9900,
            "currency": "usd",
            "subscriptionRef": "gw_sub_1"
        }"#;
        reconciler.handle_event(payload, "").await.unwrap();

        let after = store.get_subscription(&sub.id).await.unwrap();
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(after.current_period_start, sub.current_period_end);
        assert_eq!(
            after.current_period_end,
            sub.current_period_end + Duration::days(BILLING_PERIOD_DAYS)
        );
        let payments = store.list_payments_for_subscription(&sub.id).await.unwrap();
        assert_eq!(payments.len(), 2);
    }

    #[tokio::test]
    async fn payment_failure_marks_subscription_past_due() {
        let (store, _audit, reconciler) = reconciler();
        reconciler
            .handle_event(&checkout_payload("evt_1", "gw_sub_1"), "")
            .await
            .unwrap();

        let payload = r#"{
            "eventId": "evt_fail",
            "type": "payment.failed",
            "amount": 9900,
            "currency": "usd",
            "subscriptionRef": "gw_sub_1"
        }"#;
        reconciler.handle_event(payload, "").await.unwrap();

        let sub = store
            .get_subscription_by_billing_ref("gw_sub_1")
            .await
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        let payments = store.list_payments_for_subscription(&sub.id).await.unwrap();
        assert_eq!(payments[1].status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn gateway_cancellation_sets_cancel_at_period_end() {
        let (store, _audit, reconciler) = reconciler();
        reconciler
            .handle_event(&checkout_payload("evt_1", "gw_sub_1"), "")
            .await
            .unwrap();

        let payload = r#"{
            "eventId": "evt_cancel",
            "type": "subscription.cancelled",
            "subscriptionRef": "gw_sub_1"
        }"#;
        reconciler.handle_event(payload, "").await.unwrap();

        let sub = store
            .get_subscription_by_billing_ref("gw_sub_1")
            .await
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Cancelled);
        assert!(sub.cancel_at_period_end);
    }

    #[tokio::test]
    async fn unknown_event_is_acknowledged_without_a_claim() {
        let (store, _audit, reconciler) = reconciler();

        reconciler
            .handle_event(r#"{"eventId": "evt_u", "type": "refund.issued"}"#, "")
            .await
            .unwrap();

        assert!(matches!(
            store.get_processed_event("evt_u").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn deterministic_failure_records_an_incident() {
        let (store, audit, reconciler) = reconciler();

        // No subscription with this billing ref exists.
        let payload = r#"{
            "eventId": "evt_orphan",
            "type": "payment.succeeded",
            "amount": 500,
            "currency": "usd",
            "subscriptionRef": "gw_missing"
        }"#;
        let err = reconciler.handle_event(payload, "").await.unwrap_err();
        assert!(matches!(err, BillingError::Storage(StoreError::NotFound)));

        let processed = store.get_processed_event("evt_orphan").await.unwrap();
        assert!(!processed.succeeded);
        // Deterministic failures are not retried.
        assert_eq!(processed.attempts, 1);
        assert!(processed.last_error.is_some());

        let incidents = audit
            .query(AuditLogFilter::new().action(AuditAction::ReconcileIncident))
            .await
            .unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].resource_id, "evt_orphan");
        assert_eq!(incidents[0].result, AuditResult::Error);
    }

    #[tokio::test]
    async fn rejected_signature_never_reaches_the_store() {
        let (store, _audit, _r) = reconciler();
        let config = BillingConfig {
            webhook_secret: "whsec_test".into(),
            max_attempts: RETRY_LIMIT,
        };
        let verifier = Arc::new(crate::NoopVerifier::new(&config));
        let guarded = Reconciler::new(
            &config,
            store.clone(),
            Arc::new(MemoryAuditLog::new()),
            verifier,
        );

        let err = guarded
            .handle_event(&checkout_payload("evt_sig", "gw_sub_sig"), "")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Gateway(_)));
        assert!(matches!(
            store.get_processed_event("evt_sig").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn seat_floor_violation_in_checkout_is_a_payload_error() {
        let (_store, _audit, reconciler) = reconciler();

        let payload = r#"{
            "eventId": "evt_floor",
            "type": "checkout.completed",
            "amount": 100,
            "currency": "usd",
            "subscriptionRef": "gw_sub_floor",
            "customerRef": "buyer@example.com",
            "tier": "enterprise",
            "seats": 5
        }"#;
        let err = reconciler.handle_event(payload, "").await.unwrap_err();
        assert!(matches!(err, BillingError::Payload(_)));
    }
}
