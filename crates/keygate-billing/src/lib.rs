//! keygate-billing - Payment reconciliation for keygate
//!
//! Turns signed payment-gateway webhook events into entitlement state:
//! - checkout completions provision a subscription, its first payment, and
//!   the purchaser's license
//! - payment outcomes roll billing periods and drive ACTIVE/PAST_DUE
//! - gateway-side subscription changes are synced back into the store
//!
//! Every event is claimed by its gateway event id before any side effect,
//! so redelivered events are acknowledged without mutating anything twice.

use async_trait::async_trait;
use thiserror::Error;

use keygate_storage::StoreError;

mod webhook;
pub use webhook::{parse_gateway_event, GatewayEvent, Reconciler, RETRY_LIMIT};

/// Billing reconciliation errors
#[derive(Debug, Error)]
pub enum BillingError {
    /// Payment gateway unavailable or rejected the request.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Event payload missing required fields or otherwise malformed.
    #[error("malformed event payload: {0}")]
    Payload(String),

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether a handler failure is worth retrying. Gateway and backend
    /// failures are transient; everything else is deterministic and will
    /// fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::Gateway(_) => true,
            BillingError::Storage(StoreError::Backend(_)) => true,
            _ => false,
        }
    }
}

/// Configuration for the payment reconciler
#[derive(Clone)]
pub struct BillingConfig {
    /// Webhook secret for signature verification. Empty disables
    /// verification (development only).
    pub webhook_secret: String,

    /// Maximum handler attempts per event (default: 3)
    pub max_attempts: i32,
}

impl BillingConfig {
    /// Create a reconciler configuration from environment variables
    pub fn from_env() -> Result<Self, BillingError> {
        Ok(Self {
            webhook_secret: std::env::var("KEYGATE_WEBHOOK_SECRET")
                .or_else(|_| std::env::var("BILLING_WEBHOOK_SECRET"))
                .unwrap_or_default(),
            max_attempts: match std::env::var("KEYGATE_WEBHOOK_MAX_ATTEMPTS") {
                Ok(v) => v.parse().map_err(|_| {
                    BillingError::Config(format!(
                        "Invalid KEYGATE_WEBHOOK_MAX_ATTEMPTS value '{}': expected a number",
                        v
                    ))
                })?,
                Err(_) => RETRY_LIMIT,
            },
        })
    }

    /// Create a test configuration (no signature verification)
    pub fn test() -> Self {
        Self {
            webhook_secret: String::new(),
            max_attempts: RETRY_LIMIT,
        }
    }
}

/// Verifies the authenticity of a raw webhook delivery before it is parsed.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(&self, payload: &str, signature: &str) -> Result<(), BillingError>;
}

/// Default verifier honoring the gateway's verification contract.
///
/// # Security
/// When a webhook secret is configured, a signature is REQUIRED and the
/// verifier fails closed: HMAC verification against the gateway's scheme is
/// not implemented here, so configured deployments reject every delivery
/// rather than accept a forgeable one. Pass an empty secret to skip
/// verification in development.
pub struct NoopVerifier {
    webhook_secret: String,
}

impl NoopVerifier {
    pub fn new(config: &BillingConfig) -> Self {
        Self {
            webhook_secret: config.webhook_secret.clone(),
        }
    }
}

#[async_trait]
impl SignatureVerifier for NoopVerifier {
    async fn verify(&self, _payload: &str, signature: &str) -> Result<(), BillingError> {
        if self.webhook_secret.is_empty() {
            return Ok(());
        }

        if signature.is_empty() {
            // An attacker could bypass verification by omitting the
            // signature header, so a configured secret makes it mandatory.
            return Err(BillingError::Gateway(
                "Missing webhook signature. Signature verification is required when \
                 a webhook secret is configured."
                    .into(),
            ));
        }

        Err(BillingError::Gateway(
            "Webhook signature verification not implemented. \
             Remove the webhook secret for development, \
             or implement HMAC verification for production."
                .into(),
        ))
    }
}
