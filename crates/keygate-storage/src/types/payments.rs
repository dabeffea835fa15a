//! Payment and processed-event records.
//!
//! Payments are created and updated exclusively by the payment reconciler;
//! every other component treats them as read-only.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PaymentId, SubscriptionId};

/// Payment status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "succeeded" => Ok(PaymentStatus::Succeeded),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            _ => Err(format!("invalid payment status: {}", s)),
        }
    }
}

/// Payment record
#[derive(Clone, Debug)]
pub struct Payment {
    pub id: PaymentId,
    pub subscription_id: SubscriptionId,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    /// Payment gateway's own reference for this payment.
    pub gateway_ref: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating a payment
#[derive(Clone, Debug)]
pub struct CreatePaymentParams {
    pub subscription_id: SubscriptionId,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub gateway_ref: String,
}

/// A gateway webhook event that has been claimed for processing.
/// The event id is the serialization point for at-most-once delivery:
/// claiming an already-claimed id fails with `AlreadyExists`.
#[derive(Clone, Debug)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub event_type: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub succeeded: bool,
    pub received_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
