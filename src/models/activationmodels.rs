// models/activationmodels.rs
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How long an unconfirmed activation is kept before the purge job removes it.
pub const PENDING_RETENTION_HOURS: i64 = 24;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "activation_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActivationStatus {
    Submitted,
    ProcessorPending,
    Approved,
    Rejected,
    FulfillmentFailed,
    Fulfilled,
}

impl ActivationStatus {
    /// Allowed forward transitions. Every writer must consult this table
    /// before updating the record; anything not listed here is refused.
    pub fn can_transition_to(self, next: ActivationStatus) -> bool {
        use ActivationStatus::*;
        matches!(
            (self, next),
            (Submitted, ProcessorPending)
                | (Submitted, Approved)
                | (Submitted, Rejected)
                | (ProcessorPending, Approved)
                | (ProcessorPending, Rejected)
                | (Approved, Fulfilled)
                | (Approved, FulfillmentFailed)
                | (FulfillmentFailed, Approved)
                | (FulfillmentFailed, Fulfilled)
        )
    }

}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "protection_plan", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProtectionPlan {
    Basic,
    Premium,
}

impl ProtectionPlan {
    pub fn from_selector(selector: &str) -> Option<ProtectionPlan> {
        match selector {
            "basic" => Some(ProtectionPlan::Basic),
            "premium" => Some(ProtectionPlan::Premium),
            _ => None,
        }
    }

    /// Plan price in centavos.
    pub fn amount_centavos(&self) -> i64 {
        match self {
            ProtectionPlan::Basic => 5500,
            ProtectionPlan::Premium => 8500,
        }
    }

    pub fn to_str(&self) -> &'static str {
        match self {
            ProtectionPlan::Basic => "basic",
            ProtectionPlan::Premium => "premium",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingActivation {
    pub id: Uuid,
    pub reference: String,
    pub payment_id: Option<String>,
    pub status: ActivationStatus,
    pub amount: i64, // in centavos
    pub plan: ProtectionPlan,
    pub payload: serde_json::Value,
    pub pix_qr_code: Option<String>,
    pub correlation_id: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EmergencyProfile {
    pub id: Uuid,
    pub payment_id: String,
    pub activation_reference: String,
    pub rider_name: String,
    pub rider_phone: String,
    pub blood_type: Option<String>,
    pub emergency_contacts: serde_json::Value,
    pub plan: ProtectionPlan,
    pub card_payload: String,
    pub created_at: DateTime<Utc>,
}

/// Domain data carried on the pending record until fulfillment. The pipeline
/// treats it as opaque JSON; the fulfillment processor parses it back into
/// this shape before creating the profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiderPayload {
    pub name: String,
    pub phone: String,
    pub email: String,
    #[serde(default)]
    pub blood_type: Option<String>,
    pub emergency_contacts: Vec<EmergencyContact>,
    #[serde(default)]
    pub medical_notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub name: String,
    pub phone: String,
}

impl RiderPayload {
    pub fn from_value(value: &serde_json::Value) -> Result<RiderPayload, String> {
        let payload: RiderPayload = serde_json::from_value(value.clone())
            .map_err(|e| format!("invalid rider payload: {}", e))?;
        payload.validate()?;
        Ok(payload)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("rider name cannot be empty".to_string());
        }
        if self.phone.trim().is_empty() {
            return Err("rider phone cannot be empty".to_string());
        }
        if !self.email.contains('@') {
            return Err(format!("invalid rider email: {}", self.email));
        }
        if self.emergency_contacts.is_empty() {
            return Err("at least one emergency contact is required".to_string());
        }
        Ok(())
    }
}

pub fn generate_activation_reference() -> String {
    format!(
        "MG_{}",
        uuid::Uuid::new_v4().to_string().replace("-", "").to_uppercase()[..16].to_string()
    )
}

pub fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn pending_expiry_from(created_at: DateTime<Utc>) -> DateTime<Utc> {
    created_at + Duration::hours(PENDING_RETENTION_HOURS)
}
