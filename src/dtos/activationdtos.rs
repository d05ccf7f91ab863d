// dtos/activationdtos.rs
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::activationmodels::EmergencyContact;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub message: String,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: T) -> Self {
        ApiResponse {
            status: "success".to_string(),
            message: message.into(),
            data,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodDto {
    Card,
    Pix,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ActivationRequestDto {
    #[validate(length(min = 1, max = 120, message = "Rider name is required"))]
    pub name: String,

    #[validate(length(min = 8, max = 32, message = "A valid phone number is required"))]
    pub phone: String,

    #[validate(email(message = "A valid email is required"))]
    pub email: String,

    pub blood_type: Option<String>,

    #[validate(length(min = 1, message = "At least one emergency contact is required"))]
    pub emergency_contacts: Vec<EmergencyContact>,

    pub medical_notes: Option<String>,

    #[validate(length(min = 1, message = "Plan selection is required"))]
    pub plan: String,

    pub payment_method: PaymentMethodDto,

    // Gateway risk scoring requires the collected device fingerprint.
    #[validate(length(min = 1, message = "Device fingerprint is required"))]
    pub device_id: String,

    pub card_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActivationResponseDto {
    pub reference: String,
    pub correlation_id: String,
    pub payment_id: String,
    pub amount: i64,
    pub plan: String,
    pub pix_qr_code: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct StatusQueryDto {
    pub reference: Option<String>,
    pub payment_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponseDto {
    pub status: String,
    pub should_redirect: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_target: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pix_qr_code: Option<String>,
}

/// Minimal webhook envelope. Everything past these fields is ignored at the
/// boundary; the processor fetches the authoritative payment state itself.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub action: String,
    pub data: WebhookData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookData {
    pub id: String,
}

impl WebhookEnvelope {
    pub fn parse(body: &str) -> Result<WebhookEnvelope, serde_json::Error> {
        serde_json::from_str(body)
    }

    /// Only payment update events are actionable; everything else is
    /// acknowledged and dropped at the boundary.
    pub fn is_actionable(&self) -> bool {
        self.event_type == "payment" && self.action == "payment.updated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_parses_minimal_shape() {
        let body = r#"{
            "id": "evt-123",
            "type": "payment",
            "action": "payment.updated",
            "data": {"id": "pay-789"},
            "live_mode": true,
            "api_version": "v1"
        }"#;
        let envelope = WebhookEnvelope::parse(body).unwrap();
        assert_eq!(envelope.id, "evt-123");
        assert_eq!(envelope.data.id, "pay-789");
        assert!(envelope.is_actionable());
    }

    #[test]
    fn envelope_rejects_malformed_body() {
        assert!(WebhookEnvelope::parse("not json").is_err());
        assert!(WebhookEnvelope::parse(r#"{"id": "x"}"#).is_err());
    }

    #[test]
    fn non_payment_events_are_not_actionable() {
        let body = r#"{"id":"e","type":"subscription","action":"payment.updated","data":{"id":"p"}}"#;
        assert!(!WebhookEnvelope::parse(body).unwrap().is_actionable());

        let body = r#"{"id":"e","type":"payment","action":"payment.created","data":{"id":"p"}}"#;
        assert!(!WebhookEnvelope::parse(body).unwrap().is_actionable());
    }
}
