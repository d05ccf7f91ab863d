// service/payment_gateway.rs
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    service::error::ServiceError,
    service::retry::{with_retries, RetryPolicy},
};

/// Authoritative payment state as reported by the gateway. Intermediate
/// gateway statuses all collapse into `Pending`; the pipeline only ever acts
/// on `Approved` and `Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayPaymentStatus {
    Approved,
    Rejected,
    Pending,
}

impl GatewayPaymentStatus {
    fn from_gateway(status: &str) -> GatewayPaymentStatus {
        match status {
            "approved" => GatewayPaymentStatus::Approved,
            "rejected" | "cancelled" | "refunded" | "charged_back" => {
                GatewayPaymentStatus::Rejected
            }
            _ => GatewayPaymentStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatePaymentRequest {
    pub reference: String,
    pub amount: i64,
    pub description: String,
    pub payer_email: String,
    pub device_id: String,
    pub pix: bool,
    pub card_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayPayment {
    pub payment_id: String,
    pub status: GatewayPaymentStatus,
    pub pix_qr_code: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
    ) -> Result<GatewayPayment, ServiceError>;

    /// Fetch the authoritative state of a payment. The fulfillment processor
    /// is the only caller of this on the confirmation path.
    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, ServiceError>;
}

pub struct PaymentGatewayService {
    base_url: String,
    access_token: String,
    client: reqwest::Client,
}

impl PaymentGatewayService {
    pub fn new(config: &Config) -> Self {
        Self {
            base_url: config.gateway_base_url.clone(),
            access_token: config.gateway_access_token.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn payment_from_body(body: &serde_json::Value) -> Result<GatewayPayment, ServiceError> {
        let payment_id = match &body["id"] {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => {
                return Err(ServiceError::Gateway(
                    "payment response missing id".to_string(),
                ))
            }
        };

        let status = body["status"]
            .as_str()
            .map(GatewayPaymentStatus::from_gateway)
            .ok_or_else(|| ServiceError::Gateway("payment response missing status".to_string()))?;

        let pix_qr_code = body["point_of_interaction"]["transaction_data"]["qr_code"]
            .as_str()
            .map(|s| s.to_string());

        Ok(GatewayPayment {
            payment_id,
            status,
            pix_qr_code,
        })
    }
}

#[async_trait]
impl PaymentGateway for PaymentGatewayService {
    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
    ) -> Result<GatewayPayment, ServiceError> {
        let payload = serde_json::json!({
            "external_reference": request.reference,
            "transaction_amount": request.amount as f64 / 100.0,
            "description": request.description,
            "payer": { "email": request.payer_email },
            "payment_method_id": if request.pix { "pix" } else { "credit_card" },
            "token": request.card_token,
            "metadata": { "device_id": request.device_id },
        });

        let response = self
            .client
            .post(format!("{}/v1/payments", self.base_url))
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("X-Idempotency-Key", &request.reference)
            .header("X-Device-Session-Id", &request.device_id)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ServiceError::Gateway(format!(
                "payment creation failed ({}): {}",
                status, text
            )));
        }

        let body: serde_json::Value = response.json().await?;
        Self::payment_from_body(&body)
    }

    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, ServiceError> {
        let url = format!("{}/v1/payments/{}", self.base_url, payment_id);

        // Transient gateway hiccups are retried here; anything left over is
        // handled by the broker-level retry of the surrounding job.
        let response = with_retries(
            RetryPolicy::new(3, std::time::Duration::from_millis(500)),
            "gateway.fetch_payment",
            |_| async {
                self.client
                    .get(&url)
                    .header("Authorization", format!("Bearer {}", self.access_token))
                    .send()
                    .await?
                    .error_for_status()
                    .map_err(ServiceError::from)
            },
        )
        .await?;

        let body: serde_json::Value = response.json().await?;
        Self::payment_from_body(&body)
    }
}
