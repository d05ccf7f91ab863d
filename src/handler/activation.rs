// handler/activation.rs
use axum::{response::IntoResponse, Extension, Json};
use std::sync::Arc;
use validator::Validate;

use crate::{
    db::activationdb::{ActivationStore, NewActivation},
    dtos::activationdtos::*,
    error::{ErrorMessage, HttpError},
    models::activationmodels::*,
    service::payment_gateway::{CreatePaymentRequest, PaymentGateway},
    AppState,
};

/// Submission boundary: collects the rider payload, creates the gateway
/// payment, and writes the initial pending record. Fulfillment never happens
/// here; the webhook-driven processor owns everything privileged.
pub async fn initiate_activation(
    Extension(app_state): Extension<Arc<AppState>>,
    Json(body): Json<ActivationRequestDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let plan = ProtectionPlan::from_selector(&body.plan)
        .ok_or_else(|| HttpError::bad_request(format!("Unknown plan: {}", body.plan)))?;

    if body.payment_method == PaymentMethodDto::Card && body.card_token.is_none() {
        return Err(HttpError::bad_request("Card payments require a card token"));
    }

    let rider = RiderPayload {
        name: body.name,
        phone: body.phone,
        email: body.email.clone(),
        blood_type: body.blood_type,
        emergency_contacts: body.emergency_contacts,
        medical_notes: body.medical_notes,
    };
    rider.validate().map_err(HttpError::bad_request)?;

    let reference = generate_activation_reference();
    let correlation_id = generate_correlation_id();
    let amount = plan.amount_centavos();

    let payment = app_state
        .gateway
        .create_payment(&CreatePaymentRequest {
            reference: reference.clone(),
            amount,
            description: format!("MotoGuard {} plan activation", plan.to_str()),
            payer_email: body.email,
            device_id: body.device_id,
            pix: body.payment_method == PaymentMethodDto::Pix,
            card_token: body.card_token,
        })
        .await
        .map_err(|e| {
            tracing::error!(
                "activation: payment creation failed [correlation_id={}]: {}",
                correlation_id,
                e
            );
            HttpError::server_error(format!(
                "{} (correlation id: {})",
                ErrorMessage::ServerError.to_string(),
                correlation_id
            ))
        })?;

    let payload = serde_json::to_value(&rider)
        .map_err(|e| HttpError::server_error(e.to_string()))?;

    let activation = app_state
        .db_client
        .create_pending_activation(NewActivation {
            reference: reference.clone(),
            payment_id: Some(payment.payment_id.clone()),
            amount,
            plan,
            payload,
            pix_qr_code: payment.pix_qr_code.clone(),
            correlation_id: correlation_id.clone(),
        })
        .await
        .map_err(|e| HttpError::server_error(e.to_string()))?;

    tracing::info!(
        "activation: {} submitted for payment {} [correlation_id={}]",
        activation.reference,
        payment.payment_id,
        correlation_id
    );

    let response = ActivationResponseDto {
        reference: activation.reference,
        correlation_id,
        payment_id: payment.payment_id,
        amount,
        plan: plan.to_str().to_string(),
        pix_qr_code: payment.pix_qr_code,
    };

    Ok(Json(ApiResponse::success(
        "Activation submitted, awaiting payment confirmation",
        response,
    )))
}
