// handler/status.rs
use axum::{extract::Query, response::IntoResponse, Extension, Json};
use chrono::Utc;
use std::sync::Arc;

use crate::{
    db::activationdb::ActivationStore,
    dtos::activationdtos::{StatusQueryDto, StatusResponseDto},
    error::{ErrorMessage, HttpError},
    service::status_resolver::{resolve, StatusSnapshot},
    AppState,
};

/// Client polling endpoint. Read-only: it observes what the processor has
/// written and never advances the pipeline itself.
pub async fn activation_status(
    Query(params): Query<StatusQueryDto>,
    Extension(app_state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    let activation = if let Some(reference) = &params.reference {
        // Guard against reference guessing with the minted format.
        if !reference.starts_with("MG_") || reference.len() < 10 {
            return Err(HttpError::bad_request(
                ErrorMessage::InvalidReferenceFormat.to_string(),
            ));
        }
        app_state
            .db_client
            .get_activation_by_reference(reference)
            .await
            .map_err(|e| HttpError::server_error(e.to_string()))?
    } else if let Some(payment_id) = &params.payment_id {
        app_state
            .db_client
            .get_activation_by_payment_id(payment_id)
            .await
            .map_err(|e| HttpError::server_error(e.to_string()))?
    } else {
        return Err(HttpError::bad_request(
            "Either reference or payment_id is required",
        ));
    };

    let payment_id = activation
        .as_ref()
        .and_then(|a| a.payment_id.clone())
        .or_else(|| params.payment_id.clone());

    let profile_exists = match &payment_id {
        Some(payment_id) => app_state
            .db_client
            .get_profile_by_payment_id(payment_id)
            .await
            .map_err(|e| HttpError::server_error(e.to_string()))?
            .is_some(),
        None => false,
    };

    let correlation_id = activation.as_ref().map(|a| a.correlation_id.clone());

    let resolution = resolve(&StatusSnapshot {
        activation,
        profile_exists,
        now: Utc::now(),
    });

    Ok(Json(StatusResponseDto {
        status: resolution.state.to_str().to_string(),
        should_redirect: resolution.should_redirect,
        redirect_target: resolution.redirect_target.map(|t| t.to_str().to_string()),
        message: resolution.message,
        correlation_id,
        progress: resolution.progress,
        pix_qr_code: resolution.pix_qr_code,
    }))
}
