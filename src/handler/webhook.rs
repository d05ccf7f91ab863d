// handler/webhook.rs
use axum::{http::HeaderMap, response::IntoResponse, Extension, Json};
use std::sync::Arc;

use crate::{
    dtos::activationdtos::WebhookEnvelope,
    error::{ErrorMessage, HttpError},
    service::queue::{JobPublisher, PublishOutcome, QueueJob, TOPIC_FULFILLMENT},
    service::signature::verify_webhook_signature,
    AppState,
};

/// Payment-processor callback boundary. The only synchronous work allowed
/// here is authenticating the event and enqueueing a fulfillment job; the
/// processor does everything else off the queue. Anything that must not be
/// retried by the processor's transport answers 200.
pub async fn payment_webhook(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, HttpError> {
    let signature = headers
        .get("x-signature")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| HttpError::unauthorized(ErrorMessage::SignatureNotProvided.to_string()))?;

    let request_id = headers
        .get("x-request-id")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| HttpError::unauthorized(ErrorMessage::SignatureNotProvided.to_string()))?;

    // A permanently-malformed body must not be retried forever upstream:
    // acknowledge and drop. This is not a security event.
    let envelope = match WebhookEnvelope::parse(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::info!("webhook: unparseable envelope ignored: {}", e);
            return Ok(Json(serde_json::json!({
                "status": "ignored",
                "reason": "malformed"
            })));
        }
    };

    if !verify_webhook_signature(
        signature,
        request_id,
        &envelope.data.id,
        &app_state.env.webhook_secret,
    ) {
        tracing::warn!(
            "webhook: signature verification failed for event {} (payment {})",
            envelope.id,
            envelope.data.id
        );
        return Err(HttpError::unauthorized(
            ErrorMessage::InvalidSignature.to_string(),
        ));
    }

    if !envelope.is_actionable() {
        tracing::info!(
            "webhook: event {} ({}/{}) is not actionable, ignored",
            envelope.id,
            envelope.event_type,
            envelope.action
        );
        return Ok(Json(serde_json::json!({
            "status": "ignored",
            "reason": "event_not_actionable"
        })));
    }

    // The envelope id correlates queue-side logs until the processor loads
    // the activation's own correlation id.
    let job = QueueJob::fulfillment(&envelope.data.id, &envelope.id);

    match app_state.queue.publish(TOPIC_FULFILLMENT, &job).await {
        Ok(PublishOutcome::Enqueued { job_id }) => {
            tracing::info!(
                "webhook: enqueued fulfillment job {} for payment {}",
                job_id,
                envelope.data.id
            );
            Ok(Json(serde_json::json!({
                "status": "accepted",
                "job_id": job_id
            })))
        }
        Ok(PublishOutcome::Deduplicated { dedupe_key }) => {
            tracing::info!(
                "webhook: duplicate delivery collapsed for {} (key {})",
                envelope.data.id,
                dedupe_key
            );
            Ok(Json(serde_json::json!({
                "status": "accepted",
                "deduplicated": true
            })))
        }
        Err(e) => {
            // A 5xx here would trigger an upstream retry storm. Log loudly
            // for manual reconciliation and acknowledge.
            tracing::error!(
                "webhook: enqueue failed for payment {}, manual reconciliation needed: {}",
                envelope.data.id,
                e
            );
            Ok(Json(serde_json::json!({
                "status": "accepted",
                "queued": false
            })))
        }
    }
}
