// service/status_resolver.rs
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::activationmodels::{ActivationStatus, PendingActivation};

/// A client that has polled this long without a terminal outcome is told to
/// stop waiting. Backend processing continues regardless; a late approval
/// still fulfills.
pub const CLIENT_TIMEOUT_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Approved,
    NotFound,
    Processing,
    Rejected,
    PendingSecondaryAction,
    Pending,
    Timeout,
}

impl ClientState {
    pub fn to_str(&self) -> &'static str {
        match self {
            ClientState::Approved => "approved",
            ClientState::NotFound => "not_found",
            ClientState::Processing => "processing",
            ClientState::Rejected => "rejected",
            ClientState::PendingSecondaryAction => "pending_secondary_action",
            ClientState::Pending => "pending",
            ClientState::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectTarget {
    Success,
    Failure,
}

impl RedirectTarget {
    pub fn to_str(&self) -> &'static str {
        match self {
            RedirectTarget::Success => "success",
            RedirectTarget::Failure => "failure",
        }
    }
}

/// Snapshot of durable state gathered by the polling handler. The resolver
/// itself performs no I/O and never triggers fulfillment.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub activation: Option<PendingActivation>,
    pub profile_exists: bool,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StatusResolution {
    pub state: ClientState,
    pub should_redirect: bool,
    pub redirect_target: Option<RedirectTarget>,
    pub message: String,
    pub progress: Option<u8>,
    pub pix_qr_code: Option<String>,
}

/// Decision table for the polling endpoint, evaluated strictly in priority
/// order. Success is only ever reported off the fulfilled profile itself,
/// never off optimistic client-side state.
pub fn resolve(snapshot: &StatusSnapshot) -> StatusResolution {
    // 1. Fulfilled resource exists: done.
    if snapshot.profile_exists {
        return StatusResolution {
            state: ClientState::Approved,
            should_redirect: true,
            redirect_target: Some(RedirectTarget::Success),
            message: "Your protection is active.".to_string(),
            progress: Some(100),
            pix_qr_code: None,
        };
    }

    // 2. Nothing on record for this reference.
    let Some(activation) = &snapshot.activation else {
        return StatusResolution {
            state: ClientState::NotFound,
            should_redirect: false,
            redirect_target: None,
            message: "We could not find this activation.".to_string(),
            progress: None,
            pix_qr_code: None,
        };
    };

    match activation.status {
        // 3. Approved but fulfillment still in flight (including a recoverable
        //    failure the broker is retrying).
        ActivationStatus::Approved
        | ActivationStatus::FulfillmentFailed
        | ActivationStatus::Fulfilled => StatusResolution {
            state: ClientState::Processing,
            should_redirect: false,
            redirect_target: None,
            message: "Payment confirmed, activating your protection...".to_string(),
            progress: Some(75),
            pix_qr_code: None,
        },

        // 4. Rejected is terminal.
        ActivationStatus::Rejected => StatusResolution {
            state: ClientState::Rejected,
            should_redirect: true,
            redirect_target: Some(RedirectTarget::Failure),
            message: "The payment was not approved.".to_string(),
            progress: None,
            pix_qr_code: None,
        },

        ActivationStatus::Submitted | ActivationStatus::ProcessorPending => {
            // 5. A side-channel step is pending (PIX copy-paste code).
            if let Some(pix) = &activation.pix_qr_code {
                return StatusResolution {
                    state: ClientState::PendingSecondaryAction,
                    should_redirect: false,
                    redirect_target: None,
                    message: "Scan the code to complete your payment.".to_string(),
                    progress: Some(40),
                    pix_qr_code: Some(pix.clone()),
                };
            }

            // 6. Still waiting on the processor; give up client-side after the
            //    timeout window.
            let elapsed = snapshot.now - activation.created_at;
            if elapsed > Duration::seconds(CLIENT_TIMEOUT_SECS) {
                StatusResolution {
                    state: ClientState::Timeout,
                    should_redirect: true,
                    redirect_target: Some(RedirectTarget::Failure),
                    message: "We did not receive a confirmation in time.".to_string(),
                    progress: None,
                    pix_qr_code: None,
                }
            } else {
                let progress = match activation.status {
                    ActivationStatus::ProcessorPending => 50,
                    _ => 25,
                };
                StatusResolution {
                    state: ClientState::Pending,
                    should_redirect: false,
                    redirect_target: None,
                    message: "Waiting for payment confirmation...".to_string(),
                    progress: Some(progress),
                    pix_qr_code: None,
                }
            }
        }
    }
}
