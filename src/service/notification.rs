// service/notification.rs
use async_trait::async_trait;

use crate::{
    config::Config,
    mail::sendmail::send_email,
    service::error::ServiceError,
    service::queue::{JobHandler, QueueJob},
};

/// Queue consumer for notification jobs emitted after fulfillment. Delivery
/// failures are retried by the worker up to the job's budget and then
/// dead-lettered; they never touch the activation state machine.
pub struct NotificationDispatcher {
    resend_api_key: String,
    from_email: String,
    app_url: String,
}

impl NotificationDispatcher {
    pub fn new(config: &Config) -> Self {
        Self {
            resend_api_key: config.resend_api_key.clone(),
            from_email: config.from_email.clone(),
            app_url: config.app_url.clone(),
        }
    }

    async fn send_activation_email(&self, job: &QueueJob) -> Result<(), ServiceError> {
        let email = job.data["email"]
            .as_str()
            .ok_or_else(|| ServiceError::Other("notification job missing email".to_string()))?;
        let rider_name = job.data["rider_name"].as_str().unwrap_or("rider");
        let reference = job.data["reference"].as_str().unwrap_or("");
        let plan = job.data["plan"].as_str().unwrap_or("basic");

        let subject = "Your MotoGuard protection is active";
        let html_body = render_activation_email(&self.app_url, rider_name, reference, plan);

        send_email(&self.resend_api_key, &self.from_email, email, subject, &html_body)
            .await
            .map_err(ServiceError::Mail)?;

        tracing::info!(
            "notification: activation email sent for {} [correlation_id={}]",
            reference,
            job.correlation_id
        );
        Ok(())
    }
}

fn render_activation_email(app_url: &str, rider_name: &str, reference: &str, plan: &str) -> String {
    format!(
        r#"<html>
  <body>
    <h2>Welcome aboard, {rider_name}!</h2>
    <p>Your <strong>{plan}</strong> protection plan is now active.</p>
    <p>Your emergency card is ready: <a href="{app_url}/e/{reference}">view your card</a>.</p>
    <p>Keep a printout with your documents. Ride safe.</p>
    <p>Activation reference: {reference}</p>
  </body>
</html>"#
    )
}

#[async_trait]
impl JobHandler for NotificationDispatcher {
    async fn handle(&self, job: &QueueJob) -> Result<(), ServiceError> {
        self.send_activation_email(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_renders_reference_and_plan() {
        let html = render_activation_email("https://motoguard.app", "Ana", "MG_REF1", "premium");
        assert!(html.contains("Ana"));
        assert!(html.contains("premium"));
        assert!(html.contains("https://motoguard.app/e/MG_REF1"));
    }
}
