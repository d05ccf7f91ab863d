// mail/sendmail.rs
use serde_json::json;
use tokio::time::Duration;

use crate::service::retry::{with_retries, RetryPolicy};

const MAIL_RETRY_POLICY: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(1000));

pub async fn send_email(
    api_key: &str,
    from_email: &str,
    to_email: &str,
    subject: &str,
    html_body: &str,
) -> Result<(), String> {
    if to_email.is_empty() {
        return Err("Email recipient cannot be empty".into());
    }
    if !to_email.contains('@') {
        return Err(format!("Invalid email address: {}", to_email));
    }
    if api_key.is_empty() {
        return Err("Mail delivery API key is not configured".into());
    }

    let email_id = with_retries(MAIL_RETRY_POLICY, "mail.send", |_| {
        deliver(api_key, from_email, to_email, subject, html_body)
    })
    .await?;

    tracing::info!("Email sent to {} (id: {})", to_email, email_id);
    Ok(())
}

async fn deliver(
    api_key: &str,
    from_email: &str,
    to_email: &str,
    subject: &str,
    html_body: &str,
) -> Result<String, String> {
    let client = reqwest::Client::new();
    let request_body = json!({
        "from": from_email,
        "to": to_email,
        "subject": subject,
        "html": html_body,
    });

    let response = client
        .post("https://api.resend.com/emails")
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .json(&request_body)
        .send()
        .await
        .map_err(|e| format!("Network error: {}", e))?;

    let status = response.status();
    let response_text = response
        .text()
        .await
        .unwrap_or_else(|_| "No response body".to_string());

    if status.is_success() {
        if let Ok(body) = serde_json::from_str::<serde_json::Value>(&response_text) {
            if let Some(id) = body.get("id").and_then(|v| v.as_str()) {
                return Ok(id.to_string());
            }
        }
        Ok("success".to_string())
    } else {
        Err(format!(
            "Mail API error ({}): {}",
            status.as_u16(),
            response_text
        ))
    }
}
