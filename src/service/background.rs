// service/background.rs
use chrono::Utc;
use std::sync::Arc;
use tokio::time::{interval, Duration};

use crate::{db::activationdb::ActivationStore, AppState};

/// Hourly purge of abandoned activations past their retention window.
pub async fn start_expiry_purge_job(app_state: Arc<AppState>) {
    let mut interval = interval(Duration::from_secs(3600));

    loop {
        interval.tick().await;

        match app_state.db_client.purge_expired(Utc::now()).await {
            Ok(purged) if purged > 0 => {
                tracing::info!("Expiry purge removed {} abandoned activations", purged)
            }
            Ok(_) => tracing::debug!("Expiry purge found nothing to remove"),
            Err(e) => tracing::error!("Expiry purge failed: {}", e),
        }
    }
}
