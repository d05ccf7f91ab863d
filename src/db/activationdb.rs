// db/activationdb.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Error;
use uuid::Uuid;

use super::db::DBClient;
use crate::models::activationmodels::*;

#[derive(Debug, Clone)]
pub struct NewActivation {
    pub reference: String,
    pub payment_id: Option<String>,
    pub amount: i64,
    pub plan: ProtectionPlan,
    pub payload: serde_json::Value,
    pub pix_qr_code: Option<String>,
    pub correlation_id: String,
}

#[derive(Debug, Clone)]
pub struct NewProfile {
    pub payment_id: String,
    pub activation_reference: String,
    pub rider_name: String,
    pub rider_phone: String,
    pub blood_type: Option<String>,
    pub emergency_contacts: serde_json::Value,
    pub plan: ProtectionPlan,
    pub card_payload: String,
}

#[async_trait]
pub trait ActivationStore: Send + Sync {
    async fn create_pending_activation(
        &self,
        new: NewActivation,
    ) -> Result<PendingActivation, Error>;

    async fn get_activation_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<PendingActivation>, Error>;

    async fn get_activation_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<PendingActivation>, Error>;

    /// Advance the activation to `next`, guarded by the allowed-transition
    /// table. Returns `None` when the transition is not permitted (including
    /// races lost against a concurrent writer that moved the record into a
    /// state `next` is unreachable from). Writing the current status again is
    /// a no-op that returns the record unchanged.
    async fn advance_status(
        &self,
        reference: &str,
        next: ActivationStatus,
        last_error: Option<String>,
    ) -> Result<Option<PendingActivation>, Error>;

    async fn get_profile_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<EmergencyProfile>, Error>;

    /// Insert the fulfilled profile. Safe under duplicate delivery: a second
    /// insert for the same payment id returns the existing row untouched.
    async fn create_profile(&self, new: NewProfile) -> Result<EmergencyProfile, Error>;

    /// Remove abandoned records past their retention window. Terminal records
    /// are kept for audit.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, Error>;
}

#[async_trait]
impl ActivationStore for DBClient {
    async fn create_pending_activation(
        &self,
        new: NewActivation,
    ) -> Result<PendingActivation, Error> {
        let now = Utc::now();
        let activation = sqlx::query_as::<_, PendingActivation>(
            r#"
            INSERT INTO pending_activations
                (id, reference, payment_id, status, amount, plan, payload,
                 pix_qr_code, correlation_id, created_at, updated_at, expires_at)
            VALUES ($1, $2, $3, 'submitted', $4, $5, $6, $7, $8, $9, $9, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.reference)
        .bind(&new.payment_id)
        .bind(new.amount)
        .bind(new.plan)
        .bind(&new.payload)
        .bind(&new.pix_qr_code)
        .bind(&new.correlation_id)
        .bind(now)
        .bind(pending_expiry_from(now))
        .fetch_one(&self.pool)
        .await?;

        Ok(activation)
    }

    async fn get_activation_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<PendingActivation>, Error> {
        sqlx::query_as::<_, PendingActivation>(
            "SELECT * FROM pending_activations WHERE reference = $1",
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
    }

    async fn get_activation_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<PendingActivation>, Error> {
        sqlx::query_as::<_, PendingActivation>(
            "SELECT * FROM pending_activations WHERE payment_id = $1",
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn advance_status(
        &self,
        reference: &str,
        next: ActivationStatus,
        last_error: Option<String>,
    ) -> Result<Option<PendingActivation>, Error> {
        // Optimistic compare-and-set: read the current status, check the
        // transition table, then write guarded by the status we read. A lost
        // race re-reads and tries again a bounded number of times.
        for _ in 0..3 {
            let current = sqlx::query_as::<_, PendingActivation>(
                "SELECT * FROM pending_activations WHERE reference = $1",
            )
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?;

            let Some(current) = current else {
                return Ok(None);
            };

            if current.status == next {
                return Ok(Some(current));
            }

            if !current.status.can_transition_to(next) {
                return Ok(None);
            }

            let updated = sqlx::query_as::<_, PendingActivation>(
                r#"
                UPDATE pending_activations
                SET status = $1, last_error = $2, updated_at = NOW()
                WHERE reference = $3 AND status = $4
                RETURNING *
                "#,
            )
            .bind(next)
            .bind(&last_error)
            .bind(reference)
            .bind(current.status)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(activation) = updated {
                return Ok(Some(activation));
            }
        }

        Ok(None)
    }

    async fn get_profile_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<EmergencyProfile>, Error> {
        sqlx::query_as::<_, EmergencyProfile>(
            "SELECT * FROM emergency_profiles WHERE payment_id = $1",
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn create_profile(&self, new: NewProfile) -> Result<EmergencyProfile, Error> {
        let inserted = sqlx::query_as::<_, EmergencyProfile>(
            r#"
            INSERT INTO emergency_profiles
                (id, payment_id, activation_reference, rider_name, rider_phone,
                 blood_type, emergency_contacts, plan, card_payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (payment_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.payment_id)
        .bind(&new.activation_reference)
        .bind(&new.rider_name)
        .bind(&new.rider_phone)
        .bind(&new.blood_type)
        .bind(&new.emergency_contacts)
        .bind(new.plan)
        .bind(&new.card_payload)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(profile) => Ok(profile),
            // Conflict: a concurrent or earlier delivery already created it.
            None => self
                .get_profile_by_payment_id(&new.payment_id)
                .await?
                .ok_or(Error::RowNotFound),
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM pending_activations
            WHERE expires_at < $1 AND status NOT IN ('fulfilled', 'rejected')
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
