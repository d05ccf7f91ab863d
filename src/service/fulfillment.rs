// service/fulfillment.rs
use async_trait::async_trait;
use base64::Engine;
use redis::aio::ConnectionManager;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::{
    db::activationdb::{ActivationStore, NewProfile},
    models::activationmodels::*,
    service::error::ServiceError,
    service::payment_gateway::{GatewayPaymentStatus, PaymentGateway},
    service::queue::{JobHandler, JobPublisher, QueueJob, TOPIC_NOTIFICATIONS},
};

const CARD_CACHE_TTL_SECS: usize = 86400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FulfillmentOutcome {
    Fulfilled,
    AlreadyFulfilled,
    Rejected,
    ProcessorPending,
    Ignored,
}

/// Queue consumer for fulfillment jobs. Every invocation must assume it may
/// run concurrently with another delivery for the same payment; the durable
/// profile row is the serialization point, not any in-memory state.
pub struct FulfillmentProcessor<S, G, Q> {
    store: Arc<S>,
    gateway: Arc<G>,
    queue: Arc<Q>,
    redis: Option<Arc<ConnectionManager>>,
    app_url: String,
}

impl<S, G, Q> FulfillmentProcessor<S, G, Q>
where
    S: ActivationStore,
    G: PaymentGateway,
    Q: JobPublisher,
{
    pub fn new(
        store: Arc<S>,
        gateway: Arc<G>,
        queue: Arc<Q>,
        redis: Option<Arc<ConnectionManager>>,
        app_url: String,
    ) -> Self {
        Self {
            store,
            gateway,
            queue,
            redis,
            app_url,
        }
    }

    pub async fn process(&self, job: &QueueJob) -> Result<FulfillmentOutcome, ServiceError> {
        let activation = match &job.payment_id {
            Some(payment_id) => self.store.get_activation_by_payment_id(payment_id).await?,
            None => match &job.reference {
                Some(reference) => self.store.get_activation_by_reference(reference).await?,
                None => None,
            },
        };

        let Some(activation) = activation else {
            tracing::warn!(
                "fulfillment: no activation on record for job {} [correlation_id={}]",
                job.job_id,
                job.correlation_id
            );
            return Ok(FulfillmentOutcome::Ignored);
        };

        let payment_id = match job.payment_id.clone().or_else(|| activation.payment_id.clone()) {
            Some(id) => id,
            None => {
                tracing::warn!(
                    "fulfillment: activation {} has no payment id yet, dropping job {}",
                    activation.reference,
                    job.job_id
                );
                return Ok(FulfillmentOutcome::Ignored);
            }
        };

        let payment = self.gateway.fetch_payment(&payment_id).await?;

        match payment.status {
            GatewayPaymentStatus::Pending => {
                // Intermediate processor state; record it and wait for the
                // next webhook.
                let _ = self
                    .store
                    .advance_status(&activation.reference, ActivationStatus::ProcessorPending, None)
                    .await?;
                tracing::info!(
                    "fulfillment: payment {} still pending at the processor [correlation_id={}]",
                    payment_id,
                    activation.correlation_id
                );
                Ok(FulfillmentOutcome::ProcessorPending)
            }
            GatewayPaymentStatus::Rejected => {
                let _ = self
                    .store
                    .advance_status(&activation.reference, ActivationStatus::Rejected, None)
                    .await?;
                tracing::info!(
                    "fulfillment: payment {} rejected, activation {} closed [correlation_id={}]",
                    payment_id,
                    activation.reference,
                    activation.correlation_id
                );
                Ok(FulfillmentOutcome::Rejected)
            }
            GatewayPaymentStatus::Approved => self.fulfill(&activation, &payment_id).await,
        }
    }

    async fn fulfill(
        &self,
        activation: &PendingActivation,
        payment_id: &str,
    ) -> Result<FulfillmentOutcome, ServiceError> {
        // Idempotency gate: a profile for this payment means a previous
        // delivery already did the privileged work.
        if self.store.get_profile_by_payment_id(payment_id).await?.is_some() {
            // Repair the status if a crash landed between profile creation
            // and the final status write.
            let _ = self
                .store
                .advance_status(&activation.reference, ActivationStatus::Fulfilled, None)
                .await?;
            tracing::info!(
                "fulfillment: payment {} already fulfilled, duplicate delivery ignored [correlation_id={}]",
                payment_id,
                activation.correlation_id
            );
            return Ok(FulfillmentOutcome::AlreadyFulfilled);
        }

        let Some(activation) = self
            .store
            .advance_status(&activation.reference, ActivationStatus::Approved, None)
            .await?
        else {
            tracing::warn!(
                "fulfillment: activation {} refused transition to approved, dropping",
                activation.reference
            );
            return Ok(FulfillmentOutcome::Ignored);
        };

        match self.perform_side_effects(&activation, payment_id).await {
            Ok((profile, rider)) => {
                self.store
                    .advance_status(&activation.reference, ActivationStatus::Fulfilled, None)
                    .await?;

                tracing::info!(
                    "fulfillment: activation {} fulfilled, profile {} created [correlation_id={}]",
                    activation.reference,
                    profile.id,
                    activation.correlation_id
                );

                // Best effort: a lost notification never rolls back
                // fulfillment, the profile is already the source of truth.
                let notification = QueueJob::notification(
                    payment_id,
                    &activation.reference,
                    &activation.correlation_id,
                    serde_json::json!({
                        "email": rider.email,
                        "rider_name": rider.name,
                        "reference": activation.reference,
                        "plan": activation.plan.to_str(),
                        "card_payload": profile.card_payload,
                    }),
                );
                if let Err(e) = self.queue.publish(TOPIC_NOTIFICATIONS, &notification).await {
                    tracing::error!(
                        "fulfillment: failed to enqueue notification for {}: {} [correlation_id={}]",
                        activation.reference,
                        e,
                        activation.correlation_id
                    );
                }

                Ok(FulfillmentOutcome::Fulfilled)
            }
            Err(e) => {
                let _ = self
                    .store
                    .advance_status(
                        &activation.reference,
                        ActivationStatus::FulfillmentFailed,
                        Some(e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// The privileged side-effect sequence. Each step is check-then-act
    /// against durable state so a crash-and-redeliver resumes safely.
    async fn perform_side_effects(
        &self,
        activation: &PendingActivation,
        payment_id: &str,
    ) -> Result<(EmergencyProfile, RiderPayload), ServiceError> {
        let rider = RiderPayload::from_value(&activation.payload)
            .map_err(ServiceError::InvalidPayload)?;

        let card_payload = build_card_payload(&self.app_url, &activation.reference, payment_id);

        // Insert is idempotent on payment_id; a duplicate delivery gets the
        // existing row back.
        let profile = self
            .store
            .create_profile(NewProfile {
                payment_id: payment_id.to_string(),
                activation_reference: activation.reference.clone(),
                rider_name: rider.name.clone(),
                rider_phone: rider.phone.clone(),
                blood_type: rider.blood_type.clone(),
                emergency_contacts: serde_json::to_value(&rider.emergency_contacts)
                    .unwrap_or(serde_json::Value::Null),
                plan: activation.plan,
                card_payload: card_payload.clone(),
            })
            .await?;

        self.warm_card_cache(payment_id, &profile.card_payload).await;

        Ok((profile, rider))
    }

    async fn warm_card_cache(&self, payment_id: &str, card_payload: &str) {
        let Some(redis) = &self.redis else {
            return;
        };
        let mut conn = ConnectionManager::clone(redis);
        let result: Result<(), redis::RedisError> = redis::cmd("SET")
            .arg(format!("card:{}", payment_id))
            .arg(card_payload)
            .arg("EX")
            .arg(CARD_CACHE_TTL_SECS)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            // The card is durable in Postgres; a cold cache only costs a read.
            tracing::warn!("fulfillment: card cache warm failed for {}: {}", payment_id, e);
        }
    }
}

/// Deterministic scannable emergency-card payload: the same activation always
/// yields the same artifact, so redelivery cannot mint a second card.
pub fn build_card_payload(app_url: &str, reference: &str, payment_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(reference.as_bytes());
    hasher.update(b":");
    hasher.update(payment_id.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let card = serde_json::json!({
        "url": format!("{}/e/{}", app_url, reference),
        "sig": &digest[..16],
    });
    base64::engine::general_purpose::STANDARD.encode(card.to_string())
}

#[async_trait]
impl<S, G, Q> JobHandler for FulfillmentProcessor<S, G, Q>
where
    S: ActivationStore + Send + Sync,
    G: PaymentGateway + Send + Sync,
    Q: JobPublisher + Send + Sync,
{
    async fn handle(&self, job: &QueueJob) -> Result<(), ServiceError> {
        self.process(job).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::activationdb::NewActivation;
    use crate::service::payment_gateway::{CreatePaymentRequest, GatewayPayment};
    use crate::service::queue::PublishOutcome;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct FakeStore {
        activations: Mutex<HashMap<String, PendingActivation>>,
        profiles: Mutex<HashMap<String, EmergencyProfile>>,
    }

    impl FakeStore {
        fn new() -> Self {
            FakeStore {
                activations: Mutex::new(HashMap::new()),
                profiles: Mutex::new(HashMap::new()),
            }
        }

        fn seed(&self, reference: &str, payment_id: &str, payload: serde_json::Value) {
            let now = Utc::now();
            let activation = PendingActivation {
                id: Uuid::new_v4(),
                reference: reference.to_string(),
                payment_id: Some(payment_id.to_string()),
                status: ActivationStatus::Submitted,
                amount: 5500,
                plan: ProtectionPlan::Basic,
                payload,
                pix_qr_code: None,
                correlation_id: "corr-1".to_string(),
                last_error: None,
                created_at: now,
                updated_at: now,
                expires_at: pending_expiry_from(now),
            };
            self.activations
                .lock()
                .unwrap()
                .insert(reference.to_string(), activation);
        }

        fn status_of(&self, reference: &str) -> ActivationStatus {
            self.activations.lock().unwrap()[reference].status
        }

        fn profile_count(&self) -> usize {
            self.profiles.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ActivationStore for FakeStore {
        async fn create_pending_activation(
            &self,
            new: NewActivation,
        ) -> Result<PendingActivation, sqlx::Error> {
            let now = Utc::now();
            let activation = PendingActivation {
                id: Uuid::new_v4(),
                reference: new.reference.clone(),
                payment_id: new.payment_id,
                status: ActivationStatus::Submitted,
                amount: new.amount,
                plan: new.plan,
                payload: new.payload,
                pix_qr_code: new.pix_qr_code,
                correlation_id: new.correlation_id,
                last_error: None,
                created_at: now,
                updated_at: now,
                expires_at: pending_expiry_from(now),
            };
            self.activations
                .lock()
                .unwrap()
                .insert(new.reference, activation.clone());
            Ok(activation)
        }

        async fn get_activation_by_reference(
            &self,
            reference: &str,
        ) -> Result<Option<PendingActivation>, sqlx::Error> {
            Ok(self.activations.lock().unwrap().get(reference).cloned())
        }

        async fn get_activation_by_payment_id(
            &self,
            payment_id: &str,
        ) -> Result<Option<PendingActivation>, sqlx::Error> {
            Ok(self
                .activations
                .lock()
                .unwrap()
                .values()
                .find(|a| a.payment_id.as_deref() == Some(payment_id))
                .cloned())
        }

        async fn advance_status(
            &self,
            reference: &str,
            next: ActivationStatus,
            last_error: Option<String>,
        ) -> Result<Option<PendingActivation>, sqlx::Error> {
            let mut activations = self.activations.lock().unwrap();
            let Some(activation) = activations.get_mut(reference) else {
                return Ok(None);
            };
            if activation.status == next {
                return Ok(Some(activation.clone()));
            }
            if !activation.status.can_transition_to(next) {
                return Ok(None);
            }
            activation.status = next;
            activation.last_error = last_error;
            activation.updated_at = Utc::now();
            Ok(Some(activation.clone()))
        }

        async fn get_profile_by_payment_id(
            &self,
            payment_id: &str,
        ) -> Result<Option<EmergencyProfile>, sqlx::Error> {
            Ok(self.profiles.lock().unwrap().get(payment_id).cloned())
        }

        async fn create_profile(&self, new: NewProfile) -> Result<EmergencyProfile, sqlx::Error> {
            let mut profiles = self.profiles.lock().unwrap();
            if let Some(existing) = profiles.get(&new.payment_id) {
                return Ok(existing.clone());
            }
            let profile = EmergencyProfile {
                id: Uuid::new_v4(),
                payment_id: new.payment_id.clone(),
                activation_reference: new.activation_reference,
                rider_name: new.rider_name,
                rider_phone: new.rider_phone,
                blood_type: new.blood_type,
                emergency_contacts: new.emergency_contacts,
                plan: new.plan,
                card_payload: new.card_payload,
                created_at: Utc::now(),
            };
            profiles.insert(new.payment_id, profile.clone());
            Ok(profile)
        }

        async fn purge_expired(&self, _now: chrono::DateTime<Utc>) -> Result<u64, sqlx::Error> {
            Ok(0)
        }
    }

    struct FakeGateway {
        status: GatewayPaymentStatus,
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        async fn create_payment(
            &self,
            request: &CreatePaymentRequest,
        ) -> Result<GatewayPayment, ServiceError> {
            Ok(GatewayPayment {
                payment_id: format!("pay-{}", request.reference),
                status: GatewayPaymentStatus::Pending,
                pix_qr_code: None,
            })
        }

        async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, ServiceError> {
            Ok(GatewayPayment {
                payment_id: payment_id.to_string(),
                status: self.status,
                pix_qr_code: None,
            })
        }
    }

    #[derive(Default)]
    struct FakePublisher {
        published: Mutex<Vec<(String, QueueJob)>>,
    }

    #[async_trait]
    impl JobPublisher for FakePublisher {
        async fn publish(
            &self,
            topic: &str,
            job: &QueueJob,
        ) -> Result<PublishOutcome, ServiceError> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), job.clone()));
            Ok(PublishOutcome::Enqueued {
                job_id: job.job_id.clone(),
            })
        }
    }

    fn rider_payload() -> serde_json::Value {
        serde_json::json!({
            "name": "Ana Souza",
            "phone": "+5511999990000",
            "email": "ana@example.com",
            "blood_type": "O+",
            "emergency_contacts": [{"name": "Carlos", "phone": "+5511988880000"}]
        })
    }

    fn processor(
        store: Arc<FakeStore>,
        status: GatewayPaymentStatus,
        publisher: Arc<FakePublisher>,
    ) -> FulfillmentProcessor<FakeStore, FakeGateway, FakePublisher> {
        FulfillmentProcessor::new(
            store,
            Arc::new(FakeGateway { status }),
            publisher,
            None,
            "https://motoguard.app".to_string(),
        )
    }

    #[tokio::test]
    async fn approved_payment_fulfills_once() {
        let store = Arc::new(FakeStore::new());
        store.seed("MG_REF1", "pay-1", rider_payload());
        let publisher = Arc::new(FakePublisher::default());
        let processor = processor(store.clone(), GatewayPaymentStatus::Approved, publisher.clone());

        let job = QueueJob::fulfillment("pay-1", "corr-1");
        let outcome = processor.process(&job).await.unwrap();

        assert_eq!(outcome, FulfillmentOutcome::Fulfilled);
        assert_eq!(store.status_of("MG_REF1"), ActivationStatus::Fulfilled);
        assert_eq!(store.profile_count(), 1);
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_deliveries_fulfill_at_most_once() {
        let store = Arc::new(FakeStore::new());
        store.seed("MG_REF1", "pay-1", rider_payload());
        let publisher = Arc::new(FakePublisher::default());
        let processor = processor(store.clone(), GatewayPaymentStatus::Approved, publisher.clone());

        let job = QueueJob::fulfillment("pay-1", "corr-1");
        for _ in 0..4 {
            processor.process(&job).await.unwrap();
        }

        assert_eq!(store.profile_count(), 1);
        // Exactly one notification attempt regardless of delivery count.
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
        assert_eq!(store.status_of("MG_REF1"), ActivationStatus::Fulfilled);
    }

    #[tokio::test]
    async fn redelivery_after_partial_crash_repairs_status() {
        let store = Arc::new(FakeStore::new());
        store.seed("MG_REF1", "pay-1", rider_payload());
        let publisher = Arc::new(FakePublisher::default());
        let processor = processor(store.clone(), GatewayPaymentStatus::Approved, publisher.clone());

        // Simulate a crash after the profile insert but before the final
        // status write: profile exists, status stuck at approved.
        store
            .advance_status("MG_REF1", ActivationStatus::Approved, None)
            .await
            .unwrap();
        store
            .create_profile(NewProfile {
                payment_id: "pay-1".to_string(),
                activation_reference: "MG_REF1".to_string(),
                rider_name: "Ana Souza".to_string(),
                rider_phone: "+5511999990000".to_string(),
                blood_type: None,
                emergency_contacts: serde_json::json!([]),
                plan: ProtectionPlan::Basic,
                card_payload: "card".to_string(),
            })
            .await
            .unwrap();

        let job = QueueJob::fulfillment("pay-1", "corr-1");
        let outcome = processor.process(&job).await.unwrap();

        assert_eq!(outcome, FulfillmentOutcome::AlreadyFulfilled);
        assert_eq!(store.status_of("MG_REF1"), ActivationStatus::Fulfilled);
        assert_eq!(store.profile_count(), 1);
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_payment_closes_the_activation() {
        let store = Arc::new(FakeStore::new());
        store.seed("MG_REF1", "pay-1", rider_payload());
        let publisher = Arc::new(FakePublisher::default());
        let processor = processor(store.clone(), GatewayPaymentStatus::Rejected, publisher.clone());

        let outcome = processor
            .process(&QueueJob::fulfillment("pay-1", "corr-1"))
            .await
            .unwrap();

        assert_eq!(outcome, FulfillmentOutcome::Rejected);
        assert_eq!(store.status_of("MG_REF1"), ActivationStatus::Rejected);
        assert_eq!(store.profile_count(), 0);
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_payment_waits_for_the_next_webhook() {
        let store = Arc::new(FakeStore::new());
        store.seed("MG_REF1", "pay-1", rider_payload());
        let publisher = Arc::new(FakePublisher::default());
        let processor = processor(store.clone(), GatewayPaymentStatus::Pending, publisher.clone());

        let outcome = processor
            .process(&QueueJob::fulfillment("pay-1", "corr-1"))
            .await
            .unwrap();

        assert_eq!(outcome, FulfillmentOutcome::ProcessorPending);
        assert_eq!(store.status_of("MG_REF1"), ActivationStatus::ProcessorPending);
        assert_eq!(store.profile_count(), 0);
    }

    #[tokio::test]
    async fn invalid_payload_records_failure_and_errors() {
        let store = Arc::new(FakeStore::new());
        store.seed("MG_REF1", "pay-1", serde_json::json!({"junk": true}));
        let publisher = Arc::new(FakePublisher::default());
        let processor = processor(store.clone(), GatewayPaymentStatus::Approved, publisher.clone());

        let result = processor
            .process(&QueueJob::fulfillment("pay-1", "corr-1"))
            .await;

        assert!(result.is_err());
        assert_eq!(store.status_of("MG_REF1"), ActivationStatus::FulfillmentFailed);
        assert_eq!(store.profile_count(), 0);
        assert!(publisher.published.lock().unwrap().is_empty());

        let activations = store.activations.lock().unwrap();
        assert!(activations["MG_REF1"].last_error.is_some());
    }

    #[tokio::test]
    async fn unknown_payment_is_ignored() {
        let store = Arc::new(FakeStore::new());
        let publisher = Arc::new(FakePublisher::default());
        let processor = processor(store.clone(), GatewayPaymentStatus::Approved, publisher.clone());

        let outcome = processor
            .process(&QueueJob::fulfillment("pay-unknown", "corr-1"))
            .await
            .unwrap();

        assert_eq!(outcome, FulfillmentOutcome::Ignored);
        assert_eq!(store.profile_count(), 0);
    }

    #[test]
    fn card_payload_is_deterministic() {
        let a = build_card_payload("https://motoguard.app", "MG_REF1", "pay-1");
        let b = build_card_payload("https://motoguard.app", "MG_REF1", "pay-1");
        let c = build_card_payload("https://motoguard.app", "MG_REF1", "pay-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
