//! Activity delivery
//!
//! Signs and POSTs outbound activities to remote inboxes. Every
//! destination becomes a persisted delivery job, attempted up to
//! `max_attempts` times with a linear back-off of `attempt * base`.
//! Jobs that survive a restart are picked up again by
//! [`DeliveryEngine::resume_pending`]. The signer's private key stays
//! encrypted until the moment each request is signed.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::activity::OutboundActivity;
use super::keys::decrypt_private_key;
use super::resolver::ActorResolver;
use super::signature::sign_request;
use crate::config::DeliveryConfig;
use crate::data::{Actor, DeliveryJob, RelationshipStore};
use crate::error::AppError;

const ACTIVITY_JSON: &str = "application/activity+json";
const RESUME_BATCH: i64 = 1000;

/// Result of delivering to one inbox
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// Target inbox URI
    pub inbox_uri: String,
    /// Whether delivery succeeded
    pub success: bool,
    /// Last error if every attempt failed
    pub error: Option<String>,
    /// HTTP status of the last response, if any
    pub status_code: Option<u16>,
    /// Attempts made
    pub attempts: u32,
}

/// Deduplicate identical inbox URIs while keeping distinct personal inboxes.
///
/// This preserves recipients on the same domain that use different inbox paths.
fn unique_inbox_targets(inbox_uris: Vec<String>) -> Vec<String> {
    use std::collections::HashSet;

    let mut seen = HashSet::new();
    inbox_uris
        .into_iter()
        .filter(|inbox_uri| seen.insert(inbox_uri.clone()))
        .collect()
}

struct AttemptError {
    message: String,
    status_code: Option<u16>,
}

/// Delivery engine
///
/// Cheap to clone; clones share the HTTP client and the concurrency limit.
#[derive(Clone)]
pub struct DeliveryEngine {
    store: Arc<dyn RelationshipStore>,
    resolver: Arc<ActorResolver>,
    http_client: reqwest::Client,
    config: DeliveryConfig,
    key_encryption_key: Arc<Vec<u8>>,
    semaphore: Arc<Semaphore>,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<dyn RelationshipStore>,
        resolver: Arc<ActorResolver>,
        http_client: reqwest::Client,
        config: DeliveryConfig,
        key_encryption_key: Vec<u8>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            store,
            resolver,
            http_client,
            config,
            key_encryption_key: Arc::new(key_encryption_key),
            semaphore,
        }
    }

    /// Deliver to every remote follower of `signer`, plus the author of the
    /// note being replied to, if any.
    ///
    /// Followers whose inbox cannot be resolved are skipped. Never fails;
    /// the outcome per inbox is in the returned results.
    pub async fn deliver_to_followers(
        &self,
        activity: &OutboundActivity,
        signer: &Actor,
        reply_parent_actor: Option<&str>,
    ) -> Vec<DeliveryResult> {
        let mut recipients = match self.store.get_follower_iris(&signer.iri).await {
            Ok(followers) => followers,
            Err(error) => {
                tracing::error!(actor = %signer.iri, %error, "Could not load followers");
                Vec::new()
            }
        };
        recipients.extend(reply_parent_actor.map(str::to_string));
        // Local recipients read the shared store directly.
        recipients.retain(|recipient| !self.resolver.is_local(recipient));

        let inboxes = futures::future::join_all(
            recipients
                .iter()
                .map(|recipient| self.resolver.fetch_inbox(recipient)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        self.deliver_to_inboxes(activity, signer, inboxes).await
    }

    /// Deliver to a single actor's inbox.
    pub async fn deliver_to_actor(
        &self,
        activity: &OutboundActivity,
        signer: &Actor,
        target_actor: &str,
    ) -> Vec<DeliveryResult> {
        match self.resolver.fetch_inbox(target_actor).await {
            Some(inbox) => self.deliver_to_inboxes(activity, signer, vec![inbox]).await,
            None => {
                tracing::warn!(target = %target_actor, "No inbox for delivery target");
                Vec::new()
            }
        }
    }

    /// Deliver to explicit inbox URIs in parallel.
    pub async fn deliver_to_inboxes(
        &self,
        activity: &OutboundActivity,
        signer: &Actor,
        inbox_uris: Vec<String>,
    ) -> Vec<DeliveryResult> {
        let total_targets = inbox_uris.len();
        let targets = unique_inbox_targets(inbox_uris);
        if targets.is_empty() {
            tracing::debug!(activity_id = %activity.id, "No delivery targets");
            return Vec::new();
        }

        tracing::info!(
            activity_id = %activity.id,
            "Delivering to {} unique inboxes (deduplicated from {} total)",
            targets.len(),
            total_targets
        );
        crate::metrics::ACTIVITIES_SENT
            .with_label_values(&[activity.kind.as_str()])
            .inc();

        let payload = match serde_json::to_string(activity) {
            Ok(payload) => payload,
            Err(e) => return failed_all(targets, format!("Failed to serialize activity: {}", e)),
        };
        let encrypted_key = Arc::new(signer.encrypted_private_key.clone());

        let mut tasks = Vec::with_capacity(targets.len());
        for inbox_uri in targets {
            let job = DeliveryJob::new(inbox_uri, signer.iri.clone(), payload.clone());
            if let Err(error) = self.store.enqueue_delivery(&job).await {
                // Still attempted, just not recoverable after a restart.
                tracing::error!(inbox = %job.inbox_iri, %error, "Could not persist delivery job");
            }

            let engine = self.clone();
            let key_id = signer.key_id();
            let encrypted_key = encrypted_key.clone();
            tasks.push(tokio::spawn(async move {
                engine.run_job(job, key_id, encrypted_key).await
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(error) => tracing::error!(%error, "Delivery task panicked"),
            }
        }

        let success_count = results.iter().filter(|r| r.success).count();
        tracing::info!(
            activity_id = %activity.id,
            "Batch delivery complete: {} succeeded, {} failed",
            success_count,
            results.len() - success_count
        );

        results
    }

    /// Restart every pending job from the persisted queue.
    ///
    /// Jobs keep their attempt count and next attempt time. Abandoned jobs
    /// older than the retention window are pruned first. Returns the number
    /// of jobs resumed; they run in the background.
    pub async fn resume_pending(&self) -> Result<usize, AppError> {
        self.prune_abandoned().await?;

        let jobs = self.store.pending_deliveries(RESUME_BATCH).await?;
        crate::metrics::DELIVERY_QUEUE_PENDING.set(jobs.len() as i64);

        let mut resumed = 0;
        for job in jobs {
            let signer = match self.store.get_actor_by_iri(&job.signer_iri).await? {
                Some(actor) => actor,
                None => {
                    self.store
                        .abandon_delivery(&job.id, job.attempts, "signer no longer exists")
                        .await?;
                    crate::metrics::DELIVERY_QUEUE_ABANDONED.inc();
                    continue;
                }
            };

            let engine = self.clone();
            let key_id = signer.key_id();
            let encrypted_key = Arc::new(signer.encrypted_private_key);
            tokio::spawn(async move {
                let wait = job.next_attempt_at - Utc::now();
                if let Ok(wait) = wait.to_std() {
                    tokio::time::sleep(wait).await;
                }
                engine.run_job(job, key_id, encrypted_key).await;
            });
            resumed += 1;
        }

        if resumed > 0 {
            tracing::info!("Resumed {} pending deliveries", resumed);
        }
        Ok(resumed)
    }

    /// Delete abandoned jobs past `abandoned_retention_hours`.
    ///
    /// Returns the number of rows removed and refreshes the abandoned gauge.
    pub async fn prune_abandoned(&self) -> Result<u64, AppError> {
        let retention = chrono::Duration::hours(self.config.abandoned_retention_hours as i64);
        let cutoff = Utc::now() - retention;
        let pruned = self.store.prune_abandoned_deliveries(cutoff).await?;
        if pruned > 0 {
            tracing::info!(pruned, "Pruned abandoned delivery jobs");
        }

        let remaining = self.store.count_abandoned_deliveries().await?;
        crate::metrics::DELIVERY_QUEUE_ABANDONED.set(remaining);
        Ok(pruned)
    }

    /// Attempt one job until it succeeds or runs out of attempts.
    async fn run_job(
        &self,
        job: DeliveryJob,
        key_id: String,
        encrypted_key: Arc<String>,
    ) -> DeliveryResult {
        let max_attempts = i64::from(self.config.max_attempts.max(1));
        let mut attempts = job.attempts;

        loop {
            attempts += 1;

            let outcome = {
                let _permit = match self.semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return DeliveryResult {
                            inbox_uri: job.inbox_iri.clone(),
                            success: false,
                            error: Some("delivery engine shut down".to_string()),
                            status_code: None,
                            attempts: attempts as u32,
                        };
                    }
                };
                self.attempt(&job, &key_id, &encrypted_key).await
            };

            match outcome {
                Ok(status_code) => {
                    crate::metrics::DELIVERY_ATTEMPTS_TOTAL
                        .with_label_values(&["success"])
                        .inc();
                    if let Err(error) = self.store.complete_delivery(&job.id).await {
                        tracing::error!(job = %job.id, %error, "Could not clear delivery job");
                    }
                    tracing::info!(inbox = %job.inbox_iri, attempt = attempts, "Delivered activity");
                    return DeliveryResult {
                        inbox_uri: job.inbox_iri,
                        success: true,
                        error: None,
                        status_code: Some(status_code),
                        attempts: attempts as u32,
                    };
                }
                Err(failure) => {
                    crate::metrics::DELIVERY_ATTEMPTS_TOTAL
                        .with_label_values(&["failure"])
                        .inc();

                    if attempts >= max_attempts {
                        tracing::warn!(
                            inbox = %job.inbox_iri,
                            attempt = attempts,
                            error = %failure.message,
                            "Giving up on delivery"
                        );
                        if let Err(error) = self
                            .store
                            .abandon_delivery(&job.id, attempts, &failure.message)
                            .await
                        {
                            tracing::error!(job = %job.id, %error, "Could not abandon delivery job");
                        }
                        crate::metrics::DELIVERY_QUEUE_ABANDONED.inc();
                        return DeliveryResult {
                            inbox_uri: job.inbox_iri,
                            success: false,
                            error: Some(failure.message),
                            status_code: failure.status_code,
                            attempts: attempts as u32,
                        };
                    }

                    let delay = self.config.retry_base_delay() * attempts as u32;
                    tracing::info!(
                        inbox = %job.inbox_iri,
                        attempt = attempts,
                        error = %failure.message,
                        "Delivery failed, retrying in {:?}",
                        delay
                    );
                    let next_attempt_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    if let Err(error) = self
                        .store
                        .record_delivery_failure(&job.id, attempts, next_attempt_at, &failure.message)
                        .await
                    {
                        tracing::error!(job = %job.id, %error, "Could not record delivery failure");
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One signed POST. The key is decrypted and used on the blocking pool;
    /// the plaintext is dropped before the request is sent.
    async fn attempt(
        &self,
        job: &DeliveryJob,
        key_id: &str,
        encrypted_key: &Arc<String>,
    ) -> Result<u16, AttemptError> {
        let sign_inbox = job.inbox_iri.clone();
        let sign_body = job.payload.clone();
        let sign_key = encrypted_key.clone();
        let sign_key_id = key_id.to_string();
        let key_encryption_key = self.key_encryption_key.clone();
        let signed = tokio::task::spawn_blocking(move || {
            let private_key_pem = decrypt_private_key(&key_encryption_key, &sign_key).map_err(|e| {
                AppError::SignatureFailed(format!("Cannot unlock signing key: {}", e))
            })?;
            sign_request(&sign_inbox, sign_body.as_bytes(), &private_key_pem, &sign_key_id)
        })
        .await
        .map_err(|e| AttemptError {
            message: format!("Signing task failed: {}", e),
            status_code: None,
        })?
        .map_err(|e| AttemptError {
            message: e.to_string(),
            status_code: None,
        })?;

        let started = std::time::Instant::now();
        let response = self
            .http_client
            .post(&job.inbox_iri)
            .timeout(self.config.request_timeout())
            .header(reqwest::header::CONTENT_TYPE, ACTIVITY_JSON)
            .header(reqwest::header::ACCEPT, ACTIVITY_JSON)
            .header(reqwest::header::DATE, signed.date)
            .header("Digest", signed.digest)
            .header("Signature", signed.signature)
            .body(job.payload.clone())
            .send()
            .await;
        crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["deliver"])
            .observe(started.elapsed().as_secs_f64());

        let response = response.map_err(|e| AttemptError {
            message: format!("Failed to deliver to {}: {}", job.inbox_iri, e),
            status_code: None,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError {
                message: format!("Inbox {} rejected activity: HTTP {}", job.inbox_iri, status),
                status_code: Some(status.as_u16()),
            });
        }

        Ok(status.as_u16())
    }
}

fn failed_all(targets: Vec<String>, error: String) -> Vec<DeliveryResult> {
    tracing::error!(%error, "Delivery aborted before any attempt");
    targets
        .into_iter()
        .map(|inbox_uri| DeliveryResult {
            inbox_uri,
            success: false,
            error: Some(error.clone()),
            status_code: None,
            attempts: 0,
        })
        .collect()
}
