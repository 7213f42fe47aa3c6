//! Suspension coordinator
//!
//! Keeps a client's network access in step with billing status. The local
//! `client_status` write is committed first and is the source of truth; the
//! remote credential toggle runs afterwards, bounded by a timeout, and its
//! failure only shows up as `remote_action_applied = false`.
//!
//! Suspending an already suspended client is a no-op. Reactivating an already
//! active client skips the status write but still re-enables the credential.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::config::RemoteAccessConfig;
use crate::error::{BillingError, BillingResult};
use crate::models::ClientStatus;
use crate::store::{BillingStore, BillingWrite, UnitOfWork};

/// Result of a suspend or reactivate call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SuspensionOutcome {
    /// Local billing status is in the requested state
    pub success: bool,
    /// The remote credential was toggled
    pub remote_action_applied: bool,
    /// False when the client was already in the requested state
    pub status_changed: bool,
}

impl SuspensionOutcome {
    fn unchanged() -> Self {
        Self {
            success: true,
            remote_action_applied: false,
            status_changed: false,
        }
    }
}

#[async_trait]
pub trait SuspensionCoordinator: Send + Sync {
    async fn suspend(&self, client_id: Uuid, reason: &str) -> BillingResult<SuspensionOutcome>;

    async fn reactivate(&self, client_id: Uuid, payment_id: Uuid)
        -> BillingResult<SuspensionOutcome>;
}

// =============================================================================
// Remote access
// =============================================================================

/// Enables or disables a subscriber's network credential
#[async_trait]
pub trait AccessController: Send + Sync {
    async fn enable(&self, client_id: Uuid) -> BillingResult<()>;

    async fn disable(&self, client_id: Uuid) -> BillingResult<()>;
}

/// Used when remote actions are skipped
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAccessController;

#[async_trait]
impl AccessController for NoopAccessController {
    async fn enable(&self, client_id: Uuid) -> BillingResult<()> {
        tracing::debug!(client_id = %client_id, "Remote actions skipped: enable");
        Ok(())
    }

    async fn disable(&self, client_id: Uuid) -> BillingResult<()> {
        tracing::debug!(client_id = %client_id, "Remote actions skipped: disable");
        Ok(())
    }
}

/// Talks to the network access gateway over HTTP
#[derive(Debug, Clone)]
pub struct HttpAccessController {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    max_retries: usize,
}

impl HttpAccessController {
    pub fn new(
        base_url: impl Into<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
            max_retries: 2,
        })
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    async fn toggle(&self, client_id: Uuid, action: &str) -> BillingResult<()> {
        let url = format!("{}/credentials/{}/{}", self.base_url, client_id, action);
        let strategy = ExponentialBackoff::from_millis(50)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.max_retries);

        Retry::spawn(strategy, || async {
            let mut request = self.http.post(&url);
            if let Some(token) = &self.api_token {
                request = request.bearer_auth(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| BillingError::RemoteAction(format!("{action} request failed: {e}")))?;

            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(BillingError::RemoteAction(format!(
                    "{action} returned HTTP {status}"
                )))
            }
        })
        .await
    }
}

#[async_trait]
impl AccessController for HttpAccessController {
    async fn enable(&self, client_id: Uuid) -> BillingResult<()> {
        self.toggle(client_id, "enable").await
    }

    async fn disable(&self, client_id: Uuid) -> BillingResult<()> {
        self.toggle(client_id, "disable").await
    }
}

/// Pick the access controller for a remote configuration
pub fn access_controller_from_config(
    config: &RemoteAccessConfig,
) -> BillingResult<Arc<dyn AccessController>> {
    match (&config.base_url, config.skip) {
        (Some(base_url), false) => Ok(Arc::new(HttpAccessController::new(
            base_url.clone(),
            config.api_token.clone(),
            config.timeout,
        )?)),
        _ => Ok(Arc::new(NoopAccessController)),
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// [`SuspensionCoordinator`] writing status through the store and toggling
/// credentials through an [`AccessController`]
pub struct NetworkSuspensionCoordinator {
    store: Arc<dyn BillingStore>,
    access: Arc<dyn AccessController>,
    remote_timeout: Duration,
}

impl NetworkSuspensionCoordinator {
    pub fn new(
        store: Arc<dyn BillingStore>,
        access: Arc<dyn AccessController>,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            store,
            access,
            remote_timeout,
        }
    }

    async fn set_status(&self, client_id: Uuid, status: ClientStatus) -> BillingResult<bool> {
        let profile = self
            .store
            .get_profile(client_id)
            .await?
            .ok_or(BillingError::NoBillingProfile(client_id))?;

        if profile.client_status == status {
            return Ok(false);
        }

        let mut unit = UnitOfWork::new(client_id);
        unit.push(BillingWrite::SetClientStatus { client_id, status });
        self.store.commit(unit).await?;
        Ok(true)
    }

    async fn remote(&self, client_id: Uuid, enable: bool) -> bool {
        let action = async {
            if enable {
                self.access.enable(client_id).await
            } else {
                self.access.disable(client_id).await
            }
        };

        let result = match tokio::time::timeout(self.remote_timeout, action).await {
            Ok(result) => result,
            Err(_) => Err(BillingError::RemoteTimeout(self.remote_timeout.as_secs())),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    client_id = %client_id,
                    enable,
                    error = %e,
                    remote_action_applied = false,
                    "Remote access action failed; billing status already updated"
                );
                false
            }
        }
    }
}

#[async_trait]
impl SuspensionCoordinator for NetworkSuspensionCoordinator {
    async fn suspend(&self, client_id: Uuid, reason: &str) -> BillingResult<SuspensionOutcome> {
        if !self.set_status(client_id, ClientStatus::Suspended).await? {
            tracing::debug!(client_id = %client_id, "Client already suspended");
            return Ok(SuspensionOutcome::unchanged());
        }

        let remote_action_applied = self.remote(client_id, false).await;
        tracing::info!(
            client_id = %client_id,
            reason = %reason,
            remote_action_applied,
            "Client suspended"
        );

        Ok(SuspensionOutcome {
            success: true,
            remote_action_applied,
            status_changed: true,
        })
    }

    async fn reactivate(
        &self,
        client_id: Uuid,
        payment_id: Uuid,
    ) -> BillingResult<SuspensionOutcome> {
        // Late-payment settlement may already have flipped the status; the
        // credential is re-enabled either way
        let status_changed = self.set_status(client_id, ClientStatus::Active).await?;
        let remote_action_applied = self.remote(client_id, true).await;
        tracing::info!(
            client_id = %client_id,
            payment_id = %payment_id,
            status_changed,
            remote_action_applied,
            "Client reactivated"
        );

        Ok(SuspensionOutcome {
            success: true,
            remote_action_applied,
            status_changed,
        })
    }
}
