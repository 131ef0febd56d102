//! Embeddable Azure toolkit core: account sign-in with a persistent token
//! cache, subscription selection, and cancellable background scheduling on a
//! host-owned runtime.
//!
//! Hosts (IDE plugins, long-running tools) build one [`Toolkit`] per
//! configuration and reach everything through it; there are no globals.
//! Interactive sign-in goes through the system browser against the Azure CLI
//! public client, refreshed tokens land in a JSON cache under the config
//! directory, and SDK clients borrow the signed-in account through
//! [`auth::AuthCoordinator::credential`].

use std::sync::Arc;

use anyhow::{Context, Result};
use azure_core::http::HttpClient;
use tokio::runtime::Handle;

pub mod auth;
pub mod client;
pub mod config;
pub mod log;
pub mod scheduler;
pub mod subscription;

pub use auth::{
    AuthCoordinator, AuthError, InteractiveBrowserAcquirer, SignedInAccount, TokenAcquirer,
    TokenStore,
};
pub use client::ArmClient;
pub use config::{AuthOptions, AzureEnvironment, ToolkitConfig};
pub use scheduler::{ScheduleError, Scheduler, TaskContext, TaskHandle, TaskOutcome, TaskState};
pub use subscription::{SubscriptionDetail, SubscriptionRegistry};

/// Composition root. Owns the pieces and the wiring between them; hosts keep
/// one around for the lifetime of the plugin/session and call
/// [`Toolkit::shutdown`] on the way out.
#[derive(Debug)]
pub struct Toolkit {
    config: ToolkitConfig,
    http_client: Arc<dyn HttpClient>,
    store: Arc<TokenStore>,
    coordinator: Arc<AuthCoordinator>,
    subscriptions: Arc<SubscriptionRegistry>,
    scheduler: Arc<Scheduler>,
}

impl Toolkit {
    /// Builds a toolkit that signs in through the system browser.
    pub async fn new(runtime: Handle, config: ToolkitConfig) -> Result<Self> {
        let http_client = azure_core::http::new_http_client();
        let acquirer = Arc::new(InteractiveBrowserAcquirer::new(
            config.environment,
            config.auth.clone(),
            http_client.clone(),
        ));
        Self::with_acquirer(runtime, config, acquirer, http_client).await
    }

    /// Builds a toolkit around a caller-supplied acquirer. Hosts use this to
    /// plug in ambient credentials or a test double.
    pub async fn with_acquirer(
        runtime: Handle,
        config: ToolkitConfig,
        acquirer: Arc<dyn TokenAcquirer>,
        http_client: Arc<dyn HttpClient>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.config_dir)
            .await
            .with_context(|| format!("creating {}", config.config_dir.display()))?;

        let store = Arc::new(TokenStore::spawn(&runtime, config.token_cache_path()));
        let coordinator = Arc::new(AuthCoordinator::new(acquirer, store.clone(), &config.auth).await);
        let subscriptions = Arc::new(SubscriptionRegistry::load(config.subscriptions_path()).await);
        let scheduler = Arc::new(Scheduler::new(runtime)?);

        Ok(Self {
            config,
            http_client,
            store,
            coordinator,
            subscriptions,
            scheduler,
        })
    }

    pub fn config(&self) -> &ToolkitConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<AuthCoordinator> {
        &self.coordinator
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Management-plane client authenticated as the signed-in account, bound
    /// to `tenant_id`. The credential never goes interactive; callers sign
    /// in through the coordinator first.
    pub fn arm_client(&self, tenant_id: &str) -> Result<ArmClient> {
        ArmClient::new(
            self.config.environment.management_endpoint(),
            vec![self.config.environment.management_scope()],
            Arc::new(self.coordinator.credential(tenant_id)),
            self.http_client.clone(),
        )
    }

    /// Fetches the subscription list for the default tenant and merges it
    /// into the saved selection.
    pub async fn refresh_subscriptions(&self) -> Result<Vec<SubscriptionDetail>> {
        let arm = self.arm_client(self.coordinator.default_tenant())?;
        self.subscriptions.refresh(&arm).await
    }

    /// Stops background machinery: cancels scheduled tasks, drains the
    /// dispatch queue, and flushes pending token-cache writes.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.store.close().await;
    }
}

#[cfg(test)]
mod tests {
    use azure_core::credentials::AccessToken;
    use azure_core::time::OffsetDateTime;
    use tempfile::tempdir;

    use super::*;
    use crate::auth::AcquiredTokens;

    #[derive(Debug)]
    struct StubAcquirer;

    #[async_trait::async_trait]
    impl TokenAcquirer for StubAcquirer {
        async fn acquire(&self, _tenant_id: &str) -> Result<AcquiredTokens> {
            Ok(AcquiredTokens {
                user_id: Some("stub@contoso.com".to_string()),
                display_name: Some("Stub User".to_string()),
                access_token: AccessToken {
                    token: "stub-access".to_string().into(),
                    expires_on: OffsetDateTime::now_utc() + std::time::Duration::from_secs(3600),
                },
                refresh_token: Some("stub-refresh".to_string()),
            })
        }

        async fn refresh(&self, _tenant_id: &str, _refresh_token: &str) -> Result<AcquiredTokens> {
            self.acquire(_tenant_id).await
        }
    }

    #[tokio::test]
    async fn the_toolkit_wires_sign_in_scheduling_and_persistence() {
        let dir = tempdir().unwrap();
        let config = ToolkitConfig::new(dir.path().join("cfg"));
        let toolkit = Toolkit::with_acquirer(
            Handle::current(),
            config,
            Arc::new(StubAcquirer),
            azure_core::http::new_http_client(),
        )
        .await
        .unwrap();

        let token = toolkit
            .coordinator()
            .get_token(toolkit.coordinator().default_tenant())
            .await
            .unwrap();
        assert_eq!(token.token.secret(), "stub-access");
        assert_eq!(
            toolkit.coordinator().account().await.unwrap().user_id,
            "stub@contoso.com"
        );

        let outcome = toolkit
            .scheduler()
            .run(|_ctx| async move { Ok(()) })
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);

        toolkit.shutdown().await;
        assert!(toolkit.config().token_cache_path().exists());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let dir = tempdir().unwrap();
        let toolkit = Toolkit::with_acquirer(
            Handle::current(),
            ToolkitConfig::new(dir.path().to_path_buf()),
            Arc::new(StubAcquirer),
            azure_core::http::new_http_client(),
        )
        .await
        .unwrap();

        toolkit.shutdown().await;
        toolkit.shutdown().await;
        assert!(matches!(
            toolkit.scheduler().spawn(|_ctx| async move { Ok(()) }),
            Err(ScheduleError::Shutdown)
        ));
    }
}
