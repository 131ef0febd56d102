use std::sync::Arc;

use async_lock::RwLock;
use azure_core::credentials::{AccessToken, TokenCredential, TokenRequestOptions};
use azure_core::time::Duration;

use crate::auth::store::TokenStore;
use crate::auth::token_cache::{TokenCache, TokenCacheEntry};
use crate::auth::{AcquiredTokens, AuthError, FlowCancelled, SignedInAccount, TokenAcquirer};
use crate::config::AuthOptions;

/// Owns the token cache and decides how a token request is satisfied: cached
/// entry, silent renewal, or a fresh interactive sign-in through the injected
/// [`TokenAcquirer`].
///
/// Reads run concurrently; renewal releases the read guard before talking to
/// the token endpoint and commits under the write guard, so requests for
/// other tenants are never blocked on a slow token endpoint. Every cache
/// mutation queues a snapshot on the store's writer while the guard is still
/// held, which keeps the on-disk order equal to mutation order.
#[derive(Debug)]
pub struct AuthCoordinator {
    cache: RwLock<TokenCache>,
    account: RwLock<Option<SignedInAccount>>,
    acquirer: Arc<dyn TokenAcquirer>,
    store: Arc<TokenStore>,
    default_tenant: String,
    expiry_buffer: Duration,
}

impl AuthCoordinator {
    /// Builds the coordinator, warm-starting from the persisted cache when a
    /// readable snapshot exists. A warm start restores the signed-in account
    /// from the first cached entry so a restarted IDE stays signed in.
    pub async fn new(
        acquirer: Arc<dyn TokenAcquirer>,
        store: Arc<TokenStore>,
        options: &AuthOptions,
    ) -> Self {
        let cache = match store.load().await {
            Ok(Some(bytes)) => match TokenCache::deserialize(&bytes) {
                Ok(cache) => {
                    tracing::debug!(
                        "loaded {} cached token entries from {}",
                        cache.len(),
                        store.path().display()
                    );
                    cache
                }
                Err(err) => {
                    tracing::warn!(
                        "ignoring an unreadable token cache at {}: {err:#}",
                        store.path().display()
                    );
                    TokenCache::default()
                }
            },
            Ok(None) => TokenCache::default(),
            Err(err) => {
                tracing::warn!("could not read the token cache: {err:#}");
                TokenCache::default()
            }
        };
        let account = cache.entries().first().map(|entry| SignedInAccount {
            user_id: entry.user_id.clone(),
            display_name: None,
        });

        Self {
            cache: RwLock::new(cache),
            account: RwLock::new(account),
            acquirer,
            store,
            default_tenant: options.tenant_id.clone(),
            expiry_buffer: options.expiry_buffer,
        }
    }

    /// The tenant used when callers do not name one.
    pub fn default_tenant(&self) -> &str {
        &self.default_tenant
    }

    pub async fn account(&self) -> Option<SignedInAccount> {
        self.account.read().await.clone()
    }

    /// Produces a token for the tenant, trying the silent paths first and
    /// falling back to interactive sign-in when they cannot serve.
    pub async fn get_token(&self, tenant_id: &str) -> Result<AccessToken, AuthError> {
        match self.get_token_silent(tenant_id).await {
            Ok(Some(token)) => return Ok(token),
            Ok(None) => {}
            Err(AuthError::Acquisition(err)) => {
                tracing::warn!(
                    "silent renewal for tenant {tenant_id} failed; falling back to interactive sign-in: {err:#}"
                );
            }
            Err(err) => return Err(err),
        }
        self.sign_in(tenant_id).await
    }

    /// The silent half of [`AuthCoordinator::get_token`]: cached entry or
    /// refresh-token renewal, never any user interaction. `Ok(None)` means
    /// there is no silent path for this tenant; an error means renewal was
    /// attempted and failed.
    pub async fn get_token_silent(
        &self,
        tenant_id: &str,
    ) -> Result<Option<AccessToken>, AuthError> {
        let Some(user_id) = self.account.read().await.as_ref().map(|a| a.user_id.clone()) else {
            return Ok(None);
        };

        // Decide under the read guard, renew after it drops. The lock is
        // writer-preferring: a guard held across the endpoint call queues
        // commits, and the queued writer stalls every other tenant's reads.
        let refresh_token = {
            let cache = self.cache.read().await;
            let Some(entry) = cache.find(&user_id, tenant_id) else {
                return Ok(None);
            };
            if !entry.is_expired(self.expiry_buffer) {
                tracing::debug!("serving a cached token for tenant {tenant_id}");
                return Ok(Some(entry.access_token.clone()));
            }
            let Some(refresh_token) = entry.refresh_token.clone() else {
                tracing::debug!(
                    "token for tenant {tenant_id} expired and there is no refresh token"
                );
                return Ok(None);
            };
            refresh_token
        };

        tracing::debug!("token for tenant {tenant_id} expired; renewing silently");
        let mut acquired = self
            .acquirer
            .refresh(tenant_id, &refresh_token)
            .await
            .map_err(AuthError::Acquisition)?;
        // A provider that stays silent about the refresh token leaves the
        // old one valid; carry it forward rather than dropping it.
        acquired.refresh_token = acquired.refresh_token.or(Some(refresh_token));

        // Two renewals for the same tenant may race here; upsert is
        // last-write-wins, so either end state is a valid fresh token.
        let (_, token) = self.commit(tenant_id, Some(&user_id), acquired).await;
        Ok(Some(token))
    }

    /// Runs the interactive flow regardless of cache state and commits the
    /// result. Abandoned or declined flows surface as
    /// [`AuthError::Cancelled`].
    pub async fn sign_in(&self, tenant_id: &str) -> Result<AccessToken, AuthError> {
        tracing::info!("starting interactive sign-in for tenant {tenant_id}");
        let acquired = self.acquirer.acquire(tenant_id).await.map_err(|err| {
            if err.downcast_ref::<FlowCancelled>().is_some() {
                AuthError::Cancelled
            } else {
                AuthError::Acquisition(err)
            }
        })?;

        let prior_user = self.account.read().await.as_ref().map(|a| a.user_id.clone());
        let (account, token) = self
            .commit(tenant_id, prior_user.as_deref(), acquired)
            .await;
        tracing::info!("signed in as {}", account.user_id);
        Ok(token)
    }

    /// Forgets the signed-in account and wipes the cache, in memory and on
    /// disk.
    pub async fn sign_out(&self) {
        match self.account.write().await.take() {
            Some(account) => tracing::info!("signed out {}", account.user_id),
            None => tracing::debug!("sign-out requested with nobody signed in"),
        }
        self.clear().await;
    }

    /// Drops every cached token and deletes the persisted store. The next
    /// `get_token` acquires from scratch; a stale entry is never served.
    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        cache.clear();
        // Still under the guard, so the removal keeps its slot in mutation
        // order relative to commit snapshots.
        self.store.remove();
    }

    /// Wraps the coordinator as an [`azure_core`] credential for SDK clients.
    pub fn credential(self: &Arc<Self>, tenant_id: impl Into<String>) -> CoordinatorCredential {
        CoordinatorCredential {
            coordinator: Arc::clone(self),
            tenant_id: tenant_id.into(),
        }
    }

    /// Installs the acquired tokens: upsert under the write guard, snapshot
    /// to the store, record the signed-in account.
    async fn commit(
        &self,
        tenant_id: &str,
        fallback_user: Option<&str>,
        acquired: AcquiredTokens,
    ) -> (SignedInAccount, AccessToken) {
        let user_id = acquired
            .user_id
            .unwrap_or_else(|| fallback_user.unwrap_or("default").to_string());
        let entry = TokenCacheEntry {
            user_id: user_id.clone(),
            tenant_id: tenant_id.to_string(),
            access_token: acquired.access_token,
            refresh_token: acquired.refresh_token,
        };
        let token = entry.access_token.clone();

        {
            let mut cache = self.cache.write().await;
            cache.upsert(entry);
            // Enqueue before the guard drops; the send is non-blocking and
            // guard order is the only thing that defines mutation order.
            match cache.serialize() {
                Ok(bytes) => self.store.persist(bytes),
                Err(err) => tracing::warn!("token cache snapshot failed: {err:#}"),
            }
        }

        let mut guard = self.account.write().await;
        let display_name = acquired
            .display_name
            .or_else(|| guard.as_ref().and_then(|a| a.display_name.clone()));
        let account = SignedInAccount {
            user_id,
            display_name,
        };
        *guard = Some(account.clone());
        (account, token)
    }
}

/// [`TokenCredential`] view over the coordinator, pinned to one tenant.
///
/// Silent by contract: SDK calls run on background tasks where popping a
/// browser would be hostile, so a missing sign-in is reported as an error and
/// the owning UI action decides whether to start an interactive flow.
#[derive(Debug, Clone)]
pub struct CoordinatorCredential {
    coordinator: Arc<AuthCoordinator>,
    tenant_id: String,
}

#[async_trait::async_trait]
impl TokenCredential for CoordinatorCredential {
    async fn get_token(
        &self,
        _scopes: &[&str],
        _: Option<TokenRequestOptions>,
    ) -> azure_core::Result<AccessToken> {
        let outcome = match self.coordinator.get_token_silent(&self.tenant_id).await {
            Ok(Some(token)) => Ok(token),
            Ok(None) => Err(AuthError::NotSignedIn),
            Err(err) => Err(err),
        };
        outcome.map_err(|err| {
            azure_core::error::Error::with_message(azure_core::error::ErrorKind::Credential, || {
                format!("cannot serve a token for tenant {}: {err}", self.tenant_id)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::runtime::Handle;

    #[derive(Debug)]
    enum RefreshBehavior {
        /// Renewal succeeds; optionally rolls the refresh token forward.
        Renew { roll_token: bool },
        Fail,
    }

    #[derive(Debug)]
    struct MockAcquirer {
        acquires: AtomicUsize,
        refreshes: AtomicUsize,
        seen_refresh_tokens: Mutex<Vec<String>>,
        refresh_behavior: RefreshBehavior,
        /// When set, every renewal parks here until the test opens the gate.
        refresh_gate: Option<Arc<tokio::sync::Notify>>,
        cancel_interactive: bool,
        token_lifetime: Mutex<Duration>,
    }

    impl MockAcquirer {
        fn new(token_lifetime: Duration) -> Self {
            Self {
                acquires: AtomicUsize::new(0),
                refreshes: AtomicUsize::new(0),
                seen_refresh_tokens: Mutex::new(Vec::new()),
                refresh_behavior: RefreshBehavior::Renew { roll_token: true },
                refresh_gate: None,
                cancel_interactive: false,
                token_lifetime: Mutex::new(token_lifetime),
            }
        }

        fn set_token_lifetime(&self, lifetime: Duration) {
            *self.token_lifetime.lock().unwrap() = lifetime;
        }

        fn token(&self, secret: &str) -> AccessToken {
            AccessToken {
                token: secret.to_string().into(),
                expires_on: azure_core::time::OffsetDateTime::now_utc()
                    + *self.token_lifetime.lock().unwrap(),
            }
        }
    }

    #[async_trait::async_trait]
    impl TokenAcquirer for MockAcquirer {
        async fn acquire(&self, _tenant_id: &str) -> anyhow::Result<AcquiredTokens> {
            if self.cancel_interactive {
                return Err(FlowCancelled.into());
            }
            let n = self.acquires.fetch_add(1, Ordering::Relaxed);
            Ok(AcquiredTokens {
                user_id: Some("user@example.com".to_string()),
                display_name: Some("Example User".to_string()),
                access_token: self.token(&format!("interactive-{n}")),
                refresh_token: Some("refresh-0".to_string()),
            })
        }

        async fn refresh(
            &self,
            _tenant_id: &str,
            refresh_token: &str,
        ) -> anyhow::Result<AcquiredTokens> {
            self.seen_refresh_tokens
                .lock()
                .unwrap()
                .push(refresh_token.to_string());
            if let Some(gate) = &self.refresh_gate {
                gate.notified().await;
            }
            let n = self.refreshes.fetch_add(1, Ordering::Relaxed) + 1;
            match self.refresh_behavior {
                RefreshBehavior::Fail => anyhow::bail!("the token endpoint rejected the refresh"),
                RefreshBehavior::Renew { roll_token } => Ok(AcquiredTokens {
                    user_id: Some("user@example.com".to_string()),
                    display_name: None,
                    access_token: self.token(&format!("refreshed-{n}")),
                    refresh_token: roll_token.then(|| format!("refresh-{n}")),
                }),
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        acquirer: Arc<MockAcquirer>,
        store: Arc<TokenStore>,
        coordinator: Arc<AuthCoordinator>,
    }

    async fn fixture(acquirer: MockAcquirer) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TokenStore::spawn(
            &Handle::current(),
            dir.path().join("tokenCache.json"),
        ));
        let acquirer = Arc::new(acquirer);
        let coordinator = Arc::new(
            AuthCoordinator::new(
                acquirer.clone(),
                store.clone(),
                &AuthOptions::default(),
            )
            .await,
        );
        Fixture {
            _dir: dir,
            acquirer,
            store,
            coordinator,
        }
    }

    fn fresh() -> MockAcquirer {
        MockAcquirer::new(Duration::hours(1))
    }

    /// Lifetime inside the 5-minute expiry buffer, so every cached entry
    /// immediately counts as expired.
    fn short_lived() -> MockAcquirer {
        MockAcquirer::new(Duration::minutes(2))
    }

    #[tokio::test]
    async fn serves_the_cached_token_without_reacquiring() {
        let f = fixture(fresh()).await;

        let first = f.coordinator.get_token("tenant-1").await.unwrap();
        let second = f.coordinator.get_token("tenant-1").await.unwrap();

        assert_eq!(first.token.secret(), second.token.secret());
        assert_eq!(f.acquirer.acquires.load(Ordering::Relaxed), 1);
        assert_eq!(f.acquirer.refreshes.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn tenants_are_cached_independently() {
        let f = fixture(fresh()).await;

        let one = f.coordinator.get_token("tenant-1").await.unwrap();
        let two = f.coordinator.get_token("tenant-2").await.unwrap();

        assert_ne!(one.token.secret(), two.token.secret());
        assert_eq!(f.acquirer.acquires.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn clear_forces_a_fresh_acquisition() {
        let f = fixture(fresh()).await;

        f.coordinator.get_token("tenant-1").await.unwrap();
        f.coordinator.clear().await;
        f.coordinator.get_token("tenant-1").await.unwrap();

        assert_eq!(f.acquirer.acquires.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn expired_tokens_renew_silently() {
        let f = fixture(short_lived()).await;

        f.coordinator.get_token("tenant-1").await.unwrap();
        let renewed = f.coordinator.get_token("tenant-1").await.unwrap();

        assert_eq!(renewed.token.secret(), "refreshed-1");
        assert_eq!(f.acquirer.acquires.load(Ordering::Relaxed), 1);
        assert_eq!(f.acquirer.refreshes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn a_rolled_refresh_token_is_used_next_time() {
        let f = fixture(short_lived()).await;

        f.coordinator.get_token("tenant-1").await.unwrap();
        f.coordinator.get_token("tenant-1").await.unwrap();
        f.coordinator.get_token("tenant-1").await.unwrap();

        let seen = f.acquirer.seen_refresh_tokens.lock().unwrap().clone();
        assert_eq!(seen, vec!["refresh-0".to_string(), "refresh-1".to_string()]);
    }

    #[tokio::test]
    async fn a_silent_provider_keeps_the_old_refresh_token() {
        let mut acquirer = short_lived();
        acquirer.refresh_behavior = RefreshBehavior::Renew { roll_token: false };
        let f = fixture(acquirer).await;

        f.coordinator.get_token("tenant-1").await.unwrap();
        f.coordinator.get_token("tenant-1").await.unwrap();
        f.coordinator.get_token("tenant-1").await.unwrap();

        let seen = f.acquirer.seen_refresh_tokens.lock().unwrap().clone();
        assert_eq!(seen, vec!["refresh-0".to_string(), "refresh-0".to_string()]);
    }

    #[tokio::test]
    async fn failed_silent_renewal_falls_back_to_interactive() {
        let mut acquirer = short_lived();
        acquirer.refresh_behavior = RefreshBehavior::Fail;
        let f = fixture(acquirer).await;

        f.coordinator.get_token("tenant-1").await.unwrap();
        let token = f.coordinator.get_token("tenant-1").await.unwrap();

        assert_eq!(token.token.secret(), "interactive-1");
        assert_eq!(f.acquirer.acquires.load(Ordering::Relaxed), 2);
        assert_eq!(f.acquirer.refreshes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn a_slow_token_endpoint_only_stalls_its_own_tenant() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let mut acquirer = fresh();
        acquirer.refresh_gate = Some(gate.clone());
        let f = fixture(acquirer).await;

        // tenant-2 gets a fresh token; tenant-1 gets one already inside the
        // expiry buffer, so its next read has to renew.
        f.coordinator.get_token("tenant-2").await.unwrap();
        f.acquirer.set_token_lifetime(Duration::minutes(2));
        f.coordinator.get_token("tenant-1").await.unwrap();
        f.acquirer.set_token_lifetime(Duration::hours(1));

        // The renewal parks inside the acquirer behind the closed gate.
        let parked = {
            let coordinator = f.coordinator.clone();
            tokio::spawn(async move { coordinator.get_token("tenant-1").await })
        };
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.acquirer.seen_refresh_tokens.lock().unwrap().len(), 1);

        // While it is parked, a sign-in commit and a plain cache hit for
        // other tenants must both come straight back.
        let sign_in = {
            let coordinator = f.coordinator.clone();
            tokio::spawn(async move { coordinator.get_token("tenant-3").await })
        };
        let cache_hit = {
            let coordinator = f.coordinator.clone();
            tokio::spawn(async move { coordinator.get_token("tenant-2").await })
        };
        let others = async {
            (
                sign_in.await.unwrap().unwrap(),
                cache_hit.await.unwrap().unwrap(),
            )
        };
        let (signed_in, hit) =
            tokio::time::timeout(std::time::Duration::from_millis(250), others)
                .await
                .expect("other tenants must answer while the renewal is parked");
        assert_eq!(signed_in.token.secret(), "interactive-2");
        assert_eq!(hit.token.secret(), "interactive-0");

        gate.notify_one();
        let renewed = parked.await.unwrap().unwrap();
        assert_eq!(renewed.token.secret(), "refreshed-1");
    }

    #[tokio::test]
    async fn an_abandoned_sign_in_surfaces_as_cancelled() {
        let mut acquirer = fresh();
        acquirer.cancel_interactive = true;
        let f = fixture(acquirer).await;

        let err = f.coordinator.get_token("tenant-1").await.unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
        assert_eq!(f.acquirer.acquires.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn sign_out_forgets_the_account_and_the_tokens() {
        let f = fixture(fresh()).await;

        f.coordinator.get_token("tenant-1").await.unwrap();
        assert_eq!(
            f.coordinator.account().await.map(|a| a.user_id),
            Some("user@example.com".to_string())
        );

        f.coordinator.sign_out().await;
        assert_eq!(f.coordinator.account().await, None);
        assert_eq!(
            f.coordinator
                .get_token_silent("tenant-1")
                .await
                .unwrap()
                .map(|t| t.token.secret().to_string()),
            None
        );
    }

    #[tokio::test]
    async fn a_restart_serves_tokens_from_the_persisted_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenCache.json");

        let store = Arc::new(TokenStore::spawn(&Handle::current(), path.clone()));
        let first_run = Arc::new(MockAcquirer::new(Duration::hours(1)));
        let coordinator =
            AuthCoordinator::new(first_run.clone(), store.clone(), &AuthOptions::default()).await;
        let original = coordinator.get_token("tenant-1").await.unwrap();
        store.close().await;

        let store = Arc::new(TokenStore::spawn(&Handle::current(), path));
        let second_run = Arc::new(MockAcquirer::new(Duration::hours(1)));
        let coordinator =
            AuthCoordinator::new(second_run.clone(), store, &AuthOptions::default()).await;

        let restored = coordinator.get_token("tenant-1").await.unwrap();
        assert_eq!(restored.token.secret(), original.token.secret());
        assert_eq!(second_run.acquires.load(Ordering::Relaxed), 0);
        assert_eq!(
            coordinator.account().await.map(|a| a.user_id),
            Some("user@example.com".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_parallel_commit_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenCache.json");
        let tenants: Vec<String> = (0..5).map(|n| format!("tenant-{n}")).collect();

        let store = Arc::new(TokenStore::spawn(&Handle::current(), path.clone()));
        let acquirer = Arc::new(MockAcquirer::new(Duration::hours(1)));
        let coordinator =
            Arc::new(AuthCoordinator::new(acquirer, store.clone(), &AuthOptions::default()).await);

        let commits: Vec<_> = tenants
            .iter()
            .map(|tenant| {
                let coordinator = coordinator.clone();
                let tenant = tenant.clone();
                tokio::spawn(async move { coordinator.get_token(&tenant).await })
            })
            .collect();
        for commit in commits {
            commit.await.unwrap().unwrap();
        }
        store.close().await;

        let store = Arc::new(TokenStore::spawn(&Handle::current(), path));
        let second_run = Arc::new(MockAcquirer::new(Duration::hours(1)));
        let coordinator =
            AuthCoordinator::new(second_run.clone(), store.clone(), &AuthOptions::default()).await;
        for tenant in &tenants {
            coordinator.get_token(tenant).await.unwrap();
        }
        assert_eq!(second_run.acquires.load(Ordering::Relaxed), 0);
        store.close().await;
    }

    #[tokio::test]
    async fn the_credential_adapter_never_goes_interactive() {
        let f = fixture(fresh()).await;
        let credential = f.coordinator.credential("tenant-1");

        let denied = credential.get_token(&["scope"], None).await;
        assert!(denied.is_err());
        assert_eq!(f.acquirer.acquires.load(Ordering::Relaxed), 0);

        f.coordinator.get_token("tenant-1").await.unwrap();
        let served = credential.get_token(&["scope"], None).await.unwrap();
        assert_eq!(served.token.secret(), "interactive-0");

        f.store.close().await;
    }
}
