use std::sync::Arc;

use anyhow::{Context, Result};
use azure_core::credentials::TokenCredential;
use azure_identity::DefaultAzureCredential;

use crate::auth::{AcquiredTokens, TokenAcquirer};

/// Non-interactive acquisition through the ambient credential chain:
/// environment service principal, managed identity, Azure CLI. For hosts
/// where a browser round-trip is unavailable or unwanted.
///
/// The chain decides its own tenant from the environment, and it hands out no
/// refresh token; renewal is simply another pass through the chain.
pub struct AmbientAcquirer {
    credential: Arc<DefaultAzureCredential>,
    scopes: Vec<String>,
}

impl AmbientAcquirer {
    pub fn new(scopes: Vec<String>) -> Result<Self> {
        let credential =
            DefaultAzureCredential::new().context("building the ambient credential chain")?;
        Ok(Self { credential, scopes })
    }
}

impl std::fmt::Debug for AmbientAcquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmbientAcquirer")
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl TokenAcquirer for AmbientAcquirer {
    async fn acquire(&self, tenant_id: &str) -> Result<AcquiredTokens> {
        tracing::debug!(
            "requesting a token from the ambient credential chain for tenant {tenant_id}"
        );
        let scopes: Vec<&str> = self.scopes.iter().map(String::as_str).collect();
        let access_token = self
            .credential
            .get_token(&scopes, None)
            .await
            .context("ambient credential chain could not produce a token")?;
        Ok(AcquiredTokens {
            user_id: None,
            display_name: None,
            access_token,
            refresh_token: None,
        })
    }

    async fn refresh(&self, tenant_id: &str, _refresh_token: &str) -> Result<AcquiredTokens> {
        self.acquire(tenant_id).await
    }
}
