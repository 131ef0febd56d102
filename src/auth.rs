use azure_core::credentials::AccessToken;
use thiserror::Error;

pub mod ambient;
pub mod claims;
pub mod coordinator;
pub mod flow;
pub mod login;
pub mod oauth_http;
pub mod store;
pub mod token_cache;

pub use ambient::AmbientAcquirer;
pub use coordinator::{AuthCoordinator, CoordinatorCredential};
pub use login::InteractiveBrowserAcquirer;
pub use store::TokenStore;
pub use token_cache::{TokenCache, TokenCacheEntry};

/// Authentication failure surfaced to the caller that asked for a token.
/// Never retried automatically; the owning UI action decides what to do next.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no account is signed in")]
    NotSignedIn,
    #[error("sign-in was cancelled before completing")]
    Cancelled,
    #[error("token acquisition failed")]
    Acquisition(#[source] anyhow::Error),
}

/// Marker pushed into the error chain when the user abandons the interactive
/// flow (closed the browser, let the listener time out). The coordinator
/// downcasts for it to tell "declined" apart from "broken".
#[derive(Debug, Error)]
#[error("the interactive flow was abandoned")]
pub struct FlowCancelled;

/// Tokens handed back by an acquisition backend, plus whatever identity the
/// backend could learn about the signed-in principal.
#[derive(Debug)]
pub struct AcquiredTokens {
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub access_token: AccessToken,
    pub refresh_token: Option<String>,
}

/// Account the coordinator considers signed in. Set on the first successful
/// acquisition, dropped by `sign_out`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedInAccount {
    pub user_id: String,
    pub display_name: Option<String>,
}

/// One acquisition backend: interactive browser sign-in, the ambient
/// credential chain, or a test double.
///
/// `acquire` may take arbitrary user interaction; `refresh` must stay silent.
/// Backends without refresh tokens implement `refresh` as a re-acquisition if
/// they can do so without prompting, and fail otherwise.
#[async_trait::async_trait]
pub trait TokenAcquirer: Send + Sync + std::fmt::Debug + 'static {
    async fn acquire(&self, tenant_id: &str) -> anyhow::Result<AcquiredTokens>;

    async fn refresh(&self, tenant_id: &str, refresh_token: &str)
    -> anyhow::Result<AcquiredTokens>;
}
