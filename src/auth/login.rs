mod loopback_server;

use std::sync::Arc;

use anyhow::{Context, Result};
use azure_core::http::HttpClient;
use oauth2::{AuthorizationCode, TokenResponse};

use crate::auth::flow::OAuthTokenResponse;
use crate::auth::flow::auth_code::AuthorizationCodeFlow;
use crate::auth::flow::refresh_token::RefreshTokenFlow;
use crate::auth::{AcquiredTokens, TokenAcquirer, claims};
use crate::config::{AuthOptions, AzureEnvironment};

use self::loopback_server::LoopbackServer;

/// Interactive sign-in through the system browser: authorization-code grant
/// with PKCE, the code collected by a short-lived loopback listener. Silent
/// renewal goes through the refresh-token grant with the same client.
pub struct InteractiveBrowserAcquirer {
    authority: String,
    options: AuthOptions,
    http_client: Arc<dyn HttpClient>,
}

impl InteractiveBrowserAcquirer {
    pub fn new(
        environment: AzureEnvironment,
        options: AuthOptions,
        http_client: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            authority: environment.authority().to_string(),
            options,
            http_client,
        }
    }

    fn scopes(&self) -> Vec<&str> {
        self.options.scopes.iter().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for InteractiveBrowserAcquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractiveBrowserAcquirer")
            .field("authority", &self.authority)
            .field("client_id", &self.options.client_id)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl TokenAcquirer for InteractiveBrowserAcquirer {
    async fn acquire(&self, tenant_id: &str) -> Result<AcquiredTokens> {
        // Bind before building the flow: with an ephemeral port the redirect
        // URI is only known once the listener exists.
        let server = LoopbackServer::new(
            self.options.redirect_port,
            self.options.success_template.clone(),
            self.options.error_template.clone(),
        )?;
        let redirect_uri = format!("http://localhost:{}", server.port()?);

        let flow = AuthorizationCodeFlow::new(
            &self.authority,
            tenant_id,
            oauth2::ClientId::new(self.options.client_id.clone()),
            self.options
                .client_secret
                .clone()
                .map(oauth2::ClientSecret::new),
            azure_core::http::Url::parse(&redirect_uri)?,
            &self.scopes(),
            self.options.prompt.as_deref(),
            self.options.login_hint.as_deref(),
        )?;

        webbrowser::open(flow.authorize_url.as_str())?;
        tracing::info!("opened the browser for interactive sign-in to tenant {tenant_id}");

        // The listener blocks on accept; keep it off the runtime threads.
        let timeout = self.options.flow_timeout;
        let state = flow.csrf_state.secret().clone();
        let code = tokio::task::spawn_blocking(move || server.listen_for_code(timeout, &state))
            .await
            .context("loopback listener task failed")??;

        let response = flow
            .exchange(self.http_client.clone(), AuthorizationCode::new(code))
            .await?;
        tokens_from_response(response, None)
    }

    async fn refresh(&self, tenant_id: &str, refresh_token: &str) -> Result<AcquiredTokens> {
        let flow = RefreshTokenFlow::new(
            &self.authority,
            tenant_id,
            oauth2::ClientId::new(self.options.client_id.clone()),
            self.options
                .client_secret
                .clone()
                .map(oauth2::ClientSecret::new),
        )?;
        let response = flow
            .exchange(self.http_client.clone(), refresh_token, &self.scopes())
            .await?;
        tokens_from_response(response, Some(refresh_token))
    }
}

/// Converts an OAuth2 token response into the cache's shape. The provider may
/// roll the refresh token forward; when it stays silent the prior one remains
/// valid and is carried over.
fn tokens_from_response(
    response: OAuthTokenResponse,
    prior_refresh_token: Option<&str>,
) -> Result<AcquiredTokens> {
    let expires_in = response
        .expires_in()
        .context("token response carried no expiry")?;
    let access_token = azure_core::credentials::AccessToken {
        token: response.access_token().secret().clone().into(),
        expires_on: azure_core::time::OffsetDateTime::now_utc() + expires_in,
    };
    let refresh_token = response
        .refresh_token()
        .map(|token| token.secret().clone())
        .or_else(|| prior_refresh_token.map(ToString::to_string));

    let mut user_id = None;
    let mut display_name = None;
    if let Some(id_token) = &response.extra_fields().id_token {
        match claims::decode_id_token(id_token) {
            Ok(claims) => {
                user_id = claims.user_id();
                display_name = claims.name;
            }
            Err(error) => {
                tracing::warn!("ignoring an undecodable id_token: {error:#}");
            }
        }
    }

    Ok(AcquiredTokens {
        user_id,
        display_name,
        access_token,
        refresh_token,
    })
}
