use std::sync::Arc;

use anyhow::Result;
use azure_core::http::HttpClient;
use oauth2::{Client, ClientId, ClientSecret, EndpointNotSet, EndpointSet, Scope};

use super::{OAuthClient, OAuthTokenResponse};
use crate::auth::oauth_http::OAuthHttpExecutor;

type RefreshTokenClient = OAuthClient<
    EndpointNotSet, // AuthUri is not set
    EndpointNotSet, // DeviceAuthUri is not set
    EndpointNotSet, // IntrospectionUri is not set
    EndpointNotSet, // RevocationUri is not set
    EndpointSet,    // TokenUri is set
>;

/// Silent token renewal via the refresh-token grant. No user interaction;
/// callers fall back to the interactive flow when this fails.
pub struct RefreshTokenFlow {
    client: RefreshTokenClient,
}

impl RefreshTokenFlow {
    pub fn new(
        authority: &str,
        tenant_id: &str,
        client_id: ClientId,
        client_secret: Option<ClientSecret>,
    ) -> Result<Self> {
        let token_url = super::token_endpoint(authority, tenant_id)?;
        let mut client: RefreshTokenClient = Client::new(client_id)
            .set_token_uri(token_url)
            .set_auth_type(oauth2::AuthType::RequestBody);
        if let Some(client_secret) = client_secret {
            client = client.set_client_secret(client_secret);
        }

        Ok(RefreshTokenFlow { client })
    }

    pub async fn exchange(
        self,
        http_client: Arc<dyn HttpClient>,
        refresh_token: &str,
        scopes: &[&str],
    ) -> Result<OAuthTokenResponse> {
        let http_client = |request: oauth2::HttpRequest| {
            let executor = OAuthHttpExecutor::new(http_client.clone());
            executor.request(request)
        };
        let scopes = scopes.iter().map(ToString::to_string).map(Scope::new);
        let response = self
            .client
            .exchange_refresh_token(&oauth2::RefreshToken::new(refresh_token.to_string()))
            .add_scopes(scopes)
            .request_async(&http_client)
            .await?;
        Ok(response)
    }
}
