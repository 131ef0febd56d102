use std::sync::Arc;

use anyhow::Result;
use azure_core::http::{HttpClient, Url};
use oauth2::{Client, ClientId, ClientSecret, EndpointNotSet, EndpointSet, HttpRequest, Scope};

use super::{OAuthClient, OAuthTokenResponse};
use crate::auth::oauth_http::OAuthHttpExecutor;

type AuthorizationCodeClient = OAuthClient<
    EndpointSet,    // AuthUri is set
    EndpointNotSet, // DeviceAuthUri is not set
    EndpointNotSet, // IntrospectionUri is not set
    EndpointNotSet, // RevocationUri is not set
    EndpointSet,    // TokenUri is set
>;

/// Authorization-code grant with PKCE against the AAD v2.0 endpoints.
///
/// Construction picks the authorize URL the browser must visit; `exchange`
/// turns the code delivered back to the loopback listener into tokens.
pub struct AuthorizationCodeFlow {
    client: AuthorizationCodeClient,
    /// The URL to open in the user's browser.
    pub authorize_url: Url,
    /// The CSRF token the redirect must echo back as `state`.
    pub csrf_state: oauth2::CsrfToken,
    pkce_code_verifier: oauth2::PkceCodeVerifier,
}

impl AuthorizationCodeFlow {
    pub fn new(
        authority: &str,
        tenant_id: &str,
        client_id: ClientId,
        client_secret: Option<ClientSecret>,
        redirect_url: Url,
        scopes: &[&str],
        prompt: Option<&str>,
        login_hint: Option<&str>,
    ) -> Result<Self> {
        let auth_url = super::authorize_endpoint(authority, tenant_id)?;
        let token_url = super::token_endpoint(authority, tenant_id)?;

        let mut client: AuthorizationCodeClient = Client::new(client_id)
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            // AAD requires client_id and client_secret in the request body
            // rather than Basic authentication.
            .set_auth_type(oauth2::AuthType::RequestBody)
            .set_redirect_uri(oauth2::RedirectUrl::from_url(redirect_url));
        if let Some(client_secret) = client_secret {
            client = client.set_client_secret(client_secret);
        }

        let scopes = scopes.iter().map(ToString::to_string).map(Scope::new);

        // AAD supports Proof Key for Code Exchange; create a code verifier and
        // SHA-256 encode it as the challenge.
        let (pkce_code_challenge, pkce_code_verifier) =
            oauth2::PkceCodeChallenge::new_random_sha256();

        let mut auth_url_builder = client
            .authorize_url(oauth2::CsrfToken::new_random)
            .add_scopes(scopes)
            .set_pkce_challenge(pkce_code_challenge);
        if let Some(prompt_value) = prompt {
            auth_url_builder = auth_url_builder.add_extra_param("prompt", prompt_value);
        }
        if let Some(login_hint_value) = login_hint {
            auth_url_builder = auth_url_builder.add_extra_param("login_hint", login_hint_value);
        }
        // The loopback listener reads the code from a POSTed form body.
        auth_url_builder = auth_url_builder.add_extra_param("response_mode", "form_post");

        let (authorize_url, csrf_state) = auth_url_builder.url();

        Ok(AuthorizationCodeFlow {
            client,
            authorize_url,
            csrf_state,
            pkce_code_verifier,
        })
    }

    pub async fn exchange(
        self,
        http_client: Arc<dyn HttpClient>,
        code: oauth2::AuthorizationCode,
    ) -> Result<OAuthTokenResponse> {
        let http_client = |request: HttpRequest| {
            let executor = OAuthHttpExecutor::new(http_client.clone());
            executor.request(request)
        };

        let token_request = self
            .client
            .exchange_code(code)
            .set_pkce_verifier(self.pkce_code_verifier);

        let token_response = token_request.request_async(&http_client).await?;

        Ok(token_response)
    }
}
