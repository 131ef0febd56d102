pub mod auth_code;
pub mod refresh_token;

use oauth2::{EndpointNotSet, ExtraTokenFields};
use serde::{Deserialize, Serialize};

/// Extra fields AAD includes in token responses beyond RFC 6749. `id_token`
/// is the one we read: it identifies the principal that signed in.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AadTokenFields {
    #[serde(default, rename = "id_token", skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl ExtraTokenFields for AadTokenFields {}

pub type OAuthTokenResponse =
    oauth2::StandardTokenResponse<AadTokenFields, oauth2::basic::BasicTokenType>;

type OAuthClient<
    HasAuthUrl = EndpointNotSet,
    HasDeviceAuthUrl = EndpointNotSet,
    HasIntrospectionUrl = EndpointNotSet,
    HasRevocationUrl = EndpointNotSet,
    HasTokenUrl = EndpointNotSet,
> = oauth2::Client<
    oauth2::basic::BasicErrorResponse,
    OAuthTokenResponse,
    oauth2::basic::BasicTokenIntrospectionResponse,
    oauth2::StandardRevocableToken,
    oauth2::basic::BasicRevocationErrorResponse,
    HasAuthUrl,
    HasDeviceAuthUrl,
    HasIntrospectionUrl,
    HasRevocationUrl,
    HasTokenUrl,
>;

fn authorize_endpoint(authority: &str, tenant_id: &str) -> anyhow::Result<oauth2::AuthUrl> {
    Ok(oauth2::AuthUrl::from_url(azure_core::http::Url::parse(
        &format!("{authority}/{tenant_id}/oauth2/v2.0/authorize"),
    )?))
}

fn token_endpoint(authority: &str, tenant_id: &str) -> anyhow::Result<oauth2::TokenUrl> {
    Ok(oauth2::TokenUrl::from_url(azure_core::http::Url::parse(
        &format!("{authority}/{tenant_id}/oauth2/v2.0/token"),
    )?))
}
