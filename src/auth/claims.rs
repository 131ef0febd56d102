use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

/// Subset of the v2.0 id_token claims the toolkit cares about. The token is
/// only decoded, never validated: it came straight from the token endpoint
/// over TLS and is used for display and cache keying, not authorization.
#[derive(Debug, Default, Deserialize)]
pub struct IdTokenClaims {
    #[serde(default)]
    pub oid: Option<String>,
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl IdTokenClaims {
    /// Stable identifier for the signed-in user, preferring the human-readable
    /// UPN over the object id.
    pub fn user_id(&self) -> Option<String> {
        self.preferred_username
            .clone()
            .or_else(|| self.oid.clone())
            .or_else(|| self.sub.clone())
    }
}

pub fn decode_id_token(token: &str) -> Result<IdTokenClaims> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload)) = (parts.next(), parts.next()) else {
        bail!("id_token is not a JWT");
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .context("decoding id_token payload")?;
    serde_json::from_slice(&bytes).context("parsing id_token claims")
}
