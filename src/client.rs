use std::sync::Arc;

use anyhow::{Context, Result, bail};
use azure_core::credentials::TokenCredential;
use azure_core::http::headers::{ACCEPT, AUTHORIZATION, HeaderValue};
use azure_core::http::{HttpClient, Method, Request, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// One page of an ARM collection response.
#[derive(Debug, Deserialize)]
pub struct Page<T> {
    // Spelled as a path so the derive does not add a `T: Default` bound.
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "nextLink")]
    pub next_link: Option<String>,
}

/// Thin client for the Azure management plane: bearer-authenticated GETs
/// with `nextLink` paging. Anything richer belongs to the vendor SDK crates;
/// the toolkit only enumerates small collections such as subscriptions.
pub struct ArmClient {
    endpoint: Url,
    scopes: Vec<String>,
    credential: Arc<dyn TokenCredential>,
    http_client: Arc<dyn HttpClient>,
}

impl ArmClient {
    pub fn new(
        endpoint: &str,
        scopes: Vec<String>,
        credential: Arc<dyn TokenCredential>,
        http_client: Arc<dyn HttpClient>,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint).context("parsing the management endpoint")?;
        Ok(Self {
            endpoint,
            scopes,
            credential,
            http_client,
        })
    }

    /// Fetches every item of a pageable collection, following `nextLink`
    /// until the service stops returning one.
    pub async fn get_all<T: DeserializeOwned>(
        &self,
        path: &str,
        api_version: &str,
    ) -> Result<Vec<T>> {
        let mut url = self
            .endpoint
            .join(path)
            .context("joining the request path")?;
        url.query_pairs_mut().append_pair("api-version", api_version);

        let mut items = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next {
            let page: Page<T> = self.get_page(url).await?;
            items.extend(page.value);
            next = page
                .next_link
                .map(|link| Url::parse(&link).context("parsing nextLink"))
                .transpose()?;
        }
        Ok(items)
    }

    async fn get_page<T: DeserializeOwned>(&self, url: Url) -> Result<Page<T>> {
        let scopes: Vec<&str> = self.scopes.iter().map(String::as_str).collect();
        let token = self
            .credential
            .get_token(&scopes, None)
            .await
            .context("getting a management-plane token")?;

        let mut request = Request::new(url.clone(), Method::Get);
        request.insert_header(
            AUTHORIZATION,
            HeaderValue::from(format!("Bearer {}", token.token.secret())),
        );
        request.insert_header(ACCEPT, HeaderValue::from_static("application/json"));

        tracing::debug!("GET {url}");
        let response = self.http_client.execute_request(&request).await?;
        let status = u16::from(response.status());
        let body = response.into_body().collect().await?;
        if !(200..300).contains(&status) {
            bail!(
                "management request to {url} failed with {status}: {}",
                String::from_utf8_lossy(&body)
            );
        }
        serde_json::from_slice(&body).with_context(|| format!("parsing the response from {url}"))
    }
}

impl std::fmt::Debug for ArmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArmClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}
