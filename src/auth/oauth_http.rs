use std::sync::Arc;

use azure_core::error::{Error, ErrorKind};
use azure_core::http::headers::{HeaderName, HeaderValue};
use azure_core::http::{HttpClient, Method, Request, Url};

/// Runs `oauth2` token requests over the shared `azure_core` HTTP client so
/// the flows use the same transport (proxy settings included) as every other
/// call the toolkit makes.
pub struct OAuthHttpExecutor {
    http_client: Arc<dyn HttpClient>,
}

impl OAuthHttpExecutor {
    pub fn new(http_client: Arc<dyn HttpClient>) -> Self {
        Self { http_client }
    }

    pub async fn request(self, request: oauth2::HttpRequest) -> Result<oauth2::HttpResponse, Error> {
        let url = Url::parse(&request.uri().to_string())
            .map_err(|e| Error::with_message(ErrorKind::DataConversion, || format!("invalid request url: {e}")))?;
        let method = convert_method(request.method().as_str())?;

        let mut req = Request::new(url, method);
        for (name, value) in request.headers() {
            let value = value.to_str().map_err(|e| {
                Error::with_message(ErrorKind::DataConversion, || {
                    format!("non-text header {}: {e}", name.as_str())
                })
            })?;
            req.insert_header(
                HeaderName::from(name.as_str().to_owned()),
                HeaderValue::from(value.to_owned()),
            );
        }
        req.set_body(bytes::Bytes::from(request.body().clone()));

        let response = self.http_client.execute_request(&req).await?;
        let status = u16::from(response.status());
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str().to_owned(), value.as_str().to_owned()))
            .collect();
        let body = response.into_body().collect().await?;

        let mut builder = oauth2::http::Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder.body(body.to_vec()).map_err(|e| {
            Error::with_message(ErrorKind::DataConversion, || {
                format!("assembling token response: {e}")
            })
        })
    }
}

fn convert_method(method: &str) -> Result<Method, Error> {
    match method {
        "GET" => Ok(Method::Get),
        "POST" => Ok(Method::Post),
        "PUT" => Ok(Method::Put),
        "DELETE" => Ok(Method::Delete),
        "PATCH" => Ok(Method::Patch),
        "HEAD" => Ok(Method::Head),
        other => Err(Error::with_message(ErrorKind::DataConversion, || {
            format!("unsupported http method {other}")
        })),
    }
}
