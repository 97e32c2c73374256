use std::time::Duration;

use reqwest::Url;

use crate::error::ClientError;

pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClient {
    pub fn new(base_url: &str, secret: &str, timeout: Duration) -> Result<Self, ClientError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut authorization =
            reqwest::header::HeaderValue::from_str(&format!("Bearer {}", secret))
                .map_err(|e| ClientError::InternalError(anyhow::anyhow!("Invalid secret: {}", e)))?;
        authorization.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, authorization);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        let base_url = match base_url.ends_with('/') {
            true => base_url.to_string(),
            false => format!("{}/", base_url),
        };
        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| ClientError::InternalError(anyhow::anyhow!("Invalid url: {}", e)))
    }

    pub fn post(&self, path: &str) -> Result<reqwest::RequestBuilder, ClientError> {
        Ok(self.client.post(self.url(path)?))
    }

    /// POST to the base url extended by `segments`, each one percent-encoded.
    pub fn post_segments(&self, segments: &[&str]) -> Result<reqwest::RequestBuilder, ClientError> {
        let mut url = self.url("")?;
        url.path_segments_mut()
            .map_err(|_| {
                ClientError::InternalError(anyhow::anyhow!("Invalid base url: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(self.client.post(url))
    }
}
