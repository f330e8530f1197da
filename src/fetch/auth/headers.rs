use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;

use crate::error::{PipelineError, Result};
use crate::fetch::client::HttpClient;

/// An [`HttpClient`] wrapper that adds the per-feed `auth_headers` from the
/// configuration (e.g. `Ocp-Apim-Subscription-Key`) to every request.
///
/// Header names and values are validated once, when the wrapper is built.
pub struct AuthHeaders<C> {
    inner: C,
    headers: HeaderMap,
}

impl<C> AuthHeaders<C> {
    pub fn new(inner: C, headers: &BTreeMap<String, String>) -> Result<Self> {
        let mut map = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| PipelineError::Config(format!("invalid auth header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| PipelineError::Config(format!("invalid value for auth header {name}: {e}")))?;
            map.insert(name, value);
        }
        Ok(Self {
            inner,
            headers: map,
        })
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for AuthHeaders<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        for (name, value) in &self.headers {
            req.headers_mut().insert(name.clone(), value.clone());
        }
        self.inner.execute(req).await
    }
}
