use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderValue};

use crate::error::{PipelineError, Result};
use crate::fetch::HttpClient;

/// Remote event-log ingestion endpoint: one serialized change event per request.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn post(&self, payload: Bytes) -> Result<()>;

    fn target(&self) -> &str;
}

/// POSTs each payload to an LDES server ingestion URL.
pub struct HttpSink<C> {
    client: C,
    target: reqwest::Url,
    content_type: HeaderValue,
}

impl<C: HttpClient> HttpSink<C> {
    pub fn new(client: C, target: &str, content_type: &str) -> Result<Self> {
        let url = reqwest::Url::parse(target)
            .map_err(|e| PipelineError::Config(format!("invalid target URL {target:?}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PipelineError::Config(format!("invalid target URL: {target}")));
        }
        let content_type = HeaderValue::from_str(content_type)
            .map_err(|e| PipelineError::Config(format!("invalid content type: {e}")))?;
        Ok(Self {
            client,
            target: url,
            content_type,
        })
    }
}

#[async_trait]
impl<C: HttpClient> EventSink for HttpSink<C> {
    async fn post(&self, payload: Bytes) -> Result<()> {
        let mut req = reqwest::Request::new(reqwest::Method::POST, self.target.clone());
        req.headers_mut()
            .insert(CONTENT_TYPE, self.content_type.clone());
        *req.body_mut() = Some(payload.into());

        let resp = self
            .client
            .execute(req)
            .await
            .map_err(|e| PipelineError::DeliveryTransport {
                target: self.target.to_string(),
                message: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(PipelineError::DeliveryStatus {
                status: status.as_u16(),
                target: self.target.to_string(),
            })
        }
    }

    fn target(&self) -> &str {
        self.target.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::BasicClient;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/ldes")
    }

    #[test]
    fn test_rejects_non_http_target() {
        let client = BasicClient::new().unwrap();
        assert!(matches!(
            HttpSink::new(client, "ftp://example.org/ldes", "text/plain"),
            Err(PipelineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_post_success_and_rejection() {
        let ok = serve(Router::new().route("/ldes", post(|body: String| async move {
            assert!(body.ends_with(" .\n"));
            "OK"
        })))
        .await;
        let sink = HttpSink::new(BasicClient::new().unwrap(), &ok, "text/plain").unwrap();
        sink.post(Bytes::from_static(b"<a> <b> <c> .\n")).await.unwrap();

        let failing = serve(Router::new().route(
            "/ldes",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        ))
        .await;
        let sink = HttpSink::new(BasicClient::new().unwrap(), &failing, "text/plain").unwrap();
        let err = sink.post(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, PipelineError::DeliveryStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_sink_is_transport_error() {
        let sink =
            HttpSink::new(BasicClient::new().unwrap(), "http://127.0.0.1:9/ldes", "text/plain").unwrap();
        let err = sink.post(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, PipelineError::DeliveryTransport { .. }));
    }
}
