use std::time::Instant;

use http::header::{self, HeaderMap, HeaderValue};
use http::Method;
use observability::{Metrics, REQUEST_ID_HEADER};
use repo::UpstreamConfig;
use url::Url;

use crate::auth::UpstreamAuth;
use crate::error::UpstreamError;

/// Round-trips requests to one repository's configured upstream.
///
/// The client clones the inbound request's headers (minus hop-by-hop
/// headers), threads the correlation ID, and when the upstream answers with
/// an authentication challenge retries exactly once with the header the
/// broker computes. Every round trip is observed with its status and
/// latency; transport failures count under the `error` status label.
#[derive(Debug)]
pub struct UpstreamClient {
    base: Url,
    target: String,
    http: reqwest::Client,
    auth: UpstreamAuth,
    metrics: Metrics,
    repo_type: String,
    repo_name: String,
}

impl UpstreamClient {
    pub fn new(
        config: &UpstreamConfig,
        metrics: Metrics,
        repo_type: impl Into<String>,
        repo_name: impl Into<String>,
    ) -> Result<Self, UpstreamError> {
        let base = Url::parse(&config.url)?;
        let target = match (base.host_str(), base.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            _ => String::new(),
        };
        let http = reqwest::Client::builder().build()?;
        let auth = UpstreamAuth::from_config(http.clone(), config.auth.as_ref())?;
        Ok(UpstreamClient {
            base,
            target,
            http,
            auth,
            metrics,
            repo_type: repo_type.into(),
            repo_name: repo_name.into(),
        })
    }

    /// The upstream's `host[:port]`, used as the locator host for cached
    /// artifacts and as the metric target label.
    pub fn upstream_host(&self) -> &str {
        &self.target
    }

    /// Round-trip the inbound request's method, path and query to the
    /// upstream.
    pub async fn round_trip(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        request_id: Option<&str>,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut url = self.base.clone();
        url.set_path(path);
        url.set_query(query);

        let started = Instant::now();
        let result = self
            .send_with_auth(method, url, headers, request_id)
            .await;
        let elapsed = started.elapsed();
        match &result {
            Ok(response) => self.metrics.observe_upstream(
                &self.repo_type,
                &self.repo_name,
                &self.target,
                Some(response.status().as_u16()),
                elapsed,
            ),
            Err(_) => self.metrics.observe_upstream(
                &self.repo_type,
                &self.repo_name,
                &self.target,
                None,
                elapsed,
            ),
        }
        result
    }

    /// Fetch an absolute URL (e.g. a package's `download_url`) with the
    /// same challenge handling as [`round_trip`](Self::round_trip).
    pub async fn fetch(
        &self,
        url: &str,
        request_id: Option<&str>,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = Url::parse(url)?;
        self.send_with_auth(Method::GET, url, &HeaderMap::new(), request_id)
            .await
    }

    async fn send_with_auth(
        &self,
        method: Method,
        url: Url,
        headers: &HeaderMap,
        request_id: Option<&str>,
    ) -> Result<reqwest::Response, UpstreamError> {
        let response = self
            .attempt(method.clone(), url.clone(), headers, request_id, None)
            .await?;
        if response.status() != http::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        match self.auth.authorization(&response).await {
            Ok(Some(authorization)) => {
                self.attempt(method, url, headers, request_id, Some(&authorization))
                    .await
            }
            Ok(None) => Ok(response),
            Err(error) => {
                // the client sees the upstream's 401 verbatim
                tracing::warn!(%error, target = %self.target, "failed to build upstream auth header");
                Ok(response)
            }
        }
    }

    async fn attempt(
        &self,
        method: Method,
        url: Url,
        headers: &HeaderMap,
        request_id: Option<&str>,
        authorization: Option<&str>,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut outbound = HeaderMap::new();
        for (name, value) in headers {
            if name == header::HOST
                || name == header::CONTENT_LENGTH
                || name == header::CONNECTION
                || name == header::TRANSFER_ENCODING
            {
                continue;
            }
            outbound.append(name.clone(), value.clone());
        }
        if let Some(id) = request_id.filter(|id| !id.is_empty()) {
            if let Ok(value) = HeaderValue::from_str(id) {
                outbound.insert(REQUEST_ID_HEADER, value);
            }
        }
        if let Some(authorization) = authorization {
            if let Ok(value) = HeaderValue::from_str(authorization) {
                outbound.insert(header::AUTHORIZATION, value);
            }
        }
        Ok(self
            .http
            .request(method, url)
            .headers(outbound)
            .send()
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repo::UpstreamConfig;

    fn upstream_config(url: &str) -> UpstreamConfig {
        serde_json::from_value(serde_json::json!({ "url": url })).unwrap()
    }

    #[tokio::test]
    async fn forwards_path_query_and_request_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/library/alpine/tags/list")
            .match_query(mockito::Matcher::UrlEncoded("n".to_string(), "5".to_string()))
            .match_header("x-request-id", "req-42")
            .with_status(200)
            .with_body("{\"tags\":[]}")
            .expect(1)
            .create_async()
            .await;

        let client = UpstreamClient::new(
            &upstream_config(&server.url()),
            Metrics::new(),
            "docker",
            "mirror",
        )
        .unwrap();

        let response = client
            .round_trip(
                Method::GET,
                "/v2/library/alpine/tags/list",
                Some("n=5"),
                &HeaderMap::new(),
                Some("req-42"),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn retries_once_after_challenge() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let challenge = server
            .mock("GET", "/v2/library/alpine/manifests/latest")
            .match_header("authorization", mockito::Matcher::Missing)
            .with_status(401)
            .with_header(
                "www-authenticate",
                &format!("Bearer realm=\"{url}/token\",service=\"reg\",scope=\"repository:library/alpine:pull\""),
            )
            .expect(1)
            .create_async()
            .await;
        let token = server
            .mock("GET", "/token")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("{\"token\":\"T\",\"expires_in\":120}")
            .expect(1)
            .create_async()
            .await;
        let authed = server
            .mock("GET", "/v2/library/alpine/manifests/latest")
            .match_header("authorization", "Bearer T")
            .with_status(200)
            .with_body("{\"ok\":true}")
            .expect(1)
            .create_async()
            .await;

        let client = UpstreamClient::new(
            &upstream_config(&url),
            Metrics::new(),
            "docker",
            "mirror",
        )
        .unwrap();

        let response = client
            .round_trip(
                Method::GET,
                "/v2/library/alpine/manifests/latest",
                None,
                &HeaderMap::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "{\"ok\":true}");

        challenge.assert_async().await;
        token.assert_async().await;
        authed.assert_async().await;
    }

    #[tokio::test]
    async fn transport_failure_counts_as_error() {
        let metrics = Metrics::new();
        // nothing listens on this port
        let client = UpstreamClient::new(
            &upstream_config("http://127.0.0.1:1"),
            metrics.clone(),
            "docker",
            "mirror",
        )
        .unwrap();
        let err = client
            .round_trip(Method::GET, "/v2/", None, &HeaderMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Transport(_)));
        assert_eq!(metrics.upstream_request_count(), 1);
        assert!(metrics.encode_text().contains("status=\"error\""));
    }
}
