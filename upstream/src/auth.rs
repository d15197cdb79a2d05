use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use repo::AuthConfig;
use serde::Deserialize;

use crate::challenge::{parse_www_authenticate, Challenge};
use crate::error::UpstreamError;

const BEARER_EXPIRY_SKEW: Duration = Duration::from_secs(10);
const BEARER_DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
const ECR_EXPIRY_SKEW: Duration = Duration::from_secs(60);
const ECR_DEFAULT_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Converts an upstream's `WWW-Authenticate` challenge into an
/// `Authorization` header value.
///
/// Safe for concurrent callers; token caches are mutex protected.
#[derive(Debug)]
pub struct UpstreamAuth {
    bearer: BearerTokenSource,
    basic: Option<BasicCredentialSource>,
}

impl UpstreamAuth {
    /// Build the broker from the repository's declarative auth descriptor.
    pub fn from_config(
        http: reqwest::Client,
        auth: Option<&AuthConfig>,
    ) -> Result<Self, UpstreamError> {
        let Some(auth) = auth else {
            return Ok(UpstreamAuth {
                bearer: BearerTokenSource::new(http, None, None),
                basic: None,
            });
        };
        let get = |key: &str| auth.config.get(key).cloned().filter(|v| !v.is_empty());
        match auth.provider.to_lowercase().as_str() {
            "" | "dockerhub" | "ghcr" | "bearer" => Ok(UpstreamAuth {
                bearer: BearerTokenSource::new(http, get("username"), get("password")),
                basic: None,
            }),
            "basic" => {
                let (Some(username), Some(password)) = (get("username"), get("password")) else {
                    return Err(UpstreamError::Config(
                        "basic upstream auth requires username and password".to_string(),
                    ));
                };
                Ok(UpstreamAuth {
                    bearer: BearerTokenSource::new(http, None, None),
                    basic: Some(BasicCredentialSource::Static(
                        BASE64_STANDARD.encode(format!("{username}:{password}")),
                    )),
                })
            }
            "ecr" => Ok(UpstreamAuth {
                bearer: BearerTokenSource::new(http, None, None),
                basic: Some(BasicCredentialSource::Ecr(EcrCredentials::new(auth)?)),
            }),
            _ => Err(UpstreamError::UnsupportedProvider(auth.provider.clone())),
        }
    }

    /// Compute the `Authorization` header satisfying the response's
    /// challenge, or `None` when the response carries no challenge this
    /// broker can answer.
    pub async fn authorization(
        &self,
        response: &reqwest::Response,
    ) -> Result<Option<String>, UpstreamError> {
        let Some(header) = response
            .headers()
            .get(http::header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            return Ok(None);
        };
        let challenges = parse_www_authenticate(header)?;
        for challenge in &challenges {
            match challenge.scheme.to_lowercase().as_str() {
                "bearer" => {
                    if let Some(token) = self.bearer.token(challenge).await? {
                        return Ok(Some(format!("Bearer {token}")));
                    }
                }
                "basic" => {
                    let Some(basic) = &self.basic else { continue };
                    let value = basic.header_value().await?;
                    if !value.is_empty() {
                        return Ok(Some(format!("Basic {value}")));
                    }
                }
                _ => {}
            }
        }
        Ok(None)
    }
}

#[derive(Debug)]
enum BasicCredentialSource {
    /// A constant `base64(user:pass)` credential.
    Static(String),

    /// Credentials fetched from the ECR authorization API.
    Ecr(EcrCredentials),
}

impl BasicCredentialSource {
    async fn header_value(&self) -> Result<String, UpstreamError> {
        match self {
            BasicCredentialSource::Static(value) => Ok(value.clone()),
            BasicCredentialSource::Ecr(credentials) => credentials.header_value().await,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Fetches and caches bearer tokens from a challenge's token endpoint.
#[derive(Debug)]
struct BearerTokenSource {
    http: reqwest::Client,
    username: Option<String>,
    password: Option<String>,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl BearerTokenSource {
    fn new(http: reqwest::Client, username: Option<String>, password: Option<String>) -> Self {
        BearerTokenSource {
            http,
            username,
            password,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn token(&self, challenge: &Challenge) -> Result<Option<String>, UpstreamError> {
        let realm = challenge.param("realm").ok_or(UpstreamError::MissingRealm)?;
        let service = challenge.param("service").unwrap_or_default();
        let scope = challenge.param("scope").unwrap_or_default();
        let cache_key = format!("{service}|{scope}");

        if let Some(token) = self.cached(&cache_key) {
            return Ok(Some(token));
        }

        let mut url = url::Url::parse(realm)?;
        {
            let mut query = url.query_pairs_mut();
            if !service.is_empty() {
                query.append_pair("service", service);
            }
            if !scope.is_empty() {
                query.append_pair("scope", scope);
            }
        }

        let mut request = self.http.get(url);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }
        let response = request.send().await?;
        let status = response.status();
        if status != http::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            let mut body = body;
            body.truncate(2048);
            return Err(UpstreamError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }
        let payload: TokenResponse = response.json().await?;
        let token = if payload.token.is_empty() {
            payload.access_token
        } else {
            payload.token
        };
        if token.is_empty() {
            return Err(UpstreamError::TokenMissing);
        }
        let ttl = if payload.expires_in > 0 {
            Duration::from_secs(payload.expires_in)
        } else {
            BEARER_DEFAULT_TTL
        };
        self.store(cache_key, token.clone(), Instant::now() + ttl);
        Ok(Some(token))
    }

    fn cached(&self, key: &str) -> Option<String> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = cache.get(key) {
            if Instant::now() + BEARER_EXPIRY_SKEW < entry.expires_at {
                return Some(entry.value.clone());
            }
            cache.remove(key);
        }
        None
    }

    fn store(&self, key: String, value: String, expires_at: Instant) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(key, CachedToken { value, expires_at });
    }
}

#[derive(Debug, Clone)]
struct EcrCachedToken {
    value: String,
    expires_at: SystemTime,
}

/// Basic-token source backed by the ECR `GetAuthorizationToken` API.
#[derive(Debug)]
struct EcrCredentials {
    client: aws_sdk_ecr::Client,
    registry_id: Option<String>,
    cache: tokio::sync::Mutex<Option<EcrCachedToken>>,
}

impl EcrCredentials {
    fn new(auth: &AuthConfig) -> Result<Self, UpstreamError> {
        let get = |key: &str| auth.config.get(key).cloned().filter(|v| !v.is_empty());
        let (Some(region), Some(access_key), Some(secret_key)) = (
            get("region"),
            get("access_key_id"),
            get("secret_access_key"),
        ) else {
            return Err(UpstreamError::Config(
                "ecr auth requires region, access_key_id, and secret_access_key".to_string(),
            ));
        };
        let credentials = aws_sdk_ecr::config::Credentials::new(
            access_key,
            secret_key,
            get("session_token"),
            None,
            "repoxy",
        );
        let config = aws_sdk_ecr::Config::builder()
            .behavior_version(aws_sdk_ecr::config::BehaviorVersion::latest())
            .region(aws_sdk_ecr::config::Region::new(region))
            .credentials_provider(credentials)
            .build();
        Ok(EcrCredentials {
            client: aws_sdk_ecr::Client::from_conf(config),
            registry_id: get("registry_id"),
            cache: tokio::sync::Mutex::new(None),
        })
    }

    async fn header_value(&self) -> Result<String, UpstreamError> {
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.as_ref() {
            if SystemTime::now() + ECR_EXPIRY_SKEW < entry.expires_at {
                return Ok(entry.value.clone());
            }
        }

        let mut request = self.client.get_authorization_token();
        if let Some(registry_id) = &self.registry_id {
            #[allow(deprecated)]
            {
                request = request.registry_ids(registry_id);
            }
        }
        let output = request
            .send()
            .await
            .map_err(|err| UpstreamError::Ecr(err.to_string()))?;
        let data = output
            .authorization_data()
            .first()
            .ok_or_else(|| UpstreamError::Ecr("authorization response missing data".to_string()))?;
        let token = data
            .authorization_token()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| UpstreamError::Ecr("authorization token empty".to_string()))?
            .to_string();
        let expires_at = data
            .expires_at()
            .map(|expiry| UNIX_EPOCH + Duration::from_secs(expiry.secs().max(0) as u64))
            .unwrap_or_else(|| SystemTime::now() + ECR_DEFAULT_TTL);
        *cache = Some(EcrCachedToken {
            value: token.clone(),
            expires_at,
        });
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn auth_config(provider: &str, pairs: &[(&str, &str)]) -> AuthConfig {
        AuthConfig {
            provider: provider.to_string(),
            config: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn challenge_response(header: &str) -> reqwest::Response {
        http::Response::builder()
            .status(http::StatusCode::UNAUTHORIZED)
            .header(http::header::WWW_AUTHENTICATE, header)
            .body("")
            .unwrap()
            .into()
    }

    #[tokio::test]
    async fn no_challenge_means_no_header() {
        let auth = UpstreamAuth::from_config(reqwest::Client::new(), None).unwrap();
        let response: reqwest::Response = http::Response::builder()
            .status(http::StatusCode::OK)
            .body("")
            .unwrap()
            .into();
        assert!(auth.authorization(&response).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn static_basic_credentials() {
        let auth = UpstreamAuth::from_config(
            reqwest::Client::new(),
            Some(&auth_config(
                "basic",
                &[("username", "demo"), ("password", "secret")],
            )),
        )
        .unwrap();
        let header = auth
            .authorization(&challenge_response("Basic realm=\"registry\""))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(header, format!("Basic {}", BASE64_STANDARD.encode("demo:secret")));
    }

    #[tokio::test]
    async fn basic_requires_credentials() {
        let err = UpstreamAuth::from_config(
            reqwest::Client::new(),
            Some(&auth_config("basic", &[("username", "demo")])),
        )
        .unwrap_err();
        assert!(matches!(err, UpstreamError::Config(_)));
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let err = UpstreamAuth::from_config(
            reqwest::Client::new(),
            Some(&auth_config("carrier-pigeon", &[])),
        )
        .unwrap_err();
        assert!(matches!(err, UpstreamError::UnsupportedProvider(_)));
    }

    #[tokio::test]
    async fn bearer_token_is_fetched_and_cached() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("GET", "/token")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("service".to_string(), "reg".to_string()),
                mockito::Matcher::UrlEncoded(
                    "scope".to_string(),
                    "repository:library/alpine:pull".to_string(),
                ),
            ]))
            .match_header(
                "authorization",
                format!("Basic {}", BASE64_STANDARD.encode("demo:secret")).as_str(),
            )
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{\"token\":\"T\",\"expires_in\":120}")
            .expect(1)
            .create_async()
            .await;

        let auth = UpstreamAuth::from_config(
            reqwest::Client::new(),
            Some(&auth_config(
                "dockerhub",
                &[("username", "demo"), ("password", "secret")],
            )),
        )
        .unwrap();

        let header = format!(
            "Bearer realm=\"{}/token\",service=\"reg\",scope=\"repository:library/alpine:pull\"",
            server.url()
        );
        let first = auth
            .authorization(&challenge_response(&header))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, "Bearer T");

        // served from the cache: no extra token request
        let second = auth
            .authorization(&challenge_response(&header))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, "Bearer T");

        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn token_endpoint_failure_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/token")
            .with_status(503)
            .with_body("downstream broken")
            .create_async()
            .await;

        let auth = UpstreamAuth::from_config(reqwest::Client::new(), None).unwrap();
        let header = format!("Bearer realm=\"{}/token\",service=\"reg\"", server.url());
        let err = auth
            .authorization(&challenge_response(&header))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UpstreamError::TokenEndpoint { status: 503, .. }
        ));
    }

    #[tokio::test]
    async fn ecr_requires_configuration() {
        let err = UpstreamAuth::from_config(
            reqwest::Client::new(),
            Some(&auth_config("ecr", &[("region", "us-east-1")])),
        )
        .unwrap_err();
        assert!(matches!(err, UpstreamError::Config(_)));
    }
}
