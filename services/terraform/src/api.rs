use std::sync::{Arc, RwLock};

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use observability::{Metrics, RequestId};
use repo::{CommonStorage, Instance, RegistryError, RepoConfig, RepositoryType};

use crate::repository::TerraformRepository;

/// The `terraform`/`tofu` repository type: owns the configured instances and
/// the provider-registry route surface.
pub struct TerraformType {
    metrics: Metrics,
    instances: RwLock<Vec<Arc<TerraformRepository>>>,
}

impl TerraformType {
    pub fn new(metrics: Metrics) -> Arc<Self> {
        Arc::new(TerraformType {
            metrics,
            instances: RwLock::new(Vec::new()),
        })
    }

    fn lookup(&self, namespace: &str, name: &str) -> Option<Arc<TerraformRepository>> {
        let segments = [namespace, name];
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        let mut best: Option<(usize, Arc<TerraformRepository>)> = None;
        for instance in instances.iter() {
            let weight = instance.match_weight(&segments);
            if weight > 0 && best.as_ref().is_none_or(|(w, _)| weight > *w) {
                best = Some((weight, instance.clone()));
            }
        }
        best.map(|(_, instance)| instance)
    }
}

impl RepositoryType for TerraformType {
    fn routes(self: Arc<Self>) -> Router {
        Router::new()
            .route("/.well-known/terraform.json", get(handle_well_known))
            .route(
                "/v1/providers/{namespace}/{name}/versions",
                get(handle_version_list),
            )
            .route(
                "/v1/providers/{namespace}/{name}/{version}",
                get(handle_version),
            )
            .route(
                "/v1/providers/{namespace}/{name}/{version}/{*tail}",
                get(handle_download),
            )
            .with_state(self)
    }

    fn new_repository(
        &self,
        common: CommonStorage,
        config: &RepoConfig,
    ) -> Result<Arc<dyn Instance>, RegistryError> {
        let instance = Arc::new(TerraformRepository::new(
            common,
            config,
            self.metrics.clone(),
        )?);
        self.instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(instance.clone());
        Ok(instance)
    }
}

/// Service discovery: points clients at the proxy's own provider endpoint.
async fn handle_well_known(headers: HeaderMap) -> Response {
    let base = format!(
        "{}://{}/v1/providers/",
        detect_scheme(&headers),
        request_host(&headers)
    );
    Json(serde_json::json!({ "providers.v1": base })).into_response()
}

async fn handle_version_list(
    State(state): State<Arc<TerraformType>>,
    Path((namespace, name)): Path<(String, String)>,
    headers: HeaderMap,
    request_id: RequestId,
) -> Response {
    let Some(instance) = state.lookup(&namespace, &name) else {
        return repository_not_found();
    };
    instance
        .handle_version_list(&namespace, &name, &headers, request_id.get())
        .await
}

async fn handle_version(
    State(state): State<Arc<TerraformType>>,
    Path((namespace, name, version)): Path<(String, String, String)>,
    headers: HeaderMap,
    request_id: RequestId,
) -> Response {
    let Some(instance) = state.lookup(&namespace, &name) else {
        return repository_not_found();
    };
    instance
        .handle_version(&namespace, &name, &version, &headers, request_id.get())
        .await
}

async fn handle_download(
    State(state): State<Arc<TerraformType>>,
    Path((namespace, name, version, tail)): Path<(String, String, String, String)>,
    headers: HeaderMap,
    request_id: RequestId,
) -> Response {
    let Some(instance) = state.lookup(&namespace, &name) else {
        return repository_not_found();
    };
    instance
        .handle_download(
            &namespace,
            &name,
            &version,
            &tail,
            &headers,
            request_id.get(),
        )
        .await
}

fn repository_not_found() -> Response {
    (StatusCode::NOT_FOUND, "Repository Not Found").into_response()
}

/// The scheme clients should use to reach this proxy: the first entry of
/// `X-Forwarded-Proto` when present. TLS terminates in the listener, so a
/// direct connection defaults to plain http.
pub(crate) fn detect_scheme(headers: &HeaderMap) -> &str {
    headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("http")
}

pub(crate) fn request_host(headers: &HeaderMap) -> &str {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .unwrap_or("localhost")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_prefers_forwarded_proto() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", "https, http".parse().unwrap());
        assert_eq!(detect_scheme(&headers), "https");
    }

    #[test]
    fn scheme_defaults_to_http() {
        assert_eq!(detect_scheme(&HeaderMap::new()), "http");
    }

    #[test]
    fn host_defaults_to_localhost() {
        assert_eq!(request_host(&HeaderMap::new()), "localhost");
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "proxy.test".parse().unwrap());
        assert_eq!(request_host(&headers), "proxy.test");
    }
}
