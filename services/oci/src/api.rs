use std::sync::{Arc, RwLock};

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use observability::{Metrics, RequestId};
use repo::{CommonStorage, Instance, RegistryError, RepoConfig, RepositoryType};

use crate::repository::OciRepository;

pub(crate) const READ_ONLY_BODY: &str = "This repo is read-only, no write operations allowed";

/// The `docker`/`container` repository type: owns the configured instances
/// and the `/v2/` route surface.
pub struct OciType {
    metrics: Metrics,
    instances: RwLock<Vec<Arc<OciRepository>>>,
}

impl OciType {
    pub fn new(metrics: Metrics) -> Arc<Self> {
        Arc::new(OciType {
            metrics,
            instances: RwLock::new(Vec::new()),
        })
    }

    /// The configured instance whose mappings best match the image name.
    fn lookup(&self, name: &str) -> Option<Arc<OciRepository>> {
        let segments: Vec<&str> = name.split('/').collect();
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        let mut best: Option<(usize, Arc<OciRepository>)> = None;
        for instance in instances.iter() {
            let weight = instance.match_weight(&segments);
            if weight > 0 && best.as_ref().is_none_or(|(w, _)| weight > *w) {
                best = Some((weight, instance.clone()));
            }
        }
        best.map(|(_, instance)| instance)
    }
}

impl RepositoryType for OciType {
    fn routes(self: Arc<Self>) -> Router {
        Router::new()
            .route("/v2/", get(handle_v2_root))
            .route("/v2/{*rest}", any(handle_v2_dispatch))
            .with_state(self)
    }

    fn new_repository(
        &self,
        common: CommonStorage,
        config: &RepoConfig,
    ) -> Result<Arc<dyn Instance>, RegistryError> {
        let instance = Arc::new(OciRepository::new(common, config, self.metrics.clone())?);
        self.instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(instance.clone());
        Ok(instance)
    }
}

/// One parsed `/v2/...` request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OciRoute {
    Catalog,
    Tags { name: String },
    Manifest { name: String, tag: String },
    BlobUploadStart { name: String },
    BlobUpload { name: String, uuid: String },
    Blob { name: String, digest: String },
}

/// The mux cannot capture a multi-segment image name mid-path, so the whole
/// tail is matched and picked apart from its trailing markers.
fn parse_oci_path(path: &str) -> Option<OciRoute> {
    let path = path.trim_start_matches('/');

    if path == "_catalog" {
        return Some(OciRoute::Catalog);
    }

    if let Some(name) = path.strip_suffix("/tags/list") {
        if !name.is_empty() {
            return Some(OciRoute::Tags {
                name: name.to_string(),
            });
        }
    }

    if let Some(idx) = path.rfind("/blobs/uploads/") {
        let name = &path[..idx];
        let uuid = &path[idx + "/blobs/uploads/".len()..];
        if !name.is_empty() && !uuid.is_empty() {
            return Some(OciRoute::BlobUpload {
                name: name.to_string(),
                uuid: uuid.to_string(),
            });
        }
    }

    for suffix in ["/blobs/uploads/", "/blobs/uploads"] {
        if let Some(name) = path.strip_suffix(suffix) {
            if !name.is_empty() {
                return Some(OciRoute::BlobUploadStart {
                    name: name.to_string(),
                });
            }
        }
    }

    if let Some(idx) = path.rfind("/blobs/") {
        let name = &path[..idx];
        let digest = &path[idx + "/blobs/".len()..];
        if !name.is_empty() && !digest.is_empty() {
            return Some(OciRoute::Blob {
                name: name.to_string(),
                digest: digest.to_string(),
            });
        }
    }

    if let Some(idx) = path.rfind("/manifests/") {
        let name = &path[..idx];
        let tag = &path[idx + "/manifests/".len()..];
        if !name.is_empty() && !tag.is_empty() {
            return Some(OciRoute::Manifest {
                name: name.to_string(),
                tag: tag.to_string(),
            });
        }
    }

    None
}

/// API version check: `GET /v2/` answers 200 with an empty JSON object.
async fn handle_v2_root() -> Response {
    (
        StatusCode::OK,
        [
            ("Docker-Distribution-API-Version", "registry/2.0"),
            ("Content-Type", "application/json"),
            ("Content-Length", "2"),
        ],
        "{}",
    )
        .into_response()
}

async fn handle_v2_dispatch(
    State(state): State<Arc<OciType>>,
    Path(rest): Path<String>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    request_id: RequestId,
) -> Response {
    let Some(route) = parse_oci_path(&rest) else {
        return repository_not_found();
    };

    if let OciRoute::Catalog = route {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            "Repository is read-only; catalog listing is not implemented",
        )
            .into_response();
    }

    let name = match &route {
        OciRoute::Tags { name }
        | OciRoute::Manifest { name, .. }
        | OciRoute::BlobUploadStart { name }
        | OciRoute::BlobUpload { name, .. }
        | OciRoute::Blob { name, .. } => name.clone(),
        OciRoute::Catalog => unreachable!(),
    };
    let Some(instance) = state.lookup(&name) else {
        return repository_not_found();
    };

    if method != Method::GET && method != Method::HEAD {
        return (StatusCode::METHOD_NOT_ALLOWED, READ_ONLY_BODY).into_response();
    }

    let query = query.as_deref();
    let request_id = request_id.get();

    match route {
        OciRoute::Tags { name } => {
            instance
                .handle_tags(method, &name, query, &headers, request_id)
                .await
        }
        OciRoute::Manifest { name, tag } => {
            instance
                .handle_manifest(method, &name, &tag, query, &headers, request_id)
                .await
        }
        OciRoute::Blob { name, digest } => {
            instance
                .handle_blob(method, &name, &digest, query, &headers, request_id)
                .await
        }
        OciRoute::BlobUploadStart { .. } | OciRoute::BlobUpload { .. } => (
            StatusCode::METHOD_NOT_ALLOWED,
            "Repository is read-only; uploads are not supported",
        )
            .into_response(),
        OciRoute::Catalog => unreachable!(),
    }
}

fn repository_not_found() -> Response {
    (StatusCode::NOT_FOUND, "Repository Not Found").into_response()
}

/// Copy upstream response headers onto the client response, skipping
/// hop-by-hop framing headers.
pub(crate) fn copy_response_headers(response: &mut Response, upstream: &HeaderMap) {
    for (name, value) in upstream {
        if name == header::CONNECTION
            || name == header::TRANSFER_ENCODING
            || name == header::UPGRADE
        {
            continue;
        }
        response.headers_mut().append(name.clone(), value.clone());
    }
}

pub(crate) fn empty_response(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_catalog() {
        assert_eq!(parse_oci_path("_catalog"), Some(OciRoute::Catalog));
    }

    #[test]
    fn parses_tags_with_nested_name() {
        assert_eq!(
            parse_oci_path("library/alpine/tags/list"),
            Some(OciRoute::Tags {
                name: "library/alpine".to_string()
            })
        );
    }

    #[test]
    fn parses_manifest() {
        assert_eq!(
            parse_oci_path("library/alpine/manifests/latest"),
            Some(OciRoute::Manifest {
                name: "library/alpine".to_string(),
                tag: "latest".to_string()
            })
        );
    }

    #[test]
    fn parses_blob_by_digest() {
        assert_eq!(
            parse_oci_path("a/b/c/blobs/sha256:abcd"),
            Some(OciRoute::Blob {
                name: "a/b/c".to_string(),
                digest: "sha256:abcd".to_string()
            })
        );
    }

    #[test]
    fn parses_upload_routes() {
        assert_eq!(
            parse_oci_path("library/alpine/blobs/uploads/"),
            Some(OciRoute::BlobUploadStart {
                name: "library/alpine".to_string()
            })
        );
        assert_eq!(
            parse_oci_path("library/alpine/blobs/uploads/some-uuid"),
            Some(OciRoute::BlobUpload {
                name: "library/alpine".to_string(),
                uuid: "some-uuid".to_string()
            })
        );
    }

    #[test]
    fn rejects_unroutable_paths() {
        assert_eq!(parse_oci_path("library/alpine"), None);
        assert_eq!(parse_oci_path("/manifests/latest"), None);
        assert_eq!(parse_oci_path(""), None);
    }
}
