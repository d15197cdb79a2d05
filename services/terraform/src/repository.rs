use axum::body::Body;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use observability::{cache, Metrics};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use repo::{CommonStorage, Instance, InstanceMeta, NameMatchers, RegistryError, RepoConfig};
use serde_json::{Map, Value};
use tokio_util::io::{ReaderStream, StreamReader};
use upstream::{UpstreamClient, UpstreamError};

use crate::api::{detect_scheme, request_host};

/// Escapes a filename for use as a URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

#[derive(Debug, thiserror::Error)]
enum TerraformError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Store(#[from] repo::StoreError),

    #[error("decode upstream metadata: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("read upstream body: {0}")]
    Read(#[source] reqwest::Error),

    #[error("read cached metadata: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing filename in upstream response")]
    MissingFilename,

    #[error("missing upstream download url")]
    MissingDownloadUrl,

    #[error("failed to fetch from upstream: {0}")]
    UpstreamStatus(StatusCode),
}

/// One provider download request, parsed from the route tail.
#[derive(Debug, Clone)]
struct DownloadRequest {
    namespace: String,
    name: String,
    version: String,
    os: String,
    arch: String,
    filename: String,
    is_archive: bool,
}

/// Parse `download/<os>/<arch>` (metadata) or
/// `download/<os>/<arch>/archive/<filename>` (archive bytes).
fn parse_download_tail(
    namespace: &str,
    name: &str,
    version: &str,
    tail: &str,
) -> Result<DownloadRequest, &'static str> {
    let tail = tail.trim_matches('/');
    if tail.is_empty() {
        return Err("invalid download path");
    }
    let parts: Vec<&str> = tail.split('/').collect();
    if parts.len() < 3 || parts[0] != "download" {
        return Err("invalid download path");
    }
    let mut request = DownloadRequest {
        namespace: namespace.to_string(),
        name: name.to_string(),
        version: version.to_string(),
        os: parts[1].to_string(),
        arch: parts[2].to_string(),
        filename: String::new(),
        is_archive: false,
    };
    if request.os.is_empty() || request.arch.is_empty() {
        return Err("missing platform details");
    }
    if parts.len() == 3 {
        return Ok(request);
    }
    if parts[3] != "archive" {
        return Err("unsupported download path");
    }
    request.is_archive = true;
    if parts.len() > 4 {
        request.filename = parts[4..].join("/");
    }
    Ok(request)
}

/// One configured Terraform/OpenTofu repository.
pub struct TerraformRepository {
    config: RepoConfig,
    storage: CommonStorage,
    client: UpstreamClient,
    matchers: NameMatchers,
    metrics: Metrics,
}

impl Instance for TerraformRepository {
    fn match_weight(&self, name: &[&str]) -> usize {
        self.matchers.match_weight(name)
    }

    fn describe(&self) -> InstanceMeta {
        let label = if self.config.name.is_empty() {
            "terraform".to_string()
        } else {
            self.config.name.clone()
        };
        InstanceMeta {
            id: self.config.name.clone(),
            label,
            description: self.config.description.clone(),
            type_id: self.config.kind.clone(),
        }
    }
}

impl TerraformRepository {
    pub fn new(
        storage: CommonStorage,
        config: &RepoConfig,
        metrics: Metrics,
    ) -> Result<Self, RegistryError> {
        let (repo_type, repo_name) = repo_labels(config);
        let client = UpstreamClient::new(&config.upstream, metrics.clone(), repo_type, repo_name)
            .map_err(|err| RegistryError::Repository(err.to_string()))?;
        Ok(TerraformRepository {
            config: config.clone(),
            storage,
            client,
            matchers: NameMatchers::new(&config.mappings),
            metrics,
        })
    }

    pub async fn handle_version_list(
        &self,
        namespace: &str,
        name: &str,
        headers: &HeaderMap,
        request_id: Option<&str>,
    ) -> Response {
        if namespace.is_empty() || name.is_empty() {
            return (StatusCode::BAD_REQUEST, "missing namespace or name").into_response();
        }
        let rel = format!("providers/{namespace}/{name}/versions.json");
        if let Some(response) = self.serve_cached_json(&rel).await {
            return response;
        }
        let path = format!("/v1/providers/{namespace}/{name}/versions");
        match self
            .fetch_and_store_json(&rel, &path, headers, request_id)
            .await
        {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(%error, req_id = request_id.unwrap_or_default(), "failed to fetch terraform version list");
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }

    pub async fn handle_version(
        &self,
        namespace: &str,
        name: &str,
        version: &str,
        headers: &HeaderMap,
        request_id: Option<&str>,
    ) -> Response {
        if version.is_empty() {
            return (StatusCode::BAD_REQUEST, "missing version").into_response();
        }
        let rel = format!("providers/{namespace}/{name}/{version}.json");
        if let Some(response) = self.serve_cached_json(&rel).await {
            return response;
        }
        let path = format!("/v1/providers/{namespace}/{name}/{version}");
        match self
            .fetch_and_store_json(&rel, &path, headers, request_id)
            .await
        {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(%error, req_id = request_id.unwrap_or_default(), "failed to fetch terraform manifest");
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }

    pub async fn handle_download(
        &self,
        namespace: &str,
        name: &str,
        version: &str,
        tail: &str,
        headers: &HeaderMap,
        request_id: Option<&str>,
    ) -> Response {
        let request = match parse_download_tail(namespace, name, version, tail) {
            Ok(request) => request,
            Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
        };
        if request.is_archive {
            match self.serve_package_archive(&request, request_id).await {
                Ok(response) => response,
                Err(error) => {
                    tracing::error!(%error, req_id = request_id.unwrap_or_default(), "failed to serve terraform provider archive");
                    (StatusCode::BAD_GATEWAY, "failed to download provider").into_response()
                }
            }
        } else {
            if let Some(response) = self
                .serve_cached_download_metadata(&request, headers, request_id)
                .await
            {
                return response;
            }
            match self
                .fetch_download_metadata(&request, headers, request_id)
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    tracing::error!(%error, req_id = request_id.unwrap_or_default(), "failed to build terraform download metadata");
                    (StatusCode::BAD_GATEWAY, "failed to prepare download metadata")
                        .into_response()
                }
            }
        }
    }

    async fn serve_cached_json(&self, rel: &str) -> Option<Response> {
        let (repo_type, repo_name) = repo_labels(&self.config);
        let reader = match self.storage.open_file(rel).await {
            Ok(reader) => reader,
            Err(_) => {
                self.metrics
                    .record_cache_miss(repo_type, repo_name, cache::REFS);
                return None;
            }
        };
        let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
        if let Ok(stat) = self.storage.stat_file(rel).await {
            if let Ok(value) = stat.size.to_string().parse() {
                response.headers_mut().insert(header::CONTENT_LENGTH, value);
            }
            self.metrics
                .record_cache_bytes(repo_type, repo_name, cache::REFS, "serve", stat.size);
        }
        self.metrics
            .record_cache_hit(repo_type, repo_name, cache::REFS);
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/json"),
        );
        Some(response)
    }

    /// Proxy a metadata document and persist 200-responses to the refs
    /// cache on the way through.
    async fn fetch_and_store_json(
        &self,
        rel: &str,
        path: &str,
        headers: &HeaderMap,
        request_id: Option<&str>,
    ) -> Result<Response, TerraformError> {
        let (repo_type, repo_name) = repo_labels(&self.config);
        let upstream_response = self
            .client
            .round_trip(Method::GET, path, None, headers, request_id)
            .await?;
        let status = upstream_response.status();
        let upstream_headers = upstream_response.headers().clone();
        let body = upstream_response
            .bytes()
            .await
            .map_err(TerraformError::Read)?;

        if status == StatusCode::OK && !body.is_empty() {
            let mut reader: &[u8] = &body;
            match self.storage.store_file(rel, &mut reader).await {
                Ok(written) => {
                    self.metrics
                        .record_cache_bytes(repo_type, repo_name, cache::REFS, "store", written);
                }
                Err(error) => {
                    tracing::error!(%error, path = rel, "failed to persist terraform metadata");
                    self.metrics
                        .record_cache_error(repo_type, repo_name, cache::REFS);
                }
            }
        }

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        for (name, value) in &upstream_headers {
            if name == header::CONNECTION || name == header::TRANSFER_ENCODING {
                continue;
            }
            response.headers_mut().append(name.clone(), value.clone());
        }
        Ok(response)
    }

    async fn serve_cached_download_metadata(
        &self,
        request: &DownloadRequest,
        headers: &HeaderMap,
        request_id: Option<&str>,
    ) -> Option<Response> {
        let (repo_type, repo_name) = repo_labels(&self.config);
        let payload = match self.cached_download_metadata(request).await {
            Ok(payload) => payload,
            Err(_) => {
                self.metrics
                    .record_cache_miss(repo_type, repo_name, cache::REFS);
                return None;
            }
        };
        let filename = match self.resolve_download_filename(request, &payload) {
            Ok(filename) => filename,
            Err(error) => {
                tracing::warn!(%error, "cached metadata missing filename");
                return None;
            }
        };
        if let Err(error) = self
            .ensure_package_cached_from_metadata(request, &filename, &payload, request_id)
            .await
        {
            tracing::error!(%error, req_id = request_id.unwrap_or_default(), "failed to ensure terraform package from cache");
            return None;
        }
        match self.download_metadata_response(payload, request, &filename, headers) {
            Ok((response, written)) => {
                self.metrics
                    .record_cache_hit(repo_type, repo_name, cache::REFS);
                self.metrics.record_cache_bytes(
                    repo_type,
                    repo_name,
                    cache::REFS,
                    "serve",
                    written,
                );
                Some(response)
            }
            Err(error) => {
                tracing::error!(%error, "failed to render cached metadata response");
                self.metrics
                    .record_cache_error(repo_type, repo_name, cache::REFS);
                None
            }
        }
    }

    async fn fetch_download_metadata(
        &self,
        request: &DownloadRequest,
        headers: &HeaderMap,
        request_id: Option<&str>,
    ) -> Result<Response, TerraformError> {
        let path = self.download_metadata_path(request);
        let upstream_response = self
            .client
            .round_trip(Method::GET, &path, None, headers, request_id)
            .await?;
        let status = upstream_response.status();
        if status != StatusCode::OK {
            let upstream_headers = upstream_response.headers().clone();
            let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
            *response.status_mut() = status;
            for (name, value) in &upstream_headers {
                if name == header::CONNECTION || name == header::TRANSFER_ENCODING {
                    continue;
                }
                response.headers_mut().append(name.clone(), value.clone());
            }
            return Ok(response);
        }
        let body = upstream_response
            .bytes()
            .await
            .map_err(TerraformError::Read)?;
        let payload: Map<String, Value> = serde_json::from_slice(&body)?;
        let filename = self.resolve_download_filename(request, &payload)?;
        self.ensure_package_cached_from_metadata(request, &filename, &payload, request_id)
            .await?;
        self.store_download_metadata(request, &body).await;
        let (response, _) = self.download_metadata_response(payload, request, &filename, headers)?;
        Ok(response)
    }

    async fn serve_package_archive(
        &self,
        request: &DownloadRequest,
        request_id: Option<&str>,
    ) -> Result<Response, TerraformError> {
        let filename = basename(&request.filename);
        if filename.is_empty() || filename == "." {
            return Err(TerraformError::MissingFilename);
        }
        self.ensure_package_presence(request, &filename, request_id)
            .await?;

        let (repo_type, repo_name) = repo_labels(&self.config);
        let rel = self.package_rel_path(request, &filename);
        let reader = match self.storage.open_file(&rel).await {
            Ok(reader) => reader,
            Err(err) => {
                self.metrics
                    .record_cache_miss(repo_type, repo_name, cache::PACKAGES);
                return Err(err.into());
            }
        };
        self.metrics
            .record_cache_hit(repo_type, repo_name, cache::PACKAGES);

        let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
        if let Ok(stat) = self.storage.stat_file(&rel).await {
            if let Ok(value) = stat.size.to_string().parse() {
                response.headers_mut().insert(header::CONTENT_LENGTH, value);
            }
            self.metrics.record_cache_bytes(
                repo_type,
                repo_name,
                cache::PACKAGES,
                "serve",
                stat.size,
            );
        }
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/zip"),
        );
        if let Ok(value) = format!("attachment; filename=\"{filename}\"").parse() {
            response
                .headers_mut()
                .insert(header::CONTENT_DISPOSITION, value);
        }
        Ok(response)
    }

    /// Make sure the package archive is present, re-deriving the upstream
    /// `download_url` from cached or freshly-fetched metadata when needed.
    async fn ensure_package_presence(
        &self,
        request: &DownloadRequest,
        filename: &str,
        request_id: Option<&str>,
    ) -> Result<(), TerraformError> {
        let rel = self.package_rel_path(request, filename);
        if self.storage.stat_file(&rel).await.is_ok() {
            return Ok(());
        }
        let payload = match self.cached_download_metadata(request).await {
            Ok(payload) => payload,
            Err(_) => self.fetch_download_metadata_map(request, request_id).await?,
        };
        self.ensure_package_cached_from_metadata(request, filename, &payload, request_id)
            .await
    }

    async fn ensure_package_cached_from_metadata(
        &self,
        request: &DownloadRequest,
        filename: &str,
        payload: &Map<String, Value>,
        request_id: Option<&str>,
    ) -> Result<(), TerraformError> {
        let source_url = string_field(payload, "download_url");
        let mut resolved = filename.to_string();
        if resolved.is_empty() {
            resolved = string_field(payload, "filename");
            if resolved.is_empty() {
                resolved = basename(&source_url).to_string();
            }
        }
        if resolved.is_empty() {
            return Err(TerraformError::MissingFilename);
        }
        self.ensure_package_cached(request, &resolved, &source_url, request_id)
            .await
    }

    async fn ensure_package_cached(
        &self,
        request: &DownloadRequest,
        filename: &str,
        source_url: &str,
        request_id: Option<&str>,
    ) -> Result<(), TerraformError> {
        let rel = self.package_rel_path(request, filename);
        if self.storage.stat_file(&rel).await.is_ok() {
            return Ok(());
        }
        let (repo_type, repo_name) = repo_labels(&self.config);
        self.metrics
            .record_cache_miss(repo_type, repo_name, cache::PACKAGES);
        if source_url.is_empty() {
            return Err(TerraformError::MissingDownloadUrl);
        }
        let upstream_response = self.client.fetch(source_url, request_id).await?;
        if upstream_response.status() != StatusCode::OK {
            return Err(TerraformError::UpstreamStatus(upstream_response.status()));
        }
        let stream = upstream_response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let mut reader = StreamReader::new(stream);
        match self.storage.store_file(&rel, &mut reader).await {
            Ok(written) => {
                self.metrics.record_cache_bytes(
                    repo_type,
                    repo_name,
                    cache::PACKAGES,
                    "store",
                    written,
                );
                Ok(())
            }
            Err(err) => {
                self.metrics
                    .record_cache_error(repo_type, repo_name, cache::PACKAGES);
                Err(err.into())
            }
        }
    }

    async fn fetch_download_metadata_map(
        &self,
        request: &DownloadRequest,
        request_id: Option<&str>,
    ) -> Result<Map<String, Value>, TerraformError> {
        let path = self.download_metadata_path(request);
        let upstream_response = self
            .client
            .round_trip(Method::GET, &path, None, &HeaderMap::new(), request_id)
            .await?;
        if upstream_response.status() != StatusCode::OK {
            return Err(TerraformError::UpstreamStatus(upstream_response.status()));
        }
        let body = upstream_response
            .bytes()
            .await
            .map_err(TerraformError::Read)?;
        self.store_download_metadata(request, &body).await;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn cached_download_metadata(
        &self,
        request: &DownloadRequest,
    ) -> Result<Map<String, Value>, TerraformError> {
        use tokio::io::AsyncReadExt;

        let rel = self.download_metadata_rel_path(request);
        let mut reader = self.storage.open_file(&rel).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(serde_json::from_slice(&buf)?)
    }

    async fn store_download_metadata(&self, request: &DownloadRequest, body: &Bytes) {
        if body.is_empty() {
            return;
        }
        let (repo_type, repo_name) = repo_labels(&self.config);
        let rel = self.download_metadata_rel_path(request);
        let mut reader: &[u8] = body;
        match self.storage.store_file(&rel, &mut reader).await {
            Ok(written) => {
                self.metrics
                    .record_cache_bytes(repo_type, repo_name, cache::REFS, "store", written);
            }
            Err(error) => {
                tracing::error!(%error, path = %rel, "failed to store terraform download metadata");
                self.metrics
                    .record_cache_error(repo_type, repo_name, cache::REFS);
            }
        }
    }

    fn resolve_download_filename(
        &self,
        request: &DownloadRequest,
        payload: &Map<String, Value>,
    ) -> Result<String, TerraformError> {
        let mut filename = request.filename.clone();
        if filename.is_empty() {
            filename = string_field(payload, "filename");
        }
        if filename.is_empty() {
            filename = basename(&string_field(payload, "download_url")).to_string();
        }
        if filename.is_empty() {
            return Err(TerraformError::MissingFilename);
        }
        Ok(filename)
    }

    /// Rewrite the payload's `download_url` to this proxy's archive route
    /// and emit it as the metadata response.
    fn download_metadata_response(
        &self,
        mut payload: Map<String, Value>,
        request: &DownloadRequest,
        filename: &str,
        headers: &HeaderMap,
    ) -> Result<(Response, u64), TerraformError> {
        let escaped = utf8_percent_encode(filename, PATH_SEGMENT).to_string();
        let local_url = format!(
            "{}://{}/v1/providers/{}/{}/{}/download/{}/{}/archive/{}",
            detect_scheme(headers),
            request_host(headers),
            request.namespace,
            request.name,
            request.version,
            request.os,
            request.arch,
            escaped,
        );
        payload.insert("download_url".to_string(), Value::String(local_url));
        let body = serde_json::to_vec(&payload)?;
        let written = body.len() as u64;
        let mut response = Response::new(Body::from(body));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/json"),
        );
        Ok((response, written))
    }

    fn download_metadata_path(&self, request: &DownloadRequest) -> String {
        format!(
            "/v1/providers/{}/{}/{}/download/{}/{}",
            request.namespace, request.name, request.version, request.os, request.arch
        )
    }

    fn download_metadata_rel_path(&self, request: &DownloadRequest) -> String {
        format!(
            "providers/{}/{}/{}/download/{}/{}.json",
            request.namespace, request.name, request.version, request.os, request.arch
        )
    }

    fn package_rel_path(&self, request: &DownloadRequest, filename: &str) -> String {
        let mut safe = basename(filename);
        if safe.is_empty() || safe == "." {
            safe = "package.zip";
        }
        format!(
            "providers/{}/{}/{}/{}/{}/{}",
            request.namespace, request.name, request.version, request.os, request.arch, safe
        )
    }
}

fn repo_labels(config: &RepoConfig) -> (&str, &str) {
    let repo_type = if config.kind.is_empty() {
        "terraform"
    } else {
        &config.kind
    };
    let repo_name = if config.name.is_empty() {
        "default"
    } else {
        &config.name
    };
    (repo_type, repo_name)
}

fn basename(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

fn string_field(payload: &Map<String, Value>, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_metadata_tail() {
        let request = parse_download_tail("hashicorp", "aws", "1.2.3", "download/linux/amd64")
            .unwrap();
        assert_eq!(request.os, "linux");
        assert_eq!(request.arch, "amd64");
        assert!(!request.is_archive);
        assert!(request.filename.is_empty());
    }

    #[test]
    fn parses_archive_tail() {
        let request = parse_download_tail(
            "hashicorp",
            "aws",
            "1.2.3",
            "download/linux/amd64/archive/terraform-provider-aws_1.2.3_linux_amd64.zip",
        )
        .unwrap();
        assert!(request.is_archive);
        assert_eq!(
            request.filename,
            "terraform-provider-aws_1.2.3_linux_amd64.zip"
        );
    }

    #[test]
    fn rejects_bad_tails() {
        assert!(parse_download_tail("ns", "n", "v", "").is_err());
        assert!(parse_download_tail("ns", "n", "v", "download/linux").is_err());
        assert!(parse_download_tail("ns", "n", "v", "upload/linux/amd64").is_err());
        assert!(parse_download_tail("ns", "n", "v", "download/linux/amd64/tarball/x").is_err());
    }

    #[test]
    fn basename_strips_directories() {
        assert_eq!(basename("https://host/path/pkg.zip"), "pkg.zip");
        assert_eq!(basename("pkg.zip"), "pkg.zip");
        assert_eq!(basename(""), "");
    }

    #[test]
    fn filename_survives_escaping() {
        let name = "terraform-provider-aws_1.2.3_linux_amd64.zip";
        assert_eq!(utf8_percent_encode(name, PATH_SEGMENT).to_string(), name);
        assert_eq!(
            utf8_percent_encode("has space.zip", PATH_SEGMENT).to_string(),
            "has%20space.zip"
        );
    }
}
