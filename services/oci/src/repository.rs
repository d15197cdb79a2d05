use axum::body::Body;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use observability::{cache, Metrics};
use repo::{
    CommonStorage, Digest, FileEntry, Instance, InstanceMeta, Locator, NameMatchers,
    RegistryError, RepoConfig, VersionMeta,
};
use sha2::{Digest as _, Sha256};
use tokio_util::io::{ReaderStream, StreamReader};
use upstream::UpstreamClient;

use crate::api::{copy_response_headers, empty_response};

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// One configured OCI repository: a storage engine, an upstream client and
/// the name mappings that route image names here.
pub struct OciRepository {
    config: RepoConfig,
    storage: CommonStorage,
    client: UpstreamClient,
    matchers: NameMatchers,
    metrics: Metrics,
}

impl Instance for OciRepository {
    fn match_weight(&self, name: &[&str]) -> usize {
        self.matchers.match_weight(name)
    }

    fn describe(&self) -> InstanceMeta {
        let label = if self.config.name.is_empty() {
            "containers".to_string()
        } else {
            self.config.name.clone()
        };
        let type_id = if self.config.kind == "container" {
            "containers".to_string()
        } else {
            self.config.kind.clone()
        };
        InstanceMeta {
            id: self.config.name.clone(),
            label,
            description: self.config.description.clone(),
            type_id,
        }
    }
}

impl OciRepository {
    pub fn new(
        storage: CommonStorage,
        config: &RepoConfig,
        metrics: Metrics,
    ) -> Result<Self, RegistryError> {
        let (repo_type, repo_name) = repo_labels(config);
        let client = UpstreamClient::new(&config.upstream, metrics.clone(), repo_type, repo_name)
            .map_err(|err| RegistryError::Repository(err.to_string()))?;
        Ok(OciRepository {
            config: config.clone(),
            storage,
            client,
            matchers: NameMatchers::new(&config.mappings),
            metrics,
        })
    }

    /// Tag listings are not cacheable; always proxy them.
    pub async fn handle_tags(
        &self,
        method: Method,
        name: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        request_id: Option<&str>,
    ) -> Response {
        let path = format!("/v2/{name}/tags/list");
        self.proxy_upstream(method, &path, query, headers, request_id)
            .await
    }

    /// Manifests are served from the upstream when it is healthy; a 2xx GET
    /// body is cached as a version keyed by the upstream host and labelled
    /// with the tag, so later failures fall back to the stored copy.
    pub async fn handle_manifest(
        &self,
        method: Method,
        name: &str,
        tag: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        request_id: Option<&str>,
    ) -> Response {
        let path = format!("/v2/{name}/manifests/{tag}");
        match self
            .client
            .round_trip(method.clone(), &path, query, headers, request_id)
            .await
        {
            Ok(response) if method == Method::GET && response.status().is_success() => {
                let status = response.status();
                let upstream_headers = response.headers().clone();
                match response.bytes().await {
                    Ok(body) => {
                        self.cache_manifest(name, tag, &upstream_headers, &body, request_id)
                            .await;
                        let mut response = Response::new(Body::from(body));
                        *response.status_mut() = status;
                        copy_response_headers(&mut response, &upstream_headers);
                        response
                    }
                    Err(error) => {
                        tracing::error!(%error, req_id = request_id.unwrap_or_default(), "failed to read upstream manifest");
                        match self.serve_cached_manifest(&method, name, tag).await {
                            Some(cached) => cached,
                            None => bad_gateway(),
                        }
                    }
                }
            }
            Ok(response) => {
                if let Some(cached) = self.serve_cached_manifest(&method, name, tag).await {
                    return cached;
                }
                forward_upstream(response, method == Method::HEAD)
            }
            Err(error) => {
                tracing::error!(%error, req_id = request_id.unwrap_or_default(), "failed to proxy manifest request to upstream");
                match self.serve_cached_manifest(&method, name, tag).await {
                    Some(cached) => cached,
                    None => bad_gateway(),
                }
            }
        }
    }

    /// Blob-by-digest: serve from the local store, otherwise fetch from the
    /// upstream and tee the bytes into storage while they stream to the
    /// client.
    pub async fn handle_blob(
        &self,
        method: Method,
        name: &str,
        digest: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        request_id: Option<&str>,
    ) -> Response {
        let path = format!("/v2/{name}/blobs/{digest}");
        let Ok(digest) = digest.parse::<Digest>() else {
            return self
                .proxy_upstream(method, &path, query, headers, request_id)
                .await;
        };
        if let Some(response) = self.serve_local_blob(&method, &digest).await {
            return response;
        }
        self.fetch_and_store_blob(method, &digest, &path, query, headers, request_id)
            .await
    }

    async fn proxy_upstream(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        request_id: Option<&str>,
    ) -> Response {
        match self
            .client
            .round_trip(method.clone(), path, query, headers, request_id)
            .await
        {
            Ok(response) => forward_upstream(response, method == Method::HEAD),
            Err(error) => {
                tracing::error!(%error, req_id = request_id.unwrap_or_default(), "failed to proxy request to upstream");
                bad_gateway()
            }
        }
    }

    async fn serve_local_blob(&self, method: &Method, digest: &Digest) -> Option<Response> {
        let (repo_type, repo_name) = repo_labels(&self.config);
        let reader = match self.storage.open_blob(digest).await {
            Ok(reader) => reader,
            Err(_) => {
                self.metrics
                    .record_cache_miss(repo_type, repo_name, cache::BLOBS);
                return None;
            }
        };
        self.metrics
            .record_cache_hit(repo_type, repo_name, cache::BLOBS);

        let mut response = empty_response(StatusCode::OK);
        if let Ok(stat) = self.storage.stat_blob(digest).await {
            if let Ok(value) = stat.size.to_string().parse() {
                response
                    .headers_mut()
                    .insert(header::CONTENT_LENGTH, value);
            }
            self.metrics
                .record_cache_bytes(repo_type, repo_name, cache::BLOBS, "serve", stat.size);
        }
        insert_str_header(&mut response, DOCKER_CONTENT_DIGEST, &digest.to_string());
        insert_str_header(&mut response, "content-type", "application/octet-stream");
        if method == Method::HEAD {
            return Some(response);
        }
        *response.body_mut() = Body::from_stream(ReaderStream::new(reader));
        Some(response)
    }

    async fn fetch_and_store_blob(
        &self,
        method: Method,
        digest: &Digest,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        request_id: Option<&str>,
    ) -> Response {
        let upstream_response = match self
            .client
            .round_trip(method.clone(), path, query, headers, request_id)
            .await
        {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(%error, req_id = request_id.unwrap_or_default(), "failed to proxy blob request");
                return bad_gateway();
            }
        };

        let status = upstream_response.status();
        let mut response = empty_response(status);
        copy_response_headers(&mut response, upstream_response.headers());
        insert_str_header(&mut response, DOCKER_CONTENT_DIGEST, &digest.to_string());

        if method == Method::HEAD {
            return response;
        }
        if status != StatusCode::OK {
            *response.body_mut() = Body::from_stream(upstream_response.bytes_stream());
            return response;
        }

        *response.body_mut() =
            self.tee_to_storage(digest.clone(), upstream_response, request_id);
        response
    }

    /// Stream the upstream body to the client while writing it into the
    /// blob store. The client side losing interest aborts the store-side
    /// writer so no partial blob becomes visible; the store side finishing
    /// early (the blob already exists) never stalls the client.
    fn tee_to_storage(
        &self,
        digest: Digest,
        upstream_response: reqwest::Response,
        request_id: Option<&str>,
    ) -> Body {
        let (mut client_tx, client_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);
        let (mut store_tx, store_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);

        tokio::spawn(async move {
            let mut stream = upstream_response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if client_tx.send(Ok(bytes.clone())).await.is_err() {
                            let _ = store_tx
                                .send(Err(std::io::Error::new(
                                    std::io::ErrorKind::BrokenPipe,
                                    "client disconnected",
                                )))
                                .await;
                            break;
                        }
                        // a closed store side means the blob already exists
                        let _ = store_tx.send(Ok(bytes)).await;
                    }
                    Err(error) => {
                        let message = error.to_string();
                        let _ = store_tx.send(Err(std::io::Error::other(message.clone()))).await;
                        let _ = client_tx.send(Err(std::io::Error::other(message))).await;
                        break;
                    }
                }
            }
        });

        let storage = self.storage.clone();
        let metrics = self.metrics.clone();
        let (repo_type, repo_name) = repo_labels(&self.config);
        let (repo_type, repo_name) = (repo_type.to_string(), repo_name.to_string());
        let request_id = request_id.unwrap_or_default().to_string();
        tokio::spawn(async move {
            let mut reader = StreamReader::new(store_rx);
            match storage.put_blob(&digest, &mut reader).await {
                Ok(written) => {
                    metrics.record_cache_bytes(
                        &repo_type,
                        &repo_name,
                        cache::BLOBS,
                        "store",
                        written,
                    );
                }
                Err(error) => {
                    tracing::error!(%error, req_id = %request_id, blob = %digest, "failed to store blob");
                    metrics.record_cache_error(&repo_type, &repo_name, cache::BLOBS);
                }
            }
        });

        Body::from_stream(client_rx)
    }

    async fn cache_manifest(
        &self,
        name: &str,
        tag: &str,
        upstream_headers: &HeaderMap,
        body: &Bytes,
        request_id: Option<&str>,
    ) {
        if body.is_empty() {
            return;
        }
        let (repo_type, repo_name) = repo_labels(&self.config);
        let digest = upstream_headers
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<Digest>().ok());
        let digest = match digest {
            Some(digest) => digest,
            None => {
                let computed = format!("sha256:{}", hex::encode(Sha256::digest(body)));
                match computed.parse::<Digest>() {
                    Ok(digest) => digest,
                    Err(_) => return,
                }
            }
        };
        let media_type = upstream_headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let mut reader: &[u8] = body;
        if let Err(error) = self.storage.put_blob(&digest, &mut reader).await {
            tracing::error!(%error, req_id = request_id.unwrap_or_default(), "failed to store manifest blob");
            self.metrics
                .record_cache_error(repo_type, repo_name, cache::MANIFESTS);
            return;
        }
        self.metrics.record_cache_bytes(
            repo_type,
            repo_name,
            cache::MANIFESTS,
            "store",
            body.len() as u64,
        );

        let loc = Locator::new(self.client.upstream_host(), name)
            .with_version_id(digest.to_string());
        let meta = VersionMeta {
            version_id: digest.to_string(),
            files: vec![FileEntry {
                name: tag.to_string(),
                blob_key: digest.to_string(),
                size: body.len() as u64,
                media_type,
            }],
            manifest: Some(String::from_utf8_lossy(body).into_owned()),
            ..VersionMeta::default()
        };
        let loc = match self.storage.create_version(loc, meta).await {
            Ok(loc) => loc,
            Err(error) => {
                tracing::error!(%error, req_id = request_id.unwrap_or_default(), "failed to record manifest version");
                self.metrics
                    .record_cache_error(repo_type, repo_name, cache::MANIFESTS);
                return;
            }
        };
        let loc = loc.with_label(tag).with_version_id(digest.to_string());
        if let Err(error) = self.storage.set_label(&loc).await {
            tracing::error!(%error, req_id = request_id.unwrap_or_default(), "failed to bind manifest tag");
            self.metrics
                .record_cache_error(repo_type, repo_name, cache::MANIFESTS);
        }
    }

    async fn serve_cached_manifest(
        &self,
        method: &Method,
        name: &str,
        tag: &str,
    ) -> Option<Response> {
        if name.is_empty() || tag.is_empty() {
            return None;
        }
        let (repo_type, repo_name) = repo_labels(&self.config);
        let loc = Locator::new(self.client.upstream_host(), name).with_label(tag);
        let loc = match self.storage.resolve_label(loc).await {
            Ok(loc) => loc,
            Err(_) => {
                self.metrics
                    .record_cache_miss(repo_type, repo_name, cache::MANIFESTS);
                return None;
            }
        };
        let meta = match self.storage.get_version_meta(&loc).await {
            Ok(meta) if !meta.files.is_empty() => meta,
            _ => {
                self.metrics
                    .record_cache_error(repo_type, repo_name, cache::MANIFESTS);
                return None;
            }
        };
        let file = meta.files[0].clone();
        let manifest = match meta.manifest.filter(|manifest| !manifest.is_empty()) {
            Some(manifest) => manifest.into_bytes(),
            None => match self.read_manifest_blob(&file.blob_key).await {
                Some(manifest) => manifest,
                None => {
                    self.metrics
                        .record_cache_error(repo_type, repo_name, cache::MANIFESTS);
                    return None;
                }
            },
        };

        let mut response = empty_response(StatusCode::OK);
        if let Ok(value) = manifest.len().to_string().parse() {
            response.headers_mut().insert(header::CONTENT_LENGTH, value);
        }
        let media_type = if file.media_type.is_empty() {
            "application/octet-stream"
        } else {
            &file.media_type
        };
        insert_str_header(&mut response, "content-type", media_type);
        if !file.blob_key.is_empty() {
            insert_str_header(&mut response, DOCKER_CONTENT_DIGEST, &file.blob_key);
        }
        if method == Method::HEAD {
            self.metrics
                .record_cache_hit(repo_type, repo_name, cache::MANIFESTS);
            return Some(response);
        }
        self.metrics.record_cache_bytes(
            repo_type,
            repo_name,
            cache::MANIFESTS,
            "serve",
            manifest.len() as u64,
        );
        self.metrics
            .record_cache_hit(repo_type, repo_name, cache::MANIFESTS);
        *response.body_mut() = Body::from(manifest);
        Some(response)
    }

    async fn read_manifest_blob(&self, blob_key: &str) -> Option<Vec<u8>> {
        use tokio::io::AsyncReadExt;

        let digest: Digest = blob_key.parse().ok()?;
        let mut reader = self.storage.open_blob(&digest).await.ok()?;
        let mut manifest = Vec::new();
        reader.read_to_end(&mut manifest).await.ok()?;
        Some(manifest)
    }
}

fn repo_labels(config: &RepoConfig) -> (&str, &str) {
    let repo_type = if config.kind.is_empty() {
        "container"
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

fn insert_str_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = value.parse() {
        response
            .headers_mut()
            .insert(axum::http::HeaderName::from_static(name), value);
    }
}

fn forward_upstream(upstream_response: reqwest::Response, omit_body: bool) -> Response {
    let status = upstream_response.status();
    let mut response = empty_response(status);
    copy_response_headers(&mut response, upstream_response.headers());
    if !omit_body {
        *response.body_mut() = Body::from_stream(upstream_response.bytes_stream());
    }
    response
}

fn bad_gateway() -> Response {
    empty_response(StatusCode::BAD_GATEWAY)
}
