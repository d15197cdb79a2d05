//! Integration tests for the Terraform front-end: a mock upstream provider
//! registry behind the real router, storage held in memory.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use observability::Metrics;
use repo::{CommonStorage, RepoConfig, RepositoryType};
use storage::{Fs, MemoryStorage};
use terraform::TerraformType;
use tower::ServiceExt;

struct TestProxy {
    router: axum::Router,
    storage: CommonStorage,
}

fn repo_config(upstream_url: &str) -> RepoConfig {
    serde_json::from_value(serde_json::json!({
        "name": "tf-mirror",
        "type": "terraform",
        "upstream": { "url": upstream_url },
        "mappings": ["hashicorp/*"],
    }))
    .unwrap()
}

fn test_proxy(upstream_url: &str) -> TestProxy {
    let metrics = Metrics::new();
    let factory = TerraformType::new(metrics.clone());
    let storage = CommonStorage::with_labels(
        Fs::new(MemoryStorage::new()),
        metrics.clone(),
        "terraform",
        "tf-mirror",
    );
    let instance = factory
        .new_repository(storage.clone(), &repo_config(upstream_url))
        .unwrap();
    assert_eq!(instance.describe().label, "tf-mirror");
    assert_eq!(instance.describe().type_id, "terraform");
    TestProxy {
        router: factory.routes(),
        storage,
    }
}

async fn send(
    router: &axum::Router,
    request: Request<Body>,
) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body.to_vec())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::HOST, "proxy.test")
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn well_known_points_at_the_proxy() {
    let proxy = test_proxy("http://127.0.0.1:1");
    let (status, _, body) = send(&proxy.router, get("/.well-known/terraform.json")).await;
    assert_eq!(status, StatusCode::OK);
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        value["providers.v1"],
        "http://proxy.test/v1/providers/"
    );
}

#[tokio::test]
async fn well_known_honors_forwarded_proto() {
    let proxy = test_proxy("http://127.0.0.1:1");
    let request = Request::builder()
        .uri("/.well-known/terraform.json")
        .header(header::HOST, "proxy.test")
        .header("x-forwarded-proto", "https, http")
        .body(Body::empty())
        .unwrap();
    let (_, _, body) = send(&proxy.router, request).await;
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        value["providers.v1"],
        "https://proxy.test/v1/providers/"
    );
}

#[tokio::test]
async fn unmatched_namespace_is_not_found() {
    let proxy = test_proxy("http://127.0.0.1:1");
    let (status, _, _) = send(&proxy.router, get("/v1/providers/other/aws/versions")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn version_manifest_is_cached_after_first_fetch() {
    let mut server = mockito::Server::new_async().await;
    let upstream = server
        .mock("GET", "/v1/providers/hashicorp/aws/1.2.3")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"version":"1.2.3"}"#)
        .expect(1)
        .create_async()
        .await;

    let proxy = test_proxy(&server.url());

    let (status, _, body) = send(&proxy.router, get("/v1/providers/hashicorp/aws/1.2.3")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, br#"{"version":"1.2.3"}"#);

    // second request is served from the refs cache
    let (status, headers, body) =
        send(&proxy.router, get("/v1/providers/hashicorp/aws/1.2.3")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, br#"{"version":"1.2.3"}"#);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );

    // and the document landed in the repository's storage tree
    assert!(proxy
        .storage
        .stat_file("providers/hashicorp/aws/1.2.3.json")
        .await
        .is_ok());

    upstream.assert_async().await;
}

#[tokio::test]
async fn version_list_is_cached_after_first_fetch() {
    let mut server = mockito::Server::new_async().await;
    let upstream = server
        .mock("GET", "/v1/providers/hashicorp/aws/versions")
        .with_status(200)
        .with_body(r#"{"versions":[{"version":"1.2.3"}]}"#)
        .expect(1)
        .create_async()
        .await;

    let proxy = test_proxy(&server.url());
    for _ in 0..2 {
        let (status, _, body) =
            send(&proxy.router, get("/v1/providers/hashicorp/aws/versions")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8_lossy(&body).contains("1.2.3"));
    }
    assert!(proxy
        .storage
        .stat_file("providers/hashicorp/aws/versions.json")
        .await
        .is_ok());
    upstream.assert_async().await;
}

#[tokio::test]
async fn download_metadata_is_rewritten_and_archive_served_from_cache() {
    let mut server = mockito::Server::new_async().await;
    let archive_bytes = b"PK\x03\x04 pretend zip";
    let filename = "terraform-provider-aws_1.2.3_linux_amd64.zip";

    let metadata = server
        .mock(
            "GET",
            "/v1/providers/hashicorp/aws/1.2.3/download/linux/amd64",
        )
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(format!(
            r#"{{"download_url":"{}/pkg.zip","filename":"{filename}","os":"linux","arch":"amd64"}}"#,
            server.url()
        ))
        .expect(1)
        .create_async()
        .await;
    let package = server
        .mock("GET", "/pkg.zip")
        .with_status(200)
        .with_body(archive_bytes.as_slice())
        .expect(1)
        .create_async()
        .await;

    let proxy = test_proxy(&server.url());

    let (status, _, body) = send(
        &proxy.router,
        get("/v1/providers/hashicorp/aws/1.2.3/download/linux/amd64"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        value["download_url"],
        format!(
            "http://proxy.test/v1/providers/hashicorp/aws/1.2.3/download/linux/amd64/archive/{filename}"
        )
    );
    // untouched fields survive the rewrite
    assert_eq!(value["os"], "linux");

    // the archive now streams from the cache without another upstream hit
    let archive_uri = format!(
        "/v1/providers/hashicorp/aws/1.2.3/download/linux/amd64/archive/{filename}"
    );
    let (status, headers, body) = send(&proxy.router, get(&archive_uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, archive_bytes);
    assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/zip");
    assert_eq!(
        headers.get(header::CONTENT_DISPOSITION).unwrap(),
        format!("attachment; filename=\"{filename}\"").as_str()
    );
    assert_eq!(
        headers.get(header::CONTENT_LENGTH).unwrap(),
        archive_bytes.len().to_string().as_str()
    );

    // cached metadata serves the second metadata request too
    let (status, _, body) = send(
        &proxy.router,
        get("/v1/providers/hashicorp/aws/1.2.3/download/linux/amd64"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(value["download_url"]
        .as_str()
        .unwrap()
        .starts_with("http://proxy.test/"));

    metadata.assert_async().await;
    package.assert_async().await;
}

#[tokio::test]
async fn malformed_download_paths_are_rejected() {
    let proxy = test_proxy("http://127.0.0.1:1");
    for uri in [
        "/v1/providers/hashicorp/aws/1.2.3/download/linux",
        "/v1/providers/hashicorp/aws/1.2.3/upload/linux/amd64",
        "/v1/providers/hashicorp/aws/1.2.3/download/linux/amd64/tarball/x",
    ] {
        let (status, _, _) = send(&proxy.router, get(uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn upstream_failure_is_bad_gateway() {
    let proxy = test_proxy("http://127.0.0.1:1");
    let (status, _, _) = send(&proxy.router, get("/v1/providers/hashicorp/aws/versions")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}
