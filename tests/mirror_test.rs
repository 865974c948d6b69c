//! End-to-end mirror fetch scenarios against seeded in-process registries.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Router as AxumRouter,
};
use bytes::Bytes;
use mirrormesh::httpx::CONTENT_TYPE_BINARY;
use mirrormesh::oci::{
    write_descriptor_to_header, Client, Descriptor, Digest, DistributionKind, DistributionPath,
    FetchOptions, Image, MEDIA_TYPE_OCI_MANIFEST,
};
use mirrormesh::routing::MemoryRouter;
use mirrormesh::Error;

const MANIFEST_DIGEST: &str =
    "sha256:b6d6089ca6c395fd563c2084f5dd7bc56a2f5e6a81413558c5be0083287a77e9";
const CONFIG_DIGEST: &str =
    "sha256:68b8a989a3e08ddbdb3a0077d35c0d0e59c9ecf23d0634584def8bdbb7d6824f";
const LAYER_DIGEST: &str =
    "sha256:3caa2469de2a23cbcc209dd0b9d01cd78ff9a0f88741655991d36baede5b0996";

/// Registry content keyed by the reference component of the request path.
#[derive(Default)]
struct SeededRegistry {
    manifests: HashMap<String, (Descriptor, Bytes)>,
    blobs: HashMap<String, (Descriptor, Bytes)>,
}

impl SeededRegistry {
    /// One image manifest under `latest`, referencing a config and a layer.
    fn with_test_image() -> Self {
        let manifest_data = Bytes::from(
            serde_json::json!({
                "mediaType": MEDIA_TYPE_OCI_MANIFEST,
                "config": {
                    "mediaType": "application/vnd.oci.image.config.v1+json",
                    "digest": CONFIG_DIGEST,
                    "size": 529,
                },
                "layers": [{
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": LAYER_DIGEST,
                    "size": 118,
                }],
            })
            .to_string(),
        );
        let manifest_desc = Descriptor {
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_owned(),
            digest: Digest::parse(MANIFEST_DIGEST).unwrap(),
            size: manifest_data.len() as i64,
        };

        let mut registry = Self::default();
        registry
            .manifests
            .insert("latest".to_owned(), (manifest_desc.clone(), manifest_data.clone()));
        registry
            .manifests
            .insert(MANIFEST_DIGEST.to_owned(), (manifest_desc, manifest_data));
        for (digest, size) in [(CONFIG_DIGEST, 529), (LAYER_DIGEST, 118)] {
            registry.blobs.insert(
                digest.to_owned(),
                (
                    Descriptor {
                        media_type: CONTENT_TYPE_BINARY.to_owned(),
                        digest: Digest::parse(digest).unwrap(),
                        size,
                    },
                    Bytes::from(vec![0u8; size as usize]),
                ),
            );
        }
        registry
    }
}

async fn registry_handler(
    State(registry): State<Arc<SeededRegistry>>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::NOT_FOUND.into_response();
    }
    let path = request.uri().path().to_owned();
    let entry = path
        .strip_prefix("/v2/")
        .and_then(|rest| match rest.split_once("/manifests/") {
            Some((_, reference)) => registry.manifests.get(reference),
            None => rest
                .split_once("/blobs/")
                .and_then(|(_, digest)| registry.blobs.get(digest)),
        });
    let Some((desc, data)) = entry else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mut headers = HeaderMap::new();
    write_descriptor_to_header(desc, &mut headers);
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(data.clone())
    };
    (StatusCode::OK, headers, body).into_response()
}

async fn serve(app: AxumRouter) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn serve_registry(registry: SeededRegistry) -> SocketAddr {
    serve(AxumRouter::new().fallback(registry_handler).with_state(Arc::new(registry))).await
}

fn client() -> Client {
    Client::new(
        None,
        Arc::new(MemoryRouter::new(HashMap::new(), "127.0.0.1:5000".parse().unwrap())),
    )
}

fn blob_path(digest: &str) -> DistributionPath {
    DistributionPath::new(
        DistributionKind::Blob,
        "docker.io".to_owned(),
        "test/image".to_owned(),
        Some(Digest::parse(digest).unwrap()),
        None,
    )
    .unwrap()
}

#[tokio::test]
async fn test_pull_round_trip() {
    let addr = serve_registry(SeededRegistry::with_test_image()).await;
    let mirror = reqwest::Url::parse(&format!("http://{addr}")).unwrap();

    let image = Image::parse("docker.io/test/image:latest", true).unwrap();
    let client = client();
    let opts = FetchOptions::default().with_mirror(mirror.clone());
    let results = client.pull(&image, &opts).await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].descriptor.digest.to_string(), MANIFEST_DIGEST);
    let pulled: Vec<String> = results
        .iter()
        .map(|r| r.descriptor.digest.to_string())
        .collect();
    assert!(pulled.contains(&CONFIG_DIGEST.to_owned()));
    assert!(pulled.contains(&LAYER_DIGEST.to_owned()));

    let desc = client.head(&blob_path(CONFIG_DIGEST), &opts).await.unwrap();
    assert_eq!(desc.digest.to_string(), CONFIG_DIGEST);
    assert_eq!(desc.media_type, CONTENT_TYPE_BINARY);
}

#[tokio::test]
async fn test_fetch_routes_through_peers() {
    let addr = serve_registry(SeededRegistry::with_test_image()).await;

    let router = Arc::new(MemoryRouter::new(HashMap::new(), "127.0.0.1:5000".parse().unwrap()));
    router.add(CONFIG_DIGEST, addr);
    let client = Client::new(None, router);

    let (desc, res) = client
        .fetch(&blob_path(CONFIG_DIGEST), &FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(desc.size, 529);
    let body = res.bytes().await.unwrap();
    assert_eq!(body.len(), 529);
}

#[tokio::test]
async fn test_fetch_rotates_past_bad_peer() {
    // A reserved-then-released port refuses connections.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);
    let good_addr = serve_registry(SeededRegistry::with_test_image()).await;

    let router = Arc::new(MemoryRouter::new(HashMap::new(), "127.0.0.1:5000".parse().unwrap()));
    router.add(CONFIG_DIGEST, dead_addr);
    router.add(CONFIG_DIGEST, good_addr);
    let client = Client::new(None, router);

    let desc = client
        .head(&blob_path(CONFIG_DIGEST), &FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(desc.digest.to_string(), CONFIG_DIGEST);
}

#[tokio::test]
async fn test_fetch_without_peers() {
    let client = client();
    let err = client
        .head(&blob_path(CONFIG_DIGEST), &FetchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "no peers");
}

#[tokio::test]
async fn test_fetch_rejects_digest_mismatch() {
    // The registry serves the config blob under the layer digest key, so
    // the returned descriptor never matches the requested digest.
    let mut registry = SeededRegistry::with_test_image();
    let wrong = registry.blobs.get(CONFIG_DIGEST).unwrap().clone();
    registry.blobs.insert(LAYER_DIGEST.to_owned(), wrong);
    let addr = serve_registry(registry).await;

    let router = Arc::new(MemoryRouter::new(HashMap::new(), "127.0.0.1:5000".parse().unwrap()));
    router.add(LAYER_DIGEST, addr);
    let client = Client::new(None, router);

    let err = client
        .head(&blob_path(LAYER_DIGEST), &FetchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "exhausted peers");
}

/// Registry requiring a bearer token, recording the request sequence.
struct AuthRegistry {
    addr: Mutex<Option<SocketAddr>>,
    log: Mutex<Vec<String>>,
    registry: SeededRegistry,
}

async fn auth_handler(State(state): State<Arc<AuthRegistry>>, request: Request) -> Response {
    let path = request.uri().path().to_owned();
    if path == "/token" {
        state.log.lock().unwrap().push("token".to_owned());
        return (
            [(header::CONTENT_TYPE, "application/json")],
            "{\"token\":\"abc\"}",
        )
            .into_response();
    }
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    if authorization != "Bearer abc" {
        state.log.lock().unwrap().push("challenged".to_owned());
        let addr = state.addr.lock().unwrap().expect("server address set");
        let realm = format!("Bearer realm=\"http://{addr}/token\"");
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, realm)],
            "unauthorized",
        )
            .into_response();
    }
    state.log.lock().unwrap().push("authorized".to_owned());
    let Some((desc, data)) = state
        .registry
        .blobs
        .get(path.rsplit('/').next().unwrap_or_default())
    else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mut headers = HeaderMap::new();
    write_descriptor_to_header(desc, &mut headers);
    (StatusCode::OK, headers, Body::from(data.clone())).into_response()
}

#[tokio::test]
async fn test_fetch_negotiates_bearer_token() {
    let state = Arc::new(AuthRegistry {
        addr: Mutex::new(None),
        log: Mutex::new(Vec::new()),
        registry: SeededRegistry::with_test_image(),
    });
    let addr = serve(
        AxumRouter::new()
            .fallback(auth_handler)
            .with_state(state.clone()),
    )
    .await;
    *state.addr.lock().unwrap() = Some(addr);

    let router = Arc::new(MemoryRouter::new(HashMap::new(), "127.0.0.1:5000".parse().unwrap()));
    router.add(CONFIG_DIGEST, addr);
    let client = Client::new(None, router);

    let (desc, res) = client
        .fetch(&blob_path(CONFIG_DIGEST), &FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(desc.digest.to_string(), CONFIG_DIGEST);
    res.bytes().await.unwrap();

    // The challenged response was consumed before the token request went
    // out, and the retried request carried the token.
    let log = state.log.lock().unwrap().clone();
    assert_eq!(log, vec!["challenged", "token", "authorized"]);
}

#[tokio::test]
async fn test_fetch_fails_on_second_unauthorized() {
    // Token endpoint works but the registry rejects the token anyway.
    async fn handler(State(addr): State<Arc<Mutex<Option<SocketAddr>>>>, request: Request) -> Response {
        if request.uri().path() == "/token" {
            return (
                [(header::CONTENT_TYPE, "application/json")],
                "{\"token\":\"abc\"}",
            )
                .into_response();
        }
        let realm = format!(
            "Bearer realm=\"http://{}/token\"",
            addr.lock().unwrap().expect("server address set")
        );
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, realm)],
            "unauthorized",
        )
            .into_response()
    }

    let addr_cell = Arc::new(Mutex::new(None));
    let addr = serve(
        AxumRouter::new()
            .fallback(handler)
            .with_state(addr_cell.clone()),
    )
    .await;
    *addr_cell.lock().unwrap() = Some(addr);

    let router = Arc::new(MemoryRouter::new(HashMap::new(), "127.0.0.1:5000".parse().unwrap()));
    router.add(CONFIG_DIGEST, addr);
    let client = Client::new(None, router);

    let err = client
        .head(&blob_path(CONFIG_DIGEST), &FetchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthRequired));
}
