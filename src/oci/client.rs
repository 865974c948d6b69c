//! Mirror fetch client.
//!
//! Resolves a distribution path to a load-balanced sequence of candidate
//! peers, attempts each with a bounded per-attempt timeout, validates the
//! response headers against descriptor semantics and handles upstream
//! bearer-token challenges. A single bad peer never fails a fetch; the
//! next candidate is tried until the retry budget runs out.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{header, Method, Response, StatusCode, Url};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::httpx;
use crate::oci::descriptor::{
    descriptor_from_header, Descriptor, Manifest, MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
use crate::oci::image::{DistributionKind, DistributionPath, Image};
use crate::routing::Router;
use crate::{Error, Result};

pub const DEFAULT_RESOLVE_RETRIES: usize = 3;
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-fetch options: an optional mirror to short-circuit to, the retry
/// budget, the per-attempt timeout and the caller's cancellation token.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub mirror: Option<Url>,
    pub retries: usize,
    pub timeout: Duration,
    pub token: CancellationToken,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            mirror: None,
            retries: DEFAULT_RESOLVE_RETRIES,
            timeout: DEFAULT_RESOLVE_TIMEOUT,
            token: CancellationToken::new(),
        }
    }
}

impl FetchOptions {
    pub fn with_mirror(mut self, mirror: Url) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }
}

/// One fetched artifact: its descriptor and content.
#[derive(Debug, Clone)]
pub struct PullResult {
    pub descriptor: Descriptor,
    pub data: Bytes,
}

/// HTTP client resolving distribution paths through the router.
pub struct Client {
    http: reqwest::Client,
    router: Arc<dyn Router>,
}

impl Client {
    /// Create a client; `http` falls back to a default client when `None`.
    pub fn new(http: Option<reqwest::Client>, router: Arc<dyn Router>) -> Self {
        Self {
            http: http.unwrap_or_default(),
            router,
        }
    }

    /// Resolve the descriptor for a distribution path without its content.
    pub async fn head(&self, dist: &DistributionPath, opts: &FetchOptions) -> Result<Descriptor> {
        let (desc, res) = self.resolve(Method::HEAD, dist, opts).await?;
        drain(res).await;
        Ok(desc)
    }

    /// Resolve a distribution path and return the verified descriptor plus
    /// the response carrying the content body.
    pub async fn fetch(
        &self,
        dist: &DistributionPath,
        opts: &FetchOptions,
    ) -> Result<(Descriptor, Response)> {
        self.resolve(Method::GET, dist, opts).await
    }

    /// Pull an image: the manifest graph first, then every referenced blob.
    /// Partial failure propagates the error and yields no results.
    pub async fn pull(&self, image: &Image, opts: &FetchOptions) -> Result<Vec<PullResult>> {
        let mut results = Vec::new();
        let mut blobs: Vec<Descriptor> = Vec::new();
        let mut manifests = vec![image.distribution_path()];
        while let Some(dist) = manifests.pop() {
            let (desc, res) = self.fetch(&dist, opts).await?;
            let data = res.bytes().await?;
            let manifest: Manifest = serde_json::from_slice(&data)?;
            if manifest.is_index() {
                for child in manifest.referenced() {
                    manifests.push(DistributionPath::new(
                        DistributionKind::Manifest,
                        image.registry.clone(),
                        image.repository.clone(),
                        Some(child.digest),
                        None,
                    )?);
                }
            } else {
                blobs.extend(manifest.referenced());
            }
            results.push(PullResult {
                descriptor: desc,
                data,
            });
        }
        for desc in blobs {
            let dist = DistributionPath::new(
                DistributionKind::Blob,
                image.registry.clone(),
                image.repository.clone(),
                Some(desc.digest.clone()),
                None,
            )?;
            let (desc, res) = self.fetch(&dist, opts).await?;
            let data = res.bytes().await?;
            results.push(PullResult {
                descriptor: desc,
                data,
            });
        }
        Ok(results)
    }

    // The resolve loop: consume candidates from the balancer (or the mirror
    // hint), bounded by the retry budget. Peer-level failures rotate to the
    // next candidate.
    async fn resolve(
        &self,
        method: Method,
        dist: &DistributionPath,
        opts: &FetchOptions,
    ) -> Result<(Descriptor, Response)> {
        let retries = opts.retries.max(1);

        // The mirror hint short-circuits the router; every attempt goes to
        // the mirror directly.
        let mut balancer = match &opts.mirror {
            Some(_) => None,
            None => Some(self.router.lookup(&dist.key(), retries).await?),
        };

        for attempt in 0..retries {
            let base = match &opts.mirror {
                Some(url) => url.clone(),
                None => {
                    let Some(peer) = balancer.as_mut().and_then(|b| b.next()) else {
                        return Err(Error::NoPeers);
                    };
                    Url::parse(&format!("http://{peer}")).map_err(|e| Error::peer(e.to_string()))?
                }
            };
            let attempt_fut = self.attempt(method.clone(), &base, dist, opts.timeout);
            let result = tokio::select! {
                _ = opts.token.cancelled() => return Err(Error::DeadlineExceeded),
                result = attempt_fut => result,
            };
            match result {
                Ok(ok) => return Ok(ok),
                // A 401 that survives the bearer exchange will not get
                // better on another peer.
                Err(err @ Error::AuthRequired) => return Err(err),
                Err(err) => {
                    debug!(attempt, %base, %err, "fetch attempt failed");
                }
            }
        }
        Err(Error::ExhaustedPeers)
    }

    // One peer interaction: request, auth retry if challenged, descriptor
    // validation. Any error here counts against the peer, not the fetch.
    async fn attempt(
        &self,
        method: Method,
        base: &Url,
        dist: &DistributionPath,
        timeout: Duration,
    ) -> Result<(Descriptor, Response)> {
        let url = base
            .join(&dist.url_path())
            .map_err(|e| Error::peer(e.to_string()))?;
        let res = self
            .request(method.clone(), url.clone(), dist.kind, timeout, None)
            .await?;
        let res = if res.status() == StatusCode::UNAUTHORIZED {
            self.authorize(method, url, dist.kind, timeout, res).await?
        } else {
            res
        };

        let status = res.status();
        if !status.is_success() {
            drain(res).await;
            return Err(Error::peer(format!("unexpected status {status}")));
        }
        let desc = match descriptor_from_header(res.headers()) {
            Ok(desc) => desc,
            Err(err) => {
                drain(res).await;
                return Err(err);
            }
        };
        if let Some(want) = &dist.digest {
            if desc.digest != *want {
                drain(res).await;
                return Err(Error::peer(format!(
                    "digest mismatch: requested {want}, got {}",
                    desc.digest
                )));
            }
        }
        Ok((desc, res))
    }

    async fn request(
        &self,
        method: Method,
        url: Url,
        kind: DistributionKind,
        timeout: Duration,
        bearer: Option<&str>,
    ) -> Result<Response> {
        let mut req = self.http.request(method, url).timeout(timeout);
        if kind == DistributionKind::Manifest {
            req = req.header(
                header::ACCEPT,
                format!(
                    "{MEDIA_TYPE_OCI_MANIFEST}, {MEDIA_TYPE_OCI_INDEX}, \
                     {MEDIA_TYPE_DOCKER_MANIFEST}, {MEDIA_TYPE_DOCKER_MANIFEST_LIST}"
                ),
            );
        }
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        req = httpx::with_request_id(req);
        let res = req.send().await.map_err(|e| Error::peer(e.to_string()))?;
        Ok(res)
    }

    // Bearer-token negotiation. The challenged response body is drained and
    // dropped before the token request goes out; a second 401 is fatal.
    async fn authorize(
        &self,
        method: Method,
        url: Url,
        kind: DistributionKind,
        timeout: Duration,
        res: Response,
    ) -> Result<Response> {
        let challenge = res
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        drain(res).await;
        let Some(challenge) = challenge else {
            return Err(Error::AuthRequired);
        };
        let challenge = AuthChallenge::parse(&challenge)?;
        let token = self.exchange_token(&challenge, timeout).await?;
        let res = self
            .request(method, url, kind, timeout, Some(&token))
            .await?;
        if res.status() == StatusCode::UNAUTHORIZED {
            drain(res).await;
            return Err(Error::AuthRequired);
        }
        Ok(res)
    }

    async fn exchange_token(&self, challenge: &AuthChallenge, timeout: Duration) -> Result<String> {
        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
        }

        let mut req = self
            .http
            .get(&challenge.realm)
            .timeout(timeout)
            .header(header::ACCEPT, httpx::CONTENT_TYPE_JSON);
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope.as_str()));
        }
        if !query.is_empty() {
            req = req.query(&query);
        }
        let res = req.send().await.map_err(|e| Error::peer(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            drain(res).await;
            return Err(Error::peer(format!("token endpoint returned {status}")));
        }
        Ok(res.json::<TokenResponse>().await?.token)
    }
}

/// Bearer challenge from a `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl AuthChallenge {
    pub fn parse(header: &str) -> Result<Self> {
        let err = || Error::peer(format!("unsupported WWW-Authenticate header {header}"));
        let (scheme, params) = header.split_once(' ').ok_or_else(err)?;
        if !scheme.eq_ignore_ascii_case("Bearer") {
            return Err(err());
        }
        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for param in params.split(',') {
            let Some((key, value)) = param.trim().split_once('=') else {
                continue;
            };
            let value = value.trim_matches('"').to_owned();
            match key {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }
        Ok(Self {
            realm: realm.ok_or_else(err)?,
            service,
            scope,
        })
    }
}

// Read the body to EOF before dropping so the connection can be reused and
// nothing is left half-consumed when the next request goes out.
async fn drain(mut res: Response) {
    while let Ok(Some(_)) = res.chunk().await {}
}
