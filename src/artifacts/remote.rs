//! OCI distribution registries over HTTP.
//!
//! Only the handful of endpoints needed to copy content are used: manifest
//! get/put, blob head/get, and monolithic blob upload. Anonymous bearer
//! tokens are requested on the first `401` and cached per repository scope.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use super::{verify_digest, ArtifactStore, ManifestBlob, ACCEPTED_MANIFESTS};
use crate::core::artifact::ArtifactRef;
use crate::ops::op::RetryPolicy;
use crate::util::cancel::CancelToken;
use crate::util::config::Config;

/// Connection settings for one registry host.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Skip TLS certificate verification.
    pub insecure: bool,
    /// Talk plain HTTP instead of HTTPS.
    pub plain_http: bool,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub offline: bool,
    /// Extra PEM root certificate, e.g. the platform CA.
    pub ca_pem: Option<String>,
}

impl RegistryOptions {
    pub fn from_config(config: &Config, host: &str) -> Self {
        RegistryOptions {
            insecure: config.is_insecure(host),
            plain_http: false,
            timeout: config.net_timeout(),
            retry: config.net_retry(),
            offline: config.net.offline,
            ca_pem: None,
        }
    }
}

/// A `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parse a bearer challenge; other schemes yield `None`.
pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let rest = header.trim().strip_prefix("Bearer ")?;
    let mut params = BTreeMap::new();
    let mut remaining = rest.trim();

    while !remaining.is_empty() {
        let (key, after) = remaining.split_once('=')?;
        let after = after.trim_start();
        let (value, tail) = if let Some(quoted) = after.strip_prefix('"') {
            let end = quoted.find('"')?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };
        params.insert(key.trim().to_ascii_lowercase(), value.to_string());
        remaining = tail.trim_start().trim_start_matches(',').trim_start();
    }

    Some(Challenge {
        realm: params.remove("realm")?,
        service: params.remove("service"),
        scope: params.remove("scope"),
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Registry client for one host.
pub struct RemoteRegistry {
    host: String,
    base: String,
    client: Client,
    options: RegistryOptions,
    cancel: CancelToken,
    tokens: RefCell<BTreeMap<String, String>>,
}

impl RemoteRegistry {
    pub fn new(host: &str, options: RegistryOptions, cancel: CancelToken) -> Result<Self> {
        if host.is_empty() {
            bail!("registry host is empty");
        }
        let mut builder = Client::builder()
            .timeout(options.timeout)
            .user_agent(concat!("stagehand/", env!("CARGO_PKG_VERSION")));
        if options.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(pem) = &options.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                .context("invalid CA certificate for registry client")?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build().context("failed to build HTTP client")?;

        let scheme = if options.plain_http { "http" } else { "https" };
        Ok(RemoteRegistry {
            host: host.to_string(),
            base: format!("{}://{}", scheme, host),
            client,
            options,
            cancel,
            tokens: RefCell::new(BTreeMap::new()),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn url(&self, reference: &ArtifactRef, tail: &str) -> String {
        format!("{}/v2/{}/{}", self.base, reference.path(), tail)
    }

    fn scope(reference: &ArtifactRef, push: bool) -> String {
        let actions = if push { "pull,push" } else { "pull" };
        format!("repository:{}:{}", reference.path(), actions)
    }

    fn fetch_token(&self, challenge: &Challenge, scope: &str) -> Result<String> {
        let mut url = Url::parse(&challenge.realm)
            .with_context(|| format!("invalid token realm `{}`", challenge.realm))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = &challenge.service {
                query.append_pair("service", service);
            }
            query.append_pair("scope", challenge.scope.as_deref().unwrap_or(scope));
        }

        self.cancel.check()?;
        let response = self
            .client
            .get(url.as_str())
            .send()
            .with_context(|| format!("failed to request token from {}", challenge.realm))?;
        if !response.status().is_success() {
            bail!(
                "token request to {} failed: HTTP {}",
                challenge.realm,
                response.status()
            );
        }
        let body: TokenResponse = response
            .json()
            .with_context(|| format!("invalid token response from {}", challenge.realm))?;
        body.token
            .or(body.access_token)
            .with_context(|| format!("token response from {} has no token", challenge.realm))
    }

    /// Send a request with auth and bounded retries on transport errors and
    /// server errors.
    fn send(
        &self,
        what: &str,
        reference: &ArtifactRef,
        push: bool,
        build: impl Fn(&Client) -> RequestBuilder,
    ) -> Result<Response> {
        if self.options.offline {
            bail!("offline mode: refusing to {} on {}", what, self.host);
        }
        let scope = Self::scope(reference, push);

        let response = self.options.retry.poll(&self.cancel, |attempt| {
            let mut request = build(&self.client);
            if let Some(token) = self.tokens.borrow().get(&scope) {
                request = request.header(AUTHORIZATION, format!("Bearer {}", token));
            }

            let response = match request.send() {
                Ok(response) => response,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    tracing::warn!("{} on {} failed (attempt {}): {}", what, self.host, attempt, e);
                    return Ok(None);
                }
                Err(e) => return Err(e).with_context(|| format!("failed to {} on {}", what, self.host)),
            };

            if response.status() == StatusCode::UNAUTHORIZED && !self.tokens.borrow().contains_key(&scope) {
                let challenge = response
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|h| h.to_str().ok())
                    .and_then(parse_challenge);
                if let Some(challenge) = challenge {
                    let token = self.fetch_token(&challenge, &scope)?;
                    self.tokens.borrow_mut().insert(scope.clone(), token);
                    return Ok(None);
                }
            }

            if response.status().is_server_error() {
                tracing::warn!(
                    "{} on {} failed (attempt {}): HTTP {}",
                    what,
                    self.host,
                    attempt,
                    response.status()
                );
                return Ok(None);
            }

            Ok(Some(response))
        })?;

        response.with_context(|| {
            format!(
                "failed to {} on {} after {} attempts",
                what, self.host, self.options.retry.attempts
            )
        })
    }

    fn read_manifest(&self, reference: &ArtifactRef, tag_or_digest: &str) -> Result<Option<ManifestBlob>> {
        let url = self.url(reference, &format!("manifests/{}", tag_or_digest));
        let response = self.send("get manifest", reference, false, |c| {
            c.get(&url).header(ACCEPT, ACCEPTED_MANIFESTS.join(", "))
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            s if !s.is_success() => bail!("failed to get manifest {}@{}: HTTP {}", reference, tag_or_digest, s),
            _ => {}
        }

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(|t| t.split(';').next().unwrap_or(t).trim().to_string());
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read manifest of {}", reference))?
            .to_vec();
        let media_type = media_type
            .filter(|t| ACCEPTED_MANIFESTS.contains(&t.as_str()))
            .unwrap_or_else(|| super::MEDIA_TYPE_IMAGE_MANIFEST.to_string());

        Ok(Some(ManifestBlob::new(media_type, bytes)))
    }
}

impl ArtifactStore for RemoteRegistry {
    fn describe(&self) -> String {
        format!("registry {}", self.host)
    }

    fn resolve(&self, reference: &ArtifactRef) -> Result<Option<ManifestBlob>> {
        self.read_manifest(reference, &reference.tag)
    }

    fn manifest(&self, reference: &ArtifactRef, digest: &str) -> Result<ManifestBlob> {
        let blob = self
            .read_manifest(reference, digest)?
            .with_context(|| format!("manifest {} of {} not found", digest, reference))?;
        verify_digest(digest, &blob.bytes)?;
        Ok(blob)
    }

    fn has_blob(&self, reference: &ArtifactRef, digest: &str) -> Result<bool> {
        let url = self.url(reference, &format!("blobs/{}", digest));
        let response = self.send("check blob", reference, false, |c| c.head(&url))?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => bail!("failed to check blob {} of {}: HTTP {}", digest, reference, s),
        }
    }

    fn read_blob(&self, reference: &ArtifactRef, digest: &str) -> Result<Vec<u8>> {
        let url = self.url(reference, &format!("blobs/{}", digest));
        let response = self.send("get blob", reference, false, |c| c.get(&url))?;
        if !response.status().is_success() {
            bail!("failed to get blob {} of {}: HTTP {}", digest, reference, response.status());
        }
        Ok(response
            .bytes()
            .with_context(|| format!("failed to read blob {} of {}", digest, reference))?
            .to_vec())
    }

    fn write_blob(&mut self, reference: &ArtifactRef, digest: &str, data: &[u8]) -> Result<()> {
        let start = self.url(reference, "blobs/uploads/");
        let response = self.send("start upload", reference, true, |c| c.post(&start))?;
        if response.status() != StatusCode::ACCEPTED {
            bail!("failed to start upload to {}: HTTP {}", reference, response.status());
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|h| h.to_str().ok())
            .with_context(|| format!("upload to {} returned no location", reference))?;
        let mut upload = Url::parse(&self.base)
            .and_then(|base| base.join(location))
            .with_context(|| format!("invalid upload location `{}`", location))?;
        upload.query_pairs_mut().append_pair("digest", digest);

        let response = self.send("upload blob", reference, true, |c| {
            c.put(upload.as_str())
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(data.to_vec())
        })?;
        if !response.status().is_success() {
            bail!("failed to upload blob {} to {}: HTTP {}", digest, reference, response.status());
        }
        Ok(())
    }

    fn put_manifest(&mut self, reference: &ArtifactRef, manifest: &ManifestBlob, tag: bool) -> Result<()> {
        let target = if tag { reference.tag.as_str() } else { manifest.digest.as_str() };
        let url = self.url(reference, &format!("manifests/{}", target));
        let response = self.send("put manifest", reference, true, |c| {
            c.put(&url)
                .header(CONTENT_TYPE, manifest.media_type.as_str())
                .body(manifest.bytes.clone())
        })?;
        if !response.status().is_success() {
            bail!("failed to put manifest {} to {}: HTTP {}", target, reference, response.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let c = parse_challenge(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:acme/zot:pull""#,
        )
        .unwrap();
        assert_eq!(c.realm, "https://ghcr.io/token");
        assert_eq!(c.service.as_deref(), Some("ghcr.io"));
        assert_eq!(c.scope.as_deref(), Some("repository:acme/zot:pull"));

        assert!(parse_challenge("Basic realm=\"x\"").is_none());
        assert!(parse_challenge("Bearer service=\"x\"").is_none());
    }

    #[test]
    fn test_urls_and_scopes() {
        let options = RegistryOptions {
            insecure: false,
            plain_http: true,
            timeout: Duration::from_secs(1),
            retry: RetryPolicy::new(1, Duration::ZERO),
            offline: false,
            ca_pem: None,
        };
        let registry = RemoteRegistry::new("127.0.0.1:5000", options, CancelToken::new()).unwrap();
        let r = ArtifactRef::new("127.0.0.1:5000/airgap", "zot", "v1");

        assert_eq!(
            registry.url(&r, "manifests/v1"),
            "http://127.0.0.1:5000/v2/airgap/zot/manifests/v1"
        );
        assert_eq!(RemoteRegistry::scope(&r, true), "repository:airgap/zot:pull,push");
    }

    #[test]
    fn test_offline_refuses_network() {
        let mut config = Config::default();
        config.net.offline = true;
        let registry =
            RemoteRegistry::new("ghcr.io", RegistryOptions::from_config(&config, "ghcr.io"), CancelToken::new())
                .unwrap();
        let err = registry
            .resolve(&ArtifactRef::new("ghcr.io/acme", "zot", "v1"))
            .unwrap_err();
        assert!(err.to_string().contains("offline"));
    }
}
