use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use reqwest::{header, Client as ReqwestClient, Method, Response, StatusCode};
use tracing::{debug, warn};

use crate::digest::OciDigest;
use crate::error::{ClientError, Result};
use crate::models::{
    media_type, Catalog, Descriptor, SignatureList, TagList, TokenResponse,
};
use crate::reference::Reference;

/// Header a registry sets when it implements the signature API extension.
pub const SIGNATURE_HEADER: &str = "X-Registry-Supports-Signatures";

const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Basic credentials for an upstream registry.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    fn header_value(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", BASE64.encode(raw))
    }
}

/// A parsed `WWW-Authenticate: Bearer` challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: Option<String>,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parse the parameter list of a `Bearer realm="…",service="…"` challenge.
pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let rest = header.strip_prefix("Bearer ")?;
    let mut challenge = BearerChallenge::default();
    for part in rest.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim_matches('"').to_string();
            match key {
                "realm" => challenge.realm = Some(value),
                "service" => challenge.service = Some(value),
                "scope" => challenge.scope = Some(value),
                _ => {}
            }
        }
    }
    challenge.realm.as_ref()?;
    Some(challenge)
}

/// Join path segments into a single-slash-separated URL path.
pub fn urlpath_sanitize(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Result of a manifest HEAD request.
#[derive(Debug, Clone)]
pub struct ManifestHead {
    pub digest: Option<OciDigest>,
    pub media_type: Option<String>,
    pub size: Option<u64>,
}

/// A manifest body together with its negotiated type and advertised digest.
#[derive(Debug, Clone)]
pub struct ManifestPull {
    pub bytes: Bytes,
    pub media_type: Option<String>,
    pub digest: Option<OciDigest>,
}

/// A client for interacting with an OCI registry.
#[derive(Debug, Clone)]
pub struct Client {
    registry_url: String,
    auth: Option<Credentials>,
    http: ReqwestClient,
    max_retries: u32,
}

impl Client {
    /// Create a new client for the given registry URL.
    pub fn new(registry_url: impl Into<String>, auth: Option<Credentials>) -> Self {
        Self {
            registry_url: registry_url.into().trim_end_matches('/').to_string(),
            auth,
            http: ReqwestClient::new(),
            max_retries: 3,
        }
    }

    /// Override the retry budget used for transient failures.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    /// Create a new session for the given repository.
    pub fn new_session(&self, repository: impl Into<String>) -> ClientSession {
        ClientSession {
            repository: repository.into(),
            registry_url: self.registry_url.clone(),
            http: self.http.clone(),
            auth: self.auth.clone(),
            token: None,
            max_retries: self.max_retries,
        }
    }

    /// Check if the registry API is available.
    ///
    /// A 401 still counts as available; it means authentication is required.
    pub async fn check_api(&self) -> Result<bool> {
        let url = format!("{}/v2/", self.registry_url);
        let mut request = self.http.get(&url);
        if let Some(auth) = &self.auth {
            request = request.header(header::AUTHORIZATION, auth.header_value());
        }
        let response = request.send().await?;
        Ok(response.status() == StatusCode::OK || response.status() == StatusCode::UNAUTHORIZED)
    }

    /// Probe whether the registry advertises the signature API extension.
    ///
    /// The header is also honored on the 401 challenge response, so no
    /// credentials are needed for the probe.
    pub async fn supports_signature_extension(&self) -> Result<bool> {
        let url = format!("{}/v2/", self.registry_url);
        let response = self.http.get(&url).send().await?;
        Ok(response
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            == Some("1"))
    }

    /// List all repositories in the registry, following pagination links.
    pub async fn list_repositories(&self) -> Result<Vec<String>> {
        let mut session = self.new_session(String::new());
        let mut repositories = Vec::new();
        let mut url = format!("{}/v2/_catalog", self.registry_url);
        loop {
            let response = session
                .execute(Method::GET, &url, None, None, "registry:catalog:*")
                .await?;
            let next = next_link(&response, &self.registry_url);
            let catalog: Catalog = response.json().await?;
            repositories.extend(catalog.repositories);
            match next {
                Some(next_url) => url = next_url,
                None => break,
            }
        }
        Ok(repositories)
    }

    /// Fetch signatures from a sigstore-style file layout.
    ///
    /// The number of signatures is unknown upfront; indices are probed in
    /// order until the first 404.
    pub async fn fetch_sigstore_signatures(
        &self,
        sigstore_url: &str,
        name: &str,
        digest: &OciDigest,
    ) -> Result<Vec<Bytes>> {
        let reformatted = format!("{}={}", digest.algorithm(), digest.hex());
        let base = urlpath_sanitize(&[sigstore_url, &format!("{name}@{reformatted}")]);
        let mut signatures = Vec::new();
        let mut counter = 1;
        loop {
            let url = format!("{base}/signature-{counter}");
            let response = self.http.get(&url).send().await?;
            match response.status() {
                StatusCode::OK => {
                    signatures.push(response.bytes().await?);
                    counter += 1;
                }
                StatusCode::NOT_FOUND => break,
                status => {
                    warn!(%url, %status, "sigstore is not accessible, skipping signature");
                    break;
                }
            }
        }
        Ok(signatures)
    }
}

/// A session for interacting with a specific repository in an OCI registry.
///
/// The session negotiates a Bearer token on the first 401 challenge and
/// retries transient failures with exponential backoff.
pub struct ClientSession {
    repository: String,
    registry_url: String,
    http: ReqwestClient,
    auth: Option<Credentials>,
    token: Option<String>,
    max_retries: u32,
}

impl ClientSession {
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Obtain a token from the auth service named by a bearer challenge.
    async fn fetch_token(&mut self, challenge: &BearerChallenge, scope: &str) -> Result<()> {
        let realm = challenge
            .realm
            .clone()
            .ok_or_else(|| ClientError::Auth("challenge carried no realm".to_string()))?;
        let mut token_url = reqwest::Url::parse(&realm)
            .map_err(|e| ClientError::Auth(format!("invalid realm {realm}: {e}")))?;
        if let Some(service) = &challenge.service {
            token_url.query_pairs_mut().append_pair("service", service);
        }
        let scope = challenge.scope.as_deref().unwrap_or(scope);
        if !scope.is_empty() {
            token_url.query_pairs_mut().append_pair("scope", scope);
        }

        let mut token_request = self.http.get(token_url);
        if let Some(auth) = &self.auth {
            token_request = token_request.header(header::AUTHORIZATION, auth.header_value());
        }
        let token_response = token_request.send().await?;
        if !token_response.status().is_success() {
            return Err(ClientError::Auth(format!(
                "token endpoint returned {}",
                token_response.status()
            )));
        }
        let token_data: TokenResponse = token_response.json().await?;
        self.token = Some(token_data.token);
        Ok(())
    }

    /// Send one request, negotiating a Bearer token on a 401 challenge.
    async fn send_once(
        &mut self,
        method: Method,
        url: &str,
        accept: Option<&str>,
        content_type: Option<&str>,
        body: Option<Bytes>,
        scope: &str,
    ) -> Result<Response> {
        let build = |session: &Self| {
            let mut request = session.http.request(method.clone(), url);
            if let Some(accept) = accept {
                request = request.header(header::ACCEPT, accept);
            }
            if let Some(content_type) = content_type {
                request = request.header(header::CONTENT_TYPE, content_type);
            }
            if let Some(body) = &body {
                request = request.body(body.clone());
            }
            if let Some(token) = &session.token {
                request.header(header::AUTHORIZATION, format!("Bearer {token}"))
            } else if let Some(auth) = &session.auth {
                request.header(header::AUTHORIZATION, auth.header_value())
            } else {
                request
            }
        };

        let response = build(self).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        // The token may be missing, expired or under-scoped; renegotiate once.
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge);
        match challenge {
            Some(challenge) => {
                self.fetch_token(&challenge, scope).await?;
                Ok(build(self).send().await?)
            }
            None => Ok(response),
        }
    }

    /// Send a request, retrying transient failures with exponential backoff.
    async fn execute(
        &mut self,
        method: Method,
        url: &str,
        accept: Option<&str>,
        body: Option<Bytes>,
        scope: &str,
    ) -> Result<Response> {
        self.execute_with_content_type(method, url, accept, None, body, scope)
            .await
    }

    async fn execute_with_content_type(
        &mut self,
        method: Method,
        url: &str,
        accept: Option<&str>,
        content_type: Option<&str>,
        body: Option<Bytes>,
        scope: &str,
    ) -> Result<Response> {
        let mut attempt = 0;
        loop {
            let result = self
                .send_once(
                    method.clone(),
                    url,
                    accept,
                    content_type,
                    body.clone(),
                    scope,
                )
                .await
                .and_then(|response| {
                    let status = response.status();
                    if status.is_server_error()
                        || status == StatusCode::REQUEST_TIMEOUT
                        || status == StatusCode::TOO_MANY_REQUESTS
                    {
                        Err(ClientError::Status {
                            status,
                            url: url.to_string(),
                        })
                    } else {
                        Ok(response)
                    }
                });

            match result {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = BACKOFF_BASE * 2u32.pow(attempt);
                    debug!(%url, attempt, ?delay, "retrying upstream request: {err}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn pull_scope(&self) -> String {
        format!("repository:{}:pull", self.repository)
    }

    fn push_scope(&self) -> String {
        format!("repository:{}:pull,push", self.repository)
    }

    fn repo_url(&self, suffix: &str) -> String {
        format!("{}/v2/{}/{}", self.registry_url, self.repository, suffix)
    }

    /// List all tags for the repository, following pagination links.
    pub async fn list_tags(&mut self) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        let mut url = self.repo_url("tags/list");
        loop {
            let scope = self.pull_scope();
            let response = self
                .execute(Method::GET, &url, None, None, &scope)
                .await?;
            if response.status() != StatusCode::OK {
                return Err(status_error(response, &url));
            }
            let next = next_link(&response, &self.registry_url);
            let list: TagList = response.json().await?;
            tags.extend(list.tags);
            match next {
                Some(next_url) => url = next_url,
                None => break,
            }
        }
        Ok(tags)
    }

    /// HEAD a manifest, negotiating any of the v2 schemas.
    ///
    /// Returns `None` on 404 so a sync can distinguish a missing tag from a
    /// failed upstream.
    pub async fn head_manifest(&mut self, reference: &Reference) -> Result<Option<ManifestHead>> {
        let url = self.repo_url(&format!("manifests/{reference}"));
        let scope = self.pull_scope();
        let accept = media_type::V2_ACCEPT.join(", ");
        let response = self
            .execute(Method::HEAD, &url, Some(&accept), None, &scope)
            .await?;
        match response.status() {
            StatusCode::OK => Ok(Some(ManifestHead {
                digest: header_digest(&response),
                media_type: header_string(&response, header::CONTENT_TYPE.as_str()),
                size: response.content_length(),
            })),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(status_error(response, &url)),
        }
    }

    /// Fetch a manifest with full schema negotiation.
    pub async fn get_manifest(&mut self, reference: &Reference) -> Result<ManifestPull> {
        let url = self.repo_url(&format!("manifests/{reference}"));
        let scope = self.pull_scope();
        let accept = media_type::V2_ACCEPT.join(", ");
        let response = self
            .execute(Method::GET, &url, Some(&accept), None, &scope)
            .await?;
        match response.status() {
            StatusCode::OK => Ok(ManifestPull {
                media_type: header_string(&response, header::CONTENT_TYPE.as_str()),
                digest: header_digest(&response),
                bytes: response.bytes().await?,
            }),
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(url)),
            _ => Err(status_error(response, &url)),
        }
    }

    /// Push a manifest under the given reference.
    pub async fn put_manifest(
        &mut self,
        reference: &Reference,
        media_type: &str,
        bytes: Bytes,
    ) -> Result<OciDigest> {
        let url = self.repo_url(&format!("manifests/{reference}"));
        let scope = self.push_scope();
        let response = self
            .execute_with_content_type(
                Method::PUT,
                &url,
                None,
                Some(media_type),
                Some(bytes),
                &scope,
            )
            .await?;
        if response.status() != StatusCode::CREATED && response.status() != StatusCode::OK {
            return Err(status_error(response, &url));
        }
        header_digest(&response).ok_or(ClientError::MissingHeader("Docker-Content-Digest"))
    }

    /// Delete a tag or manifest.
    pub async fn delete_manifest(&mut self, reference: &Reference) -> Result<()> {
        let url = self.repo_url(&format!("manifests/{reference}"));
        let scope = self.push_scope();
        let response = self.execute(Method::DELETE, &url, None, None, &scope).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(status_error(response, &url));
        }
        Ok(())
    }

    /// Check if a blob with the given digest exists.
    pub async fn blob_exists(&mut self, digest: &OciDigest) -> Result<bool> {
        let url = self.repo_url(&format!("blobs/{digest}"));
        let scope = self.pull_scope();
        let response = self.execute(Method::HEAD, &url, None, None, &scope).await?;
        Ok(response.status() == StatusCode::OK)
    }

    /// Fetch a blob with the given digest.
    pub async fn fetch_blob(&mut self, digest: &OciDigest) -> Result<Bytes> {
        let response = self.open_blob(digest).await?;
        Ok(response.bytes().await?)
    }

    /// Open a blob response for streaming consumption.
    pub async fn open_blob(&mut self, digest: &OciDigest) -> Result<Response> {
        let url = self.repo_url(&format!("blobs/{digest}"));
        let scope = self.pull_scope();
        let response = self.execute(Method::GET, &url, None, None, &scope).await?;
        match response.status() {
            StatusCode::OK => Ok(response),
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(url)),
            _ => Err(status_error(response, &url)),
        }
    }

    /// Upload content in a single monolithic request.
    pub async fn upload_bytes(&mut self, media_type: &str, content: &[u8]) -> Result<Descriptor> {
        let digest = OciDigest::sha256_of(content);

        let upload_url = self.start_upload().await?;
        let complete_url = with_query(&upload_url, &[("digest", &digest.to_string())]);
        let scope = self.push_scope();
        let response = self
            .execute(
                Method::PUT,
                &complete_url,
                None,
                Some(Bytes::copy_from_slice(content)),
                &scope,
            )
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(status_error(response, &complete_url));
        }

        Ok(Descriptor {
            media_type: media_type.to_string(),
            digest,
            size: content.len() as u64,
            platform: None,
            annotations: None,
            urls: None,
        })
    }

    /// Upload content in contiguous chunks via PATCH requests.
    pub async fn upload_chunked(
        &mut self,
        media_type: &str,
        content: &[u8],
        chunk_size: usize,
    ) -> Result<Descriptor> {
        let digest = OciDigest::sha256_of(content);
        let upload_url = self.start_upload().await?;
        let scope = self.push_scope();

        let mut offset = 0;
        while offset < content.len() {
            let end = usize::min(offset + chunk_size, content.len());
            let chunk = Bytes::copy_from_slice(&content[offset..end]);
            let response = self
                .http
                .patch(&upload_url)
                .header(header::CONTENT_TYPE, media_type::OCTET_STREAM)
                .header(header::CONTENT_LENGTH, chunk.len())
                .header("Content-Range", format!("{}-{}", offset, end - 1))
                .header(
                    header::AUTHORIZATION,
                    self.authorization_value(&scope).await?,
                )
                .body(chunk)
                .send()
                .await?;
            if response.status() != StatusCode::ACCEPTED {
                return Err(status_error(response, &upload_url));
            }
            offset = end;
        }

        let complete_url = with_query(&upload_url, &[("digest", &digest.to_string())]);
        let response = self
            .execute(Method::PUT, &complete_url, None, Some(Bytes::new()), &scope)
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(status_error(response, &complete_url));
        }

        Ok(Descriptor {
            media_type: media_type.to_string(),
            digest,
            size: content.len() as u64,
            platform: None,
            annotations: None,
            urls: None,
        })
    }

    /// Attempt a cross-repository blob mount; returns true when the registry
    /// short-circuited the upload.
    pub async fn mount_blob(&mut self, digest: &OciDigest, from: &str) -> Result<bool> {
        let url = with_query(
            &self.repo_url("blobs/uploads/"),
            &[("mount", &digest.to_string()), ("from", &from.to_string())],
        );
        let scope = format!(
            "repository:{}:pull,push repository:{}:pull",
            self.repository, from
        );
        let response = self
            .execute(Method::POST, &url, None, Some(Bytes::new()), &scope)
            .await?;
        match response.status() {
            StatusCode::CREATED => Ok(true),
            StatusCode::ACCEPTED => Ok(false),
            _ => Err(status_error(response, &url)),
        }
    }

    /// Read the signatures stored for a manifest via the API extension.
    pub async fn get_signatures(&mut self, digest: &OciDigest) -> Result<SignatureList> {
        let url = format!(
            "{}/extensions/v2/{}/signatures/{}",
            self.registry_url, self.repository, digest
        );
        let scope = self.pull_scope();
        let response = self.execute(Method::GET, &url, None, None, &scope).await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(url)),
            _ => Err(status_error(response, &url)),
        }
    }

    /// Store a signature for a manifest via the API extension.
    pub async fn put_signature(&mut self, digest: &OciDigest, payload: Bytes) -> Result<()> {
        let url = format!(
            "{}/extensions/v2/{}/signatures/{}",
            self.registry_url, self.repository, digest
        );
        let scope = self.push_scope();
        let response = self
            .execute(Method::PUT, &url, None, Some(payload), &scope)
            .await?;
        if response.status() != StatusCode::CREATED && response.status() != StatusCode::ACCEPTED {
            return Err(status_error(response, &url));
        }
        Ok(())
    }

    async fn start_upload(&mut self) -> Result<String> {
        let url = self.repo_url("blobs/uploads/");
        let scope = self.push_scope();
        let response = self
            .execute(Method::POST, &url, None, Some(Bytes::new()), &scope)
            .await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(status_error(response, &url));
        }
        let location = header_string(&response, header::LOCATION.as_str())
            .ok_or(ClientError::MissingHeader("Location"))?;
        // Relative Location headers are resolved against the registry root;
        // absolute ones must be kept byte-for-byte as the server encoded them.
        Ok(if location.starts_with("http") {
            location
        } else {
            format!("{}{}", self.registry_url, location)
        })
    }

    async fn authorization_value(&mut self, scope: &str) -> Result<String> {
        if self.token.is_none() {
            // Probe once so the challenge can hand us a token if needed.
            let url = format!("{}/v2/", self.registry_url);
            let _ = self
                .send_once(Method::GET, &url, None, None, None, scope)
                .await?;
        }
        Ok(match (&self.token, &self.auth) {
            (Some(token), _) => format!("Bearer {token}"),
            (None, Some(auth)) => auth.header_value(),
            (None, None) => String::new(),
        })
    }
}

fn status_error(response: Response, url: &str) -> ClientError {
    if response.status() == StatusCode::TOO_MANY_REQUESTS {
        ClientError::RateLimited(url.to_string())
    } else {
        ClientError::Status {
            status: response.status(),
            url: url.to_string(),
        }
    }
}

fn header_string(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn header_digest(response: &Response) -> Option<OciDigest> {
    header_string(response, "Docker-Content-Digest").and_then(|v| v.parse().ok())
}

/// Resolve an RFC 5988 `Link: <…>; rel="next"` header against the registry.
fn next_link(response: &Response, registry_url: &str) -> Option<String> {
    let link = header_string(response, header::LINK.as_str())?;
    let target = link.split(';').next()?.trim().trim_matches(['<', '>']);
    Some(if target.starts_with("http") {
        target.to_string()
    } else {
        format!("{registry_url}{target}")
    })
}

fn with_query(url: &str, params: &[(&str, &String)]) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{url}{sep}{query}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge() {
        let challenge = parse_bearer_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:alice/img:pull""#,
        )
        .unwrap();
        assert_eq!(
            challenge.realm.as_deref(),
            Some("https://auth.example.com/token")
        );
        assert_eq!(challenge.service.as_deref(), Some("registry.example.com"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:alice/img:pull")
        );
    }

    #[test]
    fn challenge_without_realm_is_rejected() {
        assert_eq!(parse_bearer_challenge("Bearer service=\"x\""), None);
        assert_eq!(parse_bearer_challenge("Basic realm=\"x\""), None);
    }

    #[test]
    fn sanitizes_url_paths() {
        assert_eq!(
            urlpath_sanitize(&["https://sigstore.example.com/", "/library/busybox", ""]),
            "https://sigstore.example.com/library/busybox"
        );
    }

    #[test]
    fn appends_query_parameters() {
        let url = with_query("http://r/v2/a/blobs/uploads/u1", &[("digest", &"sha256:x".to_string())]);
        assert_eq!(url, "http://r/v2/a/blobs/uploads/u1?digest=sha256:x");
        let url = with_query(&url, &[("extra", &"1".to_string())]);
        assert!(url.ends_with("&extra=1"));
    }
}
