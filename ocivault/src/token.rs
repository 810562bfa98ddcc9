//! Bearer-token issuance and verification.
//!
//! Tokens follow the Docker registry token format: a JWT whose `access`
//! claim lists the intersection of the requested scope and the user's
//! evaluated permissions. Signing is asymmetric only (ES256/RS256/PS256,
//! PEM key files); the `kid` header is derived from the public key in the
//! libtrust format older clients verify against.

use std::collections::BTreeSet;
use std::fs;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::config::{AppConfig, NamespaceRoles};
use crate::error::{AppError, Result};

pub const VALID_ACTIONS: [&str; 3] = ["pull", "push", "*"];

/// One `type:resource:actions` component of a scope request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub kind: ScopeKind,
    pub name: String,
    pub actions: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Repository,
    Registry,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Repository => "repository",
            ScopeKind::Registry => "registry",
        }
    }
}

impl Scope {
    /// Parse a single scope component; unknown types and actions are
    /// rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(3, ':');
        let (Some(kind), Some(name), Some(actions)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(AppError::BadRequest(format!("malformed scope: {raw}")));
        };
        let kind = match kind {
            "repository" => ScopeKind::Repository,
            "registry" => ScopeKind::Registry,
            other => {
                return Err(AppError::BadRequest(format!("unknown scope type: {other}")));
            }
        };
        let actions: BTreeSet<String> = actions
            .split(',')
            .filter(|a| !a.is_empty())
            .map(|a| a.to_string())
            .collect();
        if actions.is_empty() || actions.iter().any(|a| !VALID_ACTIONS.contains(&a.as_str())) {
            return Err(AppError::BadRequest(format!("invalid actions in scope: {raw}")));
        }
        Ok(Self {
            kind,
            name: name.to_string(),
            actions,
        })
    }

    /// Parse a full scope query value (space-separated components).
    pub fn parse_all(raw: &str) -> Result<Vec<Self>> {
        raw.split_whitespace().map(Self::parse).collect()
    }
}

/// One granted access entry inside a token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub actions: Vec<String>,
}

impl AccessEntry {
    pub fn permits(&self, kind: ScopeKind, name: &str, action: &str) -> bool {
        self.kind == kind.as_str()
            && self.name == name
            && (self.actions.iter().any(|a| a == action) || self.actions.iter().any(|a| a == "*"))
    }
}

/// Claim set of an issued token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
    pub jti: String,
    #[serde(default)]
    pub access: Vec<AccessEntry>,
}

impl Claims {
    pub fn permits(&self, kind: ScopeKind, name: &str, action: &str) -> bool {
        self.access.iter().any(|entry| entry.permits(kind, name, action))
    }

    pub fn is_anonymous(&self) -> bool {
        self.sub.is_empty()
    }
}

/// Wire shape of the token endpoint response.
#[derive(Debug, Clone, Serialize)]
pub struct TokenReply {
    pub token: String,
    pub expires_in: u64,
    pub issued_at: String,
}

/// What the permission evaluator knows about a scope's target path.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeTarget {
    pub exists: bool,
    pub private: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Owner,
    Collaborator,
    Consumer,
}

pub struct TokenService {
    issuer: String,
    service: String,
    algorithm: Algorithm,
    expiration_seconds: u64,
    encoding_key: Option<EncodingKey>,
    decoding_key: Option<DecodingKey>,
    kid: Option<String>,
    accounts: std::collections::HashMap<String, String>,
    namespaces: std::collections::HashMap<String, NamespaceRoles>,
}

impl TokenService {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let token = &config.token;
        let algorithm = parse_algorithm(&token.signature_algorithm)?;

        let (encoding_key, decoding_key, kid) = if token.auth_disabled {
            (None, None, None)
        } else {
            let private_path = token.private_key_path.as_ref().ok_or_else(|| {
                AppError::Config("token auth requires token.private_key_path".to_string())
            })?;
            let public_path = token.public_key_path.as_ref().ok_or_else(|| {
                AppError::Config("token auth requires token.public_key_path".to_string())
            })?;
            let private_pem = fs::read(private_path)
                .map_err(|e| AppError::Config(format!("cannot read private key: {e}")))?;
            let public_pem = fs::read(public_path)
                .map_err(|e| AppError::Config(format!("cannot read public key: {e}")))?;

            let encoding_key = match algorithm {
                Algorithm::ES256 => EncodingKey::from_ec_pem(&private_pem),
                Algorithm::RS256 | Algorithm::PS256 => EncodingKey::from_rsa_pem(&private_pem),
                _ => unreachable!(),
            }
            .map_err(|e| AppError::Config(format!("invalid private key: {e}")))?;
            let decoding_key = match algorithm {
                Algorithm::ES256 => DecodingKey::from_ec_pem(&public_pem),
                Algorithm::RS256 | Algorithm::PS256 => DecodingKey::from_rsa_pem(&public_pem),
                _ => unreachable!(),
            }
            .map_err(|e| AppError::Config(format!("invalid public key: {e}")))?;

            let kid = kid_from_public_pem(&public_pem)?;
            (Some(encoding_key), Some(decoding_key), Some(kid))
        };

        Ok(Self {
            issuer: token
                .server_url
                .clone()
                .unwrap_or_else(|| token.service.clone()),
            service: token.service.clone(),
            algorithm,
            expiration_seconds: token.expiration_seconds,
            encoding_key,
            decoding_key,
            kid,
            accounts: config.accounts.clone(),
            namespaces: config.namespaces.clone(),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Validate Basic credentials against the account table.
    pub fn check_basic(&self, username: &str, password: &str) -> bool {
        self.accounts.get(username).map(String::as_str) == Some(password)
    }

    fn role_of(&self, user: &str, namespace: &str) -> Option<Role> {
        let roles = self.namespaces.get(namespace)?;
        if roles.owners.iter().any(|u| u == user) {
            Some(Role::Owner)
        } else if roles.collaborators.iter().any(|u| u == user) {
            Some(Role::Collaborator)
        } else if roles.consumers.iter().any(|u| u == user) {
            Some(Role::Consumer)
        } else {
            None
        }
    }

    fn namespace_of(path: &str) -> &str {
        path.split('/').next().unwrap_or(path)
    }

    /// Whether the user may pull from the given path.
    pub fn has_pull_permission(
        &self,
        user: Option<&str>,
        path: &str,
        target: Option<&ScopeTarget>,
    ) -> bool {
        match target {
            Some(target) if target.exists => {
                if !target.private {
                    return true;
                }
                match user {
                    Some(user) => self.role_of(user, Self::namespace_of(path)).is_some(),
                    None => false,
                }
            }
            _ => false,
        }
    }

    /// Whether the user may push to the given path, creating it if absent.
    pub fn has_push_permission(
        &self,
        user: Option<&str>,
        path: &str,
        target: Option<&ScopeTarget>,
    ) -> bool {
        let Some(user) = user else {
            return false;
        };
        let namespace = Self::namespace_of(path);
        match target {
            Some(target) if target.exists => matches!(
                self.role_of(user, namespace),
                Some(Role::Owner) | Some(Role::Collaborator)
            ),
            _ => {
                // The path does not exist yet; this is a create. A user may
                // always create the namespace matching their own username.
                if namespace == user {
                    return true;
                }
                matches!(
                    self.role_of(user, namespace),
                    Some(Role::Owner) | Some(Role::Collaborator)
                )
            }
        }
    }

    /// Whether the user may delete content below the namespace.
    pub fn has_owner_permission(&self, user: Option<&str>, path: &str) -> bool {
        let Some(user) = user else {
            return false;
        };
        let namespace = Self::namespace_of(path);
        namespace == user || self.role_of(user, namespace) == Some(Role::Owner)
    }

    /// Intersect one requested scope with the user's permissions.
    ///
    /// A granted push always implies pull, the way registry clients expect.
    pub fn evaluate(
        &self,
        user: Option<&str>,
        scope: &Scope,
        target: Option<&ScopeTarget>,
    ) -> AccessEntry {
        let mut permitted: BTreeSet<String> = BTreeSet::new();
        match scope.kind {
            ScopeKind::Repository => {
                if scope.actions.contains("push")
                    && self.has_push_permission(user, &scope.name, target)
                {
                    permitted.insert("push".to_string());
                    permitted.insert("pull".to_string());
                }
                if scope.actions.contains("pull")
                    && !permitted.contains("pull")
                    && self.has_pull_permission(user, &scope.name, target)
                {
                    permitted.insert("pull".to_string());
                }
            }
            ScopeKind::Registry => {
                // The catalog is visible to any authenticated account; the
                // endpoint filters entries by per-repository pull access.
                if scope.name == "catalog" && scope.actions.contains("*") && user.is_some() {
                    permitted.insert("*".to_string());
                }
            }
        }
        AccessEntry {
            kind: scope.kind.as_str().to_string(),
            name: scope.name.clone(),
            actions: permitted.into_iter().collect(),
        }
    }

    /// Issue a token carrying the given access entries.
    ///
    /// Unauthenticated requests produce a token with empty access; that is
    /// how anonymous pulls from public repositories work.
    pub fn issue(&self, user: Option<&str>, access: Vec<AccessEntry>) -> Result<TokenReply> {
        let encoding_key = self.encoding_key.as_ref().ok_or_else(|| {
            AppError::Config("token signing is disabled".to_string())
        })?;

        let now = OffsetDateTime::now_utc();
        let iat = now.unix_timestamp();
        let claims = Claims {
            iss: self.issuer.clone(),
            sub: user.unwrap_or_default().to_string(),
            aud: self.service.clone(),
            exp: iat + self.expiration_seconds as i64,
            iat,
            nbf: iat,
            jti: Uuid::new_v4().to_string(),
            access,
        };

        let mut header = Header::new(self.algorithm);
        header.kid = self.kid.clone();
        let token = encode(&header, &claims, encoding_key)
            .map_err(|e| AppError::Internal(format!("token generation failed: {e}")))?;
        debug!(sub = %claims.sub, jti = %claims.jti, "issued token");

        Ok(TokenReply {
            token,
            expires_in: self.expiration_seconds,
            issued_at: now
                .format(&time::format_description::well_known::Rfc3339)
                .map_err(|e| AppError::Internal(e.to_string()))?,
        })
    }

    /// Verify a presented token: signature, expiry, nbf and audience.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AppError::unauthorized("token auth is disabled"))?;
        let mut validation = Validation::new(self.algorithm);
        validation.set_audience(&[&self.service]);
        validation.validate_nbf = true;
        let data = decode::<Claims>(token, decoding_key, &validation)
            .map_err(|e| AppError::unauthorized(format!("invalid token: {e}")))?;
        Ok(data.claims)
    }
}

fn parse_algorithm(name: &str) -> Result<Algorithm> {
    match name {
        "ES256" => Ok(Algorithm::ES256),
        "RS256" => Ok(Algorithm::RS256),
        "PS256" => Ok(Algorithm::PS256),
        other => Err(AppError::Config(format!(
            "unsupported token signature algorithm {other}; use ES256, RS256 or PS256"
        ))),
    }
}

/// Derive the libtrust-compatible `kid` header from a PEM public key:
/// base32 of the first 30 hex chars of the DER's sha256, in groups of four.
fn kid_from_public_pem(pem: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(pem)
        .map_err(|_| AppError::Config("public key is not valid UTF-8 PEM".to_string()))?;
    let body: String = text
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let der = BASE64
        .decode(body.trim())
        .map_err(|e| AppError::Config(format!("malformed public key PEM: {e}")))?;

    let mut hasher = Sha256::new();
    hasher.update(&der);
    let truncated = hex::encode(hasher.finalize())[..30].to_string();
    let encoded = base32_encode(truncated.as_bytes());

    let mut kid = String::new();
    for (index, c) in encoded.chars().enumerate() {
        if index > 0 && index % 4 == 0 {
            kid.push(':');
        }
        kid.push(c);
    }
    Ok(kid)
}

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// RFC 4648 base32 without padding. Thirty input bytes encode to exactly
/// 48 characters, which is all the kid derivation needs.
fn base32_encode(data: &[u8]) -> String {
    let mut out = String::new();
    let mut buffer: u64 = 0;
    let mut bits = 0u32;
    for byte in data {
        buffer = (buffer << 8) | *byte as u64;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}
