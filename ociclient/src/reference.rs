use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::digest::OciDigest;

/// Error type for image reference parsing
#[derive(Debug, Error)]
pub enum ImageReferenceError {
    #[error("Invalid image reference format: {0}")]
    InvalidFormat(String),
}

/// A tag name or a digest, the two ways a manifest can be addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest(OciDigest),
}

impl Reference {
    /// Parse a reference segment; digests are recognized by the `algo:hex` shape.
    pub fn parse(s: &str) -> Self {
        match OciDigest::from_str(s) {
            Ok(digest) => Reference::Digest(digest),
            Err(_) => Reference::Tag(s.to_string()),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => write!(f, "{digest}"),
        }
    }
}

/// Represents an OCI image reference, `[hostname/]name[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Optional hostname (registry)
    pub hostname: Option<String>,
    /// Repository name, possibly namespaced (`ns/name`)
    pub name: String,
    /// Tag or digest
    pub reference: Reference,
}

impl ImageReference {
    pub fn new(hostname: Option<String>, name: String, reference: Reference) -> Self {
        Self {
            hostname,
            name,
            reference,
        }
    }
}

impl FromStr for ImageReference {
    type Err = ImageReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.starts_with('/') {
            return Err(ImageReferenceError::InvalidFormat(s.to_string()));
        }

        // A digest suffix binds tighter than a tag suffix.
        let (rest, reference) = if let Some((rest, digest)) = s.rsplit_once('@') {
            let digest = OciDigest::from_str(digest)
                .map_err(|_| ImageReferenceError::InvalidFormat(s.to_string()))?;
            (rest, Some(Reference::Digest(digest)))
        } else {
            (s, None)
        };

        // The first path segment is a hostname only when it looks like one.
        let (hostname, rest) = match rest.split_once('/') {
            Some((head, tail)) if head.contains('.') || head.contains(':') || head == "localhost" => {
                (Some(head.to_string()), tail)
            }
            _ => (None, rest),
        };

        let (name, reference) = match reference {
            Some(reference) => (rest.to_string(), reference),
            None => match rest.rsplit_once(':') {
                Some((name, tag)) if !tag.contains('/') => {
                    (name.to_string(), Reference::Tag(tag.to_string()))
                }
                _ => (rest.to_string(), Reference::Tag("latest".to_string())),
            },
        };

        if name.is_empty() {
            return Err(ImageReferenceError::InvalidFormat(s.to_string()));
        }

        Ok(ImageReference {
            hostname,
            name,
            reference,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(hostname) = &self.hostname {
            write!(f, "{hostname}/")?;
        }
        match &self.reference {
            Reference::Tag(tag) => write!(f, "{}:{}", self.name, tag),
            Reference::Digest(digest) => write!(f, "{}@{}", self.name, digest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_only() {
        let r = ImageReference::from_str("library/busybox").unwrap();
        assert_eq!(r.hostname, None);
        assert_eq!(r.name, "library/busybox");
        assert_eq!(r.reference, Reference::Tag("latest".to_string()));
    }

    #[test]
    fn parses_hostname_and_tag() {
        let r = ImageReference::from_str("registry-1.docker.io/library/busybox:1.36").unwrap();
        assert_eq!(r.hostname.as_deref(), Some("registry-1.docker.io"));
        assert_eq!(r.name, "library/busybox");
        assert_eq!(r.reference, Reference::Tag("1.36".to_string()));
    }

    #[test]
    fn parses_port_in_hostname() {
        let r = ImageReference::from_str("localhost:5000/alice/img:v1").unwrap();
        assert_eq!(r.hostname.as_deref(), Some("localhost:5000"));
        assert_eq!(r.name, "alice/img");
    }

    #[test]
    fn parses_digest_reference() {
        let r = ImageReference::from_str(
            "alice/img@sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        )
        .unwrap();
        assert!(matches!(r.reference, Reference::Digest(_)));
        assert_eq!(r.name, "alice/img");
    }

    #[test]
    fn roundtrips_display() {
        for s in ["alice/img:v1", "localhost:5000/alice/img:v1"] {
            assert_eq!(ImageReference::from_str(s).unwrap().to_string(), s);
        }
    }
}
