//! Async client for OCI/Docker distribution registries.
//!
//! Speaks the pull side of the Distribution v2 protocol with Bearer/Basic
//! authentication, schema negotiation across the Docker and OCI manifest
//! media types, paginated listings and retrying downloads. Used by the
//! ocivault synchronizer and its integration tests.

pub mod client;
pub mod digest;
pub mod error;
pub mod models;
pub mod reference;

// Re-export main client types for convenience
pub use client::{
    parse_bearer_challenge, urlpath_sanitize, BearerChallenge, Client, ClientSession, Credentials,
    ManifestHead, ManifestPull, SIGNATURE_HEADER,
};
pub use digest::{DigestAlgorithm, DigestError, OciDigest};
pub use error::{ClientError, Result};
pub use models::{
    media_type, Catalog, Descriptor, ImageIndex, ImageManifest, ManifestVariant, Platform,
    SignatureList, SignedManifestV1, TagList,
};
pub use reference::{ImageReference, Reference};
