use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha224, Sha256, Sha512};
use thiserror::Error;

/// Error type for OCI digest operations
#[derive(Debug, Error)]
pub enum DigestError {
    #[error("Invalid digest format: {0}")]
    InvalidFormat(String),
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// Digest algorithms registered for content addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DigestAlgorithm {
    Sha224,
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    /// Length of the hex representation produced by this algorithm.
    pub fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha224 => 56,
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha512 => 128,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha224 => "sha224",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha224" => Ok(DigestAlgorithm::Sha224),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => Err(DigestError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Represents an OCI content digest, `<algorithm>:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OciDigest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl OciDigest {
    /// Create a new OciDigest with the given algorithm and hex value.
    pub fn new(algorithm: DigestAlgorithm, hex: String) -> Self {
        Self { algorithm, hex }
    }

    /// Digest the given bytes with sha256.
    pub fn sha256_of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            algorithm: DigestAlgorithm::Sha256,
            hex: hex::encode(hasher.finalize()),
        }
    }

    /// Digest the given bytes with the requested algorithm.
    pub fn digest_of(algorithm: DigestAlgorithm, data: &[u8]) -> Self {
        let hex = match algorithm {
            DigestAlgorithm::Sha224 => {
                let mut hasher = Sha224::new();
                hasher.update(data);
                hex::encode(hasher.finalize())
            }
            DigestAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                hex::encode(hasher.finalize())
            }
            DigestAlgorithm::Sha512 => {
                let mut hasher = Sha512::new();
                hasher.update(data);
                hex::encode(hasher.finalize())
            }
        };
        Self { algorithm, hex }
    }

    /// Get the algorithm part of the digest.
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Get the hex part of the digest.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for OciDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for OciDigest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| DigestError::InvalidFormat(s.to_string()))?;

        let algorithm = DigestAlgorithm::from_str(algorithm)?;

        if hex.len() != algorithm.hex_len()
            || !hex.chars().all(|c| c.is_ascii_hexdigit())
            || hex.chars().any(|c| c.is_ascii_uppercase())
        {
            return Err(DigestError::InvalidFormat(s.to_string()));
        }

        Ok(OciDigest {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl serde::Serialize for OciDigest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for OciDigest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        OciDigest::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn parses_valid_sha256() {
        let digest = OciDigest::from_str(EMPTY_SHA256).unwrap();
        assert_eq!(digest.algorithm(), DigestAlgorithm::Sha256);
        assert_eq!(digest.to_string(), EMPTY_SHA256);
    }

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(OciDigest::sha256_of(b"").to_string(), EMPTY_SHA256);
    }

    #[test]
    fn rejects_bad_hex_length() {
        assert!(OciDigest::from_str("sha256:abcd").is_err());
    }

    #[test]
    fn rejects_unknown_algorithm() {
        let err = OciDigest::from_str("md5:d41d8cd98f00b204e9800998ecf8427e").unwrap_err();
        assert!(matches!(err, DigestError::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn rejects_uppercase_hex() {
        let upper = EMPTY_SHA256.to_uppercase().replace("SHA256", "sha256");
        assert!(OciDigest::from_str(&upper).is_err());
    }

    #[test]
    fn digest_of_matches_algorithm_width() {
        let d = OciDigest::digest_of(DigestAlgorithm::Sha512, b"layer");
        assert_eq!(d.hex().len(), 128);
        let d = OciDigest::digest_of(DigestAlgorithm::Sha224, b"layer");
        assert_eq!(d.hex().len(), 56);
    }
}
