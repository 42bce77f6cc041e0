//! Multi-algorithm content hashes, as used to name source blobs (spec §3: `<algo>:<hex>`).
//!
//! Unlike [`crate::Fingerprint`] (always SHA-256, used for object identifiers), a manifest's
//! source references carry whatever digest algorithm the upstream packager published, so this
//! type dispatches over a small fixed algorithm set rather than hard-coding one hasher.

use std::fmt;
use std::str::FromStr;

use md5::Md5;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use sha1::Sha1;
use sha2::{Digest as _, Sha256, Sha384, Sha512};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    fn digest_hex(self, bytes: &[u8]) -> String {
        match self {
            HashAlgorithm::Md5 => hex::encode(Md5::digest(bytes)),
            HashAlgorithm::Sha1 => hex::encode(Sha1::digest(bytes)),
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
            HashAlgorithm::Sha384 => hex::encode(Sha384::digest(bytes)),
            HashAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(format!("unsupported content hash algorithm: {other}")),
        }
    }
}

/// A `<algo>:<hex>` content hash naming an immutable source blob.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ContentHash {
    pub algorithm: HashAlgorithm,
    pub hex: String,
}

impl ContentHash {
    pub fn of_bytes(algorithm: HashAlgorithm, bytes: &[u8]) -> Self {
        ContentHash {
            algorithm,
            hex: algorithm.digest_hex(bytes),
        }
    }

    /// The filename a blob with this hash is stored under (spec §4.1: `sources/<type>/<hash>`).
    pub fn filename(&self) -> String {
        self.to_string()
    }

    /// Verify that `bytes` hashes to this content hash (spec invariant: a source blob's filename
    /// equals the hash of its contents).
    pub fn matches(&self, bytes: &[u8]) -> bool {
        self.algorithm.digest_hex(bytes) == self.hex
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.hex)
    }
}

impl FromStr for ContentHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| format!("content hash {s:?} is missing an `<algo>:` prefix"))?;
        let algorithm: HashAlgorithm = algo.parse()?;
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("content hash {s:?} has a non-hex digest part"));
        }
        Ok(ContentHash {
            algorithm,
            hex: hex.to_lowercase(),
        })
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_algo_and_hex() {
        let ch: ContentHash = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            .parse()
            .unwrap();
        assert_eq!(ch.algorithm, HashAlgorithm::Sha256);
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!("deadbeef".parse::<ContentHash>().is_err());
    }

    #[test]
    fn rejects_unknown_algorithm() {
        assert!("sha3:deadbeef".parse::<ContentHash>().is_err());
    }

    #[test]
    fn of_bytes_round_trips_through_matches() {
        let ch = ContentHash::of_bytes(HashAlgorithm::Sha256, b"payload");
        assert!(ch.matches(b"payload"));
        assert!(!ch.matches(b"tampered"));
    }

    #[test]
    fn display_and_parse_round_trip() {
        let ch = ContentHash::of_bytes(HashAlgorithm::Md5, b"x");
        let s = ch.to_string();
        assert_eq!(s.parse::<ContentHash>().unwrap(), ch);
    }
}
