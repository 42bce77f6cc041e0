// Copyright 2017 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::len_without_is_empty, clippy::new_without_default)]

//! Two distinct notions of "hash" are used by the engine, and this crate keeps them separate:
//!
//! - [`Fingerprint`]/[`Digest`] are always SHA-256, and key *object identifiers* — the
//!   deterministic hash of a stage invocation that the store uses to cache committed trees.
//! - [`ContentHash`] names *source blobs*. It carries its own algorithm tag because manifests are
//!   free to reference content by whatever digest the original packager published.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use serde::de::{Deserialize, Deserializer, Visitor};
use serde::ser::{Serialize, Serializer};
use sha2::{Digest as Sha256Digest, Sha256};

pub mod content_hash;
pub use content_hash::{ContentHash, HashAlgorithm};

pub const FINGERPRINT_SIZE: usize = 32;

pub const EMPTY_FINGERPRINT: Fingerprint = Fingerprint([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);

pub const EMPTY_DIGEST: Digest = Digest {
    hash: EMPTY_FINGERPRINT,
    size_bytes: 0,
};

/// A raw 256-bit SHA-256 fingerprint.
#[derive(Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn from_bytes_unsafe(bytes: &[u8]) -> Fingerprint {
        if bytes.len() != FINGERPRINT_SIZE {
            panic!(
                "Input value was not a fingerprint; had length: {}",
                bytes.len()
            );
        }
        let mut fingerprint = [0; FINGERPRINT_SIZE];
        fingerprint.clone_from_slice(&bytes[0..FINGERPRINT_SIZE]);
        Fingerprint(fingerprint)
    }

    pub fn from_hex_string(hex_string: &str) -> Result<Fingerprint, String> {
        let bytes = hex::decode(hex_string).map_err(|e| format!("{e:?}"))?;
        if bytes.len() != FINGERPRINT_SIZE {
            return Err(format!(
                "Input hex string was not a fingerprint; had length: {}",
                bytes.len()
            ));
        }
        Ok(Fingerprint::from_bytes_unsafe(&bytes))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    #[allow(clippy::wrong_self_convention)]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", self.to_hex())
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::from_hex_string(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_hex().as_str())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FingerprintVisitor;

        impl<'de> Visitor<'de> for FingerprintVisitor {
            type Value = Fingerprint;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a hex-encoded 32 byte fingerprint")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Fingerprint::from_hex_string(v).map_err(|err| {
                    serde::de::Error::invalid_value(serde::de::Unexpected::Str(v), &err.as_str())
                })
            }
        }

        deserializer.deserialize_str(FingerprintVisitor)
    }
}

/// A [`Fingerprint`] paired with the size of the plaintext it was computed from.
///
/// Equivalent to a Bazel Remote Execution Digest, without the overhead of a full protobuf.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Digest {
    pub hash: Fingerprint,
    pub size_bytes: usize,
}

impl Digest {
    pub fn new(hash: Fingerprint, size_bytes: usize) -> Digest {
        Digest { hash, size_bytes }
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::default();
        hasher.update(bytes);
        Digest::new(Fingerprint::from_bytes_unsafe(&hasher.finalize()), bytes.len())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.size_bytes)
    }
}

/// A `Write` adapter that fingerprints every byte that passes through it.
///
/// Used to hash a stage's serialized invocation (name, canonical options, input ids, upstream
/// id) in one pass as it is written into the hasher, the same pattern the teacher's
/// `WriterHasher` uses to fingerprint file contents as they are copied into the store.
pub struct WriterHasher<T> {
    hasher: Sha256,
    byte_count: usize,
    inner: T,
}

impl<T> WriterHasher<T> {
    pub fn new(inner: T) -> WriterHasher<T> {
        WriterHasher {
            hasher: Sha256::default(),
            byte_count: 0,
            inner,
        }
    }

    pub fn finish(self) -> (Digest, T) {
        (
            Digest::new(Fingerprint::from_bytes_unsafe(&self.hasher.finalize()), self.byte_count),
            self.inner,
        )
    }
}

impl<W: Write> Write for WriterHasher<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[0..written]);
        self.byte_count += written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copy the data from `reader` to `writer`, and hash the bytes in one pass.
pub fn copy_and_hash<R: ?Sized, W: ?Sized>(reader: &mut R, writer: &mut W) -> io::Result<Digest>
where
    R: io::Read,
    W: io::Write,
{
    let mut hasher = WriterHasher::new(writer);
    io::copy(reader, &mut hasher)?;
    Ok(hasher.finish().0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest_matches_sha256_of_empty_input() {
        assert_eq!(Digest::of_bytes(b""), EMPTY_DIGEST);
    }

    #[test]
    fn fingerprint_round_trips_through_hex() {
        let digest = Digest::of_bytes(b"hello world");
        let hex = digest.hash.to_hex();
        assert_eq!(Fingerprint::from_hex_string(&hex).unwrap(), digest.hash);
    }

    #[test]
    fn copy_and_hash_matches_of_bytes() {
        let mut reader: &[u8] = b"some pipeline contents";
        let mut writer = Vec::new();
        let digest = copy_and_hash(&mut reader, &mut writer).unwrap();
        assert_eq!(digest, Digest::of_bytes(b"some pipeline contents"));
        assert_eq!(writer, b"some pipeline contents");
    }
}
