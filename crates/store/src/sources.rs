// Sources: launch a fetcher program for a source type, and validate what it produced
// (spec §4.2). The fetcher itself decides how to honor `checksums` (HTTP download, OSTree pull,
// ...); the engine's only job here is to hand it a `cache`/`output` directory pair and confirm
// every requested hash landed in `output/` under its own name before promoting those blobs into
// the store's persistent `sources/<type>/` directory.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use hashing::ContentHash;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Store, StoreError};

#[derive(Debug, Clone, Serialize)]
struct FetcherStdin<'a> {
    items: &'a Value,
    options: &'a Value,
    checksums: &'a [String],
    cache: String,
    output: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FetcherStdout {
    Error { error: String },
    Metadata(Value),
}

/// A request to materialize a set of content hashes for one source type.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub source_type: String,
    pub fetcher_path: PathBuf,
    pub items: Value,
    pub options: Value,
    pub checksums: Vec<ContentHash>,
}

/// What a successful fetch produced.
#[derive(Debug, Clone)]
pub struct SourceOutcome {
    pub metadata: Value,
    pub blob_paths: Vec<PathBuf>,
}

pub struct SourceFetcher<'a> {
    store: &'a Store,
}

impl<'a> SourceFetcher<'a> {
    pub fn new(store: &'a Store) -> SourceFetcher<'a> {
        SourceFetcher { store }
    }

    /// Run the fetcher and, on success, promote its validated blobs into the store.
    pub fn fetch(&self, req: FetchRequest) -> Result<SourceOutcome, StoreError> {
        let cache_dir = self.store.source(&format!("{}.cache", req.source_type))?;
        let output_dir = tempfile::Builder::new()
            .prefix("source-output-")
            .tempdir_in(self.store.tmp_dir())?;

        let checksum_strings: Vec<String> = req.checksums.iter().map(ToString::to_string).collect();
        let stdin_payload = FetcherStdin {
            items: &req.items,
            options: &req.options,
            checksums: &checksum_strings,
            cache: cache_dir.display().to_string(),
            output: output_dir.path().display().to_string(),
        };
        let stdin_json = serde_json::to_vec(&stdin_payload)
            .map_err(|e| StoreError::Io(format!("serializing fetcher stdin: {e}")))?;

        log::info!(
            "fetching {} checksum(s) via source {:?}",
            req.checksums.len(),
            req.source_type
        );

        let mut child = Command::new(&req.fetcher_path)
            .env_clear()
            .env("PATH", "/usr/bin:/bin")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                StoreError::Io(format!("launching fetcher {:?}: {e}", req.fetcher_path))
            })?;
        child
            .stdin
            .take()
            .expect("piped stdin")
            .write_all(&stdin_json)?;
        let output = child.wait_with_output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StoreError::SourceInvalid(format!(
                "fetcher for {:?} exited with {}: {stderr}",
                req.source_type, output.status
            )));
        }

        let stdout: FetcherStdout = serde_json::from_slice(&output.stdout).map_err(|e| {
            StoreError::SourceInvalid(format!("fetcher for {:?} wrote invalid JSON: {e}", req.source_type))
        })?;
        let metadata = match stdout {
            FetcherStdout::Error { error } => {
                return Err(StoreError::SourceInvalid(format!(
                    "fetcher for {:?} reported: {error}",
                    req.source_type
                )))
            }
            FetcherStdout::Metadata(value) => value,
        };

        let mut blob_paths = Vec::with_capacity(req.checksums.len());
        for checksum in &req.checksums {
            let produced = output_dir.path().join(checksum.filename());
            if !produced.is_file() {
                return Err(StoreError::SourceInvalid(format!(
                    "fetcher for {:?} did not produce requested blob {checksum}",
                    req.source_type
                )));
            }
            let contents = std::fs::read(&produced)?;
            if !checksum.matches(&contents) {
                let _ = std::fs::remove_file(&produced);
                return Err(StoreError::SourceInvalid(format!(
                    "blob for {checksum} does not hash to its own name"
                )));
            }
            let dest_dir = self.store.source(&req.source_type)?;
            let dest = dest_dir.join(checksum.filename());
            if !dest.exists() {
                std::fs::rename(&produced, &dest)?;
            }
            blob_paths.push(dest);
        }

        Ok(SourceOutcome {
            metadata,
            blob_paths,
        })
    }
}

#[cfg(test)]
mod tests;
