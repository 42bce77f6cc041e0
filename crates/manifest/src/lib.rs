// Copyright 2017 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::len_without_is_empty)]

//! The serde data model for the manifest JSON document (spec §6), kept free of any planning or
//! execution logic so it can be parsed, validated, and round-tripped (for `--inspect` output) in
//! isolation — the same separation the teacher draws between its `address`/`options` crates (pure
//! data) and the `graph`/`rule_graph` crates that act on them.

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `references` metadata keys must look like `rpm.check_gpg` (spec §6).
static METADATA_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w+\.\w+$").unwrap());

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Manifest {
    pub pipeline: Pipeline,
    #[serde(default)]
    pub sources: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Pipeline {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Box<Pipeline>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<String>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assembler: Option<Stage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Stage {
    pub name: String,
    #[serde(default = "empty_object")]
    pub options: Value,
    #[serde(default)]
    pub inputs: BTreeMap<String, Input>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize)]
pub enum Origin {
    #[serde(rename = "org.osbuild.source")]
    Source,
    #[serde(rename = "org.osbuild.pipeline")]
    Pipeline,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Input {
    #[serde(rename = "type")]
    pub type_: String,
    pub origin: Origin,
    pub references: References,
}

/// `references` accepts either an ordered array of hashes, or an object whose keys are hashes
/// and whose values carry per-reference metadata (spec §6). Which shape was used is preserved,
/// because the planner treats the two differently for identifier purposes (spec §8, property 6:
/// swapping two references changes the identifier only when the input is declared ordered).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum References {
    Ordered(Vec<String>),
    Keyed(BTreeMap<String, ReferenceMetadata>),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReferenceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl References {
    /// The reference strings, in the order they should be hashed: preserved for `Ordered`,
    /// sorted for `Keyed` (an object has no meaningful order of its own).
    pub fn hashes_in_identifier_order(&self) -> Vec<&str> {
        match self {
            References::Ordered(v) => v.iter().map(String::as_str).collect(),
            References::Keyed(m) => m.keys().map(String::as_str).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            References::Ordered(v) => v.is_empty(),
            References::Keyed(m) => m.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestError(pub String);

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "manifest invalid: {}", self.0)
    }
}

impl std::error::Error for ManifestError {}

impl Manifest {
    pub fn from_json(data: &str) -> Result<Manifest, ManifestError> {
        let manifest: Manifest =
            serde_json::from_str(data).map_err(|e| ManifestError(format!("{e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural checks beyond what serde's `#[serde(untagged)]` already enforces: reference
    /// metadata keys must match `^\w+\.\w+$`, and a pipeline's build-pipeline chain must be
    /// finite (spec §3 invariant: the DAG has no cycles).
    pub fn validate(&self) -> Result<(), ManifestError> {
        self.pipeline.validate(0)
    }
}

const MAX_BUILD_PIPELINE_DEPTH: usize = 64;

impl Pipeline {
    fn validate(&self, depth: usize) -> Result<(), ManifestError> {
        if depth > MAX_BUILD_PIPELINE_DEPTH {
            return Err(ManifestError(
                "build-pipeline chain exceeds maximum depth (cycle?)".to_string(),
            ));
        }
        if let Some(build) = &self.build {
            build.validate(depth + 1)?;
        }
        for stage in &self.stages {
            stage.validate()?;
        }
        if let Some(assembler) = &self.assembler {
            assembler.validate()?;
        }
        Ok(())
    }

    /// All stages in execution order, including the terminal assembler if present.
    pub fn stages_including_assembler(&self) -> Vec<&Stage> {
        let mut stages: Vec<&Stage> = self.stages.iter().collect();
        if let Some(assembler) = &self.assembler {
            stages.push(assembler);
        }
        stages
    }
}

impl Stage {
    fn validate(&self) -> Result<(), ManifestError> {
        if self.name.is_empty() {
            return Err(ManifestError("stage name must not be empty".to_string()));
        }
        for (name, input) in &self.inputs {
            input.validate(name)?;
        }
        Ok(())
    }
}

impl Input {
    fn validate(&self, name: &str) -> Result<(), ManifestError> {
        if let References::Keyed(refs) = &self.references {
            for reference in refs.values() {
                if let Some(Value::Object(obj)) = &reference.metadata {
                    for key in obj.keys() {
                        if !METADATA_KEY_RE.is_match(key) {
                            return Err(ManifestError(format!(
                                "input {name:?}: reference metadata key {key:?} must match ^\\w+\\.\\w+$"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
