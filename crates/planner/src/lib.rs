// Copyright 2017 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::len_without_is_empty)]

//! Compiles a [`manifest::Manifest`] into an ordered execution plan (spec §4.5).
//!
//! `compile` performs the post-order walk described in the spec directly as recursion over
//! `Pipeline::build`: a pipeline's build pipeline (if any) is compiled first and contributes its
//! final object as the current pipeline's `upstream`, so the returned [`Plan`]'s pipeline list is
//! already in "build-pipelines-first" execution order with no separate sort pass required.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use hashing::{ContentHash, Fingerprint};
use serde_json::Value;
use store::ObjectId;

#[derive(Debug)]
pub enum PlanError {
    ManifestInvalid(String),
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::ManifestInvalid(msg) => write!(f, "manifest invalid: {msg}"),
        }
    }
}

impl std::error::Error for PlanError {}

impl From<manifest::ManifestError> for PlanError {
    fn from(e: manifest::ManifestError) -> Self {
        PlanError::ManifestInvalid(e.to_string())
    }
}

/// One input as resolved at plan time: its reference strings, in the exact order they were fed
/// into the stage's object identifier hash.
#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub type_: String,
    pub origin: manifest::Origin,
    pub references: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StagePlan {
    pub name: String,
    pub options: Value,
    pub inputs: BTreeMap<String, ResolvedInput>,
    pub upstream: Option<ObjectId>,
    pub object_id: ObjectId,
}

#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub stages: Vec<StagePlan>,
    pub assembler: Option<StagePlan>,
    /// The final object of this pipeline's own `build` pipeline, if it has one. The executor
    /// snapshots this as the runtime root for every stage in this pipeline (spec §4.4, step 1);
    /// `None` means the runtime root is the host root (the bootstrap pipeline).
    pub build_final_object_id: Option<ObjectId>,
    /// The object identifier of this pipeline's last stage (or assembler, if present); `None`
    /// for a pipeline with neither, which can only happen for an empty `build` pipeline.
    pub final_object_id: Option<ObjectId>,
}

impl PipelinePlan {
    pub fn stages_including_assembler(&self) -> impl Iterator<Item = &StagePlan> {
        self.stages.iter().chain(self.assembler.as_ref())
    }
}

/// A fully resolved execution plan: every pipeline the manifest names, in the order the executor
/// should run them (build pipelines before their dependents).
#[derive(Debug, Clone)]
pub struct Plan {
    pub pipelines: Vec<PipelinePlan>,
}

impl Plan {
    /// The outermost pipeline's final object, i.e. the manifest's overall result.
    pub fn root_object_id(&self) -> Option<ObjectId> {
        self.pipelines.last().and_then(|p| p.final_object_id)
    }

    pub fn total_stage_count(&self) -> usize {
        self.pipelines
            .iter()
            .map(|p| p.stages.len() + p.assembler.is_some() as usize)
            .sum()
    }
}

/// Stable-key JSON: recursively sorts object keys so that two structurally-equal option trees
/// serialize to the same bytes regardless of field order in the source manifest. `serde_json`'s
/// `Map` is a `BTreeMap` by default (the `preserve_order` feature is not enabled anywhere in this
/// workspace), so this mostly documents the policy by name; it is still applied explicitly so the
/// hashing step does not silently depend on that cargo feature staying off.
pub fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), canonical_json(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// `H(stage-name, canonical(options), sorted(input-ids), upstream-id)` (spec §4.5).
pub fn compute_object_id(
    stage_name: &str,
    options: &Value,
    input_ids: &[String],
    upstream: Option<ObjectId>,
) -> ObjectId {
    let tuple = serde_json::json!({
        "stage": stage_name,
        "options": canonical_json(options),
        "inputs": input_ids,
        "upstream": upstream.map(|id| id.to_hex()),
    });
    let bytes = serde_json::to_vec(&tuple).expect("json values always serialize");
    let digest = hashing::Digest::of_bytes(&bytes);
    ObjectId::from_fingerprint(digest.hash)
}

/// Compile a manifest into an execution plan. Revalidates the manifest (cheap, and `compile` may
/// be called on a `Manifest` built by hand rather than through `Manifest::from_json`).
pub fn compile(manifest: &manifest::Manifest) -> Result<Plan, PlanError> {
    manifest.validate()?;
    let mut pipelines = Vec::new();
    compile_pipeline(&manifest.pipeline, None, &mut pipelines)?;
    Ok(Plan { pipelines })
}

fn compile_pipeline(
    pipeline: &manifest::Pipeline,
    outer_build_final_id: Option<ObjectId>,
    plans: &mut Vec<PipelinePlan>,
) -> Result<Option<ObjectId>, PlanError> {
    let build_final_id = match &pipeline.build {
        Some(build) => compile_pipeline(build, outer_build_final_id, plans)?,
        None => None,
    };

    let mut upstream = build_final_id;
    let mut stages = Vec::with_capacity(pipeline.stages.len());
    for stage in &pipeline.stages {
        let plan = compile_stage(stage, upstream, build_final_id)?;
        upstream = Some(plan.object_id);
        stages.push(plan);
    }
    let assembler = match &pipeline.assembler {
        Some(stage) => {
            let plan = compile_stage(stage, upstream, build_final_id)?;
            upstream = Some(plan.object_id);
            Some(plan)
        }
        None => None,
    };

    let final_object_id = upstream;
    plans.push(PipelinePlan {
        stages,
        assembler,
        build_final_object_id: build_final_id,
        final_object_id,
    });
    Ok(final_object_id)
}

fn compile_stage(
    stage: &manifest::Stage,
    upstream: Option<ObjectId>,
    build_final_id: Option<ObjectId>,
) -> Result<StagePlan, PlanError> {
    let mut resolved_inputs = BTreeMap::new();
    let mut all_references = Vec::new();
    // `stage.inputs` is a `BTreeMap`, so this iterates inputs in name order: input order itself
    // is never ambiguous, only the order of references *within* one input (spec §8 property 6).
    for (name, input) in &stage.inputs {
        let references = resolve_references(input, build_final_id)?;
        all_references.extend(references.iter().cloned());
        resolved_inputs.insert(
            name.clone(),
            ResolvedInput {
                type_: input.type_.clone(),
                origin: input.origin,
                references,
            },
        );
    }

    let object_id = compute_object_id(&stage.name, &stage.options, &all_references, upstream);
    Ok(StagePlan {
        name: stage.name.clone(),
        options: stage.options.clone(),
        inputs: resolved_inputs,
        upstream,
        object_id,
    })
}

/// The literal reference string used to point an `org.osbuild.pipeline` input at the nearest
/// enclosing build pipeline's final tree, rather than at an arbitrary stage's object id.
pub const BUILD_PIPELINE_REFERENCE: &str = "build";

fn resolve_references(
    input: &manifest::Input,
    build_final_id: Option<ObjectId>,
) -> Result<Vec<String>, PlanError> {
    let raw = input.references.hashes_in_identifier_order();
    let mut resolved = Vec::with_capacity(raw.len());
    for reference in raw {
        let validated = match input.origin {
            manifest::Origin::Source => {
                ContentHash::from_str(reference).map_err(|e| {
                    PlanError::ManifestInvalid(format!("source reference {reference:?}: {e}"))
                })?;
                reference.to_string()
            }
            manifest::Origin::Pipeline => {
                if reference == BUILD_PIPELINE_REFERENCE {
                    let id = build_final_id.ok_or_else(|| {
                        PlanError::ManifestInvalid(
                            "input references \"build\" but this pipeline has no build pipeline"
                                .to_string(),
                        )
                    })?;
                    id.to_hex()
                } else {
                    Fingerprint::from_hex_string(reference).map_err(|e| {
                        PlanError::ManifestInvalid(format!("pipeline reference {reference:?}: {e}"))
                    })?;
                    reference.to_string()
                }
            }
        };
        resolved.push(validated);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests;
