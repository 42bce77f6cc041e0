// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]
#![deny(clippy::all)]

//! Drives a [`manifest::Manifest`] to completion: compiles it with `planner`, fetches any
//! missing source blobs, and runs each stage's sandbox in order, committing or discarding its
//! tree depending on the outcome (spec §4.5, §6, §7).
//!
//! This is the one crate that knows about every other piece (`store`, `sandbox`, `hostapi`,
//! `planner`, `manifest`); none of the others depend on it, the same layering the teacher keeps
//! between its leaf crates and the top-level `engine` crate that assembles them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use hashing::ContentHash;
use serde_json::Value;
use store::{ObjectId, Store, StoreError};

/// CLI-equivalent configuration (spec §6: `--libdir`, `--inspect`, the manifest's store
/// directory), exposed as a typed struct so the (out-of-scope) CLI binary is a thin adapter.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Path under each stage's runtime root where stage and source-fetcher binaries live, e.g.
    /// `usr/lib/osbuild` (resolved as `<runtime root>/<libdir>/stages/<name>`).
    pub libdir: PathBuf,
    /// Run the planner only; never invoke the sandbox.
    pub inspect: bool,
    pub store_dir: PathBuf,
}

/// Errors surfaced by a run (spec §7). Every variant that can be attributed to one stage or
/// object carries its identifier for diagnosis.
#[derive(Debug)]
pub enum EngineError {
    ManifestInvalid(String),
    SourceUnavailable {
        object_id: Option<String>,
        message: String,
    },
    /// Boxed: this variant carries captured stdout/stderr alongside the exception payload, far
    /// larger than the other variants, and boxing keeps `size_of::<EngineError>()` small.
    StageFailed(Box<StageFailure>),
    SandboxError {
        object_id: Option<String>,
        message: String,
    },
    StorageFull(String),
    StoreCorrupt(String),
}

/// Detail carried by [`EngineError::StageFailed`] (spec §7: "carries captured logs and the
/// structured `exception` payload if any").
#[derive(Debug)]
pub struct StageFailure {
    pub object_id: String,
    pub message: String,
    pub stdout: String,
    pub stderr: String,
    pub exception: Option<(String, String)>,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::ManifestInvalid(msg) => write!(f, "manifest invalid: {msg}"),
            EngineError::SourceUnavailable { object_id: Some(id), message } => {
                write!(f, "source unavailable (stage {id}): {message}")
            }
            EngineError::SourceUnavailable { object_id: None, message } => {
                write!(f, "source unavailable: {message}")
            }
            EngineError::StageFailed(failure) => {
                write!(f, "stage {} failed: {}", failure.object_id, failure.message)
            }
            EngineError::SandboxError { object_id: Some(id), message } => {
                write!(f, "sandbox error (stage {id}): {message}")
            }
            EngineError::SandboxError { object_id: None, message } => {
                write!(f, "sandbox error: {message}")
            }
            EngineError::StorageFull(msg) => write!(f, "storage full: {msg}"),
            EngineError::StoreCorrupt(msg) => write!(f, "store corrupt: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<planner::PlanError> for EngineError {
    fn from(e: planner::PlanError) -> Self {
        EngineError::ManifestInvalid(e.to_string())
    }
}

/// Translate a store-layer error into the engine's error taxonomy, tagging it with the object
/// the operation was performed for when one is known.
fn store_error(id: Option<ObjectId>, e: StoreError) -> EngineError {
    match e {
        StoreError::StorageFull(msg) => EngineError::StorageFull(msg),
        StoreError::StoreCorrupt(msg) | StoreError::NotFound(msg) | StoreError::Io(msg) => {
            EngineError::StoreCorrupt(msg)
        }
        StoreError::SourceInvalid(msg) => EngineError::SourceUnavailable {
            object_id: id.map(|i| i.to_hex()),
            message: msg,
        },
    }
}

fn io_error(e: io::Error) -> EngineError {
    store_error(None, StoreError::from(e))
}

/// What one stage invocation reported back.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage_name: String,
    pub object_id: ObjectId,
    /// `true` when the cache already held this identifier and the sandbox was never invoked
    /// (spec §4.5 "Caching").
    pub skipped: bool,
    pub metadata: Option<Value>,
}

/// The outcome of a full run, or of an inspection pass.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub stages: Vec<StageReport>,
    pub root_object_id: Option<ObjectId>,
}

/// Ties `store`, `sandbox`, `hostapi`, and `planner` together to run a manifest to completion.
pub struct Executor {
    options: EngineOptions,
    store: Store,
}

impl Executor {
    /// Open (creating if necessary) the store named by `options.store_dir` and initialize
    /// logging. Safe to construct more than one `Executor` against the same store directory;
    /// coordination is via the store's own file locks (spec §5).
    pub fn new(options: EngineOptions) -> Result<Executor, EngineError> {
        logging::init();
        let store = Store::new(&options.store_dir).map_err(|e| store_error(None, e))?;
        Ok(Executor { options, store })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Compile and, unless `options.inspect` is set, execute `manifest`.
    pub fn run(&self, manifest: &manifest::Manifest) -> Result<RunReport, EngineError> {
        let plan = planner::compile(manifest)?;
        if self.options.inspect {
            return Ok(self.inspect(&plan));
        }
        self.fetch_missing_sources(manifest, &plan)?;

        let mut stages = Vec::with_capacity(plan.total_stage_count());
        for pipeline in &plan.pipelines {
            for stage in pipeline.stages_including_assembler() {
                stages.push(self.execute_stage(pipeline, stage)?);
            }
        }
        Ok(RunReport {
            stages,
            root_object_id: plan.root_object_id(),
        })
    }

    /// Planner-only pass (spec §4.5 "Inspection mode"): resolved identifiers, no sandbox.
    fn inspect(&self, plan: &planner::Plan) -> RunReport {
        let stages = plan
            .pipelines
            .iter()
            .flat_map(planner::PipelinePlan::stages_including_assembler)
            .map(|stage| StageReport {
                stage_name: stage.name.clone(),
                object_id: stage.object_id,
                skipped: self.store.contains(stage.object_id),
                metadata: None,
            })
            .collect();
        RunReport {
            stages,
            root_object_id: plan.root_object_id(),
        }
    }

    /// Fetch every source-type checksum the plan references that isn't already in the store,
    /// before any stage runs (spec §4.5: "Source failures abort before any stage runs").
    fn fetch_missing_sources(&self, manifest: &manifest::Manifest, plan: &planner::Plan) -> Result<(), EngineError> {
        for (source_type, checksums) in required_source_checksums(plan) {
            let missing: Vec<ContentHash> = checksums
                .into_iter()
                .map(|s| ContentHash::from_str(&s).expect("planner already validated content hash syntax"))
                .filter(|hash| !self.blob_present(&source_type, hash))
                .collect();
            if missing.is_empty() {
                continue;
            }

            let fetcher_path = self.options.libdir.join("sources").join(&source_type);
            if !fetcher_path.is_file() {
                return Err(EngineError::SourceUnavailable {
                    object_id: None,
                    message: format!(
                        "no fetcher for source type {source_type:?} to provide {} checksum(s)",
                        missing.len()
                    ),
                });
            }

            let options = manifest.sources.get(&source_type).cloned().unwrap_or(Value::Null);
            let items = Value::Array(missing.iter().map(|h| Value::String(h.to_string())).collect());
            let request = store::FetchRequest {
                source_type: source_type.clone(),
                fetcher_path,
                items,
                options,
                checksums: missing,
            };
            store::SourceFetcher::new(&self.store)
                .fetch(request)
                .map_err(|e| store_error(None, e))?;
        }
        Ok(())
    }

    fn blob_present(&self, source_type: &str, hash: &ContentHash) -> bool {
        self.store
            .source(source_type)
            .map(|dir| dir.join(hash.filename()).is_file())
            .unwrap_or(false)
    }

    fn execute_stage(&self, pipeline: &planner::PipelinePlan, stage: &planner::StagePlan) -> Result<StageReport, EngineError> {
        if self.store.contains(stage.object_id) {
            log::info!("stage {} ({}) already committed; skipping", stage.name, stage.object_id);
            return Ok(StageReport {
                stage_name: stage.name.clone(),
                object_id: stage.object_id,
                skipped: true,
                metadata: None,
            });
        }

        // The build tree this stage writes into: a fresh empty object if it's the pipeline's
        // first stage, otherwise a writable snapshot of the previous stage's committed tree.
        let staged = match stage.upstream {
            Some(upstream) => {
                let snapshot = self.store.snapshot(upstream).map_err(|e| store_error(Some(upstream), e))?;
                store::StagedObject::from_snapshot(snapshot)
            }
            None => self.store.new_object().map_err(|e| store_error(Some(stage.object_id), e))?,
        };

        // The runtime root: a fresh, per-invocation snapshot of the pipeline's build pipeline,
        // or the host root for a bootstrap pipeline. Taking a new snapshot for every stage
        // (rather than reusing one directory across the pipeline) is what keeps "writes outside
        // the tree argument vanish on teardown" true even though the sandbox enters it via
        // chroot rather than an ephemeral mount (spec §8 property 3).
        let runtime_root_snapshot = match pipeline.build_final_object_id {
            Some(build_id) => Some(self.store.snapshot(build_id).map_err(|e| store_error(Some(build_id), e))?),
            None => None,
        };
        let runtime_root = runtime_root_snapshot
            .as_ref()
            .map(|s| s.path().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/"));

        let mut input_mounts = Vec::with_capacity(stage.inputs.len());
        let mut input_arguments = BTreeMap::new();
        let mut materialized = Vec::with_capacity(stage.inputs.len());
        for (name, input) in &stage.inputs {
            let slot = self.materialize_input(input)?;
            input_mounts.push(sandbox::InputMount {
                name: name.clone(),
                host_path: slot.path().to_path_buf(),
            });
            input_arguments.insert(
                name.clone(),
                hostapi::InputArgument {
                    path: sandbox::GUEST_RUN_DIR.to_string() + "/inputs/" + name,
                    data: serde_json::json!({ "type": input.type_, "references": input.references }),
                },
            );
            materialized.push(slot);
        }

        let invocation_dir = self
            .store
            .mkdtemp(&self.store.root().join("tmp"), "invocation-")
            .map_err(|e| store_error(Some(stage.object_id), e))?;
        let socket_path = invocation_dir.join("api.sock");
        let sandbox_tmp_root = invocation_dir.join("tmp");
        fs::create_dir_all(&sandbox_tmp_root).map_err(io_error)?;

        let arguments = hostapi::ArgumentsEnvelope {
            tree: sandbox::GUEST_RUN_DIR.to_string() + "/tree",
            inputs: input_arguments,
            options: stage.options.clone(),
            meta: hostapi::ArgumentsMeta { id: stage.object_id.to_hex() },
        };
        let server = hostapi::HostApiServer::new(
            socket_path.clone(),
            self.store.clone(),
            sandbox_tmp_root,
            stage.name.clone(),
            stage.object_id.to_hex(),
            arguments,
        );
        let server_handle = thread::spawn(move || server.serve());

        wait_for_socket(&socket_path);

        let sandbox_spec = sandbox::SandboxSpec {
            runtime_root,
            build_tree: staged.path().to_path_buf(),
            inputs: input_mounts,
            host_api_socket: socket_path.clone(),
            libdir: self.options.libdir.clone(),
            stage_name: stage.name.clone(),
            extra_args: Vec::new(),
            grace_period: sandbox::DEFAULT_GRACE_PERIOD,
        };
        let run_result = sandbox::run(&sandbox_spec);

        // The server thread is blocked in `listener.accept()` until a peer connects; if the
        // sandbox never got that far (e.g. the stage binary is missing), nudge it awake with a
        // throwaway connection so `join()` below can't hang forever holding this stage's `Store`
        // clone and invocation directory alive.
        if run_result.is_err() {
            let _ = std::os::unix::net::UnixStream::connect(&socket_path);
        }
        let join_result = server_handle.join().map_err(|_| EngineError::SandboxError {
            object_id: Some(stage.object_id.to_hex()),
            message: "host api server thread panicked".to_string(),
        });

        // Teardown runs on every exit path from here, success or failure (spec §4.4).
        let _ = fs::remove_dir_all(&invocation_dir);
        drop(materialized);
        drop(runtime_root_snapshot);

        let outcome = run_result.map_err(|e| EngineError::SandboxError {
            object_id: Some(stage.object_id.to_hex()),
            message: e.to_string(),
        })?;
        let api_outcome = join_result?.map_err(|e| EngineError::SandboxError {
            object_id: Some(stage.object_id.to_hex()),
            message: e.to_string(),
        })?;

        if !outcome.success() {
            return Err(EngineError::StageFailed(Box::new(StageFailure {
                object_id: stage.object_id.to_hex(),
                message: format!("stage exited with {}", outcome.status),
                stdout: String::from_utf8_lossy(&outcome.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&outcome.stderr).into_owned(),
                exception: api_outcome.exception,
            })));
        }
        if let Some((kind, message)) = api_outcome.exception {
            return Err(EngineError::StageFailed(Box::new(StageFailure {
                object_id: stage.object_id.to_hex(),
                message: format!("stage reported exception {kind}: {message}"),
                stdout: String::from_utf8_lossy(&outcome.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&outcome.stderr).into_owned(),
                exception: Some((kind, message)),
            })));
        }

        self.store
            .commit(staged, stage.object_id)
            .map_err(|e| store_error(Some(stage.object_id), e))?;

        Ok(StageReport {
            stage_name: stage.name.clone(),
            object_id: stage.object_id,
            skipped: false,
            metadata: api_outcome.metadata,
        })
    }

    fn materialize_input(&self, input: &planner::ResolvedInput) -> Result<MaterializedInput, EngineError> {
        match input.origin {
            manifest::Origin::Source => {
                let source_dir = self.store.source(&input.type_).map_err(|e| store_error(None, e))?;
                let dir = tempfile::Builder::new()
                    .prefix("input-")
                    .tempdir_in(self.store.root().join("tmp"))
                    .map_err(io_error)?;
                for reference in &input.references {
                    let hash = ContentHash::from_str(reference).expect("planner already validated content hash syntax");
                    let src = source_dir.join(hash.filename());
                    let dst = dir.path().join(hash.filename());
                    fs::hard_link(&src, &dst)
                        .or_else(|_| fs::copy(&src, &dst).map(|_| ()))
                        .map_err(io_error)?;
                }
                Ok(MaterializedInput::Source(dir))
            }
            manifest::Origin::Pipeline => {
                let reference = input
                    .references
                    .first()
                    .ok_or_else(|| EngineError::ManifestInvalid("pipeline input declared with no reference".to_string()))?;
                let id: ObjectId = reference
                    .parse()
                    .map_err(EngineError::ManifestInvalid)?;
                let snapshot = self.store.snapshot(id).map_err(|e| store_error(Some(id), e))?;
                Ok(MaterializedInput::Pipeline(snapshot))
            }
        }
    }
}

enum MaterializedInput {
    Source(tempfile::TempDir),
    Pipeline(store::Snapshot),
}

impl MaterializedInput {
    fn path(&self) -> &Path {
        match self {
            MaterializedInput::Source(dir) => dir.path(),
            MaterializedInput::Pipeline(snapshot) => snapshot.path(),
        }
    }
}

/// Every (source type, checksum) pair any stage in the plan references, deduplicated.
fn required_source_checksums(plan: &planner::Plan) -> Vec<(String, Vec<String>)> {
    let mut needed: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for pipeline in &plan.pipelines {
        for stage in pipeline.stages_including_assembler() {
            for input in stage.inputs.values() {
                if input.origin == manifest::Origin::Source {
                    needed.entry(input.type_.clone()).or_default().extend(input.references.iter().cloned());
                }
            }
        }
    }
    needed.into_iter().map(|(k, v)| (k, v.into_iter().collect())).collect()
}

/// Block until the Host API server's socket file exists, so the sandbox's bind mount of it has
/// something to bind to. The server thread creates it synchronously inside `UnixListener::bind`;
/// this just waits for that thread to get scheduled.
fn wait_for_socket(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
