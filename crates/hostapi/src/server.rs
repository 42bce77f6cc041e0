// The per-stage Host API server (spec §4.3): single-threaded, strictly request-response, bound
// to a fresh unix-domain socket created for exactly one stage invocation. Modeled as an explicit
// handle constructed by the sandbox builder and handed to a stage, rather than the process-global
// singleton the source implementation used (spec §9: "reimplement as an explicit server handle
// passed through the sandbox builder; no module-level mutable state").

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{json, Value};
use store::Store;

use crate::protocol::{read_message, write_message};

#[derive(Debug)]
pub enum HostApiError {
    Io(String),
    Protocol(String),
}

impl fmt::Display for HostApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostApiError::Io(msg) => write!(f, "host api io error: {msg}"),
            HostApiError::Protocol(msg) => write!(f, "host api protocol error: {msg}"),
        }
    }
}

impl std::error::Error for HostApiError {}

impl From<io::Error> for HostApiError {
    fn from(e: io::Error) -> Self {
        HostApiError::Io(e.to_string())
    }
}

impl From<store::StoreError> for HostApiError {
    fn from(e: store::StoreError) -> Self {
        HostApiError::Io(e.to_string())
    }
}

/// One resolved input, as delivered in the `arguments` envelope's `inputs` map.
#[derive(Debug, Clone, Serialize)]
pub struct InputArgument {
    pub path: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArgumentsMeta {
    pub id: String,
}

/// Stage argument envelope delivered via the `arguments` call (spec §6).
#[derive(Debug, Clone, Serialize)]
pub struct ArgumentsEnvelope {
    pub tree: String,
    pub inputs: BTreeMap<String, InputArgument>,
    pub options: Value,
    pub meta: ArgumentsMeta,
}

/// Everything a stage reported to the engine over the course of one invocation.
#[derive(Debug, Default)]
pub struct HostApiOutcome {
    pub metadata: Option<Value>,
    pub exception: Option<(String, String)>,
}

/// A not-yet-listening Host API server for one stage invocation.
pub struct HostApiServer {
    socket_path: PathBuf,
    store: Store,
    /// The sandbox-local temp root `store.mkdtemp` calls are rooted under (spec §4.1: `mkdtemp`
    /// allocates "inside the current sandbox's temp root").
    sandbox_tmp_root: PathBuf,
    stage_name: String,
    object_id: String,
    arguments: ArgumentsEnvelope,
}

impl HostApiServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        store: Store,
        sandbox_tmp_root: impl Into<PathBuf>,
        stage_name: impl Into<String>,
        object_id: impl Into<String>,
        arguments: ArgumentsEnvelope,
    ) -> HostApiServer {
        HostApiServer {
            socket_path: socket_path.into(),
            store,
            sandbox_tmp_root: sandbox_tmp_root.into(),
            stage_name: stage_name.into(),
            object_id: object_id.into(),
            arguments,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket and serve exactly one connection (the stage process) to completion.
    ///
    /// Intended to be run on a dedicated thread while the sandboxed stage process runs
    /// concurrently; returns once the stage closes the connection.
    pub fn serve(self) -> Result<HostApiOutcome, HostApiError> {
        ensure_removed(&self.socket_path)?;
        let listener = UnixListener::bind(&self.socket_path)?;
        let (stream, _addr) = listener.accept()?;
        self.serve_connection(stream)
    }

    fn serve_connection(self, mut stream: UnixStream) -> Result<HostApiOutcome, HostApiError> {
        let mut outcome = HostApiOutcome::default();
        let mut arguments_delivered = false;

        loop {
            let request = match read_message(&mut stream)? {
                Some(value) => value,
                None => break,
            };
            let response = self.dispatch(&request, &mut outcome, &mut arguments_delivered);
            write_message(&mut stream, &response)?;
        }
        Ok(outcome)
    }

    fn dispatch(&self, request: &Value, outcome: &mut HostApiOutcome, arguments_delivered: &mut bool) -> Value {
        let method = match request.get("method").and_then(Value::as_str) {
            Some(m) => m,
            None => return error_response("request missing \"method\""),
        };
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        if !*arguments_delivered && method != "arguments" {
            return error_response(&format!(
                "{method:?} called before \"arguments\"; a stage must fetch its arguments first"
            ));
        }

        match method {
            "arguments" => {
                *arguments_delivered = true;
                match serde_json::to_value(&self.arguments) {
                    Ok(v) => v,
                    Err(e) => error_response(&format!("serializing arguments: {e}")),
                }
            }
            "store.mkdtemp" => self.handle_mkdtemp(&params),
            "store.source" => self.handle_source(&params),
            "metadata" => {
                outcome.metadata = Some(params.get("obj").cloned().unwrap_or(params));
                json!({})
            }
            "log" => {
                let text = params.get("text").and_then(Value::as_str).unwrap_or_default();
                logging::log_stage_line(&self.stage_name, &self.object_id, text);
                json!({})
            }
            "exception" => {
                let kind = params.get("kind").and_then(Value::as_str).unwrap_or("unknown").to_string();
                let message = params.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
                outcome.exception = Some((kind, message));
                json!({})
            }
            other => error_response(&format!("unknown message kind {other:?}")),
        }
    }

    fn handle_mkdtemp(&self, params: &Value) -> Value {
        let prefix = params.get("prefix").and_then(Value::as_str).unwrap_or("tmp-");
        match self.store.mkdtemp(&self.sandbox_tmp_root, prefix) {
            Ok(path) => json!({ "path": path.display().to_string() }),
            Err(e) => error_response(&e.to_string()),
        }
    }

    fn handle_source(&self, params: &Value) -> Value {
        let source_type = match params.get("type").and_then(Value::as_str) {
            Some(t) => t,
            None => return error_response("store.source requires a \"type\""),
        };
        match self.store.source(source_type) {
            Ok(path) => json!({ "path": path.display().to_string() }),
            Err(e) => error_response(&e.to_string()),
        }
    }
}

fn error_response(message: &str) -> Value {
    json!({ "error": message })
}

fn ensure_removed(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
