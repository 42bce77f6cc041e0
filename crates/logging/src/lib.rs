// Copyright 2017 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]
#![deny(clippy::all)]

//! Process-wide logging setup, and the convention the Host API server uses to re-emit a stage's
//! `log(text)` calls (spec §4.3) through the same sink as the engine's own `log` output.

use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize the global logger from `RUST_LOG` (default `info`), idempotently.
///
/// Safe to call from multiple entry points (library consumers, tests); only the first call
/// takes effect, mirroring the teacher's `logging` crate guard against double-initialization.
pub fn init() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format(|buf, record| {
                let now = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f");
                writeln!(buf, "{now} {:<5} {}", record.level(), record.args())
            })
            .init();
    });
}

/// Re-emit a line of output produced by a stage subprocess through the engine's own logger,
/// tagged with the stage name and object identifier so interleaved stage/engine output stays
/// attributable (spec §4.3, §9 "ambient additions").
pub fn log_stage_line(stage_name: &str, object_id: &str, line: &str) {
    log::info!("[{stage_name} {object_id}] {line}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
