// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::new_without_default)]

//! The per-stage control channel a sandboxed stage uses to request resources from the engine
//! (spec §4.3).

mod protocol;
mod server;

pub use server::{ArgumentsEnvelope, ArgumentsMeta, HostApiError, HostApiOutcome, HostApiServer, InputArgument};
