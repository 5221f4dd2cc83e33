//! Purpose: Thread primitives and the resident plugin loader behind the jacques daemon.
//! Exports: `api` (threads, locks, thread-local slots, module ABI and registry, errors).
//! Role: Library backing the `jacques` binary and the server that dispatches module hooks.
//! Invariants: `api` is the only public path; internal layout may change freely.
//! Invariants: Process-wide state is reached through explicit accessors, never bare globals.
#[cfg(not(unix))]
compile_error!("jacques requires a POSIX threads and dlopen platform");

pub mod api;
mod core;
mod module;
mod module_paths;
