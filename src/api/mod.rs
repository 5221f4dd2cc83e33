//! Purpose: Define the stable public Rust API boundary for jacques.
//! Exports: Thread primitives, module ABI and registry, path resolution, errors.
//! Role: Public, additive-only surface; hides internal module layout.
//! Invariants: This module is the only public path to runtime primitives.
//! Invariants: Internal modules remain private and are not directly exposed.

pub use crate::core::error::{Error, ErrorKind, to_exit_code};
pub use crate::core::private::PrivateSlot;
pub use crate::core::sync::{Condvar, Mutex, MutexGuard};
pub use crate::core::thread::ThreadHandle;
pub use crate::core::thread_name;
pub use crate::module::abi::{
    ClientAcceptFn, ClientRecvFn, ClientSendFn, Connection, MODULE_SYMBOL, ModuleDescriptor,
    Payload, ServerInitFn,
};
pub use crate::module::registry::{
    ClientAcceptHook, ClientRecvHook, ClientSendHook, Hooks, Module, ModuleEntry,
    ModuleRegistry, ServerInitHook, load_many, load_one, modules, register_client_accept,
    register_client_recv, register_client_send, register_server_init,
};
pub use crate::module_paths::{
    MODULE_DIR_ENV, ModuleRef, default_module_dir, resolve_module_path,
};
