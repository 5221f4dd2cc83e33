//! Purpose: Fixed binary contract between the daemon and its loadable modules.
//! Exports: `ModuleDescriptor`, hook fn-pointer types, `Connection`, `Payload`, `MODULE_SYMBOL`, `export_module!`.
//! Role: The only layout shared with precompiled plugins; nothing else crosses the boundary.
//! Invariants: A module exports one symbol, `jacques_module`, holding a pointer to its descriptor.
//! Invariants: Descriptor layout is four C function pointers in the order init, accept, recv, send.
//! Invariants: The host reads descriptors and never writes them.
//!
//! The C view of the contract:
//!
//! ```c
//! typedef struct {
//!     int (*init)(void);
//!     int (*accept)(void *conn);
//!     int (*recv)(void *conn, void *data);
//!     int (*send)(void *conn, void *data);
//! } jacques_module_t;
//!
//! const jacques_module_t *jacques_module = &my_module;
//! ```
use std::ffi::{CStr, c_int, c_void};

/// Name of the export every module must provide.
pub const MODULE_SYMBOL: &str = "jacques_module";

pub(crate) const MODULE_SYMBOL_C: &CStr = c"jacques_module";

pub type ServerInitFn = unsafe extern "C" fn() -> c_int;
pub type ClientAcceptFn = unsafe extern "C" fn(conn: *mut c_void) -> c_int;
pub type ClientRecvFn = unsafe extern "C" fn(conn: *mut c_void, data: *mut c_void) -> c_int;
pub type ClientSendFn = unsafe extern "C" fn(conn: *mut c_void, data: *mut c_void) -> c_int;

/// Hook table a module exports. A null slot makes the whole module invalid.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ModuleDescriptor {
    pub init: Option<ServerInitFn>,
    pub accept: Option<ClientAcceptFn>,
    pub recv: Option<ClientRecvFn>,
    pub send: Option<ClientSendFn>,
}

/// Opaque per-connection context owned by the server's I/O loop.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Connection(*mut c_void);

/// Opaque buffer handed to recv/send hooks.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Payload(*mut c_void);

// Both wrap pointers whose lifetime and synchronization the server owns.
unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}
unsafe impl Send for Payload {}
unsafe impl Sync for Payload {}

impl Connection {
    pub fn from_raw(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0
    }
}

impl Payload {
    pub fn from_raw(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0
    }
}

/// Exports a [`ModuleDescriptor`] from a Rust `cdylib` under [`MODULE_SYMBOL`].
///
/// ```ignore
/// unsafe extern "C" fn init() -> std::ffi::c_int { 0 }
/// unsafe extern "C" fn accept(_: *mut std::ffi::c_void) -> std::ffi::c_int { 0 }
/// unsafe extern "C" fn io(_: *mut std::ffi::c_void, _: *mut std::ffi::c_void) -> std::ffi::c_int { 0 }
///
/// jacques::export_module!(init: init, accept: accept, recv: io, send: io);
/// ```
#[macro_export]
macro_rules! export_module {
    (init: $init:expr, accept: $accept:expr, recv: $recv:expr, send: $send:expr $(,)?) => {
        #[allow(non_upper_case_globals)]
        #[unsafe(no_mangle)]
        pub static jacques_module: &$crate::api::ModuleDescriptor = &$crate::api::ModuleDescriptor {
            init: Some($init),
            accept: Some($accept),
            recv: Some($recv),
            send: Some($send),
        };
    };
}
