//! Purpose: Open module shared objects resident and validate their exported descriptor.
//! Exports: `read_module`, `ForeignModule` (crate-internal).
//! Role: The only place that touches dlopen/dlsym; the registry builds on its results.
//! Invariants: Objects are opened with RTLD_NODELETE, so hooks stay valid after the lookup handle closes.
//! Invariants: A missing export, a null export, or any null hook rejects the whole module.
//! Invariants: Every failure carries the offending path.
use std::ffi::{CStr, CString, c_int, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use crate::core::error::{Error, ErrorKind};
use crate::module::abi::{
    ClientAcceptFn, ClientRecvFn, ClientSendFn, Connection, MODULE_SYMBOL, MODULE_SYMBOL_C,
    ModuleDescriptor, Payload, ServerInitFn,
};
use crate::module::registry::Module;

// Kept mapped after dlclose so descriptors and hooks outlive the lookup handle.
const RESIDENT_LAZY: c_int = libc::RTLD_LAZY | libc::RTLD_NODELETE;

struct Library {
    handle: NonNull<c_void>,
    path: PathBuf,
}

impl Library {
    fn open_resident(path: &Path) -> Result<Self, Error> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("module path contains a NUL byte")
                .with_path(path)
                .with_source(err)
        })?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), RESIDENT_LAZY) };
        let handle = NonNull::new(handle).ok_or_else(|| {
            Error::new(ErrorKind::Open)
                .with_message(last_dl_error().unwrap_or_else(|| "dlopen failed".to_string()))
                .with_path(path)
                .with_hint("Check the path and that the module was built as a shared library.")
        })?;
        Ok(Self {
            handle,
            path: path.to_path_buf(),
        })
    }

    /// Address of `name`, or `None` when the object does not export it.
    fn symbol(&self, name: &CStr) -> Option<NonNull<c_void>> {
        // Drop any stale error so a later report names this lookup.
        let _ = last_dl_error();
        let address = unsafe { libc::dlsym(self.handle.as_ptr(), name.as_ptr()) };
        NonNull::new(address)
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        let rc = unsafe { libc::dlclose(self.handle.as_ptr()) };
        if rc != 0 {
            tracing::debug!(
                path = %self.path.display(),
                error = last_dl_error().as_deref().unwrap_or("unknown"),
                "dlclose failed"
            );
        }
    }
}

fn last_dl_error() -> Option<String> {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return None;
    }
    Some(
        unsafe { CStr::from_ptr(message) }
            .to_string_lossy()
            .into_owned(),
    )
}

/// Hooks copied out of a validated descriptor that lives in a resident image.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ForeignModule {
    init: ServerInitFn,
    accept: ClientAcceptFn,
    recv: ClientRecvFn,
    send: ClientSendFn,
}

impl ForeignModule {
    pub(crate) fn from_descriptor(descriptor: &ModuleDescriptor) -> Option<Self> {
        Some(Self {
            init: descriptor.init?,
            accept: descriptor.accept?,
            recv: descriptor.recv?,
            send: descriptor.send?,
        })
    }
}

impl Module for ForeignModule {
    fn init(&self) -> i32 {
        unsafe { (self.init)() }
    }

    fn accept(&self, conn: Connection) -> i32 {
        unsafe { (self.accept)(conn.as_raw()) }
    }

    fn recv(&self, conn: Connection, data: Payload) -> i32 {
        unsafe { (self.recv)(conn.as_raw(), data.as_raw()) }
    }

    fn send(&self, conn: Connection, data: Payload) -> i32 {
        unsafe { (self.send)(conn.as_raw(), data.as_raw()) }
    }
}

/// Opens `path` resident, reads its descriptor, and closes the lookup handle.
///
/// # Safety
///
/// Opening a shared object runs its initializers, and the descriptor it
/// exports is trusted to match [`ModuleDescriptor`] with hooks that are
/// sound to call from any thread.
pub(crate) unsafe fn read_module(path: &Path) -> Result<ForeignModule, Error> {
    let library = Library::open_resident(path)?;

    let export = library.symbol(MODULE_SYMBOL_C).ok_or_else(|| {
        Error::new(ErrorKind::MissingSymbol)
            .with_message(format!("module does not export `{MODULE_SYMBOL}`"))
            .with_path(path)
    })?;

    let descriptor = unsafe { *(export.as_ptr() as *const *const ModuleDescriptor) };
    let descriptor = unsafe { descriptor.as_ref() }.ok_or_else(|| {
        Error::new(ErrorKind::InvalidDescriptor)
            .with_message(format!("`{MODULE_SYMBOL}` is null"))
            .with_path(path)
    })?;

    let module = ForeignModule::from_descriptor(descriptor).ok_or_else(|| {
        Error::new(ErrorKind::InvalidDescriptor)
            .with_message("descriptor has a null hook")
            .with_path(path)
    })?;

    drop(library);
    Ok(module)
}
