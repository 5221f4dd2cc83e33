//! Purpose: Best-effort OS-visible naming of the calling thread.
//! Exports: `set_current`, `current`, `MAX_LEN`.
//! Role: Platform capability used by the thread trampoline after its start barrier.
//! Invariants: Never fails; unsupported platforms are silent no-ops.
//! Invariants: Names are truncated to the platform limit on a UTF-8 boundary.
use std::ffi::CString;

/// Longest name the OS keeps, in bytes, excluding the terminating NUL.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const MAX_LEN: Option<usize> = Some(15);
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub const MAX_LEN: Option<usize> = Some(63);
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
pub const MAX_LEN: Option<usize> = None;

pub(crate) fn truncate(name: &str, limit: Option<usize>) -> &str {
    let Some(limit) = limit else {
        return name;
    };
    if name.len() <= limit {
        return name;
    }
    let mut end = limit;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

fn to_cstring(name: &str) -> Option<CString> {
    let name = truncate(name, MAX_LEN);
    let name = name.split('\0').next().unwrap_or_default();
    CString::new(name).ok()
}

/// Applies `name` to the calling thread.
pub fn set_current(name: &str) {
    let Some(name) = to_cstring(name) else {
        return;
    };
    set_raw(&name);
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_raw(name: &CString) {
    unsafe {
        libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0);
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn set_raw(name: &CString) {
    unsafe {
        libc::pthread_setname_np(name.as_ptr());
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
fn set_raw(_name: &CString) {}

/// Reads back the calling thread's OS-visible name, where the platform allows it.
pub fn current() -> Option<String> {
    current_raw()
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn current_raw() -> Option<String> {
    let mut buf = [0u8; 16];
    let rc = unsafe { libc::prctl(libc::PR_GET_NAME, buf.as_mut_ptr() as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
        return None;
    }
    decode(&buf)
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn current_raw() -> Option<String> {
    let mut buf = [0u8; 64];
    let rc = unsafe {
        libc::pthread_getname_np(
            libc::pthread_self(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    if rc != 0 {
        return None;
    }
    decode(&buf)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
fn current_raw() -> Option<String> {
    None
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
))]
fn decode(buf: &[u8]) -> Option<String> {
    let end = buf.iter().position(|byte| *byte == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).ok()
}
