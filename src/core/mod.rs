// Runtime primitives: errors, locking, thread-local slots, and thread handles.
pub mod error;
pub mod private;
pub mod sync;
pub mod thread;
pub mod thread_name;
