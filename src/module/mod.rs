// Plugin ABI, resident shared-object loading, and the hook registry.
pub mod abi;
pub(crate) mod loader;
pub mod registry;
