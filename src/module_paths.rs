//! Purpose: Shared module-directory and module-reference path resolution.
//! Exports: `ModuleRef`, `default_module_dir`, `resolve_module_path`, `MODULE_DIR_ENV`.
//! Role: Keep CLI and library resolution of module names aligned from one source.
//! Invariants: Default module directory remains `~/.jacques/modules`.
//! Invariants: References containing a path separator are used verbatim.
use std::path::{MAIN_SEPARATOR, Path, PathBuf};

use crate::core::error::{Error, ErrorKind};

/// Environment variable naming the directory bare module names resolve in.
pub const MODULE_DIR_ENV: &str = "JACQUES_MODULE_DIR";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ModuleRef {
    Name(String),
    Path(PathBuf),
}

impl ModuleRef {
    /// Classifies a user-supplied reference.
    pub fn parse(value: &str) -> Self {
        if value.contains('/') || value.contains(MAIN_SEPARATOR) {
            Self::Path(PathBuf::from(value))
        } else {
            Self::Name(value.to_string())
        }
    }

    pub fn resolve(&self, module_dir: &Path) -> Result<PathBuf, Error> {
        match self {
            Self::Name(name) => resolve_module_path(name, module_dir),
            Self::Path(path) => Ok(path.clone()),
        }
    }
}

pub fn default_module_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".jacques").join("modules")
}

/// Maps a bare module name to its shared-object path inside `module_dir`.
pub fn resolve_module_path(name: &str, module_dir: &Path) -> Result<PathBuf, Error> {
    if name.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("module name is empty"));
    }
    if name.contains('/') || name.contains(MAIN_SEPARATOR) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("module name must not contain path separators")
            .with_hint("Pass a path containing '/' to load a module outside the module dir."));
    }
    let suffix = std::env::consts::DLL_SUFFIX;
    if name.ends_with(suffix) {
        return Ok(module_dir.join(name));
    }
    let prefix = std::env::consts::DLL_PREFIX;
    Ok(module_dir.join(format!("{prefix}{name}{suffix}")))
}
