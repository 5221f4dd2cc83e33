//! Purpose: Ordered registry of loaded modules and the four lifecycle hook lists.
//! Exports: `Module`, `ModuleRegistry`, `ModuleEntry`, `Hooks`, hook aliases, global helpers.
//! Role: Populated at startup; walked later by the server's dispatch loop.
//! Invariants: One lock guards the module list and all four hook lists together.
//! Invariants: A module and its hooks appear only if its load validated; appends keep load order.
//! Invariants: Batches are not transactional: modules before a failed path stay registered.
//! Invariants: The registry never calls a hook.
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tracing::{info, trace, warn};

use crate::core::error::Error;
use crate::core::sync::Mutex;
use crate::module::abi::{Connection, Payload};
use crate::module::loader;

/// Lifecycle callbacks a plugin provides. Each returns a status where 0
/// lets the dispatcher continue to the next hook.
pub trait Module: Send + Sync {
    fn init(&self) -> i32;
    fn accept(&self, conn: Connection) -> i32;
    fn recv(&self, conn: Connection, data: Payload) -> i32;
    fn send(&self, conn: Connection, data: Payload) -> i32;
}

pub type ServerInitHook = Arc<dyn Fn() -> i32 + Send + Sync>;
pub type ClientAcceptHook = Arc<dyn Fn(Connection) -> i32 + Send + Sync>;
pub type ClientRecvHook = Arc<dyn Fn(Connection, Payload) -> i32 + Send + Sync>;
pub type ClientSendHook = Arc<dyn Fn(Connection, Payload) -> i32 + Send + Sync>;

/// One registered module, in registration order.
#[derive(Clone)]
pub struct ModuleEntry {
    index: usize,
    name: String,
    path: Option<PathBuf>,
    module: Arc<dyn Module>,
}

impl ModuleEntry {
    /// Position in the registry, starting at 0.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared object the module came from; `None` for native registrations.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }
}

impl fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Snapshot of the four hook lists, each in registration order.
#[derive(Clone, Default)]
pub struct Hooks {
    pub server_init: Vec<ServerInitHook>,
    pub client_accept: Vec<ClientAcceptHook>,
    pub client_recv: Vec<ClientRecvHook>,
    pub client_send: Vec<ClientSendHook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("server_init", &self.server_init.len())
            .field("client_accept", &self.client_accept.len())
            .field("client_recv", &self.client_recv.len())
            .field("client_send", &self.client_send.len())
            .finish()
    }
}

#[derive(Default)]
struct Inner {
    modules: Vec<ModuleEntry>,
    hooks: Hooks,
}

impl Inner {
    fn append(&mut self, name: String, path: Option<PathBuf>, module: Arc<dyn Module>) -> ModuleEntry {
        let entry = ModuleEntry {
            index: self.modules.len(),
            name,
            path,
            module,
        };
        self.modules.push(entry.clone());

        let module = Arc::clone(&entry.module);
        self.hooks.server_init.push(Arc::new(move || module.init()));
        let module = Arc::clone(&entry.module);
        self.hooks
            .client_accept
            .push(Arc::new(move |conn| module.accept(conn)));
        let module = Arc::clone(&entry.module);
        self.hooks
            .client_recv
            .push(Arc::new(move |conn, data| module.recv(conn, data)));
        let module = Arc::clone(&entry.module);
        self.hooks
            .client_send
            .push(Arc::new(move |conn, data| module.send(conn, data)));

        trace!(module = %entry.name, index = entry.index, "registered module hooks");
        entry
    }

    unsafe fn load(&mut self, path: &Path) -> Result<ModuleEntry, Error> {
        let module = unsafe { loader::read_module(path) }.inspect_err(|err| {
            warn!(path = %path.display(), error = %err, "module load failed");
        })?;
        let entry = self.append(module_name(path), Some(path.to_path_buf()), Arc::new(module));
        info!(module = %entry.name, path = %path.display(), index = entry.index, "loaded module");
        Ok(entry)
    }
}

fn module_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let prefix = std::env::consts::DLL_PREFIX;
    match stem.strip_prefix(prefix) {
        Some(bare) if !prefix.is_empty() && !bare.is_empty() => bare.to_string(),
        _ => stem,
    }
}

/// Process-wide state the server's plugin layer needs: loaded modules plus
/// the four hook lists, all behind one lock.
pub struct ModuleRegistry {
    inner: Mutex<Inner>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> &'static ModuleRegistry {
        static GLOBAL: OnceLock<ModuleRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ModuleRegistry::new)
    }

    /// Loads one shared object and registers its module and hooks.
    ///
    /// # Safety
    ///
    /// The object's initializers run on open, and its `jacques_module`
    /// export is trusted to follow [`crate::api::ModuleDescriptor`].
    pub unsafe fn load_one(&self, path: impl AsRef<Path>) -> Result<ModuleEntry, Error> {
        let mut inner = self.inner.lock();
        unsafe { inner.load(path.as_ref()) }
    }

    /// Loads `paths` in order under a single lock, stopping at the first
    /// failure. Modules loaded before the failure stay registered.
    ///
    /// Returns the entries registered by this call.
    ///
    /// # Safety
    ///
    /// Same contract as [`ModuleRegistry::load_one`], for every path.
    pub unsafe fn load_many<I, P>(&self, paths: I) -> Result<Vec<ModuleEntry>, Error>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut inner = self.inner.lock();
        let mut loaded = Vec::new();
        for path in paths {
            match unsafe { inner.load(path.as_ref()) } {
                Ok(entry) => loaded.push(entry),
                Err(err) => {
                    warn!(
                        loaded = loaded.len(),
                        path = %path.as_ref().display(),
                        "aborting module batch"
                    );
                    return Err(err);
                }
            }
        }
        Ok(loaded)
    }

    /// Registers a module already linked into the process.
    pub fn register_module(&self, name: impl Into<String>, module: Arc<dyn Module>) -> ModuleEntry {
        let entry = self.inner.lock().append(name.into(), None, module);
        info!(module = %entry.name, index = entry.index, "registered native module");
        entry
    }

    pub fn register_server_init(&self, hook: impl Fn() -> i32 + Send + Sync + 'static) {
        self.inner.lock().hooks.server_init.push(Arc::new(hook));
        trace!("registered server init hook");
    }

    pub fn register_client_accept(&self, hook: impl Fn(Connection) -> i32 + Send + Sync + 'static) {
        self.inner.lock().hooks.client_accept.push(Arc::new(hook));
        trace!("registered client accept hook");
    }

    pub fn register_client_recv(
        &self,
        hook: impl Fn(Connection, Payload) -> i32 + Send + Sync + 'static,
    ) {
        self.inner.lock().hooks.client_recv.push(Arc::new(hook));
        trace!("registered client recv hook");
    }

    pub fn register_client_send(
        &self,
        hook: impl Fn(Connection, Payload) -> i32 + Send + Sync + 'static,
    ) {
        self.inner.lock().hooks.client_send.push(Arc::new(hook));
        trace!("registered client send hook");
    }

    /// Registered modules in load order.
    pub fn modules(&self) -> Vec<ModuleEntry> {
        self.inner.lock().modules.clone()
    }

    pub fn hooks(&self) -> Hooks {
        self.inner.lock().hooks.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ModuleRegistry")
            .field("modules", &inner.modules)
            .field("hooks", &inner.hooks)
            .finish()
    }
}

/// [`ModuleRegistry::load_one`] on the global registry.
///
/// # Safety
///
/// See [`ModuleRegistry::load_one`].
pub unsafe fn load_one(path: impl AsRef<Path>) -> Result<ModuleEntry, Error> {
    unsafe { ModuleRegistry::global().load_one(path) }
}

/// [`ModuleRegistry::load_many`] on the global registry.
///
/// # Safety
///
/// See [`ModuleRegistry::load_many`].
pub unsafe fn load_many<I, P>(paths: I) -> Result<Vec<ModuleEntry>, Error>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    unsafe { ModuleRegistry::global().load_many(paths) }
}

/// Modules in the global registry.
pub fn modules() -> Vec<ModuleEntry> {
    ModuleRegistry::global().modules()
}

pub fn register_server_init(hook: impl Fn() -> i32 + Send + Sync + 'static) {
    ModuleRegistry::global().register_server_init(hook);
}

pub fn register_client_accept(hook: impl Fn(Connection) -> i32 + Send + Sync + 'static) {
    ModuleRegistry::global().register_client_accept(hook);
}

pub fn register_client_recv(hook: impl Fn(Connection, Payload) -> i32 + Send + Sync + 'static) {
    ModuleRegistry::global().register_client_recv(hook);
}

pub fn register_client_send(hook: impl Fn(Connection, Payload) -> i32 + Send + Sync + 'static) {
    ModuleRegistry::global().register_client_send(hook);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tagged {
        id: i32,
        accepts: AtomicUsize,
    }

    impl Tagged {
        fn new(id: i32) -> Arc<Self> {
            Arc::new(Self {
                id,
                accepts: AtomicUsize::new(0),
            })
        }
    }

    impl Module for Tagged {
        fn init(&self) -> i32 {
            self.id
        }

        fn accept(&self, _conn: Connection) -> i32 {
            self.accepts.fetch_add(1, Ordering::SeqCst);
            self.id * 10 + 1
        }

        fn recv(&self, _conn: Connection, _data: Payload) -> i32 {
            self.id * 10 + 2
        }

        fn send(&self, _conn: Connection, _data: Payload) -> i32 {
            self.id * 10 + 3
        }
    }

    fn null_conn() -> Connection {
        Connection::from_raw(ptr::null_mut())
    }

    fn null_payload() -> Payload {
        Payload::from_raw(ptr::null_mut())
    }

    #[test]
    fn native_modules_append_one_hook_per_list_in_order() {
        let registry = ModuleRegistry::new();
        registry.register_module("first", Tagged::new(1));
        registry.register_module("second", Tagged::new(2));

        let names: Vec<_> = registry
            .modules()
            .iter()
            .map(|entry| (entry.index(), entry.name().to_string()))
            .collect();
        assert_eq!(names, vec![(0, "first".to_string()), (1, "second".to_string())]);

        let hooks = registry.hooks();
        let init: Vec<_> = hooks.server_init.iter().map(|hook| hook()).collect();
        let accept: Vec<_> = hooks.client_accept.iter().map(|hook| hook(null_conn())).collect();
        let recv: Vec<_> = hooks
            .client_recv
            .iter()
            .map(|hook| hook(null_conn(), null_payload()))
            .collect();
        let send: Vec<_> = hooks
            .client_send
            .iter()
            .map(|hook| hook(null_conn(), null_payload()))
            .collect();
        assert_eq!(init, vec![1, 2]);
        assert_eq!(accept, vec![11, 21]);
        assert_eq!(recv, vec![12, 22]);
        assert_eq!(send, vec![13, 23]);
    }

    #[test]
    fn registry_never_invokes_hooks() {
        let registry = ModuleRegistry::new();
        let module = Tagged::new(4);
        registry.register_module("quiet", module.clone());
        let _ = registry.hooks();
        assert_eq!(module.accepts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn standalone_hooks_interleave_with_module_hooks() {
        let registry = ModuleRegistry::new();
        registry.register_server_init(|| 100);
        registry.register_module("mod", Tagged::new(5));
        registry.register_server_init(|| 200);

        let init: Vec<_> = registry.hooks().server_init.iter().map(|hook| hook()).collect();
        assert_eq!(init, vec![100, 5, 200]);
        assert_eq!(registry.len(), 1);
        assert!(registry.hooks().client_accept.len() == 1);
    }

    #[test]
    fn failed_load_registers_nothing() {
        let registry = ModuleRegistry::new();
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("libmissing.so");

        let err = unsafe { registry.load_one(&missing) }.expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::Open);
        assert!(registry.is_empty());
        let hooks = registry.hooks();
        assert!(hooks.server_init.is_empty());
        assert!(hooks.client_send.is_empty());
    }

    #[test]
    fn batch_stops_at_first_failure() {
        let registry = ModuleRegistry::new();
        registry.register_module("native", Tagged::new(9));
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = [temp.path().join("liba.so"), temp.path().join("libb.so")];

        let err = unsafe { registry.load_many(&paths) }.expect_err("batch");
        assert_eq!(err.path(), Some(paths[0].as_path()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_batch_succeeds() {
        let registry = ModuleRegistry::new();
        let loaded = unsafe { registry.load_many(Vec::<PathBuf>::new()) }.expect("empty batch");
        assert!(loaded.is_empty());
    }

    #[test]
    fn module_names_drop_platform_prefix_and_suffix() {
        let prefix = std::env::consts::DLL_PREFIX;
        let suffix = std::env::consts::DLL_SUFFIX;
        let path = PathBuf::from(format!("/opt/mods/{prefix}echo{suffix}"));
        assert_eq!(module_name(&path), "echo");
        assert_eq!(module_name(Path::new("/opt/mods/plain.so")), "plain");
    }

    #[test]
    fn global_registry_is_a_singleton() {
        let first = ModuleRegistry::global() as *const ModuleRegistry;
        let second = ModuleRegistry::global() as *const ModuleRegistry;
        assert_eq!(first, second);
    }
}
