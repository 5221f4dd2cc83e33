//! Purpose: `jacques` CLI entry point for resolving and validating server modules.
//! Role: Binary crate root; parses args, loads modules into a scratch registry, emits JSON on stdout.
//! Invariants: Errors are emitted as JSON on stderr unless stderr is a terminal.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: The CLI never dispatches hooks; it only reports what registered.
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use jacques::api::{
    Error, ErrorKind, MODULE_DIR_ENV, ModuleEntry, ModuleRef, ModuleRegistry,
    default_module_dir, to_exit_code,
};

#[derive(Parser)]
#[command(
    name = "jacques",
    version,
    about = "Resolve and validate jacques server modules",
    long_about = None,
    after_help = r#"EXAMPLES
  $ jacques modules resolve echo auth
  $ jacques modules load echo ./build/libauth.so
  $ JACQUES_MODULE_DIR=/usr/lib/jacques jacques modules load echo

Bare names resolve inside the module dir; anything containing '/' is a path."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        env = MODULE_DIR_ENV,
        help = "Directory for bare module names (default: ~/.jacques/modules)",
        value_hint = ValueHint::DirPath
    )]
    module_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Work with loadable modules.
    #[command(subcommand)]
    Modules(ModulesCommand),
}

#[derive(Subcommand)]
enum ModulesCommand {
    /// Load modules in order and report what registered.
    Load(ModuleArgs),
    /// Print the path each module reference resolves to.
    Resolve(ModuleArgs),
}

#[derive(Args)]
struct ModuleArgs {
    #[arg(required = true, value_name = "MODULE", value_hint = ValueHint::FilePath)]
    modules: Vec<String>,
}

#[derive(Serialize)]
struct LoadReport {
    modules: Vec<ModuleJson>,
    hooks: HookCounts,
}

#[derive(Serialize)]
struct ModuleJson {
    index: usize,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
}

#[derive(Serialize)]
struct HookCounts {
    server_init: usize,
    client_accept: usize,
    client_recv: usize,
    client_send: usize,
}

#[derive(Serialize)]
struct ResolveReport {
    resolved: Vec<ResolvedJson>,
}

#[derive(Serialize)]
struct ResolvedJson {
    module: String,
    path: String,
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let code = if err.kind() == ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand {
                    2
                } else {
                    0
                };
                return Ok(code);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Run `jacques --help` for usage."));
            }
        },
    };

    let module_dir = cli.module_dir.unwrap_or_else(default_module_dir);
    match cli.command {
        Command::Modules(ModulesCommand::Load(args)) => load_modules(&module_dir, &args.modules),
        Command::Modules(ModulesCommand::Resolve(args)) => {
            resolve_modules(&module_dir, &args.modules)
        }
    }
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let first = rendered.lines().next().unwrap_or("invalid arguments");
    first.trim_start_matches("error: ").to_string()
}

fn resolve_all(module_dir: &Path, refs: &[String]) -> Result<Vec<PathBuf>, Error> {
    refs.iter()
        .map(|value| ModuleRef::parse(value).resolve(module_dir))
        .collect()
}

fn resolve_modules(module_dir: &Path, refs: &[String]) -> Result<i32, Error> {
    let paths = resolve_all(module_dir, refs)?;
    let resolved = refs
        .iter()
        .zip(paths)
        .map(|(module, path)| ResolvedJson {
            module: module.clone(),
            path: path.display().to_string(),
        })
        .collect();
    emit_json(&ResolveReport { resolved })?;
    Ok(0)
}

fn load_modules(module_dir: &Path, refs: &[String]) -> Result<i32, Error> {
    let paths = resolve_all(module_dir, refs)?;
    let registry = ModuleRegistry::new();
    // Loading runs module initializers; the operator asked for exactly these objects.
    let outcome = unsafe { registry.load_many(&paths) };
    emit_json(&load_report(&registry))?;
    outcome.map(|_| 0)
}

fn load_report(registry: &ModuleRegistry) -> LoadReport {
    let hooks = registry.hooks();
    LoadReport {
        modules: registry.modules().iter().map(module_json).collect(),
        hooks: HookCounts {
            server_init: hooks.server_init.len(),
            client_accept: hooks.client_accept.len(),
            client_recv: hooks.client_recv.len(),
            client_send: hooks.client_send.len(),
        },
    }
}

fn module_json(entry: &ModuleEntry) -> ModuleJson {
    ModuleJson {
        index: entry.index(),
        name: entry.name().to_string(),
        path: entry.path().map(|path| path.display().to_string()),
    }
}

fn emit_json(value: &impl Serialize) -> Result<(), Error> {
    let json = serde_json::to_string(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("json encode failed")
            .with_source(err)
    })?;
    println!("{json}");
    Ok(())
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    err.message()
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{:?}", err.kind()))
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut current = err.source();
    while let Some(source) = current {
        causes.push(source.to_string());
        current = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}
