//! Purpose: Compile the C fixture modules exercised by the loader tests.
//! Role: Cargo build-script; drives the `cc`-selected C compiler to emit shared objects.
//! Invariants: `cargo:rerun-if-changed` covers the fixture source.
//! Invariants: A missing or failing C compiler only skips fixtures (tests then skip too).
//! Invariants: Uses only Cargo-provided env vars (e.g. `CARGO_MANIFEST_DIR`, `OUT_DIR`).
use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

// Shared object stem and the preprocessor defines selecting its variant.
const FIXTURES: &[(&str, &[&str])] = &[
    ("alpha", &["MODULE_ID=1"]),
    ("beta", &["MODULE_ID=2"]),
    ("gamma", &["MODULE_ID=3"]),
    ("nosymbol", &["MODULE_ID=4", "OMIT_DESCRIPTOR"]),
    ("nulldesc", &["MODULE_ID=5", "NULL_DESCRIPTOR"]),
    ("nullhook", &["MODULE_ID=6", "NULL_SEND_HOOK"]),
];

fn main() {
    println!("cargo:rerun-if-changed=fixtures/module.c");

    let target = env::var("TARGET").unwrap_or_default();
    if target.contains("windows") || target.contains("wasm") {
        println!("cargo:warning=loader fixtures are not built for `{target}`");
        return;
    }

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR"));
    let source = manifest_dir.join("fixtures").join("module.c");
    let fixture_dir = out_dir.join("fixtures");
    fs::create_dir_all(&fixture_dir).expect("failed to create fixture output directory");

    let compiler = match cc::Build::new()
        .pic(true)
        .opt_level(0)
        .warnings(false)
        .try_get_compiler()
    {
        Ok(compiler) => compiler,
        Err(err) => {
            println!("cargo:warning=skipping loader fixtures: {err}");
            return;
        }
    };

    let (link_flag, suffix) = if target.contains("apple") {
        ("-dynamiclib", "dylib")
    } else {
        ("-shared", "so")
    };

    for (stem, defines) in FIXTURES {
        let output = fixture_dir.join(format!("lib{stem}.{suffix}"));
        let mut cmd: Command = compiler.to_command();
        cmd.arg(link_flag);
        for define in defines.iter() {
            cmd.arg(format!("-D{define}"));
        }
        cmd.arg("-o").arg(&output).arg(&source);

        match cmd.status() {
            Ok(status) if status.success() => {}
            Ok(status) => {
                println!("cargo:warning=skipping loader fixtures: `{stem}` failed with {status}");
                return;
            }
            Err(err) => {
                println!("cargo:warning=skipping loader fixtures: {err}");
                return;
            }
        }
    }

    println!(
        "cargo:rustc-env=JACQUES_FIXTURE_DIR={}",
        fixture_dir.display()
    );
}
