//! # Loader Module
//!
//! Filesystem access and module resolution. The effective load path
//! lives in the global `*load-path*`; `use` and `load` search it for
//! `M.vem` (pre-compiled form) before `M.vsp` (source). The `vesper`
//! prelude module is embedded in the binary and bootstraps at init.

use crate::error::{VesperError, VesperResult};
use crate::value::{self, Value};
use crate::vm::Vm;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// The self-hosted prelude, loaded at VM init.
const PRELUDE: &str = include_str!("../lib/vesper.vsp");

const LOAD_PATH_GLOBAL: &str = "*load-path*";

/// Source and pre-compiled module extensions, tried in this order.
const EXTENSIONS: [&str; 2] = ["vem", "vsp"];

pub fn is_directory_readable(path: &str) -> bool {
    Path::new(path).is_dir()
}

pub fn is_file_readable(path: &str) -> bool {
    Path::new(path).is_file()
}

/// Absolute path of a file or directory, with `~` expanded against
/// HOME. Falls back to the input when expansion fails.
pub fn expand_file_path(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}{}", home, rest);
        }
    }
    match std::fs::canonicalize(path) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => path.to_string(),
    }
}

pub fn slurp_file(path: &str) -> VesperResult<String> {
    let path = expand_file_path(path);
    std::fs::read_to_string(&path)
        .map_err(|e| VesperError::io(format!("cannot read {}: {}", path, e)))
}

pub fn spit_file(path: &str, data: &str) -> VesperResult<()> {
    let path = expand_file_path(path);
    std::fs::write(&path, data).map_err(|e| VesperError::io(format!("cannot write {}: {}", path, e)))
}

// -----------------------------------------------------------------------------
// LOAD PATH
// -----------------------------------------------------------------------------

/// Builds the default load path: the current directory, VESPER_PATH
/// entries, then the conventional home and GOPATH library locations.
pub fn init_load_path(vm: &Arc<Vm>) {
    let mut dirs: Vec<Value> = vec![Value::string(".")];
    if let Ok(path) = std::env::var("VESPER_PATH") {
        for dir in path.split(':').filter(|d| !d.is_empty()) {
            dirs.push(Value::string(dir));
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        dirs.push(Value::string(format!("{}/.vesper", home)));
    }
    if let Ok(gopath) = std::env::var("GOPATH") {
        dirs.push(Value::string(format!(
            "{}/src/github.com/robotii/vesper/lib",
            gopath
        )));
    }
    vm.define_global(LOAD_PATH_GLOBAL, value::list_from_values(&dirs));
}

/// Prepends a directory to the load path.
pub fn add_path(vm: &Arc<Vm>, dir: &str) {
    let current = vm.global(LOAD_PATH_GLOBAL).unwrap_or_else(Value::empty_list);
    vm.define_global(
        LOAD_PATH_GLOBAL,
        value::cons(Value::string(dir), current),
    );
}

/// Resolves a module name to a readable file. A name that is already
/// a readable path wins; otherwise each load-path directory is tried
/// with each extension.
fn find_module_file(vm: &Arc<Vm>, name: &str) -> Option<String> {
    if name.contains('.') && is_file_readable(&expand_file_path(name)) {
        return Some(expand_file_path(name));
    }
    let path = vm.global(LOAD_PATH_GLOBAL).unwrap_or_else(Value::empty_list);
    let mut dir = path;
    while !dir.is_empty_list() {
        if let Value::String(d) = value::car(&dir) {
            for ext in EXTENSIONS {
                let candidate = PathBuf::from(d.as_ref()).join(format!("{}.{}", name, ext));
                let candidate = candidate.to_string_lossy().into_owned();
                if is_file_readable(&candidate) {
                    return Some(candidate);
                }
            }
        }
        dir = value::cdr(&dir);
    }
    None
}

// -----------------------------------------------------------------------------
// LOADING
// -----------------------------------------------------------------------------

/// Loads a module by name (or a source file by path), evaluating
/// every top-level form in order.
pub fn load_module(vm: &Arc<Vm>, name: &str) -> VesperResult<()> {
    match find_module_file(vm, name) {
        Some(file) => load_file(vm, &file),
        None if name == "vesper" => {
            debug!("loading embedded prelude");
            eval_forms(vm, PRELUDE)
        }
        None => Err(VesperError::io(format!("module not found: {}", name))),
    }
}

pub fn load_file(vm: &Arc<Vm>, path: &str) -> VesperResult<()> {
    if vm.verbose() {
        println!("[loading {}]", path);
    }
    let started = std::time::Instant::now();
    let source = slurp_file(path)?;
    eval_forms(vm, &source)?;
    if vm.verbose() {
        println!("[loaded {} in {:?}]", path, started.elapsed());
    }
    Ok(())
}

fn eval_forms(vm: &Arc<Vm>, source: &str) -> VesperResult<()> {
    let forms = crate::reader::read_all(vm, source, &Value::Null)?;
    let mut cur = forms;
    while !cur.is_empty_list() {
        vm.eval(&value::car(&cur))?;
        cur = value::cdr(&cur);
    }
    Ok(())
}

/// Bootstraps the load path and the embedded `vesper` prelude.
pub fn load_prelude(vm: &Arc<Vm>) -> VesperResult<()> {
    init_load_path(vm);
    load_module(vm, "vesper")
}
