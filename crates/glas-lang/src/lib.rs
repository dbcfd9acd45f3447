//! Library surface of the `glas` command line front end.

use std::path::Path;

use glas_core::errors::{GlasError, ERROR_TAG};
use glas_core::loader::{rt_load_binary_default, rt_run_builtin_tests};
use glas_core::{Glas, Resolved};

/// A runtime thread with the default environment installed.
pub fn create_runtime() -> Result<Glas, GlasError> {
    glas_core::init_thread()
}

/// Run a named operation from the configured environment. Without a
/// front-end compiler the configuration cannot define applications, so
/// this reports what is missing rather than guessing.
pub fn run_operation(opname: &str, args: &[String]) -> i32 {
    let mut g = match create_runtime() {
        Ok(g) => g,
        Err(err) => {
            eprintln!("{} {}", ERROR_TAG, err);
            return 1;
        }
    };
    g.set_debug_name(opname);
    for arg in args {
        g.binary_push(arg.as_bytes());
    }
    match g.call(opname) {
        Ok(()) => {
            if g.commit() {
                0
            } else {
                eprintln!("{} {} failed to commit ({})", ERROR_TAG, opname, g.error_bits());
                1
            }
        }
        Err(err) => {
            eprintln!("{} {}", ERROR_TAG, err);
            1
        }
    }
}

fn compiler_name_for(ext: &str) -> String {
    format!("%lang.{}", ext)
}

/// Feed one source (file contents or command text) through the
/// compiler bound for its extension, leaving the result on the stack.
pub fn compile_source(g: &mut Glas, ext: &str, source: &[u8]) -> Result<(), GlasError> {
    let compiler = compiler_name_for(ext);
    match g.namespace().resolve(&compiler)? {
        Resolved::Undefined => Err(GlasError::undefined(format!(
            "no compiler bound for extension {}",
            ext
        ))),
        _ => {
            g.binary_push(source);
            g.call(&compiler)
        }
    }
}

/// Run a script file, honoring shebang usage: the extension passed by
/// the caller overrides the file's own.
pub fn run_script(ext: &str, file: &str, _args: &[String]) -> i32 {
    let mut g = match create_runtime() {
        Ok(g) => g,
        Err(err) => {
            eprintln!("{} {}", ERROR_TAG, err);
            return 1;
        }
    };
    let (bytes, _origin) = match rt_load_binary_default(file, None) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("{} {}", ERROR_TAG, err);
            return 1;
        }
    };
    match compile_source(&mut g, ext, &bytes) {
        Ok(()) => {
            if g.commit() {
                0
            } else {
                eprintln!("{} {} failed to commit ({})", ERROR_TAG, file, g.error_bits());
                1
            }
        }
        Err(err) => {
            eprintln!("{} {}", ERROR_TAG, err);
            1
        }
    }
}

/// Run command text as if it were a file with the given extension.
pub fn run_command_text(ext: &str, text: &str, _args: &[String]) -> i32 {
    let mut g = match create_runtime() {
        Ok(g) => g,
        Err(err) => {
            eprintln!("{} {}", ERROR_TAG, err);
            return 1;
        }
    };
    match compile_source(&mut g, ext, text.as_bytes()) {
        Ok(()) => {
            if g.commit() {
                0
            } else {
                eprintln!("{} command failed to commit ({})", ERROR_TAG, g.error_bits());
                1
            }
        }
        Err(err) => {
            eprintln!("{} {}", ERROR_TAG, err);
            1
        }
    }
}

/// Check a module compiles, or run the builtin self-tests when no
/// module is named.
pub fn check(module: Option<&str>) -> i32 {
    match module {
        None => {
            if rt_run_builtin_tests() {
                println!("builtin tests passed");
                0
            } else {
                eprintln!("{} builtin tests failed", ERROR_TAG);
                1
            }
        }
        Some(path) => {
            let ext = Path::new(path)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("glas");
            let mut g = match create_runtime() {
                Ok(g) => g,
                Err(err) => {
                    eprintln!("{} {}", ERROR_TAG, err);
                    return 1;
                }
            };
            let bytes = match rt_load_binary_default(path, None) {
                Ok((bytes, _)) => bytes,
                Err(err) => {
                    eprintln!("{} {}", ERROR_TAG, err);
                    return 1;
                }
            };
            match compile_source(&mut g, ext, &bytes) {
                Ok(()) => {
                    println!("{} compiles", path);
                    0
                }
                Err(err) => {
                    eprintln!("{} {}: {}", ERROR_TAG, path, err);
                    1
                }
            }
        }
    }
}

/// Create the default configuration file when it does not exist yet.
pub fn init_config() -> i32 {
    let Some(path) = glas_core::loader::find_user_config() else {
        eprintln!("{} no configuration location available", ERROR_TAG);
        return 1;
    };
    if path.exists() {
        println!("configuration already present at {}", path.display());
        return 0;
    }
    if let Some(parent) = path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            eprintln!("{} cannot create {}: {}", ERROR_TAG, parent.display(), err);
            return 1;
        }
    }
    match std::fs::write(&path, b"# glas user configuration\n") {
        Ok(()) => {
            println!("created {}", path.display());
            0
        }
        Err(err) => {
            eprintln!("{} cannot write {}: {}", ERROR_TAG, path.display(), err);
            1
        }
    }
}
