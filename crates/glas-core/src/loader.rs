//! External adapters: binary loading, loader interception, builtin
//! compiler bindings, and default initialization.
//!
//! Front-end compilers are collaborators, not part of the runtime: the
//! `glas` syntax binding reports undefined until a front end is
//! linked, while `glob` files decode directly through the wire codec.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::{debug_enabled, GlasError, WARN_TAG};
use crate::namespace::TlTable;
use crate::shrub;
use crate::thread::{Glas, Runtime};
use crate::value::text_value;

/// Client interception of binary loading (a virtual file system).
pub trait LoaderHooks: Send + Sync {
    /// Whether this URI routes through the client.
    fn virtualize_path(&self, uri: &str) -> bool;

    fn try_load_binary(&self, uri: &str) -> Result<Vec<u8>, GlasError>;
}

/// Install (or clear) the loader interception hooks.
pub fn rt_loader_intercept(hooks: Option<Arc<dyn LoaderHooks>>) {
    *Runtime::global().vfs.write().unwrap() = hooks;
}

/// Where a load request came from; relative paths inherit the origin's
/// virtualization.
#[derive(Clone, Debug, Default)]
pub struct LoadOrigin {
    pub uri: String,
    pub virtualized: bool,
}

fn is_relative(uri: &str) -> bool {
    Path::new(uri).is_relative()
}

/// Load a binary, consulting the interception hooks first.
pub fn rt_load_binary_default(
    uri: &str,
    origin: Option<&LoadOrigin>,
) -> Result<(Vec<u8>, LoadOrigin), GlasError> {
    let hooks = Runtime::global().vfs.read().unwrap().clone();
    if let Some(hooks) = hooks {
        let virtualized = hooks.virtualize_path(uri)
            || (is_relative(uri) && origin.map_or(false, |o| o.virtualized));
        if virtualized {
            let bytes = hooks.try_load_binary(uri)?;
            return Ok((
                bytes,
                LoadOrigin {
                    uri: uri.to_string(),
                    virtualized: true,
                },
            ));
        }
    }
    let resolved = match origin {
        Some(o) if is_relative(uri) => Path::new(&o.uri)
            .parent()
            .map(|p| p.join(uri))
            .unwrap_or_else(|| PathBuf::from(uri)),
        _ => PathBuf::from(uri),
    };
    let bytes = std::fs::read(&resolved)
        .map_err(|e| GlasError::error_op(format!("cannot load {}: {}", resolved.display(), e)))?;
    Ok((
        bytes,
        LoadOrigin {
            uri: resolved.to_string_lossy().into_owned(),
            virtualized: false,
        },
    ))
}

/// Install the builtin primitives below a prefix, `%` by convention.
pub fn ns_load_prims(g: &mut Glas, prefix: &str) -> Result<(), GlasError> {
    crate::prims::install(g, prefix)
}

fn compile_glob(g: &mut Glas) -> Result<(), GlasError> {
    let (bytes, complete) = g.binary_peek_all();
    if !complete {
        return Err(GlasError::data_type("glob source must be a binary"));
    }
    let value = shrub::decode(&bytes)?;
    let _ = g.pop();
    g.push(value);
    Ok(())
}

fn compile_glas(_g: &mut Glas) -> Result<(), GlasError> {
    Err(GlasError::undefined(
        "no front-end compiler is linked for the glas syntax",
    ))
}

/// Install compiler definitions keyed by file extension.
pub fn ns_load_builtin_compilers(g: &mut Glas, prefix: &str) -> Result<(), GlasError> {
    use crate::namespace::{Def, NativeProg};
    let ns = g
        .namespace()
        .define(
            &format!("{}glob", prefix),
            Def::Native(Arc::new(NativeProg {
                name: "compile.glob",
                run: compile_glob,
            })),
        )?
        .define(
            &format!("{}glas", prefix),
            Def::Native(Arc::new(NativeProg {
                name: "compile.glas",
                run: compile_glas,
            })),
        )?;
    g.replace_namespace(ns);
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("USERPROFILE").map(PathBuf::from))
}

fn user_config_disabled() -> bool {
    std::env::var_os("GLAS_NO_USER_CONFIG").is_some()
}

/// Locate the user configuration: `$GLAS_CONF`, then the platform
/// configuration directory.
pub fn find_user_config() -> Option<PathBuf> {
    if user_config_disabled() {
        return None;
    }
    if let Some(path) = std::env::var_os("GLAS_CONF") {
        return Some(PathBuf::from(path));
    }
    if cfg!(windows) {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return Some(PathBuf::from(appdata).join("glas").join("conf.glas"));
        }
    }
    home_dir().map(|home| home.join(".config").join("glas").join("conf.glas"))
}

/// Default initialization: primitives at `%`, builtin compilers at
/// `%lang.`, the user configuration bound below `conf.`, and `%env.`
/// mirroring `conf.env.`.
pub fn init_default(g: &mut Glas) -> Result<(), GlasError> {
    ns_load_prims(g, "%")?;
    ns_load_builtin_compilers(g, "%lang.")?;
    g.ns_tl_apply(TlTable::from_pairs(&[("%env.", Some("conf.env."))]))?;
    if let Some(path) = find_user_config() {
        match rt_load_binary_default(&path.to_string_lossy(), None) {
            Ok((bytes, origin)) => {
                g.push(text_value(&origin.uri));
                g.ns_data_def("conf.path")?;
                g.binary_push(&bytes);
                g.ns_data_def("conf.file")?;
            }
            Err(err) => {
                if debug_enabled() {
                    eprintln!(
                        "{} no user configuration at {}: {}",
                        WARN_TAG,
                        path.display(),
                        err
                    );
                }
            }
        }
    }
    Ok(())
}

/// Smoke coverage over values, registers and the commit protocol, for
/// embedders checking a build.
pub fn rt_run_builtin_tests() -> bool {
    let mut g = Glas::new();
    g.set_debug_name("builtin-tests");
    let mut ok = true;

    g.i64_push(300);
    ok &= g.i64_peek() == Ok(300);
    ok &= g.i8_peek().is_err();
    g.abort();

    g.binary_push(&[1, 2, 3]);
    let (bytes, complete) = g.binary_peek_all();
    ok &= complete && bytes == vec![1, 2, 3];
    g.abort();

    ok &= g.reg_fresh("t.").is_ok();
    ok &= g.commit();
    g.i64_push(7);
    ok &= g.reg_set("t.x").is_ok();
    ok &= g.commit();
    ok &= g.reg_get("t.x").is_ok();
    ok &= g.i64_peek() == Ok(7);
    g.abort();

    let probe = crate::value::int_value(-7);
    match shrub::encode(&probe).and_then(|b| shrub::decode(&b)) {
        Ok(back) => ok &= back == probe,
        Err(_) => ok = false,
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLoader;

    impl LoaderHooks for FixedLoader {
        fn virtualize_path(&self, uri: &str) -> bool {
            uri.starts_with("virt:")
        }

        fn try_load_binary(&self, uri: &str) -> Result<Vec<u8>, GlasError> {
            if uri == "virt:data" || uri == "peer" {
                Ok(b"virtual".to_vec())
            } else {
                Err(GlasError::undefined(uri.to_string()))
            }
        }
    }

    #[test]
    fn loader_interception_routes_virtual_uris() {
        rt_loader_intercept(Some(Arc::new(FixedLoader)));
        let (bytes, origin) = rt_load_binary_default("virt:data", None).unwrap();
        assert_eq!(bytes, b"virtual");
        assert!(origin.virtualized);
        // Relative loads inherit virtualization from their origin.
        let (bytes, _) = rt_load_binary_default("peer", Some(&origin)).unwrap();
        assert_eq!(bytes, b"virtual");
        rt_loader_intercept(None);
    }

    #[test]
    fn filesystem_loads_resolve_relative_to_origin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"on disk").unwrap();
        let (bytes, origin) =
            rt_load_binary_default(&path.to_string_lossy(), None).unwrap();
        assert_eq!(bytes, b"on disk");
        assert!(!origin.virtualized);
        std::fs::write(dir.path().join("next.bin"), b"second").unwrap();
        let (bytes, _) = rt_load_binary_default("next.bin", Some(&origin)).unwrap();
        assert_eq!(bytes, b"second");
    }

    #[test]
    fn builtin_tests_pass() {
        assert!(rt_run_builtin_tests());
    }
}
