use glas_lang::{check, compile_source, create_runtime};

#[test]
fn runtime_creation_installs_prims() {
    std::env::set_var("GLAS_NO_USER_CONFIG", "1");
    let mut g = create_runtime().unwrap();
    assert!(g.name_defined("%copy"));
    assert!(g.name_defined("%lang.glob"));
    g.i64_push(1);
    g.call("%copy").unwrap();
    assert_eq!(g.stack_depth(), 2);
}

#[test]
fn glob_sources_compile_to_values() {
    std::env::set_var("GLAS_NO_USER_CONFIG", "1");
    let mut g = create_runtime().unwrap();
    let value = glas_core::value::int_value(42);
    let bytes = glas_core::shrub::encode(&value).unwrap();
    compile_source(&mut g, "glob", &bytes).unwrap();
    assert_eq!(g.pop(), value);
}

#[test]
fn glas_sources_report_missing_front_end() {
    std::env::set_var("GLAS_NO_USER_CONFIG", "1");
    let mut g = create_runtime().unwrap();
    assert!(compile_source(&mut g, "glas", b"(module)").is_err());
}

#[test]
fn unknown_extensions_report_no_compiler() {
    std::env::set_var("GLAS_NO_USER_CONFIG", "1");
    let mut g = create_runtime().unwrap();
    assert!(compile_source(&mut g, "txt", b"text").is_err());
}

#[test]
fn builtin_check_passes() {
    std::env::set_var("GLAS_NO_USER_CONFIG", "1");
    assert_eq!(check(None), 0);
}

#[test]
fn check_compiles_glob_modules() {
    std::env::set_var("GLAS_NO_USER_CONFIG", "1");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("module.glob");
    let value = glas_core::value::int_value(7);
    std::fs::write(&path, glas_core::shrub::encode(&value).unwrap()).unwrap();
    assert_eq!(check(Some(&path.to_string_lossy())), 0);
    let bad = dir.path().join("module.glas");
    std::fs::write(&bad, b"(unsupported)").unwrap();
    assert_eq!(check(Some(&bad.to_string_lossy())), 1);
}
