//! Namespace operations through the host API: definitions,
//! translations, namespace programs, callbacks and attachment.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use glas_core::errors::ErrorBits;
use glas_core::value::{int_value, Value};
use glas_core::{Glas, NsAst, TlTable};

#[test]
fn data_definitions_push_copies() {
    let mut g = Glas::new();
    g.i64_push(7);
    g.ns_data_def("seven").unwrap();
    assert!(g.commit());
    g.call("seven").unwrap();
    g.call("seven").unwrap();
    assert_eq!(g.i64_peek().unwrap(), 7);
    assert_eq!(g.stack_depth(), 2);
}

#[test]
fn undefined_names_report_cleanly() {
    let mut g = Glas::new();
    assert!(g.call("nothing").is_err());
    assert!(g.error_bits().contains(ErrorBits::NAME_UNDEF));
    assert!(!g.name_defined("nothing"));
}

#[test]
fn hide_makes_names_undefined() {
    let mut g = Glas::new();
    g.i64_push(1);
    g.ns_data_def("x").unwrap();
    assert!(g.name_defined("x"));
    g.ns_hide_def("x").unwrap();
    assert!(!g.name_defined("x"));
    assert!(g.call("x").is_err());
}

#[test]
fn hide_prefix_covers_the_subtree() {
    let mut g = Glas::new();
    g.i64_push(1);
    g.ns_data_def("lib.a").unwrap();
    g.i64_push(2);
    g.ns_data_def("lib.b").unwrap();
    g.i64_push(3);
    g.ns_data_def("other").unwrap();
    g.ns_hide_prefix("lib.").unwrap();
    assert!(!g.name_defined("lib.a"));
    assert!(!g.name_defined("lib.b"));
    assert!(g.name_defined("other"));
}

#[test]
fn translations_rename_prefixes() {
    let mut g = Glas::new();
    g.i64_push(9);
    g.ns_data_def("impl.val").unwrap();
    g.ns_tl_apply(TlTable::from_pairs(&[("api.", Some("impl."))]))
        .unwrap();
    g.call("api.val").unwrap();
    assert_eq!(g.i64_peek().unwrap(), 9);
    // The original spelling still works underneath.
    g.call("impl.val").unwrap();
    assert_eq!(g.i64_peek().unwrap(), 9);
}

#[test]
fn eval_def_is_lazy_and_memoized() {
    let mut g = Glas::new();
    g.push(NsAst::data(int_value(12)));
    g.ns_eval_def("lazy-val", None).unwrap();
    assert!(g.commit());
    g.call("lazy-val").unwrap();
    assert_eq!(g.i64_peek().unwrap(), 12);
}

#[test]
fn eval_prefix_mounts_an_environment() {
    let mut g = Glas::new();
    g.i64_push(1);
    g.ns_data_def("src.one").unwrap();
    g.i64_push(2);
    g.ns_data_def("src.two").unwrap();
    // Reify everything under src. as an environment, bind it at dst.
    let ast = NsAst::translate(
        NsAst::tl_value(&[("", Some("src."))]),
        NsAst::env(),
    );
    g.push(ast);
    g.ns_eval_prefix("dst.", None).unwrap();
    g.call("dst.one").unwrap();
    assert_eq!(g.i64_peek().unwrap(), 1);
    g.call("dst.two").unwrap();
    assert_eq!(g.i64_peek().unwrap(), 2);
}

#[test]
fn eval_prefix_shadows_earlier_bindings() {
    let mut g = Glas::new();
    g.i64_push(1);
    g.ns_data_def("dst.old").unwrap();
    g.i64_push(5);
    g.ns_data_def("src.new").unwrap();
    let ast = NsAst::translate(NsAst::tl_value(&[("", Some("src."))]), NsAst::env());
    g.push(ast);
    g.ns_eval_prefix("dst.", None).unwrap();
    assert!(!g.name_defined("dst.old"), "no merge with prior bindings");
    assert!(g.name_defined("dst.new"));
}

#[test]
fn eval_apply_transforms_a_prefix() {
    let mut g = Glas::new();
    g.i64_push(3);
    g.ns_data_def("cfg.depth").unwrap();
    // An environment transformer that forwards its input unchanged.
    let ast = NsAst::lambda("in", NsAst::env());
    g.push(ast);
    g.ns_eval_apply("cfg.", None).unwrap();
    g.call("cfg.in.depth").unwrap();
    assert_eq!(g.i64_peek().unwrap(), 3);
}

#[test]
fn prep_warms_definitions_in_the_background() {
    let mut g = Glas::new();
    g.push(NsAst::data(int_value(4)));
    g.ns_eval_def("warmed", None).unwrap();
    g.prep("warmed");
    // Whether or not the background got there first, the call works.
    g.call("warmed").unwrap();
    assert_eq!(g.i64_peek().unwrap(), 4);
}

#[test]
fn callbacks_run_against_the_caller_stack() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut g = Glas::new();
    let counter = calls.clone();
    g.ns_cb_def(
        "host.double",
        move |inner| {
            counter.fetch_add(1, Ordering::SeqCst);
            let n = match inner.i64_peek() {
                Ok(n) => n,
                Err(_) => return false,
            };
            let _ = inner.pop();
            inner.i64_push(n * 2);
            true
        },
        None,
        None,
        false,
    )
    .unwrap();
    assert!(g.commit());
    g.i64_push(21);
    g.call("host.double").unwrap();
    assert_eq!(g.i64_peek().unwrap(), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn callback_failure_marks_the_step() {
    let mut g = Glas::new();
    g.ns_cb_def("host.deny", |_| false, None, None, false)
        .unwrap();
    assert!(g.call("host.deny").is_err());
    assert!(g.error_bits().contains(ErrorBits::ERROR_OP));
    assert!(!g.commit());
}

#[test]
fn callbacks_see_the_caller_through_their_prefix() {
    let mut g = Glas::new();
    g.ns_cb_def(
        "host.fetch",
        |inner| {
            if inner.call("$secret").is_err() {
                return false;
            }
            true
        },
        Some("$"),
        None,
        false,
    )
    .unwrap();
    assert!(g.commit());
    g.i64_push(13);
    g.ns_data_def("secret").unwrap();
    g.call("host.fetch").unwrap();
    assert_eq!(g.i64_peek().unwrap(), 13);
}

#[test]
fn committed_detach_disconnects_the_caller() {
    let mut g = Glas::new();
    g.ns_cb_def(
        "host.leave",
        |inner| {
            if !inner.name_defined("$secret") {
                return false;
            }
            if inner.detach().is_err() {
                return false;
            }
            if !inner.commit() {
                return false;
            }
            // After the committed detach the caller has gone dark.
            !inner.name_defined("$secret")
        },
        Some("$"),
        None,
        false,
    )
    .unwrap();
    assert!(g.commit());
    g.i64_push(1);
    g.ns_data_def("secret").unwrap();
    assert!(g.commit());
    g.call("host.leave").unwrap();
}

#[test]
fn callback_tl_scopes_caller_access() {
    let mut g = Glas::new();
    g.ns_cb_def(
        "host.peek",
        |inner| inner.call("$visible").is_ok(),
        Some("$"),
        None,
        false,
    )
    .unwrap();
    assert!(g.commit());
    g.i64_push(2);
    g.ns_data_def("actual").unwrap();
    g.call_tl(
        "host.peek",
        TlTable::from_pairs(&[("visible..", Some("actual"))]),
    )
    .unwrap();
    assert_eq!(g.i64_peek().unwrap(), 2);
}

#[test]
fn glob_compiler_decodes_values() {
    let mut g = glas_core::init_thread().unwrap();
    let v = Value::pair(int_value(3), int_value(4));
    let bytes = glas_core::shrub::encode(&v).unwrap();
    g.binary_push(&bytes);
    g.call("%lang.glob").unwrap();
    assert_eq!(g.pop(), v);
}

#[test]
fn glas_compiler_is_a_stub() {
    let mut g = glas_core::init_thread().unwrap();
    g.binary_push(b"(hello)");
    assert!(g.call("%lang.glas").is_err());
    assert!(g.error_bits().contains(ErrorBits::NAME_UNDEF));
}

#[test]
fn env_mirror_routes_percent_env() {
    let mut g = glas_core::init_thread().unwrap();
    g.i64_push(8);
    g.ns_data_def("conf.env.cores").unwrap();
    g.call("%env.cores").unwrap();
    assert_eq!(g.i64_peek().unwrap(), 8);
}
