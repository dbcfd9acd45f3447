//! Step-engine behavior: checkpoints, hooks, atomic sections, sealing
//! and fork lifecycles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use glas_core::errors::ErrorBits;
use glas_core::{Glas, Namespace};

fn base_env() -> Namespace {
    let mut g = Glas::new();
    g.reg_fresh("r.").unwrap();
    assert!(g.commit());
    g.namespace().clone()
}

#[test]
fn checkpoint_restores_stack() {
    let mut g = Glas::new();
    g.i64_push(1);
    g.checkpoint_push().unwrap();
    g.i64_push(2);
    g.i64_push(3);
    g.checkpoint_load().unwrap();
    assert_eq!(g.i64_peek().unwrap(), 1);
    assert_eq!(g.stack_depth(), 1);
    assert!(g.commit(), "pre-checkpoint state commits cleanly");
}

#[test]
fn checkpoint_save_replaces_top() {
    let mut g = Glas::new();
    g.i64_push(1);
    g.checkpoint_push().unwrap();
    g.i64_push(2);
    g.checkpoint_save().unwrap();
    g.i64_push(3);
    g.checkpoint_load().unwrap();
    assert_eq!(g.i64_peek().unwrap(), 2);
    assert_eq!(g.checkpoint_depth(), 1);
}

#[test]
fn checkpoint_save_fails_on_errored_step() {
    let mut g = Glas::new();
    g.i64_push(1);
    assert!(g.i8_peek().is_ok());
    g.push(glas_core::Value::pair(
        glas_core::Value::Leaf,
        glas_core::Value::Leaf,
    ));
    let _ = g.i64_peek(); // type error marks the step
    assert!(g.checkpoint_save().is_err());
    assert_eq!(g.checkpoint_depth(), 0, "no snapshot was recorded");
}

#[test]
fn checkpoint_rewinds_register_journal() {
    let ns = base_env();
    let mut g = Glas::with_namespace(ns.clone());
    g.i64_push(1);
    g.reg_set("r.cp").unwrap();
    g.checkpoint_push().unwrap();
    g.i64_push(2);
    g.reg_set("r.cp").unwrap();
    g.checkpoint_load().unwrap();
    assert!(g.commit());
    let mut check = Glas::with_namespace(ns);
    check.reg_get("r.cp").unwrap();
    assert_eq!(check.i64_peek().unwrap(), 1);
}

#[test]
fn on_commit_hooks_run_only_on_commit() {
    let ns = base_env();
    let fired = Arc::new(AtomicUsize::new(0));

    let mut g = Glas::with_namespace(ns.clone());
    let counter = fired.clone();
    g.on_commit(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }, None)
    .unwrap();
    g.abort();
    assert_eq!(fired.load(Ordering::SeqCst), 0, "aborted step fired a hook");

    let counter = fired.clone();
    g.on_commit(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }, None)
    .unwrap();
    assert!(g.commit());
    // The null queue drains inline before commit returns.
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn named_commit_queues_run_in_insertion_order() {
    let ns = base_env();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut g = Glas::with_namespace(ns);
    for i in 0..10 {
        let log = log.clone();
        g.on_commit(move || log.lock().unwrap().push(i), Some("r.hooks"))
            .unwrap();
    }
    assert!(g.commit());
    // Named queues drain on worker threads; wait for them.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while log.lock().unwrap().len() < 10 {
        assert!(std::time::Instant::now() < deadline, "queue never drained");
        std::thread::yield_now();
    }
    assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn on_abort_hooks_run_lifo_exactly_once() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut g = Glas::new();
    for i in 0..3 {
        let log = log.clone();
        g.on_abort(move || log.lock().unwrap().push(i)).unwrap();
    }
    g.abort();
    assert_eq!(*log.lock().unwrap(), vec![2, 1, 0]);
    g.abort();
    assert_eq!(*log.lock().unwrap(), vec![2, 1, 0], "hooks ran twice");
}

#[test]
fn checkpoint_load_runs_hooks_registered_since() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut g = Glas::new();
    let l = log.clone();
    g.on_abort(move || l.lock().unwrap().push("before")).unwrap();
    g.checkpoint_push().unwrap();
    let l = log.clone();
    g.on_abort(move || l.lock().unwrap().push("inner-1")).unwrap();
    let l = log.clone();
    g.on_abort(move || l.lock().unwrap().push("inner-2")).unwrap();
    g.checkpoint_load().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["inner-2", "inner-1"]);
    g.abort();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["inner-2", "inner-1", "before"]
    );
}

#[test]
fn errors_block_commit_and_abort_clears() {
    let mut g = Glas::new();
    g.push(glas_core::Value::Leaf);
    assert!(g.unp().is_err());
    assert!(g.error_bits().contains(ErrorBits::DATA_TYPE));
    assert!(!g.commit());
    // Commit failure behaved as abort: the register is clean again.
    assert!(g.error_bits().is_empty());
    assert!(g.commit());
}

#[test]
fn unrecoverable_survives_abort() {
    let mut g = Glas::new();
    g.raise_unrecoverable("poisoned");
    g.abort();
    assert!(g.error_bits().contains(ErrorBits::UNRECOVERABLE));
    assert!(!g.commit());
}

#[test]
fn step_timeout_marks_quota() {
    let mut g = Glas::new();
    g.step_timeout(1);
    std::thread::sleep(std::time::Duration::from_millis(2));
    g.i64_push(1);
    let _ = g.i64_peek();
    assert!(!g.commit());
    // Timeouts reset across the step boundary.
    g.i64_push(1);
    assert!(g.commit());
}

#[test]
fn sealing_hides_and_restores_data() {
    let ns = base_env();
    let mut g = Glas::with_namespace(ns);
    g.i64_push(5);
    g.seal("r.key", false).unwrap();
    let sealed = g.peek_value();
    assert!(!sealed.is_pair() && !sealed.is_unit());
    assert!(g.i64_peek().is_err(), "sealed data is not observable");
    g.abort();

    g.i64_push(5);
    g.seal("r.key", false).unwrap();
    g.unseal("r.key").unwrap();
    assert_eq!(g.i64_peek().unwrap(), 5);
    g.abort();

    g.i64_push(5);
    g.seal("r.key", false).unwrap();
    assert!(g.unseal("r.other").is_err(), "wrong key unseals nothing");
    assert!(g.error_bits().contains(ErrorBits::DATA_SEALED));
}

#[test]
fn linear_seal_blocks_copy_and_drop() {
    let ns = base_env();
    let mut g = Glas::with_namespace(ns);
    g.i64_push(5);
    g.seal("r.key", true).unwrap();
    assert!(g.data_copy(1, false).is_err());
    assert!(g.error_bits().contains(ErrorBits::LINEARITY));
    g.abort();
    g.i64_push(5);
    g.seal("r.key", true).unwrap();
    assert!(g.data_drop(1, false).is_err());
    g.abort();
    // Forced variants stay available to the host.
    g.i64_push(5);
    g.seal("r.key", true).unwrap();
    assert!(g.data_drop(1, true).is_ok());
}

#[test]
fn atomic_call_refuses_commit() {
    let mut g = Glas::new();
    g.ns_cb_def(
        "wants-commit",
        |inner| inner.commit(),
        None,
        None,
        false,
    )
    .unwrap();
    assert!(g.commit());
    assert!(g.call_atomic("wants-commit").is_err());
    assert!(g.error_bits().contains(ErrorBits::ATOMICITY));
    g.abort();
    // The same callback commits fine outside an atomic section.
    assert!(g.call("wants-commit").is_ok());
}

#[test]
fn no_atomic_callbacks_are_refused_in_atomic_context() {
    let mut g = Glas::new();
    g.ns_cb_def("inner-op", |_| true, None, None, true)
        .unwrap();
    assert!(g.commit());
    assert!(g.call("inner-op").is_ok());
    g.abort();
    assert!(g.call_atomic("inner-op").is_err());
    assert!(g.error_bits().contains(ErrorBits::ATOMICITY));
}

#[test]
fn fork_is_tentative_until_commit() {
    let ns = base_env();
    let mut origin = Glas::with_namespace(ns);
    origin.i64_push(41);
    origin.i64_push(42);
    let mut fork = origin.fork(1).unwrap();
    assert_eq!(origin.i64_peek().unwrap(), 41);
    assert!(origin.commit());
    assert_eq!(fork.i64_peek().unwrap(), 42);
    assert!(fork.commit(), "created fork commits normally");
}

#[test]
fn aborted_fork_is_uncreated() {
    let ns = base_env();
    let mut origin = Glas::with_namespace(ns);
    origin.i64_push(1);
    let mut fork = origin.fork(1).unwrap();
    origin.abort();
    assert!(!fork.commit());
    assert!(fork.error_bits().contains(ErrorBits::UNCREATED));
}

#[test]
fn bgcall_runs_before_the_step() {
    let ns = base_env();
    let mut g = Glas::with_namespace(ns.clone());
    // The bgcall sees committed register state, not this open step.
    g.i64_push(99);
    g.reg_set("r.bg").unwrap();
    let observed = g
        .bgcall(|worker| {
            worker.reg_get("r.bg").unwrap();
            let v = worker.pop();
            worker.abort();
            v
        })
        .unwrap();
    assert!(observed.is_unit());
    assert!(g.commit());
    let after = g
        .bgcall(|worker| {
            worker.reg_get("r.bg").unwrap();
            worker.i64_peek().unwrap()
        })
        .unwrap();
    assert_eq!(after, 99);
}
