//! The non-deterministic choice scheduler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use glas_core::choice::choice;
use glas_core::errors::ErrorBits;
use glas_core::{Glas, Namespace};

fn base_env() -> Namespace {
    let mut g = Glas::new();
    g.reg_fresh("r.").unwrap();
    assert!(g.commit());
    g.namespace().clone()
}

#[test]
fn commit_ready_clone_wins() {
    let ns = base_env();
    let mut origin = Glas::with_namespace(ns.clone());
    let idx = choice(&mut origin, 4, |clone, i| {
        if i == 2 {
            clone.i64_push(77);
            clone.reg_set("r.winner-slot").unwrap();
            clone.commit();
        } else {
            // Everyone else diverges immediately.
            let _ = clone.unp();
        }
    })
    .unwrap();
    assert_eq!(idx, 2);
    // The winner stopped at the boundary; the real commit is ours.
    assert!(origin.commit());
    let mut check = Glas::with_namespace(ns);
    check.reg_get("r.winner-slot").unwrap();
    assert_eq!(check.i64_peek().unwrap(), 77);
}

#[test]
fn clean_return_wins_when_nobody_commits() {
    let ns = base_env();
    let mut origin = Glas::with_namespace(ns);
    let winners = Arc::new(AtomicUsize::new(0));
    let seen = winners.clone();
    let idx = choice(&mut origin, 3, move |clone, i| {
        seen.fetch_add(1, Ordering::SeqCst);
        if i == 1 {
            clone.i64_push(5);
        } else {
            let _ = clone.unp();
        }
    })
    .unwrap();
    assert_eq!(idx, 1);
    assert_eq!(origin.i64_peek().unwrap(), 5);
    assert!(origin.error_bits().is_empty());
}

#[test]
fn error_return_wins_only_as_last_resort() {
    let ns = base_env();
    let mut origin = Glas::with_namespace(ns);
    choice(&mut origin, 3, |clone, _| {
        let _ = clone.unp();
    })
    .unwrap();
    assert!(
        origin.error_bits().contains(ErrorBits::DATA_TYPE),
        "the transferred state carries the winner's errors"
    );
    assert!(!origin.commit());
}

#[test]
fn losers_are_cancelled_cooperatively() {
    let ns = base_env();
    let mut origin = Glas::with_namespace(ns);
    let cancelled = Arc::new(AtomicUsize::new(0));
    let counter = cancelled.clone();
    let idx = choice(&mut origin, 4, move |clone, i| {
        if i == 0 {
            clone.i64_push(1);
            clone.commit();
            return;
        }
        // Spin until cancellation surfaces through an operation.
        loop {
            if clone.data_copy(0, false).is_err() {
                counter.fetch_add(1, Ordering::SeqCst);
                return;
            }
            std::thread::yield_now();
        }
    })
    .unwrap();
    assert_eq!(idx, 0);
    // Give the cancelled clones a moment to notice and unwind.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while cancelled.load(Ordering::SeqCst) < 3 {
        assert!(std::time::Instant::now() < deadline, "clones never cancelled");
        std::thread::yield_now();
    }
}

#[test]
fn winner_state_transfer_is_isolated_from_continuation() {
    let ns = base_env();
    let mut origin = Glas::with_namespace(ns);
    choice(&mut origin, 1, |clone, _| {
        clone.i64_push(10);
        clone.commit();
        // Anything after the boundary must not influence the origin.
        clone.i64_push(99);
        let _ = clone.reg_set("r.after");
    })
    .unwrap();
    assert_eq!(origin.i64_peek().unwrap(), 10);
    assert!(origin.commit());
    origin.reg_get("r.after").unwrap();
    assert!(origin.pop().is_unit());
}

#[test]
fn choice_of_zero_clones_is_an_error() {
    let mut origin = Glas::new();
    assert!(choice(&mut origin, 0, |_, _| {}).is_err());
}
