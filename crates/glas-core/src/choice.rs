//! Non-deterministic choice over racing clones.
//!
//! `choice` copies a thread into up to N cooperative clones and runs a
//! callback against each on the worker pool. The first clone to reach
//! a commit boundary with a clean error register wins immediately;
//! otherwise the first clean callback return wins, and failing that
//! the first error return. Losers are cancelled cooperatively and the
//! winner's state transfers back to the origin. A racing clone never
//! installs register effects itself; the real commit happens on the
//! origin, driven by the host.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::errors::{ErrorBits, GlasError};
use crate::thread::{Glas, ThreadShared};
use crate::workers::WorkerPool;

struct Returned {
    idx: usize,
    clean: bool,
    state: Box<Glas>,
}

struct RaceInner {
    decided: Option<usize>,
    winner_state: Option<Box<Glas>>,
    returned: Vec<Returned>,
    finished: usize,
    total: usize,
    clones: Vec<Arc<ThreadShared>>,
}

/// Shared scheduler state for one `choice` invocation.
pub(crate) struct Race {
    inner: Mutex<RaceInner>,
    cond: Condvar,
}

impl Race {
    fn new(total: usize) -> Arc<Race> {
        Arc::new(Race {
            inner: Mutex::new(RaceInner {
                decided: None,
                winner_state: None,
                returned: Vec::new(),
                finished: 0,
                total,
                clones: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }

    fn register(&self, shared: Arc<ThreadShared>) {
        self.inner.lock().unwrap().clones.push(shared);
    }

    pub(crate) fn is_decided(&self) -> bool {
        self.inner.lock().unwrap().decided.is_some()
    }

    fn cancel_all(inner: &RaceInner) {
        for clone in &inner.clones {
            clone.cancel();
        }
    }

    /// A clone reached the commit boundary without errors. First one
    /// in takes the race.
    pub(crate) fn offer_boundary(&self, idx: usize, state: &Glas) {
        let mut inner = self.inner.lock().unwrap();
        if inner.decided.is_some() {
            return;
        }
        inner.decided = Some(idx);
        inner.winner_state = Some(Box::new(state.clone_for_choice()));
        Self::cancel_all(&inner);
        self.cond.notify_all();
    }

    /// A clone's callback returned (or was skipped after the race was
    /// over). Decides the race once every clone is accounted for.
    fn offer_return(&self, result: Option<Returned>) {
        let mut inner = self.inner.lock().unwrap();
        inner.finished += 1;
        if let (None, Some(r)) = (&inner.decided, result) {
            inner.returned.push(r);
        }
        if inner.decided.is_none() && inner.finished == inner.total {
            // Every clone ran to return: prefer the first clean one.
            let pick = inner
                .returned
                .iter()
                .position(|r| r.clean)
                .or(if inner.returned.is_empty() { None } else { Some(0) });
            if let Some(at) = pick {
                let winner = inner.returned.swap_remove(at);
                inner.decided = Some(winner.idx);
                inner.winner_state = Some(winner.state);
                Self::cancel_all(&inner);
            } else {
                // Nothing ever ran; decide on nobody.
                inner.decided = Some(usize::MAX);
            }
        }
        self.cond.notify_all();
    }

    fn abandon(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.decided.is_none() {
            inner.decided = Some(usize::MAX);
        }
        Self::cancel_all(&inner);
        self.cond.notify_all();
    }
}

/// Clone `origin` into up to `n` children and race them through `cb`.
/// Returns the winning clone's index after transferring its state back
/// into `origin`.
pub fn choice(
    origin: &mut Glas,
    n: usize,
    cb: impl Fn(&mut Glas, usize) + Send + Sync + 'static,
) -> Result<usize, GlasError> {
    if n == 0 {
        return Err(GlasError::error_op("choice over zero clones"));
    }
    let race = Race::new(n);
    let cb = Arc::new(cb);
    for i in 0..n {
        let race = race.clone();
        let cb = cb.clone();
        let mut clone = origin.clone_for_choice();
        clone.set_choice(race.clone(), i);
        race.register(clone.shared_handle());
        WorkerPool::global().submit(move || {
            if race.is_decided() {
                race.offer_return(None);
                return;
            }
            let mut clone = clone;
            cb(&mut clone, i);
            let clean =
                clone.error_bits().is_empty() && !clone.shared_handle().is_cancelled();
            clone.clear_choice();
            race.offer_return(Some(Returned {
                idx: i,
                clean,
                state: Box::new(clone),
            }));
        });
    }
    // Block until a winner emerges, honoring the origin's deadlines.
    let winner = loop {
        let mut inner = race.inner.lock().unwrap();
        if let Some(idx) = inner.decided {
            if let Some(state) = inner.winner_state.take() {
                break Some((idx, state));
            }
            if idx == usize::MAX {
                break None;
            }
            // Decided but the state is still being recorded; loop.
        }
        let (guard, _timeout) = race
            .cond
            .wait_timeout(inner, Duration::from_millis(10))
            .unwrap();
        drop(guard);
        if origin.deadline_exceeded() {
            race.abandon();
            let err = GlasError::quota("choice exceeded the step deadline");
            origin.note_error(&err);
            return Err(err);
        }
    };
    match winner {
        Some((idx, state)) => {
            origin.transfer_from(*state);
            Ok(idx)
        }
        None => {
            let err = GlasError::error_op("choice produced no candidate");
            origin.note_error(&err);
            Err(err)
        }
    }
}

/// Convenience: race `n` clones and report whether the winner reached
/// a clean state.
pub fn choice_clean(
    origin: &mut Glas,
    n: usize,
    cb: impl Fn(&mut Glas, usize) + Send + Sync + 'static,
) -> Result<bool, GlasError> {
    choice(origin, n, cb)?;
    Ok(!origin.error_bits().contains(ErrorBits::UNCREATED) && origin.error_bits().is_empty())
}
