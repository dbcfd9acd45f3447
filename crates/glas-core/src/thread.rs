//! The transactional step engine.
//!
//! A `Glas` handle is a remote-controlled coroutine: the host issues
//! synchronous commands against its data stack, stash, namespace and
//! registers. Work accumulates in the current step; `commit` validates
//! register accesses optimistically and installs every buffered effect,
//! `abort` rewinds to the last committed state. Checkpoints give
//! partial rollback inside a step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::errors::{ErrorBits, GlasError, WARN_TAG};
use crate::namespace::{
    eval_ast, nsval_to_def, CallbackDef, Def, Mount, Namespace, NsVal, Resolved, TlTable,
};
use crate::refct::{refct_for_bytes, Refct};
use crate::registers::{RegisterRef, StepJournal, Volume};
use crate::rope;
use crate::value::{int_peek, int_value, uint_peek, uint_value, Value};
use crate::workers::{SerialQueues, WorkerPool};

/// Process-wide runtime state shared by every thread.
pub struct Runtime {
    /// Serializes the final commit phase: validation plus apply.
    commit_lock: Mutex<()>,
    pub(crate) vfs: RwLock<Option<Arc<dyn crate::loader::LoaderHooks>>>,
}

impl Runtime {
    pub fn global() -> Arc<Runtime> {
        static RT: Lazy<Arc<Runtime>> = Lazy::new(|| {
            Arc::new(Runtime {
                commit_lock: Mutex::new(()),
                vfs: RwLock::new(None),
            })
        });
        RT.clone()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Created {
    /// A fork whose origin has not committed yet.
    Tentative,
    Created,
    /// Cancelled: the origin aborted, or a choice clone lost the race.
    Uncreated,
}

struct Life {
    created: Created,
    exited: bool,
    detached: bool,
}

/// Liveness shared between a thread, its origin, and anyone waiting to
/// join it (callback scopes, the choice scheduler).
pub(crate) struct ThreadShared {
    life: Mutex<Life>,
    cond: Condvar,
    cancel: AtomicBool,
}

impl ThreadShared {
    fn new(created: Created) -> Arc<ThreadShared> {
        Arc::new(ThreadShared {
            life: Mutex::new(Life {
                created,
                exited: false,
                detached: false,
            }),
            cond: Condvar::new(),
            cancel: AtomicBool::new(false),
        })
    }

    fn set_created(&self, created: Created) {
        let mut life = self.life.lock().unwrap();
        if life.created == Created::Tentative {
            life.created = created;
        }
        if created == Created::Uncreated {
            self.cancel.store(true, Ordering::SeqCst);
        }
        self.cond.notify_all();
    }

    fn mark_exited(&self) {
        self.life.lock().unwrap().exited = true;
        self.cond.notify_all();
    }

    fn mark_detached(&self) {
        self.life.lock().unwrap().detached = true;
        self.cond.notify_all();
    }

    pub(crate) fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        let mut life = self.life.lock().unwrap();
        life.created = Created::Uncreated;
        self.cond.notify_all();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// True once the thread no longer blocks a callback return.
    fn is_settled(&self) -> bool {
        let life = self.life.lock().unwrap();
        life.exited || life.detached || life.created == Created::Uncreated
    }
}

type CommitFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
struct CommitHook {
    queue: Option<RegisterRef>,
    op: CommitFn,
}

/// Cleanup hooks run on abort, newest first. The refcount form exists
/// so cloned steps stay balanced: cloning it takes a reference, and
/// each clone's abort releases its own.
#[derive(Clone)]
enum AbortHook {
    Fn(CommitFn),
    Decref(Refct),
}

impl AbortHook {
    fn run(self) {
        match self {
            AbortHook::Fn(f) => f(),
            AbortHook::Decref(refct) => drop(refct),
        }
    }
}

#[derive(Clone)]
struct Snapshot {
    stack: im::Vector<Value>,
    stash: im::Vector<Value>,
    ns: Namespace,
}

struct Checkpoint {
    stack: im::Vector<Value>,
    stash: im::Vector<Value>,
    ns: Namespace,
    errors: ErrorBits,
    journal: StepJournal,
    on_commit_len: usize,
    on_abort_len: usize,
    atomic_depth: usize,
}

/// A glas coroutine driven through this handle.
pub struct Glas {
    debug_name: Option<String>,
    /// Top of stack is the back of the vector.
    stack: im::Vector<Value>,
    stash: im::Vector<Value>,
    ns: Namespace,
    checkpoints: Vec<Checkpoint>,
    errors: ErrorBits,
    on_commit: Vec<CommitHook>,
    on_abort: Vec<AbortHook>,
    journal: StepJournal,
    committed: Snapshot,
    atomic_depth: usize,
    step_deadline: Option<Instant>,
    checkpoint_deadline: Option<Instant>,
    shared: Arc<ThreadShared>,
    /// Forks spawned this step: created on commit, uncreated on abort.
    pending_forks: Vec<Arc<ThreadShared>>,
    /// Forks whose settlement gates the enclosing callback's return.
    fork_watch: Vec<Arc<ThreadShared>>,
    /// Caller-attachment gates owned by this thread.
    attach_gates: Vec<Arc<AtomicBool>>,
    pending_detach: bool,
    /// Present while racing as a choice clone: the scheduler plus this
    /// clone's index.
    choice: Option<(Arc<crate::choice::Race>, usize)>,
    commit_seq: u64,
    abort_seq: u64,
    runtime: Arc<Runtime>,
}

impl Default for Glas {
    fn default() -> Self {
        Glas::new()
    }
}

impl Glas {
    pub fn new() -> Glas {
        Glas::with_namespace(Namespace::empty())
    }

    pub fn with_namespace(ns: Namespace) -> Glas {
        Glas {
            debug_name: None,
            stack: im::Vector::new(),
            stash: im::Vector::new(),
            ns: ns.clone(),
            checkpoints: Vec::new(),
            errors: ErrorBits::NONE,
            on_commit: Vec::new(),
            on_abort: Vec::new(),
            journal: StepJournal::default(),
            committed: Snapshot {
                stack: im::Vector::new(),
                stash: im::Vector::new(),
                ns,
            },
            atomic_depth: 0,
            step_deadline: None,
            checkpoint_deadline: None,
            shared: ThreadShared::new(Created::Created),
            pending_forks: Vec::new(),
            fork_watch: Vec::new(),
            attach_gates: Vec::new(),
            pending_detach: false,
            choice: None,
            commit_seq: 0,
            abort_seq: 0,
            runtime: Runtime::global(),
        }
    }

    pub fn set_debug_name(&mut self, name: &str) {
        self.debug_name = Some(name.to_string());
    }

    pub fn debug_name(&self) -> &str {
        self.debug_name.as_deref().unwrap_or("<anon>")
    }

    /// The step error register. Any non-zero mask prevents commit.
    pub fn error_bits(&self) -> ErrorBits {
        self.errors
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic_depth > 0
    }

    /// Record a failure on the step and hand the error back.
    fn fail(&mut self, err: GlasError) -> GlasError {
        self.errors.insert(err.bits());
        err
    }

    /// Raise an error the step can never recover from.
    pub fn raise_unrecoverable(&mut self, msg: &str) {
        let _ = self.fail(GlasError::unrecoverable(msg));
    }

    fn check_live(&mut self) -> Result<(), GlasError> {
        if self.shared.is_cancelled() {
            let err = GlasError::uncreated("thread was cancelled");
            self.errors.insert(err.bits());
            return Err(err);
        }
        Ok(())
    }

    fn check_deadlines(&mut self) {
        let now = Instant::now();
        if let Some(d) = self.step_deadline {
            if now >= d {
                self.errors.insert(ErrorBits::QUOTA);
            }
        }
        if let Some(d) = self.checkpoint_deadline {
            if now >= d {
                self.errors.insert(ErrorBits::QUOTA);
            }
        }
    }

    fn enter(&mut self) -> Result<(), GlasError> {
        self.check_live()?;
        self.check_deadlines();
        Ok(())
    }

    // --- data stack -----------------------------------------------------

    pub fn push(&mut self, v: Value) {
        self.stack.push_back(v);
    }

    /// Pop the top of the stack. The stack is logically infinite and
    /// zero-filled, so popping past the bottom yields unit.
    pub fn pop(&mut self) -> Value {
        self.stack.pop_back().unwrap_or(Value::Leaf)
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    fn stack_get_top(&self, i: usize) -> Value {
        // i = 0 is the top; reads below the real stack see unit.
        if i < self.stack.len() {
            self.stack[self.stack.len() - 1 - i].clone()
        } else {
            Value::Leaf
        }
    }

    /// Copy the top `n` items in place.
    pub fn data_copy(&mut self, n: usize, force_linear: bool) -> Result<(), GlasError> {
        self.enter()?;
        for i in (0..n).rev() {
            let v = self.stack_get_top(i);
            if v.is_linear() && !force_linear {
                return Err(self.fail(GlasError::linearity("copy of linear data")));
            }
            self.push(v);
        }
        Ok(())
    }

    /// Drop the top `n` items.
    pub fn data_drop(&mut self, n: usize, force_linear: bool) -> Result<(), GlasError> {
        self.enter()?;
        for i in 0..n.min(self.stack.len()) {
            let v = self.stack_get_top(i);
            if v.is_linear() && !force_linear {
                return Err(self.fail(GlasError::linearity("drop of linear data")));
            }
        }
        for _ in 0..n {
            let _ = self.pop();
        }
        Ok(())
    }

    /// Visualized data shuffling: `"abc-abcabc"` copies three items,
    /// `"ab-ba"` swaps. Left of `-` names consumed items (rightmost on
    /// top), right of `-` names what gets pushed back. A malformed
    /// pattern is a client error; copying or dropping linear data
    /// fails with a linearity error unless forced.
    pub fn data_move(&mut self, pattern: &str, force_linear: bool) -> Result<(), GlasError> {
        self.enter()?;
        let (lhs, rhs) = pattern
            .split_once('-')
            .ok_or_else(|| GlasError::client(format!("move pattern lacks '-': {}", pattern)))
            .map_err(|e| self.fail(e))?;
        let mut seen = [false; 26];
        for c in lhs.chars() {
            if !c.is_ascii_lowercase() {
                return Err(self.fail(GlasError::client(format!(
                    "move pattern variable out of range: {}",
                    c
                ))));
            }
            let slot = (c as u8 - b'a') as usize;
            if seen[slot] {
                return Err(self.fail(GlasError::client(format!(
                    "move pattern reuses consumed name: {}",
                    c
                ))));
            }
            seen[slot] = true;
        }
        for c in rhs.chars() {
            if !c.is_ascii_lowercase() || !seen[(c as u8 - b'a') as usize] {
                return Err(self.fail(GlasError::client(format!(
                    "move pattern produces unbound name: {}",
                    c
                ))));
            }
        }
        // Bind from the top down, then check the linear discipline.
        let mut bound: [Option<Value>; 26] = Default::default();
        let mut order: Vec<usize> = Vec::with_capacity(lhs.len());
        for c in lhs.chars().rev() {
            let slot = (c as u8 - b'a') as usize;
            bound[slot] = Some(self.pop());
            order.push(slot);
        }
        if !force_linear {
            for (slot, v) in bound.iter().enumerate() {
                if let Some(v) = v {
                    if v.is_linear() {
                        let uses = rhs.bytes().filter(|b| (*b - b'a') as usize == slot).count();
                        if uses != 1 {
                            // Undo the pops before failing.
                            for slot in order.iter().rev() {
                                let v = bound[*slot].clone().expect("bound variable");
                                self.push(v);
                            }
                            return Err(self.fail(GlasError::linearity(format!(
                                "linear data used {} times in move",
                                uses
                            ))));
                        }
                    }
                }
            }
        }
        for c in rhs.chars() {
            let slot = (c as u8 - b'a') as usize;
            let v = bound[slot].clone().expect("checked binding");
            self.push(v);
        }
        Ok(())
    }

    /// Transfer between stack and stash: positive amounts move to the
    /// stash, negative amounts move back, preserving order.
    pub fn data_stash(&mut self, amt: i64) -> Result<(), GlasError> {
        self.enter()?;
        if amt >= 0 {
            let n = amt as usize;
            if n > self.stack.len() {
                return Err(self.fail(GlasError::underflow("stash transfer exceeds stack")));
            }
            let at = self.stack.len() - n;
            let moved = self.stack.split_off(at);
            for v in moved {
                self.stash.push_back(v);
            }
        } else {
            let n = (-amt) as usize;
            if n > self.stash.len() {
                return Err(self.fail(GlasError::underflow("stash transfer exceeds stash")));
            }
            let at = self.stash.len() - n;
            let moved = self.stash.split_off(at);
            for v in moved {
                self.stack.push_back(v);
            }
        }
        Ok(())
    }

    /// Move `amt` items from this stack to another thread's stack (or
    /// back, when negative), preserving order.
    pub fn data_xchg(&mut self, amt: i64, other: &mut Glas) -> Result<(), GlasError> {
        self.enter()?;
        other.enter()?;
        let (src, dst, n) = if amt >= 0 {
            (&mut self.stack, &mut other.stack, amt as usize)
        } else {
            (&mut other.stack, &mut self.stack, (-amt) as usize)
        };
        if n > src.len() {
            let err = GlasError::underflow("exchange exceeds stack");
            self.errors.insert(err.bits());
            return Err(err);
        }
        let at = src.len() - n;
        let moved = src.split_off(at);
        for v in moved {
            dst.push_back(v);
        }
        Ok(())
    }

    // --- constructors and accessors on the stack ------------------------

    /// Pair the two top items: `a b -- (a,b)`.
    pub fn mkp(&mut self) -> Result<(), GlasError> {
        self.enter()?;
        let b = self.pop();
        let a = self.pop();
        self.push(Value::pair(a, b));
        Ok(())
    }

    pub fn mkl(&mut self) -> Result<(), GlasError> {
        self.enter()?;
        let v = self.pop();
        self.push(Value::inl(v));
        Ok(())
    }

    pub fn mkr(&mut self) -> Result<(), GlasError> {
        self.enter()?;
        let v = self.pop();
        self.push(Value::inr(v));
        Ok(())
    }

    /// Split a pair: `(a,b) -- a b`. Fails on other shapes.
    pub fn unp(&mut self) -> Result<(), GlasError> {
        self.enter()?;
        let v = self.pop();
        match v.shape() {
            crate::value::Shape::Branch(a, b) => {
                self.push(a);
                self.push(b);
                Ok(())
            }
            crate::value::Shape::Sealed(_) => {
                self.push(v);
                Err(self.fail(GlasError::sealed("unpair of sealed data")))
            }
            _ => {
                self.push(v);
                Err(self.fail(GlasError::data_type("unpair of a non-pair")))
            }
        }
    }

    pub fn unl(&mut self) -> Result<(), GlasError> {
        self.un_sum(false)
    }

    pub fn unr(&mut self) -> Result<(), GlasError> {
        self.un_sum(true)
    }

    fn un_sum(&mut self, want: bool) -> Result<(), GlasError> {
        self.enter()?;
        let v = self.pop();
        match v.shape() {
            crate::value::Shape::Stem(bits, tail) if bits.bit(0) == want => {
                self.push(Value::stem(bits.drop_front(1), tail));
                Ok(())
            }
            crate::value::Shape::Sealed(_) => {
                self.push(v);
                Err(self.fail(GlasError::sealed("unsum of sealed data")))
            }
            _ => {
                self.push(v);
                Err(self.fail(GlasError::data_type("sum tag mismatch")))
            }
        }
    }

    /// A copy of the top of stack for host-side inspection. Linear
    /// data may be observed this way but not duplicated onto the
    /// stack.
    pub fn peek_value(&mut self) -> Value {
        self.stack_get_top(0)
    }

    // --- binaries and integers ------------------------------------------

    pub fn binary_push(&mut self, bytes: &[u8]) {
        self.push(rope::from_bytes(bytes));
    }

    /// Push host memory as a binary without copying. The handle must
    /// arrive pre-incremented; the runtime releases it when the value
    /// is garbage.
    pub fn binary_push_pinned(&mut self, ptr: *const u8, len: usize, pin: Refct) {
        self.push(Value::binary_pinned(ptr, len, pin));
    }

    /// Number of bytes the top-of-stack binary holds, without copying.
    pub fn binary_peek_len(&mut self) -> usize {
        let (bytes, _) = rope::binary_prefix(&self.stack_get_top(0));
        bytes.len()
    }

    /// Copy bytes from the top-of-stack binary into `buf`. Returns the
    /// number copied. Does not modify the stack.
    pub fn binary_peek(&mut self, buf: &mut [u8]) -> usize {
        let (bytes, _) = rope::binary_prefix(&self.stack_get_top(0));
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        n
    }

    /// Copy out the whole binary. The flag is true iff the entire list
    /// was a valid binary; partially valid data comes back truncated
    /// with `false` rather than raising an error.
    pub fn binary_peek_all(&mut self) -> (Vec<u8>, bool) {
        rope::binary_prefix(&self.stack_get_top(0))
    }

    /// Zero-copy peek. May flatten a rope once; the returned handle
    /// owns one reference the caller must drop, and the bytes must not
    /// be mutated.
    pub fn binary_peek_pinned(&mut self) -> BinaryPeek {
        let top = self.stack_get_top(0);
        match rope::flatten_binary(&top) {
            Some(flat) => {
                if let Value::Binary(node) = &flat {
                    let bytes = node.bytes();
                    let (ptr, len) = (bytes.as_ptr(), bytes.len());
                    let handle = match &node.data {
                        crate::value::BinData::Pinned { pin, .. } => pin.as_ref().export(),
                        crate::value::BinData::Owned(data) => refct_for_bytes(data.clone()),
                    };
                    // Keep the flattened value alive through the handle
                    // by pushing nothing; `handle` pins the buffer.
                    BinaryPeek {
                        handle,
                        ptr,
                        len,
                        complete: true,
                    }
                } else {
                    // Empty binary.
                    BinaryPeek {
                        handle: Refct::unmanaged(std::ptr::null_mut()),
                        ptr: std::ptr::null(),
                        len: 0,
                        complete: true,
                    }
                }
            }
            None => {
                let (bytes, complete) = rope::binary_prefix(&top);
                debug_assert!(!complete);
                let shared: Arc<[u8]> = bytes.into();
                let ptr = shared.as_ptr();
                let len = shared.len();
                BinaryPeek {
                    handle: refct_for_bytes(shared),
                    ptr,
                    len,
                    complete: false,
                }
            }
        }
    }

    pub fn i64_push(&mut self, n: i64) {
        self.push(int_value(n));
    }

    pub fn i32_push(&mut self, n: i32) {
        self.i64_push(n as i64);
    }

    pub fn i16_push(&mut self, n: i16) {
        self.i64_push(n as i64);
    }

    pub fn i8_push(&mut self, n: i8) {
        self.i64_push(n as i64);
    }

    pub fn u64_push(&mut self, n: u64) {
        self.push(uint_value(n));
    }

    pub fn u32_push(&mut self, n: u32) {
        self.u64_push(n as u64);
    }

    pub fn u16_push(&mut self, n: u16) {
        self.u64_push(n as u64);
    }

    pub fn u8_push(&mut self, n: u8) {
        self.u64_push(n as u64);
    }

    pub fn i64_peek(&mut self) -> Result<i64, GlasError> {
        self.enter()?;
        int_peek(&self.stack_get_top(0)).map_err(|e| self.fail(e))
    }

    pub fn i32_peek(&mut self) -> Result<i32, GlasError> {
        let n = self.i64_peek()?;
        i32::try_from(n)
            .map_err(|_| self.fail(GlasError::data_type("integer out of range for i32")))
    }

    pub fn i16_peek(&mut self) -> Result<i16, GlasError> {
        let n = self.i64_peek()?;
        i16::try_from(n)
            .map_err(|_| self.fail(GlasError::data_type("integer out of range for i16")))
    }

    pub fn i8_peek(&mut self) -> Result<i8, GlasError> {
        let n = self.i64_peek()?;
        i8::try_from(n).map_err(|_| self.fail(GlasError::data_type("integer out of range for i8")))
    }

    pub fn u64_peek(&mut self) -> Result<u64, GlasError> {
        self.enter()?;
        uint_peek(&self.stack_get_top(0)).map_err(|e| self.fail(e))
    }

    pub fn u32_peek(&mut self) -> Result<u32, GlasError> {
        let n = self.u64_peek()?;
        u32::try_from(n)
            .map_err(|_| self.fail(GlasError::data_type("integer out of range for u32")))
    }

    pub fn u16_peek(&mut self) -> Result<u16, GlasError> {
        let n = self.u64_peek()?;
        u16::try_from(n)
            .map_err(|_| self.fail(GlasError::data_type("integer out of range for u16")))
    }

    pub fn u8_peek(&mut self) -> Result<u8, GlasError> {
        let n = self.u64_peek()?;
        u8::try_from(n).map_err(|_| self.fail(GlasError::data_type("integer out of range for u8")))
    }

    /// Push a host pointer as an opaque value.
    pub fn ptr_push(&mut self, pin: Refct) {
        self.push(Value::foreign(pin));
    }

    /// Peek the top of stack as a foreign pointer handle.
    pub fn ptr_peek(&mut self) -> Result<Refct, GlasError> {
        self.enter()?;
        match &self.stack_get_top(0) {
            Value::Foreign(node) => Ok(node.pin.export()),
            _ => Err(self.fail(GlasError::data_type("expected a foreign pointer"))),
        }
    }

    // --- sealing --------------------------------------------------------

    fn resolve_register(&mut self, name: &str) -> Result<RegisterRef, GlasError> {
        match self.ns.resolve(name) {
            Ok(Resolved::Register(reg)) => Ok(reg),
            Ok(Resolved::Def(_)) => Err(self.fail(GlasError::data_type(format!(
                "{} names a definition, not a register",
                name
            )))),
            Ok(Resolved::Undefined) => {
                Err(self.fail(GlasError::undefined(name.to_string())))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Seal the top of stack under a register key.
    pub fn seal(&mut self, key_name: &str, linear: bool) -> Result<(), GlasError> {
        self.enter()?;
        let key = self.resolve_register(key_name)?;
        let v = self.pop();
        self.push(Value::seal(key.seal_ref(), v, linear));
        Ok(())
    }

    /// Unseal the top of stack; the key register must match.
    pub fn unseal(&mut self, key_name: &str) -> Result<(), GlasError> {
        self.enter()?;
        let key = self.resolve_register(key_name)?;
        let v = self.pop();
        match v.unseal(&key.seal_ref()) {
            Ok(data) => {
                self.push(data);
                Ok(())
            }
            Err(e) => {
                self.push(v);
                Err(self.fail(e))
            }
        }
    }

    // --- namespace ------------------------------------------------------

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// Swap in a rebuilt namespace; part of the uncommitted step.
    pub fn replace_namespace(&mut self, ns: Namespace) {
        self.ns = ns;
    }

    /// Bind the (non-linear) top of stack as a data definition.
    pub fn ns_data_def(&mut self, name: &str) -> Result<(), GlasError> {
        self.enter()?;
        let v = self.pop();
        if v.is_linear() {
            self.push(v);
            return Err(self.fail(GlasError::linearity("data definition of linear data")));
        }
        match self.ns.define(name, Def::Data(v.clone())) {
            Ok(ns) => {
                self.ns = ns;
                Ok(())
            }
            Err(e) => {
                self.push(v);
                Err(self.fail(e))
            }
        }
    }

    pub fn ns_hide_def(&mut self, name: &str) -> Result<(), GlasError> {
        self.enter()?;
        self.ns = self.ns.hide_name(name);
        Ok(())
    }

    pub fn ns_hide_prefix(&mut self, prefix: &str) -> Result<(), GlasError> {
        self.enter()?;
        self.ns = self.ns.hide_prefix(prefix);
        Ok(())
    }

    /// Compose a translation atop the current namespace.
    pub fn ns_tl_apply(&mut self, table: TlTable) -> Result<(), GlasError> {
        self.enter()?;
        self.ns = self.ns.apply_tl(Arc::new(table));
        Ok(())
    }

    fn eval_env(&mut self, tl: Option<TlTable>) -> Namespace {
        match tl {
            Some(table) => self.ns.apply_tl(Arc::new(table)),
            None => self.ns.clone(),
        }
    }

    /// Pop a namespace program and bind its lazy evaluation to a name.
    pub fn ns_eval_def(&mut self, name: &str, tl: Option<TlTable>) -> Result<(), GlasError> {
        self.enter()?;
        let ast = self.pop();
        if ast.is_linear() {
            self.push(ast);
            return Err(self.fail(GlasError::linearity("namespace program must not be linear")));
        }
        let env = self.eval_env(tl);
        let def = Def::Lazy(crate::namespace::NsThunk::eval(ast, env));
        match self.ns.define(name, def) {
            Ok(ns) => {
                self.ns = ns;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Pop an environment-producing program and mount its members
    /// below a prefix, shadowing whatever the prefix reached before.
    pub fn ns_eval_prefix(&mut self, prefix: &str, tl: Option<TlTable>) -> Result<(), GlasError> {
        self.enter()?;
        let ast = self.pop();
        let env = self.eval_env(tl);
        let thunk = crate::namespace::NsThunk::eval(ast, env);
        self.ns = self.ns.mount(prefix, Mount::Lazy(thunk));
        Ok(())
    }

    /// Pop an environment-transformer program and rebind the prefix to
    /// its output applied to the current view of that prefix.
    pub fn ns_eval_apply(&mut self, prefix: &str, tl: Option<TlTable>) -> Result<(), GlasError> {
        self.enter()?;
        let ast = self.pop();
        let env = self.eval_env(tl);
        let input = self.ns.restrict(prefix);
        let result = eval_ast(&ast, &env).and_then(|v| match v {
            NsVal::Fun(f) => f.call(&NsVal::Env(input)),
            _ => Err(GlasError::error_op(
                "namespace apply expects an environment transformer",
            )),
        });
        match result {
            Ok(NsVal::Env(out)) => {
                self.ns = self.ns.mount(prefix, Mount::Ns(out));
                Ok(())
            }
            Ok(_) => Err(self.fail(GlasError::error_op(
                "environment transformer did not return an environment",
            ))),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Bind a callback definition. At each call the callback sees the
    /// host namespace closed over here (under `host_tl`) plus the
    /// caller's namespace at `caller_prefix`.
    pub fn ns_cb_def(
        &mut self,
        name: &str,
        run: impl Fn(&mut Glas) -> bool + Send + Sync + 'static,
        caller_prefix: Option<&str>,
        host_tl: Option<TlTable>,
        no_atomic: bool,
    ) -> Result<(), GlasError> {
        self.enter()?;
        let host_ns = self.eval_env(host_tl);
        let def = Def::Callback(Arc::new(CallbackDef {
            run: Box::new(run),
            host_ns,
            caller_prefix: caller_prefix.map(Arc::from),
            no_atomic,
        }));
        match self.ns.define(name, def) {
            Ok(ns) => {
                self.ns = ns;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Mount a fresh register volume below a prefix.
    pub fn reg_fresh(&mut self, prefix: &str) -> Result<(), GlasError> {
        self.enter()?;
        self.ns = self.ns.mount(prefix, Mount::Volume(Volume::fresh()));
        Ok(())
    }

    /// Mount a persistence-checked register volume below a prefix.
    pub fn reg_fresh_persistent(&mut self, prefix: &str) -> Result<(), GlasError> {
        self.enter()?;
        self.ns = self
            .ns
            .mount(prefix, Mount::Volume(Volume::fresh_persistent()));
        Ok(())
    }

    /// Mount the process-global register volume below a prefix.
    pub fn reg_global(&mut self, prefix: &str) -> Result<(), GlasError> {
        self.enter()?;
        self.ns = self.ns.mount(prefix, Mount::Volume(Volume::global()));
        Ok(())
    }

    /// Mount the associative volume of an ordered register pair.
    pub fn reg_assoc(
        &mut self,
        prefix: &str,
        lhs_name: &str,
        rhs_name: &str,
    ) -> Result<(), GlasError> {
        self.enter()?;
        let lhs = self.resolve_register(lhs_name)?;
        let rhs = self.resolve_register(rhs_name)?;
        self.ns = self
            .ns
            .mount(prefix, Mount::Volume(Volume::assoc(&lhs, &rhs)));
        Ok(())
    }

    /// Whether a name is defined. May force lazy namespace loading;
    /// register names always count as defined.
    pub fn name_defined(&mut self, name: &str) -> bool {
        self.ns.defined(name)
    }

    pub fn prefix_inuse(&mut self, prefix: &str) -> bool {
        self.ns.prefix_inuse(prefix)
    }

    /// Ask the background workers to warm a definition.
    pub fn prep(&mut self, name: &str) {
        self.ns.prepare(name);
    }

    // --- registers ------------------------------------------------------

    /// Read a register onto the stack.
    pub fn reg_get(&mut self, name: &str) -> Result<(), GlasError> {
        self.enter()?;
        let reg = self.resolve_register(name)?;
        let v = self.journal.read(&reg).map_err(|e| self.fail(e))?;
        self.push(v);
        Ok(())
    }

    /// Pop the stack into a register.
    pub fn reg_set(&mut self, name: &str) -> Result<(), GlasError> {
        self.enter()?;
        let reg = self.resolve_register(name)?;
        let v = self.pop();
        match self.journal.write(&reg, v.clone()) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.push(v);
                Err(self.fail(e))
            }
        }
    }

    /// Swap the top of stack with a register's content.
    pub fn reg_rw(&mut self, name: &str) -> Result<(), GlasError> {
        self.enter()?;
        let reg = self.resolve_register(name)?;
        let v = self.pop();
        match self.journal.swap(&reg, v.clone()) {
            Ok(old) => {
                self.push(old);
                Ok(())
            }
            Err(e) => {
                self.push(v);
                Err(self.fail(e))
            }
        }
    }

    /// Remove `n` items from a queue head and push them as a list.
    pub fn queue_read(&mut self, n: u64, name: &str) -> Result<(), GlasError> {
        self.enter()?;
        let reg = self.resolve_register(name)?;
        let items = self.journal.queue_read(&reg, n).map_err(|e| self.fail(e))?;
        self.push(rope::from_values(items));
        Ok(())
    }

    /// Pop a list and push it back onto the queue head.
    pub fn queue_unread(&mut self, name: &str) -> Result<(), GlasError> {
        self.enter()?;
        let reg = self.resolve_register(name)?;
        let v = self.pop();
        if !v.is_list() {
            self.push(v);
            return Err(self.fail(GlasError::data_type("queue unread expects a list")));
        }
        let items: Vec<Value> = rope::iter(&v).collect();
        self.journal.queue_unread(&reg, items);
        Ok(())
    }

    /// Pop a list and append its items to the queue tail.
    pub fn queue_write(&mut self, name: &str) -> Result<(), GlasError> {
        self.enter()?;
        let reg = self.resolve_register(name)?;
        let v = self.pop();
        if !v.is_list() {
            self.push(v);
            return Err(self.fail(GlasError::data_type("queue write expects a list")));
        }
        let items: Vec<Value> = rope::iter(&v).collect();
        self.journal.queue_write(&reg, items);
        Ok(())
    }

    /// Remove a nondeterministically chosen item from a bag.
    pub fn bag_read(&mut self, name: &str) -> Result<(), GlasError> {
        self.enter()?;
        let reg = self.resolve_register(name)?;
        let v = self.journal.bag_read(&reg).map_err(|e| self.fail(e))?;
        self.push(v);
        Ok(())
    }

    /// Pop one item into a bag.
    pub fn bag_write(&mut self, name: &str) -> Result<(), GlasError> {
        self.enter()?;
        let reg = self.resolve_register(name)?;
        let v = self.pop();
        self.journal.bag_write(&reg, v);
        Ok(())
    }

    // --- calls ----------------------------------------------------------

    pub fn call(&mut self, name: &str) -> Result<(), GlasError> {
        self.call_with(name, None, false)
    }

    pub fn call_tl(&mut self, name: &str, tl: TlTable) -> Result<(), GlasError> {
        self.call_with(name, Some(tl), false)
    }

    /// Call with commits forbidden for the duration.
    pub fn call_atomic(&mut self, name: &str) -> Result<(), GlasError> {
        self.call_with(name, None, true)
    }

    fn call_with(
        &mut self,
        name: &str,
        tl: Option<TlTable>,
        atomic: bool,
    ) -> Result<(), GlasError> {
        self.enter()?;
        let resolved = match self.ns.resolve(name) {
            Ok(r) => r,
            Err(e) => return Err(self.fail(e)),
        };
        let def = match resolved {
            Resolved::Def(def) => def,
            Resolved::Register(_) => {
                return Err(self.fail(GlasError::data_type(format!(
                    "{} names a register, not a program",
                    name
                ))))
            }
            Resolved::Undefined => {
                return Err(self.fail(GlasError::undefined(name.to_string())))
            }
        };
        if atomic {
            self.atomic_depth += 1;
        }
        let result = self.run_def(&def, &tl);
        if atomic {
            self.atomic_depth -= 1;
        }
        result
    }

    fn run_def(&mut self, def: &Def, tl: &Option<TlTable>) -> Result<(), GlasError> {
        match def {
            Def::Data(v) => {
                self.push(v.clone());
                Ok(())
            }
            Def::Native(prog) => (prog.run)(self).map_err(|e| self.fail(e)),
            Def::Lazy(thunk) => {
                let forced = thunk.force().map_err(|e| self.fail(e))?;
                let inner = nsval_to_def(&forced).map_err(|e| self.fail(e))?;
                self.run_def(&inner, tl)
            }
            Def::Callback(cb) => self.run_callback(cb.clone(), tl),
        }
    }

    fn run_callback(&mut self, cb: Arc<CallbackDef>, tl: &Option<TlTable>) -> Result<(), GlasError> {
        if cb.no_atomic && self.is_atomic() {
            return Err(self.fail(GlasError::atomicity(
                "callback refuses to run in an atomic section",
            )));
        }
        // The callback sees its host namespace plus the caller's
        // namespace attached below the requested prefix. The caller's
        // view (subject to the call translation) stays live until the
        // callback commits a detach.
        let mut cb_ns = cb.host_ns.clone();
        let gate = Arc::new(AtomicBool::new(true));
        if let Some(prefix) = &cb.caller_prefix {
            let caller_view = match tl {
                Some(table) => self.ns.apply_tl(Arc::new(table.clone())),
                None => self.ns.clone(),
            };
            cb_ns = cb_ns.mount(
                prefix,
                Mount::Caller {
                    ns: caller_view,
                    attached: gate.clone(),
                },
            );
        }
        let saved_ns = std::mem::replace(&mut self.ns, cb_ns);
        let saved_pending_detach = self.pending_detach;
        let saved_commit_seq = self.commit_seq;
        let saved_abort_seq = self.abort_seq;
        self.pending_detach = false;
        self.attach_gates.push(gate);
        let watch_mark = self.fork_watch.len();
        let ok = (cb.run)(self);
        // The call does not return until every fork the callback
        // spawned has exited or committed a detach.
        let stragglers: Vec<Arc<ThreadShared>> = self.fork_watch.split_off(watch_mark);
        for fork in &stragglers {
            self.wait_settled(fork);
        }
        self.attach_gates.pop();
        // Reconcile the namespace swap with any step boundaries the
        // callback crossed: a commit inside the callback committed the
        // caller's surrounding namespace too; an abort (with no later
        // commit) rewound the caller to its committed view.
        if self.commit_seq != saved_commit_seq {
            self.ns = saved_ns;
            self.committed.ns = self.ns.clone();
        } else if self.abort_seq != saved_abort_seq {
            self.ns = self.committed.ns.clone();
        } else {
            self.ns = saved_ns;
        }
        // An uncommitted detach dies with the callback scope.
        self.pending_detach = saved_pending_detach;
        if ok {
            Ok(())
        } else {
            Err(self.fail(GlasError::error_op("callback reported failure")))
        }
    }

    fn wait_settled(&mut self, shared: &Arc<ThreadShared>) {
        let mut life = shared.life.lock().unwrap();
        loop {
            if life.exited || life.detached || life.created == Created::Uncreated {
                return;
            }
            let (next, timeout) = shared
                .cond
                .wait_timeout(life, Duration::from_millis(20))
                .unwrap();
            life = next;
            if timeout.timed_out() {
                drop(life);
                self.check_deadlines();
                if self.shared.is_cancelled() {
                    return;
                }
                life = shared.life.lock().unwrap();
            }
        }
    }

    // --- forks and attachment -------------------------------------------

    /// Fork: the child shares this thread's namespace (copy-on-write)
    /// and takes the top `stack_transfer` items. It stays tentative
    /// until this thread commits; if this thread aborts instead, the
    /// fork is marked uncreated and never runs.
    pub fn fork(&mut self, stack_transfer: usize) -> Result<Glas, GlasError> {
        self.enter()?;
        if stack_transfer > self.stack.len() {
            return Err(self.fail(GlasError::underflow("fork transfer exceeds stack")));
        }
        let at = self.stack.len() - stack_transfer;
        let moved = self.stack.split_off(at);
        let mut child = Glas::with_namespace(self.ns.clone());
        child.stack = moved.clone();
        child.committed = Snapshot {
            stack: moved,
            stash: im::Vector::new(),
            ns: self.ns.clone(),
        };
        child.shared = ThreadShared::new(Created::Tentative);
        // Forks inherit the attachment gates of their origin.
        child.attach_gates = self.attach_gates.clone();
        self.pending_forks.push(child.shared.clone());
        self.fork_watch.push(child.shared.clone());
        Ok(child)
    }

    /// Fork already detached from any caller attachment, for use in
    /// atomic sections where committing a detach is impossible.
    pub fn fork_detached(&mut self, stack_transfer: usize) -> Result<Glas, GlasError> {
        let mut child = self.fork(stack_transfer)?;
        child.attach_gates.clear();
        child.shared.mark_detached();
        Ok(child)
    }

    /// Schedule a detach from the caller's namespace. Takes effect at
    /// commit; afterwards the caller's names resolve as undefined.
    pub fn detach(&mut self) -> Result<(), GlasError> {
        self.enter()?;
        self.pending_detach = true;
        Ok(())
    }

    /// Exit the thread. Warns about orphaned linear data.
    pub fn exit(self) {
        drop(self);
    }

    fn warn_linear_orphans(&self) {
        let orphaned = self
            .stack
            .iter()
            .chain(self.stash.iter())
            .filter(|v| v.is_linear())
            .count();
        if orphaned > 0 {
            eprintln!(
                "{} thread {} exits holding {} linear value(s)",
                WARN_TAG,
                self.debug_name(),
                orphaned
            );
        }
    }

    // --- step engine ----------------------------------------------------

    /// Enqueue an after-commit side effect. Hooks on the null queue run
    /// inline before `commit` returns; named queues drain on worker
    /// threads in insertion order, serialized per queue register.
    pub fn on_commit(
        &mut self,
        op: impl Fn() + Send + Sync + 'static,
        queue: Option<&str>,
    ) -> Result<(), GlasError> {
        self.enter()?;
        let queue = match queue {
            Some(name) => Some(self.resolve_register(name)?),
            None => None,
        };
        self.on_commit.push(CommitHook {
            queue,
            op: Arc::new(op),
        });
        Ok(())
    }

    /// Register cleanup to run if the step aborts. Hooks run newest
    /// first. A cloned step (choice) clones its hooks; prefer
    /// `on_abort_decref` for reference counts, which stays balanced
    /// under cloning.
    pub fn on_abort(&mut self, op: impl Fn() + Send + Sync + 'static) -> Result<(), GlasError> {
        self.enter()?;
        self.on_abort.push(AbortHook::Fn(Arc::new(op)));
        Ok(())
    }

    /// Release one reference if the step aborts.
    pub fn on_abort_decref(&mut self, refct: Refct) -> Result<(), GlasError> {
        self.enter()?;
        self.on_abort.push(AbortHook::Decref(refct));
        Ok(())
    }

    /// Abort the step after `micros` microseconds; zero cancels.
    pub fn step_timeout(&mut self, micros: u64) {
        self.step_deadline = if micros == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_micros(micros))
        };
    }

    /// Fail the current checkpoint span after `micros` microseconds;
    /// zero cancels. Resets on checkpoint advance.
    pub fn checkpoint_timeout(&mut self, micros: u64) {
        self.checkpoint_deadline = if micros == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_micros(micros))
        };
    }

    fn make_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            stack: self.stack.clone(),
            stash: self.stash.clone(),
            ns: self.ns.clone(),
            errors: self.errors,
            journal: self.journal.clone(),
            on_commit_len: self.on_commit.len(),
            on_abort_len: self.on_abort.len(),
            atomic_depth: self.atomic_depth,
        }
    }

    fn checkpoint_guard(&mut self) -> Result<(), GlasError> {
        self.enter()?;
        if !self.errors.is_empty() {
            return Err(GlasError::error_op(format!(
                "cannot snapshot a failed step ({})",
                self.errors
            )));
        }
        Ok(())
    }

    /// Snapshot the step state, replacing the top checkpoint. Fails
    /// (recording nothing) when the step already carries errors.
    pub fn checkpoint_save(&mut self) -> Result<(), GlasError> {
        self.checkpoint_guard()?;
        let cp = self.make_checkpoint();
        match self.checkpoints.last_mut() {
            Some(top) => *top = cp,
            None => self.checkpoints.push(cp),
        }
        self.checkpoint_deadline = None;
        Ok(())
    }

    /// Snapshot the step state onto the checkpoint stack.
    pub fn checkpoint_push(&mut self) -> Result<(), GlasError> {
        self.checkpoint_guard()?;
        let cp = self.make_checkpoint();
        self.checkpoints.push(cp);
        self.checkpoint_deadline = None;
        Ok(())
    }

    /// Discard the top checkpoint.
    pub fn checkpoint_drop(&mut self) -> Result<(), GlasError> {
        self.enter()?;
        if self.checkpoints.pop().is_none() {
            return Err(self.fail(GlasError::underflow("no checkpoint to drop")));
        }
        self.checkpoint_deadline = None;
        Ok(())
    }

    /// Restore the top checkpoint, running the abort hooks registered
    /// since it, newest first. The checkpoint stays available.
    pub fn checkpoint_load(&mut self) -> Result<(), GlasError> {
        self.check_live()?;
        if self.checkpoints.is_empty() {
            return Err(self.fail(GlasError::underflow("no checkpoint to load")));
        }
        let cp = self.checkpoints.last().expect("non-empty checkpoint stack");
        let hooks: Vec<AbortHook> = self.on_abort.split_off(cp.on_abort_len);
        for hook in hooks.into_iter().rev() {
            hook.run();
        }
        self.on_commit.truncate(cp.on_commit_len);
        self.journal.release_claims_since(&cp.journal);
        self.stack = cp.stack.clone();
        self.stash = cp.stash.clone();
        self.ns = cp.ns.clone();
        self.errors = cp.errors;
        self.journal = cp.journal.clone();
        self.atomic_depth = cp.atomic_depth;
        self.checkpoint_deadline = None;
        Ok(())
    }

    pub fn checkpoint_depth(&self) -> usize {
        self.checkpoints.len()
    }

    /// Wait for a tentative fork's origin to decide its fate.
    fn await_creation(&mut self) {
        loop {
            {
                let life = self.shared.life.lock().unwrap();
                if life.created != Created::Tentative {
                    return;
                }
            }
            self.check_deadlines();
            if self.errors.contains(ErrorBits::QUOTA) || self.shared.is_cancelled() {
                return;
            }
            let life = self.shared.life.lock().unwrap();
            let _ = self
                .shared
                .cond
                .wait_timeout(life, Duration::from_millis(10))
                .unwrap();
        }
    }

    /// Try to commit the step. On success the state becomes the new
    /// rollback point, register effects install, and on-commit hooks
    /// run (the null queue inline). On failure the step aborts.
    pub fn commit(&mut self) -> bool {
        self.check_deadlines();
        self.await_creation();
        if self.shared.is_cancelled() {
            self.errors.insert(ErrorBits::UNCREATED);
        }
        if self.atomic_depth > 0 {
            // Refuse rather than abort: the atomic region stays open
            // and the caller decides how to recover.
            self.errors.insert(ErrorBits::ATOMICITY);
            return false;
        }
        // A racing clone never installs effects itself. Reaching the
        // boundary clean offers this state to the choice scheduler;
        // the real commit happens on the origin after transfer.
        if let Some((race, idx)) = self.choice.clone() {
            if self.errors.is_empty() {
                race.offer_boundary(idx, self);
                self.shared.cancel();
                self.errors.insert(ErrorBits::UNCREATED);
            }
            self.abort();
            return false;
        }
        if !self.errors.is_empty() {
            self.abort();
            return false;
        }
        {
            let runtime = self.runtime.clone();
            let _guard = runtime.commit_lock.lock().unwrap();
            if let Err(err) = self.journal.validate() {
                self.errors.insert(err.bits());
            } else {
                self.journal.apply();
            }
        }
        if !self.errors.is_empty() {
            self.abort();
            return false;
        }
        // Fork creation, detach, and hook dispatch happen after the
        // register state is safely installed.
        for fork in self.pending_forks.drain(..) {
            fork.set_created(Created::Created);
        }
        self.fork_watch.retain(|s| !s.is_settled());
        if self.pending_detach {
            for gate in &self.attach_gates {
                gate.store(false, Ordering::SeqCst);
            }
            self.pending_detach = false;
            self.shared.mark_detached();
        }
        self.committed = Snapshot {
            stack: self.stack.clone(),
            stash: self.stash.clone(),
            ns: self.ns.clone(),
        };
        self.checkpoints.clear();
        self.step_deadline = None;
        self.checkpoint_deadline = None;
        self.on_abort.clear();
        let hooks = std::mem::take(&mut self.on_commit);
        for hook in hooks {
            match hook.queue {
                None => (hook.op)(),
                Some(reg) => {
                    let op = hook.op.clone();
                    SerialQueues::global().submit(reg.id(), move || op());
                }
            }
        }
        self.errors = ErrorBits::NONE;
        self.commit_seq += 1;
        true
    }

    /// Rewind to the last committed state: stack, stash, namespace,
    /// checkpoints and buffered register effects all roll back, and
    /// abort hooks run newest first. Recoverable error bits clear.
    pub fn abort(&mut self) {
        let hooks = std::mem::take(&mut self.on_abort);
        for hook in hooks.into_iter().rev() {
            hook.run();
        }
        self.on_commit.clear();
        self.journal.rollback();
        self.stack = self.committed.stack.clone();
        self.stash = self.committed.stash.clone();
        self.ns = self.committed.ns.clone();
        self.checkpoints.clear();
        for fork in self.pending_forks.drain(..) {
            fork.set_created(Created::Uncreated);
        }
        self.pending_detach = false;
        self.atomic_depth = 0;
        self.step_deadline = None;
        self.checkpoint_deadline = None;
        self.errors = self.errors.retained_on_abort();
        self.abort_seq += 1;
    }

    /// Run work on a background thread as its own transaction that
    /// logically precedes this step; blocks until it finishes. The
    /// worker sees this thread's last committed namespace.
    pub fn bgcall<R: Send + 'static>(
        &mut self,
        f: impl FnOnce(&mut Glas) -> R + Send + 'static,
    ) -> Result<R, GlasError> {
        self.enter()?;
        let ns = self.committed.ns.clone();
        let (tx, rx) = crossbeam_channel::bounded(1);
        WorkerPool::global().submit(move || {
            let mut worker = Glas::with_namespace(ns);
            worker.set_debug_name("bgcall");
            let result = f(&mut worker);
            let _ = tx.send(result);
        });
        loop {
            match rx.recv_timeout(Duration::from_millis(10)) {
                Ok(result) => return Ok(result),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    self.check_deadlines();
                    if self.errors.contains(ErrorBits::QUOTA) {
                        return Err(GlasError::quota("bgcall exceeded the step deadline"));
                    }
                    if self.shared.is_cancelled() {
                        let err = GlasError::uncreated("thread cancelled during bgcall");
                        self.errors.insert(err.bits());
                        return Err(err);
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return Err(self.fail(GlasError::error_op("bgcall worker vanished")));
                }
            }
        }
    }

    // --- choice support --------------------------------------------------

    pub(crate) fn shared_handle(&self) -> Arc<ThreadShared> {
        self.shared.clone()
    }

    /// An independent copy of the full thread state for the choice
    /// scheduler. Bag reservations are re-taken under fresh tokens so
    /// each clone cancels independently.
    pub(crate) fn clone_for_choice(&self) -> Glas {
        let mut journal = self.journal.clone();
        journal.adopt_claims();
        Glas {
            debug_name: self.debug_name.clone(),
            stack: self.stack.clone(),
            stash: self.stash.clone(),
            ns: self.ns.clone(),
            checkpoints: Vec::new(),
            errors: self.errors,
            on_commit: self.on_commit.clone(),
            on_abort: self.on_abort.clone(),
            journal,
            committed: self.committed.clone(),
            atomic_depth: self.atomic_depth,
            step_deadline: self.step_deadline,
            checkpoint_deadline: self.checkpoint_deadline,
            shared: ThreadShared::new(Created::Created),
            pending_forks: Vec::new(),
            fork_watch: Vec::new(),
            attach_gates: self.attach_gates.clone(),
            pending_detach: self.pending_detach,
            choice: None,
            commit_seq: self.commit_seq,
            abort_seq: self.abort_seq,
            runtime: self.runtime.clone(),
        }
    }

    pub(crate) fn set_choice(&mut self, race: Arc<crate::choice::Race>, idx: usize) {
        self.choice = Some((race, idx));
    }

    pub(crate) fn clear_choice(&mut self) {
        self.choice = None;
    }

    pub(crate) fn deadline_exceeded(&mut self) -> bool {
        self.check_deadlines();
        self.errors.contains(ErrorBits::QUOTA)
    }

    pub(crate) fn note_error(&mut self, err: &GlasError) {
        self.errors.insert(err.bits());
    }

    /// Adopt a winning clone's state.
    pub(crate) fn transfer_from(&mut self, mut winner: Glas) {
        self.stack = std::mem::take(&mut winner.stack);
        self.stash = std::mem::take(&mut winner.stash);
        self.ns = std::mem::replace(&mut winner.ns, Namespace::empty());
        self.errors = winner.errors;
        self.on_commit = std::mem::take(&mut winner.on_commit);
        self.on_abort = std::mem::take(&mut winner.on_abort);
        self.journal = std::mem::take(&mut winner.journal);
        self.atomic_depth = winner.atomic_depth;
        self.pending_detach = winner.pending_detach;
        let forks = std::mem::take(&mut winner.pending_forks);
        self.pending_forks.extend(forks);
    }
}

impl Drop for Glas {
    fn drop(&mut self) {
        // Dropped abort hooks release their references through their
        // own destructors; buffered register effects just vanish, but
        // bag reservations must come back.
        self.journal.rollback();
        if !self.shared.is_cancelled() {
            self.warn_linear_orphans();
        }
        self.shared.mark_exited();
    }
}

/// Result of a zero-copy binary peek. The handle owns one reference
/// that drops with this value; the bytes must not be mutated.
pub struct BinaryPeek {
    pub handle: Refct,
    ptr: *const u8,
    len: usize,
    pub complete: bool,
}

impl BinaryPeek {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}
