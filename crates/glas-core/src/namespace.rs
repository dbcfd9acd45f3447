//! Namespaces: prefix translations over lazily evaluated definitions.
//!
//! A namespace is a persistent chain of translation tables applied in
//! front of a definition map and a set of prefix mounts (sub-
//! namespaces, register volumes, caller attachments). Cloning is O(1),
//! which is what makes transactional snapshots and forks cheap.
//!
//! Namespace-level programs are ordinary values with tagged variants;
//! evaluating one against a namespace yields a definition, an
//! environment, or an environment transformer, memoized on first
//! force.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::dict;
use crate::errors::{debug_enabled, GlasError, WARN_TAG};
use crate::registers::{RegisterRef, Volume};
use crate::thread::Glas;
use crate::value::{text_peek, text_value, Shape, Value};
use crate::workers::WorkerPool;

pub type Name = Arc<str>;

// --- translation tables ------------------------------------------------

#[derive(Clone, Debug)]
pub struct TlEntry {
    pub lhs: Name,
    /// `None` hides every name the pattern covers.
    pub rhs: Option<Name>,
}

/// An ordered prefix-to-prefix rewrite table. Lookup appends an
/// implicit `..` to the name, picks the longest matching `lhs`, and
/// substitutes `rhs`; an entry `name..` therefore matches exactly one
/// name while `name.` matches the names below it.
#[derive(Clone, Debug, Default)]
pub struct TlTable {
    entries: Vec<TlEntry>,
}

enum TlOutcome {
    Unchanged,
    Renamed(String),
    Hidden,
}

impl TlTable {
    pub fn new(entries: Vec<TlEntry>) -> TlTable {
        TlTable { entries }
    }

    pub fn from_pairs(pairs: &[(&str, Option<&str>)]) -> TlTable {
        TlTable {
            entries: pairs
                .iter()
                .map(|(lhs, rhs)| TlEntry {
                    lhs: Arc::from(*lhs),
                    rhs: rhs.map(Arc::from),
                })
                .collect(),
        }
    }

    /// Hide exactly one name.
    pub fn hide_name(name: &str) -> TlTable {
        TlTable {
            entries: vec![TlEntry {
                lhs: Arc::from(format!("{}..", name)),
                rhs: None,
            }],
        }
    }

    /// Hide every name under a prefix.
    pub fn hide_prefix(prefix: &str) -> TlTable {
        TlTable {
            entries: vec![TlEntry {
                lhs: Arc::from(prefix),
                rhs: None,
            }],
        }
    }

    /// Route every name through a prefix (used for restriction views).
    pub fn prepend_prefix(prefix: &str) -> TlTable {
        TlTable {
            entries: vec![TlEntry {
                lhs: Arc::from(""),
                rhs: Some(Arc::from(prefix)),
            }],
        }
    }

    fn apply(&self, name: &str) -> TlOutcome {
        let augmented = format!("{}..", name);
        let best = self
            .entries
            .iter()
            .filter(|e| augmented.starts_with(e.lhs.as_ref()))
            .max_by_key(|e| e.lhs.len());
        match best {
            None => TlOutcome::Unchanged,
            Some(TlEntry { rhs: None, .. }) => TlOutcome::Hidden,
            Some(TlEntry { lhs, rhs: Some(rhs) }) => {
                let mut out = String::with_capacity(rhs.len() + augmented.len() - lhs.len());
                out.push_str(rhs);
                out.push_str(&augmented[lhs.len()..]);
                match out.strip_suffix("..") {
                    Some(stripped) => TlOutcome::Renamed(stripped.to_string()),
                    None => TlOutcome::Renamed(out),
                }
            }
        }
    }
}

// --- definitions -------------------------------------------------------

/// A built-in program: runs against the calling thread's stacks.
pub struct NativeProg {
    pub name: &'static str,
    pub run: fn(&mut Glas) -> Result<(), GlasError>,
}

/// A host-supplied definition. The callback sees the host namespace it
/// closed over plus the caller's namespace attached at the requested
/// prefix. Returning `false` marks the step as failed.
pub struct CallbackDef {
    pub run: Box<dyn Fn(&mut Glas) -> bool + Send + Sync>,
    pub host_ns: Namespace,
    pub caller_prefix: Option<Name>,
    /// Refuse invocation inside atomic sections.
    pub no_atomic: bool,
}

#[derive(Clone)]
pub enum Def {
    Data(Value),
    Native(Arc<NativeProg>),
    Callback(Arc<CallbackDef>),
    Lazy(NsThunk),
}

impl std::fmt::Debug for Def {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Def::Data(v) => write!(f, "Data({:?})", v),
            Def::Native(p) => write!(f, "Native({})", p.name),
            Def::Callback(_) => write!(f, "Callback"),
            Def::Lazy(_) => write!(f, "Lazy"),
        }
    }
}

/// Result of evaluating a namespace program.
#[derive(Clone)]
pub enum NsVal {
    Data(Value),
    Def(Def),
    Env(Namespace),
    Fun(NsFun),
}

#[derive(Clone)]
pub struct NsFun {
    f: Arc<dyn Fn(&NsVal) -> Result<NsVal, GlasError> + Send + Sync>,
}

impl NsFun {
    fn new(f: impl Fn(&NsVal) -> Result<NsVal, GlasError> + Send + Sync + 'static) -> NsFun {
        NsFun { f: Arc::new(f) }
    }

    pub fn call(&self, arg: &NsVal) -> Result<NsVal, GlasError> {
        (self.f)(arg)
    }
}

pub(crate) fn nsval_to_def(v: &NsVal) -> Result<Def, GlasError> {
    match v {
        NsVal::Data(value) => Ok(Def::Data(value.clone())),
        NsVal::Def(def) => Ok(def.clone()),
        NsVal::Env(_) | NsVal::Fun(_) => Err(GlasError::error_op(
            "namespace program did not reduce to a definition",
        )),
    }
}

/// Bind a function argument into scope: data and definitions bind the
/// bare name, environments mount below `name.`.
fn bind_arg(env: &Namespace, name: &str, arg: &NsVal) -> Result<Namespace, GlasError> {
    match arg {
        NsVal::Data(value) => Ok(env.with_def(name, Def::Data(value.clone()))),
        NsVal::Def(def) => Ok(env.with_def(name, def.clone())),
        NsVal::Env(sub) => Ok(env.mount(&format!("{}.", name), Mount::Ns(sub.clone()))),
        NsVal::Fun(_) => Err(GlasError::error_op(
            "cannot bind a namespace function as an argument",
        )),
    }
}

// --- lazy thunks -------------------------------------------------------

type ThunkFn = Box<dyn FnOnce() -> Result<NsVal, GlasError> + Send>;

enum ThunkState {
    Pending(Option<ThunkFn>),
    Forcing(std::thread::ThreadId),
    Done(Result<NsVal, GlasError>),
}

struct ThunkInner {
    state: Mutex<ThunkState>,
    cond: Condvar,
}

/// A memoized namespace computation. Forced at most once; concurrent
/// forcers wait, and re-entrant forcing from the same thread reports a
/// definition cycle instead of deadlocking.
#[derive(Clone)]
pub struct NsThunk {
    inner: Arc<ThunkInner>,
}

impl NsThunk {
    pub fn eval(ast: Value, env: Namespace) -> NsThunk {
        NsThunk::from_fn(move || eval_ast(&ast, &env))
    }

    pub fn from_fn(f: impl FnOnce() -> Result<NsVal, GlasError> + Send + 'static) -> NsThunk {
        NsThunk {
            inner: Arc::new(ThunkInner {
                state: Mutex::new(ThunkState::Pending(Some(Box::new(f)))),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn force(&self) -> Result<NsVal, GlasError> {
        let mut guard = self.inner.state.lock().unwrap();
        loop {
            match &mut *guard {
                ThunkState::Done(result) => return result.clone(),
                ThunkState::Forcing(owner) => {
                    if *owner == std::thread::current().id() {
                        return Err(GlasError::error_op("namespace definition cycle"));
                    }
                    guard = self.inner.cond.wait(guard).unwrap();
                }
                ThunkState::Pending(f) => {
                    let f = f.take().expect("pending thunk holds its closure");
                    *guard = ThunkState::Forcing(std::thread::current().id());
                    drop(guard);
                    let result = f();
                    let mut guard2 = self.inner.state.lock().unwrap();
                    *guard2 = ThunkState::Done(result.clone());
                    self.inner.cond.notify_all();
                    return result;
                }
            }
        }
    }

    /// Warm the thunk on a worker thread.
    pub fn prefetch(&self) {
        let thunk = self.clone();
        WorkerPool::global().submit(move || {
            if let Err(err) = thunk.force() {
                if debug_enabled() {
                    eprintln!("{} background load failed: {}", WARN_TAG, err);
                }
            }
        });
    }
}

// --- mounts and the namespace chain ------------------------------------

#[derive(Clone)]
pub enum Mount {
    /// Register volume: every name below the prefix is a register.
    Volume(Volume),
    /// A sub-namespace bound below a prefix.
    Ns(Namespace),
    /// A caller attachment; resolves as undefined once detached.
    Caller {
        ns: Namespace,
        attached: Arc<AtomicBool>,
    },
    /// A lazily evaluated environment.
    Lazy(NsThunk),
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Resolved {
    Def(Def),
    Register(RegisterRef),
    Undefined,
}

impl PartialEq for Def {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Def::Data(a), Def::Data(b)) => a == b,
            (Def::Native(a), Def::Native(b)) => std::ptr::eq(a.as_ref(), b.as_ref()),
            (Def::Callback(a), Def::Callback(b)) => Arc::ptr_eq(a, b),
            (Def::Lazy(a), Def::Lazy(b)) => Arc::ptr_eq(&a.inner, &b.inner),
            _ => false,
        }
    }
}

impl Eq for Def {}

#[derive(Clone)]
pub struct Namespace {
    tables: im::Vector<Arc<TlTable>>,
    defs: im::HashMap<Name, Def>,
    mounts: im::HashMap<Name, Mount>,
    /// Rewrite cache for this exact chain state; refreshed on every
    /// namespace modification.
    cache: Arc<Mutex<HashMap<String, Option<String>>>>,
}

impl Default for Namespace {
    fn default() -> Self {
        Namespace::empty()
    }
}

impl Namespace {
    pub fn empty() -> Namespace {
        Namespace {
            tables: im::Vector::new(),
            defs: im::HashMap::new(),
            mounts: im::HashMap::new(),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn modified(&self) -> Namespace {
        Namespace {
            tables: self.tables.clone(),
            defs: self.defs.clone(),
            mounts: self.mounts.clone(),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Rewrite a name through the translation chain. `None` when some
    /// table hides it.
    fn rewrite(&self, name: &str) -> Option<String> {
        if let Some(hit) = self.cache.lock().unwrap().get(name) {
            return hit.clone();
        }
        let mut cur = name.to_string();
        let mut result = Some(());
        for table in self.tables.iter() {
            match table.apply(&cur) {
                TlOutcome::Unchanged => {}
                TlOutcome::Renamed(next) => cur = next,
                TlOutcome::Hidden => {
                    result = None;
                    break;
                }
            }
        }
        let out = result.map(|_| cur);
        self.cache
            .lock()
            .unwrap()
            .insert(name.to_string(), out.clone());
        out
    }

    /// Compose a translation atop the namespace.
    pub fn apply_tl(&self, table: Arc<TlTable>) -> Namespace {
        let mut ns = self.modified();
        ns.tables.push_front(table);
        ns
    }

    pub fn hide_name(&self, name: &str) -> Namespace {
        self.apply_tl(Arc::new(TlTable::hide_name(name)))
    }

    pub fn hide_prefix(&self, prefix: &str) -> Namespace {
        self.apply_tl(Arc::new(TlTable::hide_prefix(prefix)))
    }

    /// Bind a definition under the translated name.
    pub fn define(&self, name: &str, def: Def) -> Result<Namespace, GlasError> {
        let canonical = self
            .rewrite(name)
            .ok_or_else(|| GlasError::undefined(format!("cannot bind hidden name {}", name)))?;
        let mut ns = self.modified();
        ns.defs.insert(Arc::from(canonical.as_str()), def);
        Ok(ns)
    }

    /// Bind directly, bypassing translations. Used for lexical
    /// bindings inside namespace-program evaluation.
    pub fn with_def(&self, name: &str, def: Def) -> Namespace {
        let mut ns = self.modified();
        ns.defs.insert(Arc::from(name), def);
        ns
    }

    /// Mount below a prefix, shadowing definitions previously
    /// reachable through it.
    pub fn mount(&self, prefix: &str, mount: Mount) -> Namespace {
        let mut ns = self.modified();
        ns.defs = ns
            .defs
            .iter()
            .filter(|(k, _)| !k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ns.mounts.insert(Arc::from(prefix), mount);
        ns
    }

    /// A view of this namespace with every name routed below `prefix`.
    pub fn restrict(&self, prefix: &str) -> Namespace {
        self.apply_tl(Arc::new(TlTable::prepend_prefix(prefix)))
    }

    pub fn resolve(&self, name: &str) -> Result<Resolved, GlasError> {
        let canonical = match self.rewrite(name) {
            Some(c) => c,
            None => return Ok(Resolved::Undefined),
        };
        if let Some(def) = self.defs.get(canonical.as_str()) {
            return Ok(Resolved::Def(def.clone()));
        }
        // Longest mount prefix wins.
        let mut best: Option<(&Name, &Mount)> = None;
        for (prefix, mount) in self.mounts.iter() {
            if canonical.starts_with(prefix.as_ref())
                && best.map_or(true, |(b, _)| prefix.len() > b.len())
            {
                best = Some((prefix, mount));
            }
        }
        let (prefix, mount) = match best {
            Some(hit) => hit,
            None => return Ok(Resolved::Undefined),
        };
        let suffix = &canonical[prefix.len()..];
        match mount {
            Mount::Volume(volume) => Ok(Resolved::Register(volume.cell(suffix))),
            Mount::Ns(ns) => ns.resolve(suffix),
            Mount::Caller { ns, attached } => {
                if attached.load(Ordering::SeqCst) {
                    ns.resolve(suffix)
                } else {
                    Ok(Resolved::Undefined)
                }
            }
            Mount::Lazy(thunk) => match thunk.force()? {
                NsVal::Env(ns) => ns.resolve(suffix),
                _ => Err(GlasError::error_op(
                    "mounted namespace program did not reduce to an environment",
                )),
            },
        }
    }

    /// Whether the name resolves to anything. May force lazy
    /// definitions. Register names always count as defined.
    pub fn defined(&self, name: &str) -> bool {
        !matches!(self.resolve(name), Ok(Resolved::Undefined) | Err(_))
    }

    /// Whether anything is reachable under the prefix. Approximate for
    /// translated chains: it rewrites the prefix itself, then scans
    /// definitions and mounts.
    pub fn prefix_inuse(&self, prefix: &str) -> bool {
        let mut cur = prefix.to_string();
        for table in self.tables.iter() {
            match table.apply_prefix(&cur) {
                Some(Some(next)) => cur = next,
                Some(None) => return false,
                None => break,
            }
        }
        if self.defs.keys().any(|k| k.starts_with(&cur)) {
            return true;
        }
        self.mounts
            .iter()
            .any(|(p, _)| p.starts_with(&cur) || cur.starts_with(p.as_ref()))
    }

    /// Queue background evaluation of whatever the name resolves to.
    pub fn prepare(&self, name: &str) {
        let ns = self.clone();
        let name = name.to_string();
        WorkerPool::global().submit(move || {
            if let Ok(Resolved::Def(Def::Lazy(thunk))) = ns.resolve(&name) {
                let _ = thunk.force();
            }
        });
    }
}

impl TlTable {
    /// Prefix-mode application: rewrites a prefix rather than a name.
    /// `Some(None)` hides; `None` means no entry applies.
    fn apply_prefix(&self, prefix: &str) -> Option<Option<String>> {
        let best = self
            .entries
            .iter()
            .filter(|e| prefix.starts_with(e.lhs.as_ref()) || e.lhs.starts_with(prefix))
            .max_by_key(|e| e.lhs.len())?;
        match &best.rhs {
            None => Some(None),
            Some(rhs) => {
                if prefix.starts_with(best.lhs.as_ref()) {
                    Some(Some(format!("{}{}", rhs, &prefix[best.lhs.len()..])))
                } else {
                    Some(Some(rhs.to_string()))
                }
            }
        }
    }
}

// --- namespace program values ------------------------------------------

/// Constructors for namespace-program values. Programs are plain data:
/// tagged variants are single-label records, application is a bare
/// pair.
pub struct NsAst;

impl NsAst {
    fn tagged(tag: &str, payload: Value) -> Value {
        dict::insert(&Value::Leaf, tag.as_bytes(), payload).expect("static tag label")
    }

    /// Embedded data.
    pub fn data(v: Value) -> Value {
        Self::tagged("d", v)
    }

    /// Apply a translation around a program.
    pub fn translate(tl: Value, body: Value) -> Value {
        Self::tagged("t", Value::pair(tl, body))
    }

    /// A named function; the argument binds into the body's scope.
    pub fn lambda(name: &str, body: Value) -> Value {
        Self::tagged("f", Value::pair(text_value(name), body))
    }

    /// Reify the current environment.
    pub fn env() -> Value {
        Self::tagged("e", Value::Leaf)
    }

    /// Bind an environment-producing program below a prefix.
    pub fn bind_prefix(prefix: &str, body: Value) -> Value {
        Self::tagged("b", Value::pair(text_value(prefix), body))
    }

    /// Attach an annotation (ignored by evaluation).
    pub fn annotate(anno: Value, body: Value) -> Value {
        Self::tagged("a", Value::pair(anno, body))
    }

    /// Conditional on whether a name is defined.
    pub fn ifdef(name: &str, then: Value, otherwise: Value) -> Value {
        Self::tagged("c", Value::pair(text_value(name), Value::pair(then, otherwise)))
    }

    /// Fixed point of an environment transformer.
    pub fn fix(body: Value) -> Value {
        Self::tagged("y", body)
    }

    /// Application: a bare pair.
    pub fn apply(op: Value, arg: Value) -> Value {
        Value::pair(op, arg)
    }

    /// Extract a definition from an environment-producing program.
    pub fn extract(name: &str, env_ast: Value) -> Value {
        Self::tagged("x", Value::pair(text_value(name), env_ast))
    }

    /// Right-composed sequence of functions.
    pub fn seq(items: Vec<Value>) -> Value {
        Self::tagged("s", crate::rope::from_values(items))
    }

    /// Wrap a data result under a record label.
    pub fn tag(label: &str, body: Value) -> Value {
        Self::tagged("g", Value::pair(text_value(label), body))
    }

    /// Unwrap a single-label record result.
    pub fn untag(label: &str, body: Value) -> Value {
        Self::tagged("u", Value::pair(text_value(label), body))
    }

    /// Build a translation-table value: a list of `(lhs, rhs)` pairs
    /// where `rhs` is `inr(text)` or `inl(())` for hidden names.
    pub fn tl_value(pairs: &[(&str, Option<&str>)]) -> Value {
        let entries = pairs
            .iter()
            .map(|(lhs, rhs)| {
                let rhs_v = match rhs {
                    Some(r) => Value::inr(text_value(r)),
                    None => Value::inl(Value::Leaf),
                };
                Value::pair(text_value(lhs), rhs_v)
            })
            .collect();
        crate::rope::from_values(entries)
    }
}

/// Parse a translation-table value.
pub fn parse_tl(v: &Value) -> Result<TlTable, GlasError> {
    let mut entries = Vec::new();
    if !v.is_list() {
        return Err(GlasError::data_type("translation table must be a list"));
    }
    for entry in crate::rope::iter(v) {
        let (lhs_v, rhs_v) = match entry.shape() {
            Shape::Branch(l, r) => (l, r),
            _ => return Err(GlasError::data_type("translation entry must be a pair")),
        };
        let lhs = text_peek(&lhs_v)
            .ok_or_else(|| GlasError::data_type("translation lhs must be text"))?;
        let rhs = match rhs_v.shape() {
            Shape::Stem(bits, tail) if !bits.bit(0) => {
                let rest = Value::stem(bits.drop_front(1), tail);
                if !rest.is_unit() {
                    return Err(GlasError::data_type("hidden translation rhs must be unit"));
                }
                None
            }
            Shape::Stem(bits, tail) => {
                let rest = Value::stem(bits.drop_front(1), tail);
                Some(
                    text_peek(&rest)
                        .ok_or_else(|| GlasError::data_type("translation rhs must be text"))?,
                )
            }
            _ => return Err(GlasError::data_type("translation rhs must be a sum")),
        };
        entries.push(TlEntry {
            lhs: Arc::from(lhs.as_str()),
            rhs: rhs.map(|s| Arc::from(s.as_str())),
        });
    }
    Ok(TlTable::new(entries))
}

// --- evaluation --------------------------------------------------------

fn tag_payload(ast: &Value, tag: &str) -> Option<Value> {
    dict::get(ast, tag.as_bytes())
}

fn pair_of(v: &Value, what: &str) -> Result<(Value, Value), GlasError> {
    match v.shape() {
        Shape::Branch(l, r) => Ok((l, r)),
        _ => Err(GlasError::data_type(format!("{} expects a pair", what))),
    }
}

fn name_of(v: &Value, what: &str) -> Result<String, GlasError> {
    text_peek(v).ok_or_else(|| GlasError::data_type(format!("{} expects a text name", what)))
}

/// Evaluate a namespace program against an environment.
pub fn eval_ast(ast: &Value, env: &Namespace) -> Result<NsVal, GlasError> {
    match ast.shape() {
        Shape::Branch(op, arg) => {
            let f = eval_ast(&op, env)?;
            let x = eval_ast(&arg, env)?;
            match f {
                NsVal::Fun(fun) => fun.call(&x),
                _ => Err(GlasError::error_op(
                    "applied a namespace program that is not a function",
                )),
            }
        }
        Shape::Stem(_, _) => eval_tagged(ast, env),
        _ => Err(GlasError::error_op("ill-formed namespace program")),
    }
}

fn eval_tagged(ast: &Value, env: &Namespace) -> Result<NsVal, GlasError> {
    if let Some(payload) = tag_payload(ast, "d") {
        return Ok(NsVal::Data(payload));
    }
    if let Some(payload) = tag_payload(ast, "t") {
        let (tl_v, body) = pair_of(&payload, "translate")?;
        let table = parse_tl(&tl_v)?;
        return eval_ast(&body, &env.apply_tl(Arc::new(table)));
    }
    if let Some(payload) = tag_payload(ast, "f") {
        let (name_v, body) = pair_of(&payload, "function")?;
        let name = name_of(&name_v, "function")?;
        let env = env.clone();
        return Ok(NsVal::Fun(NsFun::new(move |arg| {
            eval_ast(&body, &bind_arg(&env, &name, arg)?)
        })));
    }
    if let Some(payload) = tag_payload(ast, "e") {
        if !payload.is_unit() {
            return Err(GlasError::data_type("environment reification takes unit"));
        }
        return Ok(NsVal::Env(env.clone()));
    }
    if let Some(payload) = tag_payload(ast, "b") {
        let (prefix_v, body) = pair_of(&payload, "bind")?;
        let prefix = name_of(&prefix_v, "bind")?;
        return match eval_ast(&body, env)? {
            NsVal::Env(sub) => Ok(NsVal::Env(
                Namespace::empty().mount(&prefix, Mount::Ns(sub)),
            )),
            _ => Err(GlasError::error_op("bind expects an environment")),
        };
    }
    if let Some(payload) = tag_payload(ast, "a") {
        let (_anno, body) = pair_of(&payload, "annotate")?;
        return eval_ast(&body, env);
    }
    if let Some(payload) = tag_payload(ast, "c") {
        let (name_v, arms) = pair_of(&payload, "ifdef")?;
        let name = name_of(&name_v, "ifdef")?;
        let (then, otherwise) = pair_of(&arms, "ifdef arms")?;
        return if env.defined(&name) {
            eval_ast(&then, env)
        } else {
            eval_ast(&otherwise, env)
        };
    }
    if let Some(body) = tag_payload(ast, "y") {
        let f = match eval_ast(&body, env)? {
            NsVal::Fun(f) => f,
            _ => return Err(GlasError::error_op("fixpoint expects a function")),
        };
        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<ThunkInner>| {
            let weak = weak.clone();
            let f = f.clone();
            ThunkInner {
                state: Mutex::new(ThunkState::Pending(Some(Box::new(move || {
                    let inner = weak
                        .upgrade()
                        .ok_or_else(|| GlasError::error_op("fixpoint vanished"))?;
                    let knot = Namespace::empty()
                        .mount("", Mount::Lazy(NsThunk { inner }));
                    f.call(&NsVal::Env(knot))
                })))),
                cond: Condvar::new(),
            }
        });
        return NsThunk { inner }.force();
    }
    if let Some(payload) = tag_payload(ast, "x") {
        let (name_v, env_ast) = pair_of(&payload, "extract")?;
        let name = name_of(&name_v, "extract")?;
        return match eval_ast(&env_ast, env)? {
            NsVal::Env(sub) => match sub.resolve(&name)? {
                Resolved::Def(def) => Ok(NsVal::Def(def)),
                Resolved::Register(_) => {
                    Err(GlasError::data_type("extract of a register name"))
                }
                Resolved::Undefined => Err(GlasError::undefined(name)),
            },
            _ => Err(GlasError::error_op("extract expects an environment")),
        };
    }
    if let Some(items) = tag_payload(ast, "s") {
        let mut funs = Vec::new();
        for item in crate::rope::iter(&items) {
            match eval_ast(&item, env)? {
                NsVal::Fun(f) => funs.push(f),
                _ => return Err(GlasError::error_op("sequence expects functions")),
            }
        }
        return Ok(NsVal::Fun(NsFun::new(move |arg| {
            let mut cur = arg.clone();
            for f in funs.iter().rev() {
                cur = f.call(&cur)?;
            }
            Ok(cur)
        })));
    }
    if let Some(payload) = tag_payload(ast, "g") {
        let (label_v, body) = pair_of(&payload, "tag")?;
        let label = name_of(&label_v, "tag")?;
        return match eval_ast(&body, env)? {
            NsVal::Data(v) => Ok(NsVal::Data(dict::insert(
                &Value::Leaf,
                label.as_bytes(),
                v,
            )?)),
            _ => Err(GlasError::error_op("tag expects data")),
        };
    }
    if let Some(payload) = tag_payload(ast, "u") {
        let (label_v, body) = pair_of(&payload, "untag")?;
        let label = name_of(&label_v, "untag")?;
        return match eval_ast(&body, env)? {
            NsVal::Data(v) => match dict::remove(&v, label.as_bytes())? {
                Some((item, rest)) if rest.is_unit() => Ok(NsVal::Data(item)),
                Some(_) => Err(GlasError::data_type("untag of a multi-label record")),
                None => Err(GlasError::data_type("untag label missing")),
            },
            _ => Err(GlasError::error_op("untag expects data")),
        };
    }
    Err(GlasError::error_op("unknown namespace program tag"))
}
