//! Immutable tree values.
//!
//! Every value is a binary tree with compact bit-stem prefixes. Lists
//! have optimized representations (arrays, binaries, concat/take rope
//! nodes) that are observationally equivalent to the branch-spine
//! encoding; equality and hashing see through the representation.
//! Values are shared structurally through `Arc` and never mutated.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::bits::{BitBuilder, Stem64, STEM_MAX_BITS};
use crate::errors::GlasError;
use crate::refct::Refct;
use crate::registers::SealRef;
use crate::rope;

/// Aggregate value attributes: linearity and ephemerality, joined
/// upward from the leaves at construction time.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Attrs(u8);

impl Attrs {
    pub const NONE: Attrs = Attrs(0);
    pub const LINEAR: Attrs = Attrs(1);
    /// Data referencing runtime-lifetime identities (foreign pointers,
    /// seal keys); must not be stored into persistent registers.
    pub const EPHEMERAL: Attrs = Attrs(2);

    pub fn join(self, other: Attrs) -> Attrs {
        Attrs(self.0 | other.0)
    }

    pub fn linear(self) -> bool {
        self.0 & Self::LINEAR.0 != 0
    }

    pub fn ephemeral(self) -> bool {
        self.0 & Self::EPHEMERAL.0 != 0
    }
}

pub struct StemNode {
    pub bits: Stem64,
    pub tail: Value,
    attrs: Attrs,
}

pub struct BranchNode {
    pub left: Value,
    pub right: Value,
    attrs: Attrs,
}

/// A window into a shared vector of values. Always non-empty.
pub struct ArrayNode {
    pub items: Arc<[Value]>,
    pub off: usize,
    pub len: usize,
    attrs: Attrs,
}

pub(crate) enum BinData {
    Owned(Arc<[u8]>),
    /// Zero-copy view of host memory, pinned through a refcount handle.
    /// The host must not mutate the buffer while pinned.
    Pinned { ptr: *const u8, len: usize, pin: Arc<Refct> },
}

// The pinned pointer is read-only shared memory whose lifetime is held
// by the refcount handle, which is itself thread-safe by contract.
unsafe impl Send for BinData {}
unsafe impl Sync for BinData {}

/// A window into a shared byte buffer. Always non-empty.
pub struct BinaryNode {
    pub(crate) data: BinData,
    pub off: usize,
    pub len: usize,
}

impl BinaryNode {
    pub fn bytes(&self) -> &[u8] {
        match &self.data {
            BinData::Owned(b) => &b[self.off..self.off + self.len],
            BinData::Pinned { ptr, len, .. } => {
                debug_assert!(self.off + self.len <= *len);
                unsafe { std::slice::from_raw_parts(ptr.add(self.off), self.len) }
            }
        }
    }

    fn attrs(&self) -> Attrs {
        match &self.data {
            BinData::Owned(_) => Attrs::NONE,
            BinData::Pinned { .. } => Attrs::EPHEMERAL,
        }
    }
}

/// Rope spine: `left ++ right` with cached lengths. Both sides are
/// non-empty lists.
pub struct ConcatNode {
    pub left: Value,
    pub right: Value,
    pub left_len: u64,
    pub len: u64,
    pub depth: u8,
    attrs: Attrs,
}

/// Rope spine: the first `count` elements of `source`, size cached.
/// `1 <= count <= len(source)`.
pub struct TakeNode {
    pub count: u64,
    pub source: Value,
    pub depth: u8,
    attrs: Attrs,
}

/// Non-observable envelope keyed by a register identity. The linear
/// form additionally forbids copy and drop.
pub struct SealNode {
    pub key: SealRef,
    pub data: Value,
    pub linear: bool,
    attrs: Attrs,
}

/// A host pointer carried as an abstract value. Identity equality.
pub struct ForeignNode {
    pub pin: Refct,
}

#[derive(Clone)]
pub enum Value {
    Leaf,
    Stem(Arc<StemNode>),
    Branch(Arc<BranchNode>),
    Array(Arc<ArrayNode>),
    Binary(Arc<BinaryNode>),
    Concat(Arc<ConcatNode>),
    Take(Arc<TakeNode>),
    Seal(Arc<SealNode>),
    Foreign(Arc<ForeignNode>),
}

/// One-step observation of a value.
pub enum Shape {
    Leaf,
    Stem(Stem64, Value),
    Branch(Value, Value),
    Sealed(Arc<SealNode>),
    Foreign(Arc<ForeignNode>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Leaf
    }
}

impl Value {
    pub fn unit() -> Value {
        Value::Leaf
    }

    /// Prefix `bits` onto `tail`, merging adjacent stems when they fit.
    pub fn stem(bits: Stem64, tail: Value) -> Value {
        if bits.is_empty() {
            return tail;
        }
        if let Value::Stem(node) = &tail {
            if let Some(merged) = bits.concat(node.bits) {
                return Value::Stem(Arc::new(StemNode {
                    bits: merged,
                    attrs: node.tail.attrs(),
                    tail: node.tail.clone(),
                }));
            }
        }
        let attrs = tail.attrs();
        Value::Stem(Arc::new(StemNode { bits, tail, attrs }))
    }

    /// Prefix a chain of stem words, front first.
    pub fn stem_chain(stems: &[Stem64], tail: Value) -> Value {
        stems
            .iter()
            .rev()
            .fold(tail, |acc, s| Value::stem(*s, acc))
    }

    pub fn branch(left: Value, right: Value) -> Value {
        let attrs = left.attrs().join(right.attrs());
        Value::Branch(Arc::new(BranchNode { left, right, attrs }))
    }

    pub fn pair(a: Value, b: Value) -> Value {
        Value::branch(a, b)
    }

    /// Sum introduction: a `0` bit prefix.
    pub fn inl(v: Value) -> Value {
        Value::stem(Stem64::EMPTY.push_back(false), v)
    }

    /// Sum introduction: a `1` bit prefix.
    pub fn inr(v: Value) -> Value {
        Value::stem(Stem64::EMPTY.push_back(true), v)
    }

    pub fn byte(b: u8) -> Value {
        Value::stem(Stem64::pack(b as u64, 8), Value::Leaf)
    }

    pub(crate) fn array_slice(items: Arc<[Value]>, off: usize, len: usize) -> Value {
        debug_assert!(len >= 1 && off + len <= items.len());
        let mut attrs = Attrs::NONE;
        for v in &items[off..off + len] {
            attrs = attrs.join(v.attrs());
        }
        Value::Array(Arc::new(ArrayNode {
            items,
            off,
            len,
            attrs,
        }))
    }

    pub(crate) fn binary_owned(data: Arc<[u8]>, off: usize, len: usize) -> Value {
        debug_assert!(len >= 1 && off + len <= data.len());
        Value::Binary(Arc::new(BinaryNode {
            data: BinData::Owned(data),
            off,
            len,
        }))
    }

    /// Wrap host memory without copying. The refcount handle keeps the
    /// buffer alive; the caller has already transferred one reference.
    pub fn binary_pinned(ptr: *const u8, len: usize, pin: Refct) -> Value {
        if len == 0 {
            return Value::Leaf;
        }
        Value::Binary(Arc::new(BinaryNode {
            data: BinData::Pinned {
                ptr,
                len,
                pin: Arc::new(pin),
            },
            off: 0,
            len,
        }))
    }

    pub(crate) fn concat_node(left: Value, right: Value, left_len: u64, len: u64, depth: u8) -> Value {
        let attrs = left.attrs().join(right.attrs());
        Value::Concat(Arc::new(ConcatNode {
            left,
            right,
            left_len,
            len,
            depth,
            attrs,
        }))
    }

    pub(crate) fn take_node(count: u64, source: Value, depth: u8) -> Value {
        let attrs = source.attrs();
        Value::Take(Arc::new(TakeNode {
            count,
            source,
            depth,
            attrs,
        }))
    }

    pub fn seal(key: SealRef, data: Value, linear: bool) -> Value {
        let mut attrs = data.attrs().join(Attrs::EPHEMERAL);
        if linear {
            attrs = attrs.join(Attrs::LINEAR);
        }
        Value::Seal(Arc::new(SealNode {
            key,
            data,
            linear,
            attrs,
        }))
    }

    /// Reveal sealed data. Fails unless the key register matches.
    pub fn unseal(&self, key: &SealRef) -> Result<Value, GlasError> {
        match self {
            Value::Seal(node) if node.key.id() == key.id() => Ok(node.data.clone()),
            Value::Seal(_) => Err(GlasError::sealed("unseal with mismatched key")),
            _ => Err(GlasError::sealed("unseal of unsealed data")),
        }
    }

    pub fn foreign(pin: Refct) -> Value {
        Value::Foreign(Arc::new(ForeignNode { pin }))
    }

    pub fn attrs(&self) -> Attrs {
        match self {
            Value::Leaf => Attrs::NONE,
            Value::Stem(n) => n.attrs,
            Value::Branch(n) => n.attrs,
            Value::Array(n) => n.attrs,
            Value::Binary(n) => n.attrs(),
            Value::Concat(n) => n.attrs,
            Value::Take(n) => n.attrs,
            Value::Seal(n) => n.attrs,
            Value::Foreign(_) => Attrs::EPHEMERAL,
        }
    }

    pub fn is_linear(&self) -> bool {
        self.attrs().linear()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.attrs().ephemeral()
    }

    /// One observation step. List representations unfold to branches.
    pub fn shape(&self) -> Shape {
        match self {
            Value::Leaf => Shape::Leaf,
            Value::Stem(n) => Shape::Stem(n.bits, n.tail.clone()),
            Value::Branch(n) => Shape::Branch(n.left.clone(), n.right.clone()),
            Value::Array(_) | Value::Binary(_) | Value::Concat(_) | Value::Take(_) => {
                match rope::uncons(self) {
                    Some((head, tail)) => Shape::Branch(head, tail),
                    None => Shape::Leaf,
                }
            }
            Value::Seal(n) => Shape::Sealed(n.clone()),
            Value::Foreign(n) => Shape::Foreign(n.clone()),
        }
    }

    // --- predicates ---------------------------------------------------

    pub fn is_unit(&self) -> bool {
        matches!(self.shape(), Shape::Leaf)
    }

    pub fn is_pair(&self) -> bool {
        matches!(self.shape(), Shape::Branch(_, _))
    }

    pub fn is_inl(&self) -> bool {
        matches!(self.shape(), Shape::Stem(bits, _) if !bits.bit(0))
    }

    pub fn is_inr(&self) -> bool {
        matches!(self.shape(), Shape::Stem(bits, _) if bits.bit(0))
    }

    pub fn is_list(&self) -> bool {
        let mut cur = self.clone();
        loop {
            match cur {
                Value::Leaf => return true,
                Value::Array(_) | Value::Binary(_) | Value::Concat(_) | Value::Take(_) => {
                    return true
                }
                Value::Branch(n) => cur = n.right.clone(),
                _ => return false,
            }
        }
    }

    pub fn is_binary(&self) -> bool {
        match self {
            Value::Binary(_) => true,
            _ => {
                if !self.is_list() {
                    return false;
                }
                rope::iter(self).all(|v| v.as_byte().is_some())
            }
        }
    }

    pub fn is_bitstring(&self) -> bool {
        let mut cur = self.clone();
        loop {
            match cur {
                Value::Leaf => return true,
                Value::Stem(n) => cur = n.tail.clone(),
                _ => return false,
            }
        }
    }

    pub fn is_dict(&self) -> bool {
        crate::dict::is_record(self)
    }

    /// Integers, or pairs of integers read as numerator/denominator
    /// with a positive denominator.
    pub fn is_rational(&self) -> bool {
        if self.is_bitstring() {
            return true;
        }
        match self.shape() {
            Shape::Branch(n, d) => {
                n.is_bitstring() && d.is_bitstring() && matches!(int_peek(&d), Ok(x) if x > 0)
            }
            _ => false,
        }
    }

    /// The byte encoded by an 8-bit stem, if this is one.
    pub fn as_byte(&self) -> Option<u8> {
        match self {
            Value::Stem(n) => {
                if n.bits.len() == 8 && matches!(n.tail, Value::Leaf) {
                    Some(n.bits.bits_value() as u8)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Shallow physical identity, used as an equality fast path.
    pub(crate) fn same_node(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Leaf, Value::Leaf) => true,
            (Value::Stem(a), Value::Stem(b)) => Arc::ptr_eq(a, b),
            (Value::Branch(a), Value::Branch(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Binary(a), Value::Binary(b)) => Arc::ptr_eq(a, b),
            (Value::Concat(a), Value::Concat(b)) => Arc::ptr_eq(a, b),
            (Value::Take(a), Value::Take(b)) => Arc::ptr_eq(a, b),
            (Value::Seal(a), Value::Seal(b)) => Arc::ptr_eq(a, b),
            (Value::Foreign(a), Value::Foreign(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

// --- canonical observation stream -------------------------------------

/// One symbol of the canonical observation stream. Pure trees use the
/// same two-bit alphabet as the shrub codec; seals and foreign pointers
/// emit out-of-band identity events.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Ev {
    Leaf,
    Pair,
    Bit(bool),
    SealKey(u64),
    ForeignPtr(usize),
}

enum Task {
    /// Emit a complete value.
    Val(Value),
    /// Emit the elements of a proper list, without the terminator.
    Open(Value),
    /// Emit the first `n` elements, without the terminator.
    Lim(u64, Value),
    ArrIdx(Arc<ArrayNode>, usize, usize),
    BinIdx(Arc<BinaryNode>, usize, usize),
}

/// Streams the canonical observation of a value, independent of the
/// list representation in use.
pub(crate) struct Walker {
    tasks: Vec<Task>,
    queue: VecDeque<Ev>,
}

impl Walker {
    pub(crate) fn new(v: &Value) -> Walker {
        Walker {
            tasks: vec![Task::Val(v.clone())],
            queue: VecDeque::new(),
        }
    }

    fn run_task(&mut self, task: Task) {
        match task {
            Task::Val(v) => match v {
                Value::Leaf => self.queue.push_back(Ev::Leaf),
                Value::Stem(n) => {
                    for bit in n.bits.iter() {
                        self.queue.push_back(Ev::Bit(bit));
                    }
                    self.tasks.push(Task::Val(n.tail.clone()));
                }
                Value::Branch(n) => {
                    self.queue.push_back(Ev::Pair);
                    self.tasks.push(Task::Val(n.right.clone()));
                    self.tasks.push(Task::Val(n.left.clone()));
                }
                Value::Array(n) => {
                    self.tasks.push(Task::Val(Value::Leaf));
                    let (off, len) = (n.off, n.len);
                    self.tasks.push(Task::ArrIdx(n, off, off + len));
                }
                Value::Binary(n) => {
                    self.tasks.push(Task::Val(Value::Leaf));
                    let (off, len) = (n.off, n.len);
                    self.tasks.push(Task::BinIdx(n, off, off + len));
                }
                Value::Concat(n) => {
                    self.tasks.push(Task::Val(n.right.clone()));
                    self.tasks.push(Task::Open(n.left.clone()));
                }
                Value::Take(n) => {
                    self.tasks.push(Task::Val(Value::Leaf));
                    self.tasks.push(Task::Lim(n.count, n.source.clone()));
                }
                Value::Seal(n) => {
                    self.queue.push_back(Ev::SealKey(n.key.id()));
                    self.tasks.push(Task::Val(n.data.clone()));
                }
                Value::Foreign(n) => {
                    self.queue.push_back(Ev::ForeignPtr(n.pin.addr()));
                }
            },
            Task::Open(v) => match v {
                Value::Leaf => {}
                Value::Branch(n) => {
                    self.queue.push_back(Ev::Pair);
                    self.tasks.push(Task::Open(n.right.clone()));
                    self.tasks.push(Task::Val(n.left.clone()));
                }
                Value::Array(n) => {
                    let (off, len) = (n.off, n.len);
                    self.tasks.push(Task::ArrIdx(n, off, off + len));
                }
                Value::Binary(n) => {
                    let (off, len) = (n.off, n.len);
                    self.tasks.push(Task::BinIdx(n, off, off + len));
                }
                Value::Concat(n) => {
                    self.tasks.push(Task::Open(n.right.clone()));
                    self.tasks.push(Task::Open(n.left.clone()));
                }
                Value::Take(n) => {
                    self.tasks.push(Task::Lim(n.count, n.source.clone()));
                }
                other => {
                    // Rope invariants keep improper tails out of spines.
                    debug_assert!(false, "open traversal of a non-list");
                    self.tasks.push(Task::Val(other));
                }
            },
            Task::Lim(0, _) => {}
            Task::Lim(n, v) => match v {
                Value::Leaf => debug_assert!(false, "take beyond list length"),
                Value::Branch(node) => {
                    self.queue.push_back(Ev::Pair);
                    self.tasks.push(Task::Lim(n - 1, node.right.clone()));
                    self.tasks.push(Task::Val(node.left.clone()));
                }
                Value::Array(node) => {
                    let stop = node.off + (n as usize).min(node.len);
                    let off = node.off;
                    self.tasks.push(Task::ArrIdx(node, off, stop));
                }
                Value::Binary(node) => {
                    let stop = node.off + (n as usize).min(node.len);
                    let off = node.off;
                    self.tasks.push(Task::BinIdx(node, off, stop));
                }
                Value::Concat(node) => {
                    if n <= node.left_len {
                        self.tasks.push(Task::Lim(n, node.left.clone()));
                    } else {
                        self.tasks
                            .push(Task::Lim(n - node.left_len, node.right.clone()));
                        self.tasks.push(Task::Open(node.left.clone()));
                    }
                }
                Value::Take(node) => {
                    self.tasks
                        .push(Task::Lim(n.min(node.count), node.source.clone()));
                }
                other => {
                    debug_assert!(false, "limited traversal of a non-list");
                    self.tasks.push(Task::Val(other));
                }
            },
            Task::ArrIdx(node, i, stop) => {
                if i < stop {
                    self.queue.push_back(Ev::Pair);
                    let item = node.items[i].clone();
                    self.tasks.push(Task::ArrIdx(node, i + 1, stop));
                    self.tasks.push(Task::Val(item));
                }
            }
            Task::BinIdx(node, i, stop) => {
                if i < stop {
                    let b = match &node.data {
                        BinData::Owned(d) => d[i],
                        BinData::Pinned { ptr, .. } => unsafe { *ptr.add(i) },
                    };
                    self.queue.push_back(Ev::Pair);
                    for k in (0..8).rev() {
                        self.queue.push_back(Ev::Bit((b >> k) & 1 == 1));
                    }
                    self.queue.push_back(Ev::Leaf);
                    self.tasks.push(Task::BinIdx(node, i + 1, stop));
                }
            }
        }
    }
}

impl Iterator for Walker {
    type Item = Ev;

    fn next(&mut self) -> Option<Ev> {
        loop {
            if let Some(ev) = self.queue.pop_front() {
                return Some(ev);
            }
            let task = self.tasks.pop()?;
            self.run_task(task);
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        if self.same_node(other) {
            return true;
        }
        // Whole-binary fast path before falling back to the stream.
        if let (Value::Binary(a), Value::Binary(b)) = (self, other) {
            return a.bytes() == b.bytes();
        }
        let mut wa = Walker::new(self);
        let mut wb = Walker::new(other);
        loop {
            match (wa.next(), wb.next()) {
                (None, None) => return true,
                (Some(a), Some(b)) if a == b => continue,
                _ => return false,
            }
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut acc: u64 = 0;
        let mut syms_in_acc: u32 = 0;
        let mut total: u64 = 0;
        for ev in Walker::new(self) {
            let sym = match ev {
                Ev::Leaf => 0u64,
                Ev::Pair => 1,
                Ev::Bit(false) => 2,
                Ev::Bit(true) => 3,
                Ev::SealKey(id) => {
                    state.write_u64(acc);
                    acc = 0;
                    syms_in_acc = 0;
                    state.write_u64(0x5ea1_5ea1_5ea1_5ea1 ^ id);
                    continue;
                }
                Ev::ForeignPtr(p) => {
                    state.write_u64(acc);
                    acc = 0;
                    syms_in_acc = 0;
                    state.write_u64(0xf0e1_f0e1_f0e1_f0e1 ^ p as u64);
                    continue;
                }
            };
            acc = (acc << 2) | sym;
            syms_in_acc += 1;
            total += 1;
            if syms_in_acc == 32 {
                state.write_u64(acc);
                acc = 0;
                syms_in_acc = 0;
            }
        }
        state.write_u64(acc);
        state.write_u64(total);
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn go(v: &Value, depth: usize, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            if depth > 8 {
                return write!(f, "…");
            }
            if v.is_bitstring() {
                if let Ok(n) = int_peek_i128(v) {
                    return write!(f, "{}", n);
                }
            }
            match v {
                Value::Leaf => write!(f, "()"),
                Value::Binary(n) => {
                    let bytes = n.bytes();
                    match std::str::from_utf8(bytes) {
                        Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "{:?}", s),
                        _ => write!(f, "0x{}", hex(bytes)),
                    }
                }
                Value::Seal(_) => write!(f, "<sealed>"),
                Value::Foreign(_) => write!(f, "<foreign>"),
                _ => match v.shape() {
                    Shape::Leaf => write!(f, "()"),
                    Shape::Stem(bits, tail) => {
                        for b in bits.iter() {
                            write!(f, "{}", if b { '1' } else { '0' })?;
                        }
                        write!(f, ":")?;
                        go(&tail, depth + 1, f)
                    }
                    Shape::Branch(l, r) => {
                        write!(f, "(")?;
                        go(&l, depth + 1, f)?;
                        write!(f, ", ")?;
                        go(&r, depth + 1, f)?;
                        write!(f, ")")
                    }
                    Shape::Sealed(_) => write!(f, "<sealed>"),
                    Shape::Foreign(_) => write!(f, "<foreign>"),
                },
            }
        }
        fn hex(bytes: &[u8]) -> String {
            let mut s = String::new();
            for b in bytes.iter().take(16) {
                s.push_str(&format!("{:02x}", b));
            }
            if bytes.len() > 16 {
                s.push('…');
            }
            s
        }
        go(self, 0, f)
    }
}

// --- integer codec -----------------------------------------------------

/// Encode a signed integer as its minimal bitstring: the plain binary
/// form for `n >= 0`, the bitwise complement of `|n|`'s binary form
/// for `n < 0` (so `-1` is `0` and `-7` is `000`).
pub fn int_value(n: i64) -> Value {
    if n >= 0 {
        uint_value(n as u64)
    } else {
        let m = n.unsigned_abs();
        let width = 64 - m.leading_zeros() as usize;
        bits_value(!m, width)
    }
}

pub fn uint_value(n: u64) -> Value {
    let width = 64 - n.leading_zeros() as usize;
    bits_value(n, width)
}

fn bits_value(bits: u64, width: usize) -> Value {
    if width == 0 {
        return Value::Leaf;
    }
    if width <= STEM_MAX_BITS {
        return Value::stem(Stem64::pack(bits, width), Value::Leaf);
    }
    // 64-bit forms need one extra stem word.
    let head = Stem64::pack(bits >> 1, STEM_MAX_BITS);
    let tail = Stem64::pack(bits & 1, 1);
    Value::stem(head, Value::stem(tail, Value::Leaf))
}

/// Collect the bits of a bitstring, failing on other shapes.
pub fn bitstring_bits(v: &Value) -> Result<Vec<bool>, GlasError> {
    let mut out = Vec::new();
    let mut cur = v.clone();
    loop {
        match cur {
            Value::Leaf => return Ok(out),
            Value::Stem(n) => {
                out.extend(n.bits.iter());
                cur = n.tail.clone();
            }
            _ => return Err(GlasError::data_type("expected a bitstring")),
        }
    }
}

fn int_peek_i128(v: &Value) -> Result<i128, GlasError> {
    let bits = bitstring_bits(v)?;
    if bits.is_empty() {
        return Ok(0);
    }
    if bits.len() > 64 {
        return Err(GlasError::data_type("integer out of range"));
    }
    let mut word: u64 = 0;
    for b in &bits {
        word = (word << 1) | (*b as u64);
    }
    if bits[0] {
        Ok(word as i128)
    } else {
        let width = bits.len();
        let mask = if width == 64 {
            u64::MAX
        } else {
            (1u64 << width) - 1
        };
        Ok(-(((!word) & mask) as i128))
    }
}

/// Decode a bitstring as a signed 64-bit integer.
pub fn int_peek(v: &Value) -> Result<i64, GlasError> {
    let n = int_peek_i128(v)?;
    i64::try_from(n).map_err(|_| GlasError::data_type("integer out of range for i64"))
}

/// Decode a bitstring as an unsigned 64-bit integer.
pub fn uint_peek(v: &Value) -> Result<u64, GlasError> {
    let n = int_peek_i128(v)?;
    u64::try_from(n).map_err(|_| GlasError::data_type("integer out of range for u64"))
}

// --- bitstring / binary conversions ------------------------------------

/// Expand a binary into a bitstring, one byte to eight bits, most
/// significant bit first.
pub fn bits_of_bin(v: &Value) -> Result<Value, GlasError> {
    let bytes = rope::to_bytes(v).ok_or_else(|| GlasError::data_type("expected a binary"))?;
    let mut builder = BitBuilder::new();
    for b in bytes.iter() {
        builder.push_byte(*b);
    }
    Ok(Value::stem_chain(&builder.stems(), Value::Leaf))
}

/// Pack a bitstring into a binary. The length must be a multiple of
/// eight.
pub fn bin_of_bits(v: &Value) -> Result<Value, GlasError> {
    let bits = bitstring_bits(v)?;
    if bits.len() % 8 != 0 {
        return Err(GlasError::data_type(
            "bitstring length is not a multiple of 8",
        ));
    }
    let mut bytes = Vec::with_capacity(bits.len() / 8);
    for chunk in bits.chunks(8) {
        let mut b = 0u8;
        for bit in chunk {
            b = (b << 1) | (*bit as u8);
        }
        bytes.push(b);
    }
    Ok(rope::from_bytes(&bytes))
}

/// Flip every bit of a bitstring.
pub fn invert_bits(v: &Value) -> Result<Value, GlasError> {
    let mut stems = Vec::new();
    let mut cur = v.clone();
    loop {
        match cur {
            Value::Leaf => break,
            Value::Stem(n) => {
                stems.push(n.bits.invert());
                cur = n.tail.clone();
            }
            _ => return Err(GlasError::data_type("expected a bitstring")),
        }
    }
    Ok(Value::stem_chain(&stems, Value::Leaf))
}

// --- text helpers ------------------------------------------------------

pub fn text_value(s: &str) -> Value {
    rope::from_bytes(s.as_bytes())
}

pub fn text_peek(v: &Value) -> Option<String> {
    let bytes = rope::to_bytes(v)?;
    String::from_utf8(bytes.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn unit_and_pair_shapes() {
        assert!(Value::unit().is_unit());
        let p = Value::pair(Value::unit(), Value::byte(3));
        assert!(p.is_pair());
        assert!(!p.is_unit());
    }

    #[test]
    fn sums_observe_first_bit() {
        assert!(Value::inl(Value::unit()).is_inl());
        assert!(Value::inr(Value::unit()).is_inr());
        assert!(!Value::inl(Value::unit()).is_inr());
    }

    #[test]
    fn stems_merge_on_construction() {
        let inner = Value::stem(Stem64::pack(0b01, 2), Value::Leaf);
        let outer = Value::stem(Stem64::pack(0b1, 1), inner);
        match outer {
            Value::Stem(n) => {
                assert_eq!(n.bits, Stem64::pack(0b101, 3));
                assert!(matches!(n.tail, Value::Leaf));
            }
            _ => panic!("expected merged stem"),
        }
    }

    #[test]
    fn integer_examples() {
        assert!(matches!(int_value(0), Value::Leaf));
        let forty_two = int_value(42);
        let bits = bitstring_bits(&forty_two).unwrap();
        assert_eq!(bits, vec![true, false, true, false, true, false]);
        let minus_seven = int_value(-7);
        let bits = bitstring_bits(&minus_seven).unwrap();
        assert_eq!(bits, vec![false, false, false]);
        assert_eq!(int_peek(&int_value(-1)).unwrap(), -1);
    }

    #[test]
    fn integer_roundtrip_extremes() {
        for n in [0i64, 1, -1, 42, -42, i64::MAX, i64::MIN, i64::MIN + 1] {
            assert_eq!(int_peek(&int_value(n)).unwrap(), n, "roundtrip {}", n);
        }
        assert_eq!(uint_peek(&uint_value(u64::MAX)).unwrap(), u64::MAX);
    }

    #[test]
    fn byte_value_reads_back() {
        assert_eq!(Value::byte(0x61).as_byte(), Some(0x61));
        assert_eq!(Value::byte(0).as_byte(), Some(0));
        assert_eq!(Value::unit().as_byte(), None);
    }

    #[test]
    fn representation_independent_equality() {
        let bytes = [0x61u8, 0x62, 0x63];
        let as_binary = rope::from_bytes(&bytes);
        let as_array = rope::from_values(bytes.iter().map(|b| Value::byte(*b)).collect());
        let as_spine = bytes.iter().rev().fold(Value::Leaf, |acc, b| {
            Value::branch(Value::byte(*b), acc)
        });
        assert_eq!(as_binary, as_array);
        assert_eq!(as_binary, as_spine);
        assert_eq!(hash_of(&as_binary), hash_of(&as_array));
        assert_eq!(hash_of(&as_binary), hash_of(&as_spine));
    }

    #[test]
    fn concat_and_take_hash_like_spines() {
        let a = rope::from_bytes(b"ab");
        let b = rope::from_bytes(b"cd");
        let joined = rope::concat(a, b);
        let direct = rope::from_bytes(b"abcd");
        assert_eq!(joined, direct);
        assert_eq!(hash_of(&joined), hash_of(&direct));
        let (front, _) = rope::split(&direct, 2).unwrap();
        assert_eq!(front, rope::from_bytes(b"ab"));
        assert_eq!(hash_of(&front), hash_of(&rope::from_bytes(b"ab")));
    }

    #[test]
    fn bits_bin_roundtrip() {
        let bin = rope::from_bytes(&[0xF0, 0x0F]);
        let bits = bits_of_bin(&bin).unwrap();
        let back = bin_of_bits(&bits).unwrap();
        assert_eq!(back, bin);
        // 7 bits is not byte-aligned
        let odd = Value::stem(Stem64::pack(0b1010101, 7), Value::Leaf);
        assert!(bin_of_bits(&odd).is_err());
    }

    #[test]
    fn invert_involution() {
        let v = int_value(42);
        assert_eq!(invert_bits(&invert_bits(&v).unwrap()).unwrap(), v);
        // Complementing the minimal form of n yields the encoding of -n.
        assert_eq!(invert_bits(&v).unwrap(), int_value(-42));
        assert_eq!(invert_bits(&int_value(1)).unwrap(), int_value(-1));
    }

    #[test]
    fn rational_predicate() {
        assert!(int_value(5).is_rational());
        assert!(Value::pair(int_value(1), int_value(2)).is_rational());
        assert!(!Value::pair(int_value(1), int_value(0)).is_rational());
        assert!(!Value::pair(int_value(1), int_value(-2)).is_rational());
        assert!(!Value::pair(Value::pair(Value::Leaf, Value::Leaf), int_value(2)).is_rational());
    }

    #[test]
    fn text_roundtrip() {
        let v = text_value("hello");
        assert_eq!(text_peek(&v).as_deref(), Some("hello"));
        assert!(v.is_binary());
    }
}
