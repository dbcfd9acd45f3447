//! List operations over the optimized representations.
//!
//! Large lists are kept as trees of array/binary chunks under concat
//! and take spine nodes with cached sizes, giving logarithmic split,
//! index and append. Small edge chunks are merged eagerly so repeated
//! cons stays cheap. All operations preserve observational equivalence
//! with the branch-spine encoding.

use std::sync::Arc;

use crate::value::Value;

/// Chunk tuning. Edge chunks merge up to the small bound; full chunks
/// cap at the large bound.
pub const SMALL_CHUNK_VALUES: usize = 6;
pub const SMALL_CHUNK_BYTES: usize = 16;
pub const MAX_CHUNK_VALUES: usize = 512;
pub const MAX_CHUNK_BYTES: usize = 4096;

/// Spines deeper than this are rebuilt balanced.
const MAX_SPINE_DEPTH: u8 = 48;

/// List length, or `None` for non-lists.
pub fn len(v: &Value) -> Option<u64> {
    let mut total: u64 = 0;
    let mut cur = v.clone();
    loop {
        match cur {
            Value::Leaf => return Some(total),
            Value::Branch(n) => {
                total += 1;
                cur = n.right.clone();
            }
            Value::Array(n) => return Some(total + n.len as u64),
            Value::Binary(n) => return Some(total + n.len as u64),
            Value::Concat(n) => return Some(total + n.len),
            Value::Take(n) => return Some(total + n.count),
            _ => return None,
        }
    }
}

pub fn is_empty(v: &Value) -> bool {
    matches!(v, Value::Leaf)
}

fn depth(v: &Value) -> u8 {
    match v {
        Value::Concat(n) => n.depth,
        Value::Take(n) => n.depth,
        _ => 0,
    }
}

/// Head and tail of a non-empty list. `None` for the empty list and
/// for non-lists.
pub fn uncons(v: &Value) -> Option<(Value, Value)> {
    match v {
        Value::Branch(n) => Some((n.left.clone(), n.right.clone())),
        Value::Array(n) => {
            let head = n.items[n.off].clone();
            let tail = if n.len == 1 {
                Value::Leaf
            } else {
                Value::array_slice(n.items.clone(), n.off + 1, n.len - 1)
            };
            Some((head, tail))
        }
        Value::Binary(n) => {
            let head = Value::byte(n.bytes()[0]);
            let tail = slice_binary(n, 1, n.len - 1);
            Some((head, tail))
        }
        Value::Concat(n) => {
            let (head, left_tail) = uncons(&n.left)?;
            let tail = if is_empty(&left_tail) {
                n.right.clone()
            } else {
                Value::concat_node(left_tail, n.right.clone(), n.left_len - 1, n.len - 1, n.depth)
            };
            Some((head, tail))
        }
        Value::Take(n) => {
            let (head, source_tail) = uncons(&n.source)?;
            let tail = if n.count == 1 {
                Value::Leaf
            } else {
                take(&source_tail, n.count - 1)
            };
            Some((head, tail))
        }
        _ => None,
    }
}

fn slice_binary(n: &Arc<crate::value::BinaryNode>, rel_off: usize, new_len: usize) -> Value {
    if new_len == 0 {
        return Value::Leaf;
    }
    match &n.data {
        crate::value::BinData::Owned(data) => {
            Value::binary_owned(data.clone(), n.off + rel_off, new_len)
        }
        crate::value::BinData::Pinned { .. } => {
            // Keep the pin; re-window the same node data.
            Value::Binary(Arc::new(crate::value::BinaryNode {
                data: clone_bin_data(&n.data),
                off: n.off + rel_off,
                len: new_len,
            }))
        }
    }
}

fn clone_bin_data(d: &crate::value::BinData) -> crate::value::BinData {
    match d {
        crate::value::BinData::Owned(b) => crate::value::BinData::Owned(b.clone()),
        crate::value::BinData::Pinned { ptr, len, pin } => crate::value::BinData::Pinned {
            ptr: *ptr,
            len: *len,
            pin: pin.clone(),
        },
    }
}

/// Build a list from a vector of values, chunked and balanced.
pub fn from_values(items: Vec<Value>) -> Value {
    if items.is_empty() {
        return Value::Leaf;
    }
    let shared: Arc<[Value]> = items.into();
    let total = shared.len();
    let mut chunks = Vec::with_capacity(total / MAX_CHUNK_VALUES + 1);
    let mut off = 0;
    while off < total {
        let len = (total - off).min(MAX_CHUNK_VALUES);
        chunks.push(Value::array_slice(shared.clone(), off, len));
        off += len;
    }
    build_balanced(&chunks)
}

/// Build a binary list from bytes, chunked and balanced.
pub fn from_bytes(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Leaf;
    }
    let shared: Arc<[u8]> = bytes.into();
    let total = shared.len();
    let mut chunks = Vec::with_capacity(total / MAX_CHUNK_BYTES + 1);
    let mut off = 0;
    while off < total {
        let len = (total - off).min(MAX_CHUNK_BYTES);
        chunks.push(Value::binary_owned(shared.clone(), off, len));
        off += len;
    }
    build_balanced(&chunks)
}

fn build_balanced(chunks: &[Value]) -> Value {
    match chunks.len() {
        0 => Value::Leaf,
        1 => chunks[0].clone(),
        n => {
            let mid = n / 2;
            let left = build_balanced(&chunks[..mid]);
            let right = build_balanced(&chunks[mid..]);
            join(left, right)
        }
    }
}

fn join(left: Value, right: Value) -> Value {
    let ll = len(&left).expect("join of non-list");
    let rl = len(&right).expect("join of non-list");
    if ll == 0 {
        return right;
    }
    if rl == 0 {
        return left;
    }
    let d = depth(&left).max(depth(&right)).saturating_add(1);
    Value::concat_node(left, right, ll, ll + rl, d)
}

/// Concatenate two lists. Merges touching small chunks and rebalances
/// when the spine grows too deep.
pub fn concat(a: Value, b: Value) -> Value {
    if is_empty(&a) {
        return b;
    }
    if is_empty(&b) {
        return a;
    }
    if let Some(merged) = merge_chunks(&a, &b) {
        return merged;
    }
    let joined = join(a, b);
    if depth(&joined) > MAX_SPINE_DEPTH {
        rebuild(&joined)
    } else {
        joined
    }
}

fn merge_chunks(a: &Value, b: &Value) -> Option<Value> {
    match (a, b) {
        (Value::Binary(x), Value::Binary(y)) if x.len + y.len <= MAX_CHUNK_BYTES => {
            let mut bytes = Vec::with_capacity(x.len + y.len);
            bytes.extend_from_slice(x.bytes());
            bytes.extend_from_slice(y.bytes());
            Some(from_bytes(&bytes))
        }
        (Value::Array(x), Value::Array(y)) if x.len + y.len <= MAX_CHUNK_VALUES => {
            let mut items = Vec::with_capacity(x.len + y.len);
            items.extend_from_slice(&x.items[x.off..x.off + x.len]);
            items.extend_from_slice(&y.items[y.off..y.off + y.len]);
            Some(from_values(items))
        }
        _ => None,
    }
}

/// Prepend one element.
pub fn cons(head: Value, tail: Value) -> Value {
    let head_chunk = match head.as_byte() {
        Some(b) if tail_is_small_binary(&tail) => {
            return merge_front_byte(b, tail);
        }
        Some(b) => from_bytes(&[b]),
        None => from_values(vec![head]),
    };
    match tail {
        Value::Leaf => head_chunk,
        Value::Concat(n) if small_chunk(&n.left) => {
            let merged = concat(head_chunk, n.left.clone());
            concat(merged, n.right.clone())
        }
        other => concat(head_chunk, other),
    }
}

fn tail_is_small_binary(tail: &Value) -> bool {
    match tail {
        Value::Binary(n) => n.len < SMALL_CHUNK_BYTES,
        Value::Concat(n) => matches!(&n.left, Value::Binary(b) if b.len < SMALL_CHUNK_BYTES),
        _ => false,
    }
}

fn merge_front_byte(b: u8, tail: Value) -> Value {
    match tail {
        Value::Binary(n) => {
            let mut bytes = Vec::with_capacity(n.len + 1);
            bytes.push(b);
            bytes.extend_from_slice(n.bytes());
            from_bytes(&bytes)
        }
        Value::Concat(n) => {
            let merged = merge_front_byte(b, n.left.clone());
            concat(merged, n.right.clone())
        }
        other => concat(from_bytes(&[b]), other),
    }
}

fn small_chunk(v: &Value) -> bool {
    match v {
        Value::Array(n) => n.len < SMALL_CHUNK_VALUES,
        Value::Binary(n) => n.len < SMALL_CHUNK_BYTES,
        _ => false,
    }
}

/// Prepend a run of elements, first element outermost.
pub fn prepend(items: Vec<Value>, tail: Value) -> Value {
    concat(from_values(items), tail)
}

/// The first `n` elements. Saturates at the list length.
pub fn take(v: &Value, n: u64) -> Value {
    let total = match len(v) {
        Some(t) => t,
        None => return v.clone(),
    };
    if n == 0 {
        return Value::Leaf;
    }
    if n >= total {
        return v.clone();
    }
    match v {
        Value::Branch(node) => {
            Value::branch(node.left.clone(), take(&node.right, n - 1))
        }
        Value::Array(node) => Value::array_slice(node.items.clone(), node.off, n as usize),
        Value::Binary(node) => slice_binary(node, 0, n as usize),
        Value::Concat(node) => {
            if n <= node.left_len {
                take(&node.left, n)
            } else {
                // Cache the prefix size rather than rebuilding the spine.
                Value::take_node(n, v.clone(), node.depth.saturating_add(1))
            }
        }
        Value::Take(node) => take(&node.source, n),
        _ => v.clone(),
    }
}

/// Everything after the first `n` elements.
pub fn drop(v: &Value, n: u64) -> Value {
    let total = match len(v) {
        Some(t) => t,
        None => return v.clone(),
    };
    if n == 0 {
        return v.clone();
    }
    if n >= total {
        return Value::Leaf;
    }
    match v {
        Value::Branch(node) => drop(&node.right, n - 1),
        Value::Array(node) => {
            Value::array_slice(node.items.clone(), node.off + n as usize, node.len - n as usize)
        }
        Value::Binary(node) => slice_binary(node, n as usize, node.len - n as usize),
        Value::Concat(node) => {
            if n >= node.left_len {
                drop(&node.right, n - node.left_len)
            } else {
                concat(drop(&node.left, n), node.right.clone())
            }
        }
        Value::Take(node) => take(&drop(&node.source, n), node.count - n),
        _ => v.clone(),
    }
}

/// Split at index `n`. `None` for non-lists or out-of-range splits.
pub fn split(v: &Value, n: u64) -> Option<(Value, Value)> {
    let total = len(v)?;
    if n > total {
        return None;
    }
    Some((take(v, n), drop(v, n)))
}

/// The element at index `i`.
pub fn index(v: &Value, i: u64) -> Option<Value> {
    let mut cur = v.clone();
    let mut i = i;
    loop {
        match cur {
            Value::Branch(n) => {
                if i == 0 {
                    return Some(n.left.clone());
                }
                i -= 1;
                cur = n.right.clone();
            }
            Value::Array(n) => {
                if (i as usize) < n.len {
                    return Some(n.items[n.off + i as usize].clone());
                }
                return None;
            }
            Value::Binary(n) => {
                if (i as usize) < n.len {
                    return Some(Value::byte(n.bytes()[i as usize]));
                }
                return None;
            }
            Value::Concat(n) => {
                if i < n.left_len {
                    cur = n.left.clone();
                } else {
                    i -= n.left_len;
                    cur = n.right.clone();
                }
            }
            Value::Take(n) => {
                if i >= n.count {
                    return None;
                }
                cur = n.source.clone();
            }
            _ => return None,
        }
    }
}

/// Reverse a list. Binaries stay binaries.
pub fn reverse(v: &Value) -> Option<Value> {
    if !v.is_list() {
        return None;
    }
    if let Some(bytes) = to_bytes(v) {
        let mut rev = bytes;
        rev.reverse();
        return Some(from_bytes(&rev));
    }
    let mut items: Vec<Value> = iter(v).collect();
    items.reverse();
    Some(from_values(items))
}

fn rebuild(v: &Value) -> Value {
    let mut chunks = Vec::new();
    let mut pending: Vec<Value> = Vec::new();
    collect_chunks(v, &mut chunks, &mut pending);
    if !pending.is_empty() {
        chunks.push(from_values(std::mem::take(&mut pending)));
    }
    build_balanced(&chunks)
}

fn collect_chunks(v: &Value, chunks: &mut Vec<Value>, pending: &mut Vec<Value>) {
    match v {
        Value::Leaf => {}
        Value::Array(_) | Value::Binary(_) => {
            if !pending.is_empty() {
                chunks.push(from_values(std::mem::take(pending)));
            }
            chunks.push(v.clone());
        }
        Value::Concat(n) => {
            collect_chunks(&n.left, chunks, pending);
            collect_chunks(&n.right, chunks, pending);
        }
        Value::Take(n) => {
            // Materialize the cached prefix before rebuilding.
            let mut inner_chunks = Vec::new();
            let mut inner_pending = Vec::new();
            collect_chunks(&n.source, &mut inner_chunks, &mut inner_pending);
            if !inner_pending.is_empty() {
                inner_chunks.push(from_values(inner_pending));
            }
            let mut remaining = n.count;
            for chunk in inner_chunks {
                if remaining == 0 {
                    break;
                }
                let clen = len(&chunk).unwrap_or(0);
                let taken = if clen <= remaining {
                    chunk
                } else {
                    take(&chunk, remaining)
                };
                remaining -= len(&taken).unwrap_or(0);
                if !pending.is_empty() {
                    chunks.push(from_values(std::mem::take(pending)));
                }
                chunks.push(taken);
            }
        }
        Value::Branch(n) => {
            pending.push(n.left.clone());
            collect_chunks(&n.right, chunks, pending);
        }
        other => {
            debug_assert!(false, "rebuild of a non-list");
            pending.push(other.clone());
        }
    }
}

/// Iterate the elements of a list.
pub fn iter(v: &Value) -> ListIter {
    ListIter {
        stack: vec![v.clone()],
        limit: None,
    }
}

pub struct ListIter {
    stack: Vec<Value>,
    limit: Option<u64>,
}

impl Iterator for ListIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        if let Some(0) = self.limit {
            return None;
        }
        loop {
            let cur = self.stack.pop()?;
            match cur {
                Value::Leaf => continue,
                other => match uncons(&other) {
                    Some((head, tail)) => {
                        self.stack.push(tail);
                        if let Some(n) = &mut self.limit {
                            *n -= 1;
                        }
                        return Some(head);
                    }
                    None => return None,
                },
            }
        }
    }
}

/// Collect a list of bytes into a vector. `None` if any element is not
/// a byte or the value is not a proper list.
pub fn to_bytes(v: &Value) -> Option<Vec<u8>> {
    let (bytes, complete) = binary_prefix(v);
    complete.then_some(bytes)
}

/// The longest valid binary prefix, plus whether the whole list was a
/// valid binary.
pub fn binary_prefix(v: &Value) -> (Vec<u8>, bool) {
    let mut out = Vec::new();
    let mut stack: Vec<(Value, Option<u64>)> = vec![(v.clone(), None)];
    while let Some((cur, limit)) = stack.pop() {
        if limit == Some(0) {
            continue;
        }
        match cur {
            Value::Leaf => continue,
            Value::Binary(n) => {
                let bytes = n.bytes();
                let end = limit.map_or(n.len, |l| (l as usize).min(n.len));
                out.extend_from_slice(&bytes[..end]);
            }
            Value::Array(n) => {
                let end = limit.map_or(n.len, |l| (l as usize).min(n.len));
                for item in &n.items[n.off..n.off + end] {
                    match item.as_byte() {
                        Some(b) => out.push(b),
                        None => return (out, false),
                    }
                }
            }
            Value::Concat(n) => {
                match limit {
                    None => {
                        stack.push((n.right.clone(), None));
                        stack.push((n.left.clone(), None));
                    }
                    Some(l) if l <= n.left_len => {
                        stack.push((n.left.clone(), Some(l)));
                    }
                    Some(l) => {
                        stack.push((n.right.clone(), Some(l - n.left_len)));
                        stack.push((n.left.clone(), None));
                    }
                }
            }
            Value::Take(n) => {
                let cap = limit.map_or(n.count, |l| l.min(n.count));
                stack.push((n.source.clone(), Some(cap)));
            }
            Value::Branch(n) => {
                match n.left.as_byte() {
                    Some(b) => out.push(b),
                    None => return (out, false),
                }
                stack.push((n.right.clone(), limit.map(|l| l - 1)));
            }
            _ => return (out, false),
        }
    }
    (out, true)
}

/// Reduce a valid binary to a single contiguous chunk, sharing the
/// existing buffer when it already is one.
pub fn flatten_binary(v: &Value) -> Option<Value> {
    match v {
        Value::Leaf => Some(Value::Leaf),
        Value::Binary(_) => Some(v.clone()),
        _ => to_bytes(v).map(|bytes| {
            let shared: Arc<[u8]> = bytes.into();
            let n = shared.len();
            Value::binary_owned(shared, 0, n)
        }),
    }
}
