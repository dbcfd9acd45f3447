//! Builtin primitive definitions.
//!
//! `ns_load_prims` binds these below a prefix (`%` by convention) so
//! namespace programs and clients can reach the core data operations
//! by name. Predicates push `inr ()` for true and `inl ()` for false.

use std::sync::Arc;

use crate::dict;
use crate::errors::GlasError;
use crate::namespace::{Def, NativeProg};
use crate::rope;
use crate::shrub;
use crate::thread::Glas;
use crate::value::{bin_of_bits, bits_of_bin, invert_bits, uint_peek, Value};

fn push_bool(g: &mut Glas, b: bool) {
    g.push(if b {
        Value::inr(Value::Leaf)
    } else {
        Value::inl(Value::Leaf)
    });
}

fn pop_bool(g: &mut Glas) -> Result<bool, GlasError> {
    let v = g.pop();
    if v.is_inr() {
        Ok(true)
    } else if v.is_inl() {
        Ok(false)
    } else {
        g.push(v);
        Err(GlasError::data_type("expected a boolean"))
    }
}

fn prim_copy(g: &mut Glas) -> Result<(), GlasError> {
    g.data_copy(1, false)
}

fn prim_drop(g: &mut Glas) -> Result<(), GlasError> {
    g.data_drop(1, false)
}

fn prim_swap(g: &mut Glas) -> Result<(), GlasError> {
    g.data_move("ab-ba", false)
}

fn prim_eq(g: &mut Glas) -> Result<(), GlasError> {
    let b = g.pop();
    let a = g.pop();
    push_bool(g, a == b);
    Ok(())
}

fn prim_mkp(g: &mut Glas) -> Result<(), GlasError> {
    g.mkp()
}

fn prim_unp(g: &mut Glas) -> Result<(), GlasError> {
    g.unp()
}

fn prim_mkl(g: &mut Glas) -> Result<(), GlasError> {
    g.mkl()
}

fn prim_unl(g: &mut Glas) -> Result<(), GlasError> {
    g.unl()
}

fn prim_mkr(g: &mut Glas) -> Result<(), GlasError> {
    g.mkr()
}

fn prim_unr(g: &mut Glas) -> Result<(), GlasError> {
    g.unr()
}

fn prim_is_unit(g: &mut Glas) -> Result<(), GlasError> {
    let v = g.pop();
    push_bool(g, v.is_unit());
    Ok(())
}

fn prim_is_pair(g: &mut Glas) -> Result<(), GlasError> {
    let v = g.pop();
    push_bool(g, v.is_pair());
    Ok(())
}

fn prim_is_inl(g: &mut Glas) -> Result<(), GlasError> {
    let v = g.pop();
    push_bool(g, v.is_inl());
    Ok(())
}

fn prim_is_inr(g: &mut Glas) -> Result<(), GlasError> {
    let v = g.pop();
    push_bool(g, v.is_inr());
    Ok(())
}

fn prim_is_list(g: &mut Glas) -> Result<(), GlasError> {
    let v = g.pop();
    push_bool(g, v.is_list());
    Ok(())
}

fn prim_is_binary(g: &mut Glas) -> Result<(), GlasError> {
    let v = g.pop();
    push_bool(g, v.is_binary());
    Ok(())
}

fn prim_is_bits(g: &mut Glas) -> Result<(), GlasError> {
    let v = g.pop();
    push_bool(g, v.is_bitstring());
    Ok(())
}

fn prim_is_dict(g: &mut Glas) -> Result<(), GlasError> {
    let v = g.pop();
    push_bool(g, v.is_dict());
    Ok(())
}

fn prim_is_rat(g: &mut Glas) -> Result<(), GlasError> {
    let v = g.pop();
    push_bool(g, v.is_rational());
    Ok(())
}

fn prim_length(g: &mut Glas) -> Result<(), GlasError> {
    let v = g.pop();
    match rope::len(&v) {
        Some(n) => {
            g.push(v);
            g.u64_push(n);
            Ok(())
        }
        None => {
            g.push(v);
            Err(GlasError::data_type("length of a non-list"))
        }
    }
}

/// `list n -- prefix suffix`
fn prim_split(g: &mut Glas) -> Result<(), GlasError> {
    let n = uint_peek(&g.pop())?;
    let v = g.pop();
    match rope::split(&v, n) {
        Some((front, back)) => {
            g.push(front);
            g.push(back);
            Ok(())
        }
        None => {
            g.push(v);
            Err(GlasError::data_qty("split index out of range"))
        }
    }
}

fn prim_append(g: &mut Glas) -> Result<(), GlasError> {
    let b = g.pop();
    let a = g.pop();
    if !a.is_list() || !b.is_list() {
        let err = GlasError::data_type("append expects two lists");
        g.push(a);
        g.push(b);
        return Err(err);
    }
    g.push(rope::concat(a, b));
    Ok(())
}

fn prim_reverse(g: &mut Glas) -> Result<(), GlasError> {
    let v = g.pop();
    match rope::reverse(&v) {
        Some(r) => {
            g.push(r);
            Ok(())
        }
        None => {
            g.push(v);
            Err(GlasError::data_type("reverse of a non-list"))
        }
    }
}

fn prim_invert(g: &mut Glas) -> Result<(), GlasError> {
    let v = g.pop();
    match invert_bits(&v) {
        Ok(r) => {
            g.push(r);
            Ok(())
        }
        Err(e) => {
            g.push(v);
            Err(e)
        }
    }
}

fn prim_bits_to_bin(g: &mut Glas) -> Result<(), GlasError> {
    let v = g.pop();
    match bin_of_bits(&v) {
        Ok(r) => {
            g.push(r);
            Ok(())
        }
        Err(e) => {
            g.push(v);
            Err(e)
        }
    }
}

fn prim_bin_to_bits(g: &mut Glas) -> Result<(), GlasError> {
    let v = g.pop();
    match bits_of_bin(&v) {
        Ok(r) => {
            g.push(r);
            Ok(())
        }
        Err(e) => {
            g.push(v);
            Err(e)
        }
    }
}

/// `record label item -- record'`
fn prim_dict_insert(g: &mut Glas) -> Result<(), GlasError> {
    let item = g.pop();
    let label_v = g.pop();
    let record = g.pop();
    let label = match rope::to_bytes(&label_v) {
        Some(bytes) => bytes,
        None => {
            g.push(record);
            g.push(label_v);
            g.push(item);
            return Err(GlasError::data_type("record label must be a binary"));
        }
    };
    match dict::insert(&record, &label, item.clone()) {
        Ok(updated) => {
            g.push(updated);
            Ok(())
        }
        Err(e) => {
            g.push(record);
            g.push(label_v);
            g.push(item);
            Err(e)
        }
    }
}

/// `record label -- item record'`
fn prim_dict_remove(g: &mut Glas) -> Result<(), GlasError> {
    let label_v = g.pop();
    let record = g.pop();
    let label = match rope::to_bytes(&label_v) {
        Some(bytes) => bytes,
        None => {
            g.push(record);
            g.push(label_v);
            return Err(GlasError::data_type("record label must be a binary"));
        }
    };
    match dict::remove(&record, &label)? {
        Some((item, rest)) => {
            g.push(item);
            g.push(rest);
            Ok(())
        }
        None => {
            g.push(record);
            g.push(label_v);
            Err(GlasError::data_qty("record label absent"))
        }
    }
}

fn prim_shrub_enc(g: &mut Glas) -> Result<(), GlasError> {
    let v = g.pop();
    match shrub::encode(&v) {
        Ok(bytes) => {
            g.push(rope::from_bytes(&bytes));
            Ok(())
        }
        Err(e) => {
            g.push(v);
            Err(e)
        }
    }
}

fn prim_shrub_dec(g: &mut Glas) -> Result<(), GlasError> {
    let v = g.pop();
    let bytes = match rope::to_bytes(&v) {
        Some(bytes) => bytes,
        None => {
            g.push(v);
            return Err(GlasError::data_type("shrub decode expects a binary"));
        }
    };
    match shrub::decode(&bytes) {
        Ok(value) => {
            g.push(value);
            Ok(())
        }
        Err(e) => {
            g.push(v);
            Err(e)
        }
    }
}

fn prim_assert(g: &mut Glas) -> Result<(), GlasError> {
    if pop_bool(g)? {
        Ok(())
    } else {
        Err(GlasError::assert("assertion primitive"))
    }
}

fn prim_fail(_g: &mut Glas) -> Result<(), GlasError> {
    Err(GlasError::error_op("explicit failure"))
}

fn prim_halt(_g: &mut Glas) -> Result<(), GlasError> {
    Err(GlasError::unrecoverable("explicit halt"))
}

const PRIMS: &[(&str, fn(&mut Glas) -> Result<(), GlasError>)] = &[
    ("copy", prim_copy),
    ("drop", prim_drop),
    ("swap", prim_swap),
    ("eq", prim_eq),
    ("mkp", prim_mkp),
    ("unp", prim_unp),
    ("mkl", prim_mkl),
    ("unl", prim_unl),
    ("mkr", prim_mkr),
    ("unr", prim_unr),
    ("is-unit", prim_is_unit),
    ("is-pair", prim_is_pair),
    ("is-inl", prim_is_inl),
    ("is-inr", prim_is_inr),
    ("is-list", prim_is_list),
    ("is-binary", prim_is_binary),
    ("is-bits", prim_is_bits),
    ("is-dict", prim_is_dict),
    ("is-rat", prim_is_rat),
    ("length", prim_length),
    ("split", prim_split),
    ("append", prim_append),
    ("reverse", prim_reverse),
    ("invert", prim_invert),
    ("bits-to-bin", prim_bits_to_bin),
    ("bin-to-bits", prim_bin_to_bits),
    ("dict-insert", prim_dict_insert),
    ("dict-remove", prim_dict_remove),
    ("shrub-enc", prim_shrub_enc),
    ("shrub-dec", prim_shrub_dec),
    ("assert", prim_assert),
    ("fail", prim_fail),
    ("halt", prim_halt),
];

/// Bind every primitive below the prefix.
pub fn install(g: &mut Glas, prefix: &str) -> Result<(), GlasError> {
    let mut ns = g.namespace().clone();
    for (name, run) in PRIMS.iter().copied() {
        ns = ns.define(
            &format!("{}{}", prefix, name),
            Def::Native(Arc::new(NativeProg { name, run })),
        )?;
    }
    g.replace_namespace(ns);
    Ok(())
}
