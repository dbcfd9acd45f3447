//! End-to-end data scenarios through the host API.

use glas_core::value::{int_value, Value};
use glas_core::Glas;

#[test]
fn integer_width_checks() {
    let mut g = Glas::new();
    g.i32_push(300);
    assert!(g.i8_peek().is_err(), "300 does not fit an i8");
    // The failed peek marks the step; rewind before continuing.
    g.abort();
    g.i32_push(300);
    assert_eq!(g.i64_peek().unwrap(), 300);
    // Typed pushes promote through one encoding, so a value that fits
    // the narrow width reads back regardless of how it was pushed.
    g.abort();
    g.i32_push(42);
    assert_eq!(g.i8_peek().unwrap(), 42);
    assert_eq!(g.u8_peek().unwrap(), 42);
}

#[test]
fn narrow_peek_out_of_range() {
    let mut g = Glas::new();
    g.i64_push(i64::from(i8::MAX) + 1);
    assert!(g.i8_peek().is_err());
    g.abort();
    g.i64_push(-1);
    assert!(g.u64_peek().is_err(), "negative value peeked unsigned");
    g.abort();
    g.i64_push(-1);
    assert_eq!(g.i8_peek().unwrap(), -1);
}

#[test]
fn binary_reverse_scenario() {
    let mut g = Glas::new();
    g.binary_push(&[0x61, 0x62, 0x63]);
    let v = g.pop();
    let reversed = glas_core::rope::reverse(&v).unwrap();
    g.push(reversed);
    let (bytes, complete) = g.binary_peek_all();
    assert!(complete);
    assert_eq!(bytes, vec![0x63, 0x62, 0x61]);
}

#[test]
fn binary_peek_variants_agree() {
    let mut g = Glas::new();
    g.binary_push(b"hello world");
    assert_eq!(g.binary_peek_len(), 11);
    let mut buf = [0u8; 5];
    assert_eq!(g.binary_peek(&mut buf), 5);
    assert_eq!(&buf, b"hello");
    let pinned = g.binary_peek_pinned();
    assert!(pinned.complete);
    assert_eq!(pinned.bytes(), b"hello world");
    // The peek did not consume the stack.
    assert_eq!(g.binary_peek_len(), 11);
}

#[test]
fn partial_binary_peek_reports_incomplete() {
    let mut g = Glas::new();
    let mixed = glas_core::rope::concat(
        glas_core::rope::from_bytes(b"ok"),
        glas_core::rope::from_values(vec![Value::pair(Value::Leaf, Value::Leaf)]),
    );
    g.push(mixed);
    let (bytes, complete) = g.binary_peek_all();
    assert_eq!(bytes, b"ok");
    assert!(!complete);
    let pinned = g.binary_peek_pinned();
    assert!(!pinned.complete);
    assert_eq!(pinned.bytes(), b"ok");
}

#[test]
fn move_pattern_copies_and_drops() {
    let mut g = Glas::new();
    g.i64_push(1);
    g.i64_push(2);
    g.i64_push(3);
    // Drop the middle, duplicate the top.
    g.data_move("abc-acc", false).unwrap();
    assert_eq!(g.i64_peek().unwrap(), 3);
    let _ = g.pop();
    assert_eq!(g.i64_peek().unwrap(), 3);
    let _ = g.pop();
    assert_eq!(g.i64_peek().unwrap(), 1);
}

#[test]
fn move_pattern_rejects_malformed() {
    let mut g = Glas::new();
    g.i64_push(1);
    assert!(g.data_move("aa-a", false).is_err(), "duplicate consumed name");
    g.abort();
    g.i64_push(1);
    assert!(g.data_move("a-b", false).is_err(), "unbound produced name");
    g.abort();
    g.i64_push(1);
    assert!(g.data_move("abc", false).is_err(), "missing separator");
}

#[test]
fn stash_preserves_order() {
    let mut g = Glas::new();
    for n in 1..=4 {
        g.i64_push(n);
    }
    g.data_stash(2).unwrap();
    assert_eq!(g.i64_peek().unwrap(), 2);
    g.data_stash(-2).unwrap();
    assert_eq!(g.i64_peek().unwrap(), 4);
    let _ = g.pop();
    assert_eq!(g.i64_peek().unwrap(), 3);
}

#[test]
fn stash_underflow_is_an_error() {
    let mut g = Glas::new();
    g.i64_push(1);
    assert!(g.data_stash(2).is_err());
    assert!(!g.commit());
}

#[test]
fn xchg_moves_between_threads() {
    let mut a = Glas::new();
    let mut b = Glas::new();
    a.i64_push(1);
    a.i64_push(2);
    a.data_xchg(2, &mut b).unwrap();
    assert_eq!(b.i64_peek().unwrap(), 2);
    let _ = b.pop();
    assert_eq!(b.i64_peek().unwrap(), 1);
    assert_eq!(a.stack_depth(), 0);
    b.data_xchg(-1, &mut a).unwrap();
    assert_eq!(a.i64_peek().unwrap(), 1);
}

#[test]
fn infinite_stack_pops_unit() {
    let mut g = Glas::new();
    assert_eq!(g.pop(), Value::Leaf);
    assert!(g.commit(), "reading past the stack bottom is not an error");
}

#[test]
fn foreign_pointer_roundtrip() {
    let mut g = Glas::new();
    let marker = 0x1000 as *mut std::ffi::c_void;
    g.ptr_push(glas_core::Refct::unmanaged(marker));
    let back = g.ptr_peek().unwrap();
    assert_eq!(back.addr(), 0x1000);
    let v = g.pop();
    assert!(v.is_ephemeral());
    assert_eq!(v, v.clone());
    assert_ne!(v, int_value(0));
}
