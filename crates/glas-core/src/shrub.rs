//! The shrub wire codec.
//!
//! Trees serialize to a stream of two-bit operations: `00` leaf, `01`
//! branch (left then right), `1x` a stem bit `x`. The stream packs
//! most significant bits first; a decoder accepts trailing zero
//! padding after one complete tree and rejects anything else.

use crate::bits::BitBuilder;
use crate::errors::GlasError;
use crate::value::{Ev, Value, Walker};

/// Serialize a tree. Sealed data and foreign pointers have no wire
/// form and fail with a type error.
pub fn encode(v: &Value) -> Result<Vec<u8>, GlasError> {
    let mut out = Vec::new();
    let mut acc: u8 = 0;
    let mut filled: u8 = 0;
    for ev in Walker::new(v) {
        let sym = match ev {
            Ev::Leaf => 0u8,
            Ev::Pair => 1,
            Ev::Bit(false) => 2,
            Ev::Bit(true) => 3,
            Ev::SealKey(_) => {
                return Err(GlasError::data_type("cannot encode sealed data"));
            }
            Ev::ForeignPtr(_) => {
                return Err(GlasError::data_type("cannot encode a foreign pointer"));
            }
        };
        acc = (acc << 2) | sym;
        filled += 1;
        if filled == 4 {
            out.push(acc);
            acc = 0;
            filled = 0;
        }
    }
    if filled > 0 {
        out.push(acc << (2 * (4 - filled)));
    }
    Ok(out)
}

struct Frame {
    pending: BitBuilder,
    left: Option<Value>,
}

/// Decode one tree from a byte stream.
pub fn decode(bytes: &[u8]) -> Result<Value, GlasError> {
    let mut syms = bytes
        .iter()
        .flat_map(|b| (0..4).rev().map(move |i| (b >> (2 * i)) & 0b11));
    let mut stack: Vec<Frame> = Vec::new();
    let mut pending = BitBuilder::new();
    let done = loop {
        let sym = syms
            .next()
            .ok_or_else(|| GlasError::data_type("truncated shrub stream"))?;
        match sym {
            0b10 | 0b11 => {
                pending.push(sym & 1 == 1);
                continue;
            }
            0b01 => {
                stack.push(Frame {
                    pending: std::mem::take(&mut pending),
                    left: None,
                });
                continue;
            }
            _ => {} // 0b00: leaf
        }
        let mut v = Some(Value::stem_chain(&std::mem::take(&mut pending).stems(), Value::Leaf));
        let mut settled = false;
        while let Some(frame) = stack.last_mut() {
            if frame.left.is_none() {
                frame.left = v.take();
                settled = true;
                break;
            }
            let frame = stack.pop().expect("frame present");
            let left = frame.left.expect("left subtree present");
            v = Some(Value::stem_chain(
                &frame.pending.stems(),
                Value::branch(left, v.take().expect("value present")),
            ));
        }
        if !settled {
            break v.expect("value present");
        }
    };
    if syms.any(|sym| sym != 0) {
        return Err(GlasError::data_type("garbage after shrub tree"));
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rope;
    use crate::value::int_value;

    fn roundtrip(v: &Value) {
        let bytes = encode(v).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(&back, v);
    }

    #[test]
    fn leaf_is_one_zero_byte() {
        assert_eq!(encode(&Value::Leaf).unwrap(), vec![0]);
        assert_eq!(decode(&[0]).unwrap(), Value::Leaf);
    }

    #[test]
    fn roundtrip_shapes() {
        roundtrip(&Value::Leaf);
        roundtrip(&int_value(42));
        roundtrip(&int_value(-7));
        roundtrip(&Value::pair(int_value(1), int_value(2)));
        roundtrip(&Value::inl(Value::pair(Value::Leaf, int_value(-1))));
        roundtrip(&rope::from_bytes(b"hello shrub"));
    }

    #[test]
    fn optimized_lists_decode_as_spines() {
        let list = rope::concat(rope::from_bytes(b"ab"), rope::from_bytes(b"cd"));
        let bytes = encode(&list).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(back, rope::from_bytes(b"abcd"));
    }

    #[test]
    fn trailing_zero_padding_ignored() {
        let mut bytes = encode(&int_value(5)).unwrap();
        bytes.push(0);
        bytes.push(0);
        assert_eq!(decode(&bytes).unwrap(), int_value(5));
    }

    #[test]
    fn nonzero_tail_rejected() {
        let mut bytes = encode(&int_value(5)).unwrap();
        bytes.push(0x40);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn truncated_stream_rejected() {
        // Four nested branch opens with no subtrees in sight.
        assert!(decode(&[0b0101_0101]).is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn padding_reads_as_units_only_after_completion() {
        // `01 00 00 00` is a complete pair of units, not padding.
        assert_eq!(
            decode(&[0b0100_0000]).unwrap(),
            Value::pair(Value::Leaf, Value::Leaf)
        );
    }
}
