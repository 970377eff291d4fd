//! Parser for dictionary cells: binary tries with edge-compressed labels.
//!
//! A node starts with a label in one of three encodings: `0` + unary length +
//! bits, `10` + binary length + bits, or `11` + bit + binary length (a run of
//! one repeated bit). Binary lengths use as many bits as needed to represent
//! the remaining key width. A node that exhausts the key is a leaf whose
//! remainder is the value; otherwise two child references continue the `0`
//! and `1` key branches.

use std::rc::Rc;

use thiserror::Error;

use crate::cell::{Cell, CellError, CellSlice};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DictError {
    #[error("dictionary cell read failed: {0}")]
    Cell(#[from] CellError),

    #[error("key width {0} not supported")]
    BadKeyWidth(usize),

    #[error("label exceeds remaining key bits")]
    LabelOverflow,
}

/// Collect every `key -> value slice` pair. Keys are read as `key_bits`-wide
/// signed integers; pairs are emitted in trie order (ascending unsigned key).
pub fn parse(root: &Rc<Cell>, key_bits: usize) -> Result<Vec<(i64, CellSlice)>, DictError> {
    if key_bits == 0 || key_bits > 64 {
        return Err(DictError::BadKeyWidth(key_bits));
    }
    let mut out = Vec::new();
    walk(CellSlice::full(Rc::clone(root)), key_bits, 0, key_bits, &mut out)?;
    Ok(out)
}

fn walk(
    mut node: CellSlice,
    total_bits: usize,
    acc: u64,
    remaining: usize,
    out: &mut Vec<(i64, CellSlice)>,
) -> Result<(), DictError> {
    let (label, label_len) = read_label(&mut node, remaining)?;
    let acc = shl(acc, label_len) | label;
    let remaining = remaining - label_len;
    if remaining == 0 {
        out.push((sign_extend(acc, total_bits), node));
        return Ok(());
    }
    let left = node.load_ref()?;
    let right = node.load_ref()?;
    walk(left, total_bits, acc << 1, remaining - 1, out)?;
    walk(right, total_bits, (acc << 1) | 1, remaining - 1, out)?;
    Ok(())
}

fn read_label(node: &mut CellSlice, max_len: usize) -> Result<(u64, usize), DictError> {
    if !node.load_bit()? {
        // unary-length form
        let mut len = 0;
        while node.load_bit()? {
            len += 1;
        }
        if len > max_len {
            return Err(DictError::LabelOverflow);
        }
        Ok((load_wide(node, len)?, len))
    } else if !node.load_bit()? {
        let len = node.load_uint(len_bits(max_len))? as usize;
        if len > max_len {
            return Err(DictError::LabelOverflow);
        }
        Ok((load_wide(node, len)?, len))
    } else {
        let bit = node.load_bit()?;
        let len = node.load_uint(len_bits(max_len))? as usize;
        if len > max_len {
            return Err(DictError::LabelOverflow);
        }
        let bits = if bit { mask(len) } else { 0 };
        Ok((bits, len))
    }
}

/// Bits needed to represent `max_len` itself.
fn len_bits(max_len: usize) -> usize {
    (usize::BITS - max_len.leading_zeros()) as usize
}

fn load_wide(node: &mut CellSlice, len: usize) -> Result<u64, DictError> {
    if len == 0 {
        return Ok(0);
    }
    Ok(node.load_uint(len)?)
}

fn mask(len: usize) -> u64 {
    u64::MAX.checked_shr(64 - len as u32).unwrap_or(0)
}

fn shl(v: u64, by: usize) -> u64 {
    v.checked_shl(by as u32).unwrap_or(0)
}

fn sign_extend(v: u64, width: usize) -> i64 {
    let shift = 64 - width;
    ((v << shift) as i64) >> shift
}
