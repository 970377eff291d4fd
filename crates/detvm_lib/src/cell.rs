//! Cells and bit-level cursors over them.
//!
//! A `Cell` is an immutable node of up to 1023 payload bits plus up to four
//! child references; cells may be shared, so the reference graph is a DAG.
//! A `CellSlice` is a read cursor over one cell. All reads are bounds-checked
//! and report `CellError` instead of panicking.

use std::fmt;
use std::rc::Rc;

use num_bigint::{BigInt, BigUint};
use thiserror::Error;

pub const MAX_CELL_BITS: usize = 1023;
pub const MAX_CELL_REFS: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CellError {
    #[error("bit underflow: requested {requested} bits, {available} available")]
    BitUnderflow { requested: usize, available: usize },

    #[error("reference underflow: no references left")]
    RefUnderflow,

    #[error("integer width {0} not supported")]
    BadWidth(usize),

    #[error("completion tag missing")]
    CompletionTagMissing,

    #[error("cell capacity exceeded ({bits} bits, {refs} refs)")]
    CellOverflow { bits: usize, refs: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cell {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Rc<Cell>>,
}

impl Cell {
    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn refs(&self) -> &[Rc<Cell>] {
        &self.refs
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn bit(&self, idx: usize) -> bool {
        (self.data[idx / 8] >> (7 - idx % 8)) & 1 != 0
    }
}

/// Read cursor over one cell: a bit window plus a reference window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellSlice {
    cell: Rc<Cell>,
    bit_pos: usize,
    bit_end: usize,
    ref_pos: usize,
    ref_end: usize,
}

impl CellSlice {
    pub fn full(cell: Rc<Cell>) -> Self {
        let bit_end = cell.bit_len;
        let ref_end = cell.refs.len();
        Self { cell, bit_pos: 0, bit_end, ref_pos: 0, ref_end }
    }

    pub fn cell(&self) -> &Rc<Cell> {
        &self.cell
    }

    pub fn remaining_bits(&self) -> usize {
        self.bit_end - self.bit_pos
    }

    pub fn remaining_refs(&self) -> usize {
        self.ref_end - self.ref_pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining_bits() == 0 && self.remaining_refs() == 0
    }

    fn check_bits(&self, requested: usize) -> Result<(), CellError> {
        let available = self.remaining_bits();
        if requested > available {
            return Err(CellError::BitUnderflow { requested, available });
        }
        Ok(())
    }

    pub fn load_bit(&mut self) -> Result<bool, CellError> {
        self.check_bits(1)?;
        let b = self.cell.bit(self.bit_pos);
        self.bit_pos += 1;
        Ok(b)
    }

    pub fn load_uint(&mut self, width: usize) -> Result<u64, CellError> {
        if width > 64 {
            return Err(CellError::BadWidth(width));
        }
        self.check_bits(width)?;
        let mut v: u64 = 0;
        for i in 0..width {
            v = (v << 1) | self.cell.bit(self.bit_pos + i) as u64;
        }
        self.bit_pos += width;
        Ok(v)
    }

    pub fn load_int(&mut self, width: usize) -> Result<i64, CellError> {
        if width == 0 || width > 64 {
            return Err(CellError::BadWidth(width));
        }
        let raw = self.load_uint(width)?;
        // sign-extend from `width` bits
        let shift = 64 - width;
        Ok(((raw << shift) as i64) >> shift)
    }

    /// Arbitrary-width signed big integer, two's complement, MSB first.
    pub fn load_bigint(&mut self, width: usize) -> Result<BigInt, CellError> {
        if width == 0 {
            return Err(CellError::BadWidth(width));
        }
        self.check_bits(width)?;
        let mut mag = BigUint::default();
        for i in 0..width {
            mag = (mag << 1u8) + self.cell.bit(self.bit_pos + i) as u8;
        }
        self.bit_pos += width;
        let mut v = BigInt::from(mag);
        if self.cell.bit(self.bit_pos - width) {
            v -= BigInt::from(1u8) << width;
        }
        Ok(v)
    }

    pub fn peek_uint(&self, width: usize) -> Result<u64, CellError> {
        self.clone().load_uint(width)
    }

    /// Peek an unsigned integer starting `skip` bits past the cursor.
    pub fn peek_uint_at(&self, skip: usize, width: usize) -> Result<u64, CellError> {
        let mut probe = self.clone();
        probe.skip(skip)?;
        probe.load_uint(width)
    }

    pub fn skip(&mut self, width: usize) -> Result<(), CellError> {
        self.check_bits(width)?;
        self.bit_pos += width;
        Ok(())
    }

    /// Consume the next reference and open it as a fresh full-cell slice.
    pub fn load_ref(&mut self) -> Result<CellSlice, CellError> {
        Ok(CellSlice::full(self.load_ref_cell()?))
    }

    pub fn load_ref_cell(&mut self) -> Result<Rc<Cell>, CellError> {
        if self.ref_pos >= self.ref_end {
            return Err(CellError::RefUnderflow);
        }
        let cell = Rc::clone(&self.cell.refs[self.ref_pos]);
        self.ref_pos += 1;
        Ok(cell)
    }

    /// Take `bits` bits and `refs` references and repackage them as a
    /// standalone slice. With `strip_tag` the payload must end in a completion
    /// tag (a final `1` followed by zeroes), which is removed.
    pub fn load_subslice(
        &mut self,
        bits: usize,
        refs: usize,
        strip_tag: bool,
    ) -> Result<CellSlice, CellError> {
        self.check_bits(bits)?;
        if refs > self.remaining_refs() {
            return Err(CellError::RefUnderflow);
        }
        let mut builder = CellBuilder::new();
        for i in 0..bits {
            builder.store_bit(self.cell.bit(self.bit_pos + i))?;
        }
        self.bit_pos += bits;
        for _ in 0..refs {
            builder.store_ref(self.load_ref_cell()?)?;
        }
        if strip_tag {
            builder.strip_completion_tag()?;
        }
        Ok(CellSlice::full(Rc::new(builder.build())))
    }

    /// Remaining payload bits as a fresh bit vector, MSB-aligned.
    fn remaining_data(&self) -> (Vec<u8>, usize) {
        let len = self.remaining_bits();
        let mut out = vec![0u8; len.div_ceil(8)];
        for i in 0..len {
            if self.cell.bit(self.bit_pos + i) {
                out[i / 8] |= 1 << (7 - i % 8);
            }
        }
        (out, len)
    }
}

/// Remaining bits in the conventional hex form: nibble-aligned via a
/// completion tag, with a trailing `_` marking the padded case.
impl fmt::Display for CellSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (mut data, len) = self.remaining_data();
        write!(f, "x{{")?;
        if len % 4 == 0 {
            for i in 0..len / 4 {
                let nibble = (data[i / 2] >> (4 - 4 * (i % 2))) & 0xF;
                write!(f, "{nibble:X}")?;
            }
        } else {
            // append the completion tag, then print whole nibbles
            let tagged = len + 1;
            if tagged > data.len() * 8 {
                data.push(0);
            }
            data[len / 8] |= 1 << (7 - len % 8);
            for i in 0..tagged.div_ceil(4) {
                let nibble = (data[i / 2] >> (4 - 4 * (i % 2))) & 0xF;
                write!(f, "{nibble:X}")?;
            }
            write!(f, "_")?;
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Clone, Default)]
pub struct CellBuilder {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Rc<Cell>>,
}

impl CellBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn store_bit(&mut self, bit: bool) -> Result<&mut Self, CellError> {
        if self.bit_len >= MAX_CELL_BITS {
            return Err(CellError::CellOverflow { bits: self.bit_len + 1, refs: self.refs.len() });
        }
        if self.bit_len % 8 == 0 {
            self.data.push(0);
        }
        if bit {
            self.data[self.bit_len / 8] |= 1 << (7 - self.bit_len % 8);
        }
        self.bit_len += 1;
        Ok(self)
    }

    pub fn store_uint(&mut self, value: u64, width: usize) -> Result<&mut Self, CellError> {
        if width > 64 {
            return Err(CellError::BadWidth(width));
        }
        for i in (0..width).rev() {
            self.store_bit((value >> i) & 1 != 0)?;
        }
        Ok(self)
    }

    pub fn store_int(&mut self, value: i64, width: usize) -> Result<&mut Self, CellError> {
        self.store_uint(value as u64 & u64::MAX.checked_shr(64 - width as u32).unwrap_or(u64::MAX), width)
    }

    pub fn store_bigint(&mut self, value: &BigInt, width: usize) -> Result<&mut Self, CellError> {
        let modulus = BigInt::from(1u8) << width;
        let mut v = value.clone();
        if v.sign() == num_bigint::Sign::Minus {
            v += &modulus;
        }
        for i in (0..width).rev() {
            let bit = (v.clone() >> i) & BigInt::from(1u8) != BigInt::from(0u8);
            self.store_bit(bit)?;
        }
        Ok(self)
    }

    pub fn store_raw(&mut self, data: &[u8], bits: usize) -> Result<&mut Self, CellError> {
        for i in 0..bits {
            self.store_bit((data[i / 8] >> (7 - i % 8)) & 1 != 0)?;
        }
        Ok(self)
    }

    pub fn store_slice(&mut self, slice: &CellSlice) -> Result<&mut Self, CellError> {
        let (data, bits) = slice.remaining_data();
        self.store_raw(&data, bits)?;
        let mut probe = slice.clone();
        while probe.remaining_refs() > 0 {
            let cell = probe.load_ref_cell()?;
            self.store_ref(cell)?;
        }
        Ok(self)
    }

    pub fn store_ref(&mut self, cell: Rc<Cell>) -> Result<&mut Self, CellError> {
        if self.refs.len() >= MAX_CELL_REFS {
            return Err(CellError::CellOverflow { bits: self.bit_len, refs: self.refs.len() + 1 });
        }
        self.refs.push(cell);
        Ok(self)
    }

    /// Remove a trailing completion tag: the last `1` bit and everything after.
    pub fn strip_completion_tag(&mut self) -> Result<&mut Self, CellError> {
        let mut idx = self.bit_len;
        loop {
            if idx == 0 {
                return Err(CellError::CompletionTagMissing);
            }
            idx -= 1;
            if (self.data[idx / 8] >> (7 - idx % 8)) & 1 != 0 {
                break;
            }
        }
        self.bit_len = idx;
        self.data.truncate(idx.div_ceil(8));
        if idx % 8 != 0 {
            let keep = idx % 8;
            let last = self.data.len() - 1;
            self.data[last] &= 0xFFu8 << (8 - keep);
        }
        Ok(self)
    }

    pub fn build(self) -> Cell {
        Cell { data: self.data, bit_len: self.bit_len, refs: self.refs }
    }

    pub fn build_slice(self) -> CellSlice {
        CellSlice::full(Rc::new(self.build()))
    }
}
