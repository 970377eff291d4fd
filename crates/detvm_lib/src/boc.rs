//! Deserializer for the serialized cell-container format ("bag of cells").
//!
//! Layout: magic, a flags/ref-size byte, an offset-size byte, cell/root/absent
//! counts, total serialized size, the root index list, an optional cell index,
//! then one record per cell (two descriptor bytes, payload, child indices).
//! Child indices only point forward, so cells are materialized back to front.

use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::debug;

use crate::cell::{Cell, CellBuilder, CellSlice, MAX_CELL_REFS};

const BOC_MAGIC: u32 = 0xB5EE_9C72;

const FLAG_HAS_INDEX: u8 = 0x80;
const FLAG_HAS_CRC: u8 = 0x40;
const FLAG_HAS_CACHE_BITS: u8 = 0x20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BocError {
    #[error("bad container magic: 0x{0:08X}")]
    BadMagic(u32),

    #[error("truncated container at byte {0}")]
    Truncated(usize),

    #[error("bad size byte: ref size {0}")]
    BadRefSize(u8),

    #[error("bad size byte: offset size {0}")]
    BadOffsetSize(u8),

    #[error("cell {cell} has {refs} references")]
    TooManyRefs { cell: usize, refs: usize },

    #[error("cell {cell} references cell {target}, expected a forward index < {count}")]
    BadRefIndex { cell: usize, target: usize, count: usize },

    #[error("root index {0} out of range")]
    BadRootIndex(usize),

    #[error("container has no roots")]
    NoRoots,

    #[error("exotic cells are not supported")]
    ExoticCell,

    #[error("cell {cell} payload missing completion tag")]
    BadPayload { cell: usize },
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn get_u8(&mut self) -> Result<u8, BocError> {
        let v = *self.buf.get(self.pos).ok_or(BocError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(v)
    }

    fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], BocError> {
        if self.buf.len().saturating_sub(self.pos) < n {
            return Err(BocError::Truncated(self.pos));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn get_u32(&mut self) -> Result<u32, BocError> {
        Ok(BigEndian::read_u32(self.get_bytes(4)?))
    }

    /// Big-endian unsigned integer of 1..=8 bytes.
    fn get_var_uint(&mut self, width: usize) -> Result<u64, BocError> {
        let bytes = self.get_bytes(width)?;
        Ok(BigEndian::read_uint(bytes, width))
    }
}

/// Parse a container and return its first root as a full-cell slice.
pub fn parse(bytes: &[u8]) -> Result<CellSlice, BocError> {
    Ok(CellSlice::full(parse_root(bytes)?))
}

pub fn parse_root(bytes: &[u8]) -> Result<Rc<Cell>, BocError> {
    let mut r = ByteReader::new(bytes);

    let magic = r.get_u32()?;
    if magic != BOC_MAGIC {
        return Err(BocError::BadMagic(magic));
    }

    let b1 = r.get_u8()?;
    let has_index = b1 & FLAG_HAS_INDEX != 0;
    let _has_crc = b1 & FLAG_HAS_CRC != 0;
    let _has_cache_bits = b1 & FLAG_HAS_CACHE_BITS != 0;
    let ref_size = (b1 & 0x07) as usize;
    if !(1..=4).contains(&ref_size) {
        return Err(BocError::BadRefSize(b1 & 0x07));
    }
    let off_size = r.get_u8()? as usize;
    if !(1..=8).contains(&off_size) {
        return Err(BocError::BadOffsetSize(off_size as u8));
    }

    let cell_count = r.get_var_uint(ref_size)? as usize;
    let root_count = r.get_var_uint(ref_size)? as usize;
    let _absent = r.get_var_uint(ref_size)?;
    let _total_size = r.get_var_uint(off_size)?;

    if root_count == 0 {
        return Err(BocError::NoRoots);
    }
    // every cell record takes at least its two descriptor bytes
    if cell_count > bytes.len() / 2 {
        return Err(BocError::Truncated(bytes.len()));
    }
    let mut roots = Vec::with_capacity(root_count);
    for _ in 0..root_count {
        roots.push(r.get_var_uint(ref_size)? as usize);
    }
    if has_index {
        r.get_bytes(cell_count * off_size)?;
    }

    debug!(cells = cell_count, roots = root_count, "parsing container");

    // First pass: raw records with forward child indices.
    struct RawCell {
        data: Vec<u8>,
        bit_len: usize,
        refs: Vec<usize>,
    }
    let mut raw = Vec::with_capacity(cell_count);
    for i in 0..cell_count {
        let d1 = r.get_u8()?;
        let d2 = r.get_u8()?;
        if d1 & 0x08 != 0 {
            return Err(BocError::ExoticCell);
        }
        let ref_count = (d1 & 0x07) as usize;
        if ref_count > MAX_CELL_REFS {
            return Err(BocError::TooManyRefs { cell: i, refs: ref_count });
        }
        let data_bytes = (d2 as usize).div_ceil(2);
        let data = r.get_bytes(data_bytes)?.to_vec();
        let bit_len = if d2 % 2 == 0 {
            data_bytes * 8
        } else {
            // ragged payload: the final byte carries a completion tag
            let last = *data.last().ok_or(BocError::BadPayload { cell: i })?;
            if last == 0 {
                return Err(BocError::BadPayload { cell: i });
            }
            data_bytes * 8 - last.trailing_zeros() as usize - 1
        };
        let mut refs = Vec::with_capacity(ref_count);
        for _ in 0..ref_count {
            let target = r.get_var_uint(ref_size)? as usize;
            if target <= i || target >= cell_count {
                return Err(BocError::BadRefIndex { cell: i, target, count: cell_count });
            }
            refs.push(target);
        }
        raw.push(RawCell { data, bit_len, refs });
    }

    // Second pass, back to front: every child is already materialized.
    let mut cells: Vec<Option<Rc<Cell>>> = vec![None; cell_count];
    for i in (0..cell_count).rev() {
        let rc = &raw[i];
        let mut builder = CellBuilder::new();
        builder
            .store_raw(&rc.data, rc.bit_len)
            .map_err(|_| BocError::BadPayload { cell: i })?;
        for &target in &rc.refs {
            let child = cells[target]
                .as_ref()
                .map(Rc::clone)
                .ok_or(BocError::BadRefIndex { cell: i, target, count: cell_count })?;
            builder
                .store_ref(child)
                .map_err(|_| BocError::TooManyRefs { cell: i, refs: rc.refs.len() })?;
        }
        cells[i] = Some(Rc::new(builder.build()));
    }

    let root_idx = roots[0];
    cells
        .get(root_idx)
        .and_then(|c| c.as_ref().map(Rc::clone))
        .ok_or(BocError::BadRootIndex(root_idx))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_cell_boc(payload: &[u8], d2: u8) -> Vec<u8> {
        let mut out = vec![0xB5, 0xEE, 0x9C, 0x72];
        out.push(0x01); // no index/crc, ref size 1
        out.push(0x01); // offset size 1
        out.push(0x01); // cells
        out.push(0x01); // roots
        out.push(0x00); // absent
        out.push(2 + payload.len() as u8); // total serialized size
        out.push(0x00); // root index
        out.push(0x00); // d1: no refs, ordinary
        out.push(d2);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn parses_a_single_full_byte_cell() {
        let root = parse(&single_cell_boc(&[0xA5], 0x02)).unwrap();
        assert_eq!(root.remaining_bits(), 8);
        assert_eq!(root.peek_uint(8).unwrap(), 0xA5);
        assert_eq!(root.remaining_refs(), 0);
    }

    #[test]
    fn ragged_payload_honors_completion_tag() {
        // 0xA0 with odd d2 = 5 bits 10100
        let root = parse(&single_cell_boc(&[0xA4], 0x01)).unwrap();
        assert_eq!(root.remaining_bits(), 5);
        assert_eq!(root.peek_uint(5).unwrap(), 0b10100);
    }

    #[test]
    fn parses_parent_and_child() {
        let mut out = vec![0xB5, 0xEE, 0x9C, 0x72];
        out.push(0x01);
        out.push(0x01);
        out.push(0x02); // cells
        out.push(0x01); // roots
        out.push(0x00);
        out.push(0x06);
        out.push(0x00); // root index
        // cell 0: one ref to cell 1, no data
        out.push(0x01);
        out.push(0x00);
        out.push(0x01);
        // cell 1: one byte
        out.push(0x00);
        out.push(0x02);
        out.push(0x7F);
        let mut root = parse(&out).unwrap();
        assert_eq!(root.remaining_bits(), 0);
        assert_eq!(root.remaining_refs(), 1);
        let child = root.load_ref().unwrap();
        assert_eq!(child.peek_uint(8).unwrap(), 0x7F);
    }

    #[test]
    fn rejects_bad_magic() {
        let err = parse(&[0, 1, 2, 3, 4, 5]).unwrap_err();
        assert_eq!(err, BocError::BadMagic(0x00010203));
    }

    #[test]
    fn rejects_backward_reference() {
        let mut out = vec![0xB5, 0xEE, 0x9C, 0x72];
        out.push(0x01);
        out.push(0x01);
        out.push(0x01);
        out.push(0x01);
        out.push(0x00);
        out.push(0x03);
        out.push(0x00);
        out.push(0x01); // one ref...
        out.push(0x00);
        out.push(0x00); // ...pointing at itself
        assert!(matches!(parse(&out), Err(BocError::BadRefIndex { .. })));
    }

    #[test]
    fn rejects_truncated_input() {
        let good = single_cell_boc(&[0xA5], 0x02);
        assert!(matches!(parse(&good[..good.len() - 1]), Err(BocError::Truncated(_))));
    }
}
