//! Catalog-driven opcode decoder.
//!
//! Matching walks candidate prefix lengths from shortest to longest; a
//! matched entry with a range check must also see its post-prefix bits fall
//! inside the declared range, otherwise the search continues at the next
//! length. Operands are then loaded in declaration order, so later operands
//! can take their lengths from earlier ones.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use num_bigint::BigInt;
use thiserror::Error;

use crate::cell::{CellError, CellSlice};
use crate::ir::IrFunction;
use crate::spec::{Catalog, Instruction, OperandSpec};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("no instruction matches the next bits")]
    PrefixNotFound,

    #[error("operand `{name}` failed to load: {source}")]
    OperandLoad { name: String, source: CellError },

    #[error("operand `{operand}` takes its length from unknown operand `{var}`")]
    BadLengthVar { operand: String, var: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperandValue {
    Int(i64),
    BigInt(BigInt),
    Slice(CellSlice),
    Ref(CellSlice),
    /// Continuation operands are re-written to their lifted form.
    Cont(Rc<IrFunction>),
}

impl OperandValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            OperandValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for OperandValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperandValue::Int(v) => write!(f, "{v}"),
            OperandValue::BigInt(v) => write!(f, "{v}"),
            OperandValue::Slice(s) => write!(f, "{s}"),
            OperandValue::Ref(s) => write!(f, "^{s}"),
            OperandValue::Cont(_) => write!(f, "<continuation>"),
        }
    }
}

/// Decoded operand values keyed by name, in declaration order.
pub type Operands = IndexMap<String, OperandValue>;

#[derive(Debug)]
pub struct DecodedInstr<'a> {
    pub spec: &'a Instruction,
    pub operands: Operands,
}

pub struct Decoder<'a> {
    catalog: &'a Catalog,
    /// `(prefix length, prefix value)` to candidate instruction indices, in
    /// catalog order.
    table: HashMap<(usize, u64), Vec<usize>>,
    max_prefix_len: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        let mut table: HashMap<(usize, u64), Vec<usize>> = HashMap::new();
        let mut max_prefix_len = 0;
        for (idx, instr) in catalog.instructions.iter().enumerate() {
            let prefix = &instr.bytecode.prefix;
            let len = prefix.len();
            let value = prefix.chars().fold(0u64, |acc, c| (acc << 1) | (c == '1') as u64);
            table.entry((len, value)).or_default().push(idx);
            max_prefix_len = max_prefix_len.max(len);
        }
        Self { catalog, table, max_prefix_len }
    }

    pub fn catalog(&self) -> &'a Catalog {
        self.catalog
    }

    /// Decode one instruction, advancing the cursor past its prefix and
    /// operands exactly.
    pub fn next_instruction(&self, cursor: &mut CellSlice) -> Result<DecodedInstr<'a>, DecodeError> {
        let spec = self.match_prefix(cursor)?;
        cursor
            .skip(spec.bytecode.prefix.len())
            .map_err(|source| DecodeError::OperandLoad { name: "<prefix>".into(), source })?;

        let mut operands = Operands::new();
        for op in &spec.bytecode.operands {
            let value = self.load_operand(op, &operands, cursor)?;
            operands.insert(op.name().to_string(), value);
        }
        Ok(DecodedInstr { spec, operands })
    }

    fn match_prefix(&self, cursor: &CellSlice) -> Result<&'a Instruction, DecodeError> {
        let limit = self.max_prefix_len.min(cursor.remaining_bits());
        for len in 1..=limit {
            let value = match cursor.peek_uint(len) {
                Ok(v) => v,
                Err(_) => break,
            };
            let Some(candidates) = self.table.get(&(len, value)) else {
                continue;
            };
            for &idx in candidates {
                let instr = &self.catalog.instructions[idx];
                if let Some(check) = &instr.bytecode.operands_range_check {
                    let probe = match cursor.peek_uint_at(len, check.length) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    if !(check.from..=check.to).contains(&probe) {
                        continue;
                    }
                }
                return Ok(instr);
            }
        }
        Err(DecodeError::PrefixNotFound)
    }

    fn load_operand(
        &self,
        op: &OperandSpec,
        earlier: &Operands,
        cursor: &mut CellSlice,
    ) -> Result<OperandValue, DecodeError> {
        let fail = |source: CellError| DecodeError::OperandLoad { name: op.name().to_string(), source };
        match op {
            OperandSpec::Uint { size, .. } => {
                Ok(OperandValue::Int(cursor.load_uint(*size).map_err(fail)? as i64))
            }
            OperandSpec::Int { size, .. } => {
                Ok(OperandValue::Int(cursor.load_int(*size).map_err(fail)?))
            }
            OperandSpec::Ref { .. } => Ok(OperandValue::Ref(cursor.load_ref().map_err(fail)?)),
            OperandSpec::LongInt { .. } => {
                let len = cursor.load_uint(5).map_err(fail)? as usize;
                Ok(OperandValue::BigInt(cursor.load_bigint(8 * len + 19).map_err(fail)?))
            }
            OperandSpec::Subslice {
                bits_length_var,
                bits_padding,
                refs_length_var,
                refs_add,
                completion_tag,
                ..
            } => {
                let bits = bits_padding + 8 * self.length_var(op, bits_length_var, earlier)?;
                let refs = refs_add + self.length_var(op, refs_length_var, earlier)?;
                Ok(OperandValue::Slice(
                    cursor.load_subslice(bits, refs, *completion_tag).map_err(fail)?,
                ))
            }
        }
    }

    fn length_var(
        &self,
        op: &OperandSpec,
        var: &Option<String>,
        earlier: &Operands,
    ) -> Result<usize, DecodeError> {
        let Some(var) = var else { return Ok(0) };
        earlier
            .get(var)
            .and_then(OperandValue::as_int)
            .map(|v| v.max(0) as usize)
            .ok_or_else(|| DecodeError::BadLengthVar {
                operand: op.name().to_string(),
                var: var.clone(),
            })
    }
}
