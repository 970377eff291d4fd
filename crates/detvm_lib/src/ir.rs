//! Dataflow IR produced by the lifter and consumed by the passes and the
//! printer. Inputs, operands and outputs are ordered lists of `(name, value)`
//! pairs; declaration order is meaningful and must survive transformation.

use std::collections::BTreeMap;
use std::rc::Rc;

use num_bigint::BigInt;

use crate::cell::{Cell, CellSlice};
use crate::decoder::DecodeError;
use crate::lifter::LiftError;

/// Introduces a new value identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct VarDef {
    pub id: String,
    pub value_types: Vec<String>,
}

/// Names an existing value: a formal parameter or an earlier output.
#[derive(Debug, Clone, PartialEq)]
pub struct VarRef {
    pub id: String,
    pub value_types: Vec<String>,
    /// Lifted body of the continuation this value carries, when known.
    pub cont: Option<Rc<IrFunction>>,
}

impl VarRef {
    pub fn plain(id: impl Into<String>) -> Self {
        Self { id: id.into(), value_types: Vec::new(), cont: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputArg {
    Ref(VarRef),
    /// A whole producer statement embedded at the use site.
    Inline(Box<Primitive>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    BigInt(BigInt),
    Bool(bool),
    Slice(CellSlice),
    Cell(Rc<Cell>),
    Cont(Rc<IrFunction>),
    ContMap(BTreeMap<i64, Rc<IrFunction>>),
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Primitive {
    pub mnemonic: String,
    pub category: String,
    pub inputs: Vec<(String, InputArg)>,
    pub operands: Vec<(String, Value)>,
    pub outputs: Vec<(String, VarDef)>,
}

impl Primitive {
    /// The single output definition, if there is exactly one.
    pub fn single_output(&self) -> Option<&VarDef> {
        match self.outputs.as_slice() {
            [(_, def)] => Some(def),
            _ => None,
        }
    }
}

/// One instruction kept as raw disassembly past a decompilation failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RawInstr {
    pub mnemonic: String,
    pub operands: Vec<(String, String)>,
}

/// Bits and references left undecoded after a disassembly failure.
#[derive(Debug, Clone, PartialEq)]
pub struct TailSlice {
    pub bits: usize,
    pub refs: usize,
    pub slice: CellSlice,
}

impl TailSlice {
    pub fn of(slice: &CellSlice) -> Self {
        Self { bits: slice.remaining_bits(), refs: slice.remaining_refs(), slice: slice.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct IrFunction {
    pub args: Vec<VarDef>,
    pub body: Vec<Primitive>,
    /// Stack contents at exit, bottom first.
    pub result: Vec<VarRef>,
    pub asm_tail: Vec<RawInstr>,
    pub tail_slice: Option<TailSlice>,
    pub decompile_error: Option<LiftError>,
    pub disassemble_error: Option<DecodeError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Program {
    Single { entry: IrFunction },
    Multi { methods: BTreeMap<i64, IrFunction> },
}
