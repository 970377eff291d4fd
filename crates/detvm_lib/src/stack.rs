//! Symbolic operand stack.
//!
//! The lifter never sees concrete values: the stack holds opaque identifiers,
//! and stack-category instructions are replayed as sequences of four primitive
//! moves (`xchg`, `blkpush`, `blkpop`, `reverse`). Indices count from the top,
//! zero-based.
//!
//! When an instruction's declared outputs differ between runtime arms, a
//! guard is installed at the current top. Values pushed afterwards stay
//! freely usable above the boundary; reaching below it fails until every arm
//! has accumulated the same number of pending slots, at which point the arms
//! collapse into merged identifiers inserted at the boundary.

use std::rc::Rc;

use crate::decoder::{OperandValue, Operands};
use crate::ir::IrFunction;

/// Per-run allocator for value identifiers. Owning it per decompilation keeps
/// independent runs reproducible.
#[derive(Debug, Default)]
pub struct Namer {
    next_var: usize,
    next_arg: usize,
}

impl Namer {
    pub fn fresh_var(&mut self) -> String {
        let id = format!("var{}", self.next_var);
        self.next_var += 1;
        id
    }

    pub fn fresh_arg(&mut self) -> String {
        let id = format!("arg{}", self.next_arg);
        self.next_arg += 1;
        id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StackValue {
    pub id: String,
    /// Lifted continuation carried by this value, when it was produced by a
    /// continuation-pushing instruction.
    pub cont: Option<Rc<IrFunction>>,
}

impl StackValue {
    fn plain(id: String) -> Self {
        Self { id, cont: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    /// Missing entries below the current bottom.
    Underflow(usize),
    GuardUnresolved,
}

#[derive(Debug, Clone, PartialEq)]
struct Guard {
    /// Number of freely accessible entries above the boundary.
    depth: usize,
    arms: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SymbolicStack {
    /// Bottom first.
    values: Vec<StackValue>,
    guard: Option<Guard>,
}

impl SymbolicStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drain into the exit list, bottom first.
    pub fn into_values(self) -> Vec<StackValue> {
        self.values
    }

    pub fn pop(&mut self) -> Result<StackValue, StackError> {
        if let Some(guard) = &mut self.guard {
            if guard.depth == 0 {
                return Err(StackError::GuardUnresolved);
            }
            guard.depth -= 1;
        }
        self.values.pop().ok_or(StackError::Underflow(1))
    }

    /// Push a freshly named value.
    pub fn push(&mut self, namer: &mut Namer) -> StackValue {
        let value = StackValue::plain(namer.fresh_var());
        self.push_value(value.clone());
        value
    }

    pub fn push_value(&mut self, value: StackValue) {
        if let Some(guard) = &mut self.guard {
            guard.depth += 1;
        }
        self.values.push(value);
    }

    /// Attach a lifted continuation to the most recent value named `id`.
    pub fn attach_cont(&mut self, id: &str, cont: Rc<IrFunction>) {
        if let Some(v) = self.values.iter_mut().rev().find(|v| v.id == id) {
            v.cont = Some(cont);
        }
    }

    /// Synthesize `count` parameters below the current bottom. Identifiers
    /// increase top-down within the block, so the deepest slot gets the
    /// highest number; the returned list is in increasing order.
    pub fn insert_args_at_bottom(&mut self, count: usize, namer: &mut Namer) -> Vec<StackValue> {
        let fresh: Vec<StackValue> =
            (0..count).map(|_| StackValue::plain(namer.fresh_arg())).collect();
        self.values.splice(0..0, fresh.iter().rev().cloned());
        fresh
    }

    fn resolve(&self, depth: usize) -> Result<usize, StackError> {
        if let Some(guard) = &self.guard {
            if depth >= guard.depth {
                return Err(StackError::GuardUnresolved);
            }
        }
        if depth >= self.values.len() {
            return Err(StackError::Underflow(depth + 1 - self.values.len()));
        }
        Ok(self.values.len() - 1 - depth)
    }

    fn xchg(&mut self, i: usize, j: usize) -> Result<(), StackError> {
        let a = self.resolve(i.max(j))?;
        let b = self.resolve(i.min(j))?;
        self.values.swap(a, b);
        Ok(())
    }

    fn blkpush(&mut self, n: usize, j: usize) -> Result<(), StackError> {
        for _ in 0..n {
            let pos = self.resolve(j)?;
            let copy = self.values[pos].clone();
            self.push_value(copy);
        }
        Ok(())
    }

    fn blkpop(&mut self, n: usize, j: usize) -> Result<(), StackError> {
        for _ in 0..n {
            self.xchg(0, j)?;
            self.pop()?;
        }
        Ok(())
    }

    /// Reverse the `n` entries occupying depths `j ..= j + n - 1`.
    fn reverse(&mut self, n: usize, j: usize) -> Result<(), StackError> {
        if n < 2 {
            if n == 1 {
                self.resolve(j)?;
            }
            return Ok(());
        }
        let deepest = self.resolve(j + n - 1)?;
        self.values[deepest..deepest + n].reverse();
        Ok(())
    }

    pub fn exec(&mut self, op: ShuffleOp) -> Result<(), StackError> {
        match op {
            ShuffleOp::Xchg(i, j) => self.xchg(i, j),
            ShuffleOp::BlkPush(n, j) => self.blkpush(n, j),
            ShuffleOp::BlkPop(n, j) => self.blkpop(n, j),
            ShuffleOp::Reverse(n, j) => self.reverse(n, j),
        }
    }

    pub fn has_guard(&self) -> bool {
        self.guard.is_some()
    }

    /// Install a guard, or tighten the existing one to the most restrictive
    /// depth and resize it to `arm_count` arms.
    pub fn ensure_guard(&mut self, depth_from_top: usize, arm_count: usize) {
        match &mut self.guard {
            Some(guard) => {
                guard.depth = guard.depth.min(depth_from_top);
                guard.arms.resize(arm_count, Vec::new());
            }
            None => {
                self.guard = Some(Guard { depth: depth_from_top, arms: vec![Vec::new(); arm_count] });
            }
        }
    }

    pub fn append_to_guard_arm(&mut self, arm: usize, ids: Vec<String>) {
        if let Some(guard) = &mut self.guard {
            if let Some(pending) = guard.arms.get_mut(arm) {
                pending.extend(ids);
            }
        }
    }

    /// Succeeds only when every arm carries the same number of pending slots;
    /// the merged values land at the boundary, below the available region.
    pub fn try_finalize_guard(&mut self, namer: &mut Namer) -> Option<Vec<StackValue>> {
        let (depth, count) = {
            let guard = self.guard.as_ref()?;
            let count = guard.arms.first().map(Vec::len).unwrap_or(0);
            if !guard.arms.iter().all(|arm| arm.len() == count) {
                return None;
            }
            (guard.depth, count)
        };
        let boundary = self.values.len() - depth;
        let merged: Vec<StackValue> =
            (0..count).map(|_| StackValue::plain(namer.fresh_var())).collect();
        self.values.splice(boundary..boundary, merged.iter().cloned());
        self.guard = None;
        Some(merged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShuffleOp {
    Xchg(usize, usize),
    BlkPush(usize, usize),
    BlkPop(usize, usize),
    Reverse(usize, usize),
}

fn int(operands: &Operands, name: &str) -> Option<usize> {
    operands.get(name).and_then(OperandValue::as_int).map(|v| v.max(0) as usize)
}

/// Per-mnemonic decomposition of the stack-category instructions into the
/// four primitive moves. Returns `None` for mnemonics with no decomposition
/// (including any with stack-dependent shapes).
pub fn decompose(mnemonic: &str, operands: &Operands) -> Option<Vec<ShuffleOp>> {
    use ShuffleOp::*;
    let i = || int(operands, "i");
    let j = || int(operands, "j");
    let k = || int(operands, "k");
    let ops = match mnemonic {
        "NOP" => vec![],
        "XCHG_0I" | "XCHG_0I_LONG" => vec![Xchg(0, i()?)],
        "XCHG_1I" => vec![Xchg(1, i()?)],
        "XCHG_IJ" => vec![Xchg(i()?, j()?)],
        "PUSH" | "PUSH_LONG" => vec![BlkPush(1, i()?)],
        "POP" | "POP_LONG" => vec![BlkPop(1, i()?)],
        "XCHG2" => vec![Xchg(1, i()?), Xchg(0, j()?)],
        "XCHG3" => vec![Xchg(2, i()?), Xchg(1, j()?), Xchg(0, k()?)],
        "XCPU" => vec![Xchg(0, i()?), BlkPush(1, j()?)],
        "PUXC" => vec![BlkPush(1, i()?), Xchg(0, 1), Xchg(0, j()?)],
        "PUSH2" => vec![BlkPush(1, i()?), BlkPush(1, j()? + 1)],
        "XC2PU" => vec![Xchg(1, i()?), Xchg(0, j()?), BlkPush(1, k()?)],
        "PUSH3" => vec![BlkPush(1, i()?), BlkPush(1, j()? + 1), BlkPush(1, k()? + 2)],
        "BLKSWAP" => {
            let (i, j) = (i()?, j()?);
            vec![Reverse(i + 1, j + 1), Reverse(j + 1, 0), Reverse(i + j + 2, 0)]
        }
        "ROT" => vec![Xchg(1, 2), Xchg(0, 1)],
        "ROTREV" => vec![Xchg(0, 1), Xchg(1, 2)],
        "SWAP2" => vec![Xchg(1, 3), Xchg(0, 2)],
        "DROP2" => vec![BlkPop(2, 0)],
        "DUP2" => vec![BlkPush(1, 1), BlkPush(1, 1)],
        "OVER2" => vec![BlkPush(1, 3), BlkPush(1, 3)],
        "TUCK" => vec![Xchg(0, 1), BlkPush(1, 1)],
        "REVERSE" => vec![Reverse(i()? + 2, j()?)],
        "BLKDROP" => vec![BlkPop(i()?, 0)],
        "BLKPUSH" => vec![BlkPush(i()?, j()?)],
        _ => return None,
    };
    Some(ops)
}
