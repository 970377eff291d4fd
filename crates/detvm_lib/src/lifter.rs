//! The lifter: drives the decoder over a code slice and interprets every
//! instruction's declared stack effects over opaque identifiers, producing a
//! dataflow IR function.
//!
//! The walk is strictly linear. Stack-category instructions only rearrange
//! the symbolic stack; everything else becomes one IR primitive whose inputs
//! name the popped values and whose outputs introduce fresh ones. Popping
//! past the bottom synthesizes function parameters and retries the
//! instruction; instructions whose outputs depend on a runtime arm install
//! an alignment guard (see `stack`).
//!
//! Lifting is total: analysis failures land in the returned function's
//! diagnostic fields and the remainder of the code is kept as raw
//! disassembly.

use std::collections::BTreeMap;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::cell::CellSlice;
use crate::decoder::{DecodedInstr, Decoder, OperandValue, Operands};
use crate::dict;
use crate::ir::{InputArg, IrFunction, Primitive, Program, RawInstr, TailSlice, Value, VarDef, VarRef};
use crate::spec::{Catalog, Instruction, StackEntry};
use crate::stack::{self, Namer, StackError, SymbolicStack};

pub const MAX_UNDERFLOW_RETRIES: usize = 10;

/// The exact dispatch prologue recognized by the entry heuristic.
const DISPATCH_PROLOGUE: [&str; 4] = ["SETCP", "DICTPUSHCONST", "DICTIGETJMPZ", "THROWARG"];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LiftError {
    #[error("stack underflow by {0}")]
    StackUnderflow(usize),

    #[error("conditional outputs never aligned")]
    GuardUnresolved,

    #[error("unsupported operand shape: {0}")]
    Unsupported(String),

    #[error("inconsistent instruction spec: {0}")]
    Spec(String),

    #[error("still underflowing after synthesizing parameters {0} times")]
    RetryLimit(usize),
}

impl From<StackError> for LiftError {
    fn from(e: StackError) -> Self {
        match e {
            StackError::Underflow(d) => LiftError::StackUnderflow(d),
            StackError::GuardUnresolved => LiftError::GuardUnresolved,
        }
    }
}

pub struct Lifter<'a> {
    decoder: Decoder<'a>,
}

impl<'a> Lifter<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { decoder: Decoder::new(catalog) }
    }

    /// Lift a root slice into a whole program, trying the method-dictionary
    /// entry heuristic first.
    pub fn program(&self, root: &CellSlice) -> Program {
        let mut namer = Namer::default();
        if let Some(methods) = self.match_dispatch_prologue(root, &mut namer) {
            return Program::Multi { methods };
        }
        Program::Single { entry: self.lift_with(root.clone(), &mut namer) }
    }

    pub fn lift(&self, slice: &CellSlice) -> IrFunction {
        let mut namer = Namer::default();
        self.lift_with(slice.clone(), &mut namer)
    }

    /// Recognize `SETCP; DICTPUSHCONST; DICTIGETJMPZ; THROWARG` with nothing
    /// after it, and extract the method table. Any deviation falls back to
    /// the single-function path.
    fn match_dispatch_prologue(
        &self,
        root: &CellSlice,
        namer: &mut Namer,
    ) -> Option<BTreeMap<i64, IrFunction>> {
        let mut cursor = root.clone();
        let mut dict_operands = None;
        for expected in DISPATCH_PROLOGUE {
            let decoded = self.decoder.next_instruction(&mut cursor).ok()?;
            if decoded.spec.mnemonic != expected {
                return None;
            }
            if expected == "DICTPUSHCONST" {
                dict_operands = Some(decoded.operands);
            }
        }
        if !cursor.is_empty() {
            return None;
        }
        let operands = dict_operands?;
        let key_bits = operands.get("n")?.as_int()?.max(0) as usize;
        let OperandValue::Ref(d) = operands.get("d")? else {
            return None;
        };
        let entries = dict::parse(d.cell(), key_bits).ok()?;
        debug!(methods = entries.len(), key_bits, "dispatch prologue matched");
        let mut methods = BTreeMap::new();
        for (id, slice) in entries {
            methods.insert(id, self.lift_with(slice, namer));
        }
        Some(methods)
    }

    fn lift_with(&self, slice: CellSlice, namer: &mut Namer) -> IrFunction {
        let mut f = IrFunction::default();
        let mut stack = SymbolicStack::new();
        let mut cursor = slice;
        loop {
            if cursor.remaining_bits() == 0 {
                if cursor.remaining_refs() > 0 {
                    // out of bits: control continues through the trailing ref
                    match cursor.load_ref() {
                        Ok(next) => {
                            cursor = next;
                            continue;
                        }
                        Err(_) => break,
                    }
                }
                break;
            }
            let DecodedInstr { spec, mut operands } = match self.decoder.next_instruction(&mut cursor)
            {
                Ok(d) => d,
                Err(e) => {
                    debug!(error = %e, "disassembly stopped");
                    f.disassemble_error = Some(e);
                    f.tail_slice = Some(TailSlice::of(&cursor));
                    break;
                }
            };
            trace!(mnemonic = %spec.mnemonic, "decoded");
            if f.decompile_error.is_some() {
                f.asm_tail.push(raw_instr(spec, &operands));
                continue;
            }
            self.resolve_continuations(spec, &mut operands, namer);
            let operand_values = self.convert_operands(spec, &operands, namer);
            match self.apply(spec, &operands, operand_values, &mut stack, &mut f.args, namer) {
                Ok(Some(prim)) => f.body.push(prim),
                Ok(None) => {}
                Err(e) => {
                    debug!(mnemonic = %spec.mnemonic, error = %e, "symbolic execution stopped");
                    f.decompile_error = Some(e);
                    f.asm_tail.push(raw_instr(spec, &operands));
                }
            }
        }
        if stack.has_guard() && f.decompile_error.is_none() {
            f.decompile_error = Some(LiftError::GuardUnresolved);
        }
        f.result = stack
            .into_values()
            .into_iter()
            .map(|v| VarRef { id: v.id, value_types: Vec::new(), cont: v.cont })
            .collect();
        f
    }

    /// Replace every continuation-hinted slice or ref operand with its lifted
    /// body so later branch analysis can reach it.
    fn resolve_continuations(&self, spec: &Instruction, operands: &mut Operands, namer: &mut Namer) {
        for op_spec in &spec.bytecode.operands {
            if !op_spec.is_continuation() {
                continue;
            }
            let name = op_spec.name();
            let code = match operands.get(name) {
                Some(OperandValue::Slice(s)) | Some(OperandValue::Ref(s)) => s.clone(),
                _ => continue,
            };
            let lifted = self.lift_with(code, namer);
            operands.insert(name.to_string(), OperandValue::Cont(Rc::new(lifted)));
        }
    }

    /// Map decoded operands to IR values. A dictionary operand of the
    /// dispatch opcode becomes a lifted method map when it parses.
    fn convert_operands(
        &self,
        spec: &Instruction,
        operands: &Operands,
        namer: &mut Namer,
    ) -> Vec<(String, Value)> {
        operands
            .iter()
            .map(|(name, value)| {
                let converted = match value {
                    OperandValue::Int(v) => Value::Int(*v),
                    OperandValue::BigInt(v) => Value::BigInt(v.clone()),
                    OperandValue::Slice(s) => Value::Slice(s.clone()),
                    OperandValue::Cont(f) => Value::Cont(Rc::clone(f)),
                    OperandValue::Ref(s) => {
                        if spec.mnemonic == "DICTPUSHCONST" && name == "d" {
                            self.lift_dict(s, operands, namer)
                                .unwrap_or_else(|| Value::Cell(Rc::clone(s.cell())))
                        } else {
                            Value::Cell(Rc::clone(s.cell()))
                        }
                    }
                };
                (name.clone(), converted)
            })
            .collect()
    }

    fn lift_dict(&self, d: &CellSlice, operands: &Operands, namer: &mut Namer) -> Option<Value> {
        let key_bits = operands.get("n")?.as_int()?.max(0) as usize;
        let entries = dict::parse(d.cell(), key_bits).ok()?;
        let map = entries
            .into_iter()
            .map(|(id, slice)| (id, Rc::new(self.lift_with(slice, namer))))
            .collect();
        Some(Value::ContMap(map))
    }

    /// Apply one instruction with the underflow-retry protocol: each retry
    /// synthesizes the missing parameters at the bottom of the real stack and
    /// replays the instruction on a fresh snapshot.
    fn apply(
        &self,
        spec: &Instruction,
        operands: &Operands,
        operand_values: Vec<(String, Value)>,
        stack: &mut SymbolicStack,
        args: &mut Vec<VarDef>,
        namer: &mut Namer,
    ) -> Result<Option<Primitive>, LiftError> {
        let mut retries = 0;
        loop {
            let mut snapshot = stack.clone();
            match self.apply_once(spec, operands, &operand_values, &mut snapshot, namer) {
                Ok(prim) => {
                    *stack = snapshot;
                    return Ok(prim);
                }
                Err(LiftError::StackUnderflow(missing)) => {
                    retries += 1;
                    if retries > MAX_UNDERFLOW_RETRIES {
                        return Err(LiftError::RetryLimit(MAX_UNDERFLOW_RETRIES));
                    }
                    trace!(missing, retries, mnemonic = %spec.mnemonic, "synthesizing parameters");
                    for v in stack.insert_args_at_bottom(missing, namer) {
                        args.push(VarDef { id: v.id, value_types: Vec::new() });
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn apply_once(
        &self,
        spec: &Instruction,
        operands: &Operands,
        operand_values: &[(String, Value)],
        stack: &mut SymbolicStack,
        namer: &mut Namer,
    ) -> Result<Option<Primitive>, LiftError> {
        if spec.is_shuffle() {
            let ops = stack::decompose(&spec.mnemonic, operands).ok_or_else(|| {
                LiftError::Unsupported(format!("no decomposition for {}", spec.mnemonic))
            })?;
            for op in ops {
                stack.exec(op)?;
            }
            return Ok(None);
        }

        let flow = spec
            .value_flow
            .as_ref()
            .ok_or_else(|| LiftError::Spec(format!("{} has no value flow", spec.mnemonic)))?;
        let in_entries = flow
            .inputs
            .as_ref()
            .and_then(|s| s.stack.as_deref())
            .ok_or_else(|| LiftError::Spec(format!("{} has no input stack", spec.mnemonic)))?;
        let out_entries = flow
            .outputs
            .as_ref()
            .and_then(|s| s.stack.as_deref())
            .ok_or_else(|| LiftError::Spec(format!("{} has no output stack", spec.mnemonic)))?;

        // inputs are declared bottom first; consume from the top down
        let mut inputs: Vec<(String, InputArg)> = Vec::new();
        for entry in in_entries.iter().rev() {
            self.consume_input(entry, operands, stack, &mut inputs)?;
        }
        inputs.reverse();

        let mut outputs: Vec<(String, VarDef)> = Vec::new();
        self.analyze_branches(spec, operands, &mut inputs, &mut outputs, stack, namer)?;

        let mut const_counter = 0;
        let mut cond_counter = 0;
        for entry in out_entries {
            self.produce_output(
                entry,
                operands,
                stack,
                &mut outputs,
                &mut const_counter,
                &mut cond_counter,
                namer,
            )?;
        }

        // a continuation-typed output carries the lifted operand body
        if let Some((_, def)) = outputs
            .iter()
            .find(|(_, d)| d.value_types.iter().any(|t| t == "Continuation"))
        {
            if let Some(cont) = operands.values().find_map(|v| match v {
                OperandValue::Cont(f) => Some(Rc::clone(f)),
                _ => None,
            }) {
                stack.attach_cont(&def.id, cont);
            }
        }

        Ok(Some(Primitive {
            mnemonic: spec.mnemonic.clone(),
            category: spec.doc.category.clone(),
            inputs,
            operands: operand_values.to_vec(),
            outputs,
        }))
    }

    fn consume_input(
        &self,
        entry: &StackEntry,
        operands: &Operands,
        stack: &mut SymbolicStack,
        inputs: &mut Vec<(String, InputArg)>,
    ) -> Result<(), LiftError> {
        match entry {
            StackEntry::Simple { name, value_types } => {
                let v = stack.pop()?;
                inputs.push((
                    name.clone(),
                    InputArg::Ref(VarRef { id: v.id, value_types: value_types.clone(), cont: v.cont }),
                ));
                Ok(())
            }
            StackEntry::Array { name, length_var, array_entry } => {
                let count = array_length(operands, length_var)?;
                // emitted in reverse here; the caller restores declared order
                for idx in (0..count).rev() {
                    for sub in array_entry.iter().rev() {
                        let StackEntry::Simple { name: sub_name, value_types } = sub else {
                            return Err(LiftError::Unsupported(
                                "non-simple entry inside array input".into(),
                            ));
                        };
                        let v = stack.pop()?;
                        inputs.push((
                            format!("{name}_{idx}_{sub_name}"),
                            InputArg::Ref(VarRef {
                                id: v.id,
                                value_types: value_types.clone(),
                                cont: v.cont,
                            }),
                        ));
                    }
                }
                Ok(())
            }
            StackEntry::Const { .. } | StackEntry::Conditional { .. } => Err(LiftError::Spec(
                "unsupported stack-entry kind in inputs".into(),
            )),
        }
    }

    /// Resolve declared branch targets to lifted continuations, pick up their
    /// parameters from the stack, and model the call's net stack effect.
    fn analyze_branches(
        &self,
        spec: &Instruction,
        operands: &Operands,
        inputs: &mut Vec<(String, InputArg)>,
        outputs: &mut Vec<(String, VarDef)>,
        stack: &mut SymbolicStack,
        namer: &mut Namer,
    ) -> Result<(), LiftError> {
        let branches = spec.branches();
        if branches.is_empty() {
            return Ok(());
        }
        let mut targets: Vec<(String, Rc<IrFunction>, bool)> = Vec::new();
        for branch in branches {
            if branch.kind != "variable" {
                return Err(LiftError::Unsupported(format!("branch kind `{}`", branch.kind)));
            }
            let cont = if let Some(OperandValue::Cont(f)) = operands.get(&branch.var_name) {
                Rc::clone(f)
            } else if let Some(var) = find_input_ref(inputs, &branch.var_name) {
                var.cont.clone().ok_or_else(|| {
                    LiftError::Unsupported(format!(
                        "branch `{}` reads a stack value with no known continuation",
                        branch.var_name
                    ))
                })?
            } else {
                return Err(LiftError::Unsupported(format!(
                    "unknown branch source `{}`",
                    branch.var_name
                )));
            };
            targets.push((branch.var_name.clone(), cont, branch.is_jump()));
        }

        // every target reads its parameters off the same stack; peek a copy
        // per target so the ids line up with what the real pops will yield
        for (name, cont, _) in &targets {
            let mut peek = stack.clone();
            for arg in &cont.args {
                let v = peek.pop()?;
                inputs.push((
                    format!("{name}_{}", arg.id),
                    InputArg::Ref(VarRef { id: v.id, value_types: Vec::new(), cont: v.cont }),
                ));
            }
        }

        let mut deltas = targets.iter().map(|(_, c, _)| c.args.len() as i64 - c.result.len() as i64);
        let first = deltas.next().unwrap_or(0);
        if deltas.any(|d| d != first) {
            return Err(LiftError::Unsupported("branches disagree on stack delta".into()));
        }
        let max_args = targets.iter().map(|(_, c, _)| c.args.len()).max().unwrap_or(0);
        let max_rets = targets.iter().map(|(_, c, _)| c.result.len()).max().unwrap_or(0);
        let has_jump = targets.iter().any(|(_, _, jump)| *jump);
        if spec.nobranch() && !has_jump && max_args != max_rets {
            return Err(LiftError::Unsupported(
                "fall-through with unbalanced continuation".into(),
            ));
        }
        for _ in 0..max_args {
            stack.pop()?;
        }
        // a jump-style branch never comes back, so nothing is returned here
        let rets = if has_jump { 0 } else { max_rets };
        for k in 0..rets {
            let v = stack.push(namer);
            outputs.push((format!("out_{k}"), VarDef { id: v.id, value_types: Vec::new() }));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn produce_output(
        &self,
        entry: &StackEntry,
        operands: &Operands,
        stack: &mut SymbolicStack,
        outputs: &mut Vec<(String, VarDef)>,
        const_counter: &mut usize,
        cond_counter: &mut usize,
        namer: &mut Namer,
    ) -> Result<(), LiftError> {
        match entry {
            StackEntry::Simple { name, value_types } => {
                let v = stack.push(namer);
                outputs.push((name.clone(), VarDef { id: v.id, value_types: value_types.clone() }));
                Ok(())
            }
            StackEntry::Const { value_type, .. } => {
                let v = stack.push(namer);
                outputs.push((
                    format!("const{}", *const_counter),
                    VarDef { id: v.id, value_types: vec![value_type.clone()] },
                ));
                *const_counter += 1;
                Ok(())
            }
            StackEntry::Array { name, length_var, array_entry } => {
                let count = array_length(operands, length_var)?;
                for idx in 0..count {
                    for sub in array_entry {
                        let StackEntry::Simple { name: sub_name, value_types } = sub else {
                            return Err(LiftError::Unsupported(
                                "non-simple entry inside array output".into(),
                            ));
                        };
                        let v = stack.push(namer);
                        outputs.push((
                            format!("{name}_{idx}_{sub_name}"),
                            VarDef { id: v.id, value_types: value_types.clone() },
                        ));
                    }
                }
                Ok(())
            }
            StackEntry::Conditional { arms, otherwise, .. } => {
                let arm_lists: Vec<&[StackEntry]> = arms
                    .iter()
                    .map(|a| a.stack.as_slice())
                    .chain(otherwise.as_ref().map(|v| v.as_slice()))
                    .collect();
                stack.ensure_guard(0, arm_lists.len());
                for (idx, arm) in arm_lists.iter().enumerate() {
                    let mut pending = Vec::with_capacity(arm.len());
                    for sub in *arm {
                        match sub {
                            StackEntry::Simple { .. } | StackEntry::Const { .. } => {
                                pending.push(namer.fresh_var());
                            }
                            _ => {
                                return Err(LiftError::Unsupported(
                                    "nested array or conditional inside conditional arm".into(),
                                ))
                            }
                        }
                    }
                    stack.append_to_guard_arm(idx, pending);
                }
                if let Some(merged) = stack.try_finalize_guard(namer) {
                    for v in merged {
                        outputs.push((
                            format!("__cond{}", *cond_counter),
                            VarDef { id: v.id, value_types: Vec::new() },
                        ));
                        *cond_counter += 1;
                    }
                }
                Ok(())
            }
        }
    }
}

fn array_length(operands: &Operands, length_var: &str) -> Result<usize, LiftError> {
    operands
        .get(length_var)
        .and_then(OperandValue::as_int)
        .map(|v| v.max(0) as usize)
        .ok_or_else(|| {
            LiftError::Unsupported(format!("array length `{length_var}` is not a static operand"))
        })
}

fn find_input_ref<'x>(inputs: &'x [(String, InputArg)], name: &str) -> Option<&'x VarRef> {
    inputs.iter().find(|(n, _)| n == name).and_then(|(_, arg)| match arg {
        InputArg::Ref(r) => Some(r),
        InputArg::Inline(_) => None,
    })
}

fn raw_instr(spec: &Instruction, operands: &Operands) -> RawInstr {
    RawInstr {
        mnemonic: spec.mnemonic.clone(),
        operands: operands.iter().map(|(n, v)| (n.clone(), v.to_string())).collect(),
    }
}
