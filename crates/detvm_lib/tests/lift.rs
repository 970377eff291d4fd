//! Lifter-level scenarios: parameter inference, continuation resolution,
//! conditional alignment, and the failure paths that keep lifting total.

use detvm_lib::ir::{InputArg, IrFunction, Program, Value};
use detvm_lib::{Catalog, CellBuilder, CellSlice, DecodeError, Decompiler, LiftError};

fn slice_of(build: impl FnOnce(&mut CellBuilder)) -> CellSlice {
    let mut b = CellBuilder::new();
    build(&mut b);
    b.build_slice()
}

fn lift(build: impl FnOnce(&mut CellBuilder)) -> IrFunction {
    Decompiler::new().lift(&slice_of(build))
}

/// Every reference in the body and result must name a parameter or an
/// earlier output, and nested continuations must satisfy the same rule.
fn check_references(f: &IrFunction) {
    let mut defined: Vec<String> = f.args.iter().map(|a| a.id.clone()).collect();
    for prim in &f.body {
        check_primitive(prim, &defined);
        for (_, def) in &prim.outputs {
            assert!(
                !defined.contains(&def.id),
                "identifier {} defined twice",
                def.id
            );
            defined.push(def.id.clone());
        }
    }
    for r in &f.result {
        assert!(defined.contains(&r.id), "result {} has no definition", r.id);
    }
}

fn check_primitive(prim: &detvm_lib::Primitive, defined: &[String]) {
    for (name, arg) in &prim.inputs {
        match arg {
            InputArg::Ref(r) => {
                assert!(defined.contains(&r.id), "input {name}={} has no definition", r.id);
            }
            InputArg::Inline(inner) => check_primitive(inner, defined),
        }
    }
    for (_, value) in &prim.operands {
        if let Value::Cont(inner) = value {
            check_references(inner);
        }
    }
}

#[test]
fn empty_slice_lifts_to_an_empty_function() {
    let f = lift(|_| {});
    assert!(f.args.is_empty());
    assert!(f.body.is_empty());
    assert!(f.result.is_empty());
    assert!(f.decompile_error.is_none());
    assert!(f.disassemble_error.is_none());
}

#[test]
fn underflow_synthesizes_parameters() {
    // ADD with nothing on the stack, then a trailing no-op
    let f = lift(|b| {
        b.store_uint(0xA0, 8).unwrap();
        b.store_uint(0x00, 8).unwrap();
    });
    assert!(f.decompile_error.is_none());
    assert_eq!(f.args.len(), 2);
    assert_eq!(f.args[0].id, "arg0");
    assert_eq!(f.args[1].id, "arg1");
    assert_eq!(f.body.len(), 1);
    let add = &f.body[0];
    assert_eq!(add.mnemonic, "ADD");
    assert_eq!(add.inputs[0].0, "x");
    assert_eq!(input_id(&add.inputs[0].1), "arg1");
    assert_eq!(add.inputs[1].0, "y");
    assert_eq!(input_id(&add.inputs[1].1), "arg0");
    assert_eq!(f.result.len(), 1);
    assert_eq!(f.result[0].id, add.outputs[0].1.id);
    check_references(&f);
}

fn input_id(arg: &InputArg) -> &str {
    match arg {
        InputArg::Ref(r) => &r.id,
        InputArg::Inline(_) => panic!("expected a reference"),
    }
}

#[test]
fn shuffles_leave_no_trace_in_the_body() {
    // PUSHINT 1; PUSHINT 2; swap via XCHG_0I; ADD
    let f = lift(|b| {
        b.store_uint(0x71, 8).unwrap();
        b.store_uint(0x72, 8).unwrap();
        b.store_uint(0x01, 8).unwrap();
        b.store_uint(0xA0, 8).unwrap();
    });
    assert!(f.decompile_error.is_none());
    let mnemonics: Vec<&str> = f.body.iter().map(|p| p.mnemonic.as_str()).collect();
    assert_eq!(mnemonics, ["PUSHINT_4", "PUSHINT_4", "ADD"]);
    // the swap crossed the operands over
    let add = &f.body[2];
    assert_eq!(input_id(&add.inputs[0].1), f.body[1].outputs[0].1.id);
    assert_eq!(input_id(&add.inputs[1].1), f.body[0].outputs[0].1.id);
    check_references(&f);
}

#[test]
fn body_length_matches_non_shuffle_instruction_count() {
    let f = lift(|b| {
        b.store_uint(0x71, 8).unwrap(); // PUSHINT_4
        b.store_uint(0x20, 8).unwrap(); // PUSH s0
        b.store_uint(0x30, 8).unwrap(); // POP s0
        b.store_uint(0xA4, 8).unwrap(); // INC
        b.store_uint(0x00, 8).unwrap(); // NOP
    });
    assert!(f.decompile_error.is_none());
    assert_eq!(f.body.len(), 2);
    check_references(&f);
}

#[test]
fn pushed_continuations_resolve_through_the_stack() {
    // PUSHCONT_SHORT { INC }; EXECUTE
    let f = lift(|b| {
        b.store_uint(0x91, 8).unwrap();
        b.store_uint(0xA4, 8).unwrap();
        b.store_uint(0xD8, 8).unwrap();
    });
    assert!(f.decompile_error.is_none(), "error: {:?}", f.decompile_error);
    assert_eq!(f.body.len(), 2);
    let push = &f.body[0];
    assert_eq!(push.mnemonic, "PUSHCONT_SHORT");
    let Value::Cont(inner) = &push.operands[1].1 else {
        panic!("continuation operand was not lifted: {:?}", push.operands);
    };
    assert_eq!(inner.body.len(), 1);
    assert_eq!(inner.body[0].mnemonic, "INC");
    assert_eq!(inner.args.len(), 1);

    let execute = &f.body[1];
    assert_eq!(execute.mnemonic, "EXECUTE");
    // the call picks up the continuation's parameter and returns its result
    assert_eq!(execute.inputs.len(), 2);
    assert!(execute.inputs[1].0.starts_with("c_"));
    assert_eq!(execute.outputs.len(), 1);
    assert_eq!(execute.outputs[0].0, "out_0");
    assert_eq!(f.result.len(), 1);
    assert_eq!(f.result[0].id, execute.outputs[0].1.id);
    check_references(&f);
}

#[test]
fn jump_branches_return_nothing() {
    // PUSHCONT_SHORT { INC }; IFJMP
    let f = lift(|b| {
        b.store_uint(0x91, 8).unwrap();
        b.store_uint(0xA4, 8).unwrap();
        b.store_uint(0xE0, 8).unwrap();
    });
    assert!(f.decompile_error.is_none(), "error: {:?}", f.decompile_error);
    let ifjmp = &f.body[1];
    assert_eq!(ifjmp.mnemonic, "IFJMP");
    assert!(ifjmp.outputs.is_empty());
    assert!(f.result.is_empty());
    check_references(&f);
}

#[test]
fn unbalanced_call_through_fall_through_is_rejected() {
    // PUSHCONT_SHORT { ADD } takes two values and returns one; EXECUTE
    // promises fall-through, so the shapes cannot be reconciled linearly.
    let f = lift(|b| {
        b.store_uint(0x91, 8).unwrap();
        b.store_uint(0xA0, 8).unwrap();
        b.store_uint(0xD8, 8).unwrap();
    });
    assert!(matches!(f.decompile_error, Some(LiftError::Unsupported(_))));
    assert_eq!(f.asm_tail.len(), 1);
    assert_eq!(f.asm_tail[0].mnemonic, "EXECUTE");
}

#[test]
fn conditional_outputs_align_and_merge() {
    let catalog = Catalog::from_json(
        r#"{ "instructions": [
            { "mnemonic": "FORK", "bytecode": { "prefix": "11111110" }, "doc": { "category": "custom" },
              "value_flow": { "inputs": { "stack": [] }, "outputs": { "stack": [
                { "type": "conditional", "name": "which",
                  "match": [ { "value": -1, "stack": [ { "type": "simple", "name": "a" } ] } ],
                  "else": [ { "type": "simple", "name": "b" } ] } ] } } },
            { "mnemonic": "ADD", "bytecode": { "prefix": "10100000" }, "doc": { "category": "arithm_basic" },
              "value_flow": { "inputs": { "stack": [ { "type": "simple", "name": "x" }, { "type": "simple", "name": "y" } ] },
                              "outputs": { "stack": [ { "type": "simple", "name": "z" } ] } } }
        ] }"#,
    )
    .unwrap();
    let dec = Decompiler::with_catalog(catalog);
    let f = dec.lift(&slice_of(|b| {
        b.store_uint(0xFE, 8).unwrap();
        b.store_uint(0xA0, 8).unwrap();
    }));
    assert!(f.decompile_error.is_none(), "error: {:?}", f.decompile_error);
    let fork = &f.body[0];
    assert_eq!(fork.outputs.len(), 1);
    assert_eq!(fork.outputs[0].0, "__cond0");
    let add = &f.body[1];
    assert_eq!(input_id(&add.inputs[0].1), "arg0");
    assert_eq!(input_id(&add.inputs[1].1), fork.outputs[0].1.id);
    assert_eq!(f.args.len(), 1);
    check_references(&f);
}

#[test]
fn misaligned_conditional_reports_guard_unresolved() {
    // built-in LDUQ arms have different residue lengths; touching the region
    // below the boundary can never be allowed
    let f = lift(|b| {
        b.store_uint(0x71, 8).unwrap(); // PUSHINT_4 (the slice stand-in)
        b.store_uint(0xD70D, 16).unwrap(); // LDUQ
        b.store_uint(8, 8).unwrap();
        b.store_uint(0xA0, 8).unwrap(); // ADD needs to reach past the guard
    });
    assert_eq!(f.decompile_error, Some(LiftError::GuardUnresolved));
    assert_eq!(f.asm_tail.len(), 1);
    assert_eq!(f.asm_tail[0].mnemonic, "ADD");
}

#[test]
fn dangling_guard_at_exit_is_an_error() {
    let f = lift(|b| {
        b.store_uint(0x71, 8).unwrap();
        b.store_uint(0xD70D, 16).unwrap(); // LDUQ, then nothing equalizes
        b.store_uint(8, 8).unwrap();
    });
    assert_eq!(f.decompile_error, Some(LiftError::GuardUnresolved));
}

#[test]
fn retry_cap_stops_runaway_underflow() {
    // BLKDROP 15 replays one primitive pop at a time; the cap fires first
    let f = lift(|b| {
        b.store_uint(0x5F0F, 16).unwrap();
    });
    assert_eq!(f.decompile_error, Some(LiftError::RetryLimit(10)));
    assert_eq!(f.args.len(), 10);
}

#[test]
fn undecodable_tail_is_preserved() {
    let f = lift(|b| {
        b.store_uint(0x8007, 16).unwrap(); // PUSHINT_8 7
        b.store_uint(0x6F, 8).unwrap(); // matches nothing
    });
    assert_eq!(f.body.len(), 1);
    assert_eq!(f.body[0].mnemonic, "PUSHINT_8");
    assert_eq!(f.disassemble_error, Some(DecodeError::PrefixNotFound));
    assert!(f.asm_tail.is_empty());
    let tail = f.tail_slice.expect("tail residue");
    assert_eq!(tail.bits, 8);
    assert_eq!(tail.refs, 0);
}

#[test]
fn instructions_after_a_lift_error_become_raw_disassembly() {
    let f = lift(|b| {
        b.store_uint(0x5F0F, 16).unwrap(); // trips the retry cap
        b.store_uint(0x8007, 16).unwrap();
        b.store_uint(0xA0, 8).unwrap();
    });
    assert!(f.decompile_error.is_some());
    let mnemonics: Vec<&str> = f.asm_tail.iter().map(|r| r.mnemonic.as_str()).collect();
    assert_eq!(mnemonics, ["BLKDROP", "PUSHINT_8", "ADD"]);
    assert!(f.body.is_empty());
}

#[test]
fn decoding_continues_through_a_trailing_ref() {
    let tail = slice_of(|b| {
        b.store_uint(0xA4, 8).unwrap(); // INC
    });
    let f = lift(|b| {
        b.store_uint(0x8007, 16).unwrap();
        b.store_ref(std::rc::Rc::clone(tail.cell())).unwrap();
    });
    assert!(f.decompile_error.is_none());
    let mnemonics: Vec<&str> = f.body.iter().map(|p| p.mnemonic.as_str()).collect();
    assert_eq!(mnemonics, ["PUSHINT_8", "INC"]);
    check_references(&f);
}

#[test]
fn method_dictionary_prologue_splits_the_program() {
    let method_a = slice_of(|b| {
        b.store_uint(0x802A, 16).unwrap(); // PUSHINT_8 42
    });
    let method_b = slice_of(|b| {
        b.store_uint(0x802B, 16).unwrap(); // PUSHINT_8 43
    });
    // dictionary with 19-bit keys 0 -> method_a and -1 -> method_b
    let leaf = |bit: bool, payload: &CellSlice| {
        let mut b = CellBuilder::new();
        b.store_uint(0b11, 2).unwrap();
        b.store_bit(bit).unwrap();
        b.store_uint(18, 5).unwrap();
        b.store_slice(payload).unwrap();
        std::rc::Rc::new(b.build())
    };
    let mut dict = CellBuilder::new();
    dict.store_uint(0b00, 2).unwrap();
    dict.store_ref(leaf(false, &method_a)).unwrap();
    dict.store_ref(leaf(true, &method_b)).unwrap();
    let dict = std::rc::Rc::new(dict.build());

    let root = slice_of(|b| {
        b.store_uint(0xFF00, 16).unwrap(); // SETCP 0
        b.store_uint(0xF4A6, 16).unwrap(); // DICTPUSHCONST
        b.store_uint(19, 10).unwrap();
        b.store_ref(dict).unwrap();
        b.store_uint(0xF4BC, 16).unwrap(); // DICTIGETJMPZ
        b.store_uint(0xF2C8, 16).unwrap(); // THROWARG
        b.store_uint(11, 11).unwrap();
    });
    let program = Decompiler::new().program(&root);
    let Program::Multi { methods } = program else {
        panic!("dispatch prologue not recognized");
    };
    let keys: Vec<i64> = methods.keys().copied().collect();
    assert_eq!(keys, [-1, 0]);
    assert_eq!(
        methods[&0].body[0].operands[0].1,
        Value::Int(42)
    );
    assert_eq!(
        methods[&-1].body[0].operands[0].1,
        Value::Int(43)
    );
    for f in methods.values() {
        check_references(f);
    }
}

#[test]
fn prologue_with_leftover_bits_falls_back_to_single() {
    let dict = std::rc::Rc::new(CellBuilder::new().build());
    let root = slice_of(|b| {
        b.store_uint(0xFF00, 16).unwrap();
        b.store_uint(0xF4A6, 16).unwrap();
        b.store_uint(19, 10).unwrap();
        b.store_ref(dict).unwrap();
        b.store_uint(0xF4BC, 16).unwrap();
        b.store_uint(0xF2C8, 16).unwrap();
        b.store_uint(11, 11).unwrap();
        b.store_uint(0x00, 8).unwrap(); // trailing NOP breaks the pattern
    });
    assert!(matches!(
        Decompiler::new().program(&root),
        Program::Single { .. }
    ));
}
