//! End-to-end: container bytes in, pseudo code out, plus pipeline laws over
//! lifted functions.

use detvm_lib::{
    CellBuilder, CellSlice, DecompileMode, DecompileOptions, Decompiler, Pipeline, Program,
};

fn slice_of(build: impl FnOnce(&mut CellBuilder)) -> CellSlice {
    let mut b = CellBuilder::new();
    build(&mut b);
    b.build_slice()
}

/// Wrap a single cell's payload (whole bytes only) into a container.
fn container_of(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0xB5, 0xEE, 0x9C, 0x72];
    out.push(0x01);
    out.push(0x01);
    out.push(0x01);
    out.push(0x01);
    out.push(0x00);
    out.push(2 + payload.len() as u8);
    out.push(0x00);
    out.push(0x00);
    out.push(2 * payload.len() as u8);
    out.extend_from_slice(payload);
    out
}

#[test]
fn constant_function_renders_inline() {
    let text = detvm_lib::decompile(&container_of(&[0x80, 0x07])).unwrap();
    assert_eq!(text, "fn main() {\n  return (PUSHINT_8(x=7));\n}\n");
}

#[test]
fn parameters_come_from_underflow() {
    let text = detvm_lib::decompile(&container_of(&[0xA0])).unwrap();
    assert_eq!(text, "fn main(arg0, arg1) {\n  var0 = ADD(x=arg1, y=arg0);\n  return (var0);\n}\n");
}

#[test]
fn adjacent_producers_render_nested() {
    // LSHIFT_CONST 1; NEGATE
    let text = detvm_lib::decompile(&container_of(&[0xAA, 0x01, 0xA3])).unwrap();
    assert_eq!(
        text,
        "fn main(arg0) {\n  var1 = NEGATE(x=LSHIFT_CONST(x=arg0, c=1));\n  return (var1);\n}\n"
    );
}

#[test]
fn no_inline_keeps_the_raw_lifted_form() {
    let text = detvm_lib::decompile_with_options(
        &container_of(&[0xAA, 0x01, 0xA3]),
        DecompileOptions { mode: DecompileMode::Pseudo, inline: false },
    )
    .unwrap();
    assert_eq!(
        text,
        "fn main(arg0) {\n  var0 = LSHIFT_CONST(x=arg0, c=1);\n  var1 = NEGATE(x=var0);\n  return (var1);\n}\n"
    );
}

#[test]
fn disasm_mode_lists_instructions() {
    let text = detvm_lib::decompile_with_options(
        &container_of(&[0x80, 0x07, 0xA0]),
        DecompileOptions { mode: DecompileMode::Disasm, inline: true },
    )
    .unwrap();
    assert_eq!(text, "00000 PUSHINT_8        x=7\n00016 ADD              \n");
}

#[test]
fn empty_cell_decompiles_to_an_empty_function() {
    let text = detvm_lib::decompile(&container_of(&[])).unwrap();
    assert_eq!(text, "fn main() {\n  return ();\n}\n");
}

#[test]
fn pipeline_is_idempotent_on_lifted_functions() {
    let samples: Vec<CellSlice> = vec![
        slice_of(|b| {
            b.store_uint(0x8007, 16).unwrap();
        }),
        slice_of(|b| {
            b.store_uint(0xAA01A3, 24).unwrap();
        }),
        slice_of(|b| {
            // PUSHCONT_SHORT { INC }; EXECUTE
            b.store_uint(0x91A4D8, 24).unwrap();
        }),
        slice_of(|b| {
            // constant feeding two uses stays a statement
            b.store_uint(0x71, 8).unwrap();
            b.store_uint(0x20, 8).unwrap();
            b.store_uint(0xA0, 8).unwrap();
        }),
    ];
    let dec = Decompiler::new();
    let pipeline = Pipeline::standard();
    for slice in samples {
        let lifted = dec.lift(&slice);
        let once = pipeline.run_function(lifted);
        let twice = pipeline.run_function(once.clone());
        assert_eq!(once, twice);
    }
}

#[test]
fn pipeline_reaches_continuation_bodies() {
    // PUSHCONT_SHORT { LSHIFT_CONST 1; NEGATE }; EXECUTE
    let slice = slice_of(|b| {
        b.store_uint(0x93, 8).unwrap();
        b.store_uint(0xAA01A3, 24).unwrap();
        b.store_uint(0xD8, 8).unwrap();
    });
    let dec = Decompiler::new();
    let program = Pipeline::standard().run_program(Program::Single { entry: dec.lift(&slice) });
    let Program::Single { entry } = program else { unreachable!() };
    // the continuation producer itself gets inlined into the call
    let execute = &entry.body[0];
    assert_eq!(execute.mnemonic, "EXECUTE");
    let detvm_lib::InputArg::Inline(push) = &execute.inputs[0].1 else {
        panic!("continuation producer was not inlined: {:?}", execute.inputs);
    };
    assert_eq!(push.mnemonic, "PUSHCONT_SHORT");
    let detvm_lib::Value::Cont(inner) = &push.operands[1].1 else {
        panic!("missing continuation operand");
    };
    assert_eq!(inner.body.len(), 1, "inner body not inlined: {:?}", inner.body);
    assert_eq!(inner.body[0].mnemonic, "NEGATE");
}

#[test]
fn errors_render_as_comments_with_the_tail() {
    let text = detvm_lib::decompile(&container_of(&[0x80, 0x07, 0x6F])).unwrap();
    assert!(text.contains("// disassemble error:"), "missing comment:\n{text}");
    assert!(text.contains("// undecoded tail: 8 bits, 0 refs"), "missing tail:\n{text}");
    assert!(text.contains("return (PUSHINT_8(x=7))"), "recovered part lost:\n{text}");
}

#[test]
fn multi_method_programs_render_each_method() {
    let method = slice_of(|b| {
        b.store_uint(0x802A, 16).unwrap();
    });
    let leaf = |bit: bool| {
        let mut b = CellBuilder::new();
        b.store_uint(0b11, 2).unwrap();
        b.store_bit(bit).unwrap();
        b.store_uint(18, 5).unwrap();
        b.store_slice(&method).unwrap();
        std::rc::Rc::new(b.build())
    };
    let mut dict = CellBuilder::new();
    dict.store_uint(0b00, 2).unwrap();
    dict.store_ref(leaf(false)).unwrap();
    dict.store_ref(leaf(true)).unwrap();
    let dict = std::rc::Rc::new(dict.build());
    let root = slice_of(|b| {
        b.store_uint(0xFF00, 16).unwrap();
        b.store_uint(0xF4A6, 16).unwrap();
        b.store_uint(19, 10).unwrap();
        b.store_ref(dict).unwrap();
        b.store_uint(0xF4BC, 16).unwrap();
        b.store_uint(0xF2C8, 16).unwrap();
        b.store_uint(11, 11).unwrap();
    });
    let text = Decompiler::new().decompile_slice(&root, DecompileOptions::default());
    let neg = text.find("fn method_m1(").expect("method -1 missing");
    let zero = text.find("fn method_0(").expect("method 0 missing");
    assert!(neg < zero, "methods out of order:\n{text}");
    assert!(text.contains("PUSHINT_8(x=42)"), "body lost:\n{text}");
}
