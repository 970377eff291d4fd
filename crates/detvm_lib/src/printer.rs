//! Textual back-end: renders a lifted `Program` as pseudo code, and raw
//! instruction listings for the disassembly mode. Partial results render
//! too: diagnostics become one-line comments and whatever could still be
//! decoded past a failure is listed verbatim.

use std::fmt::Write;

use crate::cell::CellSlice;
use crate::decoder::Decoder;
use crate::ir::{InputArg, IrFunction, Primitive, Program, Value};
use crate::spec::{CATEGORY_CONST_DATA, CATEGORY_CONST_INT};

pub fn render_program(program: &Program) -> String {
    let mut out = String::new();
    match program {
        Program::Single { entry } => render_function(&mut out, "main", entry),
        Program::Multi { methods } => {
            for (idx, (id, f)) in methods.iter().enumerate() {
                if idx > 0 {
                    out.push('\n');
                }
                render_function(&mut out, &method_name(*id), f);
            }
        }
    }
    out
}

fn method_name(id: i64) -> String {
    if id < 0 {
        format!("method_m{}", -id)
    } else {
        format!("method_{id}")
    }
}

fn render_function(out: &mut String, name: &str, f: &IrFunction) {
    let params: Vec<&str> = f.args.iter().map(|a| a.id.as_str()).collect();
    let _ = writeln!(out, "fn {name}({}) {{", params.join(", "));
    render_body(out, f, 2);
    out.push_str("}\n");
}

fn render_body(out: &mut String, f: &IrFunction, indent: usize) {
    let pad = " ".repeat(indent);

    // a constant producer that only feeds the return value renders there
    let return_inline: Vec<Option<usize>> = f
        .result
        .iter()
        .map(|r| {
            f.body.iter().position(|p| {
                matches!(p.category.as_str(), CATEGORY_CONST_INT | CATEGORY_CONST_DATA)
                    && p.single_output().is_some_and(|d| d.id == r.id)
                    && f.body.iter().all(|q| count_ref_uses(q, &r.id) == 0)
            })
        })
        .collect();
    let skipped: Vec<usize> = return_inline.iter().flatten().copied().collect();

    for (idx, prim) in f.body.iter().enumerate() {
        if skipped.contains(&idx) {
            continue;
        }
        let lhs = match prim.outputs.as_slice() {
            [] => String::new(),
            [(_, def)] => format!("{} = ", def.id),
            many => {
                let ids: Vec<&str> = many.iter().map(|(_, d)| d.id.as_str()).collect();
                format!("({}) = ", ids.join(", "))
            }
        };
        let _ = writeln!(out, "{pad}{lhs}{};", render_primitive(prim, indent));
    }

    if let Some(e) = &f.decompile_error {
        let _ = writeln!(out, "{pad}// decompile error: {e}");
    }
    if let Some(e) = &f.disassemble_error {
        let _ = writeln!(out, "{pad}// disassemble error: {e}");
    }
    for raw in &f.asm_tail {
        let rendered: Vec<String> =
            raw.operands.iter().map(|(n, v)| format!("{n}={v}")).collect();
        let _ = writeln!(out, "{pad}// asm: {} {}", raw.mnemonic, rendered.join(" "));
    }
    if let Some(tail) = &f.tail_slice {
        let _ = writeln!(
            out,
            "{pad}// undecoded tail: {} bits, {} refs: {}",
            tail.bits, tail.refs, tail.slice
        );
    }

    let rendered: Vec<String> = f
        .result
        .iter()
        .zip(&return_inline)
        .map(|(r, inline)| match inline {
            Some(idx) => render_primitive(&f.body[*idx], indent),
            None => r.id.clone(),
        })
        .collect();
    let _ = writeln!(out, "{pad}return ({});", rendered.join(", "));
}

fn render_primitive(prim: &Primitive, indent: usize) -> String {
    let mut parts = Vec::with_capacity(prim.inputs.len() + prim.operands.len());
    for (name, arg) in &prim.inputs {
        parts.push(format!("{name}={}", render_arg(arg, indent)));
    }
    for (name, value) in &prim.operands {
        parts.push(format!("{name}={}", render_value(value, indent)));
    }
    format!("{}({})", prim.mnemonic, parts.join(", "))
}

fn render_arg(arg: &InputArg, indent: usize) -> String {
    match arg {
        InputArg::Ref(r) => r.id.clone(),
        InputArg::Inline(inner) => render_primitive(inner, indent),
    }
}

fn render_value(value: &Value, indent: usize) -> String {
    match value {
        Value::Int(v) => v.to_string(),
        Value::BigInt(v) => v.to_string(),
        Value::Bool(v) => v.to_string(),
        Value::Slice(s) => s.to_string(),
        Value::Cell(c) => format!("^{}", CellSlice::full(std::rc::Rc::clone(c))),
        Value::Cont(f) => render_cont(f, indent),
        Value::ContMap(map) => {
            let mut out = String::from("{\n");
            let pad = " ".repeat(indent + 2);
            for (id, f) in map {
                let _ = writeln!(out, "{pad}{id}: {}", render_cont(f, indent + 2));
            }
            out.push_str(&" ".repeat(indent));
            out.push('}');
            out
        }
        Value::Other(s) => s.clone(),
    }
}

fn render_cont(f: &IrFunction, indent: usize) -> String {
    let mut out = String::new();
    if f.args.is_empty() {
        out.push_str("{\n");
    } else {
        let params: Vec<&str> = f.args.iter().map(|a| a.id.as_str()).collect();
        let _ = write!(out, "|{}| {{\n", params.join(", "));
    }
    render_body(&mut out, f, indent + 2);
    out.push_str(&" ".repeat(indent));
    out.push('}');
    out
}

fn count_ref_uses(prim: &Primitive, id: &str) -> usize {
    prim.inputs
        .iter()
        .map(|(_, arg)| match arg {
            InputArg::Ref(r) => usize::from(r.id == id),
            InputArg::Inline(inner) => count_ref_uses(inner, id),
        })
        .sum()
}

/// Linear instruction listing, one line per decoded instruction, following
/// the implicit jump through a trailing reference like the lifter does.
pub fn disassemble(decoder: &Decoder<'_>, root: &CellSlice) -> String {
    let mut out = String::new();
    let mut cursor = root.clone();
    let mut offset = 0usize;
    loop {
        if cursor.remaining_bits() == 0 {
            if cursor.remaining_refs() > 0 {
                match cursor.load_ref() {
                    Ok(next) => {
                        cursor = next;
                        out.push_str("// continues in ref\n");
                        offset = 0;
                        continue;
                    }
                    Err(_) => break,
                }
            }
            break;
        }
        let before = cursor.remaining_bits();
        match decoder.next_instruction(&mut cursor) {
            Ok(decoded) => {
                let rendered: Vec<String> = decoded
                    .operands
                    .iter()
                    .map(|(n, v)| format!("{n}={v}"))
                    .collect();
                let _ = writeln!(
                    out,
                    "{offset:05} {:<16} {}",
                    decoded.spec.mnemonic,
                    rendered.join(" ")
                );
                offset += before - cursor.remaining_bits();
            }
            Err(e) => {
                let _ = writeln!(out, "// disassemble error: {e}");
                let _ = writeln!(
                    out,
                    "// undecoded tail: {} bits, {} refs: {}",
                    cursor.remaining_bits(),
                    cursor.remaining_refs(),
                    cursor
                );
                break;
            }
        }
    }
    out
}
