//! Instruction-set catalog: the structured description of every opcode the
//! decoder and lifter understand. Loaded from JSON; the built-in codepage
//! ships with the crate and is parsed once on first use.

use std::sync::LazyLock;

use serde::Deserialize;

pub const CATEGORY_STACK_BASIC: &str = "stack_basic";
pub const CATEGORY_STACK_COMPLEX: &str = "stack_complex";
pub const CATEGORY_CONST_INT: &str = "const_int";
pub const CATEGORY_CONST_DATA: &str = "const_data";

#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    pub instructions: Vec<Instruction>,
}

impl Catalog {
    pub fn from_json(json: &str) -> Result<Catalog, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn builtin() -> &'static Catalog {
        static BUILTIN: LazyLock<Catalog> = LazyLock::new(|| {
            Catalog::from_json(include_str!("../spec/cp0.json"))
                .expect("built-in catalog must parse")
        });
        &BUILTIN
    }

    pub fn by_mnemonic(&self, mnemonic: &str) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.mnemonic == mnemonic)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Instruction {
    pub mnemonic: String,
    pub bytecode: Bytecode,
    pub doc: Doc,
    #[serde(default)]
    pub value_flow: Option<ValueFlow>,
    #[serde(default)]
    pub control_flow: Option<ControlFlow>,
}

impl Instruction {
    pub fn category(&self) -> &str {
        &self.doc.category
    }

    pub fn is_shuffle(&self) -> bool {
        matches!(self.category(), CATEGORY_STACK_BASIC | CATEGORY_STACK_COMPLEX)
    }

    pub fn is_const(&self) -> bool {
        matches!(self.category(), CATEGORY_CONST_INT | CATEGORY_CONST_DATA)
    }

    pub fn branches(&self) -> &[Branch] {
        self.control_flow.as_ref().map(|c| c.branches.as_slice()).unwrap_or(&[])
    }

    /// Whether control may continue past this instruction.
    pub fn nobranch(&self) -> bool {
        self.control_flow.as_ref().map(|c| c.nobranch).unwrap_or(true)
    }

    pub fn operand(&self, name: &str) -> Option<&OperandSpec> {
        self.bytecode.operands.iter().find(|o| o.name() == name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bytecode {
    /// Bit-string of '0'/'1' characters, most significant bit first.
    pub prefix: String,
    #[serde(default)]
    pub operands_range_check: Option<RangeCheck>,
    #[serde(default)]
    pub operands: Vec<OperandSpec>,
}

/// Disambiguates overlapping prefixes: the `length` bits following the prefix,
/// read unsigned, must fall within `[from, to]` for the match to stand.
#[derive(Debug, Clone, Deserialize)]
pub struct RangeCheck {
    pub length: usize,
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperandSpec {
    Uint {
        name: String,
        size: usize,
        #[serde(default)]
        display_hints: Vec<DisplayHint>,
    },
    Int {
        name: String,
        size: usize,
        #[serde(default)]
        display_hints: Vec<DisplayHint>,
    },
    Ref {
        name: String,
        #[serde(default)]
        display_hints: Vec<DisplayHint>,
    },
    /// 5-bit unsigned length `l`, then an `8*l + 19`-bit signed integer.
    LongInt {
        name: String,
    },
    Subslice {
        name: String,
        #[serde(default)]
        bits_length_var: Option<String>,
        #[serde(default)]
        bits_padding: usize,
        #[serde(default)]
        refs_length_var: Option<String>,
        #[serde(default)]
        refs_add: usize,
        #[serde(default)]
        completion_tag: bool,
        #[serde(default)]
        display_hints: Vec<DisplayHint>,
    },
}

impl OperandSpec {
    pub fn name(&self) -> &str {
        match self {
            OperandSpec::Uint { name, .. }
            | OperandSpec::Int { name, .. }
            | OperandSpec::Ref { name, .. }
            | OperandSpec::LongInt { name }
            | OperandSpec::Subslice { name, .. } => name,
        }
    }

    pub fn display_hints(&self) -> &[DisplayHint] {
        match self {
            OperandSpec::Uint { display_hints, .. }
            | OperandSpec::Int { display_hints, .. }
            | OperandSpec::Ref { display_hints, .. }
            | OperandSpec::Subslice { display_hints, .. } => display_hints,
            OperandSpec::LongInt { .. } => &[],
        }
    }

    pub fn is_continuation(&self) -> bool {
        self.display_hints().iter().any(|h| matches!(h, DisplayHint::Continuation))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisplayHint {
    Continuation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Doc {
    pub category: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValueFlow {
    #[serde(default)]
    pub inputs: Option<StackFlow>,
    #[serde(default)]
    pub outputs: Option<StackFlow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StackFlow {
    #[serde(default)]
    pub stack: Option<Vec<StackEntry>>,
}

/// One declared stack slot, bottom entries first.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StackEntry {
    Simple {
        name: String,
        #[serde(default)]
        value_types: Vec<String>,
    },
    Const {
        value_type: String,
        #[serde(default)]
        value: Option<i64>,
    },
    Array {
        name: String,
        length_var: String,
        array_entry: Vec<StackEntry>,
    },
    /// Mutually exclusive runtime outcomes with possibly different residues.
    Conditional {
        name: String,
        #[serde(rename = "match")]
        arms: Vec<MatchArm>,
        #[serde(default, rename = "else")]
        otherwise: Option<Vec<StackEntry>>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchArm {
    pub value: i64,
    pub stack: Vec<StackEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlFlow {
    #[serde(default)]
    pub branches: Vec<Branch>,
    #[serde(default)]
    pub nobranch: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Branch {
    #[serde(rename = "type")]
    pub kind: String,
    pub var_name: String,
    #[serde(default)]
    pub save: Option<SaveSpec>,
}

impl Branch {
    /// A branch that does not save the current continuation into c0 never
    /// returns here: the instruction transfers control away.
    pub fn is_jump(&self) -> bool {
        !matches!(
            self.save.as_ref().and_then(|s| s.c0.as_ref()),
            Some(SavedValue { kind }) if kind == "cc"
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaveSpec {
    #[serde(default)]
    pub c0: Option<SavedValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SavedValue {
    #[serde(rename = "type")]
    pub kind: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_parses() {
        let catalog = Catalog::builtin();
        assert!(catalog.instructions.len() > 50);
        for instr in &catalog.instructions {
            assert!(!instr.bytecode.prefix.is_empty(), "{} has no prefix", instr.mnemonic);
            assert!(
                instr.bytecode.prefix.chars().all(|c| c == '0' || c == '1'),
                "{} prefix is not a bit-string",
                instr.mnemonic
            );
        }
    }

    #[test]
    fn builtin_catalog_has_the_dispatch_prologue() {
        let catalog = Catalog::builtin();
        for m in ["SETCP", "DICTPUSHCONST", "DICTIGETJMPZ", "THROWARG"] {
            assert!(catalog.by_mnemonic(m).is_some(), "missing {m}");
        }
    }

    #[test]
    fn branch_jump_classification() {
        let call: Branch = serde_json::from_str(
            r#"{"type": "variable", "var_name": "c", "save": {"c0": {"type": "cc"}}}"#,
        )
        .unwrap();
        assert!(!call.is_jump());
        let jump: Branch =
            serde_json::from_str(r#"{"type": "variable", "var_name": "c"}"#).unwrap();
        assert!(jump.is_jump());
    }

    #[test]
    fn conditional_entry_round_trips() {
        let entry: StackEntry = serde_json::from_str(
            r#"{
                "type": "conditional",
                "name": "status",
                "match": [{"value": -1, "stack": [{"type": "simple", "name": "x"}]}],
                "else": [{"type": "simple", "name": "s"}]
            }"#,
        )
        .unwrap();
        match entry {
            StackEntry::Conditional { arms, otherwise, .. } => {
                assert_eq!(arms.len(), 1);
                assert_eq!(arms[0].value, -1);
                assert!(otherwise.is_some());
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }
}
