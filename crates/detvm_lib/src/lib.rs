//! detvm: decompiles cell-tree stack-machine bytecode into pseudo code.
//!
//! The pipeline: deserialize the container into a cell DAG, decode opcodes
//! against an instruction catalog, lift them symbolically into a dataflow IR,
//! run the inlining passes, and render. The analysis itself is total; only
//! the outer surface (container parsing, catalog parsing) can fail.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod boc;
pub mod cell;
pub mod decoder;
pub mod dict;
pub mod ir;
pub mod lifter;
pub mod passes;
pub mod printer;
pub mod spec;
pub mod stack;

pub use boc::BocError;
pub use cell::{Cell, CellBuilder, CellError, CellSlice};
pub use decoder::{DecodeError, Decoder, OperandValue};
pub use ir::{InputArg, IrFunction, Primitive, Program, Value, VarDef, VarRef};
pub use lifter::{LiftError, Lifter, MAX_UNDERFLOW_RETRIES};
pub use passes::{Pass, Pipeline};
pub use spec::Catalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecompileMode {
    Pseudo,
    Disasm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompileOptions {
    pub mode: DecompileMode,
    /// Run the inlining passes before rendering.
    pub inline: bool,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self { mode: DecompileMode::Pseudo, inline: true }
    }
}

#[derive(Debug, Error)]
pub enum DetvmError {
    #[error("container error: {0}")]
    Boc(#[from] BocError),

    #[error("catalog error: {0}")]
    Catalog(#[from] serde_json::Error),
}

pub struct Decompiler {
    catalog: Cow<'static, Catalog>,
}

impl Decompiler {
    /// Decompiler over the built-in catalog.
    pub fn new() -> Self {
        Self { catalog: Cow::Borrowed(Catalog::builtin()) }
    }

    pub fn with_catalog(catalog: Catalog) -> Self {
        Self { catalog: Cow::Owned(catalog) }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Lift a root slice into a program. Total: analysis failures are
    /// recorded inside the returned IR, never raised.
    pub fn program(&self, root: &CellSlice) -> Program {
        Lifter::new(self.catalog()).program(root)
    }

    /// Lift a single code slice, ignoring the entry heuristic.
    pub fn lift(&self, slice: &CellSlice) -> IrFunction {
        Lifter::new(self.catalog()).lift(slice)
    }

    pub fn decompile_slice(&self, root: &CellSlice, options: DecompileOptions) -> String {
        match options.mode {
            DecompileMode::Disasm => {
                printer::disassemble(&Decoder::new(self.catalog()), root)
            }
            DecompileMode::Pseudo => {
                let mut program = self.program(root);
                if options.inline {
                    program = Pipeline::standard().run_program(program);
                }
                printer::render_program(&program)
            }
        }
    }
}

impl Default for Decompiler {
    fn default() -> Self {
        Self::new()
    }
}

pub fn decompile(container: &[u8]) -> Result<String, DetvmError> {
    decompile_with_options(container, DecompileOptions::default())
}

pub fn decompile_with_options(
    container: &[u8],
    options: DecompileOptions,
) -> Result<String, DetvmError> {
    let root = boc::parse(container)?;
    Ok(Decompiler::new().decompile_slice(&root, options))
}
