//! IR-to-IR transformation passes.
//!
//! Passes are infallible on well-formed IR and must keep it well-formed:
//! every reference still resolves, statement order is preserved for the
//! survivors, and producers whose output escapes through `result` are never
//! dropped. The pipeline descends into continuation operands before running
//! its passes, rebuilding containers only when an inner function actually
//! changed.

use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

use tracing::debug;

use crate::ir::{InputArg, IrFunction, Primitive, Program, Value};
use crate::spec::{CATEGORY_CONST_DATA, CATEGORY_CONST_INT};

pub trait Pass {
    fn name(&self) -> &'static str;
    fn run(&self, f: IrFunction) -> IrFunction;
}

pub struct Pipeline {
    passes: Vec<Box<dyn Pass>>,
}

impl Pipeline {
    pub fn empty() -> Self {
        Self { passes: Vec::new() }
    }

    /// The built-in pipeline; order matters.
    pub fn standard() -> Self {
        Self::empty().with_pass(InlineConstants).with_pass(InlinePrevSingleUse)
    }

    pub fn with_pass(mut self, pass: impl Pass + 'static) -> Self {
        self.passes.push(Box::new(pass));
        self
    }

    pub fn run_program(&self, program: Program) -> Program {
        match program {
            Program::Single { entry } => Program::Single { entry: self.run_function(entry) },
            Program::Multi { methods } => {
                let methods: BTreeMap<_, _> = methods
                    .into_iter()
                    .map(|(id, f)| (id, self.run_function(f)))
                    .collect();
                Program::Multi { methods }
            }
        }
    }

    pub fn run_function(&self, f: IrFunction) -> IrFunction {
        let mut f = self.descend(f);
        for pass in &self.passes {
            debug!(pass = pass.name(), "running");
            f = pass.run(f);
        }
        f
    }

    fn descend(&self, mut f: IrFunction) -> IrFunction {
        for prim in &mut f.body {
            self.descend_primitive(prim);
        }
        f
    }

    fn descend_primitive(&self, prim: &mut Primitive) {
        for (_, value) in &mut prim.operands {
            match value {
                Value::Cont(inner) => {
                    let transformed = self.run_function((**inner).clone());
                    if transformed != **inner {
                        *inner = Rc::new(transformed);
                    }
                }
                Value::ContMap(map) => {
                    let mut changed = false;
                    let next: BTreeMap<_, _> = map
                        .iter()
                        .map(|(id, inner)| {
                            let transformed = self.run_function((**inner).clone());
                            if transformed != **inner {
                                changed = true;
                                (*id, Rc::new(transformed))
                            } else {
                                (*id, Rc::clone(inner))
                            }
                        })
                        .collect();
                    if changed {
                        *map = next;
                    }
                }
                _ => {}
            }
        }
        for (_, arg) in &mut prim.inputs {
            if let InputArg::Inline(inner) = arg {
                self.descend_primitive(inner);
            }
        }
    }
}

/// Inline every constant-producing statement into all of its uses. The
/// producer is deleted unless its output escapes through `result`.
pub struct InlineConstants;

impl Pass for InlineConstants {
    fn name(&self) -> &'static str {
        "inline-consts"
    }

    fn run(&self, mut f: IrFunction) -> IrFunction {
        let result_ids: HashSet<String> = f.result.iter().map(|r| r.id.clone()).collect();
        let mut i = 0;
        while i < f.body.len() {
            let prim = &f.body[i];
            let constant = matches!(prim.category.as_str(), CATEGORY_CONST_INT | CATEGORY_CONST_DATA);
            let single = prim.single_output().map(|d| d.id.clone());
            match single {
                Some(id) if constant => {
                    let producer = f.body[i].clone();
                    for later in f.body.iter_mut().skip(i + 1) {
                        substitute(later, &id, &producer);
                    }
                    if result_ids.contains(&id) {
                        i += 1;
                    } else {
                        f.body.remove(i);
                    }
                }
                _ => i += 1,
            }
        }
        f
    }
}

/// Inline an immediately-preceding producer into its unique consumer.
/// Adjacency keeps observable effects in order, so side effects are fine.
pub struct InlinePrevSingleUse;

impl Pass for InlinePrevSingleUse {
    fn name(&self) -> &'static str {
        "inline-prev-single-use"
    }

    fn run(&self, mut f: IrFunction) -> IrFunction {
        let result_ids: HashSet<String> = f.result.iter().map(|r| r.id.clone()).collect();
        'scan: loop {
            for i in 0..f.body.len().saturating_sub(1) {
                let Some(id) = f.body[i].single_output().map(|d| d.id.clone()) else {
                    continue;
                };
                if result_ids.contains(&id) {
                    continue;
                }
                let total: usize = f.body.iter().map(|p| count_uses(p, &id)).sum();
                if total != 1 || count_uses(&f.body[i + 1], &id) != 1 {
                    continue;
                }
                let producer = f.body.remove(i);
                substitute(&mut f.body[i], &id, &producer);
                // indices shifted; rescan from the top
                continue 'scan;
            }
            break;
        }
        f
    }
}

fn substitute(prim: &mut Primitive, id: &str, producer: &Primitive) {
    for (_, arg) in &mut prim.inputs {
        match arg {
            InputArg::Ref(r) if r.id == id => {
                *arg = InputArg::Inline(Box::new(producer.clone()));
            }
            InputArg::Inline(inner) => substitute(inner, id, producer),
            _ => {}
        }
    }
}

fn count_uses(prim: &Primitive, id: &str) -> usize {
    prim.inputs
        .iter()
        .map(|(_, arg)| match arg {
            InputArg::Ref(r) => usize::from(r.id == id),
            InputArg::Inline(inner) => count_uses(inner, id),
        })
        .sum()
}
