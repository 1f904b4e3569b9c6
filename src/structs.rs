//! Struct matching with layout planning.
//!
//! Runs of consecutive fixed-size members are read as one block and decoded
//! from memory; variable-size members and dynamic items (`case`, `if`,
//! `assert`, ...) are matched directly against the input. Errors inside a
//! block still carry absolute stream offsets.

use crate::context::Context;
use crate::input::Input;
use crate::ruler::{MatchError, Ruler, ERROR_CONTEXT};
use crate::value::Value;
use crate::vm::Expr;
use std::sync::Arc;

/// Member name whose value is matched but never bound.
pub const SKIP: &str = "_";

#[derive(Debug, Clone)]
pub enum Item {
    Member { name: String, rule: Arc<dyn Ruler> },
    /// Unnamed unit matched in the struct's own context.
    Dynamic(Arc<dyn Ruler>),
}

#[derive(Debug)]
enum Step {
    Block { size: usize, members: Vec<(String, Arc<dyn Ruler>)> },
    Member(String, Arc<dyn Ruler>),
    Item(Arc<dyn Ruler>),
}

#[derive(Debug)]
pub struct Struct {
    steps: Vec<Step>,
    ret: Option<Expr>,
    size: Option<usize>,
    names: Vec<String>,
}

impl Struct {
    pub fn new(items: Vec<Item>, ret: Option<Expr>) -> Self {
        let mut steps = Vec::new();
        let mut size = Some(0usize);
        let mut names = Vec::new();
        let mut run: Vec<(String, Arc<dyn Ruler>)> = Vec::new();
        let mut run_size = 0usize;

        for item in items {
            match item {
                Item::Member { name, rule } => {
                    names.push(name.clone());
                    let member_size = rule.size_of();
                    size = size.zip(member_size).and_then(|(a, b)| a.checked_add(b));
                    match member_size {
                        Some(n) if n > 0 => {
                            if run_size.checked_add(n).is_none() {
                                flush(&mut steps, &mut run, &mut run_size);
                            }
                            run_size += n;
                            run.push((name, rule));
                        }
                        _ => {
                            flush(&mut steps, &mut run, &mut run_size);
                            steps.push(Step::Member(name, rule));
                        }
                    }
                }
                Item::Dynamic(rule) => {
                    size = size.zip(rule.size_of()).and_then(|(a, b)| a.checked_add(b));
                    flush(&mut steps, &mut run, &mut run_size);
                    steps.push(Step::Item(rule));
                }
            }
        }
        flush(&mut steps, &mut run, &mut run_size);
        Struct { steps, ret, size, names }
    }

    /// Number of block reads the layout planner produced (for tests and tooling).
    pub fn block_count(&self) -> usize {
        self.steps.iter().filter(|s| matches!(s, Step::Block { .. })).count()
    }
}

fn flush(steps: &mut Vec<Step>, run: &mut Vec<(String, Arc<dyn Ruler>)>, run_size: &mut usize) {
    if run.is_empty() {
        return;
    }
    let members = std::mem::take(run);
    if members.len() == 1 {
        if let Some((name, rule)) = members.into_iter().next() {
            steps.push(Step::Member(name, rule));
        }
    } else {
        steps.push(Step::Block { size: *run_size, members });
    }
    *run_size = 0;
}

fn match_member(
    name: &str,
    rule: &Arc<dyn Ruler>,
    input: &mut Input<'_>,
    ctx: &mut Context<'_>,
) -> Result<(), MatchError> {
    let v = {
        let mut sub = ctx.child();
        rule.match_in(input, &mut sub)?
    };
    if name != SKIP {
        ctx.bind(name, v)?;
    }
    Ok(())
}

impl Ruler for Struct {
    fn match_in(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        self.match_step(input, ctx)?;
        match &self.ret {
            Some(expr) => expr.eval(ctx),
            None => Ok(ctx.dom()),
        }
    }

    fn match_step(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<(), MatchError> {
        ctx.require_map()?;
        for step in &self.steps {
            match step {
                Step::Block { size, members } => {
                    let base = input.offset();
                    let data = input.take_exact(*size)?;
                    let mut block = Input::from_bytes(&data);
                    for (name, rule) in members {
                        match_member(name, rule, &mut block, ctx)
                            .map_err(|e| e.rebase(base, input.lookahead(ERROR_CONTEXT)))?;
                    }
                }
                Step::Member(name, rule) => match_member(name, rule, input, ctx)?,
                Step::Item(rule) => rule.match_step(input, ctx)?,
            }
        }
        Ok(())
    }

    fn size_of(&self) -> Option<usize> {
        self.size
    }

    fn full_name(&self) -> String {
        format!("{{{}}}", self.names.join("; "))
    }
}
