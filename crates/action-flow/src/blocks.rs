//! Block structure compiled from the flat `if`/`end_if` and loop markers

use std::collections::HashMap;

use crate::errors::FlowError;
use crate::model::Step;
use crate::operation::OperationKind;

/// Jump targets for every block marker in a step list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMap {
    /// `if`, `else` and loop openers to their terminator
    ends: HashMap<usize, usize>,
    /// `if` to its `else`
    elses: HashMap<usize, usize>,
    /// `end_loop` back to its opener
    starts: HashMap<usize, usize>,
}

#[derive(Debug, Clone, Copy)]
enum Open {
    If { at: usize, else_at: Option<usize> },
    Loop { at: usize },
}

impl BlockMap {
    /// Pair up block markers; any imbalance rejects the whole list.
    pub fn compile(steps: &[Step]) -> Result<Self, FlowError> {
        let mut map = BlockMap::default();
        let mut stack: Vec<Open> = Vec::new();

        for (index, step) in steps.iter().enumerate() {
            let Some(kind) = step.kind() else { continue };
            match kind {
                OperationKind::If => stack.push(Open::If { at: index, else_at: None }),
                OperationKind::Else => match stack.last_mut() {
                    Some(Open::If { else_at, .. }) if else_at.is_none() => *else_at = Some(index),
                    Some(Open::If { .. }) => {
                        return Err(structure(index, step, "second else for the same if"))
                    }
                    _ => return Err(structure(index, step, "else without an open if")),
                },
                OperationKind::EndIf => match stack.pop() {
                    Some(Open::If { at, else_at }) => {
                        map.ends.insert(at, index);
                        if let Some(else_at) = else_at {
                            map.elses.insert(at, else_at);
                            map.ends.insert(else_at, index);
                        }
                    }
                    Some(Open::Loop { at }) => {
                        return Err(structure(
                            index,
                            step,
                            &format!("end_if closes the loop opened at step {at}"),
                        ))
                    }
                    None => return Err(structure(index, step, "end_if without an open if")),
                },
                kind if kind.opens_loop() => stack.push(Open::Loop { at: index }),
                OperationKind::EndLoop => match stack.pop() {
                    Some(Open::Loop { at }) => {
                        map.ends.insert(at, index);
                        map.starts.insert(index, at);
                    }
                    Some(Open::If { at, .. }) => {
                        return Err(structure(
                            index,
                            step,
                            &format!("end_loop closes the if opened at step {at}"),
                        ))
                    }
                    None => return Err(structure(index, step, "end_loop without an open loop")),
                },
                _ => {}
            }
        }

        if let Some(open) = stack.pop() {
            let at = match open {
                Open::If { at, .. } | Open::Loop { at } => at,
            };
            return Err(structure(at, &steps[at], "block is never closed"));
        }
        Ok(map)
    }

    pub fn end_of(&self, index: usize) -> Option<usize> {
        self.ends.get(&index).copied()
    }

    pub fn else_of(&self, index: usize) -> Option<usize> {
        self.elses.get(&index).copied()
    }

    /// Number of `if` and loop blocks.
    pub fn block_count(&self) -> usize {
        self.ends.len() - self.elses.len()
    }

    pub fn start_of(&self, end_index: usize) -> Option<usize> {
        self.starts.get(&end_index).copied()
    }
}

fn structure(index: usize, step: &Step, reason: &str) -> FlowError {
    FlowError::InvalidStructure(format!(
        "step {index} ('{}', {}): {reason}",
        step.id, step.operation
    ))
}
