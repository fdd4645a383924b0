//! # Basic Block Exploration
//!
//! Symbolic stack-height analysis over a function's bytecode: computes
//! the set of basic-block leaders, the operand-stack height at entry of
//! each leader, and the maximum stack height the function ever reaches.
//!
//! The worklist starts at bci 0 with height 0, plus every catch-block
//! entry from the function's frame-range table (each with its declared
//! entry height). Scanning runs forward applying per-opcode stack deltas
//! until a terminator, enqueueing branch targets with the running height.
//!
//! Heights converging on the same bci must agree; a disagreement means
//! the snapshot violates the interpreter's stack discipline and
//! compilation aborts.

use std::collections::BTreeMap;

use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::snapshot::bytecode::{BytecodeReader, Opcode, StackDiff};
use crate::snapshot::selector::Selector;
use crate::snapshot::{FunctionObject, HeapObject, ObjectRef, Program};

/// The result of exploring one function.
#[derive(Debug, Clone)]
pub struct StackAnalysis {
    /// Basic-block leaders: bci -> operand stack height at entry.
    /// Ordered so block creation and filling are deterministic.
    pub labels: BTreeMap<u32, u32>,
    /// The maximum operand stack height reached anywhere.
    pub max_stack: u32,
}

/// Explores one function's control flow.
pub struct BasicBlocksExplorer<'p> {
    program: &'p Program,
    function: &'p FunctionObject,
}

impl<'p> BasicBlocksExplorer<'p> {
    pub fn new(program: &'p Program, function: &'p FunctionObject) -> Self {
        Self { program, function }
    }

    /// Run the analysis.
    pub fn explore(&self) -> Result<StackAnalysis, Vec<Diagnostic>> {
        let mut labels: BTreeMap<u32, i32> = BTreeMap::new();
        let mut todo: BTreeMap<u32, i32> = BTreeMap::new();
        let mut max_stack = 0i32;

        Self::enqueue(&mut labels, &mut todo, 0, 0)?;
        for range in &self.function.frame_ranges {
            Self::enqueue(
                &mut labels,
                &mut todo,
                range.start as i64,
                range.stack_height as i32,
            )?;
        }

        while let Some((&bci, &height)) = todo.iter().next() {
            todo.remove(&bci);
            self.scan_bci(bci, height, &mut labels, &mut todo, &mut max_stack)?;
        }

        let mut result = BTreeMap::new();
        for (bci, height) in labels {
            if height < 0 {
                return Err(vec![Diagnostic::error_with_code(
                    ErrorCode::StackHeightMismatch,
                    format!("operand stack underflows at bci {} (height {})", bci, height),
                )]);
            }
            result.insert(bci, height as u32);
        }
        Ok(StackAnalysis {
            labels: result,
            max_stack: max_stack.max(0) as u32,
        })
    }

    /// Scan forward from `bci`, accumulating stack deltas, until the next
    /// terminator; record branch targets with the running height.
    fn scan_bci(
        &self,
        mut bci: u32,
        mut height: i32,
        labels: &mut BTreeMap<u32, i32>,
        todo: &mut BTreeMap<u32, i32>,
        max_stack: &mut i32,
    ) -> Result<(), Vec<Diagnostic>> {
        let reader = BytecodeReader::new(&self.function.bytecode);
        loop {
            let opcode = reader.opcode_at(bci).map_err(|d| vec![d])?;
            let next_bci = bci as i64 + opcode.size() as i64;

            height += self.stack_diff_at(&reader, bci, opcode)?;
            if height > *max_stack {
                *max_stack = height;
            }

            if opcode == Opcode::MethodEnd {
                return Ok(());
            }

            match opcode {
                Opcode::BranchIfTrueWide | Opcode::BranchIfFalseWide => {
                    let delta = reader.read_i32(bci, 1).map_err(|d| vec![d])? as i64;
                    Self::enqueue(labels, todo, next_bci, height)?;
                    Self::enqueue(labels, todo, bci as i64 + delta, height)?;
                    return Ok(());
                }
                Opcode::BranchWide => {
                    let delta = reader.read_i32(bci, 1).map_err(|d| vec![d])? as i64;
                    Self::enqueue(labels, todo, bci as i64 + delta, height)?;
                    return Ok(());
                }
                Opcode::PopAndBranchWide => {
                    let delta = reader.read_i32(bci, 2).map_err(|d| vec![d])? as i64;
                    Self::enqueue(labels, todo, bci as i64 + delta, height)?;
                    return Ok(());
                }
                Opcode::BranchBackIfTrue | Opcode::BranchBackIfFalse => {
                    let delta = reader.read_u8(bci, 1).map_err(|d| vec![d])? as i64;
                    Self::enqueue(labels, todo, next_bci, height)?;
                    Self::enqueue(labels, todo, bci as i64 - delta, height)?;
                    return Ok(());
                }
                Opcode::BranchBack => {
                    let delta = reader.read_u8(bci, 1).map_err(|d| vec![d])? as i64;
                    Self::enqueue(labels, todo, bci as i64 - delta, height)?;
                    return Ok(());
                }
                Opcode::BranchBackIfTrueWide | Opcode::BranchBackIfFalseWide => {
                    let delta = reader.read_i32(bci, 1).map_err(|d| vec![d])? as i64;
                    Self::enqueue(labels, todo, next_bci, height)?;
                    Self::enqueue(labels, todo, bci as i64 - delta, height)?;
                    return Ok(());
                }
                Opcode::BranchBackWide => {
                    let delta = reader.read_i32(bci, 1).map_err(|d| vec![d])? as i64;
                    Self::enqueue(labels, todo, bci as i64 - delta, height)?;
                    return Ok(());
                }
                Opcode::PopAndBranchBackWide => {
                    let delta = reader.read_i32(bci, 2).map_err(|d| vec![d])? as i64;
                    Self::enqueue(labels, todo, bci as i64 - delta, height)?;
                    return Ok(());
                }
                Opcode::Return => return Ok(()),
                Opcode::SubroutineCall => {
                    // Catch-block plumbing; the subroutine body continues
                    // at the call target with the current height.
                    let delta = reader.read_i32(bci, 1).map_err(|d| vec![d])? as i64;
                    Self::enqueue(labels, todo, bci as i64 + delta, height)?;
                    return Ok(());
                }
                _ => {}
            }

            bci = next_bci as u32;
        }
    }

    /// The stack delta of the instruction at `bci`: a table lookup for
    /// fixed-delta opcodes, computed from operands otherwise.
    fn stack_diff_at(
        &self,
        reader: &BytecodeReader,
        bci: u32,
        opcode: Opcode,
    ) -> Result<i32, Vec<Diagnostic>> {
        if let StackDiff::Fixed(diff) = opcode.stack_diff() {
            return Ok(diff);
        }

        match opcode {
            Opcode::InvokeMethod => {
                let selector = reader.read_i32(bci, 1).map_err(|d| vec![d])?;
                // Arity counts arguments; the receiver is popped as well.
                let arity = Selector::arity(selector) as i32 + 1;
                Ok(1 - arity)
            }
            Opcode::InvokeSelector => {
                let items = reader.read_u8(bci, 1).map_err(|d| vec![d])? as i32;
                Ok(1 - items)
            }
            Opcode::InvokeFactory | Opcode::InvokeStatic => {
                let function = self.function_literal_at(reader, bci)?;
                Ok(1 - function.arity as i32)
            }
            Opcode::Drop => {
                let items = reader.read_u8(bci, 1).map_err(|d| vec![d])? as i32;
                Ok(-items)
            }
            Opcode::Allocate | Opcode::AllocateImmutable => {
                let class = self.class_literal_at(reader, bci)?;
                Ok(1 - class.instance_fields as i32)
            }
            Opcode::EnterNoSuchMethod => {
                // The interpreter's no-such-method frame setup charges a
                // fixed 80 slots; treated as an opaque bump here.
                Ok(80)
            }
            Opcode::SubroutineCall => Ok(1),
            Opcode::PopAndBranchWide | Opcode::PopAndBranchBackWide => {
                let items = reader.read_u8(bci, 1).map_err(|d| vec![d])? as i32;
                Ok(-items)
            }
            Opcode::InvokeNoSuchMethod => {
                let selector = reader.read_i32(bci, 1).map_err(|d| vec![d])?;
                Ok(-(Selector::arity(selector) as i32))
            }
            _ => Err(vec![Diagnostic::error_with_code(
                ErrorCode::MalformedBytecode,
                format!(
                    "missing stack delta for '{}' at bci {}",
                    reader.bytecode_string(bci),
                    bci
                ),
            )]),
        }
    }

    fn literal_at(&self, reader: &BytecodeReader, bci: u32) -> Result<ObjectRef, Vec<Diagnostic>> {
        let index = reader.read_i32(bci, 1).map_err(|d| vec![d])?;
        self.function.literal_at(index as usize).ok_or_else(|| {
            vec![Diagnostic::error_with_code(
                ErrorCode::BadLiteralIndex,
                format!("literal index {} out of range at bci {}", index, bci),
            )]
        })
    }

    fn function_literal_at(
        &self,
        reader: &BytecodeReader,
        bci: u32,
    ) -> Result<&'p crate::snapshot::FunctionObject, Vec<Diagnostic>> {
        let literal = self.literal_at(reader, bci)?;
        match literal.as_heap().and_then(|id| self.program.heap().get(id)) {
            Some(HeapObject::Function(function)) => Ok(function),
            _ => Err(vec![Diagnostic::error_with_code(
                ErrorCode::BadObjectKind,
                format!("bci {} expects a function literal", bci),
            )]),
        }
    }

    fn class_literal_at(
        &self,
        reader: &BytecodeReader,
        bci: u32,
    ) -> Result<&'p crate::snapshot::ClassObject, Vec<Diagnostic>> {
        let literal = self.literal_at(reader, bci)?;
        match literal.as_heap().and_then(|id| self.program.heap().get(id)) {
            Some(HeapObject::Class(class)) => Ok(class),
            _ => Err(vec![Diagnostic::error_with_code(
                ErrorCode::BadObjectKind,
                format!("bci {} expects a class literal", bci),
            )]),
        }
    }

    /// Record `bci` as a leader with `height`, scheduling it for scanning
    /// if new. Converging heights must agree.
    fn enqueue(
        labels: &mut BTreeMap<u32, i32>,
        todo: &mut BTreeMap<u32, i32>,
        bci: i64,
        height: i32,
    ) -> Result<(), Vec<Diagnostic>> {
        if bci < 0 || bci > u32::MAX as i64 {
            return Err(vec![Diagnostic::error_with_code(
                ErrorCode::MalformedBytecode,
                format!("branch target {} out of range", bci),
            )]);
        }
        let bci = bci as u32;
        match labels.get(&bci) {
            None => {
                labels.insert(bci, height);
                todo.insert(bci, height);
                Ok(())
            }
            Some(&existing) if existing == height => Ok(()),
            Some(&existing) => Err(vec![Diagnostic::error_with_code(
                ErrorCode::StackHeightMismatch,
                format!(
                    "bci {} reached with stack heights {} and {}",
                    bci, existing, height
                ),
            )]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::bytecode::BytecodeAssembler;
    use crate::snapshot::ProgramBuilder;

    fn analyze(arity: usize, bytecode: Vec<u8>) -> StackAnalysis {
        let mut builder = ProgramBuilder::new();
        let entry = builder.add_function(arity, bytecode);
        let program = builder.finish(entry);
        let function = program.heap().function(entry).unwrap();
        BasicBlocksExplorer::new(&program, function)
            .explore()
            .expect("exploration failed")
    }

    #[test]
    fn straight_line_method() {
        let mut asm = BytecodeAssembler::new();
        asm.emit(Opcode::ReturnNull).emit(Opcode::MethodEnd);
        let analysis = analyze(0, asm.finish());
        assert_eq!(analysis.labels.len(), 1);
        assert_eq!(analysis.labels[&0], 0);
        assert_eq!(analysis.max_stack, 0);
    }

    #[test]
    fn literals_raise_the_watermark() {
        let mut asm = BytecodeAssembler::new();
        asm.emit(Opcode::LoadLiteral0)
            .emit(Opcode::LoadLiteral1)
            .emit(Opcode::Pop)
            .emit(Opcode::Pop)
            .emit(Opcode::ReturnNull)
            .emit(Opcode::MethodEnd);
        let analysis = analyze(0, asm.finish());
        assert_eq!(analysis.max_stack, 2);
    }

    #[test]
    fn conditional_branch_creates_two_leaders() {
        // 0: load literal true        (h 0 -> 1)
        // 1: branch-if-true +10 -> 11 (h 1 -> 0)
        // 6: branch wide +5    -> 11
        // 11: return null
        // 12: method end
        let mut asm = BytecodeAssembler::new();
        asm.emit(Opcode::LoadLiteralTrue)
            .emit_i32(Opcode::BranchIfTrueWide, 10)
            .emit_i32(Opcode::BranchWide, 5)
            .emit(Opcode::ReturnNull)
            .emit(Opcode::MethodEnd);
        let analysis = analyze(0, asm.finish());
        // Leaders: entry, fallthrough (6), target (11).
        assert_eq!(
            analysis.labels.keys().copied().collect::<Vec<_>>(),
            vec![0, 6, 11]
        );
        assert_eq!(analysis.labels[&6], 0);
        assert_eq!(analysis.labels[&11], 0);
        assert_eq!(analysis.max_stack, 1);
    }

    #[test]
    fn back_edges_terminate() {
        // 0: load literal true
        // 1: branch-back-if-true -1 (target 0), fallthrough 3
        // 3: return null
        // 4: method end
        let mut asm = BytecodeAssembler::new();
        asm.emit(Opcode::LoadLiteralTrue)
            .emit_u8(Opcode::BranchBackIfTrue, 1)
            .emit(Opcode::ReturnNull)
            .emit(Opcode::MethodEnd);
        let analysis = analyze(0, asm.finish());
        assert!(analysis.labels.contains_key(&0));
        assert!(analysis.labels.contains_key(&3));
    }

    #[test]
    fn catch_blocks_seed_the_worklist() {
        let mut asm = BytecodeAssembler::new();
        asm.emit(Opcode::ReturnNull) // 0
            .emit(Opcode::Pop) // 1: catch entry, height 1
            .emit(Opcode::ReturnNull) // 2
            .emit(Opcode::MethodEnd);
        let mut builder = ProgramBuilder::new();
        let entry = builder.add_function(0, asm.finish());
        builder.set_frame_ranges(
            entry,
            vec![crate::snapshot::FrameRange { start: 1, end: 3, stack_height: 1 }],
        );
        let program = builder.finish(entry);
        let function = program.heap().function(entry).unwrap();
        let analysis = BasicBlocksExplorer::new(&program, function)
            .explore()
            .unwrap();
        assert_eq!(analysis.labels[&1], 1);
    }

    #[test]
    fn disagreeing_heights_are_rejected() {
        // 0:  load literal true          h 0 -> 1
        // 1:  branch-if-true +11 -> 12   h 1 -> 0, records 12 at height 0
        // 6:  load literal 0             h 0 -> 1
        // 7:  branch wide +5 -> 12       records 12 at height 1: conflict
        // 12: return null
        let mut asm = BytecodeAssembler::new();
        asm.emit(Opcode::LoadLiteralTrue)
            .emit_i32(Opcode::BranchIfTrueWide, 11)
            .emit(Opcode::LoadLiteral0)
            .emit_i32(Opcode::BranchWide, 5)
            .emit(Opcode::ReturnNull)
            .emit(Opcode::MethodEnd);
        let mut builder = ProgramBuilder::new();
        let entry = builder.add_function(0, asm.finish());
        let program = builder.finish(entry);
        let function = program.heap().function(entry).unwrap();
        let result = BasicBlocksExplorer::new(&program, function).explore();
        assert!(result.is_err());
        let diagnostics = result.unwrap_err();
        assert_eq!(
            diagnostics[0].code,
            Some(ErrorCode::StackHeightMismatch)
        );
    }

    #[test]
    fn invoke_method_delta_counts_receiver() {
        use crate::snapshot::selector::{Selector, SelectorKind};
        // arity-2 selector: pops receiver + 2 args, pushes result.
        let selector = Selector::encode(7, SelectorKind::Method, 2);
        let mut asm = BytecodeAssembler::new();
        asm.emit_u8(Opcode::LoadLocal, 5)
            .emit_u8(Opcode::LoadLocal, 5)
            .emit_u8(Opcode::LoadLocal, 5)
            .emit_i32(Opcode::InvokeMethod, selector)
            .emit(Opcode::Return)
            .emit(Opcode::MethodEnd);
        let analysis = analyze(3, asm.finish());
        assert_eq!(analysis.max_stack, 3);
    }
}
