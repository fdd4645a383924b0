//! # GC-Intrinsic Lowering
//!
//! The final function-level transform: rewrites every call to the
//! GC-address-space intrinsics into machine-address arithmetic and plain
//! loads/stores. Until this pass runs, tagged-pointer dereferences are
//! opaque calls the optimizer cannot misinterpret; afterwards the module
//! contains no remaining calls to the intrinsic symbols.
//!
//! | Intrinsic | Lowering |
//! |-----------|----------|
//! | `tagread(p)` | byte-cast, GEP −1 (untag), plain load, cast to AS1 |
//! | `tagwrite(v, p)` | byte-cast, GEP −1, plain store through the AS0 view |
//! | `smitoint[64](p)` | pointer-to-int, arithmetic shift right by 1 |
//! | `inttosmi[64](n)` | `n + n` (tag bit stays clear), int-to-pointer |

use either::Either;
use inkwell::values::{BasicValue, BasicValueEnum, InstructionOpcode, InstructionValue, PointerValue};

use crate::diagnostics::Diagnostic;
use crate::ice;

use super::world::{
    World, INTRINSIC_INT_TO_SMI, INTRINSIC_INT_TO_SMI64, INTRINSIC_SMI_TO_INT,
    INTRINSIC_SMI_TO_INT64, INTRINSIC_TAGREAD, INTRINSIC_TAGWRITE,
};

/// Rewrites GC-intrinsic call sites in place.
pub struct RewriteGcIntrinsics<'ctx, 'p, 'w> {
    w: &'w World<'ctx, 'p>,
}

impl<'ctx, 'p, 'w> RewriteGcIntrinsics<'ctx, 'p, 'w> {
    pub fn new(w: &'w World<'ctx, 'p>) -> Self {
        Self { w }
    }

    /// Run over every function in the module.
    pub fn run(&self) -> Result<(), Vec<Diagnostic>> {
        let mut function = self.w.module.get_first_function();
        while let Some(current) = function {
            for block in current.get_basic_blocks() {
                // A rewrite splices instructions around the erased call;
                // restart the block scan after each one.
                while self.rewrite_one(block)? {}
            }
            function = current.get_next_function();
        }
        Ok(())
    }

    /// Rewrite the first intrinsic call found in `block`. Returns whether
    /// a rewrite happened.
    fn rewrite_one(&self, block: inkwell::basic_block::BasicBlock<'ctx>) -> Result<bool, Vec<Diagnostic>> {
        for instruction in block.get_instructions() {
            if instruction.get_opcode() != InstructionOpcode::Call {
                continue;
            }
            let Some(callee) = Self::callee_name(&instruction) else { continue };

            match callee.as_str() {
                INTRINSIC_TAGREAD => {
                    self.rewrite_tagread(instruction)?;
                    return Ok(true);
                }
                INTRINSIC_TAGWRITE => {
                    self.rewrite_tagwrite(instruction)?;
                    return Ok(true);
                }
                INTRINSIC_SMI_TO_INT => {
                    self.rewrite_smi_to_int(instruction, self.w.int32_type)?;
                    return Ok(true);
                }
                INTRINSIC_SMI_TO_INT64 => {
                    self.rewrite_smi_to_int(instruction, self.w.int64_type)?;
                    return Ok(true);
                }
                INTRINSIC_INT_TO_SMI | INTRINSIC_INT_TO_SMI64 => {
                    self.rewrite_int_to_smi(instruction)?;
                    return Ok(true);
                }
                _ => {}
            }
        }
        Ok(false)
    }

    /// The name of a call's callee, when it is a direct call.
    fn callee_name(instruction: &InstructionValue<'ctx>) -> Option<String> {
        let operands = instruction.get_num_operands();
        if operands == 0 {
            return None;
        }
        match instruction.get_operand(operands - 1) {
            Some(Either::Left(BasicValueEnum::PointerValue(callee))) => {
                callee.get_name().to_str().ok().map(str::to_string)
            }
            _ => None,
        }
    }

    fn pointer_operand(
        instruction: &InstructionValue<'ctx>,
        index: u32,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        match instruction.get_operand(index) {
            Some(Either::Left(BasicValueEnum::PointerValue(pointer))) => Ok(pointer),
            other => Err(vec![ice!(
                "intrinsic operand {} is not a pointer: {:?}",
                index,
                other
            )]),
        }
    }

    /// Untag a slot pointer: byte-cast, GEP −1.
    fn untag_slot(
        &self,
        builder: &inkwell::builder::Builder<'ctx>,
        pointer: PointerValue<'ctx>,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let byte_pointer = builder
            .build_pointer_cast(pointer, self.w.int8_ptr_type, "byte_slot")
            .map_err(Diagnostic::llvm)?;
        let minus_one = self.w.int32_type.const_int(-1i64 as u64, true);
        unsafe { builder.build_gep(byte_pointer, &[minus_one], "untagged") }
            .map_err(Diagnostic::llvm)
    }

    fn rewrite_tagread(&self, call: InstructionValue<'ctx>) -> Result<(), Vec<Diagnostic>> {
        let builder = self.w.context.create_builder();
        builder.position_before(&call);

        let pointer = Self::pointer_operand(&call, 0)?;
        let untagged = self.untag_slot(&builder, pointer)?;
        let slot = builder
            .build_pointer_cast(untagged, self.w.object_ptr_aspace0_ptr_aspace0_type, "slot")
            .map_err(Diagnostic::llvm)?;
        let value = builder
            .build_load(slot, "raw_field")
            .map_err(Diagnostic::llvm)?
            .into_pointer_value();
        let tagged = builder
            .build_pointer_cast(value, self.w.object_ptr_type, "field")
            .map_err(Diagnostic::llvm)?;

        let replacement = tagged
            .as_instruction_value()
            .ok_or_else(|| vec![ice!("tagread lowering produced no instruction")])?;
        call.replace_all_uses_with(&replacement);
        call.erase_from_basic_block();
        Ok(())
    }

    fn rewrite_tagwrite(&self, call: InstructionValue<'ctx>) -> Result<(), Vec<Diagnostic>> {
        let builder = self.w.context.create_builder();
        builder.position_before(&call);

        // TODO(gc): emit the generational write barrier here (or call a
        // runtime hook) before a moving collector can run concurrently.
        let value = match call.get_operand(0) {
            Some(Either::Left(value)) => value,
            other => return Err(vec![ice!("tagwrite value operand missing: {:?}", other)]),
        };
        let pointer = Self::pointer_operand(&call, 1)?;
        let untagged = self.untag_slot(&builder, pointer)?;
        let slot = builder
            .build_pointer_cast(untagged, self.w.object_ptr_ptr_unsafe_type, "slot")
            .map_err(Diagnostic::llvm)?;
        builder.build_store(slot, value).map_err(Diagnostic::llvm)?;

        call.erase_from_basic_block();
        Ok(())
    }

    fn rewrite_smi_to_int(
        &self,
        call: InstructionValue<'ctx>,
        int_type: inkwell::types::IntType<'ctx>,
    ) -> Result<(), Vec<Diagnostic>> {
        let builder = self.w.context.create_builder();
        builder.position_before(&call);

        let pointer = Self::pointer_operand(&call, 0)?;
        let word = builder
            .build_ptr_to_int(pointer, int_type, "word")
            .map_err(Diagnostic::llvm)?;
        // Drop the tag with an arithmetic shift.
        let one = int_type.const_int(1, false);
        let value = builder
            .build_right_shift(word, one, true, "smi_value")
            .map_err(Diagnostic::llvm)?;

        let replacement = value
            .as_instruction_value()
            .ok_or_else(|| vec![ice!("smitoint lowering produced no instruction")])?;
        call.replace_all_uses_with(&replacement);
        call.erase_from_basic_block();
        Ok(())
    }

    fn rewrite_int_to_smi(&self, call: InstructionValue<'ctx>) -> Result<(), Vec<Diagnostic>> {
        let builder = self.w.context.create_builder();
        builder.position_before(&call);

        let number = match call.get_operand(0) {
            Some(Either::Left(BasicValueEnum::IntValue(number))) => number,
            other => return Err(vec![ice!("inttosmi operand is not an int: {:?}", other)]),
        };
        // Tag with zero by adding the value to itself.
        let doubled = builder
            .build_int_add(number, number, "tagged_word")
            .map_err(Diagnostic::llvm)?;
        let pointer = builder
            .build_int_to_ptr(doubled, self.w.object_ptr_type, "smi")
            .map_err(Diagnostic::llvm)?;

        let replacement = pointer
            .as_instruction_value()
            .ok_or_else(|| vec![ice!("inttosmi lowering produced no instruction")])?;
        call.replace_all_uses_with(&replacement);
        call.erase_from_basic_block();
        Ok(())
    }
}
