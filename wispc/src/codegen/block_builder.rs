//! # Method Lowering
//!
//! Rewrites one bytecoded method from a stack machine into LLVM IR.
//!
//! The operand stack becomes a vector of allocas: `arity` argument slots
//! (arguments are writable, bytecodes may store into them), three
//! auxiliary slots mirroring the interpreter frame (saved bytecode
//! pointer, frame pointer, one empty slot; never read or written here),
//! and `max_stack` operand slots. Every bytecode reads and writes the
//! symbolic stack through `push`/`pop`, which store to and load from the
//! appropriate alloca; mem2reg recovers SSA afterwards. This keeps the
//! lowering simple and correct for irreducible control flow from
//! back-edges.
//!
//! Heap accesses go through the GC intrinsics (`tagread`/`tagwrite`,
//! smi encode/decode) so the GC address-space discipline survives until
//! the final lowering pass.
//!
//! Block discipline: one LLVM block per leader discovered by the
//! explorer, plus a synthetic entry block (LLVM forbids branches back to
//! the function entry, and loops back to bci 0 exist). After emission
//! the function is verified; a failure here means a compiler bug and
//! aborts compilation with the offending IR dumped.

use std::collections::BTreeMap;

use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder;
use inkwell::intrinsics::Intrinsic;
use inkwell::values::{
    BasicMetadataValueEnum, BasicValueEnum, CallableValue, FunctionValue, IntValue, PointerValue,
};
use inkwell::IntPredicate;
use tracing::warn;

use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::ice;
use crate::snapshot::bytecode::{BytecodeReader, Opcode};
use crate::snapshot::natives::Native;
use crate::snapshot::object::{layout, InstanceFormat, InstanceKind, WORD_SIZE};
use crate::snapshot::selector::Selector;
use crate::snapshot::{FunctionObject, HeapId, HeapObject, ObjectRef};

use super::explorer::StackAnalysis;
use super::world::World;

/// Auxiliary stack slots between arguments and operands: saved bytecode
/// pointer, saved frame pointer, and one empty slot.
pub const AUXILIARY_SLOTS: usize = 3;

// ============================================================================
// IR helper
// ============================================================================

/// Boilerplate around the instruction builder: casts, tagged field
/// access, smi checks and the dispatch-table lookup shared by method
/// invocation and the smi slow-case helpers.
pub struct IrHelper<'ctx, 'p, 'a> {
    w: &'a World<'ctx, 'p>,
    b: &'a Builder<'ctx>,
    f: FunctionValue<'ctx>,
}

impl<'ctx, 'p, 'a> IrHelper<'ctx, 'p, 'a> {
    pub fn new(w: &'a World<'ctx, 'p>, b: &'a Builder<'ctx>, f: FunctionValue<'ctx>) -> Self {
        Self { w, b, f }
    }

    /// A constant C string (newline and NUL appended) for debug printing.
    pub fn build_cstring(&self, text: &str) -> PointerValue<'ctx> {
        let mut bytes: Vec<u8> = text.bytes().collect();
        bytes.push(b'\n');
        let value = self.w.context.const_string(&bytes, true);
        let global = self.w.module.add_global(value.get_type(), None, "DebugString");
        global.set_initializer(&value);
        global.set_constant(true);
        global.as_pointer_value().const_cast(self.w.int8_ptr_type)
    }

    /// Pointer cast, across address spaces when needed.
    pub fn cast(
        &self,
        value: PointerValue<'ctx>,
        ptr_type: inkwell::types::PointerType<'ctx>,
        name: &str,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        self.b
            .build_pointer_cast(value, ptr_type, name)
            .map_err(Diagnostic::llvm)
    }

    /// Call the tagread intrinsic on a tagged slot pointer.
    pub fn tagged_read(&self, slot: PointerValue<'ctx>) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let call = self
            .b
            .build_call(self.w.intrinsic_tagread, &[slot.into()], "field")
            .map_err(Diagnostic::llvm)?;
        call.try_as_basic_value()
            .left()
            .map(|value| value.into_pointer_value())
            .ok_or_else(|| vec![ice!("tagread returned no value")])
    }

    /// Call the tagwrite intrinsic on a tagged slot pointer.
    pub fn tagged_write(
        &self,
        value: PointerValue<'ctx>,
        slot: PointerValue<'ctx>,
    ) -> Result<(), Vec<Diagnostic>> {
        self.b
            .build_call(self.w.intrinsic_tagwrite, &[value.into(), slot.into()], "")
            .map_err(Diagnostic::llvm)?;
        Ok(())
    }

    /// Decode a smi-tagged object word into a machine integer.
    pub fn decode_smi(&self, value: PointerValue<'ctx>) -> Result<IntValue<'ctx>, Vec<Diagnostic>> {
        let call = self
            .b
            .build_call(self.w.intrinsic_smi_to_int, &[value.into()], "smi_value")
            .map_err(Diagnostic::llvm)?;
        call.try_as_basic_value()
            .left()
            .map(|value| value.into_int_value())
            .ok_or_else(|| vec![ice!("smitoint returned no value")])
    }

    /// Encode a machine integer into a smi-tagged object word.
    pub fn encode_smi(&self, value: IntValue<'ctx>) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let call = self
            .b
            .build_call(self.w.intrinsic_int_to_smi, &[value.into()], "smi")
            .map_err(Diagnostic::llvm)?;
        call.try_as_basic_value()
            .left()
            .map(|value| value.into_pointer_value())
            .ok_or_else(|| vec![ice!("inttosmi returned no value")])
    }

    /// A tagged, GC-address-space inner pointer to array element `index`.
    pub fn get_array_pointer(
        &self,
        array: PointerValue<'ctx>,
        index: i64,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let receiver = self.cast(array, self.w.object_ptr_ptr_type, "receiver")?;
        let offset = self
            .w
            .c_word(layout::ARRAY_SIZE as i64 / WORD_SIZE as i64 + index);
        unsafe { self.b.build_gep(receiver, &[offset], "element") }.map_err(Diagnostic::llvm)
    }

    /// Read the tagged field at byte `offset` of `object`.
    pub fn load_field(
        &self,
        object: PointerValue<'ctx>,
        offset: usize,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let receiver = self.cast(object, self.w.object_ptr_ptr_type, "receiver")?;
        let index = self.w.c_word(offset as i64 / WORD_SIZE as i64);
        let slot =
            unsafe { self.b.build_gep(receiver, &[index], "slot") }.map_err(Diagnostic::llvm)?;
        self.tagged_read(slot)
    }

    /// Write the tagged field at byte `offset` of `receiver`.
    pub fn store_field(
        &self,
        offset: usize,
        receiver: PointerValue<'ctx>,
        value: PointerValue<'ctx>,
    ) -> Result<(), Vec<Diagnostic>> {
        let receiver = self.cast(receiver, self.w.object_ptr_ptr_type, "receiver")?;
        let index = self.w.c_word(offset as i64 / WORD_SIZE as i64);
        let slot =
            unsafe { self.b.build_gep(receiver, &[index], "slot") }.map_err(Diagnostic::llvm)?;
        self.tagged_write(value, slot)
    }

    /// Plain load from a static-image slot, cast into the GC space.
    pub fn load_field_from_aspace0(
        &self,
        slot: PointerValue<'ctx>,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let value = self
            .b
            .build_load(slot, "static_entry")
            .map_err(Diagnostic::llvm)?
            .into_pointer_value();
        self.cast(value, self.w.object_ptr_type, "entry")
    }

    /// The class word of a heap object.
    pub fn load_class(&self, object: PointerValue<'ctx>) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        self.load_field(object, layout::HEAP_OBJECT_CLASS_OFFSET)
    }

    /// The instance-format smi of a class.
    pub fn load_instance_format(
        &self,
        class: PointerValue<'ctx>,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        self.load_field(class, layout::CLASS_INSTANCE_FORMAT_OFFSET)
    }

    /// The statics array: an on-heap array (in the read-only constants
    /// part of the heap) pointed to by the off-heap process object. The
    /// stored pointer is already tagged.
    pub fn load_statics_array(
        &self,
        process: PointerValue<'ctx>,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let base = self.cast(process, self.w.object_ptr_ptr_unsafe_type, "process")?;
        let index = self
            .w
            .c_word(layout::PROCESS_STATICS_OFFSET as i64 / WORD_SIZE as i64);
        let slot = unsafe { self.b.build_gep(base, &[index], "statics_slot") }
            .map_err(Diagnostic::llvm)?;
        Ok(self
            .b
            .build_load(slot, "statics")
            .map_err(Diagnostic::llvm)?
            .into_pointer_value())
    }

    /// The code pointer of an initializer object, as a function pointer
    /// of the given arity.
    pub fn load_initializer_code(
        &self,
        initializer: PointerValue<'ctx>,
        arity: usize,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let entry = self.load_field(initializer, layout::INITIALIZER_FUNCTION_OFFSET)?;
        self.cast(entry, self.w.llvm_function_ptr_type(arity), "initializer_code")
    }

    /// True when `object` is a smi (low tag bit clear).
    pub fn smi_check(&self, object: PointerValue<'ctx>) -> Result<IntValue<'ctx>, Vec<Diagnostic>> {
        let word = self
            .b
            .build_ptr_to_int(object, self.w.intptr_type, "word")
            .map_err(Diagnostic::llvm)?;
        let bit = self
            .b
            .build_and(word, self.w.c_int(1), "tag")
            .map_err(Diagnostic::llvm)?;
        self.b
            .build_int_compare(IntPredicate::EQ, bit, self.w.c_int(0), "is_smi")
            .map_err(Diagnostic::llvm)
    }

    /// True when `object` is a transient failure (low two bits `11`).
    pub fn failure_check(
        &self,
        object: PointerValue<'ctx>,
    ) -> Result<IntValue<'ctx>, Vec<Diagnostic>> {
        let word = self
            .b
            .build_ptr_to_int(object, self.w.intptr_type, "word")
            .map_err(Diagnostic::llvm)?;
        let bits = self
            .b
            .build_and(word, self.w.c_int(3), "tag_bits")
            .map_err(Diagnostic::llvm)?;
        self.b
            .build_int_compare(IntPredicate::EQ, bits, self.w.c_int(3), "is_failure")
            .map_err(Diagnostic::llvm)
    }

    /// The null object pointer (AS1).
    pub fn null(&self) -> PointerValue<'ctx> {
        self.w.object_ptr_type.const_null()
    }

    /// The AS1 view of a materialized root or constant.
    pub fn constant_aspace1(&self, object: ObjectRef) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        match object {
            ObjectRef::Heap(id) => self
                .w
                .tagged_aspace1(id)
                .ok_or_else(|| vec![ice!("object {} referenced before materialization", id)]),
            ObjectRef::Smi(value) => Ok(self.w.c_int_to_pointer(self.w.c_smi(value), None)),
        }
    }

    // ------------------------------------------------------------------
    // Dispatch-table probing
    // ------------------------------------------------------------------

    /// Look up the dispatch table entry for `receiver` and `selector`:
    /// smi receivers use the global smi class, otherwise the receiver's
    /// class word is read; the table index is
    /// `array-header-words + selector-id + class-id`.
    pub fn lookup_dispatch_entry(
        &self,
        receiver: PointerValue<'ctx>,
        selector: i32,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let context = self.w.context;
        let bb_smi = context.append_basic_block(self.f, "smi");
        let bb_nonsmi = context.append_basic_block(self.f, "nonsmi");
        let bb_lookup = context.append_basic_block(self.f, "lookup");

        let is_smi = self.smi_check(receiver)?;
        self.b
            .build_conditional_branch(is_smi, bb_smi, bb_nonsmi)
            .map_err(Diagnostic::llvm)?;

        self.b.position_at_end(bb_smi);
        let smi_class = self.constant_aspace1(self.w.program.smi_class())?;
        self.b
            .build_unconditional_branch(bb_lookup)
            .map_err(Diagnostic::llvm)?;

        self.b.position_at_end(bb_nonsmi);
        let loaded_class = self.load_class(receiver)?;
        self.b
            .build_unconditional_branch(bb_lookup)
            .map_err(Diagnostic::llvm)?;

        self.b.position_at_end(bb_lookup);
        let class_phi = self
            .b
            .build_phi(self.w.object_ptr_type, "klass")
            .map_err(Diagnostic::llvm)?;
        class_phi.add_incoming(&[(&smi_class, bb_smi), (&loaded_class, bb_nonsmi)]);
        let class = class_phi.as_basic_value().into_pointer_value();

        let class_id = self.decode_smi(self.load_field(class, layout::CLASS_ID_OFFSET)?)?;
        let selector_offset = self.w.c_word(Selector::id(selector));
        let index = self
            .b
            .build_int_add(selector_offset, class_id, "index")
            .map_err(Diagnostic::llvm)?;
        let header_words = self
            .w
            .c_word(layout::ARRAY_SIZE as i64 / WORD_SIZE as i64);
        let index = self
            .b
            .build_int_add(header_words, index, "table_index")
            .map_err(Diagnostic::llvm)?;

        // The dispatch table is a heap object (tagged, normal layout)
        // that always sits in the read-only static image, so it is
        // indexed through its untagged AS0 body with plain loads.
        let dispatch_id = self
            .w
            .program
            .dispatch_table()
            .as_heap()
            .ok_or_else(|| vec![ice!("dispatch table root is not a heap object")])?;
        let dispatch = self
            .w
            .untagged_aspace0(dispatch_id)
            .ok_or_else(|| vec![ice!("dispatch table not materialized")])?;
        let scaled = self.cast(
            dispatch,
            self.w.object_ptr_aspace0_ptr_aspace0_type,
            "dispatch_table",
        )?;
        let slot = unsafe { self.b.build_gep(scaled, &[index], "entry_slot") }
            .map_err(Diagnostic::llvm)?;
        self.load_field_from_aspace0(slot)
    }

    /// The code field of a dispatch table entry.
    fn dispatch_entry_code(
        &self,
        entry: PointerValue<'ctx>,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        self.load_field(entry, layout::DISPATCH_ENTRY_CODE_OFFSET)
    }

    /// The offset field of a dispatch table entry.
    fn dispatch_entry_offset(
        &self,
        entry: PointerValue<'ctx>,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        self.load_field(entry, layout::DISPATCH_ENTRY_OFFSET_OFFSET)
    }

    /// Full method invocation: probe the dispatch table, validate the
    /// entry's offset against the selector, fall back to the
    /// no-such-method entry (table index 0) on mismatch, and call the
    /// winning entry's code with `args` (process, receiver, arguments).
    pub fn invoke_method_helper(
        &self,
        selector: i32,
        args: &[BasicValueEnum<'ctx>],
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let arity = args.len() - 2;
        let receiver = args[1].into_pointer_value();

        let entry = self.lookup_dispatch_entry(receiver, selector)?;
        let expected_offset = self
            .b
            .build_ptr_to_int(
                self.dispatch_entry_offset(entry)?,
                self.w.intptr_type,
                "expected_offset",
            )
            .map_err(Diagnostic::llvm)?;
        let actual_offset = self.w.c_word(Selector::smi_selector_offset(selector));

        let bb_start = self
            .b
            .get_insert_block()
            .ok_or_else(|| vec![ice!("builder not positioned")])?;
        let bb_lookup_failure = self.w.context.append_basic_block(self.f, "bb_lookup_failure");
        let bb_lookup_success = self.w.context.append_basic_block(self.f, "bb_lookup_success");

        let offset_matches = self
            .b
            .build_int_compare(IntPredicate::EQ, actual_offset, expected_offset, "offset_ok")
            .map_err(Diagnostic::llvm)?;
        self.b
            .build_conditional_branch(offset_matches, bb_lookup_success, bb_lookup_failure)
            .map_err(Diagnostic::llvm)?;

        // The no-such-method fallback is the 0th element of the table.
        self.b.position_at_end(bb_lookup_failure);
        let dispatch = self.constant_aspace1(self.w.program.dispatch_table())?;
        let nsm_entry = self.load_field(dispatch, layout::ARRAY_SIZE)?;
        self.b
            .build_unconditional_branch(bb_lookup_success)
            .map_err(Diagnostic::llvm)?;

        self.b.position_at_end(bb_lookup_success);
        let entry_phi = self
            .b
            .build_phi(self.w.object_ptr_type, "entry")
            .map_err(Diagnostic::llvm)?;
        entry_phi.add_incoming(&[(&entry, bb_start), (&nsm_entry, bb_lookup_failure)]);
        let winner = entry_phi.as_basic_value().into_pointer_value();

        let code = self.dispatch_entry_code(winner)?;
        let code = self.cast(code, self.w.llvm_function_ptr_type(1 + arity), "code")?;
        let callable = CallableValue::try_from(code)
            .map_err(|_| vec![ice!("dispatch code pointer is not callable")])?;
        let call_args: Vec<BasicMetadataValueEnum> =
            args.iter().map(|arg| (*arg).into()).collect();
        let call = self
            .b
            .build_call(callable, &call_args, "method_result")
            .map_err(Diagnostic::llvm)?;
        call.try_as_basic_value()
            .left()
            .map(|value| value.into_pointer_value())
            .ok_or_else(|| vec![ice!("method call returned no value")])
    }
}

// ============================================================================
// Basic block builder
// ============================================================================

/// Emits the body of one method, bytecode by bytecode, into the
/// pre-created leader blocks.
pub struct BasicBlockBuilder<'ctx, 'p, 'a> {
    w: &'a World<'ctx, 'p>,
    function: &'p FunctionObject,
    llvm_function: FunctionValue<'ctx>,
    b: &'a Builder<'ctx>,
    h: IrHelper<'ctx, 'p, 'a>,
    process: Option<PointerValue<'ctx>>,
    /// `[arguments][auxiliary][operands]`; auxiliary slots stay `None`.
    stack: Vec<Option<PointerValue<'ctx>>>,
    stack_pos: usize,
    max_stack: usize,
    entry_block: BasicBlock<'ctx>,
    blocks: BTreeMap<u32, BasicBlock<'ctx>>,
    heights: BTreeMap<u32, u32>,
}

impl<'ctx, 'p, 'a> BasicBlockBuilder<'ctx, 'p, 'a> {
    pub fn new(
        w: &'a World<'ctx, 'p>,
        function: &'p FunctionObject,
        llvm_function: FunctionValue<'ctx>,
        b: &'a Builder<'ctx>,
    ) -> Self {
        // An extra entry block loads arguments and jumps to the block at
        // bci 0; loops may target bci 0 and LLVM disallows branching to
        // the function entry.
        let entry_block = w.context.append_basic_block(llvm_function, "entry");
        let h = IrHelper::new(w, b, llvm_function);
        Self {
            w,
            function,
            llvm_function,
            b,
            h,
            process: None,
            stack: Vec::new(),
            stack_pos: 0,
            max_stack: 0,
            entry_block,
            blocks: BTreeMap::new(),
            heights: BTreeMap::new(),
        }
    }

    /// Create the block for the leader at `bci` with its entry height.
    pub fn add_basic_block_at(&mut self, bci: u32, stack_height: u32) {
        let block = self
            .w
            .context
            .append_basic_block(self.llvm_function, &format!("bb{}", bci));
        self.blocks.insert(bci, block);
        self.heights.insert(bci, stack_height);
    }

    /// Set the maximum operand stack height the function reaches.
    pub fn set_maximum_stack_height(&mut self, max_stack: u32) {
        self.max_stack = max_stack as usize;
    }

    /// Start inserting at the leader block for `bci`.
    pub fn insert_at_bci(&mut self, bci: u32) -> Result<(), Vec<Diagnostic>> {
        let block = self.block_at(bci)?;
        self.b.position_at_end(block);
        self.stack_pos = *self
            .heights
            .get(&bci)
            .ok_or_else(|| vec![ice!("no stack height for bci {}", bci)])? as usize;
        Ok(())
    }

    fn block_at(&self, bci: u32) -> Result<BasicBlock<'ctx>, Vec<Diagnostic>> {
        self.blocks
            .get(&bci)
            .copied()
            .ok_or_else(|| vec![ice!("no basic block at bci {}", bci)])
    }

    fn process(&self) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        self.process
            .ok_or_else(|| vec![ice!("process pointer not loaded")])
    }

    // ------------------------------------------------------------------
    // Prologue
    // ------------------------------------------------------------------

    /// Emit the prologue: allocas for every writable slot, stores of the
    /// incoming arguments, and the jump to the block at bci 0.
    pub fn do_load_arguments(&mut self) -> Result<(), Vec<Diagnostic>> {
        self.b.position_at_end(self.entry_block);
        let arity = self.function.arity;

        // Argument slots are filled below, in argument order.
        for _ in 0..arity {
            self.stack.push(None);
        }
        // Auxiliary slots are never read or written.
        for _ in 0..AUXILIARY_SLOTS {
            self.stack.push(None);
        }
        for index in 0..self.max_stack {
            let slot = self
                .b
                .build_alloca(self.w.object_ptr_type, &format!("slot_{}", index))
                .map_err(Diagnostic::llvm)?;
            self.stack.push(Some(slot));
        }

        for (index, param) in self.llvm_function.get_param_iter().enumerate() {
            if index == 0 {
                self.process = Some(param.into_pointer_value());
                continue;
            }
            // Parameter slots are modifiable (store-local may target
            // them), so arguments land in allocas too.
            let slot = self
                .b
                .build_alloca(self.w.object_ptr_type, &format!("arg_{}", index))
                .map_err(Diagnostic::llvm)?;
            self.b.build_store(slot, param).map_err(Diagnostic::llvm)?;
            self.stack[index - 1] = Some(slot);
        }

        debug_assert_eq!(self.stack.len(), arity + AUXILIARY_SLOTS + self.max_stack);

        let first = self.block_at(0)?;
        self.b
            .build_unconditional_branch(first)
            .map_err(Diagnostic::llvm)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Symbolic operand stack
    // ------------------------------------------------------------------

    fn slot_offset(&self, index: usize) -> Result<usize, Vec<Diagnostic>> {
        let arity = self.function.arity;
        let offset = arity as isize + AUXILIARY_SLOTS as isize + self.stack_pos as isize
            - index as isize
            - 1;
        if offset < 0 || offset as usize >= self.stack.len() {
            return Err(vec![ice!("stack slot {} out of range", index)]);
        }
        // Reads below the operand region must land on argument slots,
        // never the auxiliary ones.
        if index >= self.stack_pos && index < AUXILIARY_SLOTS + self.stack_pos {
            return Err(vec![ice!("access to auxiliary stack slot {}", index)]);
        }
        Ok(offset as usize)
    }

    fn slot(&self, offset: usize) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        self.stack
            .get(offset)
            .copied()
            .flatten()
            .ok_or_else(|| vec![ice!("unallocated stack slot {}", offset)])
    }

    fn push(&mut self, value: PointerValue<'ctx>) -> Result<(), Vec<Diagnostic>> {
        if self.stack_pos >= self.max_stack {
            return Err(vec![ice!("operand stack overflow while lowering")]);
        }
        let arity = self.function.arity;
        let slot = self.slot(arity + AUXILIARY_SLOTS + self.stack_pos)?;
        self.b.build_store(slot, value).map_err(Diagnostic::llvm)?;
        self.stack_pos += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        if self.stack_pos == 0 {
            return Err(vec![ice!("operand stack underflow while lowering")]);
        }
        let value = self.local(0)?;
        self.stack_pos -= 1;
        Ok(value)
    }

    fn local(&self, index: usize) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let slot = self.slot(self.slot_offset(index)?)?;
        Ok(self
            .b
            .build_load(slot, "local")
            .map_err(Diagnostic::llvm)?
            .into_pointer_value())
    }

    fn set_local(&mut self, index: usize, value: PointerValue<'ctx>) -> Result<(), Vec<Diagnostic>> {
        let slot = self.slot(self.slot_offset(index)?)?;
        self.b.build_store(slot, value).map_err(Diagnostic::llvm)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Per-bytecode lowering
    // ------------------------------------------------------------------

    pub fn do_load_local(&mut self, index: usize) -> Result<(), Vec<Diagnostic>> {
        let value = self.local(index)?;
        self.push(value)
    }

    pub fn do_load_integer(&mut self, value: i64) -> Result<(), Vec<Diagnostic>> {
        let constant = self.w.c_int_to_pointer(self.w.c_smi(value), None);
        self.push(constant)
    }

    /// Push a materialized constant. The AS1 view is used even though
    /// constants are off-heap: they combine with runtime values in phis,
    /// and the GC knows to ignore them.
    pub fn do_load_constant(&mut self, object: ObjectRef) -> Result<(), Vec<Diagnostic>> {
        let value = self.h.constant_aspace1(object)?;
        self.push(value)
    }

    pub fn do_load_field(&mut self, field: usize) -> Result<(), Vec<Diagnostic>> {
        let object = self.pop()?;
        let value = self
            .h
            .load_field(object, layout::INSTANCE_SIZE + field * WORD_SIZE)?;
        self.push(value)
    }

    pub fn do_load_boxed(&mut self, index: usize) -> Result<(), Vec<Diagnostic>> {
        let boxed = self.local(index)?;
        let value = self.h.load_field(boxed, layout::BOXED_VALUE_OFFSET)?;
        self.push(value)
    }

    pub fn do_store_field(&mut self, field: usize) -> Result<(), Vec<Diagnostic>> {
        let rhs = self.pop()?;
        let object = self.pop()?;
        self.h
            .store_field(layout::INSTANCE_SIZE + field * WORD_SIZE, object, rhs)?;
        self.push(rhs)
    }

    pub fn do_store_local(&mut self, index: usize) -> Result<(), Vec<Diagnostic>> {
        let top = self.local(0)?;
        self.set_local(index, top)
    }

    pub fn do_store_boxed(&mut self, index: usize) -> Result<(), Vec<Diagnostic>> {
        let value = self.local(0)?;
        let boxed = self.local(index)?;
        self.h.store_field(layout::BOXED_VALUE_OFFSET, boxed, value)
    }

    pub fn do_drop(&mut self, count: usize) -> Result<(), Vec<Diagnostic>> {
        for _ in 0..count {
            self.pop()?;
        }
        Ok(())
    }

    pub fn do_return(&mut self) -> Result<(), Vec<Diagnostic>> {
        let value = self.pop()?;
        self.b.build_return(Some(&value)).map_err(Diagnostic::llvm)?;
        Ok(())
    }

    pub fn do_return_null(&mut self) -> Result<(), Vec<Diagnostic>> {
        let null = self.h.constant_aspace1(self.w.program.null_object())?;
        self.b.build_return(Some(&null)).map_err(Diagnostic::llvm)?;
        Ok(())
    }

    pub fn do_allocate(
        &mut self,
        class: ObjectRef,
        immutable: bool,
    ) -> Result<(), Vec<Diagnostic>> {
        let class_id = class
            .as_heap()
            .ok_or_else(|| vec![ice!("allocate with a non-class literal")])?;
        let fields = self
            .w
            .program
            .heap()
            .class(class_id)
            .ok_or_else(|| vec![ice!("allocate with a non-class literal")])?
            .instance_fields;
        let llvm_class = self.h.constant_aspace1(class)?;

        // TODO(runtime): check for failure results from the allocator the
        // way the native-call path does.
        let call = self
            .b
            .build_call(
                self.w.runtime_handle_allocate,
                &[
                    self.process()?.into(),
                    llvm_class.into(),
                    self.w.c_int(immutable as i32).into(),
                ],
                "instance",
            )
            .map_err(Diagnostic::llvm)?;
        let instance = call
            .try_as_basic_value()
            .left()
            .map(|value| value.into_pointer_value())
            .ok_or_else(|| vec![ice!("allocator returned no value")])?;

        // Popped values fill the highest field first.
        for field in 0..fields {
            let value = self.pop()?;
            self.h.store_field(
                layout::INSTANCE_SIZE + (fields - 1 - field) * WORD_SIZE,
                instance,
                value,
            )?;
        }
        self.push(instance)
    }

    pub fn do_allocate_boxed(&mut self) -> Result<(), Vec<Diagnostic>> {
        let value = self.pop()?;
        let call = self
            .b
            .build_call(
                self.w.runtime_handle_allocate_boxed,
                &[self.process()?.into(), value.into()],
                "boxed",
            )
            .map_err(Diagnostic::llvm)?;
        let boxed = call
            .try_as_basic_value()
            .left()
            .map(|value| value.into_pointer_value())
            .ok_or_else(|| vec![ice!("boxed allocator returned no value")])?;
        self.push(boxed)
    }

    pub fn do_enter_no_such_method(&mut self) -> Result<(), Vec<Diagnostic>> {
        // The stack-delta table charges this opcode 80 slots, matching
        // the interpreter's frame reservation; only the six words the
        // no-such-method handler actually reads are materialized here.
        // TODO(runtime): reconcile with the interpreter frame layout.
        for _ in 0..6 {
            self.push(self.h.null())?;
        }
        Ok(())
    }

    pub fn do_load_static(
        &mut self,
        offset: i64,
        check_for_initializer: bool,
    ) -> Result<(), Vec<Diagnostic>> {
        let statics = self.h.load_statics_array(self.process()?)?;
        let entry_slot = self.h.get_array_pointer(statics, offset)?;
        let entry = self.h.tagged_read(entry_slot)?;

        if !check_for_initializer {
            return self.push(entry);
        }

        // Initializer-typed slots trigger one-shot evaluation: call the
        // initializer's code and overwrite the slot with the result.
        let bb_main = self
            .b
            .get_insert_block()
            .ok_or_else(|| vec![ice!("builder not positioned")])?;
        let bb_initializer = self
            .w
            .context
            .append_basic_block(self.llvm_function, "bb_initializer");
        let bb_join = self.w.context.append_basic_block(self.llvm_function, "join");

        let class = self.h.load_class(entry)?;
        let format = self.h.decode_smi(self.h.load_instance_format(class)?)?;
        let type_bits = self
            .b
            .build_and(
                format,
                self.w.c_word(InstanceFormat::type_field_mask() >> 1),
                "type_bits",
            )
            .map_err(Diagnostic::llvm)?;
        let is_initializer = self
            .b
            .build_int_compare(
                IntPredicate::EQ,
                type_bits,
                self.w
                    .c_word(InstanceFormat::encode_type(InstanceKind::Initializer) >> 1),
                "is_initializer",
            )
            .map_err(Diagnostic::llvm)?;
        self.b
            .build_conditional_branch(is_initializer, bb_initializer, bb_join)
            .map_err(Diagnostic::llvm)?;

        self.b.position_at_end(bb_initializer);
        let code = self.h.load_initializer_code(entry, 0)?;
        let callable = CallableValue::try_from(code)
            .map_err(|_| vec![ice!("initializer code pointer is not callable")])?;
        let call = self
            .b
            .build_call(callable, &[self.process()?.into()], "initializer_result")
            .map_err(Diagnostic::llvm)?;
        let initializer_result = call
            .try_as_basic_value()
            .left()
            .map(|value| value.into_pointer_value())
            .ok_or_else(|| vec![ice!("initializer returned no value")])?;
        self.h.tagged_write(initializer_result, entry_slot)?;
        self.b
            .build_unconditional_branch(bb_join)
            .map_err(Diagnostic::llvm)?;

        self.b.position_at_end(bb_join);
        let phi = self
            .b
            .build_phi(self.w.object_ptr_type, "static_value")
            .map_err(Diagnostic::llvm)?;
        phi.add_incoming(&[(&initializer_result, bb_initializer), (&entry, bb_main)]);
        self.push(phi.as_basic_value().into_pointer_value())
    }

    pub fn do_store_static(&mut self, offset: i64) -> Result<(), Vec<Diagnostic>> {
        let statics = self.h.load_statics_array(self.process()?)?;
        let entry_slot = self.h.get_array_pointer(statics, offset)?;
        let value = self.local(0)?;
        self.h.tagged_write(value, entry_slot)
    }

    /// Direct call to a statically known function.
    pub fn do_call(&mut self, target: HeapId) -> Result<(), Vec<Diagnostic>> {
        let arity = self
            .w
            .program
            .heap()
            .function(target)
            .ok_or_else(|| vec![ice!("invoke-static with a non-function literal")])?
            .arity;
        let mut args: Vec<BasicMetadataValueEnum<'ctx>> =
            vec![self.process()?.into(); 1 + arity];
        for index in 0..arity {
            args[arity - index] = self.pop()?.into();
        }
        let llvm_target = self
            .w
            .llvm_function(target)
            .ok_or_else(|| vec![ice!("call target {} has no declared function", target)])?;
        let call = self
            .b
            .build_call(llvm_target, &args, "result")
            .map_err(Diagnostic::llvm)?;
        let result = call
            .try_as_basic_value()
            .left()
            .map(|value| value.into_pointer_value())
            .ok_or_else(|| vec![ice!("static call returned no value")])?;
        self.push(result)
    }

    /// Call a native: the arguments are copied into a stack array and the
    /// native receives a pointer to the *last* element. A failure result
    /// (low bits `11`) is converted into a failure object and control
    /// continues with it; otherwise the native's result is returned
    /// directly.
    pub fn do_invoke_native(
        &mut self,
        native: Native,
        arity: usize,
    ) -> Result<(), Vec<Diagnostic>> {
        let process = self.process()?;
        let array = self
            .b
            .build_array_alloca(
                self.w.object_ptr_type,
                self.w.c_int(arity as i32),
                "native_args",
            )
            .map_err(Diagnostic::llvm)?;

        for index in 0..arity {
            let position = unsafe {
                self.b
                    .build_gep(array, &[self.w.c_int(index as i32)], "arg_slot")
            }
            .map_err(Diagnostic::llvm)?;
            // Natives are wrapped by methods whose bytecode starts with
            // the invoke, so the native arguments are exactly the
            // function arguments.
            let argument_slot = self.slot(arity - index - 1)?;
            let argument = self
                .b
                .build_load(argument_slot, "arg")
                .map_err(Diagnostic::llvm)?;
            self.b
                .build_store(position, argument)
                .map_err(Diagnostic::llvm)?;
        }

        let native_function = {
            let natives = self.w.natives.borrow();
            *natives
                .get(native as usize)
                .ok_or_else(|| vec![ice!("native {:?} not declared", native)])?
        };

        let last_element = if arity == 0 {
            array
        } else {
            unsafe {
                self.b
                    .build_gep(array, &[self.w.c_int(arity as i32 - 1)], "last_arg")
            }
            .map_err(Diagnostic::llvm)?
        };

        let call = self
            .b
            .build_call(
                native_function,
                &[process.into(), last_element.into()],
                "native_call_result",
            )
            .map_err(Diagnostic::llvm)?;
        let result = call
            .try_as_basic_value()
            .left()
            .map(|value| value.into_pointer_value())
            .ok_or_else(|| vec![ice!("native call returned no value")])?;

        let bb_failure = self
            .w
            .context
            .append_basic_block(self.llvm_function, "failure");
        let bb_no_failure = self
            .w
            .context
            .append_basic_block(self.llvm_function, "no_failure");
        let is_failure = self.h.failure_check(result)?;
        self.b
            .build_conditional_branch(is_failure, bb_failure, bb_no_failure)
            .map_err(Diagnostic::llvm)?;

        self.b.position_at_end(bb_no_failure);
        self.b.build_return(Some(&result)).map_err(Diagnostic::llvm)?;

        // Convert the failure word into a failure object and let the
        // following bytecodes handle it.
        self.b.position_at_end(bb_failure);
        let call = self
            .b
            .build_call(
                self.w.runtime_handle_object_from_failure,
                &[process.into(), result.into()],
                "failure_object",
            )
            .map_err(Diagnostic::llvm)?;
        let failure_object = call
            .try_as_basic_value()
            .left()
            .map(|value| value.into_pointer_value())
            .ok_or_else(|| vec![ice!("failure conversion returned no value")])?;
        self.push(failure_object)
    }

    pub fn do_identical(&mut self) -> Result<(), Vec<Diagnostic>> {
        let true_object = self.h.constant_aspace1(self.w.program.true_object())?;
        let false_object = self.h.constant_aspace1(self.w.program.false_object())?;
        let lhs = self.pop()?;
        let rhs = self.pop()?;
        let equal = self
            .b
            .build_int_compare(IntPredicate::EQ, lhs, rhs, "same")
            .map_err(Diagnostic::llvm)?;
        let result = self
            .b
            .build_select(equal, true_object, false_object, "identical_result")
            .map_err(Diagnostic::llvm)?;
        self.push(result.into_pointer_value())
    }

    pub fn do_negate(&mut self) -> Result<(), Vec<Diagnostic>> {
        let true_object = self.h.constant_aspace1(self.w.program.true_object())?;
        let false_object = self.h.constant_aspace1(self.w.program.false_object())?;
        let value = self.pop()?;
        let is_true = self
            .b
            .build_int_compare(IntPredicate::EQ, value, true_object, "is_true")
            .map_err(Diagnostic::llvm)?;
        let result = self
            .b
            .build_select(is_true, false_object, true_object, "negate")
            .map_err(Diagnostic::llvm)?;
        self.push(result.into_pointer_value())
    }

    /// Smi fast path for the arithmetic and relational invoke bytecodes.
    ///
    /// Both operands are checked for smi-ness; additive operations use
    /// the overflow-checking intrinsic and spill to the slow path on
    /// overflow; relational ones compare the tagged words directly. The
    /// slow path calls the per-selector helper, which performs the full
    /// dispatch. With `branch_targets` set (compare-and-branch fusion)
    /// the comparison feeds a conditional branch directly and no
    /// true/false value is materialized.
    pub fn do_invoke_smi_operation(
        &mut self,
        opcode: Opcode,
        selector: i32,
        branch_targets: Option<(u32, u32)>,
    ) -> Result<(), Vec<Diagnostic>> {
        let context = self.w.context;
        let bb_smi_receiver = context.append_basic_block(self.llvm_function, "smi_receiver");
        let bb_smis = context.append_basic_block(self.llvm_function, "smis");
        let bb_nonsmi = context.append_basic_block(self.llvm_function, "nonsmi");
        let bb_join = if branch_targets.is_none() {
            Some(context.append_basic_block(self.llvm_function, "join"))
        } else {
            None
        };

        let tagged_argument = self.pop()?;
        let tagged_receiver = self.pop()?;

        let receiver_is_smi = self.h.smi_check(tagged_receiver)?;
        self.b
            .build_conditional_branch(receiver_is_smi, bb_smi_receiver, bb_nonsmi)
            .map_err(Diagnostic::llvm)?;
        self.b.position_at_end(bb_smi_receiver);
        let argument_is_smi = self.h.smi_check(tagged_argument)?;
        self.b
            .build_conditional_branch(argument_is_smi, bb_smis, bb_nonsmi)
            .map_err(Diagnostic::llvm)?;
        self.b.position_at_end(bb_smis);

        let argument = self
            .b
            .build_ptr_to_int(tagged_argument, self.w.intptr_type, "argument")
            .map_err(Diagnostic::llvm)?;
        let receiver = self
            .b
            .build_ptr_to_int(tagged_receiver, self.w.intptr_type, "receiver")
            .map_err(Diagnostic::llvm)?;

        // Fixed outcome of the smis block: either a word result with an
        // overflow bit, or an i1 comparison.
        let mut no_overflow: Option<IntValue<'ctx>> = None;
        let mut word_result: Option<IntValue<'ctx>> = None;
        let mut compare_result: Option<IntValue<'ctx>> = None;

        match opcode {
            Opcode::InvokeAdd | Opcode::InvokeSub => {
                let name = if opcode == Opcode::InvokeAdd {
                    "llvm.sadd.with.overflow"
                } else {
                    "llvm.ssub.with.overflow"
                };
                let intrinsic = Intrinsic::find(name)
                    .ok_or_else(|| vec![ice!("intrinsic {} not found", name)])?;
                let declaration = intrinsic
                    .get_declaration(&self.w.module, &[self.w.intptr_type.into()])
                    .ok_or_else(|| vec![ice!("no declaration for {}", name)])?;
                let call = self
                    .b
                    .build_call(declaration, &[receiver.into(), argument.into()], "checked")
                    .map_err(Diagnostic::llvm)?;
                let pair = call
                    .try_as_basic_value()
                    .left()
                    .ok_or_else(|| vec![ice!("overflow intrinsic returned no value")])?
                    .into_struct_value();
                let result = self
                    .b
                    .build_extract_value(pair, 0, "sum")
                    .map_err(Diagnostic::llvm)?
                    .into_int_value();
                let overflow_bit = self
                    .b
                    .build_extract_value(pair, 1, "overflow")
                    .map_err(Diagnostic::llvm)?
                    .into_int_value();
                no_overflow = Some(
                    self.b
                        .build_int_compare(
                            IntPredicate::EQ,
                            overflow_bit,
                            self.w.c_bit(false),
                            "no_overflow",
                        )
                        .map_err(Diagnostic::llvm)?,
                );
                word_result = Some(result);
            }
            Opcode::InvokeEq | Opcode::InvokeGe | Opcode::InvokeGt | Opcode::InvokeLe
            | Opcode::InvokeLt => {
                let predicate = match opcode {
                    Opcode::InvokeEq => IntPredicate::EQ,
                    Opcode::InvokeGe => IntPredicate::SGE,
                    Opcode::InvokeGt => IntPredicate::SGT,
                    Opcode::InvokeLe => IntPredicate::SLE,
                    _ => IntPredicate::SLT,
                };
                compare_result = Some(
                    self.b
                        .build_int_compare(predicate, receiver, argument, "compare")
                        .map_err(Diagnostic::llvm)?,
                );
            }
            _ => return Err(vec![ice!("{:?} is not a smi operation", opcode)]),
        }

        let mut smi_result: Option<PointerValue<'ctx>> = None;
        match branch_targets {
            None => {
                let bb_join = bb_join.ok_or_else(|| vec![ice!("join block missing")])?;
                let value = if let Some(compare) = compare_result {
                    let true_object = self.h.constant_aspace1(self.w.program.true_object())?;
                    let false_object = self.h.constant_aspace1(self.w.program.false_object())?;
                    self.b
                        .build_select(compare, true_object, false_object, "compare_result")
                        .map_err(Diagnostic::llvm)?
                        .into_pointer_value()
                } else {
                    let word = word_result.ok_or_else(|| vec![ice!("missing smi result")])?;
                    self.b
                        .build_int_to_ptr(word, self.w.object_ptr_type, "smi_result")
                        .map_err(Diagnostic::llvm)?
                };
                smi_result = Some(value);
                match no_overflow {
                    None => self
                        .b
                        .build_unconditional_branch(bb_join)
                        .map_err(Diagnostic::llvm)?,
                    Some(no_overflow) => self
                        .b
                        .build_conditional_branch(no_overflow, bb_join, bb_nonsmi)
                        .map_err(Diagnostic::llvm)?,
                };
            }
            Some((if_true_bci, if_false_bci)) => {
                let compare =
                    compare_result.ok_or_else(|| vec![ice!("fused branch on a non-compare")])?;
                let positive = self.block_at(if_true_bci)?;
                let negative = self.block_at(if_false_bci)?;
                self.b
                    .build_conditional_branch(compare, positive, negative)
                    .map_err(Diagnostic::llvm)?;
            }
        }

        self.b.position_at_end(bb_nonsmi);
        let slow_case = self.w.smi_slow_case(selector)?;
        let call = self
            .b
            .build_call(
                slow_case,
                &[
                    self.process()?.into(),
                    tagged_receiver.into(),
                    tagged_argument.into(),
                ],
                "slow_case",
            )
            .map_err(Diagnostic::llvm)?;
        let nonsmi_result = call
            .try_as_basic_value()
            .left()
            .map(|value| value.into_pointer_value())
            .ok_or_else(|| vec![ice!("slow case returned no value")])?;

        match branch_targets {
            None => {
                let bb_join = bb_join.ok_or_else(|| vec![ice!("join block missing")])?;
                self.b
                    .build_unconditional_branch(bb_join)
                    .map_err(Diagnostic::llvm)?;
                let bb_nonsmi_end = self
                    .b
                    .get_insert_block()
                    .ok_or_else(|| vec![ice!("builder not positioned")])?;

                self.b.position_at_end(bb_join);
                let phi = self
                    .b
                    .build_phi(self.w.object_ptr_type, "smi_op")
                    .map_err(Diagnostic::llvm)?;
                let smi_result = smi_result.ok_or_else(|| vec![ice!("missing smi result")])?;
                phi.add_incoming(&[(&smi_result, bb_smis), (&nonsmi_result, bb_nonsmi_end)]);
                self.push(phi.as_basic_value().into_pointer_value())?;
            }
            Some((if_true_bci, if_false_bci)) => {
                // The slow case produced a boolean object; branch on it.
                let true_object = self.h.constant_aspace1(self.w.program.true_object())?;
                let positive = self.block_at(if_true_bci)?;
                let negative = self.block_at(if_false_bci)?;
                let is_true = self
                    .b
                    .build_int_compare(IntPredicate::EQ, nonsmi_result, true_object, "is_true")
                    .map_err(Diagnostic::llvm)?;
                self.b
                    .build_conditional_branch(is_true, positive, negative)
                    .map_err(Diagnostic::llvm)?;
            }
        }
        Ok(())
    }

    pub fn do_invoke_method(
        &mut self,
        selector: i32,
        arity: usize,
    ) -> Result<(), Vec<Diagnostic>> {
        let mut args: Vec<BasicValueEnum<'ctx>> =
            vec![self.process()?.into(); 2 + arity];
        // Receiver and arguments come off the stack in reverse.
        for index in 0..arity + 1 {
            args[1 + arity - index] = self.pop()?.into();
        }
        let result = self.h.invoke_method_helper(selector, &args)?;
        self.push(result)
    }

    /// Produce true/false depending on whether the receiver's class
    /// answers the selector (same probe as a call, no invocation).
    pub fn do_invoke_test(&mut self, selector: i32) -> Result<(), Vec<Diagnostic>> {
        let receiver = self.pop()?;
        let entry = self.h.lookup_dispatch_entry(receiver, selector)?;
        let expected_offset = self
            .b
            .build_ptr_to_int(
                self.h.dispatch_entry_offset(entry)?,
                self.w.intptr_type,
                "expected_offset",
            )
            .map_err(Diagnostic::llvm)?;
        let actual_offset = self.w.c_word(Selector::smi_selector_offset(selector));
        let matches = self
            .b
            .build_int_compare(IntPredicate::EQ, actual_offset, expected_offset, "responds")
            .map_err(Diagnostic::llvm)?;
        let true_object = self.h.constant_aspace1(self.w.program.true_object())?;
        let false_object = self.h.constant_aspace1(self.w.program.false_object())?;
        let result = self
            .b
            .build_select(matches, true_object, false_object, "compare_result")
            .map_err(Diagnostic::llvm)?;
        self.push(result.into_pointer_value())
    }

    pub fn do_branch(&mut self, bci: u32) -> Result<(), Vec<Diagnostic>> {
        let target = self.block_at(bci)?;
        self.b
            .build_unconditional_branch(target)
            .map_err(Diagnostic::llvm)?;
        Ok(())
    }

    pub fn do_branch_if(&mut self, bci: u32, next_bci: u32) -> Result<(), Vec<Diagnostic>> {
        let true_object = self.h.constant_aspace1(self.w.program.true_object())?;
        let positive = self.block_at(bci)?;
        let negative = self.block_at(next_bci)?;
        let value = self.pop()?;
        let is_true = self
            .b
            .build_int_compare(IntPredicate::EQ, value, true_object, "is_true")
            .map_err(Diagnostic::llvm)?;
        self.b
            .build_conditional_branch(is_true, positive, negative)
            .map_err(Diagnostic::llvm)?;
        Ok(())
    }

    pub fn do_branch_if_false(&mut self, bci: u32, next_bci: u32) -> Result<(), Vec<Diagnostic>> {
        self.do_branch_if(next_bci, bci)
    }

    /// Fused invoke-compare plus conditional branch.
    pub fn do_compare_and_branch(
        &mut self,
        compare_bci: u32,
        if_true_bci: u32,
        if_false_bci: u32,
    ) -> Result<(), Vec<Diagnostic>> {
        let reader = BytecodeReader::new(&self.function.bytecode);
        let compare_opcode = reader.opcode_at(compare_bci).map_err(|d| vec![d])?;
        let selector = reader.read_i32(compare_bci, 1).map_err(|d| vec![d])?;
        self.do_invoke_smi_operation(compare_opcode, selector, Some((if_true_bci, if_false_bci)))
    }

    /// Placeholder for the scheduler yield.
    pub fn do_process_yield(&mut self) -> Result<(), Vec<Diagnostic>> {
        self.b
            .build_call(self.w.libc_exit, &[self.w.c_int(0).into()], "")
            .map_err(Diagnostic::llvm)?;
        Ok(())
    }

    pub fn do_debug_print(&mut self, message: &str) -> Result<(), Vec<Diagnostic>> {
        let text = self.h.build_cstring(message);
        self.b
            .build_call(self.w.libc_printf, &[text.into()], "")
            .map_err(Diagnostic::llvm)?;
        Ok(())
    }

    /// Print a diagnostic and exit the process; used by the
    /// unsupported-opcode trap.
    pub fn do_exit_fatal(&mut self, message: &str) -> Result<(), Vec<Diagnostic>> {
        self.do_debug_print(message)?;
        self.b
            .build_call(self.w.libc_exit, &[self.w.c_int(1).into()], "")
            .map_err(Diagnostic::llvm)?;
        Ok(())
    }
}

// ============================================================================
// Method lowerer
// ============================================================================

/// Drives the per-bytecode lowering of one function.
pub struct MethodLowerer<'ctx, 'p, 'w> {
    w: &'w World<'ctx, 'p>,
    function_id: HeapId,
}

impl<'ctx, 'p, 'w> MethodLowerer<'ctx, 'p, 'w> {
    pub fn new(w: &'w World<'ctx, 'p>, function_id: HeapId) -> Self {
        Self { w, function_id }
    }

    /// Emit and verify the function body.
    pub fn lower(&self, analysis: &StackAnalysis) -> Result<(), Vec<Diagnostic>> {
        let function = self
            .w
            .program
            .heap()
            .function(self.function_id)
            .ok_or_else(|| vec![ice!("lowering a non-function {}", self.function_id)])?;
        let llvm_function = self
            .w
            .llvm_function(self.function_id)
            .ok_or_else(|| vec![ice!("function {} was never declared", self.function_id)])?;

        let builder = self.w.context.create_builder();
        let mut b = BasicBlockBuilder::new(self.w, function, llvm_function, &builder);

        // Phase 1: create the leader blocks.
        for (&bci, &height) in &analysis.labels {
            b.add_basic_block_at(bci, height);
        }
        b.set_maximum_stack_height(analysis.max_stack);

        // Phase 2: fill them.
        b.do_load_arguments()?;
        let reader = BytecodeReader::new(&function.bytecode);
        for &leader in analysis.labels.keys() {
            b.insert_at_bci(leader)?;
            self.lower_block(&mut b, &reader, function, leader, &analysis.labels)?;
        }

        self.verify_function(llvm_function)
    }

    fn lower_block(
        &self,
        b: &mut BasicBlockBuilder<'ctx, 'p, '_>,
        reader: &BytecodeReader,
        function: &FunctionObject,
        leader: u32,
        labels: &BTreeMap<u32, u32>,
    ) -> Result<(), Vec<Diagnostic>> {
        let mut bci = leader;
        let mut postponed_compare_bci: Option<u32> = None;
        let mut last_opcode_was_jump = false;
        let mut stop = false;

        loop {
            let opcode = reader.opcode_at(bci).map_err(|d| vec![d])?;
            let next_bci = (bci as i64 + opcode.size() as i64) as u32;
            let read_u8 = move |offset| reader.read_u8(bci, offset).map_err(|d| vec![d]);
            let read_i32 = move |offset| reader.read_i32(bci, offset).map_err(|d| vec![d]);
            let forward = move |delta: i32| (bci as i64 + delta as i64) as u32;
            let backward = move |delta: i64| (bci as i64 - delta) as u32;

            match opcode {
                Opcode::InvokeFactory | Opcode::InvokeStatic => {
                    let target = self.function_literal(function, read_i32(1)?, bci)?;
                    b.do_call(target)?;
                }

                Opcode::LoadLocal0
                | Opcode::LoadLocal1
                | Opcode::LoadLocal2
                | Opcode::LoadLocal3
                | Opcode::LoadLocal4
                | Opcode::LoadLocal5 => {
                    b.do_load_local(opcode as usize - Opcode::LoadLocal0 as usize)?;
                }
                Opcode::LoadLocal => b.do_load_local(read_u8(1)? as usize)?,
                Opcode::LoadLocalWide => b.do_load_local(read_i32(1)? as usize)?,

                Opcode::LoadField => b.do_load_field(read_u8(1)? as usize)?,
                Opcode::LoadFieldWide => b.do_load_field(read_i32(1)? as usize)?,

                Opcode::LoadLiteral0 | Opcode::LoadLiteral1 => {
                    b.do_load_integer((opcode as usize - Opcode::LoadLiteral0 as usize) as i64)?;
                }
                Opcode::LoadLiteral => b.do_load_integer(read_u8(1)? as i64)?,
                Opcode::LoadLiteralWide => b.do_load_integer(read_i32(1)? as i64)?,
                Opcode::LoadLiteralNull => {
                    b.do_load_constant(self.w.program.null_object())?;
                }
                Opcode::LoadLiteralTrue => {
                    b.do_load_constant(self.w.program.true_object())?;
                }
                Opcode::LoadLiteralFalse => {
                    b.do_load_constant(self.w.program.false_object())?;
                }
                Opcode::LoadConst => {
                    let constant = self.literal(function, read_i32(1)?, bci)?;
                    b.do_load_constant(constant)?;
                }
                Opcode::LoadBoxed => b.do_load_boxed(read_u8(1)? as usize)?,

                Opcode::StoreLocal => b.do_store_local(read_u8(1)? as usize)?,
                Opcode::StoreField => b.do_store_field(read_u8(1)? as usize)?,
                Opcode::StoreFieldWide => b.do_store_field(read_i32(1)? as usize)?,
                Opcode::StoreBoxed => b.do_store_boxed(read_u8(1)? as usize)?,

                Opcode::BranchWide => {
                    b.do_branch(forward(read_i32(1)?))?;
                    stop = true;
                }
                Opcode::BranchBack => {
                    b.do_branch(backward(read_u8(1)? as i64))?;
                    stop = true;
                }
                Opcode::BranchBackWide => {
                    b.do_branch(backward(read_i32(1)? as i64))?;
                    stop = true;
                }
                Opcode::PopAndBranchWide => {
                    b.do_drop(read_u8(1)? as usize)?;
                    b.do_branch(forward(read_i32(2)?))?;
                    stop = true;
                }
                Opcode::PopAndBranchBackWide => {
                    b.do_drop(read_u8(1)? as usize)?;
                    b.do_branch(backward(read_i32(2)? as i64))?;
                    stop = true;
                }

                Opcode::BranchIfTrueWide => {
                    let target = forward(read_i32(1)?);
                    if let Some(compare_bci) = postponed_compare_bci.take() {
                        b.do_compare_and_branch(compare_bci, target, next_bci)?;
                    } else {
                        b.do_branch_if(target, next_bci)?;
                    }
                }
                Opcode::BranchBackIfTrue => {
                    b.do_branch_if(backward(read_u8(1)? as i64), next_bci)?;
                }
                Opcode::BranchBackIfTrueWide => {
                    b.do_branch_if(backward(read_i32(1)? as i64), next_bci)?;
                }
                Opcode::BranchIfFalseWide => {
                    let target = forward(read_i32(1)?);
                    if let Some(compare_bci) = postponed_compare_bci.take() {
                        b.do_compare_and_branch(compare_bci, next_bci, target)?;
                    } else {
                        b.do_branch_if_false(target, next_bci)?;
                    }
                }
                Opcode::BranchBackIfFalse => {
                    b.do_branch_if_false(backward(read_u8(1)? as i64), next_bci)?;
                }
                Opcode::BranchBackIfFalseWide => {
                    b.do_branch_if_false(backward(read_i32(1)? as i64), next_bci)?;
                }

                Opcode::Pop => b.do_drop(1)?,
                Opcode::Drop => b.do_drop(read_u8(1)? as usize)?,

                Opcode::Return => {
                    b.do_return()?;
                    stop = true;
                }
                Opcode::ReturnNull => {
                    b.do_return_null()?;
                    stop = true;
                }

                Opcode::StackOverflowCheck => {
                    // Reserved; the runtime grows stacks elsewhere.
                }

                Opcode::Identical | Opcode::IdenticalNonNumeric => b.do_identical()?,

                Opcode::InvokeNative | Opcode::InvokeDetachableNative => {
                    let arity = read_u8(1)? as usize;
                    let native_byte = read_u8(2)?;
                    let native = Native::from_byte(native_byte).ok_or_else(|| {
                        vec![Diagnostic::error_with_code(
                            ErrorCode::MalformedBytecode,
                            format!("unknown native {} at bci {}", native_byte, bci),
                        )]
                    })?;
                    b.do_invoke_native(native, arity)?;
                }

                Opcode::Allocate | Opcode::AllocateImmutable => {
                    let class = self.literal(function, read_i32(1)?, bci)?;
                    b.do_allocate(class, opcode == Opcode::AllocateImmutable)?;
                }
                Opcode::AllocateBoxed => b.do_allocate_boxed()?,

                Opcode::Negate => b.do_negate()?,

                Opcode::InvokeEq
                | Opcode::InvokeGe
                | Opcode::InvokeGt
                | Opcode::InvokeLe
                | Opcode::InvokeLt => {
                    // Fuse with an immediately following conditional
                    // branch unless the branch is itself a leader.
                    let fuse = !labels.contains_key(&next_bci)
                        && matches!(
                            reader.opcode_at(next_bci),
                            Ok(Opcode::BranchIfTrueWide) | Ok(Opcode::BranchIfFalseWide)
                        );
                    if fuse {
                        postponed_compare_bci = Some(bci);
                    } else {
                        b.do_invoke_smi_operation(opcode, read_i32(1)?, None)?;
                    }
                }
                Opcode::InvokeAdd | Opcode::InvokeSub => {
                    b.do_invoke_smi_operation(opcode, read_i32(1)?, None)?;
                }

                Opcode::InvokeMod
                | Opcode::InvokeMul
                | Opcode::InvokeTruncDiv
                | Opcode::InvokeBitNot
                | Opcode::InvokeBitAnd
                | Opcode::InvokeBitOr
                | Opcode::InvokeBitXor
                | Opcode::InvokeBitShr
                | Opcode::InvokeBitShl
                | Opcode::InvokeMethod => {
                    let selector = read_i32(1)?;
                    b.do_invoke_method(selector, Selector::arity(selector))?;
                }

                Opcode::InvokeTest => b.do_invoke_test(read_i32(1)?)?,
                Opcode::InvokeTestNoSuchMethod => {
                    b.do_drop(1)?;
                    b.do_load_constant(self.w.program.false_object())?;
                }

                Opcode::EnterNoSuchMethod => b.do_enter_no_such_method()?,

                Opcode::LoadStaticInit => b.do_load_static(read_i32(1)? as i64, true)?,
                Opcode::LoadStatic => b.do_load_static(read_i32(1)? as i64, false)?,
                Opcode::StoreStatic => b.do_store_static(read_i32(1)? as i64)?,

                Opcode::ProcessYield => b.do_process_yield()?,

                Opcode::MethodEnd => {
                    stop = true;
                }

                // InvokeSelector, InvokeNoSuchMethod, the subroutine and
                // coroutine opcodes and Throw are not lowered; the
                // emitted code traps loudly instead of guessing.
                _ => {
                    let rendered = reader.bytecode_string(bci);
                    warn!(function = %self.function_id, bci, bytecode = %rendered, "unsupported bytecode");
                    b.do_exit_fatal(&format!(
                        "Unsupported bytecode: {}. Exiting due to fatal error.",
                        rendered
                    ))?;
                    // Keep the block well formed.
                    b.do_return_null()?;
                    stop = true;
                }
            }

            last_opcode_was_jump = opcode.is_branch();
            bci = next_bci;
            if stop || labels.contains_key(&bci) {
                break;
            }
        }

        // Fall through into the next leader.
        if !last_opcode_was_jump && !stop {
            b.do_branch(bci)?;
        }
        Ok(())
    }

    fn literal(
        &self,
        function: &FunctionObject,
        index: i32,
        bci: u32,
    ) -> Result<ObjectRef, Vec<Diagnostic>> {
        function.literal_at(index as usize).ok_or_else(|| {
            vec![Diagnostic::error_with_code(
                ErrorCode::BadLiteralIndex,
                format!("literal index {} out of range at bci {}", index, bci),
            )]
        })
    }

    fn function_literal(
        &self,
        function: &FunctionObject,
        index: i32,
        bci: u32,
    ) -> Result<HeapId, Vec<Diagnostic>> {
        let literal = self.literal(function, index, bci)?;
        match literal.as_heap() {
            Some(id) if matches!(self.w.program.heap().get(id), Some(HeapObject::Function(_))) => {
                Ok(id)
            }
            _ => Err(vec![Diagnostic::error_with_code(
                ErrorCode::BadObjectKind,
                format!("bci {} expects a function literal", bci),
            )]),
        }
    }

    /// Per-function verification. A failure here means the tag-space
    /// discipline was violated somewhere; dump the IR and abort.
    fn verify_function(&self, llvm_function: FunctionValue<'ctx>) -> Result<(), Vec<Diagnostic>> {
        if llvm_function.verify(true) {
            return Ok(());
        }
        llvm_function.print_to_stderr();
        Err(vec![Diagnostic::error_with_code(
            ErrorCode::FunctionVerification,
            format!(
                "function verification failed for {}",
                llvm_function.get_name().to_string_lossy()
            ),
        )])
    }
}
