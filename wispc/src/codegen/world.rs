//! # The World
//!
//! Driver-scoped codegen context: the LLVM type environment for every
//! runtime object kind, the external runtime/libc declarations, the
//! GC-intrinsic declarations, the constant-synthesis helpers, and the
//! memoization maps shared by the heap materializer and the method
//! lowerer.
//!
//! Two address spaces partition all object pointers:
//!
//! - **AS0** is the read-only static region. Constants and all
//!   inter-constant edges live here; the GC ignores AS0 pointers.
//! - **AS1** is the GC-managed space. Function bodies hold object
//!   references as AS1 pointers so the statepoint machinery can find and
//!   relocate them.
//!
//! Mutable caches sit behind `RefCell` so the materializer, the lowerer
//! and the slow-case builder can share one immutable `&World`.

use std::cell::RefCell;
use std::collections::HashMap;

use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::module::{Linkage, Module};
use inkwell::types::{BasicTypeEnum, FloatType, FunctionType, IntType, PointerType, StructType};
use inkwell::values::{FunctionValue, IntValue, PointerValue};
use inkwell::AddressSpace;

use crate::diagnostics::Diagnostic;
use crate::snapshot::object::{smi, BITS_PER_WORD};
use crate::snapshot::{HeapId, Program};

use super::block_builder::IrHelper;

/// The GC strategy name stamped on every emitted function. The statepoint
/// machinery keyed to this name, together with the GC-intrinsic lowering
/// pass, closes the contract between the lowerer and the native code.
pub const GC_STRATEGY: &str = "statepoint-example";

/// Names of the GC-address-space intrinsics. Stock LLVM has no tagged
/// read/write intrinsics, so they are declared as external functions in a
/// reserved namespace and rewritten away by the final lowering pass.
pub const INTRINSIC_TAGREAD: &str = "wisp.tagread";
pub const INTRINSIC_TAGWRITE: &str = "wisp.tagwrite";
pub const INTRINSIC_SMI_TO_INT: &str = "wisp.smitoint";
pub const INTRINSIC_SMI_TO_INT64: &str = "wisp.smitoint64";
pub const INTRINSIC_INT_TO_SMI: &str = "wisp.inttosmi";
pub const INTRINSIC_INT_TO_SMI64: &str = "wisp.inttosmi64";

/// Format the symbol name for a materialized heap object.
pub fn object_symbol(prefix: &str, id: HeapId) -> String {
    format!("{}_{:x}", prefix, id.0)
}

/// Format the symbol name for a materialized heap object with a size
/// suffix (arrays, strings, instances).
pub fn sized_object_symbol(prefix: &str, id: HeapId, size: usize) -> String {
    format!("{}_{:x}__{}", prefix, id.0, size)
}

/// Driver-scoped codegen state. See the module docs.
pub struct World<'ctx, 'p> {
    pub context: &'ctx Context,
    pub module: Module<'ctx>,
    pub program: &'p Program,

    // Scalar types.
    pub int1_type: IntType<'ctx>,
    pub int8_type: IntType<'ctx>,
    pub int32_type: IntType<'ctx>,
    pub int64_type: IntType<'ctx>,
    /// Word-sized integer.
    pub intptr_type: IntType<'ctx>,
    pub float_type: FloatType<'ctx>,
    pub int8_ptr_type: PointerType<'ctx>,

    // Object pointer shapes.
    /// Tagged object reference in the GC-managed space (AS1).
    pub object_ptr_type: PointerType<'ctx>,
    /// Tagged object reference in the read-only static space (AS0).
    pub object_ptr_aspace0_type: PointerType<'ctx>,
    /// Tagged AS1 inner pointer to an AS1 object slot.
    pub object_ptr_ptr_type: PointerType<'ctx>,
    /// AS0 pointer to an AS0 object slot (dispatch table indexing).
    pub object_ptr_aspace0_ptr_aspace0_type: PointerType<'ctx>,
    /// AS0 pointer to an AS1 object slot (the write-through view used by
    /// tagwrite lowering and the statics array probe).
    pub object_ptr_ptr_unsafe_type: PointerType<'ctx>,
    /// The native-call argument array: an off-heap pointer to AS1 slots.
    pub arguments_ptr_type: PointerType<'ctx>,
    /// The off-heap process object.
    pub process_ptr_type: PointerType<'ctx>,

    // Heap object struct types, with the fixed runtime layouts.
    pub heap_object_type: StructType<'ctx>,
    pub class_type: StructType<'ctx>,
    pub class_ptr_type: PointerType<'ctx>,
    pub function_type: StructType<'ctx>,
    pub array_header_type: StructType<'ctx>,
    pub array_header_ptr_type: PointerType<'ctx>,
    pub onebytestring_type: StructType<'ctx>,
    pub initializer_type: StructType<'ctx>,
    pub instance_type: StructType<'ctx>,
    pub largeinteger_type: StructType<'ctx>,
    pub double_type: StructType<'ctx>,
    pub dte_type: StructType<'ctx>,
    pub roots_type: StructType<'ctx>,

    // External declarations.
    pub libc_exit: FunctionValue<'ctx>,
    pub libc_printf: FunctionValue<'ctx>,
    pub runtime_handle_gc: FunctionValue<'ctx>,
    pub runtime_handle_allocate: FunctionValue<'ctx>,
    pub runtime_handle_allocate_boxed: FunctionValue<'ctx>,
    pub runtime_handle_object_from_failure: FunctionValue<'ctx>,
    pub intrinsic_tagread: FunctionValue<'ctx>,
    pub intrinsic_tagwrite: FunctionValue<'ctx>,
    pub intrinsic_smi_to_int: FunctionValue<'ctx>,
    pub intrinsic_int_to_smi: FunctionValue<'ctx>,

    // Per-arity / per-size type caches.
    function_types: RefCell<HashMap<usize, FunctionType<'ctx>>>,
    object_array_types: RefCell<HashMap<(String, usize), StructType<'ctx>>>,
    instance_types: RefCell<HashMap<usize, StructType<'ctx>>>,
    onebytestring_types: RefCell<HashMap<usize, StructType<'ctx>>>,

    // Materialization maps. All three agree on the set of keys once the
    // heap walk is complete.
    untagged_aspace0: RefCell<HashMap<HeapId, PointerValue<'ctx>>>,
    tagged_aspace0: RefCell<HashMap<HeapId, PointerValue<'ctx>>>,
    tagged_aspace1: RefCell<HashMap<HeapId, PointerValue<'ctx>>>,
    /// LLVM function symbols, declared eagerly when the Function constant
    /// is built so other constants can embed them.
    llvm_functions: RefCell<HashMap<HeapId, FunctionValue<'ctx>>>,

    /// Per-selector smi slow-case helpers, built lazily.
    smi_slow_cases: RefCell<HashMap<i32, FunctionValue<'ctx>>>,
    /// Native declarations, indexed by the native enum value.
    pub natives: RefCell<Vec<FunctionValue<'ctx>>>,
}

impl<'ctx, 'p> World<'ctx, 'p> {
    pub fn new(program: &'p Program, context: &'ctx Context, module: Module<'ctx>) -> Self {
        let int1_type = context.bool_type();
        let int8_type = context.i8_type();
        let int32_type = context.i32_type();
        let int64_type = context.i64_type();
        let intptr_type = if BITS_PER_WORD == 64 { int64_type } else { int32_type };
        // Target doubles are 64-bit C doubles.
        let float_type = context.f64_type();

        let aspace0 = AddressSpace::default();
        let aspace1 = AddressSpace::from(1u16);

        let int8_ptr_type = int8_type.ptr_type(aspace0);

        // The width behind an object pointer never matters: tagged
        // pointers are only dereferenced through the intrinsics.
        let object_ptr_type = int8_type.ptr_type(aspace1);
        let object_ptr_aspace0_type = int8_type.ptr_type(aspace0);
        let object_ptr_ptr_type = object_ptr_type.ptr_type(aspace1);
        let object_ptr_aspace0_ptr_aspace0_type = object_ptr_aspace0_type.ptr_type(aspace0);
        let object_ptr_ptr_unsafe_type = object_ptr_type.ptr_type(aspace0);
        let arguments_ptr_type = object_ptr_type.ptr_type(aspace0);
        let process_ptr_type = int8_ptr_type;

        let heap_object_type = context.opaque_struct_type("HeapType");
        let class_type = context.opaque_struct_type("ClassType");
        let class_ptr_type = class_type.ptr_type(aspace0);
        let function_type = context.opaque_struct_type("FunctionType");
        let array_header_type = context.opaque_struct_type("ArrayType");
        let array_header_ptr_type = array_header_type.ptr_type(aspace0);
        let onebytestring_type = context.opaque_struct_type("OneByteString");
        let initializer_type = context.opaque_struct_type("InitializerType");
        let instance_type = context.opaque_struct_type("InstanceType");
        let largeinteger_type = context.opaque_struct_type("LargeIntegerType");
        let double_type = context.opaque_struct_type("DoubleType");
        let dte_type = context.opaque_struct_type("DispatchTableEntry");
        let roots_type = context.opaque_struct_type("ProgramRootsType");

        heap_object_type.set_body(&[class_ptr_type.into()], true);

        class_type.set_body(
            &[
                heap_object_type.into(),
                class_ptr_type.into(),      // super class
                intptr_type.into(),         // instance format
                intptr_type.into(),         // id
                intptr_type.into(),         // child id
                array_header_ptr_type.into(), // method array
            ],
            true,
        );

        function_type.set_body(
            &[
                heap_object_type.into(),
                intptr_type.into(), // bytecode size
                intptr_type.into(), // literals size
                intptr_type.into(), // arity
                intptr_type.into(), // word holding the machine code pointer
            ],
            true,
        );

        array_header_type.set_body(
            &[
                heap_object_type.into(),
                intptr_type.into(), // length
            ],
            true,
        );

        onebytestring_type.set_body(
            &[
                array_header_type.into(),
                intptr_type.into(), // hash
            ],
            true,
        );

        initializer_type.set_body(
            &[
                heap_object_type.into(),
                object_ptr_aspace0_type.into(), // machine code of the initializer
            ],
            true,
        );

        instance_type.set_body(
            &[
                heap_object_type.into(),
                intptr_type.into(), // flags
            ],
            true,
        );

        largeinteger_type.set_body(&[heap_object_type.into(), int64_type.into()], true);

        double_type.set_body(&[heap_object_type.into(), float_type.into()], true);

        dte_type.set_body(
            &[
                heap_object_type.into(),
                object_ptr_aspace0_type.into(), // target
                object_ptr_aspace0_type.into(), // machine code
                object_ptr_aspace0_type.into(), // offset
                object_ptr_aspace0_type.into(), // selector
            ],
            true,
        );

        let root_fields: Vec<BasicTypeEnum> =
            vec![object_ptr_aspace0_type.into(); Program::ROOT_COUNT];
        roots_type.set_body(&root_fields, true);

        // libc declarations used by the yield placeholder and the
        // unsupported-opcode trap.
        let exit_type = intptr_type.fn_type(&[intptr_type.into()], false);
        let libc_exit = module.add_function("exit", exit_type, Some(Linkage::External));
        let printf_type = intptr_type.fn_type(&[int8_ptr_type.into()], true);
        let libc_printf = module.add_function("printf", printf_type, Some(Linkage::External));

        // Runtime ABI.
        let handle_gc_type = context.void_type().fn_type(&[process_ptr_type.into()], false);
        let handle_allocate_type = object_ptr_type.fn_type(
            &[process_ptr_type.into(), object_ptr_type.into(), intptr_type.into()],
            false,
        );
        let handle_allocate_boxed_type = object_ptr_type
            .fn_type(&[process_ptr_type.into(), object_ptr_type.into()], false);
        let handle_object_from_failure_type = object_ptr_type
            .fn_type(&[process_ptr_type.into(), object_ptr_type.into()], false);

        let runtime_handle_gc =
            module.add_function("HandleGC", handle_gc_type, Some(Linkage::External));
        let runtime_handle_allocate =
            module.add_function("HandleAllocate", handle_allocate_type, Some(Linkage::External));
        let runtime_handle_allocate_boxed = module.add_function(
            "HandleAllocateBoxed",
            handle_allocate_boxed_type,
            Some(Linkage::External),
        );
        let runtime_handle_object_from_failure = module.add_function(
            "HandleObjectFromFailure",
            handle_object_from_failure_type,
            Some(Linkage::External),
        );

        // GC intrinsics, lowered away by the final pass.
        let tagread_type = object_ptr_type.fn_type(&[object_ptr_ptr_type.into()], false);
        let intrinsic_tagread =
            module.add_function(INTRINSIC_TAGREAD, tagread_type, Some(Linkage::External));
        let tagwrite_type = context
            .void_type()
            .fn_type(&[object_ptr_type.into(), object_ptr_ptr_type.into()], false);
        let intrinsic_tagwrite =
            module.add_function(INTRINSIC_TAGWRITE, tagwrite_type, Some(Linkage::External));

        let (smi_to_int_name, int_to_smi_name) = if BITS_PER_WORD == 64 {
            (INTRINSIC_SMI_TO_INT64, INTRINSIC_INT_TO_SMI64)
        } else {
            (INTRINSIC_SMI_TO_INT, INTRINSIC_INT_TO_SMI)
        };
        let smi_to_int_type = intptr_type.fn_type(&[object_ptr_type.into()], false);
        let intrinsic_smi_to_int =
            module.add_function(smi_to_int_name, smi_to_int_type, Some(Linkage::External));
        let int_to_smi_type = object_ptr_type.fn_type(&[intptr_type.into()], false);
        let intrinsic_int_to_smi =
            module.add_function(int_to_smi_name, int_to_smi_type, Some(Linkage::External));

        Self {
            context,
            module,
            program,
            int1_type,
            int8_type,
            int32_type,
            int64_type,
            intptr_type,
            float_type,
            int8_ptr_type,
            object_ptr_type,
            object_ptr_aspace0_type,
            object_ptr_ptr_type,
            object_ptr_aspace0_ptr_aspace0_type,
            object_ptr_ptr_unsafe_type,
            arguments_ptr_type,
            process_ptr_type,
            heap_object_type,
            class_type,
            class_ptr_type,
            function_type,
            array_header_type,
            array_header_ptr_type,
            onebytestring_type,
            initializer_type,
            instance_type,
            largeinteger_type,
            double_type,
            dte_type,
            roots_type,
            libc_exit,
            libc_printf,
            runtime_handle_gc,
            runtime_handle_allocate,
            runtime_handle_allocate_boxed,
            runtime_handle_object_from_failure,
            intrinsic_tagread,
            intrinsic_tagwrite,
            intrinsic_smi_to_int,
            intrinsic_int_to_smi,
            function_types: RefCell::new(HashMap::new()),
            object_array_types: RefCell::new(HashMap::new()),
            instance_types: RefCell::new(HashMap::new()),
            onebytestring_types: RefCell::new(HashMap::new()),
            untagged_aspace0: RefCell::new(HashMap::new()),
            tagged_aspace0: RefCell::new(HashMap::new()),
            tagged_aspace1: RefCell::new(HashMap::new()),
            llvm_functions: RefCell::new(HashMap::new()),
            smi_slow_cases: RefCell::new(HashMap::new()),
            natives: RefCell::new(Vec::new()),
        }
    }

    // ========================================================================
    // Constructed types
    // ========================================================================

    /// The signature of a compiled function of the given arity:
    /// `(process, arg1, ..., argN) -> object`.
    pub fn llvm_function_type(&self, arity: usize) -> FunctionType<'ctx> {
        if let Some(cached) = self.function_types.borrow().get(&arity) {
            return *cached;
        }
        let mut params: Vec<inkwell::types::BasicMetadataTypeEnum> =
            vec![self.object_ptr_type.into(); arity + 1];
        params[0] = self.process_ptr_type.into();
        let function_type = self.object_ptr_type.fn_type(&params, false);
        self.function_types.borrow_mut().insert(arity, function_type);
        function_type
    }

    /// AS0 pointer to a compiled function of the given arity.
    pub fn llvm_function_ptr_type(&self, arity: usize) -> PointerType<'ctx> {
        self.llvm_function_type(arity).ptr_type(AddressSpace::default())
    }

    /// The struct type of an array-shaped object with `length` entries of
    /// `entry_type`. Memoized per `(kind, length)`.
    pub fn object_array_type(
        &self,
        length: usize,
        entry_type: BasicTypeEnum<'ctx>,
        kind: &str,
    ) -> StructType<'ctx> {
        let key = (kind.to_string(), length);
        if let Some(cached) = self.object_array_types.borrow().get(&key) {
            return *cached;
        }
        let array_type = self
            .context
            .opaque_struct_type(&format!("{}__{}", kind, length));
        let mut fields: Vec<BasicTypeEnum> = Vec::with_capacity(length + 1);
        fields.push(self.array_header_type.into());
        fields.extend(std::iter::repeat(entry_type).take(length));
        array_type.set_body(&fields, true);
        self.object_array_types.borrow_mut().insert(key, array_type);
        array_type
    }

    /// The struct type of an instance with `fields` object fields.
    /// Memoized per field count.
    pub fn instance_struct_type(&self, fields: usize) -> StructType<'ctx> {
        if let Some(cached) = self.instance_types.borrow().get(&fields) {
            return *cached;
        }
        let inst_type = self
            .context
            .opaque_struct_type(&format!("Instance__{}", fields));
        let mut body: Vec<BasicTypeEnum> = Vec::with_capacity(fields + 1);
        body.push(self.instance_type.into());
        body.extend(std::iter::repeat(BasicTypeEnum::from(self.object_ptr_aspace0_type)).take(fields));
        inst_type.set_body(&body, true);
        self.instance_types.borrow_mut().insert(fields, inst_type);
        inst_type
    }

    /// The struct type of a one-byte string with `length` characters.
    /// Memoized per length.
    pub fn onebytestring_struct_type(&self, length: usize) -> StructType<'ctx> {
        if let Some(cached) = self.onebytestring_types.borrow().get(&length) {
            return *cached;
        }
        let obs_type = self
            .context
            .opaque_struct_type(&format!("OneByteString__{}", length));
        obs_type.set_body(
            &[
                self.onebytestring_type.into(),
                self.int8_type.array_type(length as u32).into(),
            ],
            true,
        );
        self.onebytestring_types.borrow_mut().insert(length, obs_type);
        obs_type
    }

    // ========================================================================
    // Constant synthesis
    // ========================================================================

    /// Word-sized integer constant.
    pub fn c_int(&self, value: i32) -> IntValue<'ctx> {
        self.intptr_type.const_int(value as i64 as u64, true)
    }

    /// Word-sized integer constant from a full word.
    pub fn c_word(&self, value: i64) -> IntValue<'ctx> {
        self.intptr_type.const_int(value as u64, true)
    }

    /// 64-bit integer constant.
    pub fn c_int64(&self, value: i64) -> IntValue<'ctx> {
        self.int64_type.const_int(value as u64, true)
    }

    /// 8-bit integer constant.
    pub fn c_int8(&self, value: u8) -> IntValue<'ctx> {
        self.int8_type.const_int(value as u64, false)
    }

    /// 1-bit constant.
    pub fn c_bit(&self, value: bool) -> IntValue<'ctx> {
        self.int1_type.const_int(value as u64, false)
    }

    /// 64-bit float constant.
    pub fn c_double(&self, value: f64) -> inkwell::values::FloatValue<'ctx> {
        self.float_type.const_float(value)
    }

    /// The smi encoding of `value` as a word constant (low bit clear).
    pub fn c_smi(&self, value: i64) -> IntValue<'ctx> {
        self.c_word(smi::encode(value))
    }

    /// Constant int-to-pointer, defaulting to the AS1 object type.
    pub fn c_int_to_pointer(
        &self,
        value: IntValue<'ctx>,
        ptr_type: Option<PointerType<'ctx>>,
    ) -> PointerValue<'ctx> {
        value.const_to_pointer(ptr_type.unwrap_or(self.object_ptr_type))
    }

    /// Constant pointer-to-int into the word type.
    pub fn c_pointer_to_int(&self, value: PointerValue<'ctx>) -> IntValue<'ctx> {
        value.const_to_int(self.intptr_type)
    }

    /// Constant pointer cast, defaulting to the AS0 object type.
    pub fn c_cast(
        &self,
        value: PointerValue<'ctx>,
        ptr_type: Option<PointerType<'ctx>>,
    ) -> PointerValue<'ctx> {
        value.const_cast(ptr_type.unwrap_or(self.object_ptr_aspace0_type))
    }

    /// Tag an untagged AS0 constant: +1 byte inner pointer, cast into the
    /// GC-managed space.
    pub fn c_tag(&self, constant: PointerValue<'ctx>) -> PointerValue<'ctx> {
        let byte_ptr = constant.const_cast(self.int8_ptr_type);
        let tagged = unsafe { byte_ptr.const_gep(&[self.int32_type.const_int(1, false)]) };
        tagged.const_address_space_cast(self.object_ptr_type)
    }

    /// Tag an untagged AS0 constant, staying in AS0. Used for all
    /// inter-constant edges in the static image. The result keeps
    /// `ptr_type` (usually the object's own struct pointer type) so
    /// initializers referencing the object type-check directly.
    pub fn c_tag_aspace0(
        &self,
        constant: PointerValue<'ctx>,
        ptr_type: Option<PointerType<'ctx>>,
    ) -> PointerValue<'ctx> {
        let byte_ptr = constant.const_cast(self.int8_ptr_type);
        let tagged = unsafe { byte_ptr.const_gep(&[self.int32_type.const_int(1, false)]) };
        tagged.const_cast(ptr_type.unwrap_or(self.object_ptr_aspace0_type))
    }

    // ========================================================================
    // Materialization maps
    // ========================================================================

    /// The untagged AS0 constant for a materialized object.
    pub fn untagged_aspace0(&self, id: HeapId) -> Option<PointerValue<'ctx>> {
        self.untagged_aspace0.borrow().get(&id).copied()
    }

    /// The tagged AS0 constant for a materialized object.
    pub fn tagged_aspace0(&self, id: HeapId) -> Option<PointerValue<'ctx>> {
        self.tagged_aspace0.borrow().get(&id).copied()
    }

    /// The tagged AS1 view of a materialized object.
    pub fn tagged_aspace1(&self, id: HeapId) -> Option<PointerValue<'ctx>> {
        self.tagged_aspace1.borrow().get(&id).copied()
    }

    /// Record all three views of a freshly materialized object. Constants
    /// are immutable once recorded.
    pub fn record_constant(
        &self,
        id: HeapId,
        untagged: PointerValue<'ctx>,
        tagged_aspace0: PointerValue<'ctx>,
        tagged_aspace1: PointerValue<'ctx>,
    ) {
        self.untagged_aspace0.borrow_mut().insert(id, untagged);
        self.tagged_aspace0.borrow_mut().insert(id, tagged_aspace0);
        self.tagged_aspace1.borrow_mut().insert(id, tagged_aspace1);
    }

    /// The LLVM function declared for a snapshot function.
    pub fn llvm_function(&self, id: HeapId) -> Option<FunctionValue<'ctx>> {
        self.llvm_functions.borrow().get(&id).copied()
    }

    /// Record the LLVM function declared for a snapshot function.
    pub fn record_llvm_function(&self, id: HeapId, function: FunctionValue<'ctx>) {
        self.llvm_functions.borrow_mut().insert(id, function);
    }

    // ========================================================================
    // Smi slow cases
    // ========================================================================

    /// The per-selector slow-case helper for smi operations: a function
    /// `(process, receiver, argument) -> object` performing the full
    /// dispatch-table lookup. Built lazily, cached by selector.
    pub fn smi_slow_case(&self, selector: i32) -> Result<FunctionValue<'ctx>, Vec<Diagnostic>> {
        if let Some(cached) = self.smi_slow_cases.borrow().get(&selector) {
            return Ok(*cached);
        }

        let function_type = self.llvm_function_type(2);
        let function = self.module.add_function(
            &format!("Smi_{:x}", selector),
            function_type,
            Some(Linkage::External),
        );

        let builder: Builder<'ctx> = self.context.create_builder();
        let entry = self.context.append_basic_block(function, "entry");
        builder.position_at_end(entry);

        let args: Vec<inkwell::values::BasicValueEnum<'ctx>> = function.get_param_iter().collect();
        let helper = IrHelper::new(self, &builder, function);
        let result = helper.invoke_method_helper(selector, &args)?;
        builder.build_return(Some(&result)).map_err(Diagnostic::llvm)?;

        self.smi_slow_cases.borrow_mut().insert(selector, function);
        Ok(function)
    }
}
