//! # Heap Materialization
//!
//! Lifts every reachable heap object into a typed LLVM global constant.
//!
//! Each materialized object gets three views, recorded in the world's
//! maps keyed by the input object:
//!
//! - the untagged AS0 body (the global itself),
//! - the tagged AS0 inner pointer (+1 byte), used by every edge inside
//!   the static image,
//! - the tagged AS1 view, used wherever function bodies mix constants
//!   with runtime values (phis, calls).
//!
//! Constants are created on first visit and memoized, so recursion order
//! does not affect the resulting graph. LLVM constants cannot be cyclic;
//! the two tolerated snapshot cycles (the metaclass's class slot and the
//! root classes' missing super class) are cut by placing a null in the
//! offending slot, which the runtime shortcircuits by identity.
//!
//! Function objects are materialized in two steps: the LLVM function
//! *symbol* is declared eagerly so that initializers and dispatch table
//! entries can embed it; the body is emitted later by the method lowerer.

use inkwell::module::Linkage;
use inkwell::types::StructType;
use inkwell::values::{BasicValueEnum, PointerValue, StructValue};

use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::snapshot::object::smi;
use crate::snapshot::{
    ClassObject, DispatchEntryObject, FunctionObject, HeapId, HeapObject, InstanceObject,
    ObjectRef,
};
use crate::snapshot::object::{
    ArrayObject, ByteArrayObject, InitializerObject, OneByteStringObject,
};

use super::world::{object_symbol, sized_object_symbol, World, GC_STRATEGY};

/// Builds constants for every heap object it is called with.
pub struct HeapBuilder<'ctx, 'p, 'w> {
    w: &'w World<'ctx, 'p>,
}

impl<'ctx, 'p, 'w> HeapBuilder<'ctx, 'p, 'w> {
    pub fn new(w: &'w World<'ctx, 'p>) -> Self {
        Self { w }
    }

    /// Materialize the whole heap in iteration order.
    pub fn build_all(&self) -> Result<(), Vec<Diagnostic>> {
        let mut ids = Vec::with_capacity(self.w.program.heap().len());
        self.w.program.heap().iterate_objects(|id, _| ids.push(id));
        for id in ids {
            self.build_constant(ObjectRef::Heap(id))?;
        }
        Ok(())
    }

    /// Materialize one object, returning its tagged AS0 constant.
    pub fn build_constant(&self, object: ObjectRef) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let id = match object {
            ObjectRef::Smi(value) => {
                if smi::is_valid_portable(value) {
                    return Ok(self
                        .w
                        .c_int_to_pointer(self.w.c_smi(value), Some(self.w.object_ptr_aspace0_type)));
                }
                let untagged = self.build_large_integer(value)?;
                return Ok(self.w.c_tag_aspace0(untagged, None));
            }
            ObjectRef::Heap(id) => id,
        };

        if let Some(cached) = self.w.tagged_aspace0(id) {
            return Ok(cached);
        }

        let heap_object = self.w.program.heap().get(id).ok_or_else(|| {
            vec![Diagnostic::error_with_code(
                ErrorCode::UnknownHeapObject,
                format!("dangling heap reference {}", id),
            )]
        })?;

        let untagged = match heap_object {
            HeapObject::Function(function) => self.build_function_constant(id, function)?,
            HeapObject::Class(class) => self.build_class_constant(id, class)?,
            HeapObject::Array(array) => self.build_array_constant(id, array)?,
            HeapObject::ByteArray(array) => self.build_byte_array_constant(id, array)?,
            HeapObject::Instance(instance) => self.build_instance_constant(id, instance)?,
            HeapObject::DispatchTableEntry(entry) => {
                self.build_dispatch_entry_constant(id, entry)?
            }
            HeapObject::OneByteString(string) => self.build_one_byte_string_constant(id, string)?,
            HeapObject::Initializer(initializer) => {
                self.build_initializer_constant(id, initializer)?
            }
            HeapObject::LargeInteger(large) => self.build_large_integer(large.value)?,
            HeapObject::Double(double) => self.build_double_constant(double.value)?,
        };

        let tagged_aspace1 = self.w.c_tag(untagged);
        let tagged_aspace0 = self.w.c_tag_aspace0(untagged, Some(untagged.get_type()));
        self.w.record_constant(id, untagged, tagged_aspace0, tagged_aspace1);
        Ok(tagged_aspace0)
    }

    /// The heap-object header referencing `class`.
    fn build_header(&self, class: ObjectRef) -> Result<StructValue<'ctx>, Vec<Diagnostic>> {
        let class_constant = self.build_constant(class)?;
        let class_ptr = self.w.c_cast(class_constant, Some(self.w.class_ptr_type));
        Ok(self
            .w
            .heap_object_type
            .const_named_struct(&[class_ptr.into()]))
    }

    /// Define a read-only global holding `value`, returning its address.
    fn define_global(
        &self,
        ty: StructType<'ctx>,
        value: StructValue<'ctx>,
        name: &str,
    ) -> PointerValue<'ctx> {
        let global = self.w.module.add_global(ty, None, name);
        global.set_initializer(&value);
        global.set_constant(true);
        global.set_linkage(Linkage::External);
        global.as_pointer_value()
    }

    fn build_class_constant(
        &self,
        id: HeapId,
        class: &ClassObject,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        // Cycles cannot be expressed in LLVM constants. The snapshot has
        // exactly two: the metaclass's class slot and the root classes'
        // missing super class. Both get a null the runtime tolerates.
        let null = self.w.class_ptr_type.const_null();

        let is_meta_class = class.class == ObjectRef::Heap(id);
        let header_class = if is_meta_class {
            null
        } else {
            self.w
                .c_cast(self.build_constant(class.class)?, Some(self.w.class_ptr_type))
        };
        let header = self
            .w
            .heap_object_type
            .const_named_struct(&[header_class.into()]);

        let super_class = match class.super_class {
            None => null,
            Some(super_class) => self
                .w
                .c_cast(self.build_constant(super_class)?, Some(self.w.class_ptr_type)),
        };

        let methods = match class.methods {
            Some(methods) => self
                .w
                .c_cast(self.build_constant(methods)?, Some(self.w.array_header_ptr_type)),
            None => self.w.c_cast(null, Some(self.w.array_header_ptr_type)),
        };

        let entries: [BasicValueEnum; 6] = [
            header.into(),
            super_class.into(),
            self.w.c_word(class.instance_format.as_word()).into(),
            self.w.c_smi(class.id).into(),
            self.w.c_smi(class.child_id).into(),
            methods.into(),
        ];
        let value = self.w.class_type.const_named_struct(&entries);
        Ok(self.define_global(self.w.class_type, value, &object_symbol("Class", id)))
    }

    fn build_function_constant(
        &self,
        id: HeapId,
        function: &FunctionObject,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        // Declare the LLVM function first so any constant referencing
        // this function can embed the symbol; the body comes later.
        let function_type = self.w.llvm_function_type(function.arity);
        let llvm_function = self.w.module.add_function(
            &object_symbol("Function", id),
            function_type,
            Some(Linkage::External),
        );
        llvm_function.set_gc(GC_STRATEGY);
        self.w.record_llvm_function(id, llvm_function);

        let header = self.build_header(function.class)?;
        let code_word = self
            .w
            .c_pointer_to_int(llvm_function.as_global_value().as_pointer_value());

        let entries: [BasicValueEnum; 5] = [
            header.into(),
            self.w.c_smi(function.bytecode.len() as i64).into(),
            self.w.c_smi(function.literals.len() as i64).into(),
            self.w.c_smi(function.arity as i64).into(),
            code_word.into(),
        ];
        let value = self.w.function_type.const_named_struct(&entries);
        Ok(self.define_global(
            self.w.function_type,
            value,
            &object_symbol("FunctionObject", id),
        ))
    }

    fn build_array_constant(
        &self,
        id: HeapId,
        array: &ArrayObject,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let header = self.build_header(array.class)?;
        let length = array.elements.len();
        let array_header = self
            .w
            .array_header_type
            .const_named_struct(&[header.into(), self.w.c_smi(length as i64).into()]);

        let full_type =
            self.w
                .object_array_type(length, self.w.object_ptr_aspace0_type.into(), "Array");
        let mut entries: Vec<BasicValueEnum> = Vec::with_capacity(length + 1);
        entries.push(array_header.into());
        for element in &array.elements {
            let entry = match *element {
                ObjectRef::Heap(_) => self.w.c_cast(self.build_constant(*element)?, None),
                ObjectRef::Smi(value) => self
                    .w
                    .c_int_to_pointer(self.w.c_smi(value), Some(self.w.object_ptr_aspace0_type)),
            };
            entries.push(entry.into());
        }
        let value = full_type.const_named_struct(&entries);
        Ok(self.define_global(
            full_type,
            value,
            &sized_object_symbol("ArrayInstance", id, length),
        ))
    }

    fn build_byte_array_constant(
        &self,
        id: HeapId,
        array: &ByteArrayObject,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let header = self.build_header(array.class)?;
        let length = array.bytes.len();
        let array_header = self
            .w
            .array_header_type
            .const_named_struct(&[header.into(), self.w.c_smi(length as i64).into()]);

        let full_type = self
            .w
            .object_array_type(length, self.w.int8_type.into(), "ByteArray");
        let mut entries: Vec<BasicValueEnum> = Vec::with_capacity(length + 1);
        entries.push(array_header.into());
        for byte in &array.bytes {
            entries.push(self.w.c_int8(*byte).into());
        }
        let value = full_type.const_named_struct(&entries);
        Ok(self.define_global(
            full_type,
            value,
            &sized_object_symbol("ByteArrayInstance", id, length),
        ))
    }

    fn build_instance_constant(
        &self,
        id: HeapId,
        instance: &InstanceObject,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let header = self.build_header(instance.class)?;
        let base = self
            .w
            .instance_type
            .const_named_struct(&[header.into(), self.w.c_word(instance.flags).into()]);

        let fields = instance.fields.len();
        let full_type = self.w.instance_struct_type(fields);
        let mut entries: Vec<BasicValueEnum> = Vec::with_capacity(fields + 1);
        entries.push(base.into());
        for field in &instance.fields {
            entries.push(self.w.c_cast(self.build_constant(*field)?, None).into());
        }
        let value = full_type.const_named_struct(&entries);

        // Named singletons keep fixed symbols for debuggability and for
        // the runtime to find them.
        let this = ObjectRef::Heap(id);
        let name = if this == self.w.program.true_object() {
            "true__".to_string()
        } else if this == self.w.program.false_object() {
            "false__".to_string()
        } else if this == self.w.program.null_object() {
            "null__".to_string()
        } else {
            sized_object_symbol("InstanceObject", id, fields)
        };
        Ok(self.define_global(full_type, value, &name))
    }

    fn build_dispatch_entry_constant(
        &self,
        id: HeapId,
        entry: &DispatchEntryObject,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let header = self.build_header(entry.class)?;

        let target = self.build_constant(entry.target)?;
        let target_function = entry
            .target
            .as_heap()
            .and_then(|target_id| self.w.llvm_function(target_id))
            .ok_or_else(|| {
                vec![Diagnostic::error_with_code(
                    ErrorCode::BadObjectKind,
                    format!("dispatch table entry {} targets a non-function", id),
                )]
            })?;
        let code = target_function.as_global_value().as_pointer_value();

        let entries: [BasicValueEnum; 5] = [
            header.into(),
            self.w.c_cast(target, None).into(),
            self.w.c_cast(code, None).into(),
            self.w.c_cast(self.build_constant(entry.offset)?, None).into(),
            self.w
                .c_int_to_pointer(self.w.c_smi(entry.selector), Some(self.w.object_ptr_aspace0_type))
                .into(),
        ];
        let value = self.w.dte_type.const_named_struct(&entries);
        Ok(self.define_global(
            self.w.dte_type,
            value,
            &object_symbol("DispatchTableEntry", id),
        ))
    }

    fn build_one_byte_string_constant(
        &self,
        id: HeapId,
        string: &OneByteStringObject,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let header = self.build_header(string.class)?;
        let length = string.chars.len();
        let array_header = self
            .w
            .array_header_type
            .const_named_struct(&[header.into(), self.w.c_smi(length as i64).into()]);
        let base = self
            .w
            .onebytestring_type
            .const_named_struct(&[array_header.into(), self.w.c_smi(length as i64).into()]);

        let bytes: Vec<_> = string.chars.iter().map(|byte| self.w.c_int8(*byte)).collect();
        let byte_array = self.w.int8_type.const_array(&bytes);

        let full_type = self.w.onebytestring_struct_type(length);
        let value = full_type.const_named_struct(&[base.into(), byte_array.into()]);
        Ok(self.define_global(
            full_type,
            value,
            &sized_object_symbol("OneByteString", id, length),
        ))
    }

    fn build_initializer_constant(
        &self,
        id: HeapId,
        initializer: &InitializerObject,
    ) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        // Make sure the initializer's function symbol exists.
        self.build_constant(initializer.function)?;
        let function = initializer
            .function
            .as_heap()
            .and_then(|function_id| self.w.llvm_function(function_id))
            .ok_or_else(|| {
                vec![Diagnostic::error_with_code(
                    ErrorCode::BadObjectKind,
                    format!("initializer {} references a non-function", id),
                )]
            })?;

        let header = self.build_header(initializer.class)?;
        let code = self
            .w
            .c_cast(function.as_global_value().as_pointer_value(), None);
        let value = self
            .w
            .initializer_type
            .const_named_struct(&[header.into(), code.into()]);
        Ok(self.define_global(
            self.w.initializer_type,
            value,
            &object_symbol("InitializerObject", id),
        ))
    }

    fn build_large_integer(&self, value: i64) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let header = self.build_header(self.w.program.large_integer_class())?;
        let entries: [BasicValueEnum; 2] = [header.into(), self.w.c_int64(value).into()];
        let constant = self.w.largeinteger_type.const_named_struct(&entries);
        Ok(self.define_global(
            self.w.largeinteger_type,
            constant,
            &format!("LargeIntegerObject_{:x}", value as u64),
        ))
    }

    fn build_double_constant(&self, value: f64) -> Result<PointerValue<'ctx>, Vec<Diagnostic>> {
        let header = self.build_header(self.w.program.double_class())?;
        let entries: [BasicValueEnum; 2] = [header.into(), self.w.c_double(value).into()];
        let constant = self.w.double_type.const_named_struct(&entries);
        Ok(self.define_global(self.w.double_type, constant, "DoubleObject"))
    }
}
